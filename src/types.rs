//! Constants and on-heap layout types shared by every module.
//!
//! Two independent header conventions live at the base of process memory:
//! a large span's two pointer-width words (sentinel, page count), and a
//! subpage page's two `u16` words (processor id, class index). `subpage.rs`
//! and `large.rs` are the two places that read and write their respective
//! header.

use std::mem::size_of;
use std::sync::Mutex;

#[cfg(target_pointer_width = "64")]
pub const WORD: usize = 8;
#[cfg(target_pointer_width = "32")]
pub const WORD: usize = 4;

pub const PAGE: usize = 4096;
pub const CACHELINE: usize = 64;

/// Header reserved at the base of every large span: two pointer-width
/// words, sentinel then page count.
pub const HEADER_BYTES: usize = 2 * WORD;

/// Each subpage page-base metadata field (processor id, class index) is a
/// `u16`, not a pointer-width word: kept narrow enough that it always
/// leaves real payload room in the smallest size class, written and read
/// back at that one consistent width so there is no byte/word mismatch
/// between the two ends.
pub const PAGE_META_WORD: usize = 2;

/// Header reserved at the base of every subpage page: two `u16` words,
/// processor id then class index.
pub const PAGE_HEADER_BYTES: usize = 2 * PAGE_META_WORD;

/// Nine power-of-two classes: 2^3 .. 2^11 bytes.
pub const NUM_CLASS: usize = 9;
pub const CLASS_SIZES: [usize; NUM_CLASS] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// Requests at or below this go to the subpage allocator; above it, to the
/// large allocator.
pub const SUBPAGE_MAX: usize = PAGE / 2;

/// The bit pattern a large span's first pointer-width word holds.
pub const LARGE_SENTINEL: usize = usize::MAX; // bit pattern of -1i64 / -1i32

/// Narrow view of [`LARGE_SENTINEL`]: a large span's header is all-ones,
/// so reading just its first `PAGE_META_WORD` bytes as a `u16` still reads
/// as this value. `subpage::free` uses it to tell a genuine subpage page
/// apart from a page that actually belongs to a large span, without ever
/// reading past the `u16` width it uses for its own two fields.
pub const PAGE_LARGE_MARKER: u16 = u16::MAX;

/// Smallest class whose size is >= `size`. `size == 0` maps to class 0,
/// matching ordinary zero-size-allocation convention. Returns `None` when
/// `size` must go to the large allocator instead.
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
    if size > SUBPAGE_MAX {
        return None;
    }
    CLASS_SIZES.iter().position(|&class_size| class_size >= size)
}

#[inline]
pub fn class_size(class: usize) -> usize {
    CLASS_SIZES[class]
}

/// How many class-sized blocks fit in one subpage page.
#[inline]
pub fn blocks_per_page(class: usize) -> usize {
    PAGE / class_size(class)
}

/// Fixed-size metadata record describing one 4 KiB subpage page. Instances
/// live forever once carved out of a metadata page obtained from the
/// substrate; they only ever move between list owners (arena list,
/// reusable pool, fresh pool) while protected by whichever mutex currently
/// owns their list. All mutation therefore happens through raw pointers
/// under an external lock rather than through `&mut` borrows - an
/// intrusive list can't be expressed safely in stable Rust.
#[repr(C)]
pub struct PageRef {
    pub next: *mut PageRef,
    /// Head of the intra-page freelist of ordinary (non-base) blocks;
    /// each free block's first word points to the next free block (or is
    /// null). The base block - the one whose address coincides with the
    /// page's own metadata header - never threads through this chain; see
    /// `base_free`.
    pub freelist: *mut u8,
    /// Base address of the bound 4 KiB data page, or null if this record
    /// has not been bound to a data page yet (fresh-pool state).
    pub page_base: *mut u8,
    pub num_free: usize,
    /// Whether the page's base block (the one overlapping the page's own
    /// metadata header) is currently free. Tracked here rather than
    /// in-place because the header leaves it no bytes of its own to store
    /// a freelist link in once it's carrying processor/class metadata.
    pub base_free: bool,
}

impl PageRef {
    pub const fn empty() -> Self {
        PageRef {
            next: std::ptr::null_mut(),
            freelist: std::ptr::null_mut(),
            page_base: std::ptr::null_mut(),
            num_free: 0,
            base_free: false,
        }
    }
}

/// A mutex padded out to a full cache line so that two adjacent
/// per-processor locks never share a cache line.
#[repr(align(64))]
pub struct CachePadded<T> {
    pub value: T,
}

impl<T> CachePadded<T> {
    pub const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

pub type ArenaRow = [*mut PageRef; NUM_CLASS];

/// One per-processor slot: a cache-line-padded mutex guarding the
/// `NUM_CLASS` page-ref list heads for that processor.
pub type ArenaSlot = CachePadded<Mutex<ArenaRow>>;

const _: () = assert!(size_of::<PageRef>() <= CACHELINE);
