//! The subpage allocator: one arena per processor, one page-ref list per
//! (processor, class) pair, serving requests up to `SUBPAGE_MAX` bytes.
//! Each arena is a single mutex guarding all `NUM_CLASS` list heads for
//! that processor, picked up by dispatching on the current CPU id and
//! walked under that one lock.
//!
//! The arena directory itself - one `ArenaSlot` per processor - is carved
//! out of raw substrate memory with `ptr::write` rather than built as a
//! `Vec<ArenaSlot>`: if this crate is ever installed as `#[global_allocator]`,
//! allocating the directory through the ordinary global allocator would
//! recurse back into `init` before it has finished.

use std::ptr;
use std::sync::OnceLock;

use log::trace;

use crate::pageref::{self, Binding};
use crate::stats::STATS;
use crate::substrate;
use crate::types::{
    blocks_per_page, class_size, size_to_class, ArenaRow, ArenaSlot, CachePadded, PageRef,
    NUM_CLASS, PAGE, PAGE_HEADER_BYTES, PAGE_LARGE_MARKER, PAGE_META_WORD,
};

struct Directory {
    slots: *mut ArenaSlot,
    num_processors: usize,
}

// SAFETY: `slots` points at a region sbrk'd once during `init` and never
// freed or moved; every access to the `ArenaRow` it guards goes through
// the slot's own mutex.
unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}

static DIRECTORY: OnceLock<Directory> = OnceLock::new();

/// Build the arena directory: one cache-padded, mutex-guarded `ArenaRow`
/// per processor, sbrk'd as a single block and placed in-place. Returns
/// `false` if the substrate could not grow to hold it. Idempotent - a
/// second call is a no-op returning `true`.
pub fn init_directory() -> bool {
    if DIRECTORY.get().is_some() {
        return true;
    }
    let num_processors = substrate::num_processors();
    let bytes = num_processors * std::mem::size_of::<ArenaSlot>();
    let pages = bytes.div_ceil(PAGE) * PAGE;
    let mem = substrate::substrate_sbrk(pages);
    if mem.is_null() {
        return false;
    }
    let slots = mem as *mut ArenaSlot;
    for i in 0..num_processors {
        // SAFETY: `mem` is a freshly sbrk'd region at least
        // `num_processors * size_of::<ArenaSlot>()` bytes long, exclusively
        // owned until this function publishes `DIRECTORY`.
        unsafe {
            ptr::write(
                slots.add(i),
                CachePadded::new(std::sync::Mutex::new([ptr::null_mut(); NUM_CLASS])),
            );
        }
    }
    trace!("subpage: arena directory built for {num_processors} processors");
    // `OnceLock::set` can only fail if another thread raced us and won;
    // either way the directory is now present.
    let _ = DIRECTORY.set(Directory {
        slots,
        num_processors,
    });
    true
}

fn directory() -> &'static Directory {
    DIRECTORY
        .get()
        .expect("subpage::init_directory must succeed before allocate/free")
}

impl Directory {
    fn slot(&self, processor: usize) -> &ArenaSlot {
        // SAFETY: `processor % self.num_processors` is always in bounds of
        // the `num_processors`-length array sbrk'd in `init_directory`.
        unsafe { &*self.slots.add(processor % self.num_processors) }
    }
}

#[inline]
fn read_next(block: *mut u8) -> *mut u8 {
    unsafe { *(block as *const *mut u8) }
}

#[inline]
fn write_next(block: *mut u8, next: *mut u8) {
    unsafe {
        *(block as *mut *mut u8) = next;
    }
}

/// Chain every *non-base* class-sized slot in the 4 KiB page at
/// `page_base` into a freelist, and stamp the page's header words. The
/// base block (index 0, coincident with `page_base` itself) never enters
/// this chain - its own bytes are the page's metadata - so it is tracked
/// purely through `PageRef::base_free` instead. Returns the freelist head
/// and how many non-base blocks it holds.
fn build_freelist(page_base: *mut u8, processor: usize, class: usize) -> (*mut u8, usize) {
    let sz = class_size(class);
    let n = blocks_per_page(class);
    let mut prev: *mut u8 = ptr::null_mut();
    for k in (1..n).rev() {
        let blk = unsafe { page_base.add(k * sz) };
        write_next(blk, prev);
        prev = blk;
    }
    debug_assert!(processor <= u16::MAX as usize, "processor id does not fit a u16");
    unsafe {
        *(page_base as *mut u16) = processor as u16;
        *(page_base.add(PAGE_META_WORD) as *mut u16) = class as u16;
    }
    (prev, n - 1)
}

/// Try to serve `size` bytes out of `pr`, preferring the base block when
/// it both is free and has enough bytes left over after the header to
/// satisfy the request, falling back to the ordinary freelist chain.
/// Returns `None` if `pr` has nothing that can serve this request right
/// now (caller should move on to the next page-ref in the list).
fn try_serve(pr: &mut PageRef, size: usize, class_sz: usize) -> Option<*mut u8> {
    if pr.base_free && size + PAGE_HEADER_BYTES <= class_sz {
        pr.base_free = false;
        pr.num_free -= 1;
        STATS.subpage.increase(class_sz as i64);
        return Some(unsafe { pr.page_base.add(PAGE_HEADER_BYTES) });
    }
    if !pr.freelist.is_null() {
        let head = pr.freelist;
        pr.freelist = read_next(head);
        pr.num_free -= 1;
        STATS.subpage.increase(class_sz as i64);
        return Some(head);
    }
    None
}

/// Allocate a `size`-byte (`size <= SUBPAGE_MAX`) block. Returns null if
/// the substrate is exhausted.
pub fn allocate(size: usize) -> *mut u8 {
    let class = match size_to_class(size) {
        Some(c) => c,
        None => return ptr::null_mut(),
    };
    let class_sz = class_size(class);
    let processor = substrate::current_cpu_id() % directory().num_processors;
    let slot = directory().slot(processor);
    let mut row = slot.value.lock().unwrap();

    // Walk the (processor, class) list for a page-ref that can serve this
    // request.
    let mut cursor = row[class];
    while !cursor.is_null() {
        let pr = unsafe { &mut *cursor };
        if pr.num_free > 0 {
            if let Some(p) = try_serve(pr, size, class_sz) {
                return p;
            }
        }
        cursor = pr.next;
    }

    // Nothing in the list can serve it: pull a page-ref from the pool and
    // splice it to the head.
    let (pr_ptr, binding) = pageref::acquire();
    if pr_ptr.is_null() {
        return ptr::null_mut();
    }
    if matches!(binding, Binding::NeedsDataPage) && !pageref::bind_data_page(pr_ptr) {
        pageref::return_unbound(pr_ptr);
        return ptr::null_mut();
    }
    let pr = unsafe { &mut *pr_ptr };
    let page_base = pr.page_base;
    let (freelist, chain_len) = build_freelist(page_base, processor, class);
    pr.freelist = freelist;
    pr.base_free = true;
    pr.num_free = chain_len + 1;
    pr.next = row[class];
    row[class] = pr_ptr;

    try_serve(pr, size, class_sz).expect("a freshly built page-ref always has a free block")
}

/// Outcome of `free` for a pointer that turned out to belong to the
/// subpage allocator rather than the large-object allocator.
pub enum FreeOutcome {
    /// Handled; nothing further to do.
    Handled,
    /// `page_base`'s header held the large-span sentinel: this pointer
    /// belongs to `large::free(page_base)`, not here. Carries the already
    /// computed span base so the large allocator doesn't redo the
    /// pointer-to-page arithmetic.
    NotOurs(*mut u8),
}

/// Free a pointer previously returned by `allocate`. `ptr` must be
/// non-null and must lie within `[substrate::lo(), substrate::hi())`.
pub fn free(ptr: *mut u8) -> FreeOutcome {
    let lo = substrate::lo();
    let page_base = (lo + ((ptr as usize - lo) / PAGE) * PAGE) as *mut u8;
    let processor_field = unsafe { *(page_base as *const u16) };
    if processor_field == PAGE_LARGE_MARKER {
        return FreeOutcome::NotOurs(page_base);
    }
    let processor = processor_field as usize;
    let class = unsafe { *(page_base.add(PAGE_META_WORD) as *const u16) } as usize;
    let class_sz = class_size(class);

    let slot = directory().slot(processor);
    let mut row = slot.value.lock().unwrap();

    let mut cursor = row[class];
    while !cursor.is_null() {
        let pr = unsafe { &mut *cursor };
        if pr.page_base == page_base {
            let base_payload = unsafe { page_base.add(PAGE_HEADER_BYTES) };
            if ptr == base_payload {
                debug_assert!(!pr.base_free, "double free of a subpage base block");
                pr.base_free = true;
            } else {
                write_next(ptr, pr.freelist);
                pr.freelist = ptr;
            }
            pr.num_free += 1;
            STATS.subpage.decrease(class_sz as i64);

            if pr.num_free == blocks_per_page(class) {
                detach(&mut row[class], cursor);
                unsafe {
                    ptr::write_bytes(page_base, 0, PAGE);
                }
                STATS.subpage_pages.decrease(PAGE as i64);
                drop(row);
                pageref::release_to_reusable(cursor);
            }
            return FreeOutcome::Handled;
        }
        cursor = pr.next;
    }

    debug_assert!(
        false,
        "free: no page-ref in (processor {processor}, class {class}) owns page_base {page_base:?}; caller passed a pointer not obtained from this allocator"
    );
    FreeOutcome::Handled
}

fn detach(head: &mut *mut PageRef, target: *mut PageRef) {
    let mut cursor = *head;
    if cursor == target {
        *head = unsafe { (*target).next };
        return;
    }
    while !cursor.is_null() {
        let next = unsafe { (*cursor).next };
        if next == target {
            unsafe {
                (*cursor).next = (*target).next;
            }
            return;
        }
        cursor = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_ready() {
        assert_eq!(substrate::substrate_init(), 0);
        assert!(init_directory());
    }

    #[test]
    fn allocate_then_free_roundtrip() {
        ensure_ready();
        let p = allocate(40);
        assert!(!p.is_null());
        assert!(matches!(free(p), FreeOutcome::Handled));
    }

    #[test]
    fn many_small_allocations_are_distinct() {
        ensure_ready();
        let mut seen = std::collections::HashSet::new();
        let mut ptrs = Vec::new();
        for _ in 0..600 {
            let p = allocate(8);
            assert!(!p.is_null());
            assert!(seen.insert(p as usize));
            ptrs.push(p);
        }
        for p in ptrs {
            assert!(matches!(free(p), FreeOutcome::Handled));
        }
    }

    #[test]
    fn zero_size_maps_to_smallest_class() {
        ensure_ready();
        let p = allocate(0);
        assert!(!p.is_null());
        assert!(matches!(free(p), FreeOutcome::Handled));
    }

    #[test]
    fn base_block_then_chained_block_both_serve_full_size_class() {
        ensure_ready();
        // class 2048 leaves no room for a second full-size block to share
        // the base block's own space, so these two must land on different
        // addresses: one on the base block, one on a chained block.
        let p1 = allocate(2048);
        let p2 = allocate(2048);
        assert!(!p1.is_null() && !p2.is_null());
        assert_ne!(p1, p2);
        assert!(matches!(free(p1), FreeOutcome::Handled));
        assert!(matches!(free(p2), FreeOutcome::Handled));
    }

    #[test]
    fn page_fills_up_and_releases_back_to_pool() {
        ensure_ready();
        let n = blocks_per_page(0);
        let mut ptrs = Vec::with_capacity(n);
        for _ in 0..n {
            let p = allocate(8);
            assert!(!p.is_null());
            ptrs.push(p);
        }
        for p in ptrs {
            assert!(matches!(free(p), FreeOutcome::Handled));
        }
        // The page-ref should now be sitting in the reusable pool; a fresh
        // allocation should be able to reuse its data page without growing
        // the substrate again.
        let hi_before = substrate::hi();
        let p = allocate(8);
        assert!(!p.is_null());
        assert_eq!(substrate::hi(), hi_before);
    }
}
