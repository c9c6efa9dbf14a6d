//! A parallel heap allocator built from three independent pieces over one
//! growth-only heap substrate: a page-ref pool, a per-processor subpage
//! arena for requests up to 2048 bytes, and a single global freelist for
//! everything larger. `free` never needs an external address-to-metadata
//! map - every subpage page and every large span carries its own owner
//! information in its first two machine words, so `free` reads that
//! in-band header to figure out where a pointer came from.
//!
//! Loosely in the tradition of mimalloc's per-size-class design (`GlobalAlloc`
//! wrapper, `log`-based diagnostics, `libc`/`winapi` substrate), but with a
//! much smaller core: nine fixed size classes instead of a full
//! segment/page/heap hierarchy, and one arena per CPU instead of one heap
//! per thread.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

mod init;
mod large;
mod pageref;
mod stats;
mod subpage;
mod substrate;
mod types;

pub use stats::{StatCount, Stats, STATS};
pub use types::SUBPAGE_MAX;

/// Bring up the heap substrate and the per-processor arena directory.
/// Idempotent and thread-safe - only the first call does any work.
/// `allocate`/`free` call this themselves, so most callers never need to
/// invoke it directly; it is exposed for callers that want to force
/// initialization (and observe its failure) before the first allocation.
pub fn init() -> i32 {
    init::init()
}

/// Allocate `size` bytes. Requests at or below [`SUBPAGE_MAX`] come from
/// the per-processor subpage arenas; larger requests come from the
/// large-object allocator. Returns a null pointer iff the heap substrate
/// could not grow to satisfy the request.
pub fn allocate(size: usize) -> *mut u8 {
    if init::init() != 0 {
        return ptr::null_mut();
    }
    if size <= SUBPAGE_MAX {
        subpage::allocate(size)
    } else {
        large::allocate(size)
    }
}

/// Free a pointer previously returned by `allocate`. A null pointer is a
/// no-op and never touches any lock.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    match subpage::free(ptr) {
        subpage::FreeOutcome::Handled => {}
        subpage::FreeOutcome::NotOurs(page_base) => large::free(page_base),
    }
}

/// Zero-sized `GlobalAlloc` wrapper so this allocator can be installed
/// with `#[global_allocator]`.
///
/// Requests are served by size alone; a class's natural alignment covers
/// ordinary Rust types, but the base block of a subpage page (the one
/// whose header overlaps) is only guaranteed to be 4-byte aligned rather
/// than a blanket `layout.align()` guarantee.
pub struct ParcAlloc;

unsafe impl GlobalAlloc for ParcAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_routes_by_size() {
        assert_eq!(init(), 0);
        let small = allocate(64);
        assert!(!small.is_null());
        free(small);

        let large = allocate(SUBPAGE_MAX + 1);
        assert!(!large.is_null());
        free(large);
    }

    #[test]
    fn free_of_null_is_a_no_op() {
        free(ptr::null_mut());
    }

    #[test]
    fn global_alloc_wrapper_round_trips() {
        let alloc = ParcAlloc;
        let layout = Layout::from_size_align(128, 8).unwrap();
        unsafe {
            let p = alloc.alloc(layout);
            assert!(!p.is_null());
            alloc.dealloc(p, layout);
        }
    }
}
