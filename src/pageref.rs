//! The page-ref pool: a process-wide pool of fixed-size metadata records
//! describing 4 KiB subpage pages, manufactured from sbrk'd metadata
//! pages and recycled once a page empties out.
//!
//! Two flat singly linked lists (fresh, reusable) threaded through each
//! record's own `next` pointer, detached from the head and pushed back
//! onto the head - no sorting, no size classing at this layer.

use std::ptr;
use std::sync::Mutex;

use crate::stats::STATS;
use crate::substrate;
use crate::types::{PageRef, CACHELINE, PAGE};

struct Pool {
    /// Page-refs previously bound to a now-empty subpage page; reusing one
    /// retains its data page, skipping a second sbrk.
    reusable: *mut PageRef,
    /// Page-refs carved from a metadata page but never yet bound to a data
    /// page.
    fresh: *mut PageRef,
}

// SAFETY: every field is a pointer into process memory that lives for the
// program's duration; all access goes through `POOL`'s mutex.
unsafe impl Send for Pool {}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    reusable: ptr::null_mut(),
    fresh: ptr::null_mut(),
});

/// Whether a page-ref returned by `acquire` already has a data page bound
/// to it (a recycled record) or still needs one sbrk'd (a fresh record).
pub enum Binding {
    AlreadyBound,
    NeedsDataPage,
}

fn pop_head(list: &mut *mut PageRef) -> Option<*mut PageRef> {
    if list.is_null() {
        return None;
    }
    let head = *list;
    // SAFETY: `head` is a live page-ref owned by this list under the pool
    // lock; only the holder of that lock may follow or rewrite `next`.
    *list = unsafe { (*head).next };
    unsafe {
        (*head).next = ptr::null_mut();
    }
    Some(head)
}

/// Obtain a page-ref for the subpage allocator to bind into an arena list:
/// try the reusable list, then the fresh list, then carve a brand new
/// metadata page. Returns a null pointer iff carving a fresh metadata
/// page required growing the substrate and that growth failed.
pub fn acquire() -> (*mut PageRef, Binding) {
    let mut pool = POOL.lock().unwrap();

    if let Some(pr) = pop_head(&mut pool.reusable) {
        return (pr, Binding::AlreadyBound);
    }
    if let Some(pr) = pop_head(&mut pool.fresh) {
        return (pr, Binding::NeedsDataPage);
    }

    // Carve a fresh metadata page into CACHELINE-sized records. The first
    // record is handed back directly; the rest are linked onto the fresh
    // list. Lock order here is pool -> growth.
    let meta_page = substrate::substrate_sbrk(PAGE);
    if meta_page.is_null() {
        return (ptr::null_mut(), Binding::NeedsDataPage);
    }
    STATS.pageref_pages.increase(PAGE as i64);

    let records_per_page = PAGE / CACHELINE;
    let mut chain: *mut PageRef = ptr::null_mut();
    for i in (1..records_per_page).rev() {
        // SAFETY: `meta_page` is a freshly sbrk'd, exclusively-owned 4 KiB
        // region; each `i*CACHELINE` offset lies within it and is
        // correctly aligned for a `PageRef`.
        let rec = unsafe { meta_page.add(i * CACHELINE) } as *mut PageRef;
        unsafe {
            ptr::write(rec, PageRef::empty());
            (*rec).next = chain;
        }
        chain = rec;
    }
    pool.fresh = chain;

    let first = meta_page as *mut PageRef;
    unsafe { ptr::write(first, PageRef::empty()) };
    (first, Binding::NeedsDataPage)
}

/// sbrk a 4 KiB data page and bind it to `pr`. Returns `false` if the
/// substrate could not grow.
pub fn bind_data_page(pr: *mut PageRef) -> bool {
    let page = substrate::substrate_sbrk(PAGE);
    if page.is_null() {
        return false;
    }
    STATS.subpage_pages.increase(PAGE as i64);
    // SAFETY: `pr` is exclusively owned by the caller (it is not yet on
    // any list reachable by another thread).
    unsafe {
        (*pr).page_base = page;
    }
    true
}

/// Return a page-ref that still needs a data page (its `bind_data_page`
/// call failed) to the fresh pool instead of leaking the record.
pub fn return_unbound(pr: *mut PageRef) {
    let mut pool = POOL.lock().unwrap();
    unsafe {
        (*pr).next = pool.fresh;
    }
    pool.fresh = pr;
}

/// Return a page-ref whose bound page has become fully empty to the
/// reusable pool. Its freelist is cleared; its bound page is assumed
/// already zeroed by the caller.
pub fn release_to_reusable(pr: *mut PageRef) {
    let mut pool = POOL.lock().unwrap();
    unsafe {
        (*pr).freelist = ptr::null_mut();
        (*pr).num_free = 0;
        (*pr).next = pool.reusable;
    }
    pool.reusable = pr;
    STATS.pageref_reused.increase(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_then_reuse_roundtrip() {
        let (pr, binding) = acquire();
        assert!(!pr.is_null());
        assert!(matches!(binding, Binding::NeedsDataPage));
        assert!(bind_data_page(pr));
        let page_base = unsafe { (*pr).page_base };
        assert!(!page_base.is_null());

        release_to_reusable(pr);
        let (pr2, binding2) = acquire();
        assert_eq!(pr2, pr);
        assert!(matches!(binding2, Binding::AlreadyBound));
        assert_eq!(unsafe { (*pr2).page_base }, page_base);
    }
}
