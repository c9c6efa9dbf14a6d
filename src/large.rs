//! The large-object allocator: requests above `SUBPAGE_MAX` bypass the
//! per-processor arenas entirely and come from one process-wide freelist
//! of page-granular spans. Splitting is one-way - a span handed back by
//! `free` is never merged with a neighbour - trading some fragmentation
//! for a freelist walk that never has to inspect anything but the two
//! header words at each node's base.
//!
//! First-fit over an unsorted singly linked freelist: simple enough that
//! the walk and the splice-out on a hit are the only two list operations
//! this module needs.

use std::ptr;
use std::sync::Mutex;

use crate::stats::STATS;
use crate::substrate;
use crate::types::{HEADER_BYTES, LARGE_SENTINEL, PAGE, WORD};

/// Head of the global free-span list, wrapped so the raw pointer can live
/// in a `Mutex` behind a `static`. Every span it threads through lives for
/// the life of the process and is only ever touched under `FREE`'s lock.
struct Head(*mut u8);
unsafe impl Send for Head {}

static FREE: Mutex<Head> = Mutex::new(Head(ptr::null_mut()));

#[inline]
fn write_header(span_base: *mut u8, pages: usize) {
    unsafe {
        *(span_base as *mut usize) = LARGE_SENTINEL;
        *(span_base.add(WORD) as *mut usize) = pages;
    }
}

#[inline]
fn read_pages(span_base: *mut u8) -> usize {
    unsafe { *(span_base.add(WORD) as *const usize) }
}

#[inline]
fn read_next(span_base: *mut u8) -> *mut u8 {
    unsafe { *(span_base.add(HEADER_BYTES) as *const *mut u8) }
}

#[inline]
fn write_next(span_base: *mut u8, next: *mut u8) {
    unsafe {
        *(span_base.add(HEADER_BYTES) as *mut *mut u8) = next;
    }
}

fn pages_for(size: usize) -> usize {
    let total = size.saturating_add(HEADER_BYTES);
    total.div_ceil(PAGE).max(1)
}

/// Allocate a `size`-byte request that didn't fit the subpage path.
/// Returns null if the substrate is exhausted.
pub fn allocate(size: usize) -> *mut u8 {
    let pages = pages_for(size);

    let mut free = FREE.lock().unwrap();
    let mut prev: *mut u8 = ptr::null_mut();
    let mut cursor = free.0;
    while !cursor.is_null() {
        let node_pages = read_pages(cursor);
        if node_pages > pages {
            // Split: the remainder stays exactly where it is - same
            // address, same `next` pointer, just a shrunk page count - and
            // the carved-off tail is what gets handed to the caller. That
            // keeps the freelist splice untouched on the (more common)
            // split path; only an exact-fit match below needs unlinking.
            let remainder_pages = node_pages - pages;
            write_header(cursor, remainder_pages);
            let tail = unsafe { cursor.add(remainder_pages * PAGE) };
            write_header(tail, pages);
            drop(free);
            STATS.large.increase((pages * PAGE - HEADER_BYTES) as i64);
            return unsafe { tail.add(HEADER_BYTES) };
        }
        if node_pages == pages {
            let next = read_next(cursor);
            if prev.is_null() {
                free.0 = next;
            } else {
                write_next(prev, next);
            }
            write_header(cursor, pages);
            drop(free);
            STATS.large.increase((pages * PAGE - HEADER_BYTES) as i64);
            return unsafe { cursor.add(HEADER_BYTES) };
        }
        prev = cursor;
        cursor = read_next(cursor);
    }
    // No span fits: release the freelist lock before growing the
    // substrate. The freelist lock and the growth cursor are never held
    // at once.
    drop(free);

    let span = substrate::substrate_sbrk(pages * PAGE);
    if span.is_null() {
        return ptr::null_mut();
    }
    write_header(span, pages);
    STATS.large.increase((pages * PAGE - HEADER_BYTES) as i64);
    STATS.large_spans.increase((pages * PAGE) as i64);
    unsafe { span.add(HEADER_BYTES) }
}

/// Free a span previously returned by `allocate`, given its already
/// page-aligned base (as computed by the `free` dispatcher from the
/// user pointer).
pub fn free(span_base: *mut u8) {
    debug_assert_eq!(
        unsafe { *(span_base as *const usize) },
        LARGE_SENTINEL,
        "large::free called on a span without the large-allocator sentinel"
    );
    let pages = read_pages(span_base);
    STATS.large.decrease((pages * PAGE - HEADER_BYTES) as i64);

    let mut free = FREE.lock().unwrap();
    write_next(span_base, free.0);
    free.0 = span_base;
}
