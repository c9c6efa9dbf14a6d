//! Process-wide initialization: bring up the substrate and the arena
//! directory exactly once, however many threads race to trigger it.
//!
//! Uses `std::sync::Once` rather than a racy bare `static mut bool` guard;
//! there is no matching teardown because this allocator never returns its
//! substrate to the OS.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Once;

use log::trace;

use crate::substrate;
use crate::subpage;

static ONCE: Once = Once::new();
static RESULT: AtomicI32 = AtomicI32::new(-1);

/// Bring up the substrate and the arena directory. Safe to call from any
/// number of threads, any number of times: only the first call does any
/// work, and every call blocks until that work (wherever it is running)
/// has finished. Returns `0` on success, `-1` if either step failed - in
/// which case every later call keeps returning `-1` without retrying.
pub fn init() -> i32 {
    ONCE.call_once(|| {
        let result = if substrate::substrate_init() != 0 {
            -1
        } else if !subpage::init_directory() {
            -1
        } else {
            trace!("init: substrate and arena directory ready");
            0
        };
        RESULT.store(result, Ordering::SeqCst);
    });
    RESULT.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_succeeds() {
        assert_eq!(init(), 0);
        assert_eq!(init(), 0);
    }
}
