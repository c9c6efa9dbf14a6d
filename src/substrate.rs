//! The heap substrate: a single linearly growing byte region backing the
//! whole process, plus CPU discovery. The rest of the allocator only
//! consumes it through the handful of functions below and never reaches
//! past them, logging OS failures via `log::warn!`/`log::error!` instead
//! of panicking.
//!
//! Nothing above this module cares whether bytes came from a real
//! `sbrk(2)`, an `mmap` reservation, or a `VirtualAlloc` reservation: the
//! only contract is monotonic, non-overlapping growth within `[lo, hi)`.

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};

use log::{error, warn};

/// Default size of the address-space reservation backing the heap, used
/// unless overridden by `PARC_ALLOC_RESERVE_MB`.
const DEFAULT_RESERVE_BYTES: usize = 1 << 30; // 1 GiB

static INIT: Once = Once::new();
static LO: AtomicUsize = AtomicUsize::new(0);
static RESERVED_HI: AtomicUsize = AtomicUsize::new(0);

/// The sbrk cursor: current high-water mark of bytes actually handed out.
/// Doubles as the substrate's single growth lock.
static CURSOR: Mutex<usize> = Mutex::new(0);

fn reserve_size_from_env() -> usize {
    match std::env::var("PARC_ALLOC_RESERVE_MB") {
        Ok(val) => match val.parse::<usize>() {
            Ok(mb) if mb > 0 => mb.saturating_mul(1024 * 1024),
            _ => {
                warn!("substrate: ignoring invalid PARC_ALLOC_RESERVE_MB={val:?}");
                DEFAULT_RESERVE_BYTES
            }
        },
        Err(_) => DEFAULT_RESERVE_BYTES,
    }
}

/// Idempotent substrate initialization. Returns `0` on success, `-1` if
/// the address-space reservation could not be made (in which case every
/// later call keeps returning `-1` without retrying).
pub fn substrate_init() -> i32 {
    INIT.call_once(|| {
        let reserve = reserve_size_from_env();
        match reserve_region(reserve) {
            Some(base) => {
                LO.store(base, Ordering::SeqCst);
                RESERVED_HI.store(base + reserve, Ordering::SeqCst);
                *CURSOR.lock().unwrap() = base;
            }
            None => {
                error!("substrate: failed to reserve {reserve} bytes of address space");
            }
        }
    });
    if LO.load(Ordering::SeqCst) == 0 {
        -1
    } else {
        0
    }
}

/// Monotonically grow the heap by `bytes`. Never returns overlapping
/// regions; returns null once the reservation is exhausted.
pub fn substrate_sbrk(bytes: usize) -> *mut u8 {
    if bytes == 0 {
        return ptr::null_mut();
    }
    let hi = RESERVED_HI.load(Ordering::SeqCst);
    let mut cursor = CURSOR.lock().unwrap();
    let base = *cursor;
    let grown = match base.checked_add(bytes) {
        Some(v) if v <= hi => v,
        _ => {
            warn!("substrate: sbrk({bytes}) exceeds the {hi_bytes} byte heap reservation",
                hi_bytes = hi.saturating_sub(LO.load(Ordering::SeqCst)));
            return ptr::null_mut();
        }
    };
    *cursor = grown;
    base as *mut u8
}

/// Inclusive lower bound of the heap; stable once `substrate_init` succeeds.
#[inline]
pub fn lo() -> usize {
    LO.load(Ordering::SeqCst)
}

/// Exclusive upper bound of bytes actually handed out so far.
#[inline]
pub fn hi() -> usize {
    *CURSOR.lock().unwrap()
}

/// A non-negative, advisory identifier for the CPU the calling thread is
/// currently running on. May change between two calls from the same
/// thread; callers must never rely on it staying stable.
pub fn current_cpu_id() -> usize {
    platform::current_cpu_id()
}

/// Number of processors to partition the subpage arenas over. Always >= 1.
pub fn num_processors() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(unix)]
fn reserve_region(bytes: usize) -> Option<usize> {
    unsafe {
        let p = libc::mmap(
            ptr::null_mut(),
            bytes,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            warn!(
                "substrate: mmap({bytes}) failed: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(p as usize)
    }
}

#[cfg(windows)]
fn reserve_region(bytes: usize) -> Option<usize> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};
    unsafe {
        let p = VirtualAlloc(ptr::null_mut(), bytes, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
        if p.is_null() {
            warn!(
                "substrate: VirtualAlloc({bytes}) failed: {}",
                std::io::Error::last_os_error()
            );
            return None;
        }
        Some(p as usize)
    }
}

#[cfg(unix)]
mod platform {
    pub fn current_cpu_id() -> usize {
        // `sched_getcpu` is Linux/glibc-specific; other unixes fall back to
        // processor 0, which is always a valid arena index.
        #[cfg(target_os = "linux")]
        unsafe {
            let cpu = libc::sched_getcpu();
            if cpu >= 0 {
                return cpu as usize;
            }
        }
        0
    }
}

#[cfg(windows)]
mod platform {
    use winapi::um::processthreadsapi::GetCurrentProcessorNumber;
    pub fn current_cpu_id() -> usize {
        unsafe { GetCurrentProcessorNumber() as usize }
    }
}

#[cfg(not(any(unix, windows)))]
mod platform {
    pub fn current_cpu_id() -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbrk_never_overlaps() {
        assert_eq!(substrate_init(), 0);
        let a = substrate_sbrk(PAGE_FOR_TEST);
        let b = substrate_sbrk(PAGE_FOR_TEST);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert!((b as usize) >= (a as usize) + PAGE_FOR_TEST);
        assert!(lo() <= a as usize);
        assert!(hi() >= b as usize + PAGE_FOR_TEST);
    }

    const PAGE_FOR_TEST: usize = 4096;

    #[test]
    fn num_processors_is_at_least_one() {
        assert!(num_processors() >= 1);
    }
}
