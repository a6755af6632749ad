// Futex calls for words that live in the shared segment. These must be the
// shared FUTEX_WAIT / FUTEX_WAKE ops, the _PRIVATE variants only wake
// threads of the calling process.

use std::sync::atomic::AtomicU32;
use std::time::Duration;

#[cfg(target_os = "linux")]
const FUTEX_WAIT: i32 = 0;
#[cfg(target_os = "linux")]
const FUTEX_WAKE: i32 = 1;

/// Blocks while `*addr == expected`, until woken or `timeout` elapses.
/// Returns false only on timeout, spurious wakes and value changes return
/// true and callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let ts = timeout.map(|d| libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: addr is a live reference for the duration of the call, the
    // remaining arguments are unused by FUTEX_WAIT.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0i32,
        )
    };
    if ret == -1 {
        return std::io::Error::last_os_error().raw_os_error() != Some(libc::ETIMEDOUT);
    }
    return true;
}

/// Wakes up to `count` waiters blocked on `addr`.
#[cfg(target_os = "linux")]
pub fn futex_wake(addr: &AtomicU32, count: i32) -> i32 {
    // SAFETY: see futex_wait, FUTEX_WAKE only reads the address.
    return unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<u32>(),
            0i32,
        ) as i32
    };
}

// Elsewhere fall back to short sleeps, waiters poll their condition.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(addr: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let nap = timeout
        .unwrap_or(Duration::from_millis(1))
        .min(Duration::from_millis(1));
    std::thread::sleep(nap);
    return addr.load(std::sync::atomic::Ordering::Acquire) != expected || timeout.is_none();
}

#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_addr: &AtomicU32, _count: i32) -> i32 {
    return 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wake_without_waiters() {
        let val = AtomicU32::new(0);
        assert!(futex_wake(&val, 1) >= 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_returns_on_mismatch() {
        let val = AtomicU32::new(7);
        let start = Instant::now();
        assert!(futex_wait(&val, 0, Some(Duration::from_secs(1))));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn wait_times_out() {
        let val = AtomicU32::new(3);
        let start = Instant::now();
        assert!(!futex_wait(&val, 3, Some(Duration::from_millis(50))));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn wake_releases_waiter() {
        let val = Arc::new(AtomicU32::new(0));
        let waiter = {
            let val = val.clone();
            std::thread::spawn(move || {
                while val.load(Ordering::Acquire) == 0 {
                    futex_wait(&val, 0, Some(Duration::from_secs(1)));
                }
                val.load(Ordering::Acquire)
            })
        };
        std::thread::sleep(Duration::from_millis(10));
        val.store(9, Ordering::Release);
        futex_wake(&val, 1);
        assert_eq!(waiter.join().expect("waiter panicked"), 9);
    }
}
