//! Blocking waits on shared atomic words.
//!
//! Uses the futex syscall on Linux and a polling fallback elsewhere. The
//! words live in shared memory, so the non-private futex form is used; the
//! same calls work whether the two sides share a process or only the mapping.

use core::sync::atomic::AtomicU32;
use core::time::Duration;

/// Block until `word` changes away from `expected`, or the timeout expires.
///
/// Returns `true` if woken (or if the word already differed), `false` on
/// timeout. Spurious wakeups are possible; callers re-check their condition
/// in a loop.
#[cfg(target_os = "linux")]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    let ts;
    let ts_ptr = match timeout {
        Some(t) => {
            ts = libc::timespec {
                tv_sec: t.as_secs() as libc::time_t,
                tv_nsec: t.subsec_nanos() as _,
            };
            &ts as *const libc::timespec
        }
        None => core::ptr::null(),
    };

    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
        )
    };
    if rc == 0 {
        return true;
    }
    match unsafe { *libc::__errno_location() } {
        libc::ETIMEDOUT => false,
        // EAGAIN: the word no longer holds `expected`. EINTR: signal; the
        // caller's recheck loop handles both.
        _ => true,
    }
}

/// Wake up to `count` waiters blocked on `word`.
///
/// Returns the number of waiters woken.
#[cfg(target_os = "linux")]
pub fn futex_wake(word: &AtomicU32, count: u32) -> usize {
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            core::ptr::null::<libc::timespec>(),
        )
    };
    rc.max(0) as usize
}

/// Polling fallback: sleep in short intervals until the word changes.
#[cfg(not(target_os = "linux"))]
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) -> bool {
    use core::sync::atomic::Ordering;
    use std::time::Instant;

    const POLL_INTERVAL: Duration = Duration::from_millis(1);

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if word.load(Ordering::Acquire) != expected {
            return true;
        }
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// No waiter registry in the fallback; wakes are free.
#[cfg(not(target_os = "linux"))]
pub fn futex_wake(_word: &AtomicU32, _count: u32) -> usize {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_returns_immediately_on_mismatch() {
        let word = AtomicU32::new(7);
        assert!(futex_wait(&word, 0, Some(Duration::from_millis(100))));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        assert!(!futex_wait(&word, 0, Some(Duration::from_millis(10))));
    }

    #[test]
    fn wake_unblocks_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let word2 = word.clone();

        let waiter = thread::spawn(move || {
            while word2.load(Ordering::Acquire) == 0 {
                futex_wait(&word2, 0, Some(Duration::from_secs(5)));
            }
            word2.load(Ordering::Acquire)
        });

        thread::sleep(Duration::from_millis(50));
        word.store(1, Ordering::Release);
        futex_wake(&word, u32::MAX);

        assert_eq!(waiter.join().unwrap(), 1);
    }
}
