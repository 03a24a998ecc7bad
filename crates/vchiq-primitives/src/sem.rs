//! Counting semaphore over a futex word, plus the cancellation token used to
//! tear down blocked callers.
//!
//! The transport keeps one permit per local TX slot: `acquire` is the
//! free-slot rendezvous, `post` is called by the recycle path. Whoever
//! cancels a token must also wake the words its waiters may be blocked on
//! (`wake_all` here, `RemoteEvent::wake` for events), which is what turns a
//! single flag into a multi-wait.

use crate::sync::{AtomicU32, Ordering};

#[cfg(not(loom))]
use crate::futex::{futex_wait, futex_wake};
#[cfg(not(loom))]
use core::time::Duration;
#[cfg(not(loom))]
use std::time::Instant;

/// Error from blocking waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Timeout expired before the condition was met
    Timeout,
    /// The associated cancel token fired
    Cancelled,
}

impl core::fmt::Display for WaitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WaitError::Timeout => write!(f, "wait timeout"),
            WaitError::Cancelled => write!(f, "wait cancelled"),
        }
    }
}

impl std::error::Error for WaitError {}

/// One-shot cancellation flag shared by all waiters of a transport.
#[derive(Default)]
pub struct CancelToken {
    flag: AtomicU32,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicU32::new(0),
        }
    }

    /// Latch the token. Callers must follow up by waking the rendezvous
    /// words their waiters block on.
    pub fn cancel(&self) {
        self.flag.store(1, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire) != 0
    }
}

/// Counting semaphore whose count doubles as the futex word.
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    pub fn new(permits: u32) -> Self {
        Self {
            count: AtomicU32::new(permits),
        }
    }

    /// Take a permit without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut cur = self.count.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Release a permit and wake one waiter.
    pub fn post(&self) {
        self.count.fetch_add(1, Ordering::Release);
        #[cfg(not(loom))]
        futex_wake(&self.count, 1);
    }

    /// Current permit count. Racy by nature; for diagnostics and tests.
    pub fn available(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Block until a permit is taken, the timeout expires, or the token is
    /// cancelled.
    #[cfg(not(loom))]
    pub fn acquire(&self, timeout: Option<Duration>, cancel: &CancelToken) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.try_acquire() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            let remaining = if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(WaitError::Timeout);
                }
                Some(deadline - now)
            } else {
                None
            };

            futex_wait(&self.count, 0, remaining);

            // One more attempt after waking, then the deadline check
            if self.try_acquire() {
                return Ok(());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(WaitError::Timeout);
            }
        }
    }

    /// Wake every waiter without posting a permit. Paired with
    /// `CancelToken::cancel` during teardown.
    #[cfg(not(loom))]
    pub fn wake_all(&self) {
        futex_wake(&self.count, u32::MAX);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_acquire_counts_down() {
        let sem = Semaphore::new(2);
        assert!(sem.try_acquire());
        assert!(sem.try_acquire());
        assert!(!sem.try_acquire());
        sem.post();
        assert!(sem.try_acquire());
    }

    #[test]
    fn acquire_times_out() {
        let sem = Semaphore::new(0);
        let cancel = CancelToken::new();
        let result = sem.acquire(Some(Duration::from_millis(10)), &cancel);
        assert_eq!(result, Err(WaitError::Timeout));
    }

    #[test]
    fn post_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = sem.clone();

        let waiter = thread::spawn(move || {
            let cancel = CancelToken::new();
            sem2.acquire(Some(Duration::from_secs(5)), &cancel)
        });

        thread::sleep(Duration::from_millis(50));
        sem.post();

        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn cancel_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new(0));
        let cancel = Arc::new(CancelToken::new());
        let (sem2, cancel2) = (sem.clone(), cancel.clone());

        let waiter =
            thread::spawn(move || sem2.acquire(Some(Duration::from_secs(5)), &cancel2));

        thread::sleep(Duration::from_millis(50));
        cancel.cancel();
        sem.wake_all();

        assert_eq!(waiter.join().unwrap(), Err(WaitError::Cancelled));
    }
}
