//! The `{armed, fired}` remote-event handshake.
//!
//! One of these lives at a fixed offset inside each side's half of the shared
//! control block. The signalling side sets `fired` and rings the doorbell
//! only if the waiter advertised interest through `armed`; the waiting side
//! re-arms with a recheck so a signal landing between "arm" and "sleep" is
//! never lost.

use crate::sync::{AtomicU32, Ordering, fence};

#[cfg(all(not(loom), any(test, feature = "std")))]
use crate::futex::{futex_wait, futex_wake};
#[cfg(all(not(loom), any(test, feature = "std")))]
use crate::sem::{CancelToken, WaitError};
#[cfg(all(not(loom), any(test, feature = "std")))]
use core::time::Duration;
#[cfg(all(not(loom), any(test, feature = "std")))]
use std::time::Instant;

/// Event word pair shared with the peer.
///
/// `repr(C)` because the peer addresses these words by offset.
#[repr(C)]
pub struct RemoteEvent {
    armed: AtomicU32,
    fired: AtomicU32,
}

#[cfg(not(loom))]
const _: () = assert!(core::mem::size_of::<RemoteEvent>() == 8);

impl RemoteEvent {
    /// In-memory construction for tests; real events are projected out of
    /// the shared region.
    #[cfg(any(test, loom))]
    pub fn new() -> Self {
        Self {
            armed: AtomicU32::new(0),
            fired: AtomicU32::new(0),
        }
    }

    /// Reset both words. Only valid before the peer attaches.
    pub fn init(&self) {
        self.armed.store(0, Ordering::Relaxed);
        self.fired.store(0, Ordering::Relaxed);
    }

    /// Fire the event. Returns `true` if the remote waiter is armed and the
    /// doorbell must be rung; `false` means the waiter will notice `fired`
    /// on its own before it next sleeps.
    pub fn signal(&self) -> bool {
        self.fired.store(1, Ordering::Release);
        // StoreLoad: the fired store must be ordered before the armed
        // sample. Paired with the fence in `arm`, at least one side sees
        // the other's store, so an armed waiter always gets its ring.
        fence(Ordering::SeqCst);
        self.armed.load(Ordering::Acquire) != 0
    }

    /// Non-consuming check.
    #[inline]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire) != 0
    }

    /// Advertise interest to the signalling side, then recheck. Returns
    /// `true` if the event is already fired; the caller must consume it
    /// instead of sleeping.
    pub fn arm(&self) -> bool {
        self.armed.store(1, Ordering::Release);
        // StoreLoad counterpart of the fence in `signal`
        fence(Ordering::SeqCst);
        self.is_fired()
    }

    /// Consume a pending fire without blocking. Returns whether one was
    /// pending.
    pub fn try_consume(&self) -> bool {
        if self.fired.swap(0, Ordering::AcqRel) != 0 {
            self.armed.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Doorbell-dispatch entry point: wake any local waiter if the event has
    /// fired. Called for every local event when the doorbell rings, since
    /// the ring itself carries no payload.
    #[cfg(all(not(loom), any(test, feature = "std")))]
    pub fn poll(&self) {
        if self.is_fired() {
            futex_wake(&self.fired, u32::MAX);
        }
    }

    /// Wake local waiters without firing the event. Teardown path.
    #[cfg(all(not(loom), any(test, feature = "std")))]
    pub fn wake(&self) {
        futex_wake(&self.fired, u32::MAX);
    }

    /// Block until the event fires, consuming it.
    ///
    /// The arm sequence is: consume-check, arm, recheck, sleep. A signal
    /// that lands after the recheck flips the futex word, so the sleep
    /// returns immediately instead of losing the wakeup.
    #[cfg(all(not(loom), any(test, feature = "std")))]
    pub fn wait(&self, timeout: Option<Duration>, cancel: &CancelToken) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.try_consume() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(WaitError::Cancelled);
            }

            if self.arm() {
                continue;
            }

            let remaining = if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    self.armed.store(0, Ordering::Release);
                    return Err(WaitError::Timeout);
                }
                Some(deadline - now)
            } else {
                None
            };

            futex_wait(&self.fired, 0, remaining);

            if self.try_consume() {
                return Ok(());
            }
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                self.armed.store(0, Ordering::Release);
                return Err(WaitError::Timeout);
            }
        }
    }
}
