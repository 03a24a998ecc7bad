//! Doorbell abstraction.
//!
//! A ring carries no payload: the receiving side polls every local event to
//! find out why it was rung, exactly like an interrupt handler would. On
//! real hardware this is an MMIO write; in tests and single-process use the
//! loopback doorbell dispatches directly into the peer's event words.

use crate::layout::{Role, SlotZeroRef};

/// Value-ignored wakeup line toward the peer.
pub trait Doorbell: Send + Sync {
    fn ring(&self);
}

/// Doorbell that wakes the peer in the same address space.
pub struct LoopbackDoorbell {
    zero: SlotZeroRef,
    /// The side being woken (the ringer's peer)
    target: Role,
}

impl LoopbackDoorbell {
    pub fn new(zero: SlotZeroRef, target: Role) -> Self {
        Self { zero, target }
    }
}

impl Doorbell for LoopbackDoorbell {
    fn ring(&self) {
        let side = self.zero.side(self.target);
        side.trigger.poll();
        side.recycle.poll();
        side.sync_trigger.poll();
        side.sync_release.poll();
    }
}

/// Doorbell that goes nowhere, for single-sided or poll-driven setups.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self) {}
}
