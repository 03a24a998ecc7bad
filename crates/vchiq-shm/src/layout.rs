//! Shared control block layout and initialization.
//!
//! The region starts with `SlotZero`: magic + geometry, one `SharedState`
//! half per side, and the per-slot usage records. Data slots follow at
//! 4096-byte granularity, then the bulk fragment pool. Both sides project
//! the same structures; a side writes its own half and only the fields of
//! the peer's half the protocol assigns to it (the slot queue it returns
//! freed slots through, and the event words it fires).

use core::mem::size_of;
use core::sync::atomic::{AtomicU16, AtomicU32, Ordering};

use vchiq_primitives::{Region, RemoteEvent};

/// Slot granularity in bytes.
pub const SLOT_SIZE: usize = 4096;
pub const SLOT_MASK: usize = SLOT_SIZE - 1;

/// Hard caps baked into the queue geometry.
pub const MAX_SLOTS: usize = 128;
pub const MAX_SLOTS_PER_SIDE: usize = 64;
pub const SLOT_QUEUE_MASK: u32 = MAX_SLOTS_PER_SIDE as u32 - 1;

/// Identifies a formatted region.
pub const MAGIC: u32 = u32::from_le_bytes(*b"VCHI");

/// Protocol version written to `SlotZero` and checked on attach.
pub const VERSION: u16 = 8;
/// Oldest peer version this implementation will talk to.
pub const VERSION_MIN: u16 = 3;

/// Size of one bulk fragment, including its 8-byte descriptor header.
pub const FRAGMENT_SIZE: usize = 256;

/// Largest payload `queue_message` accepts: one slot minus the header.
pub const MAX_MESSAGE_SIZE: usize = SLOT_SIZE - crate::msg::MSG_HEADER_SIZE;

/// Which half of the control block is ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

impl Role {
    #[inline]
    pub fn peer(self) -> Role {
        match self {
            Role::Master => Role::Slave,
            Role::Slave => Role::Master,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Slave => "slave",
        }
    }
}

// ── shared state halves ──────────────────────────────────────────────────────

/// One side's half of the control block.
///
/// `tx_pos` and the events are written by the owner and read by the peer,
/// except `slot_queue_recycle` and the tail of `slot_queue`, which the PEER
/// writes when it returns freed slots, and `trigger`/`recycle`, which the
/// peer fires and the owner consumes.
#[repr(C)]
pub struct SharedState {
    pub initialised: AtomicU32,
    /// First and last physical data slot owned by this side
    pub slot_first: AtomicU32,
    pub slot_last: AtomicU32,
    /// Reserved slot for the synchronous channel; never queued
    pub slot_sync: AtomicU32,
    /// Fired by the peer after it publishes messages
    pub trigger: RemoteEvent,
    /// Total bytes this side has published into its slot stream
    pub tx_pos: AtomicU32,
    /// Fired by the peer after it returns freed slots
    pub recycle: RemoteEvent,
    /// Write cursor into `slot_queue`; advanced by the peer
    pub slot_queue_recycle: AtomicU32,
    /// Synchronous-channel events; initialized but dormant
    pub sync_trigger: RemoteEvent,
    pub sync_release: RemoteEvent,
    /// Circular queue of slot indices available to this side's TX allocator
    pub slot_queue: [AtomicU32; MAX_SLOTS_PER_SIDE],
}

const _: () = assert!(size_of::<SharedState>() == 56 + 4 * MAX_SLOTS_PER_SIDE);

impl SharedState {
    fn init(&self, sync_slot: u32, first: u32, last: u32) {
        self.slot_sync.store(sync_slot, Ordering::Relaxed);
        self.slot_first.store(first, Ordering::Relaxed);
        self.slot_last.store(last, Ordering::Relaxed);
        self.tx_pos.store(0, Ordering::Relaxed);
        self.trigger.init();
        self.recycle.init();
        self.sync_trigger.init();
        self.sync_release.init();

        let count = last - first + 1;
        for i in 0..count {
            self.slot_queue[i as usize].store(first + i, Ordering::Relaxed);
        }
        self.slot_queue_recycle.store(count, Ordering::Relaxed);
        self.initialised.store(1, Ordering::Release);
    }

    /// Number of message slots this side owns.
    #[inline]
    pub fn slot_count(&self) -> u32 {
        self.slot_last.load(Ordering::Relaxed) - self.slot_first.load(Ordering::Relaxed) + 1
    }
}

// ── slot usage records ───────────────────────────────────────────────────────

/// `flags` bit: the RX cursor is currently parsing inside this slot.
pub const SLOT_IN_USE: u32 = 1;
/// `flags` bit: the slot awaits recycling; cleared exactly once when retired.
pub const SLOT_ACTIVE: u32 = 2;

/// Usage record for one physical slot. Only the side consuming the slot
/// touches its record, so the two sides never contend on one.
#[repr(C)]
pub struct SlotInfo {
    ref_count: AtomicU32,
    flags: AtomicU32,
}

const _: () = assert!(size_of::<SlotInfo>() == 8);

impl SlotInfo {
    /// Called when the RX cursor enters the slot.
    pub fn begin_use(&self) {
        self.ref_count.store(0, Ordering::Relaxed);
        self.flags
            .store(SLOT_IN_USE | SLOT_ACTIVE, Ordering::Release);
    }

    /// Called when the RX cursor crosses out of the slot.
    pub fn end_use(&self) {
        self.flags.fetch_and(!SLOT_IN_USE, Ordering::AcqRel);
    }

    /// A queued message now references bytes in this slot.
    pub fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the reference count after the decrement.
    pub fn drop_ref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "slot reference count underflow");
        prev - 1
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Retire the slot if it is active, fully parsed, and unreferenced.
    /// Returns true exactly once per use cycle; the caller serializes this
    /// under the recycle mutex.
    pub fn try_retire(&self) -> bool {
        let flags = self.flags.load(Ordering::Acquire);
        if flags & SLOT_ACTIVE == 0 || flags & SLOT_IN_USE != 0 {
            return false;
        }
        if self.ref_count.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.flags.store(flags & !SLOT_ACTIVE, Ordering::Release);
        true
    }
}

// ── slot zero ────────────────────────────────────────────────────────────────

/// The control block at offset 0 of the shared region.
#[repr(C)]
pub struct SlotZero {
    pub magic: AtomicU32,
    pub version: AtomicU16,
    pub version_min: AtomicU16,
    pub slot_zero_size: AtomicU32,
    pub slot_size: AtomicU32,
    pub max_slots: AtomicU32,
    pub max_slots_per_side: AtomicU32,
    /// Bulk fragment pool descriptor: [bus address of pool, fragment count]
    pub platform_data: [AtomicU32; 2],
    pub master: SharedState,
    pub slave: SharedState,
    pub slots: [SlotInfo; MAX_SLOTS],
}

/// Data slots start at the first slot boundary past `SlotZero`.
pub const FIRST_DATA_SLOT: usize = size_of::<SlotZero>().div_ceil(SLOT_SIZE);

const _: () = assert!(size_of::<SlotZero>() <= FIRST_DATA_SLOT * SLOT_SIZE);

// ── configuration ────────────────────────────────────────────────────────────

/// Geometry and local pool sizing for one transport instance.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Message slots per side, excluding the reserved sync slot.
    pub slots_per_side: usize,
    /// Bulk fragments in the shared pool (split evenly between sides).
    pub fragment_count: usize,
    /// Service port table size, including the reserved control port 0.
    pub max_services: usize,
    /// Bound on queued-but-undelivered completions per transport.
    pub completion_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            slots_per_side: 16,
            fragment_count: 32,
            max_services: 64,
            completion_capacity: 256,
        }
    }
}

impl TransportConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.slots_per_side < 2 {
            return Err("slots_per_side must be >= 2");
        }
        // One extra per side for the reserved sync slot
        if self.slots_per_side + 1 > MAX_SLOTS_PER_SIDE {
            return Err("slots_per_side exceeds the per-side queue capacity");
        }
        if FIRST_DATA_SLOT + 2 * (self.slots_per_side + 1) > MAX_SLOTS {
            return Err("slot count exceeds the usage record table");
        }
        if self.fragment_count == 0 || !self.fragment_count.is_multiple_of(2) {
            return Err("fragment_count must be even and > 0");
        }
        if self.max_services < 2 || self.max_services > 4096 {
            return Err("max_services must be 2-4096");
        }
        if self.completion_capacity == 0 {
            return Err("completion_capacity must be > 0");
        }
        Ok(())
    }

    /// Compute the region layout from this configuration.
    pub fn layout(&self) -> Result<TransportLayout, &'static str> {
        self.validate()?;
        Ok(TransportLayout::new(self))
    }
}

/// Computed placement of everything in the region.
#[derive(Debug, Clone)]
pub struct TransportLayout {
    pub config: TransportConfig,
    /// Index of the first data slot (sync slot of the master side)
    pub first_data_slot: usize,
    /// Total slots, control block included
    pub total_slots: usize,
    /// Byte offset of the fragment pool
    pub fragments_offset: usize,
    /// Required region size in bytes
    pub total_size: usize,
}

impl TransportLayout {
    fn new(config: &TransportConfig) -> Self {
        let total_slots = FIRST_DATA_SLOT + 2 * (config.slots_per_side + 1);
        let fragments_offset = total_slots * SLOT_SIZE;
        let total_size = fragments_offset + config.fragment_count * FRAGMENT_SIZE;
        Self {
            config: config.clone(),
            first_data_slot: FIRST_DATA_SLOT,
            total_slots,
            fragments_offset,
            total_size,
        }
    }
}

// ── region access ────────────────────────────────────────────────────────────

/// Checked view of a formatted region.
#[derive(Clone, Copy)]
pub struct SlotZeroRef {
    region: Region,
}

impl SlotZeroRef {
    /// Format a fresh region and return a view of it.
    ///
    /// The region must be zeroed and large enough for `layout`. Both halves
    /// are initialized here; each side attaches afterwards.
    pub fn init(region: Region, layout: &TransportLayout) -> Result<Self, &'static str> {
        if region.len() < layout.total_size {
            return Err("region too small for layout");
        }

        let this = Self { region };
        let zero = this.zero();
        let per_side = layout.config.slots_per_side as u32;

        zero.version.store(VERSION, Ordering::Relaxed);
        zero.version_min.store(VERSION_MIN, Ordering::Relaxed);
        zero.slot_zero_size
            .store(size_of::<SlotZero>() as u32, Ordering::Relaxed);
        zero.slot_size.store(SLOT_SIZE as u32, Ordering::Relaxed);
        zero.max_slots
            .store(layout.total_slots as u32, Ordering::Relaxed);
        zero.max_slots_per_side
            .store(per_side + 1, Ordering::Relaxed);
        zero.platform_data[0].store(layout.fragments_offset as u32, Ordering::Relaxed);
        zero.platform_data[1].store(layout.config.fragment_count as u32, Ordering::Relaxed);

        let master_sync = layout.first_data_slot as u32;
        zero.master
            .init(master_sync, master_sync + 1, master_sync + per_side);
        let slave_sync = master_sync + per_side + 1;
        zero.slave
            .init(slave_sync, slave_sync + 1, slave_sync + per_side);

        // Magic last: a concurrent attach must not see a half-built block
        zero.magic.store(MAGIC, Ordering::Release);

        debug!(
            total_slots = layout.total_slots,
            per_side,
            fragments = layout.config.fragment_count,
            "formatted slot zero"
        );
        Ok(this)
    }

    /// Attach to an already formatted region.
    pub fn attach(region: Region) -> Result<Self, &'static str> {
        if region.len() < size_of::<SlotZero>() {
            return Err("region smaller than the control block");
        }
        let this = Self { region };
        let zero = this.zero();
        if zero.magic.load(Ordering::Acquire) != MAGIC {
            return Err("invalid magic");
        }
        let version = zero.version.load(Ordering::Relaxed);
        if version < VERSION_MIN {
            return Err("peer protocol version too old");
        }
        if zero.version_min.load(Ordering::Relaxed) > VERSION {
            return Err("peer requires a newer protocol version");
        }
        if zero.slot_size.load(Ordering::Relaxed) != SLOT_SIZE as u32 {
            return Err("slot size mismatch");
        }
        Ok(this)
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    fn zero(&self) -> &SlotZero {
        // Validated (or freshly formatted) in the constructors
        unsafe { self.region.get::<SlotZero>(0) }
    }

    #[inline]
    pub fn side(&self, role: Role) -> &SharedState {
        match role {
            Role::Master => &self.zero().master,
            Role::Slave => &self.zero().slave,
        }
    }

    #[inline]
    pub fn slot_info(&self, slot: u32) -> &SlotInfo {
        &self.zero().slots[slot as usize]
    }

    #[inline]
    pub fn version(&self) -> u16 {
        self.zero().version.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fragments_base(&self) -> usize {
        self.zero().platform_data[0].load(Ordering::Relaxed) as usize
    }

    #[inline]
    pub fn fragment_count(&self) -> u32 {
        self.zero().platform_data[1].load(Ordering::Relaxed)
    }

    /// Byte offset of `within` inside the given slot.
    #[inline]
    pub fn slot_offset(slot: u32, within: usize) -> usize {
        debug_assert!(within < SLOT_SIZE);
        slot as usize * SLOT_SIZE + within
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vchiq_primitives::HeapRegion;

    #[test]
    fn default_config_layout() {
        let layout = TransportConfig::default().layout().unwrap();
        assert_eq!(layout.first_data_slot, FIRST_DATA_SLOT);
        assert_eq!(layout.total_slots, FIRST_DATA_SLOT + 2 * 17);
        assert!(layout.total_size > layout.fragments_offset);
    }

    #[test]
    fn config_rejects_bad_geometry() {
        let mut config = TransportConfig::default();
        config.slots_per_side = 1;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.slots_per_side = MAX_SLOTS_PER_SIDE;
        assert!(config.validate().is_err());

        let mut config = TransportConfig::default();
        config.fragment_count = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn init_partitions_slots_between_sides() {
        let layout = TransportConfig::default().layout().unwrap();
        let heap = HeapRegion::new_zeroed(layout.total_size);
        let zero = SlotZeroRef::init(heap.region(), &layout).unwrap();

        let master = zero.side(Role::Master);
        let slave = zero.side(Role::Slave);
        let per_side = layout.config.slots_per_side as u32;

        assert_eq!(master.slot_count(), per_side);
        assert_eq!(slave.slot_count(), per_side);
        // Ranges are disjoint, slave directly after master
        assert_eq!(
            slave.slot_sync.load(Ordering::Relaxed),
            master.slot_last.load(Ordering::Relaxed) + 1
        );
        // Queues come prefilled with each side's own slots
        assert_eq!(
            master.slot_queue_recycle.load(Ordering::Relaxed),
            per_side
        );
        assert_eq!(
            master.slot_queue[0].load(Ordering::Relaxed),
            master.slot_first.load(Ordering::Relaxed)
        );
    }

    #[test]
    fn attach_checks_magic_and_version() {
        let layout = TransportConfig::default().layout().unwrap();
        let heap = HeapRegion::new_zeroed(layout.total_size);

        assert!(SlotZeroRef::attach(heap.region()).is_err());

        SlotZeroRef::init(heap.region(), &layout).unwrap();
        let zero = SlotZeroRef::attach(heap.region()).unwrap();
        assert_eq!(zero.version(), VERSION);
        assert_eq!(zero.fragment_count(), layout.config.fragment_count as u32);
    }

    #[test]
    fn slot_retire_is_guarded_and_once_only() {
        let layout = TransportConfig::default().layout().unwrap();
        let heap = HeapRegion::new_zeroed(layout.total_size);
        let zero = SlotZeroRef::init(heap.region(), &layout).unwrap();

        let info = zero.slot_info(5);
        info.begin_use();
        info.add_ref();

        // Still being parsed and still referenced
        assert!(!info.try_retire());
        info.end_use();
        assert!(!info.try_retire());
        assert_eq!(info.drop_ref(), 0);
        assert!(info.try_retire());
        // Second retire of the same cycle must not fire
        assert!(!info.try_retire());
    }
}
