//! Logical services multiplexed over the transport.
//!
//! A service binds a local port to a fourcc-named endpoint on the peer.
//! Everything the router hands a service — payload messages and bulk
//! completions — flows through bounded queues owned by the service and is
//! drained by the caller, either as completion batches or through the
//! pull-style dequeue FIFO.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::bulk::{BulkDirection, PendingBulk};
use crate::error::TransportError;
use crate::msg::{MAX_PORT, MessageType};

/// Four-character service name, as carried in OPEN payloads.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self(u32::from_le_bytes(*bytes))
    }
}

impl std::fmt::Display for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.0.to_le_bytes() {
            let c = if b.is_ascii_graphic() { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Service lifecycle. The free state is represented by the port table slot
/// being empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// OPEN sent, waiting for the peer's OPENACK
    Opening,
    Open,
    /// Local close in progress
    Closing,
    /// Terminal; the handle only answers to close/remove
    Closed,
}

/// How inbound payload messages reach the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Batched through `await_completion`
    Callback,
    /// Pulled one at a time through `dequeue_message`
    Dequeue,
}

/// Opaque service reference. Stale handles (the port was reused) are
/// detected through the nonce and answered with `NotFound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceHandle {
    pub(crate) port: u16,
    pub(crate) nonce: u32,
}

impl ServiceHandle {
    /// The local port this handle was minted for.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A message still living in slot memory. Holds one slot reference, dropped
/// when the payload is copied out or the queue is purged.
#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub msg_type: MessageType,
    pub src_port: u16,
    pub slot: u32,
    /// Absolute region offset of the payload bytes
    pub payload_offset: usize,
    pub size: u32,
}

/// Router-side completion record, before payload extraction.
#[derive(Debug)]
pub(crate) enum PendingCompletion {
    Message(QueuedMessage),
    BulkDone {
        direction: BulkDirection,
        token: u64,
        actual: u32,
    },
}

/// What `await_completion` hands back.
#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    Message {
        msg_type: MessageType,
        src_port: u16,
        payload: Vec<u8>,
    },
    BulkDone {
        direction: BulkDirection,
        token: u64,
        actual: u32,
    },
}

#[derive(Debug)]
pub(crate) struct ServiceInner {
    pub state: ServiceState,
    pub remote_port: Option<u16>,
    pub peer_version: Option<u16>,
    pub pending: VecDeque<PendingCompletion>,
    pub dequeue: VecDeque<QueuedMessage>,
    pub bulk_tx: VecDeque<PendingBulk>,
    pub bulk_rx: VecDeque<PendingBulk>,
    /// Positional counters for blocking-mode bulk waits
    pub tx_submitted: u64,
    pub tx_completed: u64,
    pub rx_submitted: u64,
    pub rx_completed: u64,
}

#[derive(Debug)]
pub struct Service {
    pub(crate) local_port: u16,
    pub(crate) fourcc: FourCc,
    pub(crate) version: u16,
    pub(crate) delivery: DeliveryMode,
    pub(crate) nonce: u32,
    pub(crate) inner: Mutex<ServiceInner>,
    pub(crate) cond: Condvar,
    /// Serializes bulk submissions per direction, so an unwound submission
    /// is always the FIFO tail
    pub(crate) bulk_submit: [Mutex<()>; 2],
}

impl Service {
    pub(crate) fn new(
        local_port: u16,
        fourcc: FourCc,
        version: u16,
        delivery: DeliveryMode,
        nonce: u32,
    ) -> Self {
        Self {
            local_port,
            fourcc,
            version,
            delivery,
            nonce,
            inner: Mutex::new(ServiceInner {
                state: ServiceState::Opening,
                remote_port: None,
                peer_version: None,
                pending: VecDeque::new(),
                dequeue: VecDeque::new(),
                bulk_tx: VecDeque::new(),
                bulk_rx: VecDeque::new(),
                tx_submitted: 0,
                tx_completed: 0,
                rx_submitted: 0,
                rx_completed: 0,
            }),
            cond: Condvar::new(),
            bulk_submit: [Mutex::new(()), Mutex::new(())],
        }
    }

    pub(crate) fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            port: self.local_port,
            nonce: self.nonce,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lock().unwrap().state
    }

    /// Version the peer reported in its OPENACK, once open.
    pub fn peer_version(&self) -> Option<u16> {
        self.inner.lock().unwrap().peer_version
    }
}

/// Port table. Index is the port number; port 0 stays empty, reserved for
/// transport control messages.
pub(crate) struct ServiceTable {
    entries: Vec<Option<Arc<Service>>>,
    next_nonce: u32,
}

impl ServiceTable {
    pub fn new(max_services: usize) -> Self {
        let mut entries = Vec::new();
        entries.resize_with(max_services, || None);
        Self {
            entries,
            next_nonce: 1,
        }
    }

    /// Bind the lowest free port to a new service.
    pub fn alloc(
        &mut self,
        fourcc: FourCc,
        version: u16,
        delivery: DeliveryMode,
    ) -> Result<Arc<Service>, TransportError> {
        let port = self.entries[1..]
            .iter()
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(TransportError::OutOfMemory)?;
        debug_assert!(port <= MAX_PORT as usize);

        let nonce = self.next_nonce;
        self.next_nonce = self.next_nonce.wrapping_add(1).max(1);

        let service = Arc::new(Service::new(port as u16, fourcc, version, delivery, nonce));
        self.entries[port] = Some(service.clone());
        Ok(service)
    }

    pub fn get(&self, handle: ServiceHandle) -> Option<Arc<Service>> {
        let entry = self.entries.get(handle.port as usize)?.as_ref()?;
        (entry.nonce == handle.nonce).then(|| entry.clone())
    }

    pub fn by_port(&self, port: u16) -> Option<Arc<Service>> {
        self.entries.get(port as usize)?.clone()
    }

    /// Unbind the port. The service itself lives on while references exist.
    pub fn remove(&mut self, handle: ServiceHandle) -> Option<Arc<Service>> {
        let entry = self.entries.get_mut(handle.port as usize)?;
        if entry.as_ref().is_some_and(|s| s.nonce == handle.nonce) {
            entry.take()
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Service>> {
        self.entries.iter().flatten()
    }
}

/// Bounded pool of completion nodes, shared by every service of a
/// transport. When it runs dry the router drops completions rather than
/// growing without bound.
pub(crate) struct CompletionPool {
    free: AtomicU32,
}

impl CompletionPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            free: AtomicU32::new(capacity as u32),
        }
    }

    pub fn try_take(&self) -> bool {
        let mut cur = self.free.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self
                .free
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn put(&self) {
        self.free.fetch_add(1, Ordering::AcqRel);
    }

    #[cfg(test)]
    pub fn free(&self) -> u32 {
        self.free.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_displays_ascii() {
        let fourcc = FourCc::from_bytes(b"echo");
        assert_eq!(fourcc.to_string(), "echo");
        let odd = FourCc(0x0102_0304);
        assert_eq!(odd.to_string(), "????");
    }

    #[test]
    fn table_allocates_from_port_one() {
        let mut table = ServiceTable::new(8);
        let a = table
            .alloc(FourCc::from_bytes(b"svca"), 1, DeliveryMode::Callback)
            .unwrap();
        let b = table
            .alloc(FourCc::from_bytes(b"svcb"), 1, DeliveryMode::Callback)
            .unwrap();
        assert_eq!(a.local_port, 1);
        assert_eq!(b.local_port, 2);
        assert!(table.by_port(0).is_none());
    }

    #[test]
    fn table_exhaustion_is_out_of_memory() {
        let mut table = ServiceTable::new(3);
        table
            .alloc(FourCc::from_bytes(b"one\0"), 1, DeliveryMode::Callback)
            .unwrap();
        table
            .alloc(FourCc::from_bytes(b"two\0"), 1, DeliveryMode::Callback)
            .unwrap();
        assert_eq!(
            table
                .alloc(FourCc::from_bytes(b"tri\0"), 1, DeliveryMode::Callback)
                .unwrap_err(),
            TransportError::OutOfMemory
        );
    }

    #[test]
    fn stale_handles_miss_after_port_reuse() {
        let mut table = ServiceTable::new(4);
        let first = table
            .alloc(FourCc::from_bytes(b"svca"), 1, DeliveryMode::Callback)
            .unwrap();
        let stale = first.handle();
        table.remove(stale).unwrap();

        let second = table
            .alloc(FourCc::from_bytes(b"svcb"), 1, DeliveryMode::Callback)
            .unwrap();
        assert_eq!(second.local_port, 1, "port is reused");
        assert!(table.get(stale).is_none(), "old nonce no longer resolves");
        assert!(table.get(second.handle()).is_some());
    }

    #[test]
    fn completion_pool_bounds_takes() {
        let pool = CompletionPool::new(2);
        assert!(pool.try_take());
        assert!(pool.try_take());
        assert!(!pool.try_take());
        pool.put();
        assert!(pool.try_take());
        assert_eq!(pool.free(), 0);
    }
}
