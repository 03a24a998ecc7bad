//! The transport context: TX slot allocator, message enqueue, RX drain and
//! routing, slot recycling, service lifecycle, and bulk submission.
//!
//! One `Transport` owns one side of a formatted region. There is no global
//! state; two transports over the same region form a full link, which is
//! how the tests run both ends in one process.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use vchiq_primitives::{CancelToken, HeapRegion, Region, Semaphore};

use crate::bulk::{BulkBuffer, BulkDirection, BulkMode, DmaMapper, IdentityMapper, PageList, PendingBulk};
use crate::doorbell::{Doorbell, LoopbackDoorbell};
use crate::error::TransportError;
use crate::fragments::FragmentPool;
use crate::layout::{
    MAX_MESSAGE_SIZE, Role, SLOT_MASK, SLOT_QUEUE_MASK, SLOT_SIZE, SharedState, SlotZeroRef,
    TransportConfig, VERSION, VERSION_MIN,
};
use crate::msg::{self, MAX_PORT, MessageType, MsgHeader, MsgId, MSG_HEADER_SIZE};
use crate::service::{
    Completion, CompletionPool, DeliveryMode, FourCc, PendingCompletion, QueuedMessage, Service,
    ServiceHandle, ServiceState, ServiceTable,
};
use crate::worker::{self, Workers};

/// How `queue_message` behaves when no TX slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Wait indefinitely (cancellable)
    Blocking,
    /// Retry on a short interval, then give up with `Timeout`
    Polled,
}

const TX_POLL_RETRIES: u32 = 50;
const TX_POLL_INTERVAL: Duration = Duration::from_millis(1);

struct TxState {
    /// Local byte stream position; mirrored into the shared half on publish
    tx_pos: u32,
    /// Slot currently being filled
    slot: Option<u32>,
}

struct RxState {
    /// Bytes of the peer stream consumed so far
    rx_pos: u32,
    /// Slot currently being parsed
    slot: Option<u32>,
}

struct RecycleState {
    /// Read cursor into the local slot queue; trails `slot_queue_recycle`
    queue_available: u32,
}

struct ConnectState {
    sent: bool,
    received: bool,
    announced: bool,
}

/// Static facts about an attached transport.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    pub version: u16,
    pub version_min: u16,
    pub slot_size: usize,
    pub max_message_size: usize,
    pub slots_per_side: u32,
    pub max_services: usize,
}

pub struct Transport {
    zero: SlotZeroRef,
    region: Region,
    role: Role,
    tx: Mutex<TxState>,
    rx: Mutex<RxState>,
    recycle: Mutex<RecycleState>,
    slot_available: Semaphore,
    cancel: CancelToken,
    services: Mutex<ServiceTable>,
    completions: CompletionPool,
    fragments: FragmentPool,
    dma: Arc<dyn DmaMapper>,
    doorbell: Box<dyn Doorbell>,
    connect: Mutex<ConnectState>,
    connect_cond: Condvar,
    max_services: usize,
}

impl Transport {
    /// Attach one side to a formatted region.
    ///
    /// `config` sizes the local pools only; the slot geometry comes from
    /// the control block itself.
    pub fn new(
        zero: SlotZeroRef,
        role: Role,
        config: &TransportConfig,
        doorbell: Box<dyn Doorbell>,
        dma: Arc<dyn DmaMapper>,
    ) -> Result<Arc<Transport>, TransportError> {
        if let Err(reason) = config.validate() {
            warn!(reason, "rejecting transport config");
            return Err(TransportError::InvalidParameter);
        }

        let slot_count = zero.side(role).slot_count();
        // Each side gets half the fragments; master takes the low half
        let fragment_count = zero.fragment_count();
        let half = fragment_count / 2;
        let (frag_first, frag_count) = match role {
            Role::Master => (0, half),
            Role::Slave => (half, fragment_count - half),
        };
        let fragments = FragmentPool::new(zero.region(), zero.fragments_base(), frag_first, frag_count);

        debug!(
            role = role.name(),
            slot_count, frag_count, "transport attached"
        );

        Ok(Arc::new(Transport {
            zero,
            region: zero.region(),
            role,
            tx: Mutex::new(TxState {
                tx_pos: 0,
                slot: None,
            }),
            rx: Mutex::new(RxState {
                rx_pos: 0,
                slot: None,
            }),
            recycle: Mutex::new(RecycleState {
                queue_available: slot_count,
            }),
            slot_available: Semaphore::new(slot_count),
            cancel: CancelToken::new(),
            services: Mutex::new(ServiceTable::new(config.max_services)),
            completions: CompletionPool::new(config.completion_capacity),
            fragments,
            dma,
            doorbell,
            connect: Mutex::new(ConnectState {
                sent: false,
                received: false,
                announced: false,
            }),
            connect_cond: Condvar::new(),
            max_services: config.max_services,
        }))
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    fn local(&self) -> &SharedState {
        self.zero.side(self.role)
    }

    #[inline]
    fn peer(&self) -> &SharedState {
        self.zero.side(self.role.peer())
    }

    pub(crate) fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub(crate) fn local_trigger(&self) -> &vchiq_primitives::RemoteEvent {
        &self.local().trigger
    }

    pub(crate) fn local_recycle(&self) -> &vchiq_primitives::RemoteEvent {
        &self.local().recycle
    }

    /// Static transport facts, version negotiation included.
    pub fn config(&self) -> TransportInfo {
        TransportInfo {
            version: VERSION,
            version_min: VERSION_MIN,
            slot_size: SLOT_SIZE,
            max_message_size: MAX_MESSAGE_SIZE,
            slots_per_side: self.local().slot_count(),
            max_services: self.max_services,
        }
    }

    // ── connection ───────────────────────────────────────────────────────────

    /// Announce this side to the peer. Connected state is reached once a
    /// CONNECT has been both sent and received.
    pub fn connect(&self) -> Result<(), TransportError> {
        let already = {
            let mut cs = self.connect.lock().unwrap();
            std::mem::replace(&mut cs.sent, true)
        };
        if !already {
            if let Err(e) = self.send_message(MessageType::Connect, 0, 0, &[], QueueMode::Blocking)
            {
                self.connect.lock().unwrap().sent = false;
                return Err(e);
            }
        }
        let mut cs = self.connect.lock().unwrap();
        self.maybe_announce(&mut cs);
        self.connect_cond.notify_all();
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        let cs = self.connect.lock().unwrap();
        cs.sent && cs.received
    }

    /// Block until the connection handshake completes.
    pub fn wait_connected(&self, timeout: Option<Duration>) -> Result<(), TransportError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut cs = self.connect.lock().unwrap();
        while !(cs.sent && cs.received) {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            cs = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    self.connect_cond
                        .wait_timeout(cs, deadline - now)
                        .unwrap()
                        .0
                }
                None => self.connect_cond.wait(cs).unwrap(),
            };
        }
        Ok(())
    }

    /// One-shot "link is up" publication.
    fn maybe_announce(&self, cs: &mut ConnectState) {
        if cs.sent && cs.received && !cs.announced {
            cs.announced = true;
            info!(role = self.role.name(), "transport connected");
        }
    }

    // ── tx path ──────────────────────────────────────────────────────────────

    /// Mirror `pos` into the shared half and ring the peer's trigger.
    ///
    /// `fetch_max` because publication happens outside the TX mutex: a later
    /// writer may publish first, and the position must never move backwards.
    fn publish(&self, pos: u32) {
        self.local().tx_pos.fetch_max(pos, Ordering::Release);
        if self.peer().trigger.signal() {
            self.doorbell.ring();
        }
    }

    /// Reserve `stride` bytes of slot space, padding out the current slot
    /// if the message would straddle its boundary.
    ///
    /// Runs under the TX mutex for the whole pad + cross + advance
    /// sequence; a failed wait leaves `tx_pos` consistent with everything
    /// already written (the pad, if any, is committed immediately).
    fn reserve_space(
        &self,
        tx: &mut TxState,
        stride: usize,
        mode: QueueMode,
    ) -> Result<(u32, usize), TransportError> {
        debug_assert!(stride <= SLOT_SIZE && stride.is_multiple_of(msg::MSG_ALIGNMENT));
        let mut pos = tx.tx_pos;

        let in_slot = pos as usize & SLOT_MASK;
        if in_slot != 0 && stride > SLOT_SIZE - in_slot {
            let space = SLOT_SIZE - in_slot;
            if let Some(slot) = tx.slot {
                let hdr: &MsgHeader =
                    unsafe { self.region.get(SlotZeroRef::slot_offset(slot, in_slot)) };
                hdr.write(
                    MsgId::new(MessageType::Padding, 0, 0),
                    (space - MSG_HEADER_SIZE) as u32,
                );
                trace!(slot, space, "padded slot remainder");
            }
            pos = pos.wrapping_add(space as u32);
            tx.tx_pos = pos;
        }

        if pos as usize & SLOT_MASK == 0 {
            if !self.slot_available.try_acquire() {
                // Flush before blocking, so the peer can drain what we have
                // and hand slots back
                self.publish(pos);
                debug!(pos, "tx waiting for a free slot");
                match mode {
                    QueueMode::Blocking => self.slot_available.acquire(None, &self.cancel)?,
                    QueueMode::Polled => self.poll_for_slot()?,
                }
            }
            let qidx = ((pos as usize / SLOT_SIZE) as u32) & SLOT_QUEUE_MASK;
            let slot = self.local().slot_queue[qidx as usize].load(Ordering::Acquire);
            tx.slot = Some(slot);
            trace!(slot, pos, "tx entered slot");
        }

        // pos is either 0 mod SLOT_SIZE (fresh slot above) or mid-slot, in
        // which case `slot` was set when the slot was entered
        let slot = match tx.slot {
            Some(slot) => slot,
            None => return Err(TransportError::InvalidParameter),
        };
        tx.tx_pos = pos.wrapping_add(stride as u32);
        Ok((slot, pos as usize & SLOT_MASK))
    }

    fn poll_for_slot(&self) -> Result<(), TransportError> {
        for _ in 0..TX_POLL_RETRIES {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            std::thread::sleep(TX_POLL_INTERVAL);
            if self.slot_available.try_acquire() {
                return Ok(());
            }
        }
        Err(TransportError::Timeout)
    }

    /// Frame and enqueue a raw message. Service payload traffic should go
    /// through `queue_message`; this entry point exists for connection
    /// control and protocol-level callers.
    pub fn send_message(
        &self,
        msg_type: MessageType,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        mode: QueueMode,
    ) -> Result<(), TransportError> {
        self.send_message_elements(msg_type, src_port, dst_port, &[payload], mode)
    }

    /// Gathering variant: elements are written back to back as one message.
    pub fn send_message_elements(
        &self,
        msg_type: MessageType,
        src_port: u16,
        dst_port: u16,
        elements: &[&[u8]],
        mode: QueueMode,
    ) -> Result<(), TransportError> {
        if src_port > MAX_PORT || dst_port > MAX_PORT {
            return Err(TransportError::InvalidParameter);
        }
        let size: usize = elements.iter().map(|e| e.len()).sum();
        if size > MAX_MESSAGE_SIZE {
            return Err(TransportError::InvalidParameter);
        }
        let stride = msg::stride(size);

        let mut tx = self.tx.lock().unwrap();
        let (slot, in_slot) = self.reserve_space(&mut tx, stride, mode)?;
        let base = SlotZeroRef::slot_offset(slot, in_slot);

        // Payload first; the header id store publishes within the slot
        let mut off = base + MSG_HEADER_SIZE;
        for element in elements {
            unsafe { self.region.write_bytes(off, element) };
            off += element.len();
        }
        let hdr: &MsgHeader = unsafe { self.region.get(base) };
        hdr.write(MsgId::new(msg_type, src_port, dst_port), size as u32);

        let pos = tx.tx_pos;
        drop(tx);
        self.publish(pos);
        trace!(
            ty = msg_type.name(),
            src = src_port,
            dst = dst_port,
            size,
            "queued message"
        );
        Ok(())
    }

    // ── rx path ──────────────────────────────────────────────────────────────

    /// Drain every message the peer has published. Normally called by the
    /// trigger worker; safe to call from a poll loop as well.
    pub(crate) fn process_rx(&self) {
        let mut rx = self.rx.lock().unwrap();
        loop {
            let published = self.peer().tx_pos.load(Ordering::Acquire);
            if rx.rx_pos == published {
                break;
            }
            while rx.rx_pos != published {
                self.parse_message(&mut rx, published);
            }
        }
    }

    fn parse_message(&self, rx: &mut RxState, published: u32) {
        let pos = rx.rx_pos;
        let slot = match rx.slot {
            Some(slot) => slot,
            None => {
                let qidx = ((pos as usize / SLOT_SIZE) as u32) & SLOT_QUEUE_MASK;
                let slot = self.peer().slot_queue[qidx as usize].load(Ordering::Acquire);
                self.zero.slot_info(slot).begin_use();
                rx.slot = Some(slot);
                trace!(slot, pos, "rx entered slot");
                slot
            }
        };

        let in_slot = pos as usize & SLOT_MASK;
        let base = SlotZeroRef::slot_offset(slot, in_slot);
        let hdr: &MsgHeader = unsafe { self.region.get(base) };
        let id = hdr.id();
        let size = hdr.size() as usize;

        let space = SLOT_SIZE - in_slot;
        if MSG_HEADER_SIZE + size > space {
            // A message may never straddle a slot. The header is corrupt;
            // skip to the boundary so the stream keeps moving, and do not
            // hand the garbage to a service
            error!(
                slot,
                pos, size, "corrupt message size; skipping to slot boundary"
            );
            // Never move past what the peer has published; resync there
            rx.rx_pos = if published.wrapping_sub(pos) < space as u32 {
                published
            } else {
                pos.wrapping_add(space as u32)
            };
            rx.slot = None;
            self.release_slot(slot, true);
            return;
        }

        self.route(id, slot, base + MSG_HEADER_SIZE, size);

        rx.rx_pos = pos.wrapping_add(msg::stride(size) as u32);
        if rx.rx_pos as usize & SLOT_MASK == 0 {
            rx.slot = None;
            self.release_slot(slot, true);
        }
    }

    fn route(&self, id: MsgId, slot: u32, payload_offset: usize, size: usize) {
        let msg_type = id.msg_type();
        trace!(
            ty = msg_type.name(),
            src = id.src_port(),
            dst = id.dst_port(),
            size,
            "rx message"
        );
        match msg_type {
            MessageType::Padding => {}
            MessageType::Connect => self.handle_connect(),
            MessageType::Open => {
                warn!(
                    src = id.src_port(),
                    "peer-initiated service open is not supported; dropping"
                );
            }
            MessageType::OpenAck => self.handle_openack(id, payload_offset, size),
            MessageType::Close => self.handle_close(id),
            MessageType::Data => self.handle_data(id, slot, payload_offset, size),
            MessageType::BulkRxDone => {
                self.handle_bulk_done(id, BulkDirection::Receive, payload_offset, size)
            }
            MessageType::BulkTxDone => {
                self.handle_bulk_done(id, BulkDirection::Transmit, payload_offset, size)
            }
            MessageType::BulkRx | MessageType::BulkTx => {
                // Data movement belongs to an external DMA engine; it answers
                // with the matching done message when the bytes have moved
                debug!(
                    ty = msg_type.name(),
                    src = id.src_port(),
                    "bulk request noted; completion is driven externally"
                );
            }
            other => {
                warn!(ty = other.to_wire(), "unhandled message type; skipping");
            }
        }
    }

    fn handle_connect(&self) {
        let mut cs = self.connect.lock().unwrap();
        cs.received = true;
        self.maybe_announce(&mut cs);
        drop(cs);
        self.connect_cond.notify_all();
    }

    fn handle_openack(&self, id: MsgId, payload_offset: usize, size: usize) {
        let Some(svc) = self.service_by_port(id.dst_port()) else {
            warn!(dst = id.dst_port(), "openack for unknown port; dropping");
            return;
        };
        let peer_version = (size >= 2).then(|| {
            let mut bytes = [0u8; 2];
            unsafe { self.region.read_bytes(payload_offset, &mut bytes) };
            u16::from_le_bytes(bytes)
        });

        let mut inner = svc.inner.lock().unwrap();
        if inner.state != ServiceState::Opening {
            warn!(
                port = svc.local_port,
                state = ?inner.state,
                "unexpected openack; dropping"
            );
            return;
        }
        inner.remote_port = Some(id.src_port());
        inner.peer_version = peer_version;
        inner.state = ServiceState::Open;
        debug!(
            port = svc.local_port,
            remote = id.src_port(),
            peer_version,
            "service open"
        );
        drop(inner);
        svc.cond.notify_all();
    }

    fn handle_close(&self, id: MsgId) {
        let Some(svc) = self.service_by_port(id.dst_port()) else {
            debug!(
                dst = id.dst_port(),
                "close for unknown port (already closed locally)"
            );
            return;
        };
        let state = svc.state();
        match state {
            ServiceState::Opening | ServiceState::Open => {
                debug!(port = svc.local_port, "peer closed service");
                {
                    let mut inner = svc.inner.lock().unwrap();
                    inner.state = ServiceState::Closing;
                }
                svc.cond.notify_all();
                self.purge_service(&svc);
                svc.inner.lock().unwrap().state = ServiceState::Closed;
                svc.cond.notify_all();
            }
            ServiceState::Closing => {
                svc.inner.lock().unwrap().state = ServiceState::Closed;
                svc.cond.notify_all();
            }
            ServiceState::Closed => {}
        }
    }

    fn handle_data(&self, id: MsgId, slot: u32, payload_offset: usize, size: usize) {
        let Some(svc) = self.service_by_port(id.dst_port()) else {
            debug!(dst = id.dst_port(), "data for unknown port; dropping");
            return;
        };
        let mut inner = svc.inner.lock().unwrap();
        if inner.state != ServiceState::Open {
            debug!(
                port = svc.local_port,
                state = ?inner.state,
                "data for non-open service; dropping"
            );
            return;
        }
        if size == 0 {
            // Keep-alive
            trace!(port = svc.local_port, "keep-alive");
            return;
        }

        let message = QueuedMessage {
            msg_type: MessageType::Data,
            src_port: id.src_port(),
            slot,
            payload_offset,
            size: size as u32,
        };
        // Both delivery modes charge the bounded pool; a flooding peer gets
        // its messages dropped, never an unbounded queue
        if !self.completions.try_take() {
            warn!(
                port = svc.local_port,
                "completion pool exhausted; dropping message"
            );
            return;
        }
        self.zero.slot_info(slot).add_ref();
        match svc.delivery {
            DeliveryMode::Dequeue => inner.dequeue.push_back(message),
            DeliveryMode::Callback => inner.pending.push_back(PendingCompletion::Message(message)),
        }
        drop(inner);
        svc.cond.notify_all();
    }

    fn handle_bulk_done(
        &self,
        id: MsgId,
        direction: BulkDirection,
        payload_offset: usize,
        size: usize,
    ) {
        let Some(svc) = self.service_by_port(id.dst_port()) else {
            warn!(dst = id.dst_port(), "bulk completion for unknown port");
            return;
        };
        let actual = if size >= 4 {
            let mut bytes = [0u8; 4];
            unsafe { self.region.read_bytes(payload_offset, &mut bytes) };
            u32::from_le_bytes(bytes)
        } else {
            0
        };

        let mut inner = svc.inner.lock().unwrap();
        let popped = match direction {
            BulkDirection::Transmit => inner.bulk_tx.pop_front(),
            BulkDirection::Receive => inner.bulk_rx.pop_front(),
        };
        let Some(pending) = popped else {
            warn!(
                port = svc.local_port,
                dir = direction.name(),
                "bulk completion with no transfer outstanding"
            );
            return;
        };
        match direction {
            BulkDirection::Transmit => inner.tx_completed += 1,
            BulkDirection::Receive => inner.rx_completed += 1,
        }
        debug!(
            port = svc.local_port,
            dir = direction.name(),
            token = pending.token,
            actual,
            "bulk complete"
        );

        if pending.mode == BulkMode::Callback {
            if self.completions.try_take() {
                inner.pending.push_back(PendingCompletion::BulkDone {
                    direction,
                    token: pending.token,
                    actual,
                });
            } else {
                warn!(
                    port = svc.local_port,
                    "completion pool exhausted; dropping bulk completion"
                );
            }
        }
        drop(inner);
        svc.cond.notify_all();

        if let Some(sg) = pending.sg {
            self.dma.release_sg_list(sg);
        }
        if let Some(fragment) = pending.fragment {
            self.fragments.release(fragment);
        }
    }

    // ── slot recycling ───────────────────────────────────────────────────────

    /// Hand a fully-consumed peer slot back through the peer's slot queue.
    ///
    /// Runs under the recycle mutex; `try_retire` fires at most once per
    /// use cycle, so a race between the parser leaving the slot and the
    /// last message reference dropping cannot double-queue it.
    fn release_slot(&self, slot: u32, finished_parse: bool) {
        let info = self.zero.slot_info(slot);
        let _guard = self.recycle.lock().unwrap();
        if finished_parse {
            info.end_use();
        }
        if !info.try_retire() {
            return;
        }

        let peer = self.peer();
        let cursor = peer.slot_queue_recycle.load(Ordering::Relaxed);
        peer.slot_queue[(cursor & SLOT_QUEUE_MASK) as usize].store(slot, Ordering::Relaxed);
        peer.slot_queue_recycle
            .store(cursor.wrapping_add(1), Ordering::Release);
        trace!(slot, cursor, "recycled slot to peer");
        if peer.recycle.signal() {
            self.doorbell.ring();
        }
    }

    /// Drop one message reference; retires the slot if it was the last and
    /// the parser has moved on.
    fn unref_message(&self, slot: u32) {
        if self.zero.slot_info(slot).drop_ref() == 0 {
            self.release_slot(slot, false);
        }
    }

    /// Turn slots the peer handed back into TX permits. Normally called by
    /// the recycle worker.
    pub(crate) fn process_recycle(&self) {
        let mut rec = self.recycle.lock().unwrap();
        let written = self.local().slot_queue_recycle.load(Ordering::Acquire);
        while rec.queue_available != written {
            rec.queue_available = rec.queue_available.wrapping_add(1);
            self.slot_available.post();
        }
    }

    /// Single-threaded alternative to the worker pair: drain both queues
    /// once.
    pub fn poll(&self) {
        self.process_rx();
        self.process_recycle();
    }

    // ── services ─────────────────────────────────────────────────────────────

    /// Resolve a handle, rejecting stale ones.
    pub fn service(&self, handle: ServiceHandle) -> Result<Arc<Service>, TransportError> {
        self.services
            .lock()
            .unwrap()
            .get(handle)
            .ok_or(TransportError::NotFound)
    }

    fn service_by_port(&self, port: u16) -> Option<Arc<Service>> {
        self.services.lock().unwrap().by_port(port)
    }

    /// Bind a port and send OPEN. The service is usable once the peer's
    /// OPENACK arrives; see [`Transport::await_open`].
    pub fn open_service(
        &self,
        fourcc: FourCc,
        version: u16,
        delivery: DeliveryMode,
    ) -> Result<ServiceHandle, TransportError> {
        if !self.is_connected() {
            debug!("open_service before connect");
            return Err(TransportError::InvalidParameter);
        }
        let svc = self
            .services
            .lock()
            .unwrap()
            .alloc(fourcc, version, delivery)?;
        let handle = svc.handle();

        // {fourcc, client id, version, version_min}
        let mut payload = [0u8; 12];
        payload[..4].copy_from_slice(&fourcc.0.to_le_bytes());
        payload[4..8].copy_from_slice(&(svc.local_port as u32).to_le_bytes());
        payload[8..10].copy_from_slice(&version.to_le_bytes());
        payload[10..12].copy_from_slice(&VERSION_MIN.to_le_bytes());

        match self.send_message(
            MessageType::Open,
            svc.local_port,
            0,
            &payload,
            QueueMode::Blocking,
        ) {
            Ok(()) => {
                debug!(port = svc.local_port, fourcc = %fourcc, "service opening");
                Ok(handle)
            }
            Err(e) => {
                self.services.lock().unwrap().remove(handle);
                Err(e)
            }
        }
    }

    /// Block until the peer acknowledges the open.
    pub fn await_open(
        &self,
        handle: ServiceHandle,
        timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let svc = self.service(handle)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut inner = svc.inner.lock().unwrap();
        loop {
            match inner.state {
                ServiceState::Open => return Ok(()),
                ServiceState::Closed => return Err(TransportError::NotFound),
                ServiceState::Opening | ServiceState::Closing => {}
            }
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    svc.cond.wait_timeout(inner, deadline - now).unwrap().0
                }
                None => svc.cond.wait(inner).unwrap(),
            };
        }
    }

    /// Send a payload message on an open service.
    pub fn queue_message(
        &self,
        handle: ServiceHandle,
        payload: &[u8],
        mode: QueueMode,
    ) -> Result<(), TransportError> {
        self.queue_message_elements(handle, &[payload], mode)
    }

    /// Gathering variant of [`Transport::queue_message`].
    pub fn queue_message_elements(
        &self,
        handle: ServiceHandle,
        elements: &[&[u8]],
        mode: QueueMode,
    ) -> Result<(), TransportError> {
        let svc = self.service(handle)?;
        let remote = {
            let inner = svc.inner.lock().unwrap();
            if inner.state != ServiceState::Open {
                return Err(TransportError::InvalidParameter);
            }
            match inner.remote_port {
                Some(port) => port,
                None => return Err(TransportError::InvalidParameter),
            }
        };
        self.send_message_elements(MessageType::Data, svc.local_port, remote, elements, mode)
    }

    /// Batch-collect completions, blocking until at least one is present.
    /// Returns a partial batch as success; `max` bounds the batch size.
    pub fn await_completion(
        &self,
        handle: ServiceHandle,
        max: usize,
        timeout: Option<Duration>,
    ) -> Result<Vec<Completion>, TransportError> {
        if max == 0 {
            return Err(TransportError::InvalidParameter);
        }
        let svc = self.service(handle)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut inner = svc.inner.lock().unwrap();
        while inner.pending.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if inner.state == ServiceState::Closed {
                return Err(TransportError::NotFound);
            }
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(TransportError::Timeout);
                    }
                    svc.cond.wait_timeout(inner, deadline - now).unwrap().0
                }
                None => svc.cond.wait(inner).unwrap(),
            };
        }

        let mut raw = Vec::new();
        while raw.len() < max {
            match inner.pending.pop_front() {
                Some(pc) => raw.push(pc),
                None => break,
            }
        }
        drop(inner);

        // Copy payloads and drop slot references outside the service lock
        let mut batch = Vec::with_capacity(raw.len());
        for pc in raw {
            match pc {
                PendingCompletion::Message(qm) => {
                    let mut payload = vec![0u8; qm.size as usize];
                    unsafe { self.region.read_bytes(qm.payload_offset, &mut payload) };
                    self.unref_message(qm.slot);
                    self.completions.put();
                    batch.push(Completion::Message {
                        msg_type: qm.msg_type,
                        src_port: qm.src_port,
                        payload,
                    });
                }
                PendingCompletion::BulkDone {
                    direction,
                    token,
                    actual,
                } => {
                    self.completions.put();
                    batch.push(Completion::BulkDone {
                        direction,
                        token,
                        actual,
                    });
                }
            }
        }
        Ok(batch)
    }

    /// Pull one message off a dequeue-mode service. Non-blocking callers get
    /// `NoMoreEntries` on an empty queue; blocking callers wait for the next
    /// delivery, the service closing, or cancellation.
    pub fn dequeue_message(
        &self,
        handle: ServiceHandle,
        blocking: bool,
    ) -> Result<Vec<u8>, TransportError> {
        let svc = self.service(handle)?;
        if svc.delivery != DeliveryMode::Dequeue {
            return Err(TransportError::InvalidParameter);
        }

        let mut inner = svc.inner.lock().unwrap();
        let qm = loop {
            if let Some(qm) = inner.dequeue.pop_front() {
                break qm;
            }
            if !blocking {
                return Err(TransportError::NoMoreEntries);
            }
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            if matches!(inner.state, ServiceState::Closing | ServiceState::Closed) {
                return Err(TransportError::NotFound);
            }
            inner = svc.cond.wait(inner).unwrap();
        };
        drop(inner);

        let mut payload = vec![0u8; qm.size as usize];
        unsafe { self.region.read_bytes(qm.payload_offset, &mut payload) };
        self.unref_message(qm.slot);
        self.completions.put();
        Ok(payload)
    }

    /// Close a service: purge its queues, send a best-effort CLOSE, release
    /// the port. Completes locally; no peer reply is required.
    pub fn close_service(&self, handle: ServiceHandle) -> Result<(), TransportError> {
        let svc = self.service(handle)?;
        let (previous, remote) = {
            let mut inner = svc.inner.lock().unwrap();
            let previous = inner.state;
            if previous != ServiceState::Closed {
                inner.state = ServiceState::Closing;
            }
            (previous, inner.remote_port)
        };
        svc.cond.notify_all();

        if matches!(previous, ServiceState::Opening | ServiceState::Open) {
            let dst = remote.unwrap_or(0);
            if let Err(e) = self.send_message(
                MessageType::Close,
                svc.local_port,
                dst,
                &[],
                QueueMode::Blocking,
            ) {
                debug!(error = %e, port = svc.local_port, "close not sent; closing locally");
            }
        }

        self.purge_service(&svc);
        svc.inner.lock().unwrap().state = ServiceState::Closed;
        svc.cond.notify_all();

        // The port is released only after every queued resource is gone
        self.services.lock().unwrap().remove(handle);
        debug!(port = handle.port, "service closed");
        Ok(())
    }

    /// Tear a service down. Same path as [`Transport::close_service`]; kept
    /// as a separate entry point for callers that treat remove as final.
    pub fn remove_service(&self, handle: ServiceHandle) -> Result<(), TransportError> {
        self.close_service(handle)
    }

    /// Drop everything queued on a service: slot references, completion
    /// nodes, and un-completed bulk transfers (with their DMA resources).
    fn purge_service(&self, svc: &Service) {
        let (pending, dequeue, bulks) = {
            let mut inner = svc.inner.lock().unwrap();
            let pending = std::mem::take(&mut inner.pending);
            let dequeue = std::mem::take(&mut inner.dequeue);
            let mut bulks: Vec<PendingBulk> = inner.bulk_tx.drain(..).collect();
            bulks.extend(inner.bulk_rx.drain(..));
            (pending, dequeue, bulks)
        };

        for pc in pending {
            match pc {
                PendingCompletion::Message(qm) => {
                    self.unref_message(qm.slot);
                    self.completions.put();
                }
                PendingCompletion::BulkDone { .. } => self.completions.put(),
            }
        }
        for qm in dequeue {
            self.unref_message(qm.slot);
            self.completions.put();
        }
        for pending in bulks {
            warn!(
                port = svc.local_port,
                dir = pending.direction.name(),
                token = pending.token,
                "unwinding un-completed bulk transfer"
            );
            if let Some(sg) = pending.sg {
                self.dma.release_sg_list(sg);
            }
            if let Some(fragment) = pending.fragment {
                self.fragments.release(fragment);
            }
        }
    }

    // ── bulk ─────────────────────────────────────────────────────────────────

    /// Submit a bulk transfer. Pins the buffer, writes a page list into a
    /// fragment, enqueues the transfer on the per-direction FIFO, and
    /// announces it to the peer. Any failure unwinds completely.
    pub fn queue_bulk(
        &self,
        handle: ServiceHandle,
        direction: BulkDirection,
        buffer: BulkBuffer,
        token: u64,
        mode: BulkMode,
    ) -> Result<(), TransportError> {
        let svc = self.service(handle)?;
        let remote = {
            let inner = svc.inner.lock().unwrap();
            if inner.state != ServiceState::Open {
                return Err(TransportError::InvalidParameter);
            }
            match inner.remote_port {
                Some(port) => port,
                None => return Err(TransportError::InvalidParameter),
            }
        };

        let dir_idx = match direction {
            BulkDirection::Transmit => 0,
            BulkDirection::Receive => 1,
        };

        let my_pos = {
            // Serialized per direction so an unwound entry is always the tail
            let _submit = svc.bulk_submit[dir_idx].lock().unwrap();

            let sg = self.dma.build_sg_list(buffer)?;
            let total_len = sg.total_len;
            let fragment = match self.fragments.claim() {
                Ok(fragment) => fragment,
                Err(e) => {
                    self.dma.release_sg_list(sg);
                    return Err(e);
                }
            };
            let page_list = match PageList::write(self.region, &fragment, &sg) {
                Ok(page_list) => page_list,
                Err(e) => {
                    self.dma.release_sg_list(sg);
                    self.fragments.release(fragment);
                    return Err(e);
                }
            };

            let my_pos = {
                let mut inner = svc.inner.lock().unwrap();
                if inner.state != ServiceState::Open {
                    drop(inner);
                    self.dma.release_sg_list(sg);
                    self.fragments.release(fragment);
                    return Err(TransportError::InvalidParameter);
                }
                let entry = PendingBulk {
                    direction,
                    mode,
                    token,
                    size: total_len,
                    sg: Some(sg),
                    fragment: Some(fragment),
                };
                match direction {
                    BulkDirection::Transmit => {
                        inner.bulk_tx.push_back(entry);
                        inner.tx_submitted += 1;
                        inner.tx_submitted - 1
                    }
                    BulkDirection::Receive => {
                        inner.bulk_rx.push_back(entry);
                        inner.rx_submitted += 1;
                        inner.rx_submitted - 1
                    }
                }
            };

            if let Err(e) = self.send_message(
                direction.msg_type(),
                svc.local_port,
                remote,
                &page_list.to_payload(),
                QueueMode::Blocking,
            ) {
                // Our entry is still the tail; take it back out
                let popped = {
                    let mut inner = svc.inner.lock().unwrap();
                    match direction {
                        BulkDirection::Transmit => {
                            inner.tx_submitted -= 1;
                            inner.bulk_tx.pop_back()
                        }
                        BulkDirection::Receive => {
                            inner.rx_submitted -= 1;
                            inner.bulk_rx.pop_back()
                        }
                    }
                };
                if let Some(pending) = popped {
                    if let Some(sg) = pending.sg {
                        self.dma.release_sg_list(sg);
                    }
                    if let Some(fragment) = pending.fragment {
                        self.fragments.release(fragment);
                    }
                }
                return Err(e);
            }

            debug!(
                port = svc.local_port,
                dir = direction.name(),
                token,
                len = total_len,
                "bulk submitted"
            );
            my_pos
        };

        if mode == BulkMode::Blocking {
            self.wait_bulk_complete(&svc, direction, my_pos)?;
        }
        Ok(())
    }

    fn wait_bulk_complete(
        &self,
        svc: &Service,
        direction: BulkDirection,
        pos: u64,
    ) -> Result<(), TransportError> {
        let mut inner = svc.inner.lock().unwrap();
        loop {
            let completed = match direction {
                BulkDirection::Transmit => inner.tx_completed,
                BulkDirection::Receive => inner.rx_completed,
            };
            if completed > pos {
                return Ok(());
            }
            if self.cancel.is_cancelled()
                || matches!(inner.state, ServiceState::Closing | ServiceState::Closed)
            {
                return Err(TransportError::Cancelled);
            }
            inner = svc.cond.wait(inner).unwrap();
        }
    }

    /// Free bulk fragments on this side; for diagnostics and tests.
    pub fn fragments_free(&self) -> u32 {
        self.fragments.free_count()
    }

    // ── teardown ─────────────────────────────────────────────────────────────

    /// Cancel every blocked caller and worker. Idempotent.
    pub fn shutdown(&self) {
        info!(role = self.role.name(), "transport shutting down");
        self.cancel.cancel();
        self.slot_available.wake_all();
        self.local().trigger.wake();
        self.local().recycle.wake();
        self.connect_cond.notify_all();
        for svc in self.services.lock().unwrap().iter() {
            svc.cond.notify_all();
        }
    }
}

// ── linked pair ──────────────────────────────────────────────────────────────

/// Both ends of a transport over one heap-backed region, with their worker
/// threads running. This is the self-contained form used by tests and
/// single-process setups.
pub struct LinkedPair {
    pub master: Arc<Transport>,
    pub slave: Arc<Transport>,
    pub master_dma: Arc<IdentityMapper>,
    pub slave_dma: Arc<IdentityMapper>,
    workers: Vec<Workers>,
    _backing: HeapRegion,
}

impl LinkedPair {
    /// Cancel everything and join the worker threads.
    pub fn shutdown(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        self.master.shutdown();
        self.slave.shutdown();
        for workers in self.workers.drain(..) {
            workers.join();
        }
    }
}

impl Drop for LinkedPair {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Format a fresh heap region and bring up both sides with loopback
/// doorbells and identity DMA mappers.
pub fn create_linked_pair(config: &TransportConfig) -> Result<LinkedPair, TransportError> {
    let layout = match config.layout() {
        Ok(layout) => layout,
        Err(reason) => {
            warn!(reason, "invalid transport config");
            return Err(TransportError::InvalidParameter);
        }
    };
    let backing = HeapRegion::new_zeroed(layout.total_size);
    let zero = match SlotZeroRef::init(backing.region(), &layout) {
        Ok(zero) => zero,
        Err(reason) => {
            warn!(reason, "failed to format region");
            return Err(TransportError::InvalidParameter);
        }
    };

    let master_dma = Arc::new(IdentityMapper::new());
    let slave_dma = Arc::new(IdentityMapper::new());

    let master = Transport::new(
        zero,
        Role::Master,
        config,
        Box::new(LoopbackDoorbell::new(zero, Role::Slave)),
        master_dma.clone(),
    )?;
    let slave = Transport::new(
        zero,
        Role::Slave,
        config,
        Box::new(LoopbackDoorbell::new(zero, Role::Master)),
        slave_dma.clone(),
    )?;

    let workers = vec![
        worker::spawn(master.clone()).map_err(|_| TransportError::OutOfMemory)?,
        worker::spawn(slave.clone()).map_err(|_| TransportError::OutOfMemory)?,
    ];

    Ok(LinkedPair {
        master,
        slave,
        master_dma,
        slave_dma,
        workers,
        _backing: backing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doorbell::NullDoorbell;

    fn formatted() -> (HeapRegion, SlotZeroRef) {
        let layout = TransportConfig::default().layout().unwrap();
        let backing = HeapRegion::new_zeroed(layout.total_size);
        let zero = SlotZeroRef::init(backing.region(), &layout).unwrap();
        (backing, zero)
    }

    fn attach(zero: SlotZeroRef, role: Role) -> Arc<Transport> {
        Transport::new(
            zero,
            role,
            &TransportConfig::default(),
            Box::new(NullDoorbell),
            Arc::new(IdentityMapper::new()),
        )
        .unwrap()
    }

    /// A message leaving less than one stride of slot space forces exactly
    /// one padding record; the next message starts at the first byte of the
    /// next slot.
    #[test]
    fn boundary_pad_is_exactly_one_record() {
        let (_backing, zero) = formatted();
        let slave = attach(zero, Role::Slave);

        // stride 4088 of 4096: 8 bytes remain, which only fits padding
        let filler = vec![0u8; SLOT_SIZE - 16];
        slave
            .send_message(MessageType::Data, 1, 1, &filler, QueueMode::Blocking)
            .unwrap();
        assert_eq!(
            zero.side(Role::Slave).tx_pos.load(Ordering::Acquire),
            (SLOT_SIZE - 8) as u32
        );

        slave
            .send_message(MessageType::Data, 1, 1, &[7u8; 8], QueueMode::Blocking)
            .unwrap();
        // 8 pad bytes close the first slot; the 16-byte stride lands at the
        // top of the second
        assert_eq!(
            zero.side(Role::Slave).tx_pos.load(Ordering::Acquire),
            (SLOT_SIZE + 16) as u32
        );
    }

    /// A header claiming a size that cannot fit its slot is skipped without
    /// the parser running past the peer's published position.
    #[test]
    fn corrupt_header_skip_clamps_to_published() {
        let (backing, zero) = formatted();
        let master = attach(zero, Role::Master);

        // Forge the slave's first message with an impossible size
        let region = backing.region();
        let slot = zero.side(Role::Slave).slot_queue[0].load(Ordering::Acquire);
        let hdr: &MsgHeader = unsafe { region.get(SlotZeroRef::slot_offset(slot, 0)) };
        hdr.write(MsgId::new(MessageType::Data, 1, 1), SLOT_SIZE as u32);
        zero.side(Role::Slave).tx_pos.store(64, Ordering::Release);

        master.process_rx();
        assert_eq!(master.rx.lock().unwrap().rx_pos, 64);
    }
}
