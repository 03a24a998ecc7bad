//! Message framing: id packing, type constants, stride math, headers.
//!
//! Every message starts with an 8-byte header ({id, size}) and is padded out
//! to an 8-byte stride. Messages never straddle a slot boundary; the TX
//! allocator emits a padding message to burn the remainder of a slot that
//! cannot fit the next message.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, Ordering};

/// Message type constants, as carried in the top byte of the message id.
pub mod msg_type {
    /// Fills unusable space at the end of a slot
    pub const PADDING: u8 = 0;
    /// Connection handshake, addressed port 0 -> port 0
    pub const CONNECT: u8 = 1;
    /// Service open request (carries fourcc + version range)
    pub const OPEN: u8 = 2;
    /// Service open acknowledgement (carries the peer's version)
    pub const OPENACK: u8 = 3;
    /// Service close
    pub const CLOSE: u8 = 4;
    /// Application payload; zero-length is a keep-alive
    pub const DATA: u8 = 5;
    /// Bulk receive request (carries page-list address + length)
    pub const BULK_RX: u8 = 6;
    /// Bulk transmit request (carries page-list address + length)
    pub const BULK_TX: u8 = 7;
    /// Bulk receive completion (carries transferred byte count)
    pub const BULK_RX_DONE: u8 = 8;
    /// Bulk transmit completion (carries transferred byte count)
    pub const BULK_TX_DONE: u8 = 9;
}

/// Decoded message type. Unknown values are preserved so the router can log
/// them before skipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Padding,
    Connect,
    Open,
    OpenAck,
    Close,
    Data,
    BulkRx,
    BulkTx,
    BulkRxDone,
    BulkTxDone,
    Other(u8),
}

impl MessageType {
    pub const fn from_wire(raw: u8) -> Self {
        match raw {
            msg_type::PADDING => MessageType::Padding,
            msg_type::CONNECT => MessageType::Connect,
            msg_type::OPEN => MessageType::Open,
            msg_type::OPENACK => MessageType::OpenAck,
            msg_type::CLOSE => MessageType::Close,
            msg_type::DATA => MessageType::Data,
            msg_type::BULK_RX => MessageType::BulkRx,
            msg_type::BULK_TX => MessageType::BulkTx,
            msg_type::BULK_RX_DONE => MessageType::BulkRxDone,
            msg_type::BULK_TX_DONE => MessageType::BulkTxDone,
            other => MessageType::Other(other),
        }
    }

    pub const fn to_wire(self) -> u8 {
        match self {
            MessageType::Padding => msg_type::PADDING,
            MessageType::Connect => msg_type::CONNECT,
            MessageType::Open => msg_type::OPEN,
            MessageType::OpenAck => msg_type::OPENACK,
            MessageType::Close => msg_type::CLOSE,
            MessageType::Data => msg_type::DATA,
            MessageType::BulkRx => msg_type::BULK_RX,
            MessageType::BulkTx => msg_type::BULK_TX,
            MessageType::BulkRxDone => msg_type::BULK_RX_DONE,
            MessageType::BulkTxDone => msg_type::BULK_TX_DONE,
            MessageType::Other(other) => other,
        }
    }

    /// Message type name for debugging.
    pub const fn name(self) -> &'static str {
        match self {
            MessageType::Padding => "Padding",
            MessageType::Connect => "Connect",
            MessageType::Open => "Open",
            MessageType::OpenAck => "OpenAck",
            MessageType::Close => "Close",
            MessageType::Data => "Data",
            MessageType::BulkRx => "BulkRx",
            MessageType::BulkTx => "BulkTx",
            MessageType::BulkRxDone => "BulkRxDone",
            MessageType::BulkTxDone => "BulkTxDone",
            MessageType::Other(_) => "Unknown",
        }
    }
}

/// Ports are 12-bit values; 0 is reserved for transport control.
pub const MAX_PORT: u16 = 0xfff;

/// Packed 32-bit message id: {type:8, src_port:12, dst_port:12}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgId(u32);

impl MsgId {
    pub fn new(msg_type: MessageType, src_port: u16, dst_port: u16) -> Self {
        debug_assert!(src_port <= MAX_PORT && dst_port <= MAX_PORT);
        Self(
            ((msg_type.to_wire() as u32) << 24)
                | (((src_port & MAX_PORT) as u32) << 12)
                | ((dst_port & MAX_PORT) as u32),
        )
    }

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn msg_type(self) -> MessageType {
        MessageType::from_wire((self.0 >> 24) as u8)
    }

    #[inline]
    pub const fn src_port(self) -> u16 {
        ((self.0 >> 12) & 0xfff) as u16
    }

    #[inline]
    pub const fn dst_port(self) -> u16 {
        (self.0 & 0xfff) as u16
    }
}

/// Size of the on-wire message header.
pub const MSG_HEADER_SIZE: usize = 8;

/// Message stride granularity; slot space is always handed out in multiples
/// of this, which keeps every header 8-byte aligned.
pub const MSG_ALIGNMENT: usize = 8;

/// Bytes a message with the given payload occupies in a slot.
#[inline]
pub const fn stride(payload_len: usize) -> usize {
    (MSG_HEADER_SIZE + payload_len + MSG_ALIGNMENT - 1) & !(MSG_ALIGNMENT - 1)
}

// ── wire header ──────────────────────────────────────────────────────────────

/// On-wire message header, projected directly onto slot memory.
///
/// The id is written last and read first: it is the field whose store
/// publishes the header within the slot (the slot itself only becomes
/// visible through the owner's write-position store).
#[repr(C)]
pub struct MsgHeader {
    msgid: AtomicU32,
    size: AtomicU32,
}

const _: () = assert!(size_of::<MsgHeader>() == MSG_HEADER_SIZE);

impl MsgHeader {
    pub fn write(&self, id: MsgId, size: u32) {
        self.size.store(size, Ordering::Relaxed);
        self.msgid.store(id.raw(), Ordering::Release);
    }

    #[inline]
    pub fn id(&self) -> MsgId {
        MsgId::from_raw(self.msgid.load(Ordering::Acquire))
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msgid_packs_and_unpacks() {
        let id = MsgId::new(MessageType::Data, 0x123, 0xabc);
        assert_eq!(id.msg_type(), MessageType::Data);
        assert_eq!(id.src_port(), 0x123);
        assert_eq!(id.dst_port(), 0xabc);

        let id = MsgId::new(MessageType::Connect, 0, 0);
        assert_eq!(id.raw(), (msg_type::CONNECT as u32) << 24);
    }

    #[test]
    fn unknown_types_are_preserved() {
        let id = MsgId::new(MessageType::Other(200), 1, 2);
        assert_eq!(id.msg_type(), MessageType::Other(200));
        assert_eq!(MessageType::Other(200).name(), "Unknown");
    }

    #[test]
    fn stride_rounds_up_to_eight() {
        assert_eq!(stride(0), 8);
        assert_eq!(stride(1), 16);
        assert_eq!(stride(8), 16);
        assert_eq!(stride(9), 24);
        assert_eq!(stride(4088), 4096);
    }

    #[test]
    fn header_roundtrip_over_region() {
        let heap = vchiq_primitives::HeapRegion::new_zeroed(64);
        let region = heap.region();
        let hdr: &MsgHeader = unsafe { region.get(8) };
        hdr.write(MsgId::new(MessageType::OpenAck, 7, 3), 42);
        assert_eq!(hdr.size(), 42);
        assert_eq!(hdr.id().msg_type(), MessageType::OpenAck);
        assert_eq!(hdr.id().src_port(), 7);
        assert_eq!(hdr.id().dst_port(), 3);
    }
}
