//! Bulk transfer plumbing: DMA mapping contract, page-list descriptors, and
//! the per-service pending entries the completion correlator pops in FIFO
//! order.

use std::sync::atomic::{AtomicUsize, Ordering};

use vchiq_primitives::Region;

use crate::error::TransportError;
use crate::fragments::FragmentRef;
use crate::layout::FRAGMENT_SIZE;
use crate::msg::MessageType;

/// Direction of a bulk transfer, from the local side's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkDirection {
    Transmit,
    Receive,
}

impl BulkDirection {
    /// Message type announcing the transfer to the peer.
    pub fn msg_type(self) -> MessageType {
        match self {
            BulkDirection::Transmit => MessageType::BulkTx,
            BulkDirection::Receive => MessageType::BulkRx,
        }
    }

    /// Message type the peer answers with when the data has moved.
    pub fn done_type(self) -> MessageType {
        match self {
            BulkDirection::Transmit => MessageType::BulkTxDone,
            BulkDirection::Receive => MessageType::BulkRxDone,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BulkDirection::Transmit => "transmit",
            BulkDirection::Receive => "receive",
        }
    }
}

/// How the submitter learns about completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkMode {
    /// Deliver a completion record through the service queue
    Callback,
    /// Block the submitting call until the transfer finishes
    Blocking,
    /// Fire and forget; resources are still reclaimed on completion
    NoCallback,
}

/// A user buffer by address. The caller keeps it alive and untouched until
/// the transfer completes or the service is closed.
#[derive(Debug, Clone, Copy)]
pub struct BulkBuffer {
    pub addr: usize,
    pub len: usize,
}

impl From<&[u8]> for BulkBuffer {
    fn from(buf: &[u8]) -> Self {
        Self {
            addr: buf.as_ptr() as usize,
            len: buf.len(),
        }
    }
}

/// One physically-contiguous run of a mapped buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgRun {
    pub addr: u64,
    pub len: u32,
}

/// Scatter-gather mapping of a pinned buffer.
#[derive(Debug)]
pub struct SgList {
    pub runs: Vec<SgRun>,
    pub total_len: u32,
}

/// External collaborator that pins user buffers for device access.
///
/// `release_sg_list` is called exactly once per successful `build_sg_list`,
/// on completion, on submit unwind, or when the service is torn down.
pub trait DmaMapper: Send + Sync {
    fn build_sg_list(&self, buffer: BulkBuffer) -> Result<SgList, TransportError>;
    fn release_sg_list(&self, sg: SgList);
}

/// Mapper treating virtual addresses as bus addresses, one run per 4 KiB
/// page span. Tracks outstanding mappings so tests can assert nothing leaks.
#[derive(Default)]
pub struct IdentityMapper {
    active: AtomicUsize,
}

impl IdentityMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mappings built but not yet released.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

const PAGE: usize = 4096;

impl DmaMapper for IdentityMapper {
    fn build_sg_list(&self, buffer: BulkBuffer) -> Result<SgList, TransportError> {
        if buffer.len == 0 {
            return Err(TransportError::InvalidParameter);
        }
        let mut runs = Vec::new();
        let mut addr = buffer.addr;
        let end = buffer.addr + buffer.len;
        while addr < end {
            let run_end = ((addr / PAGE) + 1) * PAGE;
            let len = run_end.min(end) - addr;
            runs.push(SgRun {
                addr: addr as u64,
                len: len as u32,
            });
            addr += len;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        Ok(SgList {
            runs,
            total_len: buffer.len as u32,
        })
    }

    fn release_sg_list(&self, _sg: SgList) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ── page-list descriptors ────────────────────────────────────────────────────

/// Fragment bytes available for runs, after the {run_count, total_len} header.
pub const MAX_RUNS_PER_PAGE_LIST: usize = (FRAGMENT_SIZE - 8) / 12;

/// Bus-addressable summary of a written page list; this is what goes into
/// the BulkTx/BulkRx message payload.
#[derive(Debug, Clone, Copy)]
pub struct PageList {
    pub bus_addr: u32,
    pub total_len: u32,
}

impl PageList {
    /// Serialize `sg` into the fragment: {run_count, total_len, runs...}.
    pub fn write(
        region: Region,
        fragment: &FragmentRef,
        sg: &SgList,
    ) -> Result<PageList, TransportError> {
        if sg.runs.len() > MAX_RUNS_PER_PAGE_LIST {
            debug!(
                runs = sg.runs.len(),
                max = MAX_RUNS_PER_PAGE_LIST,
                "buffer too scattered for one page list"
            );
            return Err(TransportError::InvalidParameter);
        }
        let mut off = fragment.offset;
        unsafe {
            region.write_bytes(off, &(sg.runs.len() as u32).to_le_bytes());
            region.write_bytes(off + 4, &sg.total_len.to_le_bytes());
        }
        off += 8;
        for run in &sg.runs {
            unsafe {
                region.write_bytes(off, &run.addr.to_le_bytes());
                region.write_bytes(off + 8, &run.len.to_le_bytes());
            }
            off += 12;
        }
        Ok(PageList {
            bus_addr: fragment.offset as u32,
            total_len: sg.total_len,
        })
    }

    /// 8-byte message payload: {bus_addr, total_len}.
    pub fn to_payload(self) -> [u8; 8] {
        let mut payload = [0u8; 8];
        payload[..4].copy_from_slice(&self.bus_addr.to_le_bytes());
        payload[4..].copy_from_slice(&self.total_len.to_le_bytes());
        payload
    }
}

/// A submitted transfer awaiting its completion message. Lives in the
/// service's per-direction FIFO; correlation is purely positional.
#[derive(Debug)]
pub(crate) struct PendingBulk {
    pub direction: BulkDirection,
    pub mode: BulkMode,
    pub token: u64,
    pub size: u32,
    pub sg: Option<SgList>,
    pub fragment: Option<FragmentRef>,
}
