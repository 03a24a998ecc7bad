//! Slot-based shared-memory message transport.
//!
//! Two peers share one memory region: a control block ([`layout::SlotZero`])
//! followed by fixed-size message slots and a bulk fragment pool. Each side
//! owns half the slots, publishes messages as a monotonically growing byte
//! stream, and returns consumed peer slots through the peer's recycle queue.
//! Wakeups travel over a value-free doorbell; `{armed, fired}` event pairs in
//! the control block tell the receiver why it was rung.
//!
//! On top of the stream sit logical services: fourcc-named ports opened with
//! an OPEN/OPENACK handshake, carrying payload messages and DMA bulk
//! transfers whose completions correlate positionally per direction.
//!
//! ```no_run
//! use vchiq_shm::{DeliveryMode, FourCc, TransportConfig, create_linked_pair};
//!
//! # fn main() -> Result<(), vchiq_shm::TransportError> {
//! let pair = create_linked_pair(&TransportConfig::default())?;
//! pair.master.connect()?;
//! pair.slave.connect()?;
//! pair.master.wait_connected(None)?;
//!
//! let handle = pair
//!     .master
//!     .open_service(FourCc::from_bytes(b"echo"), 3, DeliveryMode::Callback)?;
//! # let _ = handle;
//! # Ok(())
//! # }
//! ```

#[macro_use]
mod macros;

pub mod bulk;
pub mod doorbell;
pub mod error;
pub mod fragments;
pub mod layout;
pub mod msg;
pub mod service;
pub mod transport;
pub mod worker;

pub use bulk::{BulkBuffer, BulkDirection, BulkMode, DmaMapper, IdentityMapper, SgList, SgRun};
pub use doorbell::{Doorbell, LoopbackDoorbell, NullDoorbell};
pub use error::TransportError;
pub use layout::{Role, SlotZeroRef, TransportConfig, MAX_MESSAGE_SIZE, SLOT_SIZE};
pub use msg::MessageType;
pub use service::{Completion, DeliveryMode, FourCc, ServiceHandle, ServiceState};
pub use transport::{create_linked_pair, LinkedPair, QueueMode, Transport, TransportInfo};
