#![doc = include_str!("../README.md")]
#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod event;
pub mod region;
pub mod sync;

#[cfg(any(test, feature = "std"))]
pub mod futex;
#[cfg(any(test, feature = "std"))]
pub mod sem;

pub use event::RemoteEvent;
#[cfg(any(test, feature = "std"))]
pub use futex::{futex_wait, futex_wake};
#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;
#[cfg(any(test, feature = "std"))]
pub use sem::{CancelToken, Semaphore, WaitError};

#[cfg(all(test, loom))]
mod loom_tests;
