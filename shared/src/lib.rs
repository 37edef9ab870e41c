//! # Shared Protocol Library
//!
//! Bit-exact pieces of the SAP protocol shared by the host and the firmware:
//!
//! - **Cyclic Queues**: Wrap-around byte rings with cursors in shared memory
//! - **Region Layout**: Control block, queue placement and sentinel
//! - **Protocol Messages**: Bus handshake messages and SAP notifications
//!
//! ## Architecture
//!
//! ```text
//! Host driver ──► H2M data / notif queues ──► Firmware
//!      ▲                                          │
//!      └──────── M2H data / notif queues ◄────────┘
//!
//!      CHECK_SHARED_AREA doorbell over the bus, both ways
//! ```
//!
//! Nothing here allocates; queues operate over memory owned by the caller.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod layout;
pub mod protocol;
pub mod queue;

// Re-export main types for convenience
pub use layout::{ControlBlock, Direction, QueueKind, QueueSizes, RegionLayout};
pub use protocol::{FrameError, MeMsgType, Payload, SapHeader, SapMsgType, SAP_VERSION};
pub use queue::{CyclicQueue, QueueControl, QueueError, QueueReader};

/// Library version for protocol compatibility checks
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
