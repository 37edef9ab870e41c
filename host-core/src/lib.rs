//! # SAP Host Core
//!
//! Host side of the SAP protocol, which lets the host Wi-Fi driver and the
//! management engine firmware share one radio. It handles:
//!
//! - The shared memory region and its four cyclic queues
//! - The START handshake over the bus
//! - Radio ownership arbitration with the firmware
//! - Replaying the host configuration on every new session
//! - Relaying Ethernet frames between the firmware and the host network device
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                Host Wi-Fi driver (SapOps, NetDevice)             │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ setters, get_ownership           ▲ callbacks, frames
//!        ▼                                  │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         SapContext (this lib)                    │
//! │                                                                  │
//! │  ┌───────────┐  ┌────────────┐  ┌────────────┐  ┌─────────────┐  │
//! │  │  Session  │  │ Ownership  │  │  Dispatch  │  │    Relay    │  │
//! │  └───────────┘  └────────────┘  └────────────┘  └─────────────┘  │
//! │        │                               │               │         │
//! │        ▼                               ▼               ▼         │
//! │  ┌────────────┐   ┌──────────────────────────────────────────┐   │
//! │  │ Coalescer  │   │   SharedArea (sap-shared queues/layout)  │   │
//! │  └────────────┘   └──────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────┘
//!        │ START, CHECK_SHARED_AREA          ▲ START_OK, doorbell
//!        ▼                                   │
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         BusTransport                             │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let runtime = tokio::runtime::Runtime::new()?;
//! let ctx = SapContext::new(SapConfig::default(), runtime.handle().clone());
//! ctx.register(ops)?;
//! ctx.probe(transport)?;
//! ```

mod coalescer;
mod config;
mod context;
mod dispatch;
mod error;
mod filters;
#[cfg(test)]
mod mock;
mod ownership;
mod relay;
mod session;
mod shmem;
mod stats;
mod transport;
mod upstream;

pub use coalescer::{Doorbell, SignalCoalescer, DEFAULT_COOLDOWN};
pub use config::{CollocatedAp, ConfigCache, SapConfig};
pub use context::{ContextStats, SapContext};
pub use error::{Result, SapError};
pub use filters::{eth_flags, FilterSet, FilterStore};
pub use ownership::{Ownership, OwnershipState};
pub use session::{HandshakeError, Session, SessionState, StartOkOutcome};
pub use shmem::SharedArea;
pub use stats::{RelayStats, StatsSnapshot};
pub use transport::{BusTransport, RxCallback, BUS_RX_BUF_SIZE};
pub use upstream::{ConnectionStatus, EthernetFrame, NetDevice, RxVerdict, SapOps};

pub use sap_shared;
