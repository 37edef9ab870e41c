//! Bus transport consumed by the session.
//!
//! The bus carries the handshake and the doorbells. Everything else goes
//! through the shared area, which the transport maps for the firmware.

use std::sync::Arc;

use crate::error::Result;
use crate::shmem::SharedArea;

/// Largest bus message the host ever receives
pub const BUS_RX_BUF_SIZE: usize = 100;

/// Called by the transport whenever a bus message is ready to be received
pub type RxCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Send/receive primitive towards the firmware.
///
/// The receive callback must not be invoked from within [`BusTransport::send`]:
/// the session may be sending while holding its lock.
pub trait BusTransport: Send + Sync {
    /// Send one message, returning the number of bytes accepted
    fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Receive one pending message into `buf`, returning its length
    fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    fn register_rx(&self, callback: RxCallback) -> Result<()>;

    fn enable(&self) -> Result<()>;

    /// Disable the bus. Returns once no receive callback is running.
    fn disable(&self) -> Result<()>;

    fn is_enabled(&self) -> bool;

    /// Make the shared area reachable by the firmware
    fn dma_map(&self, area: Arc<SharedArea>) -> Result<()>;

    fn dma_unmap(&self) -> Result<()>;
}
