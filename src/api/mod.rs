//! Device-layer seam shared by every backend.
//!
//! The forwarding core never talks to hardware directly: it sees a port
//! through [`EthDev`] and its queues through [`RxQueue`] / [`TxQueue`].
//! Each backend (simulated, AF_PACKET) implements these traits for its own
//! queue types.

mod conf;
mod device;
pub(crate) mod hint;

pub use conf::{DescLim, DevInfo, EthConf, RxConf, TxConf, TxMode, TxOffloads};
pub use device::{Burst, DevError, DevResult, EthDev, MAX_BURST, RxQueue, TxQueue, resultify};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, crate::errors::Error>;

/// Stable integer id of a port, assigned by the device layer at enumeration.
pub type PortId = u16;

/// NUMA node id. `None` wherever a node is used means "unknown".
pub type SocketId = u32;
