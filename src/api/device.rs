use std::fmt;
use std::io;

use arrayvec::ArrayVec;
use eui48::MacAddress;

use super::conf::{DevInfo, EthConf, RxConf, TxConf};
use super::{PortId, SocketId};
use crate::lcore;
use crate::mempool::{Mbuf, Mempool};

/// Largest burst a single receive or transmit call may move.
pub const MAX_BURST: usize = 256;

/// Working array of buffers moved by one burst call.
pub type Burst = ArrayVec<Mbuf, MAX_BURST>;

/// A negative error code reported by the device layer, kept as-is.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DevError(i32);

impl DevError {
    /// Wraps a device-layer error code. Positive errno values are negated so
    /// the stored code is always negative.
    pub const fn new(code: i32) -> Self {
        if code > 0 { Self(-code) } else { Self(code) }
    }

    pub fn last_os_error() -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        Self::new(errno)
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Debug for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevError({})", self.0)
    }
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let os = io::Error::from_raw_os_error(-self.0);
        write!(f, "{} (code {})", os, self.0)
    }
}

impl std::error::Error for DevError {}

impl From<io::Error> for DevError {
    fn from(e: io::Error) -> Self {
        Self::new(e.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type DevResult<T> = std::result::Result<T, DevError>;

/// Maps a C-style return value (negative on failure) to a [`DevResult`].
pub fn resultify(x: i32) -> DevResult<u32> {
    match x >= 0 {
        true => Ok(x as u32),
        false => Err(DevError::new(x)),
    }
}

/// Receive side of one hardware queue.
pub trait RxQueue: Send {
    /// Appends at most `nb_pkts` received buffers to `bufs`, bounded by the
    /// room left in `bufs`. Never blocks; returns how many were appended.
    fn rx_burst(&mut self, bufs: &mut Burst, nb_pkts: usize) -> usize;
}

/// Transmit side of one hardware queue.
pub trait TxQueue: Send {
    /// Enqueues buffers taken from the front of `bufs` and returns how many
    /// were accepted. Accepted buffers are removed from `bufs` and are owned
    /// by the queue from then on; the rest stay in `bufs`, in order.
    fn tx_burst(&mut self, bufs: &mut Burst) -> usize;

    /// Sends copies of the leading buffers of `bufs` without taking them.
    /// Returns how many frames were sent.
    fn tx_burst_copy(&mut self, bufs: &[Mbuf]) -> usize;

    /// Frees buffers whose transmission has completed. Returns how many.
    fn tx_done_cleanup(&mut self) -> usize;
}

/// The runtime/device layer: port enumeration, capability queries, queue
/// setup and the burst primitives (through the queue types).
///
/// Control-path calls report failures as a negative [`DevError`] code.
pub trait EthDev {
    type Rx: RxQueue;
    type Tx: TxQueue;

    /// Ids of every port the runtime was bound to, in ascending order.
    fn port_ids(&self) -> Vec<PortId>;

    fn is_valid_port(&self, port: PortId) -> bool {
        self.port_ids().contains(&port)
    }

    /// NUMA node the port is attached to, if known.
    fn socket_id(&self, port: PortId) -> Option<SocketId>;

    /// NUMA node of the calling polling context.
    fn local_socket_id(&self) -> Option<SocketId> {
        lcore::socket_id()
    }

    fn dev_info(&self, port: PortId) -> DevResult<DevInfo>;

    fn configure(&self, port: PortId, nb_rxq: u16, nb_txq: u16, conf: &EthConf) -> DevResult<()>;

    /// Rewrites the requested ring sizes to values the port supports.
    fn adjust_nb_rx_tx_desc(&self, port: PortId, nb_rxd: &mut u16, nb_txd: &mut u16) -> DevResult<()> {
        let info = self.dev_info(port)?;
        *nb_rxd = info.rx_desc_lim.adjust(*nb_rxd);
        *nb_txd = info.tx_desc_lim.adjust(*nb_txd);
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        nb_desc: u16,
        socket: Option<SocketId>,
        conf: &RxConf,
        pool: &Mempool,
    ) -> DevResult<Self::Rx>;

    fn tx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        nb_desc: u16,
        socket: Option<SocketId>,
        conf: &TxConf,
    ) -> DevResult<Self::Tx>;

    fn start(&self, port: PortId) -> DevResult<()>;

    fn promiscuous_enable(&self, port: PortId) -> DevResult<()>;

    fn mac_addr(&self, port: PortId) -> DevResult<MacAddress>;
}
