//! Per-port bring-up and the registry of ready ports.
//!
//! A [`PortSession`] walks one port through
//! `Unconfigured -> Configured -> Started -> Running`. Any failing step
//! leaves the session `Failed` for good and reports the device error code
//! untouched; nothing is retried.

use std::collections::BTreeMap;
use std::fmt;

use eui48::MacAddress;
use tracing::{debug, warn};

use crate::api::{DevError, DevInfo, EthConf, EthDev, PortId, Result, SocketId, TxConf, TxOffloads};
use crate::errors::Error;
use crate::mempool::Mempool;

pub const RX_RING_SIZE: u16 = 1024;
pub const TX_RING_SIZE: u16 = 1024;

/// Requested queue layout of a port. Ring sizes are a request: the device
/// may adjust them, and the adjusted values are the ones used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortConf {
    pub nb_rxd: u16,
    pub nb_txd: u16,
    pub rx_queues: u16,
    pub tx_queues: u16,
}

impl Default for PortConf {
    fn default() -> Self {
        Self {
            nb_rxd: RX_RING_SIZE,
            nb_txd: TX_RING_SIZE,
            rx_queues: 1,
            tx_queues: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortState {
    Unconfigured,
    Configured,
    Started,
    Running,
    Failed,
}

/// Bring-up step, used to name what failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortStep {
    Validate,
    DevInfo,
    Configure,
    AdjustDesc,
    RxQueueSetup,
    TxQueueSetup,
    Start,
    Promiscuous,
    MacAddr,
    Run,
}

impl fmt::Display for PortStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortStep::Validate => "validation",
            PortStep::DevInfo => "device info query",
            PortStep::Configure => "configure",
            PortStep::AdjustDesc => "descriptor adjustment",
            PortStep::RxQueueSetup => "rx queue setup",
            PortStep::TxQueueSetup => "tx queue setup",
            PortStep::Start => "start",
            PortStep::Promiscuous => "promiscuous enable",
            PortStep::MacAddr => "mac address query",
            PortStep::Run => "run",
        };
        f.write_str(name)
    }
}

pub struct PortSession<D: EthDev> {
    port: PortId,
    state: PortState,
    conf: PortConf,
    dev_info: Option<DevInfo>,
    eth_conf: EthConf,
    nb_rxd: u16,
    nb_txd: u16,
    socket: Option<SocketId>,
    txconf: Option<TxConf>,
    rxqs: Vec<D::Rx>,
    txqs: Vec<D::Tx>,
    pool: Option<Mempool>,
    mac: Option<MacAddress>,
    numa_warned: bool,
}

impl<D: EthDev> PortSession<D> {
    pub fn new(port: PortId) -> Self {
        Self {
            port,
            state: PortState::Unconfigured,
            conf: PortConf::default(),
            dev_info: None,
            eth_conf: EthConf::default(),
            nb_rxd: 0,
            nb_txd: 0,
            socket: None,
            txconf: None,
            rxqs: Vec::new(),
            txqs: Vec::new(),
            pool: None,
            mac: None,
            numa_warned: false,
        }
    }

    /// Runs the whole bring-up sequence: configure, queue setup, start and
    /// hardware address query.
    pub fn init(dev: &D, port: PortId, conf: &PortConf, pool: &Mempool) -> Result<Self> {
        let mut session = Self::new(port);
        session.configure(dev, conf)?;
        session.setup_queues(dev, pool)?;
        session.start(dev)?;
        session.local_identity(dev)?;
        Ok(session)
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn state(&self) -> PortState {
        self.state
    }

    pub fn dev_info(&self) -> Option<&DevInfo> {
        self.dev_info.as_ref()
    }

    pub fn eth_conf(&self) -> &EthConf {
        &self.eth_conf
    }

    /// Transmit offloads requested from the device.
    pub fn tx_offloads(&self) -> TxOffloads {
        self.eth_conf.txmode.offloads
    }

    /// Transmit queue configuration handed to queue setup.
    pub fn txconf(&self) -> Option<&TxConf> {
        self.txconf.as_ref()
    }

    /// Receive ring size after device adjustment.
    pub fn nb_rxd(&self) -> u16 {
        self.nb_rxd
    }

    /// Transmit ring size after device adjustment.
    pub fn nb_txd(&self) -> u16 {
        self.nb_txd
    }

    /// NUMA node the port's queues were placed on.
    pub fn socket_id(&self) -> Option<SocketId> {
        self.socket
    }

    pub fn mac(&self) -> Option<MacAddress> {
        self.mac
    }

    /// Pool the receive queues refill from.
    pub fn pool(&self) -> Option<&Mempool> {
        self.pool.as_ref()
    }

    pub fn rx_queue(&mut self, queue: u16) -> Option<&mut D::Rx> {
        self.rxqs.get_mut(usize::from(queue))
    }

    pub fn tx_queue(&mut self, queue: u16) -> Option<&mut D::Tx> {
        self.txqs.get_mut(usize::from(queue))
    }

    fn fail(&mut self, step: PortStep, source: DevError) -> Error {
        self.state = PortState::Failed;
        Error::Port {
            port: self.port,
            step,
            source,
        }
    }

    fn expect_state(&self, expected: PortState, step: PortStep) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                port: self.port,
                step,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Validates the port, negotiates transmit offloads, requests the queues
    /// and adjusts the ring sizes.
    ///
    /// The fast-free offload is requested exactly when the port advertises
    /// it; nothing the port does not advertise is ever requested.
    pub fn configure(&mut self, dev: &D, conf: &PortConf) -> Result<()> {
        self.expect_state(PortState::Unconfigured, PortStep::Configure)?;
        if !dev.is_valid_port(self.port) {
            self.state = PortState::Failed;
            return Err(Error::InvalidPort(self.port));
        }

        let info = dev
            .dev_info(self.port)
            .map_err(|e| self.fail(PortStep::DevInfo, e))?;

        let mut eth_conf = EthConf::default();
        if info.tx_offload_capa.contains(TxOffloads::MBUF_FAST_FREE) {
            eth_conf.txmode.offloads.insert(TxOffloads::MBUF_FAST_FREE);
        }

        dev.configure(self.port, conf.rx_queues, conf.tx_queues, &eth_conf)
            .map_err(|e| self.fail(PortStep::Configure, e))?;

        let mut nb_rxd = conf.nb_rxd;
        let mut nb_txd = conf.nb_txd;
        dev.adjust_nb_rx_tx_desc(self.port, &mut nb_rxd, &mut nb_txd)
            .map_err(|e| self.fail(PortStep::AdjustDesc, e))?;
        if nb_rxd != conf.nb_rxd || nb_txd != conf.nb_txd {
            debug!(
                port = self.port,
                requested_rx = conf.nb_rxd,
                requested_tx = conf.nb_txd,
                nb_rxd,
                nb_txd,
                "descriptor rings adjusted"
            );
        }

        debug!(port = self.port, driver = %info.driver_name, offloads = ?eth_conf.txmode.offloads, "port configured");
        self.conf = conf.clone();
        self.dev_info = Some(info);
        self.eth_conf = eth_conf;
        self.nb_rxd = nb_rxd;
        self.nb_txd = nb_txd;
        self.state = PortState::Configured;
        Ok(())
    }

    /// Sets up every receive queue on `pool` and every transmit queue with
    /// the negotiated offloads, on the port's NUMA node when it is known.
    pub fn setup_queues(&mut self, dev: &D, pool: &Mempool) -> Result<()> {
        self.expect_state(PortState::Configured, PortStep::RxQueueSetup)?;
        if !self.rxqs.is_empty() || !self.txqs.is_empty() {
            return Err(Error::InvalidState {
                port: self.port,
                step: PortStep::RxQueueSetup,
                state: self.state,
            });
        }
        let Some(info) = self.dev_info.clone() else {
            return Err(Error::InvalidState {
                port: self.port,
                step: PortStep::RxQueueSetup,
                state: self.state,
            });
        };

        let socket = dev.socket_id(self.port);
        self.socket = socket;

        for q in 0..self.conf.rx_queues {
            let rxq = dev
                .rx_queue_setup(self.port, q, self.nb_rxd, socket, &info.default_rxconf, pool)
                .map_err(|e| self.fail(PortStep::RxQueueSetup, e))?;
            self.rxqs.push(rxq);
        }

        let mut txconf = info.default_txconf;
        txconf.offloads = self.eth_conf.txmode.offloads;
        for q in 0..self.conf.tx_queues {
            let txq = dev
                .tx_queue_setup(self.port, q, self.nb_txd, socket, &txconf)
                .map_err(|e| self.fail(PortStep::TxQueueSetup, e))?;
            self.txqs.push(txq);
        }

        self.txconf = Some(txconf);
        self.pool = Some(pool.clone());
        Ok(())
    }

    /// Starts the port and puts it in promiscuous mode.
    pub fn start(&mut self, dev: &D) -> Result<()> {
        self.expect_state(PortState::Configured, PortStep::Start)?;
        if self.rxqs.len() != usize::from(self.conf.rx_queues)
            || self.txqs.len() != usize::from(self.conf.tx_queues)
        {
            return Err(Error::InvalidState {
                port: self.port,
                step: PortStep::Start,
                state: self.state,
            });
        }
        dev.start(self.port)
            .map_err(|e| self.fail(PortStep::Start, e))?;
        dev.promiscuous_enable(self.port)
            .map_err(|e| self.fail(PortStep::Promiscuous, e))?;
        self.state = PortState::Started;
        Ok(())
    }

    /// Queries the hardware address of the port.
    pub fn local_identity(&mut self, dev: &D) -> Result<MacAddress> {
        if self.state == PortState::Failed {
            return Err(Error::InvalidState {
                port: self.port,
                step: PortStep::MacAddr,
                state: self.state,
            });
        }
        let mac = dev
            .mac_addr(self.port)
            .map_err(|e| self.fail(PortStep::MacAddr, e))?;
        self.mac = Some(mac);
        Ok(mac)
    }

    /// Warns once if the port sits on a different NUMA node than the
    /// polling context. Returns whether the nodes differ.
    pub fn check_numa_affinity(&mut self, local: Option<SocketId>) -> bool {
        let mismatch = matches!((self.socket, local), (Some(port), Some(local)) if port != local);
        if mismatch && !self.numa_warned {
            self.numa_warned = true;
            warn!(
                "port {} is on remote NUMA node {:?} to polling thread on node {:?}; performance will not be optimal",
                self.port, self.socket, local
            );
        }
        mismatch
    }

    pub(crate) fn mark_running(&mut self) -> Result<()> {
        match self.state {
            PortState::Started | PortState::Running => {
                self.state = PortState::Running;
                Ok(())
            }
            state => Err(Error::InvalidState {
                port: self.port,
                step: PortStep::Run,
                state,
            }),
        }
    }
}

impl<D: EthDev> fmt::Debug for PortSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortSession")
            .field("port", &self.port)
            .field("state", &self.state)
            .field("nb_rxd", &self.nb_rxd)
            .field("nb_txd", &self.nb_txd)
            .field("socket", &self.socket)
            .field("tx_offloads", &self.eth_conf.txmode.offloads)
            .finish()
    }
}

/// Ready port sessions keyed by port id.
///
/// Filled once at startup; entries are never added or removed afterwards,
/// so the polling loop looks ports up without any locking.
pub struct PortRegistry<D: EthDev> {
    sessions: BTreeMap<PortId, PortSession<D>>,
}

impl<D: EthDev> PortRegistry<D> {
    pub fn new(sessions: impl IntoIterator<Item = PortSession<D>>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for session in sessions {
            let port = session.port();
            if map.insert(port, session).is_some() {
                return Err(Error::Config(format!("port {port} registered twice")));
            }
        }
        Ok(Self { sessions: map })
    }

    pub fn get(&self, port: PortId) -> Option<&PortSession<D>> {
        self.sessions.get(&port)
    }

    pub(crate) fn get_mut(&mut self, port: PortId) -> Option<&mut PortSession<D>> {
        self.sessions.get_mut(&port)
    }

    pub fn contains(&self, port: PortId) -> bool {
        self.sessions.contains_key(&port)
    }

    pub fn ids(&self) -> impl Iterator<Item = PortId> + '_ {
        self.sessions.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PortSession<D>> {
        self.sessions.values()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
