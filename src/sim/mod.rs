//! In-memory device layer.
//!
//! Each simulated port has a receive wire that frames are injected into
//! and a transmit wire that collects what the port sent. Transmit queues
//! hold accepted buffers in a descriptor ring until the next burst (or an
//! explicit cleanup) completes them, so tests can observe which buffers a
//! queue owns right after a burst.
//!
//! Every control-path step can be made to fail with a chosen negative code.

mod frame_gen;

pub use frame_gen::FrameGen;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use eui48::MacAddress;
use ringbuf::HeapRb;
use ringbuf::traits::{Consumer, Observer, Producer};

use crate::api::{
    Burst, DescLim, DevError, DevInfo, DevResult, EthConf, EthDev, PortId, RxConf, RxQueue, SocketId, TxConf,
    TxOffloads, TxQueue,
};
use crate::mempool::{Mbuf, Mempool};

/// Control-path step of a simulated port, for fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SimStep {
    DevInfo,
    Configure,
    RxQueueSetup,
    TxQueueSetup,
    Start,
    Promiscuous,
    MacAddr,
}

#[derive(Clone, Debug)]
pub struct SimPortSpec {
    pub name: String,
    pub mac: MacAddress,
    pub socket_id: Option<SocketId>,
    pub tx_offload_capa: TxOffloads,
    pub rx_desc_lim: DescLim,
    pub tx_desc_lim: DescLim,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    /// Most frames a single transmit burst accepts. `None` is unbounded.
    pub tx_accept_limit: Option<usize>,
    /// Frames the receive wire holds before dropping.
    pub rx_wire_capacity: usize,
    pub fail_at: Option<(SimStep, i32)>,
}

impl SimPortSpec {
    /// Spec for port `id` with a locally administered MAC derived from it.
    pub fn numbered(id: PortId) -> Self {
        let [hi, lo] = id.to_be_bytes();
        Self {
            name: format!("sim{id}"),
            mac: MacAddress::new([0x02, 0, 0, 0, hi, lo]),
            ..Default::default()
        }
    }
}

impl Default for SimPortSpec {
    fn default() -> Self {
        Self {
            name: "sim0".into(),
            mac: MacAddress::new([0x02, 0, 0, 0, 0, 0]),
            socket_id: None,
            tx_offload_capa: TxOffloads::MBUF_FAST_FREE,
            rx_desc_lim: DescLim::default(),
            tx_desc_lim: DescLim::default(),
            max_rx_queues: 4,
            max_tx_queues: 4,
            tx_accept_limit: None,
            rx_wire_capacity: 4096,
            fail_at: None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct RxSetup {
    nb_desc: u16,
    socket: Option<SocketId>,
}

#[derive(Clone, Copy, Debug)]
struct TxSetup {
    nb_desc: u16,
    socket: Option<SocketId>,
    conf: TxConf,
}

#[derive(Default)]
struct SimPortState {
    calls: Vec<SimStep>,
    fail_at: Option<(SimStep, i32)>,
    eth_conf: Option<EthConf>,
    rx_setup: Vec<Option<RxSetup>>,
    tx_setup: Vec<Option<TxSetup>>,
    tx_rings: Vec<Option<HeapRb<Mbuf>>>,
    tx_accept_limit: Option<usize>,
    started: bool,
    promiscuous: bool,
    rx_wire: VecDeque<Vec<u8>>,
    tx_wire: Vec<Vec<u8>>,
    rx_dropped: u64,
    rx_nombuf: u64,
}

/// One simulated port, shared between the device and its queues.
pub struct SimPort {
    id: PortId,
    spec: SimPortSpec,
    state: Mutex<SimPortState>,
}

impl SimPort {
    fn new(id: PortId, spec: SimPortSpec) -> Self {
        let state = SimPortState {
            fail_at: spec.fail_at,
            tx_accept_limit: spec.tx_accept_limit,
            ..Default::default()
        };
        Self {
            id,
            spec,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimPortState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn step(&self, step: SimStep) -> DevResult<MutexGuard<'_, SimPortState>> {
        let mut st = self.lock();
        st.calls.push(step);
        match st.fail_at {
            Some((at, code)) if at == step => Err(DevError::new(code)),
            _ => Ok(st),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn spec(&self) -> &SimPortSpec {
        &self.spec
    }

    /// Queues `frame` on the receive wire. Returns `false` if the wire is
    /// full and the frame was dropped.
    pub fn inject(&self, frame: &[u8]) -> bool {
        let mut st = self.lock();
        if st.rx_wire.len() >= self.spec.rx_wire_capacity {
            st.rx_dropped += 1;
            return false;
        }
        st.rx_wire.push_back(frame.to_vec());
        true
    }

    /// Frames waiting on the receive wire.
    pub fn rx_pending(&self) -> usize {
        self.lock().rx_wire.len()
    }

    /// Frames dropped because the receive wire was full.
    pub fn rx_dropped(&self) -> u64 {
        self.lock().rx_dropped
    }

    /// Receive attempts that found the pool empty.
    pub fn rx_nombuf(&self) -> u64 {
        self.lock().rx_nombuf
    }

    /// Drains the frames the port has put on the wire so far.
    pub fn take_transmitted(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.lock().tx_wire)
    }

    /// Buffers held by transmit queue `queue` and not completed yet.
    pub fn tx_pending(&self, queue: u16) -> usize {
        let st = self.lock();
        match st.tx_rings.get(usize::from(queue)) {
            Some(Some(ring)) => ring.occupied_len(),
            _ => 0,
        }
    }

    /// Contents of the buffers held by transmit queue `queue`, oldest first.
    pub fn tx_pending_frames(&self, queue: u16) -> Vec<Vec<u8>> {
        let st = self.lock();
        match st.tx_rings.get(usize::from(queue)) {
            Some(Some(ring)) => ring.iter().map(|m| m.data().to_vec()).collect(),
            _ => Vec::new(),
        }
    }

    pub fn set_tx_accept_limit(&self, limit: Option<usize>) {
        self.lock().tx_accept_limit = limit;
    }

    pub fn set_fail_at(&self, fail_at: Option<(SimStep, i32)>) {
        self.lock().fail_at = fail_at;
    }

    /// Whether any control-path call reached this port.
    pub fn touched(&self) -> bool {
        !self.lock().calls.is_empty()
    }

    /// Control-path calls in the order they were made.
    pub fn calls(&self) -> Vec<SimStep> {
        self.lock().calls.clone()
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_promiscuous(&self) -> bool {
        self.lock().promiscuous
    }

    /// Port configuration passed to `configure`.
    pub fn eth_conf(&self) -> Option<EthConf> {
        self.lock().eth_conf
    }

    /// Configuration passed to the setup of transmit queue `queue`.
    pub fn tx_queue_conf(&self, queue: u16) -> Option<TxConf> {
        self.tx_setup(queue).map(|s| s.conf)
    }

    pub fn rx_queue_desc(&self, queue: u16) -> Option<u16> {
        self.rx_setup(queue).map(|s| s.nb_desc)
    }

    pub fn tx_queue_desc(&self, queue: u16) -> Option<u16> {
        self.tx_setup(queue).map(|s| s.nb_desc)
    }

    /// NUMA node requested for receive queue `queue`.
    pub fn rx_queue_socket(&self, queue: u16) -> Option<Option<SocketId>> {
        self.rx_setup(queue).map(|s| s.socket)
    }

    pub fn tx_queue_socket(&self, queue: u16) -> Option<Option<SocketId>> {
        self.tx_setup(queue).map(|s| s.socket)
    }

    fn rx_setup(&self, queue: u16) -> Option<RxSetup> {
        self.lock().rx_setup.get(usize::from(queue)).copied().flatten()
    }

    fn tx_setup(&self, queue: u16) -> Option<TxSetup> {
        self.lock().tx_setup.get(usize::from(queue)).copied().flatten()
    }
}

/// A set of simulated ports numbered from 0.
pub struct SimDevice {
    ports: Vec<Arc<SimPort>>,
    local_socket: Option<SocketId>,
}

impl SimDevice {
    pub fn new(specs: Vec<SimPortSpec>) -> Self {
        let ports = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| Arc::new(SimPort::new(i as PortId, spec)))
            .collect();
        Self {
            ports,
            local_socket: None,
        }
    }

    /// `nb_ports` ports built with [`SimPortSpec::numbered`].
    pub fn with_ports(nb_ports: u16) -> Self {
        Self::new((0..nb_ports).map(SimPortSpec::numbered).collect())
    }

    /// Pins the NUMA node reported for the polling context.
    pub fn with_local_socket(mut self, socket: Option<SocketId>) -> Self {
        self.local_socket = socket;
        self
    }

    pub fn port(&self, port: PortId) -> Option<&Arc<SimPort>> {
        self.ports.get(usize::from(port))
    }

    fn get(&self, port: PortId) -> DevResult<&Arc<SimPort>> {
        self.port(port).ok_or(DevError::new(-libc::ENODEV))
    }
}

impl EthDev for SimDevice {
    type Rx = SimRxQueue;
    type Tx = SimTxQueue;

    fn port_ids(&self) -> Vec<PortId> {
        (0..self.ports.len() as PortId).collect()
    }

    fn socket_id(&self, port: PortId) -> Option<SocketId> {
        self.port(port).and_then(|p| p.spec.socket_id)
    }

    fn local_socket_id(&self) -> Option<SocketId> {
        self.local_socket
    }

    fn dev_info(&self, port: PortId) -> DevResult<DevInfo> {
        let p = self.get(port)?;
        p.step(SimStep::DevInfo)?;
        let spec = &p.spec;
        Ok(DevInfo {
            driver_name: "net_sim".into(),
            if_name: spec.name.clone(),
            max_rx_queues: spec.max_rx_queues,
            max_tx_queues: spec.max_tx_queues,
            tx_offload_capa: spec.tx_offload_capa,
            rx_desc_lim: spec.rx_desc_lim,
            tx_desc_lim: spec.tx_desc_lim,
            default_rxconf: RxConf {
                rx_free_thresh: 32,
                rx_drop_en: false,
            },
            default_txconf: TxConf {
                tx_free_thresh: 32,
                offloads: TxOffloads::empty(),
            },
        })
    }

    fn configure(&self, port: PortId, nb_rxq: u16, nb_txq: u16, conf: &EthConf) -> DevResult<()> {
        let p = self.get(port)?;
        let mut st = p.step(SimStep::Configure)?;
        if st.started {
            return Err(DevError::new(-libc::EBUSY));
        }
        if nb_rxq == 0 || nb_txq == 0 || nb_rxq > p.spec.max_rx_queues || nb_txq > p.spec.max_tx_queues {
            return Err(DevError::new(-libc::EINVAL));
        }
        if !(conf.txmode.offloads - p.spec.tx_offload_capa).is_empty() {
            return Err(DevError::new(-libc::EINVAL));
        }
        st.eth_conf = Some(*conf);
        st.rx_setup = vec![None; usize::from(nb_rxq)];
        st.tx_setup = vec![None; usize::from(nb_txq)];
        st.tx_rings = (0..nb_txq).map(|_| None).collect();
        Ok(())
    }

    fn adjust_nb_rx_tx_desc(&self, port: PortId, nb_rxd: &mut u16, nb_txd: &mut u16) -> DevResult<()> {
        let p = self.get(port)?;
        *nb_rxd = p.spec.rx_desc_lim.adjust(*nb_rxd);
        *nb_txd = p.spec.tx_desc_lim.adjust(*nb_txd);
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        nb_desc: u16,
        socket: Option<SocketId>,
        _conf: &RxConf,
        pool: &Mempool,
    ) -> DevResult<Self::Rx> {
        let p = self.get(port)?;
        let mut st = p.step(SimStep::RxQueueSetup)?;
        let slot = st
            .rx_setup
            .get_mut(usize::from(queue))
            .ok_or(DevError::new(-libc::EINVAL))?;
        if nb_desc == 0 {
            return Err(DevError::new(-libc::EINVAL));
        }
        *slot = Some(RxSetup { nb_desc, socket });
        drop(st);
        Ok(SimRxQueue {
            port: p.clone(),
            pool: pool.clone(),
        })
    }

    fn tx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        nb_desc: u16,
        socket: Option<SocketId>,
        conf: &TxConf,
    ) -> DevResult<Self::Tx> {
        let p = self.get(port)?;
        let mut st = p.step(SimStep::TxQueueSetup)?;
        let q = usize::from(queue);
        if q >= st.tx_setup.len() || nb_desc == 0 {
            return Err(DevError::new(-libc::EINVAL));
        }
        if !(conf.offloads - p.spec.tx_offload_capa).is_empty() {
            return Err(DevError::new(-libc::EINVAL));
        }
        st.tx_setup[q] = Some(TxSetup {
            nb_desc,
            socket,
            conf: *conf,
        });
        st.tx_rings[q] = Some(HeapRb::new(usize::from(nb_desc)));
        drop(st);
        Ok(SimTxQueue {
            port: p.clone(),
            queue,
        })
    }

    fn start(&self, port: PortId) -> DevResult<()> {
        let p = self.get(port)?;
        let mut st = p.step(SimStep::Start)?;
        let ready = st.eth_conf.is_some()
            && st.rx_setup.iter().all(Option::is_some)
            && st.tx_setup.iter().all(Option::is_some);
        if !ready {
            return Err(DevError::new(-libc::EINVAL));
        }
        st.started = true;
        Ok(())
    }

    fn promiscuous_enable(&self, port: PortId) -> DevResult<()> {
        let p = self.get(port)?;
        let mut st = p.step(SimStep::Promiscuous)?;
        st.promiscuous = true;
        Ok(())
    }

    fn mac_addr(&self, port: PortId) -> DevResult<MacAddress> {
        let p = self.get(port)?;
        p.step(SimStep::MacAddr)?;
        Ok(p.spec.mac)
    }
}

pub struct SimRxQueue {
    port: Arc<SimPort>,
    pool: Mempool,
}

impl RxQueue for SimRxQueue {
    fn rx_burst(&mut self, bufs: &mut Burst, nb_pkts: usize) -> usize {
        let mut st = self.port.lock();
        if !st.started {
            return 0;
        }
        let want = nb_pkts.min(bufs.remaining_capacity());
        let mut received = 0;
        while received < want {
            let Some(frame) = st.rx_wire.front() else {
                break;
            };
            let Some(mut m) = self.pool.alloc() else {
                st.rx_nombuf += 1;
                break;
            };
            m.fill(frame);
            m.set_port(self.port.id);
            st.rx_wire.pop_front();
            bufs.push(m);
            received += 1;
        }
        received
    }
}

pub struct SimTxQueue {
    port: Arc<SimPort>,
    queue: u16,
}

/// Completes every buffer in `ring`: its content goes on the wire and the
/// buffer returns to its pool.
fn complete(ring: &mut HeapRb<Mbuf>, wire: &mut Vec<Vec<u8>>) -> usize {
    let mut done = 0;
    while let Some(m) = ring.try_pop() {
        wire.push(m.data().to_vec());
        done += 1;
    }
    done
}

impl SimTxQueue {
    fn budget(st: &SimPortState, len: usize) -> usize {
        st.tx_accept_limit.map_or(len, |limit| len.min(limit))
    }
}

impl TxQueue for SimTxQueue {
    fn tx_burst(&mut self, bufs: &mut Burst) -> usize {
        let mut guard = self.port.lock();
        let st = &mut *guard;
        if !st.started {
            return 0;
        }
        let budget = Self::budget(st, bufs.len());
        let Some(Some(ring)) = st.tx_rings.get_mut(usize::from(self.queue)) else {
            return 0;
        };
        complete(ring, &mut st.tx_wire);
        let accepted = budget.min(ring.vacant_len());
        for m in bufs.drain(..accepted) {
            if let Err(m) = ring.try_push(m) {
                panic!("tx ring overflow on buffer {}", m.index());
            }
        }
        accepted
    }

    fn tx_burst_copy(&mut self, bufs: &[Mbuf]) -> usize {
        let mut st = self.port.lock();
        if !st.started {
            return 0;
        }
        let accepted = Self::budget(&st, bufs.len());
        for m in &bufs[..accepted] {
            st.tx_wire.push(m.data().to_vec());
        }
        accepted
    }

    fn tx_done_cleanup(&mut self) -> usize {
        let mut guard = self.port.lock();
        let st = &mut *guard;
        match st.tx_rings.get_mut(usize::from(self.queue)) {
            Some(Some(ring)) => complete(ring, &mut st.tx_wire),
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(dev: &SimDevice, pool: &Mempool) -> (SimRxQueue, SimTxQueue) {
        let conf = EthConf::default();
        dev.configure(0, 1, 1, &conf).unwrap();
        let rx = dev
            .rx_queue_setup(0, 0, 64, None, &RxConf::default(), pool)
            .unwrap();
        let tx = dev
            .tx_queue_setup(0, 0, 8, None, &TxConf::default())
            .unwrap();
        dev.start(0).unwrap();
        (rx, tx)
    }

    #[test]
    fn test_rx_delivers_injected_frames() {
        let dev = SimDevice::with_ports(1);
        let pool = Mempool::create("sim-rx", 16, 0, 512).unwrap();
        let (mut rx, _tx) = started(&dev, &pool);
        let port = dev.port(0).unwrap();
        for i in 0..5u8 {
            assert!(port.inject(&[i; 60]));
        }
        let mut burst = Burst::new();
        assert_eq!(rx.rx_burst(&mut burst, 3), 3);
        assert_eq!(burst[2].data(), &[2u8; 60][..]);
        assert_eq!(burst[0].port(), Some(0));
        assert_eq!(port.rx_pending(), 2);
        assert_eq!(pool.in_use_count(), 3);
    }

    #[test]
    fn test_rx_stops_when_pool_empty() {
        let dev = SimDevice::with_ports(1);
        let pool = Mempool::create("sim-nombuf", 2, 0, 512).unwrap();
        let (mut rx, _tx) = started(&dev, &pool);
        let port = dev.port(0).unwrap();
        for _ in 0..4 {
            port.inject(&[0xaa; 64]);
        }
        let mut burst = Burst::new();
        assert_eq!(rx.rx_burst(&mut burst, 32), 2);
        assert_eq!(port.rx_nombuf(), 1);
        assert_eq!(port.rx_pending(), 2);
    }

    #[test]
    fn test_tx_holds_until_next_burst() {
        let dev = SimDevice::with_ports(1);
        let pool = Mempool::create("sim-tx", 16, 0, 512).unwrap();
        let (_rx, mut tx) = started(&dev, &pool);
        let port = dev.port(0).unwrap();

        let mut burst = Burst::new();
        for i in 0..3u8 {
            let mut m = pool.alloc().unwrap();
            m.fill(&[i; 32]);
            burst.push(m);
        }
        assert_eq!(tx.tx_burst(&mut burst), 3);
        assert!(burst.is_empty());
        assert_eq!(port.tx_pending(0), 3);
        assert_eq!(pool.in_use_count(), 3);
        assert!(port.take_transmitted().is_empty());

        assert_eq!(tx.tx_done_cleanup(), 3);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(port.take_transmitted().len(), 3);
    }

    #[test]
    fn test_tx_accept_limit_and_ring_room() {
        let dev = SimDevice::with_ports(1);
        let pool = Mempool::create("sim-limit", 32, 0, 512).unwrap();
        let (_rx, mut tx) = started(&dev, &pool);
        let port = dev.port(0).unwrap();
        port.set_tx_accept_limit(Some(5));

        let mut burst: Burst = (0..12).map(|_| pool.alloc().unwrap()).collect();
        let first = burst[0].index();
        assert_eq!(tx.tx_burst(&mut burst), 5);
        assert_eq!(burst.len(), 7);
        assert_ne!(burst[0].index(), first);

        port.set_tx_accept_limit(None);
        // Ring of 8 is emptied by completion first.
        assert_eq!(tx.tx_burst(&mut burst), 7);
        assert_eq!(port.take_transmitted().len(), 5);
    }

    #[test]
    fn test_tx_copy_keeps_buffers() {
        let dev = SimDevice::with_ports(1);
        let pool = Mempool::create("sim-copy", 8, 0, 512).unwrap();
        let (_rx, mut tx) = started(&dev, &pool);
        let port = dev.port(0).unwrap();
        port.set_tx_accept_limit(Some(2));

        let burst: Burst = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(tx.tx_burst_copy(&burst), 2);
        assert_eq!(burst.len(), 4);
        assert_eq!(pool.in_use_count(), 4);
        assert_eq!(port.tx_pending(0), 0);
        assert_eq!(port.take_transmitted().len(), 2);
    }

    #[test]
    fn test_configure_rejects_unadvertised_offload() {
        let dev = SimDevice::new(vec![SimPortSpec {
            tx_offload_capa: TxOffloads::empty(),
            ..Default::default()
        }]);
        let mut conf = EthConf::default();
        conf.txmode.offloads.insert(TxOffloads::MBUF_FAST_FREE);
        let err = dev.configure(0, 1, 1, &conf).unwrap_err();
        assert_eq!(err.code(), -libc::EINVAL);
    }

    #[test]
    fn test_fault_injection_and_call_log() {
        let dev = SimDevice::new(vec![SimPortSpec {
            fail_at: Some((SimStep::DevInfo, -libc::EIO)),
            ..Default::default()
        }]);
        let port = dev.port(0).unwrap();
        assert!(!port.touched());
        assert_eq!(dev.dev_info(0).unwrap_err().code(), -libc::EIO);
        assert_eq!(port.calls(), vec![SimStep::DevInfo]);
        port.set_fail_at(None);
        assert!(dev.dev_info(0).is_ok());
        assert_eq!(dev.mac_addr(9).unwrap_err().code(), -libc::ENODEV);
    }

    #[test]
    fn test_start_requires_queue_setup() {
        let dev = SimDevice::with_ports(1);
        dev.configure(0, 1, 1, &EthConf::default()).unwrap();
        assert_eq!(dev.start(0).unwrap_err().code(), -libc::EINVAL);
    }

    #[test]
    fn test_numbered_ports_have_distinct_macs() {
        let dev = SimDevice::with_ports(3);
        assert_eq!(dev.port_ids(), vec![0, 1, 2]);
        let macs: Vec<_> = (0..3).map(|p| dev.mac_addr(p).unwrap()).collect();
        assert_ne!(macs[0], macs[1]);
        assert_ne!(macs[1], macs[2]);
        assert_eq!(dev.port(2).unwrap().spec().name, "sim2");
    }
}
