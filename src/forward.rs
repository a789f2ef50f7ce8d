//! The polling loop.
//!
//! Every iteration pulls one burst from the ingress port, offers it to the
//! mirror ports and then to the primary port, and reclaims whatever the
//! primary did not take. Mirrors transmit copies and never own a buffer,
//! so the primary's accepted count alone decides what is reclaimed: the
//! `k` buffers at the front of the burst belong to the primary queue, the
//! rest go back to the pool exactly once.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{info, trace};

use crate::api::hint::{likely, unlikely};
use crate::api::{Burst, EthDev, MAX_BURST, PortId, Result, RxQueue, SocketId, TxQueue};
use crate::diag::Inspector;
use crate::errors::Error;
use crate::mempool::MempoolCache;
use crate::port::{PortRegistry, PortState};

/// Buffers pulled per iteration unless configured otherwise.
pub const BURST_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EgressRole {
    /// Takes ownership of what it accepts; decides what is reclaimed.
    Primary,
    /// Best-effort copy; its accepted count is only observed.
    Mirror,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EgressTarget {
    pub port: PortId,
    pub role: EgressRole,
}

impl EgressTarget {
    pub fn primary(port: PortId) -> Self {
        Self {
            port,
            role: EgressRole::Primary,
        }
    }

    pub fn mirror(port: PortId) -> Self {
        Self {
            port,
            role: EgressRole::Mirror,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FwdMode {
    #[default]
    Forward,
    /// Inspect every received buffer, then reclaim it. Nothing is sent.
    InspectOnly,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FwdConfig {
    pub burst_size: usize,
    pub ingress: PortId,
    /// Egress ports. Mirrors are served in list order, always before the
    /// primary.
    pub egress: Vec<EgressTarget>,
    pub mode: FwdMode,
    /// Run the inspector on each burst before forwarding it.
    pub inspect_before_forward: bool,
}

impl FwdConfig {
    pub fn new(ingress: PortId, primary: PortId) -> Self {
        Self {
            burst_size: BURST_SIZE,
            ingress,
            egress: vec![EgressTarget::primary(primary)],
            mode: FwdMode::Forward,
            inspect_before_forward: false,
        }
    }

    pub fn with_mirror(mut self, port: PortId) -> Self {
        self.egress.push(EgressTarget::mirror(port));
        self
    }

    pub fn with_burst_size(mut self, burst_size: usize) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub fn primary(&self) -> Option<PortId> {
        self.egress
            .iter()
            .find(|t| t.role == EgressRole::Primary)
            .map(|t| t.port)
    }

    pub fn mirrors(&self) -> impl Iterator<Item = PortId> + '_ {
        self.egress
            .iter()
            .filter(|t| t.role == EgressRole::Mirror)
            .map(|t| t.port)
    }

    fn validate(&self) -> Result<()> {
        if self.burst_size == 0 || self.burst_size > MAX_BURST {
            return Err(Error::Config(format!(
                "burst size {} outside 1..={MAX_BURST}",
                self.burst_size
            )));
        }
        let primaries = self
            .egress
            .iter()
            .filter(|t| t.role == EgressRole::Primary)
            .count();
        if self.mode == FwdMode::Forward && primaries != 1 {
            return Err(Error::Config(format!(
                "exactly one primary egress required, found {primaries}"
            )));
        }
        if primaries > 1 {
            return Err(Error::Config(format!(
                "at most one primary egress allowed, found {primaries}"
            )));
        }
        Ok(())
    }
}

impl Default for FwdConfig {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

/// Running counters, shared with whoever reports rates.
#[derive(Debug, Default)]
pub struct FwdStats {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub mirrored: AtomicU64,
    /// Buffers a mirror port did not accept.
    pub mirror_shortfall: AtomicU64,
    pub reclaimed: AtomicU64,
    pub inspected: AtomicU64,
    pub bursts: AtomicU64,
    pub idle_polls: AtomicU64,
}

impl FwdStats {
    pub fn snapshot(&self) -> FwdCounters {
        FwdCounters {
            rx: self.rx.load(Ordering::Relaxed),
            tx: self.tx.load(Ordering::Relaxed),
            mirrored: self.mirrored.load(Ordering::Relaxed),
            mirror_shortfall: self.mirror_shortfall.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            inspected: self.inspected.load(Ordering::Relaxed),
            bursts: self.bursts.load(Ordering::Relaxed),
            idle_polls: self.idle_polls.load(Ordering::Relaxed),
        }
    }

    fn record(&self, r: &BurstReport) {
        self.rx.fetch_add(r.received as u64, Ordering::Relaxed);
        self.tx.fetch_add(r.sent as u64, Ordering::Relaxed);
        self.mirrored.fetch_add(r.mirrored as u64, Ordering::Relaxed);
        self.mirror_shortfall
            .fetch_add(r.mirror_shortfall as u64, Ordering::Relaxed);
        self.reclaimed.fetch_add(r.reclaimed as u64, Ordering::Relaxed);
        self.inspected.fetch_add(r.inspected as u64, Ordering::Relaxed);
        self.bursts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`FwdStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwdCounters {
    pub rx: u64,
    pub tx: u64,
    pub mirrored: u64,
    pub mirror_shortfall: u64,
    pub reclaimed: u64,
    pub inspected: u64,
    pub bursts: u64,
    pub idle_polls: u64,
}

impl FwdCounters {
    /// Counter increase since `earlier`.
    pub fn delta(&self, earlier: &FwdCounters) -> FwdCounters {
        FwdCounters {
            rx: self.rx.saturating_sub(earlier.rx),
            tx: self.tx.saturating_sub(earlier.tx),
            mirrored: self.mirrored.saturating_sub(earlier.mirrored),
            mirror_shortfall: self.mirror_shortfall.saturating_sub(earlier.mirror_shortfall),
            reclaimed: self.reclaimed.saturating_sub(earlier.reclaimed),
            inspected: self.inspected.saturating_sub(earlier.inspected),
            bursts: self.bursts.saturating_sub(earlier.bursts),
            idle_polls: self.idle_polls.saturating_sub(earlier.idle_polls),
        }
    }
}

/// Outcome of one iteration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BurstReport {
    pub received: usize,
    /// Copies accepted by all mirrors together.
    pub mirrored: usize,
    pub mirror_shortfall: usize,
    /// Buffers now owned by the primary transmit queue.
    pub sent: usize,
    pub reclaimed: usize,
    pub inspected: usize,
}

impl BurstReport {
    pub fn is_idle(&self) -> bool {
        self.received == 0
    }
}

pub struct ForwardingEngine<D: EthDev> {
    registry: PortRegistry<D>,
    cfg: FwdConfig,
    primary: Option<PortId>,
    mirrors: Vec<PortId>,
    cache: MempoolCache,
    burst: Burst,
    inspector: Option<Box<dyn Inspector + Send>>,
    stats: Arc<FwdStats>,
    local_socket: Option<SocketId>,
}

impl<D: EthDev> ForwardingEngine<D> {
    /// Builds an engine over ready ports.
    ///
    /// Every port `cfg` names must be registered and started, and the
    /// ingress port must have a receive pool; reclaimed buffers go back to
    /// that pool.
    pub fn new(dev: &D, registry: PortRegistry<D>, cfg: FwdConfig) -> Result<Self> {
        cfg.validate()?;
        let ports = std::iter::once(cfg.ingress).chain(cfg.egress.iter().map(|t| t.port));
        for port in ports {
            let session = registry.get(port).ok_or(Error::InvalidPort(port))?;
            if !matches!(session.state(), PortState::Started | PortState::Running) {
                return Err(Error::Config(format!(
                    "port {port} is {:?}, not started",
                    session.state()
                )));
            }
        }
        let pool = registry
            .get(cfg.ingress)
            .and_then(|s| s.pool())
            .ok_or_else(|| Error::Config(format!("ingress port {} has no receive pool", cfg.ingress)))?;
        let cache = pool.cache();

        let primary = match cfg.mode {
            FwdMode::Forward => cfg.primary(),
            FwdMode::InspectOnly => None,
        };
        let mirrors = match cfg.mode {
            FwdMode::Forward => cfg.mirrors().collect(),
            FwdMode::InspectOnly => Vec::new(),
        };

        Ok(Self {
            registry,
            primary,
            mirrors,
            cfg,
            cache,
            burst: Burst::new(),
            inspector: None,
            stats: Arc::new(FwdStats::default()),
            local_socket: dev.local_socket_id(),
        })
    }

    pub fn with_inspector(mut self, inspector: Box<dyn Inspector + Send>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn config(&self) -> &FwdConfig {
        &self.cfg
    }

    pub fn registry(&self) -> &PortRegistry<D> {
        &self.registry
    }

    pub fn stats(&self) -> Arc<FwdStats> {
        self.stats.clone()
    }

    /// Runs one iteration.
    pub fn poll_once(&mut self) -> BurstReport {
        let mut report = BurstReport::default();
        let Some(rxq) = self
            .registry
            .get_mut(self.cfg.ingress)
            .and_then(|s| s.rx_queue(0))
        else {
            return report;
        };
        let n = rxq.rx_burst(&mut self.burst, self.cfg.burst_size);
        if unlikely(n == 0) {
            self.stats.idle_polls.fetch_add(1, Ordering::Relaxed);
            // Completed transmits still pin buffers until the queue is polled.
            if let Some(txq) = self
                .primary
                .and_then(|port| self.registry.get_mut(port))
                .and_then(|s| s.tx_queue(0))
            {
                txq.tx_done_cleanup();
            }
            return report;
        }
        report.received = n;

        let inspect = self.cfg.mode == FwdMode::InspectOnly || self.cfg.inspect_before_forward;
        if inspect {
            if let Some(inspector) = self.inspector.as_mut() {
                for m in &self.burst {
                    inspector.inspect(m);
                }
                report.inspected = n;
            }
        }

        for &port in &self.mirrors {
            let Some(txq) = self.registry.get_mut(port).and_then(|s| s.tx_queue(0)) else {
                continue;
            };
            let accepted = txq.tx_burst_copy(&self.burst);
            report.mirrored += accepted;
            if accepted < n {
                report.mirror_shortfall += n - accepted;
                trace!(port, accepted, offered = n, "mirror accepted partial burst");
            }
        }

        if let Some(port) = self.primary {
            if let Some(txq) = self.registry.get_mut(port).and_then(|s| s.tx_queue(0)) {
                report.sent = txq.tx_burst(&mut self.burst);
            }
        }
        debug_assert_eq!(report.sent + self.burst.len(), n);

        report.reclaimed = self.burst.len();
        if likely(self.burst.is_empty()) {
            self.stats.record(&report);
            return report;
        }
        for m in self.burst.drain(..) {
            self.cache.free(m);
        }
        self.stats.record(&report);
        report
    }

    /// Warns about ports on a remote NUMA node and moves every port the
    /// engine uses to `Running`.
    pub fn prepare(&mut self) -> Result<()> {
        let ports: Vec<PortId> = std::iter::once(self.cfg.ingress)
            .chain(self.cfg.egress.iter().map(|t| t.port))
            .collect();
        for port in ports {
            let session = self.registry.get_mut(port).ok_or(Error::InvalidPort(port))?;
            session.check_numa_affinity(self.local_socket);
            session.mark_running()?;
        }
        Ok(())
    }

    /// Polls until `stop` is set. The flag is checked once per iteration.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        self.prepare()?;
        info!(
            ingress = self.cfg.ingress,
            primary = ?self.primary,
            mirrors = ?self.mirrors,
            burst = self.cfg.burst_size,
            mode = ?self.cfg.mode,
            "forwarding started on NUMA node {:?}, Ctrl+C to quit",
            self.local_socket
        );
        while !stop.load(Ordering::SeqCst) {
            self.poll_once();
        }
        self.cache.flush();
        info!(stats = ?self.stats.snapshot(), "forwarding stopped");
        Ok(())
    }
}

impl<D: EthDev> fmt::Debug for ForwardingEngine<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingEngine")
            .field("cfg", &self.cfg)
            .field("cached", &self.cache.len())
            .field("inspector", &self.inspector.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mempool::{Mbuf, Mempool};
    use crate::port::{PortConf, PortSession};
    use crate::sim::SimDevice;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    struct Rig {
        dev: SimDevice,
        pool: Mempool,
    }

    impl Rig {
        fn new(nb_ports: u16, nb_bufs: usize) -> Self {
            Self {
                dev: SimDevice::with_ports(nb_ports).with_local_socket(Some(0)),
                pool: Mempool::create("fwd-test", nb_bufs, 0, 512).unwrap(),
            }
        }

        fn engine(&self, cfg: FwdConfig) -> ForwardingEngine<SimDevice> {
            let sessions = self.dev.port_ids().into_iter().map(|p| {
                PortSession::init(&self.dev, p, &PortConf::default(), &self.pool).unwrap()
            });
            let registry = PortRegistry::new(sessions).unwrap();
            ForwardingEngine::new(&self.dev, registry, cfg).unwrap()
        }

        fn inject(&self, port: PortId, n: usize) {
            let p = self.dev.port(port).unwrap();
            for i in 0..n {
                assert!(p.inject(&[i as u8; 64]));
            }
        }
    }

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<(usize, u16)>>>);

    impl Inspector for Seen {
        fn inspect(&mut self, m: &Mbuf) {
            self.0.lock().unwrap().push((m.data()[0] as usize, m.data_len()));
        }
    }

    #[test]
    fn test_all_accepted_nothing_reclaimed() {
        let rig = Rig::new(2, 64);
        let mut eng = rig.engine(FwdConfig::new(0, 1));
        rig.inject(0, 10);
        let r = eng.poll_once();
        assert_eq!(r.received, 10);
        assert_eq!(r.sent, 10);
        assert_eq!(r.reclaimed, 0);
        assert_eq!(rig.dev.port(1).unwrap().tx_pending(0), 10);
        assert_eq!(rig.pool.in_use_count(), 10);
    }

    #[test]
    fn test_partial_transmit_reclaims_tail() {
        let rig = Rig::new(3, 64);
        let mut eng = rig.engine(FwdConfig::new(0, 1).with_mirror(2));
        rig.dev.port(2).unwrap().set_tx_accept_limit(Some(4));
        rig.dev.port(1).unwrap().set_tx_accept_limit(Some(7));
        rig.inject(0, 10);

        let free_before = rig.pool.avail_count();
        let r = eng.poll_once();
        assert_eq!(r.received, 10);
        assert_eq!(r.mirrored, 4);
        assert_eq!(r.mirror_shortfall, 6);
        assert_eq!(r.sent, 7);
        assert_eq!(r.reclaimed, 3);

        let held: Vec<u8> = rig
            .dev
            .port(1)
            .unwrap()
            .tx_pending_frames(0)
            .iter()
            .map(|f| f[0])
            .collect();
        assert_eq!(held, (0..7).collect::<Vec<u8>>());
        // 10 buffers left the pool on receive; 3 came back.
        assert_eq!(rig.pool.avail_count(), free_before - 10 + 3);
        assert_eq!(rig.pool.in_use_count(), 7);
        assert_eq!(rig.dev.port(2).unwrap().take_transmitted().len(), 4);
    }

    #[test]
    fn test_idle_poll_changes_nothing() {
        let rig = Rig::new(2, 32);
        let seen = Seen::default();
        let mut cfg = FwdConfig::new(0, 1);
        cfg.inspect_before_forward = true;
        let mut eng = rig.engine(cfg).with_inspector(Box::new(seen.clone()));
        let (avail, in_use) = (rig.pool.avail_count(), rig.pool.in_use_count());
        let r = eng.poll_once();
        assert!(r.is_idle());
        assert_eq!(r, BurstReport::default());
        assert_eq!(rig.pool.avail_count(), avail);
        assert_eq!(rig.pool.in_use_count(), in_use);
        assert!(seen.0.lock().unwrap().is_empty());
        assert_eq!(rig.dev.port(1).unwrap().tx_pending(0), 0);
        let s = eng.stats().snapshot();
        assert_eq!(s.idle_polls, 1);
        assert_eq!(s.bursts, 0);
    }

    #[test]
    fn test_idle_poll_completes_primary_transmits() {
        let rig = Rig::new(2, 32);
        let mut eng = rig.engine(FwdConfig::new(0, 1));
        rig.inject(0, 5);
        assert_eq!(eng.poll_once().sent, 5);
        assert_eq!(rig.pool.in_use_count(), 5);
        assert!(eng.poll_once().is_idle());
        assert_eq!(rig.pool.in_use_count(), 0);
        assert_eq!(rig.dev.port(1).unwrap().tx_pending(0), 0);
        assert_eq!(rig.dev.port(1).unwrap().take_transmitted().len(), 5);
    }

    #[test]
    fn test_reclaimed_buffers_feed_later_receives() {
        let dev = SimDevice::with_ports(2);
        let pool = Mempool::create("fwd-staged", 12, 8, 512).unwrap();
        let sessions = dev
            .port_ids()
            .into_iter()
            .map(|p| PortSession::init(&dev, p, &PortConf::default(), &pool).unwrap());
        let registry = PortRegistry::new(sessions).unwrap();
        let mut eng = ForwardingEngine::new(&dev, registry, FwdConfig::new(0, 1)).unwrap();
        let ingress = dev.port(0).unwrap();
        let primary = dev.port(1).unwrap();
        primary.set_tx_accept_limit(Some(0));
        for i in 0..40u8 {
            assert!(ingress.inject(&[i; 64]));
        }

        let r = eng.poll_once();
        assert_eq!((r.received, r.reclaimed), (12, 12));
        assert_eq!(pool.ring_count(), 0);

        primary.set_tx_accept_limit(None);
        for _ in 0..100 {
            eng.poll_once();
        }
        assert_eq!(ingress.rx_pending(), 0);
        assert_eq!(eng.stats().snapshot().rx, 40);
        assert_eq!(primary.take_transmitted().len(), 28);
        assert_eq!(pool.avail_count(), 12);
        assert!(pool.alloc().is_some());
    }

    #[test]
    fn test_burst_size_bounds_receive() {
        let rig = Rig::new(2, 128);
        let mut eng = rig.engine(FwdConfig::new(0, 1));
        rig.inject(0, 70);
        assert_eq!(eng.poll_once().received, BURST_SIZE);
        assert_eq!(eng.poll_once().received, BURST_SIZE);
        assert_eq!(eng.poll_once().received, 6);
        assert!(eng.poll_once().is_idle());
    }

    #[test]
    fn test_inspect_only_reclaims_everything() {
        let rig = Rig::new(2, 32);
        let seen = Seen::default();
        let mut cfg = FwdConfig::new(0, 1);
        cfg.mode = FwdMode::InspectOnly;
        let mut eng = rig.engine(cfg).with_inspector(Box::new(seen.clone()));
        rig.inject(0, 5);
        let r = eng.poll_once();
        assert_eq!(r.inspected, 5);
        assert_eq!(r.sent, 0);
        assert_eq!(r.reclaimed, 5);
        assert_eq!(rig.pool.in_use_count(), 0);
        assert_eq!(rig.dev.port(1).unwrap().tx_pending(0), 0);
        let seen = seen.0.lock().unwrap();
        assert_eq!(seen.len(), 5);
        assert!(seen.iter().all(|&(_, len)| len == 64));
    }

    #[test]
    fn test_inspect_before_forward_sees_full_burst() {
        let rig = Rig::new(2, 32);
        let seen = Seen::default();
        let mut cfg = FwdConfig::new(0, 1);
        cfg.inspect_before_forward = true;
        let mut eng = rig.engine(cfg).with_inspector(Box::new(seen.clone()));
        rig.inject(0, 3);
        let r = eng.poll_once();
        assert_eq!((r.inspected, r.sent), (3, 3));
        let firsts: Vec<usize> = seen.0.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(firsts, vec![0, 1, 2]);
    }

    #[test]
    fn test_config_validation() {
        let build = |cfg: FwdConfig| {
            let rig = Rig::new(2, 16);
            let sessions = rig.dev.port_ids().into_iter().map(|p| {
                PortSession::init(&rig.dev, p, &PortConf::default(), &rig.pool).unwrap()
            });
            let registry = PortRegistry::new(sessions).unwrap();
            ForwardingEngine::new(&rig.dev, registry, cfg).map(|_| ())
        };

        assert!(build(FwdConfig::new(0, 1)).is_ok());
        assert!(build(FwdConfig::new(0, 1).with_burst_size(0)).is_err());
        assert!(build(FwdConfig::new(0, 1).with_burst_size(MAX_BURST + 1)).is_err());

        let mut cfg = FwdConfig::new(0, 1);
        cfg.egress.push(EgressTarget::primary(0));
        assert!(matches!(build(cfg), Err(Error::Config(_))));

        let mut cfg = FwdConfig::new(0, 1);
        cfg.egress.clear();
        assert!(matches!(build(cfg), Err(Error::Config(_))));

        assert!(matches!(build(FwdConfig::new(0, 5)), Err(Error::InvalidPort(5))));

        let rig = Rig::new(2, 16);
        let unstarted = PortRegistry::new(vec![
            PortSession::<SimDevice>::new(0),
            PortSession::new(1),
        ])
        .unwrap();
        assert!(ForwardingEngine::new(&rig.dev, unstarted, FwdConfig::new(0, 1)).is_err());
    }

    #[test]
    fn test_run_stops_on_flag() {
        let rig = Rig::new(2, 64);
        let mut eng = rig.engine(FwdConfig::new(0, 1));
        rig.inject(0, 20);
        let stats = eng.stats();
        let stop = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| {
                while stats.rx.load(Ordering::Relaxed) < 20 {
                    thread::sleep(Duration::from_millis(1));
                }
                stop.store(true, Ordering::SeqCst);
            });
            eng.run(&stop).unwrap();
        });
        assert_eq!(stats.snapshot().rx, 20);
        for p in eng.registry().iter() {
            assert_eq!(p.state(), PortState::Running);
        }
    }
}
