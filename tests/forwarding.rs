use basicfwd::api::{EthDev, PortId, TxOffloads};
use basicfwd::forward::{FwdConfig, ForwardingEngine};
use basicfwd::mempool::{Mbuf, Mempool, PoolConf};
use basicfwd::port::{PortConf, PortRegistry, PortSession};
use basicfwd::sim::{SimDevice, SimPortSpec, SimStep};
use basicfwd::startup;
use proptest::prelude::*;

const INGRESS: PortId = 0;
const PRIMARY: PortId = 1;
const MIRROR: PortId = 2;

fn engine(dev: &SimDevice, pool: &Mempool, cfg: FwdConfig) -> ForwardingEngine<SimDevice> {
    let sessions = dev
        .port_ids()
        .into_iter()
        .map(|p| PortSession::init(dev, p, &PortConf::default(), pool).unwrap());
    let registry = PortRegistry::new(sessions).unwrap();
    ForwardingEngine::new(dev, registry, cfg).unwrap()
}

fn inject(dev: &SimDevice, n: usize) {
    let port = dev.port(INGRESS).unwrap();
    for i in 0..n {
        assert!(port.inject(&[i as u8; 60]));
    }
}

#[test]
fn partial_transmit_reclaims_unaccepted_tail() {
    let dev = SimDevice::with_ports(3);
    let pool = Mempool::create("partial", 128, 0, 512).unwrap();
    let mut eng = engine(&dev, &pool, FwdConfig::new(INGRESS, PRIMARY).with_mirror(MIRROR));
    dev.port(MIRROR).unwrap().set_tx_accept_limit(Some(4));
    dev.port(PRIMARY).unwrap().set_tx_accept_limit(Some(7));
    inject(&dev, 10);

    // Free count once the 10 buffers have been received.
    let after_rx = pool.avail_count() - 10;
    let report = eng.poll_once();
    assert_eq!(report.received, 10);
    assert_eq!(report.sent, 7);
    assert_eq!(report.reclaimed, 3);
    assert_eq!(pool.avail_count(), after_rx + 3);

    let held: Vec<u8> = dev
        .port(PRIMARY)
        .unwrap()
        .tx_pending_frames(0)
        .iter()
        .map(|f| f[0])
        .collect();
    assert_eq!(held, vec![0, 1, 2, 3, 4, 5, 6]);
    assert_eq!(dev.port(MIRROR).unwrap().take_transmitted().len(), 4);
}

#[test]
fn startup_stops_at_failing_capability_query() {
    let mut specs: Vec<_> = (0..3).map(SimPortSpec::numbered).collect();
    specs[1].fail_at = Some((SimStep::DevInfo, -libc::EIO));
    let dev = SimDevice::new(specs);
    let conf = PoolConf {
        mbufs_per_port: 32,
        cache_size: 0,
        buf_size: 512,
    };

    let err = startup::bring_up(&dev, &conf, &PortConf::default())
        .err()
        .unwrap();
    assert!(err.to_string().contains("port 1"), "{err}");
    assert!(!dev.port(2).unwrap().touched());
    assert!(!dev.port(2).unwrap().is_started());
}

#[test]
fn zero_burst_is_a_no_op() {
    let dev = SimDevice::with_ports(2);
    let pool = Mempool::create("idle", 64, 0, 512).unwrap();
    let mut eng = engine(&dev, &pool, FwdConfig::new(INGRESS, PRIMARY));
    let before = (pool.avail_count(), pool.in_use_count(), pool.ring_count());
    for _ in 0..10 {
        assert!(eng.poll_once().is_idle());
    }
    assert_eq!(before, (pool.avail_count(), pool.in_use_count(), pool.ring_count()));
    assert_eq!(dev.port(PRIMARY).unwrap().tx_pending(0), 0);
    assert_eq!(eng.stats().snapshot().idle_polls, 10);
}

proptest! {
    #[test]
    fn ownership_is_conserved(
        injected in 0usize..80,
        burst in 1usize..=64,
        primary_limit in proptest::option::of(0usize..64),
        mirror_limit in proptest::option::of(0usize..64),
    ) {
        let dev = SimDevice::with_ports(3);
        let pool = Mempool::create("conserve", 256, 0, 512).unwrap();
        let cfg = FwdConfig::new(INGRESS, PRIMARY)
            .with_mirror(MIRROR)
            .with_burst_size(burst);
        let mut eng = engine(&dev, &pool, cfg);
        dev.port(PRIMARY).unwrap().set_tx_accept_limit(primary_limit);
        dev.port(MIRROR).unwrap().set_tx_accept_limit(mirror_limit);
        inject(&dev, injected);

        let r = eng.poll_once();
        let n = injected.min(burst);
        prop_assert_eq!(r.received, n);
        prop_assert_eq!(r.sent + r.reclaimed, n);
        prop_assert_eq!(r.sent, primary_limit.map_or(n, |l| n.min(l)));
        prop_assert_eq!(r.mirrored, mirror_limit.map_or(n, |l| n.min(l)));
        prop_assert_eq!(dev.port(PRIMARY).unwrap().tx_pending(0), r.sent);
        prop_assert_eq!(dev.port(MIRROR).unwrap().tx_pending(0), 0);
        // Only the primary queue may still own buffers.
        prop_assert_eq!(pool.in_use_count(), r.sent);
        prop_assert_eq!(pool.avail_count() + pool.in_use_count(), pool.capacity());
    }

    #[test]
    fn fast_free_follows_capability(bits in any::<u64>()) {
        let capa = TxOffloads::from_bits_retain(bits);
        let dev = SimDevice::new(vec![SimPortSpec {
            tx_offload_capa: capa,
            ..Default::default()
        }]);
        let pool = Mempool::create("capa", 16, 0, 512).unwrap();
        let session = PortSession::init(&dev, 0, &PortConf::default(), &pool).unwrap();
        let seen = dev.port(0).unwrap().tx_queue_conf(0).unwrap();
        let advertised = capa.contains(TxOffloads::MBUF_FAST_FREE);
        prop_assert_eq!(seen.offloads.contains(TxOffloads::MBUF_FAST_FREE), advertised);
        prop_assert_eq!(session.tx_offloads().contains(TxOffloads::MBUF_FAST_FREE), advertised);
        prop_assert!((seen.offloads - capa).is_empty());
    }

    #[test]
    fn exhausted_pool_returns_nothing(capacity in 1usize..300) {
        let pool = Mempool::create("exhaust", capacity, 0, 256).unwrap();
        let held: Vec<Mbuf> = (0..capacity).map(|_| pool.alloc().unwrap()).collect();
        prop_assert!(pool.alloc().is_none());
        prop_assert!(pool.alloc().is_none());
        prop_assert_eq!(pool.in_use_count(), capacity);
        prop_assert_eq!(pool.avail_count(), 0);
        for m in held {
            pool.release(m);
        }
        prop_assert_eq!(pool.avail_count(), capacity);
        prop_assert!(pool.alloc().is_some());
    }
}
