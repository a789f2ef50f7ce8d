use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[cfg(all(feature = "af_packet", target_os = "linux"))]
use basicfwd::af_packet::AfPacketDevice;
use basicfwd::api::{EthDev, PortId};
use basicfwd::diag::{DEFAULT_DUMP_BYTES, DUMP_FILE, PacketDump};
use basicfwd::forward::{BURST_SIZE, FwdConfig, FwdMode, FwdStats, ForwardingEngine};
use basicfwd::mempool::{MBUF_CACHE_SIZE, MBUF_DEFAULT_BUF_SIZE, NUM_MBUFS, PoolConf};
use basicfwd::port::{PortConf, RX_RING_SIZE, TX_RING_SIZE};
use basicfwd::sim::{FrameGen, SimDevice, SimPort};
use basicfwd::startup;
use basicfwd::telemetry::{LogConfig, LogFormat, init_logging};

/// Forwards bursts of frames from one port to another, optionally
/// mirroring them to more ports.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Buffers pulled per polling iteration.
    #[clap(long, default_value_t = BURST_SIZE)]
    burst: usize,
    /// Requested receive ring size per port.
    #[clap(long, default_value_t = RX_RING_SIZE)]
    rx_desc: u16,
    /// Requested transmit ring size per port.
    #[clap(long, default_value_t = TX_RING_SIZE)]
    tx_desc: u16,
    #[clap(long, default_value_t = NUM_MBUFS)]
    mbufs_per_port: u32,
    #[clap(long, default_value_t = MBUF_CACHE_SIZE)]
    mbuf_cache: u32,
    /// Port to receive from.
    #[clap(long, default_value_t = 0)]
    ingress: PortId,
    /// Port that owns forwarded buffers. Defaults to the ingress port's
    /// pair (0<->1, 2<->3, ...).
    #[clap(long)]
    primary: Option<PortId>,
    /// Port to send a best-effort copy of every burst to. Repeatable.
    #[clap(long)]
    mirror: Vec<PortId>,
    /// Dump every received buffer before forwarding it.
    #[clap(long)]
    inspect: bool,
    /// Dump every received buffer and drop it instead of forwarding.
    #[clap(long, conflicts_with = "inspect")]
    inspect_only: bool,
    #[clap(long, default_value = DUMP_FILE)]
    dump_file: PathBuf,
    /// Packet bytes hexdumped per record.
    #[clap(long, default_value_t = DEFAULT_DUMP_BYTES)]
    dump_bytes: usize,
    /// Seconds between rate reports; 0 disables them.
    #[clap(long, default_value_t = 1)]
    stats_interval: u64,
    #[clap(long, default_value = "info")]
    log_level: String,
    #[clap(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Choose the device layer.
    #[clap(subcommand)]
    backend: Backend,
}

#[derive(Subcommand, Debug, Clone)]
enum Backend {
    /// Drive network interfaces through AF_PACKET sockets.
    #[cfg(all(feature = "af_packet", target_os = "linux"))]
    AfPacket(AfPacketArgs),
    /// Use simulated ports fed by a random frame generator.
    Sim(SimArgs),
}

#[cfg(all(feature = "af_packet", target_os = "linux"))]
#[derive(Parser, Debug, Clone)]
struct AfPacketArgs {
    /// Interface to bind, in port id order. Repeatable.
    #[clap(long = "iface", required = true)]
    ifaces: Vec<String>,
}

#[derive(Parser, Debug, Clone)]
struct SimArgs {
    #[clap(long, default_value_t = 2)]
    ports: u16,
    /// Frames per second injected on the ingress port.
    #[clap(long, default_value_t = 100_000)]
    pps: u64,
}

pub fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&LogConfig {
        level: args.log_level.clone(),
        format: args.log_format,
    });

    // Set up a termination flag triggered on Ctrl-C.
    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .context("cannot install Ctrl-C handler")?;
    }

    let start = Instant::now();
    match args.backend.clone() {
        #[cfg(all(feature = "af_packet", target_os = "linux"))]
        Backend::AfPacket(af_args) => {
            let dev = AfPacketDevice::open(&af_args.ifaces).context("cannot open interfaces")?;
            for (port, name) in af_args.ifaces.iter().enumerate() {
                info!("port {} is interface {}", port, name);
            }
            run(dev, &args, start, term, None)
        }
        Backend::Sim(sim_args) => {
            if sim_args.ports == 0 {
                bail!("--ports must be at least 1");
            }
            let dev = SimDevice::with_ports(sim_args.ports);
            let feed = SimFeed {
                ports: dev.port_ids().iter().filter_map(|&p| dev.port(p).cloned()).collect(),
                ingress: args.ingress,
                pps: sim_args.pps,
            };
            run(dev, &args, start, term, Some(feed))
        }
    }
}

/// Traffic source and sink for the simulated ports.
struct SimFeed {
    ports: Vec<Arc<SimPort>>,
    ingress: PortId,
    pps: u64,
}

impl SimFeed {
    /// Injects frames on the ingress port at roughly `pps` and discards
    /// whatever every port transmits, until `term` is set.
    fn spawn(self, term: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
        let ingress = self
            .ports
            .iter()
            .find(|p| p.id() == self.ingress)
            .cloned()
            .with_context(|| format!("no simulated port {}", self.ingress))?;
        let peer = self
            .ports
            .iter()
            .find(|p| p.id() != self.ingress)
            .map_or(ingress.spec().mac, |p| p.spec().mac);
        let mut frames = FrameGen::new(peer, ingress.spec().mac, rand::random());
        let per_tick = self.pps.div_ceil(1000);
        let handle = thread::Builder::new()
            .name("sim-feed".into())
            .spawn(move || {
                while !term.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(1));
                    for _ in 0..per_tick {
                        match frames.next_frame() {
                            Ok(frame) => {
                                ingress.inject(&frame);
                            }
                            Err(e) => {
                                warn!(error = %e, "frame generation failed");
                                break;
                            }
                        }
                    }
                    for port in &self.ports {
                        port.take_transmitted();
                    }
                }
                info!(
                    port = ingress.id(),
                    dropped = ingress.rx_dropped(),
                    nombuf = ingress.rx_nombuf(),
                    "sim feed stopped"
                );
            })?;
        Ok(handle)
    }
}

/// Periodically logs per-second rates from the engine counters.
fn spawn_meter(stats: Arc<FwdStats>, interval: Duration, term: Arc<AtomicBool>) -> Result<thread::JoinHandle<()>> {
    let handle = thread::Builder::new().name("meter".into()).spawn(move || {
        let secs = interval.as_secs_f64();
        let mut prev = stats.snapshot();
        let mut last = Instant::now();
        while !term.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(100));
            if last.elapsed() < interval {
                continue;
            }
            last = Instant::now();
            let curr = stats.snapshot();
            let d = curr.delta(&prev);
            info!(
                "pkt/sec: {:.0} fwd/sec: {:.0} mirror/sec: {:.0} reclaim/sec: {:.0}",
                d.rx as f64 / secs,
                d.tx as f64 / secs,
                d.mirrored as f64 / secs,
                d.reclaimed as f64 / secs
            );
            prev = curr;
        }
    })?;
    Ok(handle)
}

/// Brings every port up, then forwards until Ctrl-C.
fn run<D: EthDev>(dev: D, args: &Args, start: Instant, term: Arc<AtomicBool>, feed: Option<SimFeed>) -> Result<()> {
    let nb_ports = dev.port_ids().len();
    info!(
        "runtime initialised in {:?}: {} ports bound, polling on NUMA node {:?}",
        start.elapsed(),
        nb_ports,
        dev.local_socket_id()
    );

    let pool_conf = PoolConf {
        mbufs_per_port: args.mbufs_per_port,
        cache_size: args.mbuf_cache,
        buf_size: MBUF_DEFAULT_BUF_SIZE,
    };
    let port_conf = PortConf {
        nb_rxd: args.rx_desc,
        nb_txd: args.tx_desc,
        ..Default::default()
    };
    let dp = startup::bring_up(&dev, &pool_conf, &port_conf).context("initialisation failed")?;

    let primary = args.primary.unwrap_or_else(|| {
        let pair = args.ingress ^ 1;
        if usize::from(pair) < nb_ports { pair } else { args.ingress }
    });
    let mut cfg = FwdConfig::new(args.ingress, primary).with_burst_size(args.burst);
    for &port in &args.mirror {
        cfg = cfg.with_mirror(port);
    }
    if args.inspect_only {
        cfg.mode = FwdMode::InspectOnly;
    }
    cfg.inspect_before_forward = args.inspect;

    let mut engine = ForwardingEngine::new(&dev, dp.registry, cfg).context("invalid forwarding setup")?;
    if args.inspect || args.inspect_only {
        info!(path = %args.dump_file.display(), "dumping received packets");
        let dump = PacketDump::new(&args.dump_file).with_max_bytes(args.dump_bytes);
        engine = engine.with_inspector(Box::new(dump));
    }

    let mut handles = Vec::new();
    if args.stats_interval > 0 {
        handles.push(spawn_meter(
            engine.stats(),
            Duration::from_secs(args.stats_interval),
            term.clone(),
        )?);
    }
    if let Some(feed) = feed {
        handles.push(feed.spawn(term.clone())?);
    }

    let res = engine.run(&term);
    term.store(true, Ordering::SeqCst);
    for handle in handles {
        if handle.join().is_err() {
            warn!("helper thread panicked");
        }
    }
    res?;
    info!(
        pool_in_use = dp.pool.in_use_count(),
        pool_capacity = dp.pool.capacity(),
        "shutdown complete"
    );
    Ok(())
}
