//! Bring-up of the shared pool and every enumerated port.
//!
//! Any failure here is fatal for the process: ports are initialised one at
//! a time in id order and the first failing port stops the sequence, so no
//! later port is touched.

use tracing::{debug, info};

use crate::api::{EthDev, Result};
use crate::errors::Error;
use crate::mempool::{Mempool, PoolConf};
use crate::port::{PortConf, PortRegistry, PortSession};

pub const POOL_NAME: &str = "MBUF_POOL";

/// Creates the pool shared by all ports, sized `mbufs_per_port` times the
/// number of enumerated ports.
pub fn create_pool<D: EthDev>(dev: &D, conf: &PoolConf) -> Result<Mempool> {
    let nb_ports = dev.port_ids().len();
    if nb_ports == 0 {
        return Err(Error::NoPorts);
    }
    let pool = Mempool::from_conf(POOL_NAME, conf, nb_ports)?;
    debug!(
        name = POOL_NAME,
        capacity = pool.capacity(),
        cache = pool.cache_size(),
        buf_len = pool.buf_len(),
        "mbuf pool created"
    );
    Ok(pool)
}

/// Initialises every enumerated port on `pool`, stopping at the first
/// failure.
pub fn init_ports<D: EthDev>(dev: &D, pool: &Mempool, conf: &PortConf) -> Result<PortRegistry<D>> {
    let ids = dev.port_ids();
    if ids.is_empty() {
        return Err(Error::NoPorts);
    }
    let mut sessions = Vec::with_capacity(ids.len());
    for port in ids {
        let session = PortSession::init(dev, port, conf, pool)?;
        if let Some(mac) = session.mac() {
            info!("Port {} MAC: {}", port, mac.to_hex_string());
        }
        sessions.push(session);
    }
    PortRegistry::new(sessions)
}

/// Pool plus ready ports.
pub struct Dataplane<D: EthDev> {
    pub pool: Mempool,
    pub registry: PortRegistry<D>,
}

/// Runs the whole startup sequence: pool creation, then every port.
pub fn bring_up<D: EthDev>(dev: &D, pool_conf: &PoolConf, port_conf: &PortConf) -> Result<Dataplane<D>> {
    let pool = create_pool(dev, pool_conf)?;
    let registry = init_ports(dev, &pool, port_conf)?;
    info!(
        ports = registry.len(),
        numa_node = ?dev.local_socket_id(),
        "{} ports ready",
        registry.len()
    );
    Ok(Dataplane { pool, registry })
}
