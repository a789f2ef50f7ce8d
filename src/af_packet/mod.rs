//! Device layer over Linux `AF_PACKET` raw sockets.
//!
//! Each port is a network interface with one socket shared by its single
//! receive and transmit queue. Frames are copied between the socket and
//! pool buffers, so a transmitted buffer is complete as soon as the send
//! call returns. No transmit offloads are advertised.

use std::ffi::CString;
use std::fs;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use eui48::MacAddress;
use tracing::debug;

use crate::api::{
    Burst, DescLim, DevError, DevInfo, DevResult, EthConf, EthDev, PortId, RxConf, RxQueue, SocketId, TxConf,
    TxOffloads, TxQueue, resultify,
};
use crate::errors::Error;
use crate::lcore::parse_numa_node;
use crate::mempool::{Mbuf, Mempool};

const SYSFS_NET: &str = "/sys/class/net";
/// `sll_pkttype` of frames the host itself sent.
const PACKET_OUTGOING: u8 = 4;
const MAX_RING: u16 = 4096;

/// Maps a libc return value, `-1` with `errno` set on failure, to the
/// negative-code convention of the device layer.
fn check(ret: libc::c_int) -> DevResult<u32> {
    resultify(if ret < 0 { DevError::last_os_error().code() } else { ret })
}

/// Raw socket bound to one interface, non-blocking.
struct PacketSocket {
    fd: OwnedFd,
    ifindex: i32,
}

impl PacketSocket {
    fn open(ifindex: i32) -> DevResult<Self> {
        let proto = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain syscall with constant arguments.
        let raw = check(unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                i32::from(proto),
            )
        })?;
        // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw as libc::c_int) };

        // SAFETY: `sockaddr_ll` is plain data for which all-zero is valid.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = proto;
        addr.sll_ifindex = ifindex;
        // SAFETY: `addr` outlives the call and the length matches its type.
        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;
        Ok(Self { fd, ifindex })
    }

    fn set_promisc(&self) -> DevResult<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: self.ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        // SAFETY: `mreq` outlives the call and the length matches its type.
        check(unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_PACKET,
                libc::PACKET_ADD_MEMBERSHIP,
                &mreq as *const libc::packet_mreq as *const libc::c_void,
                mem::size_of::<libc::packet_mreq>() as libc::socklen_t,
            )
        })?;
        Ok(())
    }

    /// Receives one frame into `buf`. `Ok(None)` when nothing is pending.
    fn recv(&self, buf: &mut [u8]) -> io::Result<Option<(usize, u8)>> {
        // SAFETY: `sockaddr_ll` is plain data for which all-zero is valid.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        // SAFETY: `buf` and `addr` are valid for writes of the lengths passed.
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
                &mut addr as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut addr_len,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                _ => Err(e),
            };
        }
        Ok(Some((n as usize, addr.sll_pkttype)))
    }

    /// Sends one frame. `false` if the socket cannot take it right now.
    fn send(&self, frame: &[u8]) -> bool {
        // SAFETY: `frame` is valid for reads of `frame.len()` bytes.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                libc::MSG_DONTWAIT,
            )
        };
        n >= 0
    }
}

#[derive(Default)]
struct PortCtl {
    queues: Option<(u16, u16)>,
    socket: Option<Arc<PacketSocket>>,
    rx_ready: bool,
    tx_ready: bool,
}

struct AfPacketPort {
    name: String,
    ifindex: i32,
    sysfs: PathBuf,
    started: Arc<AtomicBool>,
    ctl: Mutex<PortCtl>,
}

impl AfPacketPort {
    fn lock(&self) -> MutexGuard<'_, PortCtl> {
        self.ctl.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn socket(&self, ctl: &mut PortCtl) -> DevResult<Arc<PacketSocket>> {
        if let Some(sock) = &ctl.socket {
            return Ok(sock.clone());
        }
        let sock = Arc::new(PacketSocket::open(self.ifindex)?);
        debug!(iface = %self.name, ifindex = self.ifindex, "packet socket opened");
        ctl.socket = Some(sock.clone());
        Ok(sock)
    }
}

/// Interfaces driven through `AF_PACKET`, numbered in the order given.
pub struct AfPacketDevice {
    ports: Vec<AfPacketPort>,
}

impl AfPacketDevice {
    pub fn open<S: AsRef<str>>(ifaces: &[S]) -> crate::api::Result<Self> {
        let mut ports = Vec::with_capacity(ifaces.len());
        for name in ifaces {
            let name = name.as_ref();
            let ifindex = if_index(name).map_err(|source| Error::Interface {
                name: name.to_string(),
                source,
            })?;
            ports.push(AfPacketPort {
                name: name.to_string(),
                ifindex,
                sysfs: Path::new(SYSFS_NET).join(name),
                started: Arc::new(AtomicBool::new(false)),
                ctl: Mutex::new(PortCtl::default()),
            });
        }
        Ok(Self { ports })
    }

    fn get(&self, port: PortId) -> DevResult<&AfPacketPort> {
        self.ports
            .get(usize::from(port))
            .ok_or(DevError::new(-libc::ENODEV))
    }

    pub fn if_name(&self, port: PortId) -> Option<&str> {
        self.ports.get(usize::from(port)).map(|p| p.name.as_str())
    }
}

fn if_index(name: &str) -> io::Result<i32> {
    let c_name = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_name` is a NUL-terminated string that outlives the call.
    let idx = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if idx == 0 {
        return Err(io::Error::last_os_error());
    }
    i32::try_from(idx).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_mac(sysfs: &Path) -> io::Result<MacAddress> {
    let raw = fs::read_to_string(sysfs.join("address"))?;
    parse_mac(&raw)
}

fn parse_mac(raw: &str) -> io::Result<MacAddress> {
    MacAddress::parse_str(raw.trim()).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

impl EthDev for AfPacketDevice {
    type Rx = AfPacketRxQueue;
    type Tx = AfPacketTxQueue;

    fn port_ids(&self) -> Vec<PortId> {
        (0..self.ports.len() as PortId).collect()
    }

    fn socket_id(&self, port: PortId) -> Option<SocketId> {
        let p = self.ports.get(usize::from(port))?;
        let raw = fs::read_to_string(p.sysfs.join("device").join("numa_node")).ok()?;
        parse_numa_node(&raw)
    }

    fn dev_info(&self, port: PortId) -> DevResult<DevInfo> {
        let p = self.get(port)?;
        let lim = DescLim {
            nb_min: 1,
            nb_max: MAX_RING,
            nb_align: 1,
        };
        Ok(DevInfo {
            driver_name: "af_packet".into(),
            if_name: p.name.clone(),
            max_rx_queues: 1,
            max_tx_queues: 1,
            tx_offload_capa: TxOffloads::empty(),
            rx_desc_lim: lim,
            tx_desc_lim: lim,
            default_rxconf: RxConf::default(),
            default_txconf: TxConf::default(),
        })
    }

    fn configure(&self, port: PortId, nb_rxq: u16, nb_txq: u16, conf: &EthConf) -> DevResult<()> {
        let p = self.get(port)?;
        if nb_rxq != 1 || nb_txq != 1 || !conf.txmode.offloads.is_empty() {
            return Err(DevError::new(-libc::EINVAL));
        }
        p.lock().queues = Some((nb_rxq, nb_txq));
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        _nb_desc: u16,
        _socket: Option<SocketId>,
        _conf: &RxConf,
        pool: &Mempool,
    ) -> DevResult<Self::Rx> {
        let p = self.get(port)?;
        let mut ctl = p.lock();
        if ctl.queues.is_none() || queue != 0 {
            return Err(DevError::new(-libc::EINVAL));
        }
        let sock = p.socket(&mut ctl)?;
        ctl.rx_ready = true;
        Ok(AfPacketRxQueue {
            port,
            sock,
            pool: pool.clone(),
            started: p.started.clone(),
        })
    }

    fn tx_queue_setup(
        &self,
        port: PortId,
        queue: u16,
        _nb_desc: u16,
        _socket: Option<SocketId>,
        conf: &TxConf,
    ) -> DevResult<Self::Tx> {
        let p = self.get(port)?;
        let mut ctl = p.lock();
        if ctl.queues.is_none() || queue != 0 || !conf.offloads.is_empty() {
            return Err(DevError::new(-libc::EINVAL));
        }
        let sock = p.socket(&mut ctl)?;
        ctl.tx_ready = true;
        Ok(AfPacketTxQueue {
            sock,
            started: p.started.clone(),
        })
    }

    fn start(&self, port: PortId) -> DevResult<()> {
        let p = self.get(port)?;
        let ctl = p.lock();
        if !(ctl.rx_ready && ctl.tx_ready) {
            return Err(DevError::new(-libc::EINVAL));
        }
        p.started.store(true, Ordering::Release);
        Ok(())
    }

    fn promiscuous_enable(&self, port: PortId) -> DevResult<()> {
        let p = self.get(port)?;
        let mut ctl = p.lock();
        let sock = p.socket(&mut ctl)?;
        sock.set_promisc()?;
        Ok(())
    }

    fn mac_addr(&self, port: PortId) -> DevResult<MacAddress> {
        let p = self.get(port)?;
        Ok(read_mac(&p.sysfs)?)
    }
}

pub struct AfPacketRxQueue {
    port: PortId,
    sock: Arc<PacketSocket>,
    pool: Mempool,
    started: Arc<AtomicBool>,
}

impl RxQueue for AfPacketRxQueue {
    fn rx_burst(&mut self, bufs: &mut Burst, nb_pkts: usize) -> usize {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }
        let want = nb_pkts.min(bufs.remaining_capacity());
        let mut received = 0;
        // Frames the host sent itself are skipped, but never loop unbounded.
        for _ in 0..want * 2 {
            if received == want {
                break;
            }
            let Some(mut m) = self.pool.alloc() else {
                break;
            };
            match self.sock.recv(m.room_mut()) {
                Ok(Some((_, PACKET_OUTGOING))) => continue,
                Ok(Some((len, _))) => {
                    m.set_len(len);
                    m.set_port(self.port);
                    bufs.push(m);
                    received += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(port = self.port, error = %e, "receive failed");
                    break;
                }
            }
        }
        received
    }
}

pub struct AfPacketTxQueue {
    sock: Arc<PacketSocket>,
    started: Arc<AtomicBool>,
}

impl AfPacketTxQueue {
    fn send_prefix(&self, bufs: &[Mbuf]) -> usize {
        if !self.started.load(Ordering::Acquire) {
            return 0;
        }
        bufs.iter().take_while(|m| self.sock.send(m.data())).count()
    }
}

impl TxQueue for AfPacketTxQueue {
    fn tx_burst(&mut self, bufs: &mut Burst) -> usize {
        let sent = self.send_prefix(bufs);
        // Sent frames are already on the wire; their buffers complete here.
        bufs.drain(..sent);
        sent
    }

    fn tx_burst_copy(&mut self, bufs: &[Mbuf]) -> usize {
        self.send_prefix(bufs)
    }

    fn tx_done_cleanup(&mut self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("52:54:00:12:34:56\n").unwrap();
        assert_eq!(mac.to_array(), [0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        assert!(parse_mac("not-a-mac").is_err());
    }

    #[test]
    fn test_read_mac_from_sysfs_layout() {
        let dir = std::env::temp_dir().join(format!("basicfwd-sysfs-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("address"), "02:00:00:00:00:07\n").unwrap();
        let mac = read_mac(&dir).unwrap();
        assert_eq!(mac.to_array(), [2, 0, 0, 0, 0, 7]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_syscall_failure_keeps_errno() {
        assert_eq!(check(7), Ok(7));
        // SAFETY: closing an invalid descriptor only sets errno.
        let err = check(unsafe { libc::close(-1) }).unwrap_err();
        assert_eq!(err.code(), -libc::EBADF);
    }

    #[test]
    fn test_unknown_interface_is_named() {
        let err = AfPacketDevice::open(&["no-such-if0"]).err().unwrap();
        assert!(err.to_string().contains("no-such-if0"), "{err}");
    }

    #[test]
    fn test_loopback_capabilities() {
        let dev = match AfPacketDevice::open(&["lo"]) {
            Ok(dev) => dev,
            Err(_) => return,
        };
        assert_eq!(dev.port_ids(), vec![0]);
        assert_eq!(dev.if_name(0), Some("lo"));
        let info = dev.dev_info(0).unwrap();
        assert!(!info.tx_offload_capa.contains(TxOffloads::MBUF_FAST_FREE));
        assert_eq!(dev.configure(0, 2, 1, &EthConf::default()).unwrap_err().code(), -libc::EINVAL);
        assert_eq!(dev.dev_info(3).unwrap_err().code(), -libc::ENODEV);
    }
}
