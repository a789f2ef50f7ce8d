//! Read-only packet inspection for operator visibility.
//!
//! An [`Inspector`] sees a buffer through a shared borrow that ends with the
//! call; it cannot keep the buffer, change its lengths or affect whether
//! it is forwarded.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, Write};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use etherparse::{Ethernet2HeaderSlice, NetHeaders, PacketHeaders};
use eui48::MacAddress;
use tracing::{debug, warn};

use crate::mempool::Mbuf;

/// Fixed location of the packet dump file.
pub const DUMP_FILE: &str = "/tmp/basicfwd.dump";

/// Content bytes written per record unless configured otherwise.
pub const DEFAULT_DUMP_BYTES: usize = 256;

const HEX_LINE: usize = 16;

pub trait Inspector {
    fn inspect(&mut self, m: &Mbuf);
}

/// Writes one record per inspected buffer to a file at a fixed path.
///
/// The file is recreated, and so truncated, on every inspection. If it
/// cannot be opened or written the record is skipped: the first failure is
/// logged as a warning, later ones at debug level.
pub struct PacketDump {
    path: PathBuf,
    max_bytes: usize,
    warned: bool,
    written: u64,
    failed: u64,
}

impl PacketDump {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes: DEFAULT_DUMP_BYTES,
            warned: false,
            written: 0,
            failed: 0,
        }
    }

    /// Limits the content bytes written per record.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written successfully.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Records skipped because the file could not be opened or written.
    pub fn failed(&self) -> u64 {
        self.failed
    }

    fn write_record(&self, record: &str) -> io::Result<()> {
        let mut file = File::create(&self.path)?;
        file.write_all(record.as_bytes())?;
        file.flush()
    }
}

impl Default for PacketDump {
    fn default() -> Self {
        Self::new(DUMP_FILE)
    }
}

impl Inspector for PacketDump {
    fn inspect(&mut self, m: &Mbuf) {
        let record = format_record(m, self.max_bytes);
        match self.write_record(&record) {
            Ok(()) => self.written += 1,
            Err(e) => {
                self.failed += 1;
                if !self.warned {
                    self.warned = true;
                    warn!(path = %self.path.display(), error = %e, "cannot write packet dump, skipping records");
                } else {
                    debug!(path = %self.path.display(), error = %e, "packet dump skipped");
                }
            }
        }
    }
}

/// Text record for `m`: length fields, a frame summary when the headers
/// parse, and a hexdump of at most `max_bytes` content bytes.
pub fn format_record(m: &Mbuf, max_bytes: usize) -> String {
    let mut out = String::new();
    let port = m.port().map_or_else(|| "-".to_string(), |p| p.to_string());
    let _ = writeln!(
        out,
        "mbuf {} port={} buf_len={} data_off={}",
        m.index(),
        port,
        m.buf_len(),
        m.data_off()
    );
    let _ = writeln!(out, "  pkt_len={} nb_segs=1", m.pkt_len());
    let _ = writeln!(out, "  segment data_len={}", m.data_len());
    if let Some(summary) = describe_frame(m.data()) {
        let _ = writeln!(out, "  {summary}");
    }
    hexdump(&mut out, &m.data()[..m.data().len().min(max_bytes)]);
    out
}

/// Appends a hexdump of `data` to `out`, sixteen bytes per line, each line
/// prefixed with its offset.
pub fn hexdump(out: &mut String, data: &[u8]) {
    for (i, line) in data.chunks(HEX_LINE).enumerate() {
        let _ = write!(out, "  {:08x}:", i * HEX_LINE);
        for b in line {
            let _ = write!(out, " {b:02x}");
        }
        out.push('\n');
    }
}

/// Ethernet addresses and EtherType, followed by the IP addresses when the
/// frame carries IPv4 or IPv6. `None` if not even the Ethernet header
/// parses.
pub fn describe_frame(frame: &[u8]) -> Option<String> {
    let eth = Ethernet2HeaderSlice::from_slice(frame).ok()?;
    let mut out = format!(
        "{} > {} type {:#06x}",
        MacAddress::new(eth.source()).to_hex_string(),
        MacAddress::new(eth.destination()).to_hex_string(),
        eth.ether_type().0
    );
    if let Some(ip) = ip_addrs(frame) {
        out.push_str(", ");
        out.push_str(&ip);
    }
    Some(out)
}

fn ip_addrs(frame: &[u8]) -> Option<String> {
    let headers = PacketHeaders::from_ethernet_slice(frame).ok()?;
    match headers.net? {
        NetHeaders::Ipv4(hdr, _) => Some(format!(
            "IP: {} > {}",
            Ipv4Addr::from(hdr.source),
            Ipv4Addr::from(hdr.destination)
        )),
        NetHeaders::Ipv6(hdr, _) => Some(format!(
            "IP: {} > {}",
            Ipv6Addr::from(hdr.source),
            Ipv6Addr::from(hdr.destination)
        )),
        _ => None,
    }
}
