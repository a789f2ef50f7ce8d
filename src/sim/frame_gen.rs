use std::io;
use std::net::Ipv4Addr;

use etherparse::PacketBuilder;
use eui48::MacAddress;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Builds UDP/IPv4/Ethernet frames with randomised addresses, ports and
/// payload sizes, for feeding a simulated port.
pub struct FrameGen {
    rng: StdRng,
    src_mac: [u8; 6],
    dst_mac: [u8; 6],
    min_payload: usize,
    max_payload: usize,
}

impl FrameGen {
    pub fn new(src_mac: MacAddress, dst_mac: MacAddress, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            src_mac: src_mac.to_array(),
            dst_mac: dst_mac.to_array(),
            min_payload: 18,
            max_payload: 1458,
        }
    }

    /// Bounds the UDP payload size. `max` is raised to `min` if smaller.
    pub fn payload_range(mut self, min: usize, max: usize) -> Self {
        self.min_payload = min;
        self.max_payload = max.max(min);
        self
    }

    pub fn next_frame(&mut self) -> io::Result<Vec<u8>> {
        let src_ip = Ipv4Addr::new(10, 0, self.rng.random(), self.rng.random());
        let dst_ip = Ipv4Addr::new(10, 1, self.rng.random(), self.rng.random());
        let builder = PacketBuilder::ethernet2(self.src_mac, self.dst_mac)
            .ipv4(src_ip.octets(), dst_ip.octets(), 64)
            .udp(self.rng.random_range(1024..=u16::MAX), 9);

        let payload_len = self.rng.random_range(self.min_payload..=self.max_payload);
        let mut payload = vec![0u8; payload_len];
        self.rng.fill(&mut payload[..]);

        let mut frame = Vec::with_capacity(builder.size(payload_len));
        builder.write(&mut frame, &payload).map_err(io::Error::other)?;
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::{LinkHeader, NetHeaders, PacketHeaders, PayloadSlice, TransportHeader};

    #[test]
    fn test_frames_parse_back() {
        let src = MacAddress::new([2, 0, 0, 0, 0, 1]);
        let dst = MacAddress::new([2, 0, 0, 0, 0, 2]);
        let mut fg = FrameGen::new(src, dst, 7).payload_range(10, 40);
        for _ in 0..16 {
            let frame = fg.next_frame().unwrap();
            let headers = PacketHeaders::from_ethernet_slice(&frame).unwrap();
            let Some(LinkHeader::Ethernet2(eth)) = headers.link else {
                panic!("missing ethernet header");
            };
            assert_eq!(eth.source, src.to_array());
            assert_eq!(eth.destination, dst.to_array());
            assert!(matches!(headers.net, Some(NetHeaders::Ipv4(..))));
            assert!(matches!(headers.transport, Some(TransportHeader::Udp(_))));
            let PayloadSlice::Udp(payload) = headers.payload else {
                panic!("missing udp payload");
            };
            let payload = payload.len();
            assert!((10..=40).contains(&payload), "{payload}");
        }
    }

    #[test]
    fn test_same_seed_same_frames() {
        let mac = MacAddress::new([2, 0, 0, 0, 0, 9]);
        let mut a = FrameGen::new(mac, mac, 42);
        let mut b = FrameGen::new(mac, mac, 42);
        assert_eq!(a.next_frame().unwrap(), b.next_frame().unwrap());
    }
}
