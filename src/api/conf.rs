//! Port capability and configuration records exchanged with the device layer.

bitflags::bitflags! {
    /// Transmit offload capability / request bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TxOffloads: u64 {
        const VLAN_INSERT = 1 << 0;
        const IPV4_CKSUM = 1 << 1;
        const UDP_CKSUM = 1 << 2;
        const TCP_CKSUM = 1 << 3;
        const TCP_TSO = 1 << 5;
        const MULTI_SEGS = 1 << 15;
        /// Transmitted buffers all come from one pool and have a reference
        /// count of one, so the driver may return them to the pool in bulk.
        const MBUF_FAST_FREE = 1 << 16;
    }
}

/// Descriptor ring size limits advertised by a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescLim {
    pub nb_min: u16,
    /// Zero means "no upper bound".
    pub nb_max: u16,
    /// Zero or one means "no alignment constraint".
    pub nb_align: u16,
}

impl DescLim {
    /// Rounds `nb` up to the alignment, caps it at the maximum and raises it
    /// to the minimum, in that order.
    pub fn adjust(&self, nb: u16) -> u16 {
        let mut nb = u32::from(nb);
        if self.nb_align > 1 {
            let align = u32::from(self.nb_align);
            nb = nb.div_ceil(align) * align;
        }
        if self.nb_max != 0 {
            nb = nb.min(u32::from(self.nb_max));
        }
        nb = nb.max(u32::from(self.nb_min));
        nb.min(u32::from(u16::MAX)) as u16
    }
}

impl Default for DescLim {
    fn default() -> Self {
        Self {
            nb_min: 0,
            nb_max: u16::MAX,
            nb_align: 1,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxConf {
    pub rx_free_thresh: u16,
    pub rx_drop_en: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxConf {
    pub tx_free_thresh: u16,
    pub offloads: TxOffloads,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxMode {
    pub offloads: TxOffloads,
}

/// Port-wide configuration handed to [`EthDev::configure`](super::EthDev::configure).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EthConf {
    pub txmode: TxMode,
}

/// Capability record returned by [`EthDev::dev_info`](super::EthDev::dev_info).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: String,
    pub if_name: String,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub tx_offload_capa: TxOffloads,
    pub rx_desc_lim: DescLim,
    pub tx_desc_lim: DescLim,
    pub default_rxconf: RxConf,
    pub default_txconf: TxConf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_lim_adjust() {
        let lim = DescLim {
            nb_min: 64,
            nb_max: 4096,
            nb_align: 32,
        };
        assert_eq!(lim.adjust(1000), 1024);
        assert_eq!(lim.adjust(1024), 1024);
        assert_eq!(lim.adjust(10), 64);
        assert_eq!(lim.adjust(8000), 4096);
        assert_eq!(DescLim::default().adjust(777), 777);
    }

    #[test]
    fn test_desc_lim_no_overflow() {
        let lim = DescLim {
            nb_min: 0,
            nb_max: 0,
            nb_align: 1000,
        };
        assert_eq!(lim.adjust(u16::MAX), u16::MAX);
    }

    #[test]
    fn test_offload_set_ops() {
        let mut capa = TxOffloads::IPV4_CKSUM | TxOffloads::MBUF_FAST_FREE;
        assert!(capa.contains(TxOffloads::MBUF_FAST_FREE));
        assert!(!capa.contains(TxOffloads::MULTI_SEGS));
        capa.insert(TxOffloads::MULTI_SEGS);
        assert!(capa.contains(TxOffloads::MULTI_SEGS | TxOffloads::IPV4_CKSUM));
        let unsupported = (TxOffloads::TCP_TSO | TxOffloads::IPV4_CKSUM) - capa;
        assert_eq!(unsupported, TxOffloads::TCP_TSO);
        let unknown = TxOffloads::from_bits_retain(1 << 40);
        assert!(TxOffloads::from_bits(unknown.bits()).is_none());
        assert!(!(unknown - capa).is_empty());
        assert!(format!("{:?}", TxOffloads::MBUF_FAST_FREE).contains("MBUF_FAST_FREE"));
    }
}
