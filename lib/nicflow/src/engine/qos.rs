// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Class-of-service rings.
//!
//! Received packets are sorted into one of [`NUM_QOS_LEVELS`] bounded
//! rings per port by the IP precedence bits of their TOS byte. A
//! single sender drains the rings of each port in strict descending
//! priority and transmits to the hairpin peer. A full ring drops its
//! oldest packet to make room.
//!
//! This path is independent of flow offload; it never consults the
//! flow cache.

use super::io::Mbuf;
use super::io::PacketIo;
use super::parse::PacketView;
use crate::api::PortId;
use crate::api::hairpin_peer;
use crate::sys::stat::StatU64;
use crossbeam::queue::ArrayQueue;

pub const NUM_QOS_LEVELS: usize = 8;

/// The capacity of each ring.
pub const QOS_RING_SIZE: usize = 1024;

/// The most packets taken from one ring per drain.
pub const QOS_TX_BURST: usize = 32;

/// The ring for a packet with type-of-service byte `tos`: its IP
/// precedence, which is always below [`NUM_QOS_LEVELS`].
pub const fn qos_level(tos: u8) -> usize {
    (tos >> 5) as usize
}

#[derive(Debug, Default)]
pub struct QosStats {
    pub enqueued: StatU64,
    /// Packets pushed out of a full ring.
    pub overflow: StatU64,
    /// Packets that did not parse and so have no level.
    pub unclassified: StatU64,
    pub sent: StatU64,
    /// Dequeued packets the port did not accept.
    pub tx_dropped: StatU64,
}

pub struct QosRings {
    ports: Vec<[ArrayQueue<Mbuf>; NUM_QOS_LEVELS]>,
    pub stats: QosStats,
}

impl QosRings {
    pub fn new(nr_ports: u16) -> Self {
        Self::with_capacity(nr_ports, QOS_RING_SIZE)
    }

    pub fn with_capacity(nr_ports: u16, cap: usize) -> Self {
        let ports = (0..nr_ports)
            .map(|_| core::array::from_fn(|_| ArrayQueue::new(cap)))
            .collect();
        Self { ports, stats: QosStats::default() }
    }

    /// Queue a packet received on `port` at the level of its outer
    /// TOS byte. Returns false if the packet was not queued.
    pub fn enqueue(&self, port: PortId, pkt: Mbuf) -> bool {
        let Some(rings) = self.ports.get(usize::from(port)) else {
            return false;
        };

        let level = match PacketView::parse(&pkt.data) {
            Ok(view) => qos_level(view.tos()),
            Err(_) => {
                self.stats.unclassified.incr(1);
                return false;
            }
        };

        if rings[level].force_push(pkt).is_some() {
            self.stats.overflow.incr(1);
        }
        self.stats.enqueued.incr(1);
        true
    }

    /// The number of packets queued at `level` on `port`.
    pub fn len(&self, port: PortId, level: usize) -> usize {
        self.ports
            .get(usize::from(port))
            .and_then(|r| r.get(level))
            .map_or(0, |r| r.len())
    }

    /// Drain the rings of `port`, highest level first, transmitting on
    /// queue 0 of the hairpin peer. Returns the number sent.
    pub fn drain(&self, port: PortId, io: &dyn PacketIo) -> usize {
        let Some(rings) = self.ports.get(usize::from(port)) else {
            return 0;
        };

        let mut sent = 0;
        for ring in rings.iter().rev() {
            let burst: Vec<Mbuf> =
                core::iter::from_fn(|| ring.pop()).take(QOS_TX_BURST).collect();
            if burst.is_empty() {
                continue;
            }

            let n = burst.len();
            let tx = io.tx_burst(hairpin_peer(port), 0, burst);
            self.stats.sent.incr(tx as u64);
            self.stats.tx_dropped.incr((n - tx) as u64);
            sent += tx;
        }
        sent
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::MacAddr;
    use crate::api::Protocol;
    use crate::engine::headers::ETHER_TYPE_IPV4;
    use crate::engine::headers::EtherHdr;
    use crate::engine::headers::Ipv4Hdr;
    use crate::engine::headers::UdpHdr;
    use crate::engine::headers::WireHeader;
    use crate::engine::io::MemIo;
    use zerocopy::IntoBytes;

    fn udp(tos: u8, tag: u8) -> Mbuf {
        let eth =
            EtherHdr::new(MacAddr::ZERO, MacAddr::BROADCAST, ETHER_TYPE_IPV4);
        let mut out = eth.as_bytes().to_vec();
        let ip = Ipv4Hdr::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Protocol::UDP,
            tos,
            UdpHdr::SIZE + 1,
        );
        out.extend_from_slice(ip.as_bytes());
        out.extend_from_slice(UdpHdr::new(1000, 2000, 1).as_bytes());
        out.push(tag);
        Mbuf::new(out, 0)
    }

    /// The tags of the packets sent on `port`, in order.
    fn sent_tags(io: &MemIo, port: PortId) -> Vec<u8> {
        io.take_tx(port).iter().map(|m| *m.data.last().unwrap()).collect()
    }

    #[test]
    fn every_tos_has_a_ring() {
        for tos in 0..=u8::MAX {
            assert!(qos_level(tos) < NUM_QOS_LEVELS);
        }
        assert_eq!(qos_level(0xe0), 7);
        assert_eq!(qos_level(0x1f), 0);
    }

    #[test]
    fn full_ring_drops_oldest() {
        let rings = QosRings::with_capacity(2, 2);
        for tag in 0..3 {
            assert!(rings.enqueue(0, udp(0, tag)));
        }
        assert_eq!(rings.len(0, 0), 2);
        assert_eq!(rings.stats.overflow.val(), 1);

        let io = MemIo::new(2, 1, 8, 8);
        assert_eq!(rings.drain(0, &io), 2);
        assert_eq!(sent_tags(&io, 1), [1, 2]);
    }

    #[test]
    fn drains_in_descending_priority() {
        let rings = QosRings::new(2);
        rings.enqueue(1, udp(0x00, 0));
        rings.enqueue(1, udp(0xe0, 7));
        rings.enqueue(1, udp(0x60, 3));
        assert!(!rings.enqueue(1, Mbuf::new(vec![0; 10], 0)));
        assert_eq!(rings.stats.unclassified.val(), 1);

        let io = MemIo::new(2, 1, 8, 8);
        assert_eq!(rings.drain(1, &io), 3);
        assert_eq!(sent_tags(&io, 0), [7, 3, 0]);
    }

    #[test]
    fn unsent_packets_are_released() {
        let rings = QosRings::new(2);
        for tag in 0..4 {
            rings.enqueue(0, udp(0x20, tag));
        }
        let io = MemIo::new(2, 1, 8, 3);
        assert_eq!(rings.drain(0, &io), 3);
        assert_eq!(rings.stats.tx_dropped.val(), 1);
        assert_eq!(rings.len(0, 1), 0);
    }
}
