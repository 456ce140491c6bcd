// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Derive a [`FlowKey`] from a parsed packet.

use super::parse::PacketView;
use crate::api::FlowKey;
use crate::api::PortId;
use crc32fast::Hasher;

/// Build the key for the flow `view` belongs to.
///
/// A tunneled packet is keyed on its inner 5-tuple plus the tunnel
/// id; an untunneled one on its outer 5-tuple. The key is
/// unidirectional and never looks at the TOS byte.
///
/// `rss_hash` is the hash the NIC computed on receipt. When the NIC
/// did not provide one (it is zero) a CRC32 of the key is used as the
/// hint instead.
pub fn build_key(view: &PacketView, port: PortId, rss_hash: u32) -> FlowKey {
    let fmt = view.flow_format();
    let mut key = FlowKey {
        src_ip: fmt.src_ip,
        dst_ip: fmt.dst_ip,
        src_port: fmt.src_port,
        dst_port: fmt.dst_port,
        tun_id: view.tunnel_id(),
        proto: fmt.proto,
        tun_type: view.tunnel_type(),
        port,
        hash: rss_hash,
    };

    if key.hash == 0 {
        key.hash = key_crc(&key);
    }

    key
}

fn key_crc(key: &FlowKey) -> u32 {
    let mut h = Hasher::new();
    h.update(&key.src_ip.bytes());
    h.update(&key.dst_ip.bytes());
    h.update(&key.src_port.to_be_bytes());
    h.update(&key.dst_port.to_be_bytes());
    h.update(&key.tun_id.get().to_be_bytes());
    h.update(&[u8::from(key.proto), key.tun_type as u8]);
    h.update(&key.port.to_be_bytes());
    h.finalize()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::Protocol;
    use crate::api::TunnelId;
    use crate::api::TunnelType;
    use crate::engine::headers::ETHER_TYPE_IPV4;
    use crate::engine::headers::EtherHdr;
    use crate::engine::headers::Ipv4Hdr;
    use crate::engine::headers::TcpHdr;
    use crate::engine::headers::WireHeader;
    use crate::api::MacAddr;
    use zerocopy::IntoBytes;

    fn tcp_pkt(
        src: &str,
        dst: &str,
        sport: u16,
        dport: u16,
        tos: u8,
    ) -> Vec<u8> {
        let eth =
            EtherHdr::new(MacAddr::ZERO, MacAddr::BROADCAST, ETHER_TYPE_IPV4);
        let ip = Ipv4Hdr::new(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            Protocol::TCP,
            tos,
            TcpHdr::SIZE,
        );
        let tcp = TcpHdr::new(sport, dport, TcpHdr::FLAG_ACK);

        let mut out = eth.as_bytes().to_vec();
        out.extend_from_slice(ip.as_bytes());
        out.extend_from_slice(tcp.as_bytes());
        out
    }

    #[test]
    fn key_is_idempotent_and_ignores_tos_and_hash() {
        let a = tcp_pkt("10.0.0.1", "10.0.0.2", 1111, 80, 0x00);
        let b = tcp_pkt("10.0.0.1", "10.0.0.2", 1111, 80, 0xe0);
        let va = PacketView::parse(&a).unwrap();
        let vb = PacketView::parse(&b).unwrap();

        let k1 = build_key(&va, 0, 0);
        let k2 = build_key(&va, 0, 0);
        let k3 = build_key(&vb, 0, 0xabcd);
        assert_eq!(k1, k2);
        assert_eq!(k1.hash, k2.hash);
        assert_eq!(k1, k3);
        assert_eq!(k3.hash, 0xabcd);
        assert_ne!(k1.hash, 0);
    }

    #[test]
    fn untunneled_key_fields() {
        let pkt = tcp_pkt("10.0.0.1", "10.0.0.2", 1111, 80, 0);
        let key = build_key(&PacketView::parse(&pkt).unwrap(), 3, 7);
        assert_eq!(key.tun_type, TunnelType::None);
        assert_eq!(key.tun_id, TunnelId::NONE);
        assert_eq!(key.proto, Protocol::TCP);
        assert_eq!(key.port, 3);
    }

    #[test]
    fn receiving_port_is_part_of_identity() {
        let pkt = tcp_pkt("10.0.0.1", "10.0.0.2", 1111, 80, 0);
        let view = PacketView::parse(&pkt).unwrap();
        assert_ne!(build_key(&view, 0, 1), build_key(&view, 1, 1));
    }
}
