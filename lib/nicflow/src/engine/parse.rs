// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The packet parser.
//!
//! A packet is parsed in two passes. The outer pass walks Ethernet,
//! IPv4, and the L4 header, then looks for a tunnel: GRE, VXLAN (UDP
//! 4789), or GTP-U (UDP 2152). If one is found, the inner pass runs
//! the same routine from the end of the tunnel header. The inner pass
//! never looks for another tunnel.
//!
//! All offsets are absolute offsets into the packet buffer.

use super::headers::EtherHdr;
use super::headers::ETHER_TYPE_ARP;
use super::headers::ETHER_TYPE_IPV4;
use super::headers::ETHER_TYPE_IPV6;
use super::headers::GreFlags;
use super::headers::GreHdr;
use super::headers::GtpuHdr;
use super::headers::HeaderError;
use super::headers::Ipv4Hdr;
use super::headers::TcpHdr;
use super::headers::UdpHdr;
use super::headers::VxlanHdr;
use super::headers::WireHeader;
use crate::api::GTPU_PORT;
use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::Protocol;
use crate::api::TunnelId;
use crate::api::TunnelType;
use crate::api::VXLAN_PORT;
use crate::d_error::DError;
use std::fmt;
use std::fmt::Display;
use zerocopy::FromBytes;
use zerocopy::network_endian::U32;

/// The reason a packet failed to parse.
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
pub enum ParseError {
    Outer(HeaderError),
    Tunnel(HeaderError),
    Inner(HeaderError),
}

/// The layer boundaries and flow-relevant fields of one IPv4 packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PktFormat {
    /// Absent for the inner packet of an L3 tunnel.
    pub l2: Option<usize>,
    pub l3: usize,
    pub l4: usize,
    /// Only TCP and UDP have a known payload start.
    pub l7: Option<usize>,
    pub proto: Protocol,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tos: u8,
    pub src_mac: Option<MacAddr>,
    pub dst_mac: Option<MacAddr>,
}

impl PktFormat {
    /// Parse an IPv4 packet starting at `off`, with an Ethernet
    /// header first if `l2` is set.
    fn parse(buf: &[u8], off: usize, l2: bool) -> Result<Self, HeaderError> {
        let mut l3 = off;
        let mut macs = (None, None);

        if l2 {
            let eth = EtherHdr::view_at(buf, off)?;
            match eth.ether_type.get() {
                ETHER_TYPE_IPV4 => l3 = off + EtherHdr::SIZE,
                ETHER_TYPE_IPV6 => return Err(HeaderError::Ipv6),
                ETHER_TYPE_ARP => return Err(HeaderError::Arp),
                other => return Err(HeaderError::UnsupportedEtherType(other)),
            }
            macs = (Some(eth.src()), Some(eth.dst()));
        }

        let ip = Ipv4Hdr::view_at(buf, l3)?;
        if ip.version() != Ipv4Hdr::VERSION {
            return Err(HeaderError::BadIpVersion(ip.version()));
        }

        if ip.ihl() < Ipv4Hdr::MIN_IHL {
            return Err(HeaderError::BadIhl(ip.ihl()));
        }

        let (src_ip, dst_ip) = (ip.src(), ip.dst());
        if src_ip.is_unspecified() || dst_ip.is_unspecified() {
            return Err(HeaderError::ZeroAddr);
        }

        let l4 = l3 + ip.hdr_len();
        let proto = ip.protocol();
        let (l7, src_port, dst_port) = match proto {
            Protocol::TCP => {
                let tcp = TcpHdr::view_at(buf, l4)?;
                if tcp.data_offset() < TcpHdr::MIN_DATA_OFFSET {
                    return Err(HeaderError::BadTcpOffset(tcp.data_offset()));
                }
                let l7 = l4 + tcp.hdr_len();
                (Some(l7), tcp.src_port.get(), tcp.dst_port.get())
            }

            Protocol::UDP => {
                let udp = UdpHdr::view_at(buf, l4)?;
                let l7 = l4 + UdpHdr::SIZE;
                (Some(l7), udp.src_port.get(), udp.dst_port.get())
            }

            Protocol::GRE | Protocol::ICMP => (None, 0, 0),

            Protocol::Unknown(p) => {
                return Err(HeaderError::UnsupportedProto(p));
            }
        };

        if let Some(l7) = l7
            && l7 > buf.len()
        {
            return Err(HeaderError::L7PastEnd { l7, len: buf.len() });
        }

        Ok(Self {
            l2: l2.then_some(off),
            l3,
            l4,
            l7,
            proto,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            tos: ip.tos,
            src_mac: macs.0,
            dst_mac: macs.1,
        })
    }
}

impl Display for PktFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            Protocol::TCP | Protocol::UDP => write!(
                f,
                "{} {}:{} -> {}:{}",
                self.proto,
                self.src_ip,
                self.src_port,
                self.dst_ip,
                self.dst_port
            ),
            _ => write!(f, "{} {} -> {}", self.proto, self.src_ip, self.dst_ip),
        }
    }
}

/// The tunnel a packet arrived in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TunnelInfo {
    pub tun_type: TunnelType,
    /// VNI, GRE key, or TEID.
    pub id: TunnelId,
    pub gre_proto: u16,
    pub gtp_msg_type: u8,
    pub gtp_flags: u8,
    /// Where the inner packet starts.
    pub inner_off: usize,
}

impl TunnelInfo {
    /// Look for a tunnel header after the outer L4 header.
    ///
    /// `Ok(None)` means the packet is not tunneled: it is neither GRE
    /// nor UDP to a tunnel port, its VXLAN header lacks the I bit, or
    /// its GRE header carries a checksum.
    fn detect(
        buf: &[u8],
        outer: &PktFormat,
    ) -> Result<Option<Self>, HeaderError> {
        match outer.proto {
            Protocol::GRE => {
                let gre = GreHdr::view_at(buf, outer.l4)?;
                if gre.flags().contains(GreFlags::CSUM) {
                    return Ok(None);
                }

                let opt = outer.l4 + GreHdr::SIZE;
                let id = if gre.flags().contains(GreFlags::KEY) {
                    TunnelId::new(read_u32(buf, opt, "gre-key")?)
                } else {
                    TunnelId::NONE
                };

                Ok(Some(Self {
                    tun_type: TunnelType::Gre,
                    id,
                    gre_proto: gre.proto.get(),
                    gtp_msg_type: 0,
                    gtp_flags: 0,
                    inner_off: opt + gre.optional_len(),
                }))
            }

            Protocol::UDP => {
                let payload = outer.l4 + UdpHdr::SIZE;
                match outer.dst_port {
                    VXLAN_PORT => {
                        let vxlan = VxlanHdr::view_at(buf, payload)?;
                        if !vxlan.has_vni() {
                            return Ok(None);
                        }

                        Ok(Some(Self {
                            tun_type: TunnelType::Vxlan,
                            id: TunnelId::new(vxlan.vni()),
                            gre_proto: 0,
                            gtp_msg_type: 0,
                            gtp_flags: 0,
                            inner_off: payload + VxlanHdr::SIZE,
                        }))
                    }

                    GTPU_PORT => {
                        let gtp = GtpuHdr::view_at(buf, payload)?;
                        Ok(Some(Self {
                            tun_type: TunnelType::GtpU,
                            id: TunnelId::new(gtp.teid.get()),
                            gre_proto: 0,
                            gtp_msg_type: gtp.msg_type,
                            gtp_flags: gtp.flags,
                            inner_off: payload
                                + GtpuHdr::SIZE
                                + gtp.optional_len(),
                        }))
                    }

                    _ => Ok(None),
                }
            }

            _ => Ok(None),
        }
    }
}

fn read_u32(
    buf: &[u8],
    off: usize,
    hdr: &'static str,
) -> Result<u32, HeaderError> {
    let truncated = HeaderError::Truncated { hdr, off };
    let tail = buf.get(off..).ok_or(truncated)?;
    U32::read_from_prefix(tail).map(|(v, _)| v.get()).map_err(|_| truncated)
}

/// A parsed packet.
#[derive(Clone, Copy, Debug)]
pub struct PacketView<'a> {
    bytes: &'a [u8],
    pub outer: PktFormat,
    pub tun: Option<TunnelInfo>,
    pub inner: Option<PktFormat>,
}

impl<'a> PacketView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ParseError> {
        let outer =
            PktFormat::parse(bytes, 0, true).map_err(ParseError::Outer)?;
        let tun =
            TunnelInfo::detect(bytes, &outer).map_err(ParseError::Tunnel)?;

        let inner = match &tun {
            Some(t) => Some(
                PktFormat::parse(bytes, t.inner_off, t.tun_type.inner_has_l2())
                    .map_err(ParseError::Inner)?,
            ),
            None => None,
        };

        Ok(Self { bytes, outer, tun, inner })
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn tunnel_type(&self) -> TunnelType {
        self.tun.map(|t| t.tun_type).unwrap_or_default()
    }

    pub fn tunnel_id(&self) -> TunnelId {
        self.tun.map(|t| t.id).unwrap_or_default()
    }

    pub fn is_tunneled(&self) -> bool {
        self.tun.is_some()
    }

    /// The type-of-service byte of the outer IPv4 header.
    pub fn tos(&self) -> u8 {
        self.outer.tos
    }

    /// The headers that identify the flow: the inner packet if
    /// tunneled, else the outer.
    pub fn flow_format(&self) -> &PktFormat {
        self.inner.as_ref().unwrap_or(&self.outer)
    }
}

impl Display for PacketView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tos={:#04x} len={}", self.outer, self.tos(), self.len())?;

        if let (Some(tun), Some(inner)) = (&self.tun, &self.inner) {
            write!(f, " | {} id={} | {}", tun.tun_type, tun.id, inner)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::headers::GRE_PROTO_IPV4;
    use crate::engine::headers::GtpFlags;
    use zerocopy::IntoBytes;

    const SRC_MAC: MacAddr = MacAddr::from_const([2, 0, 0, 0, 0, 1]);
    const DST_MAC: MacAddr = MacAddr::from_const([2, 0, 0, 0, 0, 2]);

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    /// An IPv4 header from `src` to `dst` followed by `l4`.
    fn ipv4(
        src: &str,
        dst: &str,
        proto: Protocol,
        tos: u8,
        l4: &[u8],
    ) -> Vec<u8> {
        let hdr = Ipv4Hdr::new(ip(src), ip(dst), proto, tos, l4.len());
        let mut out = hdr.as_bytes().to_vec();
        out.extend_from_slice(l4);
        out
    }

    fn ipv4_udp(
        src: &str,
        dst: &str,
        sport: u16,
        dport: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let udp = UdpHdr::new(sport, dport, payload.len());
        let mut l4 = udp.as_bytes().to_vec();
        l4.extend_from_slice(payload);
        ipv4(src, dst, Protocol::UDP, 0, &l4)
    }

    fn ipv4_tcp(src: &str, dst: &str, sport: u16, dport: u16) -> Vec<u8> {
        let tcp = TcpHdr::new(sport, dport, TcpHdr::FLAG_SYN);
        ipv4(src, dst, Protocol::TCP, 0x20, tcp.as_bytes())
    }

    fn eth(l3: &[u8]) -> Vec<u8> {
        let hdr = EtherHdr::new(SRC_MAC, DST_MAC, ETHER_TYPE_IPV4);
        let mut out = hdr.as_bytes().to_vec();
        out.extend_from_slice(l3);
        out
    }

    fn outer_err(pkt: &[u8]) -> Option<HeaderError> {
        match PacketView::parse(pkt) {
            Err(ParseError::Outer(e)) => Some(e),
            _ => None,
        }
    }

    #[test]
    fn plain_tcp() {
        let pkt = eth(&ipv4_tcp("10.0.0.1", "10.0.0.2", 4000, 80));
        let view = PacketView::parse(&pkt).unwrap();
        assert!(!view.is_tunneled());
        assert_eq!(view.outer.l3, 14);
        assert_eq!(view.outer.l4, 34);
        assert_eq!(view.outer.l7, Some(54));
        assert_eq!(view.outer.src_port, 4000);
        assert_eq!(view.tos(), 0x20);
        assert_eq!(view.outer.src_mac, Some(SRC_MAC));
    }

    #[test]
    fn plain_udp_not_a_tunnel_port() {
        let pkt = eth(&ipv4_udp("10.0.0.1", "10.0.0.2", 5000, 53, b"hello"));
        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.tunnel_type(), TunnelType::None);
        assert_eq!(view.outer.l7, Some(42));
    }

    #[test]
    fn vxlan_inner_has_l2() {
        let inner = eth(&ipv4_tcp("192.168.0.1", "192.168.0.2", 1234, 443));
        let mut payload = VxlanHdr::new(0x64).as_bytes().to_vec();
        payload.extend_from_slice(&inner);
        let l3 = ipv4_udp("1.1.1.1", "2.2.2.2", 49152, VXLAN_PORT, &payload);
        let pkt = eth(&l3);

        let view = PacketView::parse(&pkt).unwrap();
        let tun = view.tun.unwrap();
        assert_eq!(tun.tun_type, TunnelType::Vxlan);
        assert_eq!(tun.id, TunnelId::new(0x64));
        assert_eq!(tun.inner_off, 34 + 16);

        let inner = view.inner.unwrap();
        assert_eq!(inner.l2, Some(50));
        assert_eq!(inner.l3, 64);
        assert_eq!(inner.dst_port, 443);
    }

    #[test]
    fn vxlan_without_i_bit_is_plain_udp() {
        let mut vxlan = VxlanHdr::new(0x64);
        vxlan.flags = 0;
        let mut payload = vxlan.as_bytes().to_vec();
        payload.extend_from_slice(&[0u8; 40]);
        let l3 = ipv4_udp("1.1.1.1", "2.2.2.2", 49152, VXLAN_PORT, &payload);
        let pkt = eth(&l3);

        let view = PacketView::parse(&pkt).unwrap();
        assert!(!view.is_tunneled());
        assert!(view.inner.is_none());
    }

    #[test]
    fn gre_with_key_and_seq() {
        let inner = ipv4_udp("192.168.0.1", "192.168.0.2", 1000, 2000, &[]);
        let mut l4 = GreHdr::new(GreFlags::KEY | GreFlags::SEQ, GRE_PROTO_IPV4)
            .as_bytes()
            .to_vec();
        l4.extend_from_slice(&0xdead_beef_u32.to_be_bytes());
        l4.extend_from_slice(&7u32.to_be_bytes());
        l4.extend_from_slice(&inner);
        let pkt = eth(&ipv4("1.1.1.1", "2.2.2.2", Protocol::GRE, 0, &l4));

        let view = PacketView::parse(&pkt).unwrap();
        let tun = view.tun.unwrap();
        assert_eq!(tun.tun_type, TunnelType::Gre);
        assert_eq!(tun.id, TunnelId::new(0xdead_beef));
        assert_eq!(tun.gre_proto, GRE_PROTO_IPV4);
        assert_eq!(tun.inner_off, 34 + 4 + 8);

        let inner = view.inner.unwrap();
        assert_eq!(inner.l2, None);
        assert_eq!(inner.l3, tun.inner_off);
        assert_eq!(inner.src_port, 1000);
    }

    #[test]
    fn gre_with_checksum_is_not_a_tunnel() {
        let gre = GreHdr::new(GreFlags::CSUM, GRE_PROTO_IPV4);
        let mut l4 = gre.as_bytes().to_vec();
        l4.extend_from_slice(&[0u8; 4]);
        let pkt = eth(&ipv4("1.1.1.1", "2.2.2.2", Protocol::GRE, 0, &l4));

        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.outer.proto, Protocol::GRE);
        assert!(!view.is_tunneled());
    }

    #[test]
    fn gtpu_extension_flag_adds_four_bytes() {
        let inner = ipv4_tcp("172.16.0.1", "172.16.0.2", 3333, 4444);
        for (flags, extra) in [(GtpFlags::empty(), 0), (GtpFlags::SEQ, 4)] {
            let gtp = GtpuHdr::new(0x1234_5678, flags, inner.len());
            let mut payload = gtp.as_bytes().to_vec();
            payload.extend_from_slice(&[0u8; 4][..extra]);
            payload.extend_from_slice(&inner);
            let l3 = ipv4_udp("1.1.1.1", "2.2.2.2", 2152, GTPU_PORT, &payload);
            let pkt = eth(&l3);

            let view = PacketView::parse(&pkt).unwrap();
            let tun = view.tun.unwrap();
            assert_eq!(tun.tun_type, TunnelType::GtpU);
            assert_eq!(tun.id, TunnelId::new(0x1234_5678));
            assert_eq!(tun.gtp_msg_type, 0xff);
            assert_eq!(tun.inner_off, 34 + 16 + extra);
            assert_eq!(view.inner.unwrap().dst_port, 4444);
        }
    }

    #[test]
    fn reject_non_ipv4_ethertypes() {
        let mut pkt = eth(&ipv4_tcp("10.0.0.1", "10.0.0.2", 1, 2));
        pkt[12..14].copy_from_slice(&ETHER_TYPE_IPV6.to_be_bytes());
        assert_eq!(outer_err(&pkt), Some(HeaderError::Ipv6));

        pkt[12..14].copy_from_slice(&ETHER_TYPE_ARP.to_be_bytes());
        assert_eq!(outer_err(&pkt), Some(HeaderError::Arp));

        pkt[12..14].copy_from_slice(&0x88ccu16.to_be_bytes());
        assert_eq!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Outer(HeaderError::UnsupportedEtherType(0x88cc))
        );
    }

    #[test]
    fn reject_bad_ipv4() {
        let good = eth(&ipv4_tcp("10.0.0.1", "10.0.0.2", 1, 2));

        let mut pkt = good.clone();
        pkt[14] = 0x65;
        assert_eq!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Outer(HeaderError::BadIpVersion(6))
        );

        let mut pkt = good.clone();
        pkt[14] = 0x44;
        assert_eq!(outer_err(&pkt), Some(HeaderError::BadIhl(4)));

        let pkt = eth(&ipv4_tcp("0.0.0.0", "10.0.0.2", 1, 2));
        assert_eq!(outer_err(&pkt), Some(HeaderError::ZeroAddr));

        let mut pkt = good;
        pkt[23] = 132;
        assert_eq!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Outer(HeaderError::UnsupportedProto(132))
        );
    }

    #[test]
    fn reject_tcp_offset_past_end() {
        let mut pkt = eth(&ipv4_tcp("10.0.0.1", "10.0.0.2", 1, 2));
        // Claim a 60-byte TCP header on a 54-byte packet.
        pkt[34 + 12] = 0xf0;
        assert_eq!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Outer(HeaderError::L7PastEnd { l7: 94, len: 54 })
        );
    }

    #[test]
    fn reject_truncated_tunnel_and_inner() {
        let l3 = ipv4_udp("1.1.1.1", "2.2.2.2", 1, GTPU_PORT, &[0x30, 0xff]);
        let pkt = eth(&l3);
        assert!(matches!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Tunnel(HeaderError::Truncated { hdr: "gtpu", .. })
        ));

        let payload = VxlanHdr::new(5).as_bytes().to_vec();
        let pkt = eth(&ipv4_udp("1.1.1.1", "2.2.2.2", 1, VXLAN_PORT, &payload));
        assert!(matches!(
            PacketView::parse(&pkt).unwrap_err(),
            ParseError::Inner(HeaderError::Truncated { hdr: "ether", .. })
        ));
    }

    #[test]
    fn icmp_has_no_ports() {
        let echo = [8, 0, 0, 0, 0, 0, 0, 0];
        let pkt = eth(&ipv4("10.0.0.1", "10.0.0.2", Protocol::ICMP, 0, &echo));
        let view = PacketView::parse(&pkt).unwrap();
        assert_eq!(view.outer.l7, None);
        assert_eq!((view.outer.src_port, view.outer.dst_port), (0, 0));
    }
}
