// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Wire layouts of the headers the parser understands.
//!
//! Every header is a zero-copy view over the packet bytes: reading one
//! never copies and never allocates. Multi-byte fields are stored in
//! network byte order.

use crate::api::Ipv4Addr;
use crate::api::MacAddr;
use crate::api::Protocol;
use crate::d_error::DError;
use bitflags::bitflags;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::network_endian::U16;
use zerocopy::network_endian::U32;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

/// The GRE protocol type for an encapsulated IPv4 packet.
pub const GRE_PROTO_IPV4: u16 = 0x0800;

/// The GTP-U message type for a G-PDU (user data).
pub const GTPU_MSG_GPDU: u8 = 0xff;

/// A header failed to parse.
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
#[derror(leaf_data = HeaderError::data)]
pub enum HeaderError {
    /// The buffer ends before the header does.
    Truncated { hdr: &'static str, off: usize },
    Ipv6,
    Arp,
    #[leaf]
    UnsupportedEtherType(u16),
    #[leaf]
    BadIpVersion(u8),
    #[leaf]
    BadIhl(u8),
    /// The source or destination address is 0.0.0.0.
    ZeroAddr,
    #[leaf]
    UnsupportedProto(u8),
    /// The L4 header claims a payload start beyond the buffer.
    L7PastEnd { l7: usize, len: usize },
    #[leaf]
    BadTcpOffset(u8),
}

impl HeaderError {
    fn data(&self, data: &mut [u64]) {
        match self {
            Self::Truncated { off, .. } => data[0] = *off as u64,
            Self::UnsupportedEtherType(et) => data[0] = u64::from(*et),
            Self::BadIpVersion(v) | Self::BadIhl(v) | Self::BadTcpOffset(v) => {
                data[0] = u64::from(*v)
            }
            Self::UnsupportedProto(p) => data[0] = u64::from(*p),
            Self::L7PastEnd { l7, len } => {
                [data[0], data[1]] = [*l7 as u64, *len as u64]
            }
            Self::Ipv6 | Self::Arp | Self::ZeroAddr => {}
        }
    }
}

/// A fixed-size header which may be viewed in place.
pub trait WireHeader:
    FromBytes + IntoBytes + Immutable + KnownLayout + Unaligned + Sized
{
    const NAME: &'static str;
    const SIZE: usize = core::mem::size_of::<Self>();

    /// View the header starting at `off` in `buf`.
    fn view_at(buf: &[u8], off: usize) -> Result<&Self, HeaderError> {
        let truncated = HeaderError::Truncated { hdr: Self::NAME, off };
        let tail = buf.get(off..).ok_or(truncated)?;
        Self::ref_from_prefix(tail).map(|(hdr, _)| hdr).map_err(|_| truncated)
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct EtherHdr {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: U16,
}

impl WireHeader for EtherHdr {
    const NAME: &'static str = "ether";
}

impl EtherHdr {
    pub fn new(src: MacAddr, dst: MacAddr, ether_type: u16) -> Self {
        Self {
            dst: dst.bytes(),
            src: src.bytes(),
            ether_type: U16::new(ether_type),
        }
    }

    pub fn src(&self) -> MacAddr {
        MacAddr::from(self.src)
    }

    pub fn dst(&self) -> MacAddr {
        MacAddr::from(self.dst)
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct Ipv4Hdr {
    pub ver_ihl: u8,
    pub tos: u8,
    pub total_len: U16,
    pub ident: U16,
    pub frag_off: U16,
    pub ttl: u8,
    pub proto: u8,
    pub csum: [u8; 2],
    pub src: [u8; 4],
    pub dst: [u8; 4],
}

impl WireHeader for Ipv4Hdr {
    const NAME: &'static str = "ipv4";
}

impl Ipv4Hdr {
    pub const VERSION: u8 = 4;
    pub const MIN_IHL: u8 = 5;

    /// Build a header without options for a payload of `payload_len`
    /// bytes. The checksum is filled in.
    pub fn new(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        proto: Protocol,
        tos: u8,
        payload_len: usize,
    ) -> Self {
        let total = Self::SIZE + payload_len;
        let mut hdr = Self {
            ver_ihl: (Self::VERSION << 4) | Self::MIN_IHL,
            tos,
            total_len: U16::new(u16::try_from(total).unwrap_or(u16::MAX)),
            ident: U16::new(0),
            frag_off: U16::new(0),
            ttl: 64,
            proto: u8::from(proto),
            csum: [0; 2],
            src: src.bytes(),
            dst: dst.bytes(),
        };
        hdr.csum = hdr.compute_csum().to_be_bytes();
        hdr
    }

    pub fn version(&self) -> u8 {
        self.ver_ihl >> 4
    }

    /// The header length in 32-bit words.
    pub fn ihl(&self) -> u8 {
        self.ver_ihl & 0x0f
    }

    pub fn hdr_len(&self) -> usize {
        usize::from(self.ihl()) * 4
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src)
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst)
    }

    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.proto)
    }

    /// The one's complement checksum of the header, taken with the
    /// checksum field as zero.
    pub fn compute_csum(&self) -> u16 {
        let mut copy = *self;
        copy.csum = [0; 2];
        let sum: u32 = copy
            .as_bytes()
            .chunks_exact(2)
            .map(|w| u32::from(u16::from_be_bytes([w[0], w[1]])))
            .sum();
        let folded = (sum & 0xffff) + (sum >> 16);
        !(((folded & 0xffff) + (folded >> 16)) as u16)
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct TcpHdr {
    pub src_port: U16,
    pub dst_port: U16,
    pub seq: U32,
    pub ack: U32,
    /// The data offset in the upper nibble.
    pub offset: u8,
    pub flags: u8,
    pub window: U16,
    pub csum: [u8; 2],
    pub urg: U16,
}

impl WireHeader for TcpHdr {
    const NAME: &'static str = "tcp";
}

impl TcpHdr {
    pub const MIN_DATA_OFFSET: u8 = 5;
    pub const FLAG_SYN: u8 = 0x02;
    pub const FLAG_ACK: u8 = 0x10;

    pub fn new(src_port: u16, dst_port: u16, flags: u8) -> Self {
        Self {
            src_port: U16::new(src_port),
            dst_port: U16::new(dst_port),
            seq: U32::new(0),
            ack: U32::new(0),
            offset: Self::MIN_DATA_OFFSET << 4,
            flags,
            window: U16::new(64_240),
            csum: [0; 2],
            urg: U16::new(0),
        }
    }

    /// The data offset in 32-bit words.
    pub fn data_offset(&self) -> u8 {
        self.offset >> 4
    }

    pub fn hdr_len(&self) -> usize {
        usize::from(self.data_offset()) * 4
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct UdpHdr {
    pub src_port: U16,
    pub dst_port: U16,
    pub len: U16,
    pub csum: [u8; 2],
}

impl WireHeader for UdpHdr {
    const NAME: &'static str = "udp";
}

impl UdpHdr {
    pub fn new(src_port: u16, dst_port: u16, payload_len: usize) -> Self {
        let len = Self::SIZE + payload_len;
        Self {
            src_port: U16::new(src_port),
            dst_port: U16::new(dst_port),
            len: U16::new(u16::try_from(len).unwrap_or(u16::MAX)),
            csum: [0; 2],
        }
    }
}

bitflags! {
    /// The flag bits in the first 16 bits of a GRE header.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GreFlags: u16 {
        const CSUM = 0x8000;
        const ROUTING = 0x4000;
        const KEY = 0x2000;
        const SEQ = 0x1000;
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct GreHdr {
    pub flags_ver: U16,
    pub proto: U16,
}

impl WireHeader for GreHdr {
    const NAME: &'static str = "gre";
}

impl GreHdr {
    pub fn new(flags: GreFlags, proto: u16) -> Self {
        Self { flags_ver: U16::new(flags.bits()), proto: U16::new(proto) }
    }

    pub fn flags(&self) -> GreFlags {
        GreFlags::from_bits_truncate(self.flags_ver.get())
    }

    /// The size of the optional key and sequence fields which follow
    /// the fixed header.
    pub fn optional_len(&self) -> usize {
        let flags = self.flags();
        let mut len = 0;
        if flags.contains(GreFlags::KEY) {
            len += 4;
        }
        if flags.contains(GreFlags::SEQ) {
            len += 4;
        }
        len
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct VxlanHdr {
    pub flags: u8,
    pub reserved: [u8; 3],
    pub vni: [u8; 3],
    pub reserved2: u8,
}

impl WireHeader for VxlanHdr {
    const NAME: &'static str = "vxlan";
}

impl VxlanHdr {
    /// The I bit: the VNI is valid.
    pub const FLAG_VNI: u8 = 0x08;

    pub fn new(vni: u32) -> Self {
        let [_, a, b, c] = vni.to_be_bytes();
        Self {
            flags: Self::FLAG_VNI,
            reserved: [0; 3],
            vni: [a, b, c],
            reserved2: 0,
        }
    }

    pub fn has_vni(&self) -> bool {
        self.flags & Self::FLAG_VNI != 0
    }

    pub fn vni(&self) -> u32 {
        u32::from_be_bytes([0, self.vni[0], self.vni[1], self.vni[2]])
    }
}

bitflags! {
    /// The low three bits of the GTP-U flags byte. When any of them
    /// is set the header carries four more bytes: a sequence number,
    /// an N-PDU number, and the next extension header type.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GtpFlags: u8 {
        const EXT = 0x04;
        const SEQ = 0x02;
        const NPDU = 0x01;
    }
}

#[repr(C)]
#[derive(
    Clone, Copy, Debug, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
)]
pub struct GtpuHdr {
    pub flags: u8,
    pub msg_type: u8,
    pub len: U16,
    pub teid: U32,
}

impl WireHeader for GtpuHdr {
    const NAME: &'static str = "gtpu";
}

impl GtpuHdr {
    /// Version 1, protocol type GTP.
    pub const VERSION_PT: u8 = 0x30;
    pub const OPT_LEN: usize = 4;

    pub fn new(teid: u32, flags: GtpFlags, payload_len: usize) -> Self {
        let opt = if flags.is_empty() { 0 } else { Self::OPT_LEN };
        Self {
            flags: Self::VERSION_PT | flags.bits(),
            msg_type: GTPU_MSG_GPDU,
            len: U16::new(u16::try_from(payload_len + opt).unwrap_or(u16::MAX)),
            teid: U32::new(teid),
        }
    }

    pub fn opt_flags(&self) -> GtpFlags {
        GtpFlags::from_bits_truncate(self.flags)
    }

    /// The size of the optional fields which follow the fixed header.
    pub fn optional_len(&self) -> usize {
        if self.opt_flags().is_empty() { 0 } else { Self::OPT_LEN }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(EtherHdr::SIZE, 14);
        assert_eq!(Ipv4Hdr::SIZE, 20);
        assert_eq!(TcpHdr::SIZE, 20);
        assert_eq!(UdpHdr::SIZE, 8);
        assert_eq!(GreHdr::SIZE, 4);
        assert_eq!(VxlanHdr::SIZE, 8);
        assert_eq!(GtpuHdr::SIZE, 8);
    }

    #[test]
    fn view_truncated() {
        let bytes = [0u8; 10];
        assert_eq!(
            EtherHdr::view_at(&bytes, 0).unwrap_err(),
            HeaderError::Truncated { hdr: "ether", off: 0 }
        );
        assert_eq!(
            UdpHdr::view_at(&bytes, 40).unwrap_err(),
            HeaderError::Truncated { hdr: "udp", off: 40 }
        );
    }

    #[test]
    fn ipv4_checksum_verifies() {
        let hdr = Ipv4Hdr::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            Protocol::UDP,
            0,
            8,
        );
        // Summing a header including its checksum yields 0xffff.
        let sum: u32 = hdr
            .as_bytes()
            .chunks_exact(2)
            .map(|w| u32::from(u16::from_be_bytes([w[0], w[1]])))
            .sum();
        let folded = (sum & 0xffff) + (sum >> 16);
        assert_eq!((folded & 0xffff) + (folded >> 16), 0xffff);
    }

    #[test]
    fn vxlan_vni_is_24_bits() {
        let hdr = VxlanHdr::new(0xab_cdef);
        assert!(hdr.has_vni());
        assert_eq!(hdr.vni(), 0xab_cdef);
        assert_eq!(VxlanHdr::new(0x1ff_ffff).vni(), 0xff_ffff);
    }

    #[test]
    fn gre_optional_fields() {
        let opt_len = |f| GreHdr::new(f, GRE_PROTO_IPV4).optional_len();
        assert_eq!(opt_len(GreFlags::empty()), 0);
        assert_eq!(opt_len(GreFlags::KEY), 4);
        assert_eq!(opt_len(GreFlags::KEY | GreFlags::SEQ), 8);
    }
}
