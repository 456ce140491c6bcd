// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use super::ip::Ipv4Addr;
use super::mac::MacAddr;
use alloc::string::String;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// The well-known UDP destination port for VXLAN.
pub const VXLAN_PORT: u16 = 4789;

/// The well-known UDP destination port for GTP-U.
pub const GTPU_PORT: u16 = 2152;

/// The encapsulation a packet arrived in.
///
/// Each variant other than [`TunnelType::None`] has exactly one
/// match stage in every port's pipeline.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum TunnelType {
    #[default]
    None,
    Gre,
    Vxlan,
    GtpU,
}

impl TunnelType {
    /// The tunnels which have an installable match stage.
    pub const OFFLOADABLE: [TunnelType; 3] =
        [TunnelType::Vxlan, TunnelType::Gre, TunnelType::GtpU];

    pub fn is_tunnel(&self) -> bool {
        *self != TunnelType::None
    }

    /// Is the inner packet expected to carry an Ethernet header?
    pub fn inner_has_l2(&self) -> bool {
        matches!(self, TunnelType::Vxlan)
    }
}

impl Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Gre => "gre",
            Self::Vxlan => "vxlan",
            Self::GtpU => "gtpu",
        };
        write!(f, "{s}")
    }
}

impl FromStr for TunnelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "gre" => Ok(Self::Gre),
            "vxlan" => Ok(Self::Vxlan),
            "gtpu" | "gtp-u" | "gtp" => Ok(Self::GtpU),
            _ => Err(format!("invalid tunnel type: {s}")),
        }
    }
}

/// A tunnel's identifying field: the VXLAN VNI, the GRE key, or the
/// GTP-U TEID. Zero when the packet is not tunneled (or a GRE header
/// carries no key).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct TunnelId(u32);

impl TunnelId {
    pub const NONE: Self = Self(0);

    pub const fn new(val: u32) -> Self {
        Self(val)
    }

    pub const fn get(&self) -> u32 {
        self.0
    }
}

impl From<u32> for TunnelId {
    fn from(val: u32) -> Self {
        Self(val)
    }
}

impl From<TunnelId> for u32 {
    fn from(id: TunnelId) -> Self {
        id.0
    }
}

impl Display for TunnelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The outer headers pushed by a port's egress re-encapsulation
/// stage.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct EncapCfg {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub ttl: u8,
    pub vni: TunnelId,
}

impl Default for EncapCfg {
    fn default() -> Self {
        Self {
            src_mac: MacAddr::from_const([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            dst_mac: MacAddr::from_const([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]),
            src_ip: Ipv4Addr::from_const([11, 21, 31, 41]),
            dst_ip: Ipv4Addr::from_const([81, 81, 81, 81]),
            ttl: 17,
            vni: TunnelId::new(0xadadad),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tunnel_type_from_str() {
        assert_eq!("VXLAN".parse::<TunnelType>(), Ok(TunnelType::Vxlan));
        assert_eq!("gtp-u".parse::<TunnelType>(), Ok(TunnelType::GtpU));
        assert!("geneve".parse::<TunnelType>().is_err());
    }

    #[test]
    fn only_vxlan_carries_inner_l2() {
        assert!(TunnelType::Vxlan.inner_has_l2());
        assert!(!TunnelType::Gre.inner_has_l2());
        assert!(!TunnelType::GtpU.inner_has_l2());
    }
}
