// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Flow identity.

use super::PortId;
use super::encap::TunnelId;
use super::encap::TunnelType;
use super::ip::Ipv4Addr;
use super::ip::Protocol;
use core::cmp::Ordering;
use core::fmt;
use core::fmt::Display;
use core::hash::Hash;
use core::hash::Hasher;
use serde::Deserialize;
use serde::Serialize;

/// The identity of a flow as tracked by the flow cache.
///
/// The key is unidirectional: `src` is always the sender of the packet
/// that produced it. A reply travelling the other way produces a
/// different key.
///
/// `hash` is a hint carried along for table placement; it never takes
/// part in equality, ordering, or hashing.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub tun_id: TunnelId,
    pub proto: Protocol,
    pub tun_type: TunnelType,
    pub port: PortId,
    pub hash: u32,
}

impl FlowKey {
    fn identity(
        &self,
    ) -> (Ipv4Addr, Ipv4Addr, u16, u16, TunnelId, Protocol, TunnelType, PortId)
    {
        (
            self.src_ip,
            self.dst_ip,
            self.src_port,
            self.dst_port,
            self.tun_id,
            self.proto,
            self.tun_type,
            self.port,
        )
    }

    /// Return the key a packet travelling in the opposite direction
    /// on the same tunnel would produce.
    pub fn mirror(self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            ..self
        }
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl PartialOrd for FlowKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FlowKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity().cmp(&other.identity())
    }
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.proto, self.src_ip, self.src_port, self.dst_ip, self.dst_port,
        )?;

        if self.tun_type.is_tunnel() {
            write!(f, "@{}/{}", self.tun_type, self.tun_id)?;
        }

        Ok(())
    }
}

/// The lifecycle state of a flow entry.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum EntryState {
    /// A hardware install has been issued and not yet confirmed.
    PendingAdd,

    /// The hardware rule is installed.
    Active,

    /// A hardware removal has been issued and not yet confirmed.
    PendingDelete,

    /// Terminal. The entry is released once it is no longer
    /// referenced by a pending operation.
    Deleted,
}

impl Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::PendingAdd => "PENDING_ADD",
            Self::Active => "ACTIVE",
            Self::PendingDelete => "PENDING_DELETE",
            Self::Deleted => "DELETED",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    fn key() -> FlowKey {
        FlowKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: 40000,
            dst_port: 80,
            tun_id: TunnelId::new(7),
            proto: Protocol::TCP,
            tun_type: TunnelType::Vxlan,
            port: 0,
            hash: 0x1234,
        }
    }

    #[test]
    fn hash_hint_is_not_identity() {
        let a = key();
        let b = FlowKey { hash: 0xdead_beef, ..a };
        assert_eq!(a, b);
        assert_eq!(a.cmp(&b), Ordering::Equal);
    }

    #[test]
    fn mirror_is_a_different_flow() {
        let a = key();
        assert_ne!(a, a.mirror());
        assert_eq!(a, a.mirror().mirror());
    }

    #[test]
    fn display() {
        assert_eq!(
            key().to_string(),
            "TCP:10.0.0.1:40000:10.0.0.2:80@vxlan/0x7"
        );
        let plain = FlowKey { tun_type: TunnelType::None, ..key() };
        assert_eq!(plain.to_string(), "TCP:10.0.0.1:40000:10.0.0.2:80");
    }
}
