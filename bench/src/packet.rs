// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use nicflow::engine::headers::GtpFlags;
use nicflow_test_utils::*;

/// A family of related packets to benchmark.
pub trait BenchPacket {
    /// Label the packet family in a human-friendly manner.
    fn packet_label(&self) -> String;

    /// Return a list of discrete scenarios.
    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>>;
}

/// An individual packet to time the parse/process timing of.
pub trait BenchPacketInstance {
    fn instance_name(&self) -> String;

    /// Generate the packet of flow number `n`.
    fn generate(&self, n: u16) -> Vec<u8>;
}

fn inner(n: u16) -> Flow {
    Flow::tcp("10.0.0.1", "10.0.0.2", 1024 + n, 443)
}

#[derive(Copy, Clone, Debug)]
pub enum Encap {
    Plain,
    Vxlan,
    Gre,
    GreKeySeq,
    Gtpu,
    GtpuExt,
}

impl BenchPacketInstance for Encap {
    fn instance_name(&self) -> String {
        format!("{self:?}")
    }

    fn generate(&self, n: u16) -> Vec<u8> {
        let flow = inner(n);
        match self {
            Self::Plain => plain(&flow),
            Self::Vxlan => vxlan(0x1234, &flow),
            Self::Gre => gre(None, None, &flow),
            Self::GreKeySeq => gre(Some(0x1234), Some(u32::from(n)), &flow),
            Self::Gtpu => gtpu(0x1234, GtpFlags::empty(), &flow),
            Self::GtpuExt => gtpu(0x1234, GtpFlags::EXT, &flow),
        }
    }
}

/// Every supported encapsulation.
pub struct Encaps;

impl BenchPacket for Encaps {
    fn packet_label(&self) -> String {
        "Encap".into()
    }

    fn test_cases(&self) -> Vec<Box<dyn BenchPacketInstance>> {
        [
            Encap::Plain,
            Encap::Vxlan,
            Encap::Gre,
            Encap::GreKeySeq,
            Encap::Gtpu,
            Encap::GtpuExt,
        ]
        .into_iter()
        .map(|v| Box::new(v) as Box<dyn BenchPacketInstance>)
        .collect()
    }
}
