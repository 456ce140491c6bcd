// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Types for dumping flow, pipeline, and port state.

use super::PortId;
use super::QueueId;
use super::flow::EntryState;
use super::flow::FlowKey;
use alloc::string::String;
use alloc::vec::Vec;
use serde::Deserialize;
use serde::Serialize;

/// A single flow cache entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FlowEntryDump {
    pub key: FlowKey,
    pub state: EntryState,
    pub queue: QueueId,
    pub pkts: u64,
    pub bytes: u64,
    /// The aging budget assigned on activation.
    pub aging_secs: Option<u32>,
    /// Milliseconds left until the hardware ages the rule out.
    pub expires_in_ms: Option<u64>,
    /// The hardware rule backing the flow, while `Active`.
    pub rule: Option<u64>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpFlowsResp {
    pub port: PortId,
    pub flows: Vec<FlowEntryDump>,
}

/// One installed entry of a pipe.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipeEntryDump {
    pub priority: u8,
    pub matches: String,
    pub fwd: String,
    pub hits: u64,
}

/// A pipe (match stage) and its forwarding targets.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipeDump {
    pub name: String,
    pub domain: String,
    pub is_root: bool,
    pub fwd: String,
    pub fwd_miss: String,
    pub entries: Vec<PipeEntryDump>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DumpTopologyResp {
    pub port: PortId,
    pub pipes: Vec<PipeDump>,
}

/// Counters for one queue of a port's packet I/O.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
pub struct QueueIoStats {
    pub queue: QueueId,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
}

/// Counters for a port's packet I/O.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct PortIoStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_missed: u64,
    pub rx_nombuf: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub queues: Vec<QueueIoStats>,
}

/// Packet and bit rates derived from two successive
/// [`PortIoStats`] samples.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PortRates {
    pub rx_pps: u64,
    pub rx_bps: u64,
    pub tx_pps: u64,
    pub tx_bps: u64,
}

impl PortIoStats {
    /// Compute rates over `elapsed_ms` given the `prev` sample.
    pub fn rates_since(
        &self,
        prev: &PortIoStats,
        elapsed_ms: u64,
    ) -> PortRates {
        if elapsed_ms == 0 {
            return PortRates::default();
        }

        let per_sec = |now: u64, then: u64| {
            now.saturating_sub(then).saturating_mul(1_000) / elapsed_ms
        };

        PortRates {
            rx_pps: per_sec(self.rx_packets, prev.rx_packets),
            rx_bps: per_sec(self.rx_bytes, prev.rx_bytes).saturating_mul(8),
            tx_pps: per_sec(self.tx_packets, prev.tx_packets),
            tx_bps: per_sec(self.tx_bytes, prev.tx_bytes).saturating_mul(8),
        }
    }
}
