// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Packet I/O.
//!
//! Workers receive and transmit in bursts on a (port, queue) pair.
//! [`MemIo`] is an in-memory implementation: packets are injected into
//! receive queues and whatever is transmitted is kept for inspection.

use crate::api::PortId;
use crate::api::PortIoStats;
use crate::api::QueueId;
use crate::api::QueueIoStats;
use crate::sys::sync::NfMutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;

/// The largest burst a worker receives or transmits at once.
pub const MAX_BURST: usize = 32;

/// A packet buffer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Mbuf {
    pub data: Vec<u8>,
    /// The hash the NIC computed on receipt; zero if none.
    pub hash: u32,
}

impl Mbuf {
    pub fn new(data: Vec<u8>, hash: u32) -> Self {
        Self { data, hash }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

pub trait PacketIo: Send + Sync {
    /// Receive up to `max` packets from (`port`, `queue`) into `out`.
    /// Returns the number received.
    fn rx_burst(
        &self,
        port: PortId,
        queue: QueueId,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize;

    /// Transmit `pkts` on (`port`, `queue`). Returns the number sent;
    /// the rest are released.
    fn tx_burst(&self, port: PortId, queue: QueueId, pkts: Vec<Mbuf>) -> usize;

    fn port_stats(&self, port: PortId) -> Option<PortIoStats>;
}

#[derive(Debug, Default)]
struct MemQueue {
    rx: VecDeque<Mbuf>,
    tx: Vec<Mbuf>,
    stats: QueueIoStats,
}

#[derive(Debug, Default)]
struct MemPort {
    queues: Vec<MemQueue>,
    rx_missed: u64,
}

/// In-memory packet I/O.
#[derive(Debug)]
pub struct MemIo {
    ports: NfMutex<BTreeMap<PortId, MemPort>>,
    rx_depth: usize,
    tx_depth: usize,
}

impl MemIo {
    /// Create `nr_ports` ports of `nr_queues` queues. A receive queue
    /// holds at most `rx_depth` packets and a transmit queue at most
    /// `tx_depth`.
    pub fn new(
        nr_ports: u16,
        nr_queues: u16,
        rx_depth: usize,
        tx_depth: usize,
    ) -> Self {
        let ports = (0..nr_ports)
            .map(|p| {
                let queues = (0..nr_queues)
                    .map(|q| MemQueue {
                        stats: QueueIoStats { queue: q, ..Default::default() },
                        ..Default::default()
                    })
                    .collect();
                (p, MemPort { queues, rx_missed: 0 })
            })
            .collect();

        Self { ports: NfMutex::new(ports), rx_depth, tx_depth }
    }

    /// Queue `pkt` for receipt on (`port`, `queue`). Returns false if
    /// the queue is full or does not exist.
    pub fn inject(&self, port: PortId, queue: QueueId, pkt: Mbuf) -> bool {
        let mut ports = self.ports.lock();
        let Some(mp) = ports.get_mut(&port) else {
            return false;
        };

        let full = match mp.queues.get(usize::from(queue)) {
            Some(q) => q.rx.len() >= self.rx_depth,
            None => return false,
        };

        if full {
            mp.rx_missed += 1;
            return false;
        }

        mp.queues[usize::from(queue)].rx.push_back(pkt);
        true
    }

    /// The number of packets waiting to be received on `port`.
    pub fn rx_pending(&self, port: PortId) -> usize {
        self.ports
            .lock()
            .get(&port)
            .map_or(0, |p| p.queues.iter().map(|q| q.rx.len()).sum())
    }

    /// Take everything transmitted on `port` so far.
    pub fn take_tx(&self, port: PortId) -> Vec<Mbuf> {
        let mut ports = self.ports.lock();
        let Some(mp) = ports.get_mut(&port) else {
            return vec![];
        };
        mp.queues.iter_mut().flat_map(|q| q.tx.drain(..)).collect()
    }
}

impl PacketIo for MemIo {
    fn rx_burst(
        &self,
        port: PortId,
        queue: QueueId,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        let mut ports = self.ports.lock();
        let idx = usize::from(queue);
        let Some(q) =
            ports.get_mut(&port).and_then(|p| p.queues.get_mut(idx))
        else {
            return 0;
        };

        let n = max.min(q.rx.len());
        for pkt in q.rx.drain(..n) {
            q.stats.rx_packets += 1;
            q.stats.rx_bytes += pkt.len() as u64;
            out.push(pkt);
        }
        n
    }

    fn tx_burst(
        &self,
        port: PortId,
        queue: QueueId,
        pkts: Vec<Mbuf>,
    ) -> usize {
        let mut ports = self.ports.lock();
        let idx = usize::from(queue);
        let Some(q) =
            ports.get_mut(&port).and_then(|p| p.queues.get_mut(idx))
        else {
            return 0;
        };

        let mut sent = 0;
        for pkt in pkts {
            if q.tx.len() >= self.tx_depth {
                q.stats.tx_dropped += 1;
                continue;
            }
            q.stats.tx_packets += 1;
            q.stats.tx_bytes += pkt.len() as u64;
            q.tx.push(pkt);
            sent += 1;
        }
        sent
    }

    fn port_stats(&self, port: PortId) -> Option<PortIoStats> {
        let ports = self.ports.lock();
        let mp = ports.get(&port)?;
        let mut out =
            PortIoStats { rx_missed: mp.rx_missed, ..Default::default() };

        for q in &mp.queues {
            out.rx_packets += q.stats.rx_packets;
            out.rx_bytes += q.stats.rx_bytes;
            out.tx_packets += q.stats.tx_packets;
            out.tx_bytes += q.stats.tx_bytes;
            out.tx_errors += q.stats.tx_dropped;
            out.queues.push(q.stats);
        }
        Some(out)
    }
}
