// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Print dumps in a human-friendly manner.
//!
//! These are shared by nicflowadm and the integration tests.

use crate::api::DumpFlowsResp;
use crate::api::DumpTopologyResp;
use crate::api::FlowEntryDump;
use crate::api::PortId;
use crate::api::PortIoStats;
use crate::api::PortRates;
use crate::engine::dataplane::PortStats;
use crate::engine::dataplane::PortStatsSnap;
use crate::sys::stat::StatProvider;
use std::io::Write;
use tabwriter::TabWriter;

/// Print a [`DumpFlowsResp`].
pub fn print_flows(resp: &DumpFlowsResp) -> std::io::Result<()> {
    print_flows_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpFlowsResp`] into a given writer.
pub fn print_flows_into(
    writer: &mut impl Write,
    resp: &DumpFlowsResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Port {} flows: {}", resp.port, resp.flows.len())?;
    write_hr(&mut t)?;
    print_flow_header(&mut t)?;
    for flow in &resp.flows {
        print_flow(&mut t, flow)?;
    }
    t.flush()
}

/// Print the header for the [`print_flow()`] output.
pub fn print_flow_header(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "FLOW\tSTATE\tQ\tPKTS\tBYTES\tAGE\tEXPIRES\tRULE")
}

pub fn print_flow(
    t: &mut impl Write,
    flow: &FlowEntryDump,
) -> std::io::Result<()> {
    let opt = |v: Option<u64>, unit: &str| {
        v.map_or_else(|| "-".to_string(), |v| format!("{v}{unit}"))
    };

    writeln!(
        t,
        "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
        flow.key,
        flow.state,
        flow.queue,
        flow.pkts,
        flow.bytes,
        opt(flow.aging_secs.map(u64::from), "s"),
        opt(flow.expires_in_ms, "ms"),
        flow.rule.map_or_else(|| "-".to_string(), |r| format!("{r:#x}")),
    )
}

/// Print a [`DumpTopologyResp`].
pub fn print_topology(resp: &DumpTopologyResp) -> std::io::Result<()> {
    print_topology_into(&mut std::io::stdout(), resp)
}

/// Print a [`DumpTopologyResp`] into a given writer.
pub fn print_topology_into(
    writer: &mut impl Write,
    resp: &DumpTopologyResp,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Port {}", resp.port)?;
    write_hrb(&mut t)?;
    writeln!(t, "PIPE\tDOMAIN\tROOT\tFWD\tMISS\tENTRIES")?;
    for pipe in &resp.pipes {
        writeln!(
            t,
            "{}\t{}\t{}\t{}\t{}\t{}",
            pipe.name,
            pipe.domain,
            if pipe.is_root { "yes" } else { "" },
            pipe.fwd,
            pipe.fwd_miss,
            pipe.entries.len(),
        )?;
    }
    t.flush()?;

    for pipe in resp.pipes.iter().filter(|p| !p.entries.is_empty()) {
        writeln!(t, "\n{}", pipe.name)?;
        write_hr(&mut t)?;
        writeln!(t, "PRI\tHITS\tMATCH\tFWD")?;
        for e in &pipe.entries {
            let (pri, hits) = (e.priority, e.hits);
            writeln!(t, "{pri}\t{hits}\t{}\t{}", e.matches, e.fwd)?;
        }
        t.flush()?;
    }

    Ok(())
}

/// Print the counters of a port.
pub fn print_port_stats(
    port: PortId,
    snap: &PortStatsSnap,
) -> std::io::Result<()> {
    print_port_stats_into(&mut std::io::stdout(), port, snap)
}

/// Print the counters of a port into a given writer, one per line.
pub fn print_port_stats_into(
    writer: &mut impl Write,
    port: PortId,
    snap: &PortStatsSnap,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Port {port} stats")?;
    write_hr(&mut t)?;
    for (name, val) in PortStats::names().iter().zip(snap.values()) {
        writeln!(t, "{name}\t{val}")?;
    }
    t.flush()
}

/// Print the packet I/O counters of a port, with rates if known.
pub fn print_io_stats_into(
    writer: &mut impl Write,
    port: PortId,
    stats: &PortIoStats,
    rates: Option<&PortRates>,
) -> std::io::Result<()> {
    let mut t = TabWriter::new(writer);

    writeln!(t, "Port {port} I/O")?;
    write_hr(&mut t)?;
    writeln!(t, "\tPACKETS\tBYTES\tERRORS")?;
    let s = stats;
    writeln!(t, "RX\t{}\t{}\t{}", s.rx_packets, s.rx_bytes, s.rx_errors)?;
    writeln!(t, "TX\t{}\t{}\t{}", s.tx_packets, s.tx_bytes, s.tx_errors)?;
    writeln!(t, "missed\t{}", stats.rx_missed)?;
    writeln!(t, "nombuf\t{}", stats.rx_nombuf)?;
    if let Some(r) = rates {
        writeln!(t, "RX rate\t{} pps\t{} bps", r.rx_pps, r.rx_bps)?;
        writeln!(t, "TX rate\t{} pps\t{} bps", r.tx_pps, r.tx_bps)?;
    }
    t.flush()?;

    if !stats.queues.is_empty() {
        writeln!(t)?;
        writeln!(t, "QUEUE\tRX PKTS\tRX BYTES\tTX PKTS\tTX BYTES\tTX DROP")?;
        for q in &stats.queues {
            writeln!(
                t,
                "{}\t{}\t{}\t{}\t{}\t{}",
                q.queue,
                q.rx_packets,
                q.rx_bytes,
                q.tx_packets,
                q.tx_bytes,
                q.tx_dropped,
            )?;
        }
        t.flush()?;
    }

    Ok(())
}

/// Print a horizontal rule in bold.
pub fn write_hrb(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:=<70}", "=")
}

/// Print a horizontal rule.
pub fn write_hr(t: &mut impl Write) -> std::io::Result<()> {
    writeln!(t, "{:-<70}", "-")
}
