// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use clap::Args;
use clap::Parser;
use core::time::Duration;
use nicflow::api::DataplaneCfg;
use nicflow::api::PortId;
use nicflow::api::hairpin_peer;
use nicflow::engine::PacketView;
use nicflow::engine::io::Mbuf;
use nicflow::engine::io::MemIo;
use nicflow::engine::io::PacketIo;
use nicflow::engine::qos::NUM_QOS_LEVELS;
use nicflow::engine::qos::QosRings;
use nicflow::engine::worker::spawn_workers;
use nicflow::print::print_flows;
use nicflow::print::print_io_stats_into;
use nicflow::print::print_port_stats;
use nicflow::print::print_topology;
use nicflow::print::write_hrb;
use nicflowadm::API_VERSION;
use nicflowadm::MAJOR_VERSION;
use nicflowadm::NicflowAdm;
use nicflowadm::ReplaySummary;
use nicflowadm::load_cfg;
use nicflowadm::read_pcap;
use nicflowadm::root_logger;
use slog::info;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tabwriter::TabWriter;

/// Drive the nicflow flow offload engine from packet captures.
#[derive(Debug, Parser)]
#[command(version = nicflow_pkg_version())]
enum Command {
    /// Feed a capture through a dataplane and report what was
    /// offloaded.
    Replay {
        /// The capture to replay.
        pcap: String,

        /// The port the capture is received on.
        #[arg(short, long, default_value_t = 0)]
        port: PortId,

        /// Spread packets over queues round robin instead of by hash.
        #[arg(long)]
        round_robin: bool,

        /// After the replay, age flows as if this many seconds had
        /// passed without traffic.
        #[arg(long)]
        idle: Option<u64>,

        /// Run the capture through worker threads over in-memory
        /// packet I/O.
        #[arg(long)]
        workers: bool,

        /// Also pass the capture through the priority rings and show
        /// what each level carried.
        #[arg(long)]
        qos: bool,

        #[command(flatten)]
        cfg: CfgArgs,
    },

    /// Print how each packet of a capture parses.
    Parse {
        pcap: String,
    },

    /// Print the pipes and fixed entries of every port.
    Topology {
        /// Only this port.
        #[arg(short, long)]
        port: Option<PortId>,

        #[command(flatten)]
        cfg: CfgArgs,
    },
}

/// Dataplane configuration. Flags override the file.
#[derive(Args, Clone, Debug)]
struct CfgArgs {
    /// A TOML dataplane configuration.
    #[arg(long)]
    config: Option<String>,

    /// Interval between stats reports, in seconds.
    #[arg(short = 't', long)]
    stats_timer: Option<u64>,

    /// Number of queues per port.
    #[arg(short = 'q', long)]
    nr_queues: Option<u16>,

    /// Receive only; never transmit.
    #[arg(short = 'r', long)]
    rx_only: bool,

    /// Offload flows to hardware.
    #[arg(short = 'o', long)]
    hw_offload: Option<bool>,

    /// Forward offloaded flows straight to the peer port.
    #[arg(long)]
    hairpinq: bool,

    /// Age flows from a dedicated thread.
    #[arg(short = 'a', long)]
    age_thread: bool,
}

impl CfgArgs {
    fn build(&self) -> anyhow::Result<DataplaneCfg> {
        let mut cfg = match &self.config {
            Some(path) => load_cfg(path)?,
            None => DataplaneCfg::default(),
        };

        if let Some(t) = self.stats_timer {
            cfg.stats_timer = t;
        }
        if let Some(q) = self.nr_queues {
            cfg.nr_queues = q;
        }
        if let Some(o) = self.hw_offload {
            cfg.hw_offload = o;
        }
        cfg.rx_only |= self.rx_only;
        cfg.hairpin |= self.hairpinq;
        cfg.age_thread |= self.age_thread;

        cfg.validate()?;
        Ok(cfg)
    }
}

fn nicflow_pkg_version() -> String {
    format!("{MAJOR_VERSION}.{API_VERSION}")
}

fn print_summary(s: &ReplaySummary) -> std::io::Result<()> {
    let mut t = TabWriter::new(std::io::stdout());
    writeln!(t, "Replayed {} packets", s.total())?;
    write_hrb(&mut t)?;
    writeln!(t, "offloaded\t{}\t({} new flows)", s.offloaded, s.new_flows)?;
    for (reason, n) in &s.fallback {
        writeln!(t, "fallback\t{n}\t{reason}")?;
    }
    for (reason, n) in &s.dropped {
        writeln!(t, "dropped\t{n}\t{reason}")?;
    }
    t.flush()
}

/// Replay through worker threads. Packets are spread over the queues
/// of `port` and the dataplane is torn down once every packet has
/// been received.
fn replay_workers(
    log: &slog::Logger,
    adm: &NicflowAdm,
    port: PortId,
    pkts: &[Vec<u8>],
) -> anyhow::Result<()> {
    let dp = adm.dataplane().clone();
    let cfg = dp.cfg().clone();
    let depth = pkts.len().max(1);
    let io = Arc::new(MemIo::new(cfg.nr_ports, cfg.nr_queues, depth, depth));

    let mut injected = 0;
    for (i, pkt) in pkts.iter().enumerate() {
        let q = (i % usize::from(cfg.nr_queues)) as u16;
        if io.inject(port, q, Mbuf::new(pkt.clone(), 0)) {
            injected += 1;
        }
    }

    let workers = spawn_workers(dp.clone(), io.clone())?;
    let start = Instant::now();
    while io.rx_pending(port) > 0 && start.elapsed() < Duration::from_secs(30) {
        std::thread::sleep(Duration::from_millis(10));
    }
    info!(log, "capture received";
        "injected" => injected, "left" => io.rx_pending(port));

    workers.shutdown()?;

    let mut out = std::io::stdout();
    for p in [port, hairpin_peer(port)] {
        if let Some(stats) = io.port_stats(p) {
            print_io_stats_into(&mut out, p, &stats, None)?;
            writeln!(out)?;
        }
    }
    Ok(())
}

/// Push `pkts` through the priority rings of `port` and drain them
/// to an in-memory transmit queue.
fn replay_qos(
    port: PortId,
    nr_ports: u16,
    pkts: &[Vec<u8>],
) -> anyhow::Result<()> {
    let rings = QosRings::new(nr_ports);
    let io = MemIo::new(nr_ports, 1, 0, pkts.len().max(1));
    for pkt in pkts {
        rings.enqueue(port, Mbuf::new(pkt.clone(), 0));
    }

    let mut t = TabWriter::new(std::io::stdout());
    writeln!(t, "Port {port} priority rings")?;
    write_hrb(&mut t)?;
    writeln!(t, "LEVEL\tQUEUED")?;
    for level in (0..NUM_QOS_LEVELS).rev() {
        writeln!(t, "{level}\t{}", rings.len(port, level))?;
    }
    let mut sent = 0;
    loop {
        let n = rings.drain(port, &io);
        if n == 0 {
            break;
        }
        sent += n;
    }
    writeln!(t, "sent\t{sent}")?;
    writeln!(t, "overflow\t{}", rings.stats.overflow.val())?;
    writeln!(t, "unclassified\t{}", rings.stats.unclassified.val())?;
    t.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cmd = Command::parse();
    let log = root_logger();

    match cmd {
        Command::Replay {
            pcap,
            port,
            round_robin,
            idle,
            workers,
            qos,
            cfg,
        } => {
            let cfg = cfg.build()?;
            let pkts = read_pcap(&pcap)?;
            info!(log, "replaying capture";
                "path" => &pcap, "packets" => pkts.len());

            if qos {
                replay_qos(port, cfg.nr_ports, &pkts)?;
                println!();
            }

            let adm = NicflowAdm::new(log.clone(), cfg)?;
            if workers {
                return replay_workers(&log, &adm, port, &pkts);
            }

            adm.dataplane().start()?;
            let summary = adm.replay(port, &pkts, !round_robin)?;
            print_summary(&summary)?;
            println!();
            print_flows(&adm.dataplane().dump_flows(port)?)?;

            if let Some(secs) = idle {
                let aged = adm.age(Duration::from_secs(secs))?;
                println!("\nAged {aged} flows after {secs}s idle");
            }

            println!();
            print_port_stats(port, &adm.dataplane().dump_stats(port)?)?;
            adm.dataplane().destroy()?;
        }

        Command::Parse { pcap } => {
            let pkts = read_pcap(&pcap)?;
            let mut t = TabWriter::new(std::io::stdout());
            writeln!(t, "#\tLEN\tPACKET")?;
            for (i, pkt) in pkts.iter().enumerate() {
                match PacketView::parse(pkt) {
                    Ok(view) => writeln!(t, "{i}\t{}\t{view}", pkt.len())?,
                    Err(e) => writeln!(t, "{i}\t{}\terror: {e:?}", pkt.len())?,
                }
            }
            t.flush()?;
        }

        Command::Topology { port, cfg } => {
            let adm = NicflowAdm::new(log.clone(), cfg.build()?)?;
            let ports = match port {
                Some(p) => vec![p],
                None => adm.dataplane().port_ids(),
            };

            for p in ports {
                print_topology(&adm.dataplane().dump_topology(p)?)?;
                println!();
            }
            adm.dataplane().destroy()?;
        }
    }

    Ok(())
}
