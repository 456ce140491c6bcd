// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! nicflow administration library.
//!
//! Everything `nicflowadm` does runs against a [`Dataplane`] on the
//! software offload engine, fed from packet captures.

use core::time::Duration;
use nicflow::ExecCtx;
use nicflow::api::DataplaneCfg;
use nicflow::api::NicflowError;
use nicflow::api::PortId;
use nicflow::d_error::ErrorBlock;
use nicflow::engine::Dataplane;
use nicflow::engine::ProcessResult;
use nicflow::engine::SoftEngine;
use nicflow::sys::time::Moment;
use pcap_parser::Linktype;
use pcap_parser::pcap;
use slog::Drain;
use std::collections::BTreeMap;
use std::sync::Arc;

pub use nicflow::api::API_VERSION;
pub use nicflow::api::MAJOR_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum AdmError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}: malformed capture: {msg}")]
    Pcap { path: String, msg: String },

    #[error("{path}: unsupported link type {linktype}")]
    LinkType { path: String, linktype: i32 },

    #[error("{path}: {source}")]
    Config {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Nicflow(#[from] NicflowError),
}

/// Build the root logger: terminal output, filtered by `RUST_LOG`.
pub fn root_logger() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_envlogger::new(drain);
    let drain = slog_async::Async::new(drain).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "nicflowadm"))
}

/// Load a dataplane configuration from a TOML file. Fields left out
/// keep their defaults.
pub fn load_cfg(path: &str) -> Result<DataplaneCfg, AdmError> {
    let text = std::fs::read_to_string(path)
        .map_err(|source| AdmError::Io { path: path.into(), source })?;
    let cfg: DataplaneCfg = toml::from_str(&text)
        .map_err(|source| AdmError::Config { path: path.into(), source })?;
    cfg.validate()?;
    Ok(cfg)
}

/// Read every packet of a legacy pcap file.
pub fn read_pcap(path: &str) -> Result<Vec<Vec<u8>>, AdmError> {
    let bytes = std::fs::read(path)
        .map_err(|source| AdmError::Io { path: path.into(), source })?;
    parse_pcap(path, &bytes)
}

fn parse_pcap(path: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>, AdmError> {
    let malformed = |msg: String| AdmError::Pcap { path: path.into(), msg };

    let (mut rest, hdr) = pcap::parse_pcap_header(bytes)
        .map_err(|e| malformed(format!("header: {e:?}")))?;

    if hdr.network != Linktype::ETHERNET {
        return Err(AdmError::LinkType {
            path: path.into(),
            linktype: hdr.network.0,
        });
    }

    let mut pkts = vec![];
    while !rest.is_empty() {
        let (next, block) = pcap::parse_pcap_frame(rest)
            .map_err(|e| malformed(format!("frame {}: {e:?}", pkts.len())))?;
        pkts.push(block.data.to_vec());
        rest = next;
    }
    Ok(pkts)
}

/// What became of the packets of one replay.
#[derive(Debug, Default)]
pub struct ReplaySummary {
    pub new_flows: u64,
    pub offloaded: u64,
    pub fallback: BTreeMap<String, u64>,
    pub dropped: BTreeMap<String, u64>,
}

impl ReplaySummary {
    fn record(&mut self, res: &ProcessResult) {
        match res {
            ProcessResult::Offloaded { created } => {
                self.offloaded += 1;
                if *created {
                    self.new_flows += 1;
                }
            }

            ProcessResult::Fallback(reason) => {
                *self.fallback.entry(reason.to_string()).or_default() += 1;
            }

            ProcessResult::Drop(reason) => {
                let eb =
                    ErrorBlock::<8>::from_err(reason).unwrap_or_else(|eb| eb);
                *self.dropped.entry(eb.to_string()).or_default() += 1;
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.offloaded
            + self.fallback.values().sum::<u64>()
            + self.dropped.values().sum::<u64>()
    }
}

/// A dataplane on the software offload engine.
pub struct NicflowAdm {
    eng: Arc<SoftEngine>,
    dp: Arc<Dataplane>,
}

impl NicflowAdm {
    /// Bring up every port of `cfg`. The dataplane is left in the
    /// ready state.
    pub fn new(log: slog::Logger, cfg: DataplaneCfg) -> Result<Self, AdmError> {
        let eng = Arc::new(SoftEngine::new(cfg.rule_capacity));
        let dp = Dataplane::new(Arc::new(ExecCtx::new(log)), cfg, eng.clone())?;
        Ok(Self { eng, dp: Arc::new(dp) })
    }

    pub fn dataplane(&self) -> &Arc<Dataplane> {
        &self.dp
    }

    pub fn engine(&self) -> &Arc<SoftEngine> {
        &self.eng
    }

    /// Feed `pkts` through `port`, spreading them over the queues the
    /// way RSS would: by flow hash, or round robin when `hash` is
    /// false. Completions are handled as they arrive.
    pub fn replay(
        &self,
        port: PortId,
        pkts: &[Vec<u8>],
        hash: bool,
    ) -> Result<ReplaySummary, AdmError> {
        let nr_queues = self.dp.cfg().nr_queues;
        let mut summary = ReplaySummary::default();

        for (i, pkt) in pkts.iter().enumerate() {
            let (queue, rss) = if hash {
                let h = crc32fast::hash(&pkt[..pkt.len().min(64)]);
                ((h % u32::from(nr_queues)) as u16, h)
            } else {
                ((i % usize::from(nr_queues)) as u16, 0)
            };

            let res = self.dp.process_pkt(port, queue, pkt, rss)?;
            summary.record(&res);
            self.dp.poll_completions(port, queue)?;
        }

        self.settle()?;
        Ok(summary)
    }

    /// Handle completions on every queue until none are left.
    pub fn settle(&self) -> Result<usize, AdmError> {
        let mut total = 0;
        loop {
            let mut n = 0;
            for port in self.dp.port_ids() {
                for q in 0..self.dp.cfg().nr_queues {
                    n += self.dp.poll_completions(port, q)?;
                }
            }
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Run an aging scan as if `idle` had passed without traffic.
    /// Returns the number of flows aged out.
    pub fn age(&self, idle: Duration) -> Result<usize, AdmError> {
        let n = self.dp.aging().poll_all(Moment::now() + idle);
        self.settle()?;
        Ok(n)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nicflow_test_utils::Flow;
    use nicflow_test_utils::pcap::PcapBuilder;
    use nicflow_test_utils::plain;
    use nicflow_test_utils::vxlan;

    fn tmp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("nicflowadm-{}-{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[test]
    fn replay_capture() {
        let path = tmp_path("replay.pcap");
        let flow = Flow::tcp("10.0.0.1", "10.0.0.2", 1234, 80);
        let mut pcap = PcapBuilder::new(&path);
        pcap.add_pkt(&vxlan(9, &flow));
        pcap.add_pkt(&vxlan(9, &flow));
        pcap.add_pkt(&plain(&flow));
        pcap.add_pkt(&[0u8; 10]);
        drop(pcap);

        let pkts = read_pcap(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(pkts.len(), 4);

        let adm = NicflowAdm::new(discard(), DataplaneCfg::default()).unwrap();
        adm.dataplane().start().unwrap();
        let summary = adm.replay(0, &pkts, true).unwrap();
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.new_flows, 1);
        assert_eq!(summary.offloaded, 2);
        assert_eq!(summary.fallback.get("not-tunneled"), Some(&1));
        assert_eq!(summary.dropped.values().sum::<u64>(), 1);

        assert_eq!(adm.dataplane().state_counts(0).unwrap(), [0, 1, 0, 0]);
        assert_eq!(adm.age(Duration::from_secs(60)).unwrap(), 1);
        assert_eq!(adm.dataplane().state_counts(0).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let path = tmp_path("cfg.toml");
        std::fs::write(&path, "nr_queues = 4\nhairpin = true\n").unwrap();
        let cfg = load_cfg(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(cfg.nr_queues, 4);
        assert!(cfg.hairpin);
        assert_eq!(cfg.flow_capacity, DataplaneCfg::default().flow_capacity);
    }

    #[test]
    fn invalid_config_is_refused() {
        let path = tmp_path("bad.toml");
        std::fs::write(&path, "nr_queues = 1\n").unwrap();
        let err = load_cfg(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            err,
            AdmError::Nicflow(NicflowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn truncated_capture_is_an_error() {
        assert!(matches!(
            parse_pcap("x", &[0xd4, 0xc3]),
            Err(AdmError::Pcap { .. })
        ));
    }
}
