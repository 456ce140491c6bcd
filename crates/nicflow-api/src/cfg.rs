// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use super::NicflowError;
use super::encap::EncapCfg;
use serde::Deserialize;
use serde::Serialize;

/// The default number of flows a single port may track.
pub const DEF_FLOW_CAPACITY: u32 = 8096;

/// The default upper bound on time spent in one completion or aging
/// poll.
pub const DEF_MAX_HANDLING_MS: u64 = 10;

/// The inclusive lower bound of the per-flow aging budget.
pub const DEF_AGING_MIN_SECS: u32 = 5;

/// The exclusive upper bound of the per-flow aging budget.
pub const DEF_AGING_MAX_SECS: u32 = 60;

/// The minimum number of queues per port: one is not enough to
/// spread RSS traffic.
pub const MIN_QUEUES: u16 = 2;

/// Configuration for a dataplane instance.
///
/// Every field has a default so that a partial TOML document is a
/// valid configuration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DataplaneCfg {
    /// Number of physical ports. Ports are paired for hairpin.
    pub nr_ports: u16,

    /// Number of receive queues per port.
    pub nr_queues: u16,

    /// Forward offloaded traffic directly to the peer port instead
    /// of through the RSS fallback.
    pub hairpin: bool,

    /// Run aging from a dedicated thread instead of from every
    /// worker.
    pub age_thread: bool,

    /// Print stats every `stats_timer` seconds; zero disables.
    pub stats_timer: u64,

    /// Install hardware rules for new flows.
    pub hw_offload: bool,

    /// Only receive; never transmit.
    pub rx_only: bool,

    /// Maximum number of flows tracked per port.
    pub flow_capacity: u32,

    /// Maximum number of rules the offload engine may hold per port.
    pub rule_capacity: u32,

    /// Bound on a single completion/aging poll, in milliseconds.
    pub max_handling_ms: u64,

    /// Each flow's aging budget is drawn from [min, max), which must
    /// lie within [`DEF_AGING_MIN_SECS`, `DEF_AGING_MAX_SECS`).
    pub aging_min_secs: u32,
    pub aging_max_secs: u32,

    /// The outer headers pushed by the egress stage.
    pub encap: EncapCfg,
}

impl Default for DataplaneCfg {
    fn default() -> Self {
        Self {
            nr_ports: 2,
            nr_queues: MIN_QUEUES,
            hairpin: false,
            age_thread: false,
            stats_timer: 0,
            hw_offload: true,
            rx_only: false,
            flow_capacity: DEF_FLOW_CAPACITY,
            rule_capacity: DEF_FLOW_CAPACITY,
            max_handling_ms: DEF_MAX_HANDLING_MS,
            aging_min_secs: DEF_AGING_MIN_SECS,
            aging_max_secs: DEF_AGING_MAX_SECS,
            encap: EncapCfg::default(),
        }
    }
}

impl DataplaneCfg {
    pub fn validate(&self) -> Result<(), NicflowError> {
        if self.nr_ports == 0 {
            return Err(NicflowError::InvalidConfig(
                "at least one port is required".into(),
            ));
        }

        if self.nr_queues < MIN_QUEUES {
            return Err(NicflowError::InvalidConfig(format!(
                "nr_queues must be at least {MIN_QUEUES}, got {}",
                self.nr_queues
            )));
        }

        if self.flow_capacity == 0 || self.rule_capacity == 0 {
            return Err(NicflowError::InvalidConfig(
                "flow and rule capacity must be non-zero".into(),
            ));
        }

        if self.aging_min_secs < DEF_AGING_MIN_SECS
            || self.aging_max_secs > DEF_AGING_MAX_SECS
            || self.aging_min_secs >= self.aging_max_secs
        {
            return Err(NicflowError::InvalidConfig(format!(
                "aging range [{}, {}) must lie within \
                 [{DEF_AGING_MIN_SECS}, {DEF_AGING_MAX_SECS})",
                self.aging_min_secs, self.aging_max_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(DataplaneCfg::default().validate(), Ok(()));
    }

    #[test]
    fn reject_single_queue() {
        let cfg = DataplaneCfg { nr_queues: 1, ..Default::default() };
        assert!(matches!(
            cfg.validate(),
            Err(NicflowError::InvalidConfig(_))
        ));
    }

    #[test]
    fn reject_inverted_aging_range() {
        let cfg = DataplaneCfg {
            aging_min_secs: 60,
            aging_max_secs: 5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn aging_range_is_bounded() {
        let narrow = DataplaneCfg {
            aging_min_secs: 5,
            aging_max_secs: 6,
            ..Default::default()
        };
        assert_eq!(narrow.validate(), Ok(()));

        for (min, max) in [(1, 3600), (1, 30), (10, 61), (0, 60)] {
            let cfg = DataplaneCfg {
                aging_min_secs: min,
                aging_max_secs: max,
                ..Default::default()
            };
            assert!(
                matches!(cfg.validate(), Err(NicflowError::InvalidConfig(_))),
                "[{min}, {max}) accepted"
            );
        }
    }

    #[test]
    fn partial_document_uses_defaults() {
        let cfg: DataplaneCfg =
            serde_json::from_str(r#"{ "nr_queues": 4, "hairpin": true }"#)
                .unwrap();
        assert_eq!(cfg.nr_queues, 4);
        assert!(cfg.hairpin);
        assert_eq!(cfg.flow_capacity, DEF_FLOW_CAPACITY);
    }
}
