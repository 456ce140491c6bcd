// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use super::PortId;
use super::encap::TunnelType;
use alloc::string::String;
use serde::Deserialize;
use serde::Serialize;

/// Errors surfaced by the dataplane control path.
///
/// Per-packet failures (malformed packets, exhausted caches, rejected
/// installs) are absorbed by the worker that saw the packet; only
/// bring-up and administrative operations hand these back to a
/// caller.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, thiserror::Error)]
pub enum NicflowError {
    #[error("bad state: {0}")]
    BadState(String),

    #[error("flow already exists: {0}")]
    FlowExists(String),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The offload engine reported failure for an install or
    /// removal.
    #[error("hardware rejected {op}: {msg}")]
    HwRejected { op: String, msg: String },

    /// A table reached its fixed capacity.
    #[error("maximum capacity reached: {0}")]
    MaxCapacity(u64),

    /// The packet's tunnel type has no match stage to install into.
    #[error("no installable pipe for tunnel type {0}")]
    NoInstallablePipe(TunnelType),

    #[error("failed to create pipe {pipe} on port {port}: {msg}")]
    PipeCreate { port: PortId, pipe: String, msg: String },

    #[error("port {0} already exists")]
    PortExists(PortId),

    #[error("port {0} not found")]
    PortNotFound(PortId),

    #[error("rule {0:#x} not found")]
    RuleNotFound(u64),

    /// The hardware rule table for a port is full.
    #[error("rule table full on port {port}: {limit} rules")]
    RuleTableFull { port: PortId, limit: u64 },
}

#[cfg(test)]
mod test {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display() {
        assert_eq!(
            NicflowError::MaxCapacity(8096).to_string(),
            "maximum capacity reached: 8096"
        );
        assert_eq!(
            NicflowError::NoInstallablePipe(TunnelType::None).to_string(),
            "no installable pipe for tunnel type none"
        );
    }

    #[test]
    fn serde_round_trip() {
        let err = NicflowError::PipeCreate {
            port: 1,
            pipe: "GRE_PIPE".into(),
            msg: "no resources".into(),
        };
        let json = serde_json::to_string(&err).unwrap();
        let back: NicflowError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
