// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The interface to the hardware offload engine.
//!
//! The engine organizes each port's classification logic as a graph
//! of pipes. A pipe declares which packet fields it matches on (its
//! template), what it does to a matching packet, where a hit goes
//! (`fwd`), and where a miss goes (`fwd_miss`). Rules installed into
//! a pipe fill in the per-rule field values.
//!
//! Installs and removals are asynchronous: the call only queues the
//! operation, and its outcome arrives later as a [`Completion`] when
//! the queue it was issued on is polled. Aged rules are reported the
//! same way.

use super::lifecycle::PendingOp;
use super::parse::PacketView;
use crate::api::DumpTopologyResp;
use crate::api::EncapCfg;
use crate::api::MacAddr;
use crate::api::NicflowError;
use crate::api::PortId;
use crate::api::QueueId;
use crate::sys::time::Moment;
use itertools::Itertools;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

/// Identifies a pipe on a port.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PipeId {
    pub port: PortId,
    pub idx: u16,
}

impl Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.idx)
    }
}

/// Identifies an installed rule.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RuleHandle(pub u64);

impl Display for RuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Domain {
    Ingress,
    Egress,
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "ingress"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

/// Where a packet goes after a pipe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Fwd {
    /// Continue classification in another pipe of the same port.
    Pipe(PipeId),
    /// Transmit out of a port.
    Port(PortId),
    /// Spread across the given receive queues for software handling.
    Rss { queues: Vec<QueueId> },
    Drop,
}

impl Display for Fwd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(p) => write!(f, "pipe {p}"),
            Self::Port(p) => write!(f, "port {p}"),
            Self::Rss { queues } => {
                write!(f, "rss [{}]", queues.iter().join(","))
            }
            Self::Drop => write!(f, "drop"),
        }
    }
}

/// A packet field a pipe may match on.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Field {
    OuterSrcIp,
    OuterDstIp,
    OuterProto,
    OuterDstPort,
    TunnelId,
    InnerSrcIp,
    InnerDstIp,
    InnerProto,
    InnerSrcPort,
    InnerDstPort,
    /// The metadata word set by [`Action::SetMeta`].
    Meta,
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OuterSrcIp => "outer.src",
            Self::OuterDstIp => "outer.dst",
            Self::OuterProto => "outer.proto",
            Self::OuterDstPort => "outer.dport",
            Self::TunnelId => "tun.id",
            Self::InnerSrcIp => "inner.src",
            Self::InnerDstIp => "inner.dst",
            Self::InnerProto => "inner.proto",
            Self::InnerSrcPort => "inner.sport",
            Self::InnerDstPort => "inner.dport",
            Self::Meta => "meta",
        };
        write!(f, "{s}")
    }
}

impl Field {
    /// Render a value of this field the way it appears on the wire.
    pub fn fmt_value(&self, val: u32) -> String {
        match self {
            Self::OuterSrcIp
            | Self::OuterDstIp
            | Self::InnerSrcIp
            | Self::InnerDstIp => {
                crate::api::Ipv4Addr::from(val).to_string()
            }
            Self::OuterProto | Self::InnerProto => {
                crate::api::Protocol::from(val as u8).to_string()
            }
            Self::TunnelId | Self::Meta => format!("{val:#x}"),
            Self::OuterDstPort | Self::InnerSrcPort | Self::InnerDstPort => {
                val.to_string()
            }
        }
    }

    /// Extract this field's value from a packet. `None` if the
    /// packet does not have the field, in which case no rule matching
    /// on it can match.
    pub fn value(&self, view: &PacketView, meta: u32) -> Option<u32> {
        let inner = view.inner.as_ref();
        let ports = |f: &super::parse::PktFormat| {
            f.l7.map(|_| (u32::from(f.src_port), u32::from(f.dst_port)))
        };

        match self {
            Self::OuterSrcIp => Some(u32::from(view.outer.src_ip)),
            Self::OuterDstIp => Some(u32::from(view.outer.dst_ip)),
            Self::OuterProto => Some(u32::from(u8::from(view.outer.proto))),
            Self::OuterDstPort => ports(&view.outer).map(|p| p.1),
            Self::TunnelId => view.tun.map(|t| t.id.get()),
            Self::InnerSrcIp => inner.map(|f| u32::from(f.src_ip)),
            Self::InnerDstIp => inner.map(|f| u32::from(f.dst_ip)),
            Self::InnerProto => inner.map(|f| u32::from(u8::from(f.proto))),
            Self::InnerSrcPort => inner.and_then(ports).map(|p| p.0),
            Self::InnerDstPort => inner.and_then(ports).map(|p| p.1),
            Self::Meta => Some(meta),
        }
    }
}

/// How a pipe's template treats a field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldMatch {
    /// The same value for every rule in the pipe.
    Exact(u32),
    /// Each rule supplies its own value, or leaves the field
    /// wildcarded.
    PerRule,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    /// Strip the outer headers up to the inner packet. If the inner
    /// packet has no Ethernet header, a new one is pushed.
    Decap { inner_l2: bool },
    SetMeta(u32),
    SetMacs { src: MacAddr, dst: MacAddr },
    Encap(EncapCfg),
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decap { inner_l2: true } => write!(f, "decap"),
            Self::Decap { inner_l2: false } => write!(f, "decap+eth"),
            Self::SetMeta(m) => write!(f, "meta={m:#x}"),
            Self::SetMacs { src, dst } => write!(f, "macs={src}->{dst}"),
            Self::Encap(e) => {
                write!(f, "encap vni={} {}->{}", e.vni, e.src_ip, e.dst_ip)
            }
        }
    }
}

/// The aging budget of a rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Aging {
    /// Never ages out.
    Unbounded,
    /// Ages out after this many seconds without a hit.
    Secs(u32),
}

#[derive(Clone, Debug)]
pub struct PipeCfg {
    pub name: String,
    pub domain: Domain,
    pub is_root: bool,
    pub template: Vec<(Field, FieldMatch)>,
    /// Applied to every packet hitting any rule of the pipe.
    pub actions: Vec<Action>,
    /// Count hits per rule and age rules out. The aging here is the
    /// pipe-wide budget; rules may carry their own.
    pub monitor: Option<Aging>,
    pub fwd: Fwd,
    pub fwd_miss: Fwd,
}

#[derive(Clone, Debug)]
pub struct RuleSpec {
    /// Lower values win.
    pub priority: u8,
    /// A rule matches when every listed field has the listed value.
    /// Fields the template marks `PerRule` but the rule omits are
    /// wildcarded.
    pub values: Vec<(Field, u32)>,
    /// Applied after the pipe's actions.
    pub actions: Vec<Action>,
    pub aging: Aging,
    /// Overrides the pipe's `fwd`.
    pub fwd: Option<Fwd>,
}

impl RuleSpec {
    /// A rule which matches every packet reaching its pipe.
    pub fn match_all() -> Self {
        Self {
            priority: 0,
            values: vec![],
            actions: vec![],
            aging: Aging::Unbounded,
            fwd: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Install,
    Remove,
    Aged,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Remove => write!(f, "remove"),
            Self::Aged => write!(f, "aged"),
        }
    }
}

/// The outcome of an asynchronous operation, or an unsolicited aging
/// notification.
#[derive(Clone, Debug)]
pub struct Completion {
    pub op: OpKind,
    pub ok: bool,
    pub port: PortId,
    pub queue: QueueId,
    pub rule: RuleHandle,
    /// The token the operation was issued with. For an aging
    /// notification, the token of the rule's install.
    pub token: Arc<PendingOp>,
}

/// The service which programs the NIC.
///
/// Every method which takes a queue must only be called by the thread
/// owning that queue, with the exception of bring-up and teardown.
pub trait OffloadEngine: Send + Sync {
    fn create_port(
        &self,
        port: PortId,
        nr_queues: u16,
    ) -> Result<(), NicflowError>;

    fn create_pipe(
        &self,
        port: PortId,
        cfg: PipeCfg,
    ) -> Result<PipeId, NicflowError>;

    /// Queue the install of `rule` into `pipe`.
    ///
    /// An `Err` means the install was never queued and no completion
    /// will follow. Otherwise exactly one `Install` completion
    /// carrying `token` is delivered on `queue`.
    fn install_rule(
        &self,
        pipe: PipeId,
        queue: QueueId,
        rule: RuleSpec,
        token: Arc<PendingOp>,
    ) -> Result<RuleHandle, NicflowError>;

    /// Queue the removal of `rule`.
    ///
    /// On `Ok`, exactly one `Remove` completion carrying `token` is
    /// delivered on `queue`.
    fn remove_rule(
        &self,
        port: PortId,
        queue: QueueId,
        rule: RuleHandle,
        token: Arc<PendingOp>,
    ) -> Result<(), NicflowError>;

    /// Deliver at most `max` completions queued on (`port`, `queue`),
    /// spending no more than `budget_ms`. Returns the number
    /// delivered.
    ///
    /// `cb` runs with no engine lock held and may call back into the
    /// engine.
    fn poll_completions(
        &self,
        port: PortId,
        queue: QueueId,
        budget_ms: u64,
        max: usize,
        cb: &mut dyn FnMut(Completion),
    ) -> usize;

    /// Scan the rules installed from (`port`, `queue`) for ones that
    /// have aged out as of `now`, delivering at most `max` `Aged`
    /// notifications within `budget_ms`. A rule is reported aged at
    /// most once; it stays installed, without matching, until
    /// removed.
    fn handle_aging(
        &self,
        port: PortId,
        queue: QueueId,
        now: Moment,
        budget_ms: u64,
        max: usize,
        cb: &mut dyn FnMut(Completion),
    ) -> usize;

    /// Describe the pipes of `port` and their installed rules.
    fn dump_port(&self, port: PortId) -> Result<DumpTopologyResp, NicflowError>;

    /// Release every pipe and rule of `port`.
    fn destroy_port(&self, port: PortId) -> Result<(), NicflowError>;
}
