// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The dataplane: ports, their flow caches, and the offload engine
//! they share.
//!
//! A [`Dataplane`] is explicitly constructed and owned; every worker,
//! the completion reconciler, and the aging coordinator reach the
//! flow state through it.
//!
//! ```text
//! Dataplane::new() --> Ready -- start() --> Running
//!                        |                     |
//!                        +----- destroy() -----+--> Draining --> Stopped
//! ```
//!
//! Lock order: a port's flow cache is always taken before the offload
//! engine's internal lock. The engine delivers completions with its
//! own lock dropped, and they are collected before the cache is
//! locked.

use super::aging::AgingCoordinator;
use super::flow_key::build_key;
use super::flow_table::FlowCache;
use super::lifecycle::LifecycleEvent;
use super::lifecycle::PendingOp;
use super::offload::OffloadEngine;
use super::parse::PacketView;
use super::parse::ParseError;
use super::pipeline::PortTopology;
use super::pipeline::build_port;
use super::reconcile::Reconciler;
use super::reconcile::RemoveStatus;
use super::reconcile::issue_remove;
use crate::ExecCtx;
use crate::api::DataplaneCfg;
use crate::api::DumpFlowsResp;
use crate::api::DumpTopologyResp;
use crate::api::EntryState;
use crate::api::FlowKey;
use crate::api::NicflowError;
use crate::api::PortId;
use crate::api::Protocol;
use crate::api::QueueId;
use crate::d_error::DError;
use crate::d_error::ErrorBlock;
use crate::sys::stat::StatProvider;
use crate::sys::stat::StatU64;
use crate::sys::sync::NfMutex;
use crate::sys::sync::NfRwLock;
use crate::sys::time::Moment;
use core::fmt;
use core::fmt::Display;
use core::num::NonZeroU32;
use rand::Rng;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;
use stat_macro::StatProvider;
use std::collections::BTreeMap;
use std::sync::Arc;

type Result<T> = core::result::Result<T, NicflowError>;

/// The most completions handled in one poll.
pub const MAX_COMPLETION_BURST: usize = 64;

/// Teardown gives up waiting on outstanding operations after this
/// many polling rounds.
const DRAIN_ATTEMPTS: u32 = 10_000;

/// Check that `$sg` (a state) is one of `$state`.
macro_rules! check_state {
    ( $sg:expr, [ $( $state:expr ),* ] ) => {
        if $( $sg != $state )&&* {
            Err(NicflowError::BadState(format!("{}", $sg)))
        } else {
            Ok(())
        }
    };

    ( $sg:expr, [ $( $state:expr ),* ], ) => {
        check_state!($sg, [$( $state ),*])
    };

    ( $sg:expr, [ $( $state:expr ),+ ,] ) => {
        check_state!($sg, [$( $state ),*])
    };
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataplaneState {
    /// Topology built, no traffic handled yet.
    Ready,

    /// Packets are processed and flows offloaded.
    Running,

    /// Teardown is waiting for outstanding hardware operations.
    Draining,

    /// The topology and caches are released.
    Stopped,
}

impl Display for DataplaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Why a packet was dropped.
#[derive(Clone, Copy, Debug, DError, Eq, PartialEq)]
pub enum DropReason {
    Parse(ParseError),
    #[leaf]
    UnsupportedL4(u8),
    NotRunning,
}

/// Why a packet was left to software instead of being offloaded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FallbackReason {
    NotTunneled,
    OffloadDisabled,
    CacheFull,
    RuleTableFull,
    InstallFailed,
    /// The flow's rule is being removed.
    Removing,
}

impl Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotTunneled => "not-tunneled",
            Self::OffloadDisabled => "offload-disabled",
            Self::CacheFull => "cache-full",
            Self::RuleTableFull => "rule-table-full",
            Self::InstallFailed => "install-failed",
            Self::Removing => "removing",
        };
        write!(f, "{s}")
    }
}

/// What became of a packet handed to [`Dataplane::process_pkt`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessResult {
    /// The packet belongs to a flow which is, or is being, offloaded.
    /// `created` is true for the first packet of the flow.
    Offloaded { created: bool },

    /// Forward in software.
    Fallback(FallbackReason),

    Drop(DropReason),
}

#[derive(Debug, StatProvider)]
pub struct PortStats {
    pub rx_pkts: StatU64,
    pub rx_bytes: StatU64,
    pub tx_pkts: StatU64,
    pub tx_bytes: StatU64,
    pub tx_dropped: StatU64,

    pub drop_parse: StatU64,
    pub drop_l4: StatU64,
    pub drop_not_running: StatU64,

    pub flow_hits: StatU64,
    pub flow_misses: StatU64,
    pub fallback_untunneled: StatU64,
    pub fallback_disabled: StatU64,
    pub cache_full: StatU64,
    pub rule_table_full: StatU64,

    pub install_ok: StatU64,
    pub install_failed: StatU64,
    pub removes: StatU64,
    pub aged: StatU64,
    pub invariant_violations: StatU64,
}

impl PortStats {
    fn count_drop(&self, reason: &DropReason) {
        match reason {
            DropReason::Parse(_) => self.drop_parse.incr(1),
            DropReason::UnsupportedL4(_) => self.drop_l4.incr(1),
            DropReason::NotRunning => self.drop_not_running.incr(1),
        }
    }
}

/// The state of one port.
pub struct PortCtx {
    pub id: PortId,
    pub topo: PortTopology,
    pub(crate) cache: NfMutex<FlowCache>,
    pub stats: PortStats,
}

pub struct Dataplane {
    ectx: Arc<ExecCtx>,
    cfg: DataplaneCfg,
    engine: Arc<dyn OffloadEngine>,
    state: NfRwLock<DataplaneState>,
    ports: BTreeMap<PortId, PortCtx>,
}

impl Dataplane {
    /// Bring up every configured port.
    ///
    /// A port whose topology fails to build is logged and left out;
    /// the other ports still come up.
    ///
    /// # Errors
    ///
    /// The configuration is invalid, or no port came up.
    pub fn new(
        ectx: Arc<ExecCtx>,
        cfg: DataplaneCfg,
        engine: Arc<dyn OffloadEngine>,
    ) -> Result<Self> {
        cfg.validate()?;
        let limit = NonZeroU32::new(cfg.flow_capacity).ok_or_else(|| {
            NicflowError::InvalidConfig("flow capacity is zero".into())
        })?;

        let mut ports = BTreeMap::new();
        let mut first_err = None;

        for id in 0..cfg.nr_ports {
            match build_port(&ectx, &engine, &cfg, id) {
                Ok(topo) => {
                    info!(ectx.log, "port up";
                        "port" => id, "queues" => cfg.nr_queues);
                    ports.insert(
                        id,
                        PortCtx {
                            id,
                            topo,
                            cache: NfMutex::new(FlowCache::new(id, limit)),
                            stats: PortStats::new(),
                        },
                    );
                }

                Err(e) => {
                    error!(ectx.log, "port bring-up failed";
                        "port" => id, "err" => %e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        if ports.is_empty() {
            return Err(first_err.unwrap_or_else(|| {
                NicflowError::InvalidConfig("no ports configured".into())
            }));
        }

        Ok(Self {
            ectx,
            cfg,
            engine,
            state: NfRwLock::new(DataplaneState::Ready),
            ports,
        })
    }

    pub fn cfg(&self) -> &DataplaneCfg {
        &self.cfg
    }

    pub fn ectx(&self) -> &ExecCtx {
        &self.ectx
    }

    pub fn engine(&self) -> &Arc<dyn OffloadEngine> {
        &self.engine
    }

    pub fn state(&self) -> DataplaneState {
        *self.state.read()
    }

    /// The ports which came up, in order.
    pub fn port_ids(&self) -> Vec<PortId> {
        self.ports.keys().copied().collect()
    }

    pub fn port(&self, id: PortId) -> Result<&PortCtx> {
        self.ports.get(&id).ok_or(NicflowError::PortNotFound(id))
    }

    pub(crate) fn ports(&self) -> impl Iterator<Item = &PortCtx> {
        self.ports.values()
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.state.write();
        check_state!(*state, [DataplaneState::Ready])?;
        *state = DataplaneState::Running;
        info!(self.ectx.log, "dataplane running"; "ports" => self.ports.len());
        Ok(())
    }

    fn drop_pkt(&self, pctx: &PortCtx, reason: DropReason) -> ProcessResult {
        pctx.stats.count_drop(&reason);
        let eb = ErrorBlock::<8>::from_err(&reason).unwrap_or_else(|eb| eb);
        debug!(self.ectx.log, "drop"; "port" => pctx.id, "reason" => %eb);
        ProcessResult::Drop(reason)
    }

    /// Process one received packet.
    ///
    /// The first packet of a tunneled flow creates a `PendingAdd`
    /// cache entry and queues the install of its rule on `queue`;
    /// later packets of the flow only bump its counters. Nothing here
    /// waits on the hardware.
    ///
    /// # Errors
    ///
    /// Only for a port or queue that does not exist. Problems with the
    /// packet itself are reported through the [`ProcessResult`].
    pub fn process_pkt(
        &self,
        port: PortId,
        queue: QueueId,
        buf: &[u8],
        hash: u32,
    ) -> Result<ProcessResult> {
        let pctx = self.port(port)?;
        if queue >= self.cfg.nr_queues {
            return Err(NicflowError::BadState(format!(
                "port {port} has no queue {queue}"
            )));
        }

        pctx.stats.rx_pkts.incr(1);
        pctx.stats.rx_bytes.incr(buf.len() as u64);

        if self.state() != DataplaneState::Running {
            return Ok(self.drop_pkt(pctx, DropReason::NotRunning));
        }

        let view = match PacketView::parse(buf) {
            Ok(v) => v,
            Err(e) => return Ok(self.drop_pkt(pctx, DropReason::Parse(e))),
        };

        match view.outer.proto {
            Protocol::TCP | Protocol::UDP | Protocol::GRE => (),
            p => {
                let reason = DropReason::UnsupportedL4(p.into());
                return Ok(self.drop_pkt(pctx, reason));
            }
        }

        if !view.is_tunneled() {
            pctx.stats.fallback_untunneled.incr(1);
            return Ok(ProcessResult::Fallback(FallbackReason::NotTunneled));
        }

        if !self.cfg.hw_offload {
            pctx.stats.fallback_disabled.incr(1);
            return Ok(ProcessResult::Fallback(FallbackReason::OffloadDisabled));
        }

        let key = build_key(&view, port, hash);
        let mut cache = pctx.cache.lock();

        let (h, created) = match cache.lookup_or_create(key, queue) {
            Ok(v) => v,
            Err(_) => {
                pctx.stats.cache_full.incr(1);
                return Ok(ProcessResult::Fallback(FallbackReason::CacheFull));
            }
        };

        let Some(entry) = cache.get_mut(h) else {
            return Err(NicflowError::BadState(format!("dangling handle {h}")));
        };
        entry.hit(buf.len(), Moment::now());

        if !created {
            pctx.stats.flow_hits.incr(1);
            return Ok(match entry.state() {
                EntryState::PendingAdd | EntryState::Active => {
                    ProcessResult::Offloaded { created: false }
                }
                EntryState::PendingDelete | EntryState::Deleted => {
                    ProcessResult::Fallback(FallbackReason::Removing)
                }
            });
        }

        pctx.stats.flow_misses.incr(1);
        let aging = rand::rng()
            .random_range(self.cfg.aging_min_secs..self.cfg.aging_max_secs);
        let token = PendingOp::for_entry(h);
        entry.set_pending_add(token.clone(), aging);

        let issued = pctx
            .topo
            .flow_rule(&view, aging)
            .and_then(|(pipe, rule)| {
                self.engine.install_rule(pipe, queue, rule, token.clone())
            });

        match issued {
            Ok(rule) => {
                debug!(self.ectx.log, "flow install issued";
                    "flow" => %key, "rule" => %rule, "aging" => aging);
                Ok(ProcessResult::Offloaded { created: true })
            }

            Err(e) => {
                warn!(self.ectx.log, "flow install refused";
                    "flow" => %key, "err" => %e);
                token.resolve(false);
                if entry.apply(LifecycleEvent::AddFailed).is_ok() {
                    cache.destroy(h);
                }
                pctx.stats.install_failed.incr(1);

                if let NicflowError::RuleTableFull { .. } = e {
                    pctx.stats.rule_table_full.incr(1);
                    Ok(ProcessResult::Fallback(FallbackReason::RuleTableFull))
                } else {
                    Ok(ProcessResult::Fallback(FallbackReason::InstallFailed))
                }
            }
        }
    }

    /// Handle the completions queued on (`port`, `queue`). Returns the
    /// number handled.
    pub fn poll_completions(
        &self,
        port: PortId,
        queue: QueueId,
    ) -> Result<usize> {
        let pctx = self.port(port)?;
        let mut done = Vec::new();
        self.engine.poll_completions(
            port,
            queue,
            self.cfg.max_handling_ms,
            MAX_COMPLETION_BURST,
            &mut |c| done.push(c),
        );

        let n = done.len();
        if n > 0 {
            let mut cache = pctx.cache.lock();
            let mut r = self.reconciler(pctx, &mut cache, Moment::now());
            done.into_iter().for_each(|c| r.handle(c));
        }
        Ok(n)
    }

    pub(crate) fn reconciler<'a>(
        &'a self,
        pctx: &'a PortCtx,
        cache: &'a mut FlowCache,
        now: Moment,
    ) -> Reconciler<'a> {
        Reconciler {
            ectx: &self.ectx,
            engine: self.engine.as_ref(),
            stats: &pctx.stats,
            cache,
            now,
        }
    }

    pub fn aging(&self) -> AgingCoordinator<'_> {
        AgingCoordinator::new(self)
    }

    /// Run one aging scan of (`port`, `queue`).
    pub fn poll_aging(&self, port: PortId, queue: QueueId) -> Result<usize> {
        self.aging().poll(port, queue, self.cfg.max_handling_ms)
    }

    /// Run one aging scan of (`port`, `queue`) as of `now`.
    pub fn poll_aging_at(
        &self,
        port: PortId,
        queue: QueueId,
        now: Moment,
    ) -> Result<usize> {
        self.aging().poll_at(port, queue, now, self.cfg.max_handling_ms)
    }

    /// Remove the flow `key` from hardware and the cache.
    ///
    /// The removal completes asynchronously. If the flow's install is
    /// still outstanding the removal is issued once it completes.
    pub fn remove_flow(&self, key: &FlowKey) -> Result<RemoveStatus> {
        let pctx = self.port(key.port)?;
        let mut cache = pctx.cache.lock();
        let h = cache
            .lookup(key)
            .ok_or_else(|| NicflowError::FlowNotFound(key.to_string()))?;
        issue_remove(&self.ectx, self.engine.as_ref(), &mut cache, h)
    }

    /// Look up the state of the flow `key`.
    pub fn flow_state(&self, key: &FlowKey) -> Result<Option<EntryState>> {
        let pctx = self.port(key.port)?;
        let cache = pctx.cache.lock();
        Ok(cache.lookup(key).and_then(|h| cache.get(h)).map(|e| e.state()))
    }

    pub fn dump_flows(&self, port: PortId) -> Result<DumpFlowsResp> {
        let pctx = self.port(port)?;
        let flows = pctx.cache.lock().dump(Moment::now());
        Ok(DumpFlowsResp { port, flows })
    }

    pub fn dump_stats(&self, port: PortId) -> Result<PortStatsSnap> {
        Ok(self.port(port)?.stats.snapshot())
    }

    pub fn dump_topology(&self, port: PortId) -> Result<DumpTopologyResp> {
        self.port(port)?;
        self.engine.dump_port(port)
    }

    /// Count cache entries in each state: pending add, active,
    /// pending delete, deleted.
    pub fn state_counts(&self, port: PortId) -> Result<[u32; 4]> {
        Ok(self.port(port)?.cache.lock().state_counts())
    }

    fn is_quiescent(&self) -> bool {
        self.ports().all(|p| {
            let [adding, _, deleting, deleted] = p.cache.lock().state_counts();
            adding == 0 && deleting == 0 && deleted == 0
        })
    }

    /// Tear the dataplane down.
    ///
    /// Outstanding installs and removals are polled to completion
    /// before the caches and topology are released. Workers must be
    /// stopped first.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            check_state!(
                *state,
                [DataplaneState::Ready, DataplaneState::Running]
            )?;
            *state = DataplaneState::Draining;
        }

        let mut attempts = 0;
        while !self.is_quiescent() {
            if attempts == DRAIN_ATTEMPTS {
                warn!(self.ectx.log, "gave up draining outstanding operations");
                break;
            }
            attempts += 1;

            for pctx in self.ports() {
                for q in 0..self.cfg.nr_queues {
                    self.poll_completions(pctx.id, q)?;
                }
            }
            std::thread::yield_now();
        }

        for pctx in self.ports() {
            if let Err(e) = self.engine.destroy_port(pctx.id) {
                error!(self.ectx.log, "failed to release port";
                    "port" => pctx.id, "err" => %e);
            }
        }

        *self.state.write() = DataplaneState::Stopped;
        info!(self.ectx.log, "dataplane stopped");
        Ok(())
    }
}
