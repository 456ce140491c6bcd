// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! A software implementation of [`OffloadEngine`].
//!
//! The `SoftEngine` keeps each port's pipes and rules in memory and
//! queues completions per (port, queue) exactly as a NIC would. It
//! ages rules on the monotonic clock. It can also walk a parsed
//! packet through a port's pipes, which is what lets the rest of the
//! dataplane be exercised without hardware.

use super::lifecycle::PendingOp;
use super::offload::Action;
use super::offload::Aging;
use super::offload::Completion;
use super::offload::Domain;
use super::offload::Field;
use super::offload::FieldMatch;
use super::offload::Fwd;
use super::offload::OffloadEngine;
use super::offload::OpKind;
use super::offload::PipeCfg;
use super::offload::PipeId;
use super::offload::RuleHandle;
use super::offload::RuleSpec;
use super::parse::PacketView;
use crate::api::DumpTopologyResp;
use crate::api::NicflowError;
use crate::api::PipeDump;
use crate::api::PipeEntryDump;
use crate::api::PortId;
use crate::api::QueueId;
use crate::sys::sync::NfMutex;
use crate::sys::time::MILLIS;
use crate::sys::time::Moment;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::AcqRel;
use core::sync::atomic::Ordering::Acquire;
use itertools::Itertools;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;

type Result<T> = core::result::Result<T, NicflowError>;

/// A packet may traverse at most this many pipes.
const MAX_HOPS: usize = 16;

#[derive(Debug)]
struct SoftRule {
    pipe: PipeId,
    spec: RuleSpec,
    queue: QueueId,
    token: Arc<PendingOp>,
    last_hit: Moment,
    /// Set once the install completion has been delivered. Aging
    /// only considers confirmed rules, so no aged notification can
    /// overtake the install.
    confirmed: bool,
    aged: bool,
    hits: u64,
}

impl SoftRule {
    fn is_expired(&self, now: Moment) -> bool {
        match self.spec.aging {
            Aging::Unbounded => false,
            Aging::Secs(secs) => {
                now.delta_as_millis(self.last_hit) >= u64::from(secs) * MILLIS
            }
        }
    }

    fn matches(&self, view: &PacketView, meta: u32) -> bool {
        !self.aged
            && self
                .spec
                .values
                .iter()
                .all(|(field, val)| field.value(view, meta) == Some(*val))
    }
}

#[derive(Debug)]
struct SoftPipe {
    cfg: PipeCfg,
    /// Ordered by priority, then by insertion.
    rules: Vec<RuleHandle>,
}

impl SoftPipe {
    fn template_matches(&self, view: &PacketView, meta: u32) -> bool {
        self.cfg.template.iter().all(|(field, m)| match m {
            FieldMatch::Exact(val) => field.value(view, meta) == Some(*val),
            FieldMatch::PerRule => true,
        })
    }

    fn allows(&self, field: Field) -> bool {
        self.cfg
            .template
            .iter()
            .any(|(f, m)| *f == field && *m == FieldMatch::PerRule)
    }
}

#[derive(Debug)]
struct SoftPort {
    pipes: Vec<SoftPipe>,
    rules: BTreeMap<RuleHandle, SoftRule>,
    cq: Vec<VecDeque<Completion>>,
}

impl SoftPort {
    fn pipe_name(&self, fwd: &Fwd) -> String {
        match fwd {
            Fwd::Pipe(p) => match self.pipes.get(usize::from(p.idx)) {
                Some(pipe) => pipe.cfg.name.clone(),
                None => fwd.to_string(),
            },
            _ => fwd.to_string(),
        }
    }

    fn check_target(&self, port: PortId, fwd: &Fwd) -> Result<()> {
        if let Fwd::Pipe(p) = fwd
            && (p.port != port || usize::from(p.idx) >= self.pipes.len())
        {
            return Err(NicflowError::PipeCreate {
                port,
                pipe: p.to_string(),
                msg: "forward to unknown pipe".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SoftInner {
    ports: BTreeMap<PortId, SoftPort>,
    next_rule: u64,
}

/// The result of walking a packet through a port's pipes.
#[derive(Clone, Debug)]
pub struct Classification {
    /// The names of the pipes traversed, in order.
    pub path: Vec<String>,
    /// The last rule matched, if any.
    pub rule: Option<RuleHandle>,
    pub actions: Vec<Action>,
    pub fwd: Fwd,
}

#[derive(Debug)]
pub struct SoftEngine {
    inner: NfMutex<SoftInner>,
    rule_capacity: u32,
    fail_installs: AtomicU32,
    reject_installs: AtomicU32,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter.fetch_update(AcqRel, Acquire, |n| n.checked_sub(1)).is_ok()
}

impl SoftEngine {
    /// Create an engine holding at most `rule_capacity` rules per
    /// port.
    pub fn new(rule_capacity: u32) -> Self {
        Self {
            inner: NfMutex::new(SoftInner::default()),
            rule_capacity,
            fail_installs: AtomicU32::new(0),
            reject_installs: AtomicU32::new(0),
        }
    }

    /// Accept the next `n` installs, then report each of them as
    /// failed in its completion.
    #[cfg(any(feature = "test-help", test))]
    pub fn fail_next_installs(&self, n: u32) {
        self.fail_installs.store(n, core::sync::atomic::Ordering::Release);
    }

    /// Refuse the next `n` installs outright.
    #[cfg(any(feature = "test-help", test))]
    pub fn reject_next_installs(&self, n: u32) {
        self.reject_installs.store(n, core::sync::atomic::Ordering::Release);
    }

    /// The number of rules installed on `port`.
    pub fn num_rules(&self, port: PortId) -> usize {
        self.inner.lock().ports.get(&port).map_or(0, |p| p.rules.len())
    }

    /// The number of completions waiting on (`port`, `queue`).
    pub fn num_pending(&self, port: PortId, queue: QueueId) -> usize {
        self.inner
            .lock()
            .ports
            .get(&port)
            .and_then(|p| p.cq.get(usize::from(queue)))
            .map_or(0, |q| q.len())
    }

    /// Walk `view` through the ingress pipes of `port`, starting at
    /// its root. Hits refresh the aging of the rules matched.
    pub fn classify(
        &self,
        port: PortId,
        view: &PacketView,
        now: Moment,
    ) -> Result<Classification> {
        let mut inner = self.inner.lock();
        let sport = inner
            .ports
            .get_mut(&port)
            .ok_or(NicflowError::PortNotFound(port))?;

        let root = sport
            .pipes
            .iter()
            .position(|p| p.cfg.is_root && p.cfg.domain == Domain::Ingress)
            .ok_or_else(|| {
                NicflowError::BadState(format!("port {port} has no root pipe"))
            })?;

        let mut cur = root;
        let mut meta = 0;
        let mut out = Classification {
            path: vec![],
            rule: None,
            actions: vec![],
            fwd: Fwd::Drop,
        };

        for _ in 0..MAX_HOPS {
            let pipe = &sport.pipes[cur];
            out.path.push(pipe.cfg.name.clone());

            let hit = if pipe.template_matches(view, meta) {
                pipe.rules.iter().copied().find(|h| {
                    sport.rules.get(h).is_some_and(|r| r.matches(view, meta))
                })
            } else {
                None
            };

            let next = match hit {
                Some(handle) => {
                    let pipe_fwd = pipe.cfg.fwd.clone();
                    out.actions.extend(pipe.cfg.actions.iter().cloned());

                    let Some(rule) = sport.rules.get_mut(&handle) else {
                        break;
                    };
                    rule.hits += 1;
                    rule.last_hit = now;
                    for a in &rule.spec.actions {
                        if let Action::SetMeta(m) = a {
                            meta = *m;
                        }
                        out.actions.push(a.clone());
                    }
                    out.rule = Some(handle);
                    rule.spec.fwd.clone().unwrap_or(pipe_fwd)
                }

                None => pipe.cfg.fwd_miss.clone(),
            };

            match next {
                Fwd::Pipe(p) => cur = usize::from(p.idx),
                fwd => {
                    out.fwd = fwd;
                    return Ok(out);
                }
            }
        }

        Err(NicflowError::BadState(format!(
            "port {port}: no terminal forward after {MAX_HOPS} pipes"
        )))
    }
}

impl OffloadEngine for SoftEngine {
    fn create_port(&self, port: PortId, nr_queues: u16) -> Result<()> {
        if nr_queues == 0 {
            return Err(NicflowError::InvalidConfig(format!(
                "port {port} needs at least one queue"
            )));
        }

        let mut inner = self.inner.lock();
        if inner.ports.contains_key(&port) {
            return Err(NicflowError::PortExists(port));
        }

        inner.ports.insert(
            port,
            SoftPort {
                pipes: vec![],
                rules: BTreeMap::new(),
                cq: (0..nr_queues).map(|_| VecDeque::new()).collect(),
            },
        );
        Ok(())
    }

    fn create_pipe(&self, port: PortId, cfg: PipeCfg) -> Result<PipeId> {
        let mut inner = self.inner.lock();
        let sport = inner
            .ports
            .get_mut(&port)
            .ok_or(NicflowError::PortNotFound(port))?;

        sport.check_target(port, &cfg.fwd)?;
        sport.check_target(port, &cfg.fwd_miss)?;

        let idx = u16::try_from(sport.pipes.len()).map_err(|_| {
            NicflowError::PipeCreate {
                port,
                pipe: cfg.name.clone(),
                msg: "too many pipes".into(),
            }
        })?;

        sport.pipes.push(SoftPipe { cfg, rules: vec![] });
        Ok(PipeId { port, idx })
    }

    fn install_rule(
        &self,
        pipe: PipeId,
        queue: QueueId,
        rule: RuleSpec,
        token: Arc<PendingOp>,
    ) -> Result<RuleHandle> {
        let mut inner = self.inner.lock();
        let handle = RuleHandle(inner.next_rule);
        let port = pipe.port;
        let sport = inner
            .ports
            .get_mut(&port)
            .ok_or(NicflowError::PortNotFound(port))?;

        let rejected = |msg: String| NicflowError::HwRejected {
            op: "install".into(),
            msg,
        };

        if usize::from(queue) >= sport.cq.len() {
            return Err(rejected(format!("no queue {queue} on port {port}")));
        }

        let Some(spipe) = sport.pipes.get(usize::from(pipe.idx)) else {
            return Err(rejected(format!("no pipe {pipe}")));
        };

        if let Some((f, _)) =
            rule.values.iter().find(|(f, _)| !spipe.allows(*f))
        {
            return Err(rejected(format!(
                "field {f} is not in the template of {}",
                spipe.cfg.name
            )));
        }

        if take_one(&self.reject_installs) {
            return Err(rejected("refused".into()));
        }

        if sport.rules.len() >= self.rule_capacity as usize {
            return Err(NicflowError::RuleTableFull {
                port,
                limit: u64::from(self.rule_capacity),
            });
        }

        let ok = !take_one(&self.fail_installs);
        if ok {
            let prio = rule.priority;
            let pos = sport.pipes[usize::from(pipe.idx)]
                .rules
                .iter()
                .position(|h| {
                    sport.rules.get(h).is_some_and(|r| r.spec.priority > prio)
                });

            sport.rules.insert(
                handle,
                SoftRule {
                    pipe,
                    spec: rule,
                    queue,
                    token: token.clone(),
                    last_hit: Moment::now(),
                    confirmed: false,
                    aged: false,
                    hits: 0,
                },
            );

            let rules = &mut sport.pipes[usize::from(pipe.idx)].rules;
            match pos {
                Some(i) => rules.insert(i, handle),
                None => rules.push(handle),
            }
        }

        sport.cq[usize::from(queue)].push_back(Completion {
            op: OpKind::Install,
            ok,
            port,
            queue,
            rule: handle,
            token,
        });

        inner.next_rule += 1;
        Ok(handle)
    }

    fn remove_rule(
        &self,
        port: PortId,
        queue: QueueId,
        rule: RuleHandle,
        token: Arc<PendingOp>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let sport = inner
            .ports
            .get_mut(&port)
            .ok_or(NicflowError::PortNotFound(port))?;

        if usize::from(queue) >= sport.cq.len() {
            return Err(NicflowError::HwRejected {
                op: "remove".into(),
                msg: format!("no queue {queue} on port {port}"),
            });
        }

        let removed = sport
            .rules
            .remove(&rule)
            .ok_or(NicflowError::RuleNotFound(rule.0))?;

        if let Some(pipe) = sport.pipes.get_mut(usize::from(removed.pipe.idx)) {
            pipe.rules.retain(|h| *h != rule);
        }

        sport.cq[usize::from(queue)].push_back(Completion {
            op: OpKind::Remove,
            ok: true,
            port,
            queue,
            rule,
            token,
        });
        Ok(())
    }

    fn poll_completions(
        &self,
        port: PortId,
        queue: QueueId,
        budget_ms: u64,
        max: usize,
        cb: &mut dyn FnMut(Completion),
    ) -> usize {
        let start = Moment::now();
        let mut ready = vec![];
        {
            let mut inner = self.inner.lock();
            let Some(sport) = inner.ports.get_mut(&port) else {
                return 0;
            };
            let Some(cq) = sport.cq.get_mut(usize::from(queue)) else {
                return 0;
            };

            while ready.len() < max && start.elapsed_millis() <= budget_ms {
                match cq.pop_front() {
                    Some(c) => ready.push(c),
                    None => break,
                }
            }

            // The idle countdown starts when the install is confirmed.
            let now = Moment::now();
            for c in ready.iter().filter(|c| c.op == OpKind::Install && c.ok) {
                if let Some(rule) = sport.rules.get_mut(&c.rule) {
                    rule.confirmed = true;
                    rule.last_hit = now;
                }
            }
        }

        let n = ready.len();
        ready.into_iter().for_each(cb);
        n
    }

    fn handle_aging(
        &self,
        port: PortId,
        queue: QueueId,
        now: Moment,
        budget_ms: u64,
        max: usize,
        cb: &mut dyn FnMut(Completion),
    ) -> usize {
        let start = Moment::now();
        let mut aged = vec![];
        {
            let mut inner = self.inner.lock();
            let Some(sport) = inner.ports.get_mut(&port) else {
                return 0;
            };

            for (handle, rule) in sport.rules.iter_mut() {
                if aged.len() >= max || start.elapsed_millis() > budget_ms {
                    break;
                }

                if rule.queue != queue
                    || !rule.confirmed
                    || rule.aged
                    || !rule.is_expired(now)
                {
                    continue;
                }

                rule.aged = true;
                aged.push(Completion {
                    op: OpKind::Aged,
                    ok: true,
                    port,
                    queue,
                    rule: *handle,
                    token: rule.token.clone(),
                });
            }
        }

        let n = aged.len();
        aged.into_iter().for_each(cb);
        n
    }

    fn dump_port(&self, port: PortId) -> Result<DumpTopologyResp> {
        let inner = self.inner.lock();
        let sport =
            inner.ports.get(&port).ok_or(NicflowError::PortNotFound(port))?;

        let pipes = sport
            .pipes
            .iter()
            .map(|pipe| {
                let entries = pipe
                    .rules
                    .iter()
                    .filter_map(|h| sport.rules.get(h))
                    .map(|r| {
                        let matches = if r.spec.values.is_empty() {
                            "*".to_string()
                        } else {
                            r.spec
                                .values
                                .iter()
                                .map(|(f, v)| {
                                    format!("{f}={}", f.fmt_value(*v))
                                })
                                .join(",")
                        };
                        let fwd = r.spec.fwd.as_ref().unwrap_or(&pipe.cfg.fwd);

                        PipeEntryDump {
                            priority: r.spec.priority,
                            matches,
                            fwd: sport.pipe_name(fwd),
                            hits: r.hits,
                        }
                    })
                    .collect();

                PipeDump {
                    name: pipe.cfg.name.clone(),
                    domain: pipe.cfg.domain.to_string(),
                    is_root: pipe.cfg.is_root,
                    fwd: sport.pipe_name(&pipe.cfg.fwd),
                    fwd_miss: sport.pipe_name(&pipe.cfg.fwd_miss),
                    entries,
                }
            })
            .collect();

        Ok(DumpTopologyResp { port, pipes })
    }

    fn destroy_port(&self, port: PortId) -> Result<()> {
        self.inner
            .lock()
            .ports
            .remove(&port)
            .map(|_| ())
            .ok_or(NicflowError::PortNotFound(port))
    }
}
