// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Turn offload engine completions into flow cache mutations.
//!
//! Every function here runs with the port's cache locked. The engine
//! may be called back into (to issue a removal), which is why the
//! engine never holds its own lock while delivering a completion.

use super::dataplane::PortStats;
use super::flow_table::EntryHandle;
use super::flow_table::FlowCache;
use super::lifecycle::LifecycleEvent;
use super::lifecycle::PendingOp;
use super::lifecycle::Resolution;
use super::offload::Completion;
use super::offload::OffloadEngine;
use super::offload::OpKind;
use crate::ExecCtx;
use crate::api::EntryState;
use crate::api::NicflowError;
use crate::sys::time::Moment;
use slog::debug;
use slog::error;
use slog::warn;

/// What a removal request did.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RemoveStatus {
    /// The removal was issued to the engine.
    Issued,
    /// The add is still outstanding; the removal will be issued when
    /// it completes.
    Deferred,
    /// A removal is already outstanding.
    InProgress,
}

pub(crate) struct Reconciler<'a> {
    pub ectx: &'a ExecCtx,
    pub engine: &'a dyn OffloadEngine,
    pub stats: &'a PortStats,
    pub cache: &'a mut FlowCache,
    pub now: Moment,
}

impl Reconciler<'_> {
    pub fn handle(&mut self, c: Completion) {
        match c.op {
            OpKind::Install => self.install_done(c),
            OpKind::Remove => self.remove_done(c),
            OpKind::Aged => self.aged(c),
        }
    }

    fn violation(&self, c: &Completion, msg: &str) {
        self.stats.invariant_violations.incr(1);
        error!(self.ectx.log, "{}", msg;
            "port" => c.port, "queue" => c.queue,
            "rule" => %c.rule, "op" => %c.op);
    }

    /// Resolve the completion's token, returning the entry it was
    /// issued for once the whole operation is released.
    fn resolve(&self, c: &Completion) -> Option<(EntryHandle, bool)> {
        match c.token.resolve(c.ok) {
            Resolution::Pending => None,
            Resolution::Stale => {
                self.violation(c, "completion for released operation");
                None
            }
            Resolution::Released { failed } => {
                c.token.entry().map(|h| (h, failed))
            }
        }
    }

    fn install_done(&mut self, c: Completion) {
        let Some((h, failed)) = self.resolve(&c) else {
            return;
        };

        let Some(entry) = self.cache.get_mut(h) else {
            self.violation(&c, "install completion for unknown entry");
            return;
        };

        if failed {
            self.stats.install_failed.incr(1);
            warn!(self.ectx.log, "flow install failed";
                "flow" => %entry.key(), "rule" => %c.rule);

            if entry.apply(LifecycleEvent::AddFailed).is_ok() {
                self.cache.destroy(h);
            } else {
                self.violation(&c, "add failed on entry not pending add");
            }
            return;
        }

        if entry.apply(LifecycleEvent::AddOk).is_err() {
            self.violation(&c, "add completed on entry not pending add");
            return;
        }

        entry.activate(c.rule, self.now);
        self.stats.install_ok.incr(1);
        debug!(self.ectx.log, "flow active";
            "flow" => %entry.key(), "rule" => %c.rule,
            "aging" => entry.aging_secs());

        if entry.delete_requested() {
            let res = issue_remove(self.ectx, self.engine, self.cache, h);
            if let Err(e) = res {
                warn!(self.ectx.log, "deferred removal failed"; "err" => %e);
            }
        }
    }

    fn remove_done(&mut self, c: Completion) {
        let Some((h, _)) = self.resolve(&c) else {
            // Either still pending, or the removal of an aged rule,
            // which no entry waits on.
            return;
        };

        let Some(entry) = self.cache.get_mut(h) else {
            self.violation(&c, "remove completion for unknown entry");
            return;
        };

        if entry.apply(LifecycleEvent::RemoveDone).is_err() {
            self.violation(&c, "remove completed on entry not pending delete");
            return;
        }

        if !c.ok {
            warn!(self.ectx.log, "flow removal failed";
                "flow" => %entry.key(), "rule" => %c.rule);
        }

        self.stats.removes.incr(1);
        self.cache.destroy(h);
    }

    fn aged(&mut self, c: Completion) {
        let Some(h) = c.token.entry() else {
            self.violation(&c, "aged notification without entry");
            return;
        };

        let Some(entry) = self.cache.get_mut(h) else {
            self.violation(&c, "aged notification for unknown entry");
            return;
        };

        if entry.rule() != Some(c.rule) || entry.state() != EntryState::Active {
            self.violation(&c, "aged notification for inactive entry");
            return;
        }

        if entry.apply(LifecycleEvent::Aged).is_err() {
            self.violation(&c, "aged notification in invalid state");
            return;
        }

        debug!(self.ectx.log, "flow aged";
            "flow" => %entry.key(), "rule" => %c.rule);
        entry.clear_rule();
        self.stats.aged.incr(1);
        self.cache.destroy(h);

        // The aged rule stays in hardware until removed. Nothing waits
        // on this removal.
        let token = PendingOp::new(None, 1);
        let res = self.engine.remove_rule(c.port, c.queue, c.rule, token);
        if let Err(e) = res {
            warn!(self.ectx.log, "failed to free aged rule";
                "rule" => %c.rule, "err" => %e);
        }
    }
}

/// Start the removal of the flow at `h`.
///
/// # Errors
///
/// The entry does not exist, is already `Deleted`, or the engine
/// refused the removal. In the last case the entry stays `Active`.
pub(crate) fn issue_remove(
    ectx: &ExecCtx,
    engine: &dyn OffloadEngine,
    cache: &mut FlowCache,
    h: EntryHandle,
) -> Result<RemoveStatus, NicflowError> {
    let port = cache.port();
    let entry = cache
        .get_mut(h)
        .ok_or_else(|| NicflowError::FlowNotFound(h.to_string()))?;

    match entry.state() {
        EntryState::PendingAdd => {
            entry.request_delete();
            debug!(ectx.log, "removal deferred"; "flow" => %entry.key());
            Ok(RemoveStatus::Deferred)
        }

        EntryState::PendingDelete => Ok(RemoveStatus::InProgress),

        EntryState::Deleted => {
            Err(NicflowError::FlowNotFound(entry.key().to_string()))
        }

        EntryState::Active => {
            let rule = entry.rule().ok_or_else(|| {
                let key = entry.key();
                let msg = format!("active flow {key} without rule");
                NicflowError::BadState(msg)
            })?;
            let token = PendingOp::for_entry(h);
            engine.remove_rule(port, entry.queue(), rule, token.clone())?;
            entry.apply(LifecycleEvent::RemoveIssued)?;
            entry.set_pending_delete(token);
            debug!(ectx.log, "removal issued";
                "flow" => %entry.key(), "rule" => %rule);
            Ok(RemoveStatus::Issued)
        }
    }
}
