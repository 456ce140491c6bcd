// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Drive the hardware aging scan.
//!
//! The offload engine decides which rules have gone idle; the
//! coordinator only asks it to look, within a time budget, and feeds
//! the resulting notifications through the reconciler like any other
//! completion.

use super::dataplane::Dataplane;
use crate::api::NicflowError;
use crate::api::PortId;
use crate::api::QueueId;
use crate::sys::time::Moment;

/// The most aged notifications handled in one scan.
pub const MAX_AGED_BURST: usize = 256;

pub struct AgingCoordinator<'a> {
    dp: &'a Dataplane,
}

impl<'a> AgingCoordinator<'a> {
    pub fn new(dp: &'a Dataplane) -> Self {
        Self { dp }
    }

    /// Scan the rules owned by (`port`, `queue`) for ones that have
    /// aged out, spending at most `budget_ms`.
    pub fn poll(
        &self,
        port: PortId,
        queue: QueueId,
        budget_ms: u64,
    ) -> Result<usize, NicflowError> {
        self.poll_at(port, queue, Moment::now(), budget_ms)
    }

    /// Like [`Self::poll`], judging idleness as of `now`.
    pub fn poll_at(
        &self,
        port: PortId,
        queue: QueueId,
        now: Moment,
        budget_ms: u64,
    ) -> Result<usize, NicflowError> {
        let pctx = self.dp.port(port)?;
        let mut aged = Vec::new();
        self.dp.engine().handle_aging(
            port,
            queue,
            now,
            budget_ms,
            MAX_AGED_BURST,
            &mut |c| aged.push(c),
        );

        let n = aged.len();
        if n > 0 {
            let mut cache = pctx.cache.lock();
            let mut r = self.dp.reconciler(pctx, &mut cache, now);
            aged.into_iter().for_each(|c| r.handle(c));
        }
        Ok(n)
    }

    /// Scan every queue of every port. This is what a dedicated aging
    /// thread runs.
    pub fn poll_all(&self, now: Moment) -> usize {
        let budget = self.dp.cfg().max_handling_ms;
        let mut n = 0;
        for pctx in self.dp.ports() {
            for q in 0..self.dp.cfg().nr_queues {
                n += self.poll_at(pctx.id, q, now, budget).unwrap_or(0);
            }
        }
        n
    }
}
