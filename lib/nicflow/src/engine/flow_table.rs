// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The flow cache.
//!
//! Entries live in a slab of generation-tagged slots. Everything
//! outside the cache (completion tokens, hardware user contexts)
//! refers to an entry through an [`EntryHandle`], which stops
//! resolving as soon as the slot is released, even if the slot is
//! later reused for another flow.
//!
//! A flow is removed from the key index the moment it becomes
//! `Deleted`, so a new packet of the same flow creates a fresh entry.
//! The slot itself is released only once no pending operation refers
//! to it any more.

use super::lifecycle::LifecycleEvent;
use super::lifecycle::PendingOp;
use super::lifecycle::transition;
use super::offload::RuleHandle;
use crate::api::EntryState;
use crate::api::FlowEntryDump;
use crate::api::FlowKey;
use crate::api::NicflowError;
use crate::api::PortId;
use crate::api::QueueId;
use crate::sys::time::Moment;
use core::num::NonZeroU32;
use core::time::Duration;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

type Result<T> = core::result::Result<T, NicflowError>;

/// A typed reference to a cache entry: slot index plus generation.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EntryHandle {
    idx: u32,
    generation: u32,
}

impl Display for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.idx, self.generation)
    }
}

#[derive(Debug)]
pub struct FlowEntry {
    key: FlowKey,
    state: EntryState,
    queue: QueueId,
    pkts: u64,
    bytes: u64,
    aging_secs: Option<u32>,
    expires: Option<Moment>,
    rule: Option<RuleHandle>,
    pending: Option<Arc<PendingOp>>,
    delete_requested: bool,
}

impl FlowEntry {
    fn new(key: FlowKey, queue: QueueId) -> Self {
        Self {
            key,
            state: EntryState::PendingAdd,
            queue,
            pkts: 0,
            bytes: 0,
            aging_secs: None,
            expires: None,
            rule: None,
            pending: None,
            delete_requested: false,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    /// The queue the flow was first seen on. All hardware operations
    /// for the flow are issued and completed there.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn pkts(&self) -> u64 {
        self.pkts
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn aging_secs(&self) -> Option<u32> {
        self.aging_secs
    }

    pub fn expires(&self) -> Option<Moment> {
        self.expires
    }

    /// The hardware rule. Only set while `Active`.
    pub fn rule(&self) -> Option<RuleHandle> {
        self.rule
    }

    pub fn pending(&self) -> Option<&Arc<PendingOp>> {
        self.pending.as_ref()
    }

    pub fn delete_requested(&self) -> bool {
        self.delete_requested
    }

    /// Count a packet of the flow. A hit on an installed rule restarts
    /// its idle countdown.
    pub fn hit(&mut self, bytes: usize, now: Moment) {
        self.pkts += 1;
        self.bytes += bytes as u64;
        if self.expires.is_some() {
            self.expires = self.expiry_from(now);
        }
    }

    fn expiry_from(&self, now: Moment) -> Option<Moment> {
        self.aging_secs.map(|secs| now + Duration::from_secs(u64::from(secs)))
    }

    /// Apply a lifecycle event.
    ///
    /// # Errors
    ///
    /// The event is not valid in the current state. The entry is
    /// left untouched.
    pub fn apply(&mut self, ev: LifecycleEvent) -> Result<EntryState> {
        let next = transition(self.state, ev).ok_or_else(|| {
            let (state, key) = (self.state, &self.key);
            NicflowError::BadState(format!("{ev} on {state} entry {key}"))
        })?;
        self.state = next;
        Ok(next)
    }

    /// Record the issue of an install.
    pub fn set_pending_add(&mut self, token: Arc<PendingOp>, aging_secs: u32) {
        self.pending = Some(token);
        self.aging_secs = Some(aging_secs);
    }

    /// Record the issue of a removal.
    pub fn set_pending_delete(&mut self, token: Arc<PendingOp>) {
        self.pending = Some(token);
        self.rule = None;
        self.expires = None;
    }

    /// Record a confirmed install.
    pub fn activate(&mut self, rule: RuleHandle, now: Moment) {
        self.pending = None;
        self.rule = Some(rule);
        self.expires = self.expiry_from(now);
    }

    /// Drop the reference to the pending operation after it was
    /// released.
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    pub fn clear_rule(&mut self) {
        self.rule = None;
        self.expires = None;
    }

    pub fn request_delete(&mut self) {
        self.delete_requested = true;
    }

    fn dump(&self, now: Moment) -> FlowEntryDump {
        FlowEntryDump {
            key: self.key,
            state: self.state,
            queue: self.queue,
            pkts: self.pkts,
            bytes: self.bytes,
            aging_secs: self.aging_secs,
            expires_in_ms: self.expires.map(|e| e.delta_as_millis(now)),
            rule: self.rule.map(|r| r.0),
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<FlowEntry>,
}

#[derive(Debug)]
pub struct FlowCache {
    port: PortId,
    limit: NonZeroU32,
    slots: Vec<Slot>,
    free: Vec<u32>,
    map: HashMap<FlowKey, EntryHandle>,
    occupied: u32,
}

impl FlowCache {
    pub fn new(port: PortId, limit: NonZeroU32) -> Self {
        Self {
            port,
            limit,
            slots: Vec::new(),
            free: Vec::new(),
            map: HashMap::new(),
            occupied: 0,
        }
    }

    pub fn port(&self) -> PortId {
        self.port
    }

    pub fn limit(&self) -> NonZeroU32 {
        self.limit
    }

    /// The number of flows reachable by key.
    pub fn num_flows(&self) -> u32 {
        self.map.len() as u32
    }

    /// The number of slots in use, including `Deleted` entries still
    /// referenced by a pending operation. This is what the capacity
    /// limit applies to.
    pub fn num_slots(&self) -> u32 {
        self.occupied
    }

    pub fn lookup(&self, key: &FlowKey) -> Option<EntryHandle> {
        self.map.get(key).copied()
    }

    /// Find the entry for `key`, creating a `PendingAdd` entry on
    /// `queue` if there is none. The second value is true if the
    /// entry was created.
    ///
    /// # Errors
    ///
    /// If the cache is at capacity and `key` is not present, an error
    /// is returned and no modification is made to the cache.
    pub fn lookup_or_create(
        &mut self,
        key: FlowKey,
        queue: QueueId,
    ) -> Result<(EntryHandle, bool)> {
        if let Some(handle) = self.map.get(&key) {
            return Ok((*handle, false));
        }

        if self.occupied >= self.limit.get() {
            return Err(NicflowError::MaxCapacity(u64::from(self.limit.get())));
        }

        let entry = FlowEntry::new(key, queue);
        let handle = match self.free.pop() {
            Some(idx) => {
                let slot = &mut self.slots[idx as usize];
                slot.entry = Some(entry);
                EntryHandle { idx, generation: slot.generation }
            }

            None => {
                let idx = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                EntryHandle { idx, generation: 0 }
            }
        };

        self.occupied += 1;
        self.map.insert(key, handle);
        Ok((handle, true))
    }

    pub fn get(&self, handle: EntryHandle) -> Option<&FlowEntry> {
        let slot = self.slots.get(handle.idx as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: EntryHandle) -> Option<&mut FlowEntry> {
        let slot = self.slots.get_mut(handle.idx as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    /// Tear down a `Deleted` entry: unlink its key and, if no pending
    /// operation refers to it, release its slot. Returns true if the
    /// slot was released.
    pub fn destroy(&mut self, handle: EntryHandle) -> bool {
        let Some(entry) = self.get(handle) else {
            return false;
        };

        if entry.state != EntryState::Deleted {
            return false;
        }

        let key = entry.key;
        if self.map.get(&key) == Some(&handle) {
            self.map.remove(&key);
        }

        self.release(handle)
    }

    /// Release the slot of a `Deleted` entry once nothing refers to
    /// it. Returns true if the slot was released.
    pub fn release(&mut self, handle: EntryHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.idx as usize) else {
            return false;
        };

        let releasable = slot.generation == handle.generation
            && slot.entry.as_ref().is_some_and(|e| {
                e.state == EntryState::Deleted
                    && e.pending.as_ref().is_none_or(|p| p.is_released())
            });

        if !releasable {
            return false;
        }

        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.idx);
        self.occupied -= 1;
        true
    }

    /// Handles of all occupied slots.
    pub fn handles(&self) -> Vec<EntryHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.entry.is_some())
            .map(|(i, s)| EntryHandle {
                idx: i as u32,
                generation: s.generation,
            })
            .collect()
    }

    /// Count entries in each state: pending add, active, pending
    /// delete, deleted.
    pub fn state_counts(&self) -> [u32; 4] {
        let mut counts = [0; 4];
        for e in self.slots.iter().filter_map(|s| s.entry.as_ref()) {
            let i = match e.state {
                EntryState::PendingAdd => 0,
                EntryState::Active => 1,
                EntryState::PendingDelete => 2,
                EntryState::Deleted => 3,
            };
            counts[i] += 1;
        }
        counts
    }

    /// Dump the flows reachable by key, ordered by key.
    pub fn dump(&self, now: Moment) -> Vec<FlowEntryDump> {
        self.map
            .iter()
            .sorted_by_key(|(k, _)| **k)
            .filter_map(|(_, h)| self.get(*h))
            .map(|e| e.dump(now))
            .collect()
    }
}
