// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use core::num::NonZeroU32;
use nicflow::api::DEF_FLOW_CAPACITY;
use nicflow::api::FlowKey;
use nicflow::api::NicflowError;
use nicflow::api::Protocol;
use nicflow::api::TunnelId;
use nicflow::api::TunnelType;
use nicflow::engine::flow_table::EntryHandle;
use nicflow::engine::flow_table::FlowCache;
use nicflow::sys::sync::NfMutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

const NUM_KEYS: u32 = 10_000;
const NUM_THREADS: u32 = 20;

fn key(i: u32) -> FlowKey {
    FlowKey {
        src_ip: (0x0a00_0000 | i).into(),
        dst_ip: "10.255.0.1".parse().unwrap(),
        src_port: (i % 60_000) as u16,
        dst_port: 443,
        tun_id: TunnelId::new(0x42),
        proto: Protocol::TCP,
        tun_type: TunnelType::Vxlan,
        port: 0,
        hash: i,
    }
}

type Outcome = (u32, Result<(EntryHandle, bool), NicflowError>);

// Every key is offered by two threads at once. Exactly capacity keys
// get an entry, each exactly one, and the rest fail the same way for
// both threads.
#[test]
fn concurrent_creation_at_capacity() {
    let cache = Arc::new(NfMutex::new(FlowCache::new(
        0,
        NonZeroU32::new(DEF_FLOW_CAPACITY).unwrap(),
    )));

    let workers: Vec<_> = (0..NUM_THREADS)
        .map(|t| {
            let cache = cache.clone();
            thread::spawn(move || -> Vec<Outcome> {
                (0..NUM_KEYS)
                    .filter(|i| i % (NUM_THREADS / 2) == t % (NUM_THREADS / 2))
                    .map(|i| {
                        let queue = (t % 2) as u16;
                        (i, cache.lock().lookup_or_create(key(i), queue))
                    })
                    .collect()
            })
        })
        .collect();

    let outcomes: Vec<Outcome> =
        workers.into_iter().flat_map(|w| w.join().unwrap()).collect();
    assert_eq!(outcomes.len(), 2 * NUM_KEYS as usize);

    let mut created = 0;
    let mut found = 0;
    let mut handles: HashMap<u32, EntryHandle> = HashMap::new();
    let mut refused: HashMap<u32, u32> = HashMap::new();

    for (i, res) in outcomes {
        match res {
            Ok((h, is_new)) => {
                if is_new {
                    created += 1;
                } else {
                    found += 1;
                }
                // Both threads must see the same entry.
                assert_eq!(*handles.entry(i).or_insert(h), h, "key {i}");
            }

            Err(e) => {
                let cap = u64::from(DEF_FLOW_CAPACITY);
                assert_eq!(e, NicflowError::MaxCapacity(cap));
                *refused.entry(i).or_default() += 1;
            }
        }
    }

    assert_eq!(created, DEF_FLOW_CAPACITY);
    assert_eq!(found, DEF_FLOW_CAPACITY);
    assert_eq!(refused.len() as u32, NUM_KEYS - DEF_FLOW_CAPACITY);
    assert!(refused.values().all(|n| *n == 2));
    assert!(refused.keys().all(|i| !handles.contains_key(i)));

    let unique: HashSet<EntryHandle> = handles.values().copied().collect();
    assert_eq!(unique.len() as u32, DEF_FLOW_CAPACITY);

    let cache = cache.lock();
    assert_eq!(cache.num_flows(), DEF_FLOW_CAPACITY);
    assert_eq!(cache.num_slots(), DEF_FLOW_CAPACITY);

    // Existing keys still resolve at capacity.
    for (i, h) in &handles {
        assert_eq!(cache.lookup(&key(*i)), Some(*h));
    }
}

#[test]
fn lookup_is_idempotent() {
    let mut cache = FlowCache::new(3, NonZeroU32::new(4).unwrap());
    let (h, created) = cache.lookup_or_create(key(1), 0).unwrap();
    assert!(created);

    for _ in 0..3 {
        assert_eq!(cache.lookup_or_create(key(1), 1).unwrap(), (h, false));
    }
    assert_eq!(cache.num_flows(), 1);
    // The queue of the first packet owns the entry.
    assert_eq!(cache.get(h).unwrap().queue(), 0);
}
