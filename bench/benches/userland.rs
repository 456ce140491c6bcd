// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use nicflow::api::DataplaneCfg;
use nicflow::engine::PacketView;
use nicflow::engine::flow_key::build_key;
use nicflow::engine::flow_table::FlowCache;
use nicflow_bench::MeasurementInfo;
use nicflow_bench::packet::BenchPacket;
use nicflow_bench::packet::Encaps;
use nicflow_test_utils::TestDp;
use rand::seq::SliceRandom;
use std::hint::black_box;
use std::num::NonZeroU32;

pub fn parse<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let mut c = c.benchmark_group(format!("parse/{}", M::label()));

    for case in Encaps.test_cases() {
        let pkt = case.generate(0);
        c.bench_with_input(
            BenchmarkId::new(Encaps.packet_label(), case.instance_name()),
            &pkt,
            |b, pkt| b.iter(|| PacketView::parse(black_box(pkt))),
        );
    }
}

pub fn cache_lookup<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let mut c = c.benchmark_group(format!("cache/{}", M::label()));
    let cases = Encaps.test_cases();
    let case = &cases[1];

    for fill in [16u16, 1024, 8096] {
        let pkts: Vec<Vec<u8>> = (0..fill).map(|n| case.generate(n)).collect();
        let mut keys: Vec<_> = pkts
            .iter()
            .map(|p| build_key(&PacketView::parse(p).unwrap(), 0, 0))
            .collect();

        let limit = NonZeroU32::new(u32::from(fill)).unwrap();
        let mut cache = FlowCache::new(0, limit);
        for k in &keys {
            cache.lookup_or_create(*k, 0).unwrap();
        }
        keys.shuffle(&mut rand::rng());

        c.bench_with_input(BenchmarkId::new("lookup", fill), &keys, |b, keys| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % keys.len();
                cache.lookup(black_box(&keys[i]))
            })
        });
    }
}

pub fn process<M: MeasurementInfo + 'static>(c: &mut Criterion<M>) {
    let mut c = c.benchmark_group(format!("process/{}", M::label()));

    for case in Encaps.test_cases() {
        let t = TestDp::new(DataplaneCfg::default());
        let pkt = case.generate(0);
        // Offload the flow first: this measures the hit path.
        let _ = t.dp.process_pkt(0, 0, &pkt, 0);
        t.settle();

        c.bench_with_input(
            BenchmarkId::new("hit", case.instance_name()),
            &pkt,
            |b, pkt| b.iter(|| t.dp.process_pkt(0, 0, black_box(pkt), 0)),
        );
    }
}

criterion_group!(userland, parse, cache_lookup, process);
criterion_main!(userland);
