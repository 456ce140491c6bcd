// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Worker threads over in-memory packet I/O.

use core::time::Duration;
use nicflow::ExecCtx;
use nicflow::api::DataplaneCfg;
use nicflow::engine::Dataplane;
use nicflow::engine::SoftEngine;
use nicflow::engine::dataplane::DataplaneState;
use nicflow::engine::headers::GtpFlags;
use nicflow::engine::io::Mbuf;
use nicflow::engine::io::MemIo;
use nicflow::engine::io::PacketIo;
use nicflow::engine::worker::spawn_workers;
use nicflow_test_utils::*;
use std::sync::Arc;
use std::time::Instant;

#[ctor::ctor]
fn init_log() {
    init_test_log();
}

/// Wait up to five seconds for `cond`.
fn wait_for(cond: impl FnMut() -> bool) -> bool {
    wait_secs(5, cond)
}

fn wait_secs(secs: u64, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(secs) {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn setup(cfg: DataplaneCfg) -> (Arc<SoftEngine>, Arc<Dataplane>, Arc<MemIo>) {
    let eng = Arc::new(SoftEngine::new(cfg.rule_capacity));
    let io = Arc::new(MemIo::new(cfg.nr_ports, cfg.nr_queues, 256, 256));
    let ectx = Arc::new(ExecCtx::new(test_logger()));
    let dp = Dataplane::new(ectx, cfg, eng.clone()).unwrap();
    (eng, Arc::new(dp), io)
}

#[test]
fn workers_offload_and_forward_to_peer() {
    let (_, dp, io) = setup(DataplaneCfg::default());
    let workers = spawn_workers(dp.clone(), io.clone()).unwrap();
    assert_eq!(dp.state(), DataplaneState::Running);

    let flows: Vec<_> = (0..4)
        .map(|i| {
            let sport = 5000 + i as u16;
            vxlan(100 + i, &Flow::tcp("10.3.0.1", "10.3.0.2", sport, 80))
        })
        .collect();

    // Spread over both queues of port 0, plus untunneled traffic.
    for (i, pkt) in flows.iter().enumerate() {
        assert!(io.inject(0, (i % 2) as u16, Mbuf::new(pkt.clone(), 0)));
        assert!(io.inject(0, (i % 2) as u16, Mbuf::new(pkt.clone(), 0)));
    }
    let stray = plain(&Flow::udp("1.1.1.1", "2.2.2.2", 1, 2));
    assert!(io.inject(0, 0, Mbuf::new(stray, 0)));
    // Dropped, so never forwarded.
    assert!(io.inject(0, 1, Mbuf::new(vec![0xff; 30], 0)));

    let mut forwarded = vec![];
    assert!(wait_for(|| {
        forwarded.extend(io.take_tx(1));
        forwarded.len() == 9
    }));
    assert!(wait_for(|| dp.state_counts(0).unwrap() == [0, 4, 0, 0]));

    let stats = dp.dump_stats(0).unwrap();
    assert_eq!(stats.rx_pkts, 10);
    assert_eq!(stats.tx_pkts, 9);
    assert_eq!(stats.drop_parse, 1);
    assert_eq!(stats.fallback_untunneled, 1);
    assert_eq!(stats.install_ok, 4);

    let io_stats = io.port_stats(0).unwrap();
    assert_eq!(io_stats.rx_packets, 10);
    assert_eq!(io.port_stats(1).unwrap().tx_packets, 9);

    workers.shutdown().unwrap();
    assert_eq!(dp.state(), DataplaneState::Stopped);
}

#[test]
fn rx_only_forwards_nothing() {
    let (_, dp, io) =
        setup(DataplaneCfg { rx_only: true, ..Default::default() });
    let workers = spawn_workers(dp.clone(), io.clone()).unwrap();

    let inner = Flow::udp("10.4.0.1", "10.4.0.2", 9, 9);
    let pkt = gtpu(9, GtpFlags::empty(), &inner);
    assert!(io.inject(1, 1, Mbuf::new(pkt, 0)));
    assert!(wait_for(|| dp.state_counts(1).unwrap() == [0, 1, 0, 0]));

    assert!(io.take_tx(0).is_empty());
    assert_eq!(dp.dump_stats(1).unwrap().tx_pkts, 0);
    workers.shutdown().unwrap();
}

#[test]
fn aging_thread_expires_flows() {
    let cfg = DataplaneCfg {
        age_thread: true,
        aging_min_secs: 5,
        aging_max_secs: 6,
        ..Default::default()
    };
    let (eng, dp, io) = setup(cfg);
    let workers = spawn_workers(dp.clone(), io.clone()).unwrap();
    let fixed = eng.num_rules(0);

    let pkt = vxlan(1, &Flow::tcp("10.5.0.1", "10.5.0.2", 1, 2));
    assert!(io.inject(0, 0, Mbuf::new(pkt, 0)));
    assert!(wait_for(|| dp.state_counts(0).unwrap() == [0, 1, 0, 0]));

    // Five seconds of idleness, then the aged rule is freed.
    assert!(wait_secs(10, || dp.dump_stats(0).unwrap().aged == 1));
    assert!(wait_for(|| eng.num_rules(0) == fixed));
    assert_eq!(dp.state_counts(0).unwrap(), [0, 0, 0, 0]);

    // Dropping the workers stops the threads without tearing down.
    drop(workers);
    assert_eq!(dp.state(), DataplaneState::Running);
    dp.destroy().unwrap();
}

#[test]
fn workers_age_flows_without_aging_thread() {
    let cfg = DataplaneCfg {
        aging_min_secs: 5,
        aging_max_secs: 6,
        ..Default::default()
    };
    let (eng, dp, io) = setup(cfg);
    let workers = spawn_workers(dp.clone(), io.clone()).unwrap();
    let fixed = eng.num_rules(0);

    let pkt = vxlan(2, &Flow::tcp("10.6.0.1", "10.6.0.2", 1, 2));
    assert!(io.inject(0, 1, Mbuf::new(pkt, 0)));
    assert!(wait_for(|| dp.state_counts(0).unwrap() == [0, 1, 0, 0]));

    // The worker owning queue 1 scans and frees the rule itself.
    assert!(wait_secs(10, || dp.dump_stats(0).unwrap().aged == 1));
    assert!(wait_for(|| eng.num_rules(0) == fixed));
    assert_eq!(dp.dump_stats(0).unwrap().invariant_violations, 0);

    workers.shutdown().unwrap();
}
