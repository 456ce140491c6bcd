// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Worker threads.
//!
//! There is one worker per queue index. Worker `q` owns queue `q` of
//! every port: it receives from it, issues installs on it, and polls
//! its completions and (unless a dedicated aging thread is
//! configured) its aging scan. Received packets are forwarded to the
//! hairpin peer port unless the dataplane is receive-only.

use super::dataplane::Dataplane;
use super::dataplane::ProcessResult;
use super::io::MAX_BURST;
use super::io::Mbuf;
use super::io::PacketIo;
use crate::api::NicflowError;
use crate::api::PortIoStats;
use crate::api::QueueId;
use crate::api::hairpin_peer;
use crate::sys::time::Moment;
use core::sync::atomic::AtomicBool;
use core::sync::atomic::Ordering;
use core::time::Duration;
use slog::debug;
use slog::error;
use slog::info;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

/// How long the aging and stats threads sleep between checks of the
/// stop flag.
const TICK: Duration = Duration::from_millis(100);

pub struct Workers {
    dp: Arc<Dataplane>,
    running: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

struct Worker {
    queue: QueueId,
    dp: Arc<Dataplane>,
    io: Arc<dyn PacketIo>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        debug!(self.dp.ectx().log, "worker starting"; "queue" => self.queue);
        let mut rx = Vec::with_capacity(MAX_BURST);

        while self.running.load(Ordering::Relaxed) {
            let mut busy = false;
            for port in self.dp.port_ids() {
                busy |= self.rx_port(port, &mut rx) > 0;

                if let Ok(n) = self.dp.poll_completions(port, self.queue) {
                    busy |= n > 0;
                }

                if !self.dp.cfg().age_thread {
                    match self.dp.poll_aging(port, self.queue) {
                        Ok(n) => busy |= n > 0,
                        Err(e) => {
                            debug!(self.dp.ectx().log, "aging poll failed";
                                "port" => port, "queue" => self.queue,
                                "err" => %e);
                        }
                    }
                }
            }

            if !busy {
                thread::yield_now();
            }
        }

        debug!(self.dp.ectx().log, "worker stopped"; "queue" => self.queue);
    }

    fn rx_port(&self, port: u16, rx: &mut Vec<Mbuf>) -> usize {
        rx.clear();
        let n = self.io.rx_burst(port, self.queue, rx, MAX_BURST);
        if n == 0 {
            return 0;
        }

        let mut fwd = Vec::with_capacity(n);
        for pkt in rx.drain(..) {
            match self.dp.process_pkt(port, self.queue, &pkt.data, pkt.hash) {
                Ok(ProcessResult::Drop(_)) | Err(_) => (),
                Ok(_) => fwd.push(pkt),
            }
        }

        if self.dp.cfg().rx_only || fwd.is_empty() {
            return n;
        }

        let peer = hairpin_peer(port);
        let lens: Vec<usize> = fwd.iter().map(Mbuf::len).collect();
        // A short transmit sends a prefix of the burst.
        let sent = self.io.tx_burst(peer, self.queue, fwd);

        if let Ok(pctx) = self.dp.port(port) {
            pctx.stats.tx_pkts.incr(sent as u64);
            pctx.stats.tx_bytes.incr(lens[..sent].iter().sum::<usize>() as u64);
            pctx.stats.tx_dropped.incr((lens.len() - sent) as u64);
        }
        n
    }
}

fn spawn(
    name: String,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, NicflowError> {
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|e| {
            NicflowError::BadState(format!("failed to spawn {name}: {e}"))
        })
}

/// Sleep for `total`, waking every [`TICK`] to check `running`.
/// Returns false if asked to stop.
fn sleep_while(running: &AtomicBool, total: Duration) -> bool {
    let start = Moment::now();
    while running.load(Ordering::Relaxed) {
        if start.elapsed_millis() >= total.as_millis() as u64 {
            return true;
        }
        thread::sleep(TICK.min(total));
    }
    false
}

/// Start the dataplane and spawn its threads: one worker per queue,
/// plus an aging thread and a stats thread if configured.
pub fn spawn_workers(
    dp: Arc<Dataplane>,
    io: Arc<dyn PacketIo>,
) -> Result<Workers, NicflowError> {
    dp.start()?;
    let running = Arc::new(AtomicBool::new(true));
    let mut workers = Workers {
        dp: dp.clone(),
        running: running.clone(),
        handles: vec![],
    };

    for queue in 0..dp.cfg().nr_queues {
        let w = Worker {
            queue,
            dp: dp.clone(),
            io: io.clone(),
            running: running.clone(),
        };
        let name = format!("nicflow-q{queue}");
        workers.handles.push(spawn(name, move || w.run())?);
    }

    if dp.cfg().age_thread {
        let (dp, running) = (dp.clone(), running.clone());
        workers.handles.push(spawn("nicflow-aging".into(), move || {
            while sleep_while(&running, TICK) {
                dp.aging().poll_all(Moment::now());
            }
        })?);
    }

    if dp.cfg().stats_timer > 0 {
        let (dp, running) = (dp.clone(), running.clone());
        let period = Duration::from_secs(dp.cfg().stats_timer);
        workers.handles.push(spawn("nicflow-stats".into(), move || {
            let mut prev: BTreeMap<u16, (Moment, PortIoStats)> =
                BTreeMap::new();
            while sleep_while(&running, period) {
                log_stats(&dp, io.as_ref(), &mut prev);
            }
        })?);
    }

    info!(dp.ectx().log, "workers started"; "queues" => dp.cfg().nr_queues);
    Ok(workers)
}

fn log_stats(
    dp: &Dataplane,
    io: &dyn PacketIo,
    prev: &mut BTreeMap<u16, (Moment, PortIoStats)>,
) {
    let now = Moment::now();
    for port in dp.port_ids() {
        let Ok(snap) = dp.dump_stats(port) else {
            continue;
        };
        let Some(cur) = io.port_stats(port) else {
            continue;
        };

        let rates = prev
            .get(&port)
            .map(|(then, p)| cur.rates_since(p, now.delta_as_millis(*then)))
            .unwrap_or_default();

        info!(dp.ectx().log, "port stats";
            "port" => port,
            "rx_pps" => rates.rx_pps,
            "tx_pps" => rates.tx_pps,
            "flows_ok" => snap.install_ok,
            "flows_failed" => snap.install_failed,
            "aged" => snap.aged,
            "drops" => snap.drop_parse + snap.drop_l4,
        );
        prev.insert(port, (now, cur));
    }
}

impl Workers {
    pub fn dataplane(&self) -> &Arc<Dataplane> {
        &self.dp
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        for h in self.handles.drain(..) {
            if h.join().is_err() {
                error!(self.dp.ectx().log, "worker panicked");
            }
        }
    }

    /// Stop every thread, then drain and destroy the dataplane.
    pub fn shutdown(mut self) -> Result<(), NicflowError> {
        self.stop();
        self.dp.destroy()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.stop();
    }
}
