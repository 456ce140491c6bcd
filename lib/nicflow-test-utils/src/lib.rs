// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! Common routines for integration tests and benches: packet
//! builders for every supported encapsulation, a software-engine
//! dataplane, and assertions on processing results.

pub mod pcap;

use nicflow::ExecCtx;
use nicflow::api::DataplaneCfg;
use nicflow::api::Ipv4Addr;
use nicflow::api::MacAddr;
use nicflow::api::Protocol;
use nicflow::engine::Dataplane;
use nicflow::engine::SoftEngine;
use nicflow::engine::headers::ETHER_TYPE_IPV4;
use nicflow::engine::headers::EtherHdr;
use nicflow::engine::headers::GRE_PROTO_IPV4;
use nicflow::engine::headers::GreFlags;
use nicflow::engine::headers::GreHdr;
use nicflow::engine::headers::GtpFlags;
use nicflow::engine::headers::GtpuHdr;
use nicflow::engine::headers::Ipv4Hdr;
use nicflow::engine::headers::TcpHdr;
use nicflow::engine::headers::UdpHdr;
use nicflow::engine::headers::VxlanHdr;
use nicflow::engine::headers::WireHeader;
use slog::Drain;
use std::sync::Arc;
use std::sync::OnceLock;
use zerocopy::IntoBytes;

pub use nicflow::api::GTPU_PORT;
pub use nicflow::api::VXLAN_PORT;

pub const GUEST_MAC: MacAddr =
    MacAddr::from_const([0xa8, 0x40, 0x25, 0xf7, 0x00, 0x01]);
pub const GW_MAC: MacAddr =
    MacAddr::from_const([0xa8, 0x40, 0x25, 0xf7, 0x00, 0x02]);

/// The outer endpoints of test tunnels.
pub const TUN_SRC: &str = "172.16.0.1";
pub const TUN_DST: &str = "172.16.0.2";

/// The payload appended after every L4 header.
pub const PAYLOAD: &[u8] = b"nicflow test payload";

/// An IPv4 flow.
#[derive(Clone, Copy, Debug)]
pub struct Flow {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: Protocol,
    pub sport: u16,
    pub dport: u16,
    pub tos: u8,
}

impl Flow {
    pub fn tcp(src: &str, dst: &str, sport: u16, dport: u16) -> Self {
        Self {
            src: src.parse().unwrap(),
            dst: dst.parse().unwrap(),
            proto: Protocol::TCP,
            sport,
            dport,
            tos: 0,
        }
    }

    pub fn udp(src: &str, dst: &str, sport: u16, dport: u16) -> Self {
        Self { proto: Protocol::UDP, ..Self::tcp(src, dst, sport, dport) }
    }

    pub fn icmp(src: &str, dst: &str) -> Self {
        Self { proto: Protocol::ICMP, ..Self::tcp(src, dst, 0, 0) }
    }

    pub fn with_tos(self, tos: u8) -> Self {
        Self { tos, ..self }
    }

    /// The same flow in the other direction.
    pub fn reversed(self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
            sport: self.dport,
            dport: self.sport,
            ..self
        }
    }

    /// The IPv4 packet: header, L4 header, and `payload`.
    pub fn l3(&self, payload: &[u8]) -> Vec<u8> {
        let l4 = match self.proto {
            Protocol::TCP => {
                let hdr = TcpHdr::new(self.sport, self.dport, TcpHdr::FLAG_ACK);
                hdr.as_bytes().to_vec()
            }
            Protocol::UDP => {
                let hdr = UdpHdr::new(self.sport, self.dport, payload.len());
                hdr.as_bytes().to_vec()
            }
            // An ICMP echo request with id and sequence zero.
            _ => vec![8, 0, 0, 0, 0, 0, 0, 0],
        };

        let len = l4.len() + payload.len();
        let ip = Ipv4Hdr::new(self.src, self.dst, self.proto, self.tos, len);
        let mut out = ip.as_bytes().to_vec();
        out.extend_from_slice(&l4);
        out.extend_from_slice(payload);
        out
    }

    /// The Ethernet frame carrying [`Self::l3()`].
    pub fn l2(&self, payload: &[u8]) -> Vec<u8> {
        let eth = EtherHdr::new(GUEST_MAC, GW_MAC, ETHER_TYPE_IPV4);
        let mut out = eth.as_bytes().to_vec();
        out.extend(self.l3(payload));
        out
    }
}

/// An untunneled packet of `flow`.
pub fn plain(flow: &Flow) -> Vec<u8> {
    flow.l2(PAYLOAD)
}

/// Wrap `inner` in Ethernet and IPv4 from [`TUN_SRC`] to [`TUN_DST`].
fn outer(proto: Protocol, tos: u8, l4: Vec<u8>, inner: &[u8]) -> Vec<u8> {
    let ip = Ipv4Hdr::new(
        TUN_SRC.parse().unwrap(),
        TUN_DST.parse().unwrap(),
        proto,
        tos,
        l4.len() + inner.len(),
    );

    let eth = EtherHdr::new(GW_MAC, GUEST_MAC, ETHER_TYPE_IPV4);
    let mut out = eth.as_bytes().to_vec();
    out.extend_from_slice(ip.as_bytes());
    out.extend(l4);
    out.extend_from_slice(inner);
    out
}

fn udp_outer(dport: u16, tos: u8, tun_hdr: &[u8], inner: &[u8]) -> Vec<u8> {
    let udp = UdpHdr::new(49152, dport, tun_hdr.len() + inner.len());
    let mut l4 = udp.as_bytes().to_vec();
    l4.extend_from_slice(tun_hdr);
    outer(Protocol::UDP, tos, l4, inner)
}

/// `inner` in VXLAN with `vni`. The inner packet keeps its Ethernet
/// header.
pub fn vxlan(vni: u32, inner: &Flow) -> Vec<u8> {
    let hdr = VxlanHdr::new(vni);
    udp_outer(VXLAN_PORT, inner.tos, hdr.as_bytes(), &inner.l2(PAYLOAD))
}

/// `inner` in GRE, with the optional key and sequence number.
pub fn gre(key: Option<u32>, seq: Option<u32>, inner: &Flow) -> Vec<u8> {
    let mut flags = GreFlags::empty();
    flags.set(GreFlags::KEY, key.is_some());
    flags.set(GreFlags::SEQ, seq.is_some());

    let mut l4 = GreHdr::new(flags, GRE_PROTO_IPV4).as_bytes().to_vec();
    for opt in [key, seq].into_iter().flatten() {
        l4.extend_from_slice(&opt.to_be_bytes());
    }
    outer(Protocol::GRE, inner.tos, l4, &inner.l3(PAYLOAD))
}

/// `inner` in GTP-U with `teid`. `flags` other than empty adds the
/// four optional bytes.
pub fn gtpu(teid: u32, flags: GtpFlags, inner: &Flow) -> Vec<u8> {
    let l3 = inner.l3(PAYLOAD);
    let mut hdr = GtpuHdr::new(teid, flags, l3.len()).as_bytes().to_vec();
    if !flags.is_empty() {
        hdr.extend_from_slice(&[0; GtpuHdr::OPT_LEN]);
    }
    udp_outer(GTPU_PORT, inner.tos, &hdr, &l3)
}

/// The offset of the inner packet of a [`gtpu()`] packet.
pub fn gtpu_inner_off(flags: GtpFlags) -> usize {
    let base = EtherHdr::SIZE + Ipv4Hdr::SIZE + UdpHdr::SIZE + GtpuHdr::SIZE;
    if flags.is_empty() { base } else { base + GtpuHdr::OPT_LEN }
}

static TEST_LOG: OnceLock<slog::Logger> = OnceLock::new();

/// Set up the shared test logger: terminal output when
/// `NICFLOW_TEST_LOG` is set, nothing otherwise. Integration tests
/// call this from a `ctor` hook so every test shares one async drain.
pub fn init_test_log() {
    TEST_LOG.get_or_init(|| {
        if std::env::var_os("NICFLOW_TEST_LOG").is_none() {
            return slog::Logger::root(slog::Discard, slog::o!());
        }

        let decorator = slog_term::PlainSyncDecorator::new(std::io::stderr());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!("test" => true))
    });
}

pub fn test_logger() -> slog::Logger {
    init_test_log();
    TEST_LOG
        .get()
        .cloned()
        .unwrap_or_else(|| slog::Logger::root(slog::Discard, slog::o!()))
}

/// A running dataplane on a [`SoftEngine`].
pub struct TestDp {
    pub eng: Arc<SoftEngine>,
    pub dp: Arc<Dataplane>,
}

impl TestDp {
    pub fn new(cfg: DataplaneCfg) -> Self {
        let eng = Arc::new(SoftEngine::new(cfg.rule_capacity));
        let ectx = Arc::new(ExecCtx::new(test_logger()));
        let dp = Dataplane::new(ectx, cfg, eng.clone()).unwrap();
        dp.start().unwrap();
        Self { eng, dp: Arc::new(dp) }
    }

    /// Poll completions on every queue of every port until none are
    /// left. Returns the number handled.
    pub fn settle(&self) -> usize {
        let mut total = 0;
        loop {
            let mut n = 0;
            for port in self.dp.port_ids() {
                for q in 0..self.dp.cfg().nr_queues {
                    n += self.dp.poll_completions(port, q).unwrap();
                }
            }
            if n == 0 {
                return total;
            }
            total += n;
        }
    }
}

/// Assert a [`ProcessResult::Offloaded`](nicflow::engine::ProcessResult).
#[macro_export]
macro_rules! assert_offloaded {
    ($res:expr, $created:expr) => {
        match &$res {
            Ok(nicflow::engine::ProcessResult::Offloaded { created }) => {
                assert_eq!(*created, $created, "created");
            }
            _ => panic!("expected offload, got: {:?}", $res),
        }
    };
}

/// Assert a [`ProcessResult::Fallback`](nicflow::engine::ProcessResult)
/// for `$reason`.
#[macro_export]
macro_rules! assert_fallback {
    ($res:expr, $reason:expr) => {
        match &$res {
            Ok(nicflow::engine::ProcessResult::Fallback(reason)) => {
                assert_eq!(*reason, $reason);
            }
            _ => panic!("expected fallback {:?}, got: {:?}", $reason, $res),
        }
    };
}

/// Assert a [`ProcessResult::Drop`](nicflow::engine::ProcessResult)
/// whose reason matches `$pat`.
#[macro_export]
macro_rules! assert_drop {
    ($res:expr, $pat:pat) => {
        match &$res {
            Ok(nicflow::engine::ProcessResult::Drop(reason)) => {
                assert!(
                    matches!(reason, $pat),
                    "unexpected drop reason: {:?}",
                    reason
                );
            }
            _ => panic!("expected drop, got: {:?}", $res),
        }
    };
}
