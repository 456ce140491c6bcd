// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Nicflow Contributors

//! The per-port pipeline topology.
//!
//! ```text
//!                   +-- udp/4789 -> VXLAN_PIPE --+
//!                   |                            |  hit:  peer port
//!   rx -> ROOT_PIPE +-- gre -----> GRE_PIPE -----+->      (hairpin)
//!                   |                            |        or RSS_PIPE
//!                   +-- udp/2152 -> GTP_PIPE ----+  miss: RSS_PIPE
//!                   |
//!                   +-- default -> HAIRPIN_PIPE --> peer port
//!
//!   tx -> EGRESS_PIPE (meta == 1: encap) -> port
//! ```
//!
//! The topology is built once per port, before any traffic, and is
//! read-only afterwards. Only the three tunnel match stages take
//! per-flow rules.

use super::lifecycle::PendingOp;
use super::lifecycle::Resolution;
use super::offload::Action;
use super::offload::Aging;
use super::offload::Domain;
use super::offload::Field;
use super::offload::FieldMatch;
use super::offload::Fwd;
use super::offload::OffloadEngine;
use super::offload::PipeCfg;
use super::offload::PipeId;
use super::offload::RuleSpec;
use super::parse::PacketView;
use crate::ExecCtx;
use crate::api::DataplaneCfg;
use crate::api::GTPU_PORT;
use crate::api::MacAddr;
use crate::api::NicflowError;
use crate::api::PortId;
use crate::api::Protocol;
use crate::api::TunnelType;
use crate::api::VXLAN_PORT;
use crate::api::hairpin_peer;
use slog::error;
use slog::info;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

type Result<T> = core::result::Result<T, NicflowError>;

/// The metadata value marking a packet for egress encapsulation.
pub const META_ENCAP: u32 = 1;

/// The MAC addresses written into the synthesized Ethernet header of
/// a decapsulated L3 tunnel packet.
pub const DECAP_MAC: MacAddr =
    MacAddr::from_const([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);

/// The fields every tunnel match stage keys on.
pub const MATCH_FIELDS: [Field; 8] = [
    Field::OuterSrcIp,
    Field::OuterDstIp,
    Field::TunnelId,
    Field::InnerSrcIp,
    Field::InnerDstIp,
    Field::InnerProto,
    Field::InnerSrcPort,
    Field::InnerDstPort,
];

/// Bring-up polls for a batch's completions this many times before
/// giving up on it.
const BATCH_POLL_ATTEMPTS: u32 = 10_000;

pub const RSS_PIPE: &str = "RSS_PIPE";
pub const HAIRPIN_PIPE: &str = "HAIRPIN_PIPE";
pub const VXLAN_PIPE: &str = "VXLAN_PIPE";
pub const GRE_PIPE: &str = "GRE_PIPE";
pub const GTP_PIPE: &str = "GTP_PIPE";
pub const ROOT_PIPE: &str = "ROOT_PIPE";
pub const EGRESS_PIPE: &str = "EGRESS_PIPE";

/// What the topology remembers of a pipe: enough to check where its
/// traffic ends up.
#[derive(Clone, Debug)]
pub struct PipeNode {
    pub name: String,
    pub fwd: Fwd,
    pub fwd_miss: Fwd,
}

/// Check that the miss path of every pipe in `starts` ends at
/// `fallback`, following `fwd_miss` through any intermediate pipes.
pub fn validate_miss_paths(
    port: PortId,
    nodes: &BTreeMap<PipeId, PipeNode>,
    starts: &[PipeId],
    fallback: PipeId,
) -> Result<()> {
    for start in starts {
        let mut seen = BTreeSet::new();
        let mut cur = *start;
        let name = nodes
            .get(start)
            .map_or_else(|| start.to_string(), |n| n.name.clone());
        let broken = |msg: String| NicflowError::PipeCreate {
            port,
            pipe: name.clone(),
            msg,
        };

        loop {
            if cur == fallback {
                break;
            }

            if !seen.insert(cur) {
                return Err(broken(format!("miss path loops at pipe {cur}")));
            }

            let node = nodes
                .get(&cur)
                .ok_or_else(|| broken(format!("unknown pipe {cur}")))?;
            match &node.fwd_miss {
                Fwd::Pipe(next) => cur = *next,
                other => {
                    return Err(broken(format!(
                        "miss path ends at {other} instead of {RSS_PIPE}"
                    )));
                }
            }
        }
    }

    Ok(())
}

/// The pipes of one port.
#[derive(Debug)]
pub struct PortTopology {
    pub port: PortId,
    pub rss: PipeId,
    pub hairpin: PipeId,
    pub vxlan: PipeId,
    pub gre: PipeId,
    pub gtp: PipeId,
    pub root: PipeId,
    pub egress: PipeId,
    nodes: BTreeMap<PipeId, PipeNode>,
}

struct TopologyBuilder<'a> {
    ectx: &'a ExecCtx,
    engine: &'a dyn OffloadEngine,
    port: PortId,
    nodes: BTreeMap<PipeId, PipeNode>,
}

impl TopologyBuilder<'_> {
    fn pipe(&mut self, cfg: PipeCfg) -> Result<PipeId> {
        let node = PipeNode {
            name: cfg.name.clone(),
            fwd: cfg.fwd.clone(),
            fwd_miss: cfg.fwd_miss.clone(),
        };

        let id = self.engine.create_pipe(self.port, cfg)?;
        info!(self.ectx.log, "created pipe";
            "port" => self.port, "pipe" => %id, "name" => &node.name);
        self.nodes.insert(id, node);
        Ok(id)
    }

    /// Install a batch of infrastructure entries under one token and
    /// wait for all of them to complete.
    fn entries(
        &self,
        name: &str,
        batch: Vec<(PipeId, RuleSpec)>,
    ) -> Result<()> {
        let failed = |msg: String| NicflowError::PipeCreate {
            port: self.port,
            pipe: name.to_string(),
            msg,
        };

        let n = batch.len() as u32;
        let token = PendingOp::new(None, n);
        let mut issue_err = None;

        for (i, (pipe, rule)) in batch.into_iter().enumerate() {
            if let Err(e) =
                self.engine.install_rule(pipe, 0, rule, token.clone())
            {
                // The rest of the batch was never issued.
                for _ in i..n as usize {
                    token.resolve(false);
                }
                issue_err = Some(e);
                break;
            }
        }

        let mut attempts = 0;
        while !token.is_released() {
            if attempts == BATCH_POLL_ATTEMPTS {
                return Err(failed(format!(
                    "{} entries never completed",
                    token.outstanding()
                )));
            }
            attempts += 1;

            let log = &self.ectx.log;
            self.engine.poll_completions(
                self.port,
                0,
                u64::MAX,
                usize::MAX,
                &mut |c| {
                    if let Resolution::Stale = c.token.resolve(c.ok) {
                        error!(log, "stale completion during bring-up";
                            "port" => c.port,
                            "rule" => %c.rule,
                            "op" => %c.op);
                    }
                },
            );

            if !token.is_released() {
                std::thread::yield_now();
            }
        }

        if let Some(e) = issue_err {
            return Err(failed(e.to_string()));
        }

        if token.failed() {
            return Err(failed("entry install failed".into()));
        }

        info!(self.ectx.log, "installed entries";
            "port" => self.port, "pipe" => name, "n" => n);
        Ok(())
    }
}

fn match_stage(
    name: &str,
    tun: TunnelType,
    fwd: Fwd,
    fwd_miss: Fwd,
) -> PipeCfg {
    PipeCfg {
        name: name.into(),
        domain: Domain::Ingress,
        is_root: false,
        template: MATCH_FIELDS
            .iter()
            .map(|f| (*f, FieldMatch::PerRule))
            .collect(),
        actions: vec![Action::Decap { inner_l2: tun.inner_has_l2() }],
        monitor: Some(Aging::Unbounded),
        fwd,
        fwd_miss,
    }
}

impl PortTopology {
    /// Create the pipes of `port` and install their fixed entries, in
    /// dependency order: a pipe is created only after every pipe it
    /// forwards to.
    pub fn build(
        ectx: &ExecCtx,
        engine: &dyn OffloadEngine,
        cfg: &DataplaneCfg,
        port: PortId,
    ) -> Result<Self> {
        let mut b =
            TopologyBuilder { ectx, engine, port, nodes: BTreeMap::new() };
        let peer = hairpin_peer(port);

        let rss = b.pipe(PipeCfg {
            name: RSS_PIPE.into(),
            domain: Domain::Ingress,
            is_root: false,
            template: vec![],
            actions: vec![],
            monitor: None,
            fwd: Fwd::Rss { queues: (0..cfg.nr_queues).collect() },
            fwd_miss: Fwd::Drop,
        })?;
        b.entries(RSS_PIPE, vec![(rss, RuleSpec::match_all())])?;

        let hairpin = b.pipe(PipeCfg {
            name: HAIRPIN_PIPE.into(),
            domain: Domain::Ingress,
            is_root: false,
            template: vec![],
            actions: vec![],
            monitor: None,
            fwd: Fwd::Port(peer),
            fwd_miss: Fwd::Pipe(rss),
        })?;
        b.entries(HAIRPIN_PIPE, vec![(hairpin, RuleSpec::match_all())])?;

        let hit = if cfg.hairpin { Fwd::Port(peer) } else { Fwd::Pipe(rss) };
        let miss = Fwd::Pipe(rss);
        let vxlan = b.pipe(match_stage(
            VXLAN_PIPE,
            TunnelType::Vxlan,
            hit.clone(),
            miss.clone(),
        ))?;
        let gre = b.pipe(match_stage(
            GRE_PIPE,
            TunnelType::Gre,
            hit.clone(),
            miss.clone(),
        ))?;
        let gtp =
            b.pipe(match_stage(GTP_PIPE, TunnelType::GtpU, hit, miss))?;

        let root = b.pipe(PipeCfg {
            name: ROOT_PIPE.into(),
            domain: Domain::Ingress,
            is_root: true,
            template: vec![
                (Field::OuterProto, FieldMatch::PerRule),
                (Field::OuterDstPort, FieldMatch::PerRule),
            ],
            actions: vec![],
            monitor: None,
            fwd: Fwd::Pipe(hairpin),
            fwd_miss: Fwd::Pipe(rss),
        })?;

        let proto = |p: Protocol| (Field::OuterProto, u32::from(u8::from(p)));
        let dport = |p: u16| (Field::OuterDstPort, u32::from(p));
        let to = |pipe: PipeId, priority: u8, values: Vec<(Field, u32)>| {
            let fwd = Some(Fwd::Pipe(pipe));
            (root, RuleSpec { priority, values, fwd, ..RuleSpec::match_all() })
        };
        b.entries(
            ROOT_PIPE,
            vec![
                to(vxlan, 0, vec![proto(Protocol::UDP), dport(VXLAN_PORT)]),
                to(gre, 0, vec![proto(Protocol::GRE)]),
                to(gtp, 0, vec![proto(Protocol::UDP), dport(GTPU_PORT)]),
                to(hairpin, 1, vec![]),
            ],
        )?;

        let egress = b.pipe(PipeCfg {
            name: EGRESS_PIPE.into(),
            domain: Domain::Egress,
            is_root: true,
            template: vec![(Field::Meta, FieldMatch::PerRule)],
            actions: vec![],
            monitor: None,
            fwd: Fwd::Port(port),
            fwd_miss: Fwd::Port(port),
        })?;
        b.entries(
            EGRESS_PIPE,
            vec![(
                egress,
                RuleSpec {
                    values: vec![(Field::Meta, META_ENCAP)],
                    actions: vec![Action::Encap(cfg.encap)],
                    ..RuleSpec::match_all()
                },
            )],
        )?;

        validate_miss_paths(port, &b.nodes, &[vxlan, gre, gtp, root], rss)?;

        Ok(Self {
            port,
            rss,
            hairpin,
            vxlan,
            gre,
            gtp,
            root,
            egress,
            nodes: b.nodes,
        })
    }

    /// The match stage for packets of tunnel type `tun`.
    ///
    /// # Errors
    ///
    /// Untunneled packets have no match stage.
    pub fn select_pipe(&self, tun: TunnelType) -> Result<PipeId> {
        match tun {
            TunnelType::Vxlan => Ok(self.vxlan),
            TunnelType::Gre => Ok(self.gre),
            TunnelType::GtpU => Ok(self.gtp),
            TunnelType::None => Err(NicflowError::NoInstallablePipe(tun)),
        }
    }

    /// The rule offloading the flow of `view` into its match stage.
    ///
    /// The rule matches every [`MATCH_FIELDS`] field the packet has;
    /// ports are wildcarded for inner protocols without them.
    pub fn flow_rule(
        &self,
        view: &PacketView,
        aging_secs: u32,
    ) -> Result<(PipeId, RuleSpec)> {
        let tun = view.tunnel_type();
        let pipe = self.select_pipe(tun)?;

        let values = MATCH_FIELDS
            .iter()
            .filter_map(|f| f.value(view, 0).map(|v| (*f, v)))
            .collect();

        let mut actions = vec![Action::SetMeta(META_ENCAP)];
        if !tun.inner_has_l2() {
            actions.push(Action::SetMacs { src: DECAP_MAC, dst: DECAP_MAC });
        }

        Ok((
            pipe,
            RuleSpec {
                priority: 0,
                values,
                actions,
                aging: Aging::Secs(aging_secs),
                fwd: None,
            },
        ))
    }

    pub fn nodes(&self) -> &BTreeMap<PipeId, PipeNode> {
        &self.nodes
    }

    /// Re-check the miss paths of the match stages.
    pub fn validate(&self) -> Result<()> {
        validate_miss_paths(
            self.port,
            &self.nodes,
            &[self.vxlan, self.gre, self.gtp],
            self.rss,
        )
    }
}

/// Build the topology of `port` on a shared engine.
pub fn build_port(
    ectx: &ExecCtx,
    engine: &Arc<dyn OffloadEngine>,
    cfg: &DataplaneCfg,
    port: PortId,
) -> Result<PortTopology> {
    engine.create_port(port, cfg.nr_queues)?;
    PortTopology::build(ectx, engine.as_ref(), cfg, port).inspect_err(|_| {
        let _ = engine.destroy_port(port);
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::soft::SoftEngine;

    fn built(cfg: &DataplaneCfg) -> (Arc<SoftEngine>, PortTopology) {
        let eng = Arc::new(SoftEngine::new(64));
        let dyn_eng: Arc<dyn OffloadEngine> = eng.clone();
        let topo = build_port(&ExecCtx::discard(), &dyn_eng, cfg, 0).unwrap();
        (eng, topo)
    }

    #[test]
    fn build_installs_fixed_entries() {
        let (eng, topo) = built(&DataplaneCfg::default());
        // rss, hairpin, 4 root entries, egress.
        assert_eq!(eng.num_rules(0), 7);
        assert_eq!(eng.num_pending(0, 0), 0);
        topo.validate().unwrap();

        let dump = eng.dump_port(0).unwrap();
        let names: Vec<_> =
            dump.pipes.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            [
                RSS_PIPE,
                HAIRPIN_PIPE,
                VXLAN_PIPE,
                GRE_PIPE,
                GTP_PIPE,
                ROOT_PIPE,
                EGRESS_PIPE
            ]
        );
        let root = &dump.pipes[5];
        assert!(root.is_root);
        assert_eq!(root.entries.len(), 4);
        assert_eq!(root.entries[3].priority, 1);
        assert_eq!(root.entries[3].fwd, HAIRPIN_PIPE);
        assert_eq!(dump.pipes[2].fwd_miss, RSS_PIPE);
    }

    #[test]
    fn hairpin_forwards_hits_to_peer() {
        let cfg = DataplaneCfg { hairpin: true, ..Default::default() };
        let (eng, _) = built(&cfg);
        let dump = eng.dump_port(0).unwrap();
        assert_eq!(dump.pipes[3].fwd, "port 1");
        assert_eq!(dump.pipes[3].fwd_miss, RSS_PIPE);
    }

    #[test]
    fn select_pipe_by_tunnel() {
        let (_, topo) = built(&DataplaneCfg::default());
        assert_eq!(topo.select_pipe(TunnelType::Vxlan).unwrap(), topo.vxlan);
        assert_eq!(topo.select_pipe(TunnelType::Gre).unwrap(), topo.gre);
        assert_eq!(topo.select_pipe(TunnelType::GtpU).unwrap(), topo.gtp);
        assert_eq!(
            topo.select_pipe(TunnelType::None).unwrap_err(),
            NicflowError::NoInstallablePipe(TunnelType::None)
        );
    }

    #[test]
    fn failed_entry_fails_bring_up() {
        let eng = Arc::new(SoftEngine::new(64));
        eng.fail_next_installs(1);
        let dyn_eng: Arc<dyn OffloadEngine> = eng.clone();
        let cfg = DataplaneCfg::default();
        let err =
            build_port(&ExecCtx::discard(), &dyn_eng, &cfg, 0).unwrap_err();
        assert!(matches!(
            err,
            NicflowError::PipeCreate { ref pipe, .. } if pipe == RSS_PIPE
        ));
        // The port was released.
        assert_eq!(
            eng.dump_port(0).unwrap_err(),
            NicflowError::PortNotFound(0)
        );
    }

    #[test]
    fn rejected_entry_mid_batch_fails_bring_up() {
        let eng = Arc::new(SoftEngine::new(3));
        let dyn_eng: Arc<dyn OffloadEngine> = eng.clone();
        // Capacity runs out inside the root batch.
        let cfg = DataplaneCfg::default();
        let err =
            build_port(&ExecCtx::discard(), &dyn_eng, &cfg, 0).unwrap_err();
        assert!(matches!(
            err,
            NicflowError::PipeCreate { ref pipe, .. } if pipe == ROOT_PIPE
        ));
    }

    fn node(name: &str, fwd_miss: Fwd) -> PipeNode {
        PipeNode { name: name.into(), fwd: Fwd::Drop, fwd_miss }
    }

    #[test]
    fn miss_paths() {
        let id = |idx| PipeId { port: 0, idx };
        let mut nodes = BTreeMap::new();
        nodes.insert(id(0), node(RSS_PIPE, Fwd::Drop));
        nodes.insert(id(1), node(HAIRPIN_PIPE, Fwd::Pipe(id(0))));
        nodes.insert(id(2), node(VXLAN_PIPE, Fwd::Pipe(id(1))));
        nodes.insert(id(3), node(GRE_PIPE, Fwd::Drop));
        nodes.insert(id(4), node("A", Fwd::Pipe(id(5))));
        nodes.insert(id(5), node("B", Fwd::Pipe(id(4))));

        // Transitively through the hairpin stage.
        validate_miss_paths(0, &nodes, &[id(2)], id(0)).unwrap();

        let err = validate_miss_paths(0, &nodes, &[id(2), id(3)], id(0))
            .unwrap_err();
        assert!(matches!(
            err,
            NicflowError::PipeCreate { ref pipe, .. } if pipe == GRE_PIPE
        ));

        let err = validate_miss_paths(0, &nodes, &[id(4)], id(0)).unwrap_err();
        assert!(err.to_string().contains("loops"), "{err}");
    }
}
