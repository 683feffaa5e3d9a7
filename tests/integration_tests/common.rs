// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Test rig: any number of stacks on a shared broadcast medium with a
//! hand-cranked clock, an optional frame filter and a wire log.

use lontalk_stack_rs::{
    app::AppIndication,
    cfg::{
        config::{AddressCfg, Buffers, Config, DomainCfg, Identity, Protocol, TxParamsCfg},
        enums::AuthTypeCfg,
    },
    models::{
        npdu::{Npdu, PduClass},
        tspdu::{RawTspduHeader, TspduType},
    },
    network::LinkFrame,
    node::persist::MemoryNvm,
    stack::{NullLed, Stack},
    timer::ManualClock,
};

/// Quiet period after power-up during which the engine sends nothing.
pub const SETTLE_MS: u32 = 2100;

pub struct WireEvent {
    pub at: u32,
    pub from: usize,
    pub frame: LinkFrame,
}

impl WireEvent {
    pub fn npdu(&self) -> Npdu {
        Npdu::decode(&self.frame.npdu).expect("wire log holds decodable frames")
    }

    /// (pdu class, tspdu type) of a transport/session frame.
    pub fn tspdu_kind(&self) -> Option<(PduClass, TspduType)> {
        let npdu = self.npdu();
        match npdu.pdu_class {
            PduClass::Tpdu | PduClass::Spdu => {
                let hdr = RawTspduHeader::from_raw(npdu.payload[0]);
                hdr.msg_type().map(|t| (npdu.pdu_class, t))
            },
            _ => None,
        }
    }
}

type DropFilter = Box<dyn FnMut(usize, &LinkFrame) -> bool>;

pub struct Net {
    pub clock: ManualClock,
    pub stacks: Vec<Stack>,
    pub wire_log: Vec<WireEvent>,
    pub drop_filter: Option<DropFilter>,
    now: u32,
}

impl Net {
    pub fn new(configs: &[Config]) -> Self {
        let clock = ManualClock::new();
        let stacks = configs
            .iter()
            .map(|cfg| {
                Stack::new(
                    cfg,
                    Box::new(clock.clone()),
                    Box::new(MemoryNvm::default()),
                    Box::new(NullLed),
                )
                .expect("stack construction")
            })
            .collect();
        Net { clock, stacks, wire_log: Vec::new(), drop_filter: None, now: 0 }
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    /// One millisecond: service every stack, then shuttle frames across
    /// the shared medium.
    pub fn tick(&mut self) {
        self.clock.advance(1);
        self.now += 1;
        for s in &mut self.stacks {
            s.service();
        }
        let n = self.stacks.len();
        let at = self.now();
        for i in 0..n {
            while let Some(frame) = self.stacks[i].link_out_pop() {
                self.wire_log.push(WireEvent { at, from: i, frame: frame.clone() });
                let dropped = self
                    .drop_filter
                    .as_mut()
                    .is_some_and(|f| f(i, &frame));
                if dropped {
                    continue;
                }
                for (j, peer) in self.stacks.iter_mut().enumerate() {
                    if j != i {
                        peer.link_in_push(frame.clone());
                    }
                }
            }
        }
    }

    pub fn run(&mut self, ms: u32) {
        for _ in 0..ms {
            self.tick();
        }
    }

    /// Run out the post-reset quiet period.
    pub fn settle(&mut self) {
        self.run(SETTLE_MS);
    }

    /// Run for `ms`, draining `node`'s application every millisecond the
    /// way a live application would. Keeping the input queue moving is
    /// what lets completions through on small buffer configurations.
    pub fn run_collecting(&mut self, ms: u32, node: usize) -> Vec<AppIndication> {
        let mut out = Vec::new();
        for _ in 0..ms {
            self.tick();
            out.extend(self.drain(node));
        }
        out
    }

    /// Collect everything a node's application currently sees.
    pub fn drain(&mut self, node: usize) -> Vec<AppIndication> {
        let mut out = Vec::new();
        while let Some(event) = self.stacks[node].receive() {
            out.push(event);
        }
        out
    }

    /// Wire events of a given transport/session kind sent by `from`.
    pub fn frames_of_kind(&self, from: usize, kind: (PduClass, TspduType)) -> Vec<&WireEvent> {
        self.wire_log
            .iter()
            .filter(|e| e.from == from && e.tspdu_kind() == Some(kind))
            .collect()
    }
}

/// A node on subnet 1 with the shared test domain and key.
pub fn node_cfg(uid: u8, node: u8) -> Config {
    Config {
        identity: Identity {
            unique_node_id: format!("0a0b0c0d0e{uid:02x}"),
            program_id: format!("node-{node:02}"),
            location: String::new(),
        },
        domains: vec![DomainCfg {
            id: "4c".to_string(),
            subnet: 1,
            node,
            key: "a1a2a3a4a5a6".to_string(),
            auth_type: AuthTypeCfg::Standard,
        }],
        addresses: Vec::new(),
        nvs: Vec::new(),
        buffers: Buffers::default(),
        protocol: Protocol { rng_seed: uid as u64 + 1, ..Protocol::default() },
    }
}

/// Add group membership to a node configuration.
pub fn join_group(cfg: &mut Config, group: u8, size: u8, member: u8, rcv_timer: u8) {
    cfg.addresses.push(AddressCfg::Group {
        domain_index: 0,
        group,
        size,
        member,
        rcv_timer,
        tx: TxParamsCfg::default(),
    });
}
