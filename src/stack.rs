// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! One protocol stack instance: all layer state, the bounded queues that
//! join the layers, and the cooperative `service` loop.

use anyhow::Result;
use rand::{SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

use crate::{
    app::{AppIndication, AppState, IndicationKind, MsgOut},
    cfg::config::Config,
    network::{LinkFrame, NwSendParam},
    node::{
        ConfigMode, LcsError, NodeState, ResetCause,
        address_book::{decode_buffer_cnt, decode_buffer_size},
        persist::{Eeprom, Nvm},
        stats::Stats,
    },
    queue::Queue,
    timer::{Clock, MsTimer},
    transport::{
        TS_RESET_DELAY_MS, TsaReceiveParam, TsaSendParam,
        records::{ReceiveRecord, TransmitRecord},
        tid::TidAllocator,
    },
};

const LED_TIMER_MS: u32 = 1000;
const CHECKSUM_TIMER_MS: u32 = 1000;

/// Service LED collaborator; flashed while the node is unconfigured.
pub trait ServiceLed {
    fn set(&mut self, on: bool);
}

/// LED that goes nowhere. The default collaborator.
#[derive(Debug, Default)]
pub struct NullLed;

impl ServiceLed for NullLed {
    fn set(&mut self, _on: bool) {}
}

/// The nine bounded queues of the pipeline plus the link-boundary queues.
#[derive(Debug)]
pub(crate) struct Queues {
    pub app_out: Queue<MsgOut>,
    pub app_out_pri: Queue<MsgOut>,
    pub app_in: Queue<AppIndication>,
    pub tsa_in: Queue<TsaReceiveParam>,
    pub tsa_out: Queue<TsaSendParam>,
    pub tsa_out_pri: Queue<TsaSendParam>,
    pub tsa_resp: Queue<TsaSendParam>,
    pub nw_out: Queue<NwSendParam>,
    pub nw_out_pri: Queue<NwSendParam>,
    pub lk_in: Queue<LinkFrame>,
    pub lk_out: Queue<LinkFrame>,
    pub lk_out_pri: Queue<LinkFrame>,
}

/// Logical buffer sizes decoded from the read-only data; the engine checks
/// PDU sizes against these the way the wire protocol mandates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferLimits {
    pub app_in_buf: usize,
    pub app_out_buf: usize,
    pub nw_out_buf: usize,
}

/// Transport/session/authentication shared state.
#[derive(Debug, Default)]
pub(crate) struct TsaState {
    pub xmit: TransmitRecord,
    pub pri_xmit: TransmitRecord,
    pub recv: Vec<ReceiveRecord>,
    pub req_id: u16,
    pub prev_challenge: [u8; 8],
    pub tid_pri: TidAllocator,
    pub tid_non: TidAllocator,
    pub ts_delay: MsTimer,
}

impl TsaState {
    pub fn xmit(&self, priority: bool) -> &TransmitRecord {
        if priority { &self.pri_xmit } else { &self.xmit }
    }

    pub fn xmit_mut(&mut self, priority: bool) -> &mut TransmitRecord {
        if priority { &mut self.pri_xmit } else { &mut self.xmit }
    }

    pub fn tid(&self, priority: bool) -> &TidAllocator {
        if priority { &self.tid_pri } else { &self.tid_non }
    }

    pub fn tid_mut(&mut self, priority: bool) -> &mut TidAllocator {
        if priority { &mut self.tid_pri } else { &mut self.tid_non }
    }

    /// Request ids wrap but never take the value 0, so a stale id can
    /// never match a fresh record.
    pub fn next_req_id(&mut self) -> u16 {
        self.req_id = self.req_id.wrapping_add(1);
        if self.req_id == 0 {
            self.req_id = 1;
        }
        self.req_id
    }
}

/// Engine knobs fixed at startup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EngineOptions {
    pub group_size_compatibility: bool,
}

/// One protocol stack. All state is owned; run any number of stacks side
/// by side by creating more of them.
pub struct Stack {
    pub(crate) eep: Eeprom,
    default_eep: Eeprom,
    pub(crate) stats: Stats,
    pub(crate) q: Queues,
    pub(crate) limits: BufferLimits,
    pub(crate) tsa: TsaState,
    pub(crate) app: AppState,
    pub(crate) opts: EngineOptions,
    pub(crate) rng: StdRng,
    clock: Box<dyn Clock>,
    pub(crate) nvm: Box<dyn Nvm>,
    led: Box<dyn ServiceLed>,
    pub(crate) now: u32,
    pub(crate) reset_requested: bool,
    pub(crate) reset_cause: ResetCause,
    pub(crate) proxy_wait: MsTimer,
    led_timer: MsTimer,
    checksum_timer: MsTimer,
    led_on: bool,
}

impl Stack {
    /// Build a stack from its configuration and collaborators. Persistent
    /// state is read back from the NVM when a valid image exists; otherwise
    /// the configuration defaults apply.
    pub fn new(
        config: &Config,
        clock: Box<dyn Clock>,
        mut nvm: Box<dyn Nvm>,
        led: Box<dyn ServiceLed>,
    ) -> Result<Self> {
        let default_eep = config.to_eeprom()?;
        let eep = match nvm.read().and_then(|image| Eeprom::from_image(&image).ok()) {
            Some(saved) => {
                info!("booting from the persisted image");
                saved
            },
            None => default_eep.clone(),
        };

        let rng = if config.protocol.rng_seed != 0 {
            StdRng::seed_from_u64(config.protocol.rng_seed)
        } else {
            StdRng::from_os_rng()
        };

        let ro = &eep.read_only;
        let app_in_buf = decode_buffer_size(ro.app_in_buf_size) as usize;
        let app_out_buf = decode_buffer_size(ro.app_out_buf_size) as usize;
        let nw_out_buf = decode_buffer_size(ro.nw_out_buf_size) as usize;
        let app_in_cnt = decode_buffer_cnt(ro.app_in_buf_cnt) as usize;
        let app_out_cnt = decode_buffer_cnt(ro.app_out_buf_cnt) as usize;
        let app_out_pri_cnt = decode_buffer_cnt(ro.app_out_pri_buf_cnt) as usize;
        let nw_out_cnt = decode_buffer_cnt(ro.nw_out_buf_cnt) as usize;
        let nw_out_pri_cnt = decode_buffer_cnt(ro.nw_out_pri_buf_cnt) as usize;
        let nw_in_cnt = decode_buffer_cnt(ro.nw_in_buf_cnt) as usize;

        let q = Queues {
            app_out: Queue::new(app_out_cnt.max(1)),
            app_out_pri: Queue::new(app_out_pri_cnt.max(1)),
            app_in: Queue::new(app_in_cnt.max(1)),
            tsa_in: Queue::new(app_in_cnt.max(1)),
            tsa_out: Queue::new(app_out_cnt.max(1)),
            tsa_out_pri: Queue::new(app_out_pri_cnt.max(1)),
            tsa_resp: Queue::new(app_out_cnt.max(1)),
            nw_out: Queue::new(nw_out_cnt.max(1)),
            nw_out_pri: Queue::new(nw_out_pri_cnt.max(1)),
            lk_in: Queue::new(nw_in_cnt.max(1)),
            lk_out: Queue::new(nw_out_cnt.max(1)),
            lk_out_pri: Queue::new(nw_out_pri_cnt.max(1)),
        };

        let mut recv = Vec::new();
        recv.resize_with(ro.receive_trans_cnt as usize, ReceiveRecord::default);

        let mut stack = Stack {
            eep,
            default_eep,
            stats: Stats::default(),
            q,
            limits: BufferLimits { app_in_buf, app_out_buf, nw_out_buf },
            tsa: TsaState { recv, ..TsaState::default() },
            app: AppState::default(),
            opts: EngineOptions {
                group_size_compatibility: config.protocol.group_size_compatibility,
            },
            rng,
            clock,
            nvm,
            led,
            now: 0,
            reset_requested: false,
            reset_cause: ResetCause::PowerUp,
            proxy_wait: MsTimer::default(),
            led_timer: MsTimer::default(),
            checksum_timer: MsTimer::default(),
            led_on: false,
        };
        stack.now = stack.clock.now_ms();
        stack.node_reset(true);
        stack.eep.config_checksum = stack.eep.compute_config_checksum();
        stack.led_timer.set(stack.now, LED_TIMER_MS);
        stack.checksum_timer.set(stack.now, CHECKSUM_TIMER_MS);
        Ok(stack)
    }

    /// One cooperative scheduling step: every layer's send and receive
    /// routine runs once, in dependency order. Call at roughly millisecond
    /// cadence.
    pub fn service(&mut self) {
        self.now = self.clock.now_ms();

        if self.reset_requested {
            self.node_reset(false);
            return;
        }

        self.app_send_step();
        self.sn_send_step();
        self.tp_send_step();
        self.auth_send_step();
        self.nw_send_step();

        self.nw_receive_step();
        self.auth_receive_step();
        self.tp_receive_step();
        self.sn_receive_step();
        self.app_receive_step();

        let now = self.now;
        if self.led_timer.expired(now) {
            if self.eep.read_only.node_state == NodeState::ApplUncnfg {
                self.led_on = !self.led_on;
                self.led.set(self.led_on);
            }
            self.led_timer.set(now, LED_TIMER_MS);
        }

        if self.checksum_timer.expired(now) {
            if self.node_configured()
                && self.eep.config_checksum != self.eep.compute_config_checksum()
            {
                // Corrupted configuration: go unconfigured and start over.
                warn!("config checksum mismatch, going unconfigured");
                self.eep.read_only.node_state = NodeState::ApplUncnfg;
                self.app.mode = ConfigMode::Online;
                self.enqueue_event(IndicationKind::Offline);
                self.reset_requested = true;
                self.reset_cause = ResetCause::Software;
                self.record_error(LcsError::ConfigChecksumError);
            }
            self.checksum_timer.set(now, CHECKSUM_TIMER_MS);
        }
    }

    /// Reinitialize every layer. Configuration survives; queue contents,
    /// transaction state and statistics do not.
    pub(crate) fn node_reset(&mut self, first_reset: bool) {
        debug!(first_reset, cause = ?self.reset_cause, "node reset");
        self.stats.clear();

        // A soft-offline node comes back online; an unconfigured node comes
        // back offline.
        if self.eep.read_only.node_state == NodeState::CnfgOnline
            && self.app.mode == ConfigMode::Offline
        {
            self.app.mode = ConfigMode::Online;
        }
        if self.node_unconfigured() {
            self.app.mode = ConfigMode::Offline;
        }

        self.q.app_out.clear();
        self.q.app_out_pri.clear();
        self.q.app_in.clear();
        self.q.tsa_in.clear();
        self.q.tsa_out.clear();
        self.q.tsa_out_pri.clear();
        self.q.tsa_resp.clear();
        self.q.nw_out.clear();
        self.q.nw_out_pri.clear();
        self.q.lk_in.clear();
        self.q.lk_out.clear();
        self.q.lk_out_pri.clear();

        self.app.pending_out = None;
        self.app.pending_resp = None;

        self.tsa.xmit.release();
        self.tsa.pri_xmit.release();
        for rec in &mut self.tsa.recv {
            rec.release();
        }
        self.tsa.req_id = 0;
        self.tsa.tid_pri.reset();
        self.tsa.tid_non.reset();
        if first_reset {
            self.tsa.prev_challenge = [0; 8];
        }

        if matches!(self.reset_cause, ResetCause::External | ResetCause::PowerUp) {
            // Quiet period so our fresh tids cannot be mistaken for
            // duplicates by nodes that still hold old receive records.
            self.tsa.ts_delay.set(self.now, TS_RESET_DELAY_MS);
        }
        self.proxy_wait.stop();
        self.reset_requested = false;
    }

    // ----------------------------------------------------------------- //
    // Link boundary
    // ----------------------------------------------------------------- //

    /// Pull the next outbound frame for the link collaborator, priority
    /// traffic first.
    pub fn link_out_pop(&mut self) -> Option<LinkFrame> {
        if let Some(frame) = self.q.lk_out_pri.pop() {
            return Some(frame);
        }
        self.q.lk_out.pop()
    }

    /// Hand a validated inbound frame to the stack. Returns false when the
    /// inbound queue is full (the frame is lost, as it would be on a full
    /// receive buffer).
    pub fn link_in_push(&mut self, frame: LinkFrame) -> bool {
        if self.q.lk_in.is_full() {
            self.stats.incr(crate::node::stats::Stat::Missed);
            return false;
        }
        self.q.lk_in.push(frame);
        true
    }

    // ----------------------------------------------------------------- //
    // Node state helpers
    // ----------------------------------------------------------------- //

    pub fn node_configured(&self) -> bool {
        matches!(
            self.eep.read_only.node_state,
            NodeState::CnfgOnline | NodeState::CnfgOffline
        )
    }

    pub fn node_unconfigured(&self) -> bool {
        matches!(
            self.eep.read_only.node_state,
            NodeState::ApplUncnfg | NodeState::NoApplUncnfg
        )
    }

    pub fn app_pgm_runs(&self) -> bool {
        match self.eep.read_only.node_state {
            NodeState::CnfgOnline => self.app.mode == ConfigMode::Online,
            NodeState::ApplUncnfg => {
                self.eep.read_only.run_when_unconf && self.app.mode == ConfigMode::Online
            },
            _ => false,
        }
    }

    pub fn node_state(&self) -> NodeState {
        self.eep.read_only.node_state
    }

    pub fn error_log(&self) -> LcsError {
        self.eep.error_log
    }

    pub fn statistics(&self) -> &Stats {
        &self.stats
    }

    /// Source subnet/node of this stack in the given domain.
    pub fn domain_address(&self, index: u8) -> Option<(u8, u8)> {
        self.eep
            .book
            .domain(index)
            .filter(|d| !d.invalid)
            .map(|d| (d.subnet, d.node))
    }

    // ----------------------------------------------------------------- //
    // Persistence
    // ----------------------------------------------------------------- //

    /// Record a rare error durably, without rewriting an unchanged byte.
    pub(crate) fn record_error(&mut self, err: LcsError) {
        if self.eep.error_log != err {
            self.eep.error_log = err;
            self.write_nvm();
        }
    }

    pub(crate) fn write_nvm(&mut self) {
        let image = self.eep.to_image();
        self.nvm.write(&image);
    }

    /// Restore the compile-time/configured defaults (used when the
    /// persisted image is abandoned).
    pub fn restore_defaults(&mut self) {
        self.eep = self.default_eep.clone();
        self.eep.config_checksum = self.eep.compute_config_checksum();
        self.reset_requested = true;
        self.reset_cause = ResetCause::Software;
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("node_state", &self.eep.read_only.node_state)
            .field("unique_node_id", &hex::encode(self.eep.read_only.unique_node_id))
            .finish()
    }
}
