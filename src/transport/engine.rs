// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The transaction engine: transport and session send/receive cycles and
//! the authentication challenge/reply exchange.
//!
//! Everything here runs inside `Stack::service`, one step per layer per
//! cycle. A step either finishes its work for one item, leaves the item on
//! its source queue for the next cycle (backpressure), or fails the item
//! with a completion event. The queues are the only synchronization.

use tracing::{debug, trace, warn};

use crate::{
    app::tags,
    models::{
        addressing::{
            AddrMode, AltKey, DestAddr, DestinationAddress, FLEX_DOMAIN, GroupAddress,
            MAX_GROUP_MEMBER, MulticastAckAddress, ServiceType, SourceAddress,
        },
        apdu::Apdu,
        authpdu::{AuthFmt, AuthPdu, AuthPduType},
        npdu::PduClass,
        tspdu::{self, RawTspduHeader, ReminderBody, TspduType},
    },
    network::NwSendParam,
    node::{LcsError, address_book::decode_rpt_timer, address_book::decode_tx_timer,
        stats::Stat},
    stack::Stack,
    transport::{ALT_PATH_COUNT, NGTIMER_SPCL_VAL, OutAddr, TsaSendParam},
    transport::records::{RecordOwner, TransactionState},
    transport::tid::TidStatus,
};

/// Which half of the engine a shared routine is working for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layer {
    Transport,
    Session,
}

impl Layer {
    fn owner(self) -> RecordOwner {
        match self {
            Layer::Transport => RecordOwner::Transport,
            Layer::Session => RecordOwner::Session,
        }
    }

    fn pdu_class(self) -> PduClass {
        match self {
            Layer::Transport => PduClass::Tpdu,
            Layer::Session => PduClass::Spdu,
        }
    }
}

impl Stack {
    /// No transport/session traffic during the post-reset quiet period.
    fn send_blocked(&mut self) -> bool {
        let now = self.now;
        self.tsa.ts_delay.running(now)
    }

    // ================================================================= //
    // Transport send cycle
    // ================================================================= //

    pub(crate) fn tp_send_step(&mut self) {
        if self.send_blocked() {
            return;
        }
        let now = self.now;

        if self.tsa.pri_xmit.owner == RecordOwner::Transport
            && !self.tsa.pri_xmit.xmit_timer.running(now)
        {
            self.xmit_timer_expiration(Layer::Transport, true);
        } else if self.tsa.pri_xmit.owner == RecordOwner::Unused
            && !self.q.tsa_out_pri.is_empty()
            && !self.q.nw_out_pri.is_full()
        {
            self.send_new_msg(Layer::Transport, true);
        } else if self.tsa.xmit.owner == RecordOwner::Transport
            && !self.tsa.xmit.xmit_timer.running(now)
        {
            self.xmit_timer_expiration(Layer::Transport, false);
        } else if self.tsa.xmit.owner == RecordOwner::Unused
            && !self.q.tsa_out.is_empty()
            && !self.q.nw_out.is_full()
        {
            self.send_new_msg(Layer::Transport, false);
        }
    }

    // ================================================================= //
    // Session send cycle
    // ================================================================= //

    pub(crate) fn sn_send_step(&mut self) {
        if self.send_blocked() {
            return;
        }

        // Responses go out first; they are not transactions of our own.
        if !self.q.tsa_resp.is_empty() && !self.q.nw_out.is_full() {
            self.send_pending_response();
            return;
        }

        let now = self.now;
        if self.tsa.pri_xmit.owner == RecordOwner::Session
            && !self.tsa.pri_xmit.xmit_timer.running(now)
        {
            self.xmit_timer_expiration(Layer::Session, true);
        } else if self.tsa.pri_xmit.owner == RecordOwner::Unused
            && !self.q.tsa_out_pri.is_empty()
            && !self.q.nw_out_pri.is_full()
        {
            self.send_new_msg(Layer::Session, true);
        } else if self.tsa.xmit.owner == RecordOwner::Session
            && !self.tsa.xmit.xmit_timer.running(now)
        {
            self.xmit_timer_expiration(Layer::Session, false);
        } else if self.tsa.xmit.owner == RecordOwner::Unused
            && !self.q.tsa_out.is_empty()
            && !self.q.nw_out.is_full()
        {
            self.send_new_msg(Layer::Session, false);
        }
    }

    fn send_pending_response(&mut self) {
        let param = self.q.tsa_resp.head().clone();
        if param.service != ServiceType::Response {
            debug!("sn: response queue is only for responses");
            self.q.tsa_resp.dequeue();
            return;
        }
        let Some(i) = self.find_rr(param.req_id) else {
            debug!(req_id = param.req_id, "sn: discarding stale or duplicate response");
            self.q.tsa_resp.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        };
        let rec = &mut self.tsa.recv[i];
        rec.response = param.apdu.to_bytes();
        rec.state = TransactionState::Responded;
        self.sn_send_response(i, param.null_response, param.flex_response);
        self.q.tsa_resp.dequeue();
    }

    // ================================================================= //
    // Authentication cycle
    // ================================================================= //

    /// Re-issue challenges that could not go out earlier for lack of a
    /// network buffer.
    pub(crate) fn auth_send_step(&mut self) {
        for i in 0..self.tsa.recv.len() {
            let rec = &self.tsa.recv[i];
            if rec.in_use() && rec.need_auth && rec.state == TransactionState::JustReceived {
                self.initiate_challenge(i);
            }
        }
    }

    pub(crate) fn auth_receive_step(&mut self) {
        if self.q.tsa_in.is_empty() {
            return;
        }
        if self.q.tsa_in.head().pdu_class != PduClass::AuthPdu {
            return;
        }
        let pdu = match AuthPdu::decode(&self.q.tsa_in.head().pdu) {
            Ok(pdu) => pdu,
            Err(err) => {
                warn!(%err, "auth: undecodable pdu");
                self.record_error(LcsError::UnknownPdu);
                self.q.tsa_in.dequeue();
                return;
            },
        };
        if pdu.msg_type.is_challenge() {
            self.send_reply_to_challenge(&pdu, pdu.msg_type.is_oma());
        } else {
            self.process_reply(&pdu, pdu.msg_type.is_oma());
        }
    }

    // ================================================================= //
    // Transport / session receive cycles
    // ================================================================= //

    pub(crate) fn tp_receive_step(&mut self) {
        self.age_receive_timers(RecordOwner::Transport);
        let Some((hdr, _)) = self.peek_tspdu(PduClass::Tpdu) else {
            return;
        };
        match hdr.msg_type() {
            Some(TspduType::AckOrResponse) => self.tp_receive_ack(&hdr),
            Some(TspduType::AckdOrRequest) | Some(TspduType::UnackRpt) => {
                self.receive_new_msg(Layer::Transport, &hdr);
            },
            Some(TspduType::Reminder) | Some(TspduType::RemMsg) => {
                self.receive_rem(Layer::Transport, &hdr);
            },
            None => {
                warn!("tp: unknown tpdu type");
                self.q.tsa_in.dequeue();
                self.record_error(LcsError::UnknownPdu);
            },
        }
    }

    pub(crate) fn sn_receive_step(&mut self) {
        self.age_receive_timers(RecordOwner::Session);
        let Some((hdr, _)) = self.peek_tspdu(PduClass::Spdu) else {
            return;
        };
        match hdr.msg_type() {
            Some(TspduType::AckOrResponse) => self.sn_receive_response(&hdr),
            Some(TspduType::AckdOrRequest) => self.receive_new_msg(Layer::Session, &hdr),
            Some(TspduType::Reminder) | Some(TspduType::RemMsg) => {
                self.receive_rem(Layer::Session, &hdr);
            },
            Some(TspduType::UnackRpt) | None => {
                warn!("sn: unknown spdu type");
                self.record_error(LcsError::UnknownPdu);
                self.q.tsa_in.dequeue();
            },
        }
    }

    fn age_receive_timers(&mut self, owner: RecordOwner) {
        let now = self.now;
        for rec in &mut self.tsa.recv {
            if rec.owner == owner && rec.recv_timer.expired(now) {
                trace!("receive timer expired, releasing record");
                rec.release();
            }
        }
    }

    /// Peek the head of the inbound queue if it is a TPDU/SPDU of `class`.
    fn peek_tspdu(&mut self, class: PduClass) -> Option<(RawTspduHeader, usize)> {
        if self.q.tsa_in.is_empty() {
            return None;
        }
        let head = self.q.tsa_in.head();
        if head.pdu_class != class {
            return None;
        }
        if head.pdu.is_empty() {
            warn!("tsa: illegal pdu size");
            self.q.tsa_in.dequeue();
            return None;
        }
        let head = self.q.tsa_in.head();
        Some((RawTspduHeader::from_raw(head.pdu[0]), head.pdu.len()))
    }

    // ================================================================= //
    // Completion / termination
    // ================================================================= //

    /// Deliver a completion event for the head of the outbound queue and
    /// retire it. Returns false (and leaves everything untouched) when the
    /// application input queue is full.
    fn send_completion(&mut self, priority: bool, success: bool) -> bool {
        if self.q.app_in.is_full() {
            return false;
        }
        let param = {
            let q = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
            q.head().clone()
        };
        self.q.app_in.push(crate::app::AppIndication {
            kind: crate::app::IndicationKind::Completion,
            success,
            tag: param.tag,
            proxy: param.proxy,
            proxy_done: param.proxy_done,
            proxy_count: param.proxy_count,
            ..crate::app::AppIndication::default()
        });
        if priority {
            self.q.tsa_out_pri.dequeue();
        } else {
            self.q.tsa_out.dequeue();
        }
        true
    }

    /// Retire the transaction in progress and tell the application how it
    /// went. Nothing happens if the completion cannot be delivered yet.
    fn terminate_trans(&mut self, priority: bool) {
        if self.q.app_in.is_full() {
            return;
        }
        let service = {
            let q = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
            q.head().service
        };
        let rec = self.tsa.xmit(priority);
        let success = service == ServiceType::UnackRpt
            || rec.dest_count == rec.ack_count
            || (rec.dest.mode() == AddrMode::Broadcast && rec.ack_count >= 1);
        if !success {
            self.stats.incr(Stat::TxFailure);
        }
        self.tsa.tid_mut(priority).trans_done();
        self.tsa.xmit_mut(priority).release();
        debug!(priority, success, "terminated transaction");
        self.send_completion(priority, success);
    }

    // ================================================================= //
    // Outbound: new transactions
    // ================================================================= //

    fn send_new_msg(&mut self, layer: Layer, priority: bool) {
        let param = {
            let q = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
            q.head().clone()
        };

        // Only pick up work that belongs to this layer.
        match layer {
            Layer::Transport => {
                if !matches!(param.service, ServiceType::Ackd | ServiceType::UnackRpt) {
                    return;
                }
                if tags::is_nv_last_tag(param.tag) {
                    // Closes a grouped NV operation; nothing to transmit.
                    self.send_completion(priority, true);
                    return;
                }
            },
            Layer::Session => {
                if param.service != ServiceType::Request {
                    return;
                }
            },
        }

        // Group-size sanity. Huge groups (size 0) may only use unackd
        // services; sizes out of range can never complete.
        if let OutAddr::Group { size, .. } = param.dest {
            if size == 0 && param.service != ServiceType::UnackRpt {
                self.send_completion(priority, false);
                return;
            }
            let bad = if self.opts.group_size_compatibility {
                size == 1 || size > MAX_GROUP_MEMBER + 1
            } else {
                size > MAX_GROUP_MEMBER
            };
            if size != 0 && bad {
                self.send_completion(priority, false);
                return;
            }
        }

        // The APDU plus one header byte must fit the network buffer.
        if param.apdu.size() + 1 > self.limits.nw_out_buf {
            self.send_completion(priority, false);
            return;
        }

        let dest_addr = match param.dest {
            OutAddr::Unbound => {
                self.send_completion(priority, false);
                return;
            },
            OutAddr::SubnetNode { subnet, node, .. } => {
                DestAddr::SubnetNode(crate::models::addressing::SubnetNode::new(subnet, node))
            },
            OutAddr::UniqueId { subnet, unique_id, .. } => DestAddr::UniqueId { subnet, unique_id },
            OutAddr::Group { group, .. } => DestAddr::Multicast { group },
            OutAddr::Broadcast { subnet, .. } => DestAddr::Broadcast { subnet },
            OutAddr::Turnaround { .. } => DestAddr::Turnaround,
        };
        let nw_dest = DestinationAddress { dmn: param.dmn, addr: dest_addr };

        let tx = param.dest.tx_params();
        let tx_timer = decode_tx_timer(tx.tx_timer, tx.long_timer);
        let rpt_timer = decode_rpt_timer(tx.rpt_timer);
        let retry_count = tx.retry;

        let now = self.now;
        let tid = match self.tsa.tid_mut(priority).new_tid(now, &nw_dest) {
            Ok(tid) => tid,
            Err(_) => return, // try again next cycle
        };

        let dest_count = match param.dest {
            OutAddr::Group { size, group, .. } => {
                let mut count = size.saturating_sub(1);
                if !self.opts.group_size_compatibility
                    && self
                        .eep
                        .book
                        .is_group_member(param.dmn.index, group)
                        .is_none()
                {
                    // Not a member: the declared size is the true size.
                    count = size;
                }
                if count == 0 {
                    debug!("group size incorrect, assuming one destination");
                    1
                } else {
                    count
                }
            },
            _ => 1,
        };

        {
            let rec = self.tsa.xmit_mut(priority);
            rec.owner = layer.owner();
            rec.dest = nw_dest;
            rec.ack_received = [false; 64];
            rec.trans_num = tid;
            rec.dest_count = dest_count;
            rec.retries_left = retry_count;
            rec.ack_count = 0;
            rec.apdu = param.apdu.to_bytes();
            rec.auth = param.auth;
            rec.xmit_timer_value =
                if param.service == ServiceType::UnackRpt { rpt_timer } else { tx_timer };
            if param.proxy {
                rec.tx_timer_delta_last = param.tx_timer_delta_last;
                rec.alt_key = param.alt_key;
            } else {
                rec.tx_timer_delta_last = 0;
                rec.alt_key = AltKey::default();
            }
        }

        // Proxy hops reuse the transaction number of the incoming leg so
        // duplicate detection spans the whole chain.
        if param.proxy && param.tx_inherit {
            if let Some(rr) = self.find_rr_any(param.tag as u16) {
                let inherited = self.tsa.recv[rr].trans_num;
                self.tsa.xmit_mut(priority).trans_num = inherited;
                self.tsa.tid_mut(priority).override_tid(inherited);
            }
        }

        let msg_type = match (layer, param.service) {
            (_, ServiceType::UnackRpt) => TspduType::UnackRpt,
            (Layer::Transport, _) => TspduType::AckdOrRequest,
            (Layer::Session, _) => TspduType::AckdOrRequest,
        };
        let rec = self.tsa.xmit(priority);
        let mut pdu = Vec::with_capacity(1 + rec.apdu.len());
        pdu.push(tspdu::header(param.auth, msg_type, rec.trans_num));
        pdu.extend_from_slice(&rec.apdu);

        let delta_bl = match (&param.service, rec.dest.mode()) {
            (ServiceType::UnackRpt, _) => rec.retries_left,
            (_, AddrMode::Broadcast) => match param.dest {
                OutAddr::Broadcast { backlog, .. } if backlog != 0 => backlog,
                _ => 15,
            },
            (_, AddrMode::Multicast) => rec.dest_count,
            _ => 1,
        };

        let alt_path = if param.alt_path_override {
            param.alt_path
        } else {
            param.service != ServiceType::UnackRpt && retry_count <= ALT_PATH_COUNT
        };

        let send = NwSendParam {
            dest: rec.dest,
            pdu_class: layer.pdu_class(),
            delta_bl,
            alt_path,
            drop_if_unconfigured: true,
            tag: 0,
            pdu,
        };
        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        nw.push(send);

        let timer_value = self.tsa.xmit(priority).xmit_timer_value;
        self.tsa.xmit_mut(priority).xmit_timer.set(now, timer_value);
        trace!(?layer, priority, tid, "new transaction on the wire");
    }

    // ================================================================= //
    // Outbound: retries and termination on timer expiry
    // ================================================================= //

    fn xmit_timer_expiration(&mut self, layer: Layer, priority: bool) {
        let param = {
            let q = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
            q.head().clone()
        };

        {
            let rec = self.tsa.xmit(priority);
            if rec.retries_left == 0
                || rec.dest_count == rec.ack_count
                || (rec.dest.mode() == AddrMode::Broadcast && rec.ack_count >= 1)
            {
                self.terminate_trans(priority);
                return;
            }
        }

        let now = self.now;
        let nw_full = if priority { self.q.nw_out_pri.is_full() } else { self.q.nw_out.is_full() };
        if nw_full {
            // The retry is lost locally for lack of a network buffer.
            let rec = self.tsa.xmit_mut(priority);
            rec.retries_left -= 1;
            let v = rec.xmit_timer_value;
            rec.xmit_timer.set(now, v);
            debug!("retry lost: no space in network queue");
            return;
        }

        let rec = self.tsa.xmit(priority);
        let mut reminder_first: Option<NwSendParam> = None;
        let pdu: Vec<u8>;

        if param.service == ServiceType::UnackRpt {
            let mut p = Vec::with_capacity(1 + rec.apdu.len());
            p.push(tspdu::header(param.auth, TspduType::UnackRpt, rec.trans_num));
            p.extend_from_slice(&rec.apdu);
            pdu = p;
            trace!("resending unackd-repeated packet");
        } else if rec.dest.mode() != AddrMode::Multicast {
            let msg_type = match layer {
                Layer::Transport => TspduType::AckdOrRequest,
                Layer::Session if param.service == ServiceType::Request => {
                    TspduType::AckdOrRequest
                },
                Layer::Session => {
                    // Responses are never retried from here.
                    warn!("retry of a non-request session message");
                    self.tsa.xmit_mut(priority).retries_left = 0;
                    return;
                },
            };
            let mut p = Vec::with_capacity(1 + rec.apdu.len());
            p.push(tspdu::header(param.auth, msg_type, rec.trans_num));
            p.extend_from_slice(&rec.apdu);
            pdu = p;
        } else {
            // Multicast retry: remind the members that already answered.
            let length = match rec.highest_acked_member() {
                None => 0usize,
                Some(h) => h as usize / 8 + 1,
            };
            if length <= 2 {
                // Bitmap and APDU fit one REM_MSG.
                let mut p = Vec::with_capacity(2 + length + rec.apdu.len());
                p.push(tspdu::header(param.auth, TspduType::RemMsg, rec.trans_num));
                tspdu::encode_member_bitmap(&rec.ack_received, length, &mut p);
                p.extend_from_slice(&rec.apdu);
                pdu = p;
                trace!("resending rem/msg packet");
            } else {
                // Bare REMINDER followed by the full message; both slots
                // must be available or the whole retry waits.
                let space = if priority { self.q.nw_out_pri.space() } else { self.q.nw_out.space() };
                if space < 2 {
                    let rec = self.tsa.xmit_mut(priority);
                    rec.retries_left -= 1;
                    let v = rec.xmit_timer_value;
                    rec.xmit_timer.set(now, v);
                    debug!("retry lost: no space for reminder pair");
                    return;
                }
                let mut rem = Vec::with_capacity(2 + length);
                rem.push(tspdu::header(param.auth, TspduType::Reminder, rec.trans_num));
                tspdu::encode_member_bitmap(&rec.ack_received, length, &mut rem);
                reminder_first = Some(NwSendParam {
                    dest: rec.dest,
                    pdu_class: layer.pdu_class(),
                    delta_bl: 0,
                    alt_path: if param.alt_path_override {
                        param.alt_path
                    } else {
                        rec.retries_left <= ALT_PATH_COUNT + 1
                    },
                    drop_if_unconfigured: true,
                    tag: 0,
                    pdu: rem,
                });

                let mut p = Vec::with_capacity(1 + rec.apdu.len());
                p.push(tspdu::header(param.auth, TspduType::AckdOrRequest, rec.trans_num));
                p.extend_from_slice(&rec.apdu);
                pdu = p;
                trace!("resending reminder/message pair");
            }
        }

        if param.service != ServiceType::UnackRpt {
            self.stats.incr(Stat::Retry);
        }

        let rec = self.tsa.xmit(priority);
        let delta_bl = match (&param.service, rec.dest.mode()) {
            (ServiceType::UnackRpt, _) => 0,
            (_, AddrMode::Broadcast) => match param.dest {
                OutAddr::Broadcast { backlog, .. } if backlog != 0 => backlog,
                _ => 15,
            },
            (_, AddrMode::Multicast) => rec.dest_count - rec.ack_count,
            _ => 1,
        };
        let alt_path = if param.alt_path_override {
            param.alt_path
        } else {
            param.service != ServiceType::UnackRpt && rec.retries_left <= ALT_PATH_COUNT + 1
        };
        let send = NwSendParam {
            dest: rec.dest,
            pdu_class: layer.pdu_class(),
            delta_bl,
            alt_path,
            drop_if_unconfigured: true,
            tag: 0,
            pdu,
        };

        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        if let Some(rem) = reminder_first {
            nw.push(rem);
        }
        nw.push(send);

        let rec = self.tsa.xmit_mut(priority);
        rec.retries_left -= 1;
        if rec.retries_left == 0 {
            // The last retry waits longer so proxy chains have time to
            // propagate a failing response before we give up.
            rec.xmit_timer_value += rec.tx_timer_delta_last;
        }
        let v = rec.xmit_timer_value;
        rec.xmit_timer.set(now, v);
    }

    // ================================================================= //
    // Inbound: acknowledgments
    // ================================================================= //

    fn tp_receive_ack(&mut self, hdr: &RawTspduHeader) {
        let param = self.q.tsa_in.head().clone();
        let priority = param.priority;

        if self.tsa.tid(priority).validate(hdr.tid()) == TidStatus::NotCurrent {
            trace!("stale ack discarded");
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        }

        if !self.ack_matches_record(RecordOwner::Transport, priority, &param.src) {
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        }

        match self.tsa.xmit(priority).dest.mode() {
            // Unbound covers loopback turnaround transactions.
            AddrMode::Broadcast
            | AddrMode::SubnetNode
            | AddrMode::UniqueId
            | AddrMode::Unbound => {
                self.tsa.xmit_mut(priority).ack_count += 1;
                self.terminate_trans(priority);
            },
            AddrMode::Multicast => {
                let member = param.src.ack_node.group.member;
                if member > MAX_GROUP_MEMBER {
                    warn!(member, "ack with invalid group member");
                } else {
                    let rec = self.tsa.xmit_mut(priority);
                    if !rec.ack_received[member as usize] {
                        rec.ack_received[member as usize] = true;
                        rec.ack_count += 1;
                        trace!(member, "new multicast ack");
                    } else {
                        trace!(member, "duplicate multicast ack ignored");
                    }
                    let rec = self.tsa.xmit(priority);
                    if rec.dest_count == rec.ack_count {
                        self.terminate_trans(priority);
                    }
                }
            },
            _ => {
                self.record_error(LcsError::BadAddressType);
                warn!("ack for a record with an invalid address mode");
            },
        }

        self.q.tsa_in.dequeue();
        self.restart_xmit_timer(priority);
    }

    /// Shared sanity checks on inbound acks/responses: the record must be
    /// owned by the right layer and the source must be the destination we
    /// sent to.
    fn ack_matches_record(&self, owner: RecordOwner, priority: bool, src: &SourceAddress) -> bool {
        let rec = self.tsa.xmit(priority);
        if rec.owner != owner || rec.dest.dmn.index != src.dmn.index {
            return false;
        }
        match rec.dest.addr {
            DestAddr::SubnetNode(sn) => sn == src.subnet_node,
            DestAddr::Multicast { group } => {
                src.mode == AddrMode::MulticastAck && group == src.ack_node.group.group
            },
            DestAddr::Broadcast { subnet } => {
                // Unconfigured nodes answer with subnet 0; accept those.
                subnet == 0 || src.subnet_node.subnet == 0 || subnet == src.subnet_node.subnet
            },
            _ => true,
        }
    }

    fn restart_xmit_timer(&mut self, priority: bool) {
        let now = self.now;
        let rec = self.tsa.xmit_mut(priority);
        if rec.in_use() {
            let v = rec.xmit_timer_value;
            rec.xmit_timer.set(now, v);
        }
    }

    // ================================================================= //
    // Inbound: responses
    // ================================================================= //

    fn sn_receive_response(&mut self, hdr: &RawTspduHeader) {
        let param = self.q.tsa_in.head().clone();
        let priority = param.priority;

        if self.tsa.tid(priority).validate(hdr.tid()) == TidStatus::NotCurrent {
            trace!("unsolicited response ignored");
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        }
        if !self.ack_matches_record(RecordOwner::Session, priority, &param.src) {
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        }

        if self.q.app_in.is_full() {
            return; // deliver later
        }

        let send_param = {
            let q = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
            q.head().clone()
        };
        let apdu = Apdu::from_payload(&param.pdu[1..]);

        let indication = crate::app::AppIndication {
            kind: crate::app::IndicationKind::Message,
            src: param.src,
            service: ServiceType::Response,
            priority,
            alt_path: param.alt_path,
            tag: send_param.tag,
            proxy: send_param.proxy,
            proxy_count: send_param.proxy_count,
            proxy_done: send_param.proxy_done,
            apdu,
            ..crate::app::AppIndication::default()
        };

        // A proxy response is a one-shot: after relaying it no completion
        // or further response may be delivered for this transaction.
        {
            let q = if priority { &mut self.q.tsa_out_pri } else { &mut self.q.tsa_out };
            q.head_mut().proxy_done = true;
        }

        match self.tsa.xmit(priority).dest.mode() {
            AddrMode::Broadcast => {
                let max_responses = match send_param.dest {
                    OutAddr::Broadcast { max_responses, .. } => max_responses.max(1),
                    _ => 1,
                };
                let rec = self.tsa.xmit_mut(priority);
                if rec.ack_count < max_responses {
                    rec.ack_count += 1;
                    let done = rec.ack_count == max_responses;
                    self.q.app_in.push(indication);
                    if done {
                        self.terminate_trans(priority);
                    }
                }
            },
            AddrMode::SubnetNode | AddrMode::UniqueId | AddrMode::Unbound => {
                let rec = self.tsa.xmit_mut(priority);
                if rec.ack_count == 0 {
                    rec.ack_count += 1;
                    self.q.app_in.push(indication);
                    self.terminate_trans(priority);
                }
            },
            AddrMode::Multicast => {
                if param.src.mode != AddrMode::MulticastAck {
                    warn!("multicast response without multicast-ack source");
                } else {
                    let member = param.src.ack_node.group.member;
                    if member > MAX_GROUP_MEMBER {
                        warn!(member, "response with invalid group member");
                    } else {
                        let rec = self.tsa.xmit_mut(priority);
                        if !rec.ack_received[member as usize] {
                            rec.ack_received[member as usize] = true;
                            rec.ack_count += 1;
                            self.q.app_in.push(indication);
                        } else {
                            trace!(member, "duplicate multicast response ignored");
                        }
                        let rec = self.tsa.xmit(priority);
                        if rec.dest_count == rec.ack_count {
                            self.terminate_trans(priority);
                        }
                    }
                }
            },
            _ => {
                self.record_error(LcsError::BadAddressType);
                warn!("response for a record with an invalid address mode");
            },
        }

        self.q.tsa_in.dequeue();
        self.restart_xmit_timer(priority);
    }

    // ================================================================= //
    // Inbound: new messages
    // ================================================================= //

    fn receive_new_msg(&mut self, layer: Layer, hdr: &RawTspduHeader) {
        let param = self.q.tsa_in.head().clone();
        let apdu_bytes = &param.pdu[1..];

        let mut init_rr = true;
        let i = match self.retrieve_rr(&param.src, param.priority) {
            None => {
                let Some(i) = self.allocate_rr() else {
                    self.stats.incr(Stat::RxTxFull);
                    debug!("no receive record available, message lost");
                    self.q.tsa_in.dequeue();
                    return;
                };
                i
            },
            Some(i) => {
                let rec = &self.tsa.recv[i];
                if rec.trans_num != hdr.tid()
                    || rec.owner != layer.owner()
                    || rec.apdu.len() != apdu_bytes.len()
                    || rec.apdu != apdu_bytes
                {
                    // The sender moved on to a new transaction; reuse the
                    // slot. An undelivered predecessor is lost.
                    if !rec.was_delivered() {
                        self.stats.incr(Stat::Lost);
                    }
                } else {
                    // Exact duplicate: keep the record, but let acks and
                    // challenges follow the path of the newest copy.
                    init_rr = false;
                    if !self.tsa.recv[i].alt_path {
                        self.tsa.recv[i].alt_path = param.alt_path;
                    }
                }
                i
            },
        };

        if init_rr {
            let recv_timer = self.compute_recv_timer_value(&param.src);
            let req_id = (layer == Layer::Session).then(|| self.tsa.next_req_id());
            let now = self.now;
            let rec = &mut self.tsa.recv[i];
            rec.owner = layer.owner();
            rec.src = param.src;
            rec.trans_num = hdr.tid();
            rec.state = TransactionState::JustReceived;
            rec.priority = param.priority;
            rec.alt_path = param.alt_path;
            rec.auth = false;
            rec.req_id = req_id.unwrap_or(0);
            rec.service = match layer {
                Layer::Transport => {
                    if hdr.msg_type() == Some(TspduType::AckdOrRequest) {
                        ServiceType::Ackd
                    } else {
                        ServiceType::UnackRpt
                    }
                },
                Layer::Session => ServiceType::Request,
            };
            rec.apdu = apdu_bytes.to_vec();
            rec.recv_timer.set(now, recv_timer);
        }

        self.q.tsa_in.dequeue();

        // Authentication for unackd-repeated traffic is allowed too.
        self.tsa.recv[i].need_auth = hdr.auth();

        let state = self.tsa.recv[i].state;
        if matches!(state, TransactionState::JustReceived | TransactionState::Authenticating)
            && self.tsa.recv[i].need_auth
        {
            debug!("initiating challenge");
            self.initiate_challenge(i);
            return;
        }

        if !self.tsa.recv[i].was_delivered() {
            self.deliver(i);
        } else {
            trace!("message was already delivered");
        }

        let rec = &self.tsa.recv[i];
        match layer {
            Layer::Transport => {
                if rec.state == TransactionState::Delivered && rec.service == ServiceType::Ackd {
                    self.tp_send_ack(i);
                }
            },
            Layer::Session => {
                if rec.state == TransactionState::Responded {
                    // A retry of a request we already answered.
                    self.sn_send_response(i, false, false);
                }
            },
        }
    }

    // ================================================================= //
    // Inbound: reminders
    // ================================================================= //

    fn receive_rem(&mut self, layer: Layer, hdr: &RawTspduHeader) {
        let param = self.q.tsa_in.head().clone();
        let is_bare_reminder = hdr.msg_type() == Some(TspduType::Reminder);
        let Ok(body) = ReminderBody::parse(&param.pdu[1..]) else {
            warn!("truncated reminder");
            self.record_error(LcsError::UnknownPdu);
            self.q.tsa_in.dequeue();
            return;
        };
        let rem_apdu: Vec<u8> = body.apdu.to_vec();
        let bitmap_len = body.bitmap.len();

        let mut i = self.retrieve_rr(&param.src, param.priority);

        if i.is_none() && is_bare_reminder {
            trace!("reminder with no matching record dropped");
            self.q.tsa_in.dequeue();
            return;
        }

        if let Some(idx) = i {
            let rec = &self.tsa.recv[idx];
            let mismatch = rec.src.mode != AddrMode::Multicast
                || rec.trans_num != hdr.tid()
                || rec.owner != layer.owner()
                || (!is_bare_reminder
                    && (rem_apdu.len() != rec.apdu.len() || rem_apdu != rec.apdu));
            if mismatch {
                if is_bare_reminder {
                    trace!("reminder does not match its record");
                    self.q.tsa_in.dequeue();
                    return;
                }
                // A REM_MSG with new content starts a new transaction.
                if matches!(rec.state, TransactionState::Delivered | TransactionState::Done) {
                    self.tsa.recv[idx].release();
                }
                i = None;
            }
        }

        if let Some(idx) = i {
            if self.tsa.recv[idx].service == ServiceType::UnackRpt {
                if is_bare_reminder {
                    trace!("reminder for an unackd-repeated record ignored");
                    self.q.tsa_in.dequeue();
                    return;
                }
                i = None;
            }
        }

        if let Some(idx) = i {
            // We already hold the APDU; the sender may just have missed our
            // ack or response.
            let Some(member) =
                self.eep.book.is_group_member(param.src.dmn.index, param.src.group)
            else {
                debug!("reminder for a group we are not a member of");
                self.q.tsa_in.dequeue();
                return;
            };

            let included = {
                let rem = ReminderBody { bitmap: &param.pdu[2..2 + bitmap_len], apdu: &[] };
                rem.includes_member(member)
            };

            if !included {
                // We owe an answer. A bare reminder is followed by the
                // retry itself, so the retry will trigger it.
                if is_bare_reminder {
                    self.q.tsa_in.dequeue();
                    return;
                }
                let state = self.tsa.recv[idx].state;
                if self.tsa.recv[idx].need_auth
                    && matches!(
                        state,
                        TransactionState::JustReceived | TransactionState::Authenticating
                    )
                {
                    debug!("reminder: re-initiating challenge");
                    self.initiate_challenge(idx);
                    self.q.tsa_in.dequeue();
                    return;
                }
                if !self.tsa.recv[idx].was_delivered() {
                    self.deliver(idx);
                }
                let state = self.tsa.recv[idx].state;
                if matches!(state, TransactionState::Delivered | TransactionState::Responded) {
                    self.q.tsa_in.dequeue();
                    match layer {
                        Layer::Transport => self.tp_send_ack(idx),
                        Layer::Session => {
                            if state == TransactionState::Responded {
                                self.sn_send_response(idx, false, false);
                            } else {
                                trace!("no response computed yet");
                            }
                        },
                    }
                } else {
                    trace!("cannot respond or no need to respond");
                    self.q.tsa_in.dequeue();
                }
            } else {
                // The sender has our answer; nothing more owed.
                let rec = &mut self.tsa.recv[idx];
                if matches!(
                    rec.state,
                    TransactionState::Delivered | TransactionState::Responded
                ) {
                    rec.state = TransactionState::Done;
                }
                trace!("not asked to acknowledge or respond");
                self.q.tsa_in.dequeue();
            }
            return;
        }

        // A REM_MSG with no usable record: treat it as a brand-new message.
        let Some(idx) = self.allocate_rr() else {
            self.stats.incr(Stat::RxTxFull);
            return;
        };
        let recv_timer = self.compute_recv_timer_value(&param.src);
        let req_id = (layer == Layer::Session).then(|| self.tsa.next_req_id());
        let now = self.now;
        {
            let rec = &mut self.tsa.recv[idx];
            rec.owner = layer.owner();
            rec.src = param.src;
            rec.trans_num = hdr.tid();
            rec.state = TransactionState::JustReceived;
            rec.priority = param.priority;
            rec.alt_path = param.alt_path;
            rec.auth = false;
            rec.req_id = req_id.unwrap_or(0);
            rec.service = match layer {
                Layer::Transport => ServiceType::Ackd,
                Layer::Session => ServiceType::Request,
            };
            rec.apdu = rem_apdu;
            rec.recv_timer.set(now, recv_timer);
            rec.need_auth = hdr.auth();
        }
        self.q.tsa_in.dequeue();

        if self.tsa.recv[idx].need_auth {
            debug!("rem/msg: initiating challenge");
            self.initiate_challenge(idx);
            return;
        }

        self.deliver(idx);
        if layer == Layer::Transport && self.tsa.recv[idx].state == TransactionState::Delivered {
            self.tp_send_ack(idx);
        }
    }

    // ================================================================= //
    // Acks, responses, delivery
    // ================================================================= //

    fn tp_send_ack(&mut self, i: usize) {
        let rec = &self.tsa.recv[i];
        let priority = rec.priority;
        let nw_full = if priority { self.q.nw_out_pri.is_full() } else { self.q.nw_out.is_full() };
        if nw_full {
            return; // the next retry will ask again
        }

        let Some(dest) = self.reply_dest(i) else {
            warn!("ack for a group we no longer belong to");
            return;
        };
        let rec = &self.tsa.recv[i];
        let pdu = vec![tspdu::header(false, TspduType::AckOrResponse, rec.trans_num)];
        let send = NwSendParam {
            dest,
            pdu_class: PduClass::Tpdu,
            delta_bl: 0,
            alt_path: rec.alt_path,
            drop_if_unconfigured: false,
            tag: 0,
            pdu,
        };
        trace!("sending ack");
        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        nw.push(send);
    }

    fn sn_send_response(&mut self, i: usize, null_response: bool, flex_response: bool) {
        let rec = &self.tsa.recv[i];
        let priority = rec.priority;

        if !matches!(rec.state, TransactionState::Responded | TransactionState::Done) {
            warn!("response requested before one was computed");
            return;
        }

        if null_response {
            trace!("null response, nothing goes out");
            self.tsa.recv[i].state = TransactionState::Done;
            return;
        }

        let nw_full = if priority { self.q.nw_out_pri.is_full() } else { self.q.nw_out.is_full() };
        if nw_full {
            return;
        }
        if self.limits.nw_out_buf < self.tsa.recv[i].response.len() + 1 {
            warn!("network buffer too small for the saved response");
            return;
        }
        if self.tsa.recv[i].response.len() > self.limits.app_out_buf {
            debug!("discarding an over-long saved response");
            return;
        }

        let Some(mut dest) = self.reply_dest(i) else {
            warn!("response for a group we no longer belong to");
            return;
        };
        if flex_response {
            // Answer with source 0/0, the flex-domain convention.
            dest.dmn.index = FLEX_DOMAIN;
        }
        let rec = &self.tsa.recv[i];
        let mut pdu = Vec::with_capacity(1 + rec.response.len());
        pdu.push(tspdu::header(false, TspduType::AckOrResponse, rec.trans_num));
        pdu.extend_from_slice(&rec.response);
        let send = NwSendParam {
            dest,
            pdu_class: PduClass::Spdu,
            delta_bl: 0,
            alt_path: rec.alt_path,
            drop_if_unconfigured: false,
            tag: 0,
            pdu,
        };
        trace!("sending response");
        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        nw.push(send);
    }

    /// Destination for acks, responses and challenges: format 2b toward a
    /// group, plain subnet/node otherwise.
    fn reply_dest(&self, i: usize) -> Option<DestinationAddress> {
        let rec = &self.tsa.recv[i];
        let dmn = rec.src.dmn;
        if rec.src.mode == AddrMode::Multicast {
            let member = self.eep.book.is_group_member(dmn.index, rec.src.group)?;
            Some(DestinationAddress {
                dmn,
                addr: DestAddr::MulticastAck(MulticastAckAddress {
                    subnet_node: rec.src.subnet_node,
                    group: GroupAddress { group: rec.src.group, member },
                }),
            })
        } else {
            Some(DestinationAddress { dmn, addr: DestAddr::SubnetNode(rec.src.subnet_node) })
        }
    }

    fn deliver(&mut self, i: usize) {
        let rec = &self.tsa.recv[i];
        if rec.need_auth && rec.state != TransactionState::Authenticated {
            // Authentication failed or never finished: swallow silently.
            self.tsa.recv[i].state = TransactionState::Done;
            return;
        }
        if self.q.app_in.is_full() {
            // Waiting would break per-source ordering; drop and let the
            // sender's retry redeliver.
            debug!("no room to deliver, dropping");
            self.stats.incr(Stat::Lost);
            return;
        }
        if rec.apdu.len() > self.limits.app_in_buf {
            warn!("apdu too big for the application buffer");
            self.record_error(LcsError::WritePastEndOfApplBuffer);
            return;
        }
        let indication = crate::app::AppIndication {
            kind: crate::app::IndicationKind::Message,
            src: rec.src,
            service: rec.service,
            priority: rec.priority,
            alt_path: rec.alt_path,
            auth: rec.auth,
            req_id: rec.req_id,
            apdu: Apdu::from_payload(&rec.apdu),
            ..crate::app::AppIndication::default()
        };
        self.q.app_in.push(indication);
        self.tsa.recv[i].state = TransactionState::Delivered;
        trace!("delivered to the application");
    }

    // ================================================================= //
    // Record bookkeeping
    // ================================================================= //

    /// Find the record for a conversation: priority class, domain, address
    /// mode and source node must match, plus the broadcast subnet or group
    /// where applicable.
    fn retrieve_rr(&self, src: &SourceAddress, priority: bool) -> Option<usize> {
        self.tsa.recv.iter().position(|rec| {
            rec.in_use()
                && priority == rec.priority
                && src.dmn.index == rec.src.dmn.index
                && src.mode == rec.src.mode
                && src.subnet_node == rec.src.subnet_node
                && (src.mode != AddrMode::Broadcast
                    || src.broadcast_subnet == rec.src.broadcast_subnet)
                && (src.mode != AddrMode::Multicast || src.group == rec.src.group)
        })
    }

    fn allocate_rr(&self) -> Option<usize> {
        self.tsa.recv.iter().position(|rec| !rec.in_use())
    }

    /// Find the session record a response belongs to. Only requests that
    /// have been delivered and not yet answered qualify.
    fn find_rr(&self, req_id: u16) -> Option<usize> {
        let i = self
            .tsa
            .recv
            .iter()
            .position(|rec| rec.owner == RecordOwner::Session && rec.req_id == req_id)?;
        let rec = &self.tsa.recv[i];
        (rec.service == ServiceType::Request && rec.state == TransactionState::Delivered)
            .then_some(i)
    }

    /// Like [`find_rr`] but without the state restriction; proxy forwarding
    /// correlates through it.
    fn find_rr_any(&self, req_id: u16) -> Option<usize> {
        self.tsa
            .recv
            .iter()
            .position(|rec| rec.owner == RecordOwner::Session && rec.req_id == req_id)
    }

    fn compute_recv_timer_value(&self, src: &SourceAddress) -> u32 {
        match src.mode {
            AddrMode::UniqueId => NGTIMER_SPCL_VAL,
            AddrMode::Multicast => self.eep.book.max_group_rcv_timer(src.dmn.index, src.group),
            _ => crate::node::address_book::decode_rcv_timer(self.eep.config.non_group_timer),
        }
    }

    // ================================================================= //
    // Authentication
    // ================================================================= //

    fn auth_oma(&self) -> bool {
        self.eep.book.domains[0].is_oma()
    }

    fn initiate_challenge(&mut self, i: usize) {
        let priority = self.tsa.recv[i].priority;
        let nw_full = if priority { self.q.nw_out_pri.is_full() } else { self.q.nw_out.is_full() };
        if nw_full {
            return; // AuthSend will try again
        }

        let Some(dest) = self.reply_dest(i) else {
            warn!("challenge for a group we are not a member of");
            return;
        };

        if self.tsa.recv[i].state != TransactionState::Authenticating {
            // First challenge for this message; retries reuse the nonce.
            let now = self.now;
            let nonce =
                crate::transport::auth::next_challenge(&mut self.tsa.prev_challenge, &mut self.rng, now);
            self.tsa.recv[i].nonce = nonce;
        }

        let rec = &self.tsa.recv[i];
        let pdu = AuthPdu {
            fmt: AuthFmt::from_mode(rec.src.mode),
            msg_type: if self.auth_oma() {
                AuthPduType::ChallengeOma
            } else {
                AuthPduType::Challenge
            },
            tid: rec.trans_num,
            value: rec.nonce,
            group: rec.src.group,
        };
        let send = NwSendParam {
            dest,
            pdu_class: PduClass::AuthPdu,
            delta_bl: 0,
            alt_path: rec.alt_path,
            drop_if_unconfigured: false,
            tag: 0,
            pdu: pdu.encode(),
        };
        self.tsa.recv[i].state = TransactionState::Authenticating;
        debug!("sending challenge");
        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        nw.push(send);
    }

    fn send_reply_to_challenge(&mut self, pdu: &AuthPdu, oma: bool) {
        let param = self.q.tsa_in.head().clone();

        if param.src.dmn.index == FLEX_DOMAIN {
            // Challenges never originate in the flex domain.
            self.q.tsa_in.dequeue();
            return;
        }
        let priority = param.priority;

        // The challenge must belong to the transaction in flight, carry the
        // address format we used, and name the right group.
        let stale = {
            let rec = self.tsa.xmit(priority);
            rec.owner == RecordOwner::Unused
                || !rec.auth
                || pdu.tid != rec.trans_num
                || pdu.fmt.to_mode() != rec.dest.mode()
                || (pdu.fmt == AuthFmt::Multicast && rec.dest.group() != Some(pdu.group))
        };
        if stale {
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        }

        let nw_full = if priority { self.q.nw_out_pri.is_full() } else { self.q.nw_out.is_full() };
        if nw_full {
            return;
        }

        // Without an alternate key the reply is computed under the domain
        // keys (domain 0 first for open media).
        if !self.tsa.xmit(priority).alt_key.enabled {
            let mut value = [[0u8; 6]; 2];
            let mut dom_idx = if oma { 0 } else { param.src.dmn.index as usize };
            for slot in value.iter_mut() {
                if dom_idx >= 2 {
                    break;
                }
                *slot = self.eep.book.domains[dom_idx].key;
                dom_idx += 1;
            }
            self.tsa.xmit_mut(priority).alt_key.value = value;
        }

        let (mac, fmt, tid, group) = {
            let rec = self.tsa.xmit(priority);
            let dmn_idx = (rec.dest.dmn.index as usize).min(1);
            let oma_dest = oma.then(|| {
                crate::transport::auth::challenge_oma_dest(
                    &rec.dest,
                    &self.eep.book.domains[dmn_idx],
                )
            });
            let key = rec.alt_key.flat();
            let mac = crate::transport::auth::mix(&pdu.value, &rec.apdu, &key, oma_dest.as_ref());
            (mac, pdu.fmt, rec.trans_num, pdu.group)
        };

        let reply = AuthPdu {
            fmt,
            msg_type: if oma { AuthPduType::ReplyOma } else { AuthPduType::Reply },
            tid,
            value: mac,
            group,
        };

        // Reply by subnet addressing unless the challenge came from source
        // node 0 on a unique-id formatted transaction.
        let dest = if param.src.subnet_node.node == 0 && pdu.fmt == AuthFmt::UniqueId {
            let mut d = self.tsa.xmit(priority).dest;
            d.dmn = param.src.dmn;
            d
        } else {
            DestinationAddress {
                dmn: param.src.dmn,
                addr: DestAddr::SubnetNode(param.src.subnet_node),
            }
        };

        let send = NwSendParam {
            dest,
            pdu_class: PduClass::AuthPdu,
            delta_bl: 0,
            alt_path: param.alt_path,
            drop_if_unconfigured: false,
            tag: 0,
            pdu: reply.encode(),
        };
        let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
        nw.push(send);
        self.q.tsa_in.dequeue();
        debug!("sent reply to challenge");
        self.restart_xmit_timer(priority);
    }

    fn process_reply(&mut self, pdu: &AuthPdu, oma: bool) {
        let mut src = self.q.tsa_in.head().src;
        let priority = self.q.tsa_in.head().priority;

        // The reply names the format (and group) of the original message;
        // rewrite the source so the record lookup matches it.
        src.group = pdu.group;
        src.mode = pdu.fmt.to_mode();

        let Some(i) = self.retrieve_rr(&src, priority) else {
            self.q.tsa_in.dequeue();
            self.stats.incr(Stat::LateAck);
            return;
        };

        if self.tsa.recv[i].state != TransactionState::Authenticating {
            // Probably a duplicate reply.
            self.q.tsa_in.dequeue();
            return;
        }
        if pdu.fmt == AuthFmt::Multicast && pdu.group != self.tsa.recv[i].src.group {
            debug!("reply group mismatch, ignored");
            self.q.tsa_in.dequeue();
            return;
        }
        if pdu.tid != self.tsa.recv[i].trans_num {
            debug!("reply tid mismatch, ignored");
            self.q.tsa_in.dequeue();
            return;
        }

        let expected = {
            let rec = &self.tsa.recv[i];
            let mut key = [0u8; 12];
            if oma {
                key = self.eep.book.oma_key();
            } else {
                let mut dom_idx = rec.src.dmn.index as usize;
                if dom_idx >= 2 {
                    // Flex-domain traffic authenticates under the first
                    // configured domain's key.
                    dom_idx = if self.eep.book.domains[0].invalid { 1 } else { 0 };
                }
                key[..6].copy_from_slice(&self.eep.book.domains[dom_idx].key);
            }
            let dmn_idx = (rec.src.dmn.index as usize).min(1);
            let oma_dest = oma.then(|| {
                crate::transport::auth::reply_oma_dest(
                    pdu.fmt.to_mode(),
                    pdu.group,
                    &self.eep.book.domains[dmn_idx],
                    &self.eep.read_only.unique_node_id,
                )
            });
            crate::transport::auth::mix(&rec.nonce, &rec.apdu, &key, oma_dest.as_ref())
        };

        if expected == pdu.value {
            debug!("reply verified");
            self.tsa.recv[i].auth = true;
        } else {
            debug!("reply does not verify");
            self.record_error(LcsError::AuthenticationMismatch);
            self.tsa.recv[i].auth = false;
        }
        self.tsa.recv[i].state = TransactionState::Authenticated;

        self.deliver(i);

        let rec = &self.tsa.recv[i];
        if rec.owner == RecordOwner::Transport
            && rec.service == ServiceType::Ackd
            && rec.state == TransactionState::Delivered
        {
            self.tp_send_ack(i);
        }

        self.q.tsa_in.dequeue();
    }
}
