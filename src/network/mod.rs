// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network layer: frames and unframes NPDUs, injects per-domain source
//! addresses on the way down, matches domains and classifies destinations
//! on the way up.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::{
    models::{
        addressing::{
            AddrMode, DestAddr, DestinationAddress, DomainRef, FLEX_DOMAIN, ServiceType,
            SourceAddress, SubnetNode,
        },
        apdu::Apdu,
        npdu::{Npdu, PduClass},
    },
    node::LcsError,
    node::stats::Stat,
    stack::Stack,
    transport::{MsgTag, TsaReceiveParam},
};

/// One outbound NPDU request as queued for the network layer.
#[derive(Debug, Default, Clone)]
pub struct NwSendParam {
    pub dest: DestinationAddress,
    pub pdu_class: PduClass,
    pub delta_bl: u8,
    pub alt_path: bool,
    /// Data-bearing sends are suppressed on unconfigured nodes; acks,
    /// responses and challenges are not.
    pub drop_if_unconfigured: bool,
    /// APDU-class sends only: tag for the completion event.
    pub tag: MsgTag,
    pub pdu: Vec<u8>,
}

/// One frame on the boundary to the link collaborator. Priority, path and
/// backlog ride here; the NPDU itself is opaque to the link.
#[derive(Debug, Default, Clone)]
pub struct LinkFrame {
    pub priority: bool,
    pub alt_path: bool,
    pub delta_backlog: u8,
    pub npdu: Bytes,
}

/// Outcome of pushing one NPDU up the stack.
enum Upward {
    Delivered,
    Dropped,
    Busy,
}

impl Stack {
    /// Move one pending NPDU (priority first) down to the link queues.
    pub(crate) fn nw_send_step(&mut self) {
        if !self.q.nw_out_pri.is_empty() && !self.q.lk_out_pri.is_full() {
            self.nw_send_one(true);
        } else if !self.q.nw_out.is_empty() && !self.q.lk_out.is_full() {
            self.nw_send_one(false);
        }
    }

    fn nw_send_one(&mut self, priority: bool) {
        let param = {
            let q = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
            q.head().clone()
        };

        // An APDU-class send also produces a completion event; a turnaround
        // additionally loops the message itself back up. Hold the frame
        // until there is room for everything it will enqueue.
        if param.pdu_class == PduClass::Apdu {
            let needed = if param.dest.addr == DestAddr::Turnaround { 2 } else { 1 };
            if self.q.app_in.space() < needed {
                return;
            }
        }

        if param.drop_if_unconfigured && !self.node_configured() {
            debug!("nw: dropping data send while unconfigured");
            self.nw_out_dequeue(priority);
            return;
        }

        let dmn_index = param.dest.dmn.index;
        let (domain_len, domain_id, src) = if dmn_index == FLEX_DOMAIN {
            // Flex sends carry whatever domain bytes the caller supplied and
            // a 0/0 source address.
            (param.dest.dmn.len, param.dest.dmn.id, SubnetNode::new(0, 0))
        } else {
            match self.eep.book.domain(dmn_index) {
                Some(d) if !d.invalid => (d.len, d.id, SubnetNode::new(d.subnet, d.node)),
                _ => {
                    warn!(dmn_index, "nw: send on invalid domain");
                    self.record_error(LcsError::InvalidDomain);
                    self.nw_out_dequeue(priority);
                    return;
                },
            }
        };

        let npdu = Npdu {
            pdu_class: param.pdu_class,
            domain_len,
            domain_id,
            src,
            dest: param.dest.addr,
            payload: param.pdu.clone(),
        };

        if param.dest.addr == DestAddr::Turnaround {
            // Loopback: straight back up, no wire involved.
            if matches!(self.nw_deliver_up(&npdu, priority, param.alt_path, true), Upward::Busy) {
                return;
            }
            self.nw_out_dequeue(priority);
            if param.pdu_class == PduClass::Apdu {
                self.enqueue_apdu_completion(param.tag, true);
            }
            return;
        }

        let frame = LinkFrame {
            priority,
            alt_path: param.alt_path,
            delta_backlog: param.delta_bl,
            npdu: Bytes::from(npdu.encode()),
        };
        let lk = if priority { &mut self.q.lk_out_pri } else { &mut self.q.lk_out };
        lk.push(frame);
        self.stats.incr(Stat::L3Tx);
        trace!(priority, class = ?param.pdu_class, "nw: frame queued for link");
        self.nw_out_dequeue(priority);

        if param.pdu_class == PduClass::Apdu {
            self.enqueue_apdu_completion(param.tag, true);
        }
    }

    fn nw_out_dequeue(&mut self, priority: bool) {
        if priority {
            self.q.nw_out_pri.dequeue();
        } else {
            self.q.nw_out.dequeue();
        }
    }

    /// Process one inbound link frame.
    pub(crate) fn nw_receive_step(&mut self) {
        if self.q.lk_in.is_empty() {
            return;
        }
        let frame = self.q.lk_in.head().clone();
        self.stats.incr(Stat::L2Rx);

        let npdu = match Npdu::decode(&frame.npdu) {
            Ok(npdu) => npdu,
            Err(err) => {
                warn!(%err, "nw: undecodable frame");
                self.record_error(LcsError::UnknownPdu);
                self.q.lk_in.dequeue();
                return;
            },
        };

        match self.nw_deliver_up(&npdu, frame.priority, frame.alt_path, false) {
            // Destination queue full: leave the frame for the next cycle.
            Upward::Busy => {},
            Upward::Delivered | Upward::Dropped => self.q.lk_in.dequeue(),
        }
    }

    /// Classify and dispatch one NPDU travelling upward.
    fn nw_deliver_up(
        &mut self,
        npdu: &Npdu,
        priority: bool,
        alt_path: bool,
        loopback: bool,
    ) -> Upward {
        let dmn_index = match self.match_domain(npdu, loopback) {
            Some(i) => i,
            None => {
                debug!("nw: no matching domain");
                self.record_error(LcsError::InvalidDomain);
                return Upward::Dropped;
            },
        };

        let Some(src) = self.classify(npdu, dmn_index) else {
            // Addressed elsewhere.
            self.stats.incr(Stat::Missed);
            return Upward::Dropped;
        };

        match npdu.pdu_class {
            PduClass::Apdu => {
                if self.q.app_in.is_full() {
                    return Upward::Busy;
                }
                let Some(apdu) = Apdu::from_bytes(&npdu.payload) else {
                    self.record_error(LcsError::UnknownPdu);
                    return Upward::Dropped;
                };
                self.enqueue_app_message(src, ServiceType::Unackd, priority, alt_path, false, 0, apdu);
                Upward::Delivered
            },
            _ => {
                if self.q.tsa_in.is_full() {
                    return Upward::Busy;
                }
                self.q.tsa_in.push(TsaReceiveParam {
                    src,
                    priority,
                    alt_path,
                    pdu_class: npdu.pdu_class,
                    pdu: npdu.payload.clone(),
                });
                self.stats.incr(Stat::L3Rx);
                Upward::Delivered
            },
        }
    }

    /// Match the packet's domain bytes to a configured domain, or accept it
    /// in the flex domain for traffic that may legitimately arrive from
    /// outside our domains (unconfigured node, unique-id addressing,
    /// zero-length domain).
    fn match_domain(&self, npdu: &Npdu, loopback: bool) -> Option<u8> {
        let n_domains = if self.eep.read_only.two_domains { 2 } else { 1 };
        for i in 0..n_domains {
            let d = &self.eep.book.domains[i];
            if !d.invalid
                && d.len == npdu.domain_len
                && d.id[..d.len as usize] == npdu.domain_id[..d.len as usize]
            {
                return Some(i as u8);
            }
        }
        if loopback {
            return Some(FLEX_DOMAIN);
        }
        let uid_to_me = matches!(npdu.dest, DestAddr::UniqueId { unique_id, .. }
            if unique_id == self.eep.read_only.unique_node_id);
        if self.node_unconfigured() || uid_to_me || npdu.domain_len == 0 {
            Some(FLEX_DOMAIN)
        } else {
            None
        }
    }

    /// Decide whether this node is a receiver of the NPDU and, if so, build
    /// the canonical source address for the upper layers.
    fn classify(&self, npdu: &Npdu, dmn_index: u8) -> Option<SourceAddress> {
        let mut src = SourceAddress {
            subnet_node: npdu.src,
            dmn: DomainRef { index: dmn_index, len: npdu.domain_len, id: npdu.domain_id },
            ..SourceAddress::default()
        };
        let own = if dmn_index == FLEX_DOMAIN {
            SubnetNode::new(0, 0)
        } else {
            let d = &self.eep.book.domains[dmn_index as usize];
            SubnetNode::new(d.subnet, d.node)
        };

        match npdu.dest {
            DestAddr::Broadcast { subnet } => {
                if subnet != 0 && dmn_index != FLEX_DOMAIN && subnet != own.subnet {
                    return None;
                }
                src.mode = AddrMode::Broadcast;
                src.broadcast_subnet = subnet;
            },
            DestAddr::Multicast { group } => {
                if dmn_index == FLEX_DOMAIN {
                    return None;
                }
                self.eep.book.is_group_member(dmn_index, group)?;
                src.mode = AddrMode::Multicast;
                src.group = group;
            },
            DestAddr::SubnetNode(sn) => {
                if dmn_index == FLEX_DOMAIN || sn != own {
                    return None;
                }
                src.mode = AddrMode::SubnetNode;
            },
            DestAddr::MulticastAck(ack) => {
                if dmn_index == FLEX_DOMAIN || ack.subnet_node != own {
                    return None;
                }
                src.mode = AddrMode::MulticastAck;
                src.ack_node = ack;
            },
            DestAddr::UniqueId { unique_id, .. } => {
                if unique_id != self.eep.read_only.unique_node_id {
                    return None;
                }
                src.mode = AddrMode::UniqueId;
                src.unique_id = unique_id;
            },
            DestAddr::Turnaround => {
                src.mode = AddrMode::SubnetNode;
                src.subnet_node = own;
            },
        }
        Some(src)
    }
}
