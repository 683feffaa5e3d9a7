// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Application glue: the outbound message slot, the inbound dispatch queue
//! and the response slot, plus the tag space the stack reserves for its own
//! messages.

pub mod tags;

use tracing::{debug, trace, warn};

use crate::{
    models::{
        addressing::{
            DestAddr, DestinationAddress, DomainRef, FLEX_DOMAIN, ServiceType, SourceAddress,
            SubnetNode, UniqueNodeId,
        },
        apdu::{Apdu, MAX_DATA_SIZE},
        npdu::PduClass,
    },
    network::NwSendParam,
    node::{LcsError, address_book::{AddressEntry, NO_ADDRESS_INDEX, TxParams}},
    stack::Stack,
    transport::{MsgTag, OutAddr, TsaSendParam},
};

/// What an inbound queue item means to the application.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IndicationKind {
    /// A fresh message (or, with service RESPONSE, a reply to a request).
    #[default]
    Message,
    /// Completion of a previously sent message, matched by tag.
    Completion,
    Wink,
    Online,
    Offline,
}

/// One item in the application input queue.
#[derive(Debug, Default, Clone)]
pub struct AppIndication {
    pub kind: IndicationKind,
    pub success: bool,
    pub tag: MsgTag,
    pub src: SourceAddress,
    pub service: ServiceType,
    pub priority: bool,
    pub alt_path: bool,
    pub auth: bool,
    pub req_id: u16,
    pub proxy: bool,
    pub proxy_done: bool,
    pub proxy_count: u8,
    pub apdu: Apdu,
}

/// Destination selector for an outbound message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum MsgOutAddr {
    #[default]
    Unassigned,
    /// Resolve through the address table.
    TableIndex(u8),
    SubnetNode {
        domain_index: u8,
        subnet: u8,
        node: u8,
        tx: TxParams,
    },
    UniqueId {
        domain_index: u8,
        subnet: u8,
        unique_id: UniqueNodeId,
        tx: TxParams,
    },
    Group {
        domain_index: u8,
        group: u8,
        size: u8,
        tx: TxParams,
    },
    Broadcast {
        domain_index: u8,
        subnet: u8,
        backlog: u8,
        max_responses: u8,
        broadcast_group: bool,
        tx: TxParams,
    },
    Turnaround {
        tx: TxParams,
    },
}

/// Outbound message under construction between `msg_alloc` and `msg_send`.
#[derive(Debug, Default, Clone)]
pub struct MsgOut {
    pub priority: bool,
    pub tag: MsgTag,
    pub code: u8,
    pub data: Vec<u8>,
    pub authenticated: bool,
    pub service: ServiceType,
    pub addr: MsgOutAddr,
}

/// Response under construction between `resp_alloc` and `resp_send`.
#[derive(Debug, Default, Clone)]
pub struct RespOut {
    pub req_id: u16,
    pub null_response: bool,
    pub code: u8,
    pub data: Vec<u8>,
}

/// Application-side state owned by the stack.
#[derive(Debug, Default)]
pub struct AppState {
    pub(crate) pending_out: Option<MsgOut>,
    pub(crate) pending_resp: Option<RespOut>,
    pub(crate) mode: crate::node::ConfigMode,
    pub(crate) select_query: bool,
}

impl Stack {
    // ----------------------------------------------------------------- //
    // User API: outbound messages
    // ----------------------------------------------------------------- //

    /// Reserve the outbound message slot. Fails when the outgoing queue has
    /// no room or a message is already being built.
    pub fn msg_alloc(&mut self) -> Option<&mut MsgOut> {
        self.msg_alloc_inner(false)
    }

    /// Reserve the priority outbound message slot.
    pub fn msg_alloc_priority(&mut self) -> Option<&mut MsgOut> {
        self.msg_alloc_inner(true)
    }

    fn msg_alloc_inner(&mut self, priority: bool) -> Option<&mut MsgOut> {
        if self.app.pending_out.is_some() {
            return None;
        }
        let q = if priority { &self.q.app_out_pri } else { &self.q.app_out };
        if q.is_full() {
            return None;
        }
        self.app.pending_out = Some(MsgOut { priority, ..MsgOut::default() });
        self.app.pending_out.as_mut()
    }

    /// Commit the message built in the slot.
    pub fn msg_send(&mut self) -> bool {
        let Some(msg) = self.app.pending_out.take() else {
            return false;
        };
        if msg.data.len() > MAX_DATA_SIZE {
            warn!(len = msg.data.len(), "msg_send: payload too large");
            return false;
        }
        let q = if msg.priority { &mut self.q.app_out_pri } else { &mut self.q.app_out };
        if q.is_full() {
            return false;
        }
        q.push(msg);
        true
    }

    /// Release the slot without sending. Only possible before `msg_send`.
    pub fn msg_cancel(&mut self) {
        self.app.pending_out = None;
    }

    // ----------------------------------------------------------------- //
    // User API: inbound dispatch
    // ----------------------------------------------------------------- //

    /// Fetch the next user-visible indication, if any. Items the stack
    /// handles itself (network management, proxy relays, its own tags) are
    /// never returned here.
    pub fn receive(&mut self) -> Option<AppIndication> {
        if self.q.app_in.is_empty() || Self::is_internal(self.q.app_in.head()) {
            return None;
        }
        self.q.app_in.pop()
    }

    // ----------------------------------------------------------------- //
    // User API: responses
    // ----------------------------------------------------------------- //

    /// Reserve the response slot for the request identified by `req_id`.
    pub fn resp_alloc(&mut self, req_id: u16) -> Option<&mut RespOut> {
        if self.app.pending_resp.is_some() || self.q.tsa_resp.is_full() {
            return None;
        }
        self.app.pending_resp = Some(RespOut { req_id, ..RespOut::default() });
        self.app.pending_resp.as_mut()
    }

    /// Commit the response built in the slot.
    pub fn resp_send(&mut self) -> bool {
        let Some(resp) = self.app.pending_resp.take() else {
            return false;
        };
        self.enqueue_response(resp)
    }

    /// Discard the response slot; the request is retired with a null
    /// response (nothing goes out on the wire).
    pub fn resp_cancel(&mut self) {
        if let Some(mut resp) = self.app.pending_resp.take() {
            resp.null_response = true;
            resp.code = 0;
            resp.data.clear();
            self.enqueue_response(resp);
        }
    }

    fn enqueue_response(&mut self, resp: RespOut) -> bool {
        if self.q.tsa_resp.is_full() {
            return false;
        }
        self.q.tsa_resp.push(TsaSendParam {
            service: ServiceType::Response,
            req_id: resp.req_id,
            null_response: resp.null_response,
            apdu: Apdu { code: resp.code, data: resp.data },
            ..TsaSendParam::default()
        });
        true
    }

    /// Internal response path used by network management and the proxy.
    pub(crate) fn send_response(&mut self, req_id: u16, code: u8, data: &[u8]) -> bool {
        self.send_response_opts(req_id, code, data, false)
    }

    /// Like [`Stack::send_response`], optionally answering on the flex
    /// domain (source subnet/node 0/0).
    pub(crate) fn send_response_opts(
        &mut self,
        req_id: u16,
        code: u8,
        data: &[u8],
        flex: bool,
    ) -> bool {
        if self.q.tsa_resp.is_full() {
            return false;
        }
        self.q.tsa_resp.push(TsaSendParam {
            service: ServiceType::Response,
            req_id,
            flex_response: flex,
            apdu: Apdu::new(code, data),
            ..TsaSendParam::default()
        });
        true
    }

    pub(crate) fn send_null_response(&mut self, req_id: u16) -> bool {
        self.enqueue_response(RespOut { req_id, null_response: true, code: 0, data: Vec::new() })
    }

    /// Broadcast this node's unique id and program id on the flex domain.
    pub fn send_manual_service_request(&mut self) -> bool {
        if self.q.app_out.is_full() {
            return false;
        }
        let mut data = Vec::with_capacity(14);
        data.extend_from_slice(&self.eep.read_only.unique_node_id);
        data.extend_from_slice(&self.eep.read_only.prog_id);
        self.q.app_out.push(MsgOut {
            priority: false,
            tag: tags::MANUAL_SERVICE_REQ_TAG,
            code: crate::netmgmt::codes::NM_MANUAL_SERVICE_REQUEST | crate::models::apdu::NM_OPCODE_BASE,
            data,
            authenticated: false,
            service: ServiceType::Unackd,
            addr: MsgOutAddr::Broadcast {
                domain_index: FLEX_DOMAIN,
                subnet: 0,
                backlog: 0,
                max_responses: 1,
                broadcast_group: false,
                tx: TxParams::default(),
            },
        });
        true
    }

    // ----------------------------------------------------------------- //
    // Service steps
    // ----------------------------------------------------------------- //

    /// Move one application message (priority first) down to the transport
    /// or network queues.
    pub(crate) fn app_send_step(&mut self) {
        if !self.q.app_out_pri.is_empty() {
            self.app_send_one(true);
        } else if !self.q.app_out.is_empty() {
            self.app_send_one(false);
        }
    }

    fn app_send_one(&mut self, priority: bool) {
        let msg = {
            let q = if priority { &self.q.app_out_pri } else { &self.q.app_out };
            q.head().clone()
        };

        let resolved = self.resolve_out_addr(&msg.addr);
        let (dest, dmn) = match resolved {
            Ok(pair) => pair,
            Err(err) => {
                // Undeliverable by construction: fail the message now.
                if self.q.app_in.is_full() {
                    return;
                }
                debug!(?err, tag = msg.tag, "app: rejecting unroutable message");
                self.record_error(err);
                self.enqueue_apdu_completion(msg.tag, false);
                self.app_out_dequeue(priority);
                return;
            },
        };

        match msg.service {
            ServiceType::Unackd => {
                let nw = if priority { &self.q.nw_out_pri } else { &self.q.nw_out };
                if nw.is_full() {
                    return;
                }
                let param = NwSendParam {
                    dest: DestinationAddress { dmn, addr: Self::unackd_dest(&dest) },
                    pdu_class: PduClass::Apdu,
                    delta_bl: 1,
                    alt_path: false,
                    drop_if_unconfigured: msg.tag != tags::MANUAL_SERVICE_REQ_TAG,
                    tag: msg.tag,
                    pdu: Apdu { code: msg.code, data: msg.data.clone() }.to_bytes(),
                };
                let nw = if priority { &mut self.q.nw_out_pri } else { &mut self.q.nw_out };
                nw.push(param);
                self.app_out_dequeue(priority);
            },
            ServiceType::Ackd | ServiceType::UnackRpt | ServiceType::Request => {
                let tsa = if priority { &self.q.tsa_out_pri } else { &self.q.tsa_out };
                if tsa.is_full() {
                    return;
                }
                let param = TsaSendParam {
                    dest,
                    dmn,
                    service: msg.service,
                    auth: msg.authenticated,
                    tag: msg.tag,
                    priority,
                    apdu: Apdu { code: msg.code, data: msg.data.clone() },
                    ..TsaSendParam::default()
                };
                let tsa = if priority { &mut self.q.tsa_out_pri } else { &mut self.q.tsa_out };
                tsa.push(param);
                self.app_out_dequeue(priority);
            },
            ServiceType::Response => {
                // Responses travel through the response slot, never here.
                warn!("app: RESPONSE service on the message path");
                self.app_out_dequeue(priority);
            },
        }
    }

    fn app_out_dequeue(&mut self, priority: bool) {
        if priority {
            self.q.app_out_pri.dequeue();
        } else {
            self.q.app_out.dequeue();
        }
    }

    fn unackd_dest(dest: &OutAddr) -> DestAddr {
        match *dest {
            OutAddr::SubnetNode { subnet, node, .. } => {
                DestAddr::SubnetNode(SubnetNode::new(subnet, node))
            },
            OutAddr::UniqueId { subnet, unique_id, .. } => DestAddr::UniqueId { subnet, unique_id },
            OutAddr::Group { group, .. } => DestAddr::Multicast { group },
            OutAddr::Broadcast { subnet, .. } => DestAddr::Broadcast { subnet },
            OutAddr::Turnaround { .. } => DestAddr::Turnaround,
            OutAddr::Unbound => DestAddr::Turnaround,
        }
    }

    /// Resolve the user's destination selector against the address and
    /// domain tables.
    fn resolve_out_addr(&self, addr: &MsgOutAddr) -> Result<(OutAddr, DomainRef), LcsError> {
        let domain_ref = |index: u8| -> DomainRef {
            if index == FLEX_DOMAIN {
                DomainRef::flex()
            } else if let Some(d) = self.eep.book.domain(index) {
                DomainRef { index, len: d.len, id: d.id }
            } else {
                DomainRef::flex()
            }
        };

        match *addr {
            MsgOutAddr::Unassigned => Err(LcsError::BadAddressType),
            MsgOutAddr::TableIndex(i) => {
                if i == NO_ADDRESS_INDEX {
                    return Err(LcsError::InvalidAddrTableIndex);
                }
                let entry = self
                    .eep
                    .book
                    .address(i)
                    .ok_or(LcsError::InvalidAddrTableIndex)?;
                match *entry {
                    AddressEntry::Unbound => Err(LcsError::BadAddressType),
                    AddressEntry::Turnaround { tx } => {
                        Ok((OutAddr::Turnaround { tx }, domain_ref(0)))
                    },
                    AddressEntry::SubnetNode { domain_index, subnet, node, tx } => Ok((
                        OutAddr::SubnetNode { subnet, node, tx },
                        domain_ref(domain_index),
                    )),
                    // The table names a routing subnet only; the unique id
                    // itself must come through explicit addressing.
                    AddressEntry::UniqueId { .. } => Err(LcsError::BadAddressType),
                    AddressEntry::Broadcast { domain_index, subnet, backlog, max_responses, tx } => {
                        Ok((
                            OutAddr::Broadcast {
                                subnet,
                                backlog,
                                max_responses,
                                broadcast_group: false,
                                tx,
                            },
                            domain_ref(domain_index),
                        ))
                    },
                    AddressEntry::Group { domain_index, group, size, tx, .. } => {
                        Ok((OutAddr::Group { group, size, tx }, domain_ref(domain_index)))
                    },
                }
            },
            MsgOutAddr::SubnetNode { domain_index, subnet, node, tx } => {
                Ok((OutAddr::SubnetNode { subnet, node, tx }, domain_ref(domain_index)))
            },
            MsgOutAddr::UniqueId { domain_index, subnet, unique_id, tx } => {
                Ok((OutAddr::UniqueId { subnet, unique_id, tx }, domain_ref(domain_index)))
            },
            MsgOutAddr::Group { domain_index, group, size, tx } => {
                Ok((OutAddr::Group { group, size, tx }, domain_ref(domain_index)))
            },
            MsgOutAddr::Broadcast {
                domain_index,
                subnet,
                backlog,
                max_responses,
                broadcast_group,
                tx,
            } => Ok((
                OutAddr::Broadcast { subnet, backlog, max_responses, broadcast_group, tx },
                domain_ref(domain_index),
            )),
            MsgOutAddr::Turnaround { tx } => Ok((OutAddr::Turnaround { tx }, domain_ref(0))),
        }
    }

    /// Handle the head of the input queue when it belongs to the stack:
    /// network management, diagnostics, proxy relays and internal tags.
    pub(crate) fn app_receive_step(&mut self) {
        if self.q.app_in.is_empty() {
            return;
        }
        let item = self.q.app_in.head().clone();

        match item.kind {
            IndicationKind::Completion => {
                if item.proxy {
                    // Propagate the proxy outcome back down the chain.
                    if !item.proxy_done && !self.proxy_completion(&item) {
                        return; // response queue full, retry next cycle
                    }
                    self.q.app_in.dequeue();
                    return;
                }
                if tags::is_stack_tag(item.tag) {
                    trace!(tag = item.tag, success = item.success, "app: internal completion");
                    self.q.app_in.dequeue();
                }
                // User completions stay queued for Stack::receive.
            },
            IndicationKind::Message => {
                if item.service == ServiceType::Response {
                    if item.proxy {
                        if !item.proxy_done
                            && !self.send_response(
                                item.tag as u16,
                                item.apdu.code,
                                &item.apdu.data,
                            )
                        {
                            return;
                        }
                        self.q.app_in.dequeue();
                    }
                    // Ordinary responses stay queued for Stack::receive.
                    return;
                }
                if item.apdu.is_enhanced_proxy() {
                    if self.process_proxy(&item) {
                        self.q.app_in.dequeue();
                    }
                    return;
                }
                if item.apdu.is_network_mgmt() {
                    if self.handle_nm(&item) {
                        self.q.app_in.dequeue();
                    }
                    return;
                }
                if item.apdu.is_network_diag() {
                    if self.handle_nd(&item) {
                        self.q.app_in.dequeue();
                    }
                    return;
                }
                if !self.app_pgm_runs() {
                    debug!("app: dropping message while offline");
                    self.q.app_in.dequeue();
                }
                // Otherwise leave it for Stack::receive.
            },
            IndicationKind::Wink | IndicationKind::Online | IndicationKind::Offline => {
                // Events are for the user; nothing to do here.
            },
        }
    }

    /// Items the application never sees through [`Stack::receive`].
    fn is_internal(item: &AppIndication) -> bool {
        match item.kind {
            IndicationKind::Completion => item.proxy || tags::is_stack_tag(item.tag),
            IndicationKind::Message => {
                if item.service == ServiceType::Response {
                    item.proxy
                } else {
                    item.apdu.is_enhanced_proxy()
                        || item.apdu.is_network_mgmt()
                        || item.apdu.is_network_diag()
                }
            },
            _ => false,
        }
    }

    // ----------------------------------------------------------------- //
    // Enqueue helpers shared with the other layers
    // ----------------------------------------------------------------- //

    pub(crate) fn enqueue_app_message(
        &mut self,
        src: SourceAddress,
        service: ServiceType,
        priority: bool,
        alt_path: bool,
        auth: bool,
        req_id: u16,
        apdu: Apdu,
    ) {
        self.q.app_in.push(AppIndication {
            kind: IndicationKind::Message,
            src,
            service,
            priority,
            alt_path,
            auth,
            req_id,
            apdu,
            ..AppIndication::default()
        });
    }

    pub(crate) fn enqueue_apdu_completion(&mut self, tag: MsgTag, success: bool) {
        self.q.app_in.push(AppIndication {
            kind: IndicationKind::Completion,
            success,
            tag,
            ..AppIndication::default()
        });
    }

    pub(crate) fn enqueue_event(&mut self, kind: IndicationKind) {
        if !self.q.app_in.is_full() {
            self.q.app_in.push(AppIndication { kind, ..AppIndication::default() });
        }
    }
}
