// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Enhanced proxy relay.
//!
//! A proxy chain is: source → zero or more repeaters → agent → target. A
//! repeater pops the head of the address list and forwards the rest; the
//! agent unwraps the SICB and runs a normal transaction against the final
//! target. Completions travel back as responses, one hop at a time.

use tracing::{debug, trace, warn};

use crate::{
    app::AppIndication,
    models::{
        addressing::{FLEX_DOMAIN, DomainRef, ServiceType},
        apdu::{Apdu, ENHANCED_PROXY, ENHANCED_PROXY_FAILURE, ENHANCED_PROXY_SUCCESS},
        proxy::{
            ProxyAddressType, ProxyAuthKey, ProxyHeader, ProxySicb, ProxySicbMode, ProxyTxCtrl,
        },
    },
    node::address_book::TxParams,
    stack::Stack,
    transport::{OutAddr, TsaSendParam},
};

/// How long a stalled relay waits for an output buffer before failing the
/// transaction to break the queue deadlock.
pub const PROXY_BUFFER_WAIT_MS: u32 = 1000;

impl Stack {
    /// Relay (or terminate) one enhanced-proxy message. Returns false when
    /// the item must stay queued for another attempt.
    pub(crate) fn process_proxy(&mut self, item: &AppIndication) -> bool {
        let data = &item.apdu.data;
        if data.len() < ProxySicb::WIRE_LEN + 2 {
            debug!("proxy: runt message dropped");
            return true;
        }

        let ph = ProxyHeader::from_byte(data[0]);
        let uniform = ph.uniform();
        let src_subnet = item.src.subnet_node.subnet;
        let mut dom_idx = item.src.dmn.index;
        let dst_subnet = match self.eep.book.domain(dom_idx) {
            Some(d) => d.subnet,
            None => 0,
        };
        let uniform_subnet = if ph.uniform_by_src { src_subnet } else { dst_subnet };

        let count = ph.count as usize;
        let txcpos = 1 + if uniform { count } else { 2 * count };
        let Some(&txc_byte) = data.get(txcpos) else {
            debug!("proxy: truncated address list dropped");
            return true;
        };
        let txc = ProxyTxCtrl::from_byte(txc_byte);

        if ph.all_agents && count > 0 {
            self.proxy_repeater_as_agent(item, txcpos);
        }

        // Relay needs an output buffer; a hard wait here can deadlock the
        // queues, so a watchdog eventually fails the transaction instead.
        let tsa_full = if item.priority {
            self.q.tsa_out_pri.is_full()
        } else {
            self.q.tsa_out.is_full()
        };
        if tsa_full {
            let now = self.now;
            if self.proxy_wait.expired(now) {
                warn!("proxy: buffer wait expired, failing the relay");
                return self.proxy_fail(item);
            }
            if !self.proxy_wait.running(now) {
                self.proxy_wait.set(now, PROXY_BUFFER_WAIT_MS);
            }
            return false;
        }
        self.proxy_wait.stop();

        if dom_idx == FLEX_DOMAIN {
            dom_idx = 0;
        }

        let mut param = TsaSendParam {
            dmn: self.domain_ref(dom_idx),
            auth: item.auth,
            tag: item.req_id as crate::transport::MsgTag,
            alt_path_override: true,
            priority: item.priority,
            proxy: true,
            proxy_done: false,
            tx_inherit: true,
            ..TsaSendParam::default()
        };

        if count != 0 {
            // Repeater: pop the first hop and pass the rest along.
            let (alt, node, hop_subnet) = if uniform {
                let b = data[1];
                (b & 0x80 != 0, b & 0x7F, uniform_subnet)
            } else {
                (data[2] & 0x80 != 0, data[2] & 0x7F, data[1])
            };
            let remaining = count - 1;

            let mut offset = if uniform { 2 } else { 3 };
            if remaining == 0 {
                // Last repeater: the inter-hop tx control is consumed here.
                offset += 1;
            }
            if offset > data.len() {
                debug!("proxy: truncated chain dropped");
                return true;
            }

            // Each hop on the failure path needs time to hear its own
            // downstream timeout before its upstream gives up.
            let adjust: u32 = if ph.long_timer || txc.timer >= 10 {
                512 * remaining as u32
            } else if txc.timer >= 8 {
                256 * remaining as u32
            } else {
                256
            };

            let mut fwd_header = ph;
            fwd_header.count -= 1;
            let mut payload = Vec::with_capacity(1 + data.len() - offset);
            payload.push(fwd_header.to_byte());
            payload.extend_from_slice(&data[offset..]);

            param.service = item.service;
            param.tx_timer_delta_last = adjust;
            param.alt_path = alt;
            param.proxy_count = remaining as u8;
            param.dest = OutAddr::SubnetNode {
                subnet: hop_subnet,
                node,
                tx: TxParams {
                    rpt_timer: 0,
                    retry: txc.retry,
                    tx_timer: txc.timer,
                    long_timer: ph.long_timer,
                },
            };
            param.apdu = Apdu { code: ENHANCED_PROXY, data: payload };
            trace!(remaining, "proxy: forwarding to next hop");
        } else {
            // Agent: unwrap the SICB and address the real target.
            let Ok(sicb) = ProxySicb::parse(&data[1..]) else {
                debug!("proxy: bad sicb dropped");
                return true;
            };
            let txc = sicb.txctrl;
            param.service = match sicb.service {
                0 => ServiceType::Ackd,
                1 => ServiceType::UnackRpt,
                2 => ServiceType::Unackd,
                _ => ServiceType::Request,
            };

            let mut pos = 1 + ProxySicb::WIRE_LEN;
            if sicb.mode == ProxySicbMode::AltKey {
                let Ok(key) = ProxyAuthKey::parse(&data[pos..]) else {
                    debug!("proxy: bad alt-key block dropped");
                    return true;
                };
                // The supplied bytes are deltas over the configured keys.
                let mut k = 0usize;
                let mut value = [[0u8; 6]; 2];
                for (slot, dom) in value.iter_mut().zip(dom_idx as usize..2) {
                    for (j, byte) in slot.iter_mut().enumerate() {
                        let delta = key.delta.get(k).copied().unwrap_or(0);
                        *byte = self.eep.book.domains[dom].key[j].wrapping_add(delta);
                        k += 1;
                    }
                }
                param.alt_key.enabled = true;
                param.alt_key.value = value;
                pos += key.wire_len();
            }

            let addr_len = sicb.addr_type.addr_len();
            let Some(addr) = data.get(pos..pos + addr_len) else {
                debug!("proxy: truncated target address dropped");
                return true;
            };
            let tx = TxParams {
                rpt_timer: 0,
                retry: txc.retry,
                tx_timer: txc.timer,
                long_timer: ph.long_timer,
            };
            param.dest = match sicb.addr_type {
                ProxyAddressType::Group => {
                    OutAddr::Group { group: addr[0], size: addr[1], tx }
                },
                ProxyAddressType::GroupCompact => {
                    // Size 0: huge group, unackd services only.
                    OutAddr::Group { group: addr[0], size: 0, tx }
                },
                ProxyAddressType::SubnetNode => OutAddr::SubnetNode {
                    subnet: addr[0],
                    node: addr[1] & 0x7F,
                    tx,
                },
                ProxyAddressType::SubnetNodeCompactSrc => OutAddr::SubnetNode {
                    subnet: src_subnet,
                    node: addr[0] & 0x7F,
                    tx,
                },
                ProxyAddressType::SubnetNodeCompactDest => OutAddr::SubnetNode {
                    subnet: dst_subnet,
                    node: addr[0] & 0x7F,
                    tx,
                },
                ProxyAddressType::NeuronId => {
                    let mut uid = [0u8; 6];
                    uid.copy_from_slice(&addr[1..7]);
                    OutAddr::UniqueId { subnet: addr[0], unique_id: uid, tx }
                },
                ProxyAddressType::NeuronIdCompact => {
                    let mut uid = [0u8; 6];
                    uid.copy_from_slice(&addr[..6]);
                    OutAddr::UniqueId { subnet: 0, unique_id: uid, tx }
                },
                ProxyAddressType::Broadcast => OutAddr::Broadcast {
                    subnet: addr[0],
                    backlog: addr[1] & 0x3F,
                    max_responses: 1,
                    broadcast_group: false,
                    tx,
                },
            };
            pos += addr_len;

            let Some(&code) = data.get(pos) else {
                debug!("proxy: missing target code dropped");
                return true;
            };
            pos += 1;
            param.alt_path = sicb.path;
            param.proxy_count = 0;
            param.apdu = Apdu { code, data: data[pos..].to_vec() };
            trace!(service = ?param.service, "proxy: issuing agent transaction");
        }

        let tsa = if item.priority { &mut self.q.tsa_out_pri } else { &mut self.q.tsa_out };
        tsa.push(param);
        true
    }

    /// A repeater in all-agents mode also plays agent, reissuing the inner
    /// message as if its own chain had ended. No second buffer, no agent
    /// action.
    fn proxy_repeater_as_agent(&mut self, item: &AppIndication, txcpos: usize) {
        let tail = txcpos + 1;
        if tail >= item.apdu.data.len() || item.src.dmn.index == FLEX_DOMAIN {
            return;
        }
        let mut inner = item.clone();
        inner.service = ServiceType::Unackd;
        inner.proxy = true;
        let mut data = Vec::with_capacity(1 + item.apdu.data.len() - tail);
        data.push(0); // bare agent header: no flags, zero hops
        data.extend_from_slice(&item.apdu.data[tail..]);
        inner.apdu = Apdu { code: ENHANCED_PROXY, data };
        let _ = self.process_proxy(&inner);
    }

    /// Send the completion of a proxy transaction back down the chain.
    /// Returns false while the response queue has no room.
    pub(crate) fn proxy_completion(&mut self, item: &AppIndication) -> bool {
        if item.proxy_done {
            return true;
        }
        if item.success {
            self.send_response(item.tag as u16, ENHANCED_PROXY_SUCCESS, &[])
        } else {
            self.send_response(item.tag as u16, ENHANCED_PROXY_FAILURE, &[item.proxy_count])
        }
    }

    fn proxy_fail(&mut self, item: &AppIndication) -> bool {
        self.send_response(item.req_id, ENHANCED_PROXY_FAILURE, &[item.proxy_count])
    }

    pub(crate) fn domain_ref(&self, index: u8) -> DomainRef {
        if index == FLEX_DOMAIN {
            return DomainRef::flex();
        }
        match self.eep.book.domain(index) {
            Some(d) => DomainRef { index, len: d.len, id: d.id },
            None => DomainRef::flex(),
        }
    }
}
