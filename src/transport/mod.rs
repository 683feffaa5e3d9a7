// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transport, session and authentication layers: the transaction engine.

pub mod auth;
pub mod engine;
pub mod records;
pub mod tid;

use crate::{
    models::{
        addressing::{AltKey, DomainRef, ServiceType, SourceAddress, UniqueNodeId},
        apdu::Apdu,
        npdu::PduClass,
    },
    node::address_book::TxParams,
};

/// Number of trailing retries sent on the alternate path is this plus one.
pub const ALT_PATH_COUNT: u8 = 1;

/// Fixed receive-timer value for unique-id addressed messages, ms.
pub const NGTIMER_SPCL_VAL: u32 = 8192;

/// Quiet period for transport/session sends after power-up/external reset.
pub const TS_RESET_DELAY_MS: u32 = 2000;

/// Message tags; negative values are reserved for the stack itself.
pub type MsgTag = i16;

/// Destination resolved far enough for the transaction engine: address kind
/// plus the transmit parameters that came from the address table or the
/// explicit address block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutAddr {
    #[default]
    Unbound,
    SubnetNode {
        subnet: u8,
        node: u8,
        tx: TxParams,
    },
    UniqueId {
        subnet: u8,
        unique_id: UniqueNodeId,
        tx: TxParams,
    },
    Broadcast {
        /// 0 means domain-wide.
        subnet: u8,
        backlog: u8,
        max_responses: u8,
        /// Group-wide broadcast addressing is optional; without it at most
        /// one response is expected.
        broadcast_group: bool,
        tx: TxParams,
    },
    Group {
        group: u8,
        /// Declared size; 0 means huge group (unackd services only).
        size: u8,
        tx: TxParams,
    },
    Turnaround {
        tx: TxParams,
    },
}

impl OutAddr {
    pub fn tx_params(&self) -> TxParams {
        match *self {
            OutAddr::Unbound => TxParams::default(),
            OutAddr::SubnetNode { tx, .. }
            | OutAddr::UniqueId { tx, .. }
            | OutAddr::Broadcast { tx, .. }
            | OutAddr::Group { tx, .. }
            | OutAddr::Turnaround { tx } => tx,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, OutAddr::Group { .. })
    }
}

/// One outbound request as queued for the engine (or the response queue).
#[derive(Debug, Default, Clone)]
pub struct TsaSendParam {
    pub dest: OutAddr,
    pub dmn: DomainRef,
    pub service: ServiceType,
    pub auth: bool,
    pub tag: MsgTag,
    /// Responses only: suppress the wire response, just retire the record.
    pub null_response: bool,
    /// Responses only: emit with source subnet/node 0/0.
    pub flex_response: bool,
    pub req_id: u16,
    pub alt_path_override: bool,
    pub alt_path: bool,
    pub priority: bool,
    pub proxy: bool,
    pub proxy_done: bool,
    /// Proxy only: inherit the transaction number of the incoming hop.
    pub tx_inherit: bool,
    pub proxy_count: u8,
    /// Extra wait added to the last retry (proxy chains).
    pub tx_timer_delta_last: u32,
    pub alt_key: AltKey,
    pub apdu: Apdu,
}

/// One inbound TPDU/SPDU/AuthPDU as queued by the network layer.
#[derive(Debug, Default, Clone)]
pub struct TsaReceiveParam {
    pub src: SourceAddress,
    pub priority: bool,
    pub alt_path: bool,
    pub pdu_class: PduClass,
    /// Raw PDU bytes, first byte included.
    pub pdu: Vec<u8>,
}
