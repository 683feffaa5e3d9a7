// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Authentication PDU codec.
//!
//! First byte layout:
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +-------+-------+---------------+
//! |  fmt  | type  |      tid      |
//! +-------+-------+---------------+
//! ```
//!
//! `fmt` echoes the address format of the message being authenticated
//! (broadcast/multicast/subnet-node/unique-id), `type` selects
//! challenge/reply and their open-media variants. Eight value bytes follow
//! (nonce for challenges, mix output for replies), then the group byte iff
//! `fmt` is multicast.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::addressing::AddrMode;

const FMT_MASK: u8 = 0b1100_0000;
const TYPE_MASK: u8 = 0b0011_0000;
const TID_MASK: u8 = 0b0000_1111;

/// Address format as carried inside authentication PDUs (two bits).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthFmt {
    #[default]
    Broadcast = 0,
    Multicast = 1,
    SubnetNode = 2,
    UniqueId = 3,
}

impl AuthFmt {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => AuthFmt::Broadcast,
            1 => AuthFmt::Multicast,
            2 => AuthFmt::SubnetNode,
            _ => AuthFmt::UniqueId,
        }
    }

    /// Address mode corresponding to this format. A format of 2 maps to
    /// SUBNET_NODE, never MULTICAST_ACK.
    pub fn to_mode(self) -> AddrMode {
        match self {
            AuthFmt::Broadcast => AddrMode::Broadcast,
            AuthFmt::Multicast => AddrMode::Multicast,
            AuthFmt::SubnetNode => AddrMode::SubnetNode,
            AuthFmt::UniqueId => AddrMode::UniqueId,
        }
    }

    pub fn from_mode(mode: AddrMode) -> Self {
        match mode {
            AddrMode::Broadcast | AddrMode::Unbound => AuthFmt::Broadcast,
            AddrMode::Multicast => AuthFmt::Multicast,
            AddrMode::SubnetNode | AddrMode::MulticastAck => AuthFmt::SubnetNode,
            AddrMode::UniqueId => AuthFmt::UniqueId,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthPduType {
    #[default]
    Challenge = 0,
    ChallengeOma = 1,
    Reply = 2,
    ReplyOma = 3,
}

impl AuthPduType {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => AuthPduType::Challenge,
            1 => AuthPduType::ChallengeOma,
            2 => AuthPduType::Reply,
            _ => AuthPduType::ReplyOma,
        }
    }

    pub fn is_challenge(self) -> bool {
        matches!(self, AuthPduType::Challenge | AuthPduType::ChallengeOma)
    }

    pub fn is_oma(self) -> bool {
        matches!(self, AuthPduType::ChallengeOma | AuthPduType::ReplyOma)
    }
}

#[derive(Debug, Error)]
pub enum AuthPduError {
    #[error("auth pdu truncated")]
    Truncated,
}

/// Wire-safe first AuthPDU octet, transparent over `u8`.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawAuthHeader(u8);

impl RawAuthHeader {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub fn fmt(&self) -> AuthFmt {
        AuthFmt::from_bits((self.0 & FMT_MASK) >> 6)
    }

    #[inline]
    pub fn set_fmt(&mut self, f: AuthFmt) {
        self.0 = (self.0 & !FMT_MASK) | (((f as u8) << 6) & FMT_MASK);
    }

    #[inline]
    pub fn msg_type(&self) -> AuthPduType {
        AuthPduType::from_bits((self.0 & TYPE_MASK) >> 4)
    }

    #[inline]
    pub fn set_msg_type(&mut self, t: AuthPduType) {
        self.0 = (self.0 & !TYPE_MASK) | (((t as u8) << 4) & TYPE_MASK);
    }

    #[inline]
    pub const fn tid(&self) -> u8 {
        self.0 & TID_MASK
    }

    #[inline]
    pub fn set_tid(&mut self, tid: u8) {
        self.0 = (self.0 & !TID_MASK) | (tid & TID_MASK);
    }
}

impl std::fmt::Debug for RawAuthHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAuthHeader")
            .field("fmt", &self.fmt())
            .field("type", &self.msg_type())
            .field("tid", &self.tid())
            .finish()
    }
}

/// Decoded authentication PDU.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuthPdu {
    pub fmt: AuthFmt,
    pub msg_type: AuthPduType,
    pub tid: u8,
    /// Nonce for challenges, mix output for replies.
    pub value: [u8; 8],
    /// Present on the wire iff `fmt` is multicast.
    pub group: u8,
}

impl AuthPdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut hdr = RawAuthHeader::default();
        hdr.set_fmt(self.fmt);
        hdr.set_msg_type(self.msg_type);
        hdr.set_tid(self.tid);
        let mut out = Vec::with_capacity(10);
        out.push(hdr.raw());
        out.extend_from_slice(&self.value);
        if self.fmt == AuthFmt::Multicast {
            out.push(self.group);
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AuthPduError> {
        if bytes.len() < 9 {
            return Err(AuthPduError::Truncated);
        }
        let hdr = RawAuthHeader::from_raw(bytes[0]);
        let mut value = [0u8; 8];
        value.copy_from_slice(&bytes[1..9]);
        let group = if hdr.fmt() == AuthFmt::Multicast {
            *bytes.get(9).ok_or(AuthPduError::Truncated)?
        } else {
            0
        };
        Ok(AuthPdu {
            fmt: hdr.fmt(),
            msg_type: hdr.msg_type(),
            tid: hdr.tid(),
            value,
            group,
        })
    }
}
