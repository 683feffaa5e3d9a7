// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Enhanced-proxy wire structures.
//!
//! A proxy APDU (code 0x4D) is a header byte, `count` packed repeater
//! subnet/node entries (one byte each when uniform addressing is on, two
//! otherwise), a tx-control byte, and then either the rest of the chain
//! (when this node is a repeater) or a SICB naming the final target (when
//! this node is the agent).

use thiserror::Error;

use crate::models::addressing::{AUTH_KEY_LEN, OMA_KEY_LEN};

/// `uniform_by_dest:1 | long_timer:1 | all_agents:1 | uniform_by_src:1 | count:4`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub uniform_by_dest: bool,
    pub long_timer: bool,
    pub all_agents: bool,
    pub uniform_by_src: bool,
    pub count: u8,
}

impl ProxyHeader {
    pub fn from_byte(b: u8) -> Self {
        ProxyHeader {
            uniform_by_dest: b & 0x80 != 0,
            long_timer: b & 0x40 != 0,
            all_agents: b & 0x20 != 0,
            uniform_by_src: b & 0x10 != 0,
            count: b & 0x0F,
        }
    }

    pub fn to_byte(self) -> u8 {
        (self.uniform_by_dest as u8) << 7
            | (self.long_timer as u8) << 6
            | (self.all_agents as u8) << 5
            | (self.uniform_by_src as u8) << 4
            | (self.count & 0x0F)
    }

    pub fn uniform(&self) -> bool {
        self.uniform_by_dest || self.uniform_by_src
    }
}

/// `retry:4 | timer:4`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProxyTxCtrl {
    pub retry: u8,
    pub timer: u8,
}

impl ProxyTxCtrl {
    pub fn from_byte(b: u8) -> Self {
        ProxyTxCtrl { retry: b >> 4, timer: b & 0x0F }
    }

    pub fn to_byte(self) -> u8 {
        (self.retry << 4) | (self.timer & 0x0F)
    }
}

/// Final-target address kind in the SICB (three bits; bit 2 doubles as the
/// "compact" marker for most kinds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxyAddressType {
    Group = 0,
    SubnetNode = 1,
    NeuronId = 2,
    Broadcast = 3,
    GroupCompact = 4,
    SubnetNodeCompactSrc = 5,
    NeuronIdCompact = 6,
    SubnetNodeCompactDest = 7,
}

impl ProxyAddressType {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x7 {
            0 => ProxyAddressType::Group,
            1 => ProxyAddressType::SubnetNode,
            2 => ProxyAddressType::NeuronId,
            3 => ProxyAddressType::Broadcast,
            4 => ProxyAddressType::GroupCompact,
            5 => ProxyAddressType::SubnetNodeCompactSrc,
            6 => ProxyAddressType::NeuronIdCompact,
            _ => ProxyAddressType::SubnetNodeCompactDest,
        }
    }

    /// Bytes the target address occupies on the wire.
    pub fn addr_len(self) -> usize {
        match self {
            ProxyAddressType::Group => 2,
            ProxyAddressType::SubnetNode => 2,
            ProxyAddressType::NeuronId => 7,
            ProxyAddressType::Broadcast => 2,
            ProxyAddressType::GroupCompact => 1,
            ProxyAddressType::SubnetNodeCompactSrc => 1,
            ProxyAddressType::NeuronIdCompact => 6,
            ProxyAddressType::SubnetNodeCompactDest => 1,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProxySicbMode {
    #[default]
    Normal = 0,
    ZeroSync = 1,
    AltKey = 2,
    Attenuate = 3,
}

impl ProxySicbMode {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => ProxySicbMode::Normal,
            1 => ProxySicbMode::ZeroSync,
            2 => ProxySicbMode::AltKey,
            _ => ProxySicbMode::Attenuate,
        }
    }
}

/// Agent instruction block: `type:3 | path:1 | service:2 | mode:2` plus the
/// tx-control byte. No auth bit (inherited), no tag (correlated through the
/// receive record), no length (implied by the packet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxySicb {
    pub addr_type: ProxyAddressType,
    pub path: bool,
    /// 0=ACKD 1=UNACK_RPT 2=UNACKD 3=REQUEST
    pub service: u8,
    pub mode: ProxySicbMode,
    pub txctrl: ProxyTxCtrl,
}

impl ProxySicb {
    pub const WIRE_LEN: usize = 2;

    pub fn parse(bytes: &[u8]) -> Result<Self, ProxyWireError> {
        if bytes.len() < Self::WIRE_LEN {
            return Err(ProxyWireError::Truncated);
        }
        let b = bytes[0];
        Ok(ProxySicb {
            addr_type: ProxyAddressType::from_bits(b >> 5),
            path: b & 0x10 != 0,
            service: (b >> 2) & 0x3,
            mode: ProxySicbMode::from_bits(b),
            txctrl: ProxyTxCtrl::from_byte(bytes[1]),
        })
    }

    pub fn encode(&self) -> [u8; 2] {
        [
            ((self.addr_type as u8) << 5)
                | (self.path as u8) << 4
                | (self.service & 0x3) << 2
                | self.mode as u8,
            self.txctrl.to_byte(),
        ]
    }
}

/// Alternate-key block following the SICB when mode is `AltKey`. The key
/// bytes are deltas added to the configured domain keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuthKey {
    pub oma: bool,
    pub delta: Vec<u8>,
}

impl ProxyAuthKey {
    pub fn parse(bytes: &[u8]) -> Result<Self, ProxyWireError> {
        let (&head, rest) = bytes.split_first().ok_or(ProxyWireError::Truncated)?;
        let oma = head & 0x03 == 1;
        let len = if oma { OMA_KEY_LEN } else { AUTH_KEY_LEN };
        let delta = rest.get(..len).ok_or(ProxyWireError::Truncated)?;
        Ok(ProxyAuthKey { oma, delta: delta.to_vec() })
    }

    pub fn wire_len(&self) -> usize {
        1 + self.delta.len()
    }
}

#[derive(Debug, Error)]
pub enum ProxyWireError {
    #[error("proxy pdu truncated")]
    Truncated,
    #[error("bad proxy target address type")]
    BadAddressType,
}
