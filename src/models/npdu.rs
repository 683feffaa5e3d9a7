// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network PDU codec.
//!
//! First byte layout:
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +-------+-------+---------------+
//! |version|pdu_cls|   addr_fmt    |
//! +-------+-------+---------------+
//! ```
//!
//! followed by one domain-length byte (0, 1, 3 or 6), the domain id bytes,
//! the source subnet/node pair, the destination address in the format
//! selected by `addr_fmt`, and the enclosed TPDU/SPDU/AuthPDU/APDU.
//! Priority, alternate-path and delta-backlog ride in the link frame
//! descriptor, not in the NPDU. All multi-byte fields are big-endian.

use thiserror::Error;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::models::addressing::{
    DestAddr, MulticastAckAddress, SubnetNode, UNIQUE_NODE_ID_LEN,
};

pub const PROTOCOL_VERSION: u8 = 0;

const VERSION_MASK: u8 = 0b1100_0000;
const CLASS_MASK: u8 = 0b0011_0000;
const FMT_MASK: u8 = 0b0000_1111;

/// Class of the PDU enclosed in an NPDU. The values travel on the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PduClass {
    #[default]
    Tpdu = 0,
    Spdu = 1,
    AuthPdu = 2,
    Apdu = 3,
}

impl PduClass {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            0 => PduClass::Tpdu,
            1 => PduClass::Spdu,
            2 => PduClass::AuthPdu,
            _ => PduClass::Apdu,
        }
    }
}

/// Wire destination-address format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddrFmt {
    Broadcast = 0,
    Multicast = 1,
    SubnetNode = 2,
    UniqueId = 3,
    MulticastAck = 4,
    Turnaround = 5,
}

impl AddrFmt {
    pub fn from_bits(v: u8) -> Option<Self> {
        Some(match v {
            0 => AddrFmt::Broadcast,
            1 => AddrFmt::Multicast,
            2 => AddrFmt::SubnetNode,
            3 => AddrFmt::UniqueId,
            4 => AddrFmt::MulticastAck,
            5 => AddrFmt::Turnaround,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum NpduError {
    #[error("npdu truncated")]
    Truncated,
    #[error("bad protocol version {0}")]
    BadVersion(u8),
    #[error("unknown address format 0x{0:x}")]
    BadAddrFmt(u8),
    #[error("illegal domain length {0}")]
    BadDomainLen(u8),
}

/// Wire-safe first NPDU octet, transparent over `u8`.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct RawNpduHeader(u8);

impl RawNpduHeader {
    #[inline]
    pub const fn raw(&self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn from_raw(v: u8) -> Self {
        Self(v)
    }

    #[inline]
    pub const fn version(&self) -> u8 {
        (self.0 & VERSION_MASK) >> 6
    }

    #[inline]
    pub fn set_version(&mut self, v: u8) {
        self.0 = (self.0 & !VERSION_MASK) | ((v << 6) & VERSION_MASK);
    }

    #[inline]
    pub fn pdu_class(&self) -> PduClass {
        PduClass::from_bits((self.0 & CLASS_MASK) >> 4)
    }

    #[inline]
    pub fn set_pdu_class(&mut self, c: PduClass) {
        self.0 = (self.0 & !CLASS_MASK) | (((c as u8) << 4) & CLASS_MASK);
    }

    #[inline]
    pub fn addr_fmt(&self) -> Option<AddrFmt> {
        AddrFmt::from_bits(self.0 & FMT_MASK)
    }

    #[inline]
    pub fn set_addr_fmt(&mut self, f: AddrFmt) {
        self.0 = (self.0 & !FMT_MASK) | (f as u8 & FMT_MASK);
    }
}

impl std::fmt::Debug for RawNpduHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawNpduHeader")
            .field("version", &self.version())
            .field("pdu_class", &self.pdu_class())
            .field("addr_fmt", &self.addr_fmt())
            .finish()
    }
}

/// Decoded network PDU. Domain-index resolution is the network layer's
/// business; the codec only carries the raw domain bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Npdu {
    pub pdu_class: PduClass,
    pub domain_len: u8,
    pub domain_id: [u8; 6],
    pub src: SubnetNode,
    pub dest: DestAddr,
    pub payload: Vec<u8>,
}

impl Npdu {
    pub fn encode(&self) -> Vec<u8> {
        let mut hdr = RawNpduHeader::default();
        hdr.set_version(PROTOCOL_VERSION);
        hdr.set_pdu_class(self.pdu_class);
        let mut out = Vec::with_capacity(12 + self.payload.len());
        out.push(0); // placeholder for the header byte
        out.push(self.domain_len & 0x07);
        out.extend_from_slice(&self.domain_id[..self.domain_len as usize]);
        out.push(self.src.subnet);
        out.push(self.src.node & 0x7F);
        let fmt = match self.dest {
            DestAddr::Broadcast { subnet } => {
                out.push(subnet);
                AddrFmt::Broadcast
            },
            DestAddr::Multicast { group } => {
                out.push(group);
                AddrFmt::Multicast
            },
            DestAddr::SubnetNode(sn) => {
                out.push(sn.subnet);
                out.push(0x80 | (sn.node & 0x7F));
                AddrFmt::SubnetNode
            },
            DestAddr::UniqueId { subnet, unique_id } => {
                out.push(subnet);
                out.extend_from_slice(&unique_id);
                AddrFmt::UniqueId
            },
            DestAddr::MulticastAck(ack) => {
                out.push(ack.subnet_node.subnet);
                out.push(ack.subnet_node.node & 0x7F);
                out.push(ack.group.group);
                out.push(ack.group.member);
                AddrFmt::MulticastAck
            },
            DestAddr::Turnaround => AddrFmt::Turnaround,
        };
        hdr.set_addr_fmt(fmt);
        out[0] = hdr.raw();
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NpduError> {
        fn take_n<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8], NpduError> {
            let slice = bytes.get(*pos..*pos + n).ok_or(NpduError::Truncated)?;
            *pos += n;
            Ok(slice)
        }
        let mut pos = 0usize;
        let mut take = |n: usize| take_n(bytes, &mut pos, n);

        let hdr = RawNpduHeader::from_raw(take(1)?[0]);
        if hdr.version() != PROTOCOL_VERSION {
            return Err(NpduError::BadVersion(hdr.version()));
        }
        let fmt = hdr
            .addr_fmt()
            .ok_or(NpduError::BadAddrFmt(hdr.raw() & FMT_MASK))?;

        let domain_len = take(1)?[0] & 0x07;
        if !matches!(domain_len, 0 | 1 | 3 | 6) {
            return Err(NpduError::BadDomainLen(domain_len));
        }
        let mut domain_id = [0u8; 6];
        domain_id[..domain_len as usize].copy_from_slice(take(domain_len as usize)?);

        let src_bytes = take(2)?;
        let src = SubnetNode::new(src_bytes[0], src_bytes[1] & 0x7F);

        let dest = match fmt {
            AddrFmt::Broadcast => DestAddr::Broadcast { subnet: take(1)?[0] },
            AddrFmt::Multicast => DestAddr::Multicast { group: take(1)?[0] },
            AddrFmt::SubnetNode => {
                let b = take(2)?;
                DestAddr::SubnetNode(SubnetNode::new(b[0], b[1] & 0x7F))
            },
            AddrFmt::UniqueId => {
                let subnet = take(1)?[0];
                let mut unique_id = [0u8; UNIQUE_NODE_ID_LEN];
                unique_id.copy_from_slice(take(UNIQUE_NODE_ID_LEN)?);
                DestAddr::UniqueId { subnet, unique_id }
            },
            AddrFmt::MulticastAck => {
                let b = take(4)?;
                DestAddr::MulticastAck(MulticastAckAddress {
                    subnet_node: SubnetNode::new(b[0], b[1] & 0x7F),
                    group: crate::models::addressing::GroupAddress { group: b[2], member: b[3] },
                })
            },
            AddrFmt::Turnaround => DestAddr::Turnaround,
        };

        Ok(Npdu {
            pdu_class: hdr.pdu_class(),
            domain_len,
            domain_id,
            src,
            dest,
            payload: bytes[pos..].to_vec(),
        })
    }
}
