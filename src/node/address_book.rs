// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Domain, address and network-variable tables with their invariants,
//! lookups, wire encodings and the fixed timer-decode tables.

use anyhow::{Result, bail, ensure};

use crate::models::addressing::{
    AUTH_KEY_LEN, DOMAIN_ID_LEN, MAX_DOMAINS, OMA_KEY_LEN, ServiceType,
};

/// Address-table index meaning "no address".
pub const NO_ADDRESS_INDEX: u8 = 0x0F;

/// NV selector meaning "unused".
pub const UNUSED_SELECTOR: u16 = 0xFFFF;
pub const MAX_SELECTOR: u16 = 0x3FFF;
pub const MAX_BOUND_SELECTOR: u16 = 0x2FFF;

pub const MAX_NV_ALIASES: usize = 15;

/// Buffer-size encoding table (4-bit index → bytes).
const BUF_SIZE_CODE: [u16; 16] =
    [255, 20, 20, 21, 22, 24, 26, 30, 34, 42, 50, 66, 82, 114, 146, 210];
/// Buffer-count encoding table.
const BUF_CNT_CODE: [u16; 16] = [0, 1, 1, 2, 3, 5, 7, 11, 15, 23, 31, 47, 63, 95, 127, 191];
/// Repeat-timer encoding table, milliseconds.
const RPT_TIMER_CODE: [u16; 16] =
    [16, 24, 32, 48, 64, 96, 128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072];
/// Receive-timer encoding table, milliseconds.
const RCV_TIMER_CODE: [u16; 16] = [
    128, 192, 256, 384, 512, 768, 1024, 1536, 2048, 3072, 4096, 6144, 8192, 12288, 16384, 24576,
];

pub fn decode_buffer_size(code: u8) -> u16 {
    BUF_SIZE_CODE[(code & 0x0F) as usize]
}

pub fn decode_buffer_cnt(code: u8) -> u16 {
    BUF_CNT_CODE[(code & 0x0F) as usize]
}

pub fn decode_rpt_timer(code: u8) -> u32 {
    RPT_TIMER_CODE[(code & 0x0F) as usize] as u32
}

pub fn decode_rcv_timer(code: u8) -> u32 {
    RCV_TIMER_CODE[(code & 0x0F) as usize] as u32
}

/// Transmit-timer decode: base 16 ms, doubling every two index steps with a
/// 1.5x interleave; the long-timer bit shifts the index up by 16 steps.
pub fn decode_tx_timer(code: u8, long_timer: bool) -> u32 {
    let mut idx = (code & 0x0F) as u32;
    if long_timer {
        idx += 16;
    }
    let mut v: u32 = 16 << (idx / 2);
    if idx & 1 != 0 {
        v += v / 2;
    }
    v
}

/// XOR fold over a byte region; the protocol's configuration checksum.
pub fn checksum8(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Authentication flavor of a domain. The value 3 is a legacy alias for
/// standard written by old tools that set all ones in the length byte.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    #[default]
    Standard = 0,
    OpenMedia = 1,
    StandardLegacy = 3,
}

impl AuthType {
    pub fn from_bits(v: u8) -> Self {
        match v & 0x3 {
            1 => AuthType::OpenMedia,
            3 => AuthType::StandardLegacy,
            _ => AuthType::Standard,
        }
    }
}

/// One domain table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainEntry {
    pub id: [u8; DOMAIN_ID_LEN],
    pub subnet: u8,
    pub node: u8,
    pub clone_domain: bool,
    pub invalid: bool,
    pub auth_type: AuthType,
    pub len: u8,
    pub key: [u8; AUTH_KEY_LEN],
}

impl Default for DomainEntry {
    fn default() -> Self {
        DomainEntry {
            id: [0; DOMAIN_ID_LEN],
            subnet: 0,
            node: 0,
            clone_domain: true,
            invalid: true,
            auth_type: AuthType::Standard,
            len: 0,
            key: [0; AUTH_KEY_LEN],
        }
    }
}

impl DomainEntry {
    pub fn is_oma(&self) -> bool {
        self.auth_type == AuthType::OpenMedia
    }

    /// Wire form: 6 id bytes, subnet, `clone:1|node:7`,
    /// `invalid:1|unused:2|authType:2|len:3`, then the key when requested
    /// (6 bytes standard, 12 for open-media spanning both slots).
    pub fn encode(&self, key: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + key.map_or(0, <[u8]>::len));
        out.extend_from_slice(&self.id);
        out.push(self.subnet);
        out.push((self.clone_domain as u8) << 7 | (self.node & 0x7F));
        out.push(
            (self.invalid as u8) << 7 | ((self.auth_type as u8) & 0x3) << 3 | (self.len & 0x7),
        );
        if let Some(k) = key {
            out.extend_from_slice(k);
        }
        out
    }

    /// Parse the 9-byte fixed part; the caller deals with key bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 9, "domain entry too short: {} bytes", bytes.len());
        let mut id = [0u8; DOMAIN_ID_LEN];
        id.copy_from_slice(&bytes[..6]);
        let flags = bytes[8];
        let len = flags & 0x7;
        ensure!(matches!(len, 0 | 1 | 3 | 6), "illegal domain length {len}");
        Ok(DomainEntry {
            id,
            subnet: bytes[6],
            node: bytes[7] & 0x7F,
            clone_domain: bytes[7] & 0x80 != 0,
            invalid: flags & 0x80 != 0,
            auth_type: AuthType::from_bits(flags >> 3),
            len,
            key: [0; AUTH_KEY_LEN],
        })
    }
}

/// Common transmit parameters carried by every non-group address entry.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub rpt_timer: u8,
    pub retry: u8,
    pub tx_timer: u8,
    pub long_timer: bool,
}

/// One address-table entry; five shapes selected by the leading
/// discriminator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum AddressEntry {
    #[default]
    Unbound,
    Turnaround {
        tx: TxParams,
    },
    SubnetNode {
        domain_index: u8,
        subnet: u8,
        node: u8,
        tx: TxParams,
    },
    /// Routing subnet only; the unique id itself travels in the message.
    UniqueId {
        domain_index: u8,
        subnet: u8,
        tx: TxParams,
        rcv_timer: u8,
    },
    Broadcast {
        domain_index: u8,
        subnet: u8,
        backlog: u8,
        max_responses: u8,
        tx: TxParams,
    },
    Group {
        domain_index: u8,
        group: u8,
        /// Declared group size; 0 means "huge group" (unackd only).
        size: u8,
        member: u8,
        rcv_timer: u8,
        tx: TxParams,
    },
}

impl AddressEntry {
    pub fn is_group(&self) -> bool {
        matches!(self, AddressEntry::Group { .. })
    }

    /// 5-byte wire form used by the address table and network management.
    pub fn encode(&self) -> [u8; 5] {
        match *self {
            AddressEntry::Unbound => [0; 5],
            AddressEntry::Turnaround { tx } => [
                0,
                1,
                tx.rpt_timer << 4 | (tx.retry & 0xF),
                tx.tx_timer & 0xF,
                0,
            ],
            AddressEntry::SubnetNode { domain_index, subnet, node, tx } => [
                0x01 | (tx.long_timer as u8) << 4,
                (domain_index & 1) << 7 | (node & 0x7F),
                tx.rpt_timer << 4 | (tx.retry & 0xF),
                tx.tx_timer & 0xF,
                subnet,
            ],
            AddressEntry::UniqueId { domain_index, subnet, tx, rcv_timer } => [
                0x02 | (tx.long_timer as u8) << 4,
                (domain_index & 1) << 7,
                tx.rpt_timer << 4 | (tx.retry & 0xF),
                rcv_timer << 4 | (tx.tx_timer & 0xF),
                subnet,
            ],
            AddressEntry::Broadcast { domain_index, subnet, backlog, max_responses, tx } => [
                0x03 | (tx.long_timer as u8) << 4,
                (domain_index & 1) << 7 | (backlog & 0x3F),
                tx.rpt_timer << 4 | (tx.retry & 0xF),
                max_responses << 4 | (tx.tx_timer & 0xF),
                subnet,
            ],
            AddressEntry::Group { domain_index, group, size, member, rcv_timer, tx } => [
                0x80 | (size & 0x7F),
                (domain_index & 1) << 7 | (member & 0x7F),
                tx.rpt_timer << 4 | (tx.retry & 0xF),
                rcv_timer << 4 | (tx.tx_timer & 0xF),
                group,
            ],
        }
    }

    pub fn decode(b: &[u8; 5]) -> Result<Self> {
        let tx = TxParams {
            rpt_timer: b[2] >> 4,
            retry: b[2] & 0xF,
            tx_timer: b[3] & 0xF,
            long_timer: b[0] & 0x10 != 0,
        };
        if b[0] & 0x80 != 0 {
            return Ok(AddressEntry::Group {
                domain_index: b[1] >> 7,
                group: b[4],
                size: b[0] & 0x7F,
                member: b[1] & 0x7F,
                rcv_timer: b[3] >> 4,
                tx,
            });
        }
        Ok(match b[0] & 0x07 {
            0 => {
                if b[1] & 0x01 != 0 {
                    AddressEntry::Turnaround { tx }
                } else {
                    AddressEntry::Unbound
                }
            },
            1 => AddressEntry::SubnetNode {
                domain_index: b[1] >> 7,
                subnet: b[4],
                node: b[1] & 0x7F,
                tx,
            },
            2 => AddressEntry::UniqueId {
                domain_index: b[1] >> 7,
                subnet: b[4],
                tx,
                rcv_timer: b[3] >> 4,
            },
            3 => AddressEntry::Broadcast {
                domain_index: b[1] >> 7,
                subnet: b[4],
                backlog: b[1] & 0x3F,
                max_responses: b[3] >> 4,
                tx,
            },
            m => bail!("bad address entry mode {m}"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NvDirection {
    #[default]
    Input = 0,
    Output = 1,
}

/// Network-variable service encoding (two bits on the wire).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NvService {
    #[default]
    Ackd = 0,
    UnackRpt = 1,
    Unackd = 2,
}

impl NvService {
    pub fn to_service_type(self) -> ServiceType {
        match self {
            NvService::Ackd => ServiceType::Ackd,
            NvService::UnackRpt => ServiceType::UnackRpt,
            NvService::Unackd => ServiceType::Unackd,
        }
    }
}

/// One NV configuration entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvConfig {
    pub priority: bool,
    pub direction: NvDirection,
    pub selector: u16,
    pub turnaround: bool,
    pub service: NvService,
    pub auth: bool,
    pub addr_index: u8,
}

impl Default for NvConfig {
    fn default() -> Self {
        NvConfig {
            priority: false,
            direction: NvDirection::Input,
            selector: UNUSED_SELECTOR & MAX_SELECTOR,
            turnaround: false,
            service: NvService::Ackd,
            auth: false,
            addr_index: NO_ADDRESS_INDEX,
        }
    }
}

impl NvConfig {
    pub fn is_bound(&self) -> bool {
        self.addr_index != NO_ADDRESS_INDEX || self.turnaround
    }

    /// 3-byte wire form: `priority:1|dir:1|selHi:6`, `selLo:8`,
    /// `turnaround:1|service:2|auth:1|addrIndex:4`.
    pub fn encode(&self) -> [u8; 3] {
        [
            (self.priority as u8) << 7
                | (self.direction as u8) << 6
                | ((self.selector >> 8) as u8 & 0x3F),
            self.selector as u8,
            (self.turnaround as u8) << 7
                | (self.service as u8) << 5
                | (self.auth as u8) << 4
                | (self.addr_index & 0xF),
        ]
    }

    pub fn decode(b: &[u8; 3]) -> Self {
        NvConfig {
            priority: b[0] & 0x80 != 0,
            direction: if b[0] & 0x40 != 0 { NvDirection::Output } else { NvDirection::Input },
            selector: ((b[0] as u16 & 0x3F) << 8) | b[1] as u16,
            turnaround: b[2] & 0x80 != 0,
            service: match (b[2] >> 5) & 0x3 {
                1 => NvService::UnackRpt,
                2 => NvService::Unackd,
                _ => NvService::Ackd,
            },
            auth: b[2] & 0x10 != 0,
            addr_index: b[2] & 0xF,
        }
    }
}

/// Alias entry: an NV configuration plus the primary it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvAlias {
    pub nv: NvConfig,
    pub primary: u8,
    /// Used when `primary` is 0xFF (host nodes with wide tables).
    pub host_primary: u16,
}

impl Default for NvAlias {
    fn default() -> Self {
        NvAlias { nv: NvConfig::default(), primary: 0xFF, host_primary: 0xFFFF }
    }
}

/// Domain, address and NV tables with the lookups the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBook {
    pub domains: [DomainEntry; MAX_DOMAINS],
    pub addresses: Vec<AddressEntry>,
    pub nv_configs: Vec<NvConfig>,
    pub nv_aliases: Vec<NvAlias>,
}

impl Default for AddressBook {
    fn default() -> Self {
        AddressBook {
            domains: [DomainEntry::default(), DomainEntry::default()],
            addresses: vec![AddressEntry::Unbound; 15],
            nv_configs: Vec::new(),
            nv_aliases: Vec::new(),
        }
    }
}

impl AddressBook {
    pub fn domain(&self, index: u8) -> Option<&DomainEntry> {
        self.domains.get(index as usize)
    }

    pub fn update_domain(&mut self, index: u8, entry: DomainEntry, include_key: bool) -> Result<()> {
        ensure!((index as usize) < MAX_DOMAINS, "domain index {index} out of range");
        let slot = &mut self.domains[index as usize];
        let key = slot.key;
        *slot = entry;
        if !include_key {
            slot.key = key;
        }
        Ok(())
    }

    /// The 12-byte open-media key spans both domain slots.
    pub fn oma_key(&self) -> [u8; OMA_KEY_LEN] {
        let mut key = [0u8; OMA_KEY_LEN];
        key[..AUTH_KEY_LEN].copy_from_slice(&self.domains[0].key);
        key[AUTH_KEY_LEN..].copy_from_slice(&self.domains[1].key);
        key
    }

    pub fn address(&self, index: u8) -> Option<&AddressEntry> {
        self.addresses.get(index as usize)
    }

    pub fn update_address(&mut self, index: u8, entry: AddressEntry) -> Result<()> {
        ensure!((index as usize) < self.addresses.len(), "address index {index} out of range");
        self.addresses[index as usize] = entry;
        Ok(())
    }

    /// Member number of this node within `group` on `domain_index`.
    pub fn is_group_member(&self, domain_index: u8, group: u8) -> Option<u8> {
        self.addresses.iter().find_map(|e| match *e {
            AddressEntry::Group { domain_index: d, group: g, member, .. }
                if d == domain_index && g == group =>
            {
                Some(member)
            },
            _ => None,
        })
    }

    /// Address-table index of the entry for `group` on `domain_index`.
    pub fn find_group_address(&self, domain_index: u8, group: u8) -> Option<u8> {
        self.addresses.iter().position(|e| {
            matches!(*e, AddressEntry::Group { domain_index: d, group: g, .. }
                if d == domain_index && g == group)
        })
        .map(|i| i as u8)
    }

    /// Largest receive-timer value across every entry for `group` in
    /// `domain_index`, decoded to milliseconds.
    pub fn max_group_rcv_timer(&self, domain_index: u8, group: u8) -> u32 {
        self.addresses
            .iter()
            .filter_map(|e| match *e {
                AddressEntry::Group { domain_index: d, group: g, rcv_timer, .. }
                    if d == domain_index && g == group =>
                {
                    Some(decode_rcv_timer(rcv_timer))
                },
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn nv(&self, index: u16) -> Option<&NvConfig> {
        self.nv_configs.get(index as usize)
    }

    pub fn update_nv(&mut self, index: u16, nv: NvConfig) -> Result<()> {
        ensure!(nv.selector <= MAX_SELECTOR, "selector 0x{:04x} out of range", nv.selector);
        if nv.is_bound() {
            ensure!(
                nv.selector <= MAX_BOUND_SELECTOR,
                "bound selector 0x{:04x} out of range",
                nv.selector
            );
        }
        let slot = self
            .nv_configs
            .get_mut(index as usize)
            .ok_or_else(|| anyhow::anyhow!("nv index {index} out of range"))?;
        *slot = nv;
        Ok(())
    }

    /// Resolve an NV index (primary or alias) to its primary index.
    pub fn primary_of(&self, index: u16) -> Option<u16> {
        let primaries = self.nv_configs.len() as u16;
        if index < primaries {
            return Some(index);
        }
        let alias = self.nv_aliases.get((index - primaries) as usize)?;
        let primary = if alias.primary == 0xFF {
            alias.host_primary
        } else {
            alias.primary as u16
        };
        (primary < primaries).then_some(primary)
    }
}
