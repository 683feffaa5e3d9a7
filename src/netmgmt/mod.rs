// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network management and diagnostics: decodes NM/ND requests and maps
//! them to address-book mutations, status reads and state changes.
//!
//! Every command has a request/success/failure code triple derived by
//! masking (see [`crate::models::apdu`]). Mutations flow through the
//! address book and are followed by an NVM write.

pub mod codes {
    pub const NM_EXPANDED: u8 = 0x00;
    pub const NM_QUERY_ID: u8 = 0x01;
    pub const NM_RESPOND_TO_QUERY: u8 = 0x02;
    pub const NM_UPDATE_DOMAIN: u8 = 0x03;
    pub const NM_LEAVE_DOMAIN: u8 = 0x04;
    pub const NM_UPDATE_KEY: u8 = 0x05;
    pub const NM_UPDATE_ADDR: u8 = 0x06;
    pub const NM_QUERY_ADDR: u8 = 0x07;
    pub const NM_QUERY_NV_CNFG: u8 = 0x08;
    pub const NM_UPDATE_GROUP_ADDR: u8 = 0x09;
    pub const NM_QUERY_DOMAIN: u8 = 0x0A;
    pub const NM_UPDATE_NV_CNFG: u8 = 0x0B;
    pub const NM_SET_NODE_MODE: u8 = 0x0C;
    pub const NM_READ_MEMORY: u8 = 0x0D;
    pub const NM_WRITE_MEMORY: u8 = 0x0E;
    pub const NM_CHECKSUM_RECALC: u8 = 0x0F;
    pub const NM_WINK: u8 = 0x10;
    pub const NM_MEMORY_REFRESH: u8 = 0x11;
    pub const NM_QUERY_SNVT: u8 = 0x12;
    pub const NM_NV_FETCH: u8 = 0x13;
    pub const NM_MANUAL_SERVICE_REQUEST: u8 = 0x1F;

    // Expanded command set, selected by NM_EXPANDED + a subcommand byte.
    pub const NME_QUERY_VERSION: u8 = 0x01;
    pub const NME_UPDATE_DOMAIN_NO_KEY: u8 = 0x07;
    pub const NME_REPORT_DOMAIN_NO_KEY: u8 = 0x08;
    pub const NME_REPORT_KEY: u8 = 0x09;
    pub const NME_UPDATE_KEY: u8 = 0x0A;

    pub const ND_QUERY_STATUS: u8 = 0x01;
    pub const ND_PROXY_COMMAND: u8 = 0x02;
    pub const ND_CLEAR_STATUS: u8 = 0x03;
    pub const ND_QUERY_XCVR: u8 = 0x04;
    pub const ND_QUERY_STATUS_FLEX: u8 = 0x06;
    pub const ND_QUERY_XCVR_BIDIR: u8 = 0x07;
    pub const ND_COMPUTE_PHASE: u8 = 0x08;
    pub const ND_GET_FULL_VERSION: u8 = 0x09;

    /// Firmware version reported by query-status and query-version.
    pub const VERSION_NUMBER: u8 = 2;
}

use bitflags::bitflags;
use tracing::{debug, warn};

use crate::{
    app::{AppIndication, IndicationKind},
    models::{
        addressing::ServiceType,
        apdu::{NM_OPCODE_MASK, ND_OPCODE_MASK, nd_response_code, nm_response_code},
    },
    node::{
        ConfigMode, LcsError, NodeState, ResetCause,
        address_book::{AddressEntry, DomainEntry, NvConfig},
    },
    stack::Stack,
};

bitflags! {
    /// Capability bits reported by the expanded query-version command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u8 {
        const OMA = 0x01;
        const PROXY = 0x02;
        const PHASE = 0x04;
        const SSI = 0x08;
    }
}

/// Memory-access spaces for read/write memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryMode {
    Absolute,
    ReadOnlyRelative,
    ConfigRelative,
    StatsRelative,
}

impl MemoryMode {
    fn from_byte(v: u8) -> Option<Self> {
        Some(match v {
            0 => MemoryMode::Absolute,
            1 => MemoryMode::ReadOnlyRelative,
            2 => MemoryMode::ConfigRelative,
            3 => MemoryMode::StatsRelative,
            _ => return None,
        })
    }
}

/// Post-write action selector for write-memory / checksum-recalc.
const FORM_BOTH_CS_RECALC: u8 = 1;
const FORM_CNFG_CS_RECALC: u8 = 4;
const FORM_ACTION_RESET: u8 = 8;

/// Outcome of one management command.
enum Reply {
    Success(Vec<u8>),
    Failure,
    /// Command consumed without any response (announcements and the like).
    None,
}

impl Stack {
    /// Handle one network-management request. Returns false when the item
    /// must stay queued (response queue full).
    pub(crate) fn handle_nm(&mut self, item: &AppIndication) -> bool {
        let op = item.apdu.code & NM_OPCODE_MASK;
        let data = &item.apdu.data;

        // Writes may be restricted to authenticated senders.
        if self.eep.config.nm_auth && !item.auth && nm_is_write(op) {
            debug!(op, "nm: unauthenticated write rejected");
            return self.nm_reply(item, Reply::Failure);
        }

        let reply = match op {
            codes::NM_EXPANDED => self.nm_expanded(data),
            codes::NM_QUERY_ID => self.nm_query_id(data),
            codes::NM_RESPOND_TO_QUERY => {
                self.app.select_query = data.first().copied().unwrap_or(0) != 0;
                Reply::Success(Vec::new())
            },
            codes::NM_UPDATE_DOMAIN => self.nm_update_domain(data, true),
            codes::NM_LEAVE_DOMAIN => self.nm_leave_domain(data),
            codes::NM_UPDATE_KEY => self.nm_update_key(data, 6),
            codes::NM_UPDATE_ADDR => self.nm_update_addr(data),
            codes::NM_QUERY_ADDR => self.nm_query_addr(data),
            codes::NM_QUERY_NV_CNFG => self.nm_query_nv(data),
            codes::NM_UPDATE_GROUP_ADDR => self.nm_update_group_addr(data),
            codes::NM_QUERY_DOMAIN => self.nm_query_domain(data, true),
            codes::NM_UPDATE_NV_CNFG => self.nm_update_nv(data),
            codes::NM_SET_NODE_MODE => self.nm_set_node_mode(data),
            codes::NM_READ_MEMORY => self.nm_read_memory(data),
            codes::NM_WRITE_MEMORY => self.nm_write_memory(data),
            codes::NM_CHECKSUM_RECALC => {
                self.eep.config_checksum = self.eep.compute_config_checksum();
                self.write_nvm();
                Reply::Success(Vec::new())
            },
            codes::NM_WINK => self.nm_wink(data),
            codes::NM_MANUAL_SERVICE_REQUEST => Reply::None,
            _ => {
                debug!(op, "nm: unsupported command");
                Reply::Failure
            },
        };
        self.nm_reply(item, reply)
    }

    /// Handle one network-diagnostic request.
    pub(crate) fn handle_nd(&mut self, item: &AppIndication) -> bool {
        let op = item.apdu.code & ND_OPCODE_MASK;
        let mut flex = false;
        let reply = match op {
            codes::ND_QUERY_STATUS => Reply::Success(self.query_status_bytes()),
            codes::ND_QUERY_STATUS_FLEX => {
                flex = true;
                Reply::Success(self.query_status_bytes())
            },
            codes::ND_CLEAR_STATUS => {
                self.stats.clear();
                self.reset_cause = ResetCause::Cleared;
                self.record_error(LcsError::NoErrors);
                Reply::Success(Vec::new())
            },
            codes::ND_QUERY_XCVR | codes::ND_QUERY_XCVR_BIDIR => {
                Reply::Success(self.eep.config.xcvr_params.to_vec())
            },
            codes::ND_COMPUTE_PHASE => Reply::Success(vec![0]),
            codes::ND_GET_FULL_VERSION => Reply::Success(vec![codes::VERSION_NUMBER, 0]),
            codes::ND_PROXY_COMMAND => {
                // The classic proxy is superseded by the enhanced relay.
                debug!("nd: classic proxy command rejected");
                Reply::Failure
            },
            _ => {
                debug!(op, "nd: unsupported command");
                Reply::Failure
            },
        };
        self.nd_reply(item, reply, flex)
    }

    fn nm_reply(&mut self, item: &AppIndication, reply: Reply) -> bool {
        if item.service != ServiceType::Request {
            return true; // acted, nothing to answer
        }
        match reply {
            Reply::Success(data) => {
                self.send_response(item.req_id, nm_response_code(item.apdu.code, true), &data)
            },
            Reply::Failure => {
                self.send_response(item.req_id, nm_response_code(item.apdu.code, false), &[])
            },
            Reply::None => self.send_null_response(item.req_id),
        }
    }

    fn nd_reply(&mut self, item: &AppIndication, reply: Reply, flex: bool) -> bool {
        if item.service != ServiceType::Request {
            return true;
        }
        match reply {
            Reply::Success(data) => self.send_response_opts(
                item.req_id,
                nd_response_code(item.apdu.code, true),
                &data,
                flex,
            ),
            Reply::Failure => {
                self.send_response(item.req_id, nd_response_code(item.apdu.code, false), &[])
            },
            Reply::None => self.send_null_response(item.req_id),
        }
    }

    // ----------------------------------------------------------------- //
    // NM commands
    // ----------------------------------------------------------------- //

    fn nm_expanded(&mut self, data: &[u8]) -> Reply {
        let Some((&sub, rest)) = data.split_first() else {
            return Reply::Failure;
        };
        match sub {
            codes::NME_QUERY_VERSION => {
                let mut caps = Capabilities::PROXY | Capabilities::SSI;
                if self.eep.book.domains[0].is_oma() {
                    caps |= Capabilities::OMA;
                }
                Reply::Success(vec![codes::VERSION_NUMBER, caps.bits()])
            },
            codes::NME_UPDATE_DOMAIN_NO_KEY => self.nm_update_domain(rest, false),
            codes::NME_REPORT_DOMAIN_NO_KEY => self.nm_query_domain(rest, false),
            codes::NME_REPORT_KEY => {
                let index = rest.first().copied().unwrap_or(0);
                match self.eep.book.domain(index) {
                    Some(d) if d.is_oma() => Reply::Success(self.eep.book.oma_key().to_vec()),
                    Some(d) => Reply::Success(d.key.to_vec()),
                    None => Reply::Failure,
                }
            },
            codes::NME_UPDATE_KEY => self.nm_update_key(rest, rest.len().saturating_sub(1)),
            _ => {
                debug!(sub, "nm: unsupported expanded command");
                Reply::Failure
            },
        }
    }

    fn nm_query_id(&mut self, data: &[u8]) -> Reply {
        let selector = data.first().copied().unwrap_or(0);
        let matches = match selector {
            0 => self.node_unconfigured(),
            1 => self.app.select_query,
            2 => self.app.select_query && self.node_unconfigured(),
            _ => false,
        };
        if !matches {
            return Reply::None;
        }
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.eep.read_only.unique_node_id);
        out.extend_from_slice(&self.eep.read_only.prog_id);
        Reply::Success(out)
    }

    fn nm_update_domain(&mut self, data: &[u8], include_key: bool) -> Reply {
        let Some((&index, rest)) = data.split_first() else {
            return Reply::Failure;
        };
        let Ok(mut entry) = DomainEntry::decode(rest) else {
            return Reply::Failure;
        };
        let has_key = include_key && rest.len() >= 9 + 6;
        if has_key {
            entry.key.copy_from_slice(&rest[9..15]);
            // A 12-byte open-media key spans both domain slots.
            if rest.len() >= 9 + 12 && (index as usize) < 2 {
                let other = 1 - index as usize;
                self.eep.book.domains[other]
                    .key
                    .copy_from_slice(&rest[15..21]);
            }
        }
        match self.eep.book.update_domain(index, entry, has_key) {
            Ok(()) => {
                self.config_changed();
                Reply::Success(Vec::new())
            },
            Err(_) => Reply::Failure,
        }
    }

    fn nm_leave_domain(&mut self, data: &[u8]) -> Reply {
        let index = data.first().copied().unwrap_or(0xFF);
        let Some(entry) = self.eep.book.domain(index).copied() else {
            return Reply::Failure;
        };
        let cleared = DomainEntry { invalid: true, ..entry };
        if self.eep.book.update_domain(index, cleared, true).is_err() {
            return Reply::Failure;
        }
        self.config_changed();
        Reply::Success(Vec::new())
    }

    /// Key updates are deltas added byte-wise to the current key.
    fn nm_update_key(&mut self, data: &[u8], key_len: usize) -> Reply {
        let Some((&index, delta)) = data.split_first() else {
            return Reply::Failure;
        };
        if delta.len() < key_len || key_len == 0 || (index as usize) >= 2 {
            return Reply::Failure;
        }
        for (k, &d) in delta.iter().enumerate().take(key_len) {
            let (dom, j) = (index as usize + k / 6, k % 6);
            if dom >= 2 {
                break;
            }
            let key = &mut self.eep.book.domains[dom].key;
            key[j] = key[j].wrapping_add(d);
        }
        self.config_changed();
        Reply::Success(Vec::new())
    }

    fn nm_update_addr(&mut self, data: &[u8]) -> Reply {
        let Some((&index, rest)) = data.split_first() else {
            return Reply::Failure;
        };
        let Some(bytes) = entry_bytes(rest) else {
            return Reply::Failure;
        };
        let Ok(entry) = AddressEntry::decode(&bytes) else {
            self.record_error(LcsError::BadAddressType);
            return Reply::Failure;
        };
        match self.eep.book.update_address(index, entry) {
            Ok(()) => {
                self.config_changed();
                Reply::Success(Vec::new())
            },
            Err(_) => {
                self.record_error(LcsError::InvalidAddrTableIndex);
                Reply::Failure
            },
        }
    }

    fn nm_query_addr(&mut self, data: &[u8]) -> Reply {
        let index = data.first().copied().unwrap_or(0xFF);
        match self.eep.book.address(index) {
            Some(entry) => Reply::Success(entry.encode().to_vec()),
            None => {
                self.record_error(LcsError::InvalidAddrTableIndex);
                Reply::Failure
            },
        }
    }

    fn nm_update_group_addr(&mut self, data: &[u8]) -> Reply {
        let Some(bytes) = entry_bytes(data) else {
            return Reply::Failure;
        };
        let Ok(entry) = AddressEntry::decode(&bytes) else {
            return Reply::Failure;
        };
        let AddressEntry::Group { domain_index, group, .. } = entry else {
            return Reply::Failure;
        };
        let Some(index) = self.eep.book.find_group_address(domain_index, group) else {
            return Reply::Failure;
        };
        if self.eep.book.update_address(index, entry).is_err() {
            return Reply::Failure;
        }
        self.config_changed();
        Reply::Success(Vec::new())
    }

    fn nm_query_domain(&mut self, data: &[u8], include_key: bool) -> Reply {
        let index = data.first().copied().unwrap_or(0xFF);
        match self.eep.book.domain(index) {
            Some(d) => {
                let key = include_key.then_some(&d.key[..]);
                Reply::Success(d.encode(key))
            },
            None => Reply::Failure,
        }
    }

    fn nm_query_nv(&mut self, data: &[u8]) -> Reply {
        let Some(index) = nv_index(data) else {
            return Reply::Failure;
        };
        let primaries = self.eep.book.nv_configs.len() as u16;
        if index < primaries {
            match self.eep.book.nv(index) {
                Some(nv) => Reply::Success(nv.encode().to_vec()),
                None => Reply::Failure,
            }
        } else {
            match self.eep.book.nv_aliases.get((index - primaries) as usize) {
                Some(alias) => {
                    let mut out = alias.nv.encode().to_vec();
                    out.push(alias.primary);
                    out.extend_from_slice(&alias.host_primary.to_be_bytes());
                    Reply::Success(out)
                },
                None => {
                    self.record_error(LcsError::InvalidNvIndex);
                    Reply::Failure
                },
            }
        }
    }

    fn nm_update_nv(&mut self, data: &[u8]) -> Reply {
        let Some(index) = nv_index(data) else {
            return Reply::Failure;
        };
        let rest = if data.first() == Some(&0xFF) { data.get(3..) } else { data.get(1..) };
        let Some(bytes) = rest.and_then(|r| r.get(..3)) else {
            return Reply::Failure;
        };
        let nv = NvConfig::decode(&[bytes[0], bytes[1], bytes[2]]);
        match self.eep.book.update_nv(index, nv) {
            Ok(()) => {
                self.config_changed();
                Reply::Success(Vec::new())
            },
            Err(err) => {
                warn!(%err, "nm: nv update rejected");
                self.record_error(LcsError::InvalidNvIndex);
                Reply::Failure
            },
        }
    }

    fn nm_set_node_mode(&mut self, data: &[u8]) -> Reply {
        let Some(&mode) = data.first() else {
            return Reply::Failure;
        };
        match mode {
            0 => {
                // Soft offline within the configured state.
                self.app.mode = ConfigMode::Offline;
                self.enqueue_event(IndicationKind::Offline);
                Reply::Success(Vec::new())
            },
            1 => {
                self.app.mode = ConfigMode::Online;
                self.enqueue_event(IndicationKind::Online);
                Reply::Success(Vec::new())
            },
            2 => {
                self.reset_requested = true;
                self.reset_cause = ResetCause::Software;
                Reply::None
            },
            3 => {
                let Some(state) = data.get(1).copied().and_then(NodeState::from_byte) else {
                    return Reply::Failure;
                };
                self.eep.read_only.node_state = state;
                if state == NodeState::CnfgOnline {
                    self.app.mode = ConfigMode::Online;
                }
                self.config_changed();
                Reply::Success(Vec::new())
            },
            _ => Reply::Failure,
        }
    }

    fn nm_read_memory(&mut self, data: &[u8]) -> Reply {
        if data.len() < 4 {
            return Reply::Failure;
        }
        let Some(mode) = MemoryMode::from_byte(data[0]) else {
            return Reply::Failure;
        };
        let offset = u16::from_be_bytes([data[1], data[2]]) as usize;
        let count = data[3] as usize;
        let image = match mode {
            MemoryMode::Absolute => {
                debug!("nm: absolute memory reads not supported");
                return Reply::Failure;
            },
            MemoryMode::ReadOnlyRelative => self.eep.read_only_bytes(),
            MemoryMode::ConfigRelative => self.eep.config_region_bytes(),
            MemoryMode::StatsRelative => self.stats.as_bytes(),
        };
        match image.get(offset..offset + count) {
            Some(slice) => Reply::Success(slice.to_vec()),
            None => Reply::Failure,
        }
    }

    fn nm_write_memory(&mut self, data: &[u8]) -> Reply {
        if data.len() < 5 {
            return Reply::Failure;
        }
        let Some(mode) = MemoryMode::from_byte(data[0]) else {
            return Reply::Failure;
        };
        let offset = u16::from_be_bytes([data[1], data[2]]) as usize;
        let count = data[3] as usize;
        let form = data[4];
        let payload = &data[5..];
        if payload.len() < count {
            return Reply::Failure;
        }

        if mode != MemoryMode::ConfigRelative {
            debug!(?mode, "nm: write to a read-only space rejected");
            return Reply::Failure;
        }

        // Patch the serialized configuration region and fold it back in.
        let mut image = self.eep.config_region_bytes();
        let Some(window) = image.get_mut(offset..offset + count) else {
            return Reply::Failure;
        };
        window.copy_from_slice(&payload[..count]);
        if let Err(err) = self.eep.apply_config_region(&image) {
            warn!(%err, "nm: write produced an undecodable config region");
            return Reply::Failure;
        }

        if form & (FORM_BOTH_CS_RECALC | FORM_CNFG_CS_RECALC) != 0 {
            self.eep.config_checksum = self.eep.compute_config_checksum();
        }
        self.write_nvm();
        if form & FORM_ACTION_RESET != 0 {
            self.reset_requested = true;
            self.reset_cause = ResetCause::Software;
        }
        Reply::Success(Vec::new())
    }

    fn nm_wink(&mut self, data: &[u8]) -> Reply {
        match data.first().copied().unwrap_or(0) {
            0 => {
                self.enqueue_event(IndicationKind::Wink);
                Reply::None
            },
            1 => {
                // Wink subcommand: send id info.
                let mut out = Vec::with_capacity(14);
                out.extend_from_slice(&self.eep.read_only.unique_node_id);
                out.extend_from_slice(&self.eep.read_only.prog_id);
                Reply::Success(out)
            },
            _ => Reply::Failure,
        }
    }

    /// Status block: first five statistics, reset cause, node state (soft
    /// offline reported distinctly), version, error log, model number.
    fn query_status_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(15);
        out.extend_from_slice(&self.stats.query_status_bytes());
        out.push(self.reset_cause as u8);
        let state = self.eep.read_only.node_state;
        let reported = if state == NodeState::CnfgOnline && self.app.mode == ConfigMode::Offline {
            0x0C // soft offline
        } else {
            state as u8
        };
        out.push(reported);
        out.push(codes::VERSION_NUMBER);
        out.push(self.eep.error_log as u8);
        out.push(self.eep.read_only.model_num);
        out
    }

    /// Every configuration mutation is checksummed and made durable.
    fn config_changed(&mut self) {
        self.eep.config_checksum = self.eep.compute_config_checksum();
        self.write_nvm();
    }
}

/// First five bytes of a management payload as an address-entry image.
fn entry_bytes(data: &[u8]) -> Option<[u8; 5]> {
    let slice = data.get(..5)?;
    let mut out = [0u8; 5];
    out.copy_from_slice(slice);
    Some(out)
}

/// NV indices use an escape: a first byte of 255 selects a 16-bit index.
fn nv_index(data: &[u8]) -> Option<u16> {
    match data.split_first()? {
        (&0xFF, rest) => {
            let bytes = rest.get(..2)?;
            Some(u16::from_be_bytes([bytes[0], bytes[1]]))
        },
        (&b, _) => Some(b as u16),
    }
}

/// Commands that mutate node state and honor the nmAuth restriction.
fn nm_is_write(op: u8) -> bool {
    matches!(
        op,
        codes::NM_EXPANDED
            | codes::NM_UPDATE_DOMAIN
            | codes::NM_LEAVE_DOMAIN
            | codes::NM_UPDATE_KEY
            | codes::NM_UPDATE_ADDR
            | codes::NM_UPDATE_GROUP_ADDR
            | codes::NM_UPDATE_NV_CNFG
            | codes::NM_SET_NODE_MODE
            | codes::NM_WRITE_MEMORY
            | codes::NM_CHECKSUM_RECALC
            | codes::NM_MEMORY_REFRESH
    )
}
