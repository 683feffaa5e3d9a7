// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-node configuration images, statistics and persistence.

pub mod address_book;
pub mod persist;
pub mod stats;

use crate::models::addressing::UniqueNodeId;

pub const ID_STR_LEN: usize = 8;
pub const LOCATION_LEN: usize = 6;
pub const NUM_COMM_PARAMS: usize = 7;

/// Node states as reported to (and set by) network management.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NodeState {
    ApplUncnfg = 2,
    NoApplUncnfg = 3,
    #[default]
    CnfgOnline = 4,
    /// Also known as hard-offline.
    CnfgOffline = 6,
}

impl NodeState {
    pub fn from_byte(v: u8) -> Option<Self> {
        Some(match v {
            2 => NodeState::ApplUncnfg,
            3 => NodeState::NoApplUncnfg,
            4 => NodeState::CnfgOnline,
            6 => NodeState::CnfgOffline,
            _ => return None,
        })
    }
}

/// Application mode within the configured state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConfigMode {
    Offline = 0,
    #[default]
    Online = 1,
    NotRunning = 2,
}

/// Cause of the last reset, reported by query-status.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResetCause {
    #[default]
    Cleared = 0x00,
    PowerUp = 0x01,
    External = 0x02,
    Watchdog = 0x0C,
    Software = 0x14,
}

/// Error log values. A single byte, durably written on change only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LcsError {
    #[default]
    NoErrors = 0,
    NvLengthMismatch = 130,
    NvMsgTooShort = 131,
    BadAddressType = 133,
    InvalidDomain = 138,
    InvalidAddrTableIndex = 141,
    UnknownPdu = 146,
    InvalidNvIndex = 147,
    MemoryAllocFailure = 150,
    WritePastEndOfApplBuffer = 156,
    ConfigChecksumError = 153,
    AuthenticationMismatch = 160,
}

/// Read-only data block: identity and buffer shape of the node. The
/// buffer-size and buffer-count fields hold the 4-bit protocol encodings,
/// decoded through the tables in [`address_book`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOnlyData {
    pub unique_node_id: UniqueNodeId,
    pub model_num: u8,
    pub minor_model_num: u8,
    pub prog_id: [u8; ID_STR_LEN],
    pub two_domains: bool,
    pub node_state: NodeState,
    pub run_when_unconf: bool,
    pub read_write_protect: bool,
    pub address_cnt: u8,
    pub receive_trans_cnt: u8,
    pub app_out_buf_size: u8,
    pub app_in_buf_size: u8,
    pub nw_out_buf_size: u8,
    pub nw_in_buf_size: u8,
    pub app_out_buf_cnt: u8,
    pub app_in_buf_cnt: u8,
    pub app_out_pri_buf_cnt: u8,
    pub nw_out_buf_cnt: u8,
    pub nw_in_buf_cnt: u8,
    pub nw_out_pri_buf_cnt: u8,
}

impl Default for ReadOnlyData {
    fn default() -> Self {
        ReadOnlyData {
            unique_node_id: [0; 6],
            model_num: 128,
            minor_model_num: 0,
            prog_id: [0; ID_STR_LEN],
            two_domains: true,
            node_state: NodeState::CnfgOnline,
            run_when_unconf: false,
            read_write_protect: false,
            address_cnt: 15,
            receive_trans_cnt: 16,
            app_out_buf_size: 12,
            app_in_buf_size: 12,
            nw_out_buf_size: 12,
            nw_in_buf_size: 12,
            app_out_buf_cnt: 3,
            app_in_buf_cnt: 3,
            app_out_pri_buf_cnt: 3,
            nw_out_buf_cnt: 3,
            nw_in_buf_cnt: 3,
            nw_out_pri_buf_cnt: 3,
        }
    }
}

/// Configuration data block: channel parameters plus the handful of
/// protocol knobs the engine reads (non-group receive timer, nmAuth).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    pub channel_id: i16,
    pub location: [u8; LOCATION_LEN],
    pub comm_clock: u8,
    pub input_clock: u8,
    pub comm_type: u8,
    pub comm_pin_dir: u8,
    pub reserved: [u8; 5],
    pub node_priority: u8,
    pub channel_priorities: u8,
    pub xcvr_params: [u8; NUM_COMM_PARAMS],
    /// 4-bit receive-timer index for non-group traffic.
    pub non_group_timer: u8,
    /// Network-management writes must be authenticated.
    pub nm_auth: bool,
    pub preemption_timeout: u8,
}

impl Default for ConfigData {
    fn default() -> Self {
        ConfigData {
            channel_id: 0,
            location: [0; LOCATION_LEN],
            comm_clock: 3,
            input_clock: 5,
            comm_type: 2,
            comm_pin_dir: 0x1E,
            reserved: [0x00, 0x3F, 0xA6, 0x77, 0x67],
            node_priority: 1,
            channel_priorities: 8,
            xcvr_params: [0x0E, 0x01, 0, 0, 0, 0, 0],
            non_group_timer: 8,
            nm_auth: false,
            preemption_timeout: 0,
        }
    }
}
