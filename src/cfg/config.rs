// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! YAML node configuration: identity, domain membership, the initial
//! address and NV tables, buffer shaping, and the protocol knobs that are
//! fixed at startup. Loaded once, validated, then compiled into the
//! persistent [`Eeprom`] image the stack boots from when the NVM is empty.

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    cfg::enums::{AuthTypeCfg, NvDirectionCfg, NvServiceCfg},
    node::{
        ID_STR_LEN, LOCATION_LEN,
        address_book::{
            AddressEntry, DomainEntry, NO_ADDRESS_INDEX, NvConfig, NvDirection, TxParams,
        },
        persist::Eeprom,
    },
};

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// Who this node is on the network.
    pub identity: Identity,
    /// Domain table seed (one or two entries).
    pub domains: Vec<DomainCfg>,
    /// Initial address table.
    #[serde(default)]
    pub addresses: Vec<AddressCfg>,
    /// Initial network-variable configuration table.
    #[serde(default)]
    pub nvs: Vec<NvCfg>,
    /// Queue and buffer shaping, protocol-encoded.
    #[serde(default)]
    pub buffers: Buffers,
    /// Engine knobs fixed at startup.
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Identity {
    #[serde(rename = "UniqueNodeId")]
    /// 48-bit unique id, 12 hex digits.
    pub unique_node_id: String,

    #[serde(rename = "ProgramId", default)]
    /// Up to eight bytes of program id, padded with zeros.
    pub program_id: String,

    #[serde(rename = "Location", default)]
    /// Up to six bytes of location string.
    pub location: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct DomainCfg {
    #[serde(rename = "Id", default)]
    /// Domain id as hex digits; its byte length must be 0, 1, 3 or 6.
    pub id: String,
    #[serde(rename = "Subnet")]
    pub subnet: u8,
    #[serde(rename = "Node")]
    pub node: u8,
    #[serde(rename = "Key", default)]
    /// 6-byte authentication key as hex digits.
    pub key: String,
    #[serde(rename = "AuthType", default = "default_auth_type")]
    pub auth_type: AuthTypeCfg,
}

fn default_auth_type() -> AuthTypeCfg {
    AuthTypeCfg::Standard
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct TxParamsCfg {
    #[serde(rename = "RptTimer", default)]
    pub rpt_timer: u8,
    #[serde(rename = "RetryCount", default = "default_retry")]
    pub retry: u8,
    #[serde(rename = "TxTimer", default)]
    pub tx_timer: u8,
    #[serde(rename = "LongTimer", default)]
    pub long_timer: bool,
}

fn default_retry() -> u8 {
    3
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(tag = "Kind")]
pub enum AddressCfg {
    Unbound,
    SubnetNode {
        #[serde(rename = "DomainIndex", default)]
        domain_index: u8,
        #[serde(rename = "Subnet")]
        subnet: u8,
        #[serde(rename = "Node")]
        node: u8,
        #[serde(flatten)]
        tx: TxParamsCfg,
    },
    Broadcast {
        #[serde(rename = "DomainIndex", default)]
        domain_index: u8,
        #[serde(rename = "Subnet", default)]
        subnet: u8,
        #[serde(rename = "Backlog", default)]
        backlog: u8,
        #[serde(rename = "MaxResponses", default = "default_max_responses")]
        max_responses: u8,
        #[serde(flatten)]
        tx: TxParamsCfg,
    },
    Group {
        #[serde(rename = "DomainIndex", default)]
        domain_index: u8,
        #[serde(rename = "Group")]
        group: u8,
        #[serde(rename = "Size")]
        size: u8,
        #[serde(rename = "Member")]
        member: u8,
        #[serde(rename = "RcvTimer", default = "default_rcv_timer")]
        rcv_timer: u8,
        #[serde(flatten)]
        tx: TxParamsCfg,
    },
}

fn default_max_responses() -> u8 {
    1
}

fn default_rcv_timer() -> u8 {
    8
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct NvCfg {
    #[serde(rename = "Direction", default)]
    pub direction: NvDirectionCfg,
    #[serde(rename = "Selector")]
    pub selector: u16,
    #[serde(rename = "Service", default)]
    pub service: NvServiceCfg,
    #[serde(rename = "Auth", default)]
    pub auth: bool,
    #[serde(rename = "Priority", default)]
    pub priority: bool,
    #[serde(rename = "AddrIndex", default = "default_addr_index")]
    pub addr_index: u8,
}

fn default_addr_index() -> u8 {
    NO_ADDRESS_INDEX
}

/// Buffer sizes and queue counts in their 4-bit protocol encodings, the
/// same values network management reads back out of the node.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Buffers {
    #[serde(rename = "AppOutBufSize", default = "default_buf_size")]
    pub app_out_buf_size: u8,
    #[serde(rename = "AppInBufSize", default = "default_buf_size")]
    pub app_in_buf_size: u8,
    #[serde(rename = "NwOutBufSize", default = "default_buf_size")]
    pub nw_out_buf_size: u8,
    #[serde(rename = "NwInBufSize", default = "default_buf_size")]
    pub nw_in_buf_size: u8,
    #[serde(rename = "AppOutQCnt", default = "default_q_cnt")]
    pub app_out_q_cnt: u8,
    #[serde(rename = "AppOutPriQCnt", default = "default_q_cnt")]
    pub app_out_pri_q_cnt: u8,
    #[serde(rename = "AppInQCnt", default = "default_q_cnt")]
    pub app_in_q_cnt: u8,
    #[serde(rename = "NwOutQCnt", default = "default_q_cnt")]
    pub nw_out_q_cnt: u8,
    #[serde(rename = "NwOutPriQCnt", default = "default_q_cnt")]
    pub nw_out_pri_q_cnt: u8,
    #[serde(rename = "NwInQCnt", default = "default_q_cnt")]
    pub nw_in_q_cnt: u8,
}

fn default_buf_size() -> u8 {
    12
}

fn default_q_cnt() -> u8 {
    3
}

impl Default for Buffers {
    fn default() -> Self {
        Buffers {
            app_out_buf_size: default_buf_size(),
            app_in_buf_size: default_buf_size(),
            nw_out_buf_size: default_buf_size(),
            nw_in_buf_size: default_buf_size(),
            app_out_q_cnt: default_q_cnt(),
            app_out_pri_q_cnt: default_q_cnt(),
            app_in_q_cnt: default_q_cnt(),
            nw_out_q_cnt: default_q_cnt(),
            nw_out_pri_q_cnt: default_q_cnt(),
            nw_in_q_cnt: default_q_cnt(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Protocol {
    #[serde(rename = "ReceiveTransCount", default = "default_receive_trans")]
    /// Number of concurrent receive records.
    pub receive_trans_count: u8,

    #[serde(rename = "NonGroupTimer", default = "default_non_group_timer")]
    /// 4-bit receive-timer index for non-group traffic.
    pub non_group_timer: u8,

    #[serde(rename = "NmAuth", default)]
    /// Require authentication on network-management writes.
    pub nm_auth: bool,

    #[serde(rename = "GroupSizeCompatibility", default = "default_true")]
    /// When on, a declared group size already counts this node when it is a
    /// member (the classic encoding). When off, declared sizes are true
    /// sizes and the engine subtracts the membership itself.
    pub group_size_compatibility: bool,

    #[serde(rename = "RngSeed", default)]
    /// Seed for the challenge nonce generator; 0 draws from entropy.
    pub rng_seed: u64,
}

fn default_receive_trans() -> u8 {
    16
}

fn default_non_group_timer() -> u8 {
    8
}

fn default_true() -> bool {
    true
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol {
            receive_trans_count: default_receive_trans(),
            non_group_timer: default_non_group_timer(),
            nm_auth: false,
            group_size_compatibility: true,
            rng_seed: 0,
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let cfg: Config = serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.identity.unique_node_id.len() == 12,
            "UniqueNodeId must be 12 hex digits"
        );
        hex::decode(&self.identity.unique_node_id).context("UniqueNodeId is not hex")?;
        ensure!(
            !self.domains.is_empty() && self.domains.len() <= 2,
            "one or two domains required"
        );
        for (i, d) in self.domains.iter().enumerate() {
            ensure!(
                matches!(d.id.len() / 2, 0 | 1 | 3 | 6) && d.id.len() % 2 == 0,
                "domain {i}: id must be 0, 1, 3 or 6 bytes of hex"
            );
            hex::decode(&d.id).with_context(|| format!("domain {i}: id is not hex"))?;
            ensure!(d.subnet >= 1, "domain {i}: subnet must be 1..255");
            ensure!((1..=127).contains(&d.node), "domain {i}: node must be 1..127");
            if !d.key.is_empty() {
                ensure!(d.key.len() == 12, "domain {i}: key must be 6 bytes of hex");
                hex::decode(&d.key).with_context(|| format!("domain {i}: key is not hex"))?;
            }
        }
        ensure!(
            self.addresses.len() <= 255,
            "address table limited to 255 entries"
        );
        ensure!(
            (1..=64).contains(&self.protocol.receive_trans_count),
            "ReceiveTransCount must be 1..64"
        );
        Ok(())
    }

    /// Compile the configuration into a boot image.
    pub fn to_eeprom(&self) -> Result<Eeprom> {
        let mut eep = Eeprom::default();
        let uid = hex::decode(&self.identity.unique_node_id).context("UniqueNodeId")?;
        eep.read_only.unique_node_id.copy_from_slice(&uid);
        let prog = self.identity.program_id.as_bytes();
        let n = prog.len().min(ID_STR_LEN);
        eep.read_only.prog_id[..n].copy_from_slice(&prog[..n]);
        let loc = self.identity.location.as_bytes();
        let n = loc.len().min(LOCATION_LEN);
        eep.config.location[..n].copy_from_slice(&loc[..n]);

        eep.read_only.two_domains = self.domains.len() == 2;
        for (i, d) in self.domains.iter().enumerate() {
            let id = hex::decode(&d.id).context("domain id")?;
            let mut entry = DomainEntry {
                subnet: d.subnet,
                node: d.node,
                clone_domain: true,
                invalid: false,
                auth_type: d.auth_type.into(),
                len: id.len() as u8,
                ..DomainEntry::default()
            };
            entry.id[..id.len()].copy_from_slice(&id);
            if !d.key.is_empty() {
                let key = hex::decode(&d.key).context("domain key")?;
                entry.key.copy_from_slice(&key);
            }
            eep.book.domains[i] = entry;
        }

        eep.book.addresses = vec![AddressEntry::Unbound; self.addresses.len().max(15)];
        for (i, a) in self.addresses.iter().enumerate() {
            eep.book.addresses[i] = a.to_entry();
        }
        eep.read_only.address_cnt = eep.book.addresses.len().min(15) as u8;

        for nv in &self.nvs {
            eep.book.nv_configs.push(NvConfig {
                priority: nv.priority,
                direction: match nv.direction {
                    NvDirectionCfg::Input => NvDirection::Input,
                    NvDirectionCfg::Output => NvDirection::Output,
                },
                selector: nv.selector,
                turnaround: false,
                service: nv.service.into(),
                auth: nv.auth,
                addr_index: nv.addr_index,
            });
        }

        let b = &self.buffers;
        eep.read_only.app_out_buf_size = b.app_out_buf_size;
        eep.read_only.app_in_buf_size = b.app_in_buf_size;
        eep.read_only.nw_out_buf_size = b.nw_out_buf_size;
        eep.read_only.nw_in_buf_size = b.nw_in_buf_size;
        eep.read_only.app_out_buf_cnt = b.app_out_q_cnt;
        eep.read_only.app_out_pri_buf_cnt = b.app_out_pri_q_cnt;
        eep.read_only.app_in_buf_cnt = b.app_in_q_cnt;
        eep.read_only.nw_out_buf_cnt = b.nw_out_q_cnt;
        eep.read_only.nw_out_pri_buf_cnt = b.nw_out_pri_q_cnt;
        eep.read_only.nw_in_buf_cnt = b.nw_in_q_cnt;
        eep.read_only.receive_trans_cnt = self.protocol.receive_trans_count;
        eep.config.non_group_timer = self.protocol.non_group_timer;
        eep.config.nm_auth = self.protocol.nm_auth;

        eep.config_checksum = eep.compute_config_checksum();
        Ok(eep)
    }
}

impl AddressCfg {
    fn to_entry(&self) -> AddressEntry {
        fn tx(cfg: &TxParamsCfg) -> TxParams {
            TxParams {
                rpt_timer: cfg.rpt_timer,
                retry: cfg.retry,
                tx_timer: cfg.tx_timer,
                long_timer: cfg.long_timer,
            }
        }
        match self {
            AddressCfg::Unbound => AddressEntry::Unbound,
            AddressCfg::SubnetNode { domain_index, subnet, node, tx: t } => {
                AddressEntry::SubnetNode {
                    domain_index: *domain_index,
                    subnet: *subnet,
                    node: *node,
                    tx: tx(t),
                }
            },
            AddressCfg::Broadcast { domain_index, subnet, backlog, max_responses, tx: t } => {
                AddressEntry::Broadcast {
                    domain_index: *domain_index,
                    subnet: *subnet,
                    backlog: *backlog,
                    max_responses: *max_responses,
                    tx: tx(t),
                }
            },
            AddressCfg::Group { domain_index, group, size, member, rcv_timer, tx: t } => {
                AddressEntry::Group {
                    domain_index: *domain_index,
                    group: *group,
                    size: *size,
                    member: *member,
                    rcv_timer: *rcv_timer,
                    tx: tx(t),
                }
            },
        }
    }
}
