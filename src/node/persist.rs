// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Persistent node image: the read-only block, the configuration region
//! (comm parameters, domain/address/NV tables), the configuration checksum
//! and the error log, serialized as one versioned blob.
//!
//! Writers hand the whole image to the [`Nvm`] collaborator on change;
//! readers tolerate a missing or unreadable image and fall back to the
//! configuration defaults.

use anyhow::{Context, Result, bail, ensure};

use crate::node::{
    ConfigData, LcsError, NodeState, ReadOnlyData,
    address_book::{AddressBook, AddressEntry, DomainEntry, NvAlias, NvConfig, checksum8},
};

const IMAGE_MAGIC: &[u8; 4] = b"LCS\0";
const IMAGE_VERSION: u8 = 1;

/// Non-volatile storage collaborator. The stack never interprets failures:
/// a write that does not stick simply means the next power cycle starts
/// from defaults.
pub trait Nvm {
    fn read(&mut self) -> Option<Vec<u8>>;
    fn write(&mut self, image: &[u8]);
}

/// NVM that forgets everything. The default collaborator.
#[derive(Debug, Default)]
pub struct NullNvm;

impl Nvm for NullNvm {
    fn read(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn write(&mut self, _image: &[u8]) {}
}

/// In-memory NVM used by tests and the demo driver.
#[derive(Debug, Default)]
pub struct MemoryNvm {
    pub image: Option<Vec<u8>>,
    pub writes: usize,
}

impl Nvm for MemoryNvm {
    fn read(&mut self) -> Option<Vec<u8>> {
        self.image.clone()
    }

    fn write(&mut self, image: &[u8]) {
        self.image = Some(image.to_vec());
        self.writes += 1;
    }
}

/// The whole persistent state of one node.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Eeprom {
    pub read_only: ReadOnlyData,
    pub config: ConfigData,
    pub book: AddressBook,
    pub config_checksum: u8,
    pub error_log: LcsError,
}

impl Eeprom {
    /// Read-only block in memory-read order.
    pub fn read_only_bytes(&self) -> Vec<u8> {
        let r = &self.read_only;
        let mut out = Vec::with_capacity(32);
        out.extend_from_slice(&r.unique_node_id);
        out.push(r.model_num);
        out.push(r.minor_model_num);
        out.extend_from_slice(&r.prog_id);
        out.push(
            (r.two_domains as u8) << 2
                | (r.run_when_unconf as u8) << 1
                | r.read_write_protect as u8,
        );
        out.push(r.node_state as u8);
        out.push(r.address_cnt);
        out.push(r.receive_trans_cnt);
        out.push(r.app_out_buf_size << 4 | (r.app_in_buf_size & 0xF));
        out.push(r.nw_out_buf_size << 4 | (r.nw_in_buf_size & 0xF));
        out.push(r.nw_out_pri_buf_cnt << 4 | (r.app_out_pri_buf_cnt & 0xF));
        out.push(r.app_out_buf_cnt << 4 | (r.app_in_buf_cnt & 0xF));
        out.push(r.nw_out_buf_cnt << 4 | (r.nw_in_buf_cnt & 0xF));
        out
    }

    fn config_data_bytes(&self) -> Vec<u8> {
        let c = &self.config;
        let mut out = Vec::with_capacity(28);
        out.extend_from_slice(&c.channel_id.to_be_bytes());
        out.extend_from_slice(&c.location);
        out.push(c.comm_clock << 3 | (c.input_clock & 0x7));
        out.push(c.comm_type << 5 | (c.comm_pin_dir & 0x1F));
        out.extend_from_slice(&c.reserved);
        out.push(c.node_priority);
        out.push(c.channel_priorities);
        out.extend_from_slice(&c.xcvr_params);
        out.push(c.non_group_timer << 4 | (c.nm_auth as u8) << 3 | (c.preemption_timeout & 0x7));
        out
    }

    fn config_data_from_bytes(bytes: &[u8]) -> Result<ConfigData> {
        ensure!(bytes.len() >= 25, "config data too short");
        let mut location = [0u8; 6];
        location.copy_from_slice(&bytes[2..8]);
        let mut reserved = [0u8; 5];
        reserved.copy_from_slice(&bytes[10..15]);
        let mut xcvr_params = [0u8; 7];
        xcvr_params.copy_from_slice(&bytes[17..24]);
        Ok(ConfigData {
            channel_id: i16::from_be_bytes([bytes[0], bytes[1]]),
            location,
            comm_clock: bytes[8] >> 3,
            input_clock: bytes[8] & 0x7,
            comm_type: bytes[9] >> 5,
            comm_pin_dir: bytes[9] & 0x1F,
            reserved,
            node_priority: bytes[15],
            channel_priorities: bytes[16],
            xcvr_params,
            non_group_timer: bytes[24] >> 4,
            nm_auth: bytes[24] & 0x08 != 0,
            preemption_timeout: bytes[24] & 0x7,
        })
    }

    /// The region covered by the configuration checksum: config data, both
    /// domain entries (keys included), address table, NV config and alias
    /// tables, each table preceded by its entry count.
    pub fn config_region_bytes(&self) -> Vec<u8> {
        let mut out = self.config_data_bytes();
        for d in &self.book.domains {
            out.extend_from_slice(&d.encode(Some(&d.key)));
        }
        out.push(self.book.addresses.len() as u8);
        for a in &self.book.addresses {
            out.extend_from_slice(&a.encode());
        }
        out.extend_from_slice(&(self.book.nv_configs.len() as u16).to_be_bytes());
        for nv in &self.book.nv_configs {
            out.extend_from_slice(&nv.encode());
        }
        out.extend_from_slice(&(self.book.nv_aliases.len() as u16).to_be_bytes());
        for al in &self.book.nv_aliases {
            out.extend_from_slice(&al.nv.encode());
            out.push(al.primary);
            out.extend_from_slice(&al.host_primary.to_be_bytes());
        }
        out
    }

    fn config_region_from_bytes(bytes: &[u8]) -> Result<(ConfigData, AddressBook)> {
        fn take_n<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
            let s = bytes.get(*pos..*pos + n).context("config region truncated")?;
            *pos += n;
            Ok(s)
        }
        let config = Self::config_data_from_bytes(bytes)?;
        let mut pos = 25usize;
        let mut take = |n: usize| take_n(bytes, &mut pos, n);

        let mut book = AddressBook::default();
        for i in 0..book.domains.len() {
            let mut d = DomainEntry::decode(take(9)?)?;
            d.key.copy_from_slice(take(6)?);
            book.domains[i] = d;
        }
        let addr_cnt = take(1)?[0] as usize;
        book.addresses.clear();
        for _ in 0..addr_cnt {
            let b: [u8; 5] = take(5)?.try_into().expect("slice length");
            book.addresses.push(AddressEntry::decode(&b)?);
        }
        let nv_cnt = u16::from_be_bytes(take(2)?.try_into().expect("slice length")) as usize;
        book.nv_configs.clear();
        for _ in 0..nv_cnt {
            let b: [u8; 3] = take(3)?.try_into().expect("slice length");
            book.nv_configs.push(NvConfig::decode(&b));
        }
        let alias_cnt = u16::from_be_bytes(take(2)?.try_into().expect("slice length")) as usize;
        book.nv_aliases.clear();
        for _ in 0..alias_cnt {
            let b: [u8; 3] = take(3)?.try_into().expect("slice length");
            let nv = NvConfig::decode(&b);
            let primary = take(1)?[0];
            let host_primary = u16::from_be_bytes(take(2)?.try_into().expect("slice length"));
            book.nv_aliases.push(NvAlias { nv, primary, host_primary });
        }
        Ok((config, book))
    }

    pub fn compute_config_checksum(&self) -> u8 {
        checksum8(&self.config_region_bytes())
    }

    /// Replace the configuration region from its serialized form (used by
    /// write-memory with config-relative addressing).
    pub fn apply_config_region(&mut self, bytes: &[u8]) -> Result<()> {
        let (config, book) = Self::config_region_from_bytes(bytes)?;
        self.config = config;
        self.book = book;
        Ok(())
    }

    /// Full persistent image.
    pub fn to_image(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(IMAGE_MAGIC);
        out.push(IMAGE_VERSION);
        let ro = self.read_only_bytes();
        out.push(ro.len() as u8);
        out.extend_from_slice(&ro);
        let region = self.config_region_bytes();
        out.extend_from_slice(&(region.len() as u16).to_be_bytes());
        out.extend_from_slice(&region);
        out.push(self.config_checksum);
        out.push(self.error_log as u8);
        out
    }

    pub fn from_image(image: &[u8]) -> Result<Self> {
        ensure!(image.len() > 6, "image too short");
        ensure!(&image[..4] == IMAGE_MAGIC, "bad image magic");
        if image[4] != IMAGE_VERSION {
            bail!("unsupported image version {}", image[4]);
        }
        let ro_len = image[5] as usize;
        let ro_bytes = image.get(6..6 + ro_len).context("image truncated")?;
        let read_only = Self::read_only_from_bytes(ro_bytes)?;

        let mut pos = 6 + ro_len;
        let region_len = u16::from_be_bytes(
            image.get(pos..pos + 2).context("image truncated")?.try_into().expect("slice length"),
        ) as usize;
        pos += 2;
        let region = image.get(pos..pos + region_len).context("image truncated")?;
        let (config, book) = Self::config_region_from_bytes(region)?;
        pos += region_len;

        let tail = image.get(pos..pos + 2).context("image truncated")?;
        Ok(Eeprom {
            read_only,
            config,
            book,
            config_checksum: tail[0],
            error_log: decode_error_log(tail[1]),
        })
    }

    fn read_only_from_bytes(bytes: &[u8]) -> Result<ReadOnlyData> {
        ensure!(bytes.len() >= 25, "read-only block too short");
        let mut unique_node_id = [0u8; 6];
        unique_node_id.copy_from_slice(&bytes[..6]);
        let mut prog_id = [0u8; 8];
        prog_id.copy_from_slice(&bytes[8..16]);
        Ok(ReadOnlyData {
            unique_node_id,
            model_num: bytes[6],
            minor_model_num: bytes[7],
            prog_id,
            two_domains: bytes[16] & 0x04 != 0,
            run_when_unconf: bytes[16] & 0x02 != 0,
            read_write_protect: bytes[16] & 0x01 != 0,
            node_state: NodeState::from_byte(bytes[17]).unwrap_or_default(),
            address_cnt: bytes[18],
            receive_trans_cnt: bytes[19],
            app_out_buf_size: bytes[20] >> 4,
            app_in_buf_size: bytes[20] & 0xF,
            nw_out_buf_size: bytes[21] >> 4,
            nw_in_buf_size: bytes[21] & 0xF,
            nw_out_pri_buf_cnt: bytes[22] >> 4,
            app_out_pri_buf_cnt: bytes[22] & 0xF,
            app_out_buf_cnt: bytes[23] >> 4,
            app_in_buf_cnt: bytes[23] & 0xF,
            nw_out_buf_cnt: bytes[24] >> 4,
            nw_in_buf_cnt: bytes[24] & 0xF,
        })
    }
}

fn decode_error_log(v: u8) -> LcsError {
    match v {
        130 => LcsError::NvLengthMismatch,
        131 => LcsError::NvMsgTooShort,
        133 => LcsError::BadAddressType,
        138 => LcsError::InvalidDomain,
        141 => LcsError::InvalidAddrTableIndex,
        146 => LcsError::UnknownPdu,
        147 => LcsError::InvalidNvIndex,
        150 => LcsError::MemoryAllocFailure,
        153 => LcsError::ConfigChecksumError,
        156 => LcsError::WritePastEndOfApplBuffer,
        160 => LcsError::AuthenticationMismatch,
        _ => LcsError::NoErrors,
    }
}
