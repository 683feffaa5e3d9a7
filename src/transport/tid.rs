// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transaction-id allocation: outgoing sequencing plus the recency table
//! that keeps a new transaction from reusing the tid of the previous one to
//! the same destination. One allocator exists per priority class.

use thiserror::Error;

use crate::{
    models::addressing::{
        DestAddr, DestinationAddress, DOMAIN_ID_LEN, SubnetNode, UniqueNodeId,
    },
    timer::MsTimer,
};

/// Entries older than this may be evicted when the table is full.
pub const TID_AGE_MS: u32 = 24_000;
pub const TID_TABLE_SIZE: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TidError {
    #[error("a transaction is already in progress")]
    Busy,
    #[error("tid recency table is full")]
    TableFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TidStatus {
    Current,
    NotCurrent,
}

/// Canonical destination identity: address kind within a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestKey {
    SubnetNode(SubnetNode),
    Group(u8),
    /// Subnet 0 means domain-wide broadcast.
    Broadcast(u8),
    UniqueId(UniqueNodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TidDest {
    domain_id: [u8; DOMAIN_ID_LEN],
    domain_len: u8,
    key: DestKey,
}

impl TidDest {
    fn from_address(addr: &DestinationAddress) -> Option<Self> {
        let key = match addr.addr {
            DestAddr::SubnetNode(sn) => DestKey::SubnetNode(sn),
            DestAddr::MulticastAck(ack) => DestKey::SubnetNode(ack.subnet_node),
            DestAddr::Multicast { group } => DestKey::Group(group),
            DestAddr::Broadcast { subnet } => DestKey::Broadcast(subnet),
            DestAddr::UniqueId { unique_id, .. } => DestKey::UniqueId(unique_id),
            DestAddr::Turnaround => return None,
        };
        Some(TidDest { domain_id: addr.dmn.id, domain_len: addr.dmn.len, key })
    }
}

#[derive(Debug)]
struct TidEntry {
    dest: TidDest,
    tid: u8,
    age: MsTimer,
}

/// One per priority class.
#[derive(Debug, Default)]
pub struct TidAllocator {
    tid: u8,
    in_progress: bool,
    table: Vec<TidEntry>,
}

fn next_tid(tid: u8) -> u8 {
    // 0 is reserved for "no transaction".
    let next = (tid + 1) & 0x0F;
    if next == 0 { 1 } else { next }
}

impl TidAllocator {
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.table.clear();
    }

    /// Assign a fresh tid for a transaction to `dest`. Fails while another
    /// transaction is in flight, or when the recency table is full of
    /// entries younger than 24 s.
    pub fn new_tid(&mut self, now: u32, dest: &DestinationAddress) -> Result<u8, TidError> {
        if self.in_progress {
            return Err(TidError::Busy);
        }

        let Some(key) = TidDest::from_address(dest) else {
            // Loopback traffic needs no wire-visible sequencing.
            self.tid = next_tid(self.tid);
            self.in_progress = true;
            return Ok(self.tid);
        };

        let slot = match self.table.iter().position(|e| e.dest == key) {
            Some(i) => i,
            None if self.table.len() < TID_TABLE_SIZE => {
                self.table.push(TidEntry { dest: key, tid: 0, age: MsTimer::default() });
                self.table.len() - 1
            },
            None => {
                // Evict any entry old enough that its tid can no longer be
                // confused with a live transaction.
                let aged = self
                    .table
                    .iter_mut()
                    .position(|e| !e.age.running(now))
                    .ok_or(TidError::TableFull)?;
                self.table[aged] = TidEntry { dest: key, tid: 0, age: MsTimer::default() };
                aged
            },
        };

        let mut candidate = next_tid(self.tid);
        if candidate == self.table[slot].tid {
            candidate = next_tid(candidate);
        }
        self.tid = candidate;
        let entry = &mut self.table[slot];
        entry.tid = candidate;
        entry.age.set(now, TID_AGE_MS);
        self.in_progress = true;
        Ok(candidate)
    }

    /// Force the tid of the transaction in progress (proxy inheritance).
    pub fn override_tid(&mut self, tid: u8) {
        self.tid = tid & 0x0F;
    }

    /// Retire the transaction in progress.
    pub fn trans_done(&mut self) {
        self.in_progress = false;
    }

    /// Check an inbound ack/response/reply tid against the transaction in
    /// progress; anything else is stale.
    pub fn validate(&self, tid: u8) -> TidStatus {
        if self.in_progress && self.tid == tid {
            TidStatus::Current
        } else {
            TidStatus::NotCurrent
        }
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn current_tid(&self) -> u8 {
        self.tid
    }
}
