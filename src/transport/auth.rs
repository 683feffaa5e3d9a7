// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The authentication mixer and its helpers.
//!
//! `mix` is the stack's bespoke keyed mixing function. It is reproduced
//! byte-for-byte from the protocol: 8-bit wraparound arithmetic, one-bit
//! rotations selected by the key bits, APDU walked tail to head. It is not
//! a cryptographic MAC and no security properties are claimed for it.

use rand::{Rng, rngs::StdRng};

use crate::models::addressing::{
    AUTH_KEY_LEN, AddrMode, DestAddr, DestinationAddress, OMA_KEY_LEN, OmaAddress, UniqueNodeId,
};
use crate::node::address_book::DomainEntry;

/// Iterations over the key bytes: once over a standard key, one and a half
/// times over an open-media key (bytes 0..12 then 0..6).
fn key_iterations(oma: bool) -> usize {
    if oma { OMA_KEY_LEN + OMA_KEY_LEN / 2 } else { AUTH_KEY_LEN }
}

/// Compute the 8-byte reply for `nonce` over `apdu` under `key`.
///
/// For open-media authentication the canonicalized destination address is
/// prepended to the APDU and the key must be 12 bytes; otherwise only the
/// first 6 key bytes participate.
pub fn mix(nonce: &[u8; 8], apdu: &[u8], key: &[u8], oma_dest: Option<&OmaAddress>) -> [u8; 8] {
    let mut data: Vec<u8>;
    let bytes: &[u8] = match oma_dest {
        Some(dest) => {
            data = Vec::with_capacity(dest.0.len() + apdu.len());
            data.extend_from_slice(&dest.0);
            data.extend_from_slice(apdu);
            &data
        },
        None => apdu,
    };
    let oma = oma_dest.is_some();
    let key_len = if oma { OMA_KEY_LEN } else { AUTH_KEY_LEN };
    let iterations = key_iterations(oma);
    debug_assert!(key.len() >= key_len);

    let mut e = *nonce;
    let mut size = bytes.len();
    while size > 0 {
        for i in 0..iterations {
            for j in (0..8usize).rev() {
                let k = (j + 1) % 8;
                let m = if size > 0 {
                    size -= 1;
                    bytes[size]
                } else {
                    0
                };
                let n = !(e[j].wrapping_add(j as u8));
                if key[i % key_len] & (1 << (7 - j)) != 0 {
                    e[j] = e[k].wrapping_add(m).wrapping_add(n.rotate_left(1));
                } else {
                    e[j] = e[k].wrapping_add(m).wrapping_sub(n.rotate_right(1));
                }
            }
        }
    }
    e
}

/// Produce a fresh challenge nonce. The previous challenge is folded in
/// together with a random draw and the millisecond counter so consecutive
/// challenges stay unpredictable even under a weak seed.
pub fn next_challenge(prev: &mut [u8; 8], rng: &mut StdRng, now_ms: u32) -> [u8; 8] {
    let mut nonce = [0u8; 8];
    for i in 0..8 {
        nonce[i] = prev[i]
            .wrapping_add(rng.random::<u8>())
            .wrapping_add((now_ms % 256) as u8);
        prev[i] = nonce[i];
    }
    nonce
}

/// Canonical destination as seen by the challenged sender: derived from the
/// transmit record's destination address.
pub fn challenge_oma_dest(dest: &DestinationAddress, domain: &DomainEntry) -> OmaAddress {
    match dest.addr {
        DestAddr::UniqueId { unique_id, .. } => OmaAddress::unique_id(&unique_id),
        DestAddr::SubnetNode(sn) => OmaAddress::subnet_node(&domain.id, domain.len, sn),
        DestAddr::Multicast { group } => OmaAddress::group(&domain.id, domain.len, group),
        _ => OmaAddress::default(),
    }
}

/// Canonical destination as reconstructed by the challenger when the reply
/// arrives: this node's own address in the format the reply names.
pub fn reply_oma_dest(
    fmt_mode: AddrMode,
    group: u8,
    domain: &DomainEntry,
    own_unique_id: &UniqueNodeId,
) -> OmaAddress {
    match fmt_mode {
        AddrMode::UniqueId => OmaAddress::unique_id(own_unique_id),
        AddrMode::SubnetNode => OmaAddress::subnet_node(
            &domain.id,
            domain.len,
            crate::models::addressing::SubnetNode::new(domain.subnet, domain.node),
        ),
        AddrMode::Multicast => OmaAddress::group(&domain.id, domain.len, group),
        _ => OmaAddress::default(),
    }
}
