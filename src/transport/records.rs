// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transmit and receive transaction records.

use crate::{
    models::addressing::{AltKey, DestinationAddress, ServiceType, SourceAddress},
    timer::MsTimer,
};

/// Owner of a record. `Unused` marks a free slot; the slab never allocates.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RecordOwner {
    #[default]
    Unused,
    Transport,
    Session,
}

impl RecordOwner {
    pub fn for_transport(transport: bool) -> Self {
        if transport { RecordOwner::Transport } else { RecordOwner::Session }
    }
}

/// Receive-side conversation state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Nothing done yet; may also mean an earlier delivery attempt failed
    /// to get a buffer.
    #[default]
    JustReceived,
    /// Delivered to the application; waiting out the receive timer (and,
    /// for requests, waiting for the response).
    Delivered,
    /// Finished: null response, or the far side has seen our ack/response.
    Done,
    /// Authenticated but not yet delivered.
    Authenticated,
    /// Challenge sent, reply expected.
    Authenticating,
    /// A response has been produced and sent at least once.
    Responded,
}

/// Exactly one transmit record exists per priority class.
#[derive(Debug, Clone)]
pub struct TransmitRecord {
    pub owner: RecordOwner,
    pub dest: DestinationAddress,
    /// Acknowledgment bitmap indexed by group member.
    pub ack_received: [bool; 64],
    pub dest_count: u8,
    /// Acks or responses received so far.
    pub ack_count: u8,
    pub trans_num: u8,
    pub xmit_timer_value: u32,
    pub xmit_timer: MsTimer,
    pub retries_left: u8,
    pub apdu: Vec<u8>,
    pub auth: bool,
    /// Extra wait added once to the last retry (proxy chains).
    pub tx_timer_delta_last: u32,
    pub alt_key: AltKey,
}

impl Default for TransmitRecord {
    fn default() -> Self {
        TransmitRecord {
            owner: RecordOwner::Unused,
            dest: DestinationAddress::default(),
            ack_received: [false; 64],
            dest_count: 0,
            ack_count: 0,
            trans_num: 0,
            xmit_timer_value: 0,
            xmit_timer: MsTimer::default(),
            retries_left: 0,
            apdu: Vec::new(),
            auth: false,
            tx_timer_delta_last: 0,
            alt_key: AltKey::default(),
        }
    }
}

impl TransmitRecord {
    pub fn in_use(&self) -> bool {
        self.owner != RecordOwner::Unused
    }

    pub fn release(&mut self) {
        self.owner = RecordOwner::Unused;
        self.xmit_timer.stop();
    }

    /// Highest acknowledged member, if any ack arrived yet.
    pub fn highest_acked_member(&self) -> Option<u8> {
        self.ack_received.iter().rposition(|&a| a).map(|i| i as u8)
    }
}

/// One receive record per concurrent conversation; slab-allocated at reset.
#[derive(Debug, Default, Clone)]
pub struct ReceiveRecord {
    pub owner: RecordOwner,
    pub src: SourceAddress,
    pub trans_num: u8,
    pub req_id: u16,
    pub recv_timer: MsTimer,
    pub state: TransactionState,
    pub priority: bool,
    pub alt_path: bool,
    /// Authentication outcome; meaningful once state passed Authenticated.
    pub auth: bool,
    pub need_auth: bool,
    pub service: ServiceType,
    /// Challenge nonce issued for this conversation.
    pub nonce: [u8; 8],
    pub response: Vec<u8>,
    pub apdu: Vec<u8>,
}

impl ReceiveRecord {
    pub fn in_use(&self) -> bool {
        self.owner != RecordOwner::Unused
    }

    pub fn release(&mut self) {
        self.owner = RecordOwner::Unused;
        self.recv_timer.stop();
        self.response.clear();
        self.apdu.clear();
    }

    /// Whether the enclosed message has already been handed to the user.
    pub fn was_delivered(&self) -> bool {
        matches!(
            self.state,
            TransactionState::Delivered | TransactionState::Responded | TransactionState::Done
        )
    }
}
