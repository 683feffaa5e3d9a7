// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Receive-record lifecycle: slot reuse across transactions, duplicate
//! absorption and slab exhaustion.

use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    models::{
        addressing::ServiceType,
        npdu::{Npdu, PduClass},
        tspdu::{RawTspduHeader, TspduType},
    },
    node::{address_book::TxParams, stats::Stat},
};

use super::common::{Net, node_cfg};

fn send_ackd(net: &mut Net, from: usize, node: u8, tag: i16, payload: u8) {
    let msg = net.stacks[from].msg_alloc().expect("slot");
    msg.tag = tag;
    msg.service = ServiceType::Ackd;
    msg.code = 0x40;
    msg.data = vec![payload];
    msg.addr = MsgOutAddr::SubnetNode {
        domain_index: 0,
        subnet: 1,
        node,
        tx: TxParams { rpt_timer: 0, retry: 3, tx_timer: 4, long_timer: false }, // 64 ms
    };
    assert!(net.stacks[from].msg_send());
}

#[test]
fn record_reused_for_the_next_transaction() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // First transaction: delivered and acknowledged.
    send_ackd(&mut net, 0, 3, 1, 0x11);
    net.run(50);
    // Second transaction well inside the first record's receive timer
    // (non-group timer index 8 = 2048 ms).
    send_ackd(&mut net, 0, 3, 2, 0x22);
    net.run(50);

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 2, "both messages delivered");
    assert_eq!(b_msgs[0].apdu.data, vec![0x11]);
    assert_eq!(b_msgs[1].apdu.data, vec![0x22]);

    let acks = net.frames_of_kind(1, (PduClass::Tpdu, TspduType::AckOrResponse));
    assert_eq!(acks.len(), 2, "each transaction acknowledged");

    let tids: Vec<u8> = net
        .frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest))
        .iter()
        .map(|e| RawTspduHeader::from_raw(e.npdu().payload[0]).tid())
        .collect();
    assert_eq!(tids.len(), 2);
    assert_ne!(tids[0], tids[1], "the reused record sees a fresh tid");

    // A delivered message is not a lost message.
    assert_eq!(net.stacks[1].statistics().get(Stat::Lost), 0);

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 2);
    assert!(completions.iter().all(|c| c.success));
}

#[test]
fn duplicate_ackd_is_absorbed_and_reacked() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    // Lose B's first ack so A retries the identical ACKD.
    let mut dropped = false;
    net.drop_filter = Some(Box::new(move |from, frame| {
        if from == 1 && !dropped {
            let npdu = Npdu::decode(&frame.npdu).expect("decodable");
            if npdu.pdu_class == PduClass::Tpdu
                && RawTspduHeader::from_raw(npdu.payload[0]).msg_type()
                    == Some(TspduType::AckOrResponse)
            {
                dropped = true;
                return true;
            }
        }
        false
    }));
    net.settle();

    send_ackd(&mut net, 0, 3, 1, 0x55);
    net.run(300);

    let b_msgs = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .count();
    assert_eq!(b_msgs, 1, "the duplicate never reaches the application");

    let acks = net.frames_of_kind(1, (PduClass::Tpdu, TspduType::AckOrResponse));
    assert_eq!(acks.len(), 2, "one ack per received copy");

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

#[test]
fn receive_record_exhaustion_counts_rx_tx_full() {
    // B has a single receive record; two senders fight over it.
    let a1 = node_cfg(1, 2);
    let a2 = node_cfg(3, 4);
    let mut b = node_cfg(2, 3);
    b.protocol.receive_trans_count = 1;
    let mut net = Net::new(&[a1, a2, b]);
    net.settle();

    send_ackd(&mut net, 0, 3, 1, 0x11);
    net.run(20);
    let before = net.stacks[2].statistics().get(Stat::RxTxFull);

    // The record is still held by A1's conversation (2048 ms receive
    // timer); A2's message has nowhere to go.
    send_ackd(&mut net, 1, 3, 1, 0x22);
    net.run(400);

    let after = net.stacks[2].statistics().get(Stat::RxTxFull);
    assert!(after > before, "every dropped copy counts RxTxFull");

    let completions: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success, "A2's message dies of retry exhaustion");

    // Only A1's message ever made it up.
    let b_payloads: Vec<_> = net
        .drain(2)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .map(|e| e.apdu.data)
        .collect();
    assert_eq!(b_payloads, vec![vec![0x11]]);
}

#[test]
fn record_released_after_receive_timer() {
    // With the record released by its timer, the same slot serves the next
    // sender without loss.
    let a1 = node_cfg(1, 2);
    let a2 = node_cfg(3, 4);
    let mut b = node_cfg(2, 3);
    b.protocol.receive_trans_count = 1;
    b.protocol.non_group_timer = 0; // 128 ms receive timer
    let mut net = Net::new(&[a1, a2, b]);
    net.settle();

    send_ackd(&mut net, 0, 3, 1, 0x11);
    net.run(200); // past the 128 ms receive timer
    send_ackd(&mut net, 1, 3, 1, 0x22);
    net.run(200);

    let b_payloads: Vec<_> = net
        .drain(2)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .map(|e| e.apdu.data)
        .collect();
    assert_eq!(b_payloads, vec![vec![0x11], vec![0x22]]);

    for sender in 0..=1 {
        let completions: Vec<_> = net
            .drain(sender)
            .into_iter()
            .filter(|e| e.kind == IndicationKind::Completion)
            .collect();
        assert_eq!(completions.len(), 1);
        assert!(completions[0].success);
    }
}
