// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Acknowledged unicast: happy path, ack loss, retry exhaustion and tid
//! recency.

use bytes::Bytes;
use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    models::{
        addressing::{DestAddr, ServiceType, SubnetNode},
        npdu::{Npdu, PduClass},
        tspdu::{self, RawTspduHeader, TspduType},
    },
    network::LinkFrame,
    node::address_book::TxParams,
};

use super::common::{Net, node_cfg};

fn send_ackd(net: &mut Net, from: usize, node: u8, tag: i16, code: u8, data: &[u8], retry: u8, tx_timer: u8) {
    let msg = net.stacks[from].msg_alloc().expect("message slot");
    msg.tag = tag;
    msg.service = ServiceType::Ackd;
    msg.code = code;
    msg.data = data.to_vec();
    msg.addr = MsgOutAddr::SubnetNode {
        domain_index: 0,
        subnet: 1,
        node,
        tx: TxParams { rpt_timer: 0, retry, tx_timer, long_timer: false },
    };
    assert!(net.stacks[from].msg_send());
}

#[test]
fn unicast_ackd_happy_path() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // tx timer index 5 decodes to 96 ms.
    send_ackd(&mut net, 0, 3, 7, 0x40, &[0x11, 0x22], 3, 5);
    net.run(40);

    let data_frames = net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest));
    assert_eq!(data_frames.len(), 1, "exactly one APDU on the wire");
    let sent_at = data_frames[0].at;

    let acks = net.frames_of_kind(1, (PduClass::Tpdu, TspduType::AckOrResponse));
    assert_eq!(acks.len(), 1, "exactly one ack from B");
    assert!(acks[0].at - sent_at <= 30, "ack within 30 ms");

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1, "exactly one delivery at B");
    assert_eq!(b_msgs[0].apdu.code, 0x40);
    assert_eq!(b_msgs[0].apdu.data, vec![0x11, 0x22]);
    assert_eq!(b_msgs[0].service, ServiceType::Ackd);

    let mut completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    // No further completions may appear later.
    net.run(500);
    completions.extend(
        net.drain(0)
            .into_iter()
            .filter(|e| e.kind == IndicationKind::Completion),
    );
    assert_eq!(completions.len(), 1, "exactly one completion event");
    assert!(completions[0].success);
    assert_eq!(completions[0].tag, 7);
}

#[test]
fn unicast_ackd_with_one_ack_lost() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    // Drop the first ack B emits.
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

    send_ackd(&mut net, 0, 3, 1, 0x40, &[0xAB], 3, 5);
    net.run(300);

    let data_frames = net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest));
    assert_eq!(data_frames.len(), 2, "one retry after the lost ack");
    let gap = data_frames[1].at - data_frames[0].at;
    assert!((90..=110).contains(&gap), "retry around 96 ms, got {gap}");

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1, "duplicate absorbed, one delivery");

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

#[test]
fn retry_exhaustion_reports_failure() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    // B never answers: eat everything it sends.
    net.drop_filter = Some(Box::new(|from, _| from == 1));
    net.settle();

    send_ackd(&mut net, 0, 3, 9, 0x40, &[1], 2, 3); // 48 ms timer, 2 retries
    net.run(400);

    let data_frames = net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest));
    assert_eq!(data_frames.len(), 3, "first attempt plus two retries");

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success, "retry exhaustion fails the message");
}

#[test]
fn retry_count_zero_is_a_single_attempt() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.drop_filter = Some(Box::new(|from, _| from == 1));
    net.settle();

    send_ackd(&mut net, 0, 3, 2, 0x41, &[], 0, 3);
    net.run(300);

    let data_frames = net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest));
    assert_eq!(data_frames.len(), 1, "no retries with retry count 0");
    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success);
}

#[test]
fn successive_transactions_never_reuse_the_tid() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    let mut tids = Vec::new();
    for round in 0..5u8 {
        send_ackd(&mut net, 0, 3, round as i16, 0x40, &[round], 3, 3);
        net.run(120);
        assert!(
            net.drain(0)
                .iter()
                .any(|e| e.kind == IndicationKind::Completion && e.success),
            "round {round} completed"
        );
    }
    for event in net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest)) {
        tids.push(RawTspduHeader::from_raw(event.npdu().payload[0]).tid());
    }
    assert_eq!(tids.len(), 5);
    for pair in tids.windows(2) {
        assert_ne!(pair[0], pair[1], "adjacent transactions share a tid");
    }
    assert!(tids.iter().all(|&t| t != 0), "tid 0 is reserved");
}

#[test]
fn header_only_tpdu_is_accepted() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // Hand-built ACKD carrying a zero-length APDU: just the header byte.
    let npdu = Npdu {
        pdu_class: PduClass::Tpdu,
        domain_len: 1,
        domain_id: [0x4C, 0, 0, 0, 0, 0],
        src: SubnetNode::new(1, 2),
        dest: DestAddr::SubnetNode(SubnetNode::new(1, 3)),
        payload: vec![tspdu::header(false, TspduType::AckdOrRequest, 5)],
    };
    assert!(net.stacks[1].link_in_push(LinkFrame {
        priority: false,
        alt_path: false,
        delta_backlog: 1,
        npdu: Bytes::from(npdu.encode()),
    }));
    net.run(10);

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1, "empty apdu still delivered");
    assert!(b_msgs[0].apdu.data.is_empty());

    let acks = net.frames_of_kind(1, (PduClass::Tpdu, TspduType::AckOrResponse));
    assert_eq!(acks.len(), 1);
    assert_eq!(
        RawTspduHeader::from_raw(acks[0].npdu().payload[0]).tid(),
        5,
        "ack echoes the tid"
    );
}
