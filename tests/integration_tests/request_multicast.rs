// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Group request/response: partial acknowledgment, reminder emission and
//! duplicate-request idempotence.

use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    models::{
        addressing::ServiceType,
        npdu::PduClass,
        tspdu::{RawTspduHeader, ReminderBody, TspduType},
    },
    node::address_book::TxParams,
};

use super::common::{Net, join_group, node_cfg};

const GROUP: u8 = 9;

fn group_net() -> Net {
    let a = node_cfg(1, 2);
    let mut b = node_cfg(2, 3);
    let mut c = node_cfg(3, 4);
    let mut d = node_cfg(4, 5);
    join_group(&mut b, GROUP, 4, 0, 8);
    join_group(&mut c, GROUP, 4, 1, 8);
    join_group(&mut d, GROUP, 4, 2, 8);
    Net::new(&[a, b, c, d])
}

fn send_group_request(net: &mut Net, tag: i16) {
    let msg = net.stacks[0].msg_alloc().expect("message slot");
    msg.tag = tag;
    msg.service = ServiceType::Request;
    msg.code = 0x42;
    msg.data = vec![0x01];
    // Declared size 4: with group-size compatibility on, three answers are
    // expected.
    msg.addr = MsgOutAddr::Group {
        domain_index: 0,
        group: GROUP,
        size: 4,
        tx: TxParams { rpt_timer: 0, retry: 2, tx_timer: 6, long_timer: false }, // 128 ms
    };
    assert!(net.stacks[0].msg_send());
}

/// Answer every pending request at `node` with the given code.
fn answer_requests(net: &mut Net, node: usize, code: u8) -> usize {
    let events = net.drain(node);
    let mut answered = 0;
    for event in &events {
        if event.kind == IndicationKind::Message && event.service == ServiceType::Request {
            let resp = net.stacks[node].resp_alloc(event.req_id).expect("response slot");
            resp.code = code;
            resp.data = vec![node as u8];
            assert!(net.stacks[node].resp_send());
            answered += 1;
        }
    }
    answered
}

#[test]
fn partial_group_response_reminds_then_fails() {
    let mut net = group_net();
    net.settle();
    send_group_request(&mut net, 5);

    // Let the request land everywhere, then B and C answer; D stays mute.
    net.run(20);
    assert_eq!(answer_requests(&mut net, 1, 0x2A), 1);
    assert_eq!(answer_requests(&mut net, 2, 0x2A), 1);
    let a_events = net.run_collecting(600, 0);

    // Each member saw the request exactly once.
    let d_events = net.drain(3);
    assert_eq!(
        d_events
            .iter()
            .filter(|e| e.kind == IndicationKind::Message
                && e.service == ServiceType::Request)
            .count(),
        1,
        "member D delivered exactly once"
    );

    // A received the two responses, no more.
    let responses: Vec<_> = a_events
        .iter()
        .filter(|e| e.kind == IndicationKind::Message && e.service == ServiceType::Response)
        .collect();
    assert_eq!(responses.len(), 2, "two responses delivered upward");

    // The retry carried a reminder naming the two responders.
    let rems = net.frames_of_kind(0, (PduClass::Spdu, TspduType::RemMsg));
    assert!(!rems.is_empty(), "a rem/msg retry went out");
    let payload = rems[0].npdu().payload.clone();
    let body = ReminderBody::parse(&payload[1..]).expect("reminder body");
    assert!(body.includes_member(0), "member 0 marked as answered");
    assert!(body.includes_member(1), "member 1 marked as answered");
    assert!(!body.includes_member(2), "member 2 still owed");

    // Without the third response, the transaction ends in failure.
    let completions: Vec<_> = a_events
        .iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success);
}

#[test]
fn full_group_response_succeeds() {
    let mut net = group_net();
    net.settle();
    send_group_request(&mut net, 6);

    net.run(20);
    for node in 1..=3 {
        assert_eq!(answer_requests(&mut net, node, 0x2A), 1);
    }
    // One of the three simultaneous responses overflows the inbound link
    // queue; the reminder round recovers it.
    let a_events = net.run_collecting(600, 0);
    let responses = a_events
        .iter()
        .filter(|e| e.kind == IndicationKind::Message && e.service == ServiceType::Response)
        .count();
    assert_eq!(responses, 3, "every member's response delivered");
    let completions: Vec<_> = a_events
        .iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

#[test]
fn duplicate_request_reuses_the_saved_response() {
    let mut net = group_net();
    // Drop the first response C emits so A reminds and C must resend.
    let mut dropped = false;
    net.drop_filter = Some(Box::new(move |from, frame| {
        if from == 2 && !dropped {
            let npdu = lontalk_stack_rs::models::npdu::Npdu::decode(&frame.npdu)
                .expect("decodable");
            if npdu.pdu_class == PduClass::Spdu
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
    send_group_request(&mut net, 7);

    net.run(20);
    for node in 1..=3 {
        answer_requests(&mut net, node, 0x2A);
    }
    let a_events = net.run_collecting(600, 0);

    // C's application was asked exactly once even though its response had
    // to be transmitted twice.
    let c_requests = net
        .drain(2)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message && e.service == ServiceType::Request)
        .count();
    assert_eq!(c_requests, 1, "saved response resent without re-invoking the user");

    let c_responses = net.frames_of_kind(2, (PduClass::Spdu, TspduType::AckOrResponse));
    assert!(c_responses.len() >= 2, "response was re-emitted from the record");

    let completions: Vec<_> = a_events
        .iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success, "all three answers eventually arrived");
}

#[test]
fn group_size_one_is_rejected() {
    let mut net = group_net();
    net.settle();
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = 8;
    msg.service = ServiceType::Ackd;
    msg.code = 0x42;
    msg.addr = MsgOutAddr::Group {
        domain_index: 0,
        group: GROUP,
        size: 1,
        tx: TxParams::default(),
    };
    assert!(net.stacks[0].msg_send());
    net.run(20);

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(!completions[0].success, "group size 1 cannot complete");
    assert!(
        net.frames_of_kind(0, (PduClass::Tpdu, TspduType::AckdOrRequest)).is_empty(),
        "nothing went on the wire"
    );
}

#[test]
fn huge_group_only_for_unackd_repeated() {
    let mut net = group_net();
    net.settle();

    // Size 0 with ACKD: rejected.
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = 1;
    msg.service = ServiceType::Ackd;
    msg.code = 0x42;
    msg.addr =
        MsgOutAddr::Group { domain_index: 0, group: GROUP, size: 0, tx: TxParams::default() };
    assert!(net.stacks[0].msg_send());
    net.run(20);
    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert!(!completions[0].success);

    // Size 0 with UNACKD_RPT: goes out and succeeds.
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = 2;
    msg.service = ServiceType::UnackRpt;
    msg.code = 0x42;
    msg.addr = MsgOutAddr::Group {
        domain_index: 0,
        group: GROUP,
        size: 0,
        tx: TxParams { rpt_timer: 2, retry: 2, tx_timer: 2, long_timer: false },
    };
    assert!(net.stacks[0].msg_send());
    net.run(300);
    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success, "unackd-repeated always completes successfully");

    // Every member still got it exactly once.
    for node in 1..=3 {
        let msgs = net
            .drain(node)
            .into_iter()
            .filter(|e| e.kind == IndicationKind::Message)
            .count();
        assert_eq!(msgs, 1, "node {node} delivered exactly once");
    }
}
