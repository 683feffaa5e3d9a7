// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Challenge/reply authentication over acknowledged unicast.

use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    models::{
        addressing::ServiceType,
        authpdu::{AuthPdu, AuthPduType},
        npdu::{Npdu, PduClass},
        tspdu::TspduType,
    },
    node::{LcsError, address_book::TxParams},
};

use super::common::{Net, node_cfg};

fn send_auth_ackd(net: &mut Net, node: u8, tag: i16) {
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = tag;
    msg.service = ServiceType::Ackd;
    msg.authenticated = true;
    msg.code = 0x40;
    msg.data = vec![0xAA];
    msg.addr = MsgOutAddr::SubnetNode {
        domain_index: 0,
        subnet: 1,
        node,
        tx: TxParams { rpt_timer: 0, retry: 3, tx_timer: 6, long_timer: false }, // 128 ms
    };
    assert!(net.stacks[0].msg_send());
}

fn auth_frames(net: &Net, from: usize, kind: AuthPduType) -> Vec<AuthPdu> {
    net.wire_log
        .iter()
        .filter(|e| e.from == from)
        .filter_map(|e| {
            let npdu = e.npdu();
            (npdu.pdu_class == PduClass::AuthPdu)
                .then(|| AuthPdu::decode(&npdu.payload).expect("auth pdu"))
        })
        .filter(|p| p.msg_type == kind)
        .collect()
}

#[test]
fn authenticated_ackd_round_trip() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    send_auth_ackd(&mut net, 3, 3);
    net.run(60);

    let challenges = auth_frames(&net, 1, AuthPduType::Challenge);
    assert_eq!(challenges.len(), 1, "B challenged once");
    let replies = auth_frames(&net, 0, AuthPduType::Reply);
    assert_eq!(replies.len(), 1, "A replied once");
    assert_eq!(replies[0].tid, challenges[0].tid, "reply echoes the tid");
    assert_eq!(replies[0].fmt, challenges[0].fmt, "reply echoes the format");

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1, "delivered exactly once");
    assert!(b_msgs[0].auth, "delivery carries the authentication verdict");

    let acks = net.frames_of_kind(1, (PduClass::Tpdu, TspduType::AckOrResponse));
    assert_eq!(acks.len(), 1, "ack follows authentication");

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

#[test]
fn repeated_message_reuses_the_nonce() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    // Lose A's first reply: the ACKD retry must provoke a second challenge
    // carrying the same nonce.
    let mut dropped = false;
    net.drop_filter = Some(Box::new(move |from, frame| {
        if from == 0 && !dropped {
            let npdu = Npdu::decode(&frame.npdu).expect("decodable");
            if npdu.pdu_class == PduClass::AuthPdu {
                dropped = true;
                return true;
            }
        }
        false
    }));
    net.settle();
    send_auth_ackd(&mut net, 3, 4);
    net.run(400);

    let challenges = auth_frames(&net, 1, AuthPduType::Challenge);
    assert!(challenges.len() >= 2, "challenge re-emitted after the lost reply");
    assert_eq!(
        challenges[0].value, challenges[1].value,
        "the nonce is stable until authentication finishes"
    );

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1);
    assert!(b_msgs[0].auth);

    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);
}

#[test]
fn key_mismatch_fails_authentication() {
    let a = node_cfg(1, 2);
    let mut c = node_cfg(3, 4);
    c.domains[0].key = "ffeeddccbbaa".to_string();
    let mut net = Net::new(&[a, c]);
    net.settle();
    send_auth_ackd(&mut net, 4, 5);
    net.run(120);

    let c_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(c_msgs.len(), 1, "the message still surfaces");
    assert!(!c_msgs[0].auth, "but the authentication verdict is negative");
    assert_eq!(net.stacks[1].error_log(), LcsError::AuthenticationMismatch);
}

#[test]
fn challenge_tid_must_match() {
    // A stale challenge (wrong tid) must be ignored, not answered.
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    // Corrupt the tid of B's challenges in flight.
    net.drop_filter = Some(Box::new(|_, _| false));
    net.settle();
    send_auth_ackd(&mut net, 3, 6);
    net.run(5);

    // Forge a challenge with a different tid and feed it to A.
    let real = auth_frames(&net, 1, AuthPduType::Challenge);
    assert_eq!(real.len(), 1);
    let mut forged = real[0];
    forged.tid = (forged.tid + 1) & 0x0F;
    let npdu = Npdu {
        pdu_class: PduClass::AuthPdu,
        domain_len: 1,
        domain_id: [0x4C, 0, 0, 0, 0, 0],
        src: lontalk_stack_rs::models::addressing::SubnetNode::new(1, 3),
        dest: lontalk_stack_rs::models::addressing::DestAddr::SubnetNode(
            lontalk_stack_rs::models::addressing::SubnetNode::new(1, 2),
        ),
        payload: forged.encode(),
    };
    net.stacks[0].link_in_push(lontalk_stack_rs::network::LinkFrame {
        priority: false,
        alt_path: false,
        delta_backlog: 0,
        npdu: bytes::Bytes::from(npdu.encode()),
    });
    net.run(60);

    let replies = auth_frames(&net, 0, AuthPduType::Reply);
    assert_eq!(replies.len(), 1, "only the genuine challenge was answered");
    assert_eq!(replies[0].tid, real[0].tid);

    // The transaction still completes normally.
    let completions: Vec<_> = net
        .drain(0)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Completion)
        .collect();
    assert_eq!(completions.len(), 1);
    assert!(completions[0].success);

    // Late-ack accounting noticed the stale challenge.
    assert!(net.stacks[0].statistics().get(lontalk_stack_rs::node::stats::Stat::LateAck) >= 1);
}

#[test]
fn open_media_round_trip() {
    let mut a = node_cfg(1, 2);
    let mut b = node_cfg(2, 3);
    for cfg in [&mut a, &mut b] {
        cfg.domains[0].auth_type = lontalk_stack_rs::cfg::enums::AuthTypeCfg::OpenMedia;
    }
    let mut net = Net::new(&[a, b]);
    net.settle();
    send_auth_ackd(&mut net, 3, 7);
    net.run(60);

    let challenges = auth_frames(&net, 1, AuthPduType::ChallengeOma);
    assert_eq!(challenges.len(), 1, "open-media challenge variant used");
    let replies = auth_frames(&net, 0, AuthPduType::ReplyOma);
    assert_eq!(replies.len(), 1);

    let b_msgs: Vec<_> = net
        .drain(1)
        .into_iter()
        .filter(|e| e.kind == IndicationKind::Message)
        .collect();
    assert_eq!(b_msgs.len(), 1);
    assert!(b_msgs[0].auth, "96-bit key verification succeeds");
}
