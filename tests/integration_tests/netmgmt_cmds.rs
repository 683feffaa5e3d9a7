// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Network management over the session layer: queries, table updates,
//! memory access, wink, and the checksum watchdog.

use lontalk_stack_rs::{
    app::{IndicationKind, MsgOutAddr},
    models::{addressing::ServiceType, npdu::PduClass},
    netmgmt::codes,
    node::{LcsError, NodeState, address_book::TxParams},
};

use super::common::{Net, node_cfg};

const NM: u8 = 0x60;
const ND: u8 = 0x50;

fn send_request(net: &mut Net, node: u8, code: u8, data: &[u8]) {
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = 1;
    msg.service = ServiceType::Request;
    msg.code = code;
    msg.data = data.to_vec();
    msg.addr = MsgOutAddr::SubnetNode {
        domain_index: 0,
        subnet: 1,
        node,
        tx: TxParams { rpt_timer: 0, retry: 3, tx_timer: 5, long_timer: false },
    };
    assert!(net.stacks[0].msg_send());
}

fn response_of(net: &mut Net) -> (u8, Vec<u8>) {
    for _ in 0..400 {
        net.tick();
        for event in net.drain(0) {
            if event.kind == IndicationKind::Message && event.service == ServiceType::Response {
                return (event.apdu.code, event.apdu.data);
            }
        }
    }
    panic!("no response arrived");
}

#[test]
fn query_status_reports_state_and_model() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    send_request(&mut net, 3, ND | codes::ND_QUERY_STATUS, &[]);
    let (code, data) = response_of(&mut net);
    assert_eq!(code, 0x30 | codes::ND_QUERY_STATUS, "success code");
    assert_eq!(data.len(), 15);
    assert_eq!(data[11], NodeState::CnfgOnline as u8);
    assert_eq!(data[14], 128, "model number");
}

#[test]
fn domain_update_and_query_round_trip() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // New domain entry for slot 1: id 0xAABBCC, subnet 7, node 9.
    let mut entry = vec![1u8]; // index
    entry.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0, 0, 0]); // id
    entry.push(7); // subnet
    entry.push(0x80 | 9); // clone | node
    entry.push(0x03); // valid, standard auth, len 3
    entry.extend_from_slice(&[9, 8, 7, 6, 5, 4]); // key
    send_request(&mut net, 3, NM | codes::NM_UPDATE_DOMAIN, &entry);
    let (code, _) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_UPDATE_DOMAIN);

    send_request(&mut net, 3, NM | codes::NM_QUERY_DOMAIN, &[1]);
    let (code, data) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_QUERY_DOMAIN);
    assert_eq!(&data[..6], &[0xAA, 0xBB, 0xCC, 0, 0, 0]);
    assert_eq!(data[6], 7);
    assert_eq!(data[7] & 0x7F, 9);
    assert_eq!(data[8] & 0x07, 3);
    assert_eq!(&data[9..15], &[9, 8, 7, 6, 5, 4], "key included");
}

#[test]
fn address_table_update_via_nm() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // Group entry: group 5, size 3, member 1.
    let entry = [0x80 | 3, 0x01, 0x13, 0x24, 5];
    let mut data = vec![2u8]; // table index
    data.extend_from_slice(&entry);
    send_request(&mut net, 3, NM | codes::NM_UPDATE_ADDR, &data);
    let (code, _) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_UPDATE_ADDR);

    send_request(&mut net, 3, NM | codes::NM_QUERY_ADDR, &[2]);
    let (code, data) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_QUERY_ADDR);
    assert_eq!(data, entry.to_vec());
}

#[test]
fn read_memory_read_only_relative() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    // Offset 0, count 6: the unique node id.
    send_request(&mut net, 3, NM | codes::NM_READ_MEMORY, &[1, 0, 0, 6]);
    let (code, data) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_READ_MEMORY);
    assert_eq!(data, hex::decode("0a0b0c0d0e02").expect("hex"));
}

#[test]
fn absolute_memory_access_is_refused() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    send_request(&mut net, 3, NM | codes::NM_READ_MEMORY, &[0, 0, 0, 4]);
    let (code, _) = response_of(&mut net);
    assert_eq!(code, codes::NM_READ_MEMORY, "failure code is the bare opcode");
}

#[test]
fn wink_surfaces_as_an_event() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // Wink travels unacknowledged.
    let msg = net.stacks[0].msg_alloc().expect("slot");
    msg.tag = 3;
    msg.service = ServiceType::Unackd;
    msg.code = NM | codes::NM_WINK;
    msg.addr = MsgOutAddr::SubnetNode {
        domain_index: 0,
        subnet: 1,
        node: 3,
        tx: TxParams::default(),
    };
    assert!(net.stacks[0].msg_send());
    net.run(20);

    assert!(
        net.drain(1)
            .iter()
            .any(|e| e.kind == IndicationKind::Wink),
        "the application sees the wink"
    );
}

#[test]
fn query_version_reports_capabilities() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    send_request(&mut net, 3, NM | codes::NM_EXPANDED, &[codes::NME_QUERY_VERSION]);
    let (code, data) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_EXPANDED);
    assert_eq!(data[0], codes::VERSION_NUMBER);
    assert_ne!(data[1] & 0x02, 0, "proxy capability advertised");
}

#[test]
fn unauthenticated_write_rejected_when_nm_auth_set() {
    let a = node_cfg(1, 2);
    let mut b = node_cfg(2, 3);
    b.protocol.nm_auth = true;
    let mut net = Net::new(&[a, b]);
    net.settle();

    let mut data = vec![2u8];
    data.extend_from_slice(&[0x80 | 3, 0x01, 0x13, 0x24, 5]);
    send_request(&mut net, 3, NM | codes::NM_UPDATE_ADDR, &data);
    let (code, _) = response_of(&mut net);
    assert_eq!(code, codes::NM_UPDATE_ADDR, "write refused without authentication");

    // Reads still work.
    send_request(&mut net, 3, NM | codes::NM_QUERY_ADDR, &[2]);
    let (code, _) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_QUERY_ADDR);
}

#[test]
fn stale_checksum_drives_the_node_unconfigured() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();

    // Patch one config byte (the location string) without asking for a
    // checksum recompute: form = 0.
    send_request(
        &mut net,
        3,
        NM | codes::NM_WRITE_MEMORY,
        &[2, 0, 2, 1, 0, 0x5A],
    );
    let (code, _) = response_of(&mut net);
    assert_eq!(code, 0x20 | codes::NM_WRITE_MEMORY);
    assert_eq!(net.stacks[1].node_state(), NodeState::CnfgOnline);

    // Within a watchdog period the mismatch is noticed.
    net.run(1200);
    assert_eq!(net.stacks[1].node_state(), NodeState::ApplUncnfg);
    assert_eq!(net.stacks[1].error_log(), LcsError::ConfigChecksumError);
}

#[test]
fn manual_service_request_broadcasts_on_flex() {
    let mut net = Net::new(&[node_cfg(1, 2), node_cfg(2, 3)]);
    net.settle();
    assert!(net.stacks[1].send_manual_service_request());
    net.run(20);

    let frame = net
        .wire_log
        .iter()
        .find(|e| e.from == 1 && e.npdu().pdu_class == PduClass::Apdu)
        .expect("the announcement went out");
    let npdu = frame.npdu();
    assert_eq!(npdu.domain_len, 0, "flex domain");
    assert_eq!((npdu.src.subnet, npdu.src.node), (0, 0), "source 0/0");
    assert_eq!(npdu.payload[0], NM | codes::NM_MANUAL_SERVICE_REQUEST);
    assert_eq!(
        &npdu.payload[1..7],
        hex::decode("0a0b0c0d0e02").expect("hex").as_slice(),
        "unique id announced"
    );
}
