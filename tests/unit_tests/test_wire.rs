// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Golden-byte checks for the PDU codecs.

use hex_literal::hex;

use lontalk_stack_rs::models::{
    addressing::{DestAddr, SubnetNode},
    authpdu::{AuthFmt, AuthPdu, AuthPduType},
    npdu::{AddrFmt, Npdu, PduClass, RawNpduHeader},
    proxy::ProxyHeader,
    tspdu::{self, RawTspduHeader, TspduType},
};

#[test]
fn npdu_first_byte_layout() {
    let mut hdr = RawNpduHeader::default();
    hdr.set_version(0);
    hdr.set_pdu_class(PduClass::Spdu);
    hdr.set_addr_fmt(AddrFmt::MulticastAck);
    // version 00 | class 01 | fmt 0100
    assert_eq!(hdr.raw(), 0b0001_0100);
}

#[test]
fn npdu_subnet_node_golden_bytes() {
    let npdu = Npdu {
        pdu_class: PduClass::Tpdu,
        domain_len: 1,
        domain_id: [0x4C, 0, 0, 0, 0, 0],
        src: SubnetNode::new(1, 2),
        dest: DestAddr::SubnetNode(SubnetNode::new(1, 3)),
        payload: vec![0x07, 0x40, 0x11, 0x22],
    };
    // header | dlen | domain | src s/n | dest s, 0x80|n | payload
    assert_eq!(npdu.encode(), hex!("02 01 4c 01 02 01 83 07 40 11 22"));
    assert_eq!(Npdu::decode(&npdu.encode()).expect("decode"), npdu);
}

#[test]
fn tspdu_header_codes() {
    // auth:1 | type:3 | tid:4
    assert_eq!(tspdu::header(false, TspduType::AckdOrRequest, 0x7), 0x07);
    assert_eq!(tspdu::header(false, TspduType::UnackRpt, 0x7), 0x17);
    assert_eq!(tspdu::header(false, TspduType::AckOrResponse, 0x7), 0x27);
    assert_eq!(tspdu::header(false, TspduType::Reminder, 0x7), 0x47);
    assert_eq!(tspdu::header(true, TspduType::RemMsg, 0x7), 0xD7);

    let hdr = RawTspduHeader::from_raw(0xD7);
    assert!(hdr.auth());
    assert_eq!(hdr.msg_type(), Some(TspduType::RemMsg));
    assert_eq!(hdr.tid(), 7);
    assert_eq!(RawTspduHeader::from_raw(0x37).msg_type(), None, "type 3 undefined");
}

#[test]
fn auth_pdu_golden_bytes() {
    let pdu = AuthPdu {
        fmt: AuthFmt::Multicast,
        msg_type: AuthPduType::Reply,
        tid: 0xC,
        value: hex!("0011223344556677"),
        group: 9,
    };
    // fmt 01 | type 10 | tid 1100, 8 value bytes, group
    assert_eq!(pdu.encode(), hex!("6c 0011223344556677 09"));
}

#[test]
fn proxy_header_bit_positions() {
    let h = ProxyHeader::from_byte(0b1010_0011);
    assert!(h.uniform_by_dest);
    assert!(!h.long_timer);
    assert!(h.all_agents);
    assert!(!h.uniform_by_src);
    assert_eq!(h.count, 3);
}

#[test]
fn reminder_bitmap_is_lsb_first() {
    let mut acked = [false; 64];
    acked[10] = true;
    let mut body = Vec::new();
    tspdu::encode_member_bitmap(&acked, 2, &mut body);
    // length 2, byte0 empty, byte1 has bit (10 % 8) = 2 set
    assert_eq!(body, vec![2, 0x00, 0x04]);
}
