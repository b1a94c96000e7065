use bgp_packet::{
    header_error, update_error, AsPath, BgpMessage, Header, MessageType, Origin, PathAttributes,
    SessionConfig, UpdatePacket, HEADER_LEN, MAX_MESSAGE_LEN,
};
use hex_literal::hex;

fn cfg() -> SessionConfig {
    SessionConfig::default()
}

fn two_octet_cfg() -> SessionConfig {
    SessionConfig { four_octet_as: false, ..Default::default() }
}

/// An UPDATE announcing 10.10.10.0/24 via 65001 / 20.20.20.1, captured in
/// classic 2-octet form: ORIGIN IGP, AS_PATH {65001}, NEXT_HOP 20.20.20.1.
const ANNOUNCE_2OCTET: [u8; 45] = hex!(
    "ffffffffffffffffffffffffffffffff"
    "002d" // length 45
    "02"   // UPDATE
    "0000" // no withdrawn routes
    "0012" // 18 bytes of path attributes
    "40010100"         // ORIGIN igp
    "4002040201fde9"   // AS_PATH seq {65001}
    "40030414141401"   // NEXT_HOP 20.20.20.1
    "180a0a0a"         // NLRI 10.10.10.0/24
);

#[test]
fn captured_two_octet_announce_decodes() {
    let msg = BgpMessage::decode(&ANNOUNCE_2OCTET, &two_octet_cfg()).unwrap();
    let BgpMessage::Update(update) = msg else { panic!("expected UPDATE") };
    assert_eq!(update.nlri, vec!["10.10.10.0/24".parse::<ipnet::Ipv4Net>().unwrap()]);
    assert_eq!(update.attrs.origin, Some(Origin::Igp));
    assert_eq!(update.attrs.as_path, Some(AsPath::from_sequence(vec![65001])));
    assert_eq!(update.attrs.next_hop, Some("20.20.20.1".parse().unwrap()));
}

#[test]
fn captured_announce_reencodes_wire_equal() {
    let BgpMessage::Update(update) = BgpMessage::decode(&ANNOUNCE_2OCTET, &two_octet_cfg()).unwrap()
    else {
        panic!("expected UPDATE")
    };
    let frame = update.encode(&two_octet_cfg()).unwrap();
    assert_eq!(&frame[..], &ANNOUNCE_2OCTET[..]);
}

#[test]
fn withdraw_frame_round_trips() {
    let update = UpdatePacket {
        withdrawn: vec!["10.10.10.0/24".parse().unwrap()],
        ..Default::default()
    };
    let frame = update.encode(&cfg()).unwrap();
    let BgpMessage::Update(back) = BgpMessage::decode(&frame, &cfg()).unwrap() else {
        panic!("expected UPDATE")
    };
    assert_eq!(*back, update);
}

#[test]
fn own_as_in_path_decodes_cleanly_filtering_is_the_callers_job() {
    // Loop detection is policy, not wire validity.
    let msg = BgpMessage::decode(&ANNOUNCE_2OCTET, &two_octet_cfg()).unwrap();
    let BgpMessage::Update(update) = msg else { panic!("expected UPDATE") };
    assert!(update.attrs.as_path.as_ref().unwrap().contains(65001));
}

#[test]
fn max_length_update_is_accepted_and_4097_is_not() {
    let mut update = UpdatePacket {
        attrs: PathAttributes {
            origin: Some(Origin::Igp),
            as_path: Some(AsPath::from_sequence(vec![65001])),
            next_hop: Some("20.20.20.1".parse().unwrap()),
            ..Default::default()
        },
        ..Default::default()
    };
    // Fill with /32s until exactly at the frame limit.
    let mut host = 0u32;
    while update.encoded_len(&cfg()) + 5 <= MAX_MESSAGE_LEN {
        let addr = std::net::Ipv4Addr::from(0x0a00_0000 + host);
        update.nlri.push(ipnet::Ipv4Net::new(addr, 32).unwrap());
        host += 1;
    }
    let frame = update.encode(&cfg()).unwrap();
    assert!(frame.len() <= MAX_MESSAGE_LEN);
    assert!(BgpMessage::decode(&frame, &cfg()).is_ok());

    // Forge a frame claiming 4097 bytes: rejected at the header.
    let mut forged = frame.to_vec();
    forged[16..18].copy_from_slice(&4097u16.to_be_bytes());
    let err = Header::decode(&forged).unwrap_err();
    assert_eq!(err.subcode, header_error::BAD_MESSAGE_LENGTH);
}

#[test]
fn big_enough_splits_exactly_at_the_limit() {
    let mut update = UpdatePacket::default();
    let mut host = 0u32;
    while !update.big_enough(&cfg()) {
        let addr = std::net::Ipv4Addr::from(0x0a00_0000 + host);
        update.withdrawn.push(ipnet::Ipv4Net::new(addr, 32).unwrap());
        host += 1;
    }
    // The batch that tripped big_enough still encodes.
    assert!(update.encode(&cfg()).is_ok());
}

#[test]
fn attribute_length_error_carries_the_offending_tlv() {
    // ORIGIN declaring 2 bytes of body where exactly 1 is legal.
    let mut body = vec![0u8, 0, 0, 5];
    body.extend_from_slice(&hex!("4001020000"));
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0xff; 16]);
    frame.extend_from_slice(&((HEADER_LEN + body.len()) as u16).to_be_bytes());
    frame.push(u8::from(MessageType::Update));
    frame.extend_from_slice(&body);
    let err = BgpMessage::decode(&frame, &cfg()).unwrap_err();
    assert_eq!(err.subcode, update_error::ATTRIBUTE_LENGTH_ERROR);
    assert_eq!(err.data, hex!("4001020000").to_vec());
}
