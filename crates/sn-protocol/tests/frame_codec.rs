/// Frame codec tests against literal v1 frames.
///
/// The array layout is frozen: these tests pin the exact field positions so
/// a refactor of the codec cannot silently shift them.
use sn_protocol::*;

fn id(s: &str) -> MaritimeId {
    MaritimeId::parse(s).unwrap()
}

// ---------------------------------------------------------------------------
// Handshake frames
// ---------------------------------------------------------------------------

#[test]
fn welcome_decodes_from_literal_frame() {
    let msg = decode_frame(r#"[1, 1, "mrn:server:balticweb", "Baltic e-navigation relay"]"#)
        .expect("decode");
    match msg {
        ConnectionMessage::Welcome(w) => {
            assert_eq!(w.protocol_version, PROTOCOL_VERSION);
            assert_eq!(w.server_id, id("mrn:server:balticweb"));
            assert_eq!(w.banner, "Baltic e-navigation relay");
        }
        other => panic!("expected Welcome, got {:?}", other),
    }
}

#[test]
fn hello_encodes_position_as_nested_array() {
    let msg = ConnectionMessage::Hello(Hello {
        client_id: id("mrn:vessel:imo:9074729"),
        position: Some(PositionTime::new(55.7, 12.6, 1_700_000_000_000)),
    });
    assert_eq!(
        encode_frame(&msg),
        r#"[2,"mrn:vessel:imo:9074729",[55.7,12.6,1700000000000]]"#
    );
}

#[test]
fn hello_without_position_encodes_null() {
    let msg = ConnectionMessage::Hello(Hello {
        client_id: id("mrn:vessel:imo:9074729"),
        position: None,
    });
    assert_eq!(encode_frame(&msg), r#"[2,"mrn:vessel:imo:9074729",null]"#);
    let back = decode_frame(&encode_frame(&msg)).unwrap();
    match back {
        ConnectionMessage::Hello(h) => assert!(h.position.is_none()),
        other => panic!("expected Hello, got {:?}", other),
    }
}

#[test]
fn connected_decodes_connection_id() {
    let msg = decode_frame(r#"[3, "conn-7f3a"]"#).unwrap();
    match msg {
        ConnectionMessage::Connected(c) => assert_eq!(c.connection_id, "conn-7f3a"),
        other => panic!("expected Connected, got {:?}", other),
    }
}

#[test]
fn keep_alive_is_a_bare_tag() {
    assert_eq!(encode_frame(&ConnectionMessage::KeepAlive), "[6]");
    assert!(matches!(decode_frame("[6]").unwrap(), ConnectionMessage::KeepAlive));
}

// ---------------------------------------------------------------------------
// Request / response correlation fields
// ---------------------------------------------------------------------------

#[test]
fn register_service_carries_reply_to_at_index_one() {
    let msg = ConnectionMessage::RegisterService(RegisterService {
        reply_to: 42,
        channel: "weather.Forecast".to_owned(),
    });
    assert_eq!(encode_frame(&msg), r#"[10,42,"weather.Forecast"]"#);
    assert_eq!(msg.reply_to(), Some(42));
    assert_eq!(msg.message_ack(), None);
}

#[test]
fn responses_echo_message_ack() {
    let ack = decode_frame("[11, 42]").unwrap();
    assert_eq!(ack.message_ack(), Some(42));

    let find = decode_frame(r#"[13, 9, ["mrn:vessel:a", "mrn:vessel:b"]]"#).unwrap();
    assert_eq!(find.message_ack(), Some(9));
    match find {
        ConnectionMessage::FindServiceAck(f) => {
            assert_eq!(f.providers, vec![id("mrn:vessel:a"), id("mrn:vessel:b")]);
        }
        other => panic!("expected FindServiceAck, got {:?}", other),
    }
}

#[test]
fn invoke_service_carries_both_correlation_planes() {
    let frame =
        r#"[14, 7, "mrn:vessel:a", "mrn:vessel:b", "hello.GetName", "{}", "00112233445566778899aabbccddeeff"]"#;
    let msg = decode_frame(frame).unwrap();
    assert_eq!(msg.reply_to(), Some(7));
    match msg {
        ConnectionMessage::InvokeService(inv) => {
            assert_eq!(inv.src, id("mrn:vessel:a"));
            assert_eq!(inv.dst, id("mrn:vessel:b"));
            assert_eq!(inv.channel, "hello.GetName");
            assert_eq!(inv.invocation_id, "00112233445566778899aabbccddeeff");
        }
        other => panic!("expected InvokeService, got {:?}", other),
    }
}

#[test]
fn invoke_ack_has_no_message_ack_and_one_of_result_error() {
    let ok = decode_frame(r#"[15, "aa", "\"hi\"", null]"#).unwrap();
    assert_eq!(ok.message_ack(), None);
    match ok {
        ConnectionMessage::InvokeServiceAck(a) => {
            assert_eq!(a.result.as_deref(), Some("\"hi\""));
            assert!(a.error.is_none());
        }
        other => panic!("expected InvokeServiceAck, got {:?}", other),
    }

    let err = decode_frame(r#"[15, "aa", null, "no such service"]"#).unwrap();
    match err {
        ConnectionMessage::InvokeServiceAck(a) => {
            assert!(a.result.is_none());
            assert_eq!(a.error.as_deref(), Some("no such service"));
        }
        other => panic!("expected InvokeServiceAck, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Broadcast frames
// ---------------------------------------------------------------------------

#[test]
fn broadcast_send_forwards_options_verbatim() {
    let msg = ConnectionMessage::BroadcastSend(BroadcastSend {
        reply_to: 3,
        src: id("mrn:vessel:b"),
        position: Some(PositionTime::new(56.0, 11.0, 1_700_000_000_000)),
        channel: "weather.Warning".to_owned(),
        payload: r#"{"wind":"gale"}"#.to_owned(),
        options: BroadcastOptions {
            radius_meters: Some(50_000),
            ttl_secs: None,
            receipt_required: true,
        },
        broadcast_id: "feed0000feed0000feed0000feed0000".to_owned(),
    });
    let text = encode_frame(&msg);
    let back = decode_frame(&text).unwrap();
    match back {
        ConnectionMessage::BroadcastSend(b) => {
            assert_eq!(b.options.radius_meters, Some(50_000));
            assert_eq!(b.options.ttl_secs, None);
            assert!(b.options.receipt_required);
            assert_eq!(b.broadcast_id, "feed0000feed0000feed0000feed0000");
        }
        other => panic!("expected BroadcastSend, got {:?}", other),
    }
}

#[test]
fn broadcast_deliver_decodes_header_fields() {
    let msg = decode_frame(
        r#"[18, "mrn:vessel:b", [56.0, 11.0, 1700000000000], "weather.Warning", "{\"wind\":\"gale\"}"]"#,
    )
    .unwrap();
    match msg {
        ConnectionMessage::BroadcastDeliver(d) => {
            assert_eq!(d.src, id("mrn:vessel:b"));
            let pos = d.position.unwrap();
            assert_eq!(pos.latitude, 56.0);
            assert_eq!(pos.longitude, 11.0);
            assert_eq!(d.channel, "weather.Warning");
        }
        other => panic!("expected BroadcastDeliver, got {:?}", other),
    }
}

#[test]
fn broadcast_ack_carries_recipient_and_position() {
    let msg =
        decode_frame(r#"[19, "feed0000feed0000feed0000feed0000", "mrn:vessel:a", [55.1, 12.2, 1]]"#)
            .unwrap();
    match msg {
        ConnectionMessage::BroadcastAck(a) => {
            assert_eq!(a.recipient_id, id("mrn:vessel:a"));
            assert_eq!(a.recipient_position.unwrap().latitude, 55.1);
        }
        other => panic!("expected BroadcastAck, got {:?}", other),
    }
}

// ---------------------------------------------------------------------------
// Malformed frames
// ---------------------------------------------------------------------------

#[test]
fn malformed_frames_are_rejected() {
    assert!(matches!(decode_frame("not json"), Err(FrameError::Json(_))));
    assert!(matches!(decode_frame(r#"{"kind":"hello"}"#), Err(FrameError::NotAnArray)));
    assert!(matches!(decode_frame("[]"), Err(FrameError::EmptyFrame)));
    assert!(matches!(decode_frame(r#"["welcome"]"#), Err(FrameError::KindNotAnInteger)));
    assert!(matches!(decode_frame("[99]"), Err(FrameError::UnknownKind(99))));
    // Right kind, missing field.
    assert!(matches!(decode_frame("[3]"), Err(FrameError::Field { index: 1, .. })));
    // Right kind, wrong field type.
    assert!(matches!(
        decode_frame(r#"[10, "not-a-number", "ch"]"#),
        Err(FrameError::Field { index: 1, .. })
    ));
    // Invalid id inside an otherwise well-formed frame.
    assert!(matches!(
        decode_frame(r#"[1, 1, "", "banner"]"#),
        Err(FrameError::Id(InvalidMaritimeId::Empty, 2))
    ));
}
