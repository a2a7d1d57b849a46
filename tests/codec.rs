use heapless::Vec;
use minimqtt::mqtt::packet::*;
use minimqtt::mqtt::{Error, MalformedFrame};
use rand::Rng;

#[test]
fn test_remaining_length_random_values() {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let value = rng.gen_range(0..=MQTT_MSG_MAX_SZ);
        let encoded = encode_remaining_length(value).unwrap();
        let expected_len = match value {
            0..=127 => 1,
            128..=16_383 => 2,
            16_384..=2_097_151 => 3,
            _ => 4,
        };
        assert_eq!(encoded.len(), expected_len);

        let mut reader: &[u8] = &encoded;
        assert_eq!(decode_remaining_length(&mut reader), Ok(value));
    }
}

#[test]
fn test_publish_through_frame_reader() {
    let mut rng = rand::thread_rng();
    let mut wire = [0u8; 600];
    for _ in 0..200 {
        let topic_len = rng.gen_range(1..=64);
        let topic: String = (0..topic_len)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        let mut payload = vec![0u8; rng.gen_range(0..=400)];
        rng.fill(&mut payload[..]);
        let qos = if rng.gen_bool(0.5) { QoS::AtMostOnce } else { QoS::AtLeastOnce };

        let mut publish = Publish::new(&topic, &payload, qos).with_retain(rng.gen_bool(0.5));
        if qos == QoS::AtLeastOnce {
            publish = publish.with_packet_id(rng.gen_range(1..=u16::MAX));
        }
        let len = encode_publish(&mut wire, &publish, MQTT_MSG_SZ_LIM).unwrap();

        let mut reader: &[u8] = &wire[..len];
        let mut body: Vec<u8, 512> = Vec::new();
        let frame = read_frame(&mut reader, &mut body).unwrap().unwrap();
        assert!(frame.is_complete());
        assert!(reader.is_empty());
        assert_eq!(decode_publish_body(frame.header, &body), Ok(publish));
    }
}

#[test]
fn test_read_frame_drains_oversize_body() {
    let mut stream = vec![0x30, 0x0C, 0x00, 0x02, b'h', b'i'];
    stream.extend_from_slice(b"12345678");
    stream.extend_from_slice(&[0xD0, 0x00]);

    let mut reader: &[u8] = &stream;
    let mut body: Vec<u8, 8> = Vec::new();
    let frame = read_frame(&mut reader, &mut body).unwrap().unwrap();
    assert_eq!(frame.remaining_length, 12);
    assert_eq!(frame.stored, 8);
    assert!(!frame.is_complete());
    assert_eq!(&body[..4], &[0x00, 0x02, b'h', b'i']);

    let next = read_frame(&mut reader, &mut body).unwrap().unwrap();
    assert_eq!(next.header.packet_type, PacketType::PingResp);
    assert_eq!(next.remaining_length, 0);
}

#[test]
fn test_read_frame_without_data() {
    let mut reader: &[u8] = &[];
    let mut body: Vec<u8, 8> = Vec::new();
    assert_eq!(read_frame(&mut reader, &mut body), Ok(None));
}

#[test]
fn test_read_frame_truncated_body() {
    let mut reader: &[u8] = &[0x30, 0x05, 0x00];
    let mut body: Vec<u8, 8> = Vec::new();
    assert_eq!(
        read_frame(&mut reader, &mut body),
        Err(Error::MalformedFrame(MalformedFrame::Truncated))
    );
}

#[test]
fn test_decode_acks() {
    let (packet, used) = ControlPacket::decode(&[0x90, 0x03, 0x00, 0x2A, 0x01, 0xFF]).unwrap();
    assert_eq!(used, 5);
    assert_eq!(packet, ControlPacket::SubAck(SubAck::new(42, &[0x01]).unwrap()));

    let (packet, _) = ControlPacket::decode(&[0x90, 0x03, 0x00, 0x2A, 0x80]).unwrap();
    let ControlPacket::SubAck(ack) = packet else {
        panic!("expected SUBACK, got {packet:?}");
    };
    assert_eq!(ack.granted_qos(), Err(Error::SubscriptionRejected));

    assert_eq!(
        ControlPacket::decode(&[0x90, 0x03, 0x00, 0x2A, 0x03]),
        Err(Error::MalformedFrame(MalformedFrame::InvalidReturnCode))
    );
    assert_eq!(
        ControlPacket::decode(&[0xB0, 0x02, 0x01, 0x00]).map(|(p, _)| p),
        Ok(ControlPacket::UnsubAck(256))
    );
    assert_eq!(
        ControlPacket::decode(&[0x20, 0x02, 0x01, 0x00]).map(|(p, _)| p),
        Ok(ControlPacket::ConnAck(ConnAck {
            session_present: true,
            return_code: 0,
        }))
    );
}

#[test]
fn test_decode_suback_with_several_codes() {
    let (packet, used) = ControlPacket::decode(&[0x90, 0x05, 0x00, 0x07, 0x00, 0x80, 0x01]).unwrap();
    assert_eq!(used, 7);
    let ControlPacket::SubAck(ack) = packet else {
        panic!("expected SUBACK, got {packet:?}");
    };
    assert_eq!(ack.packet_id, 7);
    assert_eq!(ack.return_codes(), &[0x00, 0x80, 0x01]);
    assert_eq!(ack.granted_qos_at(0), Some(Ok(QoS::AtMostOnce)));
    assert_eq!(ack.granted_qos_at(1), Some(Err(Error::SubscriptionRejected)));
    assert_eq!(ack.granted_qos_at(2), Some(Ok(QoS::AtLeastOnce)));
    assert_eq!(ack.granted_qos_at(3), None);

    let mut buf = [0u8; 16];
    let len = ControlPacket::SubAck(ack).encode(&mut buf).unwrap();
    assert_eq!(&buf[..len], &[0x90, 0x05, 0x00, 0x07, 0x00, 0x80, 0x01]);

    assert_eq!(
        ControlPacket::decode(&[0x90, 0x02, 0x00, 0x07]),
        Err(Error::MalformedFrame(MalformedFrame::InvalidLength))
    );
}

#[test]
fn test_encode_subscribe_multiple() {
    let mut buf = [0u8; 64];
    let len = encode_subscribe_multiple(&mut buf, &[("a/b", QoS::AtMostOnce), ("c", QoS::AtLeastOnce)], 9).unwrap();
    assert_eq!(
        &buf[..len],
        &[0x82, 0x0C, 0x00, 0x09, 0x00, 0x03, b'a', b'/', b'b', 0x00, 0x00, 0x01, b'c', 0x01]
    );

    assert_eq!(
        encode_subscribe_multiple(&mut buf, &[], 9),
        Err(Error::Encoding(minimqtt::mqtt::EncodingError::TopicCount))
    );
    let too_many = [("t", QoS::AtMostOnce); MAX_SUBSCRIBE_TOPICS + 1];
    assert_eq!(
        encode_subscribe_multiple(&mut buf, &too_many, 9),
        Err(Error::Encoding(minimqtt::mqtt::EncodingError::TopicCount))
    );
    assert_eq!(
        encode_subscribe_multiple(&mut buf, &[("a", QoS::AtMostOnce), ("b", QoS::ExactlyOnce)], 9),
        Err(Error::UnsupportedQoS)
    );
}

#[test]
fn test_decode_rejects_malformed_packets() {
    assert_eq!(
        ControlPacket::decode(&[0x40, 0x02, 0x00, 0x00]),
        Err(Error::MalformedFrame(MalformedFrame::ZeroPacketId))
    );
    assert_eq!(
        ControlPacket::decode(&[0x41, 0x02, 0x00, 0x01]),
        Err(Error::MalformedFrame(MalformedFrame::InvalidFlags))
    );
    assert_eq!(
        ControlPacket::decode(&[0x00, 0x00]),
        Err(Error::MalformedFrame(MalformedFrame::UnknownPacketType(0)))
    );
    assert_eq!(
        ControlPacket::decode(&[0x40, 0x03, 0x00, 0x01, 0x00]),
        Err(Error::MalformedFrame(MalformedFrame::InvalidLength))
    );
    assert_eq!(
        ControlPacket::decode(&[0x30, 0x04, 0x00, 0x02, 0xC3, 0x28]),
        Err(Error::MalformedFrame(MalformedFrame::InvalidUtf8))
    );
    assert_eq!(
        ControlPacket::decode(&[0x50, 0x02, 0x00, 0x01]),
        Err(Error::UnsupportedQoS)
    );
}

#[test]
fn test_connect_survives_encode_decode() {
    let mut connect = Connect::new("sensor-7", false, 30);
    connect.username = Some("user");
    connect.password = Some("secret");

    let mut buf = [0u8; 64];
    let len = encode_connect(&mut buf, &connect).unwrap();
    let (decoded, used) = ControlPacket::decode(&buf[..len]).unwrap();
    assert_eq!(used, len);
    assert_eq!(decoded, ControlPacket::Connect(connect));
}

#[test]
fn test_connect_rejects_bad_identity() {
    let mut buf = [0u8; 64];
    assert_eq!(
        encode_connect(&mut buf, &Connect::new("", true, 60)),
        Err(Error::Encoding(minimqtt::mqtt::EncodingError::InvalidClientId))
    );
    assert_eq!(
        encode_connect(&mut buf, &Connect::new("a-client-identifier-too-long", true, 60)),
        Err(Error::Encoding(minimqtt::mqtt::EncodingError::InvalidClientId))
    );

    let mut connect = Connect::new("dev", true, 60);
    connect.password = Some("secret");
    assert_eq!(
        encode_connect(&mut buf, &connect),
        Err(Error::Encoding(minimqtt::mqtt::EncodingError::PasswordWithoutUsername))
    );
}
