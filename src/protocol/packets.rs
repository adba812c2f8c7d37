//! MQTT 3.1.1 control packets used by the client
//!
//! Covers CONNECT, CONNACK, PUBLISH, PUBACK, SUBSCRIBE, SUBACK, PINGREQ,
//! PINGRESP and DISCONNECT. QoS 2 flows, UNSUBSCRIBE and will messages are
//! not part of the supported subset.

use super::codec::{
    decode_fixed_header, encode_fixed_header, put_binary, put_string, CodecError, PacketType,
    Reader,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;

/// SUBACK return code signalling a rejected subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// Delivery guarantee; QoS 2 is intentionally absent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    #[default]
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_level(level: u8, packet: PacketType) -> Result<Self, CodecError> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Err(CodecError::malformed(packet, "QoS 2 is not supported")),
            other => Err(CodecError::malformed(packet, format!("invalid QoS {other}"))),
        }
    }
}

/// CONNACK return codes of MQTT 3.1.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUsernamePassword,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn code(self) -> u8 {
        match self {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadUsernamePassword => 4,
            ConnectReturnCode::NotAuthorized => 5,
        }
    }

    fn from_code(code: u8) -> Result<Self, CodecError> {
        match code {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUsernamePassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(CodecError::malformed(
                PacketType::ConnAck,
                format!("reserved return code {other}"),
            )),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "connection accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "the server does not support the requested MQTT protocol level"
            }
            ConnectReturnCode::IdentifierRejected => "client identifier rejected by the server",
            ConnectReturnCode::ServerUnavailable => "MQTT service is unavailable",
            ConnectReturnCode::BadUsernamePassword => "malformed user name or password",
            ConnectReturnCode::NotAuthorized => "client is not authorized to connect",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present exactly when `qos` is AtLeastOnce
    pub packet_id: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

impl SubAck {
    pub fn is_success(&self) -> bool {
        !self.return_codes.iter().any(|&code| code >= SUBACK_FAILURE)
    }
}

/// A decoded or to-be-encoded control packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PubAck { .. } => PacketType::PubAck,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    /// Serialize into a complete frame
    pub fn encode(&self) -> Result<BytesMut, CodecError> {
        let mut body = BytesMut::new();
        let flags = match self {
            Packet::Connect(connect) => {
                encode_connect_body(connect, &mut body)?;
                0
            }
            Packet::ConnAck(connack) => {
                body.put_u8(u8::from(connack.session_present));
                body.put_u8(connack.code.code());
                0
            }
            Packet::Publish(publish) => {
                put_string(&mut body, &publish.topic)?;
                if publish.qos == QoS::AtLeastOnce {
                    let packet_id = publish.packet_id.ok_or_else(|| {
                        CodecError::malformed(PacketType::Publish, "QoS 1 without packet id")
                    })?;
                    body.put_u16(packet_id);
                }
                body.put_slice(&publish.payload);
                (u8::from(publish.dup) << 3)
                    | ((publish.qos as u8) << 1)
                    | u8::from(publish.retain)
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(*packet_id);
                0
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    put_string(&mut body, filter)?;
                    body.put_u8(*qos as u8);
                }
                0x02
            }
            Packet::SubAck(suback) => {
                body.put_u16(suback.packet_id);
                body.put_slice(&suback.return_codes);
                0
            }
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };

        let mut frame = BytesMut::with_capacity(body.len() + 5);
        encode_fixed_header(self.packet_type(), flags, body.len(), &mut frame)?;
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// `Ok(None)` means the frame is not complete yet; on success the number
    /// of consumed bytes is returned with the packet.
    pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, CodecError> {
        let Some(header) = decode_fixed_header(buf)? else {
            return Ok(None);
        };
        if buf.len() < header.frame_length() {
            return Ok(None);
        }

        let body = &buf[header.header_length..header.frame_length()];
        let packet_type = header.packet_type;
        let mut reader = Reader::new(packet_type, body);

        let packet = match packet_type {
            PacketType::Connect => Packet::Connect(decode_connect_body(&mut reader)?),
            PacketType::ConnAck => {
                let ack_flags = reader.u8()?;
                let code = ConnectReturnCode::from_code(reader.u8()?)?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    code,
                })
            }
            PacketType::Publish => {
                let qos = QoS::from_level((header.flags >> 1) & 0x03, packet_type)?;
                let topic = reader.string()?;
                let packet_id = match qos {
                    QoS::AtMostOnce => None,
                    QoS::AtLeastOnce => Some(reader.u16()?),
                };
                Packet::Publish(Publish {
                    topic,
                    payload: Bytes::copy_from_slice(reader.rest()),
                    qos,
                    retain: header.flags & 0x01 != 0,
                    dup: header.flags & 0x08 != 0,
                    packet_id,
                })
            }
            PacketType::PubAck => Packet::PubAck {
                packet_id: reader.u16()?,
            },
            PacketType::Subscribe => {
                let packet_id = reader.u16()?;
                let mut filters = Vec::new();
                while reader.remaining() > 0 {
                    let filter = reader.string()?;
                    let qos = QoS::from_level(reader.u8()? & 0x03, packet_type)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(CodecError::malformed(packet_type, "no topic filters"));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            PacketType::SubAck => {
                let packet_id = reader.u16()?;
                let return_codes = reader.rest().to_vec();
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
            PacketType::Disconnect => Packet::Disconnect,
            unsupported => return Err(CodecError::UnsupportedPacketType(unsupported)),
        };

        Ok(Some((packet, header.frame_length())))
    }
}

fn encode_connect_body(connect: &Connect, body: &mut BytesMut) -> Result<(), CodecError> {
    put_string(body, PROTOCOL_NAME)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut connect_flags = 0u8;
    if connect.clean_session {
        connect_flags |= 0x02;
    }
    if connect.username.is_some() {
        connect_flags |= 0x80;
        if connect.password.is_some() {
            connect_flags |= 0x40;
        }
    }
    body.put_u8(connect_flags);
    body.put_u16(connect.keep_alive);

    put_string(body, &connect.client_id)?;
    if let Some(username) = &connect.username {
        put_string(body, username)?;
        if let Some(password) = &connect.password {
            put_binary(body, password.as_bytes())?;
        }
    }
    Ok(())
}

fn decode_connect_body(reader: &mut Reader<'_>) -> Result<Connect, CodecError> {
    let protocol = reader.string()?;
    if protocol != PROTOCOL_NAME {
        return Err(CodecError::malformed(
            PacketType::Connect,
            format!("unexpected protocol name {protocol}"),
        ));
    }
    let _level = reader.u8()?;
    let connect_flags = reader.u8()?;
    let keep_alive = reader.u16()?;
    let client_id = reader.string()?;

    let username = if connect_flags & 0x80 != 0 {
        Some(reader.string()?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        let len = reader.u16()? as usize;
        let raw = reader.bytes(len)?;
        Some(String::from_utf8_lossy(raw).into_owned())
    } else {
        None
    };

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: connect_flags & 0x02 != 0,
        username,
        password,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(packet: &Packet) -> Packet {
        let frame = packet.encode().unwrap();
        let (decoded, used) = Packet::decode(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        decoded
    }

    #[test]
    fn test_connect_wire_format() {
        let connect = Packet::Connect(Connect {
            client_id: "hg".to_string(),
            keep_alive: 60,
            clean_session: true,
            username: Some("u".to_string()),
            password: Some("p".to_string()),
        });
        let frame = connect.encode().unwrap();
        assert_eq!(
            frame.to_vec(),
            vec![
                0x10, 0x14, // fixed header
                0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xC2, 0x00, 0x3C, // variable header
                0x00, 0x02, b'h', b'g', 0x00, 0x01, b'u', 0x00, 0x01, b'p',
            ]
        );
        assert_eq!(decode_all(&connect), connect);
    }

    #[test]
    fn test_connect_without_credentials() {
        let connect = Packet::Connect(Connect {
            client_id: "anon".to_string(),
            keep_alive: 30,
            clean_session: true,
            username: None,
            password: None,
        });
        let frame = connect.encode().unwrap();
        assert_eq!(frame[9], 0x02, "only clean session flag set");
        assert_eq!(decode_all(&connect), connect);
    }

    #[test]
    fn test_oversized_password_is_rejected() {
        let connect = Packet::Connect(Connect {
            client_id: "hg".to_string(),
            keep_alive: 30,
            clean_session: true,
            username: Some("user".to_string()),
            password: Some("x".repeat(70_000)),
        });
        assert_eq!(connect.encode().unwrap_err(), CodecError::FieldTooLong(70_000));
    }

    #[test]
    fn test_publish_qos1_carries_packet_id() {
        let publish = Packet::Publish(Publish {
            topic: "homegear/1/c/d".to_string(),
            payload: Bytes::from_static(b"1"),
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: false,
            packet_id: Some(7),
        });
        let frame = publish.encode().unwrap();
        assert_eq!(frame[0], 0x33, "PUBLISH with QoS 1 and retain");
        assert_eq!(decode_all(&publish), publish);
    }

    #[test]
    fn test_publish_qos0_has_no_packet_id() {
        let publish = Packet::Publish(Publish {
            topic: "t".to_string(),
            payload: Bytes::from_static(b"abc"),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        });
        let frame = publish.encode().unwrap();
        assert_eq!(frame.to_vec(), vec![0x30, 0x06, 0x00, 0x01, b't', b'a', b'b', b'c']);
        assert_eq!(decode_all(&publish), publish);
    }

    #[test]
    fn test_qos1_publish_requires_packet_id() {
        let publish = Packet::Publish(Publish {
            topic: "t".to_string(),
            payload: Bytes::new(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            packet_id: None,
        });
        assert!(publish.encode().is_err());
    }

    #[test]
    fn test_qos2_publish_is_rejected() {
        let frame = [0x34, 0x05, 0x00, 0x01, b't', 0x00, 0x01];
        assert!(matches!(
            Packet::decode(&frame),
            Err(CodecError::Malformed { .. })
        ));
    }

    #[test]
    fn test_subscribe_and_suback() {
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id: 3,
            filters: vec![("homegear/1/set/#".to_string(), QoS::AtLeastOnce)],
        });
        let frame = subscribe.encode().unwrap();
        assert_eq!(frame[0], 0x82);
        assert_eq!(decode_all(&subscribe), subscribe);

        let suback = Packet::SubAck(SubAck {
            packet_id: 3,
            return_codes: vec![0x01],
        });
        assert_eq!(decode_all(&suback), suback);
    }

    #[test]
    fn test_suback_failure_code() {
        let ok = SubAck {
            packet_id: 1,
            return_codes: vec![0x00, 0x01],
        };
        let failed = SubAck {
            packet_id: 1,
            return_codes: vec![0x01, SUBACK_FAILURE],
        };
        assert!(ok.is_success());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_connack_return_codes() {
        for code in 0u8..=5 {
            let frame = [0x20, 0x02, 0x00, code];
            let (packet, used) = Packet::decode(&frame).unwrap().unwrap();
            assert_eq!(used, 4);
            match packet {
                Packet::ConnAck(ack) => assert_eq!(ack.code.code(), code),
                other => panic!("unexpected packet {other:?}"),
            }
        }

        let reserved = [0x20, 0x02, 0x00, 0x06];
        assert!(Packet::decode(&reserved).is_err());
    }

    #[test]
    fn test_empty_body_packets() {
        assert_eq!(Packet::PingReq.encode().unwrap().to_vec(), vec![0xC0, 0x00]);
        assert_eq!(Packet::PingResp.encode().unwrap().to_vec(), vec![0xD0, 0x00]);
        assert_eq!(Packet::Disconnect.encode().unwrap().to_vec(), vec![0xE0, 0x00]);
        assert_eq!(decode_all(&Packet::PingResp), Packet::PingResp);
    }

    #[test]
    fn test_incomplete_frame_is_not_an_error() {
        let frame = Packet::PubAck { packet_id: 9 }.encode().unwrap();
        for cut in 0..frame.len() {
            assert_eq!(Packet::decode(&frame[..cut]).unwrap(), None, "cut at {cut}");
        }
    }

    #[test]
    fn test_decode_leaves_trailing_bytes() {
        let mut stream = Packet::PingResp.encode().unwrap();
        stream.extend_from_slice(&Packet::PubAck { packet_id: 2 }.encode().unwrap());

        let (first, used) = Packet::decode(&stream).unwrap().unwrap();
        assert_eq!(first, Packet::PingResp);
        let (second, _) = Packet::decode(&stream[used..]).unwrap().unwrap();
        assert_eq!(second, Packet::PubAck { packet_id: 2 });
    }

    #[test]
    fn test_unsupported_packet_type() {
        // PUBREC belongs to QoS 2
        let frame = [0x50, 0x02, 0x00, 0x01];
        assert_eq!(
            Packet::decode(&frame),
            Err(CodecError::UnsupportedPacketType(PacketType::PubRec))
        );
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        // PUBACK declaring one body byte only
        let frame = [0x40, 0x01, 0x00];
        assert!(matches!(
            Packet::decode(&frame),
            Err(CodecError::Malformed { .. })
        ));
    }
}
