//! Encoder and decoder for command packets.
//!
//! Payload rules, appended after the header (all integers little-endian):
//!
//! | command      | REQUEST                              | SUCCESS_RESPONSE  |
//! |--------------|--------------------------------------|-------------------|
//! | API_CALL     | u16 name len, name, u32 len, body    | u32 len, body     |
//! | PING         | u16 len, bytes                       | u16 len, bytes    |
//! | PUSH_MESSAGE | u32 len, bytes                       | empty             |
//! | BINARY_CHUNK | u32 stream id, u32 index, u32 len, bytes | empty         |
//! | CLOSE        | empty                                | empty             |
//!
//! ERROR_RESPONSE carries `u16 len` followed by `"<namespace>:<message>"`.

use crate::error::{ProtocolError, RpcError};
use crate::packet::{
    Command, Content, Packet, PacketType, Payload, HEADER_SIZE, MAX_LONG_FIELD, MAX_SEQUENCE,
    MAX_SHORT_FIELD,
};
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes packets into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a packet into the segments of one logical frame.
    ///
    /// The first segment holds the header and every fixed-size field; body
    /// segments follow without being copied.
    pub fn encode(packet: &Packet) -> Result<Vec<Bytes>, ProtocolError> {
        packet.validate()?;
        if packet.sequence > MAX_SEQUENCE {
            return Err(ProtocolError::SequenceOutOfRange(packet.sequence));
        }

        let mut head = BytesMut::with_capacity(HEADER_SIZE + 16);
        Self::put_header(&mut head, packet);

        let body = match &packet.content {
            Content::ApiCall { name, body } => {
                Self::put_short(&mut head, "api name", name.as_bytes())?;
                Self::put_long_len(&mut head, "api body", body)?;
                Some(body)
            }
            Content::ApiResult { body } => {
                Self::put_long_len(&mut head, "api body", body)?;
                Some(body)
            }
            Content::Ping(payload) => {
                let len = Self::check_len("ping payload", payload.len(), MAX_SHORT_FIELD)?;
                head.put_u16_le(len as u16);
                Some(payload)
            }
            Content::PushMessage(payload) => {
                Self::put_long_len(&mut head, "push message", payload)?;
                Some(payload)
            }
            Content::BinaryChunk {
                stream_id,
                index,
                chunk,
            } => {
                head.put_u32_le(*stream_id);
                head.put_u32_le(*index);
                Self::put_long_len(&mut head, "binary chunk", chunk)?;
                Some(chunk)
            }
            Content::Empty => None,
            Content::Error(err) => {
                Self::put_short(&mut head, "error message", err.to_wire().as_bytes())?;
                None
            }
        };

        let mut frame = Vec::with_capacity(1 + body.map_or(0, |b| b.segments().len()));
        frame.push(head.freeze());
        if let Some(body) = body {
            frame.extend(body.segments().iter().cloned());
        }
        Ok(frame)
    }

    /// Encodes a packet into a single contiguous buffer.
    pub fn encode_to_bytes(packet: &Packet) -> Result<Bytes, ProtocolError> {
        let frame = Self::encode(packet)?;
        if frame.len() == 1 {
            return Ok(frame.into_iter().next().unwrap_or_default());
        }
        let total = frame.iter().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for segment in &frame {
            buf.extend_from_slice(segment);
        }
        Ok(buf.freeze())
    }

    fn put_header(buf: &mut BytesMut, packet: &Packet) {
        buf.put_u8(packet.command.code());
        buf.put_u8(packet.packet_type.code());
        buf.put_u16((packet.sequence >> 32) as u16);
        buf.put_u32(packet.sequence as u32);
    }

    fn check_len(field: &'static str, size: usize, max: usize) -> Result<usize, ProtocolError> {
        if size > max {
            return Err(ProtocolError::FieldTooLarge { field, size, max });
        }
        Ok(size)
    }

    fn put_short(buf: &mut BytesMut, field: &'static str, data: &[u8]) -> Result<(), ProtocolError> {
        let len = Self::check_len(field, data.len(), MAX_SHORT_FIELD)?;
        buf.put_u16_le(len as u16);
        buf.put_slice(data);
        Ok(())
    }

    fn put_long_len(
        buf: &mut BytesMut,
        field: &'static str,
        payload: &Payload,
    ) -> Result<(), ProtocolError> {
        let len = Self::check_len(field, payload.len(), MAX_LONG_FIELD)?;
        buf.put_u32_le(len as u32);
        Ok(())
    }
}

/// Decodes frames into packets.
pub struct Decoder;

impl Decoder {
    /// Decodes one logical frame delivered as any number of segments.
    ///
    /// Segment boundaries need not line up with field boundaries. On failure
    /// no partial packet is produced.
    pub fn decode(frame: &[Bytes]) -> Result<Packet, ProtocolError> {
        let mut cursor = Cursor::new(frame);

        let mut header = [0u8; HEADER_SIZE];
        cursor.read_exact(&mut header)?;

        let command = Command::from_code(header[0])?;
        let packet_type = PacketType::from_code(header[1])?;
        let high = u16::from_be_bytes([header[2], header[3]]) as u64;
        let low = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as u64;
        let sequence = (high << 32) | low;

        let content = match (packet_type, command) {
            (PacketType::ErrorResponse, _) => {
                let len = cursor.read_u16_le()? as usize;
                let text = cursor.read_payload(len)?.to_bytes();
                let text = std::str::from_utf8(&text)
                    .map_err(|_| ProtocolError::InvalidUtf8("error message"))?;
                Content::Error(RpcError::from_wire(text))
            }
            (PacketType::Request, Command::ApiCall) => {
                let name_len = cursor.read_u16_le()? as usize;
                let name = cursor.read_payload(name_len)?.to_bytes();
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| ProtocolError::InvalidUtf8("api name"))?;
                let body_len = cursor.read_u32_le()? as usize;
                let body = cursor.read_payload(body_len)?;
                Content::ApiCall { name, body }
            }
            (PacketType::SuccessResponse, Command::ApiCall) => {
                let len = cursor.read_u32_le()? as usize;
                Content::ApiResult {
                    body: cursor.read_payload(len)?,
                }
            }
            (_, Command::Ping) => {
                let len = cursor.read_u16_le()? as usize;
                Content::Ping(cursor.read_payload(len)?)
            }
            (PacketType::Request, Command::PushMessage) => {
                let len = cursor.read_u32_le()? as usize;
                Content::PushMessage(cursor.read_payload(len)?)
            }
            (PacketType::Request, Command::BinaryChunk) => {
                let stream_id = cursor.read_u32_le()?;
                let index = cursor.read_u32_le()?;
                let len = cursor.read_u32_le()? as usize;
                Content::BinaryChunk {
                    stream_id,
                    index,
                    chunk: cursor.read_payload(len)?,
                }
            }
            (PacketType::SuccessResponse, Command::PushMessage)
            | (PacketType::SuccessResponse, Command::BinaryChunk)
            | (_, Command::Close) => Content::Empty,
        };

        // Bodies of API_CALL and BINARY_CHUNK may be followed by the reserved
        // extension block, which is not interpreted.
        let has_extension_slot = matches!(
            (packet_type, command),
            (PacketType::Request, Command::ApiCall)
                | (PacketType::SuccessResponse, Command::ApiCall)
                | (PacketType::Request, Command::BinaryChunk)
        );
        let trailing = cursor.remaining();
        if trailing > 0 && !has_extension_slot {
            return Err(ProtocolError::TrailingBytes(trailing));
        }

        Ok(Packet {
            command,
            packet_type,
            sequence,
            content,
        })
    }

    /// Decodes a frame held in one contiguous buffer.
    pub fn decode_bytes(frame: &Bytes) -> Result<Packet, ProtocolError> {
        Self::decode(std::slice::from_ref(frame))
    }
}

/// Read position across the segments of one frame.
struct Cursor<'a> {
    segments: &'a [Bytes],
    index: usize,
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(segments: &'a [Bytes]) -> Self {
        Self {
            segments,
            index: 0,
            offset: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.segments[self.index.min(self.segments.len())..]
            .iter()
            .map(Bytes::len)
            .sum::<usize>()
            - self.offset
    }

    fn ensure(&self, len: usize) -> Result<(), ProtocolError> {
        let remaining = self.remaining();
        if remaining < len {
            return Err(ProtocolError::Incomplete {
                needed: len - remaining,
            });
        }
        Ok(())
    }

    /// Moves past exhausted segments.
    fn settle(&mut self) {
        while self.index < self.segments.len() && self.offset == self.segments[self.index].len() {
            self.index += 1;
            self.offset = 0;
        }
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<(), ProtocolError> {
        self.ensure(dst.len())?;
        let mut filled = 0;
        while filled < dst.len() {
            self.settle();
            let segment = &self.segments[self.index];
            let n = (segment.len() - self.offset).min(dst.len() - filled);
            dst[filled..filled + n].copy_from_slice(&segment[self.offset..self.offset + n]);
            self.offset += n;
            filled += n;
        }
        Ok(())
    }

    fn read_u16_le(&mut self) -> Result<u16, ProtocolError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32, ProtocolError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads `len` bytes as zero-copy slices of the input segments.
    fn read_payload(&mut self, len: usize) -> Result<Payload, ProtocolError> {
        self.ensure(len)?;
        let mut payload = Payload::new();
        let mut left = len;
        while left > 0 {
            self.settle();
            let segment = &self.segments[self.index];
            let n = (segment.len() - self.offset).min(left);
            payload.push(segment.slice(self.offset..self.offset + n));
            self.offset += n;
            left -= n;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn split_every(bytes: &Bytes, size: usize) -> Vec<Bytes> {
        (0..bytes.len())
            .step_by(size)
            .map(|start| bytes.slice(start..(start + size).min(bytes.len())))
            .collect()
    }

    #[test]
    fn test_api_call_wire_bytes() {
        let packet = Packet::api_call(42, "echo", "hello");
        let encoded = Encoder::encode_to_bytes(&packet).unwrap();

        let mut expected = vec![0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A];
        expected.extend_from_slice(&[0x04, 0x00]);
        expected.extend_from_slice(b"echo");
        expected.extend_from_slice(&[0x05, 0x00, 0x00, 0x00]);
        expected.extend_from_slice(b"hello");
        assert_eq!(encoded.as_ref(), expected.as_slice());

        let decoded = Decoder::decode_bytes(&encoded).unwrap();
        assert_eq!(decoded.command, Command::ApiCall);
        assert_eq!(decoded.packet_type, PacketType::Request);
        assert_eq!(decoded.sequence, 42);
        match decoded.content {
            Content::ApiCall { name, body } => {
                assert_eq!(name, "echo");
                assert_eq!(body.to_bytes(), Bytes::from_static(b"hello"));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_body_segments_are_not_copied() {
        let body = Payload::from_segments(vec![
            Bytes::from_static(b"he"),
            Bytes::from_static(b"llo"),
        ]);
        let frame = Encoder::encode(&Packet::api_call(1, "echo", body)).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(frame[1].as_ref(), b"he");
        assert_eq!(frame[2].as_ref(), b"llo");
        // Length field covers both segments
        assert_eq!(&frame[0][14..18], &[0x05, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_large_sequence() {
        let sequence = MAX_SEQUENCE;
        let packet = Packet::success(Command::Close, sequence, Content::Empty);
        let encoded = Encoder::encode_to_bytes(&packet).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE);
        assert_eq!(&encoded[2..8], &[0xff; 6]);
        assert_eq!(Decoder::decode_bytes(&encoded).unwrap().sequence, sequence);

        let packet = Packet::success(Command::Close, (7 << 32) | 9, Content::Empty);
        let encoded = Encoder::encode_to_bytes(&packet).unwrap();
        assert_eq!(&encoded[2..8], &[0x00, 0x07, 0x00, 0x00, 0x00, 0x09]);
    }

    #[test]
    fn test_sequence_out_of_range() {
        let packet = Packet::success(Command::Close, MAX_SEQUENCE + 1, Content::Empty);
        assert!(matches!(
            Encoder::encode(&packet),
            Err(ProtocolError::SequenceOutOfRange(_))
        ));
    }

    #[test]
    fn test_every_table_entry_roundtrips_split() {
        let packets = vec![
            Packet::api_call(1, "math.add", "[1,2]"),
            Packet::success(
                Command::ApiCall,
                2,
                Content::ApiResult { body: "3".into() },
            ),
            Packet::request(Command::Ping, 3, Content::Ping("are you there".into())),
            Packet::success(Command::Ping, 3, Content::Ping("are you there".into())),
            Packet::request(Command::PushMessage, 4, Content::PushMessage("news".into())),
            Packet::success(Command::PushMessage, 4, Content::Empty),
            Packet::request(
                Command::BinaryChunk,
                5,
                Content::BinaryChunk {
                    stream_id: 0xdead_beef,
                    index: 7,
                    chunk: "chunk data".into(),
                },
            ),
            Packet::success(Command::BinaryChunk, 5, Content::Empty),
            Packet::request(Command::Close, 6, Content::Empty),
            Packet::success(Command::Close, 6, Content::Empty),
            Packet::error(Command::ApiCall, 7, RpcError::app("denied")),
            Packet::error(Command::BinaryChunk, 8, ErrorKind::StreamNotFound.into()),
        ];

        for packet in packets {
            let encoded = Encoder::encode_to_bytes(&packet).unwrap();
            for size in [1, 3, 8, encoded.len()] {
                let decoded = Decoder::decode(&split_every(&encoded, size)).unwrap();
                assert_eq!(decoded, packet, "split size {}", size);
            }
        }
    }

    #[test]
    fn test_empty_payloads() {
        let packet = Packet::request(Command::Ping, 1, Content::Ping(Payload::new()));
        let encoded = Encoder::encode_to_bytes(&packet).unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 2);
        assert_eq!(Decoder::decode_bytes(&encoded).unwrap(), packet);

        let packet = Packet::request(
            Command::BinaryChunk,
            1,
            Content::BinaryChunk {
                stream_id: 1,
                index: 0,
                chunk: Payload::new(),
            },
        );
        let encoded = Encoder::encode_to_bytes(&packet).unwrap();
        assert_eq!(Decoder::decode_bytes(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_unknown_codes_rejected() {
        let mut bytes = vec![0x09, 0x00, 0, 0, 0, 0, 0, 1];
        assert!(matches!(
            Decoder::decode_bytes(&Bytes::from(bytes.clone())),
            Err(ProtocolError::UnknownCommand(0x09))
        ));

        bytes[0] = Command::Close.code();
        bytes[1] = 0x07;
        assert!(matches!(
            Decoder::decode_bytes(&Bytes::from(bytes)),
            Err(ProtocolError::UnknownPacketType(0x07))
        ));
    }

    #[test]
    fn test_truncated_header() {
        let result = Decoder::decode(&[Bytes::from_static(&[0, 0, 0]), Bytes::from_static(&[0])]);
        assert!(matches!(result, Err(ProtocolError::Incomplete { needed: 4 })));

        assert!(matches!(
            Decoder::decode(&[]),
            Err(ProtocolError::Incomplete { needed: 8 })
        ));
    }

    #[test]
    fn test_truncated_body() {
        let encoded = Encoder::encode_to_bytes(&Packet::api_call(1, "echo", "hello")).unwrap();
        let truncated = encoded.slice(..encoded.len() - 2);
        let err = Decoder::decode_bytes(&truncated).unwrap_err();
        assert!(matches!(err, ProtocolError::Incomplete { needed: 2 }));
        assert_eq!(err.kind(), ErrorKind::IncompletePacket);
    }

    #[test]
    fn test_trailing_bytes() {
        let packet = Packet::request(Command::Ping, 1, Content::Ping("x".into()));
        let mut frame = Encoder::encode(&packet).unwrap();
        frame.push(Bytes::from_static(b"zz"));
        assert!(matches!(
            Decoder::decode(&frame),
            Err(ProtocolError::TrailingBytes(2))
        ));
    }

    #[test]
    fn test_extension_after_body_is_ignored() {
        let packet = Packet::api_call(9, "upload", "data");
        let mut frame = Encoder::encode(&packet).unwrap();
        // Extension header followed by one extra chunk
        frame.push(Bytes::from_static(&[4, 0, 0, 0, 1, 1, 0, 0, 0, 2, 0, 0, 0, 0xaa, 0xbb]));
        assert_eq!(Decoder::decode(&frame).unwrap(), packet);
    }

    #[test]
    fn test_invalid_utf8_name() {
        let mut bytes = vec![0, 0, 0, 0, 0, 0, 0, 1];
        bytes.extend_from_slice(&[2, 0, 0xff, 0xfe]);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(
            Decoder::decode_bytes(&Bytes::from(bytes)),
            Err(ProtocolError::InvalidUtf8("api name"))
        ));
    }

    #[test]
    fn test_field_too_large() {
        let name = "n".repeat(MAX_SHORT_FIELD + 1);
        assert!(matches!(
            Encoder::encode(&Packet::api_call(1, name, "")),
            Err(ProtocolError::FieldTooLarge {
                field: "api name",
                ..
            })
        ));

        let ping = Payload::from(vec![0u8; MAX_SHORT_FIELD + 1]);
        assert!(Encoder::encode(&Packet::request(Command::Ping, 1, Content::Ping(ping))).is_err());
    }

    #[test]
    fn test_mismatched_content_rejected_by_encoder() {
        let packet = Packet::success(Command::ApiCall, 1, Content::Empty);
        assert!(matches!(
            Encoder::encode(&packet),
            Err(ProtocolError::ContentMismatch { .. })
        ));
    }

    mod roundtrip {
        use super::*;
        use proptest::prelude::*;

        fn arb_payload() -> impl Strategy<Value = Payload> {
            proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..4)
                .prop_map(|segments| {
                    Payload::from_segments(segments.into_iter().map(Bytes::from).collect())
                })
        }

        fn arb_packet() -> impl Strategy<Value = Packet> {
            let sequence = 0..=MAX_SEQUENCE;
            prop_oneof![
                (sequence.clone(), "[a-z.]{0,24}", arb_payload())
                    .prop_map(|(seq, name, body)| Packet::api_call(seq, name, body)),
                (sequence.clone(), arb_payload()).prop_map(|(seq, body)| Packet::success(
                    Command::ApiCall,
                    seq,
                    Content::ApiResult { body }
                )),
                (sequence.clone(), arb_payload())
                    .prop_map(|(seq, p)| Packet::request(Command::Ping, seq, Content::Ping(p))),
                (sequence.clone(), arb_payload()).prop_map(|(seq, p)| Packet::request(
                    Command::PushMessage,
                    seq,
                    Content::PushMessage(p)
                )),
                (sequence.clone(), any::<u32>(), any::<u32>(), arb_payload()).prop_map(
                    |(seq, stream_id, index, chunk)| Packet::request(
                        Command::BinaryChunk,
                        seq,
                        Content::BinaryChunk {
                            stream_id,
                            index,
                            chunk
                        }
                    )
                ),
                (sequence.clone(), "[ -~]{0,40}").prop_map(|(seq, msg)| Packet::error(
                    Command::PushMessage,
                    seq,
                    RpcError::App(msg)
                )),
                sequence.prop_map(|seq| Packet::request(Command::Close, seq, Content::Empty)),
            ]
        }

        proptest! {
            #[test]
            fn decode_inverts_encode_for_any_split(
                packet in arb_packet(),
                cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
            ) {
                let encoded = Encoder::encode_to_bytes(&packet).unwrap();
                let mut points: Vec<usize> = cuts.iter().map(|c| c.index(encoded.len() + 1)).collect();
                points.push(0);
                points.push(encoded.len());
                points.sort_unstable();
                points.dedup();
                let segments: Vec<Bytes> = points
                    .windows(2)
                    .map(|w| encoded.slice(w[0]..w[1]))
                    .collect();

                let decoded = Decoder::decode(&segments).unwrap();
                prop_assert_eq!(decoded, packet);
            }
        }
    }
}
