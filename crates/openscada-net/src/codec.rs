// ── GMPP framing codec ──
//
// Header layout (big-endian):
//
//   command_code: u32 | sequence: i64 | reply_sequence: i64 |
//   timestamp_ms: i64 | body_len: u32
//
// The body is a map: u32 entry count, then per entry a length-prefixed
// UTF-8 name followed by a tagged value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::message::{HEADER_SIZE, Message};
use crate::value::{Value, ValueMap, tag};

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Nesting limit for lists and maps inside a body.
const MAX_DEPTH: usize = 64;

const BODY_LEN_OFFSET: usize = HEADER_SIZE - 4;

/// `tokio_util` codec for GMPP messages.
#[derive(Debug, Clone)]
pub struct GmppCodec {
    max_frame_len: usize,
}

impl GmppCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for GmppCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Decoder for GmppCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[BODY_LEN_OFFSET..HEADER_SIZE]);
        let body_len = usize::try_from(u32::from_be_bytes(len_bytes))
            .map_err(|_| Error::protocol("body length does not fit in memory"))?;

        if body_len > self.max_frame_len {
            return Err(Error::protocol(format!(
                "frame body of {body_len} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }

        if src.len() < HEADER_SIZE + body_len {
            src.reserve(HEADER_SIZE + body_len - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_SIZE);
        let command_code = header.get_u32();
        let sequence = header.get_i64();
        let reply_sequence = header.get_i64();
        let timestamp = header.get_i64();

        let mut body = src.split_to(body_len).freeze();
        let values = decode_body(&mut body)?;
        if body.has_remaining() {
            return Err(Error::protocol(format!(
                "{} trailing bytes after message body",
                body.remaining()
            )));
        }

        Ok(Some(Message {
            command_code,
            sequence,
            reply_sequence,
            timestamp,
            values,
        }))
    }
}

impl Encoder<Message> for GmppCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Error> {
        let mut body = BytesMut::new();
        encode_body(&msg.values, &mut body)?;

        if body.len() > self.max_frame_len {
            return Err(Error::protocol(format!(
                "frame body of {} bytes exceeds limit of {}",
                body.len(),
                self.max_frame_len
            )));
        }

        dst.reserve(HEADER_SIZE + body.len());
        dst.put_u32(msg.command_code);
        dst.put_i64(msg.sequence);
        dst.put_i64(msg.reply_sequence);
        dst.put_i64(msg.timestamp);
        dst.put_u32(length_prefix(body.len())?);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

// ── Value encoding ───────────────────────────────────────────────────

/// Encode a message body (a map without its leading tag).
pub fn encode_body(values: &ValueMap, dst: &mut BytesMut) -> Result<(), Error> {
    encode_map_entries(values, dst)
}

/// Decode a message body (a map without its leading tag).
pub fn decode_body(src: &mut Bytes) -> Result<ValueMap, Error> {
    decode_map_entries(src, 0)
}

/// Encode a single tagged value.
pub fn encode_value(value: &Value, dst: &mut BytesMut) -> Result<(), Error> {
    dst.put_u32(value.tag());
    match value {
        Value::String(s) => put_string(s, dst)?,
        Value::Long(v) => dst.put_i64(*v),
        Value::Double(v) => dst.put_f64(*v),
        Value::Void => {}
        Value::Integer(v) => dst.put_i32(*v),
        Value::List(items) => {
            dst.put_u32(length_prefix(items.len())?);
            for item in items {
                encode_value(item, dst)?;
            }
        }
        Value::Map(entries) => encode_map_entries(entries, dst)?,
        Value::Boolean(b) => dst.put_u8(u8::from(*b)),
    }
    Ok(())
}

/// Decode a single tagged value.
pub fn decode_value(src: &mut Bytes) -> Result<Value, Error> {
    decode_value_at(src, 0)
}

fn decode_value_at(src: &mut Bytes, depth: usize) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::protocol("value nesting too deep"));
    }

    ensure(src, 4)?;
    let value_tag = src.get_u32();
    let value = match value_tag {
        tag::STRING => Value::String(get_string(src)?),
        tag::LONG => {
            ensure(src, 8)?;
            Value::Long(src.get_i64())
        }
        tag::DOUBLE => {
            ensure(src, 8)?;
            Value::Double(src.get_f64())
        }
        tag::VOID => Value::Void,
        tag::INTEGER => {
            ensure(src, 4)?;
            Value::Integer(src.get_i32())
        }
        tag::LIST => {
            let count = get_count(src)?;
            let mut items = Vec::with_capacity(count.min(src.remaining()));
            for _ in 0..count {
                items.push(decode_value_at(src, depth + 1)?);
            }
            Value::List(items)
        }
        tag::MAP => Value::Map(decode_map_entries(src, depth + 1)?),
        tag::BOOLEAN => {
            ensure(src, 1)?;
            Value::Boolean(src.get_u8() != 0)
        }
        other => return Err(Error::protocol(format!("unknown value tag {other}"))),
    };
    Ok(value)
}

fn encode_map_entries(entries: &ValueMap, dst: &mut BytesMut) -> Result<(), Error> {
    dst.put_u32(length_prefix(entries.len())?);
    for (name, value) in entries {
        put_string(name, dst)?;
        encode_value(value, dst)?;
    }
    Ok(())
}

fn decode_map_entries(src: &mut Bytes, depth: usize) -> Result<ValueMap, Error> {
    let count = get_count(src)?;
    let mut entries = ValueMap::new();
    for _ in 0..count {
        let name = get_string(src)?;
        let value = decode_value_at(src, depth)?;
        entries.insert(name, value);
    }
    Ok(entries)
}

// ── Primitive helpers ────────────────────────────────────────────────

fn put_string(s: &str, dst: &mut BytesMut) -> Result<(), Error> {
    dst.put_u32(length_prefix(s.len())?);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(src: &mut Bytes) -> Result<String, Error> {
    let len = get_count(src)?;
    ensure(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| Error::protocol(format!("invalid UTF-8: {e}")))
}

fn get_count(src: &mut Bytes) -> Result<usize, Error> {
    ensure(src, 4)?;
    usize::try_from(src.get_u32()).map_err(|_| Error::protocol("length prefix too large"))
}

fn ensure(src: &Bytes, needed: usize) -> Result<(), Error> {
    if src.remaining() < needed {
        return Err(Error::protocol(format!(
            "truncated body: needed {needed} bytes, {} left",
            src.remaining()
        )));
    }
    Ok(())
}

fn length_prefix(len: usize) -> Result<u32, Error> {
    u32::try_from(len).map_err(|_| Error::protocol(format!("length {len} exceeds u32")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::message::command;
    use pretty_assertions::assert_eq;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn sample() -> Message {
        let mut nested = ValueMap::new();
        nested.insert("unit".into(), Value::from("V"));
        nested.insert("quality".into(), Value::Double(0.5));

        let mut msg = Message::new(0x0001_0020)
            .with_value("item-id", "pump.speed")
            .with_value("value", 42_i32)
            .with_value("ts", 1_700_000_000_000_i64)
            .with_value("ok", true)
            .with_value("nothing", Value::Void)
            .with_value("list", vec![Value::Integer(1), Value::from("two")])
            .with_value("attributes", nested);
        msg.sequence = 3;
        msg.reply_sequence = 1;
        msg.timestamp = 1_000;
        msg
    }

    #[test]
    fn encode_then_decode_preserves_message() {
        let mut codec = GmppCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(sample(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn ping_frame_layout() {
        let mut msg = Message::new(command::PING);
        msg.sequence = 1;
        msg.timestamp = 2;

        let mut buf = BytesMut::new();
        GmppCodec::default().encode(msg, &mut buf).unwrap();

        assert_eq!(buf.len(), HEADER_SIZE + 4);
        insta::assert_snapshot!(
            hex(&buf),
            @"000000100000000000000001000000000000000000000000000000020000000400000000"
        );
    }

    #[test]
    fn scalar_value_layouts() {
        let cases = [
            (Value::from("ab"), "00000001000000026162"),
            (Value::Long(-1), "00000002ffffffffffffffff"),
            (Value::Double(1.0), "000000033ff0000000000000"),
            (Value::Void, "00000004"),
            (Value::Integer(258), "0000000500000102"),
            (Value::Boolean(true), "0000000801"),
        ];

        for (value, expected) in cases {
            let mut buf = BytesMut::new();
            encode_value(&value, &mut buf).unwrap();
            assert_eq!(hex(&buf), expected, "layout of {value:?}");
        }
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = GmppCodec::default();
        let mut full = BytesMut::new();
        codec.encode(sample(), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[HEADER_SIZE + 3..]);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn unknown_tag_is_protocol_error() {
        let mut body = BytesMut::new();
        body.put_u32(1);
        put_string("x", &mut body).unwrap();
        body.put_u32(0x99);

        let mut frame = BytesMut::new();
        frame.put_u32(command::ACK);
        frame.put_i64(1);
        frame.put_i64(0);
        frame.put_i64(0);
        frame.put_u32(u32::try_from(body.len()).unwrap());
        frame.extend_from_slice(&body);

        let err = GmppCodec::default().decode(&mut frame).unwrap_err();
        assert!(err.is_protocol(), "got {err:?}");
        assert!(err.to_string().contains("unknown value tag 153"));
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut frame = BytesMut::new();
        frame.put_u32(command::ACK);
        frame.put_i64(1);
        frame.put_i64(0);
        frame.put_i64(0);
        frame.put_u32(1024);

        let err = GmppCodec::new(16).decode(&mut frame).unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn truncated_string_is_protocol_error() {
        let mut raw = BytesMut::new();
        raw.put_u32(tag::STRING);
        raw.put_u32(10);
        raw.put_slice(b"abc");

        let err = decode_value(&mut raw.freeze()).unwrap_err();
        assert!(err.is_protocol());
    }
}
