// ── GMPP messages ──
//
// A message is a fixed 32-byte header followed by a map body. Sequences
// are assigned by the sending connection; replies carry the sequence of
// the request they answer in `reply_sequence`.

use chrono::Utc;

use crate::value::{Value, ValueMap};

/// Size of the fixed header: command code, sequence, reply sequence,
/// timestamp and body length.
pub const HEADER_SIZE: usize = 4 + 8 + 8 + 8 + 4;

/// Well-known command codes. Codes above `0xFF` are service specific.
pub mod command {
    pub const UNKNOWN_COMMAND: u32 = 0x0000_0001;
    pub const FAILED: u32 = 0x0000_0002;
    pub const ACK: u32 = 0x0000_0003;
    pub const PING: u32 = 0x0000_0010;
    pub const PONG: u32 = 0x0000_0011;
}

/// Body field carrying a human-readable failure reason.
pub const FIELD_ERROR_INFO: &str = "error-info";

/// A single GMPP message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub command_code: u32,
    pub sequence: i64,
    pub reply_sequence: i64,
    /// Milliseconds since the Unix epoch at creation.
    pub timestamp: i64,
    pub values: ValueMap,
}

impl Message {
    pub fn new(command_code: u32) -> Self {
        Self {
            command_code,
            sequence: 0,
            reply_sequence: 0,
            timestamp: Utc::now().timestamp_millis(),
            values: ValueMap::new(),
        }
    }

    /// A message answering the request with sequence `reply_sequence`.
    pub fn reply(command_code: u32, reply_sequence: i64) -> Self {
        Self {
            reply_sequence,
            ..Self::new(command_code)
        }
    }

    /// Positive acknowledgement of `request`.
    pub fn ack(request: &Message) -> Self {
        Self::reply(command::ACK, request.sequence)
    }

    /// Negative reply to `request` with a reason in `error-info`.
    pub fn failed(request: &Message, reason: impl Into<String>) -> Self {
        Self::reply(command::FAILED, request.sequence)
            .with_value(FIELD_ERROR_INFO, Value::String(reason.into()))
    }

    /// Reply to a request whose command code is not understood.
    pub fn unknown_command(request: &Message) -> Self {
        Self::reply(command::UNKNOWN_COMMAND, request.sequence)
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn set_value(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn unset_value(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// String field lookup.
    pub fn string(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    /// The `error-info` field of a `Failed` reply.
    pub fn error_info(&self) -> Option<&str> {
        self.string(FIELD_ERROR_INFO)
    }

    pub fn is_reply(&self) -> bool {
        self.reply_sequence != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_thirty_two_bytes() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn failed_reply_carries_reason_and_sequence() {
        let mut req = Message::new(0x0001_0010);
        req.sequence = 7;

        let reply = Message::failed(&req, "no such item");
        assert_eq!(reply.command_code, command::FAILED);
        assert_eq!(reply.reply_sequence, 7);
        assert_eq!(reply.error_info(), Some("no such item"));
        assert!(reply.is_reply());
    }

    #[test]
    fn builder_sets_and_unsets_values() {
        let mut msg = Message::new(command::ACK).with_value("item-id", "a.b");
        assert_eq!(msg.string("item-id"), Some("a.b"));
        msg.unset_value("item-id");
        assert!(msg.value("item-id").is_none());
    }
}
