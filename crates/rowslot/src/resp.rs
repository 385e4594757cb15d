//! RESP2 command building and reply inspection.

use bytes::Bytes;
use redis_protocol::resp2::types::BytesFrame;

/// One store command as a list of bulk-string arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Appends an owned payload without copying.
    pub fn arg_bytes(mut self, arg: Vec<u8>) -> Self {
        self.args.push(Bytes::from(arg));
        self
    }

    pub fn arg_int(self, value: impl ToString) -> Self {
        let text = value.to_string();
        self.arg(text)
    }

    /// Upper-cased command name.
    pub fn name(&self) -> String {
        self.args
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn into_frame(self) -> BytesFrame {
        BytesFrame::Array(self.args.into_iter().map(BytesFrame::BulkString).collect())
    }
}

/// Error reply text, when the frame is an error.
pub fn error_message(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::Error(msg) => Some(msg.to_string()),
        _ => None,
    }
}

/// Payload of a bulk or simple string; `None` for nil and non-strings.
pub fn frame_bytes(frame: &BytesFrame) -> Option<Vec<u8>> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => Some(b.to_vec()),
        _ => None,
    }
}

/// UTF-8 text of a bulk or simple string.
pub fn frame_string(frame: &BytesFrame) -> Option<String> {
    match frame {
        BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => {
            String::from_utf8(b.to_vec()).ok()
        }
        _ => None,
    }
}

/// Integer replies, also accepting integers encoded as strings.
pub fn frame_integer(frame: &BytesFrame) -> Option<i64> {
    match frame {
        BytesFrame::Integer(v) => Some(*v),
        other => frame_string(other).and_then(|s| s.parse().ok()),
    }
}

pub fn is_nil(frame: &BytesFrame) -> bool {
    matches!(frame, BytesFrame::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_renders_as_bulk_string_array() {
        let frame = Command::new("hset").arg("t:1").arg("id").arg_int(7).into_frame();
        let BytesFrame::Array(parts) = frame else {
            panic!("expected array frame");
        };
        let parts = parts
            .iter()
            .map(|part| frame_string(part).expect("bulk string"))
            .collect::<Vec<_>>();
        assert_eq!(parts, vec!["hset", "t:1", "id", "7"]);
    }

    #[test]
    fn name_is_upper_cased() {
        assert_eq!(Command::new("hgetall").arg("k").name(), "HGETALL");
    }

    #[test]
    fn integer_replies_parse_from_both_shapes() {
        assert_eq!(frame_integer(&BytesFrame::Integer(5)), Some(5));
        assert_eq!(
            frame_integer(&BytesFrame::BulkString(Bytes::from_static(b"12"))),
            Some(12)
        );
        assert_eq!(frame_integer(&BytesFrame::Null), None);
    }
}
