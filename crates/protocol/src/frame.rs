//! Binary data framing for exec connections.
//!
//! Every binary frame on an exec connection starts with a one-byte kind tag
//! followed by the payload. In raw TTY mode frames are not tagged at all:
//! the whole frame is terminal output, and exit/port/resize signaling moves
//! to JSON text frames (see [`TextSignal`]).

use serde::{Deserialize, Serialize};

/// Kind tag for stdin frames (client -> sprite).
pub const TAG_STDIN: u8 = 0;
/// Kind tag for stdout frames (sprite -> client).
pub const TAG_STDOUT: u8 = 1;
/// Kind tag for stderr frames (sprite -> client).
pub const TAG_STDERR: u8 = 2;
/// Kind tag for the exit frame; payload is a big-endian i32 code.
pub const TAG_EXIT: u8 = 3;

/// One decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Raw stdin bytes.
    Stdin(Vec<u8>),
    /// End-of-input marker: a zero-length stdin frame on the wire.
    StdinEof,
    /// Process stdout bytes.
    Stdout(Vec<u8>),
    /// Process stderr bytes.
    Stderr(Vec<u8>),
    /// Process exit code.
    Exit(i32),
    /// Forward-compatible catch-all for tags this client does not know.
    Unknown { tag: u8, payload: Vec<u8> },
}

impl Frame {
    /// Decode a tagged binary frame.
    ///
    /// Decoding is total: every byte sequence maps to exactly one frame.
    /// An empty input has no tag byte and decodes as [`Frame::Unknown`]
    /// with tag 0 and an empty payload.
    pub fn decode(bytes: &[u8]) -> Frame {
        let Some((&tag, payload)) = bytes.split_first() else {
            return Frame::Unknown {
                tag: 0,
                payload: Vec::new(),
            };
        };

        match tag {
            TAG_STDIN if payload.is_empty() => Frame::StdinEof,
            TAG_STDIN => Frame::Stdin(payload.to_vec()),
            TAG_STDOUT => Frame::Stdout(payload.to_vec()),
            TAG_STDERR => Frame::Stderr(payload.to_vec()),
            TAG_EXIT => Frame::Exit(decode_exit_code(payload)),
            other => Frame::Unknown {
                tag: other,
                payload: payload.to_vec(),
            },
        }
    }

    /// Decode a binary frame received on a raw TTY connection.
    ///
    /// TTY frames carry no tag; the entire frame is terminal output.
    pub fn decode_tty(bytes: &[u8]) -> Frame {
        Frame::Stdout(bytes.to_vec())
    }

    /// Encode this frame with its kind tag.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Stdin(data) => tagged(TAG_STDIN, data),
            Frame::StdinEof => vec![TAG_STDIN],
            Frame::Stdout(data) => tagged(TAG_STDOUT, data),
            Frame::Stderr(data) => tagged(TAG_STDERR, data),
            Frame::Exit(code) => tagged(TAG_EXIT, &code.to_be_bytes()),
            Frame::Unknown { tag, payload } => tagged(*tag, payload),
        }
    }
}

fn tagged(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(tag);
    out.extend_from_slice(payload);
    out
}

/// Exit payloads are a 4-byte big-endian signed code. Shorter payloads are
/// interpreted as the big-endian value of the bytes present; longer payloads
/// use the first four bytes. Decode never fails.
fn decode_exit_code(payload: &[u8]) -> i32 {
    let mut buf = [0u8; 4];
    match payload.len() {
        0 => 0,
        n if n >= 4 => {
            buf.copy_from_slice(&payload[..4]);
            i32::from_be_bytes(buf)
        }
        n => {
            buf[4 - n..].copy_from_slice(payload);
            i32::from_be_bytes(buf)
        }
    }
}

/// JSON text-frame signals used by TTY sessions, where binary frames are
/// reserved for the raw terminal byte stream.
///
/// `resize` is also the outbound shape for terminal resizes in every mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TextSignal {
    /// Process exit with its code.
    Exit { code: i32 },
    /// A port became reachable inside the sprite.
    Port { port: u16 },
    /// Terminal geometry change.
    Resize { rows: u16, cols: u16 },
}

impl TextSignal {
    /// Parse a text frame as a signal, returning `None` for anything that is
    /// not one of the three known shapes.
    pub fn parse(text: &str) -> Option<TextSignal> {
        serde_json::from_str(text).ok()
    }

    /// Encode as a JSON text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdin_round_trip() {
        let frame = Frame::Stdin(b"echo hi\n".to_vec());
        assert_eq!(Frame::decode(&frame.encode()), frame);
    }

    #[test]
    fn stdin_eof_is_zero_length_stdin() {
        let encoded = Frame::StdinEof.encode();
        assert_eq!(encoded, vec![TAG_STDIN]);
        assert_eq!(Frame::decode(&encoded), Frame::StdinEof);
    }

    #[test]
    fn stdout_and_stderr_round_trip() {
        let out = Frame::Stdout(b"hello".to_vec());
        let err = Frame::Stderr(b"oops".to_vec());
        assert_eq!(Frame::decode(&out.encode()), out);
        assert_eq!(Frame::decode(&err.encode()), err);
    }

    #[test]
    fn exit_round_trip_including_negative() {
        for code in [0, 1, 137, -1] {
            let frame = Frame::Exit(code);
            assert_eq!(Frame::decode(&frame.encode()), frame);
        }
    }

    #[test]
    fn short_exit_payload_decodes() {
        assert_eq!(Frame::decode(&[TAG_EXIT, 7]), Frame::Exit(7));
        assert_eq!(Frame::decode(&[TAG_EXIT]), Frame::Exit(0));
    }

    #[test]
    fn unknown_tag_never_errors() {
        let decoded = Frame::decode(&[0x7f, 1, 2, 3]);
        assert_eq!(
            decoded,
            Frame::Unknown {
                tag: 0x7f,
                payload: vec![1, 2, 3]
            }
        );
    }

    #[test]
    fn empty_input_decodes_as_unknown() {
        assert_eq!(
            Frame::decode(&[]),
            Frame::Unknown {
                tag: 0,
                payload: vec![]
            }
        );
    }

    #[test]
    fn tty_frames_are_untagged_stdout() {
        // Tag bytes are terminal data in TTY mode, not framing.
        assert_eq!(
            Frame::decode_tty(&[TAG_EXIT, 0, 0, 0, 9]),
            Frame::Stdout(vec![TAG_EXIT, 0, 0, 0, 9])
        );
    }

    #[test]
    fn text_signal_parses_known_shapes() {
        assert_eq!(
            TextSignal::parse(r#"{"type":"exit","code":3}"#),
            Some(TextSignal::Exit { code: 3 })
        );
        assert_eq!(
            TextSignal::parse(r#"{"type":"port","port":8080}"#),
            Some(TextSignal::Port { port: 8080 })
        );
        assert_eq!(
            TextSignal::parse(r#"{"type":"resize","rows":40,"cols":120}"#),
            Some(TextSignal::Resize {
                rows: 40,
                cols: 120
            })
        );
        assert_eq!(TextSignal::parse("not json"), None);
        assert_eq!(TextSignal::parse(r#"{"type":"other"}"#), None);
    }

    #[test]
    fn resize_encodes_expected_shape() {
        let signal = TextSignal::Resize { rows: 24, cols: 80 };
        let value: serde_json::Value = serde_json::from_str(&signal.encode()).unwrap();
        assert_eq!(value["type"], "resize");
        assert_eq!(value["rows"], 24);
        assert_eq!(value["cols"], 80);
    }
}
