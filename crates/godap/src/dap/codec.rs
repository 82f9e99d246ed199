//! Incremental `Content-Length` framing for DAP messages.
//!
//! ```text
//! Content-Length: 123\r\n
//! \r\n
//! { ...json... }
//! ```

use std::io;

use serde_json::Value;
use thiserror::Error;

pub use super::{MAX_DAP_HEADER_BYTES, MAX_DAP_MESSAGE_BYTES};

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("DAP message missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length {0:?}")]
    InvalidContentLength(String),

    #[error("DAP message Content-Length {len} exceeds maximum allowed size {max}")]
    MessageTooLarge { len: usize, max: usize },

    #[error("DAP header block exceeds maximum size ({max} bytes)")]
    HeaderTooLarge { max: usize },

    #[error("DAP header block is not UTF-8")]
    InvalidHeader,

    #[error("invalid DAP message json: {0}")]
    Json(String),

    #[error("EOF in the middle of a DAP message")]
    UnexpectedEof,
}

impl CodecError {
    /// Errors after which the byte stream is still aligned on a frame boundary.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Io(_) | Self::UnexpectedEof)
    }
}

/// `serde_json::Error` display strings can echo user-provided values
/// (`invalid type: string "..."`, ``unknown field `...` ``). DAP payloads carry
/// launch environments and evaluated expressions, so those are redacted.
pub(crate) fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let Some(end) = rest.find('"') else {
            out.push_str(rest);
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    // Only the first backticked segment: the list of expected values that
    // follows is still useful.
    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

/// Splits a byte stream into DAP frame payloads.
///
/// Bytes are fed with [`FrameDecoder::push`] in whatever chunks the transport
/// delivers; [`FrameDecoder::next_frame`] then yields every complete payload
/// before asking for more input. A malformed frame produces one error and is
/// consumed, so decoding continues with the frame after it.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    content_length: Option<usize>,
    /// Body bytes of a rejected oversized frame still to be dropped.
    discard: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if self.discard > 0 {
            let skipped = self.discard.min(bytes.len());
            self.discard -= skipped;
            self.buf.extend_from_slice(&bytes[skipped..]);
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// `true` when some bytes of an incomplete frame are buffered.
    pub fn has_partial_frame(&self) -> bool {
        self.content_length.is_some() || self.discard > 0 || !self.buf.is_empty()
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, CodecError>> {
        if self.discard > 0 {
            return None;
        }

        let len = match self.content_length {
            Some(len) => len,
            None => match self.parse_header()? {
                Ok(len) => len,
                Err(err) => return Some(Err(err)),
            },
        };

        if self.buf.len() < len {
            self.content_length = Some(len);
            return None;
        }
        self.content_length = None;
        Some(Ok(self.buf.drain(..len).collect()))
    }

    /// Consumes one header block. `None` means the block is not complete yet.
    fn parse_header(&mut self) -> Option<Result<usize, CodecError>> {
        let Some(pos) = find(&self.buf, HEADER_TERMINATOR) else {
            if self.buf.len() > MAX_DAP_HEADER_BYTES {
                self.buf.clear();
                return Some(Err(CodecError::HeaderTooLarge {
                    max: MAX_DAP_HEADER_BYTES,
                }));
            }
            return None;
        };

        let header: Vec<u8> = self.buf.drain(..pos + HEADER_TERMINATOR.len()).collect();
        if header.len() > MAX_DAP_HEADER_BYTES {
            return Some(Err(CodecError::HeaderTooLarge {
                max: MAX_DAP_HEADER_BYTES,
            }));
        }
        let Ok(header) = std::str::from_utf8(&header[..pos]) else {
            return Some(Err(CodecError::InvalidHeader));
        };

        let mut content_length = None;
        for line in header.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                match value.parse::<usize>() {
                    Ok(len) => content_length = Some(len),
                    Err(_) => {
                        return Some(Err(CodecError::InvalidContentLength(value.to_string())))
                    }
                }
            }
        }

        let Some(len) = content_length else {
            return Some(Err(CodecError::MissingContentLength));
        };
        if len > MAX_DAP_MESSAGE_BYTES {
            let buffered = self.buf.len().min(len);
            self.buf.drain(..buffered);
            self.discard = len - buffered;
            return Some(Err(CodecError::MessageTooLarge {
                len,
                max: MAX_DAP_MESSAGE_BYTES,
            }));
        }
        Some(Ok(len))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Parses a frame payload as JSON, redacting values from parse errors.
pub fn decode_message(payload: &[u8]) -> Result<Value, CodecError> {
    serde_json::from_slice(payload)
        .map_err(|err| CodecError::Json(sanitize_json_error_message(&err.to_string())))
}

pub fn encode_frame(message: &Value) -> Vec<u8> {
    // Serializing a `Value` cannot fail: all map keys are strings.
    let body = serde_json::to_vec(message).unwrap_or_default();
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(body: &str) -> Vec<u8> {
        format!("Content-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
    }

    fn drain(decoder: &mut FrameDecoder) -> Vec<Result<Vec<u8>, CodecError>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn encoded_frame_has_exact_content_length() {
        let msg = json!({"seq": 1, "type": "request", "command": "initialize", "arguments": {"adapterID": "go"}});
        let bytes = encode_frame(&msg);
        let payload = serde_json::to_vec(&msg).unwrap();
        let header = format!("Content-Length: {}\r\n\r\n", payload.len());
        assert!(bytes.starts_with(header.as_bytes()));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decode_message(&body).unwrap(), msg);
        assert!(decoder.next_frame().is_none());
        assert!(!decoder.has_partial_frame());
    }

    #[test]
    fn every_split_point_yields_one_message() {
        let bytes = encode_frame(&json!({"seq": 7, "type": "event", "event": "output", "body": {"output": "héllo\n"}}));
        for split in 0..=bytes.len() {
            let mut decoder = FrameDecoder::new();
            decoder.push(&bytes[..split]);
            let mut frames = drain(&mut decoder);
            decoder.push(&bytes[split..]);
            frames.extend(drain(&mut decoder));
            assert_eq!(frames.len(), 1, "split at {split}");
            let value = decode_message(frames[0].as_ref().unwrap()).unwrap();
            assert_eq!(value["seq"], 7);
        }
    }

    #[test]
    fn drains_coalesced_frames_in_order() {
        let mut bytes = frame(r#"{"seq":1}"#);
        bytes.extend(frame(r#"{"seq":2}"#));
        bytes.extend(frame(r#"{"seq":3}"#));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        let seqs: Vec<_> = drain(&mut decoder)
            .into_iter()
            .map(|frame| decode_message(&frame.unwrap()).unwrap()["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn accepts_additional_headers_case_insensitively() {
        let body = r#"{"seq":1,"type":"request","command":"threads"}"#;
        let framed = format!(
            "content-length: {}\r\nContent-Type: application/vscode-jsonrpc; charset=utf-8\r\n\r\n{}",
            body.len(),
            body
        );
        let mut decoder = FrameDecoder::new();
        decoder.push(framed.as_bytes());
        let value = decode_message(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(value["command"], "threads");
    }

    #[test]
    fn missing_content_length_is_reported_and_skipped() {
        let mut bytes = b"Content-Type: text/plain\r\n\r\n".to_vec();
        bytes.extend(frame(r#"{"seq":2}"#));

        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(CodecError::MissingContentLength))
        ));
        let next = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decode_message(&next).unwrap()["seq"], 2);
    }

    #[test]
    fn invalid_content_length_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"Content-Length: ten\r\n\r\n");
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(matches!(err, CodecError::InvalidContentLength(ref v) if v == "ten"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn oversized_frame_is_skipped_without_buffering_the_body() {
        let len = MAX_DAP_MESSAGE_BYTES + 1;
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("Content-Length: {len}\r\n\r\n").as_bytes());
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum allowed size"));

        let chunk = vec![b'x'; 1024 * 1024];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            decoder.push(&chunk[..n]);
            remaining -= n;
            assert!(decoder.next_frame().is_none());
            assert_eq!(decoder.buffered_len(), 0);
        }

        decoder.push(&frame(r#"{"seq":9}"#));
        let next = decoder.next_frame().unwrap().unwrap();
        assert_eq!(decode_message(&next).unwrap()["seq"], 9);
    }

    #[test]
    fn pathological_content_length_does_not_allocate() {
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("Content-Length: {}\r\n\r\n", usize::MAX).as_bytes());
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { .. }));
    }

    #[test]
    fn overlong_header_block_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push("A".repeat(MAX_DAP_HEADER_BYTES + 1).as_bytes());
        let err = decoder.next_frame().unwrap().unwrap_err();
        assert!(err.to_string().contains("header block exceeds maximum size"));
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn json_errors_do_not_echo_string_values() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Seq {
            seq: i64,
        }

        let secret = "dap-codec-super-secret-token";
        let value = decode_message(format!(r#"{{"seq":"{secret}"}}"#).as_bytes()).unwrap();
        let message = sanitize_json_error_message(
            &serde_json::from_value::<Seq>(value).unwrap_err().to_string(),
        );
        assert!(!message.contains(secret), "{message}");
        assert!(message.contains("<redacted>"), "{message}");
    }

    #[test]
    fn json_errors_do_not_echo_backticked_values() {
        let message =
            sanitize_json_error_message("unknown field `GITHUB_TOKEN`, expected `seq` or `type`");
        assert_eq!(
            message,
            "unknown field `<redacted>`, expected `seq` or `type`"
        );
    }

    #[test]
    fn malformed_json_payload_is_a_codec_error() {
        let err = decode_message(br#"{"seq": "unterminated"#).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
        assert!(!err.to_string().contains("unterminated"));
    }
}
