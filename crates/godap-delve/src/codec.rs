//! Framing for Go's `net/rpc/jsonrpc` codec.
//!
//! Delve's RPC server does not length-prefix messages: the connection is a
//! plain stream of concatenated JSON objects. Reads may split an object at
//! any byte or coalesce several objects, so incoming bytes are buffered until
//! a complete value can be parsed.

use serde::Serialize;
use serde_json::Value;

use crate::types::{DelveError, Result};

/// Upper bound on bytes buffered while waiting for a value to complete.
pub const MAX_RPC_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buf: Vec<u8>,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len().saturating_add(bytes.len()) > MAX_RPC_MESSAGE_BYTES {
            self.buf.clear();
            return Err(DelveError::Protocol(format!(
                "incomplete rpc message exceeds {MAX_RPC_MESSAGE_BYTES} bytes"
            )));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Pops the next complete JSON value, or `None` when more input is needed.
    ///
    /// A syntax error discards the buffered bytes: without framing there is
    /// no way to find the start of the next message.
    pub fn next_value(&mut self) -> Option<Result<Value>> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return None;
        };

        let (outcome, consumed) = {
            let mut stream =
                serde_json::Deserializer::from_slice(&self.buf[start..]).into_iter::<Value>();
            let outcome = stream.next();
            (outcome, start + stream.byte_offset())
        };

        match outcome {
            Some(Ok(value)) => {
                self.buf.drain(..consumed);
                Some(Ok(value))
            }
            Some(Err(err)) if err.is_eof() => None,
            Some(Err(err)) => {
                self.buf.clear();
                Some(Err(DelveError::Json(err)))
            }
            None => None,
        }
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a, P> {
    method: String,
    params: [&'a P; 1],
    id: u64,
}

/// Encodes a call to `RPCServer.<method>` with a single positional argument.
pub fn encode_request<P: Serialize>(id: u64, method: &str, params: &P) -> Result<Vec<u8>> {
    let request = RpcRequest {
        method: format!("RPCServer.{method}"),
        params: [params],
        id,
    };
    let mut bytes = serde_json::to_vec(&request)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// A decoded reply: `error` is `Some` when the call failed on the server.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcReply {
    pub id: u64,
    pub result: Value,
    pub error: Option<String>,
}

pub fn decode_reply(value: Value) -> Result<RpcReply> {
    let Value::Object(mut map) = value else {
        return Err(DelveError::Protocol("rpc reply is not an object".to_string()));
    };

    let id = map
        .get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| DelveError::Protocol("rpc reply is missing a numeric id".to_string()))?;
    let error = match map.remove("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(message)) => Some(message),
        Some(other) => Some(other.to_string()),
    };
    let result = map.remove("result").unwrap_or(Value::Null);

    Ok(RpcReply { id, result, error })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_values_split_across_reads() {
        let mut decoder = JsonStreamDecoder::new();
        let bytes = br#"{"id":1,"result":{"State":{"Running":false}},"error":null}"#;
        let (a, b) = bytes.split_at(17);

        decoder.push(a).unwrap();
        assert!(decoder.next_value().is_none());

        decoder.push(b).unwrap();
        let value = decoder.next_value().unwrap().unwrap();
        assert_eq!(value["id"], 1);
        assert!(decoder.next_value().is_none());
    }

    #[test]
    fn drains_coalesced_values() {
        let mut decoder = JsonStreamDecoder::new();
        decoder
            .push(b"{\"id\":1,\"result\":{}}\n{\"id\":2,\"result\":{}} {\"id\":3")
            .unwrap();

        assert_eq!(decoder.next_value().unwrap().unwrap()["id"], 1);
        assert_eq!(decoder.next_value().unwrap().unwrap()["id"], 2);
        assert!(decoder.next_value().is_none());

        decoder.push(b",\"result\":null}").unwrap();
        assert_eq!(decoder.next_value().unwrap().unwrap()["id"], 3);
    }

    #[test]
    fn syntax_error_discards_buffer() {
        let mut decoder = JsonStreamDecoder::new();
        decoder.push(b"{\"id\": ]").unwrap();
        assert!(decoder.next_value().unwrap().is_err());
        assert_eq!(decoder.buffered_len(), 0);
    }

    #[test]
    fn encodes_positional_params() {
        let bytes = encode_request(9, "State", &json!({"NonBlocking": true})).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"method": "RPCServer.State", "params": [{"NonBlocking": true}], "id": 9})
        );
    }

    #[test]
    fn decode_reply_surfaces_error_strings() {
        let reply = decode_reply(json!({"id": 4, "result": null, "error": "Breakpoint exists at /a.go:3"}))
            .unwrap();
        assert_eq!(reply.id, 4);
        assert_eq!(reply.error.as_deref(), Some("Breakpoint exists at /a.go:3"));

        let err = decode_reply(json!([1, 2])).unwrap_err();
        assert!(matches!(err, DelveError::Protocol(_)));
    }
}
