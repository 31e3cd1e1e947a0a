//! Line-delimited JSON-RPC 1.0 codec shared by the miner-facing and pool-facing wire.
//!
//! The source this was distilled from keeps three separate wire shapes: `JSONRPCLineBTC` (every
//! field `omitempty`, used only to decode an incoming line whose request/response fields
//! overlap), `JSONRPCRequest` (`id`/`method`/`params`, none omitted — a notification still
//! serializes `"id":null`), and `JSONRPCResponse` (`id`/`result`/`error`, none omitted — a
//! success reply still serializes `"error":null`). Collapsing all three into one `omitempty`
//! struct would drop fields a miner's parser expects to see; `RpcLine` stays decode-only and
//! `RpcRequest`/`RpcResponse` are the two encoders.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::StratumError as WireError;
use crate::errors::ProxyError;

/// A decoded line from either side of the wire. Mirrors `JSONRPCLineBTC`: fields are `Option`
/// because request and response shapes overlap, and absent fields are simply missing.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RpcLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcLine {
    pub fn params(&self) -> &[Value] {
        self.params.as_deref().unwrap_or(&[])
    }
}

/// Anything that serializes to one line of the wire with a trailing `\n`. Lets callers that
/// write both request- and response-shaped lines to the same socket (the miner-facing side
/// sends responses to subscribe/authorize/submit but a request for `client.reconnect`) share
/// one `write_line` helper.
pub trait Encodable {
    fn to_line(&self) -> Result<Vec<u8>, ProxyError>;
}

/// Encodes a request- or notification-shaped outbound line. Mirrors `JSONRPCRequest`: `id`,
/// `method`, and `params` are always serialized, `id` as `null` for a notification.
#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub id: Value,
    pub method: String,
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Builds a request line carrying `id`.
    pub fn new(id: Value, method: &str, params: Vec<Value>) -> Self {
        Self { id, method: method.to_string(), params }
    }

    /// Builds a server-initiated notification: `id` still serializes, as `null`.
    pub fn notification(method: &str, params: Vec<Value>) -> Self {
        Self { id: Value::Null, method: method.to_string(), params }
    }
}

impl Encodable for RpcRequest {
    fn to_line(&self) -> Result<Vec<u8>, ProxyError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Encodes a response-shaped outbound line. Mirrors `JSONRPCResponse`: `id`, `result`, and
/// `error` are always serialized, including as `null`.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Value,
}

impl RpcResponse {
    /// Builds a success response echoing the request's id (`null` if the request carried none).
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self { id: id.unwrap_or(Value::Null), result, error: Value::Null }
    }

    /// Builds an error response using the RPC-1 `[code, message, data]` array convention.
    pub fn error(id: Option<Value>, err: &WireError, data: Option<Value>) -> Self {
        let arr = vec![Value::from(err.code), Value::from(err.message), data.unwrap_or(Value::Null)];
        Self { id: id.unwrap_or(Value::Null), result: Value::Null, error: Value::Array(arr) }
    }

    /// Builds an error response from a free-form `[code, message, data]` triple, for statuses
    /// relayed verbatim from a pool reply rather than drawn from the local error table.
    pub fn reject(id: Option<Value>, code: i32, message: &str) -> Self {
        Self {
            id: id.unwrap_or(Value::Null),
            result: Value::Null,
            error: Value::Array(vec![Value::from(code), Value::from(message), Value::Null]),
        }
    }
}

impl Encodable for RpcResponse {
    fn to_line(&self) -> Result<Vec<u8>, ProxyError> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Parses one already-dechunked line (no trailing newline required) as a miner-facing
/// `RpcLine`. Unlike the upstream reader, no tolerant rewriting is applied here: miners are
/// expected to speak strict JSON.
pub fn parse_line(line: &str) -> Result<RpcLine, ProxyError> {
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Parses a pool-facing line, applying the tolerant-parse rewrite observed in the source this
/// proxy was distilled from: some pools emit an unquoted `auth` id token (`"id":auth`), which
/// is not valid JSON. Rewriting `:auth` to `:"auth"` before decoding recovers those lines
/// without weakening parsing on the miner side, which never needs this leniency.
pub fn parse_upstream_line(line: &str) -> Result<RpcLine, ProxyError> {
    let patched = line.replace(":auth", ":\"auth\"");
    Ok(serde_json::from_str(patched.trim_end())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trips_a_request() {
        let line = RpcRequest::new(json!(1), "mining.subscribe", vec![json!("cgm/4.11")]);
        let bytes = line.to_line().unwrap();
        assert!(bytes.ends_with(b"\n"));
        let decoded = parse_line(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(decoded.method.as_deref(), Some("mining.subscribe"));
        assert_eq!(decoded.id, Some(json!(1)));
    }

    #[test]
    fn notification_serializes_a_null_id() {
        let line = RpcRequest::notification("client.reconnect", vec![]);
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v, json!({"id": null, "method": "client.reconnect", "params": []}));
    }

    #[test]
    fn success_response_serializes_a_null_error() {
        let line = RpcResponse::success(Some(json!(1)), json!(true));
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v, json!({"id": 1, "result": true, "error": null}));
    }

    #[test]
    fn error_response_uses_rpc1_array_and_a_null_result() {
        let line = RpcResponse::error(Some(json!(7)), &crate::constants::ERR_NEED_AUTHORIZED, None);
        let v = serde_json::to_value(&line).unwrap();
        assert_eq!(v["error"], json!([24, "Unauthorized worker", null]));
        assert_eq!(v["result"], Value::Null);
    }

    #[test]
    fn tolerant_parse_recovers_unquoted_auth_id() {
        let raw = r#"{"id":auth,"result":true,"error":null}"#;
        assert!(parse_line(raw).is_err());
        let decoded = parse_upstream_line(raw).unwrap();
        assert_eq!(decoded.id, Some(json!("auth")));
        assert_eq!(decoded.result, Some(json!(true)));
    }
}
