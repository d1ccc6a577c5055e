//! JSON-RPC 2.0 envelope types.
//!
//! Only the envelope is interpreted; `params` and the upstream's `result`/`error` are
//! passed through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// A single inbound call.
///
/// # Example
/// ```json
/// {"jsonrpc": "2.0", "method": "eth_getBalance", "params": ["0xabc", "latest"], "id": 1}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default = "default_params")]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

fn default_version() -> String {
    "2.0".to_string()
}

fn default_params() -> Value {
    Value::Array(vec![])
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value, id: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.to_string(),
            params,
            id,
        }
    }

    /// Validates the shape of one call. On failure returns the message to report
    /// together with whatever id could be recovered from the input.
    pub fn from_value(value: Value) -> Result<Self, (Value, String)> {
        let id = value.get("id").cloned().unwrap_or(Value::Null);

        if !value.is_object() {
            return Err((id, "request must be an object".to_string()));
        }

        let request: JsonRpcRequest =
            serde_json::from_value(value).map_err(|e| (id.clone(), e.to_string()))?;

        if request.jsonrpc != "2.0" {
            return Err((id, format!("unsupported jsonrpc version {}", request.jsonrpc)));
        }
        if request.method.is_empty() {
            return Err((id, "method cannot be empty".to_string()));
        }
        if !(request.params.is_array() || request.params.is_object()) {
            return Err((id, "params must be an array or an object".to_string()));
        }

        Ok(request)
    }
}

/// Builds a JSON-RPC error response object.
pub fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        }
    })
}
