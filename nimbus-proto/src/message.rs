use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A `seq`-correlated envelope around a [`Request`] or [`Response`].
///
/// `seq` is chosen by the Transport client per in-flight call and echoed back by
/// the guest shim, mirroring the request/response correlation the host-side
/// client uses to match a reply to its caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame<T> {
    pub seq: u32,
    #[serde(flatten)]
    pub message: T,
}

/// The three guest-bound operations defined in §4.C.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum Request {
    Init(InitPayload),
    Execute(ExecuteRequest),
    Warmup(WarmupRequest),
}

/// The guest's replies, tagged the same way as [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "body", rename_all = "snake_case")]
pub enum Response {
    Init(InitResponse),
    Execute(ExecuteResponse),
    Warmup(WarmupResponse),
    /// A protocol-level failure the guest shim could report about itself
    /// (malformed request, dispatch panic) rather than a per-method result.
    Error(ErrorBody),
}

/// Data the guest agent needs before it can serve invocations (§3).
///
/// Immutable after the guest has acknowledged initialization; `init` is
/// exactly-once per VM (§4.C) — a second `init` call is rejected by the guest
/// with `InitResponse { ok: false, .. }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitPayload {
    pub function_id: String,
    pub handler: String,
    /// The function's code, serialized as base64 for JSON transport.
    #[serde(with = "code_bytes_base64")]
    pub code_bytes: Vec<u8>,
    pub runtime: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    pub memory_limit_mib: u32,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub request_id: Uuid,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status_code: u16,
    pub body: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
    pub billed_time_ms: u64,
}

/// Empty body — `warmup` carries no fields in either direction but still needs a
/// unit struct so it has a place in the tagged enum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WarmupRequest {}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WarmupResponse {
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

mod code_bytes_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
