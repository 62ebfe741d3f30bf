//! Wire schema for the host↔guest vsock transport (component C of the core).
//!
//! ## Wire format
//!
//! ```text
//! [4-byte big-endian length][UTF-8 JSON frame]
//! ```
//!
//! - **length**: size in bytes of the JSON frame that follows.
//! - **frame**: a [`Frame<Request>`] or [`Frame<Response>`], i.e. a `seq` plus an
//!   internally-tagged `method`/`body` pair. `seq` correlates a response with the
//!   request that produced it; unsolicited guest messages use `seq = 0`.
//!
//! Three methods are defined: `init`, `execute`, `warmup` (see [`Request`] /
//! [`Response`]). The schema is shared by construction between host and guest —
//! both sides depend on this crate rather than hand-parsing JSON.

mod message;

pub use message::{
    ErrorBody, ExecuteRequest, ExecuteResponse, Frame, InitPayload, InitResponse, Request,
    Response, WarmupRequest, WarmupResponse,
};

/// Big-endian length-prefix size.
pub const HEADER_SIZE: usize = 4;

/// Maximum frame body size (16 MiB) — bounds code payloads and decoder memory.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol-level error: malformed framing or JSON that doesn't fit the schema.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    FrameTooLarge(usize),
    Json(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameTooLarge(size) => write!(f, "frame too large: {size} bytes"),
            Self::Json(msg) => write!(f, "invalid frame: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Encode a request frame: `[4B length][JSON]`.
pub fn encode_request(seq: u32, request: &Request) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&Frame {
        seq,
        message: request,
    })
}

/// Encode a response frame: `[4B length][JSON]`.
pub fn encode_response(seq: u32, response: &Response) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&Frame {
        seq,
        message: response,
    })
}

fn encode_frame<T: serde::Serialize>(frame: &Frame<T>) -> Result<Vec<u8>, ProtocolError> {
    let body = serde_json::to_vec(frame).map_err(|e| ProtocolError::Json(e.to_string()))?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// A raw, framed-but-undecoded JSON body plus its correlating `seq`.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub seq_hint: Option<u32>,
    pub body: Vec<u8>,
}

/// Buffered frame decoder for streaming vsock data.
///
/// Mirrors the accumulate-then-drain pattern of a binary framed decoder: data is
/// appended to an internal buffer, complete frames are extracted in a loop, and
/// consumed bytes are compacted out once per `decode` call rather than per frame.
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Feed newly-read bytes and extract every complete frame now available.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawFrame>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };
            if length > MAX_FRAME_SIZE {
                self.buf.clear();
                return Err(ProtocolError::FrameTooLarge(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let body = self
                .buf
                .get(offset + HEADER_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();
            frames.push(RawFrame {
                seq_hint: peek_seq(&body),
                body,
            });
            offset += total;
        }

        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(frames)
    }

    /// Decode a single raw frame's JSON body into a typed [`Request`].
    pub fn parse_request(raw: &RawFrame) -> Result<Frame<Request>, ProtocolError> {
        serde_json::from_slice(&raw.body).map_err(|e| ProtocolError::Json(e.to_string()))
    }

    /// Decode a single raw frame's JSON body into a typed [`Response`].
    pub fn parse_response(raw: &RawFrame) -> Result<Frame<Response>, ProtocolError> {
        serde_json::from_slice(&raw.body).map_err(|e| ProtocolError::Json(e.to_string()))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort peek at a frame's `seq` field without committing to a full parse —
/// used only for diagnostics, since parsing happens through the typed helpers above.
fn peek_seq(body: &[u8]) -> Option<u32> {
    #[derive(serde::Deserialize)]
    struct SeqOnly {
        seq: u32,
    }
    serde_json::from_slice::<SeqOnly>(body).ok().map(|s| s.seq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_init() -> Request {
        Request::Init(InitPayload {
            function_id: "echo-python".into(),
            handler: "handler.handler".into(),
            code_bytes: b"print('hi')".to_vec(),
            runtime: "python3.11".into(),
            env_vars: HashMap::new(),
            memory_limit_mib: 128,
            timeout_sec: 30,
        })
    }

    #[test]
    fn encode_decode_roundtrip_init() {
        let req = sample_init();
        let data = encode_request(1, &req).unwrap();

        let mut dec = Decoder::new();
        let frames = dec.decode(&data).unwrap();
        assert_eq!(frames.len(), 1);

        let parsed = Decoder::parse_request(&frames[0]).unwrap();
        assert_eq!(parsed.seq, 1);
        match parsed.message {
            Request::Init(payload) => assert_eq!(payload.function_id, "echo-python"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decoder_handles_partial_reads() {
        let data = encode_request(7, &Request::Warmup(WarmupRequest {})).unwrap();
        let mut dec = Decoder::new();

        let frames = dec.decode(&data[..4]).unwrap();
        assert!(frames.is_empty());

        let frames = dec.decode(&data[4..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].seq_hint, Some(7));
    }

    #[test]
    fn decoder_handles_multiple_frames() {
        let mut data = encode_request(1, &Request::Warmup(WarmupRequest {})).unwrap();
        data.extend_from_slice(&encode_request(2, &sample_init()).unwrap());

        let mut dec = Decoder::new();
        let frames = dec.decode(&data).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].seq_hint, Some(1));
        assert_eq!(frames[1].seq_hint, Some(2));
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let bad = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        let mut dec = Decoder::new();
        let err = dec.decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge(_)));
    }

    #[test]
    fn execute_response_roundtrip() {
        let resp = Response::Execute(ExecuteResponse {
            status_code: 200,
            body: serde_json::json!({"x": 1}),
            error: None,
            duration_ms: 12,
            billed_time_ms: 12,
        });
        let data = encode_response(3, &resp).unwrap();
        let mut dec = Decoder::new();
        let frames = dec.decode(&data).unwrap();
        let parsed = Decoder::parse_response(&frames[0]).unwrap();
        assert_eq!(parsed.seq, 3);
        match parsed.message {
            Response::Execute(e) => assert_eq!(e.status_code, 200),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = encode_request(1, &Request::Warmup(WarmupRequest {})).unwrap();
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let frames = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(frames.is_empty());
            } else {
                assert_eq!(frames.len(), 1);
            }
        }
    }
}
