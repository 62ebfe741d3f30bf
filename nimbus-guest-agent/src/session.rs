//! Drives the single host connection for the lifetime of the guest: decode
//! request frames, dispatch to `init`/`execute`/`warmup`, write back response
//! frames. Mirrors `vsock-guest::handle_connection`'s read/decode-in-a-loop/
//! write-back shape, adapted to nimbus-proto's length-prefixed JSON framing
//! instead of the binary vsock-proto format, and to exactly one connection
//! instead of a reconnect loop (§4.C: the guest accepts one connection per
//! boot).

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use nimbus_proto::{Decoder, ExecuteRequest, ExecuteResponse, InitPayload, InitResponse, Request, Response, WarmupResponse, encode_response};
use tracing::{info, warn};

use crate::error::Result;
use crate::runtime::Handler;

const READ_BUFFER_SIZE: usize = 64 * 1024;

pub struct Session {
    stream: UnixStream,
    decoder: Decoder,
    handler: Option<Handler>,
}

impl Session {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            handler: None,
        }
    }

    /// Serve requests until the host disconnects. Requests are handled
    /// strictly one at a time — §4.C says `execute` is "not safe to call
    /// concurrently on the same VM", and since this is the only connection
    /// the guest will ever see, a plain sequential loop satisfies that.
    pub fn run(mut self) -> Result<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let n = self.stream.read(&mut buf)?;
            if n == 0 {
                info!("host disconnected");
                return Ok(());
            }

            let frames = self.decoder.decode(buf.get(..n).unwrap_or_default())?;
            for raw in frames {
                let parsed = Decoder::parse_request(&raw)?;
                let response = self.dispatch(parsed.message);
                let data = encode_response(parsed.seq, &response)?;
                self.stream.write_all(&data)?;
            }
        }
    }

    fn dispatch(&mut self, request: Request) -> Response {
        match request {
            Request::Init(payload) => Response::Init(self.handle_init(payload)),
            Request::Execute(req) => Response::Execute(self.handle_execute(req)),
            Request::Warmup(_) => Response::Warmup(self.handle_warmup()),
        }
    }

    fn handle_init(&mut self, payload: InitPayload) -> InitResponse {
        if self.handler.is_some() {
            warn!("rejecting duplicate init");
            return InitResponse {
                ok: false,
                error: Some("already initialized".into()),
            };
        }
        match Handler::load(payload) {
            Ok(handler) => {
                self.handler = Some(handler);
                info!("initialized");
                InitResponse {
                    ok: true,
                    error: None,
                }
            }
            Err(e) => InitResponse {
                ok: false,
                error: Some(e.to_string()),
            },
        }
    }

    fn handle_execute(&mut self, req: ExecuteRequest) -> ExecuteResponse {
        match &self.handler {
            Some(handler) => handler.invoke(req.payload),
            None => ExecuteResponse {
                status_code: 500,
                body: serde_json::Value::Null,
                error: Some("not initialized".into()),
                duration_ms: 0,
                billed_time_ms: 0,
            },
        }
    }

    fn handle_warmup(&mut self) -> WarmupResponse {
        match &self.handler {
            Some(handler) => WarmupResponse {
                ok: handler.warmup().is_ok(),
            },
            None => WarmupResponse { ok: false },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_proto::encode_request;
    use std::collections::HashMap;

    fn read_one_response(stream: &mut UnixStream) -> nimbus_proto::Frame<Response> {
        let mut decoder = Decoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).unwrap();
            let frames = decoder.decode(buf.get(..n).unwrap_or_default()).unwrap();
            if let Some(raw) = frames.into_iter().next() {
                return Decoder::parse_response(&raw).unwrap();
            }
        }
    }

    #[test]
    fn execute_before_init_returns_not_initialized_error() {
        let (host, guest) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            Session::new(guest).run().unwrap();
        });

        let mut host = host;
        let data = encode_request(
            1,
            &Request::Execute(ExecuteRequest {
                request_id: uuid::Uuid::new_v4(),
                payload: serde_json::json!({}),
            }),
        )
        .unwrap();
        host.write_all(&data).unwrap();

        let frame = read_one_response(&mut host);
        match frame.message {
            Response::Execute(resp) => {
                assert_eq!(resp.status_code, 500);
                assert_eq!(resp.error.as_deref(), Some("not initialized"));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        drop(host);
        handle.join().unwrap();
    }

    #[test]
    fn second_init_is_rejected_once_the_first_succeeds() {
        let (host, guest) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            Session::new(guest).run().unwrap();
        });

        let mut host = host;
        let init_payload = InitPayload {
            function_id: "f".into(),
            handler: "h".into(),
            code_bytes: b"import sys, json; json.dump(None, sys.stdout)".to_vec(),
            runtime: "python3.11".into(),
            env_vars: HashMap::new(),
            memory_limit_mib: 128,
            timeout_sec: 5,
        };

        let first = encode_request(1, &Request::Init(init_payload.clone())).unwrap();
        host.write_all(&first).unwrap();
        let frame = read_one_response(&mut host);
        match frame.message {
            Response::Init(resp) => assert!(resp.ok, "first init should succeed: {:?}", resp.error),
            other => panic!("unexpected response: {other:?}"),
        }

        let second = encode_request(2, &Request::Init(init_payload)).unwrap();
        host.write_all(&second).unwrap();
        let frame = read_one_response(&mut host);
        match frame.message {
            Response::Init(resp) => {
                assert!(!resp.ok);
                assert_eq!(resp.error.as_deref(), Some("already initialized"));
            }
            other => panic!("unexpected response: {other:?}"),
        }

        drop(host);
        handle.join().unwrap();
    }

    #[test]
    fn unsupported_runtime_fails_init() {
        let (host, guest) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            Session::new(guest).run().unwrap();
        });

        let mut host = host;
        let init_payload = InitPayload {
            function_id: "f".into(),
            handler: "h".into(),
            code_bytes: b"".to_vec(),
            runtime: "unsupported-runtime".into(),
            env_vars: HashMap::new(),
            memory_limit_mib: 128,
            timeout_sec: 5,
        };
        let data = encode_request(1, &Request::Init(init_payload)).unwrap();
        host.write_all(&data).unwrap();
        let frame = read_one_response(&mut host);
        match frame.message {
            Response::Init(resp) => assert!(!resp.ok),
            other => panic!("unexpected response: {other:?}"),
        }

        drop(host);
        handle.join().unwrap();
    }
}
