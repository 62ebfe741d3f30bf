//! Host-side client for the vsock RPC channel to the guest agent (Component C).
//!
//! A [`Transport`] dials the Firecracker vsock Unix-domain-socket backend at a
//! per-VM path, performs the backend's `CONNECT <port>\n` / `OK <port>\n`
//! handshake (host-initiated connection to the guest's listening port 9999),
//! then speaks the length-prefixed JSON framing defined in `nimbus-proto`.
//!
//! The client is single-use per in-flight call: `call` takes `&mut self`, so the
//! borrow checker enforces "not safe to call concurrently on the same VM" (§4.C)
//! without any internal locking. The Scheduler owns one `Transport` per
//! VM-execution, matching §4.C's ownership note.

use std::io;
use std::path::Path;

use nimbus_proto::{
    Decoder, ExecuteRequest, ExecuteResponse, InitPayload, InitResponse, Request, Response,
    WarmupRequest, WarmupResponse, encode_request,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Well-known guest listen port for the Nimbus vsock RPC channel.
pub const GUEST_PORT: u32 = 9999;

const READ_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("timeout waiting for guest response")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("guest error: {0}")]
    Guest(String),
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            Self::Timeout
        } else {
            Self::Protocol(e.to_string())
        }
    }
}

/// A connected, handshaken vsock RPC client for exactly one guest VM.
pub struct Transport {
    stream: UnixStream,
    decoder: Decoder,
    next_seq: u32,
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl Transport {
    /// Dial the Firecracker vsock UDS backend at `vsock_uds_path` and request a
    /// host-initiated connection to `port` inside the guest.
    pub async fn connect(
        vsock_uds_path: &Path,
        port: u32,
        deadline: Instant,
    ) -> Result<Self, TransportError> {
        let stream = time::timeout_at(deadline, UnixStream::connect(vsock_uds_path))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let mut transport = Self {
            stream,
            decoder: Decoder::new(),
            next_seq: 1,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        };

        transport.handshake(port, deadline).await?;
        Ok(transport)
    }

    /// Perform the vsock UDS backend handshake: write `CONNECT <port>\n`, read a
    /// single `OK <assigned_port>\n` line before any framed traffic begins.
    async fn handshake(&mut self, port: u32, deadline: Instant) -> Result<(), TransportError> {
        let request = format!("CONNECT {port}\n");
        time::timeout_at(deadline, self.stream.write_all(request.as_bytes()))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = time::timeout_at(deadline, self.stream.read(&mut byte))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
            if n == 0 {
                return Err(TransportError::ConnectFailed(
                    "connection closed during handshake".into(),
                ));
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
        }

        let ack = String::from_utf8_lossy(&line);
        if !ack.starts_with("OK ") {
            return Err(TransportError::ConnectFailed(format!(
                "unexpected handshake reply: {ack}"
            )));
        }
        debug!(reply = %ack, "vsock handshake complete");
        Ok(())
    }

    fn next_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    /// Send `request` and wait for the matching-`seq` response, honoring `deadline`.
    pub async fn call(
        &mut self,
        request: Request,
        deadline: Instant,
    ) -> Result<Response, TransportError> {
        let seq = self.next_seq();
        let data = encode_request(seq, &request)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        time::timeout_at(deadline, self.stream.write_all(&data))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        loop {
            let n = time::timeout_at(deadline, self.stream.read(self.read_buf.as_mut()))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Protocol(e.to_string()))?;

            if n == 0 {
                return Err(TransportError::Protocol("connection closed".into()));
            }

            let frames = self
                .decoder
                .decode(self.read_buf.get(..n).unwrap_or_default())
                .map_err(|e| TransportError::Protocol(e.to_string()))?;

            for raw in frames {
                if raw.seq_hint != Some(seq) {
                    warn!(seq, got = ?raw.seq_hint, "dropping frame with mismatched seq");
                    continue;
                }
                let parsed = Decoder::parse_response(&raw)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?;
                if let Response::Error(body) = parsed.message {
                    return Err(TransportError::Guest(body.message));
                }
                return Ok(parsed.message);
            }
        }
    }

    /// `init` — exactly-once per VM (§4.C). The caller is responsible for not
    /// calling this twice on the same VM.
    pub async fn init(
        &mut self,
        payload: InitPayload,
        deadline: Instant,
    ) -> Result<InitResponse, TransportError> {
        match self.call(Request::Init(payload), deadline).await? {
            Response::Init(resp) => Ok(resp),
            other => Err(TransportError::Protocol(format!(
                "expected init response, got {other:?}"
            ))),
        }
    }

    /// `execute` — may be called many times per VM, never concurrently.
    pub async fn execute(
        &mut self,
        payload: serde_json::Value,
        deadline: Instant,
    ) -> Result<ExecuteResponse, TransportError> {
        let request = Request::Execute(ExecuteRequest {
            request_id: Uuid::new_v4(),
            payload,
        });
        match self.call(request, deadline).await? {
            Response::Execute(resp) => Ok(resp),
            other => Err(TransportError::Protocol(format!(
                "expected execute response, got {other:?}"
            ))),
        }
    }

    /// Best-effort `warmup` — callers should ignore errors (§4.D step 3).
    pub async fn warmup(&mut self, deadline: Instant) -> Result<WarmupResponse, TransportError> {
        match self.call(Request::Warmup(WarmupRequest {}), deadline).await? {
            Response::Warmup(resp) => Ok(resp),
            other => Err(TransportError::Protocol(format!(
                "expected warmup response, got {other:?}"
            ))),
        }
    }

    /// Close the connection. Dropping a `Transport` has the same effect; this
    /// exists so callers can express the intent explicitly per §4.C's `close()`.
    pub fn close(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::UnixListener;

    async fn mock_guest_handshake(stream: &mut UnixStream) {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            stream.read_exact(&mut byte).await.unwrap();
            if byte[0] == b'\n' {
                break;
            }
            buf.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&buf).starts_with("CONNECT "));
        stream.write_all(b"OK 9999\n").await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_init_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        let guest_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            mock_guest_handshake(&mut stream).await;

            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let mut decoder = Decoder::new();
            let frames = decoder.decode(&buf[..n]).unwrap();
            let parsed = Decoder::parse_request(&frames[0]).unwrap();
            let seq = parsed.seq;
            match parsed.message {
                Request::Init(payload) => assert_eq!(payload.function_id, "echo-python"),
                other => panic!("unexpected request: {other:?}"),
            }

            let resp = nimbus_proto::encode_response(
                seq,
                &Response::Init(InitResponse {
                    ok: true,
                    error: None,
                }),
            )
            .unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut transport = Transport::connect(&sock_path, GUEST_PORT, deadline)
            .await
            .unwrap();

        let resp = transport
            .init(
                InitPayload {
                    function_id: "echo-python".into(),
                    handler: "handler.handler".into(),
                    code_bytes: b"...".to_vec(),
                    runtime: "python3.11".into(),
                    env_vars: HashMap::new(),
                    memory_limit_mib: 128,
                    timeout_sec: 30,
                },
                deadline,
            )
            .await
            .unwrap();
        assert!(resp.ok);

        guest_task.await.unwrap();
    }

    #[tokio::test]
    async fn guest_error_surfaces_as_guest_error() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("vsock.sock");
        let listener = UnixListener::bind(&sock_path).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            mock_guest_handshake(&mut stream).await;

            let mut buf = [0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let mut decoder = Decoder::new();
            let frames = decoder.decode(&buf[..n]).unwrap();
            let parsed = Decoder::parse_request(&frames[0]).unwrap();

            let resp = nimbus_proto::encode_response(
                parsed.seq,
                &Response::Error(nimbus_proto::ErrorBody {
                    message: "handler threw".into(),
                }),
            )
            .unwrap();
            stream.write_all(&resp).await.unwrap();
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut transport = Transport::connect(&sock_path, GUEST_PORT, deadline)
            .await
            .unwrap();

        let err = transport
            .execute(serde_json::json!({"x": 1}), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Guest(_)));
    }

    #[tokio::test]
    async fn connect_times_out_when_nothing_listens() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("nobody-home.sock");
        let deadline = Instant::now() + Duration::from_millis(50);
        let err = Transport::connect(&sock_path, GUEST_PORT, deadline)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectFailed(_) | TransportError::Timeout
        ));
    }
}
