//! Minimal Firecracker API client over its Unix-domain-socket HTTP server.
//!
//! The teacher's own `sandbox-fc::api::ApiClient` is referenced by
//! `sandbox.rs`/`factory.rs` but absent from this tree, so this is written
//! fresh — in the style `vsock-host` uses for its own Unix-socket protocol
//! (a persistent-connection-per-call, manual read/parse, no HTTP library),
//! since the teacher's dependency stack has no `hyper`/`reqwest`-over-UDS
//! wiring anywhere to imitate.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{self, Instant};

use crate::error::{Result, VmError};

#[derive(Debug, Deserialize)]
struct FirecrackerError {
    fault_message: Option<String>,
}

pub struct ApiClient {
    sock_path: std::path::PathBuf,
}

impl ApiClient {
    pub fn new(sock_path: &Path) -> Self {
        Self {
            sock_path: sock_path.to_owned(),
        }
    }

    /// Poll until the API socket accepts a connection, or `timeout` elapses.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if UnixStream::connect(&self.sock_path).await.is_ok() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmError::LaunchFailed(format!(
                    "api socket never became ready: {}",
                    self.sock_path.display()
                )));
            }
            time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn put(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        self.request("PUT", path, Some(body)).await.map(|_| ())
    }

    pub async fn patch(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        self.request("PATCH", path, Some(body)).await.map(|_| ())
    }

    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>> {
        let mut stream = UnixStream::connect(&self.sock_path)
            .await
            .map_err(|e| VmError::LaunchFailed(format!("connect api socket: {e}")))?;

        let body_bytes = match body {
            Some(v) => serde_json::to_vec(v)
                .map_err(|e| VmError::LaunchFailed(format!("serialize request: {e}")))?,
            None => Vec::new(),
        };

        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body_bytes.len()
        );

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| VmError::LaunchFailed(format!("write api request: {e}")))?;
        stream
            .write_all(&body_bytes)
            .await
            .map_err(|e| VmError::LaunchFailed(format!("write api body: {e}")))?;

        let mut raw = Vec::new();
        stream
            .read_to_end(&mut raw)
            .await
            .map_err(|e| VmError::LaunchFailed(format!("read api response: {e}")))?;

        let (status, response_body) = parse_http_response(&raw)
            .ok_or_else(|| VmError::LaunchFailed("malformed api response".into()))?;

        if (200..300).contains(&status) {
            Ok(response_body.to_vec())
        } else {
            let detail = serde_json::from_slice::<FirecrackerError>(response_body)
                .ok()
                .and_then(|e| e.fault_message)
                .unwrap_or_else(|| String::from_utf8_lossy(response_body).into_owned());
            Err(VmError::LaunchFailed(format!(
                "firecracker api {method} {path} -> {status}: {detail}"
            )))
        }
    }
}

/// Parse an HTTP/1.1 response into `(status_code, body)`. Assumes the
/// connection closes after one response (`Connection: close` was requested),
/// so the body is simply everything after the blank line.
fn parse_http_response(raw: &[u8]) -> Option<(u16, &[u8])> {
    let header_end = find_subslice(raw, b"\r\n\r\n")?;
    let header_bytes = raw.get(..header_end)?;
    let body = raw.get(header_end + 4..)?;

    let header_str = std::str::from_utf8(header_bytes).ok()?;
    let status_line = header_str.lines().next()?;
    let status = status_line.split_whitespace().nth(1)?.parse().ok()?;

    Some((status, body))
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_204_no_content() {
        let raw = b"HTTP/1.1 204 No Content\r\nServer: Firecracker API\r\n\r\n";
        let (status, body) = parse_http_response(raw).unwrap();
        assert_eq!(status, 204);
        assert!(body.is_empty());
    }

    #[test]
    fn parses_400_with_json_body() {
        let raw = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 29\r\n\r\n{\"fault_message\":\"bad vcpu\"}";
        let (status, body) = parse_http_response(raw).unwrap();
        assert_eq!(status, 400);
        let err: FirecrackerError = serde_json::from_slice(body).unwrap();
        assert_eq!(err.fault_message.as_deref(), Some("bad vcpu"));
    }

    #[test]
    fn rejects_response_without_blank_line() {
        assert!(parse_http_response(b"HTTP/1.1 200 OK").is_none());
    }
}
