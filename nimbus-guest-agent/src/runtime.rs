//! Runs the function's code once per `init` call, and once per `execute` or
//! `warmup`. §4.C leaves "language runtimes, sandboxed interpreters per
//! `runtime`" unspecified beyond dispatch; this picks the simplest concrete
//! shape that can serve the end-to-end scenarios of §8: the code is written
//! to disk once, then driven as a subprocess that reads one JSON payload on
//! stdin and writes one JSON response on stdout. The subprocess-with-
//! timeout-kill shape mirrors `vsock-guest::handle_exec`'s process-group
//! spawn and `wait_with_timeout`.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use nimbus_proto::{ExecuteResponse, InitPayload};

use crate::error::{GuestAgentError, Result};

/// Env var the handler process can read to learn which identifier within its
/// code it was asked to serve, since code_bytes is a single opaque blob.
const HANDLER_ENV_VAR: &str = "NIMBUS_HANDLER";

pub struct Handler {
    interpreter: Vec<String>,
    timeout: Duration,
    env_vars: HashMap<String, String>,
}

impl Handler {
    /// `init`: persist the function's code to disk and resolve the
    /// interpreter command for its runtime tag. Never runs anything itself.
    pub fn load(payload: InitPayload) -> Result<Self> {
        let workdir = std::env::temp_dir().join("nimbus-function");
        std::fs::create_dir_all(&workdir)?;
        let entry_path = workdir.join(entry_file_name(&payload.runtime));
        std::fs::write(&entry_path, &payload.code_bytes)?;

        let interpreter = interpreter_for(&payload.runtime, &entry_path).ok_or_else(|| {
            GuestAgentError::Protocol(format!("unsupported runtime: {}", payload.runtime))
        })?;

        let mut env_vars = payload.env_vars;
        env_vars.insert(HANDLER_ENV_VAR.to_string(), payload.handler);

        Ok(Self {
            interpreter,
            timeout: Duration::from_secs(payload.timeout_sec.max(1)),
            env_vars,
        })
    }

    /// Best-effort `warmup` (§4.D step 3): run the interpreter once with a
    /// null payload so lazy imports/compilation happen before the first real
    /// invocation. The caller is expected to ignore failures.
    pub fn warmup(&self) -> Result<()> {
        self.run(&serde_json::Value::Null).map(|_| ())
    }

    /// `execute`: run the interpreter with `payload` on stdin, parse its
    /// stdout as the response body.
    pub fn invoke(&self, payload: serde_json::Value) -> ExecuteResponse {
        let start = Instant::now();
        match self.run(&payload) {
            Ok(body) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                ExecuteResponse {
                    status_code: 200,
                    body,
                    error: None,
                    duration_ms: elapsed_ms,
                    billed_time_ms: elapsed_ms,
                }
            }
            Err(e) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                ExecuteResponse {
                    status_code: 500,
                    body: serde_json::Value::Null,
                    error: Some(e.to_string()),
                    duration_ms: elapsed_ms,
                    billed_time_ms: elapsed_ms,
                }
            }
        }
    }

    fn run(&self, payload: &serde_json::Value) -> Result<serde_json::Value> {
        let mut parts = self.interpreter.iter();
        let program = parts
            .next()
            .ok_or_else(|| GuestAgentError::Protocol("empty interpreter command".into()))?;

        let mut command = Command::new(program);
        command.args(parts);
        command.envs(&self.env_vars);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(payload)?)?;
        }

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let timeout = self.timeout;
        if let Ok(pid) = i32::try_from(child.id()) {
            std::thread::spawn(move || {
                if done_rx.recv_timeout(timeout).is_err() {
                    let pgid = nix::unistd::Pid::from_raw(pid);
                    let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
                }
            });
        }

        let output = child.wait_with_output();
        let _ = done_tx.send(());
        let output = output?;

        if !output.status.success() {
            return Err(GuestAgentError::Protocol(format!(
                "handler exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| GuestAgentError::Protocol(format!("invalid handler output: {e}")))
    }
}

fn entry_file_name(runtime: &str) -> &'static str {
    if runtime.starts_with("python") {
        "handler_entry.py"
    } else if runtime.starts_with("node") {
        "handler_entry.js"
    } else {
        "handler_entry"
    }
}

fn interpreter_for(runtime: &str, entry_path: &std::path::Path) -> Option<Vec<String>> {
    let entry = entry_path.display().to_string();
    if runtime.starts_with("python") {
        Some(vec!["python3".into(), entry])
    } else if runtime.starts_with("node") {
        Some(vec!["node".into(), entry])
    } else {
        None
    }
}
