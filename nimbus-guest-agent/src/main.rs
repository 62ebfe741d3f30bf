//! Guest agent binary: waits for the host's single vsock connection, then
//! serves requests until it closes.

use nimbus_guest_agent::Session;
use nimbus_guest_agent::vsock::{GUEST_PORT, accept_vsock};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(port = GUEST_PORT, "waiting for host connection");
    let stream = match accept_vsock(GUEST_PORT) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to accept vsock connection");
            std::process::exit(1);
        }
    };
    tracing::info!("host connected");

    if let Err(e) = Session::new(stream).run() {
        tracing::error!(error = %e, "session ended with error");
        std::process::exit(1);
    }
}
