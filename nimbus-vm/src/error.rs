pub type Result<T> = std::result::Result<T, VmError>;

#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("runtime not found: {0}")]
    RuntimeNotFound(String),

    #[error("network setup failed: {0}")]
    NetSetupFailed(#[from] nimbus_network::NetworkError),

    #[error("failed to launch firecracker: {0}")]
    LaunchFailed(String),

    #[error("pause failed: {0}")]
    PauseFailed(String),

    #[error("snapshot i/o error: {0}")]
    SnapshotIoError(String),

    #[error("snapshot file missing: {0}")]
    SnapshotMissing(String),

    #[error("vm not found: {0}")]
    NotFound(uuid::Uuid),
}
