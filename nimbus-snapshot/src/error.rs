pub type Result<T> = std::result::Result<T, SnapshotError>;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("vm launch failed: {0}")]
    VmLaunchFailed(String),
    #[error("guest init failed: {0}")]
    InitFailed(String),
    #[error("snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nimbus_vm::VmError> for SnapshotError {
    fn from(e: nimbus_vm::VmError) -> Self {
        Self::VmLaunchFailed(e.to_string())
    }
}

impl From<nimbus_transport::TransportError> for SnapshotError {
    fn from(e: nimbus_transport::TransportError) -> Self {
        Self::InitFailed(e.to_string())
    }
}
