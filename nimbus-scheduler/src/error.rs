pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("admission timed out")]
    AdmissionTimeout,
    #[error("connect failed: {0}")]
    ConnectFailed(String),
    #[error("timeout")]
    Timeout,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("guest error: {0}")]
    GuestError(String),
    #[error("vm launch failed: {0}")]
    VmLaunchFailed(String),
}

impl From<nimbus_transport::TransportError> for SchedulerError {
    fn from(e: nimbus_transport::TransportError) -> Self {
        match e {
            nimbus_transport::TransportError::ConnectFailed(s) => Self::ConnectFailed(s),
            nimbus_transport::TransportError::Timeout => Self::Timeout,
            nimbus_transport::TransportError::Protocol(s) => Self::ProtocolError(s),
            nimbus_transport::TransportError::Guest(s) => Self::GuestError(s),
        }
    }
}

impl From<nimbus_vm::VmError> for SchedulerError {
    fn from(e: nimbus_vm::VmError) -> Self {
        Self::VmLaunchFailed(e.to_string())
    }
}
