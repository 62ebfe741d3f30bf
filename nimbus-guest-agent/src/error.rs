pub type Result<T> = std::result::Result<T, GuestAgentError>;

#[derive(Debug, thiserror::Error)]
pub enum GuestAgentError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<nimbus_proto::ProtocolError> for GuestAgentError {
    fn from(e: nimbus_proto::ProtocolError) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<serde_json::Error> for GuestAgentError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}
