use crate::command::CommandError;

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("bridge pool exhausted: all /30 subnets in use")]
    NetExhausted,

    #[error("host network configuration error: {0}")]
    HostConfigError(String),

    #[error("could not determine host default interface from: {0:?}")]
    NoDefaultInterface(String),

    #[error(transparent)]
    CommandFailed(#[from] CommandError),
}
