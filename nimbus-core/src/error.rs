pub type Result<T> = std::result::Result<T, NimbusError>;

/// Top-level error composing every per-component error enum (§7's "error
/// type composition", mirroring `runner::error::RunnerError` relative to
/// `sandbox::SandboxError`/`sandbox_fc::SnapshotError`).
#[derive(Debug, thiserror::Error)]
pub enum NimbusError {
    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Network(#[from] nimbus_network::NetworkError),

    #[error(transparent)]
    Vm(#[from] nimbus_vm::VmError),

    #[error(transparent)]
    Snapshot(#[from] nimbus_snapshot::SnapshotError),

    #[error(transparent)]
    Scheduler(#[from] nimbus_scheduler::SchedulerError),

    #[error("function not found: {0}")]
    FunctionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
