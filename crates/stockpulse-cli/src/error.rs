use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Store(#[from] stockpulse_store::StoreError),

    #[error(transparent)]
    Sink(#[from] stockpulse_ingest::SinkError),

    #[error(transparent)]
    Engine(#[from] stockpulse_aggregate::EngineError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Store(_) => 3,
            Self::Sink(_) => 4,
            Self::Engine(_) => 5,
            Self::Serialization(_) | Self::Io(_) => 10,
        }
    }
}
