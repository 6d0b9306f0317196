use thiserror::Error;

/// Engine-level error taxonomy. Provider and config failures are cycle-local:
/// callers skip the affected entity, log, and continue with the rest of the
/// pass. `LockContention` is a clean skip of the whole invocation, distinct
/// from failure.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("provider unavailable for account '{account}': {detail}")]
    ProviderUnavailable { account: String, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("another invocation holds the store lock")]
    LockContention,

    #[error("terminate rejected for instance '{instance}': {detail}")]
    TerminationFailure { instance: String, detail: String },

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl FleetError {
    pub fn config(msg: impl Into<String>) -> Self {
        FleetError::Config(msg.into())
    }
}
