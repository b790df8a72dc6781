use relay_llm::BackendKind;
use std::time::Duration;

/// Failures of a single turn. The `Display` text is what the conversation sees.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("Please approve or deny the pending command first.")]
    Conflict,

    #[error("Error: {} timed out after {}s", backend.display_name(), after.as_secs())]
    Timeout { backend: BackendKind, after: Duration },

    /// A timeout enforced inside the backend, whose budget is its own.
    #[error("Error: {} {what} timed out", backend.display_name())]
    BackendTimedOut { backend: BackendKind, what: String },

    #[error("{} needs authentication: {detail}", backend.display_name())]
    AuthenticationRequired { backend: BackendKind, detail: String },

    #[error("Error: {0}")]
    Upstream(String),

    #[error("Stopped: too many command rounds.")]
    RoundLimitExceeded,

    #[error("No pending command.")]
    NoPendingTurn,

    #[error("{0} is not configured.")]
    BackendUnavailable(&'static str),
}

pub type TurnResult<T> = std::result::Result<T, TurnError>;
