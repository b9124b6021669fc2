// Unified error handling for the trading controller

use thiserror::Error;

/// Main error type for the controller runtime.
///
/// The taxonomy drives loop behaviour: transient gateway failures skip the
/// current iteration, validation rejections are expected and logged at low
/// severity, invariant violations abort the iteration but never the loop.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("gateway call timed out")]
    GatewayTimeout,

    #[error("market data unavailable for {0}")]
    MarketDataUnavailable(String),

    #[error("signal rejected: {0}")]
    Validation(String),

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("grid session error: {0}")]
    Session(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("shutdown already in progress")]
    ShuttingDown,
}

impl ControllerError {
    /// Transient failures are skipped and retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ControllerError::Gateway(_)
                | ControllerError::GatewayTimeout
                | ControllerError::MarketDataUnavailable(_)
        )
    }

    /// Error category for logging and the control-plane status surface.
    pub fn category(&self) -> &'static str {
        match self {
            ControllerError::Gateway(_)
            | ControllerError::GatewayTimeout
            | ControllerError::MarketDataUnavailable(_) => "gateway",
            ControllerError::Validation(_) => "validation",
            ControllerError::Invariant(_) => "invariant",
            ControllerError::Session(_) => "session",
            ControllerError::Config(_) => "config",
            ControllerError::Database(_) => "database",
            ControllerError::ShuttingDown => "shutdown",
        }
    }
}

pub type ControllerResult<T> = Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ControllerError::GatewayTimeout.is_transient());
        assert!(ControllerError::Gateway("disconnected".to_string()).is_transient());
        assert!(!ControllerError::Validation("stale".to_string()).is_transient());
        assert!(!ControllerError::Invariant("negative volume".to_string()).is_transient());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ControllerError::GatewayTimeout.category(), "gateway");
        assert_eq!(
            ControllerError::Session("duplicate".to_string()).category(),
            "session"
        );
    }
}
