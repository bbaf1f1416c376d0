use crate::domain::status::InternalStatus;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SettlementError>;

#[derive(Error, Debug)]
pub enum SettlementError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: InternalStatus,
        to: InternalStatus,
    },
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Internal error: {0}")]
    Internal(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl SettlementError {
    pub fn internal(message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Internal(message.into())
    }

    /// Message that is safe to hand back to a buyer or to the gateway.
    ///
    /// Storage, gateway and internal causes stay in the logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(message)
            | Self::Forbidden(message)
            | Self::NotFound(message)
            | Self::Conflict(message) => message.clone(),
            Self::InvalidTransition { .. } => "transaction is no longer in a valid state".to_string(),
            Self::Gateway(_) => "payment gateway is unavailable".to_string(),
            Self::Storage(_) | Self::Csv(_) | Self::Io(_) | Self::Internal(_) => {
                "internal server error".to_string()
            }
        }
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(error: serde_json::Error) -> Self {
        Self::Internal(Box::new(error))
    }
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for SettlementError {
    fn from(error: rocksdb::Error) -> Self {
        Self::Storage(error.into_string())
    }
}

/// Failures talking to the payment gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),
    #[error("circuit breaker is open")]
    CircuitOpen,
    #[error("circuit breaker is half-open and its probe budget is used up")]
    TooManyProbes,
    #[error("gateway transport error: {0}")]
    Transport(String),
    #[error("gateway rejected the request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("gateway response could not be decoded: {0}")]
    Decode(String),
    #[error("order {0} is unknown to the gateway")]
    UnknownOrder(String),
}

impl GatewayError {
    /// True when the breaker refused the call without reaching the gateway.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::TooManyProbes)
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Decode(error.to_string())
        } else {
            Self::Transport(error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_hides_internal_causes() {
        let error = SettlementError::Storage("disk full on /var/lib/settlement".to_string());
        assert_eq!(error.user_message(), "internal server error");
        assert!(error.to_string().contains("disk full"));
    }

    #[test]
    fn test_user_message_keeps_validation_text() {
        let error = SettlementError::Validation("total price must be positive".to_string());
        assert_eq!(error.user_message(), "total price must be positive");
    }

    #[test]
    fn test_breaker_rejections_are_classified() {
        assert!(GatewayError::CircuitOpen.is_breaker_rejection());
        assert!(GatewayError::TooManyProbes.is_breaker_rejection());
        assert!(!GatewayError::Transport("reset".to_string()).is_breaker_rejection());
    }
}
