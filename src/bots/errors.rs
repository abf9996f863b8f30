use crate::bots::types::Platform;
use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("no active bot for this webhook token")]
    UnknownBot { inactive: bool },
    #[error("webhook signature verification failed")]
    InvalidSignature,
    #[error("no adapter registered for platform {0}")]
    UnregisteredAdapter(Platform),
    #[error("adapter already registered for platform {0}")]
    DuplicateAdapter(Platform),
    #[error("invalid adapter config for {platform}: {message}")]
    InvalidAdapterConfig { platform: Platform, message: String },
    #[error("event already ingested: event_id={event_id}")]
    DuplicateEvent { event_id: i64 },
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error("bot {bot_id} is rate limited")]
    RateLimited { bot_id: i64 },
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("processing failed after {retries} attempts: {message}")]
    Terminal { retries: i64, message: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl BotError {
    pub fn code(&self) -> &'static str {
        match self {
            BotError::UnknownBot { inactive: false } => "BOT_NOT_FOUND",
            BotError::UnknownBot { inactive: true } => "BOT_INACTIVE",
            BotError::InvalidSignature => "INVALID_SIGNATURE",
            BotError::UnregisteredAdapter(_) => "ADAPTER_NOT_REGISTERED",
            BotError::DuplicateAdapter(_) => "ADAPTER_DUPLICATE",
            BotError::InvalidAdapterConfig { .. } => "ADAPTER_CONFIG_INVALID",
            BotError::DuplicateEvent { .. } => "DUPLICATE_EVENT",
            BotError::InvalidPayload(_) => "INVALID_PAYLOAD",
            BotError::RateLimited { .. } => "RATE_LIMITED",
            BotError::Processing(_) => "PROCESSING_FAILED",
            BotError::Terminal { .. } => "RETRIES_EXHAUSTED",
            BotError::Storage(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BotError::UnknownBot { inactive: false } => StatusCode::NOT_FOUND,
            BotError::UnknownBot { inactive: true } => StatusCode::FORBIDDEN,
            BotError::InvalidSignature => StatusCode::UNAUTHORIZED,
            BotError::UnregisteredAdapter(_) | BotError::InvalidAdapterConfig { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            BotError::DuplicateEvent { .. } => StatusCode::OK,
            BotError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            BotError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            BotError::DuplicateAdapter(_)
            | BotError::Processing(_)
            | BotError::Terminal { .. }
            | BotError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Processing(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingestion_errors_map_to_client_statuses() {
        assert_eq!(
            BotError::UnknownBot { inactive: false }.status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            BotError::UnknownBot { inactive: true }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(BotError::InvalidSignature.status(), StatusCode::UNAUTHORIZED);
        assert!(BotError::UnregisteredAdapter(Platform::Slack)
            .status()
            .is_client_error());
    }

    #[test]
    fn only_processing_errors_are_retryable() {
        assert!(BotError::Processing("timeout".to_string()).is_retryable());
        assert!(!BotError::Terminal {
            retries: 3,
            message: "timeout".to_string()
        }
        .is_retryable());
        assert!(!BotError::InvalidSignature.is_retryable());
    }
}
