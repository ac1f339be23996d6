//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] e a conversão para [`StageFailure`], que preserva
//! o código HTTP e o `retry-after` para o classificador de erros.

use std::time::Duration;

use thiserror::Error;

use crate::stage::StageFailure;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl From<AnthropicError> for StageFailure {
    fn from(err: AnthropicError) -> Self {
        let message = err.to_string();
        match err {
            AnthropicError::RateLimited { retry_after_ms } => StageFailure::new(message)
                .with_status(429)
                .with_retry_after(Duration::from_millis(retry_after_ms)),
            AnthropicError::ApiError { status, .. } => {
                StageFailure::new(message).with_status(status)
            }
            AnthropicError::NetworkError(e) => {
                let failure = StageFailure::new(message);
                match e.status() {
                    Some(status) => failure.with_status(status.as_u16()),
                    None if e.is_timeout() => StageFailure::new(format!("timeout: {e}")),
                    None => failure,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{ErrorClass, classify};

    #[test]
    fn rate_limited_display() {
        let err = AnthropicError::RateLimited {
            retry_after_ms: 5000,
        };
        assert_eq!(err.to_string(), "rate limited, retry after 5000ms");
    }

    #[test]
    fn api_error_display() {
        let err = AnthropicError::ApiError {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert_eq!(err.to_string(), "API error (status 401): Invalid API key");
    }

    #[test]
    fn rate_limit_becomes_transient_failure_with_hint() {
        let failure = StageFailure::from(AnthropicError::RateLimited {
            retry_after_ms: 3000,
        });
        assert_eq!(failure.status, Some(429));
        assert_eq!(failure.retry_after, Some(Duration::from_secs(3)));
        assert_eq!(classify(&failure), ErrorClass::Transient);
    }

    #[test]
    fn auth_error_becomes_permanent_failure() {
        let failure = StageFailure::from(AnthropicError::ApiError {
            status: 403,
            message: "forbidden".into(),
        });
        assert_eq!(classify(&failure), ErrorClass::Permanent);
    }

    #[test]
    fn server_error_is_left_unclassified() {
        let failure = StageFailure::from(AnthropicError::ApiError {
            status: 500,
            message: "internal".into(),
        });
        assert_eq!(classify(&failure), ErrorClass::Unknown);
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AnthropicError>();
    }
}
