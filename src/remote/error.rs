//! Tipos de erro para o cliente HTTP de artefatos remotos.
//!
//! Define [`RemoteError`] com variantes para rate limiting, erros HTTP
//! e erros de rede. O cache trata qualquer uma delas como falha do
//! fetch, nunca como acerto parcial.

use thiserror::Error;

/// Erros que podem ocorrer ao baixar um artefato remoto.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// O servidor retornou HTTP 429.
    /// `retry_after_ms` vem do header `retry-after` (padrão 1000ms).
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Qualquer outro status HTTP não-2xx, com o corpo da resposta.
    #[error("remote error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Falha de rede subjacente (DNS, conexão recusada, timeout).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl RemoteError {
    /// Vale repetir a requisição (429, falha de rede ou 5xx)?
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::RateLimited { .. } | RemoteError::NetworkError(_) => true,
            RemoteError::ApiError { status, .. } => *status >= 500,
        }
    }
}
