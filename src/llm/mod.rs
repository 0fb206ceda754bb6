mod client_core;
pub mod extract;
mod probe;
mod stream;
mod transport;
pub mod types;

use reqwest::StatusCode;
use thiserror::Error;

pub use client_core::*;
pub use transport::ChatTransport;
pub use types::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LlmErrorKind {
    #[error("rate limited")]
    RateLimited,
    #[error("server error")]
    Server,
    #[error("network error")]
    Network,
    #[error("request timed out")]
    Timeout,
    #[error("client error")]
    Client,
    #[error("could not decode response")]
    Deserialize,
    #[error("unknown transport error")]
    Unknown,
}

pub fn classify_error(status: Option<StatusCode>, err: &anyhow::Error) -> LlmErrorKind {
    if let Some(st) = status {
        if st == StatusCode::TOO_MANY_REQUESTS {
            return LlmErrorKind::RateLimited;
        }
        if st.is_server_error() {
            return LlmErrorKind::Server;
        }
        if st.is_client_error() {
            return LlmErrorKind::Client;
        }
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        if e.is_timeout() {
            return LlmErrorKind::Timeout;
        }
        if e.is_connect() || e.is_body() || e.is_request() {
            return LlmErrorKind::Network;
        }
        if e.is_decode() {
            return LlmErrorKind::Deserialize;
        }
    }
    LlmErrorKind::Unknown
}
