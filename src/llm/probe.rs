use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::llm::client_core::OpenAIClient;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DETAIL_MAX_CHARS: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    HttpError(u16),
    NetworkError,
    Timeout,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub detail: String,
    pub state: ConnectionState,
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        let detail = match &state {
            ConnectionState::Connected => "Connected".to_string(),
            ConnectionState::HttpError(code) => format!("Error: {code}"),
            ConnectionState::NetworkError => "Connection failed".to_string(),
            ConnectionState::Timeout => "Timeout".to_string(),
            ConnectionState::Other(msg) => {
                format!("Error: {}", msg.chars().take(DETAIL_MAX_CHARS).collect::<String>())
            }
        };
        Self {
            connected: state == ConnectionState::Connected,
            detail,
            state,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

impl OpenAIClient {
    /// Lightweight reachability check against the models listing.
    pub async fn check_connection(&self) -> ConnectionStatus {
        let url = self.models_endpoint();
        let headers = match self.headers() {
            Ok(h) => h,
            Err(e) => return ConnectionState::Other(e.to_string()).into(),
        };
        let res = self
            .inner
            .get(&url)
            .headers(headers)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let state = match res {
            Ok(resp) if resp.status().is_success() => ConnectionState::Connected,
            Ok(resp) => ConnectionState::HttpError(resp.status().as_u16()),
            Err(e) if e.is_timeout() => ConnectionState::Timeout,
            Err(e) if e.is_connect() || e.is_request() => ConnectionState::NetworkError,
            Err(e) => ConnectionState::Other(e.to_string()),
        };
        debug!(endpoint=%url, state=?state, "connection probe");
        state.into()
    }
}
