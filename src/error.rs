use thiserror::Error;

/// Failures surfaced by [`crate::process::ServerProcess`].
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("server process is already running")]
    AlreadyRunning,
    #[error("server process is not running")]
    NotRunning,
    #[error("failed to spawn '{path}': {source}")]
    Spawn {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Faults raised by [`crate::api_client::ApiClient`].
///
/// Only [`ApiError::Connection`] means the remote side is unreachable; every
/// other variant implies the server answered (or the request never left).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("could not connect to {url}: {message}")]
    Connection { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("API request failed with status code {status}")]
    Http { status: u16, body: String },
    #[error("failed to deserialize response: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
        body: String,
    },
    #[error("invalid url '{0}'")]
    InvalidUrl(String),
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl ApiError {
    /// True when the fault means the server's API could not be reached at all.
    pub fn is_connection(&self) -> bool {
        matches!(self, ApiError::Connection { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_faults_classify_as_offline() {
        let conn = ApiError::Connection {
            url: "http://127.0.0.1:1/info".into(),
            message: "refused".into(),
        };
        let http = ApiError::Http {
            status: 503,
            body: "busy".into(),
        };
        let timeout = ApiError::Timeout {
            url: "http://127.0.0.1:1/info".into(),
        };
        assert!(conn.is_connection());
        assert!(!http.is_connection());
        assert!(!timeout.is_connection());
        assert_eq!(http.status(), Some(503));
        assert_eq!(conn.status(), None);
    }
}
