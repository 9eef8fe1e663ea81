use thiserror::Error;

/// All errors generated in `dropwatch`.
#[derive(Debug, Error)]
pub enum DropwatchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP error {status} from {endpoint}")]
    Status {
        endpoint: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("symbol cache IO error: {0}")]
    Cache(#[from] std::io::Error),

    #[error("invalid candle: {0}")]
    Candle(#[from] CandleError),

    #[error("hub protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("WebSocket error: {0}")]
    Socket(String),

    #[error("backend reported analysis error: {0}")]
    Backend(String),

    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

/// How a [`DropwatchError`] should be handled by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Drop the offending item, keep processing the rest of the batch.
    Item,
    /// Notify, abandon this cycle, try again on the next one.
    Transient,
    /// Push connection failure, handled by reconnecting.
    Reconnect,
    /// Stop the current live-analysis session, no automatic restart.
    SessionFatal,
}

impl DropwatchError {
    /// Classify this error.
    pub fn severity(&self) -> Severity {
        match self {
            DropwatchError::Candle(_) => Severity::Item,
            DropwatchError::Socket(_) | DropwatchError::Protocol(_) => Severity::Reconnect,
            DropwatchError::Backend(_) => Severity::SessionFatal,
            DropwatchError::Http(_)
            | DropwatchError::Status { .. }
            | DropwatchError::Url(_)
            | DropwatchError::Json(_)
            | DropwatchError::Cache(_)
            | DropwatchError::ChannelClosed(_) => Severity::Transient,
        }
    }

    /// Determine if this error ends the current live-analysis session.
    pub fn is_session_fatal(&self) -> bool {
        self.severity() == Severity::SessionFatal
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DropwatchError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}

/// Reasons a raw candle is rejected before it reaches a store.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CandleError {
    #[error("unparsable timestamp: {0}")]
    Timestamp(String),

    #[error("non-finite {field}: {value}")]
    NonFinite { field: &'static str, value: f64 },
}

/// Failures decoding hub protocol records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("server closed the hub connection: {0}")]
    Closed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropwatch_error_severity() {
        struct TestCase {
            input: DropwatchError,
            expected: Severity,
        }

        let tests = vec![
            TestCase {
                // TC0: malformed candle only drops the item
                input: DropwatchError::from(CandleError::Timestamp("yesterday".to_string())),
                expected: Severity::Item,
            },
            TestCase {
                // TC1: socket failure reconnects
                input: DropwatchError::Socket("Io(Kind(UnexpectedEof))".to_string()),
                expected: Severity::Reconnect,
            },
            TestCase {
                // TC2: hub close record reconnects
                input: DropwatchError::from(ProtocolError::Closed("restart".to_string())),
                expected: Severity::Reconnect,
            },
            TestCase {
                // TC3: backend Error signal is fatal for the session
                input: DropwatchError::Backend("symbol not supported".to_string()),
                expected: Severity::SessionFatal,
            },
            TestCase {
                // TC4: bad status code is transient
                input: DropwatchError::Status {
                    endpoint: "fetchcandlestickdata",
                    status: reqwest::StatusCode::BAD_GATEWAY,
                },
                expected: Severity::Transient,
            },
            TestCase {
                // TC5: JSON decode failure is transient
                input: DropwatchError::from(
                    serde_json::from_str::<Vec<String>>("{").unwrap_err(),
                ),
                expected: Severity::Transient,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = test.input.severity();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_only_backend_error_is_session_fatal() {
        assert!(DropwatchError::Backend("boom".to_string()).is_session_fatal());
        assert!(!DropwatchError::ChannelClosed("session").is_session_fatal());
    }
}
