// rust/compat-core/src/error.rs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompatError {

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
    },

    #[error("Registration rejected: {reason}")]
    Registration {
        reason: String,
    },

    #[error("Timed out {operation} after {seconds}s")]
    Timeout {
        operation: String,
        seconds: u64,
    },

    #[error("Session aborted: {reason}")]
    Aborted {
        reason: String,
    },

    #[error("Tool '{tool}' failed: {message}")]
    Tool {
        tool: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, CompatError>;

// Convenience constructors
impl CompatError {

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error means the peer went away (EOF, reset, broken pipe).
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Transport { source: Some(e), .. } => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            Self::Transport { source: None, .. } => true,
            _ => false,
        }
    }

    /// Cause to forward to peers: the bare reason of an abort, the
    /// display text of anything else.
    pub fn reason(&self) -> String {
        match self {
            Self::Aborted { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = CompatError::timeout("waiting for workers", 30);
        assert_eq!(err.to_string(), "Timed out waiting for workers after 30s");

        let err = CompatError::tool("iperf3", "not found");
        assert_eq!(err.to_string(), "Tool 'iperf3' failed: not found");
    }

    #[test]
    fn test_is_disconnect() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(CompatError::transport_with_source("read", eof).is_disconnect());

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!CompatError::transport_with_source("connect", refused).is_disconnect());

        assert!(!CompatError::protocol("bad frame").is_disconnect());
    }

    #[test]
    fn test_reason_unwraps_aborts_once() {
        let err = CompatError::aborted("rank 1 (10.0.0.3) disconnected during the run");
        assert_eq!(err.reason(), "rank 1 (10.0.0.3) disconnected during the run");
        assert_eq!(err.to_string(), "Session aborted: rank 1 (10.0.0.3) disconnected during the run");

        let forwarded = CompatError::aborted(format!("coordinator aborted: {}", err.reason()));
        assert_eq!(
            forwarded.reason(),
            "coordinator aborted: rank 1 (10.0.0.3) disconnected during the run"
        );

        let err = CompatError::timeout("waiting for workers", 30);
        assert_eq!(err.reason(), "Timed out waiting for workers after 30s");
    }
}
