//! Unified error handling system
//!
//! Every failure that leaves the session layer is classified into one of the
//! variants below, so callers never see a raw transport error

use crate::types::{ConnectionKind, HttpResponse, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type SessionResult<T> = Result<T, SessionError>;

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for the session layer
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid login, credentials are invalid for user {username}")]
    InvalidCredentials {
        username: String,
        response: Option<Box<HttpResponse>>,
        context: ErrorContext,
    },

    #[error("{message}")]
    PasswordPolicy {
        message: String,
        username: String,
        response: Box<HttpResponse>,
        context: ErrorContext,
    },

    #[error("Cannot RE-ESTABLISH session because we don't have password stored for user {username}")]
    NoStoredPassword {
        username: String,
        context: ErrorContext,
    },

    #[error("Session lost, status code:: [{}] for {}", .response.status, .response.url)]
    AuthLost {
        response: Box<HttpResponse>,
        context: ErrorContext,
    },

    #[error("{message}")]
    RequestFailed {
        message: String,
        response: Box<HttpResponse>,
        context: ErrorContext,
    },

    #[error("Connection error: {message}")]
    Connection {
        message: String,
        kind: ConnectionKind,
        context: ErrorContext,
    },

    #[error("Application error: {message}")]
    Application {
        message: String,
        response: Option<Box<HttpResponse>>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("No output to parse from command {command}")]
    NoCommandOutput {
        command: String,
        context: ErrorContext,
    },

    #[error("Persistence error: {message}")]
    Persistence {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Could not acquire lock '{name}' within {timeout_ms}ms")]
    Lock {
        name: String,
        timeout_ms: u64,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SessionError {
    pub fn auth_lost(response: HttpResponse) -> Self {
        let context = ErrorContext::new("session")
            .with_operation("request")
            .with_metadata("url", &response.url)
            .with_suggestion("Re-establish the session and retry the request");
        SessionError::AuthLost {
            response: Box::new(response),
            context,
        }
    }

    pub fn request_failed(message: impl Into<String>, response: HttpResponse) -> Self {
        let context = ErrorContext::new("session")
            .with_operation("request")
            .with_metadata("url", &response.url)
            .with_metadata("status", &response.status.to_string());
        SessionError::RequestFailed {
            message: message.into(),
            response: Box::new(response),
            context,
        }
    }

    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            SessionError::InvalidCredentials { context, .. } => Some(context),
            SessionError::PasswordPolicy { context, .. } => Some(context),
            SessionError::NoStoredPassword { context, .. } => Some(context),
            SessionError::AuthLost { context, .. } => Some(context),
            SessionError::RequestFailed { context, .. } => Some(context),
            SessionError::Connection { context, .. } => Some(context),
            SessionError::Application { context, .. } => Some(context),
            SessionError::NoCommandOutput { context, .. } => Some(context),
            SessionError::Persistence { context, .. } => Some(context),
            SessionError::Lock { context, .. } => Some(context),
            SessionError::Config { context, .. } => Some(context),
            SessionError::Timeout { context, .. } => Some(context),
            SessionError::Io(_) | SessionError::Serialization(_) => None,
        }
    }

    /// The response that caused the error, when there is one
    pub fn response(&self) -> Option<&HttpResponse> {
        match self {
            SessionError::AuthLost { response, .. }
            | SessionError::RequestFailed { response, .. }
            | SessionError::PasswordPolicy { response, .. } => Some(response),
            SessionError::InvalidCredentials { response, .. }
            | SessionError::Application { response, .. } => response.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response().map(|response| response.status)
    }

    /// True for login failures that mean the stored session cannot be trusted
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, SessionError::InvalidCredentials { .. }) || self.status_code() == Some(401)
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            SessionError::Connection { .. } => true,
            SessionError::Timeout { .. } => true,
            SessionError::Lock { .. } => true,
            SessionError::AuthLost { .. } => true,
            SessionError::RequestFailed { response, .. } => {
                matches!(response.status, 502..=504)
            }
            SessionError::InvalidCredentials { .. } => false,
            SessionError::PasswordPolicy { .. } => false,
            SessionError::NoStoredPassword { .. } => false,
            SessionError::Config { .. } => false,
            _ => false,
        }
    }

    /// Get retry delay in milliseconds for recoverable errors
    pub fn retry_delay_ms(&self) -> Option<u64> {
        match self {
            SessionError::Connection { .. } => Some(1000),
            SessionError::Timeout { .. } => Some(2000),
            SessionError::Lock { .. } => Some(500),
            SessionError::AuthLost { .. } => Some(0),
            SessionError::RequestFailed { .. } if self.is_recoverable() => Some(5000),
            _ => None,
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        let error_id = self.context().map(|c| &c.error_id);
        match self {
            SessionError::InvalidCredentials { .. }
            | SessionError::PasswordPolicy { .. }
            | SessionError::NoStoredPassword { .. } => {
                error!(
                    error_id = ?error_id,
                    error = %self,
                    "Credential or password policy error"
                );
            }
            SessionError::Config { .. } => {
                error!(error_id = ?error_id, error = %self, "Configuration error");
            }
            SessionError::Connection { .. }
            | SessionError::Timeout { .. }
            | SessionError::AuthLost { .. }
            | SessionError::Lock { .. } => {
                warn!(
                    error_id = ?error_id,
                    error = %self,
                    "Transient error (may be recoverable)"
                );
            }
            _ => {
                error!(
                    error_id = ?error_id,
                    status = ?self.status_code(),
                    error = %self,
                    "Error occurred"
                );
            }
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        let suggestion = match error.kind {
            ConnectionKind::Connect => "Check network connectivity to the server",
            ConnectionKind::Timeout => "Increase the request timeout",
            ConnectionKind::Aborted => "The server closed the connection, retry the request",
            ConnectionKind::Other => "Check the server and proxy logs",
        };
        SessionError::Connection {
            message: error.message,
            kind: error.kind,
            context: ErrorContext::new("transport").with_suggestion(suggestion),
        }
    }
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        SessionError::Config {
            message: $msg.to_string(),
            source: None,
            context: ErrorContext::new($component)
                .with_suggestion("Check your configuration file")
                .with_suggestion("Run 'enm-session config --init' to create default config"),
        }
    };
}

#[macro_export]
macro_rules! persistence_error {
    ($msg:expr, $component:expr) => {
        SessionError::Persistence {
            message: $msg.to_string(),
            source: None,
            context: ErrorContext::new($component),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        SessionError::Persistence {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: ErrorContext::new($component)
                .with_suggestion("Check that the persistence directory is writable"),
        }
    };
}

#[macro_export]
macro_rules! application_error {
    ($msg:expr, $component:expr) => {
        SessionError::Application {
            message: $msg.to_string(),
            response: None,
            source: None,
            context: ErrorContext::new($component),
        }
    };
    ($msg:expr, $component:expr, response = $response:expr) => {
        SessionError::Application {
            message: $msg.to_string(),
            response: Some(Box::new($response)),
            source: None,
            context: ErrorContext::new($component),
        }
    };
}
