//! Command-execution channel
//!
//! Commands run through a secondary scripting session that is opened for
//! every attempt and closed afterwards. The connector is supplied by the
//! embedding application.

use async_trait::async_trait;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Longest command text carried in logs and errors
pub const MAX_LOGGED_COMMAND_LEN: usize = 1000;

const POOL_CLOSED: &str = "Pool is closed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptingError {
    #[error("Session timeout: {0}")]
    SessionTimeout(String),

    #[error("{0}")]
    Failed(String),
}

impl ScriptingError {
    /// A timed-out session or a closed connection pool; both are cured by reopening
    pub fn is_session_timeout(&self) -> bool {
        match self {
            ScriptingError::SessionTimeout(_) => true,
            ScriptingError::Failed(message) => message.contains(POOL_CLOSED),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandOptions {
    /// Run through the terminal interface rather than the command interface
    pub on_terminal: bool,
    /// Falls back to the configured command timeout
    pub timeout: Option<Duration>,
    pub input_file: Option<PathBuf>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            on_terminal: true,
            timeout: None,
            input_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub lines: Vec<String>,
    /// Names of files attached to the result
    pub files: Vec<String>,
}

impl CommandOutput {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            files: Vec::new(),
        }
    }

    pub fn is_command_result_available(&self) -> bool {
        !self.lines.is_empty()
    }
}

#[async_trait]
pub trait ScriptingSession: Send + Sync {
    async fn execute(&self, command: &str, options: &CommandOptions) -> Result<CommandOutput, ScriptingError>;

    async fn close(&self) -> Result<(), ScriptingError>;
}

#[async_trait]
pub trait ScriptingConnector: Send + Sync {
    async fn open(
        &self,
        base_url: &str,
        username: &str,
        password: Option<&str>,
    ) -> Result<Box<dyn ScriptingSession>, ScriptingError>;
}

fn password_argument() -> &'static Regex {
    static PASSWORD: OnceLock<Regex> = OnceLock::new();
    PASSWORD.get_or_init(|| Regex::new(r"password\s+\S+").unwrap())
}

/// Hide `password <value>` arguments and cap the length for logging
pub fn mask_command(command: &str) -> String {
    let masked = password_argument().replace_all(command, "password ********");
    masked.chars().take(MAX_LOGGED_COMMAND_LEN).collect()
}
