//! Credential resolution
//!
//! Sources are consulted in order: explicit pair, credentials file, environment
//! and finally an interactive prompt supplied by the application.

use enm_session_core::{config_error, ErrorContext, SessionError, SessionResult};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const USERNAME_ENV: &str = "ENM_USERNAME";
pub const PASSWORD_ENV: &str = "ENM_PASSWORD";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Explicit,
    File,
    Environment,
    Prompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredentials {
    pub credentials: Credentials,
    pub origin: CredentialOrigin,
}

impl ResolvedCredentials {
    /// Prompted passwords are not kept for silent re-login
    pub fn keep_password(&self) -> bool {
        self.origin != CredentialOrigin::Prompt
    }
}

/// Interactive source, implemented by the application
pub trait PasswordPrompt: Send + Sync {
    fn prompt(&self) -> SessionResult<Credentials>;
}

#[derive(Default)]
pub struct CredentialSource {
    explicit: Option<Credentials>,
    file: Option<PathBuf>,
    use_environment: bool,
    prompt: Option<Box<dyn PasswordPrompt>>,
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSource")
            .field("explicit", &self.explicit.is_some())
            .field("file", &self.file)
            .field("use_environment", &self.use_environment)
            .field("prompt", &self.prompt.is_some())
            .finish()
    }
}

/// Parse a credentials file: username on the first line, password on the second
pub fn read_credentials_file(path: &Path) -> SessionResult<Credentials> {
    let content = std::fs::read_to_string(path)?;
    let mut lines = content.lines().map(str::trim);
    match (lines.next(), lines.next()) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            Ok(Credentials::new(username, password))
        }
        _ => Err(config_error!(
            format!(
                "Credentials file {} must hold a username and a password on separate lines",
                path.display()
            ),
            "credentials"
        )),
    }
}

impl CredentialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn explicit(mut self, username: Option<String>, password: Option<String>) -> Self {
        if let (Some(username), Some(password)) = (username, password) {
            self.explicit = Some(Credentials::new(username, password));
        }
        self
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub fn environment(mut self) -> Self {
        self.use_environment = true;
        self
    }

    pub fn prompt(mut self, prompt: Box<dyn PasswordPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    fn from_environment() -> Option<Credentials> {
        let username = std::env::var(USERNAME_ENV).ok().filter(|v| !v.is_empty())?;
        let password = std::env::var(PASSWORD_ENV).ok().filter(|v| !v.is_empty())?;
        Some(Credentials::new(username, password))
    }

    pub fn resolve(&self) -> SessionResult<ResolvedCredentials> {
        if let Some(credentials) = &self.explicit {
            return Ok(ResolvedCredentials {
                credentials: credentials.clone(),
                origin: CredentialOrigin::Explicit,
            });
        }

        if let Some(path) = self.file.as_deref().filter(|path| path.exists()) {
            debug!(path = %path.display(), "Reading credentials file");
            return Ok(ResolvedCredentials {
                credentials: read_credentials_file(path)?,
                origin: CredentialOrigin::File,
            });
        }

        if self.use_environment {
            if let Some(credentials) = Self::from_environment() {
                return Ok(ResolvedCredentials {
                    credentials,
                    origin: CredentialOrigin::Environment,
                });
            }
        }

        match &self.prompt {
            Some(prompt) => Ok(ResolvedCredentials {
                credentials: prompt.prompt()?,
                origin: CredentialOrigin::Prompt,
            }),
            None => Err(config_error!("No credentials available", "credentials")),
        }
    }
}
