//! Configuration management

use crate::error::{ErrorContext, SessionError, SessionResult};
use crate::logging::LoggingConfig;
use crate::types::{
    AuthConfig, OutageConfig, PersistenceConfig, ScriptingConfig, ServerConfig, SessionConfig,
    Topology,
};

use std::path::{Path, PathBuf};

/// Name of the cookie that carries the authenticated session
pub const DEFAULT_AUTH_COOKIE: &str = "iPlanetDirectoryPro";

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "https://localhost".to_string(),
                verify_tls: false,
                request_timeout_secs: 120,
                user_agent: format!("enm-session/{}", env!("CARGO_PKG_VERSION")),
            },
            auth: AuthConfig {
                cookie_name: DEFAULT_AUTH_COOKIE.to_string(),
                login_path: "/login".to_string(),
                logout_path: "/logout".to_string(),
                login_timeout_secs: 120,
                login_attempts: 4,
                login_retry_delay_ms: 5000,
            },
            outage: OutageConfig {
                topology: Topology::Physical,
                grace_period_secs: 45,
                lock_timeout_secs: 45,
                probe_timeout_secs: 15,
                probe_command: None,
                probe_marker: None,
            },
            persistence: PersistenceConfig {
                data_dir: default_data_dir().to_string_lossy().into_owned(),
                lock_timeout_secs: 30,
            },
            scripting: ScriptingConfig {
                attempts: 4,
                retry_delay_ms: 5000,
                command_timeout_secs: 600,
            },
            logging: LoggingConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("share")))
        .unwrap_or_else(std::env::temp_dir)
        .join("enm-session")
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SessionResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SessionError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: SessionConfig = toml::from_str(&content).map_err(|e| SessionError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> SessionResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| SessionError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        std::fs::write(path, content).map_err(|e| SessionError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Candidate configuration files, most specific first
    pub fn default_paths() -> Vec<PathBuf> {
        [
            dirs::config_dir().map(|d| d.join("enm-session").join("config.toml")),
            dirs::home_dir().map(|d| d.join(".enm-session").join("config.toml")),
            Some(PathBuf::from("enm-session.toml")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Load the explicit file if given, else the first default path that exists, else defaults
    pub fn load(explicit: Option<&Path>) -> SessionResult<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_paths().into_iter().find(|path| path.exists()) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> SessionResult<()> {
        if self.server.base_url.trim().is_empty() {
            return Err(invalid("server.base_url must not be empty", "Set server.base_url to the ENM URL"));
        }

        if self.auth.cookie_name.trim().is_empty() {
            return Err(invalid(
                "auth.cookie_name must not be empty",
                "Set auth.cookie_name to the authentication cookie name",
            ));
        }

        if self.auth.login_attempts == 0 {
            return Err(invalid(
                "auth.login_attempts must be greater than 0",
                "Set auth.login_attempts to a positive value",
            ));
        }

        if self.scripting.attempts == 0 {
            return Err(invalid(
                "scripting.attempts must be greater than 0",
                "Set scripting.attempts to a positive value",
            ));
        }

        if self.outage.probe_timeout_secs == 0 || self.outage.probe_timeout_secs >= self.outage.lock_timeout_secs {
            return Err(invalid(
                "outage.probe_timeout_secs must be positive and below outage.lock_timeout_secs",
                "Lower outage.probe_timeout_secs so waiting callers outlast a slow probe",
            ));
        }

        if self.server.request_timeout_secs == 0 || self.auth.login_timeout_secs == 0 {
            return Err(invalid(
                "Request and login timeouts must be greater than 0",
                "Set server.request_timeout_secs and auth.login_timeout_secs",
            ));
        }

        Ok(())
    }
}

fn invalid(message: &str, suggestion: &str) -> SessionError {
    SessionError::Config {
        message: message.to_string(),
        source: None,
        context: ErrorContext::new("config")
            .with_operation("validate")
            .with_suggestion(suggestion),
    }
}
