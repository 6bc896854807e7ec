//! Core data types shared across the session crates

use crate::error::{ErrorContext, SessionError, SessionResult};
use crate::logging::LoggingConfig;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Status used for responses synthesised locally when no real response exists
pub const FAILED_RESPONSE_STATUS: u16 = 599;

/// HTTP verbs understood by the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            other => Err(SessionError::Config {
                message: format!("Unsupported HTTP method '{}'", other),
                source: None,
                context: ErrorContext::new("types")
                    .with_operation("parse_method")
                    .with_suggestion("Use one of GET, POST, PUT, PATCH, DELETE, HEAD"),
            }),
        }
    }
}

/// Owned snapshot of an HTTP response
///
/// Responses are fully buffered so they can be attached to errors, stored in
/// the aggregation table and compared in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub method: HttpMethod,
    pub url: String,
    pub status: u16,
    pub reason: String,
    /// Header names are stored lower-cased
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// True when the response was produced locally instead of by the server
    #[serde(default)]
    pub synthesized: bool,
}

impl HttpResponse {
    pub fn new(method: HttpMethod, url: impl Into<String>, status: u16) -> Self {
        Self {
            method,
            url: url.into(),
            status,
            reason: String::new(),
            headers: BTreeMap::new(),
            body: String::new(),
            synthesized: false,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &serde_json::Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// Build the stand-in response used when a request raised instead of answering
    pub fn failed(method: HttpMethod, url: &str, error: &dyn fmt::Display) -> Self {
        let mut response = Self::new(method, url, FAILED_RESPONSE_STATUS)
            .with_reason("Request Failed")
            .with_body(format!(
                "ENMUtils response - ERROR: {}\n{} request to {} raised this exception.",
                error, method, url
            ));
        response.synthesized = true;
        response
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// Anything below 400 counts as success
    pub fn is_success(&self) -> bool {
        self.status < 400
    }

    /// A redirect that has not been followed yet
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 303 | 307 | 308) && self.header("location").is_some()
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .map(|ct| ct.starts_with("application/json"))
            .unwrap_or(false)
    }

    pub fn json<T: DeserializeOwned>(&self) -> SessionResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }

    /// Human readable message extracted from the body
    ///
    /// JSON bodies yield their `userMessage` field, or the whole document when
    /// the field is absent. Anything else is returned verbatim.
    pub fn user_message(&self) -> String {
        if !self.is_json() {
            return self.body.clone();
        }
        match serde_json::from_str::<serde_json::Value>(&self.body) {
            Ok(serde_json::Value::Object(map)) => match map.get("userMessage") {
                Some(serde_json::Value::String(message)) => message.clone(),
                Some(other) => other.to_string(),
                None => serde_json::Value::Object(map).to_string(),
            },
            Ok(other) => other.to_string(),
            Err(e) => e.to_string(),
        }
    }

    pub fn raise_for_status(&self) -> SessionResult<()> {
        if (400..600).contains(&self.status) {
            return Err(SessionError::request_failed(
                format!(
                    "{} request to {} failed with status code {} {}",
                    self.method, self.url, self.status, self.reason
                ),
                self.clone(),
            ));
        }
        Ok(())
    }
}

/// Request body variants accepted by the session layer
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
    Text(String),
}

impl RequestBody {
    pub fn form<K: Into<String>, V: Into<String>>(fields: impl IntoIterator<Item = (K, V)>) -> Self {
        RequestBody::Form(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        match self {
            RequestBody::Form(fields) => fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }
}

/// Options recognised by every request issued through a session
#[derive(Debug, Clone, PartialEq)]
pub struct RequestOptions {
    /// Per-call timeout; the configured default applies when unset
    pub timeout: Option<Duration>,
    /// TLS certificate verification; off when unset
    pub verify_tls: Option<bool>,
    pub headers: BTreeMap<String, String>,
    /// Statuses excluded from safe-mode bookkeeping (401 is always excluded)
    pub ignore_status_codes: BTreeSet<u16>,
    /// Explicit redirect policy; `None` keeps the verb's default
    pub allow_redirects: Option<bool>,
    /// Whether a lost session may be re-established for this call
    pub allow_reestablish: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            verify_tls: None,
            headers: BTreeMap::new(),
            ignore_status_codes: BTreeSet::new(),
            allow_redirects: None,
            allow_reestablish: true,
        }
    }
}

impl RequestOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_verify_tls(mut self, verify: bool) -> Self {
        self.verify_tls = Some(verify);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn ignore_status(mut self, status: u16) -> Self {
        self.ignore_status_codes.insert(status);
        self
    }

    pub fn with_allow_redirects(mut self, allow: bool) -> Self {
        self.allow_redirects = Some(allow);
        self
    }

    pub fn without_reestablish(mut self) -> Self {
        self.allow_reestablish = false;
        self
    }
}

/// Classification of transport-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionKind {
    /// The remote end could not be reached
    Connect,
    Timeout,
    /// The connection closed before a response was read
    Aborted,
    Other,
}

/// Error raised by a transport before any response was received
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: ConnectionKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: ConnectionKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(ConnectionKind::Connect, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ConnectionKind::Aborted, message)
    }
}

/// Deployment topology, which decides how front-end health is probed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Bare-metal deployment behind a clustered load balancer
    Physical,
    /// Virtualised deployment where the load balancer registers with consul
    Cloud,
    /// Container deployment with no separate load balancer
    CloudNative,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub outage: OutageConfig,
    pub persistence: PersistenceConfig,
    pub scripting: ScriptingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub verify_tls: bool,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub cookie_name: String,
    pub login_path: String,
    pub logout_path: String,
    pub login_timeout_secs: u64,
    /// Total login attempts, including the first one
    pub login_attempts: usize,
    pub login_retry_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutageConfig {
    pub topology: Topology,
    /// How long a probe result is trusted, and how long callers back off
    pub grace_period_secs: u64,
    pub lock_timeout_secs: u64,
    /// Upper bound for one probe run; kept below `lock_timeout_secs`
    pub probe_timeout_secs: u64,
    /// Overrides the topology's default probe command (run through `sh -c`)
    pub probe_command: Option<String>,
    /// Marker that must appear in the probe output for the front end to count as online
    pub probe_marker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: String,
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptingConfig {
    pub attempts: usize,
    pub retry_delay_ms: u64,
    pub command_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl AuthConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

impl OutageConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl PersistenceConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl ScriptingConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
