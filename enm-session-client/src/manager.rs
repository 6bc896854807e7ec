//! Session orchestration for one user
//!
//! `SessionManager` owns the user's credentials and current `Session`, and runs
//! the recovery protocol around every request:
//!
//! 1. Issue the call on the current session.
//! 2. A session-lost status (or `AuthLost`) triggers one re-login and one retry.
//! 3. A connection failure consults the `OutageCache`; while the front end is
//!    down the call is retried once after the grace period, on the same session.
//! 4. Anything else is fatal. In safe mode request failures are turned into
//!    responses and counted in the response table instead.

use crate::aggregation::ResponseTable;
use crate::auth::UsernamePassword;
use crate::cache::{persistence_key, PersistedUser, SessionCache};
use crate::credentials::ResolvedCredentials;
use crate::outage::OutageCache;
use crate::scripting::{mask_command, CommandOptions, CommandOutput, ScriptingConnector, ScriptingError};
use crate::session::Session;
use crate::transport::TransportFactory;
use chrono::Utc;
use enm_session_core::{
    application_error, config_error, retry_async_if, ErrorContext, HttpMethod, HttpResponse, RequestBody,
    RequestOptions, RetryConfig, SessionConfig, SessionError, SessionResult,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Statuses of a returned response that call for a re-login
pub const REESTABLISH_STATUS_CODES: [u16; 6] = [401, 301, 302, 403, 502, 504];

/// Statuses of a raised failure that mean the session was lost
pub const SESSION_LOST_STATUS_CODES: [u16; 5] = [401, 302, 403, 502, 504];

/// Body fragments that identify a lost session regardless of status
pub const SESSION_TIMEOUT_SIGNATURES: [&str; 7] = [
    "loginUsername",
    "401 Authorization Required",
    "Session timeout error",
    "aborted",
    "Pool is closed",
    "Invalid login",
    "Authentication failed",
];

/// Error fragments that point at the load balancer rather than the session
pub const OUTAGE_SIGNATURES: [&str; 2] = ["Network is unreachable", "Service Unavailable"];

/// Resource probed to check that a session really works
pub const USER_INFO_PATH: &str = "/oss/idm/usermanagement/users/";

enum Recovery {
    RetryAfterOutage,
    Reestablish,
    Fatal,
}

fn is_outage_candidate(error: &SessionError) -> bool {
    let by_kind = match error {
        SessionError::Connection { .. } => true,
        SessionError::RequestFailed { response, .. } => response.status == 503,
        _ => false,
    };
    by_kind || {
        let message = error.to_string();
        OUTAGE_SIGNATURES.iter().any(|signature| message.contains(signature))
    }
}

fn is_session_lost(error: &SessionError) -> bool {
    error.response().is_some_and(|response| {
        SESSION_LOST_STATUS_CODES.contains(&response.status)
            || SESSION_TIMEOUT_SIGNATURES
                .iter()
                .any(|signature| response.body.contains(signature))
    })
}

/// Failures that safe mode turns into responses
fn is_request_error(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::AuthLost { .. }
            | SessionError::RequestFailed { .. }
            | SessionError::Connection { .. }
            | SessionError::Timeout { .. }
    )
}

/// Parse a response body as JSON, failing with the response attached
pub fn verify_json_response(response: &HttpResponse) -> SessionResult<serde_json::Value> {
    serde_json::from_str(&response.body).map_err(|e| SessionError::Application {
        message: format!("Unexpected response received {}", response.body),
        response: Some(Box::new(response.clone())),
        source: Some(Box::new(e)),
        context: ErrorContext::new("session_manager").with_operation("verify_json_response"),
    })
}

pub struct SessionManagerBuilder {
    username: String,
    password: Option<String>,
    keep_password: bool,
    safe_request: bool,
    persist: bool,
    persistence_key: Option<String>,
    base_url: Option<String>,
    session_key: Option<String>,
    config: Arc<SessionConfig>,
    transports: Arc<dyn TransportFactory>,
    session_cache: Option<SessionCache>,
    outage: Option<Arc<OutageCache>>,
    scripting: Option<Arc<dyn ScriptingConnector>>,
}

impl SessionManagerBuilder {
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Keep the password after login so the session can be re-established silently
    pub fn keep_password(mut self, keep: bool) -> Self {
        self.keep_password = keep;
        self
    }

    pub fn safe_request(mut self, safe: bool) -> Self {
        self.safe_request = safe;
        self
    }

    /// Write the session to the cache after every login (on by default)
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn persistence_key(mut self, key: impl Into<String>) -> Self {
        self.persistence_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Auth cookie to adopt instead of logging in
    pub fn session_key(mut self, key: impl Into<String>) -> Self {
        self.session_key = Some(key.into());
        self
    }

    pub fn session_cache(mut self, cache: SessionCache) -> Self {
        self.session_cache = Some(cache);
        self
    }

    pub fn outage_cache(mut self, outage: Arc<OutageCache>) -> Self {
        self.outage = Some(outage);
        self
    }

    pub fn scripting(mut self, connector: Arc<dyn ScriptingConnector>) -> Self {
        self.scripting = Some(connector);
        self
    }

    pub fn build(self) -> SessionResult<SessionManager> {
        if self.username.trim().is_empty() {
            return Err(config_error!("Username cannot be empty", "session_manager"));
        }

        let persistence_key = self
            .persistence_key
            .unwrap_or_else(|| persistence_key(&self.username));
        let base_url = self
            .base_url
            .unwrap_or_else(|| self.config.server.base_url.clone());

        Ok(SessionManager {
            username: self.username,
            password: RwLock::new(self.password),
            keep_password: self.keep_password,
            safe_request: self.safe_request,
            persist: self.persist,
            persistence_key,
            base_url,
            config: self.config,
            transports: self.transports,
            session_cache: self.session_cache,
            outage: self.outage,
            scripting: self.scripting,
            session: RwLock::new(None),
            session_key: RwLock::new(self.session_key),
            open_lock: Mutex::new(()),
            responses: std::sync::Mutex::new(ResponseTable::new()),
        })
    }
}

pub struct SessionManager {
    username: String,
    password: RwLock<Option<String>>,
    keep_password: bool,
    safe_request: bool,
    persist: bool,
    persistence_key: String,
    base_url: String,
    config: Arc<SessionConfig>,
    transports: Arc<dyn TransportFactory>,
    session_cache: Option<SessionCache>,
    outage: Option<Arc<OutageCache>>,
    scripting: Option<Arc<dyn ScriptingConnector>>,
    session: RwLock<Option<Arc<Session>>>,
    /// Last known auth cookie value
    session_key: RwLock<Option<String>>,
    /// Serialises opening and re-establishing sessions
    open_lock: Mutex<()>,
    responses: std::sync::Mutex<ResponseTable>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("username", &self.username)
            .field("keep_password", &self.keep_password)
            .field("safe_request", &self.safe_request)
            .field("persistence_key", &self.persistence_key)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl SessionManager {
    pub fn builder(
        username: impl Into<String>,
        config: Arc<SessionConfig>,
        transports: Arc<dyn TransportFactory>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder {
            username: username.into(),
            password: None,
            keep_password: false,
            safe_request: false,
            persist: true,
            persistence_key: None,
            base_url: None,
            session_key: None,
            config,
            transports,
            session_cache: None,
            outage: None,
            scripting: None,
        }
    }

    /// Builder seeded from resolved credentials; prompted passwords are not kept
    pub fn from_credentials(
        resolved: ResolvedCredentials,
        config: Arc<SessionConfig>,
        transports: Arc<dyn TransportFactory>,
    ) -> SessionManagerBuilder {
        let keep_password = resolved.keep_password();
        Self::builder(resolved.credentials.username, config, transports)
            .password(resolved.credentials.password)
            .keep_password(keep_password)
    }

    /// Builder seeded from state another process persisted
    pub fn from_persisted(
        persisted: &PersistedUser,
        config: Arc<SessionConfig>,
        transports: Arc<dyn TransportFactory>,
    ) -> SessionManagerBuilder {
        let mut builder = Self::builder(persisted.username.clone(), config, transports)
            .keep_password(persisted.keep_password)
            .safe_request(persisted.safe_request)
            .base_url(persisted.base_url.clone());
        if let Some(password) = persisted.password() {
            builder = builder.password(password);
        }
        if let Some(key) = &persisted.session_key {
            builder = builder.session_key(key.clone());
        }
        builder
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn keep_password(&self) -> bool {
        self.keep_password
    }

    pub fn safe_request(&self) -> bool {
        self.safe_request
    }

    pub fn persistence_key(&self) -> &str {
        &self.persistence_key
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn session(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    pub async fn session_key(&self) -> Option<String> {
        self.session_key.read().await.clone()
    }

    fn no_stored_password(&self) -> SessionError {
        SessionError::NoStoredPassword {
            username: self.username.clone(),
            context: ErrorContext::new("session_manager")
                .with_operation("open_session")
                .with_suggestion("Provide the password again to open a new session"),
        }
    }

    /// Open a session, adopting a known auth cookie unless `reestablish` is set
    pub async fn open_session(&self, reestablish: bool, url: Option<&str>) -> SessionResult<Arc<Session>> {
        let _guard = self.open_lock.lock().await;
        self.open_session_locked(reestablish, url).await
    }

    async fn open_session_locked(&self, reestablish: bool, url: Option<&str>) -> SessionResult<Arc<Session>> {
        let base_url = url.unwrap_or(&self.base_url);
        debug!(username = %self.username, base_url = %base_url, "Opening session");
        let transport = self.transports.create(base_url)?;
        let session = Arc::new(Session::new(base_url, transport, &self.config));

        if reestablish {
            info!(username = %self.username, "Trying to re-establish session");
            if !self.keep_password || self.password.read().await.is_none() {
                return Err(self.no_stored_password());
            }
            self.login(&session).await?;
        } else if let Some(key) = self.known_session_key().await {
            debug!(username = %self.username, "Existing session cookie found");
            session.adopt_auth_cookie(&key);
        } else {
            self.login(&session).await?;
        }

        *self.session.write().await = Some(Arc::clone(&session));
        Ok(session)
    }

    /// In-memory cookie, else the one persisted for this user
    async fn known_session_key(&self) -> Option<String> {
        if let Some(key) = self.session_key.read().await.clone() {
            return Some(key);
        }

        let cache = self.session_cache.as_ref()?;
        let persisted = match cache.load(&self.persistence_key).await {
            Ok(Some(persisted)) if persisted.username == self.username => persisted,
            Ok(_) => return None,
            Err(e) => {
                warn!(key = %self.persistence_key, error = %e, "Could not read persisted session");
                return None;
            }
        };

        if self.keep_password {
            if let Some(password) = persisted.password() {
                let mut stored = self.password.write().await;
                if stored.is_none() {
                    *stored = Some(password);
                }
            }
        }
        let key = persisted.session_key?;
        *self.session_key.write().await = Some(key.clone());
        Some(key)
    }

    async fn login(&self, session: &Session) -> SessionResult<()> {
        let password = self.password.read().await.clone();
        let authenticator = Arc::new(UsernamePassword::new(
            &self.username,
            password,
            self.config.auth.clone(),
        ));
        debug!(username = %self.username, "Trying to login");

        match session.open_session(authenticator).await {
            Ok(()) => {
                *self.session_key.write().await = session.auth_cookie();
                if !self.keep_password {
                    *self.password.write().await = None;
                }
                info!(username = %self.username, "User successfully logged in");

                if self.persist {
                    if let Some(cache) = &self.session_cache {
                        let state = self.persisted_state_for(session.base_url()).await;
                        if let Err(e) = cache.save(&self.persistence_key, &state).await {
                            warn!(key = %self.persistence_key, error = %e, "Failed to persist session");
                        }
                    }
                }
                Ok(())
            }
            Err(error) => {
                if error.is_unauthorized() {
                    *self.session_key.write().await = None;
                    if let Some(cache) = &self.session_cache {
                        if let Err(e) = cache.remove(&self.persistence_key).await {
                            warn!(key = %self.persistence_key, error = %e, "Failed to remove persisted session");
                        }
                    }
                    debug!(
                        username = %self.username,
                        "User not authorised, please ensure user is created correctly and credentials are valid"
                    );
                }
                Err(error)
            }
        }
    }

    async fn persisted_state_for(&self, base_url: &str) -> PersistedUser {
        let encoded_password = if self.keep_password {
            self.password
                .read()
                .await
                .as_deref()
                .map(PersistedUser::encode_password)
        } else {
            None
        };
        PersistedUser {
            username: self.username.clone(),
            base_url: base_url.to_string(),
            session_key: self.session_key.read().await.clone(),
            keep_password: self.keep_password,
            safe_request: self.safe_request,
            encoded_password,
            persisted_at: Utc::now(),
        }
    }

    /// State as it would be written to the session cache
    pub async fn persisted_state(&self) -> PersistedUser {
        let base_url = match self.session().await {
            Some(session) => session.base_url().to_string(),
            None => self.base_url.clone(),
        };
        self.persisted_state_for(&base_url).await
    }

    async fn current_session(&self) -> SessionResult<Arc<Session>> {
        if let Some(session) = self.session().await {
            return Ok(session);
        }
        let _guard = self.open_lock.lock().await;
        if let Some(session) = self.session().await {
            return Ok(session);
        }
        self.open_session_locked(false, None).await
    }

    /// Replace `stale` with a freshly logged-in session
    ///
    /// Concurrent callers holding the same stale session share one re-login.
    async fn reestablish(&self, stale: &Arc<Session>) -> SessionResult<Arc<Session>> {
        let _guard = self.open_lock.lock().await;
        if let Some(current) = self.session().await {
            if !Arc::ptr_eq(&current, stale) {
                debug!(username = %self.username, "Session already re-established");
                return Ok(current);
            }
        }
        self.open_session_locked(true, None).await
    }

    /// Close the session (best effort) and forget it, here and in the cache
    pub async fn remove_session(&self, username: Option<&str>) -> SessionResult<()> {
        let username = username.unwrap_or(&self.username);
        let session = self.session.write().await.take();
        if let Some(session) = session {
            let password = self.password.read().await.clone();
            session.close_session(Some(username), password.as_deref()).await;
            debug!(username = %username, "Removed user session");
        }
        *self.session_key.write().await = None;
        if let Some(cache) = &self.session_cache {
            cache.remove(&self.persistence_key).await?;
        }
        Ok(())
    }

    async fn classify_failure(&self, error: &SessionError) -> Recovery {
        if is_outage_candidate(error) {
            if let Some(outage) = &self.outage {
                match outage.is_front_end_online().await {
                    Ok(false) => return Recovery::RetryAfterOutage,
                    Ok(true) => debug!("Front end is online, not an outage"),
                    Err(e) => warn!(error = %e, "Could not determine front-end status"),
                }
            }
        }
        if is_session_lost(error) {
            Recovery::Reestablish
        } else {
            Recovery::Fatal
        }
    }

    async fn request_with_recovery(
        &self,
        session: &Arc<Session>,
        method: HttpMethod,
        url: &str,
        body: &RequestBody,
        options: &RequestOptions,
    ) -> SessionResult<HttpResponse> {
        let error = match session.request(method, url, body.clone(), options).await {
            Ok(response) if REESTABLISH_STATUS_CODES.contains(&response.status) => {
                if !options.allow_reestablish {
                    debug!(status = response.status, url = %response.url, "Session lost, re-establishment disabled");
                    return Ok(response);
                }
                warn!(
                    username = %self.username,
                    status = response.status,
                    url = %response.url,
                    "Session lost on application side, re-establishing"
                );
                let session = self.reestablish(session).await?;
                return session.request(method, url, body.clone(), options).await;
            }
            Ok(response) => return Ok(response),
            Err(error) => error,
        };

        debug!(method = %method, url = %url, error = %error, "Errors occurred during request");
        match self.classify_failure(&error).await {
            Recovery::RetryAfterOutage => {
                let grace = self.config.outage.grace_period();
                warn!(
                    grace_period_secs = grace.as_secs(),
                    "Front end is offline, waiting before retrying"
                );
                if !grace.is_zero() {
                    tokio::time::sleep(grace).await;
                }
                session.request(method, url, body.clone(), options).await
            }
            Recovery::Reestablish if options.allow_reestablish => {
                warn!(
                    username = %self.username,
                    status = ?error.status_code(),
                    "Session lost on application side, re-establishing"
                );
                let session = self.reestablish(session).await?;
                session.request(method, url, body.clone(), options).await
            }
            Recovery::Reestablish => {
                debug!(error = %error, "Session lost, re-establishment disabled");
                Ok(error
                    .response()
                    .cloned()
                    .unwrap_or_else(|| HttpResponse::failed(method, &session.url_for(url), &error)))
            }
            Recovery::Fatal => Err(error),
        }
    }

    fn log_for_status(&self, response: &HttpResponse, ignore_status_codes: &BTreeSet<u16>) {
        if response.status == 401 {
            debug!(
                method = %response.method,
                url = %response.url,
                "Request failed with status 401, session lost or failed to open"
            );
        } else if !response.is_success() {
            debug!(
                method = %response.method,
                url = %response.url,
                status = response.status,
                body = %response.body,
                "Request failed"
            );
        } else {
            debug!(method = %response.method, url = %response.url, "Request was successful");
        }

        if self.safe_request && response.status != 401 && !ignore_status_codes.contains(&response.status) {
            if let Ok(mut table) = self.responses.lock() {
                table.record(response);
            }
        }
    }

    /// Issue a request under the recovery protocol
    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> SessionResult<HttpResponse> {
        let session = self.current_session().await?;
        let response = match self
            .request_with_recovery(&session, method, url, &body, &options)
            .await
        {
            Ok(response) => response,
            Err(error) if self.safe_request && is_request_error(&error) => {
                debug!(error = %error, "Safe request, converting failure into a response");
                error
                    .response()
                    .cloned()
                    .unwrap_or_else(|| HttpResponse::failed(method, &session.url_for(url), &error))
            }
            Err(error) => return Err(error),
        };
        self.log_for_status(&response, &options.ignore_status_codes);
        Ok(response)
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Get, url, RequestBody::Empty, options).await
    }

    pub async fn head(&self, url: &str, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Head, url, RequestBody::Empty, options).await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Delete, url, RequestBody::Empty, options).await
    }

    pub async fn post(&self, url: &str, body: RequestBody, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Post, url, body, options).await
    }

    pub async fn put(&self, url: &str, body: RequestBody, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Put, url, body, options).await
    }

    pub async fn patch(&self, url: &str, body: RequestBody, options: RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Patch, url, body, options).await
    }

    /// Open a session and confirm it can read the user's own record
    ///
    /// A missing password clears the session and reports `false`.
    pub async fn is_session_established(&self, url: Option<&str>) -> SessionResult<bool> {
        let outcome = match self.open_session(false, url).await {
            Ok(_) => {
                self.get(&format!("{}{}", USER_INFO_PATH, self.username), RequestOptions::default())
                    .await
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(response) => {
                let established = response.is_success();
                if established {
                    debug!(username = %self.username, "Verified that user exists");
                }
                Ok(established)
            }
            Err(SessionError::NoStoredPassword { .. }) => {
                self.remove_session(None).await?;
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    pub fn response_table(&self) -> ResponseTable {
        self.responses
            .lock()
            .map(|table| table.clone())
            .unwrap_or_default()
    }

    pub fn clear_response_table(&self) {
        if let Ok(mut table) = self.responses.lock() {
            table.clear();
        }
    }

    /// Run a command through the scripting channel
    ///
    /// A fresh scripting session is opened per attempt and closed afterwards.
    /// Timed-out sessions (and closed pools) are retried up to the configured
    /// attempt budget; other failures become `Application` errors.
    pub async fn execute_command(&self, command: &str, options: CommandOptions) -> SessionResult<CommandOutput> {
        let session = self.current_session().await?;

        if let Some(path) = &options.input_file {
            if !path.is_file() {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("File \"{}\" does not exist", path.display()),
                )));
            }
        }

        let connector = self
            .scripting
            .as_deref()
            .ok_or_else(|| application_error!("No scripting connector configured", "session_manager"))?;

        let masked = mask_command(command);
        let password = self.password.read().await.clone();
        let options = CommandOptions {
            timeout: options.timeout.or(Some(self.config.scripting.command_timeout())),
            ..options
        };
        debug!(command = %masked, input_file = ?options.input_file, "Attempting to execute command");

        let base_url = session.base_url();
        let username = self.username.as_str();
        let password = password.as_deref();
        let command_options = &options;
        let attempt = move || async move {
            run_scripting_command(connector, base_url, username, password, command, command_options).await
        };
        let result = retry_async_if(
            attempt,
            RetryConfig::fixed(self.config.scripting.attempts, self.config.scripting.retry_delay_ms),
            "execute_command",
            ScriptingError::is_session_timeout,
        )
        .await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                debug!(
                    command = %masked,
                    input_file = ?options.input_file,
                    error = %e,
                    "Failed while executing command"
                );
                return Err(SessionError::Application {
                    message: e.to_string(),
                    response: None,
                    source: Some(Box::new(e)),
                    context: ErrorContext::new("session_manager")
                        .with_operation("execute_command")
                        .with_metadata("command", &masked),
                });
            }
        };

        if !output.is_command_result_available() {
            return Err(SessionError::NoCommandOutput {
                command: masked,
                context: ErrorContext::new("session_manager").with_operation("execute_command"),
            });
        }
        debug!(command = %masked, lines = output.lines.len(), "Command execution complete");
        Ok(output)
    }
}

async fn run_scripting_command(
    connector: &dyn ScriptingConnector,
    base_url: &str,
    username: &str,
    password: Option<&str>,
    command: &str,
    options: &CommandOptions,
) -> Result<CommandOutput, ScriptingError> {
    let scripting = connector
        .open(base_url, username, password)
        .await
        .map_err(|e| ScriptingError::SessionTimeout(e.to_string()))?;

    let timeout = options.timeout.unwrap_or(Duration::from_secs(600));
    let result = match tokio::time::timeout(timeout, scripting.execute(command, options)).await {
        Ok(result) => result,
        Err(_) => Err(ScriptingError::Failed(format!(
            "Command did not complete within {}s",
            timeout.as_secs()
        ))),
    };

    match scripting.close().await {
        Ok(()) => debug!(username = username, "Closed scripting session"),
        Err(e) if e.is_session_timeout() => {
            debug!(username = username, "Scripting session was already closed")
        }
        Err(e) => debug!(username = username, error = %e, "Failed to close scripting session"),
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ADMINISTRATOR_SESSION_KEY;
    use crate::outage::HealthProbe;
    use crate::scripting::ScriptingSession;
    use crate::transport::{ScriptedResponse, ScriptedServer};
    use async_trait::async_trait;
    use enm_session_core::{KeyValueStore, TransportError, DEFAULT_AUTH_COOKIE};
    use enm_session_store::{MemoryStore, ProcessLocks};
    use serde_json::json;
    use std::collections::{HashSet, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BASE: &str = "https://enm.example.com";

    fn config() -> Arc<SessionConfig> {
        let mut config = SessionConfig::default();
        config.server.base_url = BASE.to_string();
        config.auth.login_retry_delay_ms = 0;
        config.outage.grace_period_secs = 0;
        config.scripting.retry_delay_ms = 0;
        Arc::new(config)
    }

    fn session_cache(store: &MemoryStore) -> SessionCache {
        SessionCache::new(
            Arc::new(store.clone()),
            Arc::new(ProcessLocks::new()),
            Duration::from_secs(1),
        )
    }

    fn accept_logins(server: &ScriptedServer, token: &str) {
        server.route(
            HttpMethod::Post,
            "/login",
            ScriptedResponse::redirect("/").set_cookie(DEFAULT_AUTH_COOKIE, token),
        );
    }

    fn manager(server: &ScriptedServer) -> SessionManagerBuilder {
        SessionManager::builder("operator", config(), Arc::new(server.clone()))
            .password("secret")
            .keep_password(true)
    }

    fn logins(server: &ScriptedServer) -> usize {
        server.count(HttpMethod::Post, "/login")
    }

    struct FixedProbe {
        online: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HealthProbe for FixedProbe {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn probe(&self) -> SessionResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.online)
        }
    }

    fn outage_cache(online: bool) -> (Arc<OutageCache>, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe {
            online,
            calls: AtomicUsize::new(0),
        });
        let cache = OutageCache::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ProcessLocks::new()),
            probe.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        (Arc::new(cache), probe)
    }

    #[tokio::test]
    async fn test_fresh_login_then_request() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(HttpMethod::Get, "/x", ScriptedResponse::ok());
        let store = MemoryStore::new();
        let manager = manager(&server).session_cache(session_cache(&store)).build().unwrap();

        manager.open_session(false, None).await.unwrap();
        assert_eq!(logins(&server), 1);

        let response = manager.get("/x", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(logins(&server), 1);
        let request = server.requests().pop().unwrap();
        assert_eq!(request.cookie(DEFAULT_AUTH_COOKIE), Some("token"));

        let persisted = session_cache(&store).load("operator_session").await.unwrap().unwrap();
        assert_eq!(persisted.session_key.as_deref(), Some("token"));
        assert_eq!(persisted.password().as_deref(), Some("secret"));
    }

    #[tokio::test]
    async fn test_persisted_session_is_adopted_without_login() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(HttpMethod::Get, "/x", ScriptedResponse::ok());
        let store = MemoryStore::new();

        let first = manager(&server).session_cache(session_cache(&store)).build().unwrap();
        first.open_session(false, None).await.unwrap();
        server.reset_requests();

        let second = SessionManager::builder("operator", config(), Arc::new(server.clone()))
            .session_cache(session_cache(&store))
            .build()
            .unwrap();
        second.open_session(false, None).await.unwrap();
        second.get("/x", RequestOptions::default()).await.unwrap();

        assert_eq!(logins(&server), 0);
        assert_eq!(server.requests()[0].cookie(DEFAULT_AUTH_COOKIE), Some("token"));
    }

    #[tokio::test]
    async fn test_from_persisted_state() {
        let server = ScriptedServer::new();
        server.route(HttpMethod::Get, "/x", ScriptedResponse::ok());
        let source = manager(&server)
            .session_key("persisted")
            .safe_request(true)
            .build()
            .unwrap();
        let state = source.persisted_state().await;

        let adopted = SessionManager::from_persisted(&state, config(), Arc::new(server.clone()))
            .build()
            .unwrap();
        assert!(adopted.keep_password());
        assert!(adopted.safe_request());
        adopted.get("/x", RequestOptions::default()).await.unwrap();

        assert_eq!(logins(&server), 0);
        assert_eq!(server.requests()[0].cookie(DEFAULT_AUTH_COOKIE), Some("persisted"));
    }

    #[tokio::test]
    async fn test_expired_session_is_reestablished_once() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .enqueue(HttpMethod::Get, "/x", ScriptedResponse::status(401))
            .route(HttpMethod::Get, "/x", ScriptedResponse::ok().with_body("fresh"));
        let manager = manager(&server).build().unwrap();

        let response = manager.get("/x", RequestOptions::default()).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "fresh");
        assert_eq!(logins(&server), 2);
        assert_eq!(server.count(HttpMethod::Get, "/x"), 2);
        // The retry ran on a new transport
        assert_eq!(server.transports_created(), 2);
    }

    #[tokio::test]
    async fn test_second_session_loss_is_not_retried() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .route(HttpMethod::Get, "/x", ScriptedResponse::status(401))
            .route(HttpMethod::Get, "/y", ScriptedResponse::redirect("/login/?goto=%2Fy"))
            .route(HttpMethod::Get, "/login/", ScriptedResponse::ok());
        let manager = manager(&server).build().unwrap();

        let response = manager.get("/x", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 401);
        assert_eq!(logins(&server), 2);
        assert_eq!(server.count(HttpMethod::Get, "/x"), 2);

        let error = manager.get("/y", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(error, SessionError::AuthLost { .. }));
        assert_eq!(logins(&server), 3);
        assert_eq!(server.count(HttpMethod::Get, "/y"), 2);
    }

    #[tokio::test]
    async fn test_reestablish_can_be_disabled_per_request() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .route(HttpMethod::Get, "/x", ScriptedResponse::status(403))
            .route(HttpMethod::Put, "/y", ScriptedResponse::status(502));
        let manager = manager(&server).build().unwrap();
        let options = RequestOptions::default().without_reestablish();

        let response = manager.get("/x", options.clone()).await.unwrap();
        assert_eq!(response.status, 403);

        let response = manager
            .put("/y", RequestBody::Json(json!({"a": 1})), options)
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert_eq!(logins(&server), 1);
    }

    #[tokio::test]
    async fn test_bad_credentials_remove_persisted_entry() {
        let server = ScriptedServer::new();
        server.route(HttpMethod::Post, "/login", ScriptedResponse::redirect("/login?failed"));
        let store = MemoryStore::new();
        store
            .set("operator_session", json!({"stale": true}), None)
            .await
            .unwrap();
        let manager = manager(&server).session_cache(session_cache(&store)).build().unwrap();

        let error = manager.open_session(false, None).await.unwrap_err();

        assert!(matches!(error, SessionError::InvalidCredentials { .. }));
        assert!(!store.has_key("operator_session").await.unwrap());
        assert!(manager.session().await.is_none());
    }

    #[tokio::test]
    async fn test_reestablish_without_kept_password() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(HttpMethod::Get, "/x", ScriptedResponse::status(401));
        let manager = manager(&server).keep_password(false).build().unwrap();

        let error = manager.get("/x", RequestOptions::default()).await.unwrap_err();

        assert!(matches!(error, SessionError::NoStoredPassword { .. }));
        assert_eq!(logins(&server), 1);
        assert!(manager.persisted_state().await.encoded_password.is_none());
    }

    #[tokio::test]
    async fn test_outage_waits_and_retries_once() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(
            HttpMethod::Get,
            "/x",
            ScriptedResponse::transport_error(TransportError::connect("Network is unreachable")),
        );
        let (outage, probe) = outage_cache(false);
        let manager = manager(&server).outage_cache(outage).build().unwrap();

        let error = manager.get("/x", RequestOptions::default()).await.unwrap_err();

        assert!(matches!(error, SessionError::Connection { .. }));
        assert_eq!(server.count(HttpMethod::Get, "/x"), 2);
        assert_eq!(logins(&server), 1);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outage_retry_recovers() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .enqueue(HttpMethod::Get, "/x", ScriptedResponse::status(503))
            .route(HttpMethod::Get, "/x", ScriptedResponse::ok());
        let (outage, _) = outage_cache(false);
        let manager = manager(&server).outage_cache(outage).build().unwrap();

        let response = manager.get("/x", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(logins(&server), 1);
    }

    #[tokio::test]
    async fn test_connection_error_is_fatal_when_front_end_online() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(
            HttpMethod::Get,
            "/x",
            ScriptedResponse::transport_error(TransportError::connect("connection refused")),
        );
        let (outage, _) = outage_cache(true);
        let manager = manager(&server).outage_cache(outage).build().unwrap();

        let error = manager.get("/x", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(error, SessionError::Connection { .. }));
        assert_eq!(server.count(HttpMethod::Get, "/x"), 1);
    }

    #[tokio::test]
    async fn test_aborted_connection_reestablishes() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .enqueue(
                HttpMethod::Get,
                "/x",
                ScriptedResponse::transport_error(TransportError::aborted("connection closed before message completed")),
            )
            .route(HttpMethod::Get, "/x", ScriptedResponse::ok());
        let manager = manager(&server).build().unwrap();

        let response = manager.get("/x", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(logins(&server), 2);
    }

    #[tokio::test]
    async fn test_safe_mode_aggregates_batch() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.handle(|request| {
            let id: u32 = request.path.strip_prefix("/items/")?.parse().ok()?;
            Some(if id % 10 == 0 {
                ScriptedResponse::status(500).with_body(format!("item {} failed", id))
            } else {
                ScriptedResponse::ok()
            })
        });
        let manager = manager(&server).safe_request(true).build().unwrap();

        for n in 1..=100 {
            let response = manager
                .get(&format!("/items/{}", n), RequestOptions::default())
                .await
                .unwrap();
            assert_eq!(response.status, if n % 10 == 0 { 500 } else { 200 });
        }

        let table = manager.response_table();
        assert_eq!(table.len(), 1);
        let stats = table.get(HttpMethod::Get, "/items/<id>").unwrap();
        assert_eq!(stats.success, 90);
        assert_eq!(stats.failure, 10);
        assert_eq!(stats.errors.len(), 1);
        assert_eq!(stats.errors[&500].body, "item 10 failed");

        manager.clear_response_table();
        assert!(manager.response_table().is_empty());
    }

    #[tokio::test]
    async fn test_safe_mode_never_counts_401() {
        let server = ScriptedServer::new();
        let issued = Arc::new(AtomicUsize::new(0));
        let revoked = Arc::new(std::sync::Mutex::new(HashSet::new()));
        server.handle(move |request| match (request.method, request.path.as_str()) {
            (HttpMethod::Post, "/login") => {
                let token = format!("token-{}", issued.fetch_add(1, Ordering::SeqCst) + 1);
                Some(ScriptedResponse::redirect("/").set_cookie(DEFAULT_AUTH_COOKIE, token))
            }
            (HttpMethod::Get, "/a") => {
                let token = request.cookie(DEFAULT_AUTH_COOKIE)?.to_string();
                // Every token is good for one call
                let fresh = revoked.lock().ok()?.insert(token);
                Some(ScriptedResponse::status(if fresh { 200 } else { 401 }))
            }
            _ => None,
        });
        let manager = manager(&server).safe_request(true).build().unwrap();

        for _ in 0..5 {
            let response = manager.get("/a", RequestOptions::default()).await.unwrap();
            assert_eq!(response.status, 200);
        }

        let table = manager.response_table();
        let stats = table.get(HttpMethod::Get, "/a").unwrap();
        assert_eq!(stats.success, 5);
        assert_eq!(stats.failure, 0);
        assert!(stats.errors.is_empty());
        assert_eq!(logins(&server), 5);
    }

    #[tokio::test]
    async fn test_safe_mode_converts_failures() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server
            .route(HttpMethod::Get, "/missing/12", ScriptedResponse::status(404))
            .route(HttpMethod::Delete, "/gone", ScriptedResponse::status(404))
            .route(
                HttpMethod::Get,
                "/down",
                ScriptedResponse::transport_error(TransportError::connect("connection refused")),
            );
        let manager = manager(&server).safe_request(true).build().unwrap();

        let response = manager.get("/missing/12", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 404);

        let response = manager.get("/down", RequestOptions::default()).await.unwrap();
        assert_eq!(response.status, 599);
        assert!(response.synthesized);

        let response = manager
            .delete("/gone", RequestOptions::default().ignore_status(404))
            .await
            .unwrap();
        assert_eq!(response.status, 404);

        let table = manager.response_table();
        assert_eq!(table.get(HttpMethod::Get, "/missing/<id>").unwrap().failure, 1);
        assert_eq!(table.get(HttpMethod::Get, "/down").unwrap().errors.len(), 1);
        assert!(table.get(HttpMethod::Delete, "/gone").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_session_loss_shares_one_login() {
        let server = ScriptedServer::new();
        accept_logins(&server, "fresh");
        server.handle(|request| {
            if request.method != HttpMethod::Get {
                return None;
            }
            let fresh = request.cookie(DEFAULT_AUTH_COOKIE) == Some("fresh");
            Some(ScriptedResponse::status(if fresh { 200 } else { 401 }))
        });
        let manager = manager(&server).session_key("stale").build().unwrap();

        let responses = futures::future::join_all(
            (0..8).map(|_| manager.get("/x", RequestOptions::default())),
        )
        .await;

        assert!(responses
            .iter()
            .all(|response| matches!(response, Ok(response) if response.status == 200)));
        assert_eq!(logins(&server), 1);
    }

    #[tokio::test]
    async fn test_remove_session_logs_out_and_forgets() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(HttpMethod::Get, "/logout", ScriptedResponse::ok());
        let store = MemoryStore::new();
        let manager = manager(&server)
            .persistence_key(ADMINISTRATOR_SESSION_KEY)
            .session_cache(session_cache(&store))
            .build()
            .unwrap();

        manager.open_session(false, None).await.unwrap();
        assert!(store.has_key(ADMINISTRATOR_SESSION_KEY).await.unwrap());

        manager.remove_session(None).await.unwrap();

        assert_eq!(server.count(HttpMethod::Get, "/logout"), 1);
        assert!(!store.has_key(ADMINISTRATOR_SESSION_KEY).await.unwrap());
        assert!(manager.session().await.is_none());
        assert!(manager.session_key().await.is_none());
    }

    #[tokio::test]
    async fn test_is_session_established() {
        let server = ScriptedServer::new();
        accept_logins(&server, "token");
        server.route(
            HttpMethod::Get,
            "/oss/idm/usermanagement/users/operator",
            ScriptedResponse::json(200, json!({"username": "operator"})),
        );
        let manager = manager(&server).build().unwrap();
        assert!(manager.is_session_established(None).await.unwrap());

        let without_password = SessionManager::builder("operator", config(), Arc::new(server.clone()))
            .build()
            .unwrap();
        assert!(!without_password.is_session_established(None).await.unwrap());
    }

    #[test]
    fn test_verify_json_response() {
        let response = HttpResponse::new(HttpMethod::Get, "https://enm/x", 200).with_body("<html>");
        let error = verify_json_response(&response).unwrap_err();
        assert!(matches!(error, SessionError::Application { .. }));
        assert_eq!(error.response().unwrap().body, "<html>");

        let response = HttpResponse::new(HttpMethod::Get, "https://enm/x", 200).with_json(&json!({"a": 1}));
        assert_eq!(verify_json_response(&response).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_empty_username_is_rejected() {
        let server = ScriptedServer::new();
        let result = SessionManager::builder(" ", config(), Arc::new(server)).build();
        assert!(matches!(result, Err(SessionError::Config { .. })));
    }

    struct FakeConnector {
        results: std::sync::Mutex<VecDeque<Result<CommandOutput, ScriptingError>>>,
        opened: AtomicUsize,
        closed: Arc<AtomicUsize>,
        commands: Arc<std::sync::Mutex<Vec<String>>>,
    }

    impl FakeConnector {
        fn new(results: Vec<Result<CommandOutput, ScriptingError>>) -> Arc<Self> {
            Arc::new(Self {
                results: std::sync::Mutex::new(results.into()),
                opened: AtomicUsize::new(0),
                closed: Arc::new(AtomicUsize::new(0)),
                commands: Arc::new(std::sync::Mutex::new(Vec::new())),
            })
        }
    }

    struct FakeScripting {
        result: std::sync::Mutex<Option<Result<CommandOutput, ScriptingError>>>,
        closed: Arc<AtomicUsize>,
        commands: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ScriptingSession for FakeScripting {
        async fn execute(&self, command: &str, _options: &CommandOptions) -> Result<CommandOutput, ScriptingError> {
            self.commands.lock().unwrap().push(command.to_string());
            self.result
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(CommandOutput::default()))
        }

        async fn close(&self) -> Result<(), ScriptingError> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl ScriptingConnector for FakeConnector {
        async fn open(
            &self,
            _base_url: &str,
            username: &str,
            _password: Option<&str>,
        ) -> Result<Box<dyn ScriptingSession>, ScriptingError> {
            assert_eq!(username, "operator");
            self.opened.fetch_add(1, Ordering::SeqCst);
            let result = self.results.lock().unwrap().pop_front();
            Ok(Box::new(FakeScripting {
                result: std::sync::Mutex::new(result),
                closed: Arc::clone(&self.closed),
                commands: Arc::clone(&self.commands),
            }))
        }
    }

    fn scripted_manager(server: &ScriptedServer, connector: Arc<FakeConnector>) -> SessionManager {
        accept_logins(server, "token");
        manager(server).scripting(connector).build().unwrap()
    }

    #[tokio::test]
    async fn test_command_retries_on_session_timeout() {
        let server = ScriptedServer::new();
        let connector = FakeConnector::new(vec![
            Err(ScriptingError::SessionTimeout("Redirected to login".into())),
            Err(ScriptingError::Failed("ClosedPoolError: Pool is closed.".into())),
            Ok(CommandOutput::new(["FDN : NetworkElement=1", "1 instance(s)"])),
        ]);
        let manager = scripted_manager(&server, connector.clone());

        let output = manager
            .execute_command("cmedit get * NetworkElement", CommandOptions::default())
            .await
            .unwrap();

        assert_eq!(output.lines.len(), 2);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_command_failures_are_application_errors() {
        let server = ScriptedServer::new();
        let connector = FakeConnector::new(vec![Err(ScriptingError::Failed("Error 1000: bad syntax".into()))]);
        let manager = scripted_manager(&server, connector.clone());

        let error = manager
            .execute_command("cmedit gte", CommandOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(error, SessionError::Application { .. }));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(connector.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_timeouts_are_bounded() {
        let server = ScriptedServer::new();
        let connector = FakeConnector::new(
            (0..10)
                .map(|_| Err(ScriptingError::SessionTimeout("expired".into())))
                .collect(),
        );
        let manager = scripted_manager(&server, connector.clone());

        let error = manager
            .execute_command("cmedit get *", CommandOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(error, SessionError::Application { .. }));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_empty_command_output_is_masked() {
        let server = ScriptedServer::new();
        let connector = FakeConnector::new(vec![Ok(CommandOutput::default())]);
        let manager = scripted_manager(&server, connector.clone());

        let error = manager
            .execute_command("user create -n op password Secr3t!", CommandOptions::default())
            .await
            .unwrap_err();

        match error {
            SessionError::NoCommandOutput { command, .. } => {
                assert_eq!(command, "user create -n op password ********");
            }
            other => panic!("unexpected error {other:?}"),
        }
        // The real command still reaches the scripting session
        assert_eq!(
            connector.commands.lock().unwrap()[0],
            "user create -n op password Secr3t!"
        );
    }

    #[tokio::test]
    async fn test_missing_input_file() {
        let server = ScriptedServer::new();
        let connector = FakeConnector::new(vec![]);
        let manager = scripted_manager(&server, connector.clone());
        let options = CommandOptions {
            input_file: Some("/nonexistent/import.txt".into()),
            ..CommandOptions::default()
        };

        let error = manager.execute_command("cmedit import", options).await.unwrap_err();

        match error {
            SessionError::Io(e) => {
                assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
                assert_eq!(e.to_string(), "File \"/nonexistent/import.txt\" does not exist");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(connector.opened.load(Ordering::SeqCst), 0);
    }
}
