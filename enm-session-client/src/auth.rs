//! Login and logout handshake

use crate::session::Session;
use async_trait::async_trait;
use enm_session_core::{
    retry_async_if, AuthConfig, ConnectionKind, ErrorContext, HttpResponse, RequestBody, RequestOptions,
    RetryConfig, SessionError, SessionResult,
};
use std::sync::Mutex;
use tracing::{debug, info};

/// Strategy that turns an unauthenticated session into an authenticated one
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn username(&self) -> &str;

    async fn authenticate(&self, session: &Session) -> SessionResult<()>;

    /// Best effort; failures are logged and swallowed
    async fn logout(&self, session: &Session);
}

/// Form login with `IDToken1`/`IDToken2`
pub struct UsernamePassword {
    username: String,
    /// Dropped after the first successful login
    password: Mutex<Option<String>>,
    config: AuthConfig,
}

impl std::fmt::Debug for UsernamePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsernamePassword")
            .field("username", &self.username)
            .field("password", &"********")
            .finish()
    }
}

/// Remediation message for a login answered with a password-policy code
pub fn password_change_message(body: &str, username: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("code").and_then(|code| code.as_str()) {
        Some("PASSWORD_RESET") => Some(format!(
            "Invalid login, password change required for user {}. Please change it via ENM login page",
            username
        )),
        Some("PASSWORD_EXPIRE") => {
            Some("ENM is requesting a password change - disable password ageing".to_string())
        }
        _ => None,
    }
}

fn is_retryable_login_error(error: &SessionError) -> bool {
    matches!(
        error,
        SessionError::Connection { .. }
            | SessionError::InvalidCredentials { .. }
            | SessionError::RequestFailed { .. }
    )
}

impl UsernamePassword {
    pub fn new(username: &str, password: Option<String>, config: AuthConfig) -> Self {
        Self {
            username: username.to_string(),
            password: Mutex::new(password),
            config,
        }
    }

    pub fn has_password(&self) -> bool {
        self.password
            .lock()
            .map(|password| password.is_some())
            .unwrap_or(false)
    }

    fn invalid_credentials(&self, response: HttpResponse) -> SessionError {
        SessionError::InvalidCredentials {
            username: self.username.clone(),
            response: Some(Box::new(response)),
            context: ErrorContext::new("authenticator")
                .with_operation("login")
                .with_metadata("username", &self.username)
                .with_suggestion("Check the username and password"),
        }
    }

    async fn attempt_login(&self, session: &Session, password: &str) -> SessionResult<()> {
        let body = RequestBody::form([("IDToken1", self.username.as_str()), ("IDToken2", password)]);
        let options = RequestOptions::default()
            .with_allow_redirects(false)
            .with_timeout(self.config.login_timeout());

        let response = session
            .post(&self.config.login_path, body, &options)
            .await
            .map_err(|e| {
                debug!(error = %e, "Login request raised an error");
                // Status failures keep their response; only transport failures are rewrapped
                let kind = match &e {
                    SessionError::Connection { kind, .. } => *kind,
                    SessionError::Timeout { .. } => ConnectionKind::Timeout,
                    _ => return e,
                };
                SessionError::Connection {
                    message: e.to_string(),
                    kind,
                    context: ErrorContext::new("authenticator").with_operation("login"),
                }
            })?;

        if (300..400).contains(&response.status) {
            if session.cookie(&self.config.cookie_name).is_none() {
                return Err(self.invalid_credentials(response));
            }
        } else {
            debug!(
                status = response.status,
                body = %response.body,
                "Login server answered without a redirect"
            );
            if response.status == 200 {
                if let Some(message) = password_change_message(&response.body, &self.username) {
                    return Err(SessionError::PasswordPolicy {
                        message,
                        username: self.username.clone(),
                        response: Box::new(response),
                        context: ErrorContext::new("authenticator")
                            .with_operation("login")
                            .with_suggestion("Change the password through the ENM login page"),
                    });
                }
            }
            response.raise_for_status()?;
        }
        Ok(())
    }
}

#[async_trait]
impl Authenticator for UsernamePassword {
    fn username(&self) -> &str {
        &self.username
    }

    async fn authenticate(&self, session: &Session) -> SessionResult<()> {
        let password = self
            .password
            .lock()
            .ok()
            .and_then(|password| password.clone())
            .ok_or_else(|| SessionError::NoStoredPassword {
                username: self.username.clone(),
                context: ErrorContext::new("authenticator").with_operation("login"),
            })?;

        debug!(username = %self.username, "Authenticating user");
        let password = password.as_str();
        let login = move || async move { self.attempt_login(session, password).await };
        retry_async_if(
            login,
            RetryConfig::fixed(self.config.login_attempts, self.config.login_retry_delay_ms),
            "login",
            is_retryable_login_error,
        )
        .await?;

        if let Ok(mut stored) = self.password.lock() {
            *stored = None;
        }
        info!(
            username = %self.username,
            base_url = %session.base_url(),
            "Session opened and user authenticated"
        );
        Ok(())
    }

    async fn logout(&self, session: &Session) {
        let options = RequestOptions::default().with_allow_redirects(true);
        match session.get(&self.config.logout_path, &options).await {
            Ok(_) => debug!(username = %self.username, "Logged out"),
            Err(e) => debug!(username = %self.username, error = %e, "Logout failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedResponse, ScriptedServer, TransportFactory};
    use enm_session_core::{HttpMethod, SessionConfig, TransportError};
    use serde_json::json;
    use std::sync::Arc;

    const BASE: &str = "https://enm.example.com";
    const COOKIE: &str = "iPlanetDirectoryPro";

    fn config() -> SessionConfig {
        let mut config = SessionConfig::default();
        config.auth.login_retry_delay_ms = 0;
        config
    }

    fn session(server: &ScriptedServer) -> Session {
        Session::new(BASE, server.create(BASE).unwrap(), &config())
    }

    fn authenticator(password: &str) -> Arc<UsernamePassword> {
        Arc::new(UsernamePassword::new("operator", Some(password.to_string()), config().auth))
    }

    #[tokio::test]
    async fn test_successful_login_drops_password() {
        let server = ScriptedServer::new();
        server.route(
            HttpMethod::Post,
            "/login",
            ScriptedResponse::redirect("/").set_cookie(COOKIE, "token"),
        );
        let session = session(&server);
        let authenticator = authenticator("secret");

        session.open_session(authenticator.clone()).await.unwrap();

        assert_eq!(session.auth_cookie(), Some("token".to_string()));
        assert!(!authenticator.has_password());
        let login = &server.requests()[0];
        assert_eq!(login.body.form_value("IDToken1"), Some("operator"));
        assert_eq!(login.body.form_value("IDToken2"), Some("secret"));
        assert!(!login.follow_redirects);
    }

    #[tokio::test]
    async fn test_redirect_without_cookie_is_invalid_credentials() {
        let server = ScriptedServer::new();
        server.route(HttpMethod::Post, "/login", ScriptedResponse::redirect("/login?failed"));
        let session = session(&server);

        let error = session.open_session(authenticator("wrong")).await.unwrap_err();

        assert!(matches!(error, SessionError::InvalidCredentials { .. }));
        assert_eq!(
            error.to_string(),
            "Invalid login, credentials are invalid for user operator"
        );
        assert_eq!(server.count(HttpMethod::Post, "/login"), 4);
    }

    #[tokio::test]
    async fn test_password_policy_is_not_retried() {
        let server = ScriptedServer::new();
        server.route(
            HttpMethod::Post,
            "/login",
            ScriptedResponse::json(200, json!({"code": "PASSWORD_RESET"})),
        );
        let session = session(&server);

        let error = session.open_session(authenticator("secret")).await.unwrap_err();

        assert!(matches!(error, SessionError::PasswordPolicy { .. }));
        assert_eq!(
            error.to_string(),
            "Invalid login, password change required for user operator. Please change it via ENM login page"
        );
        assert_eq!(server.count(HttpMethod::Post, "/login"), 1);
    }

    #[tokio::test]
    async fn test_connection_errors_are_retried() {
        let server = ScriptedServer::new();
        server
            .enqueue(
                HttpMethod::Post,
                "/login",
                ScriptedResponse::transport_error(TransportError::connect("connection refused")),
            )
            .enqueue(HttpMethod::Post, "/login", ScriptedResponse::status(503))
            .route(
                HttpMethod::Post,
                "/login",
                ScriptedResponse::redirect("/").set_cookie(COOKIE, "token"),
            );
        let session = session(&server);

        session.open_session(authenticator("secret")).await.unwrap();
        assert_eq!(server.count(HttpMethod::Post, "/login"), 3);
    }

    #[tokio::test]
    async fn test_login_status_failure_keeps_response() {
        let server = ScriptedServer::new();
        server.route(HttpMethod::Post, "/login", ScriptedResponse::status(404));
        let session = session(&server);

        let error = session.open_session(authenticator("secret")).await.unwrap_err();

        assert!(matches!(error, SessionError::RequestFailed { .. }));
        assert_eq!(error.status_code(), Some(404));
        assert_eq!(error.response().map(|response| response.method), Some(HttpMethod::Post));
        assert_eq!(server.count(HttpMethod::Post, "/login"), 4);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let server = ScriptedServer::new();
        server.route(
            HttpMethod::Post,
            "/login",
            ScriptedResponse::transport_error(TransportError::connect("connection refused")),
        );
        let session = session(&server);

        let error = session.open_session(authenticator("secret")).await.unwrap_err();
        assert!(matches!(error, SessionError::Connection { kind: ConnectionKind::Connect, .. }));
        assert_eq!(server.count(HttpMethod::Post, "/login"), 4);
    }

    #[tokio::test]
    async fn test_missing_password() {
        let server = ScriptedServer::new();
        let session = session(&server);
        let authenticator = Arc::new(UsernamePassword::new("operator", None, config().auth));

        let error = session.open_session(authenticator).await.unwrap_err();
        assert!(matches!(error, SessionError::NoStoredPassword { .. }));
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_logout_never_fails() {
        let server = ScriptedServer::new();
        server.route(
            HttpMethod::Get,
            "/logout",
            ScriptedResponse::transport_error(TransportError::connect("connection refused")),
        );
        let session = session(&server);

        authenticator("secret").logout(&session).await;
        assert_eq!(server.count(HttpMethod::Get, "/logout"), 1);
    }

    #[test]
    fn test_password_change_messages() {
        assert_eq!(
            password_change_message(r#"{"code":"PASSWORD_EXPIRE"}"#, "operator").as_deref(),
            Some("ENM is requesting a password change - disable password ageing")
        );
        assert!(password_change_message(r#"{"code":"OK"}"#, "operator").is_none());
        assert!(password_change_message("<html>", "operator").is_none());
    }
}
