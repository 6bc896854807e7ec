//! Cookie-bearing HTTP session bound to one server
//!
//! Every verb goes through [`Session::request`], which applies the same two
//! failure rules: a bounce to the login page raises `AuthLost`, and a status
//! from [`RETRY_STATUS_CODES`] (or an aborted connection) raises
//! `RequestFailed`. Any other status is handed back untouched.

use crate::auth::{Authenticator, UsernamePassword};
use crate::transport::{HttpRequest, HttpTransport};
use enm_session_core::{
    AuthConfig, ConnectionKind, HttpMethod, HttpResponse, RequestBody, RequestOptions, SessionConfig,
    SessionError, SessionResult,
};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Statuses the server uses for failures worth retrying at a higher level
pub const RETRY_STATUS_CODES: [u16; 9] = [400, 404, 405, 406, 415, 501, 502, 503, 504];

/// Fragment of the URL the server bounces unauthenticated requests to
pub const LOGIN_REDIRECT_MARKER: &str = "login/?goto";

/// Verbs that do not follow redirects unless asked to, and are therefore
/// exempt from redirect-to-login detection
fn keeps_redirects(method: HttpMethod) -> bool {
    matches!(method, HttpMethod::Post | HttpMethod::Head)
}

pub struct Session {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    auth: AuthConfig,
    request_timeout: Duration,
    verify_tls: bool,
    /// One exchange at a time per cookie jar
    request_lock: Mutex<()>,
    authenticator: RwLock<Option<Arc<dyn Authenticator>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl Session {
    pub fn new(base_url: &str, transport: Arc<dyn HttpTransport>, config: &SessionConfig) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
            auth: config.auth.clone(),
            request_timeout: config.server.request_timeout(),
            verify_tls: config.server.verify_tls,
            request_lock: Mutex::new(()),
            authenticator: RwLock::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Resolve a relative URL against the base URL; absolute URLs pass through
    pub fn url_for(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else if url.starts_with('/') {
            format!("{}{}", self.base_url, url)
        } else {
            format!("{}/{}", self.base_url, url)
        }
    }

    pub fn auth_config(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        self.transport.cookie(name)
    }

    /// Value of the auth cookie, if the session holds one
    pub fn auth_cookie(&self) -> Option<String> {
        self.transport.cookie(&self.auth.cookie_name)
    }

    /// Seed the auth cookie from persisted state instead of logging in
    pub fn adopt_auth_cookie(&self, value: &str) {
        self.transport.set_cookie(&self.auth.cookie_name, value);
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth_cookie().is_some()
    }

    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.authenticator.read().ok()?.clone()
    }

    /// Authenticate through `authenticator` and remember it for logout
    pub async fn open_session(&self, authenticator: Arc<dyn Authenticator>) -> SessionResult<()> {
        if let Ok(mut slot) = self.authenticator.write() {
            *slot = Some(Arc::clone(&authenticator));
        }
        authenticator.authenticate(self).await
    }

    /// Log out (best effort), then drop every cookie and the connection pool
    ///
    /// Without a remembered authenticator, `username` and `password` are used
    /// to build one for the logout call.
    pub async fn close_session(&self, username: Option<&str>, password: Option<&str>) {
        debug!(base_url = %self.base_url, "Closing session");
        let authenticator = match (self.authenticator(), username, password) {
            (Some(authenticator), _, _) => Some(authenticator),
            (None, Some(username), Some(password)) => Some(Arc::new(UsernamePassword::new(
                username,
                Some(password.to_string()),
                self.auth.clone(),
            )) as Arc<dyn Authenticator>),
            _ => None,
        };
        if let Some(authenticator) = authenticator {
            authenticator.logout(self).await;
        }
        self.transport.clear_cookies();
        self.transport.close();
        debug!(base_url = %self.base_url, "Session is closed");
    }

    fn retryable_failure(response: HttpResponse) -> SessionError {
        let message = format!(
            "Failed to make request, status code:: [{}] Reason:: [{}], Message: [{}]",
            response.status,
            response.reason,
            response.user_message()
        );
        debug!(
            method = %response.method,
            url = %response.url,
            status = response.status,
            "Request has failed"
        );
        SessionError::request_failed(message, response)
    }

    /// Perform one exchange and classify the result
    pub async fn request(
        &self,
        method: HttpMethod,
        url: &str,
        body: RequestBody,
        options: &RequestOptions,
    ) -> SessionResult<HttpResponse> {
        let url = self.url_for(url);
        let request = HttpRequest {
            method,
            url: url.clone(),
            body,
            headers: options.headers.clone(),
            timeout: options.timeout.unwrap_or(self.request_timeout),
            verify_tls: options.verify_tls.unwrap_or(self.verify_tls),
            follow_redirects: options.allow_redirects.unwrap_or(!keeps_redirects(method)),
        };

        let outcome = {
            let _guard = self.request_lock.lock().await;
            self.transport.execute(request).await
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(error) if error.kind == ConnectionKind::Aborted => {
                let cause = format!("('Connection aborted.', {})", error.message);
                return Err(Self::retryable_failure(HttpResponse::failed(method, &url, &cause)));
            }
            Err(error) => {
                debug!(method = %method, url = %url, error = %error, "Request raised a transport error");
                return Err(error.into());
            }
        };

        if !keeps_redirects(method)
            && options.allow_redirects != Some(true)
            && (response.url.contains(LOGIN_REDIRECT_MARKER) || response.is_redirect())
        {
            response.status = 302;
            debug!(method = %method, url = %url, "Request was redirected to the login page");
            return Err(SessionError::auth_lost(response));
        }

        if RETRY_STATUS_CODES.contains(&response.status) {
            return Err(Self::retryable_failure(response));
        }

        debug!(method = %method, url = %url, status = response.status, "Completed request");
        Ok(response)
    }

    pub async fn get(&self, url: &str, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Get, url, RequestBody::Empty, options).await
    }

    pub async fn head(&self, url: &str, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Head, url, RequestBody::Empty, options).await
    }

    pub async fn delete(&self, url: &str, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Delete, url, RequestBody::Empty, options).await
    }

    pub async fn post(&self, url: &str, body: RequestBody, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Post, url, body, options).await
    }

    pub async fn put(&self, url: &str, body: RequestBody, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Put, url, body, options).await
    }

    pub async fn patch(&self, url: &str, body: RequestBody, options: &RequestOptions) -> SessionResult<HttpResponse> {
        self.request(HttpMethod::Patch, url, body, options).await
    }
}
