//! reqwest-backed transport

use super::{HttpRequest, HttpTransport, TransportFactory};
use async_trait::async_trait;
use chrono::Utc;
use cookie::Cookie;
use enm_session_core::{
    ConnectionKind, ErrorContext, HttpResponse, RequestBody, ServerConfig, SessionError,
    SessionResult, TransportError,
};
use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// Cookie jar shared by the clients of one transport
///
/// A transport is bound to a single server, so cookies are keyed by name only.
#[derive(Debug, Default)]
pub struct SessionCookies {
    jar: RwLock<BTreeMap<String, String>>,
}

impl SessionCookies {
    pub fn get(&self, name: &str) -> Option<String> {
        self.jar.read().ok()?.get(name).cloned()
    }

    pub fn insert(&self, name: &str, value: &str) {
        if let Ok(mut jar) = self.jar.write() {
            jar.insert(name.to_string(), value.to_string());
        }
    }

    pub fn clear(&self) {
        if let Ok(mut jar) = self.jar.write() {
            jar.clear();
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.jar
            .read()
            .map(|jar| jar.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Parse one `Set-Cookie` header into (name, value, expired)
pub(crate) fn parse_set_cookie(raw: &str) -> Option<(String, String, bool)> {
    let cookie = Cookie::parse(raw).ok()?;
    let now = Utc::now().timestamp();
    let expired = cookie.max_age().is_some_and(|age| age.whole_seconds() <= 0)
        || cookie
            .expires_datetime()
            .is_some_and(|expires| expires.unix_timestamp() <= now);

    Some((
        cookie.name().to_string(),
        cookie.value().trim_matches('"').to_string(),
        expired,
    ))
}

impl CookieStore for SessionCookies {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, _url: &url::Url) {
        let Ok(mut jar) = self.jar.write() else {
            return;
        };
        for header in cookie_headers {
            let Ok(raw) = header.to_str() else {
                continue;
            };
            if let Some((name, value, expired)) = parse_set_cookie(raw) {
                trace!(cookie = %name, expired = expired, "Cookie received");
                if expired {
                    jar.remove(&name);
                } else {
                    jar.insert(name, value);
                }
            }
        }
    }

    fn cookies(&self, _url: &url::Url) -> Option<HeaderValue> {
        let jar = self.jar.read().ok()?;
        if jar.is_empty() {
            return None;
        }
        let header = jar
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&header).ok()
    }
}

/// Transport built on reqwest clients sharing one cookie jar
///
/// reqwest fixes redirect and certificate policy per client, so one client is
/// kept for each combination a request may ask for.
#[derive(Debug)]
pub struct ReqwestTransport {
    cookies: Arc<SessionCookies>,
    /// Indexed by `verify_tls as usize * 2 + follow_redirects as usize`
    clients: [reqwest::Client; 4],
}

impl ReqwestTransport {
    pub fn new(settings: &TransportSettings) -> SessionResult<Self> {
        let cookies = Arc::new(SessionCookies::default());
        let build = |verify_tls: bool, follow_redirects: bool| {
            create_http_client(settings, Arc::clone(&cookies), verify_tls, follow_redirects)
        };
        let clients = [
            build(false, false)?,
            build(false, true)?,
            build(true, false)?,
            build(true, true)?,
        ];
        Ok(Self { cookies, clients })
    }

    fn client(&self, verify_tls: bool, follow_redirects: bool) -> &reqwest::Client {
        &self.clients[(verify_tls as usize) * 2 + follow_redirects as usize]
    }
}

/// Settings shared by every client a factory builds
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
}

impl From<&ServerConfig> for TransportSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            headers: BTreeMap::new(),
        }
    }
}

fn client_error(message: String, source: Option<Box<dyn std::error::Error + Send + Sync>>) -> SessionError {
    SessionError::Config {
        message,
        source,
        context: ErrorContext::new("http_client").with_operation("create_client"),
    }
}

/// Helper function to create an HTTP client with common configuration
fn create_http_client(
    settings: &TransportSettings,
    cookies: Arc<SessionCookies>,
    verify_tls: bool,
    follow_redirects: bool,
) -> SessionResult<reqwest::Client> {
    let mut headers = HeaderMap::new();
    for (key, value) in &settings.headers {
        let header_name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| {
            client_error(format!("Invalid header name '{}': {}", key, e), Some(Box::new(e)))
        })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            client_error(format!("Invalid header value for '{}': {}", key, e), Some(Box::new(e)))
        })?;
        headers.insert(header_name, header_value);
    }

    let redirect = if follow_redirects {
        reqwest::redirect::Policy::limited(10)
    } else {
        reqwest::redirect::Policy::none()
    };

    reqwest::Client::builder()
        .user_agent(settings.user_agent.clone())
        .default_headers(headers)
        .cookie_provider(cookies)
        .redirect(redirect)
        .danger_accept_invalid_certs(!verify_tls)
        .build()
        .map_err(|e| client_error(format!("Failed to create HTTP client: {}", e), Some(Box::new(e))))
}

/// Flatten an error and its sources into one message
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

fn classify_error(error: reqwest::Error) -> TransportError {
    let message = error_chain(&error);
    let lowered = message.to_ascii_lowercase();
    let kind = if error.is_timeout() {
        ConnectionKind::Timeout
    } else if error.is_connect() {
        ConnectionKind::Connect
    } else if lowered.contains("connection closed")
        || lowered.contains("connection reset")
        || lowered.contains("incomplete message")
        || lowered.contains("aborted")
    {
        ConnectionKind::Aborted
    } else {
        ConnectionKind::Other
    };
    TransportError::new(kind, message)
}

fn to_reqwest_method(method: enm_session_core::HttpMethod) -> reqwest::Method {
    use enm_session_core::HttpMethod;
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Head => reqwest::Method::HEAD,
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let client = self.client(request.verify_tls, request.follow_redirects);
        let mut builder = client
            .request(to_reqwest_method(request.method), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Form(fields) => builder.form(&fields),
            RequestBody::Text(text) => builder.body(text),
        };

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status();
        let url = response.url().to_string();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(classify_error)?;

        debug!(
            method = %request.method,
            url = %url,
            status = status.as_u16(),
            "HTTP exchange completed"
        );

        Ok(HttpResponse {
            method: request.method,
            url,
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
            synthesized: false,
        })
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.get(name)
    }

    fn set_cookie(&self, name: &str, value: &str) {
        self.cookies.insert(name, value);
    }

    fn clear_cookies(&self) {
        self.cookies.clear();
    }

    fn close(&self) {
        self.cookies.clear();
    }
}

/// Builds a `ReqwestTransport` per session
#[derive(Debug, Clone)]
pub struct ReqwestTransportFactory {
    settings: TransportSettings,
}

impl ReqwestTransportFactory {
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(TransportSettings::from(config))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.settings.headers.insert(name.into(), value.into());
        self
    }
}

impl TransportFactory for ReqwestTransportFactory {
    fn create(&self, _base_url: &str) -> SessionResult<Arc<dyn HttpTransport>> {
        Ok(Arc::new(ReqwestTransport::new(&self.settings)?))
    }
}
