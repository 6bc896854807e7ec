//! HTTP transport seam
//!
//! A `Session` talks to the server through an `HttpTransport`, which owns the
//! cookie jar and performs exactly one exchange per call. Each session gets a
//! fresh transport from a `TransportFactory`, so a re-established session never
//! inherits cookies from the one it replaces.

use async_trait::async_trait;
use enm_session_core::{HttpMethod, HttpResponse, RequestBody, SessionResult, TransportError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod http;
pub mod scripted;

pub use http::{ReqwestTransport, ReqwestTransportFactory, SessionCookies};
pub use scripted::{RecordedRequest, ScriptedResponse, ScriptedServer, ScriptedTransport};

/// Fully resolved request handed to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Absolute URL
    pub url: String,
    pub body: RequestBody,
    pub headers: BTreeMap<String, String>,
    pub timeout: Duration,
    pub verify_tls: bool,
    pub follow_redirects: bool,
}

/// One cookie-bearing connection context towards a server
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform one exchange, following redirects only when the request asks for it
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    fn cookie(&self, name: &str) -> Option<String>;

    fn set_cookie(&self, name: &str, value: &str);

    fn clear_cookies(&self);

    /// Release pooled connections; the transport is not used afterwards
    fn close(&self) {}
}

/// Creates a fresh transport for every new session
pub trait TransportFactory: Send + Sync {
    fn create(&self, base_url: &str) -> SessionResult<Arc<dyn HttpTransport>>;
}
