//! In-memory transport driven by scripted responses
//!
//! `ScriptedServer` plays the remote side for protocol tests: responses are
//! queued per route (or produced by a handler), every exchange is recorded and
//! each transport it creates keeps its own cookie jar, just like the reqwest
//! transport does.

use super::{HttpRequest, HttpTransport, TransportFactory};
use async_trait::async_trait;
use enm_session_core::{HttpMethod, HttpResponse, RequestBody, SessionResult, TransportError};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MAX_REDIRECTS: usize = 10;

/// Canned answer for one exchange
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptedResponse {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    /// Cookies to set (`Some`) or expire (`None`)
    pub cookies: Vec<(String, Option<String>)>,
    /// Final URL reported to the caller, defaults to the request URL
    pub url: Option<String>,
    pub error: Option<TransportError>,
}

impl ScriptedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            reason: canonical_reason(status).to_string(),
            headers: BTreeMap::new(),
            body: String::new(),
            cookies: Vec::new(),
            url: None,
            error: None,
        }
    }

    pub fn ok() -> Self {
        Self::status(200)
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::status(status)
            .with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    /// 302 pointing at `location`
    pub fn redirect(location: impl Into<String>) -> Self {
        Self::status(302).with_header("location", location)
    }

    /// The exchange fails before any response is read
    pub fn transport_error(error: TransportError) -> Self {
        let mut response = Self::status(0);
        response.error = Some(error);
        response
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

    pub fn set_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.push((name.into(), Some(value.into())));
        self
    }

    pub fn clear_cookie(mut self, name: impl Into<String>) -> Self {
        self.cookies.push((name.into(), None));
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

fn canonical_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

/// One exchange as seen by the server
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub path: String,
    pub body: RequestBody,
    pub headers: BTreeMap<String, String>,
    /// Cookies the client sent
    pub cookies: BTreeMap<String, String>,
    pub follow_redirects: bool,
    /// Which transport issued the request, in creation order starting at 1
    pub transport_id: usize,
}

impl RecordedRequest {
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }
}

type Handler = Box<dyn Fn(&RecordedRequest) -> Option<ScriptedResponse> + Send + Sync>;

#[derive(Default)]
struct ServerState {
    queued: Mutex<HashMap<(HttpMethod, String), VecDeque<ScriptedResponse>>>,
    routes: Mutex<HashMap<(HttpMethod, String), ScriptedResponse>>,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<RecordedRequest>>,
    transports: AtomicUsize,
}

impl ServerState {
    /// Queued responses first, then the handler, then sticky routes, else 404
    fn respond(&self, request: &RecordedRequest) -> ScriptedResponse {
        let key = (request.method, request.path.clone());
        if let Ok(mut queued) = self.queued.lock() {
            if let Some(response) = queued.get_mut(&key).and_then(VecDeque::pop_front) {
                return response;
            }
        }
        if let Ok(handler) = self.handler.lock() {
            if let Some(response) = handler.as_ref().and_then(|handler| handler(request)) {
                return response;
            }
        }
        if let Ok(routes) = self.routes.lock() {
            if let Some(response) = routes.get(&key) {
                return response.clone();
            }
        }
        ScriptedResponse::status(404)
    }
}

/// Scripted remote server and transport factory
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<ServerState>,
}

impl std::fmt::Debug for ScriptedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedServer")
            .field("transports", &self.transports_created())
            .field("requests", &self.requests().len())
            .finish()
    }
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next matching request once with `response`
    pub fn enqueue(&self, method: HttpMethod, path: &str, response: ScriptedResponse) -> &Self {
        if let Ok(mut queued) = self.state.queued.lock() {
            queued
                .entry((method, path.to_string()))
                .or_default()
                .push_back(response);
        }
        self
    }

    /// Answer every matching request with `response` once queues are drained
    pub fn route(&self, method: HttpMethod, path: &str, response: ScriptedResponse) -> &Self {
        if let Ok(mut routes) = self.state.routes.lock() {
            routes.insert((method, path.to_string()), response);
        }
        self
    }

    /// Compute responses dynamically; `None` falls through to the sticky routes
    pub fn handle<F>(&self, handler: F) -> &Self
    where
        F: Fn(&RecordedRequest) -> Option<ScriptedResponse> + Send + Sync + 'static,
    {
        if let Ok(mut slot) = self.state.handler.lock() {
            *slot = Some(Box::new(handler));
        }
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == method && request.path == path)
            .count()
    }

    pub fn transports_created(&self) -> usize {
        self.state.transports.load(Ordering::SeqCst)
    }

    pub fn reset_requests(&self) {
        if let Ok(mut requests) = self.state.requests.lock() {
            requests.clear();
        }
    }
}

impl TransportFactory for ScriptedServer {
    fn create(&self, _base_url: &str) -> SessionResult<Arc<dyn HttpTransport>> {
        let id = self.state.transports.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Arc::new(ScriptedTransport {
            id,
            state: Arc::clone(&self.state),
            cookies: Mutex::new(BTreeMap::new()),
        }))
    }
}

/// Transport handed out by `ScriptedServer`
pub struct ScriptedTransport {
    id: usize,
    state: Arc<ServerState>,
    cookies: Mutex<BTreeMap<String, String>>,
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport").field("id", &self.id).finish()
    }
}

fn path_of(url: &str) -> String {
    url::Url::parse(url)
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn resolve(base: &str, location: &str) -> String {
    url::Url::parse(base)
        .and_then(|base| base.join(location))
        .map(|joined| joined.to_string())
        .unwrap_or_else(|_| location.to_string())
}

impl ScriptedTransport {
    fn exchange(&self, request: &HttpRequest, url: &str) -> Result<HttpResponse, TransportError> {
        let recorded = RecordedRequest {
            method: request.method,
            url: url.to_string(),
            path: path_of(url),
            body: request.body.clone(),
            headers: request.headers.clone(),
            cookies: self.cookies.lock().map(|jar| jar.clone()).unwrap_or_default(),
            follow_redirects: request.follow_redirects,
            transport_id: self.id,
        };
        let scripted = self.state.respond(&recorded);
        if let Ok(mut requests) = self.state.requests.lock() {
            requests.push(recorded);
        }

        if let Some(error) = scripted.error {
            return Err(error);
        }

        if let Ok(mut jar) = self.cookies.lock() {
            for (name, value) in &scripted.cookies {
                match value {
                    Some(value) => jar.insert(name.clone(), value.clone()),
                    None => jar.remove(name),
                };
            }
        }

        Ok(HttpResponse {
            method: request.method,
            url: scripted.url.unwrap_or_else(|| url.to_string()),
            status: scripted.status,
            reason: scripted.reason,
            headers: scripted.headers,
            body: scripted.body,
            synthesized: false,
        })
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut response = self.exchange(&request, &request.url)?;
        if !request.follow_redirects {
            return Ok(response);
        }

        let mut hops = 0;
        while response.is_redirect() && hops < MAX_REDIRECTS {
            let Some(location) = response.header("location") else {
                break;
            };
            let next = resolve(&response.url, location);
            let follow = HttpRequest {
                method: HttpMethod::Get,
                url: next.clone(),
                body: RequestBody::Empty,
                ..request.clone()
            };
            response = self.exchange(&follow, &next)?;
            hops += 1;
        }
        Ok(response)
    }

    fn cookie(&self, name: &str) -> Option<String> {
        self.cookies.lock().ok()?.get(name).cloned()
    }

    fn set_cookie(&self, name: &str, value: &str) {
        if let Ok(mut jar) = self.cookies.lock() {
            jar.insert(name.to_string(), value.to_string());
        }
    }

    fn clear_cookies(&self) {
        if let Ok(mut jar) = self.cookies.lock() {
            jar.clear();
        }
    }
}
