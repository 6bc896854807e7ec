//! Minimal ENM-like server for end-to-end tests
//!
//! Serves the login form, a user-record endpoint guarded by the auth cookie,
//! logout, and a hook to expire every issued token.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use enm_session_core::{SessionConfig, DEFAULT_AUTH_COOKIE};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};

pub const PASSWORD: &str = "secret";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("enm_session_client=debug,enm_session_core=debug,info")
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct ServerState {
    issued: AtomicUsize,
    pub logins: AtomicUsize,
    pub logouts: AtomicUsize,
    valid: Mutex<HashSet<String>>,
}

impl ServerState {
    fn is_valid(&self, headers: &HeaderMap) -> bool {
        let Some(token) = auth_token(headers) else {
            return false;
        };
        self.valid
            .lock()
            .map(|valid| valid.contains(&token))
            .unwrap_or(false)
    }

    pub fn expire_all(&self) {
        if let Ok(mut valid) = self.valid.lock() {
            valid.clear();
        }
    }
}

fn auth_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == DEFAULT_AUTH_COOKIE)
        .map(|(_, value)| value.to_string())
}

#[derive(Deserialize)]
struct LoginForm {
    #[serde(rename = "IDToken1")]
    username: String,
    #[serde(rename = "IDToken2")]
    password: String,
}

async fn login(State(state): State<Arc<ServerState>>, Form(form): Form<LoginForm>) -> Response {
    state.logins.fetch_add(1, Ordering::SeqCst);
    if form.username.is_empty() || form.password != PASSWORD {
        return (StatusCode::FOUND, [(header::LOCATION, "/login?failed")]).into_response();
    }

    let token = format!("token-{}", state.issued.fetch_add(1, Ordering::SeqCst) + 1);
    if let Ok(mut valid) = state.valid.lock() {
        valid.insert(token.clone());
    }
    (
        StatusCode::FOUND,
        [
            (header::LOCATION, "/".to_string()),
            (header::SET_COOKIE, format!("{}={}; Path=/", DEFAULT_AUTH_COOKIE, token)),
        ],
    )
        .into_response()
}

async fn logout(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> StatusCode {
    state.logouts.fetch_add(1, Ordering::SeqCst);
    if let (Some(token), Ok(mut valid)) = (auth_token(&headers), state.valid.lock()) {
        valid.remove(&token);
    }
    StatusCode::OK
}

async fn user(
    State(state): State<Arc<ServerState>>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Response {
    if !state.is_valid(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    Json(json!({"username": username, "status": "enabled"})).into_response()
}

async fn missing(State(state): State<Arc<ServerState>>, headers: HeaderMap) -> StatusCode {
    if state.is_valid(&headers) {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::UNAUTHORIZED
    }
}

pub struct TestServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
}

impl TestServer {
    pub fn config(&self) -> Arc<SessionConfig> {
        let mut config = SessionConfig::default();
        config.server.base_url = self.base_url.clone();
        config.auth.login_attempts = 2;
        config.auth.login_retry_delay_ms = 0;
        config.outage.grace_period_secs = 0;
        Arc::new(config)
    }

    pub fn logins(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }
}

pub async fn spawn_server() -> TestServer {
    init_logging();

    let state = Arc::new(ServerState::default());
    let app = Router::new()
        .route("/login", post(login))
        .route("/logout", get(logout))
        .route("/oss/idm/usermanagement/users/{username}", get(user))
        .route("/missing/{id}", get(missing))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let address = listener.local_addr().expect("Failed to read listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Test server failed");
    });

    TestServer {
        base_url: format!("http://{}", address),
        state,
    }
}
