//! ENM Session Client - authenticated HTTP sessions against an ENM deployment
//!
//! The entry point is [`SessionManager`], which logs a user in, keeps the
//! session alive across server-side expiry and front-end outages, and routes
//! commands through the scripting channel. Lower layers ([`Session`],
//! [`UsernamePassword`], the caches) are public so applications can compose
//! them differently.

pub mod aggregation;
pub mod auth;
pub mod cache;
pub mod credentials;
pub mod manager;
pub mod outage;
pub mod scripting;
pub mod session;
pub mod transport;

pub use aggregation::{normalize_path, RequestKey, ResponseStats, ResponseTable};
pub use auth::{Authenticator, UsernamePassword};
pub use cache::{
    persistence_key, PersistedUser, SessionCache, ADMINISTRATOR_SESSION_KEY, WORKLOAD_ADMIN_SESSION_KEY,
};
pub use credentials::{
    read_credentials_file, CredentialOrigin, CredentialSource, Credentials, PasswordPrompt, ResolvedCredentials,
};
pub use manager::{verify_json_response, SessionManager, SessionManagerBuilder};
pub use outage::{probe_for, AlwaysOnline, CommandProbe, HealthProbe, OutageCache};
pub use scripting::{
    mask_command, CommandOptions, CommandOutput, ScriptingConnector, ScriptingError, ScriptingSession,
};
pub use session::Session;
pub use transport::{
    HttpRequest, HttpTransport, ReqwestTransport, ReqwestTransportFactory, ScriptedResponse, ScriptedServer,
    TransportFactory,
};

pub use enm_session_core;
