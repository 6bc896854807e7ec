//! ENM Session CLI - command-line front end for the session manager
//!
//! Logs users in, issues authenticated requests, checks the front end and
//! manages the sessions shared through the on-disk cache

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use console::Term;
use enm_session_client::{
    persistence_key, CredentialSource, Credentials, OutageCache, PasswordPrompt, ReqwestTransportFactory,
    SessionCache, SessionManager, TransportFactory, ADMINISTRATOR_SESSION_KEY, WORKLOAD_ADMIN_SESSION_KEY,
};
use enm_session_core::{
    config_error, init_logging, log_operation_error, log_operation_start, log_operation_success, ErrorContext,
    HttpMethod, KeyValueStore, NamedLocks, RequestBody, RequestOptions, SessionConfig, SessionError,
    SessionResult,
};
use enm_session_store::{FileLocks, FileStore};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "enm-session")]
#[command(about = "Authenticated, self-healing sessions against an ENM deployment")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in (or adopt a cached session) and verify it works
    Login {
        #[command(flatten)]
        user: UserArgs,
    },

    /// Issue an authenticated request
    Request {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE, HEAD)
        method: String,

        /// Path relative to the server base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,

        /// Return failures as responses and print the response table
        #[arg(long)]
        safe: bool,

        /// Do not log in again if the session turns out to be lost
        #[arg(long)]
        no_reestablish: bool,

        /// Status codes left out of the response table
        #[arg(long = "ignore-status")]
        ignore_status: Vec<u16>,

        #[command(flatten)]
        user: UserArgs,
    },

    /// Log out and forget the cached session
    Logout {
        #[command(flatten)]
        user: UserArgs,
    },

    /// Report whether the front end (load balancer) is online
    Probe {
        /// Ignore the cached verdict and probe again
        #[arg(long)]
        refresh: bool,
    },

    /// Manage configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        /// Initialize default configuration
        #[arg(long)]
        init: bool,

        /// Validate current configuration
        #[arg(long)]
        validate: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum)]
enum Role {
    Administrator,
    WorkloadAdmin,
    User,
}

#[derive(Args)]
struct UserArgs {
    /// Session role; administrator and workload-admin share well-known cache entries
    #[arg(long, value_enum, default_value = "user")]
    role: Role,

    /// Username (required for the user role unless a cached session exists)
    #[arg(short, long)]
    username: Option<String>,

    /// File holding the username and password on two lines
    #[arg(long)]
    credentials_file: Option<PathBuf>,
}

/// Reads credentials from the terminal
struct StdinPrompt {
    username: Option<String>,
}

impl StdinPrompt {
    fn read_line(label: &str) -> SessionResult<String> {
        let term = Term::stderr();
        term.write_str(&format!("{}: ", label))?;
        Ok(term.read_line()?.trim().to_string())
    }

    fn read_password(label: &str) -> SessionResult<String> {
        let term = Term::stderr();
        term.write_str(&format!("{}: ", label))?;
        Ok(term.read_secure_line()?)
    }
}

impl PasswordPrompt for StdinPrompt {
    fn prompt(&self) -> SessionResult<Credentials> {
        let username = match &self.username {
            Some(username) => username.clone(),
            None => Self::read_line("Username")?,
        };
        let password = Self::read_password(&format!("Password for {}", username))?;
        if username.is_empty() || password.is_empty() {
            return Err(config_error!("Username and password are required", "cli"));
        }
        Ok(Credentials::new(username, password))
    }
}

/// Shared infrastructure every manager is built from
struct Runtime {
    config: Arc<SessionConfig>,
    store: Arc<dyn KeyValueStore>,
    locks: Arc<dyn NamedLocks>,
    transports: Arc<dyn TransportFactory>,
}

impl Runtime {
    fn new(config: SessionConfig) -> SessionResult<Self> {
        let data_dir = PathBuf::from(&config.persistence.data_dir);
        let store = FileStore::new(data_dir.join("store"))?;
        let locks = FileLocks::new(data_dir.join("locks"))?;
        let transports = ReqwestTransportFactory::from_config(&config.server);
        Ok(Self {
            config: Arc::new(config),
            store: Arc::new(store),
            locks: Arc::new(locks),
            transports: Arc::new(transports),
        })
    }

    fn session_cache(&self) -> SessionCache {
        SessionCache::new(
            Arc::clone(&self.store),
            Arc::clone(&self.locks),
            self.config.persistence.lock_timeout(),
        )
    }

    fn outage_cache(&self) -> OutageCache {
        OutageCache::from_config(Arc::clone(&self.store), Arc::clone(&self.locks), &self.config.outage)
    }
}

/// Session managers by role, built on first use
///
/// This is the only place a process-wide session lives; library code always
/// receives its manager explicitly.
struct RoleRegistry {
    runtime: Runtime,
    managers: Mutex<HashMap<Role, Arc<SessionManager>>>,
}

impl RoleRegistry {
    fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            managers: Mutex::new(HashMap::new()),
        }
    }

    fn persistence_key(role: Role, username: Option<&str>) -> Option<String> {
        match role {
            Role::Administrator => Some(ADMINISTRATOR_SESSION_KEY.to_string()),
            Role::WorkloadAdmin => Some(WORKLOAD_ADMIN_SESSION_KEY.to_string()),
            Role::User => username.map(persistence_key),
        }
    }

    fn cached(&self, role: Role) -> Option<Arc<SessionManager>> {
        self.managers
            .lock()
            .ok()
            .and_then(|managers| managers.get(&role).cloned())
    }

    async fn manager(&self, args: &UserArgs, safe_request: bool) -> SessionResult<Arc<SessionManager>> {
        if let Some(manager) = self.cached(args.role) {
            return Ok(manager);
        }

        let key = Self::persistence_key(args.role, args.username.as_deref());
        let cache = self.runtime.session_cache();
        let persisted = match &key {
            Some(key) => cache.load(key).await?,
            None => None,
        };
        let persisted = persisted.filter(|state| {
            args.username
                .as_deref()
                .map_or(true, |username| username == state.username)
        });

        let builder = match &persisted {
            Some(state) if args.credentials_file.is_none() => {
                debug!(username = %state.username, "Using persisted session");
                SessionManager::from_persisted(state, Arc::clone(&self.runtime.config), Arc::clone(&self.runtime.transports))
            }
            _ => {
                let mut source = CredentialSource::new().environment();
                if let Some(path) = &args.credentials_file {
                    source = source.file(path);
                }
                let resolved = source
                    .prompt(Box::new(StdinPrompt {
                        username: args.username.clone(),
                    }))
                    .resolve()?;
                SessionManager::from_credentials(
                    resolved,
                    Arc::clone(&self.runtime.config),
                    Arc::clone(&self.runtime.transports),
                )
            }
        };

        let mut builder = builder
            .session_cache(cache)
            .outage_cache(Arc::new(self.runtime.outage_cache()))
            .safe_request(safe_request);
        if let Some(key) = key {
            builder = builder.persistence_key(key);
        }
        if args.role == Role::Administrator {
            builder = builder.keep_password(true);
        }

        let manager = Arc::new(builder.build()?);
        if let Ok(mut managers) = self.managers.lock() {
            managers.insert(args.role, Arc::clone(&manager));
        }
        Ok(manager)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = SessionConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.verbose {
        config.logging.level = "debug".to_string();
        config.logging.filter_directives = vec![
            "enm_session_core=debug".to_string(),
            "enm_session_store=debug".to_string(),
            "enm_session_client=debug".to_string(),
        ];
    }
    init_logging(&config.logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Starting ENM session CLI v{}", env!("CARGO_PKG_VERSION"));

    let outcome = match cli.command {
        Commands::Config { show, init, validate } => handle_config(&config, show, init, validate).await,
        command => {
            let registry = RoleRegistry::new(Runtime::new(config)?);
            run(&registry, command).await
        }
    };

    if let Err(e) = &outcome {
        e.log();
    }
    Ok(outcome?)
}

async fn run(registry: &RoleRegistry, command: Commands) -> SessionResult<()> {
    match command {
        Commands::Login { user } => handle_login(registry, &user).await,
        Commands::Request {
            method,
            path,
            data,
            safe,
            no_reestablish,
            ignore_status,
            user,
        } => handle_request(registry, &user, &method, &path, data, safe, no_reestablish, ignore_status).await,
        Commands::Logout { user } => handle_logout(registry, &user).await,
        Commands::Probe { refresh } => handle_probe(&registry.runtime, refresh).await,
        Commands::Config { .. } => Ok(()),
    }
}

async fn handle_login(registry: &RoleRegistry, user: &UserArgs) -> SessionResult<()> {
    let manager = registry.manager(user, false).await?;
    log_operation_start!("login", username = %manager.username());

    if manager.is_session_established(None).await? {
        log_operation_success!("login", username = %manager.username());
        println!("Session established for {}", manager.username());
        Ok(())
    } else {
        let error = SessionError::NoStoredPassword {
            username: manager.username().to_string(),
            context: ErrorContext::new("cli")
                .with_operation("login")
                .with_suggestion("Log in again with a credentials file or at the prompt"),
        };
        log_operation_error!("login", error);
        Err(error)
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_request(
    registry: &RoleRegistry,
    user: &UserArgs,
    method: &str,
    path: &str,
    data: Option<String>,
    safe: bool,
    no_reestablish: bool,
    ignore_status: Vec<u16>,
) -> SessionResult<()> {
    let method: HttpMethod = method.parse()?;
    let body = match data {
        Some(data) => RequestBody::Json(serde_json::from_str(&data)?),
        None => RequestBody::Empty,
    };
    let mut options = RequestOptions::default();
    for status in ignore_status {
        options = options.ignore_status(status);
    }
    if no_reestablish {
        options = options.without_reestablish();
    }

    let manager = registry.manager(user, safe).await?;
    let response = manager.request(method, path, body, options).await?;

    println!("{} {}", response.status, response.reason);
    if !response.body.is_empty() {
        match response.json::<serde_json::Value>() {
            Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            Err(_) => println!("{}", response.body),
        }
    }
    if safe {
        eprintln!("{}", serde_json::to_string_pretty(&manager.response_table())?);
    }
    Ok(())
}

async fn handle_logout(registry: &RoleRegistry, user: &UserArgs) -> SessionResult<()> {
    let manager = registry.manager(user, false).await?;
    log_operation_start!("logout", username = %manager.username());
    manager.remove_session(None).await?;
    log_operation_success!("logout", username = %manager.username());
    println!("Logged out {}", manager.username());
    Ok(())
}

async fn handle_probe(runtime: &Runtime, refresh: bool) -> SessionResult<()> {
    let outage = runtime.outage_cache();
    if refresh {
        outage.invalidate().await?;
    }
    let online = outage.is_front_end_online().await?;
    println!("Front end is {}", if online { "online" } else { "offline" });
    Ok(())
}

/// Default location written by `config --init`
fn default_config_path() -> SessionResult<PathBuf> {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|d| d.join(".config")))
        .map(|dir| dir.join("enm-session").join("config.toml"))
        .ok_or_else(|| config_error!("Could not determine a configuration directory", "cli"))
}

async fn handle_config(config: &SessionConfig, show: bool, init: bool, validate: bool) -> SessionResult<()> {
    if init {
        let path = default_config_path()?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        SessionConfig::default().save_to_file(&path)?;
        println!("Configuration initialized at: {}", path.display());
    }

    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| config_error!(format!("Failed to render configuration: {}", e), "cli"))?;
        println!("{}", rendered);
    }

    if validate {
        config.validate()?;
        println!("Configuration is valid");
    }

    if !(init || show || validate) {
        let found = SessionConfig::default_paths().into_iter().find(|path| path.exists());
        match found.as_deref().map(Path::display) {
            Some(path) => println!("Using configuration from {}", path),
            None => println!("No configuration file found, using defaults"),
        }
    }
    Ok(())
}
