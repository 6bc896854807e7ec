//! Front-end (load balancer) availability cache
//!
//! A real health probe runs at most once per grace period across every process
//! sharing the store: callers serialise on one named lock, and whoever finds
//! the cached flag missing probes and stores the result with a TTL.

use async_trait::async_trait;
use enm_session_core::{
    with_lock, with_timeout, KeyValueStore, NamedLocks, OutageConfig, SessionResult, Topology,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub const OUTAGE_LOCK_NAME: &str = "haproxy-online-check";
pub const OUTAGE_CACHE_KEY: &str = "ha-proxy-online-status";

const PHYSICAL_PROBE_COMMAND: &str =
    "/opt/ericsson/enminst/bin/vcs.bsh --groups -g Grp_CS_svc_cluster_haproxy_ext | egrep -i online";
const PHYSICAL_PROBE_MARKER: &str = "ONLINE";
const CLOUD_PROBE_COMMAND: &str =
    "sudo consul members | egrep $(sudo consul catalog nodes -service=haproxy| egrep -v Node | awk '{print $1}')";
const CLOUD_PROBE_MARKER: &str = "alive";

/// Asks the infrastructure whether the front end is up
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn probe(&self) -> SessionResult<bool>;
}

/// Deployments without a separate load balancer
#[derive(Debug, Default, Clone)]
pub struct AlwaysOnline;

#[async_trait]
impl HealthProbe for AlwaysOnline {
    fn name(&self) -> &str {
        "always-online"
    }

    async fn probe(&self) -> SessionResult<bool> {
        Ok(true)
    }
}

/// Shell command whose successful output must contain a marker
#[derive(Debug, Clone)]
pub struct CommandProbe {
    command: String,
    marker: String,
    timeout: Duration,
}

impl CommandProbe {
    pub fn new(command: impl Into<String>, marker: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            marker: marker.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HealthProbe for CommandProbe {
    fn name(&self) -> &str {
        &self.command
    }

    async fn probe(&self) -> SessionResult<bool> {
        let output = with_timeout(
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .kill_on_drop(true)
                .output(),
            self.timeout,
            "front_end_probe",
        )
        .await??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let online = output.status.success() && stdout.contains(&self.marker);
        debug!(
            command = %self.command,
            exit_code = ?output.status.code(),
            online = online,
            "Front-end probe finished"
        );
        Ok(online)
    }
}

/// Probe appropriate to the configured topology, honouring overrides
pub fn probe_for(config: &OutageConfig) -> Arc<dyn HealthProbe> {
    let defaults = match config.topology {
        Topology::Physical => Some((PHYSICAL_PROBE_COMMAND, PHYSICAL_PROBE_MARKER)),
        Topology::Cloud => Some((CLOUD_PROBE_COMMAND, CLOUD_PROBE_MARKER)),
        Topology::CloudNative => None,
    };

    match (config.probe_command.as_deref(), defaults) {
        (Some(command), defaults) => {
            let marker = config
                .probe_marker
                .as_deref()
                .or(defaults.map(|(_, marker)| marker))
                .unwrap_or_default();
            Arc::new(CommandProbe::new(command, marker, config.probe_timeout()))
        }
        (None, Some((command, marker))) => Arc::new(CommandProbe::new(
            command,
            config.probe_marker.as_deref().unwrap_or(marker),
            config.probe_timeout(),
        )),
        (None, None) => Arc::new(AlwaysOnline),
    }
}

pub struct OutageCache {
    store: Arc<dyn KeyValueStore>,
    locks: Arc<dyn NamedLocks>,
    probe: Arc<dyn HealthProbe>,
    ttl: Duration,
    lock_timeout: Duration,
}

impl std::fmt::Debug for OutageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutageCache")
            .field("probe", &self.probe.name())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl OutageCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        locks: Arc<dyn NamedLocks>,
        probe: Arc<dyn HealthProbe>,
        ttl: Duration,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            locks,
            probe,
            ttl,
            lock_timeout,
        }
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, locks: Arc<dyn NamedLocks>, config: &OutageConfig) -> Self {
        Self::new(store, locks, probe_for(config), config.grace_period(), config.lock_timeout())
    }

    /// Cached verdict, probing only when none is stored
    pub async fn is_front_end_online(&self) -> SessionResult<bool> {
        with_lock(
            self.locks.as_ref(),
            OUTAGE_LOCK_NAME,
            self.lock_timeout,
            self.cached_or_probe(),
        )
        .await
    }

    /// Must run under `OUTAGE_LOCK_NAME`
    async fn cached_or_probe(&self) -> SessionResult<bool> {
        if let Some(cached) = self.store.get(OUTAGE_CACHE_KEY).await? {
            if let Some(online) = cached.as_bool() {
                debug!(online = online, "Front-end status served from cache");
                return Ok(online);
            }
        }

        let online = match self.probe.probe().await {
            Ok(online) => online,
            Err(e) => {
                warn!(probe = %self.probe.name(), error = %e, "Front-end probe failed, assuming offline");
                false
            }
        };
        if !online {
            warn!(grace_period_secs = self.ttl.as_secs(), "Front end reported offline");
        }
        self.store
            .set(OUTAGE_CACHE_KEY, serde_json::Value::Bool(online), Some(self.ttl))
            .await?;
        Ok(online)
    }

    /// Forget the cached verdict so the next caller probes again
    pub async fn invalidate(&self) -> SessionResult<()> {
        with_lock(self.locks.as_ref(), OUTAGE_LOCK_NAME, self.lock_timeout, async {
            self.store.remove(OUTAGE_CACHE_KEY).await.map(|_| ())
        })
        .await
    }
}
