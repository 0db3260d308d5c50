use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::database::models::{AppSettings, AuthType, ServerRecord};
use crate::error::DisconnectReason;

/// Credentials resolved from the secret store for one connection attempt.
#[derive(Clone)]
pub enum TunnelAuth {
    Password(String),
    Key {
        /// PEM material held in the secret store; preferred over the path.
        material: Option<String>,
        path: Option<String>,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for TunnelAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password(_) => f.write_str("TunnelAuth::Password(..)"),
            Self::Key { material, path, .. } => f
                .debug_struct("TunnelAuth::Key")
                .field("has_material", &material.is_some())
                .field("path", path)
                .finish(),
        }
    }
}

/// Everything a worker needs to bring one tunnel up.
#[derive(Debug, Clone)]
pub struct ConnectSpec {
    pub server_id: String,
    pub display_name: String,
    pub host: String,
    pub ssh_port: u16,
    pub username: String,
    pub auth: TunnelAuth,
    pub socks_port: u16,
    pub proxy_auth: Option<(String, String)>,
    pub keepalive_interval: Duration,
    pub connect_timeout: Duration,
}

impl ConnectSpec {
    pub fn from_record(
        record: &ServerRecord,
        auth: TunnelAuth,
        settings: &AppSettings,
        socks_port_override: Option<u16>,
    ) -> Self {
        Self {
            server_id: record.id.clone(),
            display_name: record.name.clone(),
            host: record.host.clone(),
            ssh_port: record.ssh_port,
            username: record.username.clone(),
            auth,
            socks_port: socks_port_override.unwrap_or(record.socks_port),
            proxy_auth: record.proxy_auth(),
            keepalive_interval: Duration::from_secs(settings.keepalive_interval_secs as u64),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs as u64),
        }
    }

    pub fn auth_type(&self) -> AuthType {
        match self.auth {
            TunnelAuth::Password(_) => AuthType::Password,
            TunnelAuth::Key { .. } => AuthType::Key,
        }
    }
}

/// Worker state machine. `Failed` and `Terminated` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    Idle,
    Dialing,
    Authenticating,
    Binding,
    Connected,
    Draining,
    Terminated,
    Failed(DisconnectReason),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed(_))
    }
}

/// What became of a worker run, consumed by the manager's supervisor.
#[derive(Debug)]
pub enum WorkerExit {
    /// Tunnel ran (or failed to come up); reason says why it ended.
    Finished(DisconnectReason),
    /// The socks port was already bound by another instance of ours; the
    /// listener was adopted instead of rebound.
    Adopted,
    /// The socks port is bound by a foreign process.
    ForeignPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProxyType {
    Socks5,
    Socks4,
    Http,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdvertisedAuth {
    NoAuth,
    UserPass,
    Unknown,
}

/// Live counters owned by one worker; mutated atomically so snapshots and
/// the health monitor can read them without coordination. The byte counters
/// are shared `Arc`s because every SOCKS session feeds them directly.
#[derive(Debug, Default)]
pub struct TunnelCounters {
    pub bytes_in: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
    /// Millis; negative means "no measurement yet".
    latency_ms: AtomicI64,
    /// Unix millis of the last successful liveness probe; 0 means none.
    last_keepalive_ms: AtomicI64,
}

impl TunnelCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            latency_ms: AtomicI64::new(-1),
            ..Default::default()
        })
    }

    pub fn record_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as i64, Ordering::Relaxed);
        self.last_keepalive_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn clear_latency(&self) {
        self.latency_ms.store(-1, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Option<u64> {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        (ms >= 0).then_some(ms as u64)
    }

    pub fn last_keepalive(&self) -> Option<DateTime<Utc>> {
        let ms = self.last_keepalive_ms.load(Ordering::Relaxed);
        (ms > 0)
            .then_some(ms)
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// One entry of the manager's active list: either a worker-backed tunnel or
/// an external listener the port scanner found.
#[derive(Clone)]
pub struct ActiveTunnel {
    pub server_id: String,
    pub display_name: String,
    pub socks_port: u16,
    pub started_at: Instant,
    pub is_external: bool,
    pub proxy_type: ProxyType,
    pub advertised_auth: AdvertisedAuth,
    pub counters: Arc<TunnelCounters>,
    /// Successful re-connections of the current streak.
    pub reconnect_count: u32,
    /// Uptime accumulated by earlier sessions of the streak, seconds.
    pub prior_uptime: u64,
    /// Present when the entry was not produced by a plain connect
    /// ("external" for adopted/scanned listeners, "startup", ...).
    pub source: Option<String>,
}

impl ActiveTunnel {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn total_uptime_secs(&self) -> u64 {
        self.prior_uptime + self.uptime_secs()
    }

    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            server_id: self.server_id.clone(),
            name: self.display_name.clone(),
            socks_port: self.socks_port,
            uptime_sec: self.uptime_secs(),
            total_uptime_sec: self.total_uptime_secs(),
            is_external: self.is_external,
            proxy_type: self.proxy_type,
            advertised_auth: self.advertised_auth,
            bytes_in: self.counters.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.counters.bytes_out.load(Ordering::Relaxed),
            reconnect_count: self.reconnect_count,
            latency_ms: self.counters.latency(),
            last_keepalive_at: self.counters.last_keepalive(),
            source: self.source.clone(),
        }
    }
}

/// Serialized view of an [`ActiveTunnel`] for snapshots and the API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelSnapshot {
    pub server_id: String,
    pub name: String,
    pub socks_port: u16,
    pub uptime_sec: u64,
    pub total_uptime_sec: u64,
    pub is_external: bool,
    pub proxy_type: ProxyType,
    pub advertised_auth: AdvertisedAuth,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub reconnect_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_keepalive_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}
