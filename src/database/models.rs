use serde::{Deserialize, Serialize};

fn default_ssh_port() -> u16 {
    22
}

fn default_socks_port() -> u16 {
    1080
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Password,
    Key,
}

/// Persisted server definition. SSH secrets (password, private key,
/// passphrase) live in the secret store and never appear here.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    /// Empty on incoming add/import payloads; the manager assigns one.
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub username: String,
    pub auth_type: AuthType,

    /// Local bind port for this tunnel's SOCKS5 listener.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_password: Option<String>,

    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub connect_on_startup: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    /// Was-commanded-on. Survives restarts so the daemon can bring the
    /// tunnel back after a crash or reboot.
    #[serde(default)]
    pub is_enabled: bool,
}

impl ServerRecord {
    /// Identity used for import dedup. Ids are never reused, so two records
    /// describing the same endpoint are only told apart by this triple.
    pub fn endpoint_key(&self) -> (String, String, u16) {
        (self.host.clone(), self.username.clone(), self.ssh_port)
    }

    /// SOCKS5 clients must authenticate iff both credentials are set.
    pub fn proxy_auth(&self) -> Option<(String, String)> {
        match (&self.proxy_username, &self.proxy_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QuickProfile {
    pub id: String,
    pub server_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port_override: Option<u16>,
}

/// Daemon-wide defaults, persisted under the `settings` key. The defaults
/// mirror the engine's fixed SSH keepalive and dial deadlines.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub keepalive_interval_secs: u32,
    pub connect_timeout_secs: u32,
    pub auto_reconnect_default: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_secs: 15,
            connect_timeout_secs: 15,
            auto_reconnect_default: true,
        }
    }
}

/// Query window accepted by the stats endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    H1,
    H24,
    D7,
}

impl StatsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(Self::H1),
            "24h" => Some(Self::H24),
            "7d" => Some(Self::D7),
            _ => None,
        }
    }

    pub fn as_millis(self) -> i64 {
        match self {
            Self::H1 => 3_600_000,
            Self::H24 => 24 * 3_600_000,
            Self::D7 => 7 * 24 * 3_600_000,
        }
    }
}

/// One row of the append-only stats time series.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatsSample {
    pub server_id: String,
    /// Unix millis.
    pub timestamp: i64,
    pub uptime_sec: i64,
    pub bytes_in: i64,
    pub bytes_out: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    pub reconnect_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect_reason: Option<String>,
}

/// Aggregate returned by the stats query endpoint.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub total_uptime: i64,
    pub uptime_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_latency_ms: Option<f64>,
    pub reconnect_count: i64,
    pub disconnect_reasons: std::collections::HashMap<String, i64>,
    pub data_points: Vec<StatsSample>,
}

/// A ServerRecord as it appears in export files: the record itself plus,
/// when the caller asked for keys, the secret material inline.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortableServer {
    #[serde(flatten)]
    pub record: ServerRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,
}
