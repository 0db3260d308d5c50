pub mod entities;
pub mod models;

use std::collections::HashMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, warn};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter, QueryOrder, Set,
};
use tokio::time::timeout;

use entities::kv_store::Column as KvColumn;
use entities::stats::Column as StatsColumn;
use entities::{KvStore, Stats};
use models::{AppSettings, QuickProfile, ServerRecord, StatsReport, StatsSample};

/// Keys of the persisted kv keyspace.
const KEY_SERVERS: &str = "servers";
const KEY_PROFILES: &str = "profiles";
const KEY_SETTINGS: &str = "settings";
const KEY_API_TOKEN: &str = "apiToken";
const KEY_API_AUTH_ENABLED: &str = "apiAuthEnabled";
const KEY_OWNED_TUNNELS: &str = "active_tunnels";

/// Stats rows older than this are purged by `cleanup_stats`.
const STATS_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Ceiling for any single stats operation.
const DB_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Db {
    connection: DatabaseConnection,
}

impl Db {
    /// Open (creating if needed) the daemon database under `data_dir` and
    /// run the idempotent schema DDL.
    pub async fn open(data_dir: &Path) -> Result<Self> {
        if !data_dir.exists() {
            fs::create_dir_all(data_dir)
                .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        }

        let db_path: PathBuf = data_dir.join("anser.db");
        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        let connection = Database::connect(&db_url)
            .await
            .with_context(|| format!("failed to open database {}", db_path.display()))?;

        let db = Self { connection };
        db.init_schema().await?;
        Ok(db)
    }

    /// In-memory database for tests. Pinned to a single pooled connection,
    /// otherwise every checkout would see a fresh empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let mut opts = sea_orm::ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1);
        let connection = Database::connect(opts).await?;
        let db = Self { connection };
        db.init_schema().await?;
        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        self.connection
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS kv_store (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
            )
            .await?;

        self.connection
            .execute_unprepared(
                "CREATE TABLE IF NOT EXISTS stats (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    server_id TEXT NOT NULL,
                    timestamp INTEGER NOT NULL,
                    uptime INTEGER NOT NULL,
                    bytes_in INTEGER NOT NULL,
                    bytes_out INTEGER NOT NULL,
                    latency_ms INTEGER,
                    reconnect_count INTEGER NOT NULL,
                    disconnect_reason TEXT
                )",
            )
            .await?;

        self.connection
            .execute_unprepared(
                "CREATE INDEX IF NOT EXISTS idx_stats_server_ts
                 ON stats (server_id, timestamp)",
            )
            .await?;

        Ok(())
    }

    // =========================================================================
    // Key/value keyspace
    // =========================================================================

    pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let row = KvStore::find_by_id(key).one(&self.connection).await?;
        Ok(row.map(|m| m.value))
    }

    /// Single-row upsert. SQLite applies it transactionally, which is the
    /// atomic-replace primitive every config write goes through.
    pub async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let model = entities::kv_store::ActiveModel {
            key: Set(key.to_string()),
            value: Set(value.to_string()),
        };
        KvStore::insert(model)
            .on_conflict(
                OnConflict::column(KvColumn::Key)
                    .update_column(KvColumn::Value)
                    .to_owned(),
            )
            .exec(&self.connection)
            .await?;
        Ok(())
    }

    pub async fn kv_delete(&self, key: &str) -> Result<()> {
        KvStore::delete_by_id(key).exec(&self.connection).await?;
        Ok(())
    }

    // =========================================================================
    // Config store
    // =========================================================================

    pub async fn load_servers(&self) -> Result<Vec<ServerRecord>> {
        match self.kv_get(KEY_SERVERS).await? {
            Some(json) => {
                let records: Vec<ServerRecord> =
                    serde_json::from_str(&json).context("corrupt servers record")?;
                debug!("loaded {} server records", records.len());
                Ok(records)
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_servers(&self, records: &[ServerRecord]) -> Result<()> {
        let json = serde_json::to_string(records)?;
        self.kv_put(KEY_SERVERS, &json).await
    }

    pub async fn load_profiles(&self) -> Result<Vec<QuickProfile>> {
        match self.kv_get(KEY_PROFILES).await? {
            Some(json) => Ok(serde_json::from_str(&json).context("corrupt profiles record")?),
            None => Ok(Vec::new()),
        }
    }

    pub async fn save_profiles(&self, profiles: &[QuickProfile]) -> Result<()> {
        let json = serde_json::to_string(profiles)?;
        self.kv_put(KEY_PROFILES, &json).await
    }

    pub async fn load_settings(&self) -> Result<AppSettings> {
        match self.kv_get(KEY_SETTINGS).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(AppSettings::default()),
        }
    }

    pub async fn save_settings(&self, settings: &AppSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.kv_put(KEY_SETTINGS, &json).await
    }

    pub async fn load_api_token(&self) -> Result<Option<String>> {
        self.kv_get(KEY_API_TOKEN).await
    }

    pub async fn save_api_token(&self, token: &str) -> Result<()> {
        self.kv_put(KEY_API_TOKEN, token).await
    }

    pub async fn load_api_auth_enabled(&self) -> Result<bool> {
        Ok(self
            .kv_get(KEY_API_AUTH_ENABLED)
            .await?
            .map(|v| v == "true")
            .unwrap_or(false))
    }

    pub async fn save_api_auth_enabled(&self, enabled: bool) -> Result<()> {
        self.kv_put(KEY_API_AUTH_ENABLED, if enabled { "true" } else { "false" })
            .await
    }

    /// Server ids whose local SOCKS listener belongs to this application,
    /// shared across processes and restarts.
    pub async fn load_owned_tunnels(&self) -> Result<HashSet<String>> {
        match self.kv_get(KEY_OWNED_TUNNELS).await? {
            Some(json) => Ok(serde_json::from_str(&json).unwrap_or_default()),
            None => Ok(HashSet::new()),
        }
    }

    pub async fn save_owned_tunnels(&self, ids: &HashSet<String>) -> Result<()> {
        let json = serde_json::to_string(ids)?;
        self.kv_put(KEY_OWNED_TUNNELS, &json).await
    }

    // =========================================================================
    // Stats store
    // =========================================================================

    /// Append one sample. Failures here must never take a worker down, so the
    /// caller is expected to log-and-drop the error.
    pub async fn insert_sample(&self, sample: &StatsSample) -> Result<()> {
        let model = entities::stats::ActiveModel {
            server_id: Set(sample.server_id.clone()),
            timestamp: Set(sample.timestamp),
            uptime: Set(sample.uptime_sec),
            bytes_in: Set(sample.bytes_in),
            bytes_out: Set(sample.bytes_out),
            latency_ms: Set(sample.latency_ms),
            reconnect_count: Set(sample.reconnect_count),
            disconnect_reason: Set(sample.disconnect_reason.clone()),
            ..Default::default()
        };
        timeout(DB_OP_TIMEOUT, model.insert(&self.connection))
            .await
            .context("stats insert timed out")??;
        Ok(())
    }

    pub async fn query_stats(&self, server_id: &str, period: models::StatsPeriod) -> Result<StatsReport> {
        let period_ms = period.as_millis();
        let since = Utc::now().timestamp_millis() - period_ms;

        let rows = timeout(
            DB_OP_TIMEOUT,
            Stats::find()
                .filter(StatsColumn::ServerId.eq(server_id))
                .filter(StatsColumn::Timestamp.gte(since))
                .order_by_asc(StatsColumn::Timestamp)
                .all(&self.connection),
        )
        .await
        .context("stats query timed out")??;

        let mut total_uptime = 0i64;
        let mut reconnect_count = 0i64;
        let mut latency_sum = 0i64;
        let mut latency_n = 0i64;
        let mut disconnect_reasons: HashMap<String, i64> = HashMap::new();
        let mut data_points = Vec::with_capacity(rows.len());

        for row in rows {
            total_uptime += row.uptime;
            reconnect_count = reconnect_count.max(row.reconnect_count);
            if let Some(ms) = row.latency_ms {
                latency_sum += ms;
                latency_n += 1;
            }
            if let Some(reason) = &row.disconnect_reason {
                // Group by the stable tag, not the appended detail.
                let tag = reason.split(':').next().unwrap_or(reason).to_string();
                *disconnect_reasons.entry(tag).or_insert(0) += 1;
            }
            data_points.push(StatsSample {
                server_id: row.server_id,
                timestamp: row.timestamp,
                uptime_sec: row.uptime,
                bytes_in: row.bytes_in,
                bytes_out: row.bytes_out,
                latency_ms: row.latency_ms,
                reconnect_count: row.reconnect_count,
                disconnect_reason: row.disconnect_reason,
            });
        }

        let uptime_percent =
            ((total_uptime as f64 * 1000.0) / period_ms as f64 * 100.0).clamp(0.0, 100.0);

        Ok(StatsReport {
            total_uptime,
            uptime_percent,
            avg_latency_ms: (latency_n > 0).then(|| latency_sum as f64 / latency_n as f64),
            reconnect_count,
            disconnect_reasons,
            data_points,
        })
    }

    /// Drop rows past retention. Safe to run while samples are inserted.
    pub async fn cleanup_stats(&self) -> Result<u64> {
        let cutoff = Utc::now().timestamp_millis() - STATS_RETENTION.as_millis() as i64;
        let res = timeout(
            DB_OP_TIMEOUT,
            Stats::delete_many()
                .filter(StatsColumn::Timestamp.lt(cutoff))
                .exec(&self.connection),
        )
        .await
        .context("stats cleanup timed out")??;
        if res.rows_affected > 0 {
            debug!("purged {} expired stats rows", res.rows_affected);
        }
        Ok(res.rows_affected)
    }

    /// Cascade helper for server deletion.
    pub async fn purge_stats_for(&self, server_id: &str) -> Result<()> {
        if let Err(e) = timeout(
            DB_OP_TIMEOUT,
            Stats::delete_many()
                .filter(StatsColumn::ServerId.eq(server_id))
                .exec(&self.connection),
        )
        .await
        .context("stats purge timed out")
        .and_then(|r| r.map_err(Into::into))
        {
            warn!("failed to purge stats for {server_id}: {e:#}");
        }
        Ok(())
    }
}
