//! The tunnel directory: owns every server record, worker and active tunnel,
//! and orchestrates the stores, the event bus, the reconnect scheduler and
//! the scanner.
//!
//! Locking discipline: `state` is one coarse mutex held only across short
//! critical sections. Connect/dial/bind, SOCKS traffic and database writes
//! all happen outside of it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::database::models::{
    AppSettings, AuthType, PortableServer, QuickProfile, ServerRecord, StatsPeriod, StatsReport,
    StatsSample,
};
use crate::database::Db;
use crate::error::{ApiError, ApiResult, DisconnectReason};
use crate::events::{EventBus, EventKind};
use crate::logs::{LogBuffer, LogEvent};
use crate::secrets::SecretStore;
use crate::server::health;
use crate::server::model::{
    ActiveTunnel, AdvertisedAuth, ConnectSpec, ProxyType, TunnelAuth, TunnelCounters, WorkerExit,
    WorkerState,
};
use crate::server::reconnect::ReconnectScheduler;
use crate::server::scanner::{self, ScanProgress, ScanProgressSnapshot};
use crate::server::ssh::SshClient;
use crate::server::worker::{self, WorkerContext};

/// Interval for the stats retention sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
/// How long update/shutdown paths wait for a worker to wind down.
const WORKER_WAIT: Duration = Duration::from_secs(5);

/// Why a connect was requested; shows up as the `source` field of the
/// resulting `connected` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectSource {
    Api,
    Startup,
    Profile,
    Reconnect,
    NetworkRestore,
    Rebind,
}

impl ConnectSource {
    fn label(self) -> Option<&'static str> {
        match self {
            Self::Api => None,
            Self::Startup => Some("startup"),
            Self::Profile => Some("profile"),
            Self::Reconnect => Some("reconnect"),
            Self::NetworkRestore => Some("network"),
            Self::Rebind => Some("rebind"),
        }
    }

    /// Sources that represent an explicit user command, which flips the
    /// record's `isEnabled` flag on.
    fn is_commanded(self) -> bool {
        matches!(self, Self::Api | Self::Profile)
    }
}

struct WorkerHandle {
    token: CancellationToken,
    counters: Arc<TunnelCounters>,
    ssh_slot: Arc<Mutex<Option<SshClient>>>,
    pending_reason: Arc<Mutex<Option<DisconnectReason>>>,
    socks_port: u16,
}

/// Reconnect bookkeeping carried from a dead session to its successor.
#[derive(Default, Clone, Copy)]
struct CarryOver {
    reconnects: u32,
    uptime: u64,
}

#[derive(Default)]
struct ManagerState {
    servers: Vec<ServerRecord>,
    profiles: Vec<QuickProfile>,
    settings: AppSettings,
    active: HashMap<String, ActiveTunnel>,
    workers: HashMap<String, WorkerHandle>,
    owned_ports: HashSet<String>,
    inflight: HashSet<String>,
    carry: HashMap<String, CarryOver>,
    api_token: String,
    api_auth_enabled: bool,
    api_port: Option<u16>,
}

/// Probe handle handed to the health monitor.
pub struct HealthTarget {
    pub server_id: String,
    pub ssh: SshClient,
    pub counters: Arc<TunnelCounters>,
}

pub struct TunnelManager {
    db: Db,
    secrets: SecretStore,
    events: Arc<EventBus>,
    logs: Arc<LogBuffer>,
    state: Mutex<ManagerState>,
    scheduler: ReconnectScheduler,
    scan: Arc<ScanProgress>,
    ready_tx: watch::Sender<bool>,
    started_at: Instant,
    shutdown: CancellationToken,
    /// Supervisor task per server id. Joined on shutdown and rebind so the
    /// final stats flush of a dying worker is never aborted mid-write.
    supervisors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TunnelManager {
    pub fn new(
        db: Db,
        secrets: SecretStore,
        events: Arc<EventBus>,
        logs: Arc<LogBuffer>,
    ) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        Arc::new(Self {
            db,
            secrets,
            events,
            logs,
            state: Mutex::new(ManagerState::default()),
            scheduler: ReconnectScheduler::new(),
            scan: Arc::new(ScanProgress::default()),
            ready_tx,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            supervisors: Mutex::new(HashMap::new()),
        })
    }

    /// Startup sequence, run exactly once: load auth, servers and profiles,
    /// then open the barrier every mutating call waits on.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        let api_token = match self.db.load_api_token().await? {
            Some(token) => token,
            None => {
                let token = generate_token();
                self.db.save_api_token(&token).await?;
                token
            }
        };
        let api_auth_enabled = self.db.load_api_auth_enabled().await?;
        let servers = self.db.load_servers().await?;
        let profiles = self.db.load_profiles().await?;
        let settings = self.db.load_settings().await?;
        let owned_ports = self.db.load_owned_tunnels().await?;

        info!(
            "manager init: {} servers, {} profiles, auth {}",
            servers.len(),
            profiles.len(),
            if api_auth_enabled { "on" } else { "off" }
        );

        {
            let mut state = self.state.lock().unwrap();
            state.api_token = api_token;
            state.api_auth_enabled = api_auth_enabled;
            state.servers = servers;
            state.profiles = profiles;
            state.settings = settings;
            state.owned_ports = owned_ports;
        }
        eprintln!("DBG init: sending ready=true, current={}", *self.ready_tx.borrow());
        let _ = self.ready_tx.send(true);
        eprintln!("DBG init: sent ready=true, current={}", *self.ready_tx.borrow());

        health::spawn(self.clone(), self.shutdown.clone());
        self.spawn_stats_cleanup();
        Ok(())
    }

    async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        eprintln!("DBG wait_ready: initial value={}", *rx.borrow_and_update());
        while !*rx.borrow_and_update() {
            eprintln!("DBG wait_ready: awaiting change");
            if rx.changed().await.is_err() {
                break;
            }
            eprintln!("DBG wait_ready: changed to {}", *rx.borrow());
        }
        eprintln!("DBG wait_ready: done");
    }

    fn spawn_stats_cleanup(self: &Arc<Self>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    _ = manager.shutdown.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = manager.db.cleanup_stats().await {
                            warn!("stats cleanup failed: {e:#}");
                        }
                    }
                }
            }
        });
    }

    // =========================================================================
    // Connect / disconnect
    // =========================================================================

    pub async fn connect(self: &Arc<Self>, server_id: &str, source: ConnectSource) -> ApiResult<()> {
        self.connect_with_port(server_id, source, None).await
    }

    pub async fn connect_with_port(
        self: &Arc<Self>,
        server_id: &str,
        source: ConnectSource,
        socks_port_override: Option<u16>,
    ) -> ApiResult<()> {
        self.wait_ready().await;

        let (record, settings, owned_hint) = {
            let mut state = self.state.lock().unwrap();
            let already_up = state.workers.contains_key(server_id)
                || state
                    .active
                    .get(server_id)
                    .map(|t| !t.is_external)
                    .unwrap_or(false);
            if already_up {
                return Err(ApiError::BadRequest("tunnel already connected".into()));
            }
            if state.inflight.contains(server_id) {
                return Err(ApiError::BadRequest("connect already in progress".into()));
            }
            let record = match state.servers.iter().find(|r| r.id == server_id) {
                Some(record) => record.clone(),
                None => return Err(ApiError::NotFound("server".into())),
            };
            state.inflight.insert(server_id.to_string());
            (
                record,
                state.settings.clone(),
                state.owned_ports.contains(server_id),
            )
        };

        if source.is_commanded() && !record.is_enabled {
            self.set_enabled_flag(server_id, true).await;
        }

        let auth = self.resolve_auth(&record);
        let spec = ConnectSpec::from_record(&record, auth, &settings, socks_port_override);
        self.spawn_worker(spec, owned_hint, source);
        Ok(())
    }

    /// Resolve credentials from the secret store. An unavailable backend
    /// degrades to empty credentials per the store's contract.
    fn resolve_auth(&self, record: &ServerRecord) -> TunnelAuth {
        match record.auth_type {
            AuthType::Password => {
                let password = self
                    .secrets
                    .get_string(&format!("password_{}", record.id))
                    .unwrap_or_else(|| {
                        warn!("no stored password for {}, connecting with empty one", record.id);
                        String::new()
                    });
                TunnelAuth::Password(password)
            }
            AuthType::Key => TunnelAuth::Key {
                material: self.secrets.get_string(&format!("privateKey_{}", record.id)),
                path: record.key_path.clone(),
                passphrase: self
                    .secrets
                    .get_string(&format!("keyPassphrase_{}", record.id)),
            },
        }
    }

    fn spawn_worker(self: &Arc<Self>, spec: ConnectSpec, owned_hint: bool, source: ConnectSource) {
        let token = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let counters = TunnelCounters::new();
        let ssh_slot = Arc::new(Mutex::new(None));
        let pending_reason = Arc::new(Mutex::new(None));

        {
            let mut state = self.state.lock().unwrap();
            state.workers.insert(
                spec.server_id.clone(),
                WorkerHandle {
                    token: token.clone(),
                    counters: counters.clone(),
                    ssh_slot: ssh_slot.clone(),
                    pending_reason: pending_reason.clone(),
                    socks_port: spec.socks_port,
                },
            );
        }

        let ctx = WorkerContext {
            spec: spec.clone(),
            counters,
            token,
            state_tx,
            ssh_slot,
            port_owned_hint: owned_hint,
            pending_reason,
        };

        let manager = self.clone();
        let server_id = spec.server_id.clone();
        let handle = tokio::spawn(async move {
            manager.supervise(spec, source, ctx, state_rx).await;
        });
        // Replacing a finished predecessor's handle is fine; joining a
        // completed task returns immediately.
        self.supervisors.lock().unwrap().insert(server_id, handle);
    }

    async fn supervise(
        self: Arc<Self>,
        spec: ConnectSpec,
        source: ConnectSource,
        ctx: WorkerContext,
        mut state_rx: watch::Receiver<WorkerState>,
    ) {
        let run_fut = worker::run(ctx);
        tokio::pin!(run_fut);

        let exit = loop {
            tokio::select! {
                exit = &mut run_fut => break exit,
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break (&mut run_fut).await;
                    }
                    let connected =
                        matches!(*state_rx.borrow_and_update(), WorkerState::Connected);
                    if connected {
                        self.on_worker_connected(&spec, source).await;
                    }
                }
            }
        };

        self.on_worker_exit(&spec, exit).await;
    }

    async fn on_worker_connected(&self, spec: &ConnectSpec, source: ConnectSource) {
        let (reconnects, owned) = {
            let mut state = self.state.lock().unwrap();
            let carry = state.carry.remove(&spec.server_id).unwrap_or_default();

            // Atomic swap: a scanner finding on this port is superseded by
            // the managed tunnel, with no remove-then-readd gap.
            state
                .active
                .retain(|_, t| !(t.is_external && t.socks_port == spec.socks_port));

            let counters = state
                .workers
                .get(&spec.server_id)
                .map(|h| h.counters.clone())
                .unwrap_or_else(TunnelCounters::new);

            state.active.insert(
                spec.server_id.clone(),
                ActiveTunnel {
                    server_id: spec.server_id.clone(),
                    display_name: spec.display_name.clone(),
                    socks_port: spec.socks_port,
                    started_at: Instant::now(),
                    is_external: false,
                    proxy_type: ProxyType::Socks5,
                    advertised_auth: if spec.proxy_auth.is_some() {
                        AdvertisedAuth::UserPass
                    } else {
                        AdvertisedAuth::NoAuth
                    },
                    counters,
                    reconnect_count: carry.reconnects,
                    prior_uptime: carry.uptime,
                    source: source.label().map(str::to_string),
                },
            );
            state.inflight.remove(&spec.server_id);
            state.owned_ports.insert(spec.server_id.clone());
            (carry.reconnects, state.owned_ports.clone())
        };

        // Success resets the backoff streak.
        self.scheduler.cancel(&spec.server_id);
        self.persist_owned(owned).await;

        self.events.publish(EventKind::Connected {
            server_id: spec.server_id.clone(),
            name: spec.display_name.clone(),
            socks_port: spec.socks_port,
            source: source.label().map(str::to_string),
        });
        self.logs.push(
            &spec.display_name,
            if reconnects > 0 {
                LogEvent::Reconnected
            } else {
                LogEvent::Connected
            },
            Some(format!("socks5 on port {}", spec.socks_port)),
        );
    }

    async fn on_worker_exit(self: &Arc<Self>, spec: &ConnectSpec, exit: WorkerExit) {
        match exit {
            WorkerExit::Adopted => self.on_worker_adopted(spec).await,
            WorkerExit::ForeignPort => self.on_foreign_port(spec).await,
            WorkerExit::Finished(reason) => self.on_worker_finished(spec, reason).await,
        }
    }

    /// Port already served by another instance of ours: keep the entry as an
    /// internal tunnel without a worker behind it.
    async fn on_worker_adopted(&self, spec: &ConnectSpec) {
        {
            let mut state = self.state.lock().unwrap();
            state.workers.remove(&spec.server_id);
            state.inflight.remove(&spec.server_id);
            state.active.insert(
                spec.server_id.clone(),
                ActiveTunnel {
                    server_id: spec.server_id.clone(),
                    display_name: spec.display_name.clone(),
                    socks_port: spec.socks_port,
                    started_at: Instant::now(),
                    is_external: false,
                    proxy_type: ProxyType::Socks5,
                    advertised_auth: if spec.proxy_auth.is_some() {
                        AdvertisedAuth::UserPass
                    } else {
                        AdvertisedAuth::NoAuth
                    },
                    counters: TunnelCounters::new(),
                    reconnect_count: 0,
                    prior_uptime: 0,
                    source: Some("external".into()),
                },
            );
        }
        self.events.publish(EventKind::Connected {
            server_id: spec.server_id.clone(),
            name: spec.display_name.clone(),
            socks_port: spec.socks_port,
            source: Some("external".into()),
        });
        self.logs.push(
            &spec.display_name,
            LogEvent::Connected,
            Some(format!("adopted existing listener on {}", spec.socks_port)),
        );
    }

    async fn on_foreign_port(&self, spec: &ConnectSpec) {
        let ext_id = format!("ext_{}", spec.socks_port);
        let owned = {
            let mut state = self.state.lock().unwrap();
            state.inflight.remove(&spec.server_id);
            state.owned_ports.remove(&spec.server_id);
            state.active.insert(
                ext_id.clone(),
                external_entry(spec.socks_port, ProxyType::Unknown, AdvertisedAuth::Unknown),
            );
            state.owned_ports.clone()
        };
        self.persist_owned(owned).await;
        // Only now does the worker count as gone; shutdown joins on this.
        self.state.lock().unwrap().workers.remove(&spec.server_id);
        self.logs.push(
            &spec.display_name,
            LogEvent::Warning,
            Some(format!("port {} is held by a foreign process", spec.socks_port)),
        );
        self.events.publish(EventKind::Error {
            server_id: Some(spec.server_id.clone()),
            message: format!("socks port {} is held by a foreign process", spec.socks_port),
        });
    }

    async fn on_worker_finished(self: &Arc<Self>, spec: &ConnectSpec, reason: DisconnectReason) {
        // The workers entry stays in place until the stats flush below has
        // landed: shutdown and rebind treat its presence as "teardown still
        // in flight".
        let (tunnel, record, owned) = {
            let mut state = self.state.lock().unwrap();
            state.inflight.remove(&spec.server_id);
            state.owned_ports.remove(&spec.server_id);
            let tunnel = state.active.remove(&spec.server_id);
            let record = state
                .servers
                .iter()
                .find(|r| r.id == spec.server_id)
                .cloned();

            // Park reconnect bookkeeping for the successor session.
            if let Some(t) = &tunnel {
                if !reason.is_deliberate() {
                    state.carry.insert(
                        spec.server_id.clone(),
                        CarryOver {
                            reconnects: t.reconnect_count + 1,
                            uptime: t.total_uptime_secs(),
                        },
                    );
                }
            }
            (tunnel, record, state.owned_ports.clone())
        };

        self.persist_owned(owned).await;

        if let Some(tunnel) = &tunnel {
            let sample = StatsSample {
                server_id: spec.server_id.clone(),
                timestamp: Utc::now().timestamp_millis(),
                uptime_sec: tunnel.uptime_secs() as i64,
                bytes_in: tunnel.counters.bytes_in.load(std::sync::atomic::Ordering::Relaxed)
                    as i64,
                bytes_out: tunnel.counters.bytes_out.load(std::sync::atomic::Ordering::Relaxed)
                    as i64,
                latency_ms: tunnel.counters.latency().map(|ms| ms as i64),
                reconnect_count: tunnel.reconnect_count as i64,
                disconnect_reason: Some(reason.to_string()),
            };
            if let Err(e) = self.db.insert_sample(&sample).await {
                warn!("failed to record stats sample for {}: {e:#}", spec.server_id);
            }

            self.events.publish(EventKind::Disconnected {
                server_id: spec.server_id.clone(),
                reason: reason.to_string(),
            });
            self.logs.push(
                &spec.display_name,
                LogEvent::Disconnected,
                Some(reason.to_string()),
            );
        } else {
            // Never reached CONNECTED.
            self.events.publish(EventKind::Error {
                server_id: Some(spec.server_id.clone()),
                message: reason.to_string(),
            });
            self.logs.push(
                &spec.display_name,
                LogEvent::Error,
                Some(reason.to_string()),
            );
        }

        self.state.lock().unwrap().workers.remove(&spec.server_id);

        let auto_reconnect = record.as_ref().map(|r| r.auto_reconnect).unwrap_or(false);
        if !reason.is_deliberate() && auto_reconnect {
            self.arm_reconnect(&spec.server_id);
        } else {
            debug!(
                "not reconnecting {} (reason {reason}, auto_reconnect {auto_reconnect})",
                spec.server_id
            );
        }
    }

    fn arm_reconnect(self: &Arc<Self>, server_id: &str) {
        let manager = self.clone();
        let id = server_id.to_string();
        if let Some((attempt, delay)) = self.scheduler.arm(server_id, async move {
            manager.reconnect_fire(id).await;
        }) {
            self.events.publish(EventKind::Reconnecting {
                server_id: server_id.to_string(),
                attempt,
                next_retry_ms: delay.as_millis() as u64,
            });
        }
    }

    async fn reconnect_fire(self: Arc<Self>, server_id: String) {
        let wanted = {
            let state = self.state.lock().unwrap();
            state.servers.iter().any(|r| r.id == server_id)
                && !state.workers.contains_key(&server_id)
        };
        if !wanted {
            self.scheduler.cancel(&server_id);
            return;
        }
        if let Err(e) = self
            .connect_with_port(&server_id, ConnectSource::Reconnect, None)
            .await
        {
            debug!("reconnect attempt for {server_id} not started: {e}");
        }
    }

    /// Command a tunnel down. `disable` also clears the record's
    /// was-commanded-on flag (false for transparent rebinds).
    pub async fn disconnect(
        self: &Arc<Self>,
        server_id: &str,
        reason: DisconnectReason,
        disable: bool,
    ) -> ApiResult<()> {
        eprintln!("DBG disconnect: before wait_ready");
        self.wait_ready().await;
        eprintln!("DBG disconnect: after wait_ready");
        self.scheduler.cancel(server_id);
        eprintln!("DBG disconnect: after scheduler.cancel");

        enum Action {
            Cancel(CancellationToken),
            Removed(u16),
            Missing,
        }

        eprintln!("DBG disconnect: before lock");
        let action = {
            let mut state = self.state.lock().unwrap();
            eprintln!("DBG disconnect: got lock");
            state.carry.remove(server_id);
            if let Some(handle) = state.workers.get(server_id) {
                *handle.pending_reason.lock().unwrap() = Some(reason.clone());
                Action::Cancel(handle.token.clone())
            } else if let Some(tunnel) = state.active.remove(server_id) {
                // Adopted or external entry with no worker behind it.
                state.owned_ports.remove(server_id);
                Action::Removed(tunnel.socks_port)
            } else {
                Action::Missing
            }
        };

        match action {
            Action::Cancel(token) => token.cancel(),
            Action::Removed(_) => {
                let owned = self.state.lock().unwrap().owned_ports.clone();
                self.persist_owned(owned).await;
                self.events.publish(EventKind::Disconnected {
                    server_id: server_id.to_string(),
                    reason: reason.to_string(),
                });
            }
            Action::Missing => return Err(ApiError::NotFound("tunnel".into())),
        }

        if disable && reason.is_deliberate() {
            self.set_enabled_flag(server_id, false).await;
        }
        Ok(())
    }

    pub async fn disconnect_all(self: &Arc<Self>, reason: DisconnectReason) -> usize {
        self.wait_ready().await;
        let ids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .workers
                .keys()
                .cloned()
                .chain(
                    state
                        .active
                        .values()
                        .filter(|t| !t.is_external)
                        .map(|t| t.server_id.clone()),
                )
                .collect::<HashSet<_>>()
                .into_iter()
                .collect()
        };

        let mut count = 0;
        for id in ids {
            if self.disconnect(&id, reason.clone(), true).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    /// Graceful daemon shutdown: every worker drains and its supervisor is
    /// joined, so the final stats sample each exit path records has landed
    /// before the runtime is allowed to wind down.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("shutting down tunnel engine");
        self.scheduler.cancel_all();
        self.disconnect_all(DisconnectReason::UserDisconnect).await;

        let supervisors: Vec<(String, JoinHandle<()>)> =
            self.supervisors.lock().unwrap().drain().collect();
        for (server_id, handle) in supervisors {
            if timeout(WORKER_WAIT, handle).await.is_err() {
                warn!("supervisor for {server_id} did not finish within {WORKER_WAIT:?}");
            }
        }
        // A worker that failed mid-shutdown may have re-armed a retry.
        self.scheduler.cancel_all();
        self.shutdown.cancel();
    }

    // =========================================================================
    // Server records
    // =========================================================================

    pub async fn list_servers(&self) -> Vec<ServerRecord> {
        self.wait_ready().await;
        self.state.lock().unwrap().servers.clone()
    }

    pub async fn add_server(self: &Arc<Self>, portable: PortableServer) -> ApiResult<String> {
        self.wait_ready().await;
        let mut record = portable.record;
        validate_record(&record)?;

        record.id = Uuid::new_v4().to_string();

        let servers = {
            let mut state = self.state.lock().unwrap();
            if state
                .servers
                .iter()
                .any(|r| r.endpoint_key() == record.endpoint_key())
            {
                return Err(ApiError::BadRequest(
                    "server with same host, username and port already exists".into(),
                ));
            }
            state.servers.push(record.clone());
            state.servers.clone()
        };

        self.store_secrets(
            &record.id,
            portable.password.as_deref(),
            portable.private_key.as_deref(),
            portable.key_passphrase.as_deref(),
        );
        self.db.save_servers(&servers).await?;

        self.events.publish(EventKind::ServerAdded {
            server_id: record.id.clone(),
            name: record.name.clone(),
        });
        self.logs.push(&record.name, LogEvent::Info, Some("server added".into()));
        Ok(record.id)
    }

    pub async fn update_server(
        self: &Arc<Self>,
        server_id: &str,
        update: ServerUpdate,
    ) -> ApiResult<ServerRecord> {
        self.wait_ready().await;

        let (updated, servers, needs_rebind) = {
            let mut state = self.state.lock().unwrap();
            let worker_port = state.workers.get(server_id).map(|h| h.socks_port);
            let record = state
                .servers
                .iter_mut()
                .find(|r| r.id == server_id)
                .ok_or_else(|| ApiError::NotFound("server".into()))?;

            update.apply(record);
            validate_record(record)?;

            let updated = record.clone();
            let needs_rebind = worker_port.is_some_and(|p| p != updated.socks_port);
            (updated, state.servers.clone(), needs_rebind)
        };

        self.store_secrets(
            server_id,
            update.password.as_deref(),
            update.private_key.as_deref(),
            update.key_passphrase.as_deref(),
        );
        self.db.save_servers(&servers).await?;

        if needs_rebind {
            info!("socks port changed for {server_id}, rebinding live tunnel");
            self.disconnect(server_id, DisconnectReason::ApiDisconnect, false)
                .await
                .ok();
            self.wait_for_worker_exit(server_id).await;
            self.connect(server_id, ConnectSource::Rebind).await.ok();
        }
        Ok(updated)
    }

    pub async fn delete_server(self: &Arc<Self>, server_id: &str) -> ApiResult<()> {
        self.wait_ready().await;
        self.scheduler.cancel(server_id);

        let (record, servers, profiles, owned) = {
            let mut state = self.state.lock().unwrap();
            let idx = state
                .servers
                .iter()
                .position(|r| r.id == server_id)
                .ok_or_else(|| ApiError::NotFound("server".into()))?;
            let record = state.servers.remove(idx);

            if let Some(handle) = state.workers.get(server_id) {
                *handle.pending_reason.lock().unwrap() = Some(DisconnectReason::ApiDisconnect);
                handle.token.cancel();
            }
            state.active.remove(server_id);
            state.owned_ports.remove(server_id);
            state.carry.remove(server_id);
            state.profiles.retain(|p| p.server_id != server_id);
            (
                record,
                state.servers.clone(),
                state.profiles.clone(),
                state.owned_ports.clone(),
            )
        };

        self.db.save_servers(&servers).await?;
        self.db.save_profiles(&profiles).await?;
        self.persist_owned(owned).await;
        self.secrets.purge_server(server_id);
        self.db.purge_stats_for(server_id).await.ok();

        self.events.publish(EventKind::ServerDeleted {
            server_id: server_id.to_string(),
        });
        self.logs.push(&record.name, LogEvent::Info, Some("server deleted".into()));
        Ok(())
    }

    async fn set_enabled_flag(&self, server_id: &str, enabled: bool) {
        let servers = {
            let mut state = self.state.lock().unwrap();
            if let Some(record) = state.servers.iter_mut().find(|r| r.id == server_id) {
                record.is_enabled = enabled;
            }
            state.servers.clone()
        };
        if let Err(e) = self.db.save_servers(&servers).await {
            warn!("failed to persist isEnabled for {server_id}: {e:#}");
        }
    }

    async fn wait_for_worker_exit(&self, server_id: &str) {
        let handle = self.supervisors.lock().unwrap().remove(server_id);
        if let Some(handle) = handle {
            if timeout(WORKER_WAIT, handle).await.is_err() {
                warn!("worker {server_id} did not exit within {WORKER_WAIT:?}");
            }
        }
    }

    fn store_secrets(
        &self,
        server_id: &str,
        password: Option<&str>,
        private_key: Option<&str>,
        key_passphrase: Option<&str>,
    ) {
        let pairs = [
            ("password", password),
            ("privateKey", private_key),
            ("keyPassphrase", key_passphrase),
        ];
        for (kind, value) in pairs {
            if let Some(value) = value {
                let key = format!("{kind}_{server_id}");
                if let Err(e) = self.secrets.put(&key, value.as_bytes()) {
                    warn!("failed to store secret {key}: {e:#}");
                }
            }
        }
    }

    // =========================================================================
    // Import / export
    // =========================================================================

    pub async fn export(&self, include_keys: bool) -> serde_json::Value {
        self.wait_ready().await;
        let servers = self.state.lock().unwrap().servers.clone();

        let portable: Vec<PortableServer> = servers
            .into_iter()
            .map(|record| {
                let (password, private_key, key_passphrase) = if include_keys {
                    (
                        self.secrets.get_string(&format!("password_{}", record.id)),
                        self.secrets.get_string(&format!("privateKey_{}", record.id)),
                        self.secrets
                            .get_string(&format!("keyPassphrase_{}", record.id)),
                    )
                } else {
                    (None, None, None)
                };
                PortableServer {
                    record,
                    password,
                    private_key,
                    key_passphrase,
                }
            })
            .collect();

        let count = portable.len();
        serde_json::json!({
            "servers": portable,
            "exportedAt": Utc::now(),
            "count": count,
            "includesKeys": include_keys,
        })
    }

    /// Import servers, deduplicating on (host, username, sshPort). Returns
    /// (imported, skipped).
    pub async fn import(self: &Arc<Self>, incoming: Vec<PortableServer>) -> ApiResult<(usize, usize)> {
        self.wait_ready().await;

        let mut imported = Vec::new();
        let mut skipped = 0usize;

        let servers = {
            let mut state = self.state.lock().unwrap();
            let mut seen: HashSet<_> = state
                .servers
                .iter()
                .map(|r| r.endpoint_key())
                .collect();

            for mut portable in incoming {
                if validate_record(&portable.record).is_err()
                    || !seen.insert(portable.record.endpoint_key())
                {
                    skipped += 1;
                    continue;
                }
                let id_taken = portable.record.id.is_empty()
                    || state.servers.iter().any(|r| r.id == portable.record.id);
                if id_taken {
                    portable.record.id = Uuid::new_v4().to_string();
                }
                state.servers.push(portable.record.clone());
                imported.push(portable);
            }
            state.servers.clone()
        };

        for portable in &imported {
            self.store_secrets(
                &portable.record.id,
                portable.password.as_deref(),
                portable.private_key.as_deref(),
                portable.key_passphrase.as_deref(),
            );
            self.events.publish(EventKind::ServerAdded {
                server_id: portable.record.id.clone(),
                name: portable.record.name.clone(),
            });
        }
        self.db.save_servers(&servers).await?;

        info!("import: {} added, {skipped} duplicates skipped", imported.len());
        Ok((imported.len(), skipped))
    }

    // =========================================================================
    // Profiles
    // =========================================================================

    pub async fn list_profiles(&self) -> Vec<QuickProfile> {
        self.wait_ready().await;
        self.state.lock().unwrap().profiles.clone()
    }

    pub async fn add_profile(
        self: &Arc<Self>,
        server_id: &str,
        display_name: &str,
        socks_port_override: Option<u16>,
    ) -> ApiResult<String> {
        self.wait_ready().await;
        if socks_port_override == Some(0) {
            return Err(ApiError::BadRequest("socksPortOverride must be 1..65535".into()));
        }

        let profile = QuickProfile {
            id: Uuid::new_v4().to_string(),
            server_id: server_id.to_string(),
            display_name: display_name.to_string(),
            socks_port_override,
        };

        let profiles = {
            let mut state = self.state.lock().unwrap();
            if !state.servers.iter().any(|r| r.id == server_id) {
                return Err(ApiError::NotFound("server".into()));
            }
            state.profiles.push(profile.clone());
            state.profiles.clone()
        };
        self.db.save_profiles(&profiles).await?;
        Ok(profile.id)
    }

    pub async fn delete_profile(self: &Arc<Self>, profile_id: &str) -> ApiResult<()> {
        self.wait_ready().await;
        let profiles = {
            let mut state = self.state.lock().unwrap();
            let before = state.profiles.len();
            state.profiles.retain(|p| p.id != profile_id);
            if state.profiles.len() == before {
                return Err(ApiError::NotFound("profile".into()));
            }
            state.profiles.clone()
        };
        self.db.save_profiles(&profiles).await?;
        Ok(())
    }

    pub async fn connect_profile(self: &Arc<Self>, profile_id: &str) -> ApiResult<()> {
        self.wait_ready().await;
        let profile = {
            let state = self.state.lock().unwrap();
            state
                .profiles
                .iter()
                .find(|p| p.id == profile_id)
                .cloned()
                .ok_or_else(|| ApiError::NotFound("profile".into()))?
        };
        self.connect_with_port(
            &profile.server_id,
            ConnectSource::Profile,
            profile.socks_port_override,
        )
        .await
    }

    // =========================================================================
    // Bulk reconnection (startup, network restore)
    // =========================================================================

    /// Connect every record flagged enabled or connect-on-startup that has
    /// no live worker. Used at daemon start and after connectivity returns.
    pub async fn reconnect_enabled_servers(self: Arc<Self>) {
        self.wait_ready().await;
        let candidates: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .servers
                .iter()
                .filter(|r| r.is_enabled || r.connect_on_startup)
                .filter(|r| !state.workers.contains_key(&r.id))
                .filter(|r| !state.active.contains_key(&r.id))
                .map(|r| r.id.clone())
                .collect()
        };

        for id in candidates {
            if let Err(e) = self.connect(&id, ConnectSource::NetworkRestore).await {
                debug!("bulk reconnect of {id} not started: {e}");
            }
        }
    }

    pub async fn connect_startup_servers(self: &Arc<Self>) {
        self.wait_ready().await;
        let candidates: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .servers
                .iter()
                .filter(|r| r.connect_on_startup || r.is_enabled)
                .map(|r| r.id.clone())
                .collect()
        };
        for id in candidates {
            if let Err(e) = self.connect(&id, ConnectSource::Startup).await {
                debug!("startup connect of {id} not started: {e}");
            }
        }
    }

    // =========================================================================
    // Scanner
    // =========================================================================

    pub fn scan_progress(&self) -> Arc<ScanProgress> {
        self.scan.clone()
    }

    pub fn scan_progress_snapshot(&self) -> ScanProgressSnapshot {
        self.scan.snapshot()
    }

    pub fn start_scan(self: &Arc<Self>) -> ApiResult<()> {
        if !self.scan.try_start() {
            return Err(ApiError::BadRequest("scan already running".into()));
        }
        let manager = self.clone();
        tokio::spawn(async move {
            scanner::scan_all_ports(manager).await;
        });
        Ok(())
    }

    /// Ports whose listeners belong to this daemon right now.
    pub fn owned_socks_ports(&self) -> HashSet<u16> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .values()
            .map(|h| h.socks_port)
            .chain(
                state
                    .active
                    .values()
                    .filter(|t| !t.is_external)
                    .map(|t| t.socks_port),
            )
            .collect()
    }

    pub fn register_external_tunnel(
        &self,
        port: u16,
        proxy_type: ProxyType,
        advertised_auth: AdvertisedAuth,
    ) {
        let mut state = self.state.lock().unwrap();
        // A port served by one of our managed tunnels never shows up as
        // external, even if a scan raced a connect.
        if state
            .active
            .values()
            .any(|t| !t.is_external && t.socks_port == port)
        {
            return;
        }
        let ext_id = format!("ext_{port}");
        state
            .active
            .insert(ext_id, external_entry(port, proxy_type, advertised_auth));
    }

    // =========================================================================
    // Health monitor hooks
    // =========================================================================

    pub fn health_targets(&self) -> Vec<HealthTarget> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .filter(|(id, _)| {
                state
                    .active
                    .get(*id)
                    .map(|t| !t.is_external)
                    .unwrap_or(false)
            })
            .filter_map(|(id, handle)| {
                let ssh = handle.ssh_slot.lock().unwrap().clone()?;
                Some(HealthTarget {
                    server_id: id.clone(),
                    ssh,
                    counters: handle.counters.clone(),
                })
            })
            .collect()
    }

    pub fn synthesize_keepalive_loss(&self, server_id: &str) {
        let token = {
            let state = self.state.lock().unwrap();
            state.workers.get(server_id).map(|handle| {
                *handle.pending_reason.lock().unwrap() =
                    Some(DisconnectReason::KeepaliveTimeout);
                handle.token.clone()
            })
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    pub fn publish_stats_event(&self, server_id: &str) {
        let snapshot = {
            let state = self.state.lock().unwrap();
            state.active.get(server_id).map(|t| t.snapshot())
        };
        if let Some(s) = snapshot {
            self.events.publish(EventKind::Stats {
                server_id: s.server_id,
                uptime: s.uptime_sec,
                bytes_in: s.bytes_in,
                bytes_out: s.bytes_out,
                latency_ms: s.latency_ms,
            });
        }
    }

    // =========================================================================
    // Snapshots, stats, settings, auth
    // =========================================================================

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn tunnels(&self) -> Vec<crate::server::model::TunnelSnapshot> {
        let state = self.state.lock().unwrap();
        let mut list: Vec<_> = state.active.values().map(|t| t.snapshot()).collect();
        list.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        list
    }

    pub fn status(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        serde_json::json!({
            "running": true,
            "uptimeSec": self.started_at.elapsed().as_secs(),
            "servers": state.servers.len(),
            "activeTunnels": state.active.len(),
            "workers": state.workers.len(),
            "apiAuthEnabled": state.api_auth_enabled,
            "eventSubscribers": self.events.subscriber_count(),
            "scan": self.scan.snapshot(),
        })
    }

    pub async fn stats(&self, server_id: &str, period: StatsPeriod) -> ApiResult<StatsReport> {
        self.wait_ready().await;
        Ok(self
            .db
            .query_stats(server_id, period)
            .await
            .context("stats query failed")?)
    }

    pub async fn get_settings(&self) -> AppSettings {
        self.wait_ready().await;
        self.state.lock().unwrap().settings.clone()
    }

    pub async fn put_settings(&self, settings: AppSettings) -> ApiResult<AppSettings> {
        self.wait_ready().await;
        if settings.keepalive_interval_secs == 0 || settings.connect_timeout_secs == 0 {
            return Err(ApiError::BadRequest("intervals must be positive".into()));
        }
        self.db.save_settings(&settings).await?;
        self.state.lock().unwrap().settings = settings.clone();
        Ok(settings)
    }

    /// (enabled, token) pair for the API auth middleware.
    pub fn auth_config(&self) -> (bool, String) {
        let state = self.state.lock().unwrap();
        (state.api_auth_enabled, state.api_token.clone())
    }

    pub async fn regenerate_token(&self) -> ApiResult<String> {
        self.wait_ready().await;
        let token = generate_token();
        self.db.save_api_token(&token).await?;
        self.state.lock().unwrap().api_token = token.clone();
        Ok(token)
    }

    pub async fn set_auth_enabled(&self, enabled: bool) -> ApiResult<()> {
        self.wait_ready().await;
        self.db.save_api_auth_enabled(enabled).await?;
        self.state.lock().unwrap().api_auth_enabled = enabled;
        Ok(())
    }

    pub fn set_api_port(&self, port: u16) {
        self.state.lock().unwrap().api_port = Some(port);
    }

    pub fn api_port(&self) -> Option<u16> {
        self.state.lock().unwrap().api_port
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.events.clone()
    }

    pub fn log_tail(&self, limit: usize) -> Vec<crate::logs::LogEntry> {
        self.logs.tail(limit)
    }

    async fn persist_owned(&self, owned: HashSet<String>) {
        if let Err(e) = self.db.save_owned_tunnels(&owned).await {
            warn!("failed to persist owned-tunnels set: {e:#}");
        }
    }

}

fn external_entry(port: u16, proxy_type: ProxyType, advertised_auth: AdvertisedAuth) -> ActiveTunnel {
    ActiveTunnel {
        server_id: format!("ext_{port}"),
        display_name: format!("external proxy on {port}"),
        socks_port: port,
        started_at: Instant::now(),
        is_external: true,
        proxy_type,
        advertised_auth,
        counters: TunnelCounters::new(),
        reconnect_count: 0,
        prior_uptime: 0,
        source: Some("scan".into()),
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn validate_record(record: &ServerRecord) -> ApiResult<()> {
    if record.name.trim().is_empty() {
        return Err(ApiError::BadRequest("name must not be empty".into()));
    }
    if record.host.trim().is_empty() {
        return Err(ApiError::BadRequest("host must not be empty".into()));
    }
    if record.username.trim().is_empty() {
        return Err(ApiError::BadRequest("username must not be empty".into()));
    }
    if record.ssh_port == 0 {
        return Err(ApiError::BadRequest("sshPort must be 1..65535".into()));
    }
    if record.socks_port == 0 {
        return Err(ApiError::BadRequest("socksPort must be 1..65535".into()));
    }
    Ok(())
}

/// Partial update body for `PUT /servers/{id}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub host: Option<String>,
    pub ssh_port: Option<u16>,
    pub username: Option<String>,
    pub auth_type: Option<AuthType>,
    pub socks_port: Option<u16>,
    pub key_path: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub connect_on_startup: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub key_passphrase: Option<String>,
}

impl ServerUpdate {
    fn apply(&self, record: &mut ServerRecord) {
        if let Some(v) = &self.name {
            record.name = v.clone();
        }
        if let Some(v) = &self.host {
            record.host = v.clone();
        }
        if let Some(v) = self.ssh_port {
            record.ssh_port = v;
        }
        if let Some(v) = &self.username {
            record.username = v.clone();
        }
        if let Some(v) = self.auth_type {
            record.auth_type = v;
        }
        if let Some(v) = self.socks_port {
            record.socks_port = v;
        }
        if let Some(v) = &self.key_path {
            record.key_path = Some(v.clone());
        }
        if let Some(v) = &self.proxy_username {
            record.proxy_username = Some(v.clone());
        }
        if let Some(v) = &self.proxy_password {
            record.proxy_password = Some(v.clone());
        }
        if let Some(v) = self.auto_reconnect {
            record.auto_reconnect = v;
        }
        if let Some(v) = self.connect_on_startup {
            record.connect_on_startup = v;
        }
        if let Some(v) = self.notifications_enabled {
            record.notifications_enabled = v;
        }
    }
}
