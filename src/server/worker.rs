//! The worker that owns one tunnel: one SSH session, one SOCKS5 listener,
//! and the state machine tying them together.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{classify_error, DisconnectReason};
use crate::server::model::{ConnectSpec, TunnelCounters, WorkerExit, WorkerState};
use crate::server::ssh::{NoKeyError, SshClient};
use crate::socks;

/// Grace period for in-flight SOCKS sessions when draining.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Deadline for the port-busy probe connect.
const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
/// How often the connected loop re-checks the SSH session for closure.
const LIVENESS_TICK: Duration = Duration::from_secs(2);

pub struct WorkerContext {
    pub spec: ConnectSpec,
    pub counters: Arc<TunnelCounters>,
    /// Cancelled by the manager on disconnect; the commanded reason is parked
    /// in `pending_reason` first.
    pub token: CancellationToken,
    pub state_tx: watch::Sender<WorkerState>,
    /// Shared slot the health monitor reads the live SSH client from.
    pub ssh_slot: Arc<Mutex<Option<SshClient>>>,
    /// Whether the owned-tunnels set contained this server id at start time.
    pub port_owned_hint: bool,
    pub pending_reason: Arc<Mutex<Option<DisconnectReason>>>,
}

impl WorkerContext {
    fn set_state(&self, state: WorkerState) {
        debug!("worker {} -> {state:?}", self.spec.server_id);
        let _ = self.state_tx.send(state);
    }

    fn take_reason(&self) -> DisconnectReason {
        self.pending_reason
            .lock()
            .unwrap()
            .take()
            .unwrap_or(DisconnectReason::UserDisconnect)
    }
}

/// Drive the worker from IDLE to a terminal state. The returned exit is
/// consumed by the manager's supervisor task.
pub async fn run(ctx: WorkerContext) -> WorkerExit {
    let spec = ctx.spec.clone();

    // --- DIALING ---
    ctx.set_state(WorkerState::Dialing);
    let session = match SshClient::dial(&spec).await {
        Ok(session) => session,
        Err(e) => return fail(&ctx, &e, &spec.host),
    };
    if ctx.token.is_cancelled() {
        ctx.set_state(WorkerState::Terminated);
        return WorkerExit::Finished(ctx.take_reason());
    }

    // --- AUTHENTICATING ---
    ctx.set_state(WorkerState::Authenticating);
    let ssh = match SshClient::authenticate(session, &spec).await {
        Ok(ssh) => ssh,
        Err(e) => return fail(&ctx, &e, &spec.host),
    };

    // --- BINDING ---
    ctx.set_state(WorkerState::Binding);
    let listener = match bind_socks_listener(spec.socks_port).await {
        BindOutcome::Bound(listener) => listener,
        BindOutcome::Busy => {
            // Someone is already serving the port. Ours or foreign?
            ssh.disconnect().await;
            ctx.set_state(WorkerState::Terminated);
            return if ctx.port_owned_hint {
                info!(
                    "adopting existing listener on {} for {}",
                    spec.socks_port, spec.server_id
                );
                WorkerExit::Adopted
            } else {
                info!("port {} is bound by a foreign process", spec.socks_port);
                WorkerExit::ForeignPort
            };
        }
        BindOutcome::Failed(e) => {
            warn!("failed to bind socks port {}: {e}", spec.socks_port);
            ssh.disconnect().await;
            ctx.set_state(WorkerState::Failed(DisconnectReason::PortBusy));
            return WorkerExit::Finished(DisconnectReason::PortBusy);
        }
    };

    // --- CONNECTED ---
    *ctx.ssh_slot.lock().unwrap() = Some(ssh.clone());
    ctx.set_state(WorkerState::Connected);
    info!(
        "tunnel {} up: socks5 on 0.0.0.0:{}",
        spec.server_id, spec.socks_port
    );

    let reason = connected_loop(&ctx, &ssh, listener).await;

    // --- DRAINING ---
    ctx.set_state(WorkerState::Draining);
    ctx.ssh_slot.lock().unwrap().take();
    ssh.disconnect().await;

    let terminal = if reason.is_deliberate() {
        WorkerState::Terminated
    } else {
        WorkerState::Failed(reason.clone())
    };
    ctx.set_state(terminal);
    WorkerExit::Finished(reason)
}

fn fail(ctx: &WorkerContext, err: &anyhow::Error, host: &str) -> WorkerExit {
    let reason = if err.downcast_ref::<NoKeyError>().is_some() {
        DisconnectReason::NoKey
    } else {
        classify_error(err, host)
    };
    warn!("worker {} failed: {reason} ({err:#})", ctx.spec.server_id);
    ctx.set_state(WorkerState::Failed(reason.clone()));
    WorkerExit::Finished(reason)
}

/// Accept SOCKS clients until cancelled or the SSH session dies. The
/// listener is dropped (and the port released) on the way out; in-flight
/// sessions get [`DRAIN_TIMEOUT`] to finish.
async fn connected_loop(
    ctx: &WorkerContext,
    ssh: &SshClient,
    listener: TcpListener,
) -> DisconnectReason {
    let tracker = TaskTracker::new();
    let mut liveness = tokio::time::interval(LIVENESS_TICK);
    liveness.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            _ = ctx.token.cancelled() => {
                break ctx.take_reason();
            }
            _ = liveness.tick() => {
                if ssh.is_closed() {
                    break DisconnectReason::RemoteClosed;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("socks client {peer} accepted on {}", ctx.spec.socks_port);
                        tracker.spawn(handle_session(
                            stream,
                            ssh.clone(),
                            ctx.spec.proxy_auth.clone(),
                            ctx.counters.clone(),
                        ));
                    }
                    Err(e) => {
                        debug!("accept error on {}: {e}", ctx.spec.socks_port);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    };

    drop(listener);
    tracker.close();
    if timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
        debug!(
            "worker {}: {} socks sessions still open after drain grace",
            ctx.spec.server_id,
            tracker.len()
        );
    }
    reason
}

/// One accepted SOCKS connection. Failures stay inside the session; the
/// worker never sees them.
async fn handle_session(
    mut stream: TcpStream,
    ssh: SshClient,
    proxy_auth: Option<(String, String)>,
    counters: Arc<TunnelCounters>,
) {
    let request = match socks::handshake(&mut stream, proxy_auth.as_ref()).await {
        Ok(request) => request,
        Err(e) => {
            debug!("socks handshake failed: {e}");
            return;
        }
    };

    let channel = match ssh.open_direct_tcpip(&request.host, request.port).await {
        Ok(channel) => channel,
        Err(e) => {
            debug!(
                "channel open to {}:{} failed: {e:#}",
                request.host, request.port
            );
            let _ = socks::reply_failure(&mut stream).await;
            return;
        }
    };

    if let Err(e) = socks::reply_success(&mut stream).await {
        debug!("failed to write socks reply: {e}");
        return;
    }

    if let Err(e) = socks::forward(
        stream,
        channel,
        counters.bytes_in.clone(),
        counters.bytes_out.clone(),
    )
    .await
    {
        debug!(
            "socks session to {}:{} ended with error: {e}",
            request.host, request.port
        );
    }
}

enum BindOutcome {
    Bound(TcpListener),
    /// The port answers connects; somebody is serving it.
    Busy,
    Failed(std::io::Error),
}

/// Bind 0.0.0.0:port, running the port-busy protocol on collision.
async fn bind_socks_listener(port: u16) -> BindOutcome {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => BindOutcome::Bound(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if probe_port(port).await {
                BindOutcome::Busy
            } else {
                // Bound but not accepting, likely a lingering socket.
                // One more try with address reuse before giving up.
                match bind_with_reuse(port) {
                    Ok(listener) => BindOutcome::Bound(listener),
                    Err(e) => BindOutcome::Failed(e),
                }
            }
        }
        Err(e) => BindOutcome::Failed(e),
    }
}

async fn probe_port(port: u16) -> bool {
    matches!(
        timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

fn bind_with_reuse(port: u16) -> std::io::Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::from(([0, 0, 0, 0], port)))?;
    socket.listen(1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_detects_accepting_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port(port).await);
        drop(listener);
        assert!(!probe_port(port).await);
    }

    #[tokio::test]
    async fn bind_reports_busy_when_port_is_served() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        match bind_socks_listener(port).await {
            BindOutcome::Busy => {}
            _ => panic!("expected busy outcome"),
        }
    }
}
