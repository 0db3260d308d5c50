//! Fleet-wide liveness probing.
//!
//! Every 30 s each worker-backed tunnel gets a probe: a closed SSH session
//! becomes a synthesized `keepalive_timeout` disconnect, a live one gets a
//! latency measurement via a no-op remote command. Probe failures are
//! non-fatal; they only null the latency reading.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::manager::TunnelManager;

const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// Overall deadline for one latency probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn spawn(manager: Arc<TunnelManager>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PROBE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The interval fires immediately; skip that first tick so freshly
        // started tunnels are not probed during their handshake.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => probe_fleet(&manager).await,
            }
        }
    })
}

async fn probe_fleet(manager: &Arc<TunnelManager>) {
    for target in manager.health_targets() {
        if target.ssh.is_closed() {
            warn!(
                "ssh session for {} reports closed, synthesizing disconnect",
                target.server_id
            );
            manager.synthesize_keepalive_loss(&target.server_id);
            continue;
        }

        match target.ssh.measure_latency(PROBE_TIMEOUT).await {
            Ok(latency) => {
                debug!("latency for {}: {latency:?}", target.server_id);
                target.counters.record_latency(latency);
            }
            Err(e) => {
                debug!("latency probe for {} failed: {e:#}", target.server_id);
                target.counters.clear_latency();
            }
        }

        manager.publish_stats_event(&target.server_id);
    }
}
