//! Reacts to host connectivity transitions.
//!
//! The platform notifier is out of scope; it is abstracted as a channel of
//! online/offline events. Going online triggers a bulk reconnect of every
//! enabled server after a short settle delay; going offline does nothing,
//! the workers notice the loss themselves.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::server::manager::TunnelManager;

/// Delay between the online signal and the reconnect sweep, giving DHCP/DNS
/// a moment to settle.
const SETTLE_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    Online,
    Offline,
}

pub fn spawn(
    manager: Arc<TunnelManager>,
    mut changes: mpsc::Receiver<NetworkChange>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                change = changes.recv() => {
                    match change {
                        Some(NetworkChange::Online) => {
                            info!("network online, reconnecting enabled servers in {SETTLE_DELAY:?}");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(SETTLE_DELAY) => {}
                            }
                            manager.clone().reconnect_enabled_servers().await;
                        }
                        Some(NetworkChange::Offline) => {
                            debug!("network offline; workers will detect loss on their own");
                        }
                        None => break,
                    }
                }
            }
        }
    })
}
