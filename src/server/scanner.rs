//! Local port sweep and proxy classification.
//!
//! Connects to every port on 127.0.0.1 in batches, then probes each open
//! port that we do not own ourselves: first with a SOCKS5 greeting, then
//! with a literal HTTP CONNECT. Findings land in the manager's active list
//! as external tunnels.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::server::manager::TunnelManager;
use crate::server::model::{AdvertisedAuth, ProxyType};

const BATCH_SIZE: u16 = 500;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(150);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_READ_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Default)]
pub struct ScanProgress {
    running: AtomicBool,
    scanned: AtomicU32,
    open_found: AtomicU32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanProgressSnapshot {
    pub running: bool,
    pub scanned: u32,
    pub total: u32,
    pub ratio: f64,
    pub open_found: u32,
}

impl ScanProgress {
    const TOTAL: u32 = 65535;

    /// Try to claim the scanner; only one sweep runs at a time.
    pub fn try_start(&self) -> bool {
        let claimed = self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if claimed {
            self.scanned.store(0, Ordering::SeqCst);
            self.open_found.store(0, Ordering::SeqCst);
        }
        claimed
    }

    pub fn finish(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ScanProgressSnapshot {
        let scanned = self.scanned.load(Ordering::SeqCst);
        ScanProgressSnapshot {
            running: self.running.load(Ordering::SeqCst),
            scanned,
            total: Self::TOTAL,
            ratio: scanned as f64 / Self::TOTAL as f64,
            open_found: self.open_found.load(Ordering::SeqCst),
        }
    }
}

/// Sweep 1..=65535 and register non-owned open ports as external tunnels.
/// The caller has already claimed [`ScanProgress`].
pub async fn scan_all_ports(manager: Arc<TunnelManager>) {
    let progress = manager.scan_progress();
    let owned_ports = manager.owned_socks_ports();

    let mut open_ports: Vec<u16> = Vec::new();
    let mut port: u32 = 1;
    while port <= ScanProgress::TOTAL {
        let batch_end = (port + BATCH_SIZE as u32 - 1).min(ScanProgress::TOTAL);
        let probes = (port..=batch_end).map(|p| is_port_open(p as u16));
        let results = join_all(probes).await;

        for (offset, open) in results.into_iter().enumerate() {
            if open {
                open_ports.push((port + offset as u32) as u16);
                progress.open_found.fetch_add(1, Ordering::SeqCst);
            }
        }
        progress
            .scanned
            .fetch_add((batch_end - port + 1) as u32, Ordering::SeqCst);
        port = batch_end + 1;
    }

    info!("port scan finished: {} open ports", open_ports.len());

    for port in open_ports {
        if owned_ports.contains(&port) {
            continue;
        }
        let (proxy_type, advertised_auth) = detect_proxy_info(port).await;
        debug!("port {port}: {proxy_type:?} ({advertised_auth:?})");
        manager.register_external_tunnel(port, proxy_type, advertised_auth);
    }

    progress.finish();
}

async fn is_port_open(port: u16) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Classify what is listening on an open port. Sockets close on every exit
/// path because they are owned by this scope.
pub async fn detect_proxy_info(port: u16) -> (ProxyType, AdvertisedAuth) {
    // (a) SOCKS greeting offering no-auth only.
    if let Ok(Ok(mut stream)) = timeout(
        PROBE_CONNECT_TIMEOUT,
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        if stream.write_all(&[0x05, 0x01, 0x00]).await.is_ok() {
            let mut reply = [0u8; 2];
            if let Ok(Ok(n)) = timeout(PROBE_READ_TIMEOUT, stream.read(&mut reply)).await {
                if n >= 1 && reply[0] == 0x05 {
                    let auth = if n >= 2 {
                        match reply[1] {
                            0x00 => AdvertisedAuth::NoAuth,
                            0xFF | 0x02 => AdvertisedAuth::UserPass,
                            _ => AdvertisedAuth::Unknown,
                        }
                    } else {
                        AdvertisedAuth::Unknown
                    };
                    return (ProxyType::Socks5, auth);
                }
                if n >= 1 && reply[0] == 0x04 {
                    return (ProxyType::Socks4, AdvertisedAuth::Unknown);
                }
            }
        }
    }

    // (b) literal HTTP CONNECT probe.
    if let Ok(Ok(mut stream)) = timeout(
        PROBE_CONNECT_TIMEOUT,
        TcpStream::connect(("127.0.0.1", port)),
    )
    .await
    {
        let probe = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        if stream.write_all(probe).await.is_ok() {
            let mut reply = [0u8; 64];
            if let Ok(Ok(n)) = timeout(PROBE_READ_TIMEOUT, stream.read(&mut reply)).await {
                if String::from_utf8_lossy(&reply[..n]).contains("HTTP/") {
                    return (ProxyType::Http, AdvertisedAuth::Unknown);
                }
            }
        }
    }

    (ProxyType::Unknown, AdvertisedAuth::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn detects_socks5_no_auth_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();
        });

        let (proxy, auth) = detect_proxy_info(port).await;
        assert_eq!(proxy, ProxyType::Socks5);
        assert_eq!(auth, AdvertisedAuth::NoAuth);
    }

    #[tokio::test]
    async fn detects_auth_required_socks5() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            // No-auth not acceptable: auth required.
            stream.write_all(&[0x05, 0xFF]).await.unwrap();
        });

        let (proxy, auth) = detect_proxy_info(port).await;
        assert_eq!(proxy, ProxyType::Socks5);
        assert_eq!(auth, AdvertisedAuth::UserPass);
    }

    #[tokio::test]
    async fn detects_http_proxy() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 256];
                let n = stream.read(&mut buf).await.unwrap();
                // Not a SOCKS greeting: answer only the HTTP probe.
                if buf[..n].starts_with(b"CONNECT") {
                    stream
                        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                        .await
                        .unwrap();
                }
            }
        });

        let (proxy, _) = detect_proxy_info(port).await;
        assert_eq!(proxy, ProxyType::Http);
    }

    #[tokio::test]
    async fn silent_listener_is_unknown() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                let (_stream, _) = listener.accept().await.unwrap();
                // Hold the socket open, say nothing.
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });

        let (proxy, auth) = detect_proxy_info(port).await;
        assert_eq!(proxy, ProxyType::Unknown);
        assert_eq!(auth, AdvertisedAuth::Unknown);
    }

    #[tokio::test]
    async fn progress_single_flight() {
        let progress = ScanProgress::default();
        assert!(progress.try_start());
        assert!(!progress.try_start());
        progress.finish();
        assert!(progress.try_start());
        progress.finish();
    }
}
