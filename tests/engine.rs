//! Tunnel engine integration tests that run without a real SSH server:
//! connection attempts against closed local ports exercise the failure
//! classification, event flow and reconnect scheduling.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;

use anser::database::models::{AuthType, PortableServer, ServerRecord};
use anser::database::Db;
use anser::error::DisconnectReason;
use anser::events::{EventKind, Subscription};
use anser::logs::LogBuffer;
use anser::secrets::SecretStore;
use anser::server::manager::TunnelManager;
use anser::server::model::{AdvertisedAuth, ProxyType};
use anser::server::ConnectSource;

async fn test_manager() -> (Arc<TunnelManager>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = Db::open_in_memory().await.unwrap();
    let secrets = SecretStore::open(dir.path()).unwrap();
    let manager = TunnelManager::new(
        db,
        secrets,
        anser::events::EventBus::new(),
        Arc::new(LogBuffer::new()),
    );
    manager.init().await.unwrap();
    (manager, dir)
}

fn record(id_hint: &str, ssh_port: u16, auto_reconnect: bool) -> PortableServer {
    PortableServer {
        record: ServerRecord {
            id: String::new(),
            name: id_hint.to_string(),
            host: "127.0.0.1".into(),
            ssh_port,
            username: "u".into(),
            auth_type: AuthType::Password,
            socks_port: 0x7fff,
            key_path: None,
            proxy_username: None,
            proxy_password: None,
            auto_reconnect,
            connect_on_startup: false,
            notifications_enabled: true,
            is_enabled: false,
        },
        password: Some("p".into()),
        private_key: None,
        key_passphrase: None,
    }
}

/// A port that is certainly closed: bind, read the number, drop.
async fn closed_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

async fn next_event(sub: &mut Subscription) -> EventKind {
    timeout(Duration::from_secs(10), sub.rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("bus closed")
        .kind
}

#[tokio::test]
async fn refused_dial_emits_classified_error() {
    let (manager, _dir) = test_manager().await;
    let port = closed_port().await;
    let id = manager.add_server(record("refused", port, false)).await.unwrap();

    let mut sub = manager.event_bus().subscribe();
    manager.connect(&id, ConnectSource::Api).await.unwrap();

    loop {
        match next_event(&mut sub).await {
            EventKind::Error { server_id, message } => {
                assert_eq!(server_id.as_deref(), Some(id.as_str()));
                assert!(
                    message.starts_with("connection_refused")
                        || message.starts_with("socket_timeout"),
                    "unexpected classification: {message}"
                );
                break;
            }
            EventKind::ServerAdded { .. } | EventKind::Ping {} => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }

    // auto_reconnect off: no timer must be armed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.tunnels().is_empty());
}

#[tokio::test]
async fn failed_connect_arms_backoff_when_auto_reconnect() {
    let (manager, _dir) = test_manager().await;
    let port = closed_port().await;
    let id = manager.add_server(record("retrying", port, true)).await.unwrap();

    let mut sub = manager.event_bus().subscribe();
    manager.connect(&id, ConnectSource::Api).await.unwrap();

    let mut saw_error = false;
    loop {
        match next_event(&mut sub).await {
            EventKind::Error { .. } => saw_error = true,
            EventKind::Reconnecting {
                server_id,
                attempt,
                next_retry_ms,
            } => {
                assert!(saw_error, "reconnecting must follow the failure");
                assert_eq!(server_id, id);
                assert_eq!(attempt, 1);
                assert_eq!(next_retry_ms, 1000);
                break;
            }
            _ => continue,
        }
    }

    // Deleting the server cancels the pending retry chain.
    manager.delete_server(&id).await.unwrap();
}

#[tokio::test]
async fn disconnect_without_tunnel_is_not_found() {
    let (manager, _dir) = test_manager().await;
    let err = manager
        .disconnect("ghost", DisconnectReason::ApiDisconnect, true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[tokio::test]
async fn external_findings_swap_atomically_with_managed() {
    let (manager, _dir) = test_manager().await;

    manager.register_external_tunnel(18080, ProxyType::Socks5, AdvertisedAuth::NoAuth);
    let tunnels = manager.tunnels();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(tunnels[0].server_id, "ext_18080");
    assert!(tunnels[0].is_external);
    assert_eq!(
        serde_json::to_value(tunnels[0].proxy_type).unwrap(),
        json!("SOCKS5")
    );

    // Re-registering the same port replaces in place.
    manager.register_external_tunnel(18080, ProxyType::Http, AdvertisedAuth::Unknown);
    let tunnels = manager.tunnels();
    assert_eq!(tunnels.len(), 1);
    assert_eq!(
        serde_json::to_value(tunnels[0].proxy_type).unwrap(),
        json!("HTTP")
    );

    // Disconnecting an external entry drops it from the list.
    manager
        .disconnect("ext_18080", DisconnectReason::ApiDisconnect, false)
        .await
        .unwrap();
    assert!(manager.tunnels().is_empty());
}

#[tokio::test]
async fn delete_cascades_secrets_and_stats() {
    let (manager, _dir) = test_manager().await;
    let id = manager
        .add_server(record("doomed", 22, false))
        .await
        .unwrap();

    manager.delete_server(&id).await.unwrap();
    assert!(manager.list_servers().await.is_empty());

    // Deleting again reports not-found rather than succeeding silently.
    assert!(manager.delete_server(&id).await.is_err());
}

#[tokio::test]
async fn connect_is_single_flight_per_server() {
    let (manager, _dir) = test_manager().await;

    // A listener that accepts and then says nothing: the SSH version
    // exchange stalls, keeping the attempt in flight long enough to
    // observe the guard.
    let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let ssh_port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let id = manager
        .add_server(record("slow", ssh_port, false))
        .await
        .unwrap();

    manager.connect(&id, ConnectSource::Api).await.unwrap();
    let err = manager.connect(&id, ConnectSource::Api).await.unwrap_err();
    assert!(err.to_string().contains("already"));

    manager
        .disconnect(&id, DisconnectReason::ApiDisconnect, true)
        .await
        .unwrap();
}
