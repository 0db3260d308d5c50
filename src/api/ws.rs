//! `/ws/events`: streams bus events as JSON text frames.
//!
//! On subscribe the client first receives a `connected` frame for every
//! tunnel currently in the active list, then live events in publish order.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use log::debug;

use crate::events::{Event, EventKind};
use crate::state::AppState;

pub async fn ws_events(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let bus = state.manager.event_bus();

    // Subscribe before snapshotting so no event between the two is lost;
    // a duplicate `connected` frame is harmless, a missing one is not.
    let mut sub = bus.subscribe();

    for tunnel in state.manager.tunnels() {
        let frame = Event::now(EventKind::Connected {
            server_id: tunnel.server_id,
            name: tunnel.name,
            socks_port: tunnel.socks_port,
            source: Some("snapshot".into()),
        });
        if send_event(&mut socket, &frame).await.is_err() {
            bus.unsubscribe(sub.id);
            return;
        }
    }

    loop {
        tokio::select! {
            event = sub.rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut socket, &event).await.is_err() {
                            break;
                        }
                    }
                    // Evicted as a slow consumer or bus went away.
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames (pings, stray text) are ignored.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    bus.unsubscribe(sub.id);
    debug!("ws subscriber {} detached", sub.id);
}

async fn send_event(socket: &mut WebSocket, event: &Event) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).unwrap_or_else(|_| "{}".into());
    socket.send(Message::Text(json.into())).await
}
