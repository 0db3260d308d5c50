use std::sync::Arc;

use crate::server::TunnelManager;

/// Shared state handed to every control API handler.
pub struct AppState {
    pub manager: Arc<TunnelManager>,
}
