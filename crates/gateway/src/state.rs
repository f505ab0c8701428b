use std::sync::Arc;

use wsp_domain::config::Config;

use crate::node::ProxyNode;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub node: ProxyNode,
}

impl AppState {
    pub fn new(config: Arc<Config>, node: ProxyNode) -> Self {
        Self { config, node }
    }
}
