use std::sync::Arc;

use {secrecy::Secret, switchboard_relay::Switchboard};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub switchboard: Arc<Switchboard>,
    /// When set, webhook callers must present this value.
    pub webhook_secret: Option<Arc<Secret<String>>>,
    pub version: &'static str,
}

impl AppState {
    pub fn new(switchboard: Arc<Switchboard>, webhook_secret: Option<Secret<String>>) -> Self {
        Self {
            switchboard,
            webhook_secret: webhook_secret.map(Arc::new),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
