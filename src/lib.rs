//! Live collaboration server: rooms of clients editing one shared document
//! (rich text plus a node/edge graph), presence, and periodic persistence.

pub mod client;
pub mod config;
pub mod db;
pub mod doc;
pub mod docs;
pub mod handlers;
pub mod models;
pub mod room;
pub mod routes;
pub mod ws;

use std::sync::Arc;

use config::Config;
use room::Registry;

/// Shared state of the HTTP and WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(registry: Registry, config: Config) -> Self {
        Self {
            registry,
            config: Arc::new(config),
        }
    }
}
