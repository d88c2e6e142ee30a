use std::sync::Arc;

use config::Config;
use discover::{DiscoveryEngine, ProfileDirectory};

pub mod config;
pub mod discover;
pub mod error;
pub mod middleware;
pub mod utils;

pub mod routes;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub engine: DiscoveryEngine,
    pub profiles: Arc<dyn ProfileDirectory>,
}
