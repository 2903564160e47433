pub mod rest;
pub mod ws;

use std::sync::Arc;

use crate::collector::CollectorRegistry;
use crate::storage::MarketStore;
use crate::stream::DistributionHub;

/// Shared handles for the HTTP and websocket handlers.
#[derive(Clone)]
pub struct AppContext {
    pub registry: Arc<CollectorRegistry>,
    pub hub: Arc<DistributionHub>,
    pub store: Arc<dyn MarketStore>,
}

pub use rest::router;
