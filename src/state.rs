use std::sync::Arc;

use crate::config::Config;
use crate::engine::chat::ChatRelay;
use crate::engine::fanout::EventFanout;
use crate::engine::lifecycle::OrderCoordinator;
use crate::engine::matching::DriverMatcher;
use crate::observability::metrics::Metrics;
use crate::store::{MemoryStore, OrderStore};

pub struct AppState {
    pub coordinator: OrderCoordinator,
    pub chat: ChatRelay,
    pub matcher: DriverMatcher,
    pub fanout: EventFanout,
    pub metrics: Metrics,
    pub candidate_limit: usize,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn OrderStore>, config: &Config) -> Self {
        let metrics = Metrics::new();
        let fanout = EventFanout::new(config.subscriber_buffer_size, metrics.clone());

        Self {
            coordinator: OrderCoordinator::new(store.clone(), fanout.clone(), metrics.clone()),
            chat: ChatRelay::new(store.clone(), fanout.clone(), metrics.clone()),
            matcher: DriverMatcher::new(store),
            fanout,
            metrics,
            candidate_limit: config.candidate_limit,
        }
    }
}
