use std::{sync::Arc, time::Duration};

use range_cache::{MemoryRangeCache, RangeCache};
use server_api::ApiContext;
use storage::Storage;

use crate::{config::Settings, hub::FanoutHub};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) hub: Arc<FanoutHub>,
    pub(crate) request_timeout: Duration,
}

impl AppState {
    pub(crate) fn new(storage: Storage, settings: &Settings) -> Self {
        let cache: Arc<dyn RangeCache> = Arc::new(MemoryRangeCache::new(
            settings.cache_capacity,
            Duration::from_secs(settings.cache_ttl_seconds),
        ));
        Self {
            api: ApiContext { storage, cache },
            hub: Arc::new(FanoutHub::new(settings.session_buffer)),
            request_timeout: Duration::from_secs(settings.request_timeout_seconds.max(1)),
        }
    }
}
