//! Config storage: the store trait, the composite fan-out store, and the
//! built-in sub-store implementations.

mod api_store;
mod datafile_store;
mod memory_store;

use std::collections::HashSet;
use std::sync::Arc;

pub use api_store::ApiConfigStore;
pub use datafile_store::DatafileConfigStore;
pub use memory_store::MemoryConfigStore;

use crate::options::{ClientOptions, ConfigSource};
use crate::proto::Config;
use crate::stream::{self, StreamConfig};
use crate::Result;

/// Build the sub-store for one configured source. Returns the store and
/// whether it loads asynchronously; async sources report readiness through
/// `on_first_load`, synchronous ones are ready on return.
pub fn build_config_store(
    options: &ClientOptions,
    source: &ConfigSource,
    on_first_load: Box<dyn FnOnce() + Send>,
) -> Result<(Arc<dyn ConfigStoreGetter>, bool)> {
    match source {
        ConfigSource::Memory => Ok((
            Arc::new(MemoryConfigStore::new(&options.inline_configs)),
            false,
        )),
        ConfigSource::Datafile(path) => Ok((
            Arc::new(DatafileConfigStore::new(path, options.project_env_id)?),
            false,
        )),
        ConfigSource::ApiStream => {
            let store = Arc::new(ApiConfigStore::new());
            let stream_config =
                StreamConfig::new(&options.resolved_api_urls()?, options.sdk_key.clone())?;
            stream::start_stream_thread(stream_config, store.clone(), on_first_load)?;
            Ok((store, true))
        }
    }
}

/// Read-side interface every config source implements.
///
/// Implementations must be safe to call from parallel evaluation threads.
pub trait ConfigStoreGetter: Send + Sync {
    /// Look up a config by key.
    fn get_config(&self, key: &str) -> Option<Arc<Config>>;

    /// All keys known to this store.
    fn keys(&self) -> Vec<String>;

    /// Server-supplied default context value for a dotted property path.
    fn get_context_value(&self, _property_name: &str) -> Option<serde_json::Value> {
        None
    }

    /// Project environment id, or 0 when the store has none.
    fn project_env_id(&self) -> i64 {
        0
    }

    /// Capture an immutable read view of this store.
    ///
    /// The resolver takes one view at the top of each resolution and routes
    /// every lookup within it (including decrypt-with and segment
    /// indirection) through that view, so a concurrent store update cannot
    /// mix snapshot versions mid-evaluation. Stores that never change after
    /// construction return themselves.
    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter>;
}

/// Ordered fan-out over sub-stores. The first sub-store that knows a key
/// wins, so caller-provided stores prepended to the built-in sources can
/// override keys without mutating the origin.
///
/// The composite is assembled once at client construction and never mutated
/// afterwards; all runtime mutation happens inside the sub-stores.
pub struct CompositeConfigStore {
    stores: Vec<Arc<dyn ConfigStoreGetter>>,
}

impl CompositeConfigStore {
    pub fn new(stores: Vec<Arc<dyn ConfigStoreGetter>>) -> CompositeConfigStore {
        CompositeConfigStore { stores }
    }
}

impl ConfigStoreGetter for CompositeConfigStore {
    fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.stores.iter().find_map(|store| store.get_config(key))
    }

    fn keys(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for store in &self.stores {
            for key in store.keys() {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn get_context_value(&self, property_name: &str) -> Option<serde_json::Value> {
        self.stores
            .iter()
            .find_map(|store| store.get_context_value(property_name))
    }

    fn project_env_id(&self) -> i64 {
        self.stores
            .iter()
            .map(|store| store.project_env_id())
            .find(|id| *id != 0)
            .unwrap_or(0)
    }

    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
        Arc::new(CompositeConfigStore::new(
            self.stores.iter().map(|store| store.clone().view()).collect(),
        ))
    }
}
