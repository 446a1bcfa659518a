//! Inline-map source: caller-supplied key/value pairs converted to the
//! minimal configs that represent them. Loads synchronously, so it closes
//! the initialization latch at construction.

use std::collections::HashMap;
use std::sync::Arc;

use crate::proto::{Config, ConfigValue};
use crate::store::ConfigStoreGetter;

pub struct MemoryConfigStore {
    configs: HashMap<String, Arc<Config>>,
}

impl MemoryConfigStore {
    pub fn new(entries: &HashMap<String, serde_json::Value>) -> MemoryConfigStore {
        let configs = entries
            .iter()
            .map(|(key, value)| {
                let config = Config::constant(key.clone(), ConfigValue::from(value));
                (key.clone(), Arc::new(config))
            })
            .collect();
        MemoryConfigStore { configs }
    }
}

impl ConfigStoreGetter for MemoryConfigStore {
    fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.configs.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
        // Never mutated after construction, so the store is its own view.
        self
    }
}
