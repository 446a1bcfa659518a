//! A thread-safe in-memory store for configs delivered over the live stream.
//! [`ApiConfigStore`] provides concurrent access for readers (config
//! resolution) and the single writer (the stream client).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::extractors;
use crate::proto::{Config, ConfigSnapshot};
use crate::store::ConfigStoreGetter;

/// One published generation of store contents. A `State` is immutable once
/// published; applying a snapshot builds the next generation and swaps it
/// in whole, so a view captured by a reader never changes underneath it.
#[derive(Default)]
struct State {
    configs: HashMap<String, Arc<Config>>,
    /// Highest config id seen across all applied snapshots. Never decreases;
    /// advertised to the stream endpoint on reconnect.
    high_watermark: i64,
    /// Server-supplied default context, flattened to dotted property paths.
    default_context: HashMap<String, serde_json::Value>,
}

/// Live config store mutated as stream snapshots arrive.
///
/// Readers either go through the store directly (each call sees the latest
/// generation) or capture a [`ConfigStoreGetter::view`] pinning one
/// generation for a whole resolution. There is no deletion primitive:
/// entries persist until a later snapshot overwrites them.
#[derive(Default)]
pub struct ApiConfigStore {
    state: RwLock<Arc<State>>,
}

impl ApiConfigStore {
    pub fn new() -> ApiConfigStore {
        ApiConfigStore::default()
    }

    /// Upsert every config in `snapshot` and advance the watermark by
    /// publishing a new state generation.
    ///
    /// Safe to call concurrently with readers; the write lock serializes
    /// writers (in practice there is exactly one, the stream thread).
    pub fn set_from_snapshot(&self, snapshot: &ConfigSnapshot) {
        let mut state = self
            .state
            .write()
            .expect("thread holding config store lock should not panic");

        let mut next = State {
            configs: state.configs.clone(),
            high_watermark: state.high_watermark,
            default_context: state.default_context.clone(),
        };

        for config in &snapshot.configs {
            next.high_watermark = next.high_watermark.max(config.id);
            next.configs
                .insert(config.key.clone(), Arc::new(config.clone()));
        }

        if let Some(context) = &snapshot.default_context {
            let mut flattened = HashMap::new();
            for named in &context.contexts {
                for (property, value) in &named.values {
                    if let Some(value) = extractors::extract_any(value) {
                        flattened.insert(format!("{}.{}", named.name, property), value);
                    }
                }
            }
            next.default_context = flattened;
        }

        *state = Arc::new(next);
    }

    /// Current high watermark, for the stream resume header.
    pub fn high_watermark(&self) -> i64 {
        self.current().high_watermark
    }

    fn current(&self) -> Arc<State> {
        self.state
            .read()
            .expect("thread holding config store lock should not panic")
            .clone()
    }
}

impl ConfigStoreGetter for ApiConfigStore {
    fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.current().configs.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.current().configs.keys().cloned().collect()
    }

    fn get_context_value(&self, property_name: &str) -> Option<serde_json::Value> {
        self.current().default_context.get(property_name).cloned()
    }

    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
        Arc::new(ApiStoreView(self.current()))
    }
}

/// A pinned generation of an [`ApiConfigStore`].
struct ApiStoreView(Arc<State>);

impl ConfigStoreGetter for ApiStoreView {
    fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.0.configs.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.0.configs.keys().cloned().collect()
    }

    fn get_context_value(&self, property_name: &str) -> Option<serde_json::Value> {
        self.0.default_context.get(property_name).cloned()
    }

    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{ConfigValue, ContextSnapshot, NamedContextSnapshot};

    fn snapshot(entries: &[(&str, i64)]) -> ConfigSnapshot {
        ConfigSnapshot {
            configs: entries
                .iter()
                .map(|(key, id)| {
                    let mut config = Config::constant(*key, ConfigValue::int(*id));
                    config.id = *id;
                    config
                })
                .collect(),
            default_context: None,
        }
    }

    #[test]
    fn watermark_is_monotonic_and_max_merged() {
        let store = ApiConfigStore::new();

        store.set_from_snapshot(&snapshot(&[("a", 5), ("b", 9)]));
        assert_eq!(store.high_watermark(), 9);

        // A snapshot with lower ids must not move the watermark backwards.
        store.set_from_snapshot(&snapshot(&[("a", 3)]));
        assert_eq!(store.high_watermark(), 9);

        store.set_from_snapshot(&snapshot(&[("c", 12)]));
        assert_eq!(store.high_watermark(), 12);
    }

    #[test]
    fn snapshots_upsert_by_key() {
        let store = ApiConfigStore::new();

        store.set_from_snapshot(&snapshot(&[("a", 1), ("b", 2)]));
        store.set_from_snapshot(&snapshot(&[("a", 3)]));

        assert_eq!(store.get_config("a").unwrap().id, 3);
        // Keys omitted from later snapshots persist.
        assert_eq!(store.get_config("b").unwrap().id, 2);
        assert_eq!(store.keys().len(), 2);
    }

    #[test]
    fn can_apply_snapshot_from_another_thread() {
        let store = Arc::new(ApiConfigStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_from_snapshot(&snapshot(&[("threaded", 4)]));
            })
            .join();
        }

        assert!(store.get_config("threaded").is_some());
        assert_eq!(store.high_watermark(), 4);
    }

    #[test]
    fn readers_see_old_or_new_config_during_updates() {
        let store = Arc::new(ApiConfigStore::new());
        store.set_from_snapshot(&snapshot(&[("spin", 1)]));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for id in 2..200 {
                    store.set_from_snapshot(&snapshot(&[("spin", id)]));
                }
            })
        };

        // Every observed config is internally consistent: its id matches its
        // single payload value.
        for _ in 0..1000 {
            let config = store.get_config("spin").unwrap();
            let value = config.rows[0].values[0].value.as_ref().unwrap();
            assert_eq!(crate::extractors::extract_int(value), Some(config.id));
        }

        writer.join().unwrap();
    }

    #[test]
    fn views_pin_one_generation_under_updates() {
        let store = Arc::new(ApiConfigStore::new());
        store.set_from_snapshot(&snapshot(&[("a", 1)]));

        let view = store.clone().view();
        store.set_from_snapshot(&snapshot(&[("a", 2), ("b", 3)]));

        // The view keeps serving the generation it captured.
        assert_eq!(view.get_config("a").unwrap().id, 1);
        assert!(view.get_config("b").is_none());
        // The store itself serves the latest generation.
        assert_eq!(store.get_config("a").unwrap().id, 2);
        assert_eq!(store.high_watermark(), 3);
    }

    #[test]
    fn default_context_is_flattened_to_dotted_paths() {
        let store = ApiConfigStore::new();
        store.set_from_snapshot(&ConfigSnapshot {
            configs: vec![],
            default_context: Some(ContextSnapshot {
                contexts: vec![NamedContextSnapshot {
                    name: "lodestar-api-key".to_owned(),
                    values: [("user-id".to_owned(), ConfigValue::int(1039))].into(),
                }],
            }),
        });

        assert_eq!(
            store.get_context_value("lodestar-api-key.user-id"),
            Some(serde_json::json!(1039))
        );
        assert_eq!(store.get_context_value("lodestar-api-key.other"), None);
    }
}
