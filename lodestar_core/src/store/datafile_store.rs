//! Snapshot-file source: a JSON document in the wire schema, loaded once at
//! startup with no reload.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::proto::{Config, ConfigSnapshot};
use crate::store::ConfigStoreGetter;
use crate::{Error, Result};

/// The file is either a bare array of configs or a full snapshot document.
#[derive(Deserialize)]
#[serde(untagged)]
enum DatafileDocument {
    Snapshot(ConfigSnapshot),
    Configs(Vec<Config>),
}

#[derive(Debug)]
pub struct DatafileConfigStore {
    configs: HashMap<String, Arc<Config>>,
    project_env_id: i64,
}

impl DatafileConfigStore {
    pub fn new(path: impl AsRef<Path>, project_env_id: i64) -> Result<DatafileConfigStore> {
        if project_env_id == 0 {
            return Err(Error::InvalidOptions(
                "project_env_id must be provided for a datafile source".to_owned(),
            ));
        }

        let path = path.as_ref();
        let file = File::open(path)?;
        let document: DatafileDocument =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| {
                Error::InvalidOptions(format!(
                    "failed to parse datafile {}: {err}",
                    path.display()
                ))
            })?;

        let configs = match document {
            DatafileDocument::Snapshot(snapshot) => snapshot.configs,
            DatafileDocument::Configs(configs) => configs,
        };

        log::debug!(target: "lodestar", "loaded {} configs from datafile {}", configs.len(), path.display());

        Ok(DatafileConfigStore {
            configs: configs
                .into_iter()
                .map(|config| (config.key.clone(), Arc::new(config)))
                .collect(),
            project_env_id,
        })
    }
}

impl ConfigStoreGetter for DatafileConfigStore {
    fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.configs.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    fn project_env_id(&self) -> i64 {
        self.project_env_id
    }

    fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
        // Loaded once at startup with no reload; the store is its own view.
        self
    }
}
