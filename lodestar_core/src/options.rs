//! Client options and their environment-variable fallbacks.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use crate::contexts::ContextSet;
use crate::decrypter::Decrypter;
use crate::env::EnvLookup;
use crate::latch::OnInitializationFailure;
use crate::store::ConfigStoreGetter;
use crate::{Error, Result};

/// Preferred env var holding the SDK key.
pub const SDK_KEY_ENV_VAR: &str = "LODESTAR_BACKEND_SDK_KEY";
/// Deprecated alias for [`SDK_KEY_ENV_VAR`], kept for backward
/// compatibility.
pub const LEGACY_SDK_KEY_ENV_VAR: &str = "LODESTAR_API_KEY";
/// Comma-separated list of API base URLs.
pub const API_URL_ENV_VAR: &str = "LODESTAR_API_URL";
/// Single-value API base URL override.
pub const API_URL_OVERRIDE_ENV_VAR: &str = "LODESTAR_API_URL_OVERRIDE";
/// When set, replaces the default source list with a single datafile source.
pub const DATAFILE_ENV_VAR: &str = "LODESTAR_DATAFILE";

pub fn default_api_urls() -> Vec<String> {
    vec![
        "https://primary.lodestar.cloud".to_owned(),
        "https://secondary.lodestar.cloud".to_owned(),
    ]
}

const DEFAULT_TELEMETRY_HOST: &str = "https://telemetry.lodestar.cloud";
const DEFAULT_LOGGER_KEY: &str = "log-levels.default";
const DEFAULT_INITIALIZATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TELEMETRY_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// What the telemetry submitter reports about evaluation contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextTelemetryMode {
    /// Periodically submit one full example context plus context shapes.
    #[default]
    PeriodicExample,
    /// Submit context shapes only.
    Shapes,
    /// Submit nothing about contexts.
    None,
}

/// A configured config source, built into a sub-store at client
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// The live SSE stream; loads asynchronously.
    ApiStream,
    /// A JSON snapshot file loaded once at startup.
    Datafile(PathBuf),
    /// The inline-map store fed from `inline_configs`.
    Memory,
}

impl ConfigSource {
    pub fn is_async(&self) -> bool {
        matches!(self, ConfigSource::ApiStream)
    }
}

/// Options for constructing a client.
///
/// Create with [`ClientOptions::new`] and chain the builder methods:
///
/// ```
/// # use lodestar_core::options::ClientOptions;
/// let options = ClientOptions::new()
///     .sdk_key("sdk-key")
///     .initialization_timeout(std::time::Duration::from_secs(2));
/// ```
pub struct ClientOptions {
    pub sdk_key: String,
    pub api_urls: Vec<String>,
    pub sources: Vec<ConfigSource>,
    /// Caller-implemented stores, prepended to the built-in sources.
    pub custom_stores: Vec<Arc<dyn ConfigStoreGetter>>,
    pub inline_configs: HashMap<String, serde_json::Value>,
    /// Merged into the context of every evaluation.
    pub global_context: ContextSet,
    pub initialization_timeout: Duration,
    pub on_initialization_failure: OnInitializationFailure,
    pub context_telemetry_mode: ContextTelemetryMode,
    pub telemetry_sync_interval: Duration,
    pub telemetry_host: String,
    pub collect_evaluation_summaries: bool,
    /// Config key the log-level API evaluates.
    pub logger_key: String,
    /// Required only for datafile sources.
    pub project_env_id: i64,
    pub custom_env_lookup: Option<Box<dyn EnvLookup>>,
    pub decrypter: Option<Box<dyn Decrypter>>,
    pub instance_hash: String,
}

impl ClientOptions {
    /// Default options. Reads the datafile and API-URL override env vars,
    /// mirroring how a twelve-factor deployment points the SDK at local
    /// data.
    pub fn new() -> ClientOptions {
        let api_urls = match std::env::var(API_URL_OVERRIDE_ENV_VAR) {
            Ok(url) if !url.is_empty() => vec![url],
            _ => vec![],
        };

        let sources = match std::env::var(DATAFILE_ENV_VAR) {
            Ok(path) if !path.is_empty() => vec![ConfigSource::Datafile(PathBuf::from(path))],
            _ => vec![ConfigSource::ApiStream],
        };

        ClientOptions {
            sdk_key: String::new(),
            api_urls,
            sources,
            custom_stores: Vec::new(),
            inline_configs: HashMap::new(),
            global_context: ContextSet::new(),
            initialization_timeout: DEFAULT_INITIALIZATION_TIMEOUT,
            on_initialization_failure: OnInitializationFailure::default(),
            context_telemetry_mode: ContextTelemetryMode::default(),
            telemetry_sync_interval: DEFAULT_TELEMETRY_SYNC_INTERVAL,
            telemetry_host: DEFAULT_TELEMETRY_HOST.to_owned(),
            collect_evaluation_summaries: true,
            logger_key: DEFAULT_LOGGER_KEY.to_owned(),
            project_env_id: 0,
            custom_env_lookup: None,
            decrypter: None,
            instance_hash: generate_instance_hash(),
        }
    }

    pub fn sdk_key(mut self, sdk_key: impl Into<String>) -> ClientOptions {
        self.sdk_key = sdk_key.into();
        self
    }

    pub fn api_urls<I, S>(mut self, urls: I) -> ClientOptions
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.api_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn sources(mut self, sources: Vec<ConfigSource>) -> ClientOptions {
        self.sources = sources;
        self
    }

    /// Serve from a caller-supplied map. Replaces the source list with the
    /// memory store; combining with other sources or custom stores is a
    /// construction error.
    pub fn inline_configs(mut self, configs: HashMap<String, serde_json::Value>) -> ClientOptions {
        self.inline_configs = configs;
        self.sources = vec![ConfigSource::Memory];
        self
    }

    pub fn custom_store(mut self, store: Arc<dyn ConfigStoreGetter>) -> ClientOptions {
        self.custom_stores.push(store);
        self
    }

    pub fn global_context(mut self, context: ContextSet) -> ClientOptions {
        self.global_context = context;
        self
    }

    pub fn initialization_timeout(mut self, timeout: Duration) -> ClientOptions {
        self.initialization_timeout = timeout;
        self
    }

    pub fn on_initialization_failure(
        mut self,
        policy: OnInitializationFailure,
    ) -> ClientOptions {
        self.on_initialization_failure = policy;
        self
    }

    pub fn context_telemetry_mode(mut self, mode: ContextTelemetryMode) -> ClientOptions {
        self.context_telemetry_mode = mode;
        self
    }

    pub fn telemetry_sync_interval(mut self, interval: Duration) -> ClientOptions {
        self.telemetry_sync_interval = interval;
        self
    }

    pub fn collect_evaluation_summaries(mut self, collect: bool) -> ClientOptions {
        self.collect_evaluation_summaries = collect;
        self
    }

    pub fn logger_key(mut self, key: impl Into<String>) -> ClientOptions {
        self.logger_key = key.into();
        self
    }

    pub fn project_env_id(mut self, id: i64) -> ClientOptions {
        self.project_env_id = id;
        self
    }

    pub fn custom_env_lookup(mut self, lookup: Box<dyn EnvLookup>) -> ClientOptions {
        self.custom_env_lookup = Some(lookup);
        self
    }

    pub fn decrypter(mut self, decrypter: Box<dyn Decrypter>) -> ClientOptions {
        self.decrypter = Some(decrypter);
        self
    }

    /// Normalize the SDK key: an explicitly set key wins, then the preferred
    /// env var, then the deprecated legacy alias.
    pub fn sdk_key_setting_or_env_var(&mut self) -> Result<String> {
        if self.sdk_key.is_empty() {
            let from_env = std::env::var(SDK_KEY_ENV_VAR)
                .ok()
                .filter(|key| !key.is_empty())
                .or_else(|| {
                    std::env::var(LEGACY_SDK_KEY_ENV_VAR)
                        .ok()
                        .filter(|key| !key.is_empty())
                });

            match from_env {
                Some(key) => self.sdk_key = key,
                None => {
                    return Err(Error::MissingSdkKey {
                        preferred: SDK_KEY_ENV_VAR,
                        legacy: LEGACY_SDK_KEY_ENV_VAR,
                    })
                }
            }
        }

        Ok(self.sdk_key.clone())
    }

    /// Resolve the API URL list: env list var, then env override var, then
    /// the configured list, then the canonical defaults. Every URL must
    /// parse.
    pub fn resolved_api_urls(&self) -> Result<Vec<String>> {
        let urls = match std::env::var(API_URL_ENV_VAR) {
            Ok(raw) if !raw.is_empty() => {
                let urls: Vec<String> = raw
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .map(str::to_owned)
                    .collect();
                if urls.is_empty() {
                    return Err(Error::InvalidOptions(format!(
                        "environment variable {API_URL_ENV_VAR} is blank"
                    )));
                }
                urls
            }
            _ => match std::env::var(API_URL_OVERRIDE_ENV_VAR) {
                Ok(url) if !url.is_empty() => vec![url],
                _ if !self.api_urls.is_empty() => self.api_urls.clone(),
                _ => default_api_urls(),
            },
        };

        for url in &urls {
            url::Url::parse(url).map_err(Error::InvalidApiUrl)?;
        }

        Ok(urls)
    }

    pub fn telemetry_enabled(&self) -> bool {
        self.collect_evaluation_summaries
            || self.context_telemetry_mode != ContextTelemetryMode::None
    }

    /// Validate option combinations that cannot work together.
    pub fn validate(&self) -> Result<()> {
        if !self.inline_configs.is_empty() {
            let non_memory = self
                .sources
                .iter()
                .any(|source| *source != ConfigSource::Memory);
            if non_memory || self.sources.is_empty() {
                return Err(Error::InvalidOptions(
                    "cannot use inline configs with other sources".to_owned(),
                ));
            }
            if !self.custom_stores.is_empty() {
                return Err(Error::InvalidOptions(
                    "cannot use inline configs with custom stores".to_owned(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions::new()
    }
}

/// Random identifier distinguishing client instances in telemetry.
fn generate_instance_hash() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
