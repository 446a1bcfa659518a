use std::sync::Arc;
use std::time::Duration;

use lodestar_core::contexts::ContextSet;
use lodestar_core::extractors;
use lodestar_core::latch::{AwaitResult, InitializationLatch, OnInitializationFailure};
use lodestar_core::options::ClientOptions;
use lodestar_core::proto::{Config, ConfigType, ConfigValue};
use lodestar_core::resolver::{ConfigMatch, ConfigResolver};
use lodestar_core::store::{build_config_store, CompositeConfigStore, ConfigStoreGetter};
use lodestar_core::telemetry::{TelemetrySubmitter, TelemetryThread};
use lodestar_core::{Error, EvaluationError, LogLevel, Result};

/// Name of the synthetic context the log-level API evaluates against.
const LOGGING_CONTEXT_NAME: &str = "lodestar-sdk-logging";

/// Collapse a typed lookup to the caller's default. Normal conditions
/// (missing key, no matching rule, type mismatch) default silently; anything
/// else (env indirection, decryption, initialization timeout) defaults too
/// but is worth a warning.
fn value_or_default<T>(key: &str, result: Result<Option<T>>, default: T) -> T {
    match result {
        Ok(Some(value)) => value,
        Ok(None) => default,
        Err(Error::Evaluation(err)) if err.is_normal() => {
            log::trace!(target: "lodestar", "returning default for \"{key}\": {err}");
            default
        }
        Err(err) => {
            log::warn!(target: "lodestar", "returning default for \"{key}\": {err}");
            default
        }
    }
}

/// A client for the Lodestar API.
///
/// Constructed from [`ClientOptions`]. Construction assembles the configured
/// sources into a composite store, starts the stream and telemetry
/// background threads as needed, and arms the initialization latch that
/// gates the first evaluations until live data arrives (or the timeout
/// fires).
///
/// # Examples
/// ```no_run
/// # use lodestar::{Client, ClientOptions};
/// let client = Client::new(ClientOptions::new().sdk_key("sdk-key")).unwrap();
/// ```
pub struct Client {
    global_context: ContextSet,
    logger_key: String,
    initialization_timeout: Duration,
    on_initialization_failure: OnInitializationFailure,
    instance_hash: String,
    store: Arc<dyn ConfigStoreGetter>,
    resolver: Arc<ConfigResolver>,
    latch: Arc<InitializationLatch>,
    telemetry: Option<Arc<TelemetrySubmitter>>,
    telemetry_thread: Option<TelemetryThread>,
}

/// A [`Client`] bound to a context. Every call merges its per-call context
/// over the bound one.
pub struct ContextBoundClient<'a> {
    context: ContextSet,
    client: &'a Client,
}

impl Client {
    /// Create a new client using the specified options.
    ///
    /// # Errors
    ///
    /// Fails when the SDK key is missing from both options and environment,
    /// when the option combination is invalid (e.g. inline configs plus
    /// other sources), or when a synchronous source fails to load.
    pub fn new(mut options: ClientOptions) -> Result<Client> {
        options.validate()?;
        options.sdk_key_setting_or_env_var()?;

        log::debug!(target: "lodestar", "initializing client");

        let latch = Arc::new(InitializationLatch::new());

        // Custom stores go first so callers can override built-in sources.
        let mut stores: Vec<Arc<dyn ConfigStoreGetter>> = Vec::new();
        stores.append(&mut options.custom_stores);

        let mut any_async = false;
        let sources = options.sources.clone();
        for source in &sources {
            let on_first_load: Box<dyn FnOnce() + Send> = {
                let latch = latch.clone();
                Box::new(move || {
                    latch.close();
                })
            };
            let (store, is_async) = build_config_store(&options, source, on_first_load)?;
            any_async |= is_async;
            stores.push(store);
        }

        // Synchronous sources are ready as soon as construction returns.
        if !any_async {
            latch.close();
        }

        let store: Arc<dyn ConfigStoreGetter> = Arc::new(CompositeConfigStore::new(stores));

        let mut resolver = ConfigResolver::new(store.clone());
        if let Some(env_lookup) = options.custom_env_lookup.take() {
            resolver.set_env_lookup(env_lookup);
        }
        if let Some(decrypter) = options.decrypter.take() {
            resolver.set_decrypter(decrypter);
        }

        let (telemetry, telemetry_thread) = if options.telemetry_enabled() {
            let submitter = Arc::new(TelemetrySubmitter::new(&options));
            let thread =
                TelemetryThread::start(submitter.clone(), options.telemetry_sync_interval)?;
            (Some(submitter), Some(thread))
        } else {
            (None, None)
        };

        Ok(Client {
            global_context: options.global_context.clone(),
            logger_key: options.logger_key.clone(),
            initialization_timeout: options.initialization_timeout,
            on_initialization_failure: options.on_initialization_failure,
            instance_hash: options.instance_hash.clone(),
            store,
            resolver: Arc::new(resolver),
            latch,
            telemetry,
            telemetry_thread,
        })
    }

    fn bound(&self) -> ContextBoundClient<'_> {
        ContextBoundClient {
            context: self.global_context.clone(),
            client: self,
        }
    }

    /// Return a client bound to `context` (merged over the global context).
    pub fn with_context(&self, context: &ContextSet) -> ContextBoundClient<'_> {
        ContextBoundClient {
            context: self.global_context.merge(context),
            client: self,
        }
    }

    /// String value for a key and context.
    ///
    /// `Ok(None)` means the config exists but holds a different type.
    /// Missing keys and rule sets that produce no value are errors; use
    /// [`Client::get_string_value_or`] to absorb both.
    pub fn get_string_value(&self, key: &str, context: &ContextSet) -> Result<Option<String>> {
        self.bound().get_string_value(key, context)
    }

    /// String value, falling back to `default` on any failure.
    pub fn get_string_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: impl Into<String>,
    ) -> String {
        self.bound().get_string_value_or(key, context, default)
    }

    /// Integer value for a key and context.
    pub fn get_int_value(&self, key: &str, context: &ContextSet) -> Result<Option<i64>> {
        self.bound().get_int_value(key, context)
    }

    /// Integer value, falling back to `default` on any failure.
    pub fn get_int_value_or(&self, key: &str, context: &ContextSet, default: i64) -> i64 {
        self.bound().get_int_value_or(key, context, default)
    }

    /// Boolean value for a key and context.
    pub fn get_bool_value(&self, key: &str, context: &ContextSet) -> Result<Option<bool>> {
        self.bound().get_bool_value(key, context)
    }

    /// Boolean value, falling back to `default` on any failure.
    pub fn get_bool_value_or(&self, key: &str, context: &ContextSet, default: bool) -> bool {
        self.bound().get_bool_value_or(key, context, default)
    }

    /// Float value for a key and context.
    pub fn get_float_value(&self, key: &str, context: &ContextSet) -> Result<Option<f64>> {
        self.bound().get_float_value(key, context)
    }

    /// Float value, falling back to `default` on any failure.
    pub fn get_float_value_or(&self, key: &str, context: &ContextSet, default: f64) -> f64 {
        self.bound().get_float_value_or(key, context, default)
    }

    /// String-list value for a key and context.
    pub fn get_string_list_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<Vec<String>>> {
        self.bound().get_string_list_value(key, context)
    }

    /// String-list value, falling back to `default` on any failure.
    pub fn get_string_list_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: Vec<String>,
    ) -> Vec<String> {
        self.bound().get_string_list_value_or(key, context, default)
    }

    /// Duration value for a key and context.
    pub fn get_duration_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<Duration>> {
        self.bound().get_duration_value(key, context)
    }

    /// Duration value, falling back to `default` on any failure.
    pub fn get_duration_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: Duration,
    ) -> Duration {
        self.bound().get_duration_value_or(key, context, default)
    }

    /// JSON value for a key and context.
    pub fn get_json_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<serde_json::Value>> {
        self.bound().get_json_value(key, context)
    }

    /// JSON value, falling back to `default` on any failure.
    pub fn get_json_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.bound().get_json_value_or(key, context, default)
    }

    /// Whether a feature flag is on for the context. Defaults to `false`
    /// when the key does not exist.
    pub fn feature_is_on(&self, key: &str, context: &ContextSet) -> bool {
        self.bound().feature_is_on(key, context)
    }

    /// Log-level value for a key and context, as its upper-case name.
    pub fn get_log_level_string_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<String>> {
        self.bound().get_log_level_string_value(key, context)
    }

    /// Log level for a logger name, evaluated against the configured logger
    /// key. Returns [`LogLevel::Debug`] when the config is absent, of the
    /// wrong type, or errors.
    pub fn get_log_level(&self, logger_name: &str) -> LogLevel {
        self.bound().get_log_level(logger_name)
    }

    /// The raw config for a key. You're unlikely to need this method.
    pub fn get_config(&self, key: &str) -> Option<Arc<Config>> {
        self.store.get_config(key)
    }

    /// The full resolver output for a key and context. You're unlikely to
    /// need this method.
    pub fn get_config_match(&self, key: &str, context: &ContextSet) -> Result<ConfigMatch> {
        self.bound().get_config_match(key, context)
    }

    /// All keys in the config store. Waits on initialization like an
    /// evaluation does.
    pub fn keys(&self) -> Result<Vec<String>> {
        self.await_initialization()?;
        Ok(self.resolver.keys())
    }

    /// Identifier distinguishing this client instance in telemetry.
    pub fn instance_hash(&self) -> &str {
        &self.instance_hash
    }

    /// Flush buffered telemetry now instead of waiting for the periodic
    /// submission.
    pub fn send_telemetry(&self) -> Result<()> {
        match &self.telemetry {
            Some(telemetry) => telemetry.submit(),
            None => Ok(()),
        }
    }

    /// Stop the telemetry thread. The stream thread runs for the life of
    /// the process and is not stopped.
    pub fn shutdown(mut self) -> Result<()> {
        if let Some(thread) = self.telemetry_thread.take() {
            thread.shutdown()?;
        }
        Ok(())
    }

    fn internal_get_value(&self, key: &str, merged_context: &ContextSet) -> Result<ConfigMatch> {
        self.await_initialization()?;

        let config_match = self.resolver.resolve_value(key, merged_context)?;

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_evaluation(&config_match);
        }

        Ok(config_match)
    }

    /// Block until the first async source reports ready or the timeout
    /// fires. Whichever way the wait ends, the latch is closed afterwards,
    /// so later calls never block again.
    fn await_initialization(&self) -> Result<()> {
        if self.latch.wait_timeout(self.initialization_timeout) == AwaitResult::TimedOut {
            log::warn!(
                target: "lodestar",
                "{:?} initialization timeout expired, proceeding without waiting further",
                self.initialization_timeout
            );
            self.latch.close();
            if self.on_initialization_failure == OnInitializationFailure::ReturnError {
                return Err(Error::InitializationTimeout);
            }
        }
        Ok(())
    }
}

impl ContextBoundClient<'_> {
    /// Bind an additional context on top of this one.
    pub fn with_context(&self, context: &ContextSet) -> ContextBoundClient<'_> {
        ContextBoundClient {
            context: self.context.merge(context),
            client: self.client,
        }
    }

    fn get_value_inner<T>(
        &self,
        key: &str,
        context: &ContextSet,
        extract: impl FnOnce(&ConfigValue) -> Option<T>,
    ) -> Result<Option<T>> {
        let merged = self.context.merge(context);

        if let Some(telemetry) = &self.client.telemetry {
            telemetry.record_context(&merged);
        }

        let config_match = self.client.internal_get_value(key, &merged)?;

        let Some(value) = &config_match.value else {
            return Err(EvaluationError::NoDefault.into());
        };

        match extract(value) {
            Some(typed) => Ok(Some(typed)),
            None => {
                log::warn!(target: "lodestar", "unexpected value kind for \"{key}\"");
                Ok(None)
            }
        }
    }

    /// String value for a key and context.
    pub fn get_string_value(&self, key: &str, context: &ContextSet) -> Result<Option<String>> {
        self.get_value_inner(key, context, extractors::extract_string)
    }

    /// String value, falling back to `default` on any failure.
    pub fn get_string_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: impl Into<String>,
    ) -> String {
        value_or_default(key, self.get_string_value(key, context), default.into())
    }

    /// Integer value for a key and context.
    pub fn get_int_value(&self, key: &str, context: &ContextSet) -> Result<Option<i64>> {
        self.get_value_inner(key, context, extractors::extract_int)
    }

    /// Integer value, falling back to `default` on any failure.
    pub fn get_int_value_or(&self, key: &str, context: &ContextSet, default: i64) -> i64 {
        value_or_default(key, self.get_int_value(key, context), default)
    }

    /// Boolean value for a key and context.
    pub fn get_bool_value(&self, key: &str, context: &ContextSet) -> Result<Option<bool>> {
        self.get_value_inner(key, context, extractors::extract_bool)
    }

    /// Boolean value, falling back to `default` on any failure.
    pub fn get_bool_value_or(&self, key: &str, context: &ContextSet, default: bool) -> bool {
        value_or_default(key, self.get_bool_value(key, context), default)
    }

    /// Float value for a key and context.
    pub fn get_float_value(&self, key: &str, context: &ContextSet) -> Result<Option<f64>> {
        self.get_value_inner(key, context, extractors::extract_float)
    }

    /// Float value, falling back to `default` on any failure.
    pub fn get_float_value_or(&self, key: &str, context: &ContextSet, default: f64) -> f64 {
        value_or_default(key, self.get_float_value(key, context), default)
    }

    /// String-list value for a key and context.
    pub fn get_string_list_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<Vec<String>>> {
        self.get_value_inner(key, context, extractors::extract_string_list)
    }

    /// String-list value, falling back to `default` on any failure.
    pub fn get_string_list_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: Vec<String>,
    ) -> Vec<String> {
        value_or_default(key, self.get_string_list_value(key, context), default)
    }

    /// Duration value for a key and context.
    pub fn get_duration_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<Duration>> {
        self.get_value_inner(key, context, extractors::extract_duration)
    }

    /// Duration value, falling back to `default` on any failure.
    pub fn get_duration_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: Duration,
    ) -> Duration {
        value_or_default(key, self.get_duration_value(key, context), default)
    }

    /// JSON value for a key and context.
    pub fn get_json_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<serde_json::Value>> {
        self.get_value_inner(key, context, extractors::extract_json)
    }

    /// JSON value, falling back to `default` on any failure.
    pub fn get_json_value_or(
        &self,
        key: &str,
        context: &ContextSet,
        default: serde_json::Value,
    ) -> serde_json::Value {
        value_or_default(key, self.get_json_value(key, context), default)
    }

    /// Whether a feature flag is on for the context. Defaults to `false`
    /// when the key does not exist.
    pub fn feature_is_on(&self, key: &str, context: &ContextSet) -> bool {
        self.get_bool_value_or(key, context, false)
    }

    /// Log-level value for a key and context, as its upper-case name.
    pub fn get_log_level_string_value(
        &self,
        key: &str,
        context: &ContextSet,
    ) -> Result<Option<String>> {
        let level = self.get_value_inner(key, context, extractors::extract_log_level)?;
        Ok(level.map(|level| LogLevel::from(level).as_str().to_owned()))
    }

    /// Log level for a logger name. The configured logger key is evaluated
    /// against a synthetic context carrying the logger path; absence, type
    /// mismatch, and errors all default to [`LogLevel::Debug`].
    pub fn get_log_level(&self, logger_name: &str) -> LogLevel {
        let logger_context = ContextSet::new().with_named_values(
            LOGGING_CONTEXT_NAME,
            [
                ("lang".to_owned(), serde_json::json!("rust")),
                ("logger-path".to_owned(), serde_json::json!(logger_name)),
            ],
        );

        let Ok(config_match) =
            self.get_config_match(&self.client.logger_key, &logger_context)
        else {
            return LogLevel::Debug;
        };

        let Some(config) = self.client.get_config(&self.client.logger_key) else {
            return LogLevel::Debug;
        };
        if config.config_type() != ConfigType::LogLevelV2 {
            return LogLevel::Debug;
        }

        match config_match
            .original_value
            .as_ref()
            .and_then(extractors::extract_log_level)
        {
            Some(level) => LogLevel::from(level),
            None => LogLevel::Debug,
        }
    }

    /// The full resolver output for a key and context. You're unlikely to
    /// need this method.
    pub fn get_config_match(&self, key: &str, context: &ContextSet) -> Result<ConfigMatch> {
        let merged = self.context.merge(context);
        self.client.internal_get_value(key, &merged)
    }
}
