//! The resolver orchestrates a single config lookup: store fetch, rule
//! evaluation, weighted selection, Provided env resolution, and decrypt-with
//! indirection, in that fixed order.

use std::sync::Arc;

use crate::contexts::ContextValueGetter;
use crate::decrypter::{Decrypter, NoDecrypter};
use crate::env::{EnvLookup, RealEnvLookup};
use crate::error::EvaluationError;
use crate::eval::{ConfigRuleEvaluator, WeightedValueResolver};
use crate::extractors;
use crate::proto::{config_value::Kind, ConfigType, ConfigValue, ProvidedSource};
use crate::store::ConfigStoreGetter;

/// Resolver output: the effective value, the original (pre-transform) value
/// kept for telemetry, and where in the config the match landed.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMatch {
    pub is_match: bool,
    pub config_key: String,
    pub config_id: i64,
    pub config_type: ConfigType,
    /// The value after weighted selection, Provided resolution, and
    /// decryption.
    pub value: Option<ConfigValue>,
    /// The matched value before any transformation.
    pub original_value: Option<ConfigValue>,
    pub row_index: Option<usize>,
    pub conditional_value_index: Option<usize>,
    pub weighted_value_index: Option<usize>,
    pub env_id: Option<i64>,
}

impl ConfigMatch {
    fn miss(config_key: &str) -> ConfigMatch {
        ConfigMatch {
            is_match: false,
            config_key: config_key.to_owned(),
            config_id: 0,
            config_type: ConfigType::NotSet,
            value: None,
            original_value: None,
            row_index: None,
            conditional_value_index: None,
            weighted_value_index: None,
            env_id: None,
        }
    }
}

pub struct ConfigResolver {
    store: Arc<dyn ConfigStoreGetter>,
    weighted_resolver: WeightedValueResolver,
    decrypter: Box<dyn Decrypter>,
    env_lookup: Box<dyn EnvLookup>,
}

impl ConfigResolver {
    pub fn new(store: Arc<dyn ConfigStoreGetter>) -> ConfigResolver {
        ConfigResolver {
            store,
            weighted_resolver: WeightedValueResolver::default(),
            decrypter: Box::new(NoDecrypter),
            env_lookup: Box::new(RealEnvLookup),
        }
    }

    pub fn set_env_lookup(&mut self, env_lookup: Box<dyn EnvLookup>) {
        self.env_lookup = env_lookup;
    }

    pub fn set_decrypter(&mut self, decrypter: Box<dyn Decrypter>) {
        self.decrypter = decrypter;
    }

    pub fn keys(&self) -> Vec<String> {
        self.store.keys()
    }

    /// Resolve `key` against `context`.
    ///
    /// A missing key is an error; a present key whose rules produce no match
    /// returns `is_match: false` and leaves defaulting to the caller.
    pub fn resolve_value(
        &self,
        key: &str,
        context: &dyn ContextValueGetter,
    ) -> Result<ConfigMatch, EvaluationError> {
        // One read view for the whole resolution. Decrypt-with and segment
        // indirection re-enter through the same view, so a store update
        // landing mid-evaluation cannot mix snapshot versions.
        let view = self.store.clone().view();
        self.resolve_value_in_view(key, context, &view)
    }

    fn resolve_value_in_view(
        &self,
        key: &str,
        context: &dyn ContextValueGetter,
        view: &Arc<dyn ConfigStoreGetter>,
    ) -> Result<ConfigMatch, EvaluationError> {
        // The caller's context wins; the store's server-supplied default
        // context fills in missing properties.
        let context = ContextWithStoreDefaults {
            context,
            store: &**view,
        };

        let Some(config) = view.get_config(key) else {
            return Err(EvaluationError::ConfigNotFound(key.to_owned()));
        };

        let evaluator = ConfigRuleEvaluator::new(&**view);
        let condition_match = evaluator.evaluate_config(&config, &context);

        if !condition_match.is_match {
            log::trace!(target: "lodestar", "no rule matched for \"{key}\"");
            return Ok(ConfigMatch {
                config_id: config.id,
                config_type: config.config_type(),
                ..ConfigMatch::miss(key)
            });
        }

        let original_value = condition_match.value.clone();
        let mut value = condition_match.value;
        let mut weighted_value_index = None;

        // Fixed transformation order: weighted selection first, then
        // Provided env resolution, decryption last.
        let weighted = match value.as_ref().and_then(|v| v.kind.as_ref()) {
            Some(Kind::WeightedValues(weighted)) => Some(weighted.clone()),
            _ => None,
        };
        if let Some(weighted) = weighted {
            match self.weighted_resolver.resolve(&weighted, key, &context) {
                Some((selected, index)) => {
                    weighted_value_index = Some(index);
                    value = Some(selected);
                }
                None => value = None,
            }
        }

        let provided = match value.as_ref().and_then(|v| v.kind.as_ref()) {
            Some(Kind::Provided(provided)) => Some(provided.clone()),
            _ => None,
        };
        if let Some(provided) = provided {
            value = Some(self.resolve_provided(
                provided.source(),
                provided.lookup.as_deref(),
                config.value_type(),
            )?);
        }

        if let Some(decrypt_with) = value.as_ref().and_then(|v| v.decrypt_with.clone()) {
            let encrypted = value.clone().unwrap();
            value = Some(self.decrypt(&decrypt_with, &encrypted, &context, view)?);
        }

        Ok(ConfigMatch {
            is_match: true,
            config_key: key.to_owned(),
            config_id: config.id,
            config_type: config.config_type(),
            value,
            original_value,
            row_index: condition_match.row_index,
            conditional_value_index: condition_match.conditional_value_index,
            weighted_value_index,
            env_id: condition_match.env_id,
        })
    }

    fn resolve_provided(
        &self,
        source: ProvidedSource,
        lookup: Option<&str>,
        value_type: crate::proto::ValueType,
    ) -> Result<ConfigValue, EvaluationError> {
        let name = lookup.unwrap_or_default();
        if source != ProvidedSource::EnvVar || name.is_empty() {
            return Err(EvaluationError::EnvVarNotExist(name.to_owned()));
        }

        match self.env_lookup.lookup_env(name) {
            Some(raw) => Ok(extractors::coerce(&raw, value_type)),
            None => Err(EvaluationError::EnvVarNotExist(name.to_owned())),
        }
    }

    /// Resolve the named key config against the same context and read view,
    /// then hand its string value and the encrypted payload to the
    /// decrypter. The confidential bit carries over to the decrypted result.
    fn decrypt(
        &self,
        key_config_key: &str,
        encrypted: &ConfigValue,
        context: &dyn ContextValueGetter,
        view: &Arc<dyn ConfigStoreGetter>,
    ) -> Result<ConfigValue, EvaluationError> {
        let key_match = self
            .resolve_value_in_view(key_config_key, context, view)
            .map_err(|err| EvaluationError::DecryptionFailed(err.to_string()))?;

        let secret_key = key_match
            .value
            .as_ref()
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                EvaluationError::DecryptionFailed(format!(
                    "decryption key config \"{key_config_key}\" did not resolve to a string"
                ))
            })?;

        let encrypted_text = encrypted.as_str().ok_or_else(|| {
            EvaluationError::DecryptionFailed("encrypted value is not a string".to_owned())
        })?;

        let decrypted = self
            .decrypter
            .decrypt_value(secret_key, encrypted_text)
            .map_err(|err| EvaluationError::DecryptionFailed(err.to_string()))?;

        Ok(ConfigValue {
            kind: Some(Kind::String(decrypted)),
            decrypt_with: None,
            confidential: encrypted.confidential,
        })
    }
}

struct ContextWithStoreDefaults<'a> {
    context: &'a dyn ContextValueGetter,
    store: &'a dyn ConfigStoreGetter,
}

impl ContextValueGetter for ContextWithStoreDefaults<'_> {
    fn get_context_value(&self, property_name: &str) -> Option<serde_json::Value> {
        self.context
            .get_context_value(property_name)
            .or_else(|| self.store.get_context_value(property_name))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::contexts::ContextSet;
    use crate::decrypter::DecryptError;
    use crate::env::test_support::MapEnvLookup;
    use crate::proto::{
        Config, ConditionalValue, ConfigRow, ValueType, WeightedValue, WeightedValues,
    };

    struct FixedStore {
        configs: HashMap<String, Arc<Config>>,
        default_context: HashMap<String, serde_json::Value>,
    }

    impl FixedStore {
        fn new(configs: Vec<Config>) -> FixedStore {
            FixedStore {
                configs: configs
                    .into_iter()
                    .map(|config| (config.key.clone(), Arc::new(config)))
                    .collect(),
                default_context: HashMap::new(),
            }
        }
    }

    impl ConfigStoreGetter for FixedStore {
        fn get_config(&self, key: &str) -> Option<Arc<Config>> {
            self.configs.get(key).cloned()
        }
        fn keys(&self) -> Vec<String> {
            self.configs.keys().cloned().collect()
        }
        fn get_context_value(&self, property_name: &str) -> Option<serde_json::Value> {
            self.default_context.get(property_name).cloned()
        }
        fn view(self: Arc<Self>) -> Arc<dyn ConfigStoreGetter> {
            self
        }
    }

    struct MapDecrypter(HashMap<(String, String), Result<String, DecryptError>>);
    impl Decrypter for MapDecrypter {
        fn decrypt_value(&self, secret_key: &str, value: &str) -> Result<String, DecryptError> {
            self.0
                .get(&(secret_key.to_owned(), value.to_owned()))
                .cloned()
                .unwrap_or_else(|| Err(DecryptError("unexpected input".to_owned())))
        }
    }

    fn constant_config(key: &str, value: ConfigValue) -> Config {
        let mut config = Config::constant(key, value);
        config.id = 1;
        config
    }

    fn resolver_over(configs: Vec<Config>) -> ConfigResolver {
        ConfigResolver::new(Arc::new(FixedStore::new(configs)))
    }

    #[test]
    fn standard_pass_through() {
        let resolver = resolver_over(vec![constant_config(
            "the.key",
            ConfigValue::string("one"),
        )]);

        let result = resolver.resolve_value("the.key", &ContextSet::new()).unwrap();

        assert!(result.is_match);
        assert_eq!(result.config_key, "the.key");
        assert_eq!(result.value, Some(ConfigValue::string("one")));
        assert_eq!(result.original_value, Some(ConfigValue::string("one")));
        assert_eq!(result.row_index, Some(0));
        assert_eq!(result.conditional_value_index, Some(0));
        assert_eq!(result.weighted_value_index, None);
    }

    #[test]
    fn missing_config_is_an_error() {
        let resolver = resolver_over(vec![]);
        let err = resolver
            .resolve_value("the.key", &ContextSet::new())
            .unwrap_err();
        assert_eq!(err, EvaluationError::ConfigNotFound("the.key".to_owned()));
    }

    #[test]
    fn no_matching_row_returns_a_nil_match() {
        let config = Config {
            id: 1,
            key: "ruled.out".to_owned(),
            config_type: crate::proto::ConfigType::Config as i32,
            value_type: ValueType::String as i32,
            rows: vec![ConfigRow {
                project_env_id: None,
                values: vec![ConditionalValue {
                    criteria: vec![crate::proto::Criterion {
                        property_name: "user.id".to_owned(),
                        operator: crate::proto::CriterionOperator::PropIsOneOf as i32,
                        value_to_match: Some(ConfigValue::string_list(["nobody"])),
                    }],
                    value: Some(ConfigValue::string("on")),
                }],
            }],
        };
        let resolver = resolver_over(vec![config]);

        let result = resolver.resolve_value("ruled.out", &ContextSet::new()).unwrap();
        assert!(!result.is_match);
        assert_eq!(result.value, None);
        assert_eq!(result.original_value, None);
    }

    #[test]
    fn provided_value_reads_the_env_lookup() {
        let mut config =
            constant_config("the.key", ConfigValue::provided_env_var("SOME_ENV"));
        config.value_type = ValueType::String as i32;
        let mut resolver = resolver_over(vec![config]);
        resolver.set_env_lookup(Box::new(MapEnvLookup(
            [("SOME_ENV".to_owned(), "THE_VALUE".to_owned())].into(),
        )));

        let result = resolver.resolve_value("the.key", &ContextSet::new()).unwrap();

        assert_eq!(result.value, Some(ConfigValue::string("THE_VALUE")));
        // The original Provided reference is retained for telemetry.
        assert_eq!(
            result.original_value,
            Some(ConfigValue::provided_env_var("SOME_ENV"))
        );
    }

    #[test]
    fn provided_value_with_missing_env_var_errors() {
        let config = constant_config("the.key", ConfigValue::provided_env_var("SOME_ENV"));
        let mut resolver = resolver_over(vec![config]);
        resolver.set_env_lookup(Box::new(MapEnvLookup(HashMap::new())));

        let err = resolver
            .resolve_value("the.key", &ContextSet::new())
            .unwrap_err();
        assert_eq!(err, EvaluationError::EnvVarNotExist("SOME_ENV".to_owned()));
    }

    #[test]
    fn provided_value_coerces_to_the_declared_type() {
        let mut config = constant_config("the.key", ConfigValue::provided_env_var("PORT"));
        config.value_type = ValueType::Int as i32;
        let mut resolver = resolver_over(vec![config]);
        resolver.set_env_lookup(Box::new(MapEnvLookup(
            [("PORT".to_owned(), "8080".to_owned())].into(),
        )));

        let result = resolver.resolve_value("the.key", &ContextSet::new()).unwrap();
        assert_eq!(result.value, Some(ConfigValue::int(8080)));
    }

    fn encrypted_config() -> Config {
        let mut value = ConfigValue::string("the-encrypted-value");
        value.decrypt_with = Some("decrypt.with.me".to_owned());
        value.confidential = Some(true);
        constant_config("the.key", value)
    }

    #[test]
    fn decrypt_with_resolves_the_key_config_and_decrypts() {
        let mut resolver = resolver_over(vec![
            encrypted_config(),
            constant_config("decrypt.with.me", ConfigValue::string("the-secret-key")),
        ]);
        resolver.set_decrypter(Box::new(MapDecrypter(
            [(
                ("the-secret-key".to_owned(), "the-encrypted-value".to_owned()),
                Ok("the-decrypted-value".to_owned()),
            )]
            .into(),
        )));

        let result = resolver.resolve_value("the.key", &ContextSet::new()).unwrap();

        let value = result.value.unwrap();
        assert_eq!(value.as_str(), Some("the-decrypted-value"));
        // Confidentiality is preserved on the decrypted result.
        assert_eq!(value.confidential, Some(true));
        assert_eq!(value.decrypt_with, None);
        // The encrypted original is what telemetry sees.
        assert_eq!(
            result.original_value.unwrap().as_str(),
            Some("the-encrypted-value")
        );
    }

    #[test]
    fn decrypter_failure_surfaces_as_decryption_failed() {
        let mut resolver = resolver_over(vec![
            encrypted_config(),
            constant_config("decrypt.with.me", ConfigValue::string("the-secret-key")),
        ]);
        resolver.set_decrypter(Box::new(MapDecrypter(
            [(
                ("the-secret-key".to_owned(), "the-encrypted-value".to_owned()),
                Err(DecryptError("decryption went poorly".to_owned())),
            )]
            .into(),
        )));

        let err = resolver
            .resolve_value("the.key", &ContextSet::new())
            .unwrap_err();
        assert!(matches!(err, EvaluationError::DecryptionFailed(_)));
    }

    #[test]
    fn missing_key_config_surfaces_as_decryption_failed() {
        let resolver = resolver_over(vec![encrypted_config()]);

        let err = resolver
            .resolve_value("the.key", &ContextSet::new())
            .unwrap_err();
        assert!(matches!(err, EvaluationError::DecryptionFailed(_)));
    }

    #[test]
    fn no_configured_decrypter_fails_decryption() {
        let resolver = resolver_over(vec![
            encrypted_config(),
            constant_config("decrypt.with.me", ConfigValue::string("the-secret-key")),
        ]);

        let err = resolver
            .resolve_value("the.key", &ContextSet::new())
            .unwrap_err();
        assert!(matches!(err, EvaluationError::DecryptionFailed(_)));
    }

    #[test]
    fn weighted_value_records_the_chosen_index() {
        let weighted = ConfigValue::from_kind(Kind::WeightedValues(WeightedValues {
            weighted_values: vec![WeightedValue {
                weight: 100,
                value: Some(ConfigValue::string("A")),
            }],
            hash_by_property_name: Some("some.property".to_owned()),
        }));
        let resolver = resolver_over(vec![constant_config("the.key", weighted.clone())]);

        let context = ContextSet::new()
            .with_named_values("some", [("property".to_owned(), json!("anything"))]);
        let result = resolver.resolve_value("the.key", &context).unwrap();

        assert_eq!(result.value, Some(ConfigValue::string("A")));
        assert_eq!(result.weighted_value_index, Some(0));
        assert_eq!(result.original_value, Some(weighted));
    }

    #[test]
    fn decrypt_indirection_never_mixes_snapshot_generations() {
        use crate::proto::ConfigSnapshot;
        use crate::store::ApiConfigStore;

        // Each generation is self-consistent: the encrypted payload and its
        // key config change together, and the decrypter only accepts
        // matching pairs. Drawing them from different generations would
        // surface as DecryptionFailed("unexpected input").
        fn generation(n: i64) -> ConfigSnapshot {
            let mut encrypted = ConfigValue::string(format!("encrypted-v{n}"));
            encrypted.decrypt_with = Some("decrypt.with.me".to_owned());
            ConfigSnapshot {
                configs: vec![
                    constant_config("the.key", encrypted),
                    constant_config("decrypt.with.me", ConfigValue::string(format!("key-v{n}"))),
                ],
                default_context: None,
            }
        }

        let store = Arc::new(ApiConfigStore::new());
        store.set_from_snapshot(&generation(1));

        let mut resolver = ConfigResolver::new(store.clone());
        resolver.set_decrypter(Box::new(MapDecrypter(
            [
                (
                    ("key-v1".to_owned(), "encrypted-v1".to_owned()),
                    Ok("plain-v1".to_owned()),
                ),
                (
                    ("key-v2".to_owned(), "encrypted-v2".to_owned()),
                    Ok("plain-v2".to_owned()),
                ),
            ]
            .into(),
        )));

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    store.set_from_snapshot(&generation(1 + i % 2));
                }
            })
        };

        for _ in 0..500 {
            let result = resolver.resolve_value("the.key", &ContextSet::new()).unwrap();
            let value = result.value.as_ref().and_then(|v| v.as_str()).unwrap();
            assert!(value == "plain-v1" || value == "plain-v2");
        }

        writer.join().unwrap();
    }

    #[test]
    fn store_default_context_fills_in_missing_properties() {
        let config = Config {
            id: 9,
            key: "test.with.rule".to_owned(),
            config_type: crate::proto::ConfigType::Config as i32,
            value_type: ValueType::String as i32,
            rows: vec![
                ConfigRow {
                    project_env_id: Some(308),
                    values: vec![ConditionalValue {
                        criteria: vec![crate::proto::Criterion {
                            property_name: "lodestar-api-key.user-id".to_owned(),
                            operator: crate::proto::CriterionOperator::PropIsOneOf as i32,
                            value_to_match: Some(ConfigValue::string_list(["1039"])),
                        }],
                        value: Some(ConfigValue::string("targeted")),
                    }],
                },
                ConfigRow {
                    project_env_id: None,
                    values: vec![ConditionalValue {
                        criteria: vec![],
                        value: Some(ConfigValue::string("default")),
                    }],
                },
            ],
        };

        let mut store = FixedStore::new(vec![config]);
        store
            .default_context
            .insert("lodestar-api-key.user-id".to_owned(), json!(1039));
        let resolver = ConfigResolver::new(Arc::new(store));

        // Empty caller context: the store default applies.
        let result = resolver
            .resolve_value("test.with.rule", &ContextSet::new())
            .unwrap();
        assert_eq!(result.value, Some(ConfigValue::string("targeted")));
        assert_eq!(result.env_id, Some(308));

        // A caller context naming the same property shadows the default.
        let shadowed = ContextSet::new()
            .with_named_values("lodestar-api-key", [("user-id".to_owned(), json!(0))]);
        let result = resolver.resolve_value("test.with.rule", &shadowed).unwrap();
        assert_eq!(result.value, Some(ConfigValue::string("default")));
        assert_eq!(result.env_id, None);
    }
}
