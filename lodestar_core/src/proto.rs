//! Wire types for the Lodestar config delivery protocol.
//!
//! These are hand-maintained prost structs rather than build-script output so
//! the crate builds without `protoc`. Field tags are part of the server
//! contract and must not be renumbered. The same types double as the JSON
//! datafile schema through their serde derives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A batch of configs as delivered by the stream endpoint or a datafile.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub configs: Vec<Config>,
    /// Server-supplied fallback context, applied when the caller's context
    /// does not define a property.
    #[prost(message, optional, tag = "2")]
    pub default_context: Option<ContextSnapshot>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ContextSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub contexts: Vec<NamedContextSnapshot>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct NamedContextSnapshot {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, message", tag = "2")]
    pub values: HashMap<String, ConfigValue>,
}

/// An authored unit of configuration, addressable by key.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub key: String,
    #[prost(enumeration = "ConfigType", tag = "3")]
    pub config_type: i32,
    #[prost(enumeration = "ValueType", tag = "4")]
    pub value_type: i32,
    /// Rows are evaluated in authored order; the first matching conditional
    /// value wins.
    #[prost(message, repeated, tag = "5")]
    pub rows: Vec<ConfigRow>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ConfigRow {
    #[prost(int64, optional, tag = "1")]
    pub project_env_id: Option<i64>,
    #[prost(message, repeated, tag = "2")]
    pub values: Vec<ConditionalValue>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct ConditionalValue {
    #[prost(message, repeated, tag = "1")]
    pub criteria: Vec<Criterion>,
    #[prost(message, optional, tag = "2")]
    pub value: Option<ConfigValue>,
}

/// A single check of a context property against an operator and operand.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Criterion {
    #[prost(string, tag = "1")]
    pub property_name: String,
    #[prost(enumeration = "CriterionOperator", tag = "2")]
    pub operator: i32,
    #[prost(message, optional, tag = "3")]
    pub value_to_match: Option<ConfigValue>,
}

/// Tagged-union payload at the leaves of a [`Config`].
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigValue {
    #[prost(
        oneof = "config_value::Kind",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11"
    )]
    pub kind: Option<config_value::Kind>,
    /// Key of another config whose resolved string value decrypts this one.
    #[prost(string, optional, tag = "20")]
    pub decrypt_with: Option<String>,
    #[prost(bool, optional, tag = "21")]
    pub confidential: Option<bool>,
}

#[allow(missing_docs)]
pub mod config_value {
    use serde::{Deserialize, Serialize};

    #[derive(Clone, PartialEq, prost::Oneof, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub enum Kind {
        #[prost(int64, tag = "1")]
        Int(i64),
        #[prost(string, tag = "2")]
        String(String),
        #[prost(bytes, tag = "3")]
        Bytes(Vec<u8>),
        #[prost(double, tag = "4")]
        Double(f64),
        #[prost(bool, tag = "5")]
        Bool(bool),
        #[prost(message, tag = "6")]
        WeightedValues(super::WeightedValues),
        #[prost(enumeration = "super::LogLevel", tag = "7")]
        LogLevel(i32),
        #[prost(message, tag = "8")]
        StringList(super::StringList),
        /// ISO-8601 duration text, e.g. `PT1.5S`.
        #[prost(string, tag = "9")]
        Duration(String),
        /// A JSON document kept in its string form until extraction.
        #[prost(string, tag = "10")]
        Json(String),
        #[prost(message, tag = "11")]
        Provided(super::Provided),
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct StringList {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
}

/// A percentage split across values, selected by hashing a context property.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedValues {
    #[prost(message, repeated, tag = "1")]
    pub weighted_values: Vec<WeightedValue>,
    #[prost(string, optional, tag = "2")]
    pub hash_by_property_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(missing_docs)]
pub struct WeightedValue {
    #[prost(int32, tag = "1")]
    pub weight: i32,
    #[prost(message, optional, tag = "2")]
    pub value: Option<ConfigValue>,
}

/// A reference to a value provided by the runtime environment, re-resolved on
/// every lookup.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Provided {
    #[prost(enumeration = "ProvidedSource", tag = "1")]
    pub source: i32,
    #[prost(string, optional, tag = "2")]
    pub lookup: Option<String>,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ProvidedSource {
    NotSet = 0,
    EnvVar = 1,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ConfigType {
    NotSet = 0,
    Config = 1,
    FeatureFlag = 2,
    LogLevel = 3,
    Segment = 4,
    Deleted = 5,
    LogLevelV2 = 6,
}

/// Declared type of a config's values; Provided env strings are coerced to
/// this type.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum ValueType {
    NotSet = 0,
    Int = 1,
    String = 2,
    Bytes = 3,
    Double = 4,
    Bool = 5,
    LogLevel = 6,
    StringList = 7,
    Duration = 8,
    Json = 9,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum LogLevel {
    NotSet = 0,
    Trace = 1,
    Debug = 2,
    Info = 3,
    Warn = 4,
    Error = 5,
    Fatal = 6,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration,
)]
#[repr(i32)]
#[allow(missing_docs)]
pub enum CriterionOperator {
    NotSet = 0,
    AlwaysTrue = 1,
    PropIsOneOf = 2,
    PropIsNotOneOf = 3,
    PropEndsWithOneOf = 4,
    PropDoesNotEndWithOneOf = 5,
    PropStartsWithOneOf = 6,
    PropDoesNotStartWithOneOf = 7,
    PropContainsOneOf = 8,
    PropDoesNotContainOneOf = 9,
    InSeg = 10,
    NotInSeg = 11,
    HierarchicalMatch = 12,
    PropLessThan = 13,
    PropLessThanOrEqual = 14,
    PropGreaterThan = 15,
    PropGreaterThanOrEqual = 16,
    PropBefore = 17,
    PropAfter = 18,
    PropMatches = 19,
    PropDoesNotMatch = 20,
}

/// Envelope for a telemetry submission.
#[derive(Clone, PartialEq, prost::Message)]
pub struct TelemetryEvents {
    #[prost(string, tag = "1")]
    pub instance_hash: String,
    #[prost(message, repeated, tag = "2")]
    pub events: Vec<TelemetryEvent>,
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct TelemetryEvent {
    #[prost(oneof = "telemetry_event::Payload", tags = "1, 2, 3")]
    pub payload: Option<telemetry_event::Payload>,
}

#[allow(missing_docs)]
pub mod telemetry_event {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "1")]
        Summaries(super::ConfigEvaluationSummaries),
        #[prost(message, tag = "2")]
        ContextShapes(super::ContextShapes),
        #[prost(message, tag = "3")]
        ExampleContexts(super::ExampleContexts),
    }
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct ConfigEvaluationSummaries {
    #[prost(int64, tag = "1")]
    pub start_at: i64,
    #[prost(int64, tag = "2")]
    pub end_at: i64,
    #[prost(message, repeated, tag = "3")]
    pub summaries: Vec<ConfigEvaluationSummary>,
}

/// Counts of identical evaluation outcomes for one config key.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConfigEvaluationSummary {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(enumeration = "ConfigType", tag = "2")]
    pub config_type: i32,
    #[prost(message, repeated, tag = "3")]
    pub counters: Vec<ConfigEvaluationCounter>,
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct ConfigEvaluationCounter {
    #[prost(int64, tag = "1")]
    pub count: i64,
    #[prost(int64, optional, tag = "2")]
    pub config_id: Option<i64>,
    #[prost(uint32, optional, tag = "3")]
    pub config_row_index: Option<u32>,
    #[prost(uint32, optional, tag = "4")]
    pub conditional_value_index: Option<u32>,
    #[prost(uint32, optional, tag = "5")]
    pub weighted_value_index: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub selected_value: Option<ConfigValue>,
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct ContextShapes {
    #[prost(message, repeated, tag = "1")]
    pub shapes: Vec<ContextShape>,
}

/// The field names and type codes seen under one context name.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ContextShape {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(map = "string, int32", tag = "2")]
    pub field_types: HashMap<String, i32>,
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct ExampleContexts {
    #[prost(message, repeated, tag = "1")]
    pub examples: Vec<ExampleContext>,
}

#[derive(Clone, PartialEq, prost::Message)]
#[allow(missing_docs)]
pub struct ExampleContext {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(message, optional, tag = "2")]
    pub context_set: Option<ContextSnapshot>,
}

impl ConfigValue {
    pub fn from_kind(kind: config_value::Kind) -> ConfigValue {
        ConfigValue {
            kind: Some(kind),
            decrypt_with: None,
            confidential: None,
        }
    }

    pub fn int(value: i64) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::Int(value))
    }

    pub fn string(value: impl Into<String>) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::String(value.into()))
    }

    pub fn double(value: f64) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::Double(value))
    }

    pub fn bool(value: bool) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::Bool(value))
    }

    pub fn string_list<I, S>(values: I) -> ConfigValue
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ConfigValue::from_kind(config_value::Kind::StringList(StringList {
            values: values.into_iter().map(Into::into).collect(),
        }))
    }

    pub fn json(document: impl Into<String>) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::Json(document.into()))
    }

    pub fn log_level(level: LogLevel) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::LogLevel(level as i32))
    }

    pub fn provided_env_var(name: impl Into<String>) -> ConfigValue {
        ConfigValue::from_kind(config_value::Kind::Provided(Provided {
            source: ProvidedSource::EnvVar as i32,
            lookup: Some(name.into()),
        }))
    }

    /// Returns the string payload if this value is of string kind.
    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Some(config_value::Kind::String(s)) => Some(s),
            _ => None,
        }
    }
}

/// Convert a caller-supplied JSON value into the minimal `ConfigValue` that
/// represents it. Used by the inline-map source.
impl From<&serde_json::Value> for ConfigValue {
    fn from(value: &serde_json::Value) -> ConfigValue {
        use serde_json::Value;

        match value {
            Value::Bool(b) => ConfigValue::bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ConfigValue::int(i)
                } else {
                    ConfigValue::double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ConfigValue::string(s.clone()),
            Value::Array(items) if items.iter().all(|v| v.is_string()) => {
                ConfigValue::string_list(
                    items.iter().filter_map(|v| v.as_str().map(str::to_owned)),
                )
            }
            other => ConfigValue::json(other.to_string()),
        }
    }
}

impl Config {
    /// A config with a single unconditional value, as produced by the
    /// inline-map source.
    pub fn constant(key: impl Into<String>, value: ConfigValue) -> Config {
        Config {
            id: 0,
            key: key.into(),
            config_type: ConfigType::Config as i32,
            value_type: ValueType::NotSet as i32,
            rows: vec![ConfigRow {
                project_env_id: None,
                values: vec![ConditionalValue {
                    criteria: vec![],
                    value: Some(value),
                }],
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn snapshot_roundtrips_through_wire_encoding() {
        let snapshot = ConfigSnapshot {
            configs: vec![Config::constant("greeting", ConfigValue::string("hello"))],
            default_context: None,
        };

        let bytes = snapshot.encode_to_vec();
        let decoded = ConfigSnapshot::decode(&bytes[..]).unwrap();

        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn parses_datafile_style_json() {
        let config: Config = serde_json::from_str(
            r#"
              {
                "id": 17,
                "key": "test.with.rule",
                "configType": 1,
                "valueType": 2,
                "rows": [
                  {
                    "projectEnvId": 308,
                    "values": [
                      {
                        "criteria": [
                          {
                            "propertyName": "lodestar-api-key.user-id",
                            "operator": 2,
                            "valueToMatch": {"kind": {"stringList": {"values": ["1039"]}}}
                          }
                        ],
                        "value": {"kind": {"string": "targeted"}}
                      }
                    ]
                  },
                  {
                    "values": [{"value": {"kind": {"string": "default"}}}]
                  }
                ]
              }
            "#,
        )
        .unwrap();

        assert_eq!(config.key, "test.with.rule");
        assert_eq!(config.rows.len(), 2);
        assert_eq!(config.rows[0].project_env_id, Some(308));
        assert_eq!(
            config.rows[0].values[0].criteria[0].operator(),
            CriterionOperator::PropIsOneOf
        );
        assert_eq!(
            config.rows[1].values[0].value.as_ref().and_then(|v| v.as_str()),
            Some("default")
        );
    }

    #[test]
    fn minimal_config_value_from_json_values() {
        assert_eq!(
            ConfigValue::from(&serde_json::json!(true)),
            ConfigValue::bool(true)
        );
        assert_eq!(
            ConfigValue::from(&serde_json::json!(42)),
            ConfigValue::int(42)
        );
        assert_eq!(
            ConfigValue::from(&serde_json::json!(3.14)),
            ConfigValue::double(3.14)
        );
        assert_eq!(
            ConfigValue::from(&serde_json::json!(["a", "b", "c"])),
            ConfigValue::string_list(["a", "b", "c"])
        );
        assert_eq!(
            ConfigValue::from(&serde_json::json!({"nested": "value"})),
            ConfigValue::json(r#"{"nested":"value"}"#)
        );
    }
}
