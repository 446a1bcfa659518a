//! Typed extraction out of a resolved [`ConfigValue`].
//!
//! Extractors return `None` on a kind mismatch; the typed client APIs treat
//! that as "not found" and fall back to the caller's default rather than
//! surfacing an error.

use std::time::Duration;

use crate::proto::{config_value::Kind, ConfigValue, LogLevel, ValueType};

pub fn extract_int(value: &ConfigValue) -> Option<i64> {
    match value.kind.as_ref()? {
        Kind::Int(i) => Some(*i),
        _ => None,
    }
}

pub fn extract_bool(value: &ConfigValue) -> Option<bool> {
    match value.kind.as_ref()? {
        Kind::Bool(b) => Some(*b),
        _ => None,
    }
}

pub fn extract_string(value: &ConfigValue) -> Option<String> {
    match value.kind.as_ref()? {
        Kind::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Extract a float. Integer payloads widen to `f64`.
pub fn extract_float(value: &ConfigValue) -> Option<f64> {
    match value.kind.as_ref()? {
        Kind::Double(d) => Some(*d),
        Kind::Int(i) => Some(*i as f64),
        _ => None,
    }
}

pub fn extract_string_list(value: &ConfigValue) -> Option<Vec<String>> {
    match value.kind.as_ref()? {
        Kind::StringList(list) => Some(list.values.clone()),
        _ => None,
    }
}

pub fn extract_json(value: &ConfigValue) -> Option<serde_json::Value> {
    match value.kind.as_ref()? {
        Kind::Json(document) => serde_json::from_str(document).ok(),
        _ => None,
    }
}

pub fn extract_log_level(value: &ConfigValue) -> Option<LogLevel> {
    match value.kind.as_ref()? {
        Kind::LogLevel(raw) => LogLevel::try_from(*raw).ok(),
        _ => None,
    }
}

pub fn extract_duration(value: &ConfigValue) -> Option<Duration> {
    match value.kind.as_ref()? {
        Kind::Duration(definition) => parse_iso8601_duration(definition),
        _ => None,
    }
}

/// Extract whatever the value holds as a JSON value, losing the type tag.
/// Used by telemetry and by the flattening of server-supplied default
/// contexts.
pub fn extract_any(value: &ConfigValue) -> Option<serde_json::Value> {
    match value.kind.as_ref()? {
        Kind::Int(i) => Some(serde_json::json!(i)),
        Kind::String(s) => Some(serde_json::json!(s)),
        Kind::Bytes(b) => Some(serde_json::json!(b)),
        Kind::Double(d) => Some(serde_json::json!(d)),
        Kind::Bool(b) => Some(serde_json::json!(b)),
        Kind::StringList(list) => Some(serde_json::json!(list.values)),
        Kind::LogLevel(raw) => LogLevel::try_from(*raw)
            .ok()
            .map(|level| serde_json::json!(format!("{level:?}"))),
        Kind::Duration(definition) => Some(serde_json::json!(definition)),
        Kind::Json(document) => serde_json::from_str(document).ok(),
        Kind::WeightedValues(_) | Kind::Provided(_) => None,
    }
}

/// Coerce an environment-variable string to the config's declared value type.
/// Unparseable input and undeclared types fall back to a plain string value.
pub fn coerce(raw: &str, value_type: ValueType) -> ConfigValue {
    match value_type {
        ValueType::Int => raw
            .parse::<i64>()
            .map(ConfigValue::int)
            .unwrap_or_else(|_| ConfigValue::string(raw)),
        ValueType::Double => raw
            .parse::<f64>()
            .map(ConfigValue::double)
            .unwrap_or_else(|_| ConfigValue::string(raw)),
        ValueType::Bool => raw
            .parse::<bool>()
            .map(ConfigValue::bool)
            .unwrap_or_else(|_| ConfigValue::string(raw)),
        ValueType::StringList => {
            ConfigValue::string_list(raw.split(',').map(|part| part.trim().to_owned()))
        }
        ValueType::Json => ConfigValue::json(raw),
        _ => ConfigValue::string(raw),
    }
}

/// Parse an ISO-8601 duration (`P1DT2H3M4.5S`). Weeks, months, and years are
/// not part of the server contract.
fn parse_iso8601_duration(definition: &str) -> Option<Duration> {
    let rest = definition.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut seconds = 0f64;

    let mut parse_fields = |part: &str, units: &[(char, f64)]| -> Option<()> {
        let mut number = String::new();
        for ch in part.chars() {
            if ch.is_ascii_digit() || ch == '.' {
                number.push(ch);
            } else {
                let scale = units.iter().find(|(unit, _)| *unit == ch)?.1;
                seconds += number.parse::<f64>().ok()? * scale;
                number.clear();
            }
        }
        // Trailing digits without a unit designator are malformed.
        number.is_empty().then_some(())
    };

    parse_fields(date_part, &[('D', 86_400.0)])?;
    if let Some(time_part) = time_part {
        parse_fields(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    }

    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractors_reject_mismatched_kinds() {
        let value = ConfigValue::string("not a number");

        assert_eq!(extract_int(&value), None);
        assert_eq!(extract_bool(&value), None);
        assert_eq!(extract_float(&value), None);
        assert_eq!(extract_string(&value), Some("not a number".to_owned()));
    }

    #[test]
    fn float_extraction_widens_ints() {
        assert_eq!(extract_float(&ConfigValue::int(42)), Some(42.0));
        assert_eq!(extract_float(&ConfigValue::double(3.14)), Some(3.14));
    }

    #[test]
    fn json_extraction_parses_the_document() {
        let value = ConfigValue::json(r#"{"nested": "value"}"#);
        assert_eq!(
            extract_json(&value),
            Some(serde_json::json!({"nested": "value"}))
        );
        assert_eq!(extract_json(&ConfigValue::json("{not json")), None);
    }

    #[test]
    fn durations_parse_iso8601() {
        let parse = |s: &str| extract_duration(&ConfigValue::from_kind(Kind::Duration(s.into())));

        assert_eq!(parse("PT1.5S"), Some(Duration::from_millis(1500)));
        assert_eq!(parse("PT2H30M"), Some(Duration::from_secs(9000)));
        assert_eq!(parse("P1DT1S"), Some(Duration::from_secs(86_401)));
        assert_eq!(parse("P3D"), Some(Duration::from_secs(3 * 86_400)));
        assert_eq!(parse("1.5S"), None);
        assert_eq!(parse("PT15"), None);
    }

    #[test]
    fn coercion_follows_the_declared_type() {
        assert_eq!(coerce("42", ValueType::Int), ConfigValue::int(42));
        assert_eq!(coerce("true", ValueType::Bool), ConfigValue::bool(true));
        assert_eq!(coerce("1.25", ValueType::Double), ConfigValue::double(1.25));
        assert_eq!(
            coerce("a, b,c", ValueType::StringList),
            ConfigValue::string_list(["a", "b", "c"])
        );
        assert_eq!(
            coerce("THE_VALUE", ValueType::String),
            ConfigValue::string("THE_VALUE")
        );
        // Unparseable input degrades to a string rather than erroring.
        assert_eq!(
            coerce("not-a-number", ValueType::Int),
            ConfigValue::string("not-a-number")
        );
    }
}
