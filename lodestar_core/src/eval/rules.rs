use std::collections::HashSet;

use chrono::DateTime;
use regex::Regex;

use crate::contexts::ContextValueGetter;
use crate::proto::{
    config_value::Kind, Config, ConfigValue, Criterion, CriterionOperator,
};
use crate::store::ConfigStoreGetter;

/// Segment criteria dispatch into other configs; recursion is capped so a
/// pathological rule set cannot blow the stack.
const MAX_SEGMENT_DEPTH: usize = 16;

/// Output of rule evaluation: the winning (row, conditional value) and its
/// payload, or a non-match.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConditionMatch {
    pub is_match: bool,
    pub value: Option<ConfigValue>,
    pub row_index: Option<usize>,
    pub conditional_value_index: Option<usize>,
    /// Project environment id of the matched row, when the row carries one.
    pub env_id: Option<i64>,
}

impl ConditionMatch {
    fn miss() -> ConditionMatch {
        ConditionMatch::default()
    }
}

/// Evaluates a config's rows against a context. Holds a store handle for
/// IN_SEG / NOT_IN_SEG indirection; the resolver passes its captured read
/// view, so every segment hop within one evaluation sees the same snapshot
/// generation.
pub struct ConfigRuleEvaluator<'a> {
    store: &'a dyn ConfigStoreGetter,
}

impl<'a> ConfigRuleEvaluator<'a> {
    pub fn new(store: &'a dyn ConfigStoreGetter) -> ConfigRuleEvaluator<'a> {
        ConfigRuleEvaluator { store }
    }

    /// Walk rows, then conditional values, in authored order; the first
    /// conditional value whose criteria all pass wins. No tie-breaking.
    pub fn evaluate_config(
        &self,
        config: &Config,
        context: &dyn ContextValueGetter,
    ) -> ConditionMatch {
        let mut visited = HashSet::new();
        self.evaluate_config_inner(config, context, 0, &mut visited)
    }

    fn evaluate_config_inner(
        &self,
        config: &Config,
        context: &dyn ContextValueGetter,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> ConditionMatch {
        for (row_index, row) in config.rows.iter().enumerate() {
            for (value_index, conditional_value) in row.values.iter().enumerate() {
                let all_pass = conditional_value
                    .criteria
                    .iter()
                    .all(|criterion| self.criterion_matches(criterion, context, depth, visited));

                if all_pass {
                    return ConditionMatch {
                        is_match: true,
                        value: conditional_value.value.clone(),
                        row_index: Some(row_index),
                        conditional_value_index: Some(value_index),
                        env_id: row.project_env_id,
                    };
                }
            }
        }

        ConditionMatch::miss()
    }

    /// Apply a criterion. Returns `false` when the operator cannot be
    /// applied or the config is malformed.
    fn criterion_matches(
        &self,
        criterion: &Criterion,
        context: &dyn ContextValueGetter,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> bool {
        self.try_criterion(criterion, context, depth, visited)
            .unwrap_or(false)
    }

    fn try_criterion(
        &self,
        criterion: &Criterion,
        context: &dyn ContextValueGetter,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> Option<bool> {
        use CriterionOperator::*;

        let operator = criterion.operator();

        match operator {
            AlwaysTrue => Some(true),

            InSeg | NotInSeg => {
                let segment_key = criterion.value_to_match.as_ref()?.as_str()?;
                let in_segment = self.in_segment(segment_key, context, depth, visited);
                Some(if operator == InSeg {
                    in_segment
                } else {
                    !in_segment
                })
            }

            PropIsOneOf | PropIsNotOneOf => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let candidates = match_string_list(criterion)?;
                let is_one_of = candidates.iter().any(|candidate| candidate == &property);
                Some(is_one_of == (operator == PropIsOneOf))
            }

            PropEndsWithOneOf | PropDoesNotEndWithOneOf => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let candidates = match_string_list(criterion)?;
                let matched = candidates.iter().any(|c| property.ends_with(c.as_str()));
                Some(matched == (operator == PropEndsWithOneOf))
            }

            PropStartsWithOneOf | PropDoesNotStartWithOneOf => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let candidates = match_string_list(criterion)?;
                let matched = candidates.iter().any(|c| property.starts_with(c.as_str()));
                Some(matched == (operator == PropStartsWithOneOf))
            }

            PropContainsOneOf | PropDoesNotContainOneOf => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let candidates = match_string_list(criterion)?;
                let matched = candidates.iter().any(|c| property.contains(c.as_str()));
                Some(matched == (operator == PropContainsOneOf))
            }

            HierarchicalMatch => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let prefix = criterion.value_to_match.as_ref()?.as_str()?;
                Some(property.starts_with(prefix))
            }

            PropLessThan | PropLessThanOrEqual | PropGreaterThan | PropGreaterThanOrEqual => {
                let property = as_number(&context.get_context_value(&criterion.property_name)?)?;
                let operand = match_number(criterion)?;
                Some(match operator {
                    PropLessThan => property < operand,
                    PropLessThanOrEqual => property <= operand,
                    PropGreaterThan => property > operand,
                    PropGreaterThanOrEqual => property >= operand,
                    _ => unreachable!(),
                })
            }

            PropBefore | PropAfter => {
                let property = as_epoch_millis(&context.get_context_value(&criterion.property_name)?)?;
                let operand = match_epoch_millis(criterion)?;
                Some(if operator == PropBefore {
                    property < operand
                } else {
                    property > operand
                })
            }

            PropMatches | PropDoesNotMatch => {
                let property = as_comparison_string(&context.get_context_value(&criterion.property_name)?)?;
                let pattern = criterion.value_to_match.as_ref()?.as_str()?;
                let regex = Regex::new(pattern).ok()?;
                let matched = regex.is_match(&property);
                Some(matched == (operator == PropMatches))
            }

            NotSet => None,
        }
    }

    /// A context is in a segment when the named SEGMENT config evaluates to
    /// `true` against the same context. A missing segment config, a cycle,
    /// or exceeding the depth cap all count as not-in-segment.
    fn in_segment(
        &self,
        segment_key: &str,
        context: &dyn ContextValueGetter,
        depth: usize,
        visited: &mut HashSet<String>,
    ) -> bool {
        if depth >= MAX_SEGMENT_DEPTH {
            log::warn!(target: "lodestar", "segment recursion exceeded depth {MAX_SEGMENT_DEPTH} at \"{segment_key}\"");
            return false;
        }
        if !visited.insert(segment_key.to_owned()) {
            log::warn!(target: "lodestar", "segment cycle detected at \"{segment_key}\"");
            return false;
        }

        let result = match self.store.get_config(segment_key) {
            Some(segment) => {
                let segment_match =
                    self.evaluate_config_inner(&segment, context, depth + 1, visited);
                segment_match
                    .value
                    .as_ref()
                    .and_then(|value| match value.kind.as_ref() {
                        Some(Kind::Bool(b)) => Some(*b),
                        _ => None,
                    })
                    .unwrap_or(false)
            }
            None => {
                log::warn!(target: "lodestar", "segment config \"{segment_key}\" not found");
                false
            }
        };

        visited.remove(segment_key);
        result
    }
}

/// Normalize a context value for string comparison. Integral doubles print
/// without the trailing `.0` so numeric context values match their authored
/// string form.
fn as_comparison_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64().map(|f| f.to_string())
            }
        }
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Timestamps are either epoch milliseconds or RFC 3339 strings.
fn as_epoch_millis(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => {
            DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_millis())
        }
        _ => None,
    }
}

fn match_string_list(criterion: &Criterion) -> Option<&Vec<String>> {
    match criterion.value_to_match.as_ref()?.kind.as_ref()? {
        Kind::StringList(list) => Some(&list.values),
        _ => None,
    }
}

fn match_number(criterion: &Criterion) -> Option<f64> {
    match criterion.value_to_match.as_ref()?.kind.as_ref()? {
        Kind::Int(i) => Some(*i as f64),
        Kind::Double(d) => Some(*d),
        Kind::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn match_epoch_millis(criterion: &Criterion) -> Option<i64> {
    match criterion.value_to_match.as_ref()?.kind.as_ref()? {
        Kind::Int(millis) => Some(*millis),
        Kind::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.timestamp_millis()),
        _ => None,
    }
}
