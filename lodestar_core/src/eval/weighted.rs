//! Deterministic percentage bucketing for weighted values.

use rand::Rng;

use crate::contexts::ContextValueGetter;
use crate::proto::{ConfigValue, WeightedValues};

/// Hashes a string onto the unit interval. The default implementation must
/// be stable across processes and SDK versions, since it decides which side
/// of a percentage rollout a user lands on.
pub trait PropertyHasher: Send + Sync {
    fn hash_zero_to_one(&self, value: &str) -> f64;
}

/// The default (and only) hasher: the first eight bytes of the md5 digest,
/// scaled to [0, 1).
pub struct Md5Hasher;

impl PropertyHasher for Md5Hasher {
    fn hash_zero_to_one(&self, value: &str) -> f64 {
        let digest = md5::compute(value.as_bytes());
        let bucket = u64::from_be_bytes(digest[0..8].try_into().unwrap());
        // 2^64 as the divisor keeps the result strictly below 1.
        bucket as f64 / 18_446_744_073_709_551_616.0
    }
}

/// Source of the fallback draw used when the hash property is absent from
/// the context. That path is non-deterministic and non-restartable.
pub trait Randomer: Send + Sync {
    fn random_zero_to_one(&self) -> f64;
}

pub struct ThreadRandomer;

impl Randomer for ThreadRandomer {
    fn random_zero_to_one(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Picks one value out of a [`WeightedValues`] split.
pub struct WeightedValueResolver {
    hasher: Box<dyn PropertyHasher>,
    randomer: Box<dyn Randomer>,
}

impl Default for WeightedValueResolver {
    fn default() -> WeightedValueResolver {
        WeightedValueResolver {
            hasher: Box::new(Md5Hasher),
            randomer: Box::new(ThreadRandomer),
        }
    }
}

impl WeightedValueResolver {
    pub fn new(
        hasher: Box<dyn PropertyHasher>,
        randomer: Box<dyn Randomer>,
    ) -> WeightedValueResolver {
        WeightedValueResolver { hasher, randomer }
    }

    /// Select a value and its index. The draw hashes the config key together
    /// with the context property named by `hash_by_property_name`; identical
    /// inputs land in the same bucket on every process.
    pub fn resolve(
        &self,
        weighted: &WeightedValues,
        config_key: &str,
        context: &dyn ContextValueGetter,
    ) -> Option<(ConfigValue, usize)> {
        if weighted.weighted_values.is_empty() {
            return None;
        }

        let draw = match self.property_string(weighted, context) {
            Some(property) => self
                .hasher
                .hash_zero_to_one(&format!("{config_key}{property}")),
            None => self.randomer.random_zero_to_one(),
        };

        let total: i64 = weighted
            .weighted_values
            .iter()
            .map(|wv| i64::from(wv.weight.max(0)))
            .sum();
        let total = total.max(1) as f64;

        let mut cumulative = 0i64;
        for (index, weighted_value) in weighted.weighted_values.iter().enumerate() {
            cumulative += i64::from(weighted_value.weight.max(0));
            if cumulative as f64 / total > draw {
                return weighted_value.value.clone().map(|value| (value, index));
            }
        }

        // Unreachable for well-formed weights; cover zero-total payloads.
        let last_index = weighted.weighted_values.len() - 1;
        weighted.weighted_values[last_index]
            .value
            .clone()
            .map(|value| (value, last_index))
    }

    fn property_string(
        &self,
        weighted: &WeightedValues,
        context: &dyn ContextValueGetter,
    ) -> Option<String> {
        let property_name = weighted.hash_by_property_name.as_deref()?;
        let value = context.get_context_value(property_name)?;
        match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}
