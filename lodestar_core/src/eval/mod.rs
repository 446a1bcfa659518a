//! Rule evaluation: per-row criterion matching and weighted splits.

mod rules;
mod weighted;

pub use rules::{ConditionMatch, ConfigRuleEvaluator};
pub use weighted::{Md5Hasher, PropertyHasher, Randomer, ThreadRandomer, WeightedValueResolver};
