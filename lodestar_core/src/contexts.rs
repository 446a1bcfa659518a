//! Evaluation contexts: named bags of properties describing a user, device,
//! request, and so on. Rule criteria address properties by dotted path
//! (`"user.country"`), where the leading segment selects the named context.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A source of context property values, addressed by dotted path.
///
/// Implemented by [`ContextSet`] and by config stores that carry a
/// server-supplied default context.
pub trait ContextValueGetter {
    fn get_context_value(&self, property_name: &str) -> Option<Value>;
}

/// A single named property map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub data: BTreeMap<String, Value>,
}

impl NamedContext {
    pub fn new(name: impl Into<String>, data: BTreeMap<String, Value>) -> NamedContext {
        NamedContext {
            name: name.into(),
            data,
        }
    }

    /// Look up a property inside this context. The path may descend into
    /// nested objects (`"address.city"`).
    pub fn get(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let mut current = self.data.get(head)?;
        if let Some(rest) = rest {
            for segment in rest.split('.') {
                current = current.as_object()?.get(segment)?;
            }
        }

        Some(current.clone())
    }
}

/// An ordered set of [`NamedContext`]s, unique by name.
///
/// Context sets are immutable after construction from the caller's point of
/// view; [`ContextSet::merge`] builds a new set rather than mutating either
/// input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSet {
    contexts: BTreeMap<String, NamedContext>,
}

impl ContextSet {
    pub fn new() -> ContextSet {
        ContextSet::default()
    }

    /// Builder-style addition of a named context. A context with the same
    /// name is replaced.
    pub fn with_named_values<I, K>(mut self, name: impl Into<String>, data: I) -> ContextSet
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let name = name.into();
        let data = data
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect::<BTreeMap<_, _>>();
        self.contexts
            .insert(name.clone(), NamedContext::new(name, data));
        self
    }

    /// Merge `other` over `self`: named contexts from `other` replace
    /// same-named entries wholesale (no deep merge of the data maps).
    pub fn merge(&self, other: &ContextSet) -> ContextSet {
        let mut contexts = self.contexts.clone();
        for (name, context) in &other.contexts {
            contexts.insert(name.clone(), context.clone());
        }
        ContextSet { contexts }
    }

    /// Look up `"<name>.<property>"`. Returns `None` when the named context
    /// is absent or the property path does not resolve.
    pub fn get(&self, dotted_path: &str) -> Option<Value> {
        let (name, property) = dotted_path.split_once('.')?;
        self.contexts.get(name)?.get(property)
    }

    pub fn named_contexts(&self) -> impl Iterator<Item = &NamedContext> {
        self.contexts.values()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl ContextValueGetter for ContextSet {
    fn get_context_value(&self, property_name: &str) -> Option<Value> {
        self.get(property_name)
    }
}
