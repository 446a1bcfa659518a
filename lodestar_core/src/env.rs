//! Pluggable environment-variable lookup.
//!
//! Provided values are re-resolved through this interface on every lookup,
//! never cached, so runtime changes to the environment are visible
//! immediately.

pub trait EnvLookup: Send + Sync {
    fn lookup_env(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment.
pub struct RealEnvLookup;

impl EnvLookup for RealEnvLookup {
    fn lookup_env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use super::EnvLookup;

    /// Deterministic lookup for tests; avoids mutating the process
    /// environment.
    pub struct MapEnvLookup(pub HashMap<String, String>);

    impl EnvLookup for MapEnvLookup {
        fn lookup_env(&self, key: &str) -> Option<String> {
            self.0.get(key).cloned()
        }
    }
}
