//! The Rust SDK for Lodestar, a dynamic-configuration and feature-flag
//! platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`Client`] that resolves typed config values
//! for an evaluation context: a set of named property bags describing the
//! current user, device, request, and so on. A remote-authored rule set
//! picks the value; the rule set changes at runtime without restarts.
//!
//! ```no_run
//! # use lodestar::{Client, ClientOptions, ContextSet};
//! # fn main() -> lodestar::Result<()> {
//! let client = Client::new(ClientOptions::new().sdk_key("sdk-key"))?;
//!
//! let context = ContextSet::new().with_named_values(
//!     "user",
//!     [("country".to_owned(), serde_json::json!("is"))],
//! );
//! let enabled = client.feature_is_on("checkout.redesign", &context);
//! # Ok(())
//! # }
//! ```
//!
//! # Typed lookups
//!
//! Every config has a value type fixed at authoring time. Lookups should use
//! the matching typed method:
//! - [`Client::get_string_value()`]
//! - [`Client::get_int_value()`]
//! - [`Client::get_bool_value()`]
//! - [`Client::get_float_value()`]
//! - [`Client::get_string_list_value()`]
//! - [`Client::get_duration_value()`]
//! - [`Client::get_json_value()`]
//!
//! Each has an `*_or` variant taking a default that absorbs every failure
//! mode, which is what most call sites want in production.
//!
//! # Sources
//!
//! By default the client subscribes to the live update stream. A JSON
//! datafile source ([`ConfigSource::Datafile`], or the `LODESTAR_DATAFILE`
//! env var) and an inline map ([`ClientOptions::inline_configs`]) are
//! available for offline work and tests. Caller-implemented
//! [`ConfigStoreGetter`] stores can be prepended to override keys.
//!
//! # Error handling
//!
//! Errors are represented by the [`Error`] enum. In production it is
//! recommended to use the `*_or` variants and ignore errors; config lookup
//! should not be critical enough to crash a system. The returned errors are
//! valuable for debugging, though.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade under the
//! `lodestar` target. Install any `log`-compatible logger for visibility
//! into stream and telemetry activity.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;

pub use client::{Client, ContextBoundClient};

pub use lodestar_core::contexts::{ContextSet, ContextValueGetter, NamedContext};
pub use lodestar_core::decrypter::{DecryptError, Decrypter};
pub use lodestar_core::env::EnvLookup;
pub use lodestar_core::latch::OnInitializationFailure;
pub use lodestar_core::options::{ClientOptions, ConfigSource, ContextTelemetryMode};
pub use lodestar_core::resolver::ConfigMatch;
pub use lodestar_core::store::ConfigStoreGetter;
pub use lodestar_core::{Error, EvaluationError, LogLevel, Result};

/// Wire types, re-exported for custom store implementations.
pub use lodestar_core::proto;
