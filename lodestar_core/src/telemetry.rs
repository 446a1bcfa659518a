//! Telemetry aggregation and submission.
//!
//! Evaluations and contexts are aggregated in memory and flushed to the
//! telemetry endpoint by a periodic background thread. Telemetry failures
//! are logged and never surfaced to callers.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;

use crate::contexts::ContextSet;
use crate::options::{ClientOptions, ContextTelemetryMode};
use crate::proto::{
    self, telemetry_event, ConfigValue, ContextSnapshot, NamedContextSnapshot,
};
use crate::resolver::ConfigMatch;
use crate::{Error, Result};

const TELEMETRY_PATH: &str = "/api/v1/telemetry";
/// Cap on distinct example contexts buffered between submissions.
const MAX_EXAMPLE_CONTEXTS: usize = 100;

/// Field type codes reported in context shapes.
fn shape_field_type(value: &serde_json::Value) -> i32 {
    match value {
        serde_json::Value::Number(n) if n.is_i64() => 1,
        serde_json::Value::String(_) => 2,
        serde_json::Value::Number(_) => 4,
        serde_json::Value::Bool(_) => 5,
        serde_json::Value::Array(_) => 10,
        _ => 16,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SummaryKey {
    config_key: String,
    config_type: i32,
    config_id: i64,
    row_index: Option<usize>,
    conditional_value_index: Option<usize>,
    weighted_value_index: Option<usize>,
    selected_value: Option<String>,
}

#[derive(Default)]
struct Aggregated {
    summaries: HashMap<SummaryKey, i64>,
    summaries_start_at: i64,
    shapes: HashMap<String, HashMap<String, i32>>,
    example_contexts: Vec<(i64, ContextSnapshot)>,
    example_fingerprints: HashSet<String>,
}

/// Collects evaluation and context telemetry and submits it periodically.
///
/// Shared between the client (recording) and the flush thread; all methods
/// take `&self`.
pub struct TelemetrySubmitter {
    host: String,
    sdk_key: String,
    instance_hash: String,
    mode: ContextTelemetryMode,
    collect_summaries: bool,
    aggregated: Mutex<Aggregated>,
}

impl TelemetrySubmitter {
    pub fn new(options: &ClientOptions) -> TelemetrySubmitter {
        TelemetrySubmitter {
            host: options.telemetry_host.clone(),
            sdk_key: options.sdk_key.clone(),
            instance_hash: options.instance_hash.clone(),
            mode: options.context_telemetry_mode,
            collect_summaries: options.collect_evaluation_summaries,
            aggregated: Mutex::new(Aggregated::default()),
        }
    }

    /// Record one resolver outcome.
    pub fn record_evaluation(&self, config_match: &ConfigMatch) {
        if !self.collect_summaries {
            return;
        }

        let key = SummaryKey {
            config_key: config_match.config_key.clone(),
            config_type: config_match.config_type as i32,
            config_id: config_match.config_id,
            row_index: config_match.row_index,
            conditional_value_index: config_match.conditional_value_index,
            weighted_value_index: config_match.weighted_value_index,
            // Confidential values are never reported.
            selected_value: config_match
                .value
                .as_ref()
                .filter(|value| value.confidential != Some(true))
                .and_then(crate::extractors::extract_any)
                .map(|value| value.to_string()),
        };

        let mut aggregated = self.lock();
        if aggregated.summaries.is_empty() {
            aggregated.summaries_start_at = now_millis();
        }
        *aggregated.summaries.entry(key).or_insert(0) += 1;
    }

    /// Record the merged context used for an evaluation, per the configured
    /// mode.
    pub fn record_context(&self, context: &ContextSet) {
        if self.mode == ContextTelemetryMode::None || context.is_empty() {
            return;
        }

        let mut aggregated = self.lock();

        for named in context.named_contexts() {
            let shape = aggregated.shapes.entry(named.name.clone()).or_default();
            for (field, value) in &named.data {
                shape.insert(field.clone(), shape_field_type(value));
            }
        }

        if self.mode == ContextTelemetryMode::PeriodicExample {
            let fingerprint = context_fingerprint(context);
            if aggregated.example_contexts.len() < MAX_EXAMPLE_CONTEXTS
                && aggregated.example_fingerprints.insert(fingerprint)
            {
                let snapshot = context_to_snapshot(context);
                aggregated.example_contexts.push((now_millis(), snapshot));
            }
        }
    }

    /// Drain the aggregators and POST the payload. A failed submission is
    /// logged and its data dropped.
    pub fn submit(&self) -> Result<()> {
        let Some(events) = self.drain() else {
            return Ok(());
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(Error::from)?;

        runtime.block_on(self.post(events))
    }

    fn drain(&self) -> Option<proto::TelemetryEvents> {
        let mut aggregated = self.lock();
        let mut events = Vec::new();

        if !aggregated.summaries.is_empty() {
            let start_at = aggregated.summaries_start_at;
            let mut summaries: HashMap<(String, i32), Vec<proto::ConfigEvaluationCounter>> =
                HashMap::new();
            for (key, count) in aggregated.summaries.drain() {
                summaries
                    .entry((key.config_key.clone(), key.config_type))
                    .or_default()
                    .push(proto::ConfigEvaluationCounter {
                        count,
                        config_id: Some(key.config_id),
                        config_row_index: key.row_index.map(|i| i as u32),
                        conditional_value_index: key.conditional_value_index.map(|i| i as u32),
                        weighted_value_index: key.weighted_value_index.map(|i| i as u32),
                        selected_value: key.selected_value.map(ConfigValue::string),
                    });
            }
            events.push(proto::TelemetryEvent {
                payload: Some(telemetry_event::Payload::Summaries(
                    proto::ConfigEvaluationSummaries {
                        start_at,
                        end_at: now_millis(),
                        summaries: summaries
                            .into_iter()
                            .map(|((key, config_type), counters)| {
                                proto::ConfigEvaluationSummary {
                                    key,
                                    config_type,
                                    counters,
                                }
                            })
                            .collect(),
                    },
                )),
            });
        }

        if !aggregated.shapes.is_empty() {
            let shapes = aggregated
                .shapes
                .drain()
                .map(|(name, field_types)| proto::ContextShape { name, field_types })
                .collect();
            events.push(proto::TelemetryEvent {
                payload: Some(telemetry_event::Payload::ContextShapes(
                    proto::ContextShapes { shapes },
                )),
            });
        }

        if !aggregated.example_contexts.is_empty() {
            let examples = aggregated
                .example_contexts
                .drain(..)
                .map(|(timestamp, context_set)| proto::ExampleContext {
                    timestamp,
                    context_set: Some(context_set),
                })
                .collect();
            aggregated.example_fingerprints.clear();
            events.push(proto::TelemetryEvent {
                payload: Some(telemetry_event::Payload::ExampleContexts(
                    proto::ExampleContexts { examples },
                )),
            });
        }

        if events.is_empty() {
            return None;
        }

        Some(proto::TelemetryEvents {
            instance_hash: self.instance_hash.clone(),
            events,
        })
    }

    async fn post(&self, events: proto::TelemetryEvents) -> Result<()> {
        let url = format!("{}{TELEMETRY_PATH}", self.host);
        let body = events.encode_to_vec();

        log::debug!(target: "lodestar", "submitting {} telemetry events", events.events.len());

        let response = reqwest::Client::new()
            .post(url)
            .basic_auth("authuser", Some(&self.sdk_key))
            .header("Content-Type", "application/x-protobuf")
            .body(body)
            .send()
            .await?;

        response.error_for_status()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Aggregated> {
        self.aggregated
            .lock()
            .expect("thread holding telemetry lock should not panic")
    }
}

/// Periodic flusher owning a [`TelemetrySubmitter`].
pub struct TelemetryThread {
    submitter: Arc<TelemetrySubmitter>,
    stop_sender: std::sync::mpsc::SyncSender<()>,
    join_handle: std::thread::JoinHandle<()>,
}

impl TelemetryThread {
    pub fn start(
        submitter: Arc<TelemetrySubmitter>,
        interval: Duration,
    ) -> std::io::Result<TelemetryThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = {
            let submitter = submitter.clone();
            std::thread::Builder::new()
                .name("lodestar-telemetry".to_owned())
                .spawn(move || loop {
                    match stop_receiver.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(err) = submitter.submit() {
                                log::warn!(target: "lodestar", "telemetry submission failed: {err}");
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                            log::debug!(target: "lodestar", "telemetry thread stopping");
                            return;
                        }
                    }
                })?
        };

        Ok(TelemetryThread {
            submitter,
            stop_sender,
            join_handle,
        })
    }

    pub fn submitter(&self) -> &Arc<TelemetrySubmitter> {
        &self.submitter
    }

    /// Stop the flusher and block until it exits. Buffered data is dropped;
    /// call [`TelemetrySubmitter::submit`] first to drain it.
    pub fn shutdown(self) -> Result<()> {
        let _ = self.stop_sender.try_send(());
        self.join_handle
            .join()
            .map_err(|_| Error::BackgroundThreadPanicked)
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn context_fingerprint(context: &ContextSet) -> String {
    let mut parts = Vec::new();
    for named in context.named_contexts() {
        for (field, value) in &named.data {
            parts.push(format!("{}.{field}={value}", named.name));
        }
    }
    parts.join(";")
}

fn context_to_snapshot(context: &ContextSet) -> ContextSnapshot {
    ContextSnapshot {
        contexts: context
            .named_contexts()
            .map(|named| NamedContextSnapshot {
                name: named.name.clone(),
                values: named
                    .data
                    .iter()
                    .map(|(field, value)| (field.clone(), ConfigValue::from(value)))
                    .collect(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::proto::ConfigType;
    use crate::resolver::ConfigMatch;

    fn options() -> ClientOptions {
        ClientOptions::new().sdk_key("test-key")
    }

    fn sample_match(key: &str) -> ConfigMatch {
        ConfigMatch {
            is_match: true,
            config_key: key.to_owned(),
            config_id: 3,
            config_type: ConfigType::Config,
            value: Some(ConfigValue::string("v")),
            original_value: Some(ConfigValue::string("v")),
            row_index: Some(0),
            conditional_value_index: Some(0),
            weighted_value_index: None,
            env_id: None,
        }
    }

    #[test]
    fn identical_evaluations_aggregate_into_one_counter() {
        let submitter = TelemetrySubmitter::new(&options());

        for _ in 0..5 {
            submitter.record_evaluation(&sample_match("a.key"));
        }
        submitter.record_evaluation(&sample_match("b.key"));

        let events = submitter.drain().unwrap();
        let summaries = events
            .events
            .iter()
            .find_map(|event| match &event.payload {
                Some(telemetry_event::Payload::Summaries(s)) => Some(s),
                _ => None,
            })
            .unwrap();

        assert_eq!(summaries.summaries.len(), 2);
        let a = summaries
            .summaries
            .iter()
            .find(|summary| summary.key == "a.key")
            .unwrap();
        assert_eq!(a.counters[0].count, 5);
        assert_eq!(a.counters[0].config_row_index, Some(0));
    }

    #[test]
    fn confidential_values_are_not_reported() {
        let submitter = TelemetrySubmitter::new(&options());

        let mut secret = sample_match("secret.key");
        let mut value = ConfigValue::string("hunter2");
        value.confidential = Some(true);
        secret.value = Some(value);
        submitter.record_evaluation(&secret);

        let events = submitter.drain().unwrap();
        let summaries = events
            .events
            .iter()
            .find_map(|event| match &event.payload {
                Some(telemetry_event::Payload::Summaries(s)) => Some(s),
                _ => None,
            })
            .unwrap();
        assert_eq!(summaries.summaries[0].counters[0].selected_value, None);
    }

    #[test]
    fn summaries_can_be_disabled() {
        let submitter =
            TelemetrySubmitter::new(&options().collect_evaluation_summaries(false));
        submitter.record_evaluation(&sample_match("a.key"));
        assert!(submitter.drain().is_none());
    }

    #[test]
    fn context_shapes_capture_field_type_codes() {
        let submitter = TelemetrySubmitter::new(&options());
        let context = ContextSet::new().with_named_values(
            "user",
            [
                ("id".to_owned(), json!(12)),
                ("name".to_owned(), json!("ada")),
                ("score".to_owned(), json!(0.5)),
                ("active".to_owned(), json!(true)),
            ],
        );

        submitter.record_context(&context);

        let events = submitter.drain().unwrap();
        let shapes = events
            .events
            .iter()
            .find_map(|event| match &event.payload {
                Some(telemetry_event::Payload::ContextShapes(s)) => Some(s),
                _ => None,
            })
            .unwrap();
        let user = shapes.shapes.iter().find(|shape| shape.name == "user").unwrap();
        assert_eq!(user.field_types["id"], 1);
        assert_eq!(user.field_types["name"], 2);
        assert_eq!(user.field_types["score"], 4);
        assert_eq!(user.field_types["active"], 5);
    }

    #[test]
    fn example_contexts_deduplicate_within_a_window() {
        let submitter = TelemetrySubmitter::new(&options());
        let context =
            ContextSet::new().with_named_values("user", [("id".to_owned(), json!(1))]);

        submitter.record_context(&context);
        submitter.record_context(&context);

        let events = submitter.drain().unwrap();
        let examples = events
            .events
            .iter()
            .find_map(|event| match &event.payload {
                Some(telemetry_event::Payload::ExampleContexts(e)) => Some(e),
                _ => None,
            })
            .unwrap();
        assert_eq!(examples.examples.len(), 1);
    }

    #[test]
    fn shapes_mode_skips_example_contexts() {
        let submitter = TelemetrySubmitter::new(
            &options().context_telemetry_mode(ContextTelemetryMode::Shapes),
        );
        let context =
            ContextSet::new().with_named_values("user", [("id".to_owned(), json!(1))]);

        submitter.record_context(&context);

        let events = submitter.drain().unwrap();
        assert!(events.events.iter().all(|event| !matches!(
            event.payload,
            Some(telemetry_event::Payload::ExampleContexts(_))
        )));
    }

    #[test]
    fn none_mode_records_nothing_about_contexts() {
        let submitter = TelemetrySubmitter::new(
            &options().context_telemetry_mode(ContextTelemetryMode::None),
        );
        submitter.record_context(
            &ContextSet::new().with_named_values("user", [("id".to_owned(), json!(1))]),
        );
        assert!(submitter.drain().is_none());
    }
}
