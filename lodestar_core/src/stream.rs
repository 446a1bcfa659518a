//! Long-lived SSE subscription that feeds the live config store.
//!
//! A dedicated background thread owns a current-thread tokio runtime and
//! re-subscribes forever: on any terminal error it sleeps at least one
//! second, re-reads the store watermark, and reconnects so the server can
//! resume from that point. Decode problems are logged and discarded; they
//! affect freshness only, never already-loaded data.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::StreamExt;
use prost::Message;
use regex::Regex;

use crate::proto::ConfigSnapshot;
use crate::store::ApiConfigStore;
use crate::{Error, Result};

const STREAM_PATH: &str = "/api/v2/sse/config";
/// Fixed user name for the Basic credential; the password is the SDK key.
const STREAM_AUTH_USER: &str = "authuser";
const SDK_VERSION_HEADER: &str = "X-Lodestar-SDK-Version";
/// Resume header carrying the decimal store watermark.
const START_AT_HEADER: &str = "x-lodestar-start-at-id";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Connection settings for [`start_stream_thread`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: String,
    pub sdk_key: String,
}

impl StreamConfig {
    /// Build settings from the resolved API URL list. The stream host is the
    /// first URL with its `primary.` / `secondary.` subdomain rewritten to
    /// `stream.`.
    pub fn new(api_urls: &[String], sdk_key: impl Into<String>) -> Result<StreamConfig> {
        let base = api_urls
            .first()
            .ok_or_else(|| Error::InvalidOptions("no api urls provided".to_owned()))?;

        // TODO: fail over across the remaining api_urls on reconnect.
        Ok(StreamConfig {
            url: build_stream_url(base),
            sdk_key: sdk_key.into(),
        })
    }

    fn authorization(&self) -> String {
        let credential = BASE64.encode(format!("{STREAM_AUTH_USER}:{}", self.sdk_key));
        format!("Basic {credential}")
    }
}

fn build_stream_url(api_url: &str) -> String {
    let subdomain = Regex::new(r"(primary|secondary)\.").unwrap();
    format!("{}{STREAM_PATH}", subdomain.replace(api_url, "stream."))
}

/// Handle to the background stream thread. The thread has no stop signal;
/// it runs for the life of the process.
pub struct StreamThread {
    _join_handle: std::thread::JoinHandle<()>,
}

/// Start the stream thread. `on_first_load` fires exactly once, after the
/// first snapshot has been applied to `store`.
pub fn start_stream_thread(
    config: StreamConfig,
    store: Arc<ApiConfigStore>,
    on_first_load: Box<dyn FnOnce() + Send>,
) -> std::io::Result<StreamThread> {
    let join_handle = std::thread::Builder::new()
        .name("lodestar-stream".to_owned())
        .spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                run_stream_loop(config, store, on_first_load);
            }));
            if result.is_err() {
                log::error!(target: "lodestar", "stream thread panicked; live updates stopped");
            }
        })?;

    Ok(StreamThread {
        _join_handle: join_handle,
    })
}

fn run_stream_loop(
    config: StreamConfig,
    store: Arc<ApiConfigStore>,
    on_first_load: Box<dyn FnOnce() + Send>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            log::error!(target: "lodestar", "failed to build stream runtime: {err}");
            return;
        }
    };

    // Client holds a connection pool internally, so we're reusing it across
    // reconnects.
    let client = reqwest::Client::new();
    let mut on_first_load = Some(on_first_load);

    loop {
        let result = runtime.block_on(subscribe_once(
            &client,
            &config,
            &store,
            &mut on_first_load,
        ));

        match result {
            Ok(()) => {
                log::debug!(target: "lodestar", "stream connection closed, reconnecting");
            }
            Err(err) => {
                log::warn!(target: "lodestar", "stream error: {err}");
            }
        }

        // Avoid hammering the server between reconnects.
        std::thread::sleep(RECONNECT_DELAY);
    }
}

/// One subscription: connect with the current watermark and consume events
/// until the server closes the connection or the transport fails.
async fn subscribe_once(
    client: &reqwest::Client,
    config: &StreamConfig,
    store: &ApiConfigStore,
    on_first_load: &mut Option<Box<dyn FnOnce() + Send>>,
) -> crate::Result<()> {
    let watermark = store.high_watermark();
    log::debug!(target: "lodestar", "connecting to stream at watermark {watermark}");

    let response = client
        .get(&config.url)
        .header("Authorization", config.authorization())
        .header("Accept", "text/event-stream")
        .header(SDK_VERSION_HEADER, env!("CARGO_PKG_VERSION"))
        .header(START_AT_HEADER, watermark.to_string())
        .send()
        .await?
        .error_for_status()?;

    let mut parser = SseParser::default();
    let mut body = response.bytes_stream();

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        for data in parser.feed(&chunk) {
            if apply_event(data.as_bytes(), store) {
                if let Some(callback) = on_first_load.take() {
                    callback();
                }
            }
        }
    }

    Ok(())
}

/// Decode one event payload and apply it to the store. Returns whether a
/// snapshot was applied. Malformed payloads are logged and dropped.
fn apply_event(data: &[u8], store: &ApiConfigStore) -> bool {
    // Some stream transports surface phantom empty events for comment
    // heartbeats; skip them.
    if data.is_empty() {
        return false;
    }

    let decoded = match BASE64.decode(data) {
        Ok(decoded) => decoded,
        Err(err) => {
            log::error!(target: "lodestar", "stream: error decoding base64 data: {err}");
            return false;
        }
    };

    let snapshot = match ConfigSnapshot::decode(&decoded[..]) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            log::error!(target: "lodestar", "stream: error decoding snapshot: {err}");
            return false;
        }
    };

    log::debug!(
        target: "lodestar",
        "stream: received {} configs, applying over watermark {}",
        snapshot.configs.len(),
        store.high_watermark()
    );
    store.set_from_snapshot(&snapshot);

    true
}

/// Incremental text/event-stream parser. Only `data:` fields matter for this
/// endpoint; event names, ids, retry hints, and comments are skipped.
#[derive(Default)]
struct SseParser {
    pending: String,
    data_lines: Vec<String>,
}

impl SseParser {
    /// Feed a transport chunk, returning the data payloads of any events
    /// completed by it.
    fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line terminates an event.
                if !self.data_lines.is_empty() {
                    events.push(self.data_lines.join("\n"));
                    self.data_lines.clear();
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_owned());
            }
            // Everything else (event:, id:, retry:, comments) is ignored.
        }

        events
    }
}
