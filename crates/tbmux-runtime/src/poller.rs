//! Upstream long-poll loop: the sole consumer of the upstream getUpdates
//! session. Every received update lands in the local store, where downstream
//! consumers pick it up through their own cursors.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;
use serde_json::Value;
use tbmux_store::{StoreResult, UpdateOrigin, UpdateStore};
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::retry::RetryBackoff;

/// Headroom on top of the long-poll window before the HTTP client gives up.
const UPSTREAM_REQUEST_MARGIN: Duration = Duration::from_secs(30);

/// Update kinds whose payload is a message object that also feeds the
/// message cache.
pub(crate) fn is_cacheable_kind(kind: &str) -> bool {
    matches!(
        kind,
        "message"
            | "edited_message"
            | "channel_post"
            | "edited_channel_post"
            | "business_message"
            | "edited_business_message"
    )
}

/// Configuration for the upstream polling session.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Upstream API prefix ending in the path-escaped bot token.
    pub api_prefix: String,
    /// Long-poll window passed as `timeout=`, in seconds.
    pub polling_timeout: u64,
    /// JSON-encoded update-type filter for `allowed_updates=`; `"[]"` leaves
    /// the upstream default in effect.
    pub filter_update_types: String,
    /// Cap for the transient-failure backoff.
    pub max_retry_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct UpdatesEnvelope {
    ok: bool,
    #[serde(default)]
    result: Vec<Value>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Debug)]
enum PollOutcome {
    Stored,
    Transient,
}

/// Long-polls upstream and appends every received update to the store.
pub struct UpdatePoller {
    http: reqwest::Client,
    config: PollerConfig,
    store: Arc<UpdateStore>,
}

impl UpdatePoller {
    pub fn new(config: PollerConfig, store: Arc<UpdateStore>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(crate::USER_AGENT));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.polling_timeout) + UPSTREAM_REQUEST_MARGIN)
            .build()
            .context("failed to create upstream polling client")?;

        Ok(Self {
            http,
            config,
            store,
        })
    }

    /// Runs the polling loop forever. Transient upstream failures back off
    /// exponentially; only a 4xx rejection of getUpdates returns an error.
    pub async fn run(&self) -> Result<()> {
        let mut offset = 0_u64;
        let mut backoff = RetryBackoff::new(self.config.max_retry_interval);
        loop {
            match self.poll_once(&mut offset).await? {
                PollOutcome::Stored => backoff.reset(),
                PollOutcome::Transient => backoff.sleep_until_retry().await,
            }
        }
    }

    fn get_updates_url(&self, offset: u64) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("timeout", &self.config.polling_timeout.to_string());
        if offset > 0 {
            query.append_pair("offset", &offset.to_string());
        }
        query.append_pair("allowed_updates", &self.config.filter_update_types);
        format!("{}/getUpdates?{}", self.config.api_prefix, query.finish())
    }

    async fn poll_once(&self, offset: &mut u64) -> Result<PollOutcome> {
        let request_url = self.get_updates_url(*offset);
        debug!("GET {request_url}");

        let response = match self.http.get(&request_url).send().await {
            Ok(response) => response,
            Err(error) => {
                warn!("upstream getUpdates request failed: {error:#}");
                return Ok(PollOutcome::Transient);
            }
        };

        let status = response.status();
        if status.is_client_error() {
            bail!("upstream getUpdates rejected with status {status}");
        }
        if !status.is_success() {
            warn!("upstream getUpdates returned status {status}");
            return Ok(PollOutcome::Transient);
        }

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(error) => {
                warn!("failed to read upstream getUpdates body: {error:#}");
                return Ok(PollOutcome::Transient);
            }
        };
        let envelope: UpdatesEnvelope = match serde_json::from_slice(&body) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!("failed to decode upstream getUpdates body: {error:#}");
                return Ok(PollOutcome::Transient);
            }
        };
        if !envelope.ok {
            warn!(
                "upstream getUpdates error {}: {}",
                envelope.error_code.unwrap_or_default(),
                envelope.description.unwrap_or_default(),
            );
            return Ok(PollOutcome::Transient);
        }

        if let Err(error) = self.store_batch(offset, &envelope.result) {
            warn!("failed to store updates: {error}");
            return Ok(PollOutcome::Transient);
        }
        Ok(PollOutcome::Stored)
    }

    /// Stores a getUpdates batch and always notifies consumers afterwards:
    /// a failed commit may still have landed rows, and woken waiters simply
    /// re-query the log.
    fn store_batch(&self, offset: &mut u64, batch: &[Value]) -> StoreResult<()> {
        let result = self.store_batch_inner(offset, batch);
        self.store.notify_updates();
        result
    }

    fn store_batch_inner(&self, offset: &mut u64, batch: &[Value]) -> StoreResult<()> {
        let tx = self.store.begin()?;
        let mut next_offset = *offset;
        for update in batch {
            let Some(update_object) = update.as_object() else {
                continue;
            };
            let Some(update_id) = update_object.get("update_id").and_then(Value::as_u64) else {
                continue;
            };
            next_offset = next_offset.max(update_id + 1);

            for (kind, payload) in update_object {
                if kind == "update_id" {
                    continue;
                }
                if is_cacheable_kind(kind) {
                    if let Err(error) = tx.upsert_message(payload) {
                        warn!("failed to cache message of update {update_id}: {error}");
                    }
                }
                // A failed insert loses that update but not the batch.
                if let Err(error) =
                    tx.insert_update(UpdateOrigin::Upstream, Some(update_id), kind, payload)
                {
                    warn!("failed to store update {update_id}: {error}");
                }
            }
        }
        tx.commit()?;
        *offset = next_offset;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;
    use tempfile::tempdir;

    fn poller_for(upstream: &MockServer, store: Arc<UpdateStore>) -> UpdatePoller {
        UpdatePoller::new(
            PollerConfig {
                api_prefix: format!("{}/bottest-token", upstream.base_url()),
                polling_timeout: 10,
                filter_update_types: "[]".to_string(),
                max_retry_interval: Duration::from_secs(600),
            },
            store,
        )
        .expect("build poller")
    }

    fn open_store(dir: &tempfile::TempDir) -> Arc<UpdateStore> {
        Arc::new(UpdateStore::open(dir.path().join("tbmux.db")).expect("open store"))
    }

    #[test]
    fn unit_get_updates_url_omits_offset_until_first_batch() {
        let temp = tempdir().expect("tempdir");
        let poller = UpdatePoller::new(
            PollerConfig {
                api_prefix: "https://upstream.invalid/bottest-token".to_string(),
                polling_timeout: 10,
                filter_update_types: "[]".to_string(),
                max_retry_interval: Duration::from_secs(600),
            },
            open_store(&temp),
        )
        .expect("build poller");

        let first = poller.get_updates_url(0);
        assert!(first.contains("timeout=10"));
        assert!(first.contains("allowed_updates=%5B%5D"));
        assert!(!first.contains("offset="));

        let later = poller.get_updates_url(42);
        assert!(later.contains("offset=42"));
    }

    #[tokio::test]
    async fn integration_poll_once_stores_batch_and_advances_offset() {
        let upstream = MockServer::start_async().await;
        let poll = upstream.mock(|when, then| {
            when.method(GET).path("/bottest-token/getUpdates");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "ok": true,
                    "result": [
                        {
                            "update_id": 40,
                            "message": {
                                "message_id": 5,
                                "chat": {"id": 100, "type": "private"},
                                "text": "hi",
                            },
                        },
                        {
                            "update_id": 41,
                            "callback_query": {"id": "cb-1", "data": "press"},
                        },
                    ],
                }));
        });

        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        let poller = poller_for(&upstream, Arc::clone(&store));

        let mut offset = 0_u64;
        let outcome = poller.poll_once(&mut offset).await.expect("poll");
        assert!(matches!(outcome, PollOutcome::Stored));
        assert_eq!(offset, 42);
        poll.assert();

        let updates = store
            .fetch_updates("bot-a", 10, Duration::ZERO)
            .await
            .expect("fetch");
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].kind, "message");
        assert_eq!(updates[1].kind, "callback_query");
        assert!(updates[0].local_id < updates[1].local_id);

        let cached = store
            .cached_message(100, 5)
            .expect("read cache")
            .expect("cache entry");
        assert_eq!(cached["text"], "hi");
    }

    #[tokio::test]
    async fn regression_poll_once_is_transient_on_5xx() {
        let upstream = MockServer::start_async().await;
        upstream.mock(|when, then| {
            when.method(GET).path("/bottest-token/getUpdates");
            then.status(502);
        });

        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        let poller = poller_for(&upstream, Arc::clone(&store));

        let mut offset = 7_u64;
        let outcome = poller.poll_once(&mut offset).await.expect("poll");
        assert!(matches!(outcome, PollOutcome::Transient));
        assert_eq!(offset, 7);
    }

    #[tokio::test]
    async fn regression_poll_once_is_fatal_on_4xx() {
        let upstream = MockServer::start_async().await;
        upstream.mock(|when, then| {
            when.method(GET).path("/bottest-token/getUpdates");
            then.status(401);
        });

        let temp = tempdir().expect("tempdir");
        let poller = poller_for(&upstream, open_store(&temp));

        let mut offset = 0_u64;
        let error = poller
            .poll_once(&mut offset)
            .await
            .expect_err("fatal status");
        assert!(error.to_string().contains("401"));
    }

    #[tokio::test]
    async fn regression_poll_once_is_transient_on_ok_false() {
        let upstream = MockServer::start_async().await;
        upstream.mock(|when, then| {
            when.method(GET).path("/bottest-token/getUpdates");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "ok": false,
                    "error_code": 420,
                    "description": "FLOOD_WAIT",
                }));
        });

        let temp = tempdir().expect("tempdir");
        let store = open_store(&temp);
        let poller = poller_for(&upstream, Arc::clone(&store));

        let mut offset = 0_u64;
        let outcome = poller.poll_once(&mut offset).await.expect("poll");
        assert!(matches!(outcome, PollOutcome::Transient));

        let updates = store
            .fetch_updates("bot-a", 10, Duration::ZERO)
            .await
            .expect("fetch");
        assert!(updates.is_empty());
    }
}
