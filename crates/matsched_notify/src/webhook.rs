//! Webhook callback delivery.
//!
//! For each subscribed event, POSTs
//! `{event, task_id, timestamp, data, signature?}` to the subscriber URL.
//! Delivery is at-least-once with exponential backoff; exhaustion marks the
//! record failed and never blocks task completion. A semaphore bounds the
//! in-flight HTTP budget.

use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use indexmap::IndexMap;
use matsched_core::{short_id, CallbackConfig, CallbackEvent, TaskId};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Delivery policy.
#[derive(Debug, Clone)]
pub struct WebhookPolicy {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the original attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    /// Backoff multiplier between retries.
    pub retry_backoff: f64,
    /// Concurrent deliveries.
    pub max_inflight: usize,
    /// Retained records.
    pub max_history: usize,
}

impl Default for WebhookPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retry_backoff: 2.0,
            max_inflight: 8,
            max_history: 1000,
        }
    }
}

/// One delivery attempt sequence.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackRecord {
    pub id: String,
    pub task_id: TaskId,
    pub event: CallbackEvent,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub response_status: Option<u16>,
    /// Total HTTP attempts made (original + retries).
    pub attempts: u32,
    pub success: bool,
    pub error: Option<String>,
}

/// Record filter.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    pub task_id: Option<TaskId>,
    pub event: Option<CallbackEvent>,
    pub success: Option<bool>,
    pub limit: usize,
}

/// Aggregate delivery statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub by_event: IndexMap<String, EventStats>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

/// Sends signed webhook callbacks with bounded retries.
pub struct WebhookDispatcher {
    client: reqwest::Client,
    policy: WebhookPolicy,
    records: Mutex<VecDeque<CallbackRecord>>,
    inflight: Arc<Semaphore>,
}

impl WebhookDispatcher {
    pub fn new(policy: WebhookPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(policy.timeout)
            .build()
            .unwrap_or_default();
        let inflight = Arc::new(Semaphore::new(policy.max_inflight.max(1)));
        Self {
            client,
            policy,
            records: Mutex::new(VecDeque::new()),
            inflight,
        }
    }

    /// Delivers one event if the subscription covers it. Returns the
    /// finished record, or `None` when the event is not subscribed.
    pub async fn send(
        &self,
        callback: &CallbackConfig,
        event: CallbackEvent,
        task_id: TaskId,
        data: Map<String, Value>,
    ) -> Option<CallbackRecord> {
        if !callback.subscribes(event) {
            return None;
        }

        let mut payload = Map::new();
        payload.insert("event".into(), Value::String(event.as_str().to_string()));
        payload.insert("task_id".into(), Value::String(task_id.to_string()));
        payload.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        payload.insert("data".into(), Value::Object(data));
        if let Some(secret) = &callback.secret {
            let signature = sign_payload(&payload, secret);
            payload.insert("signature".into(), Value::String(signature));
        }

        let mut record = CallbackRecord {
            id: short_id("cb"),
            task_id,
            event,
            url: callback.url.clone(),
            created_at: Utc::now(),
            sent_at: None,
            response_status: None,
            attempts: 0,
            success: false,
            error: None,
        };

        {
            let _permit = self.inflight.acquire().await.ok()?;
            self.deliver(&mut record, &payload).await;
        }

        self.store(record.clone()).await;
        Some(record)
    }

    async fn deliver(&self, record: &mut CallbackRecord, payload: &Map<String, Value>) {
        let mut delay = self.policy.retry_delay;

        for attempt in 0..=self.policy.max_retries {
            record.attempts = attempt + 1;
            let response = self
                .client
                .post(&record.url)
                .header("X-Webhook-Event", record.event.as_str())
                .header("X-Webhook-Id", record.id.as_str())
                .header("User-Agent", "matsched-webhook/0.1")
                .json(payload)
                .send()
                .await;

            record.sent_at = Some(Utc::now());
            match response {
                Ok(response) => {
                    let status = response.status();
                    record.response_status = Some(status.as_u16());
                    if status.is_success() {
                        record.success = true;
                        record.error = None;
                        info!(
                            record_id = %record.id,
                            task_id = %record.task_id,
                            event = %record.event,
                            status = status.as_u16(),
                            attempts = record.attempts,
                            "webhook_sent"
                        );
                        return;
                    }
                    record.error = Some(format!("HTTP {}", status.as_u16()));
                    warn!(
                        record_id = %record.id,
                        task_id = %record.task_id,
                        status = status.as_u16(),
                        attempt = record.attempts,
                        "webhook_failed"
                    );
                }
                Err(err) => {
                    record.response_status = None;
                    record.error = Some(err.to_string());
                    warn!(
                        record_id = %record.id,
                        task_id = %record.task_id,
                        error = %err,
                        attempt = record.attempts,
                        "webhook_request_error"
                    );
                }
            }

            if attempt < self.policy.max_retries {
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(self.policy.retry_backoff);
            }
        }

        warn!(
            record_id = %record.id,
            task_id = %record.task_id,
            event = %record.event,
            url = %record.url,
            "webhook_all_retries_failed"
        );
    }

    async fn store(&self, record: CallbackRecord) {
        let mut records = self.records.lock().await;
        records.push_back(record);
        while records.len() > self.policy.max_history {
            records.pop_front();
        }
    }

    /// Records matching the query, newest first.
    pub async fn records(&self, query: RecordQuery) -> Vec<CallbackRecord> {
        let records = self.records.lock().await;
        let limit = if query.limit == 0 { 100 } else { query.limit };
        records
            .iter()
            .rev()
            .filter(|r| query.task_id.map_or(true, |id| r.task_id == id))
            .filter(|r| query.event.map_or(true, |e| r.event == e))
            .filter(|r| query.success.map_or(true, |s| r.success == s))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Aggregate delivery statistics.
    pub async fn stats(&self) -> CallbackStats {
        let records = self.records.lock().await;
        let total = records.len();
        let success = records.iter().filter(|r| r.success).count();
        let mut by_event: IndexMap<String, EventStats> = IndexMap::new();
        for record in records.iter() {
            let entry = by_event
                .entry(record.event.as_str().to_string())
                .or_default();
            entry.total += 1;
            if record.success {
                entry.success += 1;
            } else {
                entry.failed += 1;
            }
        }
        CallbackStats {
            total,
            success,
            failed: total - success,
            success_rate: if total > 0 {
                success as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            by_event,
        }
    }
}

/// Canonical JSON: object keys sorted recursively, compact separators.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    canonicalize(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    canonicalize(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&serde_json::to_string(other).unwrap_or_default()),
        }
    }
    let mut out = String::new();
    canonicalize(value, &mut out);
    out
}

/// `sha256=<hex>` HMAC over the canonical payload without the signature
/// field.
fn sign_payload(payload: &Map<String, Value>, secret: &str) -> String {
    let mut unsigned = payload.clone();
    unsigned.remove("signature");
    let message = canonical_json(&Value::Object(unsigned));

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(message.as_bytes());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}
