//! Notification layer for matsched.
//!
//! - `webhook`: at-least-once delivery of task lifecycle events with
//!   bounded retries and HMAC-signed payloads
//! - `alerts`: rule engine, periodic checker, and notification channels
//! - `metrics`: metric collectors feeding the alert checker

pub mod alerts;
pub mod metrics;
pub mod webhook;

pub use alerts::{
    builtin_rules, Alert, AlertChecker, AlertCondition, AlertLevel, AlertNotifier, AlertRule,
    AlertRuleEngine, CmpOp, NotifyChannel,
};
pub use metrics::{DiskFreeCollector, FnCollector, MetricCollector};
pub use webhook::{
    canonical_json, CallbackRecord, CallbackStats, RecordQuery, WebhookDispatcher, WebhookPolicy,
};
