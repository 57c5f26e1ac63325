//! Alert rules, the periodic checker, and notification channels.
//!
//! Rules compare one metric against a threshold; a rule in cooldown never
//! re-fires. Alerts are a record of discrete incidents: the engine does not
//! auto-resolve, a caller stamps resolution explicitly.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use matsched_core::{short_id, CancelToken};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::metrics::MetricCollector;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Critical,
    Warning,
    Info,
}

/// Comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CmpOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl CmpOp {
    pub fn evaluate(&self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Eq => value == threshold,
            CmpOp::Ne => value != threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

/// Threshold condition over one metric.
#[derive(Debug, Clone, Serialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: CmpOp,
    pub threshold: f64,
}

impl AlertCondition {
    pub fn new(metric: impl Into<String>, operator: CmpOp, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
        }
    }
}

/// Notification channel tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    Log,
    File,
    Webhook,
}

/// One alert rule.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub description: String,
    pub level: AlertLevel,
    pub condition: AlertCondition,
    pub enabled: bool,
    pub cooldown_seconds: u64,
    pub channels: Vec<NotifyChannel>,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        level: AlertLevel,
        condition: AlertCondition,
        cooldown_seconds: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            level,
            condition,
            enabled: true,
            cooldown_seconds,
            channels: vec![NotifyChannel::Log, NotifyChannel::Webhook],
            last_triggered: None,
            trigger_count: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_channels(mut self, channels: Vec<NotifyChannel>) -> Self {
        self.channels = channels;
        self
    }

    /// Enabled and out of cooldown.
    pub fn can_trigger(&self) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_triggered {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(last);
                elapsed.num_seconds() >= self.cooldown_seconds as i64
            }
        }
    }
}

/// The built-in rule set; modifiable at runtime through the engine.
pub fn builtin_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "gpu_unavailable",
            "GPU unavailable",
            AlertLevel::Critical,
            AlertCondition::new("available_gpus", CmpOp::Lt, 1.0),
            60,
        )
        .with_description("No GPU is available for scheduling"),
        AlertRule::new(
            "gpu_memory_low",
            "GPU memory low",
            AlertLevel::Warning,
            AlertCondition::new("min_gpu_free_memory_gb", CmpOp::Lt, 2.0),
            300,
        )
        .with_description("Least free GPU memory dropped below 2 GB"),
        AlertRule::new(
            "gpu_temp_high",
            "GPU temperature high",
            AlertLevel::Warning,
            AlertCondition::new("max_gpu_temp", CmpOp::Gt, 85.0),
            300,
        )
        .with_description("Hottest GPU exceeded 85 °C"),
        AlertRule::new(
            "queue_backlog",
            "Task queue backlog",
            AlertLevel::Warning,
            AlertCondition::new("queue_length", CmpOp::Gt, 100.0),
            600,
        )
        .with_description("More than 100 tasks are waiting"),
        AlertRule::new(
            "task_failures",
            "Consecutive task failures",
            AlertLevel::Warning,
            AlertCondition::new("consecutive_failures", CmpOp::Gt, 5.0),
            300,
        )
        .with_description("More than 5 tasks failed in a row"),
        AlertRule::new(
            "disk_space_low",
            "Disk space low",
            AlertLevel::Warning,
            AlertCondition::new("disk_free_gb", CmpOp::Lt, 50.0),
            3600,
        )
        .with_description("Free disk space dropped below 50 GB"),
        AlertRule::new(
            "worker_offline",
            "Worker offline",
            AlertLevel::Critical,
            AlertCondition::new("active_workers", CmpOp::Lt, 1.0),
            60,
        )
        .with_description("No worker is heartbeating"),
    ]
}

/// Rule storage and evaluation.
pub struct AlertRuleEngine {
    rules: Mutex<IndexMap<String, AlertRule>>,
}

impl Default for AlertRuleEngine {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl AlertRuleEngine {
    /// Engine with no rules.
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(IndexMap::new()),
        }
    }

    /// Engine pre-loaded with the built-in rule set.
    pub fn with_builtin() -> Self {
        let engine = Self::new();
        {
            let mut rules = engine.rules.try_lock().expect("fresh engine");
            for rule in builtin_rules() {
                rules.insert(rule.id.clone(), rule);
            }
        }
        engine
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        info!(rule_id = %rule.id, name = %rule.name, "alert_rule_added");
        self.rules.lock().await.insert(rule.id.clone(), rule);
    }

    pub async fn remove_rule(&self, rule_id: &str) -> bool {
        self.rules.lock().await.shift_remove(rule_id).is_some()
    }

    pub async fn enable_rule(&self, rule_id: &str) -> bool {
        self.set_enabled(rule_id, true).await
    }

    pub async fn disable_rule(&self, rule_id: &str) -> bool {
        self.set_enabled(rule_id, false).await
    }

    async fn set_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        match self.rules.lock().await.get_mut(rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All rules, optionally only enabled ones.
    pub async fn list_rules(&self, enabled_only: bool) -> Vec<AlertRule> {
        self.rules
            .lock()
            .await
            .values()
            .filter(|r| !enabled_only || r.enabled)
            .cloned()
            .collect()
    }

    /// Evaluates every rule whose cooldown has elapsed against the metric
    /// snapshot; triggering rules get their bookkeeping updated.
    pub async fn evaluate(&self, metrics: &IndexMap<String, f64>) -> Vec<AlertRule> {
        let mut triggered = Vec::new();
        let mut rules = self.rules.lock().await;
        for rule in rules.values_mut() {
            if !rule.can_trigger() {
                continue;
            }
            let Some(&value) = metrics.get(&rule.condition.metric) else {
                continue;
            };
            if rule.condition.operator.evaluate(value, rule.condition.threshold) {
                rule.last_triggered = Some(Utc::now());
                rule.trigger_count += 1;
                info!(
                    rule_id = %rule.id,
                    metric = %rule.condition.metric,
                    value,
                    threshold = rule.condition.threshold,
                    "alert_rule_triggered"
                );
                triggered.push(rule.clone());
            }
        }
        triggered
    }
}

/// A fired alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub level: AlertLevel,
    pub message: String,
    pub details: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notified_channels: Vec<NotifyChannel>,
}

/// Sends alerts through the configured channels and keeps bounded history.
pub struct AlertNotifier {
    webhook_url: Option<String>,
    file_path: Option<PathBuf>,
    client: reqwest::Client,
    history: Mutex<VecDeque<Alert>>,
    max_history: usize,
}

impl AlertNotifier {
    pub fn new(webhook_url: Option<String>, file_path: Option<PathBuf>, max_history: usize) -> Self {
        Self {
            webhook_url,
            file_path,
            client: reqwest::Client::new(),
            history: Mutex::new(VecDeque::new()),
            max_history: max_history.max(1),
        }
    }

    /// Builds, dispatches, and records an alert for a triggered rule.
    pub async fn notify(&self, rule: &AlertRule, metrics: &IndexMap<String, f64>) -> Alert {
        let value = metrics
            .get(&rule.condition.metric)
            .copied()
            .unwrap_or(f64::NAN);
        let mut details = Map::new();
        details.insert("rule_name".into(), json!(rule.name));
        details.insert("metric".into(), json!(rule.condition.metric));
        details.insert("operator".into(), json!(rule.condition.operator.as_str()));
        details.insert("threshold".into(), json!(rule.condition.threshold));
        details.insert("value".into(), json!(value));
        details.insert("trigger_count".into(), json!(rule.trigger_count));

        let mut alert = Alert {
            id: short_id("alert"),
            rule_id: rule.id.clone(),
            level: rule.level,
            message: format!(
                "{}: {} (value: {value}, threshold: {} {})",
                rule.name,
                rule.description,
                rule.condition.operator.as_str(),
                rule.condition.threshold
            ),
            details,
            created_at: Utc::now(),
            resolved: false,
            resolved_at: None,
            resolved_by: None,
            notified_channels: Vec::new(),
        };

        for channel in &rule.channels {
            let delivered = match channel {
                NotifyChannel::Log => {
                    self.notify_log(&alert);
                    true
                }
                NotifyChannel::File => self.notify_file(&alert).await,
                NotifyChannel::Webhook => self.notify_webhook(&alert).await,
            };
            if delivered {
                alert.notified_channels.push(*channel);
            }
        }

        let mut history = self.history.lock().await;
        history.push_back(alert.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }
        alert
    }

    fn notify_log(&self, alert: &Alert) {
        match alert.level {
            AlertLevel::Critical => {
                error!(alert_id = %alert.id, rule_id = %alert.rule_id, message = %alert.message, "alert_triggered")
            }
            AlertLevel::Warning => {
                warn!(alert_id = %alert.id, rule_id = %alert.rule_id, message = %alert.message, "alert_triggered")
            }
            AlertLevel::Info => {
                info!(alert_id = %alert.id, rule_id = %alert.rule_id, message = %alert.message, "alert_triggered")
            }
        }
    }

    async fn notify_file(&self, alert: &Alert) -> bool {
        let Some(path) = &self.file_path else {
            return false;
        };
        let line = match serde_json::to_string(alert) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "alert_file_serialize_failed");
                return false;
            }
        };
        let result = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "alert_file_write_failed");
                false
            }
        }
    }

    async fn notify_webhook(&self, alert: &Alert) -> bool {
        let Some(url) = &self.webhook_url else {
            return false;
        };
        let body = json!({"type": "alert", "alert": alert});
        match self
            .client
            .post(url)
            .header("User-Agent", "matsched-alert/0.1")
            .json(&body)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(alert_id = %alert.id, status = response.status().as_u16(), "alert_webhook_failed");
                false
            }
            Err(err) => {
                warn!(alert_id = %alert.id, error = %err, "alert_webhook_error");
                false
            }
        }
    }

    /// Stamps an alert resolved. Returns false for unknown ids.
    pub async fn resolve(&self, alert_id: &str, resolved_by: impl Into<String>) -> bool {
        let mut history = self.history.lock().await;
        match history.iter_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(Utc::now());
                alert.resolved_by = Some(resolved_by.into());
                info!(alert_id = %alert_id, "alert_resolved");
                true
            }
            None => false,
        }
    }

    /// Unresolved alerts, newest first.
    pub async fn active_alerts(&self) -> Vec<Alert> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .filter(|a| !a.resolved)
            .cloned()
            .collect()
    }

    /// Full retained history, newest first.
    pub async fn history(&self, limit: usize) -> Vec<Alert> {
        self.history
            .lock()
            .await
            .iter()
            .rev()
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect()
    }
}

/// Checker statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CheckerStats {
    pub check_count: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_metrics: IndexMap<String, f64>,
}

/// Periodic snapshot-and-evaluate loop.
pub struct AlertChecker {
    collectors: Vec<Box<dyn MetricCollector>>,
    engine: AlertRuleEngine,
    notifier: AlertNotifier,
    check_interval: Duration,
    stats: Mutex<CheckerStats>,
}

impl AlertChecker {
    pub fn new(engine: AlertRuleEngine, notifier: AlertNotifier, check_interval: Duration) -> Self {
        Self {
            collectors: Vec::new(),
            engine,
            notifier,
            check_interval,
            stats: Mutex::new(CheckerStats {
                check_count: 0,
                last_check: None,
                last_metrics: IndexMap::new(),
            }),
        }
    }

    /// Registers a metric collector.
    pub fn add_collector(&mut self, collector: Box<dyn MetricCollector>) {
        self.collectors.push(collector);
    }

    /// Rule storage handle.
    pub fn engine(&self) -> &AlertRuleEngine {
        &self.engine
    }

    /// Notifier handle (history, resolution).
    pub fn notifier(&self) -> &AlertNotifier {
        &self.notifier
    }

    /// One collection-and-evaluation pass.
    pub async fn check_once(&self) -> Vec<Alert> {
        let mut metrics = IndexMap::new();
        for collector in &self.collectors {
            match collector.collect().await {
                Ok(sample) => metrics.extend(sample),
                Err(err) => warn!(error = %err, "metric_collector_failed"),
            }
        }

        {
            let mut stats = self.stats.lock().await;
            stats.check_count += 1;
            stats.last_check = Some(Utc::now());
            stats.last_metrics = metrics.clone();
        }

        let triggered = self.engine.evaluate(&metrics).await;
        let mut alerts = Vec::with_capacity(triggered.len());
        for rule in &triggered {
            alerts.push(self.notifier.notify(rule, &metrics).await);
        }
        alerts
    }

    /// Runs the ticker until the token trips.
    pub async fn run(&self, shutdown: CancelToken) {
        info!(interval_s = self.check_interval.as_secs(), "alert_checker_started");
        while !shutdown.is_cancelled() {
            tokio::select! {
                _ = tokio::time::sleep(self.check_interval) => {
                    self.check_once().await;
                }
                _ = shutdown.cancelled() => {}
            }
        }
        info!("alert_checker_stopped");
    }

    /// Checker statistics snapshot.
    pub async fn stats(&self) -> CheckerStats {
        self.stats.lock().await.clone()
    }
}
