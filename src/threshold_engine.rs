//! Per-sensor threshold evaluation of telemetry readings.
//!
//! Rules are resolved through the threshold cache. The first reading for an
//! unknown sensor key provisions an unbounded rule, which never violates until
//! someone sets bounds on it.
use crate::error::StoreError;
use crate::models::{NewThresholdRule, ThresholdKey, ThresholdRule, Violation};
use crate::notification::{NotificationDispatcher, NotifyOutcome};
use crate::store::Store;
use crate::threshold_cache::ThresholdCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub const DEFAULT_WARNING_MESSAGE: &str = "Warning";

const PLACEHOLDERS: [&str; 4] = ["{value}", "{min}", "{max}", "{sensor}"];

pub struct ThresholdEngine {
    store: Arc<dyn Store>,
    cache: Arc<ThresholdCache>,
    notifications: NotificationDispatcher,
    /// Alert deliveries still running; see `drain_alerts`.
    alerts: Mutex<JoinSet<NotifyOutcome>>,
}

/// Result of `evaluate_and_notify`.
pub struct EvaluationReport {
    pub violations: Vec<Violation>,
    /// Whether an alert task was started for the violations.
    pub alert_dispatched: bool,
}

impl ThresholdEngine {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<ThresholdCache>,
        notifications: NotificationDispatcher,
    ) -> Self {
        Self {
            store,
            cache,
            notifications,
            alerts: Mutex::new(JoinSet::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ThresholdCache> {
        &self.cache
    }

    /// Cached rule for `key`, created unbounded when the store has none.
    /// Callers waiting on the same key share one store failure.
    pub async fn resolve_rule(&self, key: ThresholdKey) -> Result<ThresholdRule, Arc<StoreError>> {
        let store = Arc::clone(&self.store);
        self.cache
            .get(key, |key| async move {
                if let Some(rule) = store.find_threshold_rule(&key).await? {
                    debug!(%key, "Found existing threshold rule");
                    return Ok(rule);
                }
                info!(%key, "No threshold rule yet, creating an unbounded one");
                store
                    .create_threshold_rule(NewThresholdRule::unbounded(&key, DEFAULT_WARNING_MESSAGE))
                    .await
            })
            .await
    }

    /// Checks every field of a reading and returns all violations. Fields whose
    /// rule cannot be resolved or whose value is not numeric are skipped.
    pub async fn evaluate(&self, owner: &str, data: &Map<String, Value>) -> Vec<Violation> {
        let rules = futures::future::join_all(
            data.keys()
                .map(|sensor_key| self.resolve_rule(ThresholdKey::new(owner, sensor_key.as_str()))),
        )
        .await;

        let mut violations = Vec::new();
        for ((sensor_key, raw), rule) in data.iter().zip(rules) {
            let rule = match rule {
                Ok(rule) => rule,
                Err(e) => {
                    error!(owner, sensor_key = %sensor_key, error = %e, "Could not resolve threshold rule, skipping field");
                    continue;
                }
            };
            let Some(value) = to_number(raw) else {
                warn!(owner, sensor_key = %sensor_key, value = %raw, "Non-numeric sensor value, skipping field");
                continue;
            };
            violations.extend(check_value(&rule, value));
        }
        violations
    }

    /// Evaluates a reading and, when anything is violated, dispatches one
    /// alert for `device_id` on a background task. The caller does not wait
    /// for delivery.
    pub async fn evaluate_and_notify(
        &self,
        device_id: &str,
        owner: &str,
        data: &Map<String, Value>,
    ) -> EvaluationReport {
        let violations = self.evaluate(owner, data).await;
        if violations.is_empty() {
            return EvaluationReport {
                violations,
                alert_dispatched: false,
            };
        }

        let notifications = self.notifications.clone();
        let device_id = device_id.to_string();
        let batch = violations.clone();
        {
            let mut alerts = self.alerts.lock();
            // reap finished deliveries
            while alerts.try_join_next().is_some() {}
            alerts.spawn(async move { notifications.notify(&device_id, &batch).await });
        }
        EvaluationReport {
            violations,
            alert_dispatched: true,
        }
    }

    /// Waits for every alert delivery started so far. Returns how many finished.
    pub async fn drain_alerts(&self) -> usize {
        let mut pending = std::mem::take(&mut *self.alerts.lock());
        if pending.is_empty() {
            return 0;
        }
        info!(pending = pending.len(), "Waiting for outstanding alert deliveries");
        let mut finished = 0;
        while let Some(result) = pending.join_next().await {
            match result {
                Ok(_) => finished += 1,
                Err(e) => error!(error = %e, "Alert delivery task failed"),
            }
        }
        finished
    }
}

/// Numeric view of a raw telemetry value. Accepts JSON numbers and strings
/// holding a finite number.
pub fn to_number(raw: &Value) -> Option<f64> {
    match raw {
        Value::Number(number) => number.as_f64().filter(|value| value.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|value| value.is_finite()),
        _ => None,
    }
}

/// Compares one value against a rule. Values equal to a bound do not violate.
pub fn check_value(rule: &ThresholdRule, value: f64) -> Vec<Violation> {
    let mut violations = Vec::new();

    if let Some(min) = rule.min_value {
        if value < min {
            let message = describe(rule, value, "below min", min);
            warn!("{}", message);
            violations.push(Violation {
                sensor_key: rule.sensor_key.clone(),
                value,
                message,
            });
        }
    }

    if let Some(max) = rule.max_value {
        if value > max {
            let message = describe(rule, value, "above max", max);
            warn!("{}", message);
            violations.push(Violation {
                sensor_key: rule.sensor_key.clone(),
                value,
                message,
            });
        }
    }

    violations
}

fn describe(rule: &ThresholdRule, value: f64, kind: &str, bound: f64) -> String {
    let default = format!(
        "Value {value} for '{}' is {kind} threshold {bound}",
        rule.sensor_key
    );
    let template = rule
        .warning_message
        .as_deref()
        .map(str::trim)
        .filter(|template| !template.is_empty());

    match template {
        None => default,
        Some(template) if PLACEHOLDERS.iter().any(|p| template.contains(p)) => {
            render(template, rule, value)
        }
        Some(prefix) => format!("{prefix}: {default}"),
    }
}

fn render(template: &str, rule: &ThresholdRule, value: f64) -> String {
    let bound = |bound: Option<f64>| bound.map_or_else(|| "-".to_string(), |b| b.to_string());
    template
        .replace("{value}", &value.to_string())
        .replace("{min}", &bound(rule.min_value))
        .replace("{max}", &bound(rule.max_value))
        .replace("{sensor}", &rule.sensor_key)
}
