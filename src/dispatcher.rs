//! Routes inbound MQTT publishes to a handler chosen by the topic's last level.
use crate::error::ServiceError;
use crate::models::NewReading;
use crate::store::Store;
use crate::threshold_engine::ThresholdEngine;
use crate::topic;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageHandler {
    Telemetry,
    Status,
    Command,
}

impl MessageHandler {
    pub fn topic_type(&self) -> &'static str {
        match self {
            MessageHandler::Telemetry => "telemetry",
            MessageHandler::Status => "status",
            MessageHandler::Command => "command",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Failed,
    Unrouted,
}

#[derive(Debug, Deserialize)]
struct TelemetryPayload {
    timestamp: Option<String>,
    data: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct StatusPayload {
    status: Option<String>,
}

pub struct MessageDispatcher {
    handlers: HashMap<&'static str, MessageHandler>,
    store: Arc<dyn Store>,
    engine: Arc<ThresholdEngine>,
}

impl MessageDispatcher {
    pub fn new(store: Arc<dyn Store>, engine: Arc<ThresholdEngine>) -> Self {
        let handlers = [
            MessageHandler::Telemetry,
            MessageHandler::Status,
            MessageHandler::Command,
        ]
        .into_iter()
        .map(|handler| (handler.topic_type(), handler))
        .collect();

        Self {
            handlers,
            store,
            engine,
        }
    }

    pub fn handler_for(&self, topic: &str) -> Option<MessageHandler> {
        topic::topic_type(topic).and_then(|kind| self.handlers.get(kind).copied())
    }

    /// Handles one message. Failures are logged here and never propagate to
    /// the consumer loop.
    pub async fn dispatch(&self, topic: &str, payload: &[u8]) -> DispatchOutcome {
        let Some(handler) = self.handler_for(topic) else {
            warn!(topic, "No handler registered for topic, dropping message");
            return DispatchOutcome::Unrouted;
        };

        debug!(topic, ?handler, "Dispatching message");
        let result = match handler {
            MessageHandler::Telemetry => self.handle_telemetry(topic, payload).await,
            MessageHandler::Status => self.handle_status(topic, payload),
            MessageHandler::Command => self.handle_command(topic, payload),
        };

        match result {
            Ok(()) => DispatchOutcome::Handled,
            Err(e) => {
                error!(topic, ?handler, error = %e, "Message handling failed");
                DispatchOutcome::Failed
            }
        }
    }

    async fn handle_telemetry(&self, topic: &str, payload: &[u8]) -> Result<(), ServiceError> {
        let client_id = topic::client_id_from_topic(topic)
            .ok_or_else(|| ServiceError::Validation(format!("no client id in topic '{topic}'")))?;

        let payload: TelemetryPayload = serde_json::from_slice(payload)
            .map_err(|e| ServiceError::Validation(format!("malformed telemetry payload: {e}")))?;
        let recorded_at = parse_timestamp(payload.timestamp.as_deref())?;
        let data = payload
            .data
            .filter(|data| !data.is_empty())
            .ok_or_else(|| ServiceError::Validation("telemetry has no data".to_string()))?;

        let device = self
            .store
            .find_identity_by_client_id(client_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("device '{client_id}'")))?;

        let reading = self
            .store
            .persist_reading(NewReading {
                identity_id: device.id,
                recorded_at,
                data,
            })
            .await?;
        info!(client_id, reading_id = reading.id, "Telemetry reading stored");

        let report = self
            .engine
            .evaluate_and_notify(&device.client_id, &device.client_id, &reading.data)
            .await;
        if !report.violations.is_empty() {
            warn!(client_id, violations = report.violations.len(), "Telemetry violated thresholds");
        }
        Ok(())
    }

    fn handle_status(&self, topic: &str, payload: &[u8]) -> Result<(), ServiceError> {
        let client_id = topic::client_id_from_topic(topic).unwrap_or("?");
        let text = String::from_utf8_lossy(payload);
        let status = match serde_json::from_str::<StatusPayload>(&text) {
            Ok(StatusPayload { status: Some(status) }) => status,
            _ => text.trim().to_string(),
        };
        if status.is_empty() {
            return Err(ServiceError::Validation("empty status payload".to_string()));
        }
        info!(client_id, status = %status, "Device status update");
        Ok(())
    }

    fn handle_command(&self, topic: &str, payload: &[u8]) -> Result<(), ServiceError> {
        let client_id = topic::client_id_from_topic(topic).unwrap_or("?");
        debug!(client_id, command = %String::from_utf8_lossy(payload), "Observed command message");
        Ok(())
    }
}

/// Event time of a reading; ingestion time when absent.
fn parse_timestamp(timestamp: Option<&str>) -> Result<OffsetDateTime, ServiceError> {
    match timestamp.map(str::trim).filter(|ts| !ts.is_empty()) {
        None => Ok(OffsetDateTime::now_utc()),
        Some(ts) => OffsetDateTime::parse(ts, &Rfc3339)
            .map_err(|e| ServiceError::Validation(format!("invalid timestamp '{ts}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use crate::models::{NewIdentity, ThresholdKey, ThresholdUpdate};
    use crate::notification::{LogNotifier, NotificationDispatcher};
    use crate::threshold_cache::{ThresholdCache, DEFAULT_MAX_ENTRIES, DEFAULT_TTL};

    async fn setup() -> (Arc<MemoryStore>, MessageDispatcher) {
        let store = Arc::new(MemoryStore::new());
        store
            .create_identity(NewIdentity {
                mqtt_id: "dev-1".into(),
                secret_hash: "x$y".into(),
                client_id: "ABC123".into(),
                device_name: Some("greenhouse".into()),
                permissions: vec![],
            })
            .await
            .unwrap();

        let engine = Arc::new(ThresholdEngine::new(
            store.clone(),
            Arc::new(ThresholdCache::new(DEFAULT_TTL, DEFAULT_MAX_ENTRIES)),
            NotificationDispatcher::new(Arc::new(LogNotifier), vec![]),
        ));
        (store.clone(), MessageDispatcher::new(store, engine))
    }

    #[test]
    fn timestamp_defaults_to_now() {
        let before = OffsetDateTime::now_utc();
        assert!(parse_timestamp(None).unwrap() >= before);
        assert!(parse_timestamp(Some("yesterday")).is_err());
        assert_eq!(
            parse_timestamp(Some("2024-05-01T12:00:00Z")).unwrap().year(),
            2024
        );
    }

    #[tokio::test]
    async fn unknown_topic_type_is_unrouted() {
        let (_, dispatcher) = setup().await;
        assert_eq!(
            dispatcher.dispatch("sensor/ABC123/firmware", b"{}").await,
            DispatchOutcome::Unrouted
        );
    }

    #[tokio::test]
    async fn telemetry_is_stored_and_creates_rules() {
        let (store, dispatcher) = setup().await;
        let outcome = dispatcher
            .dispatch(
                "sensor/ABC123/telemetry",
                br#"{"timestamp":"2024-05-01T12:00:00Z","data":{"temp":21.5,"label":"x"}}"#,
            )
            .await;
        assert_eq!(outcome, DispatchOutcome::Handled);

        let device = store.find_identity_by_client_id("ABC123").await.unwrap().unwrap();
        assert_eq!(store.readings_for(device.id).len(), 1);
        assert!(store
            .find_threshold_rule(&ThresholdKey::new("ABC123", "temp"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn bad_telemetry_is_dropped() {
        let (store, dispatcher) = setup().await;
        let payloads: [&[u8]; 3] = [
            b"not json",
            br#"{"data":{}}"#,
            br#"{"timestamp":"soon","data":{"temp":1}}"#,
        ];
        for payload in payloads {
            assert_eq!(
                dispatcher.dispatch("sensor/ABC123/telemetry", payload).await,
                DispatchOutcome::Failed
            );
        }
        assert_eq!(
            dispatcher
                .dispatch("sensor/NOPE/telemetry", br#"{"data":{"temp":1}}"#)
                .await,
            DispatchOutcome::Failed
        );

        let device = store.find_identity_by_client_id("ABC123").await.unwrap().unwrap();
        assert!(store.readings_for(device.id).is_empty());
    }

    #[tokio::test]
    async fn status_accepts_json_or_text() {
        let (_, dispatcher) = setup().await;
        assert_eq!(
            dispatcher
                .dispatch("sensor/ABC123/status", br#"{"status":"online"}"#)
                .await,
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch("sensor/ABC123/status", b"offline").await,
            DispatchOutcome::Handled
        );
        assert_eq!(
            dispatcher.dispatch("sensor/ABC123/status", b"  ").await,
            DispatchOutcome::Failed
        );
    }

    #[tokio::test]
    async fn bounds_set_later_apply_to_new_readings() {
        let (store, dispatcher) = setup().await;
        dispatcher
            .dispatch("sensor/ABC123/telemetry", br#"{"data":{"temp":5}}"#)
            .await;
        let key = ThresholdKey::new("ABC123", "temp");
        let rule = store
            .update_threshold_rule(
                &key,
                ThresholdUpdate {
                    min_value: Some(10.0),
                    max_value: Some(30.0),
                    warning_message: None,
                },
            )
            .await
            .unwrap();
        dispatcher.engine.cache().insert(key, rule);

        let mut data = Map::new();
        data.insert("temp".into(), Value::from(5));
        let violations = dispatcher.engine.evaluate("ABC123", &data).await;
        assert_eq!(violations.len(), 1);
    }
}
