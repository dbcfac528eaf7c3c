//! In-memory store for tests and ephemeral runs. Not durable.
use crate::error::{StoreError, StoreResult};
use crate::models::{
    Identity, NewIdentity, NewReading, NewThresholdRule, Reading, ThresholdKey, ThresholdRule,
    ThresholdUpdate,
};
use crate::store::Store;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Default)]
struct Inner {
    identities: Vec<Identity>,
    thresholds: HashMap<ThresholdKey, ThresholdRule>,
    readings: Vec<Reading>,
    next_id: i64,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readings stored for an identity, oldest first.
    pub fn readings_for(&self, identity_id: i64) -> Vec<Reading> {
        self.inner
            .read()
            .readings
            .iter()
            .filter(|reading| reading.identity_id == identity_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_identity_by_external_id(&self, mqtt_id: &str) -> StoreResult<Option<Identity>> {
        Ok(self
            .inner
            .read()
            .identities
            .iter()
            .find(|identity| identity.mqtt_id == mqtt_id)
            .cloned())
    }

    async fn find_identity_by_client_id(&self, client_id: &str) -> StoreResult<Option<Identity>> {
        Ok(self
            .inner
            .read()
            .identities
            .iter()
            .find(|identity| identity.client_id == client_id)
            .cloned())
    }

    async fn exists_by_external_id(&self, mqtt_id: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .read()
            .identities
            .iter()
            .any(|identity| identity.mqtt_id == mqtt_id))
    }

    async fn exists_by_client_id(&self, client_id: &str) -> StoreResult<bool> {
        Ok(self
            .inner
            .read()
            .identities
            .iter()
            .any(|identity| identity.client_id == client_id))
    }

    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity> {
        let mut inner = self.inner.write();
        if inner
            .identities
            .iter()
            .any(|known| known.mqtt_id == identity.mqtt_id || known.client_id == identity.client_id)
        {
            return Err(StoreError::Conflict(format!(
                "identity '{}' or client id '{}' already exists",
                identity.mqtt_id, identity.client_id
            )));
        }
        let created = Identity {
            id: inner.next_id(),
            mqtt_id: identity.mqtt_id,
            secret_hash: identity.secret_hash,
            client_id: identity.client_id,
            device_name: identity.device_name,
            permissions: identity.permissions,
        };
        inner.identities.push(created.clone());
        Ok(created)
    }

    async fn find_threshold_rule(&self, key: &ThresholdKey) -> StoreResult<Option<ThresholdRule>> {
        Ok(self.inner.read().thresholds.get(key).cloned())
    }

    async fn create_threshold_rule(&self, rule: NewThresholdRule) -> StoreResult<ThresholdRule> {
        let mut inner = self.inner.write();
        let key = ThresholdKey::new(rule.owner.clone(), rule.sensor_key.clone());
        if let Some(existing) = inner.thresholds.get(&key) {
            return Ok(existing.clone());
        }
        let created = ThresholdRule {
            id: inner.next_id(),
            owner: rule.owner,
            sensor_key: rule.sensor_key,
            min_value: rule.min_value,
            max_value: rule.max_value,
            warning_message: rule.warning_message,
        };
        inner.thresholds.insert(key, created.clone());
        Ok(created)
    }

    async fn update_threshold_rule(
        &self,
        key: &ThresholdKey,
        update: ThresholdUpdate,
    ) -> StoreResult<ThresholdRule> {
        let mut inner = self.inner.write();
        let rule = inner
            .thresholds
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(format!("threshold rule {key}")))?;
        rule.min_value = update.min_value;
        rule.max_value = update.max_value;
        if update.warning_message.is_some() {
            rule.warning_message = update.warning_message;
        }
        Ok(rule.clone())
    }

    async fn list_threshold_rules(&self, owner: &str) -> StoreResult<Vec<ThresholdRule>> {
        let mut rules: Vec<ThresholdRule> = self
            .inner
            .read()
            .thresholds
            .values()
            .filter(|rule| rule.owner == owner)
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.sensor_key.cmp(&b.sensor_key));
        Ok(rules)
    }

    async fn persist_reading(&self, reading: NewReading) -> StoreResult<Reading> {
        let mut inner = self.inner.write();
        let stored = Reading {
            id: inner.next_id(),
            identity_id: reading.identity_id,
            recorded_at: reading.recorded_at,
            received_at: OffsetDateTime::now_utc(),
            data: reading.data,
        };
        inner.readings.push(stored.clone());
        Ok(stored)
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_threshold_returns_existing_rule() {
        let store = MemoryStore::new();
        let key = ThresholdKey::new("C1", "temp");
        let first = store
            .create_threshold_rule(NewThresholdRule::unbounded(&key, "Warning"))
            .await
            .unwrap();
        let again = store
            .create_threshold_rule(NewThresholdRule::unbounded(&key, "Other"))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(store.list_threshold_rules("C1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_keeps_message_when_absent() {
        let store = MemoryStore::new();
        let key = ThresholdKey::new("C1", "temp");
        store
            .create_threshold_rule(NewThresholdRule::unbounded(&key, "Warning"))
            .await
            .unwrap();
        let rule = store
            .update_threshold_rule(
                &key,
                ThresholdUpdate {
                    min_value: Some(1.0),
                    max_value: None,
                    warning_message: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(rule.min_value, Some(1.0));
        assert_eq!(rule.warning_message.as_deref(), Some("Warning"));
    }
}
