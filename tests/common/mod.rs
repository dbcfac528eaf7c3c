#![allow(dead_code)]

use async_trait::async_trait;
use sensor_guard::error::StoreResult;
use sensor_guard::memory_store::MemoryStore;
use sensor_guard::models::{
    Identity, NewIdentity, NewReading, NewThresholdRule, Reading, ThresholdKey, ThresholdRule,
    ThresholdUpdate,
};
use sensor_guard::notification::{Alert, Notifier, NotifyError};
use sensor_guard::provisioning::default_permissions;
use sensor_guard::secret::{hash_secret, MIN_HASH_COST};
use sensor_guard::store::Store;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn seed_device(store: &dyn Store, mqtt_id: &str, client_id: &str, secret: &str) -> Identity {
    store
        .create_identity(NewIdentity {
            mqtt_id: mqtt_id.to_string(),
            secret_hash: hash_secret(secret, MIN_HASH_COST).expect("hash secret"),
            client_id: client_id.to_string(),
            device_name: Some(format!("{mqtt_id} device")),
            permissions: default_permissions(client_id),
        })
        .await
        .expect("seed device")
}

/// Forwards every alert to a channel.
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Alert>,
}

impl ChannelNotifier {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Alert>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, alert: &Alert) -> Result<(), NotifyError> {
        let _ = self.tx.send(alert.clone());
        Ok(())
    }
}

/// Wraps a `MemoryStore`, counting threshold lookups and creations. Threshold
/// lookups are slowed down so that concurrent callers overlap.
pub struct CountingStore {
    inner: MemoryStore,
    delay: Duration,
    pub threshold_finds: AtomicUsize,
    pub threshold_creates: AtomicUsize,
}

impl CountingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
            threshold_finds: AtomicUsize::new(0),
            threshold_creates: AtomicUsize::new(0),
        }
    }

    pub fn creates(&self) -> usize {
        self.threshold_creates.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> usize {
        self.threshold_finds.load(Ordering::SeqCst)
    }

    pub fn readings_for(&self, identity_id: i64) -> Vec<Reading> {
        self.inner.readings_for(identity_id)
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn find_identity_by_external_id(&self, mqtt_id: &str) -> StoreResult<Option<Identity>> {
        self.inner.find_identity_by_external_id(mqtt_id).await
    }

    async fn find_identity_by_client_id(&self, client_id: &str) -> StoreResult<Option<Identity>> {
        self.inner.find_identity_by_client_id(client_id).await
    }

    async fn exists_by_external_id(&self, mqtt_id: &str) -> StoreResult<bool> {
        self.inner.exists_by_external_id(mqtt_id).await
    }

    async fn exists_by_client_id(&self, client_id: &str) -> StoreResult<bool> {
        self.inner.exists_by_client_id(client_id).await
    }

    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity> {
        self.inner.create_identity(identity).await
    }

    async fn find_threshold_rule(&self, key: &ThresholdKey) -> StoreResult<Option<ThresholdRule>> {
        self.threshold_finds.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.find_threshold_rule(key).await
    }

    async fn create_threshold_rule(&self, rule: NewThresholdRule) -> StoreResult<ThresholdRule> {
        self.threshold_creates.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.inner.create_threshold_rule(rule).await
    }

    async fn update_threshold_rule(
        &self,
        key: &ThresholdKey,
        update: ThresholdUpdate,
    ) -> StoreResult<ThresholdRule> {
        self.inner.update_threshold_rule(key, update).await
    }

    async fn list_threshold_rules(&self, owner: &str) -> StoreResult<Vec<ThresholdRule>> {
        self.inner.list_threshold_rules(owner).await
    }

    async fn persist_reading(&self, reading: NewReading) -> StoreResult<Reading> {
        self.inner.persist_reading(reading).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.inner.health_check().await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}
