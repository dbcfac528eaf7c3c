//! Backing store abstraction.
//!
//! The core only ever reads identities and permission rules. Threshold rules
//! are created lazily and must stay unique per (owner, sensor key); a second
//! `create_threshold_rule` for the same key returns the existing row.
use crate::error::StoreResult;
use crate::models::{
    Identity, NewIdentity, NewReading, NewThresholdRule, Reading, ThresholdKey, ThresholdRule,
    ThresholdUpdate,
};
use async_trait::async_trait;

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_identity_by_external_id(&self, mqtt_id: &str) -> StoreResult<Option<Identity>>;
    async fn find_identity_by_client_id(&self, client_id: &str) -> StoreResult<Option<Identity>>;
    async fn exists_by_external_id(&self, mqtt_id: &str) -> StoreResult<bool>;
    async fn exists_by_client_id(&self, client_id: &str) -> StoreResult<bool>;
    /// Fails with `StoreError::Conflict` when the external id or client id is taken.
    async fn create_identity(&self, identity: NewIdentity) -> StoreResult<Identity>;

    async fn find_threshold_rule(&self, key: &ThresholdKey) -> StoreResult<Option<ThresholdRule>>;
    /// Idempotent on (owner, sensor key).
    async fn create_threshold_rule(&self, rule: NewThresholdRule) -> StoreResult<ThresholdRule>;
    /// Replaces both bounds; a `None` warning message keeps the current one.
    async fn update_threshold_rule(
        &self,
        key: &ThresholdKey,
        update: ThresholdUpdate,
    ) -> StoreResult<ThresholdRule>;
    async fn list_threshold_rules(&self, owner: &str) -> StoreResult<Vec<ThresholdRule>>;

    async fn persist_reading(&self, reading: NewReading) -> StoreResult<Reading>;

    async fn health_check(&self) -> StoreResult<()>;
    fn backend_name(&self) -> &'static str;
}
