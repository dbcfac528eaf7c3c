//! Device account creation and the optional admin bootstrap.
use crate::config::AdminAccount;
use crate::error::{ServiceError, StoreError};
use crate::models::{MqttAction, NewIdentity, PermissionRule};
use crate::secret::{generate_client_id, generate_secret, hash_secret};
use crate::store::Store;
use crate::topic;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

pub const DEVICE_SECRET_LENGTH: usize = 8;
pub const CLIENT_ID_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionRequest {
    pub device_name: String,
    pub mqtt_username: String,
}

/// Returned once at creation; the plaintext password is not retrievable later.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedDevice {
    pub device_name: String,
    pub mqtt_account: String,
    pub mqtt_password: String,
    pub client_id: String,
}

/// Publish on telemetry and status, subscribe on command, all QoS levels.
pub fn default_permissions(client_id: &str) -> Vec<PermissionRule> {
    vec![
        PermissionRule::allow(topic::telemetry_topic(client_id), MqttAction::Publish),
        PermissionRule::allow(topic::status_topic(client_id), MqttAction::Publish),
        PermissionRule::allow(topic::command_topic(client_id), MqttAction::Subscribe),
    ]
}

/// Creates a device account. `hash_cost` is the bcrypt work factor for its secret.
pub async fn provision_device(
    store: &dyn Store,
    request: ProvisionRequest,
    hash_cost: u32,
) -> Result<ProvisionedDevice, ServiceError> {
    provision_device_with(store, request, hash_cost, generate_client_id).await
}

/// Same as [`provision_device`] with a caller-supplied client id generator.
pub async fn provision_device_with<G>(
    store: &dyn Store,
    request: ProvisionRequest,
    hash_cost: u32,
    next_client_id: G,
) -> Result<ProvisionedDevice, ServiceError>
where
    G: FnMut() -> String,
{
    let device_name = request.device_name.trim().to_string();
    let mqtt_username = request.mqtt_username.trim().to_string();
    if device_name.is_empty() {
        return Err(ServiceError::Validation("device_name is required".to_string()));
    }
    if mqtt_username.is_empty() {
        return Err(ServiceError::Validation("mqtt_username is required".to_string()));
    }

    if store.exists_by_external_id(&mqtt_username).await? {
        return Err(ServiceError::Conflict(format!(
            "MQTT username already exists: {mqtt_username}"
        )));
    }

    let client_id = unique_client_id(store, next_client_id).await?;
    let permissions = default_permissions(&client_id);
    if let Some(bad) = permissions.iter().find(|rule| !topic::is_valid_pattern(&rule.topic_pattern)) {
        return Err(ServiceError::Validation(format!(
            "client id '{client_id}' yields invalid topic '{}'",
            bad.topic_pattern
        )));
    }

    let password = generate_secret(DEVICE_SECRET_LENGTH);
    let secret_hash = hash_off_runtime(password.clone(), hash_cost).await?;
    let identity = store
        .create_identity(NewIdentity {
            mqtt_id: mqtt_username.clone(),
            secret_hash,
            client_id: client_id.clone(),
            device_name: Some(device_name.clone()),
            permissions,
        })
        .await?;

    info!(device_name = %device_name, mqtt_id = %identity.mqtt_id, client_id = %identity.client_id, "Device provisioned");
    Ok(ProvisionedDevice {
        device_name,
        mqtt_account: identity.mqtt_id,
        mqtt_password: password,
        client_id: identity.client_id,
    })
}

/// bcrypt is CPU bound, so hashing runs on the blocking pool.
async fn hash_off_runtime(secret: String, cost: u32) -> Result<String, ServiceError> {
    let hashed = tokio::task::spawn_blocking(move || hash_secret(&secret, cost))
        .await
        .map_err(StoreError::from)??;
    Ok(hashed)
}

async fn unique_client_id<G>(store: &dyn Store, mut next_client_id: G) -> Result<String, ServiceError>
where
    G: FnMut() -> String,
{
    for attempt in 1..=CLIENT_ID_ATTEMPTS {
        let candidate = next_client_id();
        if !store.exists_by_client_id(&candidate).await? {
            return Ok(candidate);
        }
        warn!(attempt, client_id = %candidate, "Generated client id already taken");
    }
    error!("Unable to generate a unique client id after {} attempts", CLIENT_ID_ATTEMPTS);
    Err(ServiceError::Conflict(format!(
        "unable to generate a unique client id after {CLIENT_ID_ATTEMPTS} attempts"
    )))
}

/// Creates the admin account with publish and subscribe on `#` unless one
/// already exists. Returns whether it was created.
pub async fn ensure_admin_account(
    store: &dyn Store,
    admin: &AdminAccount,
    hash_cost: u32,
) -> Result<bool, ServiceError> {
    info!(mqtt_id = %admin.mqtt_id, "Checking for admin account");
    if store.exists_by_external_id(&admin.mqtt_id).await? {
        info!(mqtt_id = %admin.mqtt_id, "Admin account already exists, skipping creation");
        return Ok(false);
    }

    let secret_hash = hash_off_runtime(admin.password.clone(), hash_cost).await?;
    let created = store
        .create_identity(NewIdentity {
            mqtt_id: admin.mqtt_id.clone(),
            secret_hash,
            client_id: admin.client_id.clone(),
            device_name: None,
            permissions: vec![
                PermissionRule::allow("#", MqttAction::Publish),
                PermissionRule::allow("#", MqttAction::Subscribe),
            ],
        })
        .await;

    match created {
        Ok(_) => {
            info!(mqtt_id = %admin.mqtt_id, "Admin account created");
            Ok(true)
        }
        // another instance won the race
        Err(StoreError::Conflict(_)) => Ok(false),
        Err(e) => Err(e.into()),
    }
}
