mod common;

use common::seed_device;
use sensor_guard::access_control::AccessControl;
use sensor_guard::config::AdminAccount;
use sensor_guard::db::DatabaseService;
use sensor_guard::memory_store::MemoryStore;
use sensor_guard::models::{MqttAction, NewIdentity, PermissionRule, QosSet};
use sensor_guard::provisioning::{ensure_admin_account, provision_device, ProvisionRequest};
use sensor_guard::secret::{hash_secret, MIN_HASH_COST};
use sensor_guard::store::Store;
use std::sync::Arc;

fn sqlite_store(dir: &tempfile::TempDir) -> Arc<DatabaseService> {
    let path = dir.path().join("access.db");
    let db = DatabaseService::new(path.to_str().unwrap()).unwrap();
    db.initialize_db().unwrap();
    Arc::new(db)
}

#[tokio::test]
async fn unknown_identity_is_always_denied() {
    let store = Arc::new(MemoryStore::new());
    seed_device(store.as_ref(), "known", "ABC123", "pw").await;
    let access = AccessControl::new(store);

    let topics = ["sensor/ABC123/telemetry", "sensor/ABC123/command", "#", "a/b"];
    for topic in topics {
        for action in [MqttAction::Publish, MqttAction::Subscribe] {
            for qos in 0..=3 {
                assert!(
                    !access.authorize("ghost", None, topic, action, qos).await,
                    "{topic} {action} {qos}"
                );
                assert!(!access.authorize("ghost", Some("ABC123"), topic, action, qos).await);
            }
        }
    }
    assert!(!access.authenticate("ghost", "pw", None).await);
}

#[tokio::test]
async fn provisioned_device_authenticates_and_is_scoped() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    let device = provision_device(
        store.as_ref(),
        ProvisionRequest {
            device_name: "greenhouse".into(),
            mqtt_username: "gh-1".into(),
        },
        MIN_HASH_COST,
    )
    .await
    .unwrap();
    let access = AccessControl::new(store);
    let client_id = device.client_id.as_str();

    assert!(access.authenticate("gh-1", &device.mqtt_password, Some(client_id)).await);
    assert!(access.authenticate("gh-1", &device.mqtt_password, None).await);
    assert!(access.authenticate("gh-1", &device.mqtt_password, Some("")).await);
    assert!(!access.authenticate("gh-1", "wrong", Some(client_id)).await);
    assert!(!access.authenticate("gh-1", &device.mqtt_password, Some("OTHER")).await);
    assert!(!access.authenticate("", &device.mqtt_password, None).await);

    let telemetry = format!("sensor/{client_id}/telemetry");
    let command = format!("sensor/{client_id}/command");
    assert!(access.authorize("gh-1", Some(client_id), &telemetry, MqttAction::Publish, 1).await);
    assert!(!access.authorize("gh-1", Some(client_id), &telemetry, MqttAction::Subscribe, 0).await);
    assert!(access.authorize("gh-1", Some(client_id), &command, MqttAction::Subscribe, 2).await);
    assert!(!access.authorize("gh-1", Some(client_id), &command, MqttAction::Publish, 0).await);
    assert!(!access.authorize("gh-1", Some(client_id), "sensor/OTHER/telemetry", MqttAction::Publish, 0).await);
    assert!(!access.authorize("gh-1", Some("OTHER"), &telemetry, MqttAction::Publish, 0).await);
    assert!(!access.authorize("gh-1", Some(client_id), &telemetry, MqttAction::Publish, 3).await);
}

#[tokio::test]
async fn admin_account_reaches_every_topic() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    let admin = AdminAccount {
        mqtt_id: "admin".into(),
        password: "s3cret".into(),
        client_id: "ADMIN_CLIENT".into(),
    };
    assert!(ensure_admin_account(store.as_ref(), &admin, MIN_HASH_COST).await.unwrap());
    let access = AccessControl::new(store);

    assert!(access.authenticate("admin", "s3cret", Some("ADMIN_CLIENT")).await);
    for topic in ["sensor/ABC123/command", "anything/else", "x"] {
        assert!(access.authorize("admin", None, topic, MqttAction::Publish, 0).await);
        assert!(access.authorize("admin", None, topic, MqttAction::Subscribe, 2).await);
    }
}

#[tokio::test]
async fn stored_priorities_and_qos_are_honoured() {
    let dir = tempfile::tempdir().unwrap();
    let store = sqlite_store(&dir);
    store
        .create_identity(NewIdentity {
            mqtt_id: "ops".into(),
            secret_hash: hash_secret("pw", MIN_HASH_COST).unwrap(),
            client_id: "OPS00001".into(),
            device_name: None,
            permissions: vec![
                PermissionRule::allow("sensor/#", MqttAction::Any),
                PermissionRule::deny("sensor/+/command", MqttAction::Publish).with_priority(5),
                PermissionRule::allow("alerts/+", MqttAction::Subscribe)
                    .with_qos(QosSet::new(&[0]).unwrap()),
            ],
        })
        .await
        .unwrap();
    let access = AccessControl::new(store);

    assert!(access.authorize("ops", None, "sensor/A/telemetry", MqttAction::Publish, 1).await);
    assert!(access.authorize("ops", None, "sensor/A/command", MqttAction::Subscribe, 1).await);
    assert!(!access.authorize("ops", None, "sensor/A/command", MqttAction::Publish, 1).await);
    assert!(access.authorize("ops", None, "alerts/high", MqttAction::Subscribe, 0).await);
    assert!(!access.authorize("ops", None, "alerts/high", MqttAction::Subscribe, 1).await);
}
