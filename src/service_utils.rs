use crate::config::{Config, StoreBackend};
use crate::db::DatabaseService;
use crate::error::StoreResult;
use crate::memory_store::MemoryStore;
use crate::mqtt_service::MqttService;
use crate::notification::{LogNotifier, Notifier, NotifyError, WebhookNotifier};
use crate::store::Store;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Installs the fmt subscriber. `RUST_LOG` overrides the default `info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Opens the configured backend and prepares its schema.
pub fn open_store(config: &Config) -> StoreResult<Arc<dyn Store>> {
    match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using the in-memory store; nothing survives a restart.");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::Sqlite => {
            let db_service = DatabaseService::new(&config.database_path)?;
            db_service.initialize_db()?;
            info!("Database '{}' initialized successfully.", config.database_path);
            Ok(Arc::new(db_service))
        }
    }
}

/// Webhook delivery when a relay URL is configured, log output otherwise.
pub fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>, NotifyError> {
    match &config.alert_webhook_url {
        Some(url) => {
            info!("Violation alerts are posted to {}", url);
            Ok(Arc::new(WebhookNotifier::new(url.clone())?))
        }
        None => {
            info!("No ALERT_WEBHOOK_URL set; violation alerts are logged only.");
            Ok(Arc::new(LogNotifier))
        }
    }
}

/// Start the MQTT service under a fresh session id.
pub fn start_mqtt_service(
    mqtt_service: Arc<MqttService>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mqtt_client_id = format!("sensor_guard_{}", Uuid::new_v4());
    tokio::spawn(async move {
        mqtt_service.start(&mqtt_client_id, shutdown).await;
    })
}

/// Waits for Ctrl-C, or for `service_exit` to resolve first, then tells every
/// service to stop. Returns the output of `service_exit` when it ended the wait.
pub async fn handle_shutdown<F>(shutdown: watch::Sender<bool>, service_exit: F) -> Option<F::Output>
where
    F: Future,
{
    let early_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Termination signal received, shutting down..."),
                Err(e) => error!("Failed to handle termination signal: {:?}", e),
            }
            None
        }
        output = service_exit => {
            error!("A required service stopped unexpectedly, shutting down...");
            Some(output)
        }
    };
    if shutdown.send(true).is_err() {
        warn!("No service was listening for shutdown.");
    }
    early_exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
    }

    #[tokio::test]
    async fn opens_memory_backend() {
        let store = open_store(&config(&[("MQTT_ENABLED", "false"), ("STORE_BACKEND", "memory")])).unwrap();
        assert_eq!(store.backend_name(), "memory");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn opens_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard.db");
        let store = open_store(&config(&[
            ("MQTT_ENABLED", "false"),
            ("DATABASE_PATH", path.to_str().unwrap()),
        ]))
        .unwrap();
        assert_eq!(store.backend_name(), "sqlite");
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn stopped_service_triggers_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        let early_exit = handle_shutdown(tx, async { "listener failed" }).await;
        assert_eq!(early_exit, Some("listener failed"));
        assert!(*rx.borrow_and_update());
    }
}
