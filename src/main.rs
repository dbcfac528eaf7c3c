use sensor_guard::access_control::AccessControl;
use sensor_guard::config::Config;
use sensor_guard::dispatcher::MessageDispatcher;
use sensor_guard::mqtt_service::MqttService;
use sensor_guard::notification::NotificationDispatcher;
use sensor_guard::provisioning::ensure_admin_account;
use sensor_guard::rest_server::{run_rest_server, AppState};
use sensor_guard::service_utils::{
    build_notifier, handle_shutdown, init_tracing, open_store, start_mqtt_service,
};
use sensor_guard::threshold_cache::ThresholdCache;
use sensor_guard::threshold_engine::ThresholdEngine;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    let store = match open_store(&config) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open {:?} store: {}", config.store_backend, e);
            return;
        }
    };

    if let Some(admin) = &config.admin {
        if let Err(e) = ensure_admin_account(store.as_ref(), admin, config.secret_hash_cost).await {
            error!("Admin account bootstrap failed: {}", e);
            return;
        }
    }

    let notifier = match build_notifier(&config) {
        Ok(notifier) => notifier,
        Err(e) => {
            error!("Failed to set up alert delivery: {}", e);
            return;
        }
    };

    let cache = Arc::new(ThresholdCache::new(
        config.threshold_cache_ttl,
        config.threshold_cache_max_entries,
    ));
    let engine = Arc::new(ThresholdEngine::new(
        store.clone(),
        cache,
        NotificationDispatcher::new(notifier, config.alert_recipients.clone()),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mqtt_service = if config.mqtt.enabled {
        let dispatcher = Arc::new(MessageDispatcher::new(store.clone(), engine.clone()));
        Some(MqttService::new(config.mqtt.clone(), dispatcher))
    } else {
        info!("MQTT disabled; only the HTTP hooks and API are served.");
        None
    };
    let mqtt_task = mqtt_service
        .clone()
        .map(|service| start_mqtt_service(service, shutdown_rx.clone()));

    let state = AppState {
        store: store.clone(),
        access: Arc::new(AccessControl::new(store)),
        engine: engine.clone(),
        mqtt: mqtt_service,
        auth_ignore_anonymous: config.auth_ignore_anonymous,
        secret_hash_cost: config.secret_hash_cost,
    };
    let bind = config.http_bind;
    let rest_shutdown = shutdown_rx.clone();
    let mut rest_api_task =
        tokio::spawn(async move { run_rest_server(state, bind, rest_shutdown).await });

    // a REST exit before Ctrl-C ends the process
    let rest_result = match handle_shutdown(shutdown_tx, &mut rest_api_task).await {
        Some(result) => result,
        None => rest_api_task.await,
    };

    if let Some(task) = mqtt_task {
        if let Err(e) = task.await {
            error!("MQTT service task failed: {}", e);
        }
    }
    let drained = engine.drain_alerts().await;
    if drained > 0 {
        info!("Finished {} pending alert(s) before exit.", drained);
    }

    match rest_result {
        Ok(Ok(())) => info!("All services shut down successfully."),
        Ok(Err(e)) => error!("REST server failed: {}", e),
        Err(e) => error!("REST server task failed: {}", e),
    }
}
