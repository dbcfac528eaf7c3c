use crate::config::MqttSettings;
use crate::dispatcher::{DispatchOutcome, MessageDispatcher};
use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, ClientError, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const PUBLISH_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ClientState {
    fn as_str(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Error(_) => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("MQTT client is not connected")]
    NotConnected,
    #[error("MQTT publish failed: {0}")]
    Client(#[from] ClientError),
}

enum LoopExit {
    Shutdown,
    ConnectionLost,
}

pub struct MqttService {
    client_state: Mutex<ClientState>,
    client: Mutex<Option<AsyncClient>>,
    dispatcher: Arc<MessageDispatcher>,
    pub(crate) settings: MqttSettings,
}

impl MqttService {
    pub fn new(settings: MqttSettings, dispatcher: Arc<MessageDispatcher>) -> Arc<Self> {
        Arc::new(Self {
            client_state: Mutex::new(ClientState::Disconnected),
            client: Mutex::new(None),
            dispatcher,
            settings,
        })
    }

    pub async fn connection_state(&self) -> &'static str {
        self.client_state.lock().await.as_str()
    }

    async fn set_state(&self, state: ClientState) {
        if let ClientState::Error(reason) = &state {
            warn!("MQTT client entered error state: {}", reason);
        }
        *self.client_state.lock().await = state;
    }

    /// Connects, subscribes and consumes until `shutdown` flips to true or the
    /// retry budget is spent. Each inbound publish is dispatched on its own
    /// task; in-flight messages are drained before returning.
    pub async fn start(self: Arc<Self>, mqtt_client_id: &str, mut shutdown: watch::Receiver<bool>) {
        info!("Starting MQTT service...");

        let initial_retry_interval = Duration::from_millis(self.settings.retry_interval_ms);
        let max_retries = self.settings.max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;
        let mut in_flight = JoinSet::new();

        loop {
            if max_retries >= 0 && retries > max_retries {
                error!("Maximum number of retries ({}) reached. Stopping the service.", max_retries);
                break;
            }

            debug!(
                "Configuring MQTT broker at {}:{}...",
                self.settings.host, self.settings.port
            );

            let mut mqtt_options = MqttOptions::new(mqtt_client_id, &self.settings.host, self.settings.port);
            mqtt_options.set_keep_alive(Duration::from_secs(10));
            mqtt_options.set_clean_session(true);

            if !self.settings.username.is_empty() && !self.settings.password.is_empty() {
                mqtt_options.set_credentials(&self.settings.username, &self.settings.password);
            }

            let (client, eventloop) = AsyncClient::new(mqtt_options, 10);
            *self.client.lock().await = Some(client.clone());
            self.set_state(ClientState::Connecting).await;

            let subscribe_topic = self.settings.subscribe_topic.clone();
            if let Err(e) = client.subscribe(&subscribe_topic, QoS::AtLeastOnce).await {
                error!("Failed to subscribe to topic '{}': {}", subscribe_topic, e);
                self.set_state(ClientState::Error(e.to_string())).await;
                retries += 1;
                sleep(retry_interval).await;
                retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
                continue;
            }

            match self
                .clone()
                .consume(eventloop, &mut in_flight, &mut shutdown, &mut retry_interval, initial_retry_interval)
                .await
            {
                LoopExit::Shutdown => {
                    if let Err(e) = client.disconnect().await {
                        debug!("Disconnect request failed: {}", e);
                    }
                    break;
                }
                LoopExit::ConnectionLost => {}
            }

            warn!("Lost connection to MQTT broker. Retrying in {:?}...", retry_interval);
            retries += 1;
            tokio::select! {
                _ = sleep(retry_interval) => {}
                _ = shutdown.changed() => break,
            }
            retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
        }

        *self.client.lock().await = None;
        self.set_state(ClientState::Disconnected).await;

        if !in_flight.is_empty() {
            info!("Draining {} in-flight message(s)...", in_flight.len());
        }
        while let Some(result) = in_flight.join_next().await {
            if let Err(e) = result {
                error!("Message task failed: {}", e);
            }
        }
        info!("MQTT service stopped.");
    }

    async fn consume(
        self: Arc<Self>,
        mut eventloop: EventLoop,
        in_flight: &mut JoinSet<DispatchOutcome>,
        shutdown: &mut watch::Receiver<bool>,
        retry_interval: &mut Duration,
        initial_retry_interval: Duration,
    ) -> LoopExit {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Shutdown requested, stopping MQTT consumer.");
                    return LoopExit::Shutdown;
                }
                Some(finished) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = finished {
                        error!("Message task failed: {}", e);
                    }
                }
                polled = eventloop.poll() => match polled {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker.");
                        self.set_state(ClientState::Connected).await;
                        *retry_interval = initial_retry_interval;
                    }
                    Ok(Event::Incoming(Packet::SubAck(_))) => {
                        info!("Subscribed to topic '{}'.", self.settings.subscribe_topic);
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let service = Arc::clone(&self);
                        in_flight.spawn(async move { service.handle_publish(publish).await });
                    }
                    Ok(event) => {
                        debug!("Unhandled event: {:?}", event);
                    }
                    Err(e) => {
                        error!("Error in MQTT event loop: {:?}", e);
                        self.set_state(ClientState::Disconnected).await;
                        return LoopExit::ConnectionLost;
                    }
                }
            }
        }
    }

    async fn handle_publish(&self, publish: Publish) -> DispatchOutcome {
        let topic = publish.topic.clone();
        debug!("Incoming message on '{}' ({} bytes)", topic, publish.payload.len());
        self.dispatcher.dispatch(&topic, &publish.payload).await
    }

    pub async fn publish_message(
        &self,
        topic: &str,
        message: &str,
        qos: QoS,
        retain: bool,
    ) -> Result<(), PublishError> {
        let mut last_error = PublishError::NotConnected;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            let client = self.client.lock().await.clone();
            match client {
                Some(client) => match client.publish(topic, qos, retain, message.as_bytes().to_vec()).await {
                    Ok(()) => {
                        info!("Message published to '{}': {}", topic, message);
                        return Ok(());
                    }
                    Err(e) => {
                        error!("Failed to publish message to '{}' (attempt {}): {:?}", topic, attempt, e);
                        last_error = PublishError::Client(e);
                    }
                },
                None => {
                    error!("MQTT client is not connected. Retrying...");
                    last_error = PublishError::NotConnected;
                }
            }
            if attempt < PUBLISH_ATTEMPTS {
                sleep(PUBLISH_RETRY_DELAY).await;
            }
        }

        error!("Failed to publish message to topic '{}' after {} attempts", topic, PUBLISH_ATTEMPTS);
        Err(last_error)
    }
}
