use anyhow::{Context, Result};
use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use ota_core::{MqttPublisher, MqttSettings, MqttTransport};

/// ESP-IDF MQTT client; connection state is tracked from its event callback.
#[derive(Default)]
pub struct EspMqttTransport {
    client: Option<EspMqttClient<'static>>,
    connected: Arc<AtomicBool>,
}

impl EspMqttTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MqttTransport for EspMqttTransport {
    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::Relaxed)
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()> {
        let client = self.client.as_mut().context("MQTT client not started")?;
        client.publish(topic, QoS::AtMostOnce, false, payload)?;
        Ok(())
    }

    fn reconnect(&mut self, settings: &MqttSettings) -> Result<()> {
        // Tear down first so only one client holds the socket
        self.client = None;
        self.connected.store(false, Ordering::Relaxed);

        let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());
        let client_id = optional(&settings.client_id);
        let username = optional(&settings.username);
        let password = optional(&settings.password);
        let conf = MqttClientConfiguration {
            client_id: client_id.as_deref(),
            username: username.as_deref(),
            password: password.as_deref(),
            ..Default::default()
        };

        let connected = Arc::clone(&self.connected);
        let client = EspMqttClient::new_cb(&settings.broker_url(), &conf, move |event| match event.payload() {
            EventPayload::Connected(_) => {
                log::info!("MQTT connected");
                connected.store(true, Ordering::Relaxed);
            }
            EventPayload::Disconnected => {
                log::warn!("MQTT disconnected");
                connected.store(false, Ordering::Relaxed);
            }
            EventPayload::Error(e) => log::warn!("MQTT error: {:?}", e),
            _ => {}
        })
        .with_context(|| format!("Failed to start MQTT client for {}", settings.broker_url()))?;

        self.client = Some(client);
        Ok(())
    }
}

type SharedMqtt = Arc<Mutex<MqttPublisher<EspMqttTransport>>>;

#[derive(Clone)]
pub struct MqttManager {
    publisher: SharedMqtt,
}

impl MqttManager {
    /// `None` when no broker is configured.
    pub fn new(settings: MqttSettings) -> Option<Self> {
        if !settings.is_enabled() {
            log::info!("MQTT disabled: no mqtt.server configured");
            return None;
        }
        log::info!("MQTT broker {}, topic prefix {}", settings.broker_url(), settings.topic_prefix);
        let mut publisher = MqttPublisher::new(settings, EspMqttTransport::new());
        publisher.progress_mut().subscribe(|step| log::debug!("MQTT step {}", step));
        Some(Self {
            publisher: Arc::new(Mutex::new(publisher)),
        })
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.publisher).transport().is_connected()
    }

    pub fn publish(&self, topic: &str, value: &str) -> bool {
        lock(&self.publisher).publish(topic, value)
    }

    /// Called from the main loop.
    pub fn maintain(&self) {
        lock(&self.publisher).maintain(Instant::now());
    }
}

fn lock(publisher: &SharedMqtt) -> MutexGuard<'_, MqttPublisher<EspMqttTransport>> {
    publisher.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
