//! MQTT publishing: broker settings from the configuration document, topic
//! naming, and the connection upkeep shared by every transport.
//!
//! Topics are `<class>/<name>/<topic>`. Publishing while the broker is
//! unreachable drops the message and reports [`code::FAILURE`] on the
//! publisher's own progress reporter.

use std::time::{Duration, Instant};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::ConfigDocument;
use crate::progress::{code, ProgressReporter};

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TOPIC_PREFIX: &str = "IoT";
/// Minimum spacing between reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttSettings {
    /// Broker host name or address; empty disables MQTT.
    pub server: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub topic_prefix: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: DEFAULT_PORT,
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
        }
    }
}

impl MqttSettings {
    /// Reads the `mqtt.*` keys. The client id falls back to `hostname`.
    pub fn from_document(doc: &ConfigDocument) -> Self {
        let port = u16::try_from(doc.get_i64("mqtt.port", i64::from(DEFAULT_PORT)))
            .ok()
            .filter(|&port| port != 0)
            .unwrap_or(DEFAULT_PORT);
        let class = doc.get_str("mqtt.class", "");
        let name = doc.get_str("mqtt.name", "");

        Self {
            server: doc.get_str("mqtt.server", "").to_string(),
            port,
            client_id: doc
                .get_str("mqtt.client_id", doc.get_str("hostname", "iot-device"))
                .to_string(),
            username: doc.get_str("mqtt.user", "").to_string(),
            password: doc.get_str("mqtt.password", "").to_string(),
            topic_prefix: topic_prefix(class, name),
        }
    }

    pub fn is_enabled(&self) -> bool {
        !self.server.is_empty()
    }

    pub fn broker_url(&self) -> String {
        format!("mqtt://{}:{}", self.server, self.port)
    }

    /// Full topic for `topic` below this device's prefix.
    pub fn topic(&self, topic: &str) -> String {
        format!("{}/{}", self.topic_prefix, topic.trim_start_matches('/'))
    }
}

/// `<class>/<name>`, or the default prefix when both are empty.
pub fn topic_prefix(class: &str, name: &str) -> String {
    match (class.trim_matches('/'), name.trim_matches('/')) {
        ("", "") => DEFAULT_TOPIC_PREFIX.to_string(),
        (class, "") => class.to_string(),
        ("", name) => name.to_string(),
        (class, name) => format!("{class}/{name}"),
    }
}

/// A broker connection as seen by [`MqttPublisher`].
pub trait MqttTransport {
    fn is_connected(&self) -> bool;

    fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Start a fresh connection attempt.
    fn reconnect(&mut self, settings: &MqttSettings) -> Result<()>;
}

pub struct MqttPublisher<T> {
    settings: MqttSettings,
    transport: T,
    progress: ProgressReporter,
    last_attempt: Option<Instant>,
}

impl<T: MqttTransport> MqttPublisher<T> {
    pub fn new(settings: MqttSettings, transport: T) -> Self {
        Self {
            settings,
            transport,
            progress: ProgressReporter::new(),
            last_attempt: None,
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn progress_mut(&mut self) -> &mut ProgressReporter {
        &mut self.progress
    }

    /// Publish `value` under the device prefix. Returns `false` when the
    /// broker is not connected or the client refused the message.
    pub fn publish(&mut self, topic: &str, value: &str) -> bool {
        if !self.transport.is_connected() {
            log::debug!("MQTT not connected, dropping {}", topic);
            self.progress.report_all(&[code::FAILURE]);
            return false;
        }
        let topic = self.settings.topic(topic);
        match self.transport.publish(&topic, value.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("MQTT publish to {} failed: {:#}", topic, e);
                self.progress.report_all(&[code::FAILURE]);
                false
            }
        }
    }

    /// Called periodically; starts a reconnect when the link is down and the
    /// last attempt is older than [`RECONNECT_INTERVAL`].
    pub fn maintain(&mut self, now: Instant) {
        if self.transport.is_connected() {
            return;
        }
        if self
            .last_attempt
            .is_some_and(|at| now.saturating_duration_since(at) < RECONNECT_INTERVAL)
        {
            return;
        }
        self.last_attempt = Some(now);
        log::info!("Connecting to MQTT broker {}", self.settings.broker_url());
        if let Err(e) = self.transport.reconnect(&self.settings) {
            log::warn!("MQTT reconnect failed: {:#}", e);
            self.progress.report_all(&[code::CONNECTIVITY_LOST]);
        }
    }
}
