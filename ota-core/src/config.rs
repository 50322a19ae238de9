//! Device configuration: a free-form JSON document persisted in the file
//! store, and the typed settings the firmware reads out of it.
use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::MAX_DEPTH;
use crate::store::{FileSink, FileStore};

/// JSON object stored as `/<name>.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    name: String,
    root: Map<String, Value>,
}

impl ConfigDocument {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: Map::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> String {
        format!("/{}.json", self.name)
    }

    /// Where [`ConfigDocument::save`] stages the new contents.
    pub fn staging_path(&self) -> String {
        format!("/{}.json.tmp", self.name)
    }

    pub fn as_value(&self) -> Value {
        Value::Object(self.root.clone())
    }

    /// Read the document from `store`. A staged copy left behind by an
    /// interrupted save is used when the document itself is missing. On
    /// failure the current contents are kept.
    pub fn load<S: FileStore>(&mut self, store: &S) -> Result<()> {
        let path = self.path();
        let staged = self.staging_path();
        if !store.exists(&path) && store.exists(&staged) {
            log::warn!("{} missing, recovering {}", path, staged);
            return self.load_from(store, &staged);
        }
        self.load_from(store, &path)
    }

    fn load_from<S: FileStore>(&mut self, store: &S, path: &str) -> Result<()> {
        let (mut reader, size) = store
            .open(path)
            .with_context(|| format!("Failed to open {path}"))?;
        let mut raw = Vec::with_capacity(size as usize);
        reader
            .read_to_end(&mut raw)
            .with_context(|| format!("Failed to read {path}"))?;
        let value: Value = serde_json::from_slice(&raw).with_context(|| format!("Invalid JSON in {path}"))?;
        self.replace(value)
    }

    /// Persist the document. The body is written to the staging file first
    /// and only moved over `/<name>.json` once complete, so a failed save
    /// leaves the previous document in place. The store needs room for both
    /// copies while saving.
    pub fn save<S: FileStore>(&self, store: &mut S) -> Result<()> {
        let path = self.path();
        let staged = self.staging_path();
        let body = serde_json::to_vec(&self.root)?;

        if let Err(e) = write_all(store, &staged, &body) {
            if store.exists(&staged) && !store.remove(&staged) {
                log::warn!("Could not remove {}", staged);
            }
            return Err(e);
        }
        if !store.rename(&staged, &path) {
            store.remove(&staged);
            return Err(anyhow!("Failed to replace {path}"));
        }
        log::info!("Configuration saved to {} ({} bytes)", path, body.len());
        Ok(())
    }

    pub fn reset(&mut self) {
        self.root.clear();
    }

    /// Replace the whole document. Only JSON objects are accepted.
    pub fn replace(&mut self, value: Value) -> Result<()> {
        match value {
            Value::Object(map) => {
                self.root = map;
                Ok(())
            }
            other => Err(anyhow!("configuration must be a JSON object, got {}", type_name(&other))),
        }
    }

    /// Value at a dotted path such as `wifi.ssid`.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.root.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn get_str<'a>(&'a self, path: &str, default: &'a str) -> &'a str {
        self.get(path).and_then(Value::as_str).unwrap_or(default)
    }

    pub fn get_i64(&self, path: &str, default: i64) -> i64 {
        self.get(path).and_then(Value::as_i64).unwrap_or(default)
    }
}

fn write_all<S: FileStore>(store: &mut S, path: &str, body: &[u8]) -> Result<()> {
    let mut writer = store
        .create(path)
        .with_context(|| format!("Failed to open {path} for writing"))?;
    let mut offset = 0;
    while offset < body.len() {
        match writer.write(&body[offset..]) {
            Ok(0) => break,
            Ok(n) => offset += n,
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("Short write on {path}: {offset} of {} bytes", body.len())))
            }
        }
    }
    let size = writer.close().with_context(|| format!("Failed to close {path}"))?;
    if offset != body.len() || size != body.len() as u64 {
        return Err(anyhow!("Short write on {path}: {offset} of {} bytes", body.len()));
    }
    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    pub hostname: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub ap_ssid: String,
    pub ap_password: String,
    pub telnet_port: u16,
    pub restart_delay_ms: u64,
    pub max_listing_depth: usize,
    pub chunk_buffer_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hostname: "iot-device".to_string(),
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            ap_ssid: "iot-device-setup".to_string(),
            ap_password: String::new(),
            telnet_port: 23,
            restart_delay_ms: 500,
            max_listing_depth: 8,
            chunk_buffer_size: 4096,
        }
    }
}

impl Settings {
    /// Settings from a configuration document; missing or mistyped keys keep
    /// their defaults.
    pub fn from_document(doc: &ConfigDocument) -> Self {
        let defaults = Self::default();
        let int = |path: &str, default: u64, min: u64, max: u64| -> u64 {
            let raw = doc.get_i64(path, default as i64);
            u64::try_from(raw).unwrap_or(default).clamp(min, max)
        };

        Self {
            hostname: doc.get_str("hostname", &defaults.hostname).to_string(),
            wifi_ssid: doc.get_str("wifi.ssid", "").to_string(),
            wifi_password: doc.get_str("wifi.password", "").to_string(),
            ap_ssid: doc.get_str("ap.ssid", &defaults.ap_ssid).to_string(),
            ap_password: doc.get_str("ap.password", "").to_string(),
            telnet_port: int("telnet.port", u64::from(defaults.telnet_port), 1, u64::from(u16::MAX)) as u16,
            restart_delay_ms: int("ota.restart_delay_ms", defaults.restart_delay_ms, 0, 60_000),
            max_listing_depth: int("files.max_depth", defaults.max_listing_depth as u64, 1, MAX_DEPTH as u64)
                as usize,
            chunk_buffer_size: int("ota.chunk_size", defaults.chunk_buffer_size as u64, 512, 64 * 1024) as usize,
        }
    }

    /// Fill in station credentials baked in at build time when none are
    /// configured.
    pub fn with_fallback_credentials(mut self, ssid: &str, password: &str) -> Self {
        if self.wifi_ssid.is_empty() && !ssid.is_empty() {
            self.wifi_ssid = ssid.to_string();
            self.wifi_password = password.to_string();
        }
        self
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn listing_depth(&self) -> usize {
        self.max_listing_depth.clamp(1, MAX_DEPTH)
    }
}
