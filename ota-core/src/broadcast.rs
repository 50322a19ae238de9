//! Fan-out of text messages to connected WebSocket clients.

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::json;

pub const MAX_CLIENTS: usize = 8;

/// Sending half of one client connection.
pub trait FrameSender {
    fn send_text(&mut self, text: &str) -> Result<()>;
}

/// Connected clients keyed by their session id.
pub struct Broadcaster<S> {
    clients: BTreeMap<i32, S>,
    max_clients: usize,
}

impl<S: FrameSender> Default for Broadcaster<S> {
    fn default() -> Self {
        Self::new(MAX_CLIENTS)
    }
}

impl<S: FrameSender> Broadcaster<S> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: BTreeMap::new(),
            max_clients,
        }
    }

    /// Register a client. Refused once the limit is reached; an existing
    /// session id is replaced.
    pub fn add(&mut self, session: i32, sender: S) -> bool {
        if !self.clients.contains_key(&session) && self.clients.len() >= self.max_clients {
            log::warn!("WebSocket client limit ({}) reached, refusing {}", self.max_clients, session);
            return false;
        }
        self.clients.insert(session, sender);
        true
    }

    pub fn remove(&mut self, session: i32) -> bool {
        self.clients.remove(&session).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Send `text` to every client. Clients whose send fails are dropped.
    /// Returns how many received it.
    pub fn broadcast(&mut self, text: &str) -> usize {
        let before = self.clients.len();
        self.clients.retain(|session, sender| match sender.send_text(text) {
            Ok(()) => true,
            Err(e) => {
                log::info!("Dropping WebSocket client {}: {:#}", session, e);
                false
            }
        });
        if self.clients.len() != before {
            log::debug!("{} WebSocket client(s) left", self.clients.len());
        }
        self.clients.len()
    }
}

/// Reply to a text frame from a client.
pub fn echo_reply(text: &str) -> String {
    format!("Message received: {text}")
}

/// Broadcast payload for an upload progress step.
pub fn progress_message(step: i32) -> String {
    json!({ "event": "progress", "step": step }).to_string()
}
