use anyhow::Result;
use esp_idf_svc::http::server::ws::EspHttpWsDetachedSender;
use esp_idf_svc::http::server::EspHttpServer;
use esp_idf_svc::ws::FrameType;
use std::sync::{Arc, Mutex, MutexGuard};

use ota_core::broadcast::{echo_reply, progress_message};
use ota_core::{Broadcaster, FrameSender};

const MAX_FRAME: usize = 512;

struct WsClient(EspHttpWsDetachedSender);

impl FrameSender for WsClient {
    fn send_text(&mut self, text: &str) -> Result<()> {
        self.0.send(FrameType::Text(false), text.as_bytes())?;
        Ok(())
    }
}

/// `/ws`: echoes text frames back and pushes upload progress to every
/// connected client.
#[derive(Clone, Default)]
pub struct WebSocketHub {
    clients: Arc<Mutex<Broadcaster<WsClient>>>,
}

impl WebSocketHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, Broadcaster<WsClient>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, server: &mut EspHttpServer<'static>) -> Result<()> {
        let hub = self.clone();
        server.ws_handler("/ws", move |ws| {
            let session = ws.session();
            if ws.is_new() {
                let sender = ws.create_detached_sender()?;
                if hub.clients().add(session, WsClient(sender)) {
                    log::info!("WebSocket client {} connected", session);
                } else {
                    ws.send(FrameType::Close, &[])?;
                }
                return Ok(());
            }
            if ws.is_closed() {
                hub.clients().remove(session);
                log::info!("WebSocket client {} disconnected", session);
                return Ok(());
            }

            let (frame_type, len) = ws.recv(&mut [])?;
            if len > MAX_FRAME {
                log::warn!("WebSocket client {} sent {} bytes, closing", session, len);
                return ws.send(FrameType::Close, &[]);
            }
            let mut buf = [0u8; MAX_FRAME];
            ws.recv(&mut buf[..len])?;
            if let FrameType::Text(_) = frame_type {
                // Frames carry a trailing NUL
                let text = String::from_utf8_lossy(&buf[..len]);
                let text = text.trim_end_matches('\0');
                log::debug!("WebSocket {} received: {}", session, text);
                ws.send(FrameType::Text(false), echo_reply(text).as_bytes())?;
            }
            Ok::<(), esp_idf_svc::sys::EspError>(())
        })?;
        log::info!("WebSocket endpoint ready at /ws");
        Ok(())
    }

    pub fn broadcast(&self, text: &str) -> usize {
        self.clients().broadcast(text)
    }

    pub fn broadcast_step(&self, step: i32) {
        self.broadcast(&progress_message(step));
    }
}
