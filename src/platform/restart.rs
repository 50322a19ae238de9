use std::thread;
use std::time::Duration;

use ota_core::Restart;

/// Restarts the chip from a short-lived thread so the HTTP response that
/// triggered it can still be sent.
#[derive(Debug, Default)]
pub struct EspRestart;

impl Restart for EspRestart {
    fn schedule(&mut self, after: Duration) {
        let spawned = thread::Builder::new()
            .name("restart".to_string())
            .stack_size(3072)
            .spawn(move || {
                thread::sleep(after);
                log::info!("Restarting device...");
                unsafe { esp_idf_sys::esp_restart() }
            });

        match spawned {
            Ok(_) => log::warn!("Device restart scheduled in {} ms", after.as_millis()),
            Err(e) => log::error!("Failed to schedule restart: {}", e),
        }
    }
}
