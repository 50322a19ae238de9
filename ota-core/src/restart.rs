use std::time::Duration;

/// Delay between answering a request and restarting, so the response can
/// leave the device first.
pub const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Schedules a device restart.
pub trait Restart {
    fn schedule(&mut self, after: Duration);
}

/// Records restart requests instead of acting on them.
#[derive(Debug, Default, Clone)]
pub struct RecordingRestart {
    pub requests: Vec<Duration>,
}

impl RecordingRestart {
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Restart for RecordingRestart {
    fn schedule(&mut self, after: Duration) {
        log::info!("Restart requested in {:?}", after);
        self.requests.push(after);
    }
}
