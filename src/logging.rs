use log::{Level, LevelFilter, Metadata, Record};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use crate::network::telnet_server::TelnetLogServer;

static TELNET_SERVER: OnceLock<Arc<TelnetLogServer>> = OnceLock::new();
static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Colored, uptime-stamped console logger that mirrors every line to the
/// telnet log server once one is running.
struct EnhancedLogger;

impl log::Log for EnhancedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now()
            .duration_since(*boot_time)
            .unwrap_or_default();
        let timestamp = format_uptime(elapsed);

        let (color, level_str, level_char) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, "ERROR", 'E'),
            Level::Warn => (colors::BRIGHT_YELLOW, "WARN ", 'W'),
            Level::Info => (colors::BRIGHT_GREEN, "INFO ", 'I'),
            Level::Debug => (colors::BRIGHT_BLUE, "DEBUG", 'D'),
            Level::Trace => (colors::GRAY, "TRACE", 'T'),
        };
        let module = module_label(record.module_path());
        let message = format!("{}", record.args());

        println!(
            "{}{} [{}] {:>12} | {}{}",
            color, timestamp, level_char, module, message, colors::RESET
        );

        // Telnet gets plain text
        if let Some(server) = TELNET_SERVER.get() {
            server.log_message(&format!(
                "{} [{}] {:>12} | {}",
                timestamp, level_str, module, message
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: EnhancedLogger = EnhancedLogger;

/// Install the enhanced logger. Max level starts at `Info`.
pub fn init_logger() -> Result<(), log::SetLoggerError> {
    let _ = BOOT_TIME.set(SystemTime::now());
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);

    println!("{}┌─────────────────────────────────────────┐{}", colors::BRIGHT_GREEN, colors::RESET);
    println!("{}│        IoT OTA Firmware Logger          │{}", colors::BRIGHT_GREEN, colors::RESET);
    println!("{}└─────────────────────────────────────────┘{}", colors::BRIGHT_GREEN, colors::RESET);
    Ok(())
}

/// Set the telnet server for log forwarding
pub fn set_telnet_server(server: Arc<TelnetLogServer>) {
    let _ = TELNET_SERVER.set(server);
}

pub fn parse_level(level: &str) -> Option<LevelFilter> {
    Some(match level.trim().to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => return None,
    })
}

/// Parse and set log level from a string; returns true if applied
pub fn set_max_level_from_str(level: &str) -> bool {
    match parse_level(level) {
        Some(filter) => {
            log::set_max_level(filter);
            true
        }
        None => false,
    }
}

fn format_uptime(elapsed: Duration) -> String {
    let seconds = elapsed.as_secs();
    if seconds < 60 {
        format!("{:>3}.{:03}s", seconds, elapsed.subsec_millis())
    } else if seconds < 3600 {
        format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Last path segment of the module, at most 12 characters.
fn module_label(module_path: Option<&str>) -> &str {
    let module = module_path
        .unwrap_or("unknown")
        .rsplit("::")
        .next()
        .unwrap_or("unknown");
    match module.char_indices().nth(12) {
        Some((idx, _)) => &module[..idx],
        None => module,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("WARNING"), Some(LevelFilter::Warn));
        assert_eq!(parse_level(" debug "), Some(LevelFilter::Debug));
        assert_eq!(parse_level("off"), Some(LevelFilter::Off));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_millis(1_250)), "  1.250s");
        assert_eq!(format_uptime(Duration::from_secs(125)), " 2m05s");
        assert_eq!(format_uptime(Duration::from_secs(3 * 3600 + 7 * 60)), " 3h07m");
    }

    #[test]
    fn test_module_label() {
        assert_eq!(module_label(Some("iot_ota_firmware::network::web_server")), "web_server");
        assert_eq!(module_label(Some("ota_core::store::memory_backing_store")), "memory_backi");
        assert_eq!(module_label(None), "unknown");
    }
}
