// Centralized version information

/// Firmware release name reported at boot and by mDNS.
pub const FIRMWARE_VERSION: &str = "v0.3-ota";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn full_version() -> String {
    format!("{} ({})", FIRMWARE_VERSION, CARGO_VERSION)
}
