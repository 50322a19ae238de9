use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // ESP-IDF environment only when building the firmware itself
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
        println!("cargo:rustc-link-arg=-Wl,--undefined=esp_backtrace_print_app_description");
    }

    // Built-in WiFi credentials, used when the stored configuration has none
    let wifi_config_path = "wifi_config.h";
    println!("cargo:rerun-if-changed={wifi_config_path}");
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;

        let ssid = define_value(&contents, "WIFI_SSID").unwrap_or_default();
        let password = define_value(&contents, "WIFI_PASSWORD").unwrap_or_default();
        println!("cargo:rustc-env=WIFI_SSID={ssid}");
        println!("cargo:rustc-env=WIFI_PASSWORD={password}");
    } else {
        println!("cargo:rustc-env=WIFI_SSID=");
        println!("cargo:rustc-env=WIFI_PASSWORD=");
        println!("cargo:warning=wifi_config.h not found; the device will start its setup access point unless /config.json has credentials.");
    }

    Ok(())
}

fn define_value<'a>(contents: &'a str, name: &str) -> Option<&'a str> {
    let marker = format!("#define {name}");
    contents
        .lines()
        .find(|l| l.trim_start().starts_with(&marker))
        .and_then(|l| l.split('"').nth(1))
}
