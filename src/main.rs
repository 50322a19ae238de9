#![cfg_attr(not(target_os = "espidf"), allow(dead_code))]

mod logging;
mod network;
#[cfg(target_os = "espidf")]
mod platform;
mod version;

#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::delay::FreeRtos;
    use esp_idf_hal::prelude::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use std::sync::{Arc, Mutex};

    use ota_core::{code, ConfigDocument, MqttSettings, OtaService, Settings};

    use crate::network::mqtt::MqttManager;
    use crate::network::telnet_server::TelnetLogServer;
    use crate::network::web_server::{DeviceState, WebServer};
    use crate::network::websocket::WebSocketHub;
    use crate::network::wifi::NetworkManager;
    use crate::platform::{storage, EspPartition, EspRestart};

    esp_idf_svc::sys::link_patches();
    logging::init_logger().expect("Failed to initialize logger");

    log::info!("IoT OTA firmware {}", version::full_version());
    log::info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });

    let store = storage::mount()?;

    let mut config = ConfigDocument::new("config");
    match config.load(&store) {
        Ok(()) => log::info!("Loaded {}", config.path()),
        Err(e) => log::warn!("Using default configuration: {:#}", e),
    }
    if let Some(level) = config.get("log.level").and_then(|v| v.as_str()) {
        if !logging::set_max_level_from_str(level) {
            log::warn!("Unknown log level '{}' in configuration", level);
        }
    }
    let settings = Settings::from_document(&config)
        .with_fallback_credentials(env!("WIFI_SSID"), env!("WIFI_PASSWORD"));
    let mqtt = MqttManager::new(MqttSettings::from_document(&config));
    let hub = WebSocketHub::new();

    let partition = EspPartition::next_update()?;
    let mut service = OtaService::new(partition, store, EspRestart, settings.clone()).with_config(config);
    service.progress_mut().subscribe(|step| match step {
        code::PROGRESS => log::trace!("Upload step {}", step),
        s if s < 0 => log::warn!("Upload step {}", s),
        s => log::debug!("Upload step {}", s),
    });
    let ws = hub.clone();
    service.progress_mut().subscribe(move |step| ws.broadcast_step(step));
    if let Some(manager) = &mqtt {
        let manager = manager.clone();
        service.progress_mut().subscribe_fallible(move |step| {
            if manager.is_connected() && !manager.publish("ota/step", &step.to_string()) {
                anyhow::bail!("MQTT publish of step {} failed", step);
            }
            Ok(())
        });
    }
    let state = Arc::new(Mutex::new(DeviceState::new(service)));

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let mut network = NetworkManager::new(peripherals.modem, sys_loop, &settings)?;
    let mode = network.connect()?;
    log::info!("Network up in {:?} mode, IP: {}", mode, network.ip().unwrap_or_default());

    let telnet = Arc::new(TelnetLogServer::new(settings.telnet_port));
    match Arc::clone(&telnet).start() {
        Ok(()) => logging::set_telnet_server(telnet),
        Err(e) => log::warn!("Telnet log server unavailable: {:#}", e),
    }

    let _server = WebServer::new(Arc::clone(&state), &hub)?;
    let mut announced = false;

    loop {
        FreeRtos::delay_ms(1000);
        if let Some(manager) = &mqtt {
            manager.maintain();
            match (manager.is_connected(), announced) {
                (true, false) => announced = manager.publish("status", "online"),
                (false, true) => announced = false,
                _ => {}
            }
        }
        if let Some(step) = network.maintain() {
            let mut guard = state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.service.progress_mut().report_all(&[step]);
        }
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    if logging::init_logger().is_ok() {
        log::error!(
            "{} is firmware for ESP-IDF targets; build with --target xtensa-esp32s3-espidf",
            version::full_version()
        );
    }
}
