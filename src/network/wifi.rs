use anyhow::{anyhow, bail, Result};
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    mdns::EspMdns,
    nvs::EspDefaultNvsPartition,
    wifi::{AccessPointConfiguration, AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};
use std::time::{Duration, Instant};

use ota_core::{code, Settings};

/// How long a station connect may take before falling back to the AP.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Station,
    AccessPoint,
}

pub struct NetworkManager {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
    password: String,
    ap_ssid: String,
    ap_password: String,
    hostname: String,
    mode: Option<LinkMode>,
    link_up: bool,
    _mdns: Option<EspMdns>,
}

impl NetworkManager {
    pub fn new(modem: Modem, sys_loop: EspSystemEventLoop, settings: &Settings) -> Result<Self> {
        let nvs = EspDefaultNvsPartition::take()?;
        let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

        Ok(Self {
            wifi,
            ssid: settings.wifi_ssid.clone(),
            password: settings.wifi_password.clone(),
            ap_ssid: settings.ap_ssid.clone(),
            ap_password: settings.ap_password.clone(),
            hostname: settings.hostname.clone(),
            mode: None,
            link_up: false,
            _mdns: None,
        })
    }

    /// Join the configured network; if that is impossible, open the setup
    /// access point so the upload endpoints stay reachable.
    pub fn connect(&mut self) -> Result<LinkMode> {
        let mode = if self.ssid.is_empty() {
            log::warn!("No WiFi credentials configured");
            self.start_access_point()?
        } else {
            match self.connect_station() {
                Ok(()) => LinkMode::Station,
                Err(e) => {
                    log::warn!("WiFi connect to '{}' failed: {:?}", self.ssid, e);
                    let _ = self.wifi.stop();
                    self.start_access_point()?
                }
            }
        };
        self.link_up = true;

        match self.start_mdns() {
            Ok(_) => log::info!("mDNS service started: {}.local", self.hostname),
            Err(e) => log::warn!("Failed to start mDNS: {:?}", e),
        }
        Ok(mode)
    }

    fn connect_station(&mut self) -> Result<()> {
        let cfg = Configuration::Client(ClientConfiguration {
            ssid: self
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid SSID format: {}", self.ssid))?,
            password: self
                .password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid password format"))?,
            auth_method: if self.password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        self.wifi.set_configuration(&cfg)?;
        self.wifi.start()?;

        log::info!("Connecting to {}...", self.ssid);
        self.wifi.wifi_mut().connect()?;
        let deadline = Instant::now() + CONNECT_TIMEOUT;
        while !self.wifi.is_connected()? {
            if Instant::now() >= deadline {
                bail!("timed out after {:?}", CONNECT_TIMEOUT);
            }
            FreeRtos::delay_ms(200);
        }

        log::info!("Waiting for DHCP...");
        self.wifi.wait_netif_up()?;
        self.mode = Some(LinkMode::Station);
        log::info!("WiFi connected, IP: {}", self.ip().unwrap_or_default());
        Ok(())
    }

    fn start_access_point(&mut self) -> Result<LinkMode> {
        log::warn!("Starting setup access point '{}'", self.ap_ssid);
        let cfg = Configuration::AccessPoint(AccessPointConfiguration {
            ssid: self
                .ap_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid AP SSID format: {}", self.ap_ssid))?,
            password: self
                .ap_password
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("Invalid AP password format"))?,
            auth_method: if self.ap_password.is_empty() {
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            channel: 1,
            ..Default::default()
        });
        self.wifi.set_configuration(&cfg)?;
        self.wifi.start()?;
        self.wifi.wait_netif_up()?;
        self.mode = Some(LinkMode::AccessPoint);
        log::info!("Access point up, IP: {}", self.ip().unwrap_or_default());
        Ok(LinkMode::AccessPoint)
    }

    fn start_mdns(&mut self) -> Result<()> {
        let mut mdns = EspMdns::take()?;
        mdns.set_hostname(&self.hostname)?;
        mdns.add_service(
            None,
            "_http",
            "_tcp",
            80,
            &[("path", "/"), ("version", crate::version::FIRMWARE_VERSION)],
        )?;
        self._mdns = Some(mdns);
        Ok(())
    }

    /// Periodic link check. Returns the connectivity-lost step code when an
    /// established station link has just dropped; reconnects are retried on
    /// every call until the link is back.
    pub fn maintain(&mut self) -> Option<i32> {
        if self.mode != Some(LinkMode::Station) {
            return None;
        }

        let connected = self.wifi.is_connected().unwrap_or(false);
        if connected {
            if !self.link_up {
                log::info!("WiFi link restored, IP: {}", self.ip().unwrap_or_default());
            }
            self.link_up = true;
            return None;
        }

        let just_dropped = self.link_up;
        self.link_up = false;
        if just_dropped {
            log::warn!("WiFi link to '{}' lost", self.ssid);
        }
        if let Err(e) = self.wifi.wifi_mut().connect() {
            log::debug!("WiFi reconnect attempt failed: {:?}", e);
        }
        just_dropped.then_some(code::CONNECTIVITY_LOST)
    }

    pub fn ip(&self) -> Option<String> {
        let netif = match self.mode {
            Some(LinkMode::AccessPoint) => self.wifi.wifi().ap_netif(),
            _ => self.wifi.wifi().sta_netif(),
        };
        netif.get_ip_info().ok().map(|info| info.ip.to_string())
    }
}
