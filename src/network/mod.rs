pub mod compression;
pub mod telnet_server;

#[cfg(target_os = "espidf")]
pub mod mqtt;
#[cfg(target_os = "espidf")]
pub mod web_server;
#[cfg(target_os = "espidf")]
pub mod websocket;
#[cfg(target_os = "espidf")]
pub mod wifi;
