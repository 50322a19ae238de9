use anyhow::Result;
use embedded_svc::http::Method;
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use ota_core::api::{query_param, BodyBuffer, MAX_JSON_BODY};
use ota_core::service::file_target;
use ota_core::store::DirWriter;
use ota_core::{ApiResponse, DirStore, Download, OtaService, UploadSession, UploadTarget};

use crate::network::compression::write_api_response;
use crate::network::websocket::WebSocketHub;
use crate::platform::{EspPartition, EspRestart};

const STREAM_CHUNK: usize = 2048;

pub type DeviceService = OtaService<EspPartition, DirStore, EspRestart>;

/// Everything the HTTP handlers share. The ESP httpd runs handlers on a
/// single task, so at most one upload is in flight at a time.
pub struct DeviceState {
    pub service: DeviceService,
    pub session: UploadSession<DirWriter>,
}

impl DeviceState {
    pub fn new(service: DeviceService) -> Self {
        Self {
            service,
            session: UploadSession::new(),
        }
    }
}

pub type SharedState = Arc<Mutex<DeviceState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, DeviceState> {
    state.lock().unwrap_or_else(|poisoned| {
        log::warn!("Device state lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

pub struct WebServer {
    _server: EspHttpServer<'static>,
}

impl WebServer {
    pub fn new(state: SharedState, hub: &WebSocketHub) -> Result<Self> {
        let config = Configuration {
            uri_match_wildcard: true,
            stack_size: 10240,
            max_uri_handlers: 16,
            ..Default::default()
        };
        let mut server = EspHttpServer::new(&config)?;
        hub.register(&mut server)?;

        let s = state.clone();
        server.fn_handler("/api/firmware", Method::Post, move |mut req| {
            let size = content_length(&req);
            let filename = req.header("X-Filename").unwrap_or("firmware.bin").to_string();
            log::info!("Firmware upload '{}' started, size: {} bytes", filename, size);

            let response = {
                let mut guard = lock(&s);
                let DeviceState { service, session } = &mut *guard;
                service.stream_upload(session, UploadTarget::Firmware, size, |buf| req.read(buf))
            };
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/upload", Method::Post, move |mut req| {
            let size = content_length(&req);
            let directory = query_param(req.uri(), "directory").unwrap_or_default();
            let Some(filename) = req.header("X-Filename").map(str::to_string) else {
                let response = ApiResponse::error(400, "nok1", "Missing X-Filename header");
                return write_api_response(req, &response);
            };

            let target = match file_target(&directory, &filename) {
                Ok(target) => target,
                Err(e) => {
                    log::warn!("Rejected upload of '{}' into '{}': {}", filename, directory, e);
                    let response = ApiResponse::error(400, "nok1", e.to_string());
                    return write_api_response(req, &response);
                }
            };
            log::info!("File upload '{}' into '{}', size: {} bytes", filename, directory, size);

            let response = {
                let mut guard = lock(&s);
                let DeviceState { service, session } = &mut *guard;
                service.stream_upload(session, target, size, |buf| req.read(buf))
            };
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/reboot", Method::Get, move |req| {
            let response = lock(&s).service.reboot();
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/files", Method::Get, move |req| {
            let response = lock(&s).service.files();
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/directories", Method::Get, move |req| {
            let response = lock(&s).service.directories();
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/download", Method::Get, move |req| {
            let file = query_param(req.uri(), "file").unwrap_or_default();
            let download = lock(&s).service.download(&file);
            match download {
                Ok(download) => stream_download(req, download, true),
                Err(response) => write_api_response(req, &response),
            }
        })?;

        let s = state.clone();
        server.fn_handler("/api/delete", Method::Delete, move |req| {
            let path = query_param(req.uri(), "path").unwrap_or_default();
            let response = lock(&s).service.delete(&path);
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/addDirectory", Method::Post, move |mut req| {
            let response = match read_body(&mut req)? {
                Ok(body) => lock(&s).service.add_directory(body.as_deref()),
                Err(rejected) => rejected,
            };
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/config/read", Method::Get, move |req| {
            let response = lock(&s).service.config_read();
            write_api_response(req, &response)
        })?;

        let s = state.clone();
        server.fn_handler("/api/config/save", Method::Post, move |mut req| {
            let response = match read_body(&mut req)? {
                Ok(body) => lock(&s).service.config_save(body.as_deref()),
                Err(rejected) => rejected,
            };
            write_api_response(req, &response)
        })?;

        // Registered last so the API routes win the wildcard match
        let s = state;
        server.fn_handler("/*", Method::Get, move |req| {
            let asset = lock(&s).service.static_asset(req.uri());
            match asset {
                Ok(download) => stream_download(req, download, false),
                Err(response) => write_api_response(req, &response),
            }
        })?;

        log::info!("Web server started on port 80");
        Ok(Self { _server: server })
    }
}

fn content_length(req: &HttpRequest<'_, '_>) -> u64 {
    req.header("Content-Length")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0)
}

/// Read a small request body. The inner result is `Ok(None)` for an empty
/// body, which the service answers with a bad request, and the 413 response
/// for an oversized one.
fn read_body(req: &mut HttpRequest<'_, '_>) -> Result<Result<Option<Vec<u8>>, ApiResponse>> {
    let mut body = BodyBuffer::new(MAX_JSON_BODY);
    if let Err(rejected) = body.check_declared(content_length(req)) {
        return Ok(Err(rejected));
    }
    let mut buf = [0u8; 512];
    loop {
        let n = req.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if let Err(rejected) = body.push(&buf[..n]) {
            return Ok(Err(rejected));
        }
    }
    Ok(Ok(body.finish()))
}

/// Stream a file to the client. The state lock is already released, so
/// other requests are not blocked behind a slow download.
fn stream_download(
    req: HttpRequest<'_, '_>,
    mut download: Download<std::fs::File>,
    attachment: bool,
) -> Result<()> {
    use std::io::Read as _;

    let length = download.size.to_string();
    let mut headers = vec![
        ("Content-Type", download.content_type),
        ("Content-Length", length.as_str()),
    ];
    if attachment {
        headers.push(("Content-Disposition", "attachment"));
    }
    let mut response = req.into_response(200, Some("OK"), &headers)?;

    let mut buf = [0u8; STREAM_CHUNK];
    let mut sent: u64 = 0;
    loop {
        let n = download.reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        response.write_all(&buf[..n])?;
        sent += n as u64;
    }
    if sent != download.size {
        log::warn!("Sent {} bytes, expected {}", sent, download.size);
    }
    Ok(())
}
