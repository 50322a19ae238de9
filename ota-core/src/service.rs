//! Request-level operations of the device: upload endpoints, file management,
//! configuration and static assets. Every operation produces an
//! [`ApiResponse`]; the transport only has to serialize it.
//!
//! The dispatcher owns the [`UploadSession`] and passes it into each chunk
//! call, so nothing about an in-flight upload lives in the service itself.

use std::fmt::Display;

use crate::api::{content_type_for, ApiResponse, OCTET_STREAM};
use crate::catalog::DirectoryCatalog;
use crate::config::{ConfigDocument, Settings};
use crate::error::{StoreError, UploadError};
use crate::flash::{FlashWriter, UpdatePartition};
use crate::path;
use crate::progress::ProgressReporter;
use crate::restart::Restart;
use crate::session::{UploadContext, UploadOutcome, UploadSession, UploadTarget};
use crate::store::FileStore;

/// Directory static assets are served from.
pub const PUBLIC_ROOT: &str = "/public_html";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Start,
    Write,
    End,
    Aborted,
}

/// One step of a chunked upload, as delivered by the transport.
#[derive(Debug, Clone, Copy)]
pub struct ChunkEvent<'a> {
    pub status: UploadStatus,
    pub filename: &'a str,
    pub buffer: &'a [u8],
    /// Announced total size on Start; chunk length on Write.
    pub current_size: u64,
}

impl<'a> ChunkEvent<'a> {
    pub fn start(filename: &'a str, total_size: u64) -> Self {
        Self {
            status: UploadStatus::Start,
            filename,
            buffer: &[],
            current_size: total_size,
        }
    }

    pub fn write(buffer: &'a [u8]) -> Self {
        Self {
            status: UploadStatus::Write,
            filename: "",
            buffer,
            current_size: buffer.len() as u64,
        }
    }

    pub fn end() -> Self {
        Self {
            status: UploadStatus::End,
            filename: "",
            buffer: &[],
            current_size: 0,
        }
    }

    pub fn aborted() -> Self {
        Self {
            status: UploadStatus::Aborted,
            filename: "",
            buffer: &[],
            current_size: 0,
        }
    }
}

/// A file opened for streaming back to the client.
#[derive(Debug)]
pub struct Download<R> {
    pub reader: R,
    pub size: u64,
    pub content_type: &'static str,
}

/// Store path for an uploaded file. An empty directory means the root.
pub fn file_target(directory: &str, filename: &str) -> Result<UploadTarget, UploadError> {
    path::validate_filename(filename)?;
    let directory = if directory.is_empty() { path::ROOT } else { directory };
    Ok(UploadTarget::File(path::join(directory, filename)?))
}

fn bad_request(message: impl Into<String>) -> ApiResponse {
    ApiResponse::error(400, "nok1", message)
}

pub struct OtaService<P, S, R> {
    flash: FlashWriter<P>,
    store: S,
    progress: ProgressReporter,
    restart: R,
    settings: Settings,
    config: ConfigDocument,
}

impl<P, S, R> OtaService<P, S, R>
where
    P: UpdatePartition,
    S: FileStore,
    R: Restart,
{
    pub fn new(partition: P, store: S, restart: R, settings: Settings) -> Self {
        Self {
            flash: FlashWriter::new(partition),
            store,
            progress: ProgressReporter::new(),
            restart,
            settings,
            config: ConfigDocument::new("config"),
        }
    }

    /// Use an already loaded configuration document.
    pub fn with_config(mut self, config: ConfigDocument) -> Self {
        self.config = config;
        self
    }

    pub fn progress_mut(&mut self) -> &mut ProgressReporter {
        &mut self.progress
    }

    pub fn flash(&self) -> &FlashWriter<P> {
        &self.flash
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn restart(&self) -> &R {
        &self.restart
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn config(&self) -> &ConfigDocument {
        &self.config
    }

    fn context(&mut self) -> UploadContext<'_, P, S, R> {
        UploadContext {
            flash: &mut self.flash,
            store: &mut self.store,
            progress: &mut self.progress,
            restart: &mut self.restart,
            restart_delay: self.settings.restart_delay(),
        }
    }

    fn deliver(
        &mut self,
        session: &mut UploadSession<S::Writer>,
        target: UploadTarget,
        event: &ChunkEvent<'_>,
    ) -> UploadOutcome {
        let mut ctx = self.context();
        match event.status {
            UploadStatus::Start => session.start(target, event.current_size, &mut ctx),
            UploadStatus::Write => session.write(event.buffer, &mut ctx),
            UploadStatus::End => session.end(&mut ctx),
            UploadStatus::Aborted => session.abort(&mut ctx),
        }
    }

    /// `POST /api/firmware`
    pub fn firmware_chunk(
        &mut self,
        session: &mut UploadSession<S::Writer>,
        event: &ChunkEvent<'_>,
    ) -> UploadOutcome {
        if event.status == UploadStatus::Start {
            log::info!("Firmware upload: {}", event.filename);
        }
        self.deliver(session, UploadTarget::Firmware, event)
    }

    /// `POST /api/upload?directory=`. The target path is resolved on Start;
    /// a bad file name is rejected before anything is opened.
    pub fn file_chunk(
        &mut self,
        session: &mut UploadSession<S::Writer>,
        directory: &str,
        event: &ChunkEvent<'_>,
    ) -> UploadOutcome {
        let target = if event.status == UploadStatus::Start {
            match file_target(directory, event.filename) {
                Ok(target) => target,
                Err(e) => {
                    log::warn!("Rejected upload of '{}' into '{}': {}", event.filename, directory, e);
                    return UploadOutcome::Respond(bad_request(e.to_string()));
                }
            }
        } else {
            session
                .target()
                .cloned()
                .unwrap_or_else(|| UploadTarget::File(String::new()))
        };
        self.deliver(session, target, event)
    }

    /// Pump a request body through Start, Write* and End. A read error
    /// aborts the transaction.
    pub fn stream_upload<F, E>(
        &mut self,
        session: &mut UploadSession<S::Writer>,
        target: UploadTarget,
        size: u64,
        mut read: F,
    ) -> ApiResponse
    where
        F: FnMut(&mut [u8]) -> Result<usize, E>,
        E: Display,
    {
        let mut ctx = self.context();
        if let UploadOutcome::Respond(response) = session.start(target, size, &mut ctx) {
            return response;
        }

        let mut buf = vec![0u8; self.settings.chunk_buffer_size.max(1)];
        let mut received: u64 = 0;
        loop {
            let mut ctx = self.context();
            match read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    received += n as u64;
                    session.write(&buf[..n], &mut ctx);
                }
                Err(e) => {
                    log::error!("Upload body read failed after {} bytes: {}", received, e);
                    return session
                        .abort(&mut ctx)
                        .response()
                        .unwrap_or_else(|| ApiResponse::error(500, "nok3", "Upload aborted."));
                }
            }
        }

        if size != 0 && received != size {
            log::warn!("Announced {} bytes but received {}", size, received);
        }
        let mut ctx = self.context();
        session
            .end(&mut ctx)
            .response()
            .unwrap_or_else(|| ApiResponse::error(500, "nok2", "Upload failed."))
    }

    /// `GET /api/reboot`
    pub fn reboot(&mut self) -> ApiResponse {
        log::warn!("Reboot requested");
        self.restart.schedule(self.settings.restart_delay());
        ApiResponse::ok("Microcontroller shall reboot in half a second.")
    }

    /// `GET /api/files`
    pub fn files(&self) -> ApiResponse {
        let catalog = DirectoryCatalog::with_max_depth(&self.store, self.settings.listing_depth());
        match catalog.listing(path::ROOT) {
            Ok(listing) => {
                log::debug!("Listed {} entries", listing.files.len());
                ApiResponse::json(200, &listing)
            }
            Err(e) => {
                log::error!("Listing failed: {}", e);
                ApiResponse::error(500, "nok1", "Failed to list files")
            }
        }
    }

    /// `GET /api/directories`
    pub fn directories(&self) -> ApiResponse {
        let catalog = DirectoryCatalog::with_max_depth(&self.store, self.settings.listing_depth());
        match catalog.directories(path::ROOT) {
            Ok(dirs) => ApiResponse::json(200, &dirs),
            Err(e) => {
                log::error!("Directory listing failed: {}", e);
                ApiResponse::error(500, "nok1", "Failed to list directories")
            }
        }
    }

    /// `GET /api/download?file=`
    pub fn download(&self, file: &str) -> Result<Download<S::Reader>, ApiResponse> {
        log::info!("Download '{}'", file);
        let not_found = || ApiResponse::error(404, "nok1", "File not found");
        let path = path::normalize(file).map_err(|e| bad_request(e.to_string()))?;
        match self.store.open(&path) {
            Ok((reader, size)) => Ok(Download {
                reader,
                size,
                content_type: OCTET_STREAM,
            }),
            Err(StoreError::NotFound(_)) | Err(StoreError::AlreadyExists(_)) => Err(not_found()),
            Err(e) => {
                log::error!("Failed to open {}: {}", path, e);
                Err(not_found())
            }
        }
    }

    /// `DELETE /api/delete?path=`
    pub fn delete(&mut self, target: &str) -> ApiResponse {
        let path = match path::normalize(target) {
            Ok(path) if path != path::ROOT => path,
            Ok(_) => return bad_request("Cannot delete the root directory"),
            Err(e) => return bad_request(e.to_string()),
        };

        if !self.store.exists(&path) {
            log::info!("Delete '{}': not found", path);
            return ApiResponse::error(404, "nok2", "File not found");
        }
        if self.store.remove(&path) {
            log::info!("Deleted '{}'", path);
            ApiResponse::ok("File deleted successfully")
        } else {
            log::warn!("Failed to delete '{}'", path);
            ApiResponse::error(500, "nok1", "Failed to delete file")
        }
    }

    /// `POST /api/addDirectory` with body `{"parentPath": ..., "dirName": ...}`.
    pub fn add_directory(&mut self, body: Option<&[u8]>) -> ApiResponse {
        let Some(body) = body.filter(|b| !b.is_empty()) else {
            return bad_request("Bad Request");
        };

        let params: serde_json::Value = match serde_json::from_slice(body) {
            Ok(params) => params,
            Err(e) => {
                log::warn!("addDirectory: invalid JSON: {}", e);
                return ApiResponse::error(500, "nok2", "Failed to deserializeJson the request data");
            }
        };
        let (Some(parent), Some(name)) = (
            params.get("parentPath").and_then(|v| v.as_str()),
            params.get("dirName").and_then(|v| v.as_str()),
        ) else {
            return ApiResponse::error(500, "nok2", "Missing parentPath or dirName");
        };

        let full = match path::validate_filename(name).and_then(|_| path::join(parent, name)) {
            Ok(full) => full,
            Err(e) => return bad_request(e.to_string()),
        };

        if self.store.mkdir(&full) {
            log::info!("Created directory '{}'", full);
            ApiResponse::ok("Directory created successfully")
        } else {
            log::warn!("Failed to create directory '{}'", full);
            ApiResponse::error(500, "nok3", "Failed to create directory")
        }
    }

    /// Load the configuration document from the store, keeping the current
    /// one when there is none yet.
    pub fn load_config(&mut self) -> bool {
        match self.config.load(&self.store) {
            Ok(()) => {
                log::info!("Loaded configuration from {}", self.config.path());
                true
            }
            Err(e) => {
                log::warn!("No stored configuration: {e:#}");
                false
            }
        }
    }

    /// `GET /api/config/read`
    pub fn config_read(&self) -> ApiResponse {
        ApiResponse::json(200, &self.config.as_value())
    }

    /// `POST /api/config/save`. Changes apply after the next restart.
    pub fn config_save(&mut self, body: Option<&[u8]>) -> ApiResponse {
        let Some(body) = body.filter(|b| !b.is_empty()) else {
            return bad_request("Bad Request");
        };

        let value: serde_json::Value = match serde_json::from_slice(body) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("config/save: invalid JSON: {}", e);
                return ApiResponse::error(500, "nok2", "Failed to deserializeJson the request data");
            }
        };
        let mut updated = self.config.clone();
        if let Err(e) = updated.replace(value) {
            return ApiResponse::error(500, "nok2", e.to_string());
        }
        if let Err(e) = updated.save(&mut self.store) {
            log::error!("Failed to save configuration: {e:#}");
            return ApiResponse::error(500, "nok3", "Failed to save configuration");
        }

        self.config = updated;
        log::info!("Configuration updated via HTTP POST");
        ApiResponse::ok("Configuration saved successfully")
    }

    /// Any other `GET`: files below `/public_html`.
    pub fn static_asset(&self, uri: &str) -> Result<Download<S::Reader>, ApiResponse> {
        let not_found = || ApiResponse::text(404, "File Not Found");
        let requested = crate::api::uri_path(uri);
        let requested = if requested == "/" || requested.is_empty() {
            "/index.html"
        } else {
            requested
        };

        let path = path::join(PUBLIC_ROOT, requested).map_err(|_| not_found())?;
        match self.store.open(&path) {
            Ok((reader, size)) => Ok(Download {
                reader,
                size,
                content_type: content_type_for(&path),
            }),
            Err(_) => {
                log::debug!("Static asset not found: {}", path);
                Err(not_found())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{MemoryPartition, IMAGE_MAGIC};
    use crate::restart::RecordingRestart;
    use crate::session::SessionState;
    use crate::store::{FileSink, MemoryStore};
    use std::io::Read;

    type TestService = OtaService<MemoryPartition, MemoryStore, RecordingRestart>;

    fn new_service() -> TestService {
        OtaService::new(
            MemoryPartition::new(0x11000),
            MemoryStore::new(1 << 16),
            RecordingRestart::default(),
            Settings::default(),
        )
    }

    fn put(service: &mut TestService, path: &str, data: &[u8]) {
        let mut writer = service.store_mut().create(path).unwrap();
        writer.write(data).unwrap();
        writer.close().unwrap();
    }

    fn body(response: &ApiResponse) -> serde_json::Value {
        serde_json::from_str(&response.body).unwrap()
    }

    #[test]
    fn test_file_chunks_into_directory() {
        let mut service = new_service();
        let mut session = UploadSession::new();

        assert_eq!(
            service.file_chunk(&mut session, "/www", &ChunkEvent::start("app.js", 0)),
            UploadOutcome::Continue
        );
        service.file_chunk(&mut session, "/www", &ChunkEvent::write(b"let x;"));
        let response = service
            .file_chunk(&mut session, "/www", &ChunkEvent::end())
            .response()
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(service.store().contents("/www/app.js").unwrap(), b"let x;");
    }

    #[test]
    fn test_file_chunk_rejects_bad_name() {
        let mut service = new_service();
        let mut session = UploadSession::new();
        let response = service
            .file_chunk(&mut session, "/", &ChunkEvent::start("../boot.bin", 0))
            .response()
            .unwrap();
        assert_eq!(response.status_code, 400);
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_stream_firmware_upload() {
        let mut service = new_service();
        let mut session = UploadSession::new();
        let mut image = vec![0x11u8; 10_000];
        image[0] = IMAGE_MAGIC;

        let mut body = image.as_slice();
        let response = service.stream_upload(&mut session, UploadTarget::Firmware, image.len() as u64, |buf| {
            body.read(buf)
        });

        assert_eq!(response.status_code, 200);
        assert_eq!(service.restart().count(), 1);
        assert_eq!(service.flash().partition().boot_image(), Some(image.as_slice()));
    }

    #[test]
    fn test_stream_read_error_aborts() {
        let mut service = new_service();
        let mut session = UploadSession::new();
        let mut calls = 0;
        let response = service.stream_upload(&mut session, UploadTarget::File("/part.bin".into()), 0, |buf| {
            calls += 1;
            if calls == 1 {
                buf[..4].copy_from_slice(b"data");
                Ok(4)
            } else {
                Err("connection reset")
            }
        });

        assert_eq!(body(&response)["status"], "nok3");
        assert_eq!(session.state(), SessionState::Aborted);
        assert!(!service.store().exists("/part.bin"));
    }

    #[test]
    fn test_reboot_schedules_restart() {
        let mut service = new_service();
        let response = service.reboot();
        assert_eq!(response.status_code, 200);
        assert_eq!(service.restart().requests, vec![std::time::Duration::from_millis(500)]);
    }

    #[test]
    fn test_files_and_directories() {
        let mut service = new_service();
        put(&mut service, "/a/b.txt", &[0; 10]);
        assert!(service.store_mut().mkdir("/a/c"));

        let listing = body(&service.files());
        assert_eq!(listing["used"], 10);
        assert_eq!(listing["files"].as_array().unwrap().len(), 3);
        assert_eq!(listing["files"][1]["name"], "/a/b.txt");

        let dirs = body(&service.directories());
        assert_eq!(dirs, serde_json::json!(["/a", "/a/c"]));
    }

    #[test]
    fn test_download() {
        let mut service = new_service();
        put(&mut service, "/log.txt", b"line");

        let mut download = service.download("/log.txt").unwrap();
        assert_eq!(download.size, 4);
        assert_eq!(download.content_type, OCTET_STREAM);
        let mut text = String::new();
        download.reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "line");

        let missing = service.download("/nope").unwrap_err();
        assert_eq!(missing.status_code, 404);
        assert_eq!(body(&missing)["status"], "nok1");
        assert_eq!(service.download("/../x").unwrap_err().status_code, 400);
    }

    #[test]
    fn test_delete() {
        let mut service = new_service();
        put(&mut service, "/d/f.txt", b"1");

        assert_eq!(service.delete("/missing").status_code, 404);
        let refused = service.delete("/d");
        assert_eq!(refused.status_code, 500);
        assert_eq!(body(&refused)["status"], "nok1");
        assert_eq!(service.delete("/d/f.txt").status_code, 200);
        assert!(!service.store().exists("/d/f.txt"));
        assert_eq!(service.delete("/").status_code, 400);
    }

    #[test]
    fn test_add_directory() {
        let mut service = new_service();
        assert_eq!(service.add_directory(None).status_code, 400);
        assert_eq!(body(&service.add_directory(Some(b"{nope"))), serde_json::json!({
            "status": "nok2",
            "error": "Failed to deserializeJson the request data"
        }));

        let ok = service.add_directory(Some(br#"{"parentPath":"/","dirName":"logs"}"#));
        assert_eq!(ok.status_code, 200);
        assert!(service.store().is_dir("/logs"));

        let again = service.add_directory(Some(br#"{"parentPath":"/","dirName":"logs"}"#));
        assert_eq!(body(&again)["status"], "nok3");

        let missing_parent = service.add_directory(Some(br#"{"parentPath":"/x/y","dirName":"z"}"#));
        assert_eq!(missing_parent.status_code, 500);
        let traversal = service.add_directory(Some(br#"{"parentPath":"/","dirName":".."}"#));
        assert_eq!(traversal.status_code, 400);
    }

    #[test]
    fn test_config_round_trip() {
        let mut service = new_service();
        assert_eq!(service.config_read().body, "{}");
        assert_eq!(service.config_save(None).status_code, 400);
        assert_eq!(service.config_save(Some(b"[1]")).status_code, 500);

        let saved = service.config_save(Some(br#"{"wifi":{"ssid":"home"}}"#));
        assert_eq!(saved.status_code, 200);
        assert_eq!(body(&service.config_read())["wifi"]["ssid"], "home");

        let mut reloaded = new_service();
        let stored = service.store().contents("/config.json").unwrap();
        put(&mut reloaded, "/config.json", &stored);
        assert!(reloaded.load_config());
        assert_eq!(reloaded.config().get_str("wifi.ssid", ""), "home");
    }

    #[test]
    fn test_config_save_failure_keeps_document() {
        let mut service = new_service();
        service.store().set_read_only(true);
        let response = service.config_save(Some(br#"{"a":1}"#));
        assert_eq!(body(&response)["status"], "nok3");
        assert_eq!(service.config().get_i64("a", 0), 0);
    }

    #[test]
    fn test_static_assets() {
        let mut service = new_service();
        put(&mut service, "/public_html/index.html", b"<html>");
        put(&mut service, "/public_html/css/site.css", b"body{}");

        let index = service.static_asset("/").unwrap();
        assert_eq!(index.content_type, "text/html");
        assert_eq!(index.size, 6);
        assert_eq!(service.static_asset("/css/site.css?v=1").unwrap().content_type, "text/css");

        let missing = service.static_asset("/missing.js").unwrap_err();
        assert_eq!(missing.status_code, 404);
        assert_eq!(missing.body, "File Not Found");
        assert!(service.static_asset("/../config.json").is_err());
    }
}
