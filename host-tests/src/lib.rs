//! Host-based end-to-end tests for the upload and file management service.
//! These run on the development machine against the in-memory partition and
//! file store, driving requests the way the HTTP handlers do.

use ota_core::{MemoryPartition, MemoryStore, OtaService, RecordingRestart, Settings};
use std::sync::{Arc, Mutex};

pub type HostService = OtaService<MemoryPartition, MemoryStore, RecordingRestart>;

/// Update slot used by the tests: 64 KiB usable after the header sector.
pub const SLOT_SIZE: u32 = 0x11000;

/// A service wired to in-memory platform pieces, plus a log of every
/// progress step it reports.
pub fn host_service() -> (HostService, Arc<Mutex<Vec<i32>>>) {
    let steps = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&steps);
    let mut service = OtaService::new(
        MemoryPartition::new(SLOT_SIZE),
        MemoryStore::new(256 * 1024),
        RecordingRestart::default(),
        Settings::default(),
    );
    service
        .progress_mut()
        .subscribe(move |step| sink.lock().unwrap_or_else(|p| p.into_inner()).push(step));
    (service, steps)
}

/// A bootable image of `len` bytes.
pub fn firmware_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if let Some(first) = image.first_mut() {
        *first = ota_core::flash::IMAGE_MAGIC;
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::{
        ChunkEvent, DirectoryCatalog, FileStore, ProgressReporter, SessionState, UploadOutcome, UploadSession,
        UploadTarget,
    };
    use proptest::prelude::*;
    use std::io::Read;

    fn json(body: &str) -> serde_json::Value {
        serde_json::from_str(body).unwrap()
    }

    fn steps_of(steps: &Arc<Mutex<Vec<i32>>>) -> Vec<i32> {
        steps.lock().unwrap().clone()
    }

    #[test]
    fn firmware_upload_in_chunks_commits_and_restarts_once() {
        let (mut service, steps) = host_service();
        let mut session = UploadSession::new();
        let image = firmware_image(20_000);

        let start = ChunkEvent::start("app.bin", image.len() as u64);
        assert_eq!(service.firmware_chunk(&mut session, &start), UploadOutcome::Continue);
        for chunk in image.chunks(4096) {
            assert_eq!(service.firmware_chunk(&mut session, &ChunkEvent::write(chunk)), UploadOutcome::Continue);
        }
        let response = service
            .firmware_chunk(&mut session, &ChunkEvent::end())
            .response()
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(service.restart().count(), 1);
        assert_eq!(service.flash().partition().boot_image(), Some(image.as_slice()));
        assert!(!steps_of(&steps).contains(&-3));
    }

    #[test]
    fn oversized_firmware_is_refused_before_anything_is_written() {
        let (mut service, steps) = host_service();
        let mut session = UploadSession::new();

        let response = service
            .firmware_chunk(&mut session, &ChunkEvent::start("huge.bin", 1 << 20))
            .response()
            .unwrap();

        assert_eq!(response.status_code, 500);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!service.flash().partition().is_reserved());
        assert_eq!(steps_of(&steps).iter().filter(|&&s| s == -3).count(), 1);
        assert_eq!(service.restart().count(), 0);
    }

    #[test]
    fn invalid_image_keeps_previous_boot_image() {
        let (mut service, _) = host_service();
        let mut session = UploadSession::new();
        let good = firmware_image(1000);
        let mut body = good.as_slice();
        let first = service.stream_upload(&mut session, UploadTarget::Firmware, 1000, |buf| body.read(buf));
        assert!(first.is_success());

        let bad = vec![0u8; 1000];
        let mut body = bad.as_slice();
        let second = service.stream_upload(&mut session, UploadTarget::Firmware, 1000, |buf| body.read(buf));

        assert!(!second.is_success());
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(service.flash().partition().boot_image(), Some(good.as_slice()));
        assert_eq!(service.restart().count(), 1);
    }

    #[test]
    fn aborted_file_upload_leaves_nothing_behind() {
        let (mut service, steps) = host_service();
        let mut session = UploadSession::new();

        service.file_chunk(&mut session, "", &ChunkEvent::start("notes.txt", 0));
        service.file_chunk(&mut session, "", &ChunkEvent::write(b"partial"));
        service.file_chunk(&mut session, "", &ChunkEvent::aborted());

        assert_eq!(session.state(), SessionState::Aborted);
        assert!(!session.has_open_sink());
        assert!(!service.store().exists("/notes.txt"));
        assert_eq!(steps_of(&steps).last(), Some(&-1));
    }

    #[test]
    fn second_start_supersedes_the_first_upload() {
        let (mut service, _) = host_service();
        let mut session = UploadSession::new();

        service.file_chunk(&mut session, "/", &ChunkEvent::start("first.txt", 0));
        service.file_chunk(&mut session, "/", &ChunkEvent::write(b"one"));
        service.file_chunk(&mut session, "/", &ChunkEvent::start("second.txt", 0));
        service.file_chunk(&mut session, "/", &ChunkEvent::write(b"two"));
        let response = service
            .file_chunk(&mut session, "/", &ChunkEvent::end())
            .response()
            .unwrap();

        assert_eq!(response.status_code, 200);
        assert!(!service.store().exists("/first.txt"));
        assert_eq!(service.store().contents("/second.txt").as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn file_upload_supersedes_unfinished_firmware_upload() {
        let (mut service, steps) = host_service();
        let mut session = UploadSession::new();
        let image = firmware_image(8192);

        service.firmware_chunk(&mut session, &ChunkEvent::start("app.bin", 0));
        service.firmware_chunk(&mut session, &ChunkEvent::write(&image[..4096]));
        assert!(service.flash().is_active());

        service.file_chunk(&mut session, "/", &ChunkEvent::start("notes.txt", 0));
        assert!(!service.flash().is_active());
        assert!(!service.flash().partition().is_reserved());
        assert_eq!(service.flash().partition().boot_image(), None);

        service.file_chunk(&mut session, "/", &ChunkEvent::write(b"kept"));
        let response = service
            .file_chunk(&mut session, "/", &ChunkEvent::end())
            .response()
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(service.restart().count(), 0);
        assert!(!steps_of(&steps).contains(&-3));
    }

    #[test]
    fn restarted_firmware_upload_commits_only_the_second_image() {
        let (mut service, _) = host_service();
        let mut session = UploadSession::new();
        let stale = firmware_image(6000);
        let mut fresh: Vec<u8> = firmware_image(3000).into_iter().map(|b| b ^ 0x0F).collect();
        fresh[0] = ota_core::flash::IMAGE_MAGIC;

        service.firmware_chunk(&mut session, &ChunkEvent::start("old.bin", 0));
        service.firmware_chunk(&mut session, &ChunkEvent::write(&stale));
        service.firmware_chunk(&mut session, &ChunkEvent::start("new.bin", fresh.len() as u64));
        assert_eq!(service.flash().region().map(|r| r.written_size), Some(0));

        service.firmware_chunk(&mut session, &ChunkEvent::write(&fresh));
        let response = service
            .firmware_chunk(&mut session, &ChunkEvent::end())
            .response()
            .unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(service.flash().partition().boot_image(), Some(fresh.as_slice()));
        assert_eq!(service.restart().count(), 1);
    }

    #[test]
    fn finished_session_ignores_late_end_and_abort() {
        let (mut service, steps) = host_service();
        let mut session = UploadSession::new();
        let image = firmware_image(1024);

        service.firmware_chunk(&mut session, &ChunkEvent::start("app.bin", 1024));
        service.firmware_chunk(&mut session, &ChunkEvent::write(&image));
        service.firmware_chunk(&mut session, &ChunkEvent::end());
        let recorded = steps_of(&steps);

        let late_end = service.firmware_chunk(&mut session, &ChunkEvent::end()).response().unwrap();
        let late_abort = service.firmware_chunk(&mut session, &ChunkEvent::aborted()).response().unwrap();

        assert_eq!(late_end.status_code, 409);
        assert_eq!(late_abort.status_code, 409);
        assert_eq!(session.state(), SessionState::Completed);
        assert_eq!(steps_of(&steps), recorded);
        assert_eq!(service.restart().count(), 1);
        assert_eq!(service.flash().partition().boot_image(), Some(image.as_slice()));
    }

    #[test]
    fn uploaded_file_shows_up_in_listing_and_downloads_back() {
        let (mut service, _) = host_service();
        let mut session = UploadSession::new();
        let mkdir = service.add_directory(Some(br#"{"parentPath": "/", "dirName": "logs"}"#));
        assert!(mkdir.is_success());

        let payload = b"boot ok\n".repeat(100);
        let mut body = payload.as_slice();
        let target = ota_core::service::file_target("/logs", "boot.log").unwrap();
        let response = service.stream_upload(&mut session, target, payload.len() as u64, |buf| body.read(buf));
        assert!(response.is_success());

        let listing = json(&service.files().body);
        let files = listing["files"].as_array().unwrap();
        assert_eq!(files[0]["name"], "/logs");
        assert_eq!(files[0]["type"], "directory");
        assert_eq!(files[1]["name"], "/logs/boot.log");
        assert_eq!(files[1]["size"], payload.len() as u64);
        assert_eq!(json(&service.directories().body), serde_json::json!(["/logs"]));

        let mut download = service.download("/logs/boot.log").unwrap();
        let mut restored = Vec::new();
        download.reader.read_to_end(&mut restored).unwrap();
        assert_eq!(download.size, payload.len() as u64);
        assert_eq!(restored, payload);

        assert!(service.delete("/logs/boot.log").is_success());
        assert!(service.delete("/logs").is_success());
        assert_eq!(json(&service.files().body)["files"], serde_json::json!([]));
    }

    #[test]
    fn listing_is_depth_first() {
        let (mut service, _) = host_service();
        let store = service.store_mut();
        assert!(store.mkdir("/a"));
        let mut writer = store.create("/a/b.txt").unwrap();
        ota_core::store::FileSink::write(&mut writer, &[7; 10]).unwrap();
        ota_core::store::FileSink::close(writer).unwrap();
        assert!(store.mkdir("/a/c"));

        let entries = DirectoryCatalog::new(service.store()).list("/").unwrap();
        let summary: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.size)).collect();
        assert_eq!(summary, vec![("/a", 0), ("/a/b.txt", 10), ("/a/c", 0)]);
    }

    #[test]
    fn config_saved_over_http_is_read_back() {
        let (mut service, _) = host_service();
        let saved = service.config_save(Some(br#"{"hostname": "bench-7", "ota": {"chunk_size": 2048}}"#));
        assert!(saved.is_success());

        let read = json(&service.config_read().body);
        assert_eq!(read["hostname"], "bench-7");

        let mut reloaded = ota_core::ConfigDocument::new("config");
        reloaded.load(service.store()).unwrap();
        assert_eq!(Settings::from_document(&reloaded).chunk_buffer_size, 2048);
    }

    #[test]
    fn reboot_endpoint_schedules_restart() {
        let (mut service, _) = host_service();
        assert!(service.reboot().is_success());
        assert_eq!(service.restart().count(), 1);
    }

    #[test]
    fn observers_run_in_registration_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut reporter = ProgressReporter::new();
        for id in 0..5 {
            let seen = Arc::clone(&seen);
            reporter.subscribe(move |step| seen.lock().unwrap().push((id, step)));
        }
        reporter.report(7).unwrap();
        assert_eq!(*seen.lock().unwrap(), (0..5).map(|id| (id, 7)).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn any_image_that_fits_completes(len in 1usize..=0x10000, chunk in 1usize..=4096) {
            let (mut service, _) = host_service();
            let mut session = UploadSession::new();
            let image = firmware_image(len);
            let mut chunks = image.chunks(chunk);

            let response = service.stream_upload(&mut session, UploadTarget::Firmware, len as u64, |buf| {
                match chunks.next() {
                    Some(c) => {
                        buf[..c.len()].copy_from_slice(c);
                        Ok::<usize, String>(c.len())
                    }
                    None => Ok(0),
                }
            });

            prop_assert!(response.is_success());
            prop_assert_eq!(session.state(), SessionState::Completed);
            prop_assert_eq!(service.restart().count(), 1);
        }

        #[test]
        fn usage_always_balances(sizes in proptest::collection::vec(0usize..4096, 0..20)) {
            let (mut service, _) = host_service();
            for (i, size) in sizes.iter().enumerate() {
                let mut writer = service.store_mut().create(&format!("/f{i}")).unwrap();
                ota_core::store::FileSink::write(&mut writer, &vec![1; *size]).unwrap();
                ota_core::store::FileSink::close(writer).unwrap();
            }
            let usage = DirectoryCatalog::new(service.store()).usage();
            prop_assert_eq!(usage.used_bytes + usage.free_bytes, usage.total_bytes);
        }
    }
}
