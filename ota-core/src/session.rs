//! Upload transaction state machine.
//!
//! One session receives the chunk events of one upload (Start, Write*, End or
//! Aborted) and routes the bytes either into the firmware update slot or into
//! a file. The session owns the open sink and releases it on every terminal
//! transition.
//!
//! Progress observer failures never change the outcome of an upload. The
//! first one of each transaction is kept on the session and handed out by
//! [`UploadSession::take_progress_error`].

use std::time::Duration;

use crate::api::ApiResponse;
use crate::error::UploadError;
use crate::flash::{FlashWriter, UpdatePartition};
use crate::progress::{code, ProgressError, ProgressReporter};
use crate::restart::Restart;
use crate::store::{FileSink, FileStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    Firmware,
    File(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Receiving,
    Committing,
    Completed,
    Aborted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted | SessionState::Failed)
    }
}

/// What the dispatcher should do after delivering an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Keep feeding chunks; nothing to send yet.
    Continue,
    /// The transaction is over (or never started); send this response.
    Respond(ApiResponse),
}

impl UploadOutcome {
    pub fn response(self) -> Option<ApiResponse> {
        match self {
            UploadOutcome::Continue => None,
            UploadOutcome::Respond(response) => Some(response),
        }
    }
}

/// Everything a session drives while handling one event.
pub struct UploadContext<'a, P, S, R> {
    pub flash: &'a mut FlashWriter<P>,
    pub store: &'a mut S,
    pub progress: &'a mut ProgressReporter,
    pub restart: &'a mut R,
    pub restart_delay: Duration,
}

enum Sink<W> {
    Firmware,
    File { path: String, writer: W },
}

pub struct UploadSession<W> {
    target: Option<UploadTarget>,
    state: SessionState,
    bytes_written: u64,
    sink: Option<Sink<W>>,
    progress_error: Option<ProgressError>,
}

impl<W> Default for UploadSession<W> {
    fn default() -> Self {
        Self {
            target: None,
            state: SessionState::Idle,
            bytes_written: 0,
            sink: None,
            progress_error: None,
        }
    }
}

impl<W> std::fmt::Debug for UploadSession<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSession")
            .field("target", &self.target)
            .field("state", &self.state)
            .field("bytes_written", &self.bytes_written)
            .field("sink_open", &self.sink.is_some())
            .finish()
    }
}

impl<W: FileSink> UploadSession<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn target(&self) -> Option<&UploadTarget> {
        self.target.as_ref()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether a sink (flash region or file handle) is currently held.
    pub fn has_open_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// First observer failure since the current transaction started.
    pub fn take_progress_error(&mut self) -> Option<ProgressError> {
        self.progress_error.take()
    }

    fn report<P, S, R>(&mut self, ctx: &mut UploadContext<'_, P, S, R>, steps: &[i32]) {
        for &step in steps {
            if let Err(e) = ctx.progress.report(step) {
                log::warn!("{e}");
                self.progress_error.get_or_insert(e);
            }
        }
    }

    /// End or Abort with nothing open after the transaction already finished:
    /// answered, but the finished transaction is left as it was.
    fn reject_finished(&self, event: &str) -> UploadOutcome {
        log::warn!("{} ignored: no upload in progress (last one {:?})", event, self.state);
        UploadOutcome::Respond(ApiResponse::error(
            409,
            "nok1",
            format!("No upload in progress ({:?})", self.state),
        ))
    }

    /// Begin a new transaction. A session that is still receiving is
    /// superseded: its sink is released exactly as on Abort, without
    /// producing a response for it.
    pub fn start<P, S, R>(
        &mut self,
        target: UploadTarget,
        size: u64,
        ctx: &mut UploadContext<'_, P, S, R>,
    ) -> UploadOutcome
    where
        P: UpdatePartition,
        S: FileStore<Writer = W>,
        R: Restart,
    {
        self.progress_error = None;
        self.report(ctx, &[code::STARTED]);

        if self.sink.is_some() {
            log::warn!(
                "New upload {:?} supersedes unfinished {:?} after {} bytes",
                target,
                self.target,
                self.bytes_written
            );
            self.release(ctx);
        }

        self.target = Some(target.clone());
        self.bytes_written = 0;

        let opened = match &target {
            UploadTarget::Firmware => {
                log::info!("Start firmware update ({} bytes announced)", size);
                ctx.flash.begin(size).map(|_| Sink::Firmware)
            }
            UploadTarget::File(path) => {
                log::info!("Start file upload: {}", path);
                ctx.store
                    .create(path)
                    .map(|writer| Sink::File {
                        path: path.clone(),
                        writer,
                    })
                    .map_err(UploadError::from)
            }
        };

        match opened {
            Ok(sink) => {
                self.sink = Some(sink);
                self.state = SessionState::Receiving;
                self.report(ctx, &[code::PROGRESS]);
                UploadOutcome::Continue
            }
            Err(e) => {
                let message = match target {
                    UploadTarget::Firmware => "Firmware update failed to start",
                    UploadTarget::File(_) => "Failed to open file for writing",
                };
                log::error!("{}: {}", message, e);
                // The session never began: nothing is held, back to Idle.
                self.state = SessionState::Idle;
                self.target = None;
                self.report(ctx, &[code::PROGRESS, code::FATAL_ABORT]);
                UploadOutcome::Respond(ApiResponse::error(
                    e.status_code(),
                    "nok1",
                    format!("{message}: {e}"),
                ))
            }
        }
    }

    /// Append a chunk. Short or failed writes are logged but do not end the
    /// session, and the step reported is always a progress tick.
    pub fn write<P, S, R>(&mut self, buf: &[u8], ctx: &mut UploadContext<'_, P, S, R>) -> UploadOutcome
    where
        P: UpdatePartition,
        S: FileStore<Writer = W>,
        R: Restart,
    {
        self.report(ctx, &[code::STARTED]);

        let written = match self.sink.as_mut() {
            Some(Sink::Firmware) => ctx.flash.write(buf),
            Some(Sink::File { writer, .. }) => writer.write(buf).map_err(UploadError::from),
            None => {
                log::warn!("Dropping {} bytes: no upload in progress", buf.len());
                Ok(0)
            }
        };

        match written {
            Ok(n) => {
                self.bytes_written += n as u64;
                if n != buf.len() && self.sink.is_some() {
                    log::error!(
                        "Short write: {} of {} bytes stored ({} total)",
                        n,
                        buf.len(),
                        self.bytes_written
                    );
                }
            }
            Err(e) => log::error!("Write failed after {} bytes: {}", self.bytes_written, e),
        }

        self.report(ctx, &[code::PROGRESS]);
        UploadOutcome::Continue
    }

    /// Commit the sink. A firmware commit validates the image, marks it
    /// bootable and schedules a restart.
    pub fn end<P, S, R>(&mut self, ctx: &mut UploadContext<'_, P, S, R>) -> UploadOutcome
    where
        P: UpdatePartition,
        S: FileStore<Writer = W>,
        R: Restart,
    {
        if self.sink.is_none() && self.state.is_terminal() {
            return self.reject_finished("End");
        }
        self.report(ctx, &[code::STARTED]);

        let Some(sink) = self.sink.take() else {
            log::error!("Upload end without an open sink");
            self.state = SessionState::Failed;
            self.report(ctx, &[code::STORE_WRITE_FAILED]);
            return UploadOutcome::Respond(ApiResponse::error(500, "nok2", "Failed to save file."));
        };
        self.state = SessionState::Committing;

        match sink {
            Sink::Firmware => match ctx.flash.end(true) {
                Ok(summary) => {
                    self.state = SessionState::Completed;
                    self.report(ctx, &[code::PROGRESS]);
                    log::info!("Firmware update successful. Rebooting...");
                    ctx.restart.schedule(ctx.restart_delay);
                    UploadOutcome::Respond(ApiResponse::json(
                        200,
                        &serde_json::json!({
                            "status": "ok",
                            "message": "Firmware updated successfully. Rebooting...",
                            "size": summary.size,
                            "sha256": summary.sha256,
                        }),
                    ))
                }
                Err(e) => {
                    self.state = SessionState::Failed;
                    log::error!("Firmware update failed: {}", e);
                    self.report(ctx, &[code::FATAL_ABORT]);
                    UploadOutcome::Respond(ApiResponse::error(
                        500,
                        "nok2",
                        format!("Firmware update failed: {e}"),
                    ))
                }
            },
            Sink::File { path, writer } => match writer.close() {
                Ok(size) => {
                    self.state = SessionState::Completed;
                    self.report(ctx, &[code::PROGRESS]);
                    log::info!("File upload successful: {} ({} bytes)", path, size);
                    UploadOutcome::Respond(ApiResponse::ok("File uploaded successfully."))
                }
                Err(e) => {
                    self.state = SessionState::Failed;
                    log::error!("Failed to save file {}: {}", path, e);
                    self.report(ctx, &[code::FATAL_ABORT]);
                    UploadOutcome::Respond(ApiResponse::error(500, "nok2", "Failed to save file."))
                }
            },
        }
    }

    /// Cancel the transaction. A partial file is deleted; a firmware region is
    /// released without touching the running image. Only a receiving session
    /// can be aborted.
    pub fn abort<P, S, R>(&mut self, ctx: &mut UploadContext<'_, P, S, R>) -> UploadOutcome
    where
        P: UpdatePartition,
        S: FileStore<Writer = W>,
        R: Restart,
    {
        if self.sink.is_none() {
            return self.reject_finished("Abort");
        }
        self.report(ctx, &[code::STARTED]);

        let firmware = matches!(self.sink, Some(Sink::Firmware));
        self.release(ctx);
        self.state = SessionState::Aborted;

        if firmware {
            log::warn!("Firmware update aborted");
            self.report(ctx, &[code::PROGRESS, code::FATAL_ABORT]);
            UploadOutcome::Respond(ApiResponse::error(500, "nok3", "Firmware update aborted."))
        } else {
            log::warn!("File upload aborted");
            self.report(ctx, &[code::PROGRESS, code::FAILURE]);
            UploadOutcome::Respond(ApiResponse::error(500, "nok3", "File upload aborted."))
        }
    }

    /// Release whatever sink is held, discarding partial data. Safe to call
    /// in any state.
    pub fn release<P, S, R>(&mut self, ctx: &mut UploadContext<'_, P, S, R>)
    where
        P: UpdatePartition,
        S: FileStore<Writer = W>,
    {
        match self.sink.take() {
            Some(Sink::Firmware) => ctx.flash.abort(),
            Some(Sink::File { path, writer }) => {
                if let Err(e) = writer.close() {
                    log::warn!("Closing {} before removal failed: {}", path, e);
                }
                if !ctx.store.remove(&path) {
                    log::warn!("Could not remove partial upload {}", path);
                }
            }
            None => {}
        }
    }
}
