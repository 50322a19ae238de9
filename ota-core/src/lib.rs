//! OTA Core - Hardware-independent upload and file management logic
//!
//! Everything here builds and tests on the host. The firmware crate plugs in
//! the real flash partition, filesystem and restart implementations through
//! the [`flash::UpdatePartition`], [`store::FileStore`] and
//! [`restart::Restart`] traits.

pub mod api;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod error;
pub mod flash;
pub mod mqtt;
pub mod path;
pub mod progress;
pub mod restart;
pub mod service;
pub mod session;
pub mod store;

pub use api::ApiResponse;
pub use broadcast::{Broadcaster, FrameSender};
pub use catalog::{DirectoryCatalog, FileEntry, Listing};
pub use config::{ConfigDocument, Settings};
pub use error::{StoreError, UploadError};
pub use flash::{FlashWriter, MemoryPartition, UpdatePartition};
pub use mqtt::{MqttPublisher, MqttSettings, MqttTransport};
pub use progress::{code, ProgressError, ProgressReporter};
pub use restart::{RecordingRestart, Restart};
pub use service::{ChunkEvent, Download, OtaService, UploadStatus};
pub use session::{SessionState, UploadOutcome, UploadSession, UploadTarget};
pub use store::{DirStore, FileStore, MemoryStore, UsageStats};
