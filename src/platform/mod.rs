//! ESP-IDF implementations of the `ota-core` platform seams.

pub mod flash;
pub mod restart;
pub mod storage;

pub use flash::EspPartition;
pub use restart::EspRestart;
