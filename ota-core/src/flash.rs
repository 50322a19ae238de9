//! Firmware image writer on top of the platform's OTA update primitive.
//!
//! Update flow:
//! 1. Reserve a sector-aligned region in the inactive slot
//! 2. Stream image bytes into it
//! 3. Validate the image
//! 4. Mark it bootable for the next restart

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::error::UploadError;

/// Bytes kept back from the free update space for the image header.
pub const HEADER_RESERVE: u32 = 0x1000;

/// First byte of every valid ESP application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Raw flash-update primitive provided by the platform.
pub trait UpdatePartition {
    /// Space available for a new image, in bytes.
    fn free_space(&self) -> u32;

    /// Erase granularity of the flash medium.
    fn sector_size(&self) -> u32;

    /// Erase and reserve `size` bytes for a new image.
    fn begin(&mut self, size: u32) -> Result<()>;

    /// Write `data` at `offset` within the reserved region. Returns the number
    /// of bytes the medium accepted.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<usize>;

    /// Close the image of `len` bytes and validate it.
    fn finalize(&mut self, len: u32) -> Result<()>;

    /// Make the finalized image the one booted next.
    fn activate(&mut self) -> Result<()>;

    /// Release the reserved region. The running image is never touched.
    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    pub reserved_size: u32,
    pub written_size: u32,
}

impl FlashRegion {
    pub fn remaining(&self) -> u32 {
        self.reserved_size - self.written_size
    }
}

/// Summary of a committed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSummary {
    pub size: u32,
    pub sha256: String,
    pub activated: bool,
}

/// Reserved size for a given free space: free space minus the header,
/// rounded down to whole sectors.
pub fn reservable_size(free_space: u32, sector_size: u32) -> u32 {
    let usable = free_space.saturating_sub(HEADER_RESERVE);
    if sector_size == 0 {
        return usable;
    }
    usable - usable % sector_size
}

pub struct FlashWriter<P> {
    partition: P,
    region: Option<FlashRegion>,
    digest: Sha256,
}

impl<P: UpdatePartition> FlashWriter<P> {
    pub fn new(partition: P) -> Self {
        Self {
            partition,
            region: None,
            digest: Sha256::new(),
        }
    }

    pub fn partition(&self) -> &P {
        &self.partition
    }

    pub fn partition_mut(&mut self) -> &mut P {
        &mut self.partition
    }

    pub fn region(&self) -> Option<FlashRegion> {
        self.region
    }

    pub fn is_active(&self) -> bool {
        self.region.is_some()
    }

    /// Capacity a new update may use right now.
    pub fn capacity(&self) -> u32 {
        reservable_size(self.partition.free_space(), self.partition.sector_size())
    }

    /// Reserve the update region. `requested_size == 0` means the size is not
    /// known up front and the whole region is reserved.
    pub fn begin(&mut self, requested_size: u64) -> Result<u32, UploadError> {
        if self.region.is_some() {
            return Err(UploadError::AlreadyInProgress);
        }

        let reserved = self.capacity();
        if requested_size > u64::from(reserved) {
            return Err(UploadError::InsufficientSpace {
                requested: requested_size,
                available: reserved,
            });
        }
        if reserved == 0 {
            return Err(UploadError::InsufficientSpace {
                requested: requested_size,
                available: 0,
            });
        }

        self.partition
            .begin(reserved)
            .map_err(|e| UploadError::OpenFailure(format!("{e:#}")))?;

        log::info!(
            "Reserved {} bytes for firmware image (requested {})",
            reserved,
            requested_size
        );
        self.region = Some(FlashRegion {
            reserved_size: reserved,
            written_size: 0,
        });
        self.digest = Sha256::new();
        Ok(reserved)
    }

    /// Append `bytes` to the image. Returns how many bytes were written;
    /// callers treat anything short of `bytes.len()` as a hard error.
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, UploadError> {
        let region = self.region.as_mut().ok_or(UploadError::WriteShortCount {
            expected: bytes.len(),
            written: 0,
        })?;

        let take = bytes.len().min(region.remaining() as usize);
        if take == 0 {
            return if bytes.is_empty() {
                Ok(0)
            } else {
                Err(UploadError::WriteShortCount {
                    expected: bytes.len(),
                    written: 0,
                })
            };
        }

        let written = self
            .partition
            .write(region.written_size, &bytes[..take])
            .map_err(|e| {
                log::error!("Flash write failed at offset {}: {:#}", region.written_size, e);
                UploadError::WriteShortCount {
                    expected: bytes.len(),
                    written: 0,
                }
            })?
            .min(take);

        self.digest.update(&bytes[..written]);
        region.written_size += written as u32;
        Ok(written)
    }

    /// Finalize the image. With `verify` set, the image is validated and,
    /// only if validation passes, marked bootable. Without it the image is
    /// closed but the running image stays the boot image.
    pub fn end(&mut self, verify: bool) -> Result<ImageSummary, UploadError> {
        let region = self
            .region
            .take()
            .ok_or_else(|| UploadError::ValidationFailure("no update in progress".into()))?;
        let digest = std::mem::replace(&mut self.digest, Sha256::new());

        if region.written_size == 0 {
            self.partition.abort();
            return Err(UploadError::ValidationFailure("empty image".into()));
        }

        if let Err(e) = self.partition.finalize(region.written_size) {
            self.partition.abort();
            return Err(UploadError::ValidationFailure(format!("{e:#}")));
        }

        let activated = if verify {
            self.partition
                .activate()
                .map_err(|e| UploadError::ValidationFailure(format!("{e:#}")))?;
            true
        } else {
            false
        };

        let summary = ImageSummary {
            size: region.written_size,
            sha256: hex::encode(digest.finalize()),
            activated,
        };
        log::info!(
            "Firmware image committed: {} bytes, sha256 {}, bootable: {}",
            summary.size,
            summary.sha256,
            summary.activated
        );
        Ok(summary)
    }

    /// Release the reserved region without committing anything.
    pub fn abort(&mut self) {
        if let Some(region) = self.region.take() {
            log::warn!(
                "Aborting firmware update after {} of {} bytes",
                region.written_size,
                region.reserved_size
            );
            self.partition.abort();
        }
        self.digest = Sha256::new();
    }
}

/// In-memory update slot used for host simulation and tests.
#[derive(Debug, Clone)]
pub struct MemoryPartition {
    pub slot_size: u32,
    pub sector_size: u32,
    /// Caps how many bytes a single `write` accepts.
    pub max_write: Option<usize>,
    pub fail_begin: bool,
    pub fail_activate: bool,
    staging: Option<Vec<u8>>,
    finalized: Option<Vec<u8>>,
    boot_image: Option<Vec<u8>>,
}

impl MemoryPartition {
    pub fn new(slot_size: u32) -> Self {
        Self {
            slot_size,
            sector_size: 0x1000,
            max_write: None,
            fail_begin: false,
            fail_activate: false,
            staging: None,
            finalized: None,
            boot_image: None,
        }
    }

    /// Image that will run after the next restart, if a new one was activated.
    pub fn boot_image(&self) -> Option<&[u8]> {
        self.boot_image.as_deref()
    }

    pub fn is_reserved(&self) -> bool {
        self.staging.is_some()
    }
}

impl UpdatePartition for MemoryPartition {
    fn free_space(&self) -> u32 {
        self.slot_size
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn begin(&mut self, size: u32) -> Result<()> {
        if self.fail_begin {
            bail!("erase failed");
        }
        if self.staging.is_some() {
            bail!("slot already reserved");
        }
        self.staging = Some(Vec::with_capacity(size as usize));
        self.finalized = None;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<usize> {
        let Some(staging) = self.staging.as_mut() else {
            bail!("slot not reserved");
        };
        if staging.len() != offset as usize {
            bail!("non-sequential write at {offset}");
        }
        let take = self.max_write.map_or(data.len(), |max| data.len().min(max));
        staging.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn finalize(&mut self, len: u32) -> Result<()> {
        let Some(staging) = self.staging.take() else {
            bail!("slot not reserved");
        };
        if staging.len() != len as usize {
            bail!("length mismatch: {} staged, {} expected", staging.len(), len);
        }
        if staging.first() != Some(&IMAGE_MAGIC) {
            bail!("invalid image magic");
        }
        self.finalized = Some(staging);
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        if self.fail_activate {
            bail!("set boot partition failed");
        }
        let Some(image) = self.finalized.take() else {
            bail!("no finalized image");
        };
        self.boot_image = Some(image);
        Ok(())
    }

    fn abort(&mut self) {
        self.staging = None;
        self.finalized = None;
    }
}
