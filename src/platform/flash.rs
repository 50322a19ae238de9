// Update partition backed by the ESP-IDF OTA API

use anyhow::{bail, Context, Result};
use core::ffi::c_void;
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_get_running_partition, esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write,
    esp_partition_t,
};
use std::ffi::CStr;

use ota_core::UpdatePartition;

/// Fallback erase size when the partition table entry reports none.
const SECTOR_SIZE: u32 = 0x1000;

pub struct EspPartition {
    partition: *const esp_partition_t,
    handle: Option<esp_ota_handle_t>,
    written: u32,
}

// The partition pointer refers to the static partition table.
unsafe impl Send for EspPartition {}

impl EspPartition {
    /// The OTA slot that is not currently running.
    pub fn next_update() -> Result<Self> {
        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            bail!("No OTA update partition in the partition table");
        }
        let this = Self {
            partition,
            handle: None,
            written: 0,
        };
        log::info!(
            "Update slot '{}' ({} KiB), running from '{}'",
            this.label(),
            this.free_space() / 1024,
            running_label()
        );
        Ok(this)
    }

    pub fn label(&self) -> String {
        partition_label(self.partition)
    }
}

fn partition_label(partition: *const esp_partition_t) -> String {
    if partition.is_null() {
        return "unknown".to_string();
    }
    unsafe { CStr::from_ptr((*partition).label.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn running_label() -> String {
    partition_label(unsafe { esp_ota_get_running_partition() })
}

impl UpdatePartition for EspPartition {
    fn free_space(&self) -> u32 {
        unsafe { (*self.partition).size }
    }

    fn sector_size(&self) -> u32 {
        match unsafe { (*self.partition).erase_size } {
            0 => SECTOR_SIZE,
            size => size,
        }
    }

    fn begin(&mut self, size: u32) -> Result<()> {
        if self.handle.is_some() {
            bail!("OTA handle already open");
        }
        let mut handle: esp_ota_handle_t = Default::default();
        esp!(unsafe { esp_ota_begin(self.partition, size as _, &mut handle) })
            .context("esp_ota_begin failed")?;
        self.handle = Some(handle);
        self.written = 0;
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<usize> {
        let Some(handle) = self.handle else {
            bail!("OTA handle not open");
        };
        if offset != self.written {
            bail!("Non-sequential OTA write at {} (expected {})", offset, self.written);
        }
        esp!(unsafe { esp_ota_write(handle, data.as_ptr() as *const c_void, data.len() as _) })
            .with_context(|| format!("esp_ota_write failed at offset {offset}"))?;
        self.written += data.len() as u32;
        Ok(data.len())
    }

    fn finalize(&mut self, len: u32) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            bail!("OTA handle not open");
        };
        if len != self.written {
            unsafe { esp_ota_abort(handle) };
            bail!("Image length mismatch: {} written, {} expected", self.written, len);
        }
        // esp_ota_end releases the handle and validates the image
        esp!(unsafe { esp_ota_end(handle) }).context("Image validation failed")?;
        Ok(())
    }

    fn activate(&mut self) -> Result<()> {
        esp!(unsafe { esp_ota_set_boot_partition(self.partition) })
            .context("esp_ota_set_boot_partition failed")?;
        log::info!("Boot partition set to '{}'", self.label());
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            let result = unsafe { esp_ota_abort(handle) };
            if result != esp_idf_sys::ESP_OK {
                log::warn!("esp_ota_abort returned {}", result);
            }
        }
        self.written = 0;
    }
}

impl Drop for EspPartition {
    fn drop(&mut self) {
        self.abort();
    }
}
