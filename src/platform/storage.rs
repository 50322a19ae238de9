// FAT filesystem on the `storage` data partition, mounted through the VFS

use anyhow::{Context, Result};
use esp_idf_sys::{esp, esp_vfs_fat_info, esp_vfs_fat_mount_config_t, esp_vfs_fat_spiflash_mount_rw_wl, wl_handle_t};
use std::ffi::CString;

use ota_core::{DirStore, UsageStats};

pub const MOUNT_POINT: &str = "/storage";
pub const PARTITION_LABEL: &str = "storage";

/// Mount the storage partition (formatting it on first boot) and return a
/// file store rooted at the mount point.
pub fn mount() -> Result<DirStore> {
    let base = CString::new(MOUNT_POINT)?;
    let label = CString::new(PARTITION_LABEL)?;
    let config = esp_vfs_fat_mount_config_t {
        format_if_mount_failed: true,
        max_files: 8,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: wl_handle_t = Default::default();

    esp!(unsafe { esp_vfs_fat_spiflash_mount_rw_wl(base.as_ptr(), label.as_ptr(), &config, &mut handle) })
        .with_context(|| format!("Failed to mount '{PARTITION_LABEL}' at {MOUNT_POINT}"))?;

    let usage = query_usage()?;
    log::info!(
        "Storage mounted at {}: {} KiB used of {} KiB",
        MOUNT_POINT,
        usage.used_bytes / 1024,
        usage.total_bytes / 1024
    );
    Ok(DirStore::with_usage(MOUNT_POINT, query_usage))
}

fn query_usage() -> Result<UsageStats> {
    let base = CString::new(MOUNT_POINT)?;
    let mut total: u64 = 0;
    let mut free: u64 = 0;
    esp!(unsafe { esp_vfs_fat_info(base.as_ptr(), &mut total, &mut free) }).context("esp_vfs_fat_info failed")?;
    Ok(UsageStats::from_total_used(total, total.saturating_sub(free)))
}
