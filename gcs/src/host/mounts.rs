//! Mount-side-effect helpers for `ModifyHostSettings`.
//! Every mount syscall goes through [`nix::mount`], a level up from raw
//! `libc` calls since these are ordinary mounts, not a single ioctl.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gcs_shared::{GcsError, GcsResult};

#[cfg(target_os = "linux")]
use nix::mount::{mount, umount2, MntFlags, MsFlags};

const MOUNT_RETRY_ATTEMPTS: u32 = 5;
const MOUNT_RETRY_BACKOFF: Duration = Duration::from_millis(200);

/// Retries `attempt` with a bounded linear backoff.
pub async fn with_mount_retry<F>(op: &str, mut attempt: F) -> GcsResult<()>
where
    F: FnMut() -> GcsResult<()>,
{
    let mut last_err = None;
    for n in 0..MOUNT_RETRY_ATTEMPTS {
        match attempt() {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::warn!(op, attempt = n, error = %e, "mount attempt failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(MOUNT_RETRY_BACKOFF).await;
            }
        }
    }
    Err(last_err.expect("loop runs at least once"))
}

/// Resolves the `/dev/sdX` block device backing a (controller, LUN)
/// SCSI attachment by reading the kernel's SCSI topology
/// (`/sys/bus/scsi/devices/<controller>:0:0:<lun>/block`).
pub fn scsi_block_device(controller: u8, lun: u8) -> GcsResult<PathBuf> {
    let sysfs_entry = PathBuf::from(format!(
        "/sys/bus/scsi/devices/{controller}:0:0:{lun}/block"
    ));
    let mut entries = std::fs::read_dir(&sysfs_entry)
        .map_err(|e| GcsError::IoFailure(format!("scan {sysfs_entry:?}: {e}")))?;
    let first = entries
        .next()
        .ok_or_else(|| GcsError::NotFound(format!("no block device under {sysfs_entry:?}")))?
        .map_err(|e| GcsError::IoFailure(format!("read {sysfs_entry:?}: {e}")))?;
    Ok(PathBuf::from("/dev").join(first.file_name()))
}

#[cfg(target_os = "linux")]
pub fn mount_ext4(source: &Path, target: &Path, read_only: bool, extra_data: Option<&str>) -> GcsResult<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| GcsError::IoFailure(format!("mkdir {target:?}: {e}")))?;
    let mut flags = MsFlags::empty();
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    mount(
        Some(source),
        target,
        Some("ext4"),
        flags,
        extra_data,
    )
    .map_err(|e| GcsError::IoFailure(format!("mount {source:?} -> {target:?}: {e}")))
}

#[cfg(target_os = "linux")]
pub fn mount_9p(share_name: &str, port: u32, target: &Path, read_only: bool) -> GcsResult<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| GcsError::IoFailure(format!("mkdir {target:?}: {e}")))?;
    let mut flags = MsFlags::empty();
    if read_only {
        flags |= MsFlags::MS_RDONLY;
    }
    let data = format!("trans=virtio,version=9p2000.L,port={port}");
    mount(
        Some(share_name),
        target,
        Some("9p"),
        flags,
        Some(data.as_str()),
    )
    .map_err(|e| GcsError::IoFailure(format!("9p mount {share_name} -> {target:?}: {e}")))
}

#[cfg(target_os = "linux")]
pub fn mount_overlay(
    target: &Path,
    lower_layers: &[String],
    upper_and_work: Option<(&Path, &Path)>,
) -> GcsResult<()> {
    std::fs::create_dir_all(target)
        .map_err(|e| GcsError::IoFailure(format!("mkdir {target:?}: {e}")))?;
    let lower = lower_layers.join(":");
    let data = match upper_and_work {
        Some((upper, work)) => format!(
            "lowerdir={lower},upperdir={},workdir={}",
            upper.display(),
            work.display()
        ),
        None => format!("lowerdir={lower}"),
    };
    let flags = if upper_and_work.is_none() {
        MsFlags::MS_RDONLY
    } else {
        MsFlags::empty()
    };
    mount(
        Some("overlay"),
        target,
        Some("overlay"),
        flags,
        Some(data.as_str()),
    )
    .map_err(|e| GcsError::IoFailure(format!("overlay mount -> {target:?}: {e}")))
}

#[cfg(target_os = "linux")]
pub fn unmount(target: &Path) -> GcsResult<()> {
    umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| GcsError::IoFailure(format!("umount {target:?}: {e}")))
}

#[cfg(not(target_os = "linux"))]
pub fn mount_ext4(_source: &Path, _target: &Path, _read_only: bool, _extra_data: Option<&str>) -> GcsResult<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_9p(_share_name: &str, _port: u32, _target: &Path, _read_only: bool) -> GcsResult<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn mount_overlay(_target: &Path, _lower_layers: &[String], _upper_and_work: Option<(&Path, &Path)>) -> GcsResult<()> {
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn unmount(_target: &Path) -> GcsResult<()> {
    Ok(())
}

/// Unplugs a SCSI disk by its `<host>:0:<controller>:<lun>` address,
/// used when removing a mapped virtual disk.
pub fn scsi_delete(controller: u8, lun: u8) -> GcsResult<()> {
    let delete_path = format!(
        "/sys/bus/scsi/devices/{controller}:0:0:{lun}/delete"
    );
    std::fs::write(&delete_path, "1")
        .map_err(|e| gcs_shared::GcsError::IoFailure(format!("unplug scsi {controller}:{lun}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_mount_retry_succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = with_mount_retry("test", || {
            calls += 1;
            if calls < 3 {
                Err(gcs_shared::GcsError::IoFailure("device busy".into()))
            } else {
                Ok(())
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn with_mount_retry_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result = with_mount_retry("test", || {
            calls += 1;
            Err(gcs_shared::GcsError::IoFailure("nope".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, MOUNT_RETRY_ATTEMPTS);
    }
}
