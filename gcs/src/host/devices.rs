//! Host character/block device enumeration used by the LCOW-privileged
//! merge step of Create. Reads the kernel's flat device namespace
//! under `/sys/dev`, the same sysfs surface `host::mounts` uses for
//! SCSI topology.

use std::path::Path;

use crate::container::spec::HostDevice;

pub fn enumerate_host_devices() -> Vec<HostDevice> {
    let mut devices = Vec::new();
    for (dir, kind) in [("/sys/dev/char", "c"), ("/sys/dev/block", "b")] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some((major, minor)) = name.split_once(':') else {
                continue;
            };
            let (Ok(major), Ok(minor)) = (major.parse::<i64>(), minor.parse::<i64>()) else {
                continue;
            };
            if major == 0 && minor == 0 {
                continue;
            }
            if let Some(devname) = read_devname(&entry.path()) {
                devices.push(HostDevice {
                    path: format!("/dev/{devname}"),
                    device_type: kind.to_string(),
                    major,
                    minor,
                });
            }
        }
    }
    devices
}

fn read_devname(sysfs_entry: &Path) -> Option<String> {
    let uevent = std::fs::read_to_string(sysfs_entry.join("uevent")).ok()?;
    uevent
        .lines()
        .find_map(|line| line.strip_prefix("DEVNAME=").map(|s| s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_devname_parses_uevent_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("uevent"), "MAJOR=1\nMINOR=3\nDEVNAME=null\n").unwrap();
        assert_eq!(read_devname(dir.path()).as_deref(), Some("null"));
    }

    #[test]
    fn read_devname_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_devname(dir.path()), None);
    }
}
