//! OCI spec mutation and bundle writing for the Create pipeline.
//! The container spec stays an opaque [`OciSpec`] — only the handful
//! of fields the core is allowed to touch are read or mutated here.

use std::path::{Path, PathBuf};

use gcs_shared::protocol::OciSpec;
use gcs_shared::{GcsError, GcsResult};

/// DNS info recorded on a namespace, used to synthesize `resolv.conf`.
#[derive(Debug, Clone, Default)]
pub struct DnsConfig {
    pub dns_servers: Vec<String>,
    pub dns_suffix: String,
}

pub fn render_resolv_conf(dns: &DnsConfig) -> String {
    let mut out = String::new();
    for server in &dns.dns_servers {
        out.push_str("nameserver ");
        out.push_str(server);
        out.push('\n');
    }
    if !dns.dns_suffix.is_empty() {
        out.push_str("search ");
        out.push_str(&dns.dns_suffix);
        out.push('\n');
    }
    out
}

/// Writes the synthesized resolv.conf into a fresh temp directory and
/// returns its path.
pub fn write_resolv_conf(base_dir: &Path, content: &str) -> GcsResult<PathBuf> {
    std::fs::create_dir_all(base_dir)
        .map_err(|e| GcsError::IoFailure(format!("create resolv dir {base_dir:?}: {e}")))?;
    let path = base_dir.join("resolv.conf");
    std::fs::write(&path, content)
        .map_err(|e| GcsError::IoFailure(format!("write resolv.conf {path:?}: {e}")))?;
    Ok(path)
}

/// Idempotently bind-mounts the synthesized resolv.conf, read-only.
pub fn ensure_resolv_conf_mount(spec: &mut OciSpec, resolv_path: &Path) {
    spec.add_mount_if_absent(serde_json::json!({
        "destination": "/etc/resolv.conf",
        "type": "bind",
        "source": resolv_path.to_string_lossy(),
        "options": ["bind", "ro"],
    }));
}

/// A host device discovered for the LCOW-privileged merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    pub path: String,
    pub device_type: String,
    pub major: i64,
    pub minor: i64,
}

/// Merges `devices` into `spec.Linux.Devices`: overwrite on path match,
/// warn (don't overwrite) on same type+major+minor under a different
/// path, ignore major=0&&minor=0 placeholders.
pub fn merge_privileged_devices(spec: &mut OciSpec, devices: &[HostDevice]) {
    let existing = spec.linux_devices_mut();
    for device in devices {
        if device.major == 0 && device.minor == 0 {
            continue;
        }
        if let Some(idx) = existing
            .iter()
            .position(|d| d.get("path").and_then(|v| v.as_str()) == Some(device.path.as_str()))
        {
            existing[idx] = device_to_json(device);
            continue;
        }
        let collision = existing.iter().find(|d| {
            d.get("type").and_then(|v| v.as_str()) == Some(device.device_type.as_str())
                && d.get("major").and_then(|v| v.as_i64()) == Some(device.major)
                && d.get("minor").and_then(|v| v.as_i64()) == Some(device.minor)
        });
        if let Some(existing_entry) = collision {
            let existing_path = existing_entry
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            tracing::warn!(
                new_path = %device.path,
                existing_path,
                "device with matching type/major/minor already present at a different path"
            );
            continue;
        }
        existing.push(device_to_json(device));
    }
}

fn device_to_json(device: &HostDevice) -> serde_json::Value {
    serde_json::json!({
        "path": device.path,
        "type": device.device_type,
        "major": device.major,
        "minor": device.minor,
    })
}

/// Writes `config.json` into the bundle directory, creating it if
/// needed.
pub fn write_bundle(bundle_path: &Path, spec: &OciSpec) -> GcsResult<()> {
    std::fs::create_dir_all(bundle_path)
        .map_err(|e| GcsError::IoFailure(format!("create bundle dir {bundle_path:?}: {e}")))?;
    let config_path = bundle_path.join("config.json");
    let bytes = serde_json::to_vec_pretty(&spec.0)
        .map_err(|e| GcsError::Invalid(format!("serialize OCI spec: {e}")))?;
    std::fs::write(&config_path, bytes)
        .map_err(|e| GcsError::IoFailure(format!("write {config_path:?}: {e}")))?;
    Ok(())
}

/// Removes the bundle directory, best-effort, used to roll back a
/// failed Create.
pub fn remove_bundle(bundle_path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(bundle_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = ?bundle_path, error = %e, "failed to roll back bundle directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_renders_servers_then_search() {
        let dns = DnsConfig {
            dns_servers: vec!["10.0.0.1".into(), "10.0.0.2".into()],
            dns_suffix: "example.com".into(),
        };
        let rendered = render_resolv_conf(&dns);
        assert_eq!(rendered, "nameserver 10.0.0.1\nnameserver 10.0.0.2\nsearch example.com\n");
    }

    #[test]
    fn merge_devices_ignores_null_placeholder() {
        let mut spec = OciSpec(serde_json::json!({}));
        merge_privileged_devices(
            &mut spec,
            &[HostDevice {
                path: "/dev/null".into(),
                device_type: "c".into(),
                major: 0,
                minor: 0,
            }],
        );
        assert!(spec.linux_devices_mut().is_empty());
    }

    #[test]
    fn merge_devices_overwrites_on_path_match() {
        let mut spec = OciSpec(serde_json::json!({
            "Linux": {"Devices": [{"path": "/dev/foo", "type": "c", "major": 1, "minor": 2}]}
        }));
        merge_privileged_devices(
            &mut spec,
            &[HostDevice {
                path: "/dev/foo".into(),
                device_type: "c".into(),
                major: 9,
                minor: 9,
            }],
        );
        let devices = spec.linux_devices_mut();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0]["major"], 9);
    }

    #[test]
    fn merge_devices_skips_collision_under_different_path() {
        let mut spec = OciSpec(serde_json::json!({
            "Linux": {"Devices": [{"path": "/dev/foo", "type": "c", "major": 1, "minor": 2}]}
        }));
        merge_privileged_devices(
            &mut spec,
            &[HostDevice {
                path: "/dev/bar".into(),
                device_type: "c".into(),
                major: 1,
                minor: 2,
            }],
        );
        assert_eq!(spec.linux_devices_mut().len(), 1, "collision is not added");
    }

    #[test]
    fn write_and_remove_bundle_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("c1");
        let spec = OciSpec(serde_json::json!({"ok": true}));
        write_bundle(&bundle, &spec).unwrap();
        assert!(bundle.join("config.json").exists());
        remove_bundle(&bundle);
        assert!(!bundle.exists());
    }
}
