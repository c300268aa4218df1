//! VM-wide startup sequence run once before the bridge starts serving:
//! carve out the `containers`/`gcs` cgroups, move this process into the
//! latter, and install the signal-triggered stack dump.

use std::fs;
use std::path::{Path, PathBuf};

use gcs_shared::{GcsError, GcsResult};

use crate::config::ServiceArgs;
use crate::host::Host;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const CONTAINERS_CGROUP: &str = "containers";
const GCS_CGROUP: &str = "gcs";

/// Reads total guest memory from `/proc/meminfo`, in bytes.
fn total_memory_bytes() -> GcsResult<u64> {
    let meminfo = fs::read_to_string("/proc/meminfo")?;
    let line = meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .ok_or_else(|| GcsError::Fatal("MemTotal missing from /proc/meminfo".into()))?;
    let kb: u64 = line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| GcsError::Fatal("malformed MemTotal line".into()))?
        .parse()
        .map_err(|e| GcsError::Fatal(format!("parse MemTotal: {e}")))?;
    Ok(kb * 1024)
}

fn cgroup_dir(name: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(name)
}

fn write_cgroup_file(dir: &Path, file: &str, contents: &str) -> GcsResult<()> {
    fs::write(dir.join(file), contents)
        .map_err(|e| GcsError::Fatal(format!("write {}/{file}: {e}", dir.display())))
}

/// Creates the `containers` cgroup (limit = totalram - reservation) and
/// the `gcs` cgroup (fixed limit), then moves the current process into
/// `gcs` so a leak in the service can't take down the guest.
///
/// Every step is best-effort tolerant of the cgroup controller already
/// existing (idempotent restart), but any failure to create or move
/// into the `gcs` cgroup is `Fatal`.
pub fn init_memory_cgroups(args: &ServiceArgs) -> GcsResult<()> {
    let total = total_memory_bytes().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "could not read total guest memory, skipping containers cgroup limit");
        0
    });

    let containers_dir = cgroup_dir(CONTAINERS_CGROUP);
    fs::create_dir_all(&containers_dir)
        .map_err(|e| GcsError::Fatal(format!("create containers cgroup: {e}")))?;
    if total > 0 {
        let limit = total.saturating_sub(args.root_mem_reserve_bytes);
        write_cgroup_file(&containers_dir, "memory.max", &limit.to_string())?;
    }

    let gcs_dir = cgroup_dir(GCS_CGROUP);
    fs::create_dir_all(&gcs_dir).map_err(|e| GcsError::Fatal(format!("create gcs cgroup: {e}")))?;
    write_cgroup_file(&gcs_dir, "memory.max", &args.gcs_mem_limit_bytes.to_string())?;

    let pid = std::process::id();
    write_cgroup_file(&gcs_dir, "cgroup.procs", &pid.to_string())?;

    tracing::info!(
        pid,
        root_mem_reserve_bytes = args.root_mem_reserve_bytes,
        gcs_mem_limit_bytes = args.gcs_mem_limit_bytes,
        "moved service into gcs cgroup"
    );
    Ok(())
}

/// Installs a handler that dumps every live pid plus a backtrace to the
/// log on SIGUSR1, mirroring what the `DumpStacks` RPC reports but
/// reachable without a healthy bridge connection.
#[cfg(target_os = "linux")]
pub fn install_signal_stack_dump(host: std::sync::Arc<Host>) -> GcsResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut stream = signal(SignalKind::user_defined1())
        .map_err(|e| GcsError::Fatal(format!("install SIGUSR1 handler: {e}")))?;
    tokio::spawn(async move {
        loop {
            if stream.recv().await.is_none() {
                return;
            }
            let pids = host.get_all_process_pids().await.unwrap_or_default();
            let backtrace = std::backtrace::Backtrace::force_capture();
            tracing::error!(?pids, %backtrace, "SIGUSR1 stack dump");
        }
    });
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn install_signal_stack_dump(_host: std::sync::Arc<Host>) -> GcsResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_memory_bytes_parses_real_meminfo() {
        let result = total_memory_bytes();
        assert!(result.is_ok());
        assert!(result.unwrap() > 0);
    }
}
