//! Concrete [`RuntimeAdapter`] backed by a `runc`-compatible OCI runtime
//! CLI binary, invoked via `tokio::process::Command`. The actual
//! forking of the container is out of scope here; this adapter only
//! shapes that external contract, including the pipe/PTY plumbing
//! [`ProcessStdio`] exposes to the stdio relay.

use std::any::Any;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use gcs_shared::{GcsError, GcsResult};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use super::{ContainerHandle, ProcessHandle, ProcessStdio, RuntimeAdapter, RuntimeProcessInfo, StdioOptions};

pub struct RuncAdapter {
    binary: PathBuf,
    root: PathBuf,
}

impl RuncAdapter {
    pub fn new(binary: PathBuf, root: PathBuf) -> Self {
        RuncAdapter { binary, root }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        cmd
    }

    async fn run_checked(&self, mut cmd: Command, op: &str) -> GcsResult<Vec<u8>> {
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn {op}: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "{op} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

/// A PTY master/slave pair opened via `openpty(3)`. The slave is
/// handed to the child as its stdio; the master stays with the relay
/// for the lifetime of the process.
#[cfg(target_os = "linux")]
fn open_pty() -> GcsResult<(RawFd, RawFd)> {
    use std::os::fd::IntoRawFd;
    let pty = nix::pty::openpty(None, None)
        .map_err(|e| GcsError::IoFailure(format!("openpty: {e}")))?;
    Ok((pty.master.into_raw_fd(), pty.slave.into_raw_fd()))
}

#[cfg(not(target_os = "linux"))]
fn open_pty() -> GcsResult<(RawFd, RawFd)> {
    Err(GcsError::Unsupported("PTY allocation requires Linux".into()))
}

/// Three independent `dup`s of the PTY slave, one per standard stream,
/// so each can be handed to [`Command`] as its own owned [`Stdio`].
fn pty_stdio(slave: RawFd) -> GcsResult<(Stdio, Stdio, Stdio)> {
    let dup_one = || -> GcsResult<Stdio> {
        // SAFETY: `slave` is a valid, open fd for the duration of this call.
        let fd = unsafe { libc::dup(slave) };
        if fd < 0 {
            return Err(GcsError::IoFailure(format!(
                "dup pty slave: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: `fd` was just returned by a successful dup(2) and is
        // not owned elsewhere.
        Ok(unsafe { Stdio::from_raw_fd(fd) })
    };
    Ok((dup_one()?, dup_one()?, dup_one()?))
}

fn close_fd(fd: RawFd) {
    // SAFETY: caller passes an fd it owns and is done with.
    unsafe {
        libc::close(fd);
    }
}

#[async_trait]
impl RuntimeAdapter for RuncAdapter {
    async fn create_container(
        &self,
        id: &str,
        bundle_path: &PathBuf,
        stdio: StdioOptions,
    ) -> GcsResult<(Box<dyn ContainerHandle>, Box<dyn ProcessHandle>, ProcessStdio)> {
        let mut cmd = self.command();
        cmd.arg("create").arg("--bundle").arg(bundle_path).arg(id);

        let mut pty_master = None;
        if stdio.terminal {
            let (master, slave) = open_pty()?;
            let (s0, s1, s2) = pty_stdio(slave)?;
            cmd.stdin(s0).stdout(s1).stderr(s2);
            close_fd(slave);
            pty_master = Some(master);
        } else {
            cmd.stdin(if stdio.open_stdin { Stdio::piped() } else { Stdio::null() })
                .stdout(if stdio.open_stdout { Stdio::piped() } else { Stdio::null() })
                .stderr(if stdio.open_stderr { Stdio::piped() } else { Stdio::null() });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn create: {e}")))?;

        let process_stdio = if let Some(master_fd) = pty_master {
            ProcessStdio::Tty { master_fd }
        } else {
            ProcessStdio::Pipes {
                stdin: child.stdin.take().map(|s| Box::new(s) as Box<dyn AsyncWrite + Unpin + Send>),
                stdout: child.stdout.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
                stderr: child.stderr.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("create wait: {e}")))?;
        if !status.success() {
            return Err(GcsError::RuntimeFailure(format!("create exited with {status}")));
        }

        let pid = self.read_pid(id).await?;

        let container = Box::new(RuncContainerHandle {
            id: id.to_string(),
            binary: self.binary.clone(),
            root: self.root.clone(),
        });
        let init_process = Box::new(RuncProcessHandle {
            id: id.to_string(),
            pid,
            binary: self.binary.clone(),
            root: self.root.clone(),
        });
        Ok((container, init_process, process_stdio))
    }

    async fn get_all_processes(&self) -> GcsResult<Vec<RuntimeProcessInfo>> {
        // `runc list -f json` enumerates containers, not raw PIDs; a
        // full implementation would additionally walk /proc for
        // processes the runtime did not create. Kept minimal: the
        // core only needs this for `GetProperties(ProcessList)` on
        // containers, which goes through `RuncContainerHandle` instead.
        Ok(Vec::new())
    }
}

impl RuncAdapter {
    async fn read_pid(&self, id: &str) -> GcsResult<u32> {
        let mut cmd = self.command();
        cmd.arg("state").arg(id);
        let stdout = self.run_checked(cmd, "state").await?;
        let state: serde_json::Value = serde_json::from_slice(&stdout)
            .map_err(|e| GcsError::RuntimeFailure(format!("parse state: {e}")))?;
        state
            .get("pid")
            .and_then(|v| v.as_u64())
            .map(|v| v as u32)
            .ok_or_else(|| GcsError::RuntimeFailure("state output missing pid".into()))
    }
}

struct RuncContainerHandle {
    id: String,
    binary: PathBuf,
    root: PathBuf,
}

impl RuncContainerHandle {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        cmd
    }
}

#[async_trait]
impl ContainerHandle for RuncContainerHandle {
    async fn start(&self) -> GcsResult<()> {
        let mut cmd = self.command();
        cmd.arg("start").arg(&self.id);
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn start: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "start exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn exec(
        &self,
        oci_process: serde_json::Value,
        stdio: StdioOptions,
    ) -> GcsResult<(Box<dyn ProcessHandle>, ProcessStdio)> {
        let process_json = serde_json::to_string(&oci_process)
            .map_err(|e| GcsError::Invalid(format!("process spec: {e}")))?;
        // The process description is passed by path rather than
        // /dev/stdin so the command's own stdin stays free to become
        // the exec'd process's stdio.
        let spec_path = std::env::temp_dir().join(format!(
            "runc-exec-{}-{}.json",
            self.id,
            EXEC_SEQ.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
        ));
        tokio::fs::write(&spec_path, process_json.as_bytes())
            .await
            .map_err(|e| GcsError::IoFailure(format!("write exec process spec: {e}")))?;

        let mut cmd = self.command();
        cmd.arg("exec")
            .arg("--process")
            .arg(&spec_path)
            .arg("--detach")
            .arg(&self.id);

        let mut pty_master = None;
        if stdio.terminal {
            let (master, slave) = open_pty()?;
            let (s0, s1, s2) = pty_stdio(slave)?;
            cmd.stdin(s0).stdout(s1).stderr(s2);
            close_fd(slave);
            pty_master = Some(master);
        } else {
            cmd.stdin(if stdio.open_stdin { Stdio::piped() } else { Stdio::null() })
                .stdout(if stdio.open_stdout { Stdio::piped() } else { Stdio::null() })
                .stderr(if stdio.open_stderr { Stdio::piped() } else { Stdio::null() });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn exec: {e}")))?;

        let process_stdio = if let Some(master_fd) = pty_master {
            ProcessStdio::Tty { master_fd }
        } else {
            ProcessStdio::Pipes {
                stdin: child.stdin.take().map(|s| Box::new(s) as Box<dyn AsyncWrite + Unpin + Send>),
                stdout: child.stdout.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
                stderr: child.stderr.take().map(|s| Box::new(s) as Box<dyn AsyncRead + Unpin + Send>),
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("exec wait: {e}")))?;
        let _ = tokio::fs::remove_file(&spec_path).await;
        if !status.success() {
            return Err(GcsError::RuntimeFailure(format!("exec exited with {status}")));
        }

        // `--detach` leaves the new process running under the container;
        // its pid is discoverable via `runc ps`.
        let pid = self.latest_pid().await?;
        Ok((
            Box::new(RuncProcessHandle {
                id: self.id.clone(),
                pid,
                binary: self.binary.clone(),
                root: self.root.clone(),
            }),
            process_stdio,
        ))
    }

    async fn kill(&self, signal: i32) -> GcsResult<()> {
        let mut cmd = self.command();
        cmd.arg("kill").arg(&self.id).arg(signal.to_string());
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn kill: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "kill exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn delete(&self) -> GcsResult<()> {
        let mut cmd = self.command();
        cmd.arg("delete").arg("--force").arg(&self.id);
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn delete: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "delete exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn update(&self, linux_resources: serde_json::Value) -> GcsResult<()> {
        let resources_json = serde_json::to_string(&linux_resources)
            .map_err(|e| GcsError::Invalid(format!("resources: {e}")))?;
        let mut cmd = self.command();
        cmd.arg("update")
            .arg("--resources")
            .arg("/dev/stdin")
            .arg(&self.id)
            .stdin(Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn update: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin
                .write_all(resources_json.as_bytes())
                .await
                .map_err(|e| GcsError::RuntimeFailure(format!("write resources: {e}")))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("update wait: {e}")))?;
        if !status.success() {
            return Err(GcsError::RuntimeFailure(format!("update exited with {status}")));
        }
        Ok(())
    }

    async fn stats(&self) -> GcsResult<serde_json::Value> {
        let mut cmd = self.command();
        cmd.arg("events").arg("--stats").arg(&self.id);
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn events: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "events exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| GcsError::RuntimeFailure(format!("parse stats: {e}")))
    }
}

static EXEC_SEQ: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

impl RuncContainerHandle {
    async fn latest_pid(&self) -> GcsResult<u32> {
        let mut cmd = self.command();
        cmd.arg("ps").arg("--format").arg("json").arg(&self.id);
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn ps: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "ps exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        let pids: Vec<u32> = serde_json::from_slice(&output.stdout)
            .map_err(|e| GcsError::RuntimeFailure(format!("parse ps: {e}")))?;
        pids.last()
            .copied()
            .ok_or_else(|| GcsError::RuntimeFailure("ps returned no pids".into()))
    }
}

struct RuncProcessHandle {
    id: String,
    pid: u32,
    binary: PathBuf,
    root: PathBuf,
}

impl RuncProcessHandle {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        cmd
    }
}

#[async_trait]
impl ProcessHandle for RuncProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    async fn wait(&self) -> GcsResult<i32> {
        // Poll /proc for exit; a production adapter would instead
        // subscribe to `runc events` or reap via waitpid when the
        // runtime is a direct child. Polling keeps this adapter free
        // of assumptions about process ancestry, since the container's
        // init is not a child of the service process.
        loop {
            let alive = tokio::fs::metadata(format!("/proc/{}", self.pid)).await.is_ok();
            if !alive {
                return self.exit_code_from_state().await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }

    async fn signal(&self, signal: i32) -> GcsResult<()> {
        let mut cmd = self.command();
        cmd.arg("kill").arg(&self.id).arg(signal.to_string());
        let output = cmd
            .output()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn signal: {e}")))?;
        if !output.status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "signal exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn resize(&self, _rows: u16, _cols: u16) -> GcsResult<()> {
        // TTY resize for runc-managed processes goes through the PTY
        // master the stdio relay owns directly; the runtime process
        // handle has no separate resize verb.
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl RuncProcessHandle {
    async fn exit_code_from_state(&self) -> GcsResult<i32> {
        let mut cmd = self.command();
        cmd.arg("state").arg(&self.id);
        let output = cmd.output().await.ok();
        let code = output
            .and_then(|o| serde_json::from_slice::<serde_json::Value>(&o.stdout).ok())
            .and_then(|v| v.get("exit_status").and_then(|v| v.as_i64()))
            .unwrap_or(-1) as i32;
        Ok(code)
    }
}
