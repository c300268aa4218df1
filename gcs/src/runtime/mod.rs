//! Runtime adapter: thin contract onto the external OCI runtime.
//! A trait-per-concern split: [`RuntimeAdapter`] for VM-wide
//! operations, [`ContainerHandle`] for a single container,
//! [`ProcessHandle`] for a single in-flight process.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use async_trait::async_trait;
use gcs_shared::GcsResult;
use tokio::io::{AsyncRead, AsyncWrite};

mod runc;
pub use runc::RuncAdapter;

/// Stdio wiring requested for a process.
#[derive(Debug, Clone, Default)]
pub struct StdioOptions {
    pub terminal: bool,
    pub open_stdin: bool,
    pub open_stdout: bool,
    pub open_stderr: bool,
}

/// The stdio handles a runtime adapter hands back for a freshly created
/// or exec'd process, shaped so the caller can hand them straight to
/// [`crate::relay::PipeRelay`] or [`crate::relay::TtyRelay`].
pub enum ProcessStdio {
    /// No stdio was requested.
    None,
    /// Pipe-backed stdio: each stream present iff the caller asked
    /// for it in [`StdioOptions`].
    Pipes {
        stdin: Option<Box<dyn AsyncWrite + Unpin + Send>>,
        stdout: Option<Box<dyn AsyncRead + Unpin + Send>>,
        stderr: Option<Box<dyn AsyncRead + Unpin + Send>>,
    },
    /// A single PTY master fd multiplexing stdin/stdout.
    Tty { master_fd: RawFd },
}

/// One entry from `GetAllProcesses`.
#[derive(Debug, Clone)]
pub struct RuntimeProcessInfo {
    pub pid: u32,
    pub command: String,
    pub created_by_runtime: bool,
    pub is_zombie: bool,
}

/// VM-wide contract onto the external OCI runtime.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Creates the init process but does not start it.
    async fn create_container(
        &self,
        id: &str,
        bundle_path: &PathBuf,
        stdio: StdioOptions,
    ) -> GcsResult<(Box<dyn ContainerHandle>, Box<dyn ProcessHandle>, ProcessStdio)>;

    async fn get_all_processes(&self) -> GcsResult<Vec<RuntimeProcessInfo>>;
}

/// Per-container contract.
#[async_trait]
pub trait ContainerHandle: Send + Sync {
    async fn start(&self) -> GcsResult<()>;

    async fn exec(
        &self,
        oci_process: serde_json::Value,
        stdio: StdioOptions,
    ) -> GcsResult<(Box<dyn ProcessHandle>, ProcessStdio)>;

    async fn kill(&self, signal: i32) -> GcsResult<()>;

    async fn delete(&self) -> GcsResult<()>;

    async fn update(&self, linux_resources: serde_json::Value) -> GcsResult<()>;

    /// Raw cgroup metrics snapshot for `GetStats`.
    async fn stats(&self) -> GcsResult<serde_json::Value>;
}

/// Per-process contract.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// The OS PID the runtime assigned this process.
    fn pid(&self) -> u32;

    /// Blocks until the runtime reports the child exited; returns its
    /// exit code.
    async fn wait(&self) -> GcsResult<i32>;

    async fn signal(&self, signal: i32) -> GcsResult<()>;

    /// TTY resize; a no-op (returns `Ok`) for pipe-relay processes.
    async fn resize(&self, rows: u16, cols: u16) -> GcsResult<()>;

    fn as_any(&self) -> &dyn Any;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use tokio::sync::Notify;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    /// A `ProcessHandle` double whose exit is triggered manually by a
    /// test via [`StubProcessHandle::fire_exit`].
    pub struct StubProcessHandle {
        pid: u32,
        exit_code: AtomicI32,
        fired: Arc<Notify>,
        exited: std::sync::atomic::AtomicBool,
    }

    impl StubProcessHandle {
        pub fn new() -> Self {
            StubProcessHandle::with_pid(1)
        }

        pub fn with_pid(pid: u32) -> Self {
            StubProcessHandle {
                pid,
                exit_code: AtomicI32::new(0),
                fired: Arc::new(Notify::new()),
                exited: std::sync::atomic::AtomicBool::new(false),
            }
        }

        pub fn fire_exit(&self, code: i32) {
            self.exit_code.store(code, Ordering::SeqCst);
            self.exited.store(true, Ordering::SeqCst);
            self.fired.notify_waiters();
        }
    }

    #[async_trait]
    impl ProcessHandle for StubProcessHandle {
        fn pid(&self) -> u32 {
            self.pid
        }

        async fn wait(&self) -> GcsResult<i32> {
            let notified = self.fired.notified();
            if !self.exited.load(Ordering::SeqCst) {
                notified.await;
            }
            Ok(self.exit_code.load(Ordering::SeqCst))
        }

        async fn signal(&self, _signal: i32) -> GcsResult<()> {
            Ok(())
        }

        async fn resize(&self, _rows: u16, _cols: u16) -> GcsResult<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[async_trait]
    impl ProcessHandle for Arc<StubProcessHandle> {
        fn pid(&self) -> u32 {
            (**self).pid()
        }

        async fn wait(&self) -> GcsResult<i32> {
            (**self).wait().await
        }

        async fn signal(&self, signal: i32) -> GcsResult<()> {
            (**self).signal(signal).await
        }

        async fn resize(&self, rows: u16, cols: u16) -> GcsResult<()> {
            (**self).resize(rows, cols).await
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A `ContainerHandle` double that records calls but performs no
    /// real runtime operations.
    pub struct StubContainerHandle {
        pub exec_pid: AtomicU32,
    }

    use std::sync::atomic::AtomicU32;

    impl StubContainerHandle {
        pub fn new() -> Self {
            StubContainerHandle {
                exec_pid: AtomicU32::new(200),
            }
        }
    }

    #[async_trait]
    impl ContainerHandle for StubContainerHandle {
        async fn start(&self) -> GcsResult<()> {
            Ok(())
        }

        async fn exec(
            &self,
            _oci_process: serde_json::Value,
            _stdio: StdioOptions,
        ) -> GcsResult<(Box<dyn ProcessHandle>, ProcessStdio)> {
            let pid = self.exec_pid.fetch_add(1, Ordering::SeqCst);
            Ok((Box::new(StubProcessHandle::with_pid(pid)), ProcessStdio::None))
        }

        async fn kill(&self, _signal: i32) -> GcsResult<()> {
            Ok(())
        }

        async fn delete(&self) -> GcsResult<()> {
            Ok(())
        }

        async fn update(&self, _linux_resources: serde_json::Value) -> GcsResult<()> {
            Ok(())
        }

        async fn stats(&self) -> GcsResult<serde_json::Value> {
            Ok(serde_json::json!({}))
        }
    }
}
