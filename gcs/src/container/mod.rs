//! Per-container state machine: `Created -> Started -> (Stopping ->
//! Stopped) -> Deleted`, composed of an init [`Process`] and a table of
//! exec'd processes.

pub mod spec;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use gcs_shared::protocol::{
    ContainerRole, ExitType, NetworkAdapterSettings, OciSpec, VsockStdioRelaySettings,
};
use gcs_shared::{GcsError, GcsResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Notify};

use crate::process::{exit_type_for_signal, Process};
use crate::relay::{self, VMADDR_CID_HOST};
use crate::runtime::{ContainerHandle, ProcessHandle, ProcessStdio, StdioOptions};

/// The out-of-scope "standalone network-namespace configuration
/// helper" the core invokes, pinned to the container via
/// its init PID.
const NETNS_HELPER_BIN: &str = "gcs-netnscfg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Started,
    Stopping,
    Stopped,
    Deleted,
}

pub struct Container {
    pub id: String,
    pub role: ContainerRole,
    pub network_namespace: Option<String>,
    pub bundle_path: PathBuf,
    spec: Mutex<OciSpec>,
    state: Mutex<ContainerState>,
    init: Arc<Process>,
    procs: Mutex<HashMap<u32, Arc<Process>>>,
    procs_wg: AtomicU32,
    procs_done: Notify,
    exit_type: Mutex<ExitType>,
    adapter: Box<dyn ContainerHandle>,
    /// Stdio handles for the init process, taken and wired into a
    /// relay the first time `start()` succeeds.
    init_stdio: Mutex<Option<ProcessStdio>>,
    init_stdio_settings: VsockStdioRelaySettings,
    /// Mount targets applied to this container via `ModifySettings`
    /// (MappedVirtualDisk/MappedDirectory/VPMemDevice/CombinedLayers),
    /// unmounted best-effort by `delete()` when `role == Sandbox`.
    sandbox_mounts: Mutex<Vec<PathBuf>>,
}

impl Container {
    /// Builds the Container around an already-created (but not yet
    /// started) runtime init handle, seeding `procs_wg = 1`
    /// during container creation.
    pub fn new(
        id: String,
        spec: OciSpec,
        role: ContainerRole,
        network_namespace: Option<String>,
        bundle_path: PathBuf,
        adapter: Box<dyn ContainerHandle>,
        init_handle: Box<dyn ProcessHandle>,
        init_stdio: ProcessStdio,
        init_stdio_settings: VsockStdioRelaySettings,
    ) -> Arc<Self> {
        let init_pid = init_handle.pid();
        let init = Process::new(init_pid, true, init_handle);

        let container = Arc::new(Container {
            id,
            role,
            network_namespace,
            bundle_path,
            spec: Mutex::new(spec),
            state: Mutex::new(ContainerState::Created),
            init: init.clone(),
            procs: Mutex::new(HashMap::new()),
            procs_wg: AtomicU32::new(1),
            procs_done: Notify::new(),
            exit_type: Mutex::new(ExitType::None),
            adapter,
            init_stdio: Mutex::new(Some(init_stdio)),
            init_stdio_settings,
            sandbox_mounts: Mutex::new(Vec::new()),
        });

        container.watch_process_exit(init, true);
        container
    }

    pub async fn state(&self) -> ContainerState {
        *self.state.lock().await
    }

    pub async fn spec(&self) -> OciSpec {
        self.spec.lock().await.clone()
    }

    pub fn init_pid(&self) -> u32 {
        self.init.pid
    }

    /// Snapshot of every exec'd (non-init) process pid, for
    /// `GetAllProcessPids`.
    pub async fn process_pids(&self) -> Vec<u32> {
        self.procs.lock().await.keys().copied().collect()
    }

    /// `Start(stdio_settings) -> init PID`. Invalid after
    /// a prior Start.
    pub async fn start(&self, _stdio: StdioOptions) -> GcsResult<u32> {
        {
            let mut state = self.state.lock().await;
            if *state != ContainerState::Created {
                return Err(GcsError::Busy(format!(
                    "container {} already started",
                    self.id
                )));
            }
            self.adapter.start().await?;
            *state = ContainerState::Started;
        }

        if let Some(stdio) = self.init_stdio.lock().await.take() {
            match relay::wire(stdio, VMADDR_CID_HOST, &self.init_stdio_settings).await {
                Ok(Some(relay)) => self.init.attach_relay(relay).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(container = %self.id, error = %e, "failed to wire stdio relay for init process")
                }
            }
        }

        Ok(self.init.pid)
    }

    /// `ExecProcess(oci_process, stdio_settings) -> pid`.
    pub async fn exec_process(
        self: &Arc<Self>,
        oci_process: serde_json::Value,
        stdio: StdioOptions,
        stdio_relay: VsockStdioRelaySettings,
    ) -> GcsResult<u32> {
        {
            let state = self.state.lock().await;
            if *state != ContainerState::Started {
                return Err(GcsError::Busy(format!(
                    "container {} is not started",
                    self.id
                )));
            }
        }

        self.procs_wg.fetch_add(1, Ordering::SeqCst);

        let (handle, process_stdio) = match self.adapter.exec(oci_process, stdio).await {
            Ok(pair) => pair,
            Err(e) => {
                self.release_proc_slot();
                return Err(e);
            }
        };

        let pid = handle.pid();
        let process = Process::new(pid, false, handle);
        self.procs.lock().await.insert(pid, process.clone());
        self.watch_process_exit(process.clone(), false);

        match relay::wire(process_stdio, VMADDR_CID_HOST, &stdio_relay).await {
            Ok(Some(relay)) => process.attach_relay(relay).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(pid, error = %e, "failed to wire stdio relay for exec'd process"),
        }

        Ok(pid)
    }

    /// `GetProcess(pid) -> Process`.
    pub async fn get_process(&self, pid: u32) -> GcsResult<Arc<Process>> {
        if pid == self.init.pid {
            return Ok(self.init.clone());
        }
        self.procs
            .lock()
            .await
            .get(&pid)
            .cloned()
            .ok_or_else(|| GcsError::NotFound(format!("process {pid} in container {}", self.id)))
    }

    /// Forward `signal` to `pid` and update `exit_type` per the
    /// TERM/KILL mapping, first-signal-wins.
    pub async fn signal_process(&self, pid: u32, signal: i32) -> GcsResult<()> {
        let process = self.get_process(pid).await?;
        process.signal(signal).await?;
        if let Some(mapped) = exit_type_for_signal(signal) {
            self.set_exit_type_if_unset(mapped).await;
        }
        Ok(())
    }

    /// `Kill(signal)` on the container, i.e. on its init process
    /// Used by ShutdownGraceful/ShutdownForced.
    pub async fn kill(&self, signal: i32) -> GcsResult<()> {
        self.signal_process(self.init.pid, signal).await
    }

    async fn set_exit_type_if_unset(&self, mapped: ExitType) {
        let mut exit_type = self.exit_type.lock().await;
        if *exit_type == ExitType::None {
            *exit_type = mapped;
        }
    }

    pub async fn exit_type(&self) -> ExitType {
        *self.exit_type.lock().await
    }

    /// `Wait() -> exit_type`: block until `procs_wg` reaches zero, then
    /// return the sampled exit_type. No implicit Delete.
    pub async fn wait(&self) -> ExitType {
        loop {
            // Register interest before re-checking the counter: if we
            // checked first, a release_proc_slot() landing between the
            // check and the await would call notify_waiters() with no
            // registered waiter yet, and the wakeup would be lost.
            let notified = self.procs_done.notified();
            if self.procs_wg.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        self.exit_type().await
    }

    /// `Delete()`: only valid once every process has exited.
    /// Idempotent once already `Deleted`, so a retried
    /// `DeleteContainerState` after a partial failure does not re-run
    /// the runtime teardown.
    pub async fn delete(&self) -> GcsResult<()> {
        if *self.state.lock().await == ContainerState::Deleted {
            return Ok(());
        }
        if self.procs_wg.load(Ordering::SeqCst) != 0 {
            return Err(GcsError::Busy(format!(
                "container {} has live processes",
                self.id
            )));
        }
        if self.role == ContainerRole::Sandbox {
            if let Err(e) = self.unmount_sandbox_mounts().await {
                tracing::warn!(container = %self.id, error = %e, "best-effort sandbox unmount failed");
            }
        }
        self.adapter.delete().await?;
        *self.state.lock().await = ContainerState::Deleted;
        Ok(())
    }

    /// Records a mount path applied to this container via `ModifySettings`,
    /// so `delete()` can unmount it later.
    pub async fn record_mount(&self, path: PathBuf) {
        self.sandbox_mounts.lock().await.push(path);
    }

    /// Forgets a mount path this container previously recorded, e.g. after
    /// an explicit `ModifySettings` Remove already unmounted it.
    pub async fn forget_mount(&self, path: &std::path::Path) {
        self.sandbox_mounts.lock().await.retain(|p| p != path);
    }

    /// Unmounts every path this sandbox recorded via `ModifySettings`,
    /// best-effort: a single failure is logged and does not stop the rest
    /// from being attempted.
    async fn unmount_sandbox_mounts(&self) -> GcsResult<()> {
        let mounts = std::mem::take(&mut *self.sandbox_mounts.lock().await);
        for path in mounts {
            if let Err(e) = crate::host::mounts::unmount(&path) {
                tracing::warn!(container = %self.id, mount = %path.display(), error = %e, "failed to unmount sandbox mount");
            }
        }
        Ok(())
    }

    /// `Update(resources)`: pass-through to the runtime.
    pub async fn update(&self, resources: serde_json::Value) -> GcsResult<()> {
        self.adapter.update(resources).await
    }

    /// `GetStats()`.
    pub async fn stats(&self) -> GcsResult<serde_json::Value> {
        self.adapter.stats().await
    }

    /// `AddNetworkAdapter`: translate the descriptor and invoke the
    /// namespace-config helper, pinned to this container via its init
    /// PID.
    pub async fn add_network_adapter(&self, adapter: &NetworkAdapterSettings) -> GcsResult<()> {
        let value = serde_json::to_value(adapter)
            .map_err(|e| GcsError::Invalid(format!("network adapter: {e}")))?;
        self.invoke_netns_helper("add", value).await
    }

    /// `RemoveNetworkAdapter`: must succeed as a no-op or return
    /// *Unsupported*, never silently fail.
    pub async fn remove_network_adapter(&self, adapter_id: &str) -> GcsResult<()> {
        self.invoke_netns_helper("remove", serde_json::json!({"Id": adapter_id}))
            .await
    }

    async fn invoke_netns_helper(&self, op: &str, adapter: serde_json::Value) -> GcsResult<()> {
        let payload = serde_json::json!({
            "Operation": op,
            "InitPid": self.init.pid,
            "Adapter": adapter,
        });
        let bytes = serde_json::to_vec(&payload)
            .map_err(|e| GcsError::Invalid(format!("netns helper payload: {e}")))?;

        let mut cmd = tokio::process::Command::new(NETNS_HELPER_BIN);
        cmd.stdin(std::process::Stdio::piped());
        let mut child = cmd
            .spawn()
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn {NETNS_HELPER_BIN}: {e}")))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&bytes)
                .await
                .map_err(|e| GcsError::IoFailure(format!("write netns payload: {e}")))?;
        }
        let status = child
            .wait()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("{NETNS_HELPER_BIN} wait: {e}")))?;
        if !status.success() {
            return Err(GcsError::RuntimeFailure(format!(
                "{NETNS_HELPER_BIN} {op} exited with {status}"
            )));
        }
        Ok(())
    }

    fn release_proc_slot(&self) {
        let prev = self.procs_wg.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.procs_done.notify_waiters();
        }
    }

    /// Wires a process's exit into the container's `procs_wg` and, for
    /// exec'd (non-init) processes, reaps the table entry once every
    /// waiter has acknowledged the exit (`Exited -> Reaped`). Either way,
    /// the process's stdio relay is closed on exit so its PTY master/pipes
    /// don't outlive it.
    fn watch_process_exit(self: &Arc<Self>, process: Arc<Process>, is_init: bool) {
        let container = self.clone();
        process.clone().spawn_exit_observer(move |_code| {
            container.release_proc_slot();
            let process = process.clone();
            if is_init {
                tokio::spawn(async move { process.close_relay().await });
                return;
            }
            let container = container.clone();
            tokio::spawn(async move {
                process.close_relay().await;
                loop {
                    if process.writers_wg().await == 0 {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                }
                container.procs.lock().await.remove(&process.pid);
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::{StubContainerHandle, StubProcessHandle};
    use gcs_shared::protocol::UVM_CONTAINER_ID;

    fn make_container(id: &str) -> Arc<Container> {
        make_container_with_init(id, Arc::new(StubProcessHandle::with_pid(100)))
    }

    fn make_container_with_init(id: &str, init: Arc<StubProcessHandle>) -> Arc<Container> {
        Container::new(
            id.to_string(),
            OciSpec(serde_json::json!({})),
            ContainerRole::Workload,
            None,
            PathBuf::from("/run/gcs/c").join(id),
            Box::new(StubContainerHandle::new()),
            Box::new(init),
            ProcessStdio::None,
            VsockStdioRelaySettings::default(),
        )
    }

    #[tokio::test]
    async fn start_transitions_to_started_and_returns_init_pid() {
        let container = make_container("c1");
        let pid = container.start(StdioOptions::default()).await.unwrap();
        assert_eq!(pid, 100);
        assert_eq!(container.state().await, ContainerState::Started);
    }

    #[tokio::test]
    async fn start_twice_is_busy() {
        let container = make_container("c2");
        container.start(StdioOptions::default()).await.unwrap();
        let err = container.start(StdioOptions::default()).await.unwrap_err();
        assert!(matches!(err, GcsError::Busy(_)));
    }

    #[tokio::test]
    async fn exec_before_start_is_busy() {
        let container = make_container("c3");
        let err = container
            .exec_process(
                serde_json::json!({}),
                StdioOptions::default(),
                VsockStdioRelaySettings::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GcsError::Busy(_)));
    }

    #[tokio::test]
    async fn get_process_missing_pid_is_not_found() {
        let container = make_container("c4");
        let err = container.get_process(9999).await.unwrap_err();
        assert!(matches!(err, GcsError::NotFound(_)));
    }

    #[tokio::test]
    async fn wait_blocks_until_all_processes_exit_then_reports_exit_type() {
        let init_handle = Arc::new(StubProcessHandle::with_pid(100));
        let container = make_container_with_init("c5", init_handle.clone());
        container.start(StdioOptions::default()).await.unwrap();

        let wait = tokio::spawn({
            let container = container.clone();
            async move { container.wait().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!wait.is_finished());

        container.kill(15).await.unwrap();
        init_handle.fire_exit(0);

        let exit_type = wait.await.unwrap();
        assert_eq!(exit_type, ExitType::GracefulExit);
    }

    #[tokio::test]
    async fn kill_sets_exit_type_first_signal_wins() {
        let container = make_container("c6");
        container.start(StdioOptions::default()).await.unwrap();
        container.kill(15).await.unwrap();
        assert_eq!(container.exit_type().await, ExitType::GracefulExit);
        container.kill(9).await.unwrap();
        assert_eq!(
            container.exit_type().await,
            ExitType::GracefulExit,
            "first signal wins"
        );
    }

    #[tokio::test]
    async fn uvm_container_id_is_reserved_constant() {
        assert_eq!(UVM_CONTAINER_ID.len(), 36);
    }

    #[tokio::test]
    async fn delete_on_sandbox_clears_recorded_mounts_even_if_unmount_fails() {
        let init_handle = Arc::new(StubProcessHandle::with_pid(100));
        let container = Container::new(
            "c7".to_string(),
            OciSpec(serde_json::json!({})),
            ContainerRole::Sandbox,
            None,
            PathBuf::from("/run/gcs/c/c7"),
            Box::new(StubContainerHandle::new()),
            Box::new(init_handle.clone()),
            ProcessStdio::None,
            VsockStdioRelaySettings::default(),
        );
        container.start(StdioOptions::default()).await.unwrap();
        container.record_mount(PathBuf::from("/nonexistent/sandbox/mount")).await;
        assert_eq!(container.sandbox_mounts.lock().await.len(), 1);

        container.kill(15).await.unwrap();
        init_handle.fire_exit(0);
        container.wait().await;

        container.delete().await.unwrap();
        assert_eq!(container.state().await, ContainerState::Deleted);
        assert!(
            container.sandbox_mounts.lock().await.is_empty(),
            "unmount_sandbox_mounts drains the list regardless of whether the umount syscall succeeded"
        );
    }

    #[tokio::test]
    async fn non_sandbox_delete_leaves_recorded_mounts_untouched() {
        let init_handle = Arc::new(StubProcessHandle::with_pid(100));
        let container = make_container_with_init("c8", init_handle.clone());
        container.start(StdioOptions::default()).await.unwrap();
        container.record_mount(PathBuf::from("/nonexistent/mount")).await;
        container.kill(9).await.unwrap();
        init_handle.fire_exit(0);
        container.wait().await;
        container.delete().await.unwrap();
        assert_eq!(
            container.sandbox_mounts.lock().await.len(),
            1,
            "only sandbox role triggers unmount on delete"
        );
    }
}
