//! Host: the one process-wide table tying containers, network
//! namespaces, and the runtime adapter together. Keeps a flat
//! id-keyed table behind a single mutex per concern rather than
//! spreading locking across callers.

pub mod devices;
pub mod handlers;
pub mod mounts;
pub mod network;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gcs_shared::protocol::{
    CombinedLayersSettings, ContainerRole, MappedDirectorySettings, MappedVirtualDiskSettings,
    ModifyRequestType, ModifyResourceType, ModifySettingsRequest, NetworkAdapterSettings, OciSpec,
    VPMemDeviceSettings, VsockStdioRelaySettings, UVM_CONTAINER_ID,
};
use gcs_shared::{GcsError, GcsResult};
use tokio::sync::Mutex;

use crate::container::spec as container_spec;
use crate::container::Container;
use crate::runtime::RuntimeAdapter;
use network::NamespaceRecord;

pub struct Host {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    namespaces: Mutex<HashMap<String, NamespaceRecord>>,
    ns_to_container: Mutex<HashMap<String, String>>,
    runtime: Arc<dyn RuntimeAdapter>,
    bundle_root: PathBuf,
    /// Orphan processes spawned directly in the UVM by an
    /// `ExecuteProcess` with no owning container ("Host (external)").
    external: Mutex<HashMap<u32, tokio::process::Child>>,
}

impl Host {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, bundle_root: PathBuf) -> Arc<Self> {
        Arc::new(Host {
            containers: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
            ns_to_container: Mutex::new(HashMap::new()),
            runtime,
            bundle_root,
            external: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns an orphan process directly in the UVM (`ExecuteProcess`
    /// with "Host (external)" scope), from the same
    /// `{CommandLine|Args, Environment, Cwd}` shape as a container's
    /// `process_parameters`.
    pub async fn spawn_external_process(&self, process_parameters: serde_json::Value) -> GcsResult<u32> {
        let args: Vec<String> = process_parameters
            .get("Args")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let (program, rest) = args
            .split_first()
            .ok_or_else(|| GcsError::Invalid("ExecuteProcess: Args must be non-empty".into()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest);
        if let Some(cwd) = process_parameters.get("Cwd").and_then(|v| v.as_str()) {
            cmd.current_dir(cwd);
        }
        if let Some(env) = process_parameters.get("Environment").and_then(|v| v.as_object()) {
            for (key, value) in env {
                if let Some(value) = value.as_str() {
                    cmd.env(key, value);
                }
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| GcsError::RuntimeFailure(format!("spawn external process {program}: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| GcsError::RuntimeFailure("external process has no pid".into()))?;
        self.external.lock().await.insert(pid, child);
        Ok(pid)
    }

    pub async fn wait_external_process(&self, pid: u32) -> GcsResult<i32> {
        let mut child = self
            .external
            .lock()
            .await
            .remove(&pid)
            .ok_or_else(|| GcsError::NotFound(format!("external process {pid}")))?;
        let status = child
            .wait()
            .await
            .map_err(|e| GcsError::RuntimeFailure(format!("wait external process {pid}: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    pub async fn signal_external_process(&self, pid: u32, signal: i32) -> GcsResult<()> {
        if !self.external.lock().await.contains_key(&pid) {
            return Err(GcsError::NotFound(format!("external process {pid}")));
        }
        send_signal(pid, signal)
    }

    pub async fn get_container(&self, id: &str) -> GcsResult<Arc<Container>> {
        self.containers
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GcsError::NotFound(format!("container {id}")))
    }

    /// `Create(id, settings) -> Container`. Idempotent
    /// on `id`: a second Create for an id already present returns the
    /// existing container rather than erroring.
    pub async fn create_container(
        self: &Arc<Self>,
        id: String,
        settings: OciSpec,
        init_stdio_settings: gcs_shared::protocol::VsockStdioRelaySettings,
    ) -> GcsResult<Arc<Container>> {
        if let Some(existing) = self.containers.lock().await.get(&id) {
            return Ok(existing.clone());
        }

        let role = ContainerRole::from_annotation(settings.annotations().get("io.kubernetes.cri.container-type").map(|s| s.as_str()));
        let network_namespace = settings.network_namespace();
        let mut spec = settings;

        // Step 2-3: synthesize + mount resolv.conf from the namespace's
        // recorded DNS info, for every role except bare workloads.
        if let Some(ns_id) = network_namespace.clone() {
            if role != ContainerRole::Workload {
                self.ensure_namespace_resolv_conf(&id, &ns_id, &mut spec).await?;
            }
        }

        // Step 4: the Windows section never reaches the OCI runtime.
        spec.clear_windows_section();

        // Step 5: LCOW-privileged containers get every host device
        // merged in and cgroup device access opened up.
        if spec.annotations().get("io.microsoft.virtualmachine.lcow.privileged").map(String::as_str) == Some("true") {
            let host_devices = devices::enumerate_host_devices();
            container_spec::merge_privileged_devices(&mut spec, &host_devices);
            spec.set_cgroup_devices_policy_allow_all();
        }

        // Step 6: write the bundle and hand it to the runtime.
        let bundle_path = self.bundle_root.join(&id);
        container_spec::write_bundle(&bundle_path, &spec)?;

        let init_stdio_options = crate::runtime::StdioOptions {
            terminal: spec.process_terminal(),
            open_stdin: init_stdio_settings.std_in != 0,
            open_stdout: init_stdio_settings.std_out != 0,
            open_stderr: init_stdio_settings.std_err != 0,
        };
        let (adapter, init_handle, init_stdio) = match self
            .runtime
            .create_container(&id, &bundle_path, init_stdio_options)
            .await
        {
            Ok(triple) => triple,
            Err(e) => {
                container_spec::remove_bundle(&bundle_path);
                return Err(e);
            }
        };

        let container = Container::new(
            id.clone(),
            spec,
            role,
            network_namespace.clone(),
            bundle_path,
            adapter,
            init_handle,
            init_stdio,
            init_stdio_settings,
        );

        // Step 8: replay any adapters already recorded for this
        // namespace onto the freshly-created container, best-effort —
        // a replay failure must not unwind an otherwise-successful
        // Create (the runtime container and bundle already exist).
        if let Some(ns_id) = &network_namespace {
            if role != ContainerRole::Workload {
                let adapters = {
                    let namespaces = self.namespaces.lock().await;
                    namespaces
                        .get(ns_id)
                        .map(|r| r.adapters.clone())
                        .unwrap_or_default()
                };
                for adapter in &adapters {
                    if let Err(e) = container.add_network_adapter(adapter).await {
                        tracing::warn!(container = %id, adapter = %adapter.id, error = %e, "failed to replay network adapter onto new container");
                    }
                }
                self.ns_to_container.lock().await.insert(ns_id.clone(), id.clone());
            }
        }

        self.containers.lock().await.insert(id, container.clone());
        Ok(container)
    }

    async fn ensure_namespace_resolv_conf(
        &self,
        container_id: &str,
        ns_id: &str,
        spec: &mut OciSpec,
    ) -> GcsResult<()> {
        let resolv_path = {
            let mut namespaces = self.namespaces.lock().await;
            let record = namespaces.entry(ns_id.to_string()).or_default();
            if record.resolv_conf_path.is_none() {
                if let Some(first) = record.first_adapter() {
                    let dns = container_spec::DnsConfig {
                        dns_servers: first.dns_servers.clone(),
                        dns_suffix: first.dns_suffix.clone(),
                    };
                    let dir = self.bundle_root.join("resolv").join(container_id);
                    let content = container_spec::render_resolv_conf(&dns);
                    record.resolv_conf_path = Some(container_spec::write_resolv_conf(&dir, &content)?);
                }
            }
            record.resolv_conf_path.clone()
        };
        if let Some(path) = resolv_path {
            container_spec::ensure_resolv_conf_mount(spec, &path);
        }
        Ok(())
    }

    /// `ModifySettings` dispatch table. Returns the mount target touched
    /// by the four filesystem resource types (Add or Remove), so a
    /// container-scoped caller can track it for later teardown; `None`
    /// for resource types with no single mount target (Network, or a
    /// MappedVirtualDisk AttachOnly that never mounts).
    pub async fn modify_host_settings(&self, request: ModifySettingsRequest) -> GcsResult<Option<PathBuf>> {
        match request.resource_type {
            ModifyResourceType::MappedVirtualDisk => {
                self.modify_mapped_virtual_disk(request.request_type, request.settings).await
            }
            ModifyResourceType::MappedDirectory => {
                self.modify_mapped_directory(request.request_type, request.settings).await
            }
            ModifyResourceType::VPMemDevice => {
                self.modify_vpmem_device(request.request_type, request.settings).await
            }
            ModifyResourceType::CombinedLayers => {
                self.modify_combined_layers(request.request_type, request.settings).await
            }
            ModifyResourceType::Network => {
                self.modify_network(request.request_type, request.settings).await?;
                Ok(None)
            }
        }
    }

    /// `ModifySettings` against a specific (non-UVM) container: applies
    /// the same resource dispatch, then records/forgets the touched mount
    /// path on the container so its sandbox teardown can unmount it.
    pub async fn modify_container_settings(&self, container_id: &str, request: ModifySettingsRequest) -> GcsResult<()> {
        let container = self.get_container(container_id).await?;
        let request_type = request.request_type;
        let path = self.modify_host_settings(request).await?;
        if let Some(path) = path {
            match request_type {
                ModifyRequestType::Add => container.record_mount(path).await,
                ModifyRequestType::Remove => container.forget_mount(&path).await,
                ModifyRequestType::Update => {}
            }
        }
        Ok(())
    }

    async fn modify_mapped_virtual_disk(
        &self,
        request_type: ModifyRequestType,
        settings: serde_json::Value,
    ) -> GcsResult<Option<PathBuf>> {
        let settings: MappedVirtualDiskSettings = serde_json::from_value(settings)
            .map_err(|e| GcsError::Invalid(format!("MappedVirtualDisk settings: {e}")))?;

        // Open Question (c): AttachOnly (leave the SCSI device bare, no
        // mount) and CreateInUtilityVM (mount inside the UVM's own
        // filesystem rather than passing the device through) describe
        // mutually exclusive destinations for the same disk.
        if settings.attach_only && settings.create_in_utility_vm {
            return Err(GcsError::Invalid(
                "MappedVirtualDisk: AttachOnly and CreateInUtilityVM are mutually exclusive".into(),
            ));
        }

        match request_type {
            ModifyRequestType::Add => {
                if settings.attach_only {
                    mounts::scsi_block_device(settings.controller, settings.lun)?;
                    return Ok(None);
                }
                let target = PathBuf::from(&settings.mount_path);
                mounts::with_mount_retry("mount MappedVirtualDisk", || {
                    let source = mounts::scsi_block_device(settings.controller, settings.lun)?;
                    mounts::mount_ext4(&source, &target, settings.read_only, None)
                })
                .await?;
                Ok(Some(target))
            }
            ModifyRequestType::Remove => {
                let target = PathBuf::from(&settings.mount_path);
                mounts::unmount(Path::new(&settings.mount_path))?;
                mounts::scsi_delete(settings.controller, settings.lun)?;
                Ok(Some(target))
            }
            ModifyRequestType::Update => Err(GcsError::Unsupported("MappedVirtualDisk Update".into())),
        }
    }

    async fn modify_mapped_directory(
        &self,
        request_type: ModifyRequestType,
        settings: serde_json::Value,
    ) -> GcsResult<Option<PathBuf>> {
        let settings: MappedDirectorySettings = serde_json::from_value(settings)
            .map_err(|e| GcsError::Invalid(format!("MappedDirectory settings: {e}")))?;
        let target = PathBuf::from(&settings.mount_path);
        match request_type {
            ModifyRequestType::Add => {
                mounts::with_mount_retry("mount MappedDirectory", || {
                    mounts::mount_9p(&settings.share_name, settings.port, &target, settings.read_only)
                })
                .await?;
                Ok(Some(target))
            }
            ModifyRequestType::Remove => {
                mounts::unmount(&target)?;
                Ok(Some(target))
            }
            ModifyRequestType::Update => Err(GcsError::Unsupported("MappedDirectory Update".into())),
        }
    }

    async fn modify_vpmem_device(
        &self,
        request_type: ModifyRequestType,
        settings: serde_json::Value,
    ) -> GcsResult<Option<PathBuf>> {
        let settings: VPMemDeviceSettings = serde_json::from_value(settings)
            .map_err(|e| GcsError::Invalid(format!("VPMemDevice settings: {e}")))?;
        let target = PathBuf::from(&settings.mount_path);
        match request_type {
            ModifyRequestType::Add => {
                let source = PathBuf::from(format!("/dev/pmem{}", settings.device_number));
                mounts::with_mount_retry("mount VPMemDevice", || {
                    mounts::mount_ext4(&source, &target, true, Some("noload,dax"))
                })
                .await?;
                Ok(Some(target))
            }
            ModifyRequestType::Remove => {
                mounts::unmount(&target)?;
                Ok(Some(target))
            }
            ModifyRequestType::Update => Err(GcsError::Unsupported("VPMemDevice Update".into())),
        }
    }

    async fn modify_combined_layers(
        &self,
        request_type: ModifyRequestType,
        settings: serde_json::Value,
    ) -> GcsResult<Option<PathBuf>> {
        let settings: CombinedLayersSettings = serde_json::from_value(settings)
            .map_err(|e| GcsError::Invalid(format!("CombinedLayers settings: {e}")))?;
        let target = PathBuf::from(&settings.container_root_path);
        match request_type {
            ModifyRequestType::Add => {
                let upper_and_work = if settings.scratch_path.is_empty() {
                    None
                } else {
                    Some((
                        PathBuf::from(&settings.scratch_path).join("upper"),
                        PathBuf::from(&settings.scratch_path).join("work"),
                    ))
                };
                mounts::with_mount_retry("mount CombinedLayers", || {
                    let refs = upper_and_work.as_ref().map(|(u, w)| (u.as_path(), w.as_path()));
                    mounts::mount_overlay(&target, &settings.layers, refs)
                })
                .await?;
                Ok(Some(target))
            }
            ModifyRequestType::Remove => {
                mounts::unmount(&target)?;
                Ok(Some(target))
            }
            ModifyRequestType::Update => Err(GcsError::Unsupported("CombinedLayers Update".into())),
        }
    }

    async fn modify_network(
        &self,
        request_type: ModifyRequestType,
        settings: serde_json::Value,
    ) -> GcsResult<()> {
        let adapter: NetworkAdapterSettings = serde_json::from_value(settings)
            .map_err(|e| GcsError::Invalid(format!("Network settings: {e}")))?;
        let ns_id = adapter.namespace_id.to_lowercase();
        let owning_container = self.ns_to_container.lock().await.get(&ns_id).cloned();

        match request_type {
            ModifyRequestType::Add => {
                if let Some(container_id) = owning_container {
                    let container = self.get_container(&container_id).await?;
                    container.add_network_adapter(&adapter).await?;
                }
                self.namespaces
                    .lock()
                    .await
                    .entry(ns_id)
                    .or_default()
                    .add_adapter(adapter);
                Ok(())
            }
            ModifyRequestType::Remove => {
                if let Some(container_id) = owning_container {
                    let container = self.get_container(&container_id).await?;
                    container.remove_network_adapter(&adapter.id).await?;
                }
                self.namespaces
                    .lock()
                    .await
                    .entry(ns_id)
                    .or_default()
                    .remove_adapter(&adapter.id);
                Ok(())
            }
            ModifyRequestType::Update => Err(GcsError::Unsupported("Network Update".into())),
        }
    }

    /// `Shutdown()`: VM-wide poweroff, reserved for the well-known UVM
    /// container id — the only id `Shutdown` accepts.
    pub async fn shutdown(&self, container_id: &str) -> GcsResult<()> {
        if container_id != UVM_CONTAINER_ID {
            return Err(GcsError::Invalid(format!(
                "Shutdown is only valid against the reserved UVM container id, got {container_id}"
            )));
        }
        reboot_poweroff()
    }

    /// `GetAllProcessPids()`: a consistent snapshot
    /// across every container's init + exec'd processes.
    pub async fn get_all_process_pids(&self) -> GcsResult<Vec<u32>> {
        let containers: Vec<_> = self.containers.lock().await.values().cloned().collect();
        let mut pids = Vec::new();
        for container in containers {
            pids.push(container.init_pid());
            pids.extend(container.process_pids().await);
        }
        Ok(pids)
    }

    /// `DeleteContainerState()`: tear down the runtime
    /// container (unmount sandbox mounts, runtime `Delete`) and then
    /// forget the `Host`-side entry. `Container::delete` is `Busy` if
    /// processes are still live, in which case the entry is left in
    /// place for the caller to signal first and retry.
    pub async fn delete_container_state(&self, id: &str) -> GcsResult<()> {
        let container = {
            let containers = self.containers.lock().await;
            containers
                .get(id)
                .cloned()
                .ok_or_else(|| GcsError::NotFound(format!("container {id}")))?
        };
        container.delete().await?;
        self.containers.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn reboot_poweroff() -> GcsResult<()> {
    nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_POWER_OFF)
        .map(|_| ())
        .map_err(|e| GcsError::Fatal(format!("reboot(RB_POWER_OFF) failed: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn reboot_poweroff() -> GcsResult<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn send_signal(pid: u32, signal: i32) -> GcsResult<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = Signal::try_from(signal).map_err(|e| GcsError::Invalid(format!("signal {signal}: {e}")))?;
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| GcsError::RuntimeFailure(format!("kill {pid}: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn send_signal(_pid: u32, _signal: i32) -> GcsResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerHandle, ProcessHandle, RuntimeProcessInfo, StdioOptions};
    use async_trait::async_trait;

    struct StubRuntime {
        fail_create: bool,
        init_handle: Arc<crate::runtime::tests::StubProcessHandle>,
    }

    #[async_trait]
    impl RuntimeAdapter for StubRuntime {
        async fn create_container(
            &self,
            _id: &str,
            _bundle_path: &PathBuf,
            _stdio: StdioOptions,
        ) -> GcsResult<(Box<dyn ContainerHandle>, Box<dyn ProcessHandle>, crate::runtime::ProcessStdio)> {
            if self.fail_create {
                return Err(GcsError::RuntimeFailure("boom".into()));
            }
            Ok((
                Box::new(crate::runtime::tests::StubContainerHandle::new()),
                Box::new(self.init_handle.clone()),
                crate::runtime::ProcessStdio::None,
            ))
        }

        async fn get_all_processes(&self) -> GcsResult<Vec<RuntimeProcessInfo>> {
            Ok(Vec::new())
        }
    }

    fn make_host(fail_create: bool) -> Arc<Host> {
        make_host_with_init(fail_create).0
    }

    fn make_host_with_init(fail_create: bool) -> (Arc<Host>, Arc<crate::runtime::tests::StubProcessHandle>) {
        let dir = tempfile::tempdir().unwrap();
        let init_handle = Arc::new(crate::runtime::tests::StubProcessHandle::with_pid(100));
        let host = Host::new(
            Arc::new(StubRuntime {
                fail_create,
                init_handle: init_handle.clone(),
            }),
            dir.path().join("bundles"),
        );
        (host, init_handle)
    }

    #[tokio::test]
    async fn create_container_is_idempotent_on_id() {
        let host = make_host(false);
        let spec = OciSpec(serde_json::json!({}));
        let c1 = host.create_container("c1".into(), spec.clone(), VsockStdioRelaySettings::default()).await.unwrap();
        let c2 = host.create_container("c1".into(), spec, VsockStdioRelaySettings::default()).await.unwrap();
        assert!(Arc::ptr_eq(&c1, &c2));
    }

    #[tokio::test]
    async fn create_container_rolls_back_bundle_on_runtime_failure() {
        let host = make_host(true);
        let spec = OciSpec(serde_json::json!({}));
        let err = host.create_container("c1".into(), spec, VsockStdioRelaySettings::default()).await.unwrap_err();
        assert!(matches!(err, GcsError::RuntimeFailure(_)));
        assert!(!host.bundle_root.join("c1").exists());
    }

    #[tokio::test]
    async fn create_container_strips_windows_section() {
        let host = make_host(false);
        let spec = OciSpec(serde_json::json!({"Windows": {"Network": {}}}));
        let container = host.create_container("c1".into(), spec, VsockStdioRelaySettings::default()).await.unwrap();
        assert!(container.spec().await.0.get("Windows").is_none());
    }

    #[tokio::test]
    async fn get_container_missing_is_not_found() {
        let host = make_host(false);
        let err = host.get_container("missing").await.unwrap_err();
        assert!(matches!(err, GcsError::NotFound(_)));
    }

    #[tokio::test]
    async fn shutdown_rejects_non_uvm_container_id() {
        let host = make_host(false);
        let err = host.shutdown("some-container").await.unwrap_err();
        assert!(matches!(err, GcsError::Invalid(_)));
    }

    #[tokio::test]
    async fn mapped_virtual_disk_rejects_conflicting_flags() {
        let host = make_host(false);
        let settings = serde_json::json!({
            "Controller": 0,
            "Lun": 0,
            "MountPath": "/mnt/x",
            "AttachOnly": true,
            "CreateInUtilityVM": true,
        });
        let err = host
            .modify_mapped_virtual_disk(ModifyRequestType::Add, settings)
            .await
            .unwrap_err();
        assert!(matches!(err, GcsError::Invalid(_)));
    }

    #[tokio::test]
    async fn network_add_without_owning_container_caches_on_namespace() {
        let host = make_host(false);
        let adapter = serde_json::json!({
            "Id": "a1",
            "NamespaceId": "NS-1",
        });
        host.modify_network(ModifyRequestType::Add, adapter).await.unwrap();
        let namespaces = host.namespaces.lock().await;
        assert_eq!(namespaces.get("ns-1").unwrap().adapters.len(), 1);
    }

    #[tokio::test]
    async fn delete_container_state_is_busy_while_processes_are_live() {
        let host = make_host(false);
        let spec = OciSpec(serde_json::json!({}));
        host.create_container("c1".into(), spec, VsockStdioRelaySettings::default()).await.unwrap();
        let err = host.delete_container_state("c1").await.unwrap_err();
        assert!(matches!(err, GcsError::Busy(_)));
        assert!(host.get_container("c1").await.is_ok(), "entry must remain for a later retry");
    }

    #[tokio::test]
    async fn delete_container_state_tears_down_and_removes_entry_once_init_exited() {
        let (host, init_handle) = make_host_with_init(false);
        let spec = OciSpec(serde_json::json!({}));
        let container = host
            .create_container("c1".into(), spec, VsockStdioRelaySettings::default())
            .await
            .unwrap();
        container.start(StdioOptions::default()).await.unwrap();

        init_handle.fire_exit(0);
        container.wait().await;

        host.delete_container_state("c1").await.unwrap();
        assert!(matches!(
            host.get_container("c1").await.unwrap_err(),
            GcsError::NotFound(_)
        ));
    }
}
