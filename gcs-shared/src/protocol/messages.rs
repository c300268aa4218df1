//! JSON payload types carried inside a frame.
//!
//! Field names follow the wire convention: `ContainerID`,
//! `ProcessID`, `ActivityID` in prose become `ContainerId`, `ProcessId`,
//! `ActivityId` on the wire; everything else keeps its Rust name via
//! `#[serde(rename_all = "PascalCase")]`. Optional fields are omitted
//! when empty via `skip_serializing_if`, and default on read via
//! `#[serde(default)]` so unknown/missing fields never fail decode.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

fn is_zero(v: &i32) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// One entry in a response's `ErrorRecords` array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorRecord {
    pub result: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub line: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub function_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stack_trace: String,
}

/// Envelope every response payload carries: success/failure code plus
/// flattened wrapped-cause records, oldest-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseBase {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub result: i32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub error_records: Vec<ErrorRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_id: Option<Uuid>,
}

impl ResponseBase {
    pub fn ok(activity_id: Option<Uuid>) -> Self {
        ResponseBase {
            result: 0,
            error_records: Vec::new(),
            activity_id,
        }
    }

    pub fn error(records: Vec<ErrorRecord>, activity_id: Option<Uuid>) -> Self {
        let result = records.first().map(|r| r.result).unwrap_or(-1);
        ResponseBase {
            result,
            error_records: records,
            activity_id,
        }
    }
}

/// Container classification, derived from the
/// `io.kubernetes.cri.container-type` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRole {
    Sandbox,
    Standalone,
    Workload,
}

impl ContainerRole {
    pub fn from_annotation(value: Option<&str>) -> Self {
        match value {
            None => ContainerRole::Standalone,
            Some("sandbox") => ContainerRole::Sandbox,
            Some(_) => ContainerRole::Workload,
        }
    }
}

/// Reserved container id denoting "the UVM itself".
pub const UVM_CONTAINER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// An OCI runtime spec, passed through opaquely except for the fields
/// the core reads or mutates. Kept as a raw JSON value because the
/// exact schema is out of scope here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciSpec(pub serde_json::Value);

impl OciSpec {
    pub fn annotations(&self) -> HashMap<String, String> {
        self.0
            .get("Annotations")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn network_namespace(&self) -> Option<String> {
        self.0
            .pointer("/Windows/Network/NetworkNamespace")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
    }

    pub fn clear_windows_section(&mut self) {
        if let Some(obj) = self.0.as_object_mut() {
            obj.remove("Windows");
        }
    }

    pub fn cgroups_path(&self) -> Option<String> {
        self.0
            .pointer("/Linux/CgroupsPath")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }

    /// Whether the init process requests a PTY.
    pub fn process_terminal(&self) -> bool {
        self.0
            .pointer("/Process/Terminal")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn mounts(&self) -> Vec<serde_json::Value> {
        self.0
            .get("Mounts")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
    }

    /// Idempotently add a mount entry (by destination) to the spec.
    pub fn add_mount_if_absent(&mut self, mount: serde_json::Value) {
        let dest = mount.get("destination").and_then(|v| v.as_str());
        let obj = self.0.as_object_mut().expect("spec root must be an object");
        let mounts = obj
            .entry("Mounts")
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let Some(arr) = mounts.as_array_mut() {
            let exists = dest.is_some_and(|d| {
                arr.iter()
                    .any(|m| m.get("destination").and_then(|v| v.as_str()) == Some(d))
            });
            if !exists {
                arr.push(mount);
            }
        }
    }

    pub fn linux_devices_mut(&mut self) -> &mut Vec<serde_json::Value> {
        let obj = self.0.as_object_mut().expect("spec root must be an object");
        let linux = obj
            .entry("Linux")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        let linux_obj = linux.as_object_mut().expect("Linux must be an object");
        let devices = linux_obj
            .entry("Devices")
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        devices.as_array_mut().expect("Devices must be an array")
    }

    pub fn set_cgroup_devices_policy_allow_all(&mut self) {
        let obj = self.0.as_object_mut().expect("spec root must be an object");
        let linux = obj
            .entry("Linux")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        let linux_obj = linux.as_object_mut().expect("Linux must be an object");
        let resources = linux_obj
            .entry("Resources")
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
        let resources_obj = resources.as_object_mut().expect("Resources must be object");
        resources_obj.insert(
            "Devices".to_string(),
            serde_json::json!([{"Allow": true, "Access": "rwm"}]),
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NegotiateProtocolRequest {
    #[serde(default)]
    pub min_version: u32,
    #[serde(default)]
    pub max_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NegotiateProtocolResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub version: u32,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    #[serde(default, skip_serializing_if = "is_false")]
    pub send_host_create_message: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub send_host_start_message: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub supports_vsock: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateRequest {
    #[serde(default)]
    pub container_id: String,
    pub settings: OciSpec,
    /// Stdio relay ports for the init process, dialed at Start time
    /// (the init process is created here but not started).
    #[serde(default)]
    pub vsock_stdio_relay_settings: VsockStdioRelaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreateResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VsockStdioRelaySettings {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub std_in: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub std_out: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub std_err: i32,
}

impl VsockStdioRelaySettings {
    pub fn any_requested(&self) -> bool {
        self.std_in != 0 || self.std_out != 0 || self.std_err != 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StartResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessSettings {
    /// Raw OCI process description (entrypoint, env, user, terminal, cwd).
    pub process_parameters: serde_json::Value,
    #[serde(default)]
    pub vsock_stdio_relay_settings: VsockStdioRelaySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessRequest {
    #[serde(default)]
    pub container_id: String,
    pub settings: ExecuteProcessSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExecuteProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub process_id: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitForProcessRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub process_id: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout_in_ms: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WaitForProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignalProcessRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub process_id: u32,
    pub signal: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignalProcessResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResizeConsoleRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResizeConsoleResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PropertyType {
    ProcessList,
    Statistics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetPropertiesRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub property_types: Vec<PropertyType>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetPropertiesResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ModifyRequestType {
    #[default]
    Add,
    Remove,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ModifyResourceType {
    MappedVirtualDisk,
    MappedDirectory,
    VPMemDevice,
    CombinedLayers,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingsRequest {
    #[serde(default)]
    pub container_id: String,
    pub resource_type: ModifyResourceType,
    #[serde(default)]
    pub request_type: ModifyRequestType,
    #[serde(default)]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ModifySettingsResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedVirtualDiskSettings {
    pub controller: u8,
    pub lun: u8,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub attach_only: bool,
    #[serde(default)]
    pub create_in_utility_vm: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappedDirectorySettings {
    pub mount_path: String,
    pub share_name: String,
    pub port: u32,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct VPMemDeviceSettings {
    pub device_number: u32,
    pub mount_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CombinedLayersSettings {
    pub container_root_path: String,
    #[serde(default)]
    pub layers: Vec<String>,
    #[serde(default)]
    pub scratch_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkAdapterSettings {
    pub id: String,
    pub namespace_id: String,
    #[serde(default)]
    pub mac_address: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dns_suffix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DumpStacksRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DumpStacksResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
    pub guest_stacks: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteContainerStateRequest {
    #[serde(default)]
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteContainerStateResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateContainerRequest {
    #[serde(default)]
    pub container_id: String,
    pub resources: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateContainerResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleNotificationRequest {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub hint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleNotificationResponse {
    #[serde(flatten)]
    pub base: ResponseBase,
}

/// `exit_type` on `Container`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ExitType {
    #[default]
    None,
    GracefulExit,
    ForcedExit,
}

/// Guest-initiated `Container` notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerNotification {
    #[serde(rename = "Type")]
    pub exit_type: ExitType,
    pub operation: String,
    pub result: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_info: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_from_annotation() {
        assert_eq!(ContainerRole::from_annotation(None), ContainerRole::Standalone);
        assert_eq!(
            ContainerRole::from_annotation(Some("sandbox")),
            ContainerRole::Sandbox
        );
        assert_eq!(
            ContainerRole::from_annotation(Some("container")),
            ContainerRole::Workload
        );
    }

    #[test]
    fn response_base_omits_zero_result_and_empty_records() {
        let base = ResponseBase::ok(None);
        let json = serde_json::to_string(&base).unwrap();
        assert_eq!(json, "{}");
    }

    #[test]
    fn response_base_error_carries_first_record_code() {
        let rec = ErrorRecord {
            result: -2,
            message: "nope".into(),
            ..Default::default()
        };
        let base = ResponseBase::error(vec![rec], None);
        assert_eq!(base.result, -2);
    }

    #[test]
    fn oci_spec_network_namespace_is_lowercased() {
        let spec = OciSpec(serde_json::json!({
            "Windows": {"Network": {"NetworkNamespace": "ABC-123"}}
        }));
        assert_eq!(spec.network_namespace().as_deref(), Some("abc-123"));
    }

    #[test]
    fn oci_spec_clear_windows_section() {
        let mut spec = OciSpec(serde_json::json!({"Windows": {"Network": {}}, "Other": 1}));
        spec.clear_windows_section();
        assert!(spec.0.get("Windows").is_none());
        assert!(spec.0.get("Other").is_some());
    }

    #[test]
    fn oci_spec_add_mount_is_idempotent() {
        let mut spec = OciSpec(serde_json::json!({"Mounts": []}));
        let mount = serde_json::json!({"destination": "/etc/resolv.conf", "type": "bind"});
        spec.add_mount_if_absent(mount.clone());
        spec.add_mount_if_absent(mount);
        assert_eq!(spec.mounts().len(), 1);
    }
}
