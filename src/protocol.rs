//! Message catalogue: the JSON payload types carried inside
//! codec frames. Every struct is `#[serde(rename_all = "camelCase")]`,
//! matching every payload struct in `vcontrol`/`rootfs/vcontrol`
//! (`UsbAttachDevice`, `HostDiskStats`, ...).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::oci;

/// Reserved container id addressing the UVM itself rather than a named
/// container ("host-level targets are addressed by a reserved
/// UVM id").
pub const UVM_CONTAINER_ID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl ErrorRecord {
    pub fn from_error(err: &crate::error::ErrorKind) -> ErrorRecord {
        ErrorRecord {
            message: err.to_string(),
            stack_trace: None,
        }
    }
}

/// The envelope wrapped around every response. `payload` is
/// flattened so the wire shape matches "base fields plus operation-specific
/// fields at the same level", as the host protocol expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope<T> {
    pub result: i32,
    pub activity_id: Uuid,
    #[serde(default)]
    pub error_records: Vec<ErrorRecord>,
    #[serde(flatten)]
    pub payload: T,
}

impl<T: Default> ResponseEnvelope<T> {
    pub fn ok(activity_id: Uuid, payload: T) -> ResponseEnvelope<T> {
        ResponseEnvelope {
            result: 0,
            activity_id,
            error_records: Vec::new(),
            payload,
        }
    }

    pub fn err(activity_id: Uuid, error: &crate::error::ErrorKind) -> ResponseEnvelope<T> {
        ResponseEnvelope {
            result: error.hresult(),
            activity_id,
            error_records: vec![ErrorRecord::from_error(error)],
            payload: T::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ContainerRole {
    Sandbox,
    Workload,
    Standalone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmHostedContainerSettings {
    pub container_id: String,
    pub role: ContainerRole,
    /// For workload containers, the sandbox they share a namespace with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_container_id: Option<String>,
    pub oci_spec: oci::Spec,
    pub oci_bundle_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerRequest {
    pub container_id: String,
    pub settings: VmHostedContainerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StartContainerResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioRelaySettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdin_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr_port: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteProcessSettings {
    pub container_id: String,
    pub process_parameters: oci::Process,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdio_relay_settings: Option<StdioRelaySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteProcessResponse {
    pub process_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessRequest {
    pub process_id: u32,
    pub signal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SignalProcessResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownContainerRequest {
    pub container_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownContainerResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitForProcessRequest {
    pub process_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_in_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WaitForProcessResponse {
    pub exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeConsoleRequest {
    pub process_id: u32,
    pub height: u16,
    pub width: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResizeConsoleResponse {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetPropertiesRequest {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessDetails {
    pub process_id: u32,
    pub is_init: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GetPropertiesResponse {
    pub process_list: Vec<ProcessDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<oci::ContainerStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateProtocolRequest {
    pub min_version: u32,
    pub max_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NegotiateProtocolResponse {
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedVirtualDiskSettings {
    pub mount_path: String,
    pub lun: u8,
    pub read_only: bool,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedDirectorySettings {
    pub mount_path: String,
    pub port: u32,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpMemSettings {
    pub mount_path: String,
    pub device_number: u32,
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedLayersSettings {
    pub container_root_path: String,
    pub layer_paths: Vec<String>,
    pub scratch_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAdapterSettings {
    pub id: String,
    #[serde(default)]
    pub vpci_assigned: bool,
    #[serde(default)]
    pub ip_configs: Vec<IpConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub dns_suffix: String,
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub encap_overhead: u32,
    #[serde(default)]
    pub enable_low_metric: bool,
    #[serde(default)]
    pub policy_based_routing: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpConfig {
    pub addr: String,
    pub prefix: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<String>,
    #[serde(default)]
    pub metric: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSettings {
    pub namespace_id: String,
    pub adapter: NetworkAdapterSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpciDeviceSettings {
    pub container_id: String,
    pub vm_bus_guid: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConstraintsSettings {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityPolicySettings {
    pub policy: String,
    #[serde(default)]
    pub policy_is_base64: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFragmentSettings {
    pub fragment: String,
    pub issuer: String,
}

/// `ModifySettings` dispatches on `resourceType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "resourceType", content = "settings")]
pub enum ModifySettingsRequest {
    MappedVirtualDisk(MappedVirtualDiskSettings),
    MappedDirectory(MappedDirectorySettings),
    VPMem(VpMemSettings),
    CombinedLayers(CombinedLayersSettings),
    Network(NetworkSettings),
    VPCIDevice(VpciDeviceSettings),
    ContainerConstraints(ContainerConstraintsSettings),
    SecurityPolicy(SecurityPolicySettings),
    PolicyFragment(PolicyFragmentSettings),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifySettingsEnvelope {
    pub container_id: String,
    #[serde(flatten)]
    pub request: ModifySettingsRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModifySettingsResponse {}

/// Published through the bridge as an unsolicited notification: carries the
/// reserved notification message type with `id = 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerExitNotification {
    pub container_id: String,
    pub exit_code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_envelope_round_trips_through_json() {
        let env = ResponseEnvelope::ok(Uuid::nil(), ExecuteProcessResponse { process_id: 7 });
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"processId\":7"));
        let back: ResponseEnvelope<ExecuteProcessResponse> = serde_json::from_str(&text).unwrap();
        assert_eq!(back.payload.process_id, 7);
        assert_eq!(back.result, 0);
    }

    #[test]
    fn error_envelope_carries_hresult_and_message() {
        let err = crate::error::ErrorKind::already_exists(anyhow::anyhow!("dup"));
        let env: ResponseEnvelope<CreateContainerResponse> = ResponseEnvelope::err(Uuid::nil(), &err);
        assert_eq!(env.result, crate::error::hresult::ALREADY_EXISTS);
        assert_eq!(env.error_records.len(), 1);
    }

    #[test]
    fn modify_settings_discriminates_on_resource_type() {
        let text = r#"{"resourceType":"Network","settings":{"namespaceId":"ns","adapter":{"id":"a1"}}}"#;
        let parsed: ModifySettingsRequest = serde_json::from_str(text).unwrap();
        match parsed {
            ModifySettingsRequest::Network(n) => assert_eq!(n.namespace_id, "ns"),
            _ => panic!("expected Network variant"),
        }
    }
}
