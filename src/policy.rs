//! Security-policy enforcement gate. Attestation hardware
//! access and policy-language evaluation are treated as external
//! collaborators out of scope here; this module owns the fixed decision API
//! every mutating handler calls through, plus the one-shot policy-loading
//! latch.
//!
//! Earlier designs of this kind of gate tend to grow two coexisting
//! policy-related packages with subtly different namespaces; that
//! duplication is not reproduced here — [`PolicyState`]/[`Enforcer`] is the
//! single fold-in point.

use std::sync::RwLock;

use sha2::{Digest, Sha256};

use crate::error::ErrorKind;
use crate::oci;

/// The outcome of a single policy check. A denial is not necessarily an
/// error: stdio denial downgrades the container's transport instead of
/// failing the call.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub reduced_env: Option<Vec<String>>,
    pub allow_stdio: bool,
}

impl Decision {
    pub fn allow() -> Decision {
        Decision { allowed: true, reason: None, reduced_env: None, allow_stdio: true }
    }

    pub fn deny(reason: impl Into<String>) -> Decision {
        Decision { allowed: false, reason: Some(reason.into()), reduced_env: None, allow_stdio: true }
    }

    pub fn allow_with_env(env: Vec<String>) -> Decision {
        Decision { allowed: true, reason: None, reduced_env: Some(env), allow_stdio: true }
    }

    pub fn deny_stdio() -> Decision {
        Decision { allowed: true, reason: None, reduced_env: None, allow_stdio: false }
    }

    pub fn into_result(self) -> Result<Decision, ErrorKind> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ErrorKind::policy(self.reason.unwrap_or_else(|| "denied by policy".into())))
        }
    }
}

/// The fixed decision surface. A confidential deployment wires
/// in a real Rego-style engine here; tests and non-confidential deployments
/// use [`OpenDoorEnforcer`].
pub trait Enforcer: Send + Sync {
    fn enforce_create_container(&self, container_id: &str, spec: &oci::Spec) -> Decision;
    fn enforce_exec_in_container(&self, container_id: &str, process: &oci::Process) -> Decision;
    fn enforce_exec_external(&self, process: &oci::Process) -> Decision;
    fn enforce_device_mount(&self, path: &str) -> Decision;
    fn enforce_device_unmount(&self, path: &str) -> Decision;
    fn enforce_overlay_mount(&self, path: &str) -> Decision;
    fn enforce_overlay_unmount(&self, path: &str) -> Decision;
    fn enforce_scratch_mount(&self, path: &str) -> Decision;
    fn enforce_plan9_mount(&self, path: &str) -> Decision;
    fn enforce_plan9_unmount(&self, path: &str) -> Decision;
    fn enforce_signal_container_process(&self, container_id: &str, signal: u32) -> Decision;
    fn enforce_shutdown_container(&self, container_id: &str) -> Decision;
    fn enforce_get_properties(&self, container_id: &str) -> Decision;
    fn enforce_dump_stacks(&self) -> Decision;
    fn enforce_runtime_logging(&self) -> Decision;
    fn enforce_properties_access(&self, container_id: &str) -> Decision;
}

/// Allows every operation and every stdio request. The default enforcer
/// before a policy is loaded, and for deployments with no confidential
/// hardware in play.
pub struct OpenDoorEnforcer;

impl Enforcer for OpenDoorEnforcer {
    fn enforce_create_container(&self, _container_id: &str, _spec: &oci::Spec) -> Decision {
        Decision::allow()
    }
    fn enforce_exec_in_container(&self, _container_id: &str, _process: &oci::Process) -> Decision {
        Decision::allow()
    }
    fn enforce_exec_external(&self, _process: &oci::Process) -> Decision {
        Decision::allow()
    }
    fn enforce_device_mount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_device_unmount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_overlay_mount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_overlay_unmount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_scratch_mount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_plan9_mount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_plan9_unmount(&self, _path: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_signal_container_process(&self, _container_id: &str, _signal: u32) -> Decision {
        Decision::allow()
    }
    fn enforce_shutdown_container(&self, _container_id: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_get_properties(&self, _container_id: &str) -> Decision {
        Decision::allow()
    }
    fn enforce_dump_stacks(&self) -> Decision {
        Decision::allow()
    }
    fn enforce_runtime_logging(&self) -> Decision {
        Decision::allow()
    }
    fn enforce_properties_access(&self, _container_id: &str) -> Decision {
        Decision::allow()
    }
}

pub struct PolicyState {
    pub enforcer: Box<dyn Enforcer>,
    pub attested: bool,
    pub uvm_reference: String,
    pub host_data_digest: Vec<u8>,
}

/// Owns the single latch-once policy state ("policy state is
/// owned by the host registry with single-writer semantics").
pub struct PolicyGate {
    state: RwLock<PolicyState>,
}

impl Default for PolicyGate {
    fn default() -> Self {
        PolicyGate {
            state: RwLock::new(PolicyState {
                enforcer: Box::new(OpenDoorEnforcer),
                attested: false,
                uvm_reference: String::new(),
                host_data_digest: Vec::new(),
            }),
        }
    }
}

impl PolicyGate {
    pub fn new() -> PolicyGate {
        Self::default()
    }

    /// Loads a policy exactly once. `host_data` is the attestation report's
    /// `HostData` field, present only on confidential hardware; when
    /// present, the policy digest must match it.
    pub fn load(
        &self,
        enforcer: Box<dyn Enforcer>,
        policy_bytes: &[u8],
        uvm_reference: String,
        host_data: Option<&[u8]>,
    ) -> Result<(), ErrorKind> {
        let mut state = self.state.write().unwrap();
        if state.attested {
            return Err(ErrorKind::invalid_state(anyhow::anyhow!("policy already loaded")));
        }

        let digest = Sha256::digest(policy_bytes).to_vec();
        if let Some(expected) = host_data {
            if expected != digest.as_slice() {
                return Err(ErrorKind::policy("policy digest does not match attested HostData"));
            }
        }

        *state = PolicyState {
            enforcer,
            attested: true,
            uvm_reference,
            host_data_digest: digest,
        };
        Ok(())
    }

    pub fn is_attested(&self) -> bool {
        self.state.read().unwrap().attested
    }

    pub fn enforce_create_container(&self, container_id: &str, spec: &oci::Spec) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_create_container(container_id, spec).into_result()
    }

    pub fn enforce_exec_in_container(&self, container_id: &str, process: &oci::Process) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_exec_in_container(container_id, process).into_result()
    }

    pub fn enforce_exec_external(&self, process: &oci::Process) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_exec_external(process).into_result()
    }

    pub fn enforce_device_mount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_device_mount(path).into_result()
    }

    pub fn enforce_device_unmount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_device_unmount(path).into_result()
    }

    pub fn enforce_overlay_mount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_overlay_mount(path).into_result()
    }

    pub fn enforce_overlay_unmount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_overlay_unmount(path).into_result()
    }

    pub fn enforce_scratch_mount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_scratch_mount(path).into_result()
    }

    pub fn enforce_signal_container_process(&self, container_id: &str, signal: u32) -> Result<Decision, ErrorKind> {
        self.state
            .read()
            .unwrap()
            .enforcer
            .enforce_signal_container_process(container_id, signal)
            .into_result()
    }

    pub fn enforce_shutdown_container(&self, container_id: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_shutdown_container(container_id).into_result()
    }

    pub fn enforce_get_properties(&self, container_id: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_get_properties(container_id).into_result()
    }

    pub fn enforce_plan9_mount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_plan9_mount(path).into_result()
    }

    pub fn enforce_plan9_unmount(&self, path: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_plan9_unmount(path).into_result()
    }

    pub fn enforce_dump_stacks(&self) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_dump_stacks().into_result()
    }

    pub fn enforce_runtime_logging(&self) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_runtime_logging().into_result()
    }

    pub fn enforce_properties_access(&self, container_id: &str) -> Result<Decision, ErrorKind> {
        self.state.read().unwrap().enforcer.enforce_properties_access(container_id).into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> oci::Spec {
        serde_json::from_str(
            r#"{"root":{"path":"/"},"process":{"user":{"uid":0,"gid":0},"args":["/bin/sh"]}}"#,
        )
        .unwrap()
    }

    #[test]
    fn open_door_allows_everything() {
        let gate = PolicyGate::new();
        assert!(gate.enforce_create_container("c1", &test_spec()).unwrap().allowed);
    }

    #[test]
    fn policy_loads_exactly_once() {
        let gate = PolicyGate::new();
        gate.load(Box::new(OpenDoorEnforcer), b"policy-text", "uvm-1".into(), None).unwrap();
        assert!(gate.is_attested());
        let err = gate
            .load(Box::new(OpenDoorEnforcer), b"policy-text-2", "uvm-1".into(), None)
            .unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_STATE);
    }

    #[test]
    fn host_data_mismatch_aborts_load() {
        let gate = PolicyGate::new();
        let err = gate
            .load(Box::new(OpenDoorEnforcer), b"policy-text", "uvm-1".into(), Some(b"not-the-digest"))
            .unwrap_err();
        assert!(!gate.is_attested());
        assert_eq!(err.hresult(), crate::error::hresult::FAIL);
    }

    #[test]
    fn denial_surfaces_generic_failure_hresult() {
        let denied = Decision::deny("no").into_result().unwrap_err();
        assert_eq!(denied.hresult(), crate::error::hresult::FAIL);
    }
}
