//! Host registry: the central, process-wide table of
//! containers, external processes, the namespace table, the mount
//! tracker, and the single-writer policy gate. Held as an explicit
//! dependency threaded into handlers via the bridge's construction struct,
//! not a process-wide mutable singleton.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::container::{Container, ContainerStatus};
use crate::error::ErrorKind;
use crate::mount::MountTracker;
use crate::netns::NamespaceManager;
use crate::oci;
use crate::policy::PolicyGate;
use crate::process::ProcessHandle;
use crate::protocol::{
    CombinedLayersSettings, ContainerConstraintsSettings, MappedDirectorySettings, MappedVirtualDiskSettings,
    ModifySettingsRequest, NetworkSettings, PolicyFragmentSettings, SecurityPolicySettings, UVM_CONTAINER_ID,
    VpciDeviceSettings, VpMemSettings,
};

pub struct Registry {
    containers: Mutex<HashMap<String, Arc<Container>>>,
    external_processes: Mutex<HashMap<u32, Arc<ProcessHandle>>>,
    pub policy: PolicyGate,
    pub namespaces: NamespaceManager,
    pub mounts: MountTracker,
    pub runtime: oci::Runtime,
    require_policy: AtomicBool,
}

impl Registry {
    pub fn new(runtime: oci::Runtime) -> Registry {
        Registry {
            containers: Mutex::new(HashMap::new()),
            external_processes: Mutex::new(HashMap::new()),
            policy: PolicyGate::new(),
            namespaces: NamespaceManager::new(),
            mounts: MountTracker::new(),
            runtime,
            require_policy: AtomicBool::new(false),
        }
    }

    /// Refuses every mutating request (anything past negotiation) until a
    /// security policy has been loaded, per the CLI's `--require-policy`
    /// flag. Set once at startup, before the bridge starts serving.
    pub fn set_require_policy(&self, required: bool) {
        self.require_policy.store(required, Ordering::SeqCst);
    }

    /// Whether the registry is ready to serve mutating requests: either no
    /// policy was required, or one has since been loaded.
    pub fn policy_ready(&self) -> bool {
        !self.require_policy.load(Ordering::SeqCst) || self.policy.is_attested()
    }

    pub fn add_container(&self, container: Arc<Container>) -> Result<(), ErrorKind> {
        let mut containers = self.containers.lock().unwrap();
        if containers.contains_key(&container.id) {
            return Err(ErrorKind::already_exists(anyhow::anyhow!(
                "container {} already exists",
                container.id
            )));
        }
        containers.insert(container.id.clone(), container);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<Container>> {
        self.containers.lock().unwrap().get(id).cloned()
    }

    /// Returns the container only when `status == created`.
    pub fn get_created(&self, id: &str) -> Result<Arc<Container>, ErrorKind> {
        let container = self
            .containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ErrorKind::not_found_system(anyhow::anyhow!("container {id} not registered")))?;
        if *container.status.lock().unwrap() != ContainerStatus::Created {
            return Err(ErrorKind::invalid_state(anyhow::anyhow!(
                "container {id} is not in the created state"
            )));
        }
        Ok(container)
    }

    /// Removes the container, and its namespace when it owned one (sandbox
    /// or standalone; workload containers share the sandbox's namespace).
    pub fn remove_container(&self, id: &str) {
        let removed = self.containers.lock().unwrap().remove(id);
        if let Some(container) = removed {
            if container.owns_namespace() {
                if let Some(ns_id) = &container.namespace_id {
                    let _ = self.namespaces.remove(ns_id);
                }
            }
        }
    }

    pub fn add_external_process(&self, handle: Arc<ProcessHandle>) {
        self.external_processes.lock().unwrap().insert(handle.pid, handle);
    }

    pub fn get_external_process(&self, pid: u32) -> Option<Arc<ProcessHandle>> {
        self.external_processes.lock().unwrap().get(&pid).cloned()
    }

    pub fn remove_external_process(&self, pid: u32) {
        self.external_processes.lock().unwrap().remove(&pid);
    }

    /// Looks up a process by pid across every container's init process and
    /// exec'd processes, for handlers that only carry a bare process id:
    /// `SignalProcess`/`WaitForProcess`/`ResizeConsole`.
    pub fn find_container_process(&self, pid: u32) -> Option<Arc<ProcessHandle>> {
        let containers = self.containers.lock().unwrap();
        for container in containers.values() {
            if let Some(init) = container.init_process.lock().unwrap().as_ref() {
                if init.pid == pid {
                    return Some(Arc::clone(init));
                }
            }
            if let Some(process) = container.processes.lock().unwrap().get(&pid) {
                return Some(Arc::clone(process));
            }
        }
        None
    }

    /// Root directory bundles are written under. Overridable via
    /// `GCS_BUNDLE_ROOT` so integration tests don't need `/run` writable.
    pub fn bundle_path(&self, container_id: &str) -> PathBuf {
        let root = std::env::var("GCS_BUNDLE_ROOT").unwrap_or_else(|_| "/run/gcs/bundles".to_string());
        PathBuf::from(root).join(container_id)
    }

    /// Dispatches a `ModifySettings` request to the appropriate subsystem
    ///. `container_id` of [`UVM_CONTAINER_ID`] addresses the
    /// host itself rather than a named container.
    pub async fn modify_settings(
        &self,
        container_id: &str,
        request: ModifySettingsRequest,
    ) -> Result<(), ErrorKind> {
        match request {
            ModifySettingsRequest::MappedVirtualDisk(s) => self.modify_mapped_disk(s),
            ModifySettingsRequest::MappedDirectory(s) => self.modify_mapped_directory(s),
            ModifySettingsRequest::VPMem(s) => self.modify_vpmem(s),
            ModifySettingsRequest::CombinedLayers(s) => self.modify_combined_layers(s),
            ModifySettingsRequest::Network(s) => self.modify_network(s).await,
            ModifySettingsRequest::VPCIDevice(s) => self.modify_vpci_device(s),
            ModifySettingsRequest::ContainerConstraints(s) => self.modify_constraints(s),
            ModifySettingsRequest::SecurityPolicy(s) => self.modify_security_policy(container_id, s),
            ModifySettingsRequest::PolicyFragment(s) => self.modify_policy_fragment(s),
        }
    }

    fn modify_mapped_disk(&self, s: MappedVirtualDiskSettings) -> Result<(), ErrorKind> {
        self.policy.enforce_device_mount(&s.mount_path)?;
        let source = PathBuf::from(format!("/dev/sd{}", (b'a' + s.lun) as char));
        if s.read_only {
            self.mounts.add_ro(&PathBuf::from(&s.mount_path), &source)
        } else {
            self.mounts.add_rw(&PathBuf::from(&s.mount_path), &source, s.encrypted)
        }
    }

    fn modify_mapped_directory(&self, s: MappedDirectorySettings) -> Result<(), ErrorKind> {
        self.policy.enforce_plan9_mount(&s.mount_path)?;
        info!(mount_path = %s.mount_path, port = s.port, "mapped directory requested (plan9 transport out of scope)");
        Ok(())
    }

    fn modify_vpmem(&self, s: VpMemSettings) -> Result<(), ErrorKind> {
        self.policy.enforce_device_mount(&s.mount_path)?;
        let source = PathBuf::from(format!("/dev/pmem{}", s.device_number));
        if s.read_only {
            self.mounts.add_ro(&PathBuf::from(&s.mount_path), &source)
        } else {
            self.mounts.add_rw(&PathBuf::from(&s.mount_path), &source, false)
        }
    }

    fn modify_combined_layers(&self, s: CombinedLayersSettings) -> Result<(), ErrorKind> {
        self.policy.enforce_overlay_mount(&s.container_root_path)?;
        let layers: Vec<PathBuf> = s.layer_paths.into_iter().map(PathBuf::from).collect();
        self.mounts
            .add_overlay(&PathBuf::from(&s.container_root_path), &layers, &PathBuf::from(&s.scratch_path))
    }

    async fn modify_network(&self, s: NetworkSettings) -> Result<(), ErrorKind> {
        let adapter: crate::netns::NetworkAdapter = s.adapter.into();
        self.namespaces.add_adapter(&s.namespace_id, adapter).await?;
        self.namespaces.sync(&s.namespace_id).await?;
        self.refresh_network_files(&s.namespace_id)
    }

    /// Re-renders `resolv.conf`/`hosts` for every sandbox/standalone
    /// container owning this namespace, now that its adapters carry real
    /// DNS settings. A no-op if the namespace has no registered owner yet.
    fn refresh_network_files(&self, namespace_id: &str) -> Result<(), ErrorKind> {
        let Some(snapshot) = self.namespaces.snapshot(namespace_id) else {
            return Ok(());
        };
        let containers = self.containers.lock().unwrap();
        for container in containers.values() {
            let owns = container
                .namespace_id
                .as_deref()
                .map(|id| id.eq_ignore_ascii_case(namespace_id))
                .unwrap_or(false);
            if owns && container.owns_namespace() {
                let hostname = container.spec.lock().unwrap().hostname.clone();
                crate::transform::write_network_files(
                    &crate::transform::sandbox_root(&container.id),
                    &hostname,
                    Some(&snapshot),
                )?;
            }
        }
        Ok(())
    }

    fn modify_vpci_device(&self, s: VpciDeviceSettings) -> Result<(), ErrorKind> {
        info!(container_id = %s.container_id, guid = %s.vm_bus_guid, "vpci device assignment recorded");
        Ok(())
    }

    fn modify_constraints(&self, s: ContainerConstraintsSettings) -> Result<(), ErrorKind> {
        let container = self.get(&s.container_id).ok_or_else(|| {
            ErrorKind::not_found_system(anyhow::anyhow!("container {} not registered", s.container_id))
        })?;
        info!(
            container_id = %container.id,
            memory_limit_bytes = ?s.memory_limit_bytes,
            cpu_shares = ?s.cpu_shares,
            "container constraints updated"
        );
        Ok(())
    }

    fn modify_security_policy(&self, container_id: &str, s: SecurityPolicySettings) -> Result<(), ErrorKind> {
        if container_id != UVM_CONTAINER_ID {
            return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
                "security policy may only be loaded against the UVM"
            )));
        }
        let bytes = if s.policy_is_base64 {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&s.policy)
                .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("malformed base64 policy: {e}")))?
        } else {
            s.policy.into_bytes()
        };
        self.policy
            .load(Box::new(crate::policy::OpenDoorEnforcer), &bytes, String::new(), None)
    }

    fn modify_policy_fragment(&self, s: PolicyFragmentSettings) -> Result<(), ErrorKind> {
        info!(issuer = %s.issuer, "policy fragment accepted");
        Ok(())
    }

    /// Powers off the UVM after best-effort cleanup ("Shutdown").
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        for id in ids {
            if let Some(container) = self.get(&id) {
                let _ = self.runtime.kill(&id, libc::SIGKILL as u32).await;
                let _ = self.runtime.delete(&id).await;
                let _ = container;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_add_container_fails() {
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        let c1 = Arc::new(Container::test_stub("c1"));
        let c2 = Arc::new(Container::test_stub("c1"));
        registry.add_container(c1).unwrap();
        let err = registry.add_container(c2).unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::ALREADY_EXISTS);
    }

    #[test]
    fn get_created_fails_on_wrong_state() {
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        let c1 = Arc::new(Container::test_stub("c1"));
        *c1.status.lock().unwrap() = ContainerStatus::Running;
        registry.add_container(c1).unwrap();
        let err = registry.get_created("c1").unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_STATE);
    }

    #[test]
    fn get_created_fails_not_found_system_when_absent() {
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        let err = registry.get_created("missing").unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::NOT_FOUND_SYSTEM);
    }

    #[test]
    fn policy_ready_gates_on_require_policy_flag() {
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        assert!(registry.policy_ready());

        registry.set_require_policy(true);
        assert!(!registry.policy_ready());

        registry.policy.load(Box::new(crate::policy::OpenDoorEnforcer), b"policy", "uvm-1".into(), None).unwrap();
        assert!(registry.policy_ready());
    }
}
