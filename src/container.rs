//! Container supervisor: per-container lifecycle, process
//! table, exit notification, stats. Built on [`crate::oci::Runtime`]'s
//! runtime-invocation shim, the same `tokio::process::Command` idiom
//! `vinit::startup::start_services` uses for `chronyd`/`scon`.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{info, warn};

use crate::error::ErrorKind;
use crate::oci;
use crate::process::{ProcessHandle, ProcessRemoveCallback};
use crate::protocol::{ContainerRole, VmHostedContainerSettings};
use crate::registry::Registry;
use crate::transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Creating,
    Created,
    Running,
    Stopped,
}

impl ContainerStatus {
    /// Enforces the monotonic `creating -> created -> running -> stopped`
    /// lifecycle.
    fn advance(&mut self, next: ContainerStatus) -> Result<(), ErrorKind> {
        let ok = matches!(
            (*self, next),
            (ContainerStatus::Creating, ContainerStatus::Created)
                | (ContainerStatus::Created, ContainerStatus::Running)
                | (ContainerStatus::Running, ContainerStatus::Stopped)
        );
        if !ok {
            return Err(ErrorKind::invalid_state(anyhow::anyhow!(
                "cannot move container from {self:?} to {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Graceful,
    Forced,
    Unexpected,
}

/// A duplex stream that reads EOF immediately and silently discards every
/// write, used as the "null transport" when stdio is denied or unrequested;
/// avoids exposing a raw `/dev/null` handle that a caller could half-close.
#[derive(Default)]
pub struct NullStdio;

impl AsyncRead for NullStdio {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for NullStdio {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }
    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub trait DuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexStream for T {}

pub enum StdioTransport {
    Real(Box<dyn DuplexStream>),
    Null,
}

impl StdioTransport {
    pub fn is_null(&self) -> bool {
        matches!(self, StdioTransport::Null)
    }
}

pub struct Container {
    pub id: String,
    pub role: ContainerRole,
    pub sandbox_container_id: Option<String>,
    pub spec: Mutex<oci::Spec>,
    pub bundle_path: PathBuf,
    pub namespace_id: Option<String>,
    pub status: Mutex<ContainerStatus>,
    pub exit_class: Mutex<ExitClass>,
    pub init_process: Mutex<Option<Arc<ProcessHandle>>>,
    pub processes: Mutex<std::collections::HashMap<u32, Arc<ProcessHandle>>>,
    pub stdio: Mutex<StdioTransport>,
}

impl Container {
    /// Sandbox and standalone containers own their namespace; workload
    /// containers share the sandbox's ("RemoveContainer").
    pub fn owns_namespace(&self) -> bool {
        matches!(self.role, ContainerRole::Sandbox | ContainerRole::Standalone)
    }

    #[cfg(test)]
    pub(crate) fn test_stub(id: &str) -> Container {
        Container {
            id: id.to_string(),
            role: ContainerRole::Standalone,
            sandbox_container_id: None,
            spec: Mutex::new(test_spec()),
            bundle_path: PathBuf::from(format!("/run/gcs/bundles/{id}")),
            namespace_id: None,
            status: Mutex::new(ContainerStatus::Created),
            exit_class: Mutex::new(ExitClass::Unexpected),
            init_process: Mutex::new(None),
            processes: Mutex::new(std::collections::HashMap::new()),
            stdio: Mutex::new(StdioTransport::Null),
        }
    }
}

#[cfg(test)]
fn test_spec() -> oci::Spec {
    serde_json::from_str(r#"{"root":{"path":"/"},"process":{"user":{"uid":0,"gid":0},"args":["/bin/sh"]}}"#).unwrap()
}

struct RemoveFromContainer {
    container: Arc<Container>,
}

impl ProcessRemoveCallback for RemoveFromContainer {
    fn on_removed(&self, pid: u32) {
        self.container.processes.lock().unwrap().remove(&pid);
    }
}

/// Handles `Create`. Branches on role, runs the spec
/// transformer, enforces policy, invokes the runtime, and registers the
/// resulting container. On any failure after the container is added to the
/// registry, it is removed and the bundle directory cleaned up.
pub async fn create(registry: &Registry, req: VmHostedContainerSettings) -> Result<(), ErrorKind> {
    let container_id = req.container_id.clone();
    let mut spec = req.oci_spec;

    let namespace_id = spec
        .windows
        .as_ref()
        .map(|w| w.network.network_namespace.clone())
        .filter(|s| !s.is_empty());

    let sandbox_dir = match req.role {
        ContainerRole::Workload => {
            let sandbox_id = req
                .sandbox_container_id
                .clone()
                .ok_or_else(|| ErrorKind::invalid_arg(anyhow::anyhow!("workload container missing sandbox id")))?;
            if registry.get(&sandbox_id).is_none() {
                return Err(ErrorKind::not_found_system(anyhow::anyhow!("sandbox {sandbox_id} not registered")));
            }
            Some(transform::sandbox_root(&sandbox_id))
        }
        _ => None,
    };

    // No adapters are attached yet at create time; `resolv.conf`/`hosts` are
    // regenerated once real DNS settings exist, in
    // `Registry::modify_network` after each `Sync`.
    transform::transform(&mut spec, &container_id, req.role, None, sandbox_dir.as_deref())?;

    let decision = registry.policy.enforce_create_container(&container_id, &spec)?;
    if !decision.allow_stdio {
        warn!(container_id = %container_id, "policy denied stdio, using null transport");
    }
    if let Some(env) = decision.reduced_env {
        spec.process.env = env;
    }
    // The real vsock-backed relay is wired in once a container is started
    // and a host connection is attached; until then every container's
    // stdio is the null transport.
    let stdio = StdioTransport::Null;

    let bundle_path = registry.bundle_path(&container_id);
    if let Err(e) = write_bundle(&bundle_path, &spec) {
        return Err(e);
    }

    let container = Arc::new(Container {
        id: container_id.clone(),
        role: req.role,
        sandbox_container_id: req.sandbox_container_id.clone(),
        spec: Mutex::new(spec.clone()),
        bundle_path: bundle_path.clone(),
        namespace_id: namespace_id.clone(),
        status: Mutex::new(ContainerStatus::Creating),
        exit_class: Mutex::new(ExitClass::Unexpected),
        init_process: Mutex::new(None),
        processes: Mutex::new(std::collections::HashMap::new()),
        stdio: Mutex::new(stdio),
    });

    registry.add_container(Arc::clone(&container))?;

    if let Err(e) = finish_create(registry, &container, &spec, &bundle_path).await {
        registry.remove_container(&container_id);
        let _ = std::fs::remove_dir_all(&bundle_path);
        return Err(e);
    }

    Ok(())
}

async fn finish_create(
    registry: &Registry,
    container: &Arc<Container>,
    spec: &oci::Spec,
    bundle_path: &std::path::Path,
) -> Result<(), ErrorKind> {
    registry.runtime.create(&container.id, bundle_path).await?;

    let pid = registry.runtime.init_pid(&container.id).await?;
    let init = ProcessHandle::spawn(
        pid,
        true,
        spec.process.clone(),
        registry.runtime.clone(),
        container.id.clone(),
        Arc::new(RemoveFromContainer { container: Arc::clone(container) }),
    );
    *container.init_process.lock().unwrap() = Some(Arc::clone(&init));
    container.processes.lock().unwrap().insert(pid, init);

    container.status.lock().unwrap().advance(ContainerStatus::Created)?;

    if container.owns_namespace() {
        if let Some(ns_id) = &container.namespace_id {
            registry.namespaces.assign_container_pid(ns_id, pid)?;
            registry.namespaces.sync(ns_id).await?;
        }
    }

    Ok(())
}

fn write_bundle(bundle_path: &std::path::Path, spec: &oci::Spec) -> Result<(), ErrorKind> {
    std::fs::create_dir_all(bundle_path)
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("creating bundle dir: {e}")))?;
    let config_path = bundle_path.join("config.json");
    let text = serde_json::to_vec_pretty(spec)
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("marshaling oci spec: {e}")))?;
    std::fs::write(config_path, text).map_err(|e| ErrorKind::runtime(anyhow::anyhow!("writing config.json: {e}")))
}

/// Handles `Start`: connects stdio using the container's
/// current transport and starts the process tree.
pub async fn start(registry: &Registry, container: &Arc<Container>) -> Result<(), ErrorKind> {
    registry.runtime.start(&container.id).await?;
    container.status.lock().unwrap().advance(ContainerStatus::Running)?;
    info!(container_id = %container.id, "container started");
    Ok(())
}

/// Handles `ExecuteProcess` for an in-container process ("Exec").
pub async fn exec(
    registry: &Registry,
    container: &Arc<Container>,
    mut process_spec: oci::Process,
) -> Result<Arc<ProcessHandle>, ErrorKind> {
    if process_spec.user.uid == 0 && process_spec.user.gid == 0 {
        let base = container.spec.lock().unwrap();
        process_spec.user = base.process.user.clone();
    }

    registry.policy.enforce_exec_in_container(&container.id, &process_spec)?;

    let process_path = container.bundle_path.join(format!("exec-{}.json", uuid::Uuid::new_v4()));
    std::fs::write(
        &process_path,
        serde_json::to_vec(&process_spec).map_err(|e| ErrorKind::runtime(anyhow::anyhow!("marshaling process spec: {e}")))?,
    )
    .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("writing exec process spec: {e}")))?;

    let pid = registry.runtime.exec(&container.id, &process_path).await?;
    let handle = ProcessHandle::spawn(
        pid,
        false,
        process_spec,
        registry.runtime.clone(),
        container.id.clone(),
        Arc::new(RemoveFromContainer { container: Arc::clone(container) }),
    );
    container.processes.lock().unwrap().insert(pid, Arc::clone(&handle));
    Ok(handle)
}

/// Handles `SignalProcess`/`ShutdownGraceful`/`ShutdownForced` against the
/// container's init process ("Kill / Shutdown").
pub async fn kill(registry: &Registry, container: &Arc<Container>, graceful: bool) -> Result<(), ErrorKind> {
    registry.policy.enforce_signal_container_process(&container.id, if graceful { 15 } else { 9 })?;

    let init = container
        .init_process
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| ErrorKind::invalid_state(anyhow::anyhow!("container {} has no init process", container.id)))?;

    let signal = if graceful { libc::SIGTERM } else { libc::SIGKILL } as u32;
    init.signal(signal)?;
    *container.exit_class.lock().unwrap() = if graceful { ExitClass::Graceful } else { ExitClass::Forced };
    Ok(())
}

/// Handles `Delete`: for sandboxes, unmounts everything under
/// the sandbox mount roots before invoking the runtime's delete.
pub async fn delete(registry: &Registry, container: &Arc<Container>) -> Result<(), ErrorKind> {
    if *container.status.lock().unwrap() != ContainerStatus::Stopped {
        return Err(ErrorKind::invalid_state(anyhow::anyhow!(
            "container {} must be stopped before it can be deleted",
            container.id
        )));
    }

    if container.role == ContainerRole::Sandbox {
        let root = transform::sandbox_root(&container.id);
        for sub in ["sandboxMounts", "hugepages"] {
            let path = root.join(sub);
            let _ = nix::mount::umount2(&path, nix::mount::MntFlags::MNT_DETACH);
        }
    }

    registry.runtime.delete(&container.id).await?;
    registry.remove_container(&container.id);
    Ok(())
}

/// Handles `GetProperties` with a stats query ("Stats"): reads
/// cgroup metrics, ignoring `ENOENT` (the container may have already
/// exited).
pub fn stats(container: &Arc<Container>) -> oci::ContainerStats {
    let cgroups_path = container.spec.lock().unwrap().linux.cgroups_path.clone();
    let memory_path = format!("/sys/fs/cgroup/memory{cgroups_path}/memory.current");
    let cpu_path = format!("/sys/fs/cgroup/cpu{cgroups_path}/cpu.stat");

    let memory_usage_bytes = std::fs::read_to_string(memory_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    let cpu_usage_nanoseconds = std::fs::read_to_string(cpu_path)
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("usage_usec"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|v| v.parse::<u64>().ok())
        })
        .map(|usec| usec * 1000)
        .unwrap_or(0);

    oci::ContainerStats { memory_usage_bytes, cpu_usage_nanoseconds }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_are_monotonic() {
        let mut status = ContainerStatus::Creating;
        status.advance(ContainerStatus::Created).unwrap();
        status.advance(ContainerStatus::Running).unwrap();
        status.advance(ContainerStatus::Stopped).unwrap();
        assert_eq!(status, ContainerStatus::Stopped);
    }

    #[test]
    fn status_cannot_skip_or_go_backwards() {
        let mut status = ContainerStatus::Creating;
        assert!(status.advance(ContainerStatus::Running).is_err());
        status.advance(ContainerStatus::Created).unwrap();
        assert!(status.advance(ContainerStatus::Creating).is_err());
    }

    #[tokio::test]
    async fn null_stdio_reads_eof_and_discards_writes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stdio = NullStdio;
        let mut buf = [0u8; 16];
        let n = stdio.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        let written = stdio.write(b"hello").await.unwrap();
        assert_eq!(written, 5);
    }

    #[test]
    fn delete_before_stopped_is_invalid_state() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        let container = Arc::new(Container::test_stub("c1"));
        *container.status.lock().unwrap() = ContainerStatus::Running;
        let err = rt.block_on(delete(&registry, &container)).unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_STATE);
    }

    #[tokio::test]
    async fn kill_without_init_process_is_invalid_state() {
        let registry = Registry::new(oci::Runtime::new("/bin/true"));
        let container = Arc::new(Container::test_stub("c1"));
        let err = kill(&registry, &container, true).await.unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_STATE);
    }

    #[test]
    fn stats_defaults_to_zero_when_cgroup_files_are_absent() {
        let container = Arc::new(Container::test_stub("nonexistent-cgroup-target"));
        let s = stats(&container);
        assert_eq!(s.memory_usage_bytes, 0);
        assert_eq!(s.cpu_usage_nanoseconds, 0);
    }
}
