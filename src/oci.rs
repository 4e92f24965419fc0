//! OCI spec types and the runtime invocation shim. The underlying runtime
//! binary and its process model are treated as opaque, reached only through
//! create/start/exec/kill/delete/wait/stats. The shim shells out to an
//! external runtime binary via
//! `tokio::process::Command`, the same idiom `vinit::startup::start_services`
//! uses to launch `chronyd`/`scon`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub additional_gids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    pub user: User,
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDevice {
    pub path: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub major: i64,
    pub minor: i64,
    #[serde(default)]
    pub file_mode: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxDeviceCgroup {
    pub allow: bool,
    #[serde(default)]
    #[serde(rename = "type")]
    pub device_type: Option<String>,
    #[serde(default)]
    pub major: Option<i64>,
    #[serde(default)]
    pub minor: Option<i64>,
    pub access: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LinuxResources {
    #[serde(default)]
    pub devices: Vec<LinuxDeviceCgroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    #[serde(default)]
    pub create_runtime: Vec<Hook>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Linux {
    #[serde(default)]
    pub cgroups_path: String,
    #[serde(default)]
    pub resources: LinuxResources,
    #[serde(default)]
    pub devices: Vec<LinuxDevice>,
    #[serde(default)]
    pub hooks: Hooks,
}

/// Left mostly opaque: GCS only reads `network` off this section before
/// clearing it from the spec at transform time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WindowsNetwork {
    #[serde(default)]
    pub network_namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Windows {
    #[serde(default)]
    pub network: WindowsNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Root {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spec {
    #[serde(default = "default_oci_version")]
    pub oci_version: String,
    pub root: Root,
    pub process: Process,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub linux: Linux,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub windows: Option<Windows>,
}

fn default_oci_version() -> String {
    "1.0.2".to_string()
}

impl Spec {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|s| s.as_str())
    }

    pub fn annotation_bool(&self, key: &str) -> bool {
        self.annotation(key).map(|v| v == "true").unwrap_or(false)
    }
}

/// A stats summary read from cgroup files ("Stats").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub memory_usage_bytes: u64,
    pub cpu_usage_nanoseconds: u64,
}

/// Thin wrapper over the external runtime binary (e.g. `runc`). Every call
/// shells out via `tokio::process::Command`; the runtime's own process
/// model (how it supervises the container's PID 1) is out of scope here.
#[derive(Debug, Clone)]
pub struct Runtime {
    binary: PathBuf,
}

impl Runtime {
    pub fn new(binary: impl Into<PathBuf>) -> Runtime {
        Runtime { binary: binary.into() }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, ErrorKind> {
        debug!(binary = %self.binary.display(), ?args, "invoking oci runtime");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("spawn {}: {e}", self.binary.display())))?;
        if !output.status.success() {
            warn!(
                status = ?output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "oci runtime call failed"
            );
            return Err(ErrorKind::runtime(anyhow::anyhow!(
                "{} exited with {:?}: {}",
                self.binary.display(),
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output)
    }

    pub async fn create(&self, container_id: &str, bundle: &Path) -> Result<(), ErrorKind> {
        self.run(&["create", "--bundle", bundle.to_str().unwrap_or_default(), container_id])
            .await?;
        Ok(())
    }

    pub async fn start(&self, container_id: &str) -> Result<(), ErrorKind> {
        self.run(&["start", container_id]).await?;
        Ok(())
    }

    pub async fn exec(&self, container_id: &str, process_json_path: &Path) -> Result<u32, ErrorKind> {
        let output = self
            .run(&[
                "exec",
                "--detach",
                "--process",
                process_json_path.to_str().unwrap_or_default(),
                container_id,
            ])
            .await?;
        let pid_text = String::from_utf8_lossy(&output.stdout);
        pid_text
            .trim()
            .parse()
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("runtime did not report a pid: {e}")))
    }

    pub async fn kill(&self, container_id: &str, signal: u32) -> Result<(), ErrorKind> {
        self.run(&["kill", container_id, &signal.to_string()]).await?;
        Ok(())
    }

    pub async fn delete(&self, container_id: &str) -> Result<(), ErrorKind> {
        self.run(&["delete", "--force", container_id]).await?;
        Ok(())
    }

    pub async fn wait(&self, container_id: &str) -> Result<i32, ErrorKind> {
        let state = self.state(container_id).await?;
        Ok(state.get("exitCode").and_then(|v| v.as_i64()).unwrap_or(0) as i32)
    }

    /// Queries the runtime's `state` output for the container's current
    /// init pid, available once `create` returns (the init process exists,
    /// paused before it execs the user command).
    pub async fn init_pid(&self, container_id: &str) -> Result<u32, ErrorKind> {
        let state = self.state(container_id).await?;
        state
            .get("pid")
            .and_then(|v| v.as_u64())
            .map(|p| p as u32)
            .ok_or_else(|| ErrorKind::runtime(anyhow::anyhow!("runtime state for {container_id} did not report a pid")))
    }

    async fn state(&self, container_id: &str) -> Result<serde_json::Value, ErrorKind> {
        let output = self.run(&["state", container_id]).await?;
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("malformed state output: {e}")))
    }
}
