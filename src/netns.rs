//! Network-namespace manager: resolves host-assigned device
//! GUIDs to kernel interface names, moves interfaces into per-container
//! namespaces, and applies IP/route/rule configuration. Built on the same
//! `rtnetlink`/`netlink-packet-route` stack `vinit::startup::setup_network`
//! uses; namespace entry runs on a dedicated worker thread so `setns(2)`
//! never strands a tokio worker thread in the wrong namespace.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::TryStreamExt;
use ipnet::IpNet;
use netlink_packet_route::link::LinkAttribute;
use nix::fcntl::{open, OFlag};
use nix::sched::{setns, CloneFlags};
use nix::sys::stat::Mode;
use rtnetlink::Handle;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::protocol::{IpConfig, NetworkAdapterSettings, RouteConfig};

const ADAPTER_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(5);
const ADAPTER_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DHCP_TIMEOUT: Duration = Duration::from_secs(30);
const LOW_METRIC_TABLE: u32 = 101;
const LOW_METRIC_PRIORITY: u32 = 5;
const LOW_METRIC_VALUE: u32 = 500;

#[derive(Debug, Clone)]
pub struct NetworkAdapter {
    pub id: String,
    pub vpci_assigned: bool,
    pub ip_configs: Vec<IpConfig>,
    pub routes: Vec<RouteConfig>,
    pub dns_suffix: String,
    pub dns_servers: Vec<String>,
    pub encap_overhead: u32,
    pub enable_low_metric: bool,
    pub policy_based_routing: bool,
}

impl From<NetworkAdapterSettings> for NetworkAdapter {
    fn from(s: NetworkAdapterSettings) -> Self {
        NetworkAdapter {
            id: s.id,
            vpci_assigned: s.vpci_assigned,
            ip_configs: s.ip_configs,
            routes: s.routes,
            dns_suffix: s.dns_suffix,
            dns_servers: s.dns_servers,
            encap_overhead: s.encap_overhead,
            enable_low_metric: s.enable_low_metric,
            policy_based_routing: s.policy_based_routing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Nic {
    pub adapter: NetworkAdapter,
    pub ifname: String,
    pub assigned_pid: Option<u32>,
}

#[derive(Debug, Default, Clone)]
pub struct Namespace {
    pub id: String,
    pub assigned_pid: Option<u32>,
    pub nics: Vec<Nic>,
}

impl Namespace {
    pub fn assign_container_pid(&mut self, pid: u32) -> Result<(), ErrorKind> {
        if self.assigned_pid.is_some() {
            return Err(ErrorKind::invalid_state(anyhow::anyhow!(
                "namespace {} already has an assigned pid",
                self.id
            )));
        }
        self.assigned_pid = Some(pid);
        Ok(())
    }

    pub fn add_adapter(&mut self, nic: Nic) -> Result<(), ErrorKind> {
        if self.nics.iter().any(|n| n.adapter.id == nic.adapter.id) {
            return Err(ErrorKind::already_exists(anyhow::anyhow!(
                "adapter {} already present in namespace {}",
                nic.adapter.id,
                self.id
            )));
        }
        self.nics.push(nic);
        Ok(())
    }

    pub fn remove_adapter(&mut self, id: &str) {
        self.nics.retain(|n| n.adapter.id != id);
    }
}

/// Table of namespaces keyed by lowercased GUID.
pub struct NamespaceManager {
    namespaces: Mutex<HashMap<String, Namespace>>,
    worker: NsWorker,
}

impl NamespaceManager {
    pub fn new() -> NamespaceManager {
        NamespaceManager {
            namespaces: Mutex::new(HashMap::new()),
            worker: NsWorker::spawn(),
        }
    }

    pub fn get_or_add(&self, id: &str) -> String {
        let id = id.to_lowercase();
        let mut table = self.namespaces.lock().unwrap();
        table.entry(id.clone()).or_insert_with(|| Namespace {
            id: id.clone(),
            assigned_pid: None,
            nics: Vec::new(),
        });
        id
    }

    pub fn remove(&self, id: &str) -> Result<(), ErrorKind> {
        let id = id.to_lowercase();
        let mut table = self.namespaces.lock().unwrap();
        match table.get(&id) {
            Some(ns) if !ns.nics.is_empty() => Err(ErrorKind::invalid_state(anyhow::anyhow!(
                "namespace {id} still has adapters"
            ))),
            Some(_) => {
                table.remove(&id);
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn assign_container_pid(&self, id: &str, pid: u32) -> Result<(), ErrorKind> {
        let id = id.to_lowercase();
        let mut table = self.namespaces.lock().unwrap();
        let ns = table
            .entry(id.clone())
            .or_insert_with(|| Namespace { id, assigned_pid: None, nics: Vec::new() });
        ns.assign_container_pid(pid)
    }

    /// Resolves the adapter's ifname, then registers it on the namespace
    /// ("AddAdapter").
    pub async fn add_adapter(&self, ns_id: &str, adapter: NetworkAdapter) -> Result<(), ErrorKind> {
        let ns_id = ns_id.to_lowercase();
        {
            let table = self.namespaces.lock().unwrap();
            if let Some(ns) = table.get(&ns_id) {
                if ns.nics.iter().any(|n| n.adapter.id == adapter.id) {
                    return Err(ErrorKind::already_exists(anyhow::anyhow!(
                        "adapter {} already present",
                        adapter.id
                    )));
                }
            }
        }

        let ifname = resolve_ifname(&adapter).await?;
        let nic = Nic { adapter, ifname, assigned_pid: None };

        let mut table = self.namespaces.lock().unwrap();
        let ns = table
            .entry(ns_id.clone())
            .or_insert_with(|| Namespace { id: ns_id, assigned_pid: None, nics: Vec::new() });
        ns.add_adapter(nic)
    }

    pub fn remove_adapter(&self, ns_id: &str, adapter_id: &str) {
        let ns_id = ns_id.to_lowercase();
        let mut table = self.namespaces.lock().unwrap();
        if let Some(ns) = table.get_mut(&ns_id) {
            ns.remove_adapter(adapter_id);
        }
    }

    /// A point-in-time copy of the namespace's adapters, for callers (e.g.
    /// DNS/hosts file regeneration) that need the current NIC list without
    /// holding the registry lock across a write.
    pub fn snapshot(&self, ns_id: &str) -> Option<Namespace> {
        let ns_id = ns_id.to_lowercase();
        self.namespaces.lock().unwrap().get(&ns_id).cloned()
    }

    /// Moves every NIC into the assigned pid's namespace and configures it,
    /// in insertion order, on the dedicated namespace-entry thread.
    pub async fn sync(&self, ns_id: &str) -> Result<(), ErrorKind> {
        let ns_id = ns_id.to_lowercase();
        let (pid, nics) = {
            let table = self.namespaces.lock().unwrap();
            let ns = table
                .get(&ns_id)
                .ok_or_else(|| ErrorKind::not_found(anyhow::anyhow!("no namespace {ns_id}")))?;
            match ns.assigned_pid {
                None => return Ok(()),
                Some(pid) => (pid, ns.nics.clone()),
            }
        };

        self.worker
            .run(move || configure_all_nics(pid, nics))
            .await
    }
}

impl Default for NamespaceManager {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve_ifname(adapter: &NetworkAdapter) -> Result<String, ErrorKind> {
    let guid = adapter.id.to_lowercase();
    let net_dir = if adapter.vpci_assigned {
        find_vpci_net_dir(&guid)?
    } else {
        PathBuf::from(format!("/sys/bus/vmbus/devices/{guid}/net"))
    };

    timeout(ADAPTER_RESOLUTION_TIMEOUT, async {
        loop {
            if let Ok(entries) = std::fs::read_dir(&net_dir) {
                let names: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect();
                match names.len() {
                    1 => return Ok(names.into_iter().next().unwrap()),
                    0 => {}
                    _ => {
                        return Err(ErrorKind::runtime(anyhow::anyhow!(
                            "expected exactly one interface under {}, found {}",
                            net_dir.display(),
                            names.len()
                        )))
                    }
                }
            }
            tokio::time::sleep(ADAPTER_POLL_INTERVAL).await;
        }
    })
    .await
    .map_err(|_| ErrorKind::timeout(anyhow::anyhow!("timed out resolving ifname for {guid}")))?
}

/// For VPCI-assigned adapters the net/ subtree hangs off a PCI device node
/// beneath the vmbus device rather than directly under it.
fn find_vpci_net_dir(guid: &str) -> Result<PathBuf, ErrorKind> {
    let base = PathBuf::from(format!("/sys/bus/vmbus/devices/{guid}"));
    let pci_glob_prefix = "pci";
    let entries = std::fs::read_dir(&base)
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("read_dir {}: {e}", base.display())))?;
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(pci_glob_prefix) {
            if let Ok(bus_entries) = std::fs::read_dir(entry.path()) {
                for bus_entry in bus_entries.filter_map(|e| e.ok()) {
                    let net_dir = bus_entry.path().join("net");
                    if net_dir.is_dir() {
                        return Ok(net_dir);
                    }
                }
            }
        }
    }
    Err(ErrorKind::not_found(anyhow::anyhow!(
        "no pci net subtree under {}",
        base.display()
    )))
}

/// Runs on the [`NsWorker`] thread: enters the target pid's network
/// namespace, moves and configures every NIC in order, then returns (the
/// worker restores the original namespace unconditionally afterwards).
fn configure_all_nics(pid: u32, nics: Vec<Nic>) -> Result<(), ErrorKind> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("building namespace-local runtime: {e}")))?;

    rt.block_on(async move {
        let (connection, handle, _) = rtnetlink::new_connection()
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("opening rtnetlink socket: {e}")))?;
        tokio::spawn(connection);

        for (idx, nic) in nics.iter().enumerate() {
            move_interface(&handle, &nic.ifname, pid).await?;
            configure_nic(&handle, nic, idx > 0).await?;
        }
        Ok(())
    })
}

async fn move_interface(handle: &Handle, ifname: &str, pid: u32) -> Result<(), ErrorKind> {
    let mut links = handle.link().get().match_name(ifname.to_string()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("looking up {ifname}: {e}")))?
        .ok_or_else(|| ErrorKind::not_found(anyhow::anyhow!("no such interface {ifname}")))?;

    handle
        .link()
        .set(link.header.index)
        .setns_by_pid(pid)
        .execute()
        .await
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("moving {ifname} into pid {pid}'s namespace: {e}")))
}

async fn configure_nic(handle: &Handle, nic: &Nic, apply_low_metric: bool) -> Result<(), ErrorKind> {
    let mut links = handle.link().get().match_name(nic.ifname.clone()).execute();
    let link = links
        .try_next()
        .await
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("looking up {}: {e}", nic.ifname)))?
        .ok_or_else(|| ErrorKind::not_found(anyhow::anyhow!("no such interface {}", nic.ifname)))?;
    let index = link.header.index;

    if nic.adapter.encap_overhead > 0 {
        let current_mtu = link.attributes.iter().find_map(|a| match a {
            LinkAttribute::Mtu(m) => Some(*m),
            _ => None,
        });
        match current_mtu {
            Some(mtu) => {
                let reduced = mtu.saturating_sub(nic.adapter.encap_overhead);
                debug!(ifname = %nic.ifname, mtu, reduced, "reducing mtu for encapsulation overhead");
                handle
                    .link()
                    .set(index)
                    .mtu(reduced)
                    .execute()
                    .await
                    .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("setting mtu on {}: {e}", nic.ifname)))?;
            }
            None => warn!(ifname = %nic.ifname, "no mtu attribute on link, skipping encapsulation overhead reduction"),
        }
    }

    handle
        .link()
        .set(index)
        .up()
        .execute()
        .await
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("bringing up {}: {e}", nic.ifname)))?;

    if nic.adapter.ip_configs.is_empty() {
        return run_dhcp(&nic.ifname).await;
    }

    let low_metric = nic.adapter.enable_low_metric && apply_low_metric;

    for ip in &nic.adapter.ip_configs {
        let addr: IpAddr = ip
            .addr
            .parse()
            .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("bad address {}: {e}", ip.addr)))?;

        handle
            .address()
            .add(index, addr, ip.prefix)
            .execute()
            .await
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("adding {}/{}: {e}", addr, ip.prefix)))?;

        if low_metric {
            let host_prefix = if addr.is_ipv4() { 32 } else { 128 };
            install_low_metric_rule(handle, addr, host_prefix).await?;
        }
    }

    for route in &nic.adapter.routes {
        install_route(handle, index, route, &nic.adapter, low_metric).await?;
    }

    Ok(())
}

async fn install_low_metric_rule(handle: &Handle, addr: IpAddr, prefix: u8) -> Result<(), ErrorKind> {
    let net = IpNet::new(addr, prefix)
        .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("building host route for {addr}: {e}")))?;
    match net {
        IpNet::V4(net) => handle
            .rule()
            .add()
            .v4()
            .source_prefix(net.addr(), net.prefix_len())
            .table_id(LOW_METRIC_TABLE)
            .priority(LOW_METRIC_PRIORITY)
            .execute()
            .await
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("installing low-metric rule: {e}"))),
        IpNet::V6(net) => handle
            .rule()
            .add()
            .v6()
            .source_prefix(net.addr(), net.prefix_len())
            .table_id(LOW_METRIC_TABLE)
            .priority(LOW_METRIC_PRIORITY)
            .execute()
            .await
            .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("installing low-metric rule: {e}"))),
    }
}

/// Returns true iff both destination and next-hop denote the "unset
/// default gateway" sentinel.
fn route_is_unset_sentinel(route: &RouteConfig) -> bool {
    let dst_unset = route
        .dst
        .as_deref()
        .map(is_all_zero_cidr)
        .unwrap_or(true);
    let hop_unset = route
        .next_hop
        .as_deref()
        .map(|s| IpAddr::from_str(s).map(|a| a.is_unspecified()).unwrap_or(false))
        .unwrap_or(true);
    dst_unset && hop_unset
}

fn is_all_zero_cidr(s: &str) -> bool {
    match s.parse::<IpNet>() {
        Ok(net) => net.addr().is_unspecified() && net.prefix_len() == 0,
        Err(_) => false,
    }
}

async fn install_route(
    handle: &Handle,
    index: u32,
    route: &RouteConfig,
    adapter: &NetworkAdapter,
    low_metric: bool,
) -> Result<(), ErrorKind> {
    if route_is_unset_sentinel(route) {
        return Ok(());
    }

    let dst: Option<IpNet> = match &route.dst {
        Some(s) => Some(
            s.parse()
                .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("bad route destination {s}: {e}")))?,
        ),
        None => None,
    };
    let next_hop: Option<IpAddr> = match &route.next_hop {
        Some(s) => Some(
            s.parse()
                .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("bad next-hop {s}: {e}")))?,
        ),
        None => None,
    };
    if dst.is_none() && next_hop.is_none() {
        return Err(ErrorKind::invalid_arg(anyhow::anyhow!(
            "route must specify a destination or a next-hop"
        )));
    }

    let metric = select_metric(route, low_metric);
    let table = select_table(low_metric);

    match try_install_route(handle, index, dst, next_hop, metric, table).await {
        Ok(()) => Ok(()),
        Err(e) => match auxiliary_gateway_address(next_hop, &e) {
            Some((hop, host_prefix)) => {
                warn!(?next_hop, "route install hit unreachable network, adding auxiliary gateway address");
                handle
                    .address()
                    .add(index, hop, host_prefix)
                    .execute()
                    .await
                    .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("adding auxiliary gateway address: {e}")))?;
                try_install_route(handle, index, dst, next_hop, metric, table).await
            }
            None => Err(e),
        },
    }
}

/// A route's explicit metric wins; otherwise the adapter's low-metric
/// setting picks the slow-path default, falling back to `1`.
fn select_metric(route: &RouteConfig, low_metric: bool) -> u32 {
    if route.metric != 0 {
        route.metric
    } else if low_metric {
        LOW_METRIC_VALUE
    } else {
        1
    }
}

/// Low-metric routes live in their own policy-routing table so the default
/// table's route selection is unaffected.
fn select_table(low_metric: bool) -> Option<u32> {
    low_metric.then_some(LOW_METRIC_TABLE)
}

fn is_network_unreachable(err: &ErrorKind) -> bool {
    err.to_string().to_lowercase().contains("network is unreachable")
}

/// Decides whether a failed route install should retry after adding a
/// host-scoped address for `next_hop`: only when the failure was "network
/// unreachable" (the gateway falls outside any address on the link) and a
/// next-hop was actually given. Returns the address and prefix length to add.
fn auxiliary_gateway_address(next_hop: Option<IpAddr>, err: &ErrorKind) -> Option<(IpAddr, u8)> {
    if !is_network_unreachable(err) {
        return None;
    }
    let hop = next_hop?;
    let host_prefix = if hop.is_ipv4() { 32 } else { 128 };
    Some((hop, host_prefix))
}

async fn try_install_route(
    handle: &Handle,
    index: u32,
    dst: Option<IpNet>,
    next_hop: Option<IpAddr>,
    metric: u32,
    table: Option<u32>,
) -> Result<(), ErrorKind> {
    let mut request = handle.route().add().output_interface(index);
    if let Some(dst) = dst {
        request = request.destination_prefix(dst.addr(), dst.prefix_len());
    }
    if let Some(hop) = next_hop {
        request = request.gateway(hop);
    }
    request = request.priority(metric);
    if let Some(table_id) = table {
        request = request.table_id(table_id);
    }
    request
        .execute()
        .await
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("installing route: {e}")))
}

/// Spawns an external DHCP client against `ifname` when no IP configs are
/// present. Killed and treated as a failure if it runs past
/// [`DHCP_TIMEOUT`].
pub async fn run_dhcp(ifname: &str) -> Result<(), ErrorKind> {
    let mut child = tokio::process::Command::new("udhcpc")
        .args(["-i", ifname, "-n", "-q"])
        .spawn()
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("spawning dhcp client for {ifname}: {e}")))?;

    match timeout(DHCP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) if status.success() => Ok(()),
        Ok(Ok(status)) => Err(ErrorKind::runtime(anyhow::anyhow!("dhcp client exited with {status:?}"))),
        Ok(Err(e)) => Err(ErrorKind::runtime(anyhow::anyhow!("waiting for dhcp client: {e}"))),
        Err(_) => {
            let _ = child.start_kill();
            Err(ErrorKind::timeout(anyhow::anyhow!("dhcp client on {ifname} timed out")))
        }
    }
}

type NsJob = Box<dyn FnOnce() + Send>;

/// A dedicated OS thread that runs namespace-entry jobs one at a time.
/// `setns(2)` only affects the calling thread, so every job must run on the
/// same, never-migrating thread, which saves the current net namespace,
/// enters the target, runs the job, and restores the original namespace
/// unconditionally; required because a namespace-entry job must stay pinned
/// to the thread that entered it.
pub struct NsWorker {
    jobs: std::sync::mpsc::Sender<NsJob>,
}

impl NsWorker {
    pub fn spawn() -> NsWorker {
        let (tx, rx) = std::sync::mpsc::channel::<NsJob>();
        std::thread::Builder::new()
            .name("gcs-ns-worker".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn namespace worker thread");
        NsWorker { jobs: tx }
    }

    pub async fn run<F, T>(&self, f: F) -> T
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: NsJob = Box::new(move || {
            let result = f();
            let _ = tx.send(result);
        });
        self.jobs.send(job).expect("namespace worker thread died");
        rx.await.expect("namespace worker dropped result sender")
    }
}

/// Enters the namespace identified by `ns_path` for the duration of `f`,
/// then restores the caller's original namespace. Must run on a thread
/// that will not be reused for anything else concurrently.
pub fn with_entered_namespace<F, T>(ns_path: &std::path::Path, f: F) -> Result<T, ErrorKind>
where
    F: FnOnce() -> Result<T, ErrorKind>,
{
    let original = open("/proc/self/ns/net", OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("opening current namespace: {e}")))?;
    let target = open(ns_path, OFlag::O_RDONLY, Mode::empty())
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("opening {}: {e}", ns_path.display())))?;

    setns(&target, CloneFlags::CLONE_NEWNET)
        .map_err(|e| ErrorKind::runtime(anyhow::anyhow!("setns into {}: {e}", ns_path.display())))?;

    let result = f();

    if let Err(e) = setns(&original, CloneFlags::CLONE_NEWNET) {
        // We cannot safely continue on this thread if we failed to restore
        // the original namespace; the process is better off terminating
        // than silently running subsequent jobs in the wrong namespace.
        panic!("failed to restore original network namespace: {e}");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(low_metric: bool) -> NetworkAdapter {
        NetworkAdapter {
            id: "a1".into(),
            vpci_assigned: false,
            ip_configs: vec![],
            routes: vec![],
            dns_suffix: String::new(),
            dns_servers: vec![],
            encap_overhead: 0,
            enable_low_metric: low_metric,
            policy_based_routing: false,
        }
    }

    #[test]
    fn namespace_assign_pid_is_single_writer() {
        let mut ns = Namespace { id: "ns1".into(), assigned_pid: None, nics: vec![] };
        ns.assign_container_pid(10).unwrap();
        assert!(ns.assign_container_pid(11).is_err());
    }

    #[test]
    fn namespace_remove_refused_while_nics_present() {
        let mgr = NamespaceManager::new();
        let id = mgr.get_or_add("ABCD-1234");
        assert_eq!(id, "abcd-1234");
        {
            let mut table = mgr.namespaces.lock().unwrap();
            table.get_mut(&id).unwrap().nics.push(Nic {
                adapter: adapter(false),
                ifname: "eth0".into(),
                assigned_pid: None,
            });
        }
        assert!(mgr.remove(&id).is_err());
    }

    #[test]
    fn route_unset_sentinel_is_skipped() {
        let unset = RouteConfig { dst: Some("0.0.0.0/0".into()), next_hop: Some("0.0.0.0".into()), metric: 0 };
        assert!(route_is_unset_sentinel(&unset));

        let real = RouteConfig { dst: None, next_hop: Some("192.168.1.1".into()), metric: 0 };
        assert!(!route_is_unset_sentinel(&real));
    }

    #[test]
    fn metric_selection_follows_adapter_then_low_metric_then_default() {
        let explicit = RouteConfig { dst: None, next_hop: Some("10.0.0.1".into()), metric: 42 };
        assert_eq!(select_metric(&explicit, true), 42);
        assert_eq!(select_metric(&explicit, false), 42);

        let implicit = RouteConfig { dst: None, next_hop: Some("10.0.0.1".into()), metric: 0 };
        assert_eq!(select_metric(&implicit, true), LOW_METRIC_VALUE);
        assert_eq!(select_metric(&implicit, false), 1);
    }

    #[test]
    fn table_selection_follows_low_metric_flag() {
        assert_eq!(select_table(true), Some(LOW_METRIC_TABLE));
        assert_eq!(select_table(false), None);
    }

    #[test]
    fn gateway_outside_subnet_adds_one_auxiliary_address_and_retries() {
        let next_hop: IpAddr = "203.0.113.1".parse().unwrap();
        let unreachable = ErrorKind::runtime(anyhow::anyhow!("Network is unreachable (os error 101)"));

        let retry = auxiliary_gateway_address(Some(next_hop), &unreachable);
        assert_eq!(retry, Some((next_hop, 32)));

        // A second call with the same inputs must produce the exact same
        // single auxiliary address, never a wider or narrower prefix.
        assert_eq!(auxiliary_gateway_address(Some(next_hop), &unreachable), retry);
    }

    #[test]
    fn gateway_outside_subnet_v6_uses_host_128_prefix() {
        let next_hop: IpAddr = "2001:db8::1".parse().unwrap();
        let unreachable = ErrorKind::runtime(anyhow::anyhow!("network is unreachable"));
        assert_eq!(auxiliary_gateway_address(Some(next_hop), &unreachable), Some((next_hop, 128)));
    }

    #[test]
    fn non_unreachable_errors_never_trigger_a_retry() {
        let next_hop: IpAddr = "203.0.113.1".parse().unwrap();
        let other = ErrorKind::runtime(anyhow::anyhow!("permission denied"));
        assert_eq!(auxiliary_gateway_address(Some(next_hop), &other), None);
    }

    #[test]
    fn unreachable_error_without_a_next_hop_never_retries() {
        let unreachable = ErrorKind::runtime(anyhow::anyhow!("network is unreachable"));
        assert_eq!(auxiliary_gateway_address(None, &unreachable), None);
    }
}
