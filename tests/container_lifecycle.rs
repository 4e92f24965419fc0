//! End-to-end container lifecycle scenarios (see the seed scenarios this
//! exercises: create+start+wait+exit, duplicate create, policy-denied
//! stdio) run against a fake OCI runtime rather than a real one, the way a
//! unit test for `vinit::service::ServiceTracker` would stand in a test
//! double for the process supervisor it drives.

use std::path::PathBuf;

use gcs::container::{self, StdioTransport};
use gcs::oci;
use gcs::policy::{Decision, Enforcer};
use gcs::protocol::{ContainerRole, VmHostedContainerSettings};
use gcs::registry::Registry;

fn fake_runtime() -> oci::Runtime {
    let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_runtimectl.sh");
    oci::Runtime::new(script)
}

fn standalone_settings(container_id: &str) -> VmHostedContainerSettings {
    let oci_spec: oci::Spec = serde_json::from_str(
        r#"{"root":{"path":"/"},"process":{"user":{"uid":0,"gid":0},"args":["/bin/true"]}}"#,
    )
    .unwrap();
    VmHostedContainerSettings {
        container_id: container_id.to_string(),
        role: ContainerRole::Standalone,
        sandbox_container_id: None,
        oci_spec,
        oci_bundle_path: String::new(),
    }
}

/// Denies stdio on every container but otherwise behaves like
/// [`OpenDoorEnforcer`].
struct DenyStdioEnforcer;

impl Enforcer for DenyStdioEnforcer {
    fn enforce_create_container(&self, _container_id: &str, _spec: &oci::Spec) -> Decision {
        Decision::deny_stdio()
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

#[tokio::test]
async fn container_lifecycle_and_policy_scenarios() {
    let bundle_root = std::env::temp_dir().join(format!("gcs-test-bundles-{}", std::process::id()));
    std::env::set_var("GCS_BUNDLE_ROOT", &bundle_root);

    let registry = Registry::new(fake_runtime());

    // Scenario: create + start + wait reaches running and exit code 0.
    container::create(&registry, standalone_settings("c-a")).await.expect("create succeeds");
    let container = registry.get("c-a").expect("container registered after create");
    container::start(&registry, &container).await.expect("start succeeds");
    assert_eq!(*container.status.lock().unwrap(), container::ContainerStatus::Running);

    let init = container.init_process.lock().unwrap().clone().expect("init process recorded");
    let (code_rx, done_tx) = init.wait();
    let code = code_rx.await.expect("exit code delivered");
    assert_eq!(code, 0);
    let _ = done_tx.send(());

    // Scenario: duplicate create fails with already-exists.
    let err = container::create(&registry, standalone_settings("c-a")).await.unwrap_err();
    assert_eq!(err.hresult(), gcs::error::hresult::ALREADY_EXISTS);

    // Scenario: policy denies stdio, container still creates successfully
    // and keeps the null transport (no raw file is ever exposed).
    registry
        .policy
        .load(Box::new(DenyStdioEnforcer), b"deny-stdio-policy", "uvm-test".into(), None)
        .expect("policy loads exactly once");

    container::create(&registry, standalone_settings("c-b")).await.expect("create still succeeds");
    let denied = registry.get("c-b").expect("container registered");
    assert!(matches!(*denied.stdio.lock().unwrap(), StdioTransport::Null));

    let decision = registry.policy.enforce_create_container("c-b", &standalone_settings("c-b").oci_spec).unwrap();
    assert!(!decision.allow_stdio);

    let _ = std::fs::remove_dir_all(&bundle_root);
}
