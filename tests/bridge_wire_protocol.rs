//! Drives the bridge over an in-memory duplex the way a host connection
//! would: negotiate, create, start, then request process exit, all as wire
//! frames rather than direct module calls.

use std::path::PathBuf;
use std::sync::Arc;

use gcs::bridge::Bridge;
use gcs::codec::{self, MessageType};
use gcs::oci;
use gcs::protocol::*;
use gcs::registry::Registry;
use tokio::io::duplex;

fn fake_runtime() -> oci::Runtime {
    let script = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/fake_runtimectl.sh");
    oci::Runtime::new(script)
}

#[tokio::test]
async fn negotiate_create_start_over_the_wire() {
    let bundle_root = std::env::temp_dir().join(format!("gcs-wire-test-{}", std::process::id()));
    std::env::set_var("GCS_BUNDLE_ROOT", &bundle_root);

    let registry = Arc::new(Registry::new(fake_runtime()));
    let bridge = Bridge::new(registry);

    let (mut client, server) = duplex(8192);
    let serve = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.serve(server).await }
    });

    codec::write_frame(&mut client, MessageType::NegotiateProtocol.raw(), 1, &NegotiateProtocolRequest {
        min_version: 1,
        max_version: 4,
    })
    .await
    .unwrap();
    let frame = codec::read_frame(&mut client).await.unwrap();
    assert_eq!(frame.id, 1);
    let resp: ResponseEnvelope<NegotiateProtocolResponse> = frame.decode_json().unwrap();
    assert_eq!(resp.result, 0);

    let oci_spec: oci::Spec = serde_json::from_str(
        r#"{"root":{"path":"/"},"process":{"user":{"uid":0,"gid":0},"args":["/bin/true"]}}"#,
    )
    .unwrap();
    let create_req = CreateContainerRequest {
        container_id: "wire-c1".into(),
        settings: VmHostedContainerSettings {
            container_id: "wire-c1".into(),
            role: ContainerRole::Standalone,
            sandbox_container_id: None,
            oci_spec,
            oci_bundle_path: String::new(),
        },
    };
    codec::write_frame(&mut client, MessageType::Create.raw(), 2, &create_req).await.unwrap();
    let frame = codec::read_frame(&mut client).await.unwrap();
    assert_eq!(frame.id, 2);
    let resp: ResponseEnvelope<CreateContainerResponse> = frame.decode_json().unwrap();
    assert_eq!(resp.result, 0, "create should succeed: {:?}", resp.error_records);

    let start_req = StartContainerRequest { container_id: "wire-c1".into() };
    codec::write_frame(&mut client, MessageType::Start.raw(), 3, &start_req).await.unwrap();
    let frame = codec::read_frame(&mut client).await.unwrap();
    assert_eq!(frame.id, 3);
    let resp: ResponseEnvelope<StartContainerResponse> = frame.decode_json().unwrap();
    assert_eq!(resp.result, 0, "start should succeed: {:?}", resp.error_records);

    // Out-of-order-looking ids still round trip correctly: request 5 is
    // written before request 4's response has necessarily been read.
    let get_props = GetPropertiesRequest { container_id: "wire-c1".into(), query: None };
    codec::write_frame(&mut client, MessageType::GetProperties.raw(), 4, &get_props).await.unwrap();
    let frame = codec::read_frame(&mut client).await.unwrap();
    assert_eq!(frame.id, 4);
    let resp: ResponseEnvelope<GetPropertiesResponse> = frame.decode_json().unwrap();
    assert_eq!(resp.result, 0);
    assert_eq!(resp.payload.process_list.len(), 1);
    assert!(resp.payload.process_list[0].is_init);

    drop(client);
    let _ = serve.await;
    let _ = std::fs::remove_dir_all(&bundle_root);
}
