//! End-to-end tests of the node layer over a loopback bus.
//!
//! Every test uses its own bus name so that tests running in parallel do not
//! see each other's traffic.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use yakut_common::types::NodeId;
use yakut_dsdl::{Catalog, Loader};
use yakut_node::file::{FileClient, FileServer, ListOptions, list_files};
use yakut_node::register::remote::{self, AccessOptions, BatchItem, Directive, Predicate};
use yakut_node::register::Register;
use yakut_node::resolver::{SubjectResolver, process_service_specifier, process_subject_specifier};
use yakut_node::sync::{SyncStream, TransferIdSync};
use yakut_node::tracker::NodeTracker;
use yakut_node::{Node, NodeInfo, NodeSettings, RegisterValue, Registry};
use yakut_transport::loopback::LoopbackTransport;

const TIMEOUT: Duration = Duration::from_millis(500);

fn node_with(id: Option<u16>, bus: &str, registry: Registry) -> Node {
    let transport = Arc::new(LoopbackTransport::new(id.map(NodeId::new), bus));
    let mut settings = NodeSettings::new(NodeInfo::for_command("e2e").unwrap());
    settings.allow_anonymous = true;
    Node::new(transport, registry, settings).unwrap()
}

fn node(id: u16, bus: &str) -> Node {
    node_with(Some(id), bus, Registry::for_node(Some(NodeId::new(id)), Vec::new()))
}

// ── Registers ────────────────────────────────────────────────────────

#[tokio::test]
async fn register_list_and_access_round_trip() {
    let mut registry = Registry::for_node(Some(NodeId::new(20)), Vec::new());
    registry.insert("motor.gain", Register::mutable(RegisterValue::Real { bits: 32, values: vec![1.5] }));
    let server = node_with(Some(20), "e2e-registers", registry);
    let client = node(21, "e2e-registers");

    let listed = remote::list_names(&client, &[NodeId::new(20)], TIMEOUT, false).await.unwrap();
    assert!(listed.is_success(), "{:?}", listed.errors);
    let names = listed.data_per_node[&NodeId::new(20)].clone().unwrap();
    assert!(names.contains(&"motor.gain".to_owned()));
    assert!(names.contains(&"uavcan.node.id".to_owned()));

    let written = remote::access(
        &client,
        &[NodeId::new(20)],
        "motor.gain",
        Some("2.25"),
        AccessOptions::default(),
        TIMEOUT,
    )
    .await
    .unwrap();
    assert!(written.is_success(), "{:?}", written.errors);
    assert_eq!(server.with_registry(|r| r.get("motor.gain").map(|x| x.value.clone())),
        Some(RegisterValue::Real { bits: 32, values: vec![2.25] }));
}

#[tokio::test]
async fn writing_missing_register_is_reported() {
    let _server = node(30, "e2e-missing-register");
    let client = node(31, "e2e-missing-register");
    let strict = remote::access(&client, &[NodeId::new(30)], "nope", Some("1"), AccessOptions::default(), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(strict.errors, vec!["Cannot assign nonexistent register \"nope\" at node 30".to_owned()]);

    let lenient = AccessOptions {
        optional_register: true,
        ..AccessOptions::default()
    };
    let tolerant = remote::access(&client, &[NodeId::new(30)], "nope", Some("1"), lenient, TIMEOUT)
        .await
        .unwrap();
    assert!(tolerant.is_success());
    assert_eq!(tolerant.warnings.len(), 1);
}

#[tokio::test]
async fn silent_node_is_a_missing_service() {
    let client = node(41, "e2e-silent");
    let out = remote::list_names(&client, &[NodeId::new(40)], Duration::from_millis(100), true).await.unwrap();
    assert!(out.is_success());
    assert_eq!(out.data_per_node[&NodeId::new(40)], None);
    assert_eq!(out.warnings.len(), 1);
}

#[tokio::test]
async fn register_batch_reads_and_writes() {
    let _server = node(50, "e2e-batch");
    let client = node(51, "e2e-batch");
    let document = json!({"50": {"uavcan.node": {"description": "batched"}, "absent": null}});
    let directive = Directive::load(&document, None).unwrap();
    let results = remote::do_calls(&client, &directive, TIMEOUT).await.unwrap();

    let (errors, warnings) = remote::batch_report(&results, remote::AccessOptions::default());
    assert_eq!(errors, vec!["50:\"absent\": No such register".to_owned()]);
    assert_eq!(warnings.len(), 1);
    assert!(results[0].1.iter().any(|(n, i)| n == "uavcan.node.description" && matches!(i, BatchItem::Response(_))));

    let output = remote::batch_output(&results, Some(Predicate::Mutable), 0);
    assert_eq!(output["50"]["uavcan.node.description"], "batched");
}

// ── Resolution ───────────────────────────────────────────────────────

#[tokio::test]
async fn subject_is_resolved_from_port_registers() {
    let mut registry = Registry::for_node(Some(NodeId::new(60)), Vec::new());
    registry.insert("uavcan.pub.temp.id", Register::mutable(RegisterValue::natural16(&[1234])));
    registry.insert(
        "uavcan.pub.temp.type",
        Register::immutable(RegisterValue::string("uavcan.si.unit.temperature.Scalar.1.0")),
    );
    let _publisher = node_with(Some(60), "e2e-resolve", registry);
    let client = node(61, "e2e-resolve");
    let loader = Loader::default();

    let mut resolver = SubjectResolver::new(&client).unwrap();
    let (id, dtype) = process_subject_specifier("1234", &loader, Some(&mut resolver)).await.unwrap();
    assert_eq!(id, 1234);
    assert_eq!(dtype.full_name(), "uavcan.si.unit.temperature.Scalar.1.0");

    let (id, dtype) = process_subject_specifier("uavcan.node.Heartbeat", &loader, None).await.unwrap();
    assert_eq!((id, dtype.short_name()), (7509, "Heartbeat"));
}

#[tokio::test]
async fn service_with_fixed_id_needs_no_network() {
    let client = node(71, "e2e-service-spec");
    let loader = Loader::default();
    let (id, dtype) =
        process_service_specifier("uavcan.node.GetInfo", NodeId::new(70), &loader, Some(&client), TIMEOUT)
            .await
            .unwrap();
    assert_eq!(id, 430);
    assert!(dtype.is_service());
}

// ── Tracking ─────────────────────────────────────────────────────────

#[tokio::test]
async fn tracker_sees_node_and_its_info() {
    let observer = Arc::new(node(81, "e2e-tracker"));
    let tracker = NodeTracker::new(Arc::clone(&observer)).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    tracker.add_update_handler(Arc::new(move |nid, _, new| {
        sink.lock().unwrap().push((nid, new.and_then(|e| e.info.clone()).map(|i| i.name)));
    }));
    let _peer = node(80, "e2e-tracker");

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let registry = tracker.registry();
    let entry = registry.get(&NodeId::new(80)).expect("peer tracked");
    assert_eq!(entry.info.as_ref().map(|i| i.name.as_str()), Some("org.opencyphal.yakut.e2e"));
    assert!(seen.lock().unwrap().iter().any(|(nid, name)| *nid == NodeId::new(80) && name.is_some()));
}

// ── File service ─────────────────────────────────────────────────────

#[tokio::test]
async fn file_round_trip_through_server() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("existing.txt"), b"abc").unwrap();
    let server_node = node(90, "e2e-files");
    let _server = FileServer::new(&server_node, vec![root.path().to_path_buf()]).unwrap();
    let client_node = node(91, "e2e-files");
    let client = FileClient::new(&client_node, NodeId::new(90), TIMEOUT);

    let payload: Vec<u8> = (0..1000_u32).map(|x| u8::try_from(x % 251).unwrap()).collect();
    let mut progress = Vec::new();
    client
        .write("upload/blob.bin", &payload, &mut |done, total| progress.push((done, total)))
        .await
        .unwrap();
    assert_eq!(std::fs::read(root.path().join("upload/blob.bin")).unwrap(), payload);
    assert_eq!(progress.last(), Some(&(1000, Some(1000))));

    let back = client.read("upload/blob.bin", &mut |_, _| {}).await.unwrap();
    assert_eq!(back, payload);

    let info = client.get_info("upload/blob.bin").await.unwrap();
    assert_eq!(info.size, 1000);
    assert!(info.is_file_not_directory);

    client.copy("existing.txt", "copy.txt", false).await.unwrap();
    client.move_("copy.txt", "moved.txt", false).await.unwrap();
    client.touch("empty").await.unwrap();
    client.remove("existing.txt").await.unwrap();
    let mut names = client.list("").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["empty", "moved.txt", "upload"]);

    let err = client.read("existing.txt", &mut |_, _| {}).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn listing_collects_info_and_missing_servers() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.bin"), b"12345").unwrap();
    let server_node = node(100, "e2e-list-files");
    let _server = FileServer::new(&server_node, vec![root.path().to_path_buf()]).unwrap();
    let client_node = node(101, "e2e-list-files");

    let options = ListOptions {
        optional_service: false,
        get_info: true,
        timeout: TIMEOUT,
    };
    let out = list_files(&client_node, &[NodeId::new(100), NodeId::new(102)], "", options, &mut |_| {})
        .await
        .unwrap();
    let files = out.data_per_node[&NodeId::new(100)].clone().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].info.map(|i| i.size), Some(5));
    assert_eq!(out.data_per_node[&NodeId::new(102)], None);
    assert_eq!(out.errors, vec!["File list service is not accessible at node 102".to_owned()]);
}

// ── Synchronization ──────────────────────────────────────────────────

#[tokio::test]
async fn transfer_id_sync_pairs_messages_from_one_publisher() {
    let source = node(110, "e2e-sync");
    let sink = node(111, "e2e-sync");
    let dtype = Catalog::standard().require("uavcan.primitive.scalar.Natural16", 1, 0).unwrap();
    let subs = vec![
        sink.make_subscriber(&dtype, Some(100)).unwrap(),
        sink.make_subscriber(&dtype, Some(101)).unwrap(),
    ];
    let mut stream = SyncStream::new(subs, Box::new(TransferIdSync::new(2)));
    let first = source.make_publisher(&dtype, Some(100)).unwrap();
    let second = source.make_publisher(&dtype, Some(101)).unwrap();
    assert!(first.publish(&json!({"value": 1}), TIMEOUT).await.unwrap());
    assert!(second.publish(&json!({"value": 2}), TIMEOUT).await.unwrap());

    let group = tokio::time::timeout(Duration::from_secs(2), stream.next()).await.unwrap().unwrap();
    let values: Vec<_> = group.iter().map(|s| s.as_ref().map(|(v, _)| v["value"].clone())).collect();
    assert_eq!(values, vec![Some(json!(1)), Some(json!(2))]);
}
