use std::sync::Arc;

use serde_json::json;
use serde_json::Value;

use super::*;
use crate::test_utils::archive_doc;
use crate::test_utils::change_event;
use crate::test_utils::enable_logger;
use crate::test_utils::update_event;
use crate::test_utils::TestStores;
use crate::ArchiveStore;
use crate::ClusterTime;
use crate::Cursor;
use crate::CursorType;
use crate::EventDetail;
use crate::EventType;
use crate::MockDocumentStore;
use crate::OperType;
use crate::PolicyRegistry;
use crate::StorageError;

fn parser(
    resource: CursorType,
    stores: &TestStores,
) -> EventParser {
    EventParser::new(
        resource,
        PolicyRegistry::default().get(resource),
        stores.docs.clone(),
        stores.archive.clone(),
    )
}

fn expect_parsed(outcome: ParseOutcome) -> ParsedEvent {
    match outcome {
        ParseOutcome::Parsed(p) => p,
        other => panic!("expected parsed event, got {other:?}"),
    }
}

#[test]
fn parser_kind_follows_resource() {
    assert_eq!(ParserKind::for_resource(CursorType::Host), ParserKind::Plain);
    assert_eq!(ParserKind::for_resource(CursorType::MainlineInstance), ParserKind::ObjectInstance);
    assert_eq!(ParserKind::for_resource(CursorType::InstAsst), ParserKind::InstAsst);
    assert_eq!(ParserKind::for_resource(CursorType::KubeWorkload), ParserKind::KubeWorkload);
    assert_eq!(ParserKind::for_resource(CursorType::KubePod), ParserKind::Pod);
}

#[tokio::test]
async fn plain_update_becomes_node_and_detail() {
    enable_logger();
    let stores = TestStores::new();
    let event = update_event(
        "cc_HostBase",
        "oid-1",
        100,
        3,
        json!({"bk_host_id": 7, "bk_host_innerip": "1.1.1.1"}),
        &["bk_host_innerip"],
    );

    let p = expect_parsed(parser(CursorType::Host, &stores).parse(&event, &DeleteDetails::new(), 42, "rid").await);

    assert_eq!(p.node.id, 42);
    assert_eq!(p.node.event_type, EventType::Update);
    assert_eq!(p.node.instance_id, 7);
    assert_eq!(p.node.token, event.token);
    assert_eq!(p.node.tenant_id, "t");

    let cursor = Cursor::decode(&p.node.cursor).unwrap();
    assert_eq!(cursor.cursor_type, CursorType::Host);
    assert_eq!(cursor.cluster_time, ClusterTime::new(100, 3));
    assert_eq!(cursor.uniq_key, "7");

    let detail: EventDetail = serde_json::from_str(&p.detail).unwrap();
    assert_eq!(detail.detail["bk_host_innerip"], "1.1.1.1");
    assert!(detail.update_fields.contains_key("bk_host_innerip"));
}

#[tokio::test]
async fn non_data_operations_are_dropped() {
    enable_logger();
    let stores = TestStores::new();
    let p = parser(CursorType::Host, &stores);
    let none = DeleteDetails::new();

    for (oper, reason) in [
        (OperType::Invalidate, "invalidate"),
        (OperType::Drop, "drop"),
        (OperType::Rename, "unsupported_operation"),
    ] {
        let event = change_event("cc_HostBase", "oid-1", oper, 100, 0, Value::Null);
        assert_eq!(p.parse(&event, &none, 1, "rid").await, ParseOutcome::Dropped(reason));
    }
}

#[tokio::test]
async fn invalid_document_is_dropped() {
    enable_logger();
    let stores = TestStores::new();
    let event = change_event("cc_HostBase", "oid-1", OperType::Insert, 100, 0, json!({"name": "x"}));

    let outcome = parser(CursorType::Host, &stores).parse(&event, &DeleteDetails::new(), 1, "rid").await;
    assert_eq!(outcome, ParseOutcome::Dropped("invalid_document"));
}

#[tokio::test]
async fn delete_takes_its_document_from_archive() {
    enable_logger();
    let stores = TestStores::new();
    stores
        .archive
        .insert(archive_doc("cc_HostBase", "oid-1", json!({"bk_host_id": 7}), 100))
        .await
        .unwrap();
    let events = vec![
        change_event("cc_HostBase", "oid-1", OperType::Delete, 100, 0, Value::Null),
        change_event("cc_HostBase", "oid-2", OperType::Delete, 100, 1, Value::Null),
    ];

    let deleted = delete_details(stores.archive.as_ref(), &events).await.unwrap();
    assert_eq!(deleted.len(), 1);

    let p = parser(CursorType::Host, &stores);
    let first = expect_parsed(p.parse(&events[0], &deleted, 1, "rid").await);
    assert_eq!(first.node.event_type, EventType::Delete);
    let detail: EventDetail = serde_json::from_str(&first.detail).unwrap();
    assert_eq!(detail.detail["bk_host_id"], 7);

    assert_eq!(
        p.parse(&events[1], &deleted, 2, "rid").await,
        ParseOutcome::Dropped("delete_detail_missing")
    );
}

#[tokio::test]
async fn unencodable_cursor_aborts_without_retry() {
    enable_logger();
    let stores = TestStores::new();
    let event = change_event("cc_HostBase", "oid-1", OperType::Insert, 0, 0, json!({"bk_host_id": 7}));

    let outcome = parser(CursorType::Host, &stores).parse(&event, &DeleteDetails::new(), 1, "rid").await;
    assert_eq!(outcome, ParseOutcome::Abort { retry: false });
}

#[tokio::test]
async fn object_instance_publishes_object_id_as_sub_resource() {
    enable_logger();
    let stores = TestStores::new();
    let event = change_event(
        "cc_ObjectBase",
        "oid-1",
        OperType::Insert,
        100,
        0,
        json!({"bk_inst_id": 3, "bk_obj_id": "switch"}),
    );

    let p = expect_parsed(
        parser(CursorType::ObjectBase, &stores)
            .parse(&event, &DeleteDetails::new(), 1, "rid")
            .await,
    );
    assert_eq!(p.node.sub_resource, vec!["switch"]);
}

#[tokio::test]
async fn association_halves_share_one_cursor() {
    enable_logger();
    let stores = TestStores::new();
    let doc = json!({"id": 9, "bk_obj_id": "host", "bk_asst_obj_id": "switch"});
    let src = change_event("cc_InstAsst", "oid-src", OperType::Insert, 100, 0, doc.clone());
    let dst = change_event("cc_InstAsst", "oid-dst", OperType::Insert, 100, 0, doc);

    let p = parser(CursorType::InstAsst, &stores);
    let a = expect_parsed(p.parse(&src, &DeleteDetails::new(), 1, "rid").await);
    let b = expect_parsed(p.parse(&dst, &DeleteDetails::new(), 2, "rid").await);

    assert_eq!(a.node.cursor, b.node.cursor);
    assert_eq!(Cursor::decode(&a.node.cursor).unwrap().oid, "9");
    assert_eq!(a.node.oid, "oid-src");
    assert_eq!(a.node.sub_resource, vec!["host", "switch"]);
}

#[tokio::test]
async fn association_update_and_missing_id_are_dropped() {
    enable_logger();
    let stores = TestStores::new();
    let p = parser(CursorType::InstAsst, &stores);

    let update = change_event(
        "cc_InstAsst",
        "oid-1",
        OperType::Update,
        100,
        0,
        json!({"id": 9, "bk_obj_id": "host", "bk_asst_obj_id": "switch"}),
    );
    assert_eq!(
        p.parse(&update, &DeleteDetails::new(), 1, "rid").await,
        ParseOutcome::Dropped("unsupported_operation")
    );

    let zero = change_event(
        "cc_InstAsst",
        "oid-1",
        OperType::Insert,
        100,
        0,
        json!({"id": 0, "bk_obj_id": "host", "bk_asst_obj_id": "switch"}),
    );
    assert_eq!(
        p.parse(&zero, &DeleteDetails::new(), 1, "rid").await,
        ParseOutcome::Dropped("invalid_instance_id")
    );
}

#[tokio::test]
async fn workload_sub_resource_comes_from_collection() {
    enable_logger();
    let stores = TestStores::new();
    let event = change_event(
        "cc_KubeDaemonSet",
        "oid-1",
        OperType::Insert,
        100,
        0,
        json!({"id": 5, "bk_namespace_id": 1, "name": "agent"}),
    );

    let p = expect_parsed(
        parser(CursorType::KubeWorkload, &stores)
            .parse(&event, &DeleteDetails::new(), 1, "rid")
            .await,
    );
    assert_eq!(p.node.sub_resource, vec!["daemonSet"]);
}

#[tokio::test]
async fn inserted_pod_embeds_live_and_archived_containers() {
    enable_logger();
    let stores = TestStores::new();
    stores.docs.upsert("t", "cc_KubeContainer", "c-live", json!({"id": 1, "bk_pod_id": 5}));
    stores.docs.upsert("t", "cc_KubeContainer", "c-other", json!({"id": 2, "bk_pod_id": 6}));
    stores
        .archive
        .insert(archive_doc("cc_KubeContainer", "c-gone", json!({"id": 3, "bk_pod_id": 5}), 90))
        .await
        .unwrap();
    let event = change_event(
        "cc_KubePod",
        "pod-1",
        OperType::Insert,
        100,
        0,
        json!({"id": 5, "bk_namespace_id": 1, "name": "web"}),
    );

    let p = expect_parsed(parser(CursorType::KubePod, &stores).parse(&event, &DeleteDetails::new(), 1, "rid").await);

    let detail: EventDetail = serde_json::from_str(&p.detail).unwrap();
    let ids: Vec<i64> = detail.detail["containers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![1, 3]);
}

#[tokio::test]
async fn pod_container_lookup_failure_asks_for_retry() {
    enable_logger();
    let stores = TestStores::new();
    let mut docs = MockDocumentStore::new();
    docs.expect_find_by_field_in()
        .returning(|_, _, _, _| Err(StorageError::DbError("timeout".into()).into()));
    let p = EventParser::new(
        CursorType::KubePod,
        PolicyRegistry::default().get(CursorType::KubePod),
        Arc::new(docs),
        stores.archive.clone(),
    );
    let event = change_event(
        "cc_KubePod",
        "pod-1",
        OperType::Insert,
        100,
        0,
        json!({"id": 5, "bk_namespace_id": 1}),
    );

    assert_eq!(
        p.parse(&event, &DeleteDetails::new(), 1, "rid").await,
        ParseOutcome::Abort { retry: true }
    );
}
