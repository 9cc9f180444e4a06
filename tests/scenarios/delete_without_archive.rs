use event_chain::metrics::FLOW_FATAL_ALARMS;
use event_chain::ArchiveDoc;
use event_chain::ArchiveStore;
use event_chain::CursorType;
use event_chain::EventType;
use event_chain::OperType;
use event_chain::HOST_BASE;
use serde_json::json;
use serde_json::Value;

use crate::common::event;
use crate::common::now;
use crate::common::Harness;
use crate::common::TENANT;

#[tokio::test]
async fn delete_missing_from_archive_is_dropped_with_an_alarm() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let alarms = FLOW_FATAL_ALARMS.with_label_values(&["host", "delete_detail_missing"]);
    let alarms_before = alarms.get();

    harness
        .mem
        .archive
        .insert(ArchiveDoc {
            oid: "h3".to_string(),
            coll: HOST_BASE.to_string(),
            detail: json!({"bk_host_id": 3, "bk_host_innerip": "10.0.0.3"}),
            tenant_id: TENANT.to_string(),
            create_time: now() as i64,
        })
        .await
        .unwrap();

    let sec = now() - 5;
    harness.stream.push_all([
        event(HOST_BASE, "h9", OperType::Delete, (sec, 1), Value::Null),
        event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2})),
        event(HOST_BASE, "h3", OperType::Delete, (sec, 3), Value::Null),
    ]);

    let nodes = harness.wait_chain_len("t:host:chain", 2).await;
    assert_eq!(nodes.iter().map(|n| n.oid.as_str()).collect::<Vec<_>>(), vec!["h2", "h3"]);
    assert_eq!(nodes[1].event_type, EventType::Delete);
    assert!(alarms.get() > alarms_before);

    harness.stop().await;
}
