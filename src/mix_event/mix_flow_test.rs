use serde_json::json;
use serde_json::Value;

use super::*;
use crate::test_utils::change_event;
use crate::test_utils::enable_logger;
use crate::test_utils::update_event;
use crate::test_utils::TestStores;
use crate::ChainStore;
use crate::DetailCache;
use crate::StorageError;

const HOST_CHAIN: &str = "t:host_identifier:chain";
const HOST_TOKEN: &str = "t:host_identifier:cc_HostBase";

fn host_identity_key() -> Key {
    Key::new(CursorType::HostIdentifier, 3600)
}

fn host_flow<R: Rearranger>(
    stores: &TestStores,
    rearranger: R,
) -> MixEventFlow<R> {
    MixEventFlow::new(
        host_identity_key(),
        "t",
        HOST_BASE,
        stores.stores(),
        &PolicyRegistry::default(),
        &LockConfig::default(),
        rearranger,
    )
}

fn identity_flow(stores: &TestStores) -> MixEventFlow<HostIdentityRearranger> {
    host_flow(stores, HostIdentityRearranger::new(stores.docs.clone(), stores.archive.clone()))
}

/// Rearranger passing events through untouched, without details.
fn passthrough() -> MockRearranger {
    let mut r = MockRearranger::new();
    r.expect_rearrange().returning(|events, _| Ok(events));
    r.expect_detail().returning(|_, _| Ok(None));
    r
}

#[tokio::test]
async fn host_changes_commit_update_nodes_under_the_source_token() {
    enable_logger();
    let stores = TestStores::new();
    let flow = identity_flow(&stores);

    let events = vec![
        update_event(HOST_BASE, "h1", 100, 0, json!({"bk_host_id": 1}), &["bk_host_innerip"]),
        update_event(HOST_BASE, "h2", 101, 0, json!({"bk_host_id": 2}), &["bk_comment"]),
        change_event(HOST_BASE, "h3", OperType::Insert, 102, 0, json!({"bk_host_id": 3})),
    ];
    assert!(!flow.do_batch(events.clone()).await);

    let nodes = stores.chain.nodes(HOST_CHAIN);
    assert_eq!(nodes.iter().map(|n| n.instance_id).collect::<Vec<_>>(), vec![1, 3]);
    for n in &nodes {
        assert_eq!(n.event_type, EventType::Update);
        assert_eq!(Cursor::decode(&n.cursor).unwrap().cursor_type, CursorType::Host);
    }

    let token = stores.chain.get_token(HOST_TOKEN).await.unwrap().unwrap();
    assert_eq!(token.token, events[2].token);
    assert_eq!(token.cursor, nodes[1].cursor);
    assert!(stores.chain.get_token("t:host_identifier").await.unwrap().is_none());

    // identity details are built on read, only the released lock touched the cache
    assert!(stores.cache.is_empty());
}

#[tokio::test]
async fn batch_without_identity_change_only_advances_the_token() {
    enable_logger();
    let stores = TestStores::new();
    let flow = identity_flow(&stores);

    let events = vec![
        update_event(HOST_BASE, "h1", 100, 0, json!({"bk_host_id": 1}), &["bk_comment"]),
        change_event(HOST_BASE, "h2", OperType::Delete, 101, 0, Value::Null),
    ];
    assert!(!flow.do_batch(events.clone()).await);

    assert!(stores.chain.is_empty(HOST_CHAIN));
    let token = stores.chain.get_token(HOST_TOKEN).await.unwrap().unwrap();
    assert_eq!(token.token, events[1].token);
    assert_eq!(token.start_at_time, events[1].cluster_time);
}

#[tokio::test]
async fn rearrange_failure_retries_the_batch() {
    enable_logger();
    let stores = TestStores::new();
    let mut r = MockRearranger::new();
    r.expect_rearrange()
        .times(1)
        .returning(|_, _| Err(StorageError::DbError("down".into()).into()));
    let flow = host_flow(&stores, r);

    let events = vec![change_event(HOST_BASE, "h1", OperType::Insert, 100, 0, json!({"bk_host_id": 1}))];
    assert!(flow.do_batch(events).await);
    assert!(stores.chain.is_empty(HOST_CHAIN));
    assert!(stores.chain.get_token(HOST_TOKEN).await.unwrap().is_none());
}

#[tokio::test]
async fn detail_failure_retries_and_releases_the_lock() {
    enable_logger();
    let stores = TestStores::new();
    let mut r = MockRearranger::new();
    r.expect_rearrange().returning(|events, _| Ok(events));
    r.expect_detail()
        .returning(|_, _| Err(StorageError::DbError("down".into()).into()));
    let flow = host_flow(&stores, r);

    let events = vec![change_event(HOST_BASE, "h1", OperType::Insert, 100, 0, json!({"bk_host_id": 1}))];
    assert!(flow.do_batch(events).await);

    assert!(stores.chain.is_empty(HOST_CHAIN));
    let lock_key = host_identity_key().lock_key("t");
    assert!(stores.cache.get(&lock_key).await.unwrap().is_none());
}

#[tokio::test]
async fn identical_cursors_in_one_batch_commit_once() {
    enable_logger();
    let stores = TestStores::new();
    let flow = host_flow(&stores, passthrough());

    let e = change_event(HOST_BASE, "h1", OperType::Update, 100, 0, json!({"bk_host_id": 1}));
    let other = change_event(HOST_BASE, "h2", OperType::Update, 100, 0, json!({"bk_host_id": 2}));
    assert!(!flow.do_batch(vec![e.clone(), e, other]).await);

    let nodes = stores.chain.nodes(HOST_CHAIN);
    assert_eq!(nodes.iter().map(|n| n.oid.as_str()).collect::<Vec<_>>(), vec!["h1", "h2"]);
}

#[tokio::test]
async fn events_from_unknown_collections_are_dropped() {
    enable_logger();
    let stores = TestStores::new();
    let flow = host_flow(&stores, passthrough());

    let events = vec![
        change_event("cc_SetBase", "s1", OperType::Insert, 100, 0, json!({"bk_host_id": 1})),
        change_event(HOST_BASE, "h2", OperType::Insert, 101, 0, json!({"bk_host_id": 0})),
        change_event(HOST_BASE, "h3", OperType::Insert, 102, 0, json!({"bk_host_id": 3})),
    ];
    assert!(!flow.do_batch(events).await);

    let nodes = stores.chain.nodes(HOST_CHAIN);
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].oid, "h3");
}

#[tokio::test(start_paused = true)]
async fn held_lock_retries_the_batch() {
    enable_logger();
    let stores = TestStores::new();
    let lock_key = host_identity_key().lock_key("t");
    stores
        .cache
        .set_nx(&lock_key, "other-writer".into(), std::time::Duration::from_secs(600))
        .await
        .unwrap();
    let flow = host_flow(&stores, passthrough());

    let events = vec![change_event(HOST_BASE, "h1", OperType::Insert, 100, 0, json!({"bk_host_id": 1}))];
    assert!(flow.do_batch(events).await);
    assert!(stores.chain.is_empty(HOST_CHAIN));
    assert_eq!(stores.cache.get(&lock_key).await.unwrap().as_deref(), Some("other-writer"));
}

#[tokio::test]
async fn sub_flows_share_one_chain() {
    enable_logger();
    let stores = TestStores::new();
    let host = identity_flow(&stores);
    let relation = MixEventFlow::new(
        host_identity_key(),
        "t",
        MODULE_HOST_CONFIG,
        stores.stores(),
        &PolicyRegistry::default(),
        &LockConfig::default(),
        HostIdentityRearranger::new(stores.docs.clone(), stores.archive.clone()),
    );

    let h = update_event(HOST_BASE, "h1", 100, 0, json!({"bk_host_id": 1}), &["bk_cloud_id"]);
    let r = change_event(
        MODULE_HOST_CONFIG,
        "r1",
        OperType::Insert,
        101,
        0,
        json!({"bk_host_id": 1, "bk_module_id": 5}),
    );
    let (a, b) = tokio::join!(host.do_batch(vec![h]), relation.do_batch(vec![r]));
    assert!(!a && !b);

    let nodes = stores.chain.nodes(HOST_CHAIN);
    assert_eq!(nodes.len(), 2);
    assert_ne!(nodes[0].id, nodes[1].id);
    assert!(stores.chain.get_token(HOST_TOKEN).await.unwrap().is_some());
    assert!(stores
        .chain
        .get_token("t:host_identifier:cc_ModuleHostConfig")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn biz_set_relation_details_are_stored_at_ingestion() {
    enable_logger();
    let stores = TestStores::new();
    stores.docs.upsert(
        "t",
        BIZ_SET,
        "bs-oid-2",
        json!({"_id": "bs-oid-2", "bk_biz_set_id": 2, "bk_scope": {"match_all": true}}),
    );
    stores.docs.upsert("t", BIZ, "b5", json!({"bk_biz_id": 5}));

    let key = Key::new(CursorType::BizSetRelation, 3600);
    let flow = MixEventFlow::new(
        key.clone(),
        "t",
        BIZ,
        stores.stores(),
        &PolicyRegistry::default(),
        &LockConfig::default(),
        BizSetRelationRearranger::new(stores.docs.clone(), stores.archive.clone(), MixSnapshots::default()),
    );

    let biz = change_event(BIZ, "b6", OperType::Insert, 100, 0, json!({"bk_biz_id": 6}));
    stores.docs.upsert("t", BIZ, "b6", json!({"bk_biz_id": 6}));
    assert!(!flow.do_batch(vec![biz.clone()]).await);

    let nodes = stores.chain.nodes("t:biz_set_relation:chain");
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].instance_id, 2);
    assert_eq!(nodes[0].oid, "bs-oid-2");
    assert_eq!(nodes[0].token, biz.token);
    assert_eq!(Cursor::decode(&nodes[0].cursor).unwrap().cursor_type, CursorType::BizSet);

    let raw = stores
        .cache
        .get(&key.detail_key("t", &nodes[0].cursor))
        .await
        .unwrap()
        .unwrap();
    let stored: EventDetail = serde_json::from_str(&raw).unwrap();
    assert_eq!(stored.detail, json!({"bk_biz_set_id": 2, "bk_biz_ids": [5, 6]}));

    let token = stores.chain.get_token("t:biz_set_relation:cc_ApplicationBase").await.unwrap().unwrap();
    assert_eq!(token.token, biz.token);
}

#[test]
fn source_collections_map_to_cursor_types() {
    assert_eq!(source_cursor_type(HOST_BASE), CursorType::Host);
    assert_eq!(source_cursor_type(MODULE_HOST_CONFIG), CursorType::ModuleHostRelation);
    assert_eq!(source_cursor_type(PROCESS), CursorType::Process);
    assert_eq!(source_cursor_type(BIZ_SET), CursorType::BizSet);
    assert_eq!(source_cursor_type(BIZ), CursorType::Biz);
    assert_eq!(source_cursor_type("cc_SetBase"), CursorType::Unknown);
}
