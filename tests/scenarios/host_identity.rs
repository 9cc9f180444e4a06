use event_chain::ChainStore;
use event_chain::CursorType;
use event_chain::WatchOptions;
use event_chain::HOST_BASE;
use event_chain::MODULE_HOST_CONFIG;
use event_chain::NO_EVENT_CURSOR;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::now;
use crate::common::wait_until;
use crate::common::update;
use crate::common::Harness;
use crate::common::TENANT;

#[tokio::test]
async fn host_ip_change_surfaces_as_a_host_identity_update() {
    // one feed per source collection
    let harness = Harness::start(vec![CursorType::HostIdentifier], 3).await;
    harness.mem.docs.upsert(
        TENANT,
        HOST_BASE,
        "h1",
        json!({"bk_host_id": 1, "bk_host_innerip": "10.0.0.9", "bk_host_name": "web-1"}),
    );
    harness.mem.docs.upsert(
        TENANT,
        MODULE_HOST_CONFIG,
        "r1",
        json!({"bk_host_id": 1, "bk_biz_id": 2, "bk_set_id": 3, "bk_module_id": 4}),
    );

    let sec = now() - 5;
    harness.stream.push_all([
        update(HOST_BASE, "h1", (sec, 1), json!({"bk_host_id": 1}), &["bk_host_innerip"]),
        // not an identity field
        update(HOST_BASE, "h1", (sec, 2), json!({"bk_host_id": 1}), &["bk_comment"]),
    ]);

    let nodes = harness.wait_chain_len("t:host_identifier:chain", 1).await;
    assert_eq!(nodes[0].instance_id, 1);

    let client = harness.supervisor.watch_client();
    let opts = WatchOptions::new(CursorType::HostIdentifier, TENANT).with_cursor(NO_EVENT_CURSOR);
    let resp = client.watch_event(&opts, &CancellationToken::new()).await.unwrap();
    assert!(resp.watched);
    assert_eq!(resp.events.len(), 1);
    let identity = resp.events[0].detail.as_ref().unwrap();
    assert_eq!(identity["bk_host_id"], json!(1));
    assert_eq!(identity["bk_host_innerip"], json!("10.0.0.9"));

    // the comment-only update advanced the token without a node
    let chain = harness.mem.chain.clone();
    let second = format!("tok-{HOST_BASE}-h1-{sec}-2");
    wait_until(|| {
        let chain = chain.clone();
        let second = second.clone();
        async move {
            let token = chain.get_token("t:host_identifier:cc_HostBase").await.unwrap();
            token.is_some_and(|t| t.token == second)
        }
    })
    .await;
    assert_eq!(harness.mem.chain.len("t:host_identifier:chain"), 1);

    harness.stop().await;
}
