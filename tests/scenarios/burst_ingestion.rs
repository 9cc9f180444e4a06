use std::collections::HashSet;

use event_chain::Cursor;
use event_chain::CursorType;
use event_chain::WatchOptions;
use event_chain::HOST_BASE;
use event_chain::NO_EVENT_CURSOR;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::now;
use crate::common::update;
use crate::common::Harness;
use crate::common::TENANT;

#[tokio::test]
async fn burst_on_one_host_gets_increasing_ids_and_distinct_cursors() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let sec = now() - 5;

    // same host, same second; the feed's ordinal tells the operations apart
    harness.stream.push_all((1..=3).map(|ordinal| {
        update(
            HOST_BASE,
            "h1",
            (sec, ordinal),
            json!({"bk_host_id": 1, "bk_host_innerip": format!("10.0.0.{ordinal}")}),
            &["bk_host_innerip"],
        )
    }));

    let nodes = harness.wait_chain_len("t:host:chain", 3).await;
    assert_eq!(nodes.len(), 3);
    assert!(nodes.windows(2).all(|w| w[0].id < w[1].id));
    let cursors: HashSet<&str> = nodes.iter().map(|n| n.cursor.as_str()).collect();
    assert_eq!(cursors.len(), 3);
    for n in &nodes {
        let c = Cursor::decode(&n.cursor).unwrap();
        assert_eq!(c.cluster_time.sec, sec);
        assert_eq!(c.oid, "h1");
    }

    let client = harness.supervisor.watch_client();
    let opts = WatchOptions::new(CursorType::Host, TENANT).with_cursor(NO_EVENT_CURSOR);
    let resp = client.watch_event(&opts, &CancellationToken::new()).await.unwrap();
    assert!(resp.watched);
    let ips: Vec<_> = resp
        .events
        .iter()
        .map(|e| e.detail.as_ref().unwrap()["bk_host_innerip"].clone())
        .collect();
    assert_eq!(ips, vec![json!("10.0.0.1"), json!("10.0.0.2"), json!("10.0.0.3")]);

    harness.stop().await;
}
