use event_chain::CursorType;
use event_chain::OperType;
use event_chain::WatchEventDetail;
use event_chain::WatchOptions;
use event_chain::HOST_BASE;
use event_chain::NO_EVENT_CURSOR;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::common::event;
use crate::common::now;
use crate::common::Harness;
use crate::common::TENANT;

#[tokio::test]
async fn idle_tail_times_out_to_the_sentinel_which_rescans_from_the_head() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let sec = now() - 5;
    harness.stream.push_all([
        event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1})),
        event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2})),
    ]);
    let nodes = harness.wait_chain_len("t:host:chain", 2).await;

    let client = harness.supervisor.watch_client();
    let key = client.key(CursorType::Host);
    let cancel = CancellationToken::new();

    let tail = WatchOptions::new(CursorType::Host, TENANT).with_cursor(&nodes[1].cursor);
    let events = client.watch_with_cursor(&key, &tail, &cancel).await.unwrap();
    assert_eq!(events, vec![WatchEventDetail::no_event(CursorType::Host)]);

    let head = WatchOptions::new(CursorType::Host, TENANT).with_cursor(NO_EVENT_CURSOR);
    let resp = client.watch_event(&head, &cancel).await.unwrap();
    assert!(resp.watched);
    let cursors: Vec<_> = resp.events.iter().map(|e| e.cursor.clone()).collect();
    assert_eq!(cursors, vec![nodes[0].cursor.clone(), nodes[1].cursor.clone()]);

    harness.stop().await;
}

#[tokio::test]
async fn watcher_at_the_tail_receives_the_next_event() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let sec = now() - 5;
    harness
        .stream
        .push(event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1})));
    let nodes = harness.wait_chain_len("t:host:chain", 1).await;

    let client = harness.supervisor.watch_client();
    let opts = WatchOptions::new(CursorType::Host, TENANT).with_cursor(&nodes[0].cursor);
    let waiting = tokio::spawn(async move { client.watch_event(&opts, &CancellationToken::new()).await });

    harness
        .stream
        .push(event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2})));

    let resp = waiting.await.unwrap().unwrap();
    assert!(resp.watched);
    assert_eq!(resp.events.len(), 1);
    assert_eq!(resp.events[0].detail.as_ref().unwrap()["bk_host_id"], json!(2));

    harness.stop().await;
}
