use std::collections::HashSet;

use event_chain::CursorType;
use event_chain::OperType;
use event_chain::HOST_BASE;
use serde_json::json;

use crate::common::event;
use crate::common::now;
use crate::common::Harness;

#[tokio::test]
async fn restart_resumes_after_the_last_committed_event() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let (mem, stream) = (harness.mem.clone(), harness.stream.clone());
    let sec = now() - 5;

    stream.push(event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1})));
    harness.wait_chain_len("t:host:chain", 1).await;
    harness.stop().await;

    // written while nothing was running
    stream.push(event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2})));

    let harness = Harness::start_over(mem, stream, vec![CursorType::Host], 1).await;
    harness
        .stream
        .push(event(HOST_BASE, "h3", OperType::Insert, (sec, 3), json!({"bk_host_id": 3})));

    let nodes = harness.wait_chain_len("t:host:chain", 3).await;
    let oids: Vec<_> = nodes.iter().map(|n| n.oid.as_str()).collect();
    assert_eq!(oids, vec!["h1", "h2", "h3"]);
    let cursors: HashSet<_> = nodes.iter().map(|n| n.cursor.as_str()).collect();
    assert_eq!(cursors.len(), 3);

    harness.stop().await;
}

#[tokio::test]
async fn lost_resume_point_restarts_near_now() {
    let harness = Harness::start(vec![CursorType::Host], 1).await;
    let (mem, stream) = (harness.mem.clone(), harness.stream.clone());
    let sec = now() - 5;

    stream.push(event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1})));
    harness.wait_chain_len("t:host:chain", 1).await;
    harness.stop().await;

    // the committed token falls out of the retained history
    stream.push(event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2})));
    stream.expire_history();

    // one rejected open plus the reopen from the reset token
    let harness = Harness::start_over(mem, stream, vec![CursorType::Host], 2).await;
    harness
        .stream
        .push(event(HOST_BASE, "h3", OperType::Insert, (now(), 1), json!({"bk_host_id": 3})));

    let nodes = harness.wait_chain_len("t:host:chain", 2).await;
    let oids: Vec<_> = nodes.iter().map(|n| n.oid.as_str()).collect();
    assert_eq!(oids, vec!["h1", "h3"]);

    harness.stop().await;
}
