use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use event_chain::ChainNode;
use event_chain::ChainStore;
use event_chain::ClusterTime;
use event_chain::CursorType;
use event_chain::Flow;
use event_chain::FlowConfig;
use event_chain::MemChainStore;
use event_chain::NodeFilter;
use event_chain::OperType;
use event_chain::PolicyRegistry;
use event_chain::ResourceConfig;
use event_chain::Result;
use event_chain::Stores;
use event_chain::WatchToken;
use event_chain::HOST_BASE;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use crate::common::enable_logger;
use crate::common::event;
use crate::common::now;
use crate::common::MemStores;
use crate::common::TENANT;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_writers_commit_every_cursor_once() {
    enable_logger();
    let mem = MemStores::default();
    let key = ResourceConfig::default().key(CursorType::Host);
    let writer = || {
        Flow::new(
            key.clone(),
            TENANT,
            mem.stores(),
            &PolicyRegistry::default(),
            &FlowConfig::default(),
        )
    };
    let (a, b) = (writer(), writer());

    let sec = now() - 5;
    let e1 = event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1}));
    let e2 = event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2}));
    let e3 = event(HOST_BASE, "h3", OperType::Insert, (sec, 3), json!({"bk_host_id": 3}));

    // both see e2; whoever loses it drops the conflicting node and commits the rest
    let (retry_a, retry_b) = tokio::join!(
        a.do_batch(vec![e1.clone(), e2.clone()]),
        b.do_batch(vec![e2.clone(), e3.clone()])
    );
    assert!(!retry_a);
    assert!(!retry_b);

    let nodes = mem.chain.nodes("t:host:chain");
    let oids: Vec<_> = {
        let mut o: Vec<_> = nodes.iter().map(|n| n.oid.clone()).collect();
        o.sort();
        o
    };
    assert_eq!(oids, vec!["h1", "h2", "h3"]);
    let cursors: HashSet<_> = nodes.iter().map(|n| n.cursor.clone()).collect();
    assert_eq!(cursors.len(), 3);
    let ids: HashSet<_> = nodes.iter().map(|n| n.id).collect();
    assert_eq!(ids.len(), 3);
}

/// Holds the first append at a gate until released; every other call goes
/// straight to the inner store.
struct GatedChainStore {
    inner: Arc<MemChainStore>,
    gate: Mutex<Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>>,
}

impl GatedChainStore {
    /// Returns the store, a receiver firing once the first append is held
    /// and a sender releasing it.
    fn new(inner: Arc<MemChainStore>) -> (Self, oneshot::Receiver<()>, oneshot::Sender<()>) {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        let store = Self {
            inner,
            gate: Mutex::new(Some((entered_tx, release_rx))),
        };
        (store, entered_rx, release_tx)
    }
}

#[async_trait]
impl ChainStore for GatedChainStore {
    async fn append(
        &self,
        chain: &str,
        nodes: Vec<ChainNode>,
        token_key: &str,
        token: WatchToken,
    ) -> Result<()> {
        let gate = self.gate.lock().take();
        if let Some((entered, release)) = gate {
            let _ = entered.send(());
            let _ = release.await;
        }
        self.inner.append(chain, nodes, token_key, token).await
    }

    async fn range_after(
        &self,
        chain: &str,
        after_id: u64,
        limit: usize,
        filter: &NodeFilter,
    ) -> Result<Vec<ChainNode>> {
        self.inner.range_after(chain, after_id, limit, filter).await
    }

    async fn latest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        self.inner.latest(chain, not_before_sec).await
    }

    async fn earliest(
        &self,
        chain: &str,
        not_before_sec: u32,
    ) -> Result<Option<ChainNode>> {
        self.inner.earliest(chain, not_before_sec).await
    }

    async fn find_by_cursor(
        &self,
        chain: &str,
        cursor: &str,
        not_before_sec: u32,
    ) -> Result<Option<u64>> {
        self.inner.find_by_cursor(chain, cursor, not_before_sec).await
    }

    async fn first_after_time(
        &self,
        chain: &str,
        after: ClusterTime,
    ) -> Result<Option<ChainNode>> {
        self.inner.first_after_time(chain, after).await
    }

    async fn tail(
        &self,
        chain: &str,
    ) -> Result<Option<ChainNode>> {
        self.inner.tail(chain).await
    }

    async fn next_sequences(
        &self,
        sequence: &str,
        n: usize,
    ) -> Result<Vec<u64>> {
        self.inner.next_sequences(sequence, n).await
    }

    async fn get_token(
        &self,
        token_key: &str,
    ) -> Result<Option<WatchToken>> {
        self.inner.get_token(token_key).await
    }

    async fn find_token_by_cursor(
        &self,
        token_key: &str,
        cursor: &str,
    ) -> Result<Option<WatchToken>> {
        self.inner.find_token_by_cursor(token_key, cursor).await
    }

    async fn update_token_position(
        &self,
        token_key: &str,
        token: &str,
        start_at_time: ClusterTime,
    ) -> Result<()> {
        self.inner.update_token_position(token_key, token, start_at_time).await
    }

    async fn purge_expired(
        &self,
        chain: &str,
        before_sec: u32,
    ) -> Result<usize> {
        self.inner.purge_expired(chain, before_sec).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_writer_lands_after_the_faster_commit() {
    enable_logger();
    let mem = MemStores::default();
    let (gated, entered, release) = GatedChainStore::new(mem.chain.clone());
    let stores = Stores {
        chain: Arc::new(gated),
        ..mem.stores()
    };
    let key = ResourceConfig::default().key(CursorType::Host);
    let writer = || {
        Flow::new(
            key.clone(),
            TENANT,
            stores.clone(),
            &PolicyRegistry::default(),
            &FlowConfig::default(),
        )
    };
    let (slow, fast) = (writer(), writer());

    let sec = now() - 5;
    let e1 = event(HOST_BASE, "h1", OperType::Insert, (sec, 1), json!({"bk_host_id": 1}));
    let e2 = event(HOST_BASE, "h2", OperType::Insert, (sec, 2), json!({"bk_host_id": 2}));

    // the slow writer takes its id first and is held inside append
    let held = tokio::spawn(async move { slow.do_batch(vec![e1]).await });
    entered.await.unwrap();

    assert!(!fast.do_batch(vec![e2]).await);
    let chain = "t:host:chain";
    let fast_id = mem.chain.nodes(chain)[0].id;

    // a consumer already past the fast commit
    assert!(mem.chain.range_after(chain, fast_id, 10, &NodeFilter::default()).await.unwrap().is_empty());

    release.send(()).unwrap();
    assert!(!held.await.unwrap());

    let after = mem.chain.range_after(chain, fast_id, 10, &NodeFilter::default()).await.unwrap();
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].oid, "h1");
    assert!(after[0].id > fast_id);

    let oids: Vec<_> = mem.chain.nodes(chain).into_iter().map(|n| n.oid).collect();
    assert_eq!(oids, vec!["h2", "h1"]);
}
