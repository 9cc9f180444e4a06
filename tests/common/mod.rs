use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use event_chain::ChainNode;
use event_chain::ChangeDesc;
use event_chain::ChangeEvent;
use event_chain::ClusterTime;
use event_chain::CursorType;
use event_chain::EventChainConfig;
use event_chain::LeaderNotifier;
use event_chain::MemArchiveStore;
use event_chain::MemChainStore;
use event_chain::MemDetailCache;
use event_chain::MemDocumentStore;
use event_chain::MemoryChangeStream;
use event_chain::OperType;
use event_chain::Stores;
use event_chain::Supervisor;
use event_chain::SupervisorBuilder;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time;

pub const TENANT: &str = "t";

// every wait in these tests polls up to this long
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

/// Config with a short long-poll so watch calls finish quickly.
pub fn test_config() -> EventChainConfig {
    let mut config = EventChainConfig::default();
    config.watch.loop_interval_ms = 50;
    config.watch.timeout_ms = 600;
    config.flow.flush_interval_ms = 20;
    config.retry.batch.base_delay_ms = 50;
    config.retry.batch.max_delay_ms = 50;
    config.retry.rewatch.base_delay_ms = 50;
    config.retry.rewatch.max_delay_ms = 200;
    config
}

/// Memory stores
#[derive(Clone, Default)]
pub struct MemStores {
    pub chain: Arc<MemChainStore>,
    pub cache: Arc<MemDetailCache>,
    pub archive: Arc<MemArchiveStore>,
    pub docs: Arc<MemDocumentStore>,
}

impl MemStores {
    pub fn stores(&self) -> Stores {
        Stores {
            chain: self.chain.clone(),
            cache: self.cache.clone(),
            archive: self.archive.clone(),
            docs: self.docs.clone(),
        }
    }
}

/// A running process: every flow of `resources` for [`TENANT`], fed by an
/// in-memory change stream, with this process as master.
pub struct Harness {
    pub stream: MemoryChangeStream,
    pub mem: MemStores,
    pub leader: Arc<LeaderNotifier>,
    pub supervisor: Supervisor,
    shutdown_tx: watch::Sender<()>,
}

impl Harness {
    pub async fn start(
        resources: Vec<CursorType>,
        feeds: usize,
    ) -> Self {
        Self::start_over(MemStores::default(), MemoryChangeStream::new(), resources, feeds).await
    }

    /// Starts a process over existing stores and feed, like a restart.
    pub async fn start_over(
        mem: MemStores,
        stream: MemoryChangeStream,
        resources: Vec<CursorType>,
        feeds: usize,
    ) -> Self {
        enable_logger();
        let leader = Arc::new(LeaderNotifier::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let opened_before = stream.watch_count();

        let supervisor = SupervisorBuilder::new(
            test_config(),
            mem.stores(),
            Arc::new(stream.clone()),
            leader.clone(),
            shutdown_rx,
        )
        .tenants(vec![TENANT.to_string()])
        .resources(resources)
        .build()
        .ready()
        .expect("supervisor built");

        // a fresh flow starts at the end of the feed, events must come after it opened
        let s = stream.clone();
        wait_until(|| {
            let s = s.clone();
            async move { s.watch_count() >= opened_before + feeds }
        })
        .await;

        Self {
            stream,
            mem,
            leader,
            supervisor,
            shutdown_tx,
        }
    }

    /// Nodes of `chain` once it holds at least `n` of them.
    pub async fn wait_chain_len(
        &self,
        chain: &str,
        n: usize,
    ) -> Vec<ChainNode> {
        let store = self.mem.chain.clone();
        let name = chain.to_string();
        wait_until(|| {
            let store = store.clone();
            let name = name.clone();
            async move { store.len(&name) >= n }
        })
        .await;
        self.mem.chain.nodes(chain)
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        time::timeout(WAIT_TIMEOUT, self.supervisor.join())
            .await
            .expect("jobs stopped in time")
            .expect("jobs stopped cleanly");
    }
}

pub async fn wait_until<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = time::Instant::now() + WAIT_TIMEOUT;
    while !cond().await {
        assert!(time::Instant::now() < deadline, "condition not met in {WAIT_TIMEOUT:?}");
        time::sleep(POLL_INTERVAL).await;
    }
}

pub fn event(
    collection: &str,
    oid: &str,
    oper: OperType,
    at: (u32, u32),
    document: Value,
) -> ChangeEvent {
    ChangeEvent {
        oid: oid.to_string(),
        document,
        operation_type: oper,
        collection: collection.to_string(),
        tenant_id: TENANT.to_string(),
        cluster_time: ClusterTime::new(at.0, at.1),
        token: format!("tok-{collection}-{oid}-{}-{}", at.0, at.1),
        change_desc: None,
    }
}

pub fn update(
    collection: &str,
    oid: &str,
    at: (u32, u32),
    document: Value,
    fields: &[&str],
) -> ChangeEvent {
    let mut e = event(collection, oid, OperType::Update, at, document);
    let mut desc = ChangeDesc::default();
    for f in fields {
        desc.updated_fields.insert(f.to_string(), Value::Null);
    }
    e.change_desc = Some(desc);
    e
}

pub fn now() -> u32 {
    ClusterTime::now().sec
}
