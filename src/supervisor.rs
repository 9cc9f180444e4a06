//! Assembles and runs every background job of an event chain process.
//!
//! [`SupervisorBuilder`] wires the stores, the change feed and the master
//! observer into:
//! - one [`Flow`] per `(resource, tenant)` of the plain resources
//! - one [`MixEventFlow`] per `(mix resource, tenant, source collection)`
//! - the care-fields refresher feeding biz set relation rearranging
//! - the chain reaper and the leader-only archive cleaner
//! - optionally the metrics endpoint
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let supervisor = SupervisorBuilder::new(config, stores, stream, leader, shutdown_rx)
//!     .tenants(vec!["tenant-a".into()])
//!     .build()
//!     .start_metrics_server(shutdown_tx.subscribe())
//!     .ready()?;
//! let client = supervisor.watch_client();
//! ```
//!
//! Every job stops on the shutdown signal; a batch in flight finishes first.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;

use crate::metrics;
use crate::utils::async_task::spawn_task;
use crate::ArchiveCleaner;
use crate::BatchHandler;
use crate::BizSetRelationRearranger;
use crate::CareFieldsRefresher;
use crate::ChainReaper;
use crate::ChangeStream;
use crate::CursorType;
use crate::EventChainConfig;
use crate::Flow;
use crate::HostIdentityRearranger;
use crate::Key;
use crate::LeaderObserver;
use crate::LoopWatch;
use crate::LoopWatchOptions;
use crate::MixEventFlow;
use crate::MixSnapshots;
use crate::PolicyRegistry;
use crate::Rearranger;
use crate::Result;
use crate::Stores;
use crate::SystemError;
use crate::TokenHandler;
use crate::WatchClient;

/// Cared biz fields are reloaded this often.
const CARE_FIELDS_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

pub struct SupervisorBuilder {
    config: EventChainConfig,
    stores: Stores,
    stream: Arc<dyn ChangeStream>,
    leader: Arc<dyn LeaderObserver>,
    policies: PolicyRegistry,
    tenants: Vec<String>,
    resources: Vec<CursorType>,
    snapshots: MixSnapshots,
    shutdown_signal: watch::Receiver<()>,
    handles: Vec<JoinHandle<()>>,
    built: bool,
}

impl SupervisorBuilder {
    pub fn new(
        config: EventChainConfig,
        stores: Stores,
        stream: Arc<dyn ChangeStream>,
        leader: Arc<dyn LeaderObserver>,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        Self {
            config,
            stores,
            stream,
            leader,
            policies: PolicyRegistry::default(),
            tenants: Vec::new(),
            resources: CursorType::WATCHABLE.to_vec(),
            snapshots: MixSnapshots::default(),
            shutdown_signal,
            handles: Vec::new(),
            built: false,
        }
    }

    pub fn tenants(
        mut self,
        tenants: Vec<String>,
    ) -> Self {
        self.tenants = tenants;
        self
    }

    /// Restricts the chains maintained by this process. Defaults to every
    /// watchable resource.
    pub fn resources(
        mut self,
        resources: Vec<CursorType>,
    ) -> Self {
        self.resources = resources;
        self
    }

    pub fn policies(
        mut self,
        policies: PolicyRegistry,
    ) -> Self {
        self.policies = policies;
        self
    }

    /// Spawns every ingestion loop and background job.
    pub fn build(mut self) -> Self {
        let tenants = self.tenants.clone();
        let resources = self.resources.clone();
        let mut chains: Vec<(Key, String)> = Vec::new();

        for resource in resources {
            let key = self.config.resource.key(resource);
            for tenant in &tenants {
                chains.push((key.clone(), tenant.clone()));
                match resource {
                    CursorType::HostIdentifier => self.spawn_host_identity_flows(&key, tenant),
                    CursorType::BizSetRelation => self.spawn_biz_set_relation_flows(&key, tenant),
                    _ => self.spawn_flow(&key, tenant),
                }
            }
        }

        let refresher = CareFieldsRefresher::new(
            self.stores.docs.clone(),
            tenants,
            self.snapshots.care_fields.clone(),
            CARE_FIELDS_REFRESH_INTERVAL,
            self.config.retry.batch,
        );
        let rx = self.shutdown_signal.clone();
        spawn_task("care_fields_refresher", move || refresher.run(rx), Some(&mut self.handles));

        let reaper = ChainReaper::new(self.stores.chain.clone(), chains, self.config.resource.reap_interval());
        let rx = self.shutdown_signal.clone();
        spawn_task("chain_reaper", move || reaper.run(rx), Some(&mut self.handles));

        let cleaner = ArchiveCleaner::new(
            self.stores.archive.clone(),
            self.leader.clone(),
            self.config.archive.clone(),
        );
        let rx = self.shutdown_signal.clone();
        spawn_task("archive_cleaner", move || cleaner.run(rx), Some(&mut self.handles));

        info!(jobs = self.handles.len(), "event chain jobs started");
        self.built = true;
        self
    }

    /// Launches the Prometheus endpoint when monitoring is enabled.
    pub fn start_metrics_server(
        mut self,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        if !self.config.monitoring.prometheus_enabled {
            debug!("metrics endpoint disabled");
            return self;
        }
        let port = self.config.monitoring.prometheus_port;
        self.handles.push(tokio::spawn(async move {
            metrics::start_server(port, shutdown_signal).await;
        }));
        self
    }

    /// # Errors
    /// Returns `SystemError::Shutdown` when [`build`](Self::build) was never called.
    pub fn ready(self) -> Result<Supervisor> {
        if !self.built {
            return Err(SystemError::Shutdown.into());
        }
        let client = WatchClient::new(
            self.stores.clone(),
            self.config.resource.clone(),
            self.config.watch.clone(),
            self.snapshots.clone(),
        );
        Ok(Supervisor {
            client,
            handles: self.handles,
        })
    }

    fn spawn_flow(
        &mut self,
        key: &Key,
        tenant: &str,
    ) {
        let flow = Flow::new(
            key.clone(),
            tenant,
            self.stores.clone(),
            &self.policies,
            &self.config.flow,
        );
        let opts = flow.watch_options(self.config.flow.batch_size);
        let token = flow.token_handler();
        self.spawn_loop(opts, token, Arc::new(flow));
    }

    fn spawn_host_identity_flows(
        &mut self,
        key: &Key,
        tenant: &str,
    ) {
        for source in key.collections().to_vec() {
            let rearranger = HostIdentityRearranger::new(self.stores.docs.clone(), self.stores.archive.clone());
            self.spawn_mix_flow(key, tenant, &source, rearranger);
        }
    }

    fn spawn_biz_set_relation_flows(
        &mut self,
        key: &Key,
        tenant: &str,
    ) {
        for source in key.collections().to_vec() {
            let rearranger = BizSetRelationRearranger::new(
                self.stores.docs.clone(),
                self.stores.archive.clone(),
                self.snapshots.clone(),
            );
            self.spawn_mix_flow(key, tenant, &source, rearranger);
        }
    }

    fn spawn_mix_flow<R: Rearranger>(
        &mut self,
        key: &Key,
        tenant: &str,
        source: &str,
        rearranger: R,
    ) {
        let flow = MixEventFlow::new(
            key.clone(),
            tenant,
            source,
            self.stores.clone(),
            &self.policies,
            &self.config.lock,
            rearranger,
        );
        let opts = flow.watch_options(self.config.flow.mix_batch_size);
        let token = flow.token_handler();
        self.spawn_loop(opts, token, Arc::new(flow));
    }

    fn spawn_loop(
        &mut self,
        opts: LoopWatchOptions,
        token: TokenHandler,
        handler: Arc<dyn BatchHandler>,
    ) {
        let name = opts.name.clone();
        let lw = LoopWatch::new(
            opts,
            self.stream.clone(),
            token,
            handler,
            self.leader.clone(),
            self.config.flow.clone(),
            self.config.retry.clone(),
        );
        let rx = self.shutdown_signal.clone();
        debug!(name, "spawn loop watch");
        spawn_task(&name, move || lw.run(rx), Some(&mut self.handles));
    }
}

/// Running jobs plus the read side over the same stores.
pub struct Supervisor {
    client: WatchClient,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn watch_client(&self) -> WatchClient {
        self.client.clone()
    }

    pub fn jobs(&self) -> usize {
        self.handles.len()
    }

    /// Waits until every job has stopped.
    pub async fn join(self) -> Result<()> {
        for res in join_all(self.handles).await {
            res.map_err(SystemError::TaskFailed)?;
        }
        info!("event chain jobs stopped");
        Ok(())
    }
}
