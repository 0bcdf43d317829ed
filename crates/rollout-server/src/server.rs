//! Process wiring.
//!
//! [`EngineServer`] owns the shared collaborators, one consumer task per
//! assigned partition and the scheduler ticker. Partitions can be assigned
//! and revoked while running; revoking evicts the partition's workspaces.

use crate::bootstrap::{InitialStateLoader, NoopInitialStateLoader};
use crate::config::{LogBackend, ServerConfig};
use crate::consumer::{ConsumerContext, ConsumerStats, PartitionConsumer};
use crate::dispatch::{JobDispatcher, LoggingJobDispatcher, LoggingVerificationRunner, Outbox, VerificationRunner};
use crate::error::{ServerError, ServerResult};
use crate::log::{InMemoryPartitionLog, PartitionLog};
use crate::snapshots::SnapshotManager;
use crate::ticker::Ticker;
use rollout_engine::{Clock, SystemClock, WorkspaceRegistry};
use rollout_snapshot_store::{storage_from_url, SnapshotRegistry, SnapshotStorage, StorageSnapshotRegistry};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Backends the server runs on
#[derive(Debug, Clone)]
pub struct ServerComponents {
    /// Event log
    pub log: Arc<dyn PartitionLog>,
    /// Snapshot blobs
    pub storage: Arc<dyn SnapshotStorage>,
    /// Snapshot registry
    pub snapshot_registry: Arc<dyn SnapshotRegistry>,
    /// Cold-start bootstrap
    pub loader: Arc<dyn InitialStateLoader>,
    /// Job-agent boundary
    pub dispatcher: Arc<dyn JobDispatcher>,
    /// Verification probes
    pub verifier: Arc<dyn VerificationRunner>,
    /// Wall clock
    pub clock: Arc<dyn Clock>,
}

impl ServerComponents {
    /// Backends named by the configuration
    pub async fn from_config(config: &ServerConfig) -> ServerResult<Self> {
        let log: Arc<dyn PartitionLog> = match config.log_backend {
            LogBackend::Memory => Arc::new(InMemoryPartitionLog::new(config.log_num_partitions)),
            #[cfg(feature = "kafka")]
            LogBackend::Kafka => Arc::new(crate::kafka::KafkaPartitionLog::connect(config)?),
            #[cfg(not(feature = "kafka"))]
            LogBackend::Kafka => {
                return Err(ServerError::ConfigError("LOG_BACKEND=kafka requires the `kafka` feature".to_string()))
            }
        };

        let storage = storage_from_url(&config.snapshot_storage_url)?;
        let (snapshot_registry, loader) = Self::database_backends(config, storage.clone()).await?;

        Ok(Self {
            log,
            storage,
            snapshot_registry,
            loader,
            dispatcher: Arc::new(LoggingJobDispatcher),
            verifier: Arc::new(LoggingVerificationRunner),
            clock: Arc::new(SystemClock),
        })
    }

    #[cfg(feature = "postgres")]
    async fn database_backends(
        config: &ServerConfig,
        storage: Arc<dyn SnapshotStorage>,
    ) -> ServerResult<(Arc<dyn SnapshotRegistry>, Arc<dyn InitialStateLoader>)> {
        match &config.database_url {
            Some(url) => {
                let registry = rollout_snapshot_store::postgres::PostgresSnapshotRegistry::connect(url).await?;
                let loader = crate::bootstrap::PostgresInitialStateLoader::connect(url).await?;
                Ok((Arc::new(registry), Arc::new(loader)))
            }
            None => Ok((Arc::new(StorageSnapshotRegistry::new(storage)), Arc::new(NoopInitialStateLoader))),
        }
    }

    #[cfg(not(feature = "postgres"))]
    async fn database_backends(
        config: &ServerConfig,
        storage: Arc<dyn SnapshotStorage>,
    ) -> ServerResult<(Arc<dyn SnapshotRegistry>, Arc<dyn InitialStateLoader>)> {
        if config.database_url.is_some() {
            warn!("DATABASE_URL is set but this build has no `postgres` feature; ignoring it");
        }
        Ok((Arc::new(StorageSnapshotRegistry::new(storage)), Arc::new(NoopInitialStateLoader)))
    }
}

#[derive(Debug)]
struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<ServerResult<()>>,
}

impl Worker {
    async fn stop(self) -> ServerResult<()> {
        let _ = self.shutdown.send(true);
        self.handle.await?
    }
}

/// The workspace engine process
#[derive(Debug)]
pub struct EngineServer {
    config: ServerConfig,
    log: Arc<dyn PartitionLog>,
    ctx: ConsumerContext,
    workers: BTreeMap<i32, Worker>,
}

impl EngineServer {
    /// Server on the backends named by `config`
    pub async fn build(config: ServerConfig) -> ServerResult<Self> {
        let components = ServerComponents::from_config(&config).await?;
        Ok(Self::with_components(config, components))
    }

    /// Server on explicit backends
    pub fn with_components(config: ServerConfig, components: ServerComponents) -> Self {
        let num_partitions = config.log_num_partitions;
        let retry = config.retry_policy();
        let workspaces = Arc::new(WorkspaceRegistry::new(config.engine.clone(), components.clock.clone()));
        let outbox = Arc::new(Outbox::new(
            components.log.producer(),
            num_partitions,
            components.dispatcher,
            components.verifier,
            workspaces.clone(),
            retry,
        ));
        let snapshots = Arc::new(SnapshotManager::new(
            components.storage,
            components.snapshot_registry,
            num_partitions,
            retry,
        ));
        let ctx = ConsumerContext {
            workspaces,
            snapshots,
            loader: components.loader,
            outbox,
            stats: Arc::new(ConsumerStats::new()),
            num_partitions,
            retry,
        };
        Self { config, log: components.log, ctx, workers: BTreeMap::new() }
    }

    /// Shared consumer collaborators
    pub fn context(&self) -> &ConsumerContext {
        &self.ctx
    }

    /// Loaded workspaces
    pub fn workspaces(&self) -> &Arc<WorkspaceRegistry> {
        &self.ctx.workspaces
    }

    /// Event counts
    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.ctx.stats
    }

    /// Event log
    pub fn log(&self) -> &Arc<dyn PartitionLog> {
        &self.log
    }

    /// Consumer for `partition`, not yet started
    pub fn consumer(&self, partition: i32) -> ServerResult<PartitionConsumer> {
        Ok(PartitionConsumer::new(self.log.reader(partition)?, self.ctx.clone()))
    }

    /// Partitions with a running consumer
    pub fn assigned(&self) -> Vec<i32> {
        self.workers.keys().copied().collect()
    }

    /// Start consuming `partition`
    pub fn assign(&mut self, partition: i32) -> ServerResult<()> {
        if self.workers.contains_key(&partition) {
            return Ok(());
        }
        let consumer = self.consumer(partition)?;
        let (shutdown, receiver) = watch::channel(false);
        let handle = tokio::spawn(consumer.run(receiver));
        self.workers.insert(partition, Worker { shutdown, handle });
        info!(partition, "Partition assigned");
        Ok(())
    }

    /// Stop consuming `partition` and evict its workspaces
    pub async fn revoke(&mut self, partition: i32) -> ServerResult<Vec<String>> {
        if let Some(worker) = self.workers.remove(&partition) {
            if let Err(e) = worker.stop().await {
                warn!(partition, error = %e, "Partition consumer ended with an error");
            }
        }
        Ok(PartitionConsumer::revoke(&self.ctx.workspaces, partition, self.ctx.num_partitions))
    }

    async fn reap_failed(&mut self) -> ServerResult<()> {
        let finished: Vec<i32> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.is_finished())
            .map(|(partition, _)| *partition)
            .collect();
        for partition in finished {
            if let Some(worker) = self.workers.remove(&partition) {
                worker.handle.await??;
                warn!(partition, "Partition consumer exited");
            }
        }
        Ok(())
    }

    /// Consume the configured partitions until `shutdown` resolves or a
    /// partition consumer fails
    pub async fn run_until<F>(mut self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()>,
    {
        let partitions = self.config.partitions();
        for partition in &partitions {
            self.assign(*partition)?;
        }

        let (ticker_shutdown, ticker_receiver) = watch::channel(false);
        let ticker = Ticker::new(
            self.ctx.workspaces.clone(),
            self.ctx.outbox.clone(),
            partitions,
            self.ctx.num_partitions,
            self.config.tick_interval(),
        );
        let ticker_handle = tokio::spawn(ticker.run(ticker_receiver));

        tokio::pin!(shutdown);
        let outcome = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    if let Err(e) = self.reap_failed().await {
                        error!(error = %e, "Stopping after partition consumer failure");
                        break Err(e);
                    }
                }
            }
        };

        info!("Shutting down");
        let _ = ticker_shutdown.send(true);
        let stopping = std::mem::take(&mut self.workers)
            .into_iter()
            .map(|(partition, worker)| async move { (partition, worker.stop().await) });
        for (partition, result) in join_all(stopping).await {
            if let Err(e) = result {
                warn!(partition, error = %e, "Partition consumer ended with an error");
            }
        }
        ticker_handle.await??;
        outcome
    }
}
