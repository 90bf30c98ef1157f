//! Reconciliation loop tying synthesis, the local engine, node pushes and
//! stats collection together.

pub mod usage;
pub mod worker;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::usage::UsageBatch;
use self::worker::Worker;
use crate::db::models::{Node, NodeStatus, ResetPolicy, Settings};
use crate::db::{Database, DatabaseError};
use crate::node_sync::{NodeSync, NodeSyncError};
use crate::writer::{ConfigSynthesizer, SynthError, node_wired};
use crate::xray::config::EngineConfig;
use crate::xray::stats::Counter;
use crate::xray::supervisor::{EngineError, ProcessSupervisor};

const OUTDATED_SYNC_INTERVAL: Duration = Duration::from_secs(60);
const BACKUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const RESET_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Config synthesis failed: {0}")]
    Synth(#[from] SynthError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

pub struct Coordinator {
    database: Arc<Database>,
    synthesizer: ConfigSynthesizer,
    supervisor: Arc<dyn ProcessSupervisor>,
    node_sync: Arc<dyn NodeSync>,
    stats_interval: Duration,
    shutdown: CancellationToken,
    /// Last config handed to the engine; remote configs are derived from it.
    local_config: Mutex<Option<EngineConfig>>,
    /// Held for the whole of a full sync, an outdated-node sync or a stats pass.
    sync_lock: Mutex<()>,
    dirty_tx: mpsc::Sender<()>,
    dirty_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Coordinator {
    pub fn new(
        database: Arc<Database>,
        synthesizer: ConfigSynthesizer,
        supervisor: Arc<dyn ProcessSupervisor>,
        node_sync: Arc<dyn NodeSync>,
        stats_interval: Duration,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::channel::<()>(1);
        Arc::new(Self {
            database,
            synthesizer,
            supervisor,
            node_sync,
            stats_interval,
            shutdown,
            local_config: Mutex::new(None),
            sync_lock: Mutex::new(()),
            dirty_tx,
            dirty_rx: Mutex::new(Some(dirty_rx)),
        })
    }

    /// Performs the first full sync, then starts the resync consumer and the
    /// four interval workers. Call once.
    pub async fn run(self: &Arc<Self>) -> Result<(), CoordinatorError> {
        info!("Coordinator running...");
        self.sync_configs().await?;

        let this = Arc::clone(self);
        tokio::spawn(async move { this.consume_dirty().await });

        let this = Arc::clone(self);
        let supervisor = Arc::clone(&self.supervisor);
        Worker::new("stats", self.stats_interval, self.shutdown.clone()).spawn(
            move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.sync_stats().await {
                        error!(error = %e, "Stats sync failed.");
                    }
                }
            },
            move || async move { supervisor.shutdown().await },
        );

        let this = Arc::clone(self);
        Worker::new("outdated-nodes", OUTDATED_SYNC_INTERVAL, self.shutdown.clone()).spawn(
            move || {
                let this = Arc::clone(&this);
                async move { this.sync_outdated_nodes().await }
            },
            || async {},
        );

        let this = Arc::clone(self);
        Worker::new("backup", BACKUP_INTERVAL, self.shutdown.clone()).spawn(
            move || {
                let this = Arc::clone(&this);
                async move { this.backup_database().await }
            },
            || async {},
        );

        let this = Arc::clone(self);
        Worker::new("usage-reset", RESET_INTERVAL, self.shutdown.clone()).spawn(
            move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.reset_user_usages(Utc::now()).await {
                        error!(error = %e, "Usage reset failed.");
                    }
                }
            },
            || async {},
        );

        Ok(())
    }

    /// Requests a full resync. Requests made while one is already queued
    /// collapse into it.
    pub fn trigger_sync(&self) {
        match self.dirty_tx.try_send(()) {
            Ok(()) => debug!("Full sync queued."),
            Err(mpsc::error::TrySendError::Full(())) => debug!("Full sync already queued."),
            Err(mpsc::error::TrySendError::Closed(())) => warn!("Sync consumer is gone, request dropped."),
        }
    }

    async fn consume_dirty(self: Arc<Self>) {
        let Some(mut rx) = self.dirty_rx.lock().await.take() else {
            warn!("Sync consumer already running.");
            return;
        };
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                received = rx.recv() => {
                    if received.is_none() {
                        return;
                    }
                    while rx.try_recv().is_ok() {}
                    if let Err(e) = self.sync_configs().await {
                        error!(error = %e, "Full sync failed, shutting down.");
                        self.shutdown.cancel();
                        return;
                    }
                }
            }
        }
    }

    /// Synthesizes the local config, restarts the engine with it, then pushes
    /// every node its remote config in parallel.
    pub async fn sync_configs(&self) -> Result<(), CoordinatorError> {
        let _guard = self.sync_lock.lock().await;

        let (users, nodes, settings, active) = self
            .database
            .read(|c| (c.users.clone(), c.nodes.clone(), c.settings.clone(), c.count_active_users()))
            .await;
        debug!(active_users = active, nodes = nodes.len(), "Synthesizing local config...");

        let local = self.synthesizer.local_config(&users, &nodes, &settings)?;
        self.supervisor.set_config(local.clone()).await;
        self.supervisor.restart().await?;
        *self.local_config.lock().await = Some(local.clone());

        self.push_nodes(nodes, &local, &settings).await;
        info!("Configs synced.");
        Ok(())
    }

    /// Re-pushes nodes still `processing` or `unavailable`. Nodes the current
    /// local config has no legs for need a full sync instead.
    pub async fn sync_outdated_nodes(&self) {
        let _guard = self.sync_lock.lock().await;

        let Some(local) = self.local_config.lock().await.clone() else {
            warn!("No local config yet, skipping outdated node sync.");
            return;
        };
        let (nodes, settings) = self
            .database
            .read(|c| {
                let outdated: Vec<Node> = c
                    .nodes
                    .iter()
                    .filter(|n| n.status.is_outdated())
                    .cloned()
                    .collect();
                (outdated, c.settings.clone())
            })
            .await;
        let (nodes, unwired): (Vec<Node>, Vec<Node>) = nodes
            .into_iter()
            .partition(|n| node_wired(n.id, &local, &settings));
        if !unwired.is_empty() {
            info!(count = unwired.len(), "Nodes missing from the local config, full sync required.");
            self.trigger_sync();
        }
        if nodes.is_empty() {
            return;
        }

        debug!(count = nodes.len(), "Syncing outdated nodes...");
        self.push_nodes(nodes, &local, &settings).await;
    }

    async fn push_nodes(&self, nodes: Vec<Node>, local: &EngineConfig, settings: &Settings) {
        let proxy = settings.proxy().map(str::to_string);
        let mut tasks = JoinSet::new();

        for node in nodes {
            let config = self.synthesizer.remote_config(&node, local, settings);
            let node_sync = Arc::clone(&self.node_sync);
            let database = Arc::clone(&self.database);
            let proxy = proxy.clone();
            tasks.spawn(async move {
                let status = node_sync.push(&node, &config, proxy.as_deref()).await.status();
                let saved = database
                    .write(|c| {
                        if let Some(n) = c.find_node_mut(node.id) {
                            n.status = status;
                        }
                    })
                    .await;
                if let Err(e) = saved {
                    error!(node_id = node.id, error = %e, "Cannot save node status.");
                }
                (node.id, status)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((node_id, status)) => debug!(node_id, ?status, "Node synced."),
                Err(e) => error!(error = %e, "Node sync task failed."),
            }
        }
    }

    /// Collects counters from the engine and every node, folds them into the
    /// database in one pass and disables users over quota.
    pub async fn sync_stats(&self) -> Result<(), CoordinatorError> {
        let _guard = self.sync_lock.lock().await;
        debug!("Syncing stats...");
        let local = self.supervisor.query_stats().await;
        let remote = self.fetch_node_stats().await;

        let mut batch = UsageBatch::default();
        batch.add_local(&local);
        let mut failed = Vec::new();
        for (node_id, result) in remote {
            match result {
                Ok(counters) => batch.add_remote(&counters),
                Err(e) => {
                    warn!(node_id, error = %e, "Cannot fetch node stats.");
                    failed.push(node_id);
                }
            }
        }

        if batch.is_empty() && failed.is_empty() {
            debug!("No traffic since the last pass.");
            return Ok(());
        }

        let (disabled, total_usage) = self
            .database
            .write(|c| {
                for node_id in &failed {
                    if let Some(node) = c.find_node_mut(*node_id) {
                        node.status = NodeStatus::Unavailable;
                    }
                }
                let disabled = batch.apply(c);
                (disabled, c.stats.scaled_usage(c.settings.traffic_ratio))
            })
            .await?;
        debug!(total_usage, "Stats folded.");

        if disabled {
            info!("Users exceeded their quota, resync required.");
            self.trigger_sync();
        }
        Ok(())
    }

    async fn fetch_node_stats(&self) -> Vec<(i64, Result<Vec<Counter>, NodeSyncError>)> {
        let (nodes, proxy) = self
            .database
            .read(|c| (c.nodes.clone(), c.settings.proxy().map(str::to_string)))
            .await;

        let mut tasks = JoinSet::new();
        for node in nodes {
            let node_sync = Arc::clone(&self.node_sync);
            let proxy = proxy.clone();
            tasks.spawn(async move { (node.id, node_sync.fetch_stats(&node, proxy.as_deref()).await) });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Node stats task failed."),
            }
        }
        results
    }

    /// Starts a new quota period for users last reset in an earlier calendar
    /// month. No-op unless the reset policy is monthly.
    pub async fn reset_user_usages(&self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        if self.database.read(|c| c.settings.reset_policy).await != ResetPolicy::Monthly {
            return Ok(());
        }
        let month = now.format("%Y-%m").to_string();
        let now_ms = now.timestamp_millis();

        let reset = self
            .database
            .write(|c| {
                let mut reset = 0;
                for user in c.users.iter_mut() {
                    let last = DateTime::<Utc>::from_timestamp_millis(user.usage_reset_at)
                        .map(|t| t.format("%Y-%m").to_string());
                    if last.as_deref() != Some(month.as_str()) {
                        user.reset_usage(now_ms);
                        reset += 1;
                    }
                }
                reset
            })
            .await?;

        if reset > 0 {
            info!(users = reset, "User usages reset for the new month.");
            self.trigger_sync();
        }
        Ok(())
    }

    pub async fn backup_database(&self) {
        match self.database.backup(Utc::now()).await {
            Ok(path) => debug!(path = ?path, "Database backed up."),
            Err(e) => error!(error = %e, "Cannot back up the database."),
        }
    }

    pub async fn local_config(&self) -> Option<EngineConfig> {
        self.local_config.lock().await.clone()
    }
}
