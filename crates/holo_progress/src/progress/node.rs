//! Node-wide collaborators shared by every shard's progress log.

use std::future::Future;
use std::sync::Arc;

use tokio::time;

use super::config::ProgressConfig;
use super::metrics::ProgressMetrics;
use super::types::{Agent, NodeId, Remote, ShardId, Topology};

pub struct Node {
    id: NodeId,
    topology: Arc<dyn Topology>,
    remote: Arc<dyn Remote>,
    agent: Arc<dyn Agent>,
    config: ProgressConfig,
    metrics: ProgressMetrics,
}

impl Node {
    pub fn new(
        id: NodeId,
        topology: Arc<dyn Topology>,
        remote: Arc<dyn Remote>,
        agent: Arc<dyn Agent>,
        config: ProgressConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            topology,
            remote,
            agent,
            config,
            metrics: ProgressMetrics::default(),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn topology(&self) -> &Arc<dyn Topology> {
        &self.topology
    }

    pub fn remote(&self) -> &Arc<dyn Remote> {
        &self.remote
    }

    pub fn config(&self) -> &ProgressConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ProgressMetrics {
        &self.metrics
    }

    /// Hand a failure that escaped a shard task to the agent.
    pub fn report(&self, shard_id: ShardId, err: anyhow::Error) {
        self.metrics.record_uncaught_error();
        self.agent.on_uncaught_error(shard_id, err);
    }

    /// Run a remote operation under the configured timeout.
    pub(crate) async fn bounded<T, F>(&self, what: &'static str, fut: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match time::timeout(self.config.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                self.metrics.record_remote_timeout();
                anyhow::bail!("{what} timed out after {:?}", self.config.remote_timeout)
            }
        }
    }
}
