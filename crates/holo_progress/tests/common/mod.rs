//! Shared helpers for progress log integration tests.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_progress::progress::{
    Agent, Ballot, Command, CommandStore, Durability, Epoch, InformDurable, Known, Node, NodeId,
    Participants, ProgressConfig, ProgressLogRegistry, ProgressToken, Remote, Route, RoutingKey,
    SafeCommandStore, ShardId, Status, Timestamp, Topology, TxnId, Unseekables,
};

/// Upper bound on waiting for asynchronous remediation to land.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub const LOCAL_NODE: NodeId = 1;

/// One call observed by `RecordingRemote`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Recover {
        txn_id: TxnId,
        home_key: RoutingKey,
        seed: ProgressToken,
    },
    Fetch {
        txn_id: TxnId,
        required: Known,
        epoch: Epoch,
    },
    Invalidate {
        txn_id: TxnId,
        participants: Participants,
    },
    InformHome {
        txn_id: TxnId,
        home_key: RoutingKey,
    },
    InformDurable {
        target: NodeId,
        txn_id: TxnId,
    },
}

/// Remote that records every call and answers from scripted replies. A
/// missing reply is a failure.
#[derive(Default)]
pub struct RecordingRemote {
    calls: Mutex<Vec<Call>>,
    pub recover_reply: Mutex<Option<ProgressToken>>,
    pub fetch_reply: Mutex<Option<Known>>,
    pub invalidate_reply: Mutex<Option<ProgressToken>>,
    pub inform_home_ok: Mutex<bool>,
    pub unreachable: Mutex<BTreeSet<NodeId>>,
    /// Delay applied to `inform_home`, to provoke timeouts.
    pub inform_home_delay: Mutex<Option<Duration>>,
}

impl RecordingRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock").push(call);
    }

    pub fn set<T>(slot: &Mutex<T>, value: T) {
        *slot.lock().expect("reply lock") = value;
    }
}

#[async_trait]
impl Remote for RecordingRemote {
    async fn recover(
        &self,
        txn_id: TxnId,
        home_key: RoutingKey,
        _route: Option<Route>,
        seed: ProgressToken,
    ) -> anyhow::Result<ProgressToken> {
        self.record(Call::Recover {
            txn_id,
            home_key,
            seed,
        });
        let reply = *self.recover_reply.lock().expect("reply lock");
        reply.ok_or_else(|| anyhow::anyhow!("recovery refused"))
    }

    async fn fetch(
        &self,
        required: Known,
        txn_id: TxnId,
        _participants: Participants,
        _execute_at: Option<Timestamp>,
        epoch: Epoch,
    ) -> anyhow::Result<Known> {
        self.record(Call::Fetch {
            txn_id,
            required,
            epoch,
        });
        let reply = *self.fetch_reply.lock().expect("reply lock");
        reply.ok_or_else(|| anyhow::anyhow!("fetch refused"))
    }

    async fn invalidate(
        &self,
        txn_id: TxnId,
        participants: Participants,
    ) -> anyhow::Result<ProgressToken> {
        self.record(Call::Invalidate {
            txn_id,
            participants,
        });
        let reply = *self.invalidate_reply.lock().expect("reply lock");
        reply.ok_or_else(|| anyhow::anyhow!("invalidation refused"))
    }

    async fn inform_home(&self, txn_id: TxnId, home_key: RoutingKey) -> anyhow::Result<()> {
        self.record(Call::InformHome { txn_id, home_key });
        let delay = *self.inform_home_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.inform_home_ok.lock().expect("reply lock") {
            Ok(())
        } else {
            anyhow::bail!("home shard unreachable")
        }
    }

    async fn inform_durable(&self, target: NodeId, req: InformDurable) -> anyhow::Result<()> {
        self.record(Call::InformDurable {
            target,
            txn_id: req.txn_id,
        });
        if self.unreachable.lock().expect("unreachable lock").contains(&target) {
            anyhow::bail!("node {target} unreachable");
        }
        Ok(())
    }
}

/// Every epoch up to `current` is known; every route maps to all nodes.
pub struct StaticTopology {
    pub current: Epoch,
    pub nodes: BTreeSet<NodeId>,
}

impl StaticTopology {
    pub fn new(current: Epoch, nodes: &[NodeId]) -> Arc<Self> {
        Arc::new(Self {
            current,
            nodes: nodes.iter().copied().collect(),
        })
    }
}

#[async_trait]
impl Topology for StaticTopology {
    fn has_epoch(&self, epoch: Epoch) -> bool {
        epoch <= self.current
    }

    fn current_epoch(&self) -> Epoch {
        self.current
    }

    fn precise_nodes(&self, _route: &Route, _from: Epoch, _to: Epoch) -> BTreeSet<NodeId> {
        self.nodes.clone()
    }
}

/// Agent that keeps every reported error.
#[derive(Default)]
pub struct CountingAgent {
    errors: Mutex<Vec<(ShardId, String)>>,
    count: AtomicUsize,
}

impl CountingAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<String> {
        self.errors
            .lock()
            .expect("errors lock")
            .iter()
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

impl Agent for CountingAgent {
    fn on_uncaught_error(&self, shard_id: ShardId, err: anyhow::Error) {
        self.errors
            .lock()
            .expect("errors lock")
            .push((shard_id, format!("{err:#}")));
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// One node with a single shard, wired to test collaborators.
pub struct Harness {
    pub remote: Arc<RecordingRemote>,
    pub agent: Arc<CountingAgent>,
    pub node: Arc<Node>,
    pub store: CommandStore,
    pub registry: Arc<ProgressLogRegistry>,
}

impl Harness {
    pub fn new(nodes: &[NodeId]) -> Self {
        Self::with_config(nodes, ProgressConfig::default())
    }

    pub fn with_config(nodes: &[NodeId], config: ProgressConfig) -> Self {
        let remote = RecordingRemote::new();
        let agent = CountingAgent::new();
        let node = Node::new(
            LOCAL_NODE,
            StaticTopology::new(1, nodes),
            remote.clone(),
            agent.clone(),
            config,
        );
        let store = CommandStore::spawn(0, node.clone());
        let registry = ProgressLogRegistry::new(config.tick_interval);
        registry.register(&store);
        Self {
            remote,
            agent,
            node,
            store,
            registry,
        }
    }

    /// One registry period: snapshot the shard, then run every queued tick.
    pub async fn tick(&self) {
        self.registry.tick_once();
        self.store.flush().await.expect("flush snapshot");
        self.store.flush().await.expect("flush ticks");
    }

    pub async fn record<F>(&self, f: F)
    where
        F: FnOnce(&mut SafeCommandStore) -> anyhow::Result<()> + Send + 'static,
    {
        self.store
            .run(f)
            .await
            .expect("shard task")
            .expect("record event");
    }

    pub async fn read<T, F>(&self, f: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&mut SafeCommandStore) -> T + Send + 'static,
    {
        self.store.run(f).await.expect("shard task")
    }

    /// Poll the shard until `pred` holds.
    pub async fn wait_until<F>(&self, what: &str, pred: F)
    where
        F: Fn(&SafeCommandStore) -> bool + Send + Sync + Clone + 'static,
    {
        poll(what, move || {
            let pred = pred.clone();
            async move { self.store.run(move |safe| pred(safe)).await.expect("shard task") }
        })
        .await;
    }

    /// Wait until at least `n` recorded calls match `pred`.
    pub async fn wait_for_calls(&self, what: &str, n: usize, pred: impl Fn(&Call) -> bool) {
        let remote = self.remote.clone();
        poll(what, move || {
            let matched = remote.count(&pred);
            async move { matched >= n }
        })
        .await;
    }
}

pub async fn poll<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        if check().await {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn txn(hlc: u64) -> TxnId {
    TxnId::new(1, hlc, LOCAL_NODE)
}

pub fn home_key() -> RoutingKey {
    RoutingKey::from("home")
}

pub fn ballot(counter: u64) -> Ballot {
    Ballot::new(counter, LOCAL_NODE)
}

pub fn token(durability: Durability, status: Status, counter: u64) -> ProgressToken {
    ProgressToken::new(durability, status, ballot(counter), ballot(counter))
}

/// Pre-accepted command homed on `home`, with a full route over key `a`.
pub fn pre_accepted(txn_id: TxnId) -> Command {
    Command {
        txn_id,
        status: Status::PreAccepted,
        durability: Durability::NotDurable,
        route: Some(Route::full(home_key(), Unseekables::of_keys(["a"]))),
        home_key: Some(home_key()),
        execute_at: None,
        promised: Ballot::zero(),
        accepted: Ballot::zero(),
    }
}

/// Committed at epoch 1 with the same route as `pre_accepted`.
pub fn committed(txn_id: TxnId) -> Command {
    Command {
        status: Status::Committed,
        execute_at: Some(Timestamp::new(1, txn_id.hlc + 1, LOCAL_NODE)),
        ..pre_accepted(txn_id)
    }
}
