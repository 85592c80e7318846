//! Serial per-shard executor.
//!
//! Each command store owns one tokio task that drains a queue of closures.
//! A closure receives `&mut SafeCommandStore`, so holding one proves the code
//! is running on the shard's own context; nothing else can reach the command
//! table or the progress log.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use anyhow::anyhow;
use tokio::sync::{mpsc, oneshot};

use super::lattice::Investigation;
use super::node::Node;
use super::remediation::{self, Completion, Dispatch};
use super::shard::ShardProgressLog;
use super::types::{Command, NodeId, ShardId, ShardRole, TxnId};

type Task = Box<dyn FnOnce(&mut SafeCommandStore) + Send + 'static>;

pub(crate) struct StoreInner {
    shard_id: ShardId,
    node: Arc<Node>,
    tx: mpsc::UnboundedSender<Task>,
}

/// Handle to a shard's executor. Cheap to clone; the executor stops once
/// every handle is gone and its queue has drained.
#[derive(Clone)]
pub struct CommandStore {
    inner: Arc<StoreInner>,
}

/// Handle that does not keep the executor alive.
#[derive(Clone)]
pub(crate) struct WeakCommandStore(Weak<StoreInner>);

impl WeakCommandStore {
    pub(crate) fn upgrade(&self) -> Option<CommandStore> {
        self.0.upgrade().map(|inner| CommandStore { inner })
    }
}

/// Shard-local state, only reachable from tasks on the shard's executor.
pub struct SafeCommandStore {
    shard_id: ShardId,
    node: Arc<Node>,
    handle: WeakCommandStore,
    commands: HashMap<TxnId, Command>,
    progress_log: ShardProgressLog,
}

impl CommandStore {
    pub fn spawn(shard_id: ShardId, node: Arc<Node>) -> CommandStore {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let inner = Arc::new(StoreInner {
            shard_id,
            node: node.clone(),
            tx,
        });

        let mut safe = SafeCommandStore {
            shard_id,
            node: node.clone(),
            handle: WeakCommandStore(Arc::downgrade(&inner)),
            commands: HashMap::new(),
            progress_log: ShardProgressLog::new(shard_id, node.id(), node.topology().clone()),
        };

        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                let result = panic::catch_unwind(AssertUnwindSafe(|| task(&mut safe)));
                if let Err(payload) = result {
                    let message = panic_message(payload.as_ref());
                    node.report(shard_id, anyhow!("shard task panicked: {message}"));
                }
            }
            tracing::debug!(shard_id, "command store executor stopped");
        });

        CommandStore { inner }
    }

    pub fn shard_id(&self) -> ShardId {
        self.inner.shard_id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.inner.node
    }

    pub(crate) fn downgrade(&self) -> WeakCommandStore {
        WeakCommandStore(Arc::downgrade(&self.inner))
    }

    fn enqueue(&self, task: Task) {
        if self.inner.tx.send(task).is_err() {
            tracing::warn!(shard_id = self.inner.shard_id, "command store executor is gone");
        }
    }

    /// Fire-and-forget. An `Err` goes to the node's agent.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce(&mut SafeCommandStore) -> anyhow::Result<()> + Send + 'static,
    {
        self.enqueue(Box::new(move |safe: &mut SafeCommandStore| {
            if let Err(err) = f(safe) {
                safe.node.report(safe.shard_id, err);
            }
        }));
    }

    /// Run `f` on the shard and wait for its result.
    pub async fn run<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SafeCommandStore) -> T + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(Box::new(move |safe: &mut SafeCommandStore| {
            let _ = done_tx.send(f(safe));
        }));
        done_rx
            .await
            .map_err(|_| anyhow!("shard {} dropped the task", self.inner.shard_id))
    }

    /// Resolve once every task queued before this call has run.
    pub async fn flush(&self) -> anyhow::Result<()> {
        self.run(|_| ()).await
    }

    /// Post a remediation result back to the shard.
    pub(crate) fn complete(&self, txn_id: TxnId, tag: Investigation, completion: Completion) {
        self.execute(move |safe| safe.complete(txn_id, tag, completion));
    }

    /// Queue one tick per transaction tracked at the time the snapshot runs.
    /// Each transaction gets its own task so a failure stays local to it.
    pub fn tick_all(&self) {
        self.execute(|safe| {
            let Some(store) = safe.handle.upgrade() else {
                return Ok(());
            };
            for txn_id in safe.progress_log.txn_ids() {
                store.execute(move |safe| safe.tick(txn_id));
            }
            Ok(())
        });
    }
}

impl SafeCommandStore {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Latest local view of `txn_id`; unwitnessed if none is stored.
    pub fn command(&self, txn_id: TxnId) -> Command {
        self.commands
            .get(&txn_id)
            .cloned()
            .unwrap_or_else(|| Command::not_witnessed(txn_id))
    }

    pub fn command_mut(&mut self, txn_id: TxnId) -> &mut Command {
        self.commands
            .entry(txn_id)
            .or_insert_with(|| Command::not_witnessed(txn_id))
    }

    pub fn upsert_command(&mut self, command: Command) {
        self.commands.insert(command.txn_id, command);
    }

    pub fn progress_log(&self) -> &ShardProgressLog {
        &self.progress_log
    }

    pub fn progress_log_mut(&mut self) -> &mut ShardProgressLog {
        &mut self.progress_log
    }

    /// Audit one transaction and launch whatever its trackers plan. Tracker
    /// errors go to the agent only after every planned remediation is out.
    pub fn tick(&mut self, txn_id: TxnId) -> anyhow::Result<()> {
        self.node.metrics().record_tick();
        let command = self.command(txn_id);
        let outcome = self.progress_log.tick(&command)?;
        for dispatch in outcome.dispatches {
            self.launch(dispatch);
        }
        for err in outcome.errors {
            self.node.report(self.shard_id, err.context(format!("audit of {txn_id}")));
        }
        Ok(())
    }

    pub(crate) fn complete(
        &mut self,
        txn_id: TxnId,
        tag: Investigation,
        completion: Completion,
    ) -> anyhow::Result<()> {
        let metrics = self.node.metrics();
        if completion.is_failure() {
            metrics.record_remote_failure();
        }

        let outcome = self.progress_log.complete(txn_id, tag, completion)?;
        if outcome.stale {
            metrics.record_stale_completion();
            tracing::trace!(shard_id = self.shard_id, %txn_id, ?tag, "discarding stale completion");
            return Ok(());
        }

        if let Some(durability) = outcome.durable_globally {
            self.command_mut(txn_id).set_durability(durability);
            let command = self.command(txn_id);
            // Only the home shard's coordinator recovers, so a recovered
            // outcome always lands on the home shard.
            self.progress_log.on_durable_globally(&command, None, ShardRole::Home)?;
        }
        if let Some(followup) = outcome.followup {
            self.launch(followup);
        }
        Ok(())
    }

    fn launch(&self, dispatch: Dispatch) {
        match self.handle.upgrade() {
            Some(store) => remediation::launch(store, dispatch),
            None => tracing::debug!(
                shard_id = self.shard_id,
                txn_id = %dispatch.txn_id,
                "command store shutting down; dropping remediation"
            ),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
