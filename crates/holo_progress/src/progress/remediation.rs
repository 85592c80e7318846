//! Remediations planned by the trackers and their execution.
//!
//! Trackers never talk to the network. A tick produces `Dispatch` values; the
//! shard executor hands each one to `launch`, which runs the remote operation
//! on the runtime and posts a `Completion` back onto the owning shard.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};

use super::lattice::Investigation;
use super::node::Node;
use super::store::CommandStore;
use super::types::{
    Durability, Epoch, InformDurable, Known, NodeId, Participants, ProgressToken, Route,
    RoutingKey, Timestamp, TxnId,
};

/// Remote step a tracker wants taken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Remediation {
    /// Higher-ballot consensus round seeded with everything observed so far.
    Recover {
        home_key: RoutingKey,
        route: Option<Route>,
        token: ProgressToken,
    },
    /// Fetch enough to apply a transaction already known durable.
    FetchToApply {
        required: Known,
        route: Route,
        execute_at: Timestamp,
        epoch: Epoch,
    },
    /// Tell each listed replica the transaction is durable.
    AnnounceDurable {
        to: BTreeSet<NodeId>,
        message: InformDurable,
    },
    /// Fetch knowledge a local dependent is blocked on.
    FetchKnowledge {
        required: Known,
        participants: Participants,
        execute_at: Option<Timestamp>,
        epoch: Epoch,
    },
    Invalidate {
        participants: Participants,
    },
    InformHome {
        home_key: RoutingKey,
    },
}

impl Remediation {
    pub fn kind(&self) -> &'static str {
        match self {
            Remediation::Recover { .. } => "recover",
            Remediation::FetchToApply { .. } => "fetch_to_apply",
            Remediation::AnnounceDurable { .. } => "announce_durable",
            Remediation::FetchKnowledge { .. } => "fetch_knowledge",
            Remediation::Invalidate { .. } => "invalidate",
            Remediation::InformHome { .. } => "inform_home",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatch {
    pub txn_id: TxnId,
    pub tag: Investigation,
    pub remediation: Remediation,
}

/// Result of a remediation, delivered back on the shard that dispatched it.
#[derive(Debug)]
pub enum Completion {
    Recovered(anyhow::Result<ProgressToken>),
    Fetched(anyhow::Result<Known>),
    Invalidated(anyhow::Result<ProgressToken>),
    InformedHome(anyhow::Result<()>),
    DurabilityAcknowledged(NodeId),
    AnnouncementRoundFinished,
}

impl Completion {
    pub(crate) fn is_failure(&self) -> bool {
        match self {
            Completion::Recovered(r) | Completion::Invalidated(r) => r.is_err(),
            Completion::Fetched(r) => r.is_err(),
            Completion::InformedHome(r) => r.is_err(),
            Completion::DurabilityAcknowledged(_) | Completion::AnnouncementRoundFinished => false,
        }
    }
}

/// What the shard must do after a completion was applied.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub stale: bool,
    /// A further remediation, e.g. invalidation after a fruitless fetch.
    pub followup: Option<Dispatch>,
    /// Recovery learned the transaction is durable; record it locally.
    pub durable_globally: Option<Durability>,
}

impl CompletionOutcome {
    pub(crate) fn stale() -> Self {
        Self {
            stale: true,
            ..Self::default()
        }
    }

    pub(crate) fn resolved() -> Self {
        Self::default()
    }
}

/// Run `dispatch` on the runtime and post its completion(s) to `store`.
pub(crate) fn launch(store: CommandStore, dispatch: Dispatch) {
    let node = store.node().clone();
    node.metrics().record_remediation(&dispatch.remediation);
    tracing::debug!(
        shard_id = store.shard_id(),
        txn_id = %dispatch.txn_id,
        kind = dispatch.remediation.kind(),
        generation = dispatch.tag.generation,
        "dispatching remediation"
    );

    tokio::spawn(async move {
        let Dispatch {
            txn_id,
            tag,
            remediation,
        } = dispatch;

        match remediation {
            Remediation::Recover {
                home_key,
                route,
                token,
            } => {
                let result = node
                    .bounded("recover", async {
                        node.topology().await_epoch(txn_id.epoch()).await?;
                        node.remote().recover(txn_id, home_key, route, token).await
                    })
                    .await;
                store.complete(txn_id, tag, Completion::Recovered(result));
            }
            Remediation::FetchToApply {
                required,
                route,
                execute_at,
                epoch,
            } => {
                let result = node
                    .bounded("fetch", async {
                        node.topology().await_epoch(epoch).await?;
                        node.remote()
                            .fetch(required, txn_id, Participants::Route(route), Some(execute_at), epoch)
                            .await
                    })
                    .await;
                store.complete(txn_id, tag, Completion::Fetched(result));
            }
            Remediation::FetchKnowledge {
                required,
                participants,
                execute_at,
                epoch,
            } => {
                let result = node
                    .bounded("fetch", async {
                        node.topology().await_epoch(epoch).await?;
                        node.remote()
                            .fetch(required, txn_id, participants, execute_at, epoch)
                            .await
                    })
                    .await;
                store.complete(txn_id, tag, Completion::Fetched(result));
            }
            Remediation::Invalidate { participants } => {
                let result = node
                    .bounded("invalidate", node.remote().invalidate(txn_id, participants))
                    .await;
                store.complete(txn_id, tag, Completion::Invalidated(result));
            }
            Remediation::InformHome { home_key } => {
                let result = node
                    .bounded("inform_home", node.remote().inform_home(txn_id, home_key))
                    .await;
                store.complete(txn_id, tag, Completion::InformedHome(result));
            }
            Remediation::AnnounceDurable { to, message } => {
                announce_durable(&node, &store, txn_id, tag, to, message).await;
                store.complete(txn_id, tag, Completion::AnnouncementRoundFinished);
            }
        }
    });
}

/// Fan the announcement out with bounded concurrency; each ack is posted to
/// the shard as soon as it arrives.
async fn announce_durable(
    node: &Arc<Node>,
    store: &CommandStore,
    txn_id: TxnId,
    tag: Investigation,
    to: BTreeSet<NodeId>,
    message: InformDurable,
) {
    let limit = node.config().fanout_concurrency.max(1);
    let mut targets = to.into_iter();
    let mut inflight = FuturesUnordered::new();

    loop {
        while inflight.len() < limit {
            let Some(target) = targets.next() else {
                break;
            };
            let node = node.clone();
            let req = message.clone();
            inflight.push(async move {
                let result = node
                    .bounded("inform_durable", node.remote().inform_durable(target, req))
                    .await;
                (target, result)
            });
        }

        let Some((target, result)) = inflight.next().await else {
            break;
        };
        match result {
            Ok(()) => store.complete(txn_id, tag, Completion::DurabilityAcknowledged(target)),
            Err(err) => {
                node.metrics().record_remote_failure();
                tracing::debug!(%txn_id, target, error = ?err, "durability announcement failed");
            }
        }
    }
}
