//! Simulator for exercising the progress log end to end.
//!
//! Spawns a set of in-memory command stores over a simulated cluster whose
//! remote calls are slow and fail at a configurable rate, seeds them with
//! transactions stalled at every phase, then lets the registry run and
//! reports what it did.

use std::collections::BTreeSet;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use holo_progress::progress::{
    Ballot, Command as TxnCommand, CommandStore, Durability, Epoch, InformDurable, Known,
    LoggingAgent, Node, NodeId, Participants, ProgressConfig, ProgressLogRegistry, ProgressStats,
    ProgressToken, Remote, Route, RoutingKey, ShardId, ShardProgressSnapshot, ShardRole, Status,
    Timestamp, Topology, TxnId, Unseekables,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::time;

const LOCAL_NODE: NodeId = 1;
const EPOCH: Epoch = 1;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-progress-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for a simulation run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Number of command stores on the simulated node.
    #[arg(long, default_value_t = 4)]
    shards: usize,

    /// Stalled transactions injected per shard.
    #[arg(long, default_value_t = 25)]
    txns: usize,

    /// Replicas in the simulated cluster, including the local node.
    #[arg(long, default_value_t = 5)]
    nodes: u64,

    /// Audit period. Overrides `HOLO_PROGRESS_TICK_MS`.
    #[arg(long)]
    tick: Option<humantime::Duration>,

    /// Per-remote-call bound. Overrides `HOLO_PROGRESS_REMOTE_TIMEOUT_MS`.
    #[arg(long)]
    remote_timeout: Option<humantime::Duration>,

    /// Simulated one-way latency of every remote call.
    #[arg(long, default_value = "5ms")]
    latency: humantime::Duration,

    /// Total runtime of the simulation.
    #[arg(long, default_value = "5s")]
    duration: humantime::Duration,

    /// Percent of remote calls that fail.
    #[arg(long, default_value_t = 20)]
    failure_pct: u8,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Write the full report (stats and per-shard state) as JSON.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(serde::Serialize, Debug)]
struct SimMeta {
    shards: usize,
    txns: usize,
    nodes: u64,
    tick_ms: u64,
    remote_timeout_ms: u64,
    latency_ms: u64,
    duration_ms: u64,
    failure_pct: u8,
    seed: u64,
}

#[derive(serde::Serialize, Debug)]
struct SimReport {
    meta: SimMeta,
    stats: ProgressStats,
    shards: Vec<ShardProgressSnapshot>,
}

/// Cluster whose remote calls sleep and fail at random.
struct SimCluster {
    nodes: BTreeSet<NodeId>,
    latency: Duration,
    failure_pct: u8,
    rng: Mutex<SmallRng>,
}

impl SimCluster {
    fn new(nodes: u64, latency: Duration, failure_pct: u8, seed: u64) -> Self {
        Self {
            nodes: (1..=nodes.max(1)).collect(),
            latency,
            failure_pct,
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn roll(&self, pct: u8) -> bool {
        if pct == 0 {
            return false;
        }
        let mut rng = match self.rng.lock() {
            Ok(rng) => rng,
            Err(poisoned) => poisoned.into_inner(),
        };
        rng.gen_range(0..100) < pct as u32
    }

    async fn round_trip(&self, what: &str) -> anyhow::Result<()> {
        time::sleep(self.latency * 2).await;
        if self.roll(self.failure_pct) {
            anyhow::bail!("simulated {what} failure");
        }
        Ok(())
    }
}

#[async_trait]
impl Topology for SimCluster {
    fn has_epoch(&self, epoch: Epoch) -> bool {
        epoch <= EPOCH
    }

    fn current_epoch(&self) -> Epoch {
        EPOCH
    }

    fn precise_nodes(&self, _route: &Route, _from: Epoch, _to: Epoch) -> BTreeSet<NodeId> {
        self.nodes.clone()
    }
}

#[async_trait]
impl Remote for SimCluster {
    async fn recover(
        &self,
        _txn_id: TxnId,
        _home_key: RoutingKey,
        _route: Option<Route>,
        seed: ProgressToken,
    ) -> anyhow::Result<ProgressToken> {
        self.round_trip("recover").await?;
        let ballot = Ballot::new(seed.promised.counter + 1, LOCAL_NODE);
        // Half the recoveries find the transaction already applied elsewhere.
        let (durability, status) = if self.roll(50) {
            (Durability::Durable, Status::Applied)
        } else {
            (Durability::NotDurable, Status::Committed)
        };
        Ok(ProgressToken::new(durability, status, ballot, ballot).merge(seed))
    }

    async fn fetch(
        &self,
        required: Known,
        _txn_id: TxnId,
        _participants: Participants,
        _execute_at: Option<Timestamp>,
        _epoch: Epoch,
    ) -> anyhow::Result<Known> {
        self.round_trip("fetch").await?;
        // Occasionally no replica ever saw the definition.
        if self.roll(10) {
            return Ok(Known::NOTHING);
        }
        Ok(required.merge(Known::DEFINITION))
    }

    async fn invalidate(
        &self,
        _txn_id: TxnId,
        _participants: Participants,
    ) -> anyhow::Result<ProgressToken> {
        self.round_trip("invalidate").await?;
        let ballot = Ballot::new(1, LOCAL_NODE);
        Ok(ProgressToken::new(Durability::Durable, Status::Invalidated, ballot, ballot))
    }

    async fn inform_home(&self, _txn_id: TxnId, _home_key: RoutingKey) -> anyhow::Result<()> {
        self.round_trip("inform home").await
    }

    async fn inform_durable(&self, _target: NodeId, _req: InformDurable) -> anyhow::Result<()> {
        self.round_trip("inform durable").await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.shards > 0, "--shards must be > 0");
    anyhow::ensure!(args.nodes > 0, "--nodes must be > 0");
    anyhow::ensure!(args.failure_pct <= 100, "--failure-pct must be <= 100");

    let mut config = ProgressConfig::from_env();
    if let Some(tick) = args.tick {
        config.tick_interval = tick.into();
    }
    if let Some(timeout) = args.remote_timeout {
        config.remote_timeout = timeout.into();
    }

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let latency: Duration = args.latency.into();
    let duration: Duration = args.duration.into();

    let cluster = Arc::new(SimCluster::new(args.nodes, latency, args.failure_pct, seed));
    let node = Node::new(
        LOCAL_NODE,
        cluster.clone(),
        cluster,
        Arc::new(LoggingAgent),
        config,
    );
    let registry = ProgressLogRegistry::new(config.tick_interval);

    let mut stores = Vec::with_capacity(args.shards);
    for shard_id in 0..args.shards as ShardId {
        let store = CommandStore::spawn(shard_id, node.clone());
        registry.register(&store);
        for i in 0..args.txns {
            inject(&store, shard_id, i as u64);
        }
        stores.push(store);
    }
    for store in &stores {
        store.flush().await?;
    }
    tracing::info!(
        shards = args.shards,
        txns = args.shards * args.txns,
        seed,
        "injected stalled transactions"
    );

    let ticker = registry.spawn();
    time::sleep(duration).await;
    ticker.abort();

    let mut shards = Vec::with_capacity(stores.len());
    for store in &stores {
        shards.push(store.run(|safe| safe.progress_log().snapshot()).await?);
    }
    let stats = node.metrics().snapshot();
    tracing::info!(
        escalations = stats.escalations(),
        stale = stats.stale_completions,
        failures = stats.remote_failures,
        "simulation finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats).context("serialize stats")?);

    if let Some(out) = &args.out {
        let report = SimReport {
            meta: SimMeta {
                shards: args.shards,
                txns: args.txns,
                nodes: args.nodes,
                tick_ms: config.tick_interval.as_millis() as u64,
                remote_timeout_ms: config.remote_timeout.as_millis() as u64,
                latency_ms: latency.as_millis() as u64,
                duration_ms: duration.as_millis() as u64,
                failure_pct: args.failure_pct,
                seed,
            },
            stats,
            shards,
        };
        write_report(out, &report).context("write report")?;
        eprintln!("wrote report: {}", out.display());
    }
    Ok(())
}

/// Seed one transaction whose progress stalled at a phase chosen by `i`.
fn inject(store: &CommandStore, shard_id: ShardId, i: u64) {
    let txn_id = TxnId::new(EPOCH, shard_id * 1_000_000 + i + 1, LOCAL_NODE);
    let home_key = RoutingKey::from(format!("home-{shard_id}-{i}").into_bytes());
    let key = RoutingKey::from(format!("key-{shard_id}-{i}").into_bytes());
    let route = Route::full(home_key.clone(), Unseekables::of_keys([key.clone()]));

    let mut command = TxnCommand::not_witnessed(txn_id);
    command.home_key = Some(home_key.clone());
    command.route = Some(route);
    command.promised = Ballot::zero();

    store.execute(move |safe| {
        match i % 5 {
            // Coordinator went quiet after pre-accept.
            0 => {
                command.status = Status::PreAccepted;
                safe.upsert_command(command.clone());
                safe.progress_log_mut().on_pre_accepted(&command, ShardRole::Home)
            }
            // Non-home replica that has not heard from the home shard.
            1 => {
                command.status = Status::PreAccepted;
                safe.upsert_command(command.clone());
                safe.progress_log_mut().on_pre_accepted(&command, ShardRole::NonHome)
            }
            // Durable outcome nobody has been told about.
            2 => {
                command.status = Status::Applied;
                command.durability = Durability::Durable;
                command.execute_at = Some(Timestamp::new(EPOCH, txn_id.hlc + 1, LOCAL_NODE));
                safe.upsert_command(command.clone());
                safe.progress_log_mut().on_executed(&command, ShardRole::Home)?;
                safe.progress_log_mut()
                    .on_durable_globally(
                        &command,
                        Some([LOCAL_NODE].into_iter().collect()),
                        ShardRole::Home,
                    )
            }
            // A local transaction depends on one we know nothing about.
            3 => safe.progress_log_mut().on_waiting_on_dependency(
                txn_id,
                Known::PRE_APPLIED,
                &Unseekables::of_keys([key]),
                ShardRole::NonHome,
            ),
            // Durable but never applied locally.
            _ => {
                command.status = Status::ReadyToExecute;
                command.durability = Durability::Durable;
                command.execute_at = Some(Timestamp::new(EPOCH, txn_id.hlc + 1, LOCAL_NODE));
                safe.upsert_command(command.clone());
                safe.progress_log_mut().on_ready_to_execute(&command, ShardRole::Home)
            }
        }
    });
}

fn write_report(path: &PathBuf, report: &SimReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
