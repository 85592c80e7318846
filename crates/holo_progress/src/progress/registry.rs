//! Process-wide driver that periodically audits every shard's progress log.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::store::{CommandStore, WeakCommandStore};

pub struct ProgressLogRegistry {
    tick_interval: Duration,
    stores: RwLock<Vec<WeakCommandStore>>,
}

impl ProgressLogRegistry {
    pub fn new(tick_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            tick_interval,
            stores: RwLock::new(Vec::new()),
        })
    }

    /// Track `store` until its last handle is dropped.
    pub fn register(&self, store: &CommandStore) {
        match self.stores.write() {
            Ok(mut stores) => stores.push(store.downgrade()),
            Err(poisoned) => poisoned.into_inner().push(store.downgrade()),
        }
    }

    pub fn len(&self) -> usize {
        self.live_stores().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn live_stores(&self) -> Vec<CommandStore> {
        let stores = match self.stores.read() {
            Ok(stores) => stores,
            Err(poisoned) => poisoned.into_inner(),
        };
        let live = stores.iter().filter_map(WeakCommandStore::upgrade).collect();
        live
    }

    /// Enqueue one audit on every live shard and prune dropped ones. Shards
    /// registered while this runs are picked up next period.
    pub fn tick_once(&self) -> usize {
        let live = self.live_stores();
        for store in &live {
            store.tick_all();
        }

        if let Ok(mut stores) = self.stores.write() {
            stores.retain(|store| store.upgrade().is_some());
        }
        live.len()
    }

    /// Spawn the background ticker.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let interval = self.tick_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let shards = registry.tick_once();
                tracing::trace!(shards, "progress log tick");
            }
        })
    }
}
