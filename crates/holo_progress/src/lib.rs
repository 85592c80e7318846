//! Transaction progress log.
//!
//! Watches every transaction a shard replica takes part in and makes sure
//! each one eventually finishes: stalled coordinators are recovered, durable
//! outcomes are announced to every replica, missing dependencies are fetched
//! or invalidated, and non-home shards confirm the home shard has taken
//! over. Callers supply a `Topology`, a `Remote` and an `Agent`, spawn one
//! `CommandStore` per shard and register them with a `ProgressLogRegistry`.

pub mod progress;
