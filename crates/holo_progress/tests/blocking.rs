//! Replicas blocked on a dependency fetch it, or have it invalidated.

mod common;

use common::{txn, Call, Harness, RecordingRemote};
use holo_progress::progress::{
    Durability, Known, Participants, Progress, RoutingKey, ShardRole, Status, TxnId, Unseekables,
};

async fn blocking_progress(h: &Harness, id: TxnId) -> Option<Progress> {
    h.read(move |safe| {
        safe.progress_log()
            .get(&id)
            .and_then(|s| s.blocking_tracker())
            .map(|b| b.progress())
    })
    .await
}

#[tokio::test]
async fn unknowable_dependency_is_invalidated() {
    let h = Harness::new(&[1, 2, 3]);
    RecordingRemote::set(&h.remote.fetch_reply, Some(Known::NOTHING));
    RecordingRemote::set(
        &h.remote.invalidate_reply,
        Some(common::token(Durability::Durable, Status::Invalidated, 2)),
    );

    let id = txn(1);
    h.record(move |safe| {
        safe.progress_log_mut().on_waiting_on_dependency(
            id,
            Known::COMMITTED,
            &Unseekables::of_keys(["a", "b"]),
            ShardRole::NonHome,
        )
    })
    .await;

    h.tick().await;
    assert_eq!(blocking_progress(&h, id).await, Some(Progress::NoProgress));
    h.tick().await;

    h.wait_until("invalidation", move |safe| {
        safe.progress_log()
            .get(&id)
            .and_then(|s| s.blocking_tracker())
            .is_some_and(|b| b.progress() == Progress::Done)
    })
    .await;

    let calls = h.remote.calls();
    assert!(matches!(
        &calls[0],
        Call::Fetch { required, epoch: 1, .. } if *required == Known::COMMITTED
    ));
    match &calls[1] {
        Call::Invalidate { txn_id, participants } => {
            assert_eq!(*txn_id, id);
            let Participants::Unseekables(keys) = participants else {
                panic!("expected bare keys, got {participants:?}");
            };
            assert!(keys.contains_key(&RoutingKey::from("a")));
            assert!(keys.contains_key(&RoutingKey::from("b")));
        }
        other => panic!("unexpected call {other:?}"),
    }

    // Done: no further remediation.
    h.tick().await;
    h.tick().await;
    assert_eq!(h.remote.calls().len(), 2);
    let stats = h.node.metrics().snapshot();
    assert_eq!((stats.fetches, stats.invalidations), (1, 1));
}

#[tokio::test]
async fn fetched_knowledge_unblocks() {
    let h = Harness::new(&[1]);
    RecordingRemote::set(&h.remote.fetch_reply, Some(Known::PRE_APPLIED));
    let id = txn(2);
    h.record(move |safe| {
        safe.progress_log_mut().on_durable_elsewhere(
            id,
            &Unseekables::of_keys(["a"]),
            ShardRole::NonHome,
        )
    })
    .await;

    h.tick().await;
    h.tick().await;
    h.wait_until("fetch completion", move |safe| {
        safe.progress_log()
            .get(&id)
            .and_then(|s| s.blocking_tracker())
            .is_some_and(|b| b.progress() == Progress::NoneExpected)
    })
    .await;
    assert_eq!(h.remote.count(|c| matches!(c, Call::Invalidate { .. })), 0);
    assert_eq!(
        h.remote.count(|c| matches!(c, Call::Fetch { required, .. } if *required == Known::PRE_APPLIED)),
        1
    );
}

#[tokio::test]
async fn local_commit_clears_blocking_before_any_fetch() {
    let h = Harness::new(&[1]);
    let id = txn(3);
    let command = common::committed(id);
    h.record(move |safe| {
        safe.progress_log_mut().on_waiting_on_dependency(
            id,
            Known::COMMITTED,
            &Unseekables::of_keys(["a"]),
            ShardRole::NonHome,
        )?;
        safe.upsert_command(command.clone());
        safe.progress_log_mut().on_committed(&command, ShardRole::NonHome)
    })
    .await;
    assert_eq!(blocking_progress(&h, id).await, Some(Progress::NoneExpected));

    h.tick().await;
    h.tick().await;
    assert!(h.remote.calls().is_empty());
}

#[tokio::test]
async fn failed_fetch_retries() {
    let h = Harness::new(&[1]);
    let id = txn(4);
    h.record(move |safe| {
        safe.progress_log_mut().on_waiting_on_dependency(
            id,
            Known::PRE_APPLIED,
            &Unseekables::of_keys(["a"]),
            ShardRole::NonHome,
        )
    })
    .await;

    h.tick().await;
    h.tick().await;
    h.wait_until("failed fetch", move |safe| {
        safe.progress_log()
            .get(&id)
            .and_then(|s| s.blocking_tracker())
            .is_some_and(|b| b.progress() == Progress::Expected)
    })
    .await;
    assert_eq!(h.node.metrics().snapshot().remote_failures, 1);

    h.tick().await;
    h.tick().await;
    h.wait_for_calls("fetch retry", 2, |c| matches!(c, Call::Fetch { .. }))
        .await;
}
