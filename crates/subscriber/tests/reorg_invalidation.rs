//! Integration test: reorgs invalidate pending triggers on orphaned blocks; confirmed triggers
//! are never retracted or repeated.

mod common;

use common::{chain, engine, event_job, head, trigger};
use subscriber::{
    AncestryError, ChainChange, EngineError, HeadOutcome, JobId, TriggerStatus,
};
use tokio_test::assert_ok;

#[tokio::test]
async fn test_confirmed_then_reorg_at_101_orphans_later_trigger() {
    let (engine, mut rx) = engine(32);
    let start = head(99, 0, 0);
    assert_ok!(engine.connect(start).await);
    assert_ok!(engine.add_job(event_job("job", 3), Some(&start)).await);
    assert_ok!(engine.report_trigger(trigger("job", head(100, 0, 0), 0)).await);

    for h in chain(100, 101, 0, 0) {
        engine.on_new_longest_chain(h).await;
    }
    assert!(rx.try_recv().is_none(), "no confirmation before depth 3");
    engine.on_new_longest_chain(head(102, 0, 0)).await;
    let confirmed = rx.drain();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].observed_at, head(100, 0, 0));
    engine.on_new_longest_chain(head(103, 0, 0)).await;
    assert!(rx.try_recv().is_none());

    // A new trigger on block 102, which is about to be orphaned.
    let status = assert_ok!(engine.report_trigger(trigger("job", head(102, 0, 0), 1)).await);
    assert!(matches!(status, TriggerStatus::Pending(_)));

    // Competing 103 arrives before its parent: ancestry cannot be resolved yet.
    let outcome = engine.process_head(head(103, 1, 1)).await;
    assert!(matches!(
        outcome,
        HeadOutcome::Indeterminate(AncestryError::MissingParent { height: 103, .. })
    ));
    assert_eq!(engine.canonical_head().await, Some(head(103, 0, 0)));
    assert_eq!(engine.pending_triggers().await.len(), 1);

    // The fork block at 102 arrives: reorg with no net height gain, diverging above 101.
    match engine.process_head(head(102, 1, 0)).await {
        HeadOutcome::Applied {
            change:
                ChainChange::Reorg {
                    common_ancestor,
                    orphaned,
                    tip,
                },
            summary,
        } => {
            assert_eq!(common_ancestor, head(101, 0, 0));
            assert_eq!(orphaned, vec![head(102, 0, 0), head(103, 0, 0)]);
            assert_eq!(tip, head(102, 1, 0));
            assert_eq!(summary.invalidated, 1);
            assert_eq!(summary.confirmed, 0);
        }
        other => panic!("expected reorg, got {:?}", other),
    }
    assert!(engine.pending_triggers().await.is_empty());

    // The stored 103 now connects.
    assert!(matches!(
        engine.process_head(head(103, 1, 1)).await,
        HeadOutcome::Applied {
            change: ChainChange::Extended { .. },
            ..
        }
    ));
    assert!(matches!(
        engine.report_trigger(trigger("job", head(102, 0, 0), 2)).await,
        Err(EngineError::OrphanedBlock(_))
    ));
    for h in chain(104, 110, 1, 1) {
        engine.on_new_longest_chain(h).await;
    }
    assert!(rx.try_recv().is_none(), "no additional confirmation after the reorg");

    let stats = engine.stats().await;
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.invalidated, 1);
    assert_eq!(stats.reorgs, 1);
    assert_eq!(stats.heads_indeterminate, 1);
}

#[tokio::test]
async fn test_orphaned_trigger_is_not_reconfirmed_on_new_chain() {
    let (engine, mut rx) = engine(32);
    assert_ok!(engine.connect(head(99, 0, 0)).await);
    assert_ok!(engine.add_job(event_job("job", 3), None).await);
    assert_ok!(engine.report_trigger(trigger("job", head(101, 0, 0), 0)).await);
    for h in chain(100, 102, 0, 0) {
        engine.on_new_longest_chain(h).await;
    }

    // Fork off 100: 101' replaces 101.
    engine.on_new_longest_chain(head(101, 1, 0)).await;
    assert!(engine.pending_triggers().await.is_empty());

    // Upstream re-detects the event in the new block; that is a different trigger.
    assert_ok!(engine.report_trigger(trigger("job", head(101, 1, 0), 0)).await);
    for h in chain(102, 110, 1, 1) {
        engine.on_new_longest_chain(h).await;
    }
    let got = rx.drain();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].observed_at, head(101, 1, 0));
    assert_eq!(got[0].confirmed_at, head(103, 1, 1));
    common::assert_unique(&got);
}

#[tokio::test]
async fn test_reorg_below_confirmed_trigger_does_not_retract() {
    let (engine, mut rx) = engine(32);
    assert_ok!(engine.connect(head(99, 0, 0)).await);
    assert_ok!(engine.add_job(event_job("job", 1), None).await);
    engine.on_new_longest_chain(head(100, 0, 0)).await;
    let status = assert_ok!(engine.report_trigger(trigger("job", head(100, 0, 0), 0)).await);
    assert!(matches!(status, TriggerStatus::Confirmed(_)));

    for h in chain(100, 105, 1, 0) {
        engine.on_new_longest_chain(h).await;
    }
    assert_eq!(rx.drain().len(), 1);
    assert!(matches!(
        engine.report_trigger(trigger("job", head(100, 0, 0), 0)).await,
        Err(EngineError::OrphanedBlock(_))
    ));
    let stats = engine.stats().await;
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.reorgs, 1);
}

#[tokio::test]
async fn test_trigger_on_orphaned_descendant_is_rejected() {
    let (engine, _rx) = engine(32);
    assert_ok!(engine.connect(head(99, 0, 0)).await);
    assert_ok!(engine.add_job(event_job("job", 2), None).await);
    for h in chain(100, 103, 0, 0) {
        engine.on_new_longest_chain(h).await;
    }
    // Reorg down to 101'; old 103 sits above the new tip but descends from orphaned 102.
    engine.on_new_longest_chain(head(101, 1, 0)).await;
    assert_eq!(engine.canonical_head().await, Some(head(101, 1, 0)));
    assert!(matches!(
        engine.report_trigger(trigger("job", head(103, 0, 0), 0)).await,
        Err(EngineError::OrphanedBlock(_))
    ));
}

#[tokio::test]
async fn test_reconnect_catches_up_through_known_ancestry() {
    let (engine, mut rx) = engine(32);
    assert_ok!(engine.connect(head(99, 0, 0)).await);
    assert_ok!(engine.add_job(event_job("a", 2), None).await);
    assert_ok!(engine.add_job(event_job("b", 2), None).await);
    assert_ok!(engine.report_trigger(trigger("a", head(100, 0, 0), 0)).await);

    engine.disconnect().await;
    assert!(matches!(
        engine.process_head(head(100, 0, 0)).await,
        HeadOutcome::Ignored(_)
    ));
    assert_ok!(engine.report_trigger(trigger("b", head(101, 0, 0), 0)).await);
    assert!(rx.try_recv().is_none());

    // 102 links to 101 and 100, both recorded by the trigger reports.
    assert_ok!(engine.connect(head(102, 0, 0)).await);
    let got = rx.drain();
    let jobs: Vec<_> = got.iter().map(|c| c.job_id.clone()).collect();
    assert_eq!(jobs, vec![JobId::from("a"), JobId::from("b")]);

    // A pending trigger, then a reconnect far ahead with no known ancestry.
    assert_ok!(engine.report_trigger(trigger("a", head(103, 0, 0), 0)).await);
    engine.disconnect().await;
    assert_ok!(engine.connect(head(200, 0, 0)).await);
    assert_eq!(engine.canonical_head().await, Some(head(200, 0, 0)));
    assert!(rx.try_recv().is_none(), "reseeded chain must not confirm on a guess");
    assert!(engine.pending_triggers().await.is_empty());
    assert_eq!(engine.stats().await.expired, 1);
}

#[tokio::test]
async fn test_lower_fork_never_pulls_tip_below_confirmed_height() {
    let (engine, mut rx) = engine(32);
    assert_ok!(engine.connect(head(99, 0, 0)).await);
    assert_ok!(engine.add_job(event_job("job", 1), None).await);
    for h in chain(100, 103, 0, 0) {
        engine.on_new_longest_chain(h).await;
    }
    let status = assert_ok!(engine.report_trigger(trigger("job", head(103, 0, 0), 0)).await);
    assert!(matches!(status, TriggerStatus::Confirmed(_)));
    assert_eq!(rx.drain().len(), 1);

    let job2 = event_job("slow", 3);
    assert_ok!(engine.add_job(job2, None).await);
    assert_ok!(engine.report_trigger(trigger("slow", head(102, 0, 0), 0)).await);

    // A competing 101 and 102 arrive: held, tip stays at the confirmed height.
    assert_eq!(engine.process_head(head(101, 1, 0)).await, HeadOutcome::Deferred);
    assert_eq!(engine.process_head(head(102, 1, 1)).await, HeadOutcome::Deferred);
    assert_eq!(engine.canonical_head().await, Some(head(103, 0, 0)));
    assert_eq!(engine.pending_triggers().await.len(), 1);

    // The fork reaches 103 and takes over; the pending trigger on old 102 is invalidated.
    match engine.process_head(head(103, 1, 1)).await {
        HeadOutcome::Applied {
            change: ChainChange::Reorg { common_ancestor, .. },
            summary,
        } => {
            assert_eq!(common_ancestor, head(100, 0, 0));
            assert_eq!(summary.invalidated, 1);
        }
        other => panic!("expected reorg, got {:?}", other),
    }
    assert_eq!(engine.canonical_head().await, Some(head(103, 1, 1)));
    assert!(rx.try_recv().is_none(), "the earlier confirmation is not repeated");

    let stats = engine.stats().await;
    assert_eq!(stats.confirmed, 1);
    assert_eq!(stats.heads_deferred, 2);
}
