mod common;

use common::{setup_pool, star, ts, FakeGitHub, RecordingNotifier};
use std::sync::Arc;
use std::time::Duration;
use tg_starbot::db;
use tg_starbot::digest::{DigestOutcome, DigestSchedule, DigestScheduler};
use tg_starbot::model::{Cadence, DeliveryMode};
use tg_starbot::monitor::{Monitor, MonitorSettings};

fn scheduler(
    pool: &sqlx::SqlitePool,
    github: &FakeGitHub,
    notifier: &RecordingNotifier,
) -> DigestScheduler {
    DigestScheduler::new(
        pool.clone(),
        Arc::new(github.clone()),
        Arc::new(notifier.clone()),
        DigestSchedule::new(21, 0, chrono::Weekday::Sun, 3).unwrap(),
        Duration::ZERO,
    )
}

#[tokio::test]
async fn daily_digest_end_to_end() {
    let pool = setup_pool().await;
    let github = FakeGitHub::default();
    let notifier = RecordingNotifier::default();
    db::set_delivery_mode(&pool, DeliveryMode::Daily).await.unwrap();
    db::set_last_check_timestamp(&pool, ts(0)).await.unwrap();
    github
        .set_feed(vec![star("a/repo2", 2), star("a/repo1", 1)])
        .await;

    let monitor = Monitor::new(
        pool.clone(),
        Arc::new(github.clone()),
        Arc::new(notifier.clone()),
        MonitorSettings {
            star_page_size: 50,
            send_delay: Duration::ZERO,
            error_backoff: Duration::from_secs(60),
            default_interval_secs: 300,
        },
    );
    monitor.check_for_new_stars().await.unwrap();
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 2);
    assert!(notifier.repos().await.is_empty());

    let outcome = scheduler(&pool, &github, &notifier).fire(Cadence::Daily).await.unwrap();

    assert_eq!(
        outcome,
        DigestOutcome::Delivered {
            drained: 2,
            sent: 2,
            failed: 0
        }
    );
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 0);
    assert_eq!(
        notifier.repos().await,
        vec!["a/repo1".to_string(), "a/repo2".into()]
    );
}

#[tokio::test]
async fn trigger_for_other_cadence_is_a_no_op() {
    let pool = setup_pool().await;
    let github = FakeGitHub::default();
    let notifier = RecordingNotifier::default();
    db::set_delivery_mode(&pool, DeliveryMode::Weekly).await.unwrap();
    for name in ["a/1", "a/2", "a/3"] {
        db::enqueue_digest(&pool, name).await.unwrap();
    }

    let outcome = scheduler(&pool, &github, &notifier).fire(Cadence::Daily).await.unwrap();

    assert_eq!(
        outcome,
        DigestOutcome::Skipped {
            mode: DeliveryMode::Weekly
        }
    );
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 3);
    assert!(notifier.repos().await.is_empty());
}

#[tokio::test]
async fn instant_mode_ignores_both_triggers() {
    let pool = setup_pool().await;
    let github = FakeGitHub::default();
    let notifier = RecordingNotifier::default();
    db::enqueue_digest(&pool, "a/1").await.unwrap();
    let scheduler = scheduler(&pool, &github, &notifier);

    for cadence in [Cadence::Daily, Cadence::Weekly] {
        let outcome = scheduler.fire(cadence).await.unwrap();
        assert!(matches!(outcome, DigestOutcome::Skipped { .. }));
    }
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 1);
}

#[tokio::test]
async fn failed_items_are_skipped_not_requeued() {
    let pool = setup_pool().await;
    let github = FakeGitHub::default();
    let notifier = RecordingNotifier::default();
    db::set_delivery_mode(&pool, DeliveryMode::Weekly).await.unwrap();
    github.remove_repo("gone/repo").await;
    notifier.fail_for("a/unsendable").await;
    for name in ["gone/repo", "a/unsendable", "a/fine"] {
        db::enqueue_digest(&pool, name).await.unwrap();
    }

    let outcome = scheduler(&pool, &github, &notifier).fire(Cadence::Weekly).await.unwrap();

    assert_eq!(
        outcome,
        DigestOutcome::Delivered {
            drained: 3,
            sent: 1,
            failed: 2
        }
    );
    assert_eq!(notifier.repos().await, vec!["a/fine".to_string()]);
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn flush_now_ignores_mode_and_handles_empty_queue() {
    let pool = setup_pool().await;
    let github = FakeGitHub::default();
    let notifier = RecordingNotifier::default();
    let scheduler = scheduler(&pool, &github, &notifier);

    assert_eq!(
        scheduler.flush_now().await.unwrap(),
        DigestOutcome::Delivered {
            drained: 0,
            sent: 0,
            failed: 0
        }
    );

    db::enqueue_digest(&pool, "a/1").await.unwrap();
    scheduler.flush_now().await.unwrap();
    assert_eq!(notifier.repos().await, vec!["a/1".to_string()]);
}

#[tokio::test]
async fn enqueue_during_drain_window_survives() {
    let pool = setup_pool().await;
    db::enqueue_digest(&pool, "a/1").await.unwrap();
    let first = db::drain_digest_queue(&pool).await.unwrap();
    // Re-queueing a drained name is allowed and lands in the next drain.
    assert!(db::enqueue_digest(&pool, "a/1").await.unwrap());
    let second = db::drain_digest_queue(&pool).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(db::digest_queue_count(&pool).await.unwrap(), 0);
}
