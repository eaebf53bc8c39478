//! Repeat budgets, TTLs and trigger results.

use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use cron_scheduler::SchedulerError;
use cron_types::{Job, TriggerResult};
use e2e_tests::{at, TestFleet};

#[tokio::test(start_paused = true)]
async fn test_repeats_stop_after_budget() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet
        .add_job(Job::new("thrice", "@every 1s").with_repeats(3))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    assert_eq!(fleet.recorder.seconds_for("thrice"), vec![1, 2, 3]);
    assert!(!fleet.has_key("/jobs/thrice"));
    assert!(!fleet.has_key("/counters/thrice"));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fleet.recorder.seconds_for("thrice").len(), 3);
    assert!(fleet.engine(0).get_job("thrice").await.is_none());

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_rhythm_embedded_repeats() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet.add_job(Job::new("twice", "R2/PT1S")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(fleet.recorder.seconds_for("twice"), vec![1, 2]);

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_ttl_ends_job() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet
        .add_job(Job::new("short", "*/1 * * * * *").with_ttl(Duration::from_secs(10)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(12)).await;
    let fired = fleet.recorder.seconds_for("short").len();
    assert!((9..=10).contains(&fired), "fired {} times", fired);
    assert!(!fleet.has_key("/jobs/short"));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(fleet.recorder.seconds_for("short").len(), fired);

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_even_seconds_carry_payload() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet
        .add_job(
            Job::new("a", "*/2 * * * * *")
                .with_start_time(at(0))
                .with_payload(Bytes::from_static(b"hello")),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(6_500)).await;

    let fired = fleet.recorder.fired_for("a");
    let seconds: Vec<i64> = fired.iter().map(|f| f.at.timestamp()).collect();
    assert_eq!(seconds, vec![2, 4, 6]);
    assert!(fired.iter().all(|f| f.payload == Bytes::from_static(b"hello")));

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_future_start_delays_first_fire() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet
        .add_job(Job::new("later", "@every 2s").with_start_time(at(5)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(9_500)).await;
    assert_eq!(fleet.recorder.seconds_for("later"), vec![5, 7, 9]);

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_delete_result_removes_job() {
    let fleet = TestFleet::single();
    fleet.recorder.respond("once", TriggerResult::Delete);
    fleet.start().await;
    fleet.add_job(Job::new("once", "@every 1s")).await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fleet.recorder.seconds_for("once"), vec![1]);
    assert!(fleet.scheduled_on(0).await.is_empty());

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failures_are_reported_and_retried_next_occurrence() {
    let fleet = TestFleet::single();
    fleet.recorder.respond("flaky", TriggerResult::Failure);
    fleet.start().await;
    fleet
        .add_job(Job::new("flaky", "@every 1s").with_repeats(2))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    // Failed runs do not use up the budget
    assert_eq!(fleet.recorder.seconds_for("flaky"), vec![1, 2, 3]);
    assert_eq!(fleet.recorder.errors().len(), 3);
    assert!(fleet.recorder.errors()[0].starts_with("flaky: "));

    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deleted_job_stops_firing() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet.add_job(Job::new("a", "@every 1s")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    fleet.delete_job("a").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(fleet.recorder.seconds_for("a"), vec![1, 2]);
    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_deleting_unknown_job_is_noop() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet.delete_job("ghost").await.unwrap();
    fleet.delete_job("ghost").await.unwrap();
    assert!(fleet.scheduled_on(0).await.is_empty());
    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_conflicting_repeats_not_persisted() {
    let fleet = TestFleet::single();
    fleet.start().await;
    let err = fleet
        .add_job(Job::new("a", "R3/PT1S").with_repeats(4))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ConflictingRepeats { .. }));
    assert!(!fleet.has_key("/jobs/a"));
    fleet.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_replacing_job_keeps_single_entry() {
    let fleet = TestFleet::single();
    fleet.start().await;
    fleet.add_job(Job::new("a", "@every 10s")).await.unwrap();
    fleet.add_job(Job::new("a", "@every 3s")).await.unwrap();

    let entries = fleet.engine(0).entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job().rhythm, "@every 3s");
    assert_eq!(entries[0].next(), Some(at(3)));
    fleet.stop().await;
}
