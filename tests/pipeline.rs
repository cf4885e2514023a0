//! Drives the ingester end to end against the in-memory bus and sink.
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use ugc_etl::error::IngestError;
use ugc_etl::ingester::{IngestStats, Ingester, IngesterConfig, IngesterState, RetryPolicy};
use ugc_etl::schema::EventKind;
use ugc_etl::sink::AnalyticSink;
use ugc_etl::testing::{MemoryBus, MemorySink, ProgressFixture};

const PROGRESS: &str = "movie_progress-events";
const FILTERS: &str = "movie_filters-events";
const DETAILS: &str = "movie_details-events";

fn config(batch_size: usize) -> IngesterConfig {
    IngesterConfig {
        batch_size,
        consume_timeout: Duration::from_millis(10),
        retry: RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        ..IngesterConfig::default()
    }
}

/// Runs until the bus has been drained once, then shuts down.
async fn run(
    bus: &MemoryBus,
    sink: &MemorySink,
    config: IngesterConfig,
) -> (Result<(), IngestError>, IngesterState, IngestStats) {
    let cancel = CancellationToken::new();
    bus.cancel_when_idle(cancel.clone());
    let mut ingester = Ingester::new(bus.clone(), sink.clone(), config);
    let result = ingester.run(cancel).await;
    (result, ingester.state(), ingester.stats())
}

fn filters_json(user: &str) -> String {
    format!(r#"{{"user_id":"{user}","query":"genre=drama","page":1,"size":20,"date_event":"2024-01-01 00:00:00"}}"#)
}

fn details_json(user: &str) -> String {
    format!(
        r#"{{"user_id":"{user}","uuid":"m1","title":"Heat","imdb_rating":8.3,"description":"LA crime saga",
            "genres":[{{"uuid":"g1","name":"Crime"}}],
            "actors":[{{"uuid":"a1","full_name":"Al Pacino"}},{{"uuid":"a2","full_name":"Robert De Niro"}}],
            "writers":[],"directors":[{{"uuid":"d1","full_name":"Michael Mann"}}],
            "date_event":"2024-01-01 00:00:00"}}"#
    )
}

#[tokio::test]
async fn hundred_progress_events_make_one_insert_and_one_commit() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    let payload = r#"{"user_id":"u1","movie_id":"m1","progress":42.5,"status":"in_progress","last_watched":"2024-01-01T00:00:00"}"#;
    for _ in 0..100 {
        bus.publish(PROGRESS, 0, payload);
    }

    let (result, state, stats) = run(&bus, &sink, config(100)).await;

    result.unwrap();
    assert_eq!(state, IngesterState::Stopped);
    assert_eq!(sink.insert_log(), [(EventKind::Progress, 100)]);
    assert_eq!(bus.committed(PROGRESS, 0), Some(100));
    assert_eq!(bus.commit_calls(), 1);
    assert_eq!(stats.rows_written, 100);
    // same key a hundred times collapses into one row
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert!(bus.is_closed());
}

#[tokio::test]
async fn out_of_range_progress_is_skipped_without_blocking_the_poll() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.publish(PROGRESS, 0, ProgressFixture::new("u2", "m1").progress(150.0).json());
    bus.publish(PROGRESS, 0, ProgressFixture::new("u3", "m1").json());

    let (result, _, stats) = run(&bus, &sink, config(2)).await;

    result.unwrap();
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.skipped, 1);
    assert_eq!(sink.insert_log(), [(EventKind::Progress, 2)]);
    let mut users: Vec<String> = sink
        .rows(EventKind::Progress)
        .iter()
        .map(|r| r[0].to_string())
        .collect();
    users.sort();
    assert_eq!(users, ["'u1'", "'u3'"]);
    assert!(sink.rows(EventKind::Progress).iter().all(|r| r[2].to_string() != "150"));
    assert_eq!(bus.committed(PROGRESS, 0), Some(3));
}

#[tokio::test]
async fn unknown_topics_and_tombstones_are_skipped() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish("movie_ratings-events", 0, ProgressFixture::new("u1", "m1").json());
    bus.publish_tombstone(PROGRESS, 1);
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());

    let (result, _, stats) = run(&bus, &sink, config(1)).await;

    result.unwrap();
    assert_eq!(stats.skipped, 2);
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert_eq!(bus.committed("movie_ratings-events", 0), Some(1));
    assert_eq!(bus.committed(PROGRESS, 1), Some(1));
    assert_eq!(bus.committed(PROGRESS, 0), Some(1));
}

#[tokio::test]
async fn latest_last_watched_wins_within_a_partition() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    for second in 0..10 {
        let fixture = ProgressFixture::new("u1", "m1")
            .progress(f64::from(second) * 10.0)
            .at(&format!("2024-01-01T00:00:0{second}"));
        bus.publish(PROGRESS, 0, fixture.json());
    }

    let (result, _, stats) = run(&bus, &sink, config(3)).await;

    result.unwrap();
    assert_eq!(stats.batches_flushed, 4);
    let rows = sink.rows(EventKind::Progress);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0][4].to_string(), "'2024-01-01 00:00:09'");
    assert_eq!(rows[0][2].to_string(), "90");
    assert_eq!(bus.committed(PROGRESS, 0), Some(10));
}

#[tokio::test]
async fn redelivered_events_leave_the_same_rows() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    let payloads = [
        (PROGRESS, ProgressFixture::new("u1", "m1").json()),
        (PROGRESS, ProgressFixture::new("u1", "m2").completed().progress(100.0).json()),
        (FILTERS, filters_json("u1")),
        (DETAILS, details_json("u1")),
    ];
    for (topic, payload) in &payloads {
        bus.publish(topic, 0, payload.as_str());
    }
    run(&bus, &sink, config(4)).await.0.unwrap();
    let snapshot = |sink: &MemorySink| {
        let mut rows: Vec<String> = EventKind::ALL
            .into_iter()
            .flat_map(|k| sink.rows(k))
            .map(|r| format!("{r:?}"))
            .collect();
        rows.sort();
        rows
    };
    let first = snapshot(&sink);

    for (topic, payload) in &payloads {
        bus.publish(topic, 0, payload.as_str());
    }
    run(&bus, &sink, config(4)).await.0.unwrap();

    assert_eq!(snapshot(&sink), first);
    assert_eq!(sink.inserted_rows(EventKind::Progress), 4);
    assert_eq!(sink.count(EventKind::Progress), 2);
}

#[tokio::test]
async fn failed_group_insert_retries_whole_batch_before_committing() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.publish(FILTERS, 0, filters_json("u1"));
    bus.publish(DETAILS, 0, details_json("u1"));
    // progress lands, filters fails, details is never attempted
    sink.fail_insert_number(2);

    let (result, _, stats) = run(&bus, &sink, config(3)).await;

    result.unwrap();
    assert_eq!(sink.insert_attempts(), 5);
    assert_eq!(
        sink.insert_log(),
        [
            (EventKind::Progress, 1),
            (EventKind::Progress, 1),
            (EventKind::Filters, 1),
            (EventKind::Details, 1),
        ]
    );
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert_eq!(sink.count(EventKind::Filters), 1);
    assert_eq!(sink.count(EventKind::Details), 1);
    assert_eq!(bus.commit_calls(), 1);
    for topic in [PROGRESS, FILTERS, DETAILS] {
        assert_eq!(bus.committed(topic, 0), Some(1));
    }
    assert_eq!(stats.batches_flushed, 1);
}

#[tokio::test]
async fn exhausted_flush_is_fatal_and_commits_nothing() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.publish(FILTERS, 0, filters_json("u1"));
    // first group of every attempt succeeds, the second always fails
    for attempt in [2, 4, 6] {
        sink.fail_insert_number(attempt);
    }

    let (result, state, _) = run(&bus, &sink, config(2)).await;

    match result {
        Err(IngestError::FlushRetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected exhausted flush, got {other:?}"),
    }
    assert_eq!(state, IngesterState::Fatal);
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert_eq!(sink.count(EventKind::Filters), 0);
    assert_eq!(bus.committed(PROGRESS, 0), None);
    assert_eq!(bus.committed(FILTERS, 0), None);
    assert_eq!(bus.commit_calls(), 0);
    assert!(bus.is_closed());
}

#[tokio::test]
async fn failed_commit_is_retried() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.fail_next_commits(2);

    let (result, _, stats) = run(&bus, &sink, config(1)).await;

    result.unwrap();
    assert_eq!(bus.commit_calls(), 3);
    assert_eq!(bus.committed(PROGRESS, 0), Some(1));
    assert_eq!(stats.commits, 1);
    assert_eq!(sink.inserts(), 1);
}

#[tokio::test]
async fn exhausted_commit_is_fatal_but_rows_stay_written() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.fail_next_commits(3);

    let (result, state, _) = run(&bus, &sink, config(1)).await;

    assert!(matches!(result, Err(IngestError::CommitRetriesExhausted { attempts: 3, .. })));
    assert_eq!(state, IngesterState::Fatal);
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert_eq!(bus.committed(PROGRESS, 0), None);
}

#[tokio::test]
async fn transient_poll_failures_are_retried() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    bus.fail_next_polls(2);

    let (result, _, _) = run(&bus, &sink, config(1)).await;

    result.unwrap();
    assert_eq!(sink.count(EventKind::Progress), 1);
    assert_eq!(bus.committed(PROGRESS, 0), Some(1));
}

#[tokio::test]
async fn persistent_poll_failures_are_fatal() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.fail_next_polls(3);

    let (result, state, _) = run(&bus, &sink, config(1)).await;

    assert!(matches!(result, Err(IngestError::PollRetriesExhausted { attempts: 3, .. })));
    assert_eq!(state, IngesterState::Fatal);
    assert_eq!(bus.polls(), 3);
}

#[tokio::test]
async fn shutdown_flushes_partial_batch_and_commits() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    for user in ["u1", "u2", "u3", "u4", "u5"] {
        bus.publish(PROGRESS, 2, ProgressFixture::new(user, "m1").json());
    }

    let (result, state, stats) = run(&bus, &sink, config(100)).await;

    result.unwrap();
    assert_eq!(state, IngesterState::Stopped);
    assert_eq!(sink.insert_log(), [(EventKind::Progress, 5)]);
    assert_eq!(bus.committed(PROGRESS, 2), Some(5));
    assert_eq!(stats.commits, 1);
    assert_eq!(bus.pending(), 0);
    assert!(bus.is_closed());
}

#[tokio::test]
async fn partial_batch_is_flushed_once_it_ages() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    for user in ["u1", "u2", "u3"] {
        bus.publish(PROGRESS, 0, ProgressFixture::new(user, "m1").json());
    }
    let config = IngesterConfig {
        max_batch_age: Some(Duration::ZERO),
        ..config(100)
    };

    let (result, state, stats) = run(&bus, &sink, config).await;

    result.unwrap();
    assert_eq!(state, IngesterState::Stopped);
    // flushed and committed while still consuming, not by the shutdown drain
    assert_eq!(bus.commit_calls_when_idle(), Some(1));
    assert_eq!(sink.insert_log(), [(EventKind::Progress, 3)]);
    assert_eq!(bus.committed(PROGRESS, 0), Some(3));
    assert_eq!(stats.batches_flushed, 1);
    assert_eq!(stats.commits, 1);
}

#[tokio::test]
async fn partial_batch_waits_for_shutdown_without_max_age() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    for user in ["u1", "u2", "u3"] {
        bus.publish(PROGRESS, 0, ProgressFixture::new(user, "m1").json());
    }

    let (result, _, stats) = run(&bus, &sink, config(100)).await;

    result.unwrap();
    assert_eq!(bus.commit_calls_when_idle(), Some(0));
    assert_eq!(bus.committed(PROGRESS, 0), Some(3));
    assert_eq!(stats.commits, 1);
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    bus.publish(PROGRESS, 0, ProgressFixture::new("u1", "m1").json());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut ingester = Ingester::new(bus.clone(), sink.clone(), config(1));
    ingester.run(cancel).await.unwrap();

    assert_eq!(bus.polls(), 0);
    assert_eq!(bus.pending(), 1);
    assert_eq!(sink.inserts(), 0);
    assert!(bus.is_closed());
}

#[tokio::test]
async fn poll_respects_max_records() {
    let bus = MemoryBus::new();
    let sink = MemorySink::new();
    for n in 0..5 {
        bus.publish(PROGRESS, 0, ProgressFixture::new(&format!("u{n}"), "m1").json());
    }
    let config = IngesterConfig {
        consume_max_records: 2,
        ..config(100)
    };

    let (result, _, _) = run(&bus, &sink, config).await;

    result.unwrap();
    // 2 + 2 + 1 + the empty poll that triggers shutdown
    assert_eq!(bus.polls(), 4);
    assert_eq!(sink.count(EventKind::Progress), 5);
}

#[tokio::test]
async fn init_creates_tables_and_health_check_reports_reachability() {
    let sink = MemorySink::new();
    assert!(sink.health_check().await);
    sink.init().await.unwrap();
    assert_eq!(sink.tables(), ["movie_details", "movie_filters", "movie_progress"]);

    sink.set_unavailable(true);
    assert!(!sink.health_check().await);
    assert!(sink.init().await.is_err());
}
