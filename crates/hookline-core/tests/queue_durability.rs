//! End-to-end durability tests for the event queue: concurrent producers,
//! overflow merge, consumer restarts, and rotation.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hookline_core::QueueError;
use hookline_core::error::QueueErrorClass;
use hookline_core::event::{Event, EventKind};
use hookline_core::event_log::{AppendRoute, EventLog, EventLogConfig, LogOffset};
use hookline_core::file_lock::LockFile;
use hookline_core::heartbeat::{HealthStatus, HeartbeatConfig, check_liveness};
use hookline_core::overflow::OverflowConfig;
use hookline_core::persist::epoch_ms_now;
use hookline_core::queue_consumer::{
    ConsumerConfig, HandlerError, QueueCheckpoint, QueueConsumer,
};
use serde_json::json;
use tempfile::tempdir;

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> EventLogConfig {
    EventLogConfig {
        fsync_on_append: false,
        ..EventLogConfig::default()
    }
}

fn open_log(dir: &Path, config: EventLogConfig) -> Arc<EventLog> {
    Arc::new(EventLog::open(dir.join("queue"), config, OverflowConfig::default()).unwrap())
}

fn event(n: u64) -> Event {
    Event::new("post_tool_hook", EventKind::PostTool, json!({ "n": n })).with_tool_name("Bash")
}

fn consumer(log: &Arc<EventLog>, batch_size: usize) -> QueueConsumer {
    QueueConsumer::open(
        Arc::clone(log),
        ConsumerConfig {
            batch_size,
            ..ConsumerConfig::default()
        },
        &HeartbeatConfig::default(),
    )
    .unwrap()
}

/// Run cycles until nothing is delivered and no overflow is pending.
fn drain(consumer: &mut QueueConsumer) -> Vec<Event> {
    let mut seen = Vec::new();
    for _ in 0..1_000 {
        let mut handler = |batch: &[Event]| -> Result<(), HandlerError> {
            seen.extend_from_slice(batch);
            Ok(())
        };
        let report = consumer.run_cycle(&mut handler).unwrap();
        let pending = consumer.log().overflow().pending_count().unwrap();
        if report.delivered == 0 && pending == 0 {
            break;
        }
    }
    seen
}

fn payload_ns(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .map(|e| e.payload["n"].as_u64().unwrap())
        .collect()
}

fn active_segment_path(log: &EventLog) -> std::path::PathBuf {
    log.dir()
        .join("segments")
        .join(format!("{:016}.jsonl", log.active_segment_id().unwrap()))
}

// =============================================================================
// No loss under contention
// =============================================================================

#[test]
fn concurrent_producers_lose_no_acknowledged_event() {
    let dir = tempdir().unwrap();
    let queue_dir = dir.path().join("queue");
    const PRODUCERS: u64 = 8;
    const PER_PRODUCER: u64 = 50;

    // Hold the writer lock for the whole produce phase so every append
    // contends on the overflow path.
    let log = Arc::new(
        EventLog::open(&queue_dir, fast_config(), OverflowConfig::default()).unwrap(),
    );
    let held = LockFile::try_acquire(log.lock_path()).unwrap().unwrap();

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|p| {
            let queue_dir = queue_dir.clone();
            std::thread::spawn(move || {
                // One handle per producer, as separate hook processes would.
                let log = EventLog::open(
                    &queue_dir,
                    EventLogConfig {
                        lock_timeout_ms: 1,
                        lock_poll_ms: 1,
                        fsync_on_append: false,
                        ..EventLogConfig::default()
                    },
                    OverflowConfig {
                        lock_timeout_ms: 30_000,
                        lock_poll_ms: 1,
                        ..OverflowConfig::default()
                    },
                )
                .unwrap();
                (0..PER_PRODUCER)
                    .map(|i| {
                        let ev = event(p * 1_000 + i);
                        let ack = log.append(&ev).unwrap();
                        assert_eq!(ack.route, AppendRoute::Overflow);
                        ev.event_id
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut acked = HashSet::new();
    for handle in handles {
        acked.extend(handle.join().unwrap());
    }
    let total = (PRODUCERS * PER_PRODUCER) as usize;
    assert_eq!(acked.len(), total);
    assert_eq!(log.overflow().pending_count().unwrap(), total as u64);

    drop(held);
    let mut consumer = consumer(&log, 64);
    let delivered = drain(&mut consumer);
    assert_eq!(delivered.len(), total);

    let unique: HashSet<_> = delivered.iter().map(|e| e.event_id.clone()).collect();
    assert_eq!(unique.len(), total, "an event was delivered twice");
    assert_eq!(unique, acked);

    for p in 0..PRODUCERS {
        let mut seq: Vec<u64> = payload_ns(&delivered)
            .into_iter()
            .filter(|n| n / 1_000 == p)
            .map(|n| n % 1_000)
            .collect();
        seq.sort_unstable();
        assert_eq!(seq, (0..PER_PRODUCER).collect::<Vec<_>>(), "producer {p} has gaps");
    }
    assert_eq!(log.overflow().pending_count().unwrap(), 0);
}

#[test]
fn held_primary_lock_routes_to_overflow_and_merges_once() {
    let dir = tempdir().unwrap();
    let log = open_log(
        dir.path(),
        EventLogConfig {
            lock_timeout_ms: 5,
            lock_poll_ms: 1,
            fsync_on_append: false,
            ..EventLogConfig::default()
        },
    );

    let guard = LockFile::try_acquire(log.lock_path()).unwrap().unwrap();
    let started = std::time::Instant::now();
    for n in 0..6 {
        let ack = log.append(&event(n)).unwrap();
        assert_eq!(ack.route, AppendRoute::Overflow);
        assert!(ack.offset.is_none());
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(guard);

    let health = log.write_health();
    assert_eq!(health.primary_timeouts, 6);
    assert_eq!(health.overflow_routed, 6);
    assert_eq!(health.saturations, 0);
    assert_eq!(log.overflow().pending_count().unwrap(), 6);

    // A second handle (another process) merging again must not duplicate.
    let other = EventLog::open(log.dir(), fast_config(), OverflowConfig::default()).unwrap();
    assert_eq!(log.merge_pending().unwrap().events_merged, 6);
    assert_eq!(other.merge_pending().unwrap().events_merged, 0);

    let batch = log.read_from(&LogOffset::default(), 100).unwrap();
    assert_eq!(batch.records.len(), 6);
    let ids: HashSet<_> = batch.records.iter().map(|(_, e)| e.event_id.clone()).collect();
    assert_eq!(ids.len(), 6);
    assert!(batch.records.iter().all(|(_, e)| e.origin.is_some()));
}

#[test]
fn both_paths_held_reports_saturation() {
    let dir = tempdir().unwrap();
    let log = Arc::new(
        EventLog::open(
            dir.path().join("queue"),
            EventLogConfig {
                lock_timeout_ms: 2,
                lock_poll_ms: 1,
                saturation_alert_threshold: 2,
                ..fast_config()
            },
            OverflowConfig {
                lock_timeout_ms: 2,
                lock_poll_ms: 1,
                ..OverflowConfig::default()
            },
        )
        .unwrap(),
    );
    let _primary = LockFile::try_acquire(log.lock_path()).unwrap().unwrap();
    let _overflow = LockFile::try_acquire(log.overflow().lock_path())
        .unwrap()
        .unwrap();

    for _ in 0..2 {
        let err = log.append(&event(1)).unwrap_err();
        assert!(matches!(err, QueueError::Saturated { .. }));
        assert_eq!(err.class(), QueueErrorClass::Overload);
    }
    let health = log.write_health();
    assert_eq!(health.saturations, 2);
    assert!(health.alerting);
    assert!(health.last_error.is_some());
}

// =============================================================================
// Crash-safe resumption
// =============================================================================

#[test]
fn consumer_resumes_from_checkpoint_after_restart() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), fast_config());
    for n in 0..10 {
        log.append(&event(n)).unwrap();
    }

    let mut first = consumer(&log, 4);
    let mut seen = Vec::new();
    let report = first
        .run_cycle(&mut |batch: &[Event]| -> Result<(), HandlerError> {
            seen.extend_from_slice(batch);
            Ok(())
        })
        .unwrap();
    assert_eq!(report.delivered, 4);
    let committed = first.checkpoint_state().offset.clone();

    // A failing handler leaves the checkpoint where it was.
    let err = first
        .run_cycle(&mut |_: &[Event]| -> Result<(), HandlerError> {
            Err(HandlerError::new("downstream unavailable"))
        })
        .unwrap_err();
    assert!(matches!(err, QueueError::Handler { .. }));
    assert_eq!(first.checkpoint_state().offset, committed);
    assert_eq!(first.stats().handler_failures, 1);

    // The checkpoint on disk matches what the consumer reports.
    let raw = std::fs::read(log.dir().join("checkpoint.json")).unwrap();
    let on_disk: QueueCheckpoint = serde_json::from_slice(&raw).unwrap();
    assert_eq!(on_disk.offset, committed);
    assert_eq!(on_disk.events_consumed, 4);

    // Crash: consumer gone, a producer died mid-write.
    drop(first);
    let mut file = OpenOptions::new()
        .append(true)
        .open(active_segment_path(&log))
        .unwrap();
    file.write_all(br#"{"schema":"hookline.event.v1","event_id":"#).unwrap();
    drop(file);

    let mut second = consumer(&log, 4);
    assert_eq!(second.checkpoint_state().offset, committed);
    let rest = drain(&mut second);
    assert_eq!(payload_ns(&rest), (4..10).collect::<Vec<_>>());

    // The next append repairs the torn tail; nothing is quarantined.
    log.append(&event(10)).unwrap();
    log.append(&event(11)).unwrap();
    let tail = drain(&mut second);
    assert_eq!(payload_ns(&tail), vec![10, 11]);
    assert_eq!(second.stats().quarantined_total, 0);
}

#[test]
fn second_consumer_is_refused_while_first_runs() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), fast_config());
    let first = consumer(&log, 8);

    let err = QueueConsumer::open(
        Arc::clone(&log),
        ConsumerConfig::default(),
        &HeartbeatConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(err, QueueError::ConsumerBusy { .. }));

    drop(first);
    assert!(
        QueueConsumer::open(log, ConsumerConfig::default(), &HeartbeatConfig::default()).is_ok()
    );
}

#[test]
fn malformed_lines_are_quarantined_not_fatal() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), fast_config());
    log.append(&event(0)).unwrap();
    let mut file = OpenOptions::new()
        .append(true)
        .open(active_segment_path(&log))
        .unwrap();
    file.write_all(b"not json at all\n").unwrap();
    drop(file);
    log.append(&event(1)).unwrap();

    let mut consumer = consumer(&log, 16);
    let seen = drain(&mut consumer);
    assert_eq!(payload_ns(&seen), vec![0, 1]);
    assert_eq!(consumer.stats().quarantined_total, 1);
    let quarantine = std::fs::read_to_string(log.quarantine_path()).unwrap();
    assert!(quarantine.contains("not json at all"));
}

// =============================================================================
// Rotation safety
// =============================================================================

#[test]
fn rotation_never_drops_unconsumed_events() {
    let dir = tempdir().unwrap();
    let log = open_log(
        dir.path(),
        EventLogConfig {
            segment_max_bytes: 600,
            max_total_bytes: 1_200,
            ..fast_config()
        },
    );
    for n in 0..30 {
        let ev = Event::new(
            "post_tool_hook",
            EventKind::PostTool,
            json!({ "n": n, "pad": "x".repeat(60) }),
        );
        log.append(&ev).unwrap();
    }
    let health = log.write_health();
    assert!(health.size_cap_diversions > 0);

    let mut consumer = consumer(&log, 3);
    let mut delivered = Vec::new();
    let mut removed = 0;
    for _ in 0..200 {
        let report = consumer
            .run_cycle(&mut |batch: &[Event]| -> Result<(), HandlerError> {
                delivered.extend_from_slice(batch);
                Ok(())
            })
            .unwrap();
        if let Some(rotation) = &report.rotation {
            // Every removed segment lies entirely behind the checkpoint.
            for id in &rotation.removed_segments {
                assert!(*id <= report.checkpoint.segment_id);
            }
            removed += rotation.removed_segments.len();
        }
        if report.delivered == 0 && log.overflow().pending_count().unwrap() == 0 {
            break;
        }
    }

    assert!(removed > 0);
    let mut ns = payload_ns(&delivered);
    ns.sort_unstable();
    assert_eq!(ns, (0..30).collect::<Vec<_>>());
}

// =============================================================================
// Async loop
// =============================================================================

#[tokio::test]
async fn run_loop_delivers_and_stops_on_shutdown() {
    let dir = tempdir().unwrap();
    let log = open_log(dir.path(), fast_config());
    for n in 0..20 {
        log.append(&event(n)).unwrap();
    }

    let consumer = QueueConsumer::open(
        Arc::clone(&log),
        ConsumerConfig {
            poll_interval_ms: 10,
            ..ConsumerConfig::default()
        },
        &HeartbeatConfig::default(),
    )
    .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |batch: &[Event]| -> Result<(), HandlerError> {
        sink.lock().unwrap().extend(batch.iter().map(|e| e.event_id.clone()));
        Ok(())
    };

    let (tx, rx) = tokio::sync::watch::channel(false);
    let stopper = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
    };
    let (stats, ()) = tokio::join!(consumer.run(handler, rx), stopper);

    assert_eq!(stats.events_delivered, 20);
    assert!(stats.cycles >= 1);
    assert_eq!(stats.cycle_errors, 0);
    assert_eq!(seen.lock().unwrap().len(), 20);

    let liveness = check_liveness(
        &log.dir().join("consumer.heartbeat.json"),
        &HeartbeatConfig::default(),
        epoch_ms_now(),
    );
    assert_eq!(liveness.status, HealthStatus::Healthy);
    let heartbeat = liveness.heartbeat.unwrap();
    assert_eq!(heartbeat.checkpoint, log.read_from(&LogOffset::default(), 100).unwrap().next_offset);
}
