//! Stats aggregation against the fake engine.

use agentbox::engine::{CpuStats, CpuUsage, Engine, MemoryStats, StatsSample};
use agentbox::stats::{stats_once, stats_stream, StatsError, StreamOptions};
use agentbox::testing::{ContainerSpec, FakeEngine, Script, SharedBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const WEB_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

/// 1e9 of 1e10 system nanoseconds on four CPUs.
fn busy_sample() -> StatsSample {
    StatsSample {
        cpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: 2_000_000_000,
                percpu_usage: None,
            },
            system_cpu_usage: Some(20_000_000_000),
            online_cpus: Some(4),
        },
        precpu_stats: CpuStats {
            cpu_usage: CpuUsage {
                total_usage: 1_000_000_000,
                percpu_usage: None,
            },
            system_cpu_usage: Some(10_000_000_000),
            online_cpus: Some(4),
        },
        memory_stats: MemoryStats {
            usage: Some(512 * 1024 * 1024),
            limit: Some(2 * 1024 * 1024 * 1024),
        },
        ..StatsSample::default()
    }
}

fn engine_with_web() -> FakeEngine {
    let engine = FakeEngine::new();
    engine.add_container(
        ContainerSpec::new("web")
            .id(WEB_ID)
            .running(true)
            .script(Script::held())
            .stats(busy_sample()),
    );
    engine
}

#[tokio::test]
async fn test_one_shot_table() {
    let engine = engine_with_web();
    let out = SharedBuf::new();

    stats_once(&engine, &["web".to_string()], false, &mut out.clone())
        .await
        .unwrap();

    let text = out.text();
    let mut lines = text.lines();
    assert!(lines.next().unwrap().starts_with("CONTAINER ID   NAME"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("0123456789ab   web"), "row: {row}");
    assert!(row.contains("40.00%"));
    assert!(row.contains("512.00MB / 2.00GB"));
    assert!(row.contains("25.00%"));
    assert!(lines.next().is_none());
}

#[tokio::test]
async fn test_one_shot_reports_failures_after_table() {
    let engine = engine_with_web();
    engine.add_container(
        ContainerSpec::new("broken")
            .running(true)
            .script(Script::held())
            .failing_stats(),
    );
    let out = SharedBuf::new();

    let err = stats_once(
        &engine,
        &["web".to_string(), "broken".to_string()],
        true,
        &mut out.clone(),
    )
    .await
    .unwrap_err();

    match err {
        StatsError::Partial(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].0, "broken");
        }
        other => panic!("unexpected error: {other}"),
    }
    let text = out.text();
    assert!(text.contains(WEB_ID));
    assert!(!text.contains("broken"));
}

#[tokio::test]
async fn test_stream_renders_and_stops_on_cancel() {
    let engine = engine_with_web();
    let shared: Arc<dyn Engine> = Arc::new(engine.clone());
    let cancel = CancellationToken::new();
    let out = SharedBuf::new();
    let options = StreamOptions {
        interval: Duration::from_millis(50),
        ..StreamOptions::default()
    };

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let started = Instant::now();
    stats_stream(shared, &["web".to_string()], options, &mut out.clone(), &cancel)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_millis(300) + Duration::from_millis(500));
    assert_eq!(engine.open_stats_streams(), 0);
    let text = out.text();
    assert!(text.contains("\x1b[2J"));
    assert!(text.contains("0123456789ab   web"));
    assert!(text.contains("40.00%"));
}

#[tokio::test]
async fn test_stream_keeps_running_when_one_producer_fails() {
    let engine = engine_with_web();
    engine.add_container(
        ContainerSpec::new("broken")
            .running(true)
            .script(Script::held())
            .failing_stats(),
    );
    let shared: Arc<dyn Engine> = Arc::new(engine.clone());
    let cancel = CancellationToken::new();
    let out = SharedBuf::new();
    let options = StreamOptions {
        interval: Duration::from_millis(50),
        ..StreamOptions::default()
    };

    let stopper = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        stopper.cancel();
    });

    stats_stream(
        shared,
        &["web".to_string(), "broken".to_string()],
        options,
        &mut out.clone(),
        &cancel,
    )
    .await
    .unwrap();

    let text = out.text();
    assert!(text.contains("web"));
    assert!(!text.contains("broken"));
    assert_eq!(engine.open_stats_streams(), 0);
}

#[tokio::test]
async fn test_stream_unknown_container() {
    let engine = FakeEngine::new();
    let shared: Arc<dyn Engine> = Arc::new(engine);
    let cancel = CancellationToken::new();
    let out = SharedBuf::new();

    let err = stats_stream(
        shared,
        &["ghost".to_string()],
        StreamOptions::default(),
        &mut out.clone(),
        &cancel,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, StatsError::Engine { .. }));
    assert!(out.contents().is_empty());
}
