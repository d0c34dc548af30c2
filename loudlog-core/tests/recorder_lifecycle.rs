mod common;

use std::time::{Duration, Instant};

use loudlog_core::engine::PipelineConfig;
use loudlog_core::events::PipelineState;
use loudlog_core::store::memory::MemoryStore;
use loudlog_core::{LoudlogError, Recorder};

use common::{archived_files, config, TickingCapture};

async fn wait_for_blocks(recorder: &Recorder, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while recorder.diagnostics_snapshot().blocks_in < count {
        assert!(Instant::now() < deadline, "pipeline produced no blocks");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_stop_wait_runs_to_a_clean_stop() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let recorder = Recorder::new(config(dir.path(), 600, 3_600));
    let mut status_rx = recorder.subscribe_status();

    recorder
        .start_with(
            |_: &PipelineConfig| Ok(TickingCapture::new(50_000, Duration::from_millis(2))),
            store.clone(),
        )
        .unwrap();
    assert!(recorder.is_running());
    assert!(matches!(
        recorder.start_with(
            |_: &PipelineConfig| Ok(TickingCapture::new(0, Duration::ZERO)),
            MemoryStore::new(),
        ),
        Err(LoudlogError::AlreadyRunning)
    ));

    wait_for_blocks(&recorder, 3).await;
    recorder.stop().unwrap();
    recorder.wait().await.unwrap();

    assert!(!recorder.is_running());
    assert_eq!(recorder.status(), PipelineState::Stopped);

    let snap = recorder.diagnostics_snapshot();
    assert!(snap.blocks_in >= 3);
    assert_eq!(snap.measurements_recorded, snap.blocks_in);
    assert_eq!(store.timestamps().first(), Some(&50_000));
    assert_eq!(archived_files(&dir.path().join("audio")).len(), 1);

    let mut states = Vec::new();
    while let Ok(event) = status_rx.try_recv() {
        states.push(event.state);
    }
    assert_eq!(states.first(), Some(&PipelineState::Initializing));
    assert!(states.contains(&PipelineState::Capturing));
    assert_eq!(states.last(), Some(&PipelineState::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn device_open_failure_is_reported_by_start() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::new(config(dir.path(), 600, 3_600));

    let err = recorder
        .start_with(
            |_: &PipelineConfig| -> loudlog_core::Result<TickingCapture> {
                Err(LoudlogError::NoDefaultInputDevice)
            },
            MemoryStore::new(),
        )
        .unwrap_err();

    assert!(matches!(err, LoudlogError::NoDefaultInputDevice));
    assert!(!recorder.is_running());
    assert_eq!(recorder.status(), PipelineState::Failed);
    assert!(matches!(recorder.wait().await, Err(LoudlogError::NotRunning)));
    assert!(matches!(recorder.stop(), Err(LoudlogError::NotRunning)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recorder_can_restart_after_stopping() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let recorder = Recorder::new(config(dir.path(), 600, 3_600));

    for first in [10_000, 20_000] {
        recorder
            .start_with(
                move |_: &PipelineConfig| Ok(TickingCapture::new(first, Duration::from_millis(2))),
                store.clone(),
            )
            .unwrap();
        wait_for_blocks(&recorder, 1).await;
        recorder.stop().unwrap();
        recorder.wait().await.unwrap();
    }

    let timestamps = store.timestamps();
    assert!(timestamps.contains(&10_000));
    assert!(timestamps.contains(&20_000));
    assert_eq!(store.create_calls(), 2);
}
