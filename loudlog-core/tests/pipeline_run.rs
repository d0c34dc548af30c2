mod common;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use loudlog_core::engine::pipeline::{self, PipelineContext, PipelineDiagnostics};
use loudlog_core::engine::PipelineConfig;
use loudlog_core::events::{PipelineState, StatusBoard};
use loudlog_core::store::memory::MemoryStore;
use loudlog_core::{AudioBlock, FlushMode, LoudlogError, QueueFullPolicy, Result, Weighting};

use common::{archived_files, block, config, read_wav, ScriptedCapture, BLOCK_LEN};

struct Run {
    result: Result<()>,
    store: MemoryStore,
    diagnostics: Arc<PipelineDiagnostics>,
    states: Vec<PipelineState>,
    closes: usize,
}

fn run_script(config: PipelineConfig, script: Vec<Result<AudioBlock>>) -> Run {
    run_with_store(config, script, MemoryStore::new())
}

fn run_with_store(
    config: PipelineConfig,
    script: Vec<Result<AudioBlock>>,
    store: MemoryStore,
) -> Run {
    let running = Arc::new(AtomicBool::new(true));
    let capture = ScriptedCapture::new(script, config.sample_rate, Arc::clone(&running));
    let closes = Arc::clone(&capture.closes);
    let status = StatusBoard::new(256);
    let mut status_rx = status.subscribe();
    let diagnostics = Arc::new(PipelineDiagnostics::default());

    // Only the concrete parts cross threads; the boxed context is built where it runs.
    let result = {
        let store = store.clone();
        let running = Arc::clone(&running);
        let diagnostics = Arc::clone(&diagnostics);
        thread::spawn(move || {
            pipeline::run(PipelineContext {
                config,
                capture: Box::new(capture),
                store: Box::new(store),
                running,
                status,
                diagnostics,
            })
        })
        .join()
        .expect("pipeline thread panicked")
    };

    let mut states = Vec::new();
    while let Ok(event) = status_rx.try_recv() {
        states.push(event.state);
    }
    assert!(!running.load(Ordering::SeqCst));

    Run {
        result,
        store,
        diagnostics,
        states,
        closes: closes.load(Ordering::SeqCst),
    }
}

#[test]
fn records_every_second_once_and_archives_in_batches() {
    let dir = tempfile::tempdir().unwrap();
    let script = [(1, 100), (2, 100), (3, 101), (4, 102), (5, 103)]
        .into_iter()
        .map(|(value, ts)| Ok(block(value, ts)))
        .collect();

    let run = run_script(config(dir.path(), 2, 3_600), script);
    run.result.unwrap();

    assert_eq!(run.store.timestamps(), vec![100, 101, 102, 103]);
    assert_eq!(run.store.create_calls(), 1);
    assert_eq!(run.store.flushes(), 1);

    let snap = run.diagnostics.snapshot();
    assert_eq!(snap.blocks_in, 5);
    assert_eq!(snap.duplicates_dropped, 1);
    assert_eq!(snap.measurements_recorded, 4);
    assert_eq!(snap.segments_flushed, 3);
    assert_eq!(snap.samples_archived, 5 * BLOCK_LEN);

    // Two full batches plus the partial segment written while draining.
    let files = archived_files(&dir.path().join("audio"));
    assert_eq!(files.len(), 3);
    assert!(files[0].ends_with("1970-01-01/1970-01-01T00:01:40.wav"));
    let first = read_wav(&files[0]);
    assert_eq!(first.len(), 2 * BLOCK_LEN);
    assert_eq!(first[0], 1);
    assert_eq!(first[BLOCK_LEN], 2);
    assert_eq!(read_wav(&files[2]), vec![5; BLOCK_LEN]);

    assert_eq!(run.closes, 1);
    assert_eq!(run.states.first(), Some(&PipelineState::Initializing));
    assert!(run.states.contains(&PipelineState::Rotating));
    assert_eq!(
        &run.states[run.states.len() - 2..],
        &[PipelineState::Draining, PipelineState::Stopped]
    );
}

#[test]
fn duration_boundary_starts_a_new_segment_before_appending() {
    let dir = tempfile::tempdir().unwrap();
    let script = [1_000, 1_005, 1_010, 1_011]
        .into_iter()
        .enumerate()
        .map(|(i, ts)| Ok(block(i as i16, ts)))
        .collect();

    let run = run_script(config(dir.path(), 100, 10), script);
    run.result.unwrap();

    let files = archived_files(&dir.path().join("audio"));
    assert_eq!(files.len(), 2);
    assert!(files[0].ends_with("1970-01-01T00:16:40.wav"));
    assert!(files[1].ends_with("1970-01-01T00:16:50.wav"));

    let first = read_wav(&files[0]);
    let second = read_wav(&files[1]);
    assert_eq!(first.len(), 2 * BLOCK_LEN);
    assert_eq!(second.len(), 2 * BLOCK_LEN);
    assert_eq!(second[0], 2);
}

#[test]
fn store_failures_do_not_stop_capture() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    store.fail_next_updates(2);
    let script = (0..4).map(|i| Ok(block(100, 500 + i))).collect();

    let run = run_with_store(config(dir.path(), 60, 3_600), script, store);
    run.result.unwrap();

    assert_eq!(run.store.timestamps(), vec![502, 503]);
    let snap = run.diagnostics.snapshot();
    assert_eq!(snap.store_errors, 2);
    assert_eq!(snap.measurements_recorded, 2);
    assert_eq!(snap.samples_archived, 4 * BLOCK_LEN);
    assert_eq!(run.states.last(), Some(&PipelineState::Stopped));
}

#[test]
fn device_failure_is_fatal_but_keeps_buffered_audio() {
    let dir = tempfile::tempdir().unwrap();
    let script = vec![
        Ok(block(9, 2_000)),
        Err(LoudlogError::Device("unplugged".into())),
    ];

    let run = run_script(config(dir.path(), 60, 3_600), script);
    assert!(matches!(run.result, Err(LoudlogError::Device(_))));
    assert_eq!(run.closes, 1);
    assert_eq!(run.states.last(), Some(&PipelineState::Failed));

    let files = archived_files(&dir.path().join("audio"));
    assert_eq!(files.len(), 1);
    assert_eq!(read_wav(&files[0]), vec![9; BLOCK_LEN]);
}

#[test]
fn existing_archive_file_stops_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let day = dir.path().join("audio").join("1970-01-01");
    std::fs::create_dir_all(&day).unwrap();
    let taken = day.join("1970-01-01T00:50:00.wav");
    std::fs::write(&taken, b"keep me").unwrap();

    let script = vec![Ok(block(1, 3_000)), Ok(block(2, 3_001))];
    let run = run_script(config(dir.path(), 1, 3_600), script);

    assert!(matches!(
        run.result,
        Err(LoudlogError::ArchiveCollision { .. })
    ));
    assert_eq!(std::fs::read(&taken).unwrap(), b"keep me");
    assert_eq!(run.store.timestamps(), vec![3_000]);
    assert_eq!(run.states.last(), Some(&PipelineState::Failed));
}

#[test]
fn same_second_blocks_never_collide_in_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let script = [(1, 100), (2, 100), (3, 101)]
        .into_iter()
        .map(|(value, ts)| Ok(block(value, ts)))
        .collect();

    let run = run_script(config(dir.path(), 1, 3_600), script);
    run.result.unwrap();

    let files = archived_files(&dir.path().join("audio"));
    assert_eq!(files.len(), 3);
    assert!(files[0].ends_with("1970-01-01T00:01:40.wav"));
    assert!(files[1].ends_with("1970-01-01T00:01:41.wav"));
    assert!(files[2].ends_with("1970-01-01T00:01:42.wav"));
    assert_eq!(read_wav(&files[1]), vec![2; BLOCK_LEN]);
    assert_eq!(read_wav(&files[2]), vec![3; BLOCK_LEN]);
    assert_eq!(run.store.timestamps(), vec![100, 101]);
}

#[test]
fn offloaded_writer_failure_still_writes_everything_queued() {
    let dir = tempfile::tempdir().unwrap();
    let day = dir.path().join("audio").join("1970-01-01");
    std::fs::create_dir_all(&day).unwrap();
    let taken = day.join("1970-01-01T00:01:41.wav");
    std::fs::write(&taken, b"keep me").unwrap();

    let mut cfg = config(dir.path(), 1, 3_600);
    cfg.archive.flush_mode = FlushMode::Offloaded;
    cfg.archive.queue_full = QueueFullPolicy::Fail;
    cfg.archive.queue_capacity = 16;
    let script = (0..6).map(|i| Ok(block(i as i16, 100 + i))).collect();

    let run = run_script(cfg, script);
    assert!(matches!(
        run.result,
        Err(LoudlogError::ArchiveCollision { .. })
    ));
    assert_eq!(std::fs::read(&taken).unwrap(), b"keep me");
    assert_eq!(run.states.last(), Some(&PipelineState::Failed));

    // Every block the loop took in reached disk, apart from the one whose
    // name was taken.
    let snap = run.diagnostics.snapshot();
    assert!(snap.blocks_in >= 2);
    assert_eq!(snap.segments_dropped, 0);
    assert_eq!(snap.segments_flushed, snap.blocks_in - 1);
    assert_eq!(snap.samples_archived, (snap.blocks_in - 1) * BLOCK_LEN);
    assert_eq!(
        archived_files(&dir.path().join("audio")).len(),
        snap.blocks_in
    );
}

#[test]
fn overflow_blocks_are_counted_and_still_processed() {
    let dir = tempfile::tempdir().unwrap();
    let script = vec![
        Ok(block(10, 700)),
        Ok(AudioBlock::new(vec![10; BLOCK_LEN], 701, true)),
    ];

    let run = run_script(config(dir.path(), 60, 3_600), script);
    run.result.unwrap();

    let snap = run.diagnostics.snapshot();
    assert_eq!(snap.overflow_blocks, 1);
    assert_eq!(snap.measurements_recorded, 2);
}

#[test]
fn weighting_changes_metrics_but_not_the_archive() {
    let dir = tempfile::tempdir().unwrap();
    let rate = 48_000;
    // 50 Hz tone, one second, well below the A-curve's 1 kHz reference.
    let tone: Vec<i16> = (0..rate)
        .map(|n| {
            let phase = 2.0 * std::f64::consts::PI * 50.0 * n as f64 / rate as f64;
            (phase.sin() * 16_000.0).round() as i16
        })
        .collect();
    let script = vec![
        Ok(AudioBlock::new(tone.clone(), 10, false)),
        Ok(AudioBlock::new(tone.clone(), 11, false)),
    ];

    let mut flat = config(dir.path().join("flat").as_path(), 60, 3_600);
    flat.sample_rate = rate as u32;
    let mut weighted = config(dir.path().join("weighted").as_path(), 60, 3_600);
    weighted.sample_rate = rate as u32;
    weighted.weighting = Weighting::A;

    let flat_run = run_script(flat, script);
    let weighted_run = run_script(
        weighted,
        vec![
            Ok(AudioBlock::new(tone.clone(), 10, false)),
            Ok(AudioBlock::new(tone.clone(), 11, false)),
        ],
    );
    flat_run.result.unwrap();
    weighted_run.result.unwrap();

    // rms_dbfs of the second (settled) block.
    let flat_rms_dbfs = flat_run.store.rows()[1].1[3];
    let weighted_rms_dbfs = weighted_run.store.rows()[1].1[3];
    assert!(
        weighted_rms_dbfs < flat_rms_dbfs - 20.0,
        "flat {flat_rms_dbfs} dBFS, weighted {weighted_rms_dbfs} dBFS"
    );

    let archived = archived_files(&dir.path().join("weighted").join("audio"));
    assert_eq!(archived.len(), 1);
    let samples = read_wav(&archived[0]);
    assert_eq!(&samples[..tone.len()], tone.as_slice());
}
