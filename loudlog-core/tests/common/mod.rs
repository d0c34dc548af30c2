#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use loudlog_core::{
    engine::PipelineConfig, ArchiveConfig, AudioBlock, CaptureSource, LoudlogError, Result,
    StoreLayout,
};

pub const RATE: u32 = 8_000;
pub const BLOCK_LEN: usize = 80;

/// Plays back a fixed list of capture results, then asks the loop to stop.
pub struct ScriptedCapture {
    script: VecDeque<Result<AudioBlock>>,
    sample_rate: u32,
    running: Arc<AtomicBool>,
    pub closes: Arc<AtomicUsize>,
}

impl ScriptedCapture {
    pub fn new(
        script: Vec<Result<AudioBlock>>,
        sample_rate: u32,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            script: script.into(),
            sample_rate,
            running,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl CaptureSource for ScriptedCapture {
    fn next_block(&mut self) -> Result<AudioBlock> {
        let next = self
            .script
            .pop_front()
            .unwrap_or_else(|| Err(LoudlogError::Device("script exhausted".into())));
        if self.script.is_empty() {
            self.running.store(false, Ordering::SeqCst);
        }
        next
    }

    fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Endless capture with increasing timestamps, paced like a slow device.
pub struct TickingCapture {
    next_timestamp: i64,
    pace: Duration,
}

impl TickingCapture {
    pub fn new(first_timestamp: i64, pace: Duration) -> Self {
        Self {
            next_timestamp: first_timestamp,
            pace,
        }
    }
}

impl CaptureSource for TickingCapture {
    fn next_block(&mut self) -> Result<AudioBlock> {
        thread::sleep(self.pace);
        let ts = self.next_timestamp;
        self.next_timestamp += 1;
        Ok(AudioBlock::new(vec![1_000; BLOCK_LEN], ts, false))
    }

    fn close(&mut self) {}

    fn sample_rate(&self) -> u32 {
        RATE
    }
}

pub fn block(value: i16, timestamp: i64) -> AudioBlock {
    AudioBlock::new(vec![value; BLOCK_LEN], timestamp, false)
}

pub fn config(archive_dir: &Path, batch_blocks: usize, rotation_secs: i64) -> PipelineConfig {
    PipelineConfig {
        sample_rate: RATE,
        block_secs: BLOCK_LEN as f64 / RATE as f64,
        store: StoreLayout::new(archive_dir.join("mixer.rrd")),
        archive: ArchiveConfig {
            dir: archive_dir.join("audio"),
            batch_blocks,
            rotation_secs,
            ..ArchiveConfig::default()
        },
        slow_block_fraction: 0.0,
        ..PipelineConfig::default()
    }
}

pub fn read_wav(path: &Path) -> Vec<i16> {
    hound::WavReader::open(path)
        .expect("open archived wav")
        .samples::<i16>()
        .map(|s| s.expect("read sample"))
        .collect()
}

/// Every archived file under `dir`, sorted by path (and therefore by start time).
pub fn archived_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    let Ok(days) = std::fs::read_dir(dir) else {
        return files;
    };
    for day in days {
        let day = day.expect("read day dir").path();
        for entry in std::fs::read_dir(&day).expect("list day dir") {
            files.push(entry.expect("read entry").path());
        }
    }
    files.sort();
    files
}
