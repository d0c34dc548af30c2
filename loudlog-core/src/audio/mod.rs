//! Audio capture via cpal backend.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not**:
//! - Allocate heap memory (beyond growing its scratch buffer once)
//! - Block on a mutex or condvar
//! - Perform I/O
//!
//! The callback converts samples to `i16` and writes them into a bounded SPSC
//! ring buffer. When the ring is full the newest samples are dropped and the
//! overrun flag is raised; the next delivered block carries `overflow = true`.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on macOS).
//! `CpalCapture` therefore must be created and dropped on the same thread.
//! The recorder accomplishes this by opening it inside `spawn_blocking`.

pub mod device;
pub mod weighting;

#[cfg(feature = "audio-cpal")]
use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig,
};

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{
    buffering::{block::AudioBlock, Consumer, SampleConsumer},
    error::{LoudlogError, Result},
};
#[cfg(feature = "audio-cpal")]
use crate::buffering::create_sample_ring;
use device::DeviceSelector;

/// Sleep between ring polls while a block is still filling.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A source of fixed-size audio blocks, delivered in arrival order.
pub trait CaptureSource {
    /// Block until a full block is available.
    ///
    /// # Errors
    /// `LoudlogError::Device` when the stream is closed or the driver failed.
    fn next_block(&mut self) -> Result<AudioBlock>;

    /// Release the device. Later `next_block` calls fail.
    fn close(&mut self);

    fn sample_rate(&self) -> u32;
}

/// Parameters for opening a capture stream.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: DeviceSelector,
    pub sample_rate: u32,
    /// Samples per delivered block.
    pub block_len: usize,
    /// Ring buffer capacity in blocks.
    pub ring_blocks: usize,
    /// A block that receives no samples for this long fails with a device error.
    pub stall_timeout: Duration,
}

/// Flags shared between the device callbacks and the reading side.
#[derive(Debug, Default)]
pub struct CaptureFlags {
    /// Set to `false` to make the data callback a no-op.
    pub running: AtomicBool,
    /// Samples were dropped since the last delivered block.
    pub overrun: AtomicBool,
    /// First unrecoverable driver error, if any.
    fault: Mutex<Option<String>>,
}

impl CaptureFlags {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            running: AtomicBool::new(true),
            ..Self::default()
        })
    }

    pub fn record_fault(&self, message: String) {
        let mut fault = self.fault.lock();
        if fault.is_none() {
            *fault = Some(message);
        }
    }

    pub fn fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }
}

/// Assembles fixed-size blocks from a ring buffer consumer.
///
/// Separated from the cpal stream so block framing, overflow tagging and
/// stall detection work the same for any producer.
pub struct BlockReader {
    consumer: SampleConsumer,
    flags: Arc<CaptureFlags>,
    block_len: usize,
    stall_timeout: Duration,
    scratch: Vec<i16>,
    closed: bool,
}

impl BlockReader {
    pub fn new(
        consumer: SampleConsumer,
        flags: Arc<CaptureFlags>,
        block_len: usize,
        stall_timeout: Duration,
    ) -> Self {
        Self {
            consumer,
            flags,
            block_len,
            stall_timeout,
            scratch: vec![0; block_len],
            closed: false,
        }
    }

    pub fn read_block(&mut self) -> Result<AudioBlock> {
        if self.closed {
            return Err(LoudlogError::Device("capture stream closed".into()));
        }

        let mut filled = 0;
        let mut last_progress = Instant::now();
        while filled < self.block_len {
            if let Some(fault) = self.flags.fault() {
                return Err(LoudlogError::Device(fault));
            }
            let n = self.consumer.pop_slice(&mut self.scratch[filled..]);
            if n == 0 {
                if last_progress.elapsed() >= self.stall_timeout {
                    return Err(LoudlogError::Device(format!(
                        "device stalled: no samples for {:?}",
                        self.stall_timeout
                    )));
                }
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }
            filled += n;
            last_progress = Instant::now();
        }

        let overflow = self.flags.overrun.swap(false, Ordering::AcqRel);
        let timestamp = chrono::Utc::now().timestamp();
        Ok(AudioBlock::new(self.scratch.clone(), timestamp, overflow))
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.flags.running.store(false, Ordering::Release);
    }
}

/// Handle to an active cpal capture stream.
///
/// **Not `Send`**: `cpal::Stream` is bound to its creation thread on Windows/macOS.
/// Create and drop this type on the same OS thread.
pub struct CpalCapture {
    /// Kept alive so the stream is not dropped prematurely; `None` once closed.
    #[cfg(feature = "audio-cpal")]
    stream: Option<Stream>,
    reader: BlockReader,
    /// Capture sample rate (Hz).
    pub sample_rate: u32,
}

impl CpalCapture {
    /// Open the configured input device as a mono 16-bit stream.
    ///
    /// Must be called from the thread that will also drop this value.
    ///
    /// # Errors
    /// `LoudlogError::NoDefaultInputDevice` when no input device is available,
    /// or `LoudlogError::Device` if the device cannot provide mono audio at the
    /// requested rate or cpal fails to build the stream.
    #[cfg(feature = "audio-cpal")]
    pub fn open(config: &CaptureConfig) -> Result<Self> {
        use tracing::{info, warn};

        let host = cpal::default_host();
        let device = device::resolve_input_device(&host, &config.device)?;
        let device_name = device.name().unwrap_or_default();
        info!(device = device_name.as_str(), "opening input device");

        let sample_rate = config.sample_rate;
        let sample_format = device
            .supported_input_configs()
            .map_err(|e| LoudlogError::Device(e.to_string()))?
            .filter(|c| {
                c.channels() == 1
                    && c.min_sample_rate().0 <= sample_rate
                    && sample_rate <= c.max_sample_rate().0
            })
            .filter_map(|c| format_rank(c.sample_format()).map(|rank| (rank, c.sample_format())))
            .min_by_key(|(rank, _)| *rank)
            .map(|(_, format)| format)
            .ok_or_else(|| {
                LoudlogError::Device(format!(
                    "device '{device_name}' has no mono input config at {sample_rate} Hz"
                ))
            })?;

        info!(sample_rate, ?sample_format, "audio config selected");

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (mut producer, consumer) = create_sample_ring(config.block_len, config.ring_blocks);
        let flags = CaptureFlags::new();

        let data_flags = Arc::clone(&flags);
        let err_flags = Arc::clone(&flags);
        let on_error = move |err: cpal::StreamError| match err {
            cpal::StreamError::DeviceNotAvailable => {
                err_flags.record_fault("input device no longer available".into());
            }
            cpal::StreamError::BackendSpecific { err } => {
                // Backends report xruns here; the stream keeps running.
                warn!("audio backend error: {err}");
                err_flags.overrun.store(true, Ordering::Release);
            }
        };

        let stream = match sample_format {
            SampleFormat::I16 => device.build_input_stream(
                &stream_config,
                move |data: &[i16], _info| {
                    if !data_flags.running.load(Ordering::Relaxed) {
                        return;
                    }
                    push_or_flag(&mut producer, data, &data_flags);
                },
                on_error,
                None,
            ),

            SampleFormat::F32 => {
                let mut convert_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info| {
                        if !data_flags.running.load(Ordering::Relaxed) {
                            return;
                        }
                        convert_buf.resize(data.len(), 0);
                        for (out, sample) in convert_buf.iter_mut().zip(data) {
                            *out = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                        }
                        push_or_flag(&mut producer, &convert_buf, &data_flags);
                    },
                    on_error,
                    None,
                )
            }

            SampleFormat::U8 => {
                let mut convert_buf: Vec<i16> = Vec::new();
                device.build_input_stream(
                    &stream_config,
                    move |data: &[u8], _info| {
                        if !data_flags.running.load(Ordering::Relaxed) {
                            return;
                        }
                        convert_buf.resize(data.len(), 0);
                        for (out, sample) in convert_buf.iter_mut().zip(data) {
                            *out = (i16::from(*sample) - 128) << 8;
                        }
                        push_or_flag(&mut producer, &convert_buf, &data_flags);
                    },
                    on_error,
                    None,
                )
            }

            fmt => {
                return Err(LoudlogError::Device(format!(
                    "unsupported sample format: {fmt:?}"
                )))
            }
        }
        .map_err(|e| LoudlogError::Device(e.to_string()))?;

        stream
            .play()
            .map_err(|e| LoudlogError::Device(e.to_string()))?;

        Ok(Self {
            stream: Some(stream),
            reader: BlockReader::new(consumer, flags, config.block_len, config.stall_timeout),
            sample_rate,
        })
    }
}

/// Preference order for device sample formats; `None` for unsupported ones.
#[cfg(feature = "audio-cpal")]
fn format_rank(format: SampleFormat) -> Option<u8> {
    match format {
        SampleFormat::I16 => Some(0),
        SampleFormat::F32 => Some(1),
        SampleFormat::U8 => Some(2),
        _ => None,
    }
}

/// Push samples into the ring; raise the overrun flag if any were dropped.
#[cfg(any(feature = "audio-cpal", test))]
fn push_or_flag(
    producer: &mut crate::buffering::SampleProducer,
    samples: &[i16],
    flags: &CaptureFlags,
) {
    use crate::buffering::Producer;

    let written = producer.push_slice(samples);
    if written < samples.len() {
        flags.overrun.store(true, Ordering::Release);
    }
}

impl CaptureSource for CpalCapture {
    fn next_block(&mut self) -> Result<AudioBlock> {
        self.reader.read_block()
    }

    fn close(&mut self) {
        self.reader.close();
        #[cfg(feature = "audio-cpal")]
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                tracing::debug!("pausing input stream on close: {e}");
            }
            // Stream drops here, releasing the audio device on this thread.
        }
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl CpalCapture {
    pub fn open(_config: &CaptureConfig) -> Result<Self> {
        Err(LoudlogError::Device(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
