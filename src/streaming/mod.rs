//! Real-time streaming of recorded samples to the acquisition consumer.
//!
//! While a recording runs, a dedicated worker thread pulls packet batches from the
//! device's [`SampleReader`], encodes them (see [`frame`]) and hands them to a
//! [`FrameSink`], pacing frame `k` to leave no earlier than `k * num_samples /
//! sample_rate` after the worker started.
//!
//! When the reader returns fewer packets than requested, the worker repeats the last frame
//! (a zero frame if there is none), pauses, and advances its pacing counter by the pause so
//! that steady-state pacing resumes without a catch-up burst. An empty read ends the
//! stream.
//!
//! ```text
//!   SampleReader ──read_packets(N)──► FrameEncoder ──frame──► FrameSink
//!        │                                                      ▲
//!        └── short read: repeat last frame, pause ──────────────┘
//! ```

pub mod frame;
pub mod sink;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::error::{AppResult, ViperError};
use crate::hardware::SampleReader;

pub use frame::FrameEncoder;
pub use sink::{accept_consumer, FrameSink, MemorySink};

/// Longest single sleep, so a stop request is noticed promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Counters shared with the worker.
#[derive(Debug, Default)]
pub struct StreamStats {
    frames_sent: AtomicU64,
    packets_read: AtomicU64,
    underruns: AtomicU64,
}

/// Point-in-time copy of [`StreamStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStatsSnapshot {
    pub frames_sent: u64,
    pub packets_read: u64,
    pub underruns: u64,
}

impl StreamStats {
    pub fn snapshot(&self) -> StreamStatsSnapshot {
        StreamStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::SeqCst),
            packets_read: self.packets_read.load(Ordering::SeqCst),
            underruns: self.underruns.load(Ordering::SeqCst),
        }
    }
}

/// Handle to a running stream worker.
///
/// Dropping the handle stops the worker and discards the sink.
pub struct StreamHandle {
    running: Arc<AtomicBool>,
    stats: Arc<StreamStats>,
    worker: Option<JoinHandle<Box<dyn FrameSink>>>,
}

impl StreamHandle {
    /// Spawn the worker thread.
    pub fn start(
        reader: Box<dyn SampleReader>,
        sink: Box<dyn FrameSink>,
        config: &StreamConfig,
    ) -> AppResult<Self> {
        let encoder = FrameEncoder::new(config)?;
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(StreamStats::default());

        let worker = {
            let running = Arc::clone(&running);
            let stats = Arc::clone(&stats);
            let config = config.clone();
            thread::Builder::new()
                .name("viperbox-stream".to_string())
                .spawn(move || run_worker(reader, sink, encoder, &config, &running, &stats))?
        };

        info!(
            num_samples = config.num_samples,
            sample_rate = config.sample_rate,
            channels = config.frame_channels(),
            "Started sample streaming"
        );
        Ok(Self {
            running,
            stats,
            worker: Some(worker),
        })
    }

    /// Whether the worker is still producing frames.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> StreamStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal the worker to stop, join it, and take the sink back.
    pub fn stop(mut self) -> Option<Box<dyn FrameSink>> {
        self.running.store(false, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the worker to finish on its own, e.g. when the reader is exhausted.
    pub fn wait(mut self) -> Option<Box<dyn FrameSink>> {
        self.join()
    }

    fn join(&mut self) -> Option<Box<dyn FrameSink>> {
        let handle = self.worker.take()?;
        let sink = match handle.join() {
            Ok(sink) => Some(sink),
            Err(e) => {
                error!("Stream worker panicked: {:?}", e);
                None
            }
        };
        let stats = self.stats.snapshot();
        info!(
            frames = stats.frames_sent,
            packets = stats.packets_read,
            underruns = stats.underruns,
            "Stopped sample streaming"
        );
        sink
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.running.store(false, Ordering::SeqCst);
            let _ = self.join();
        }
    }
}

/// Sleep until `deadline`, returning early if `running` is cleared.
fn sleep_until(deadline: Instant, running: &AtomicBool) {
    loop {
        let now = Instant::now();
        if now >= deadline || !running.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

fn send(sink: &mut dyn FrameSink, frame: &Bytes, stats: &StreamStats) -> AppResult<()> {
    sink.send_frame(frame)?;
    stats.frames_sent.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn run_worker(
    mut reader: Box<dyn SampleReader>,
    mut sink: Box<dyn FrameSink>,
    mut encoder: FrameEncoder,
    config: &StreamConfig,
    running: &AtomicBool,
    stats: &StreamStats,
) -> Box<dyn FrameSink> {
    let started = Instant::now();
    let period = config.frame_period();
    let pause = config.underrun_pause();
    let pause_frames = (pause.as_secs_f64() / period.as_secs_f64()).round() as u32;
    let requested = config.num_samples;

    let mut frame_index: u32 = 0;
    let mut last_frame: Option<Bytes> = None;

    while running.load(Ordering::SeqCst) {
        let packets = match reader.read_packets(requested) {
            Ok(packets) => packets,
            Err(e) => {
                error!(error = %e, "Reading sample packets failed");
                break;
            }
        };
        stats
            .packets_read
            .fetch_add(packets.len() as u64, Ordering::SeqCst);

        if packets.is_empty() {
            info!("Sample stream exhausted");
            break;
        }

        let frame = if packets.len() < requested {
            stats.underruns.fetch_add(1, Ordering::SeqCst);
            let underrun = ViperError::StreamUnderrun {
                requested,
                received: packets.len(),
            };
            warn!("{underrun}, repeating last frame");
            last_frame.clone().unwrap_or_else(|| encoder.zero_frame())
        } else {
            let frame = encoder.encode(&packets);
            last_frame = Some(frame.clone());
            frame
        };

        sleep_until(started + period * frame_index, running);
        if let Err(e) = send(sink.as_mut(), &frame, stats) {
            error!(error = %e, "Acquisition consumer rejected frame, stopping stream");
            break;
        }
        frame_index += 1;

        if packets.len() < requested {
            sleep_until(Instant::now() + pause, running);
            frame_index += pause_frames;
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("Stream worker exiting");
    sink
}

/// Send `config.idle_frames` zero frames at the frame rate.
///
/// Sent when a consumer connects so it sees a valid stream before the first recording.
pub fn send_idle_frames(sink: &mut dyn FrameSink, config: &StreamConfig) -> AppResult<()> {
    let encoder = FrameEncoder::new(config)?;
    let frame = encoder.zero_frame();
    let period = config.frame_period();
    let started = Instant::now();
    let always = AtomicBool::new(true);
    for k in 0..config.idle_frames as u32 {
        sleep_until(started + period * k, &always);
        sink.send_frame(&frame)?;
    }
    debug!(frames = config.idle_frames, "Sent idle frames");
    Ok(())
}
