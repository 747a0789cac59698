use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use codec_source::{Error, InputSurface, MediaBuffer, MediaFormat, MediaSource, StartParams};
use tokio_util::sync::CancellationToken;

/// Builds frame `index` of a test pattern: the index followed by a
/// repeating byte ramp.
fn pattern_frame(index: u64, frame_size: usize) -> BytesMut {
    let mut data = BytesMut::with_capacity(frame_size.max(8));
    data.put_u64(index);
    let mut value = index as u8;
    while data.len() < frame_size {
        data.put_u8(value);
        value = value.wrapping_add(1);
    }
    data
}

fn frame_time_us(start_time_us: i64, index: u64, frame_rate: u32) -> i64 {
    start_time_us + (index as i64) * 1_000_000 / i64::from(frame_rate.max(1))
}

/// A camera stand-in paced at the format's frame rate.
pub struct TestPatternSource {
    format: MediaFormat,
    frame_size: usize,
    frame_count: Option<u64>,
    state: Mutex<PatternState>,
    cond: Condvar,
    reads: AtomicU64,
}

#[derive(Default)]
struct PatternState {
    started: bool,
    stopped: bool,
    next: u64,
    start_time_us: i64,
}

impl TestPatternSource {
    pub fn new(format: MediaFormat, frame_size: usize, frame_count: Option<u64>) -> Self {
        Self {
            format,
            frame_size,
            frame_count,
            state: Mutex::new(PatternState::default()),
            cond: Condvar::new(),
            reads: AtomicU64::new(0),
        }
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn frame_rate(&self) -> u32 {
        self.format.frame_rate.unwrap_or(30)
    }

    fn interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.frame_rate().max(1)))
    }

    fn lock(&self) -> MutexGuard<'_, PatternState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaSource for TestPatternSource {
    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn start(&self, params: &StartParams) -> codec_source::Result<()> {
        let mut state = self.lock();
        if state.stopped {
            return Err(Error::Source("test pattern already stopped".to_string()));
        }
        state.started = true;
        state.start_time_us = params.start_time_us.unwrap_or(0);
        log::debug!("test pattern started at {}us", state.start_time_us);
        Ok(())
    }

    fn stop(&self) -> codec_source::Result<()> {
        self.lock().stopped = true;
        self.cond.notify_all();
        Ok(())
    }

    fn read(&self) -> codec_source::Result<MediaBuffer> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.lock();
        if !state.started {
            return Err(Error::NotInitialized);
        }
        if self.frame_count.is_some_and(|count| state.next >= count) {
            return Err(Error::EndOfStream);
        }
        // the first frame is available at once, later ones at the frame rate
        let wait = if state.next == 0 {
            Duration::ZERO
        } else {
            self.interval()
        };
        let (mut state, _) = self
            .cond
            .wait_timeout_while(state, wait, |s| !s.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        if state.stopped {
            return Err(Error::EndOfStream);
        }

        let index = state.next;
        state.next += 1;
        let timestamp_us = frame_time_us(state.start_time_us, index, self.frame_rate());
        Ok(MediaBuffer::new(
            pattern_frame(index, self.frame_size).freeze(),
            timestamp_us,
        ))
    }
}

/// Pushes test-pattern frames into `surface` at `interval` until cancelled
/// or `frame_count` frames are out. Returns the number pushed.
pub async fn produce_frames(
    surface: InputSurface,
    frame_size: usize,
    frame_count: Option<u64>,
    interval: Duration,
    cancel: CancellationToken,
) -> u64 {
    let frame_rate = (1_000_000 / interval.as_micros().max(1)) as u32;
    let mut ticker = tokio::time::interval(interval);
    let mut pushed = 0u64;
    loop {
        if frame_count.is_some_and(|count| pushed >= count) {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = ticker.tick() => {
                let frame = MediaBuffer::new(
                    pattern_frame(pushed, frame_size).freeze(),
                    frame_time_us(0, pushed, frame_rate),
                );
                if let Err(e) = surface.push(frame) {
                    log::warn!("surface producer stopping: {}", e);
                    break;
                }
                pushed += 1;
            },
        }
    }
    log::debug!("surface producer pushed {} frames", pushed);
    pushed
}
