//! Scripted sources and an instrumented encoder shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::{
    buffer::{BufferFlags, MediaBuffer},
    encoder::{
        ActivityNotifier, ConfigureFlags, DequeueOutput, Encoder, EncoderParams, InputSurface,
        SlotBuffer,
    },
    error::{Error, Result},
    format::MediaFormat,
    passthrough::{PassthroughEncoder, Settings},
    source::{MediaSource, StartParams},
};

/// Routes pipeline logs to the test harness; `RUST_LOG` picks the level.
pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub(crate) fn video_format() -> MediaFormat {
    MediaFormat::video("video/avc", 320, 240, 30)
}

/// What a [`TestSource`] does once its script is exhausted.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Tail {
    End,
    /// Block in `read()` until `stop()`.
    HoldOpen,
    /// Produce a frame every interval until `stop()`.
    Endless(Duration),
}

pub(crate) struct TestSource {
    format: MediaFormat,
    script: Mutex<VecDeque<Result<MediaBuffer>>>,
    tail: Tail,
    start_error: Option<Error>,
    state: Mutex<SourceState>,
    cond: Condvar,
    reads: AtomicUsize,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

struct SourceState {
    stopped: bool,
    next_ts: i64,
    start_params: Option<StartParams>,
}

impl TestSource {
    pub(crate) fn new(format: MediaFormat, tail: Tail) -> Self {
        Self {
            format,
            script: Mutex::new(VecDeque::new()),
            tail,
            start_error: None,
            state: Mutex::new(SourceState {
                stopped: false,
                next_ts: 0,
                start_params: None,
            }),
            cond: Condvar::new(),
            reads: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Yields one buffer per timestamp, then follows `tail`.
    pub(crate) fn frames(timestamps: &[i64], tail: Tail) -> Self {
        let source = Self::new(video_format(), tail);
        for ts in timestamps {
            source.push(Ok(MediaBuffer::new(ts.to_le_bytes().to_vec(), *ts)));
        }
        source
    }

    pub(crate) fn endless(interval: Duration) -> Self {
        Self::new(video_format(), Tail::Endless(interval))
    }

    pub(crate) fn failing_start(mut self, err: Error) -> Self {
        self.start_error = Some(err);
        self
    }

    pub(crate) fn push(&self, item: Result<MediaBuffer>) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub(crate) fn start_params(&self) -> Option<StartParams> {
        self.lock().start_params
    }

    fn lock(&self) -> MutexGuard<'_, SourceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MediaSource for TestSource {
    fn format(&self) -> MediaFormat {
        self.format.clone()
    }

    fn start(&self, params: &StartParams) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.start_error {
            return Err(err.clone());
        }
        self.lock().start_params = Some(*params);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.lock().stopped = true;
        self.cond.notify_all();
        Ok(())
    }

    fn read(&self) -> Result<MediaBuffer> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.lock().stopped {
            return Err(Error::EndOfStream);
        }
        if let Some(item) = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
        {
            return item;
        }
        match self.tail {
            Tail::End => Err(Error::EndOfStream),
            Tail::HoldOpen => {
                let mut state = self.lock();
                while !state.stopped {
                    state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
                Err(Error::EndOfStream)
            }
            Tail::Endless(interval) => {
                let state = self.lock();
                let (mut state, _) = self
                    .cond
                    .wait_timeout_while(state, interval, |s| !s.stopped)
                    .unwrap_or_else(PoisonError::into_inner);
                if state.stopped {
                    return Err(Error::EndOfStream);
                }
                let ts = state.next_ts;
                state.next_ts += interval.as_micros() as i64;
                Ok(MediaBuffer::new(vec![0u8; 16], ts))
            }
        }
    }
}

/// Counters observed by tests through a [`ProbeEncoder`].
#[derive(Default)]
pub(crate) struct Probe {
    pub releases: AtomicUsize,
    pub configures: AtomicUsize,
    pub output_slot_queries: AtomicUsize,
    pub parameter_changes: Mutex<Vec<EncoderParams>>,
    pub queued_flags: Mutex<Vec<BufferFlags>>,
}

impl Probe {
    pub(crate) fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub(crate) fn configures(&self) -> usize {
        self.configures.load(Ordering::SeqCst)
    }

    pub(crate) fn output_slot_queries(&self) -> usize {
        self.output_slot_queries.load(Ordering::SeqCst)
    }

    pub(crate) fn parameter_changes(&self) -> Vec<EncoderParams> {
        self.parameter_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn queued_flags(&self) -> Vec<BufferFlags> {
        self.queued_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Failures a [`ProbeEncoder`] can inject.
#[derive(Clone, Debug, Default)]
pub(crate) struct Faults {
    pub configure: Option<Error>,
    pub start: Option<Error>,
    /// Fail `dequeue_output_slot` once this many slots have been returned.
    pub dequeue_output_after: Option<usize>,
    /// Swallow end-of-stream input so the encoder never finishes.
    pub never_finish: bool,
    /// Report the output slot table as changed once, before this many
    /// slots have been returned.
    pub slots_changed_at: Option<usize>,
    /// Output format reported once the encoder has announced a change.
    pub changed_format: Option<MediaFormat>,
}

/// Wraps the passthrough encoder, counting calls and injecting faults.
pub(crate) struct ProbeEncoder {
    inner: PassthroughEncoder,
    probe: Arc<Probe>,
    faults: Faults,
    outputs: usize,
    slots_changed_sent: bool,
    format_changed: bool,
}

impl ProbeEncoder {
    pub(crate) fn new(settings: Settings, faults: Faults) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let encoder = Self {
            inner: PassthroughEncoder::new(settings),
            probe: Arc::clone(&probe),
            faults,
            outputs: 0,
            slots_changed_sent: false,
            format_changed: false,
        };
        (encoder, probe)
    }
}

impl Encoder for ProbeEncoder {
    fn configure(&mut self, format: &MediaFormat, flags: ConfigureFlags) -> Result<()> {
        self.probe.configures.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.faults.configure {
            return Err(err.clone());
        }
        self.inner.configure(format, flags)
    }

    fn output_format(&self) -> Result<MediaFormat> {
        match &self.faults.changed_format {
            Some(format) if self.format_changed => Ok(format.clone()),
            _ => self.inner.output_format(),
        }
    }

    fn create_input_surface(&mut self) -> Result<InputSurface> {
        self.inner.create_input_surface()
    }

    fn start(&mut self) -> Result<()> {
        if let Some(err) = &self.faults.start {
            return Err(err.clone());
        }
        self.inner.start()
    }

    fn release(&mut self) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release()
    }

    fn input_slots(&self) -> Result<Vec<SlotBuffer>> {
        self.inner.input_slots()
    }

    fn output_slots(&self) -> Result<Vec<SlotBuffer>> {
        self.probe.output_slot_queries.fetch_add(1, Ordering::SeqCst);
        self.inner.output_slots()
    }

    fn dequeue_input_slot(&mut self) -> Result<Option<usize>> {
        self.inner.dequeue_input_slot()
    }

    fn queue_input_slot(
        &mut self,
        index: usize,
        size: usize,
        timestamp_us: i64,
        flags: BufferFlags,
    ) -> Result<()> {
        self.probe
            .queued_flags
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(flags);
        if self.faults.never_finish && flags.contains(BufferFlags::EOS) {
            return Ok(());
        }
        self.inner
            .queue_input_slot(index, size, timestamp_us, flags)
    }

    fn dequeue_output_slot(&mut self) -> Result<DequeueOutput> {
        if !self.slots_changed_sent && self.faults.slots_changed_at == Some(self.outputs) {
            self.slots_changed_sent = true;
            return Ok(DequeueOutput::SlotsChanged);
        }
        let result = self.inner.dequeue_output_slot()?;
        match result {
            DequeueOutput::Slot(_) => {
                if self
                    .faults
                    .dequeue_output_after
                    .is_some_and(|limit| self.outputs >= limit)
                {
                    return Err(Error::Encoder("injected output failure".into()));
                }
                self.outputs += 1;
            }
            DequeueOutput::FormatChanged => self.format_changed = true,
            _ => {}
        }
        Ok(result)
    }

    fn release_output_slot(&mut self, index: usize) -> Result<()> {
        self.inner.release_output_slot(index)
    }

    fn set_parameters(&mut self, params: &EncoderParams) -> Result<()> {
        // recorded once applied, so tests can wait on it
        self.inner.set_parameters(params)?;
        self.probe
            .parameter_changes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*params);
        Ok(())
    }

    fn request_activity_notification(&mut self, notify: ActivityNotifier) {
        self.inner.request_activity_notification(notify)
    }

    fn signal_end_of_input_stream(&mut self) -> Result<()> {
        if self.faults.never_finish {
            return Ok(());
        }
        self.inner.signal_end_of_input_stream()
    }
}
