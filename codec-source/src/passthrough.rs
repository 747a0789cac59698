use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::{
    buffer::{BufferFlags, MediaBuffer},
    encoder::{
        Activity, ActivityNotifier, ConfigureFlags, DequeueOutput, Encoder, EncoderParams,
        InputSurface, OutputSlotInfo, SlotBuffer, SurfaceSink,
    },
    error::{Error, Result},
    format::MediaFormat,
};

/// Log "dropped" at most every N drops; debug level so info logs stay clean.
const DROP_LOG_INTERVAL: u64 = 120;

#[derive(Debug, Clone)]
pub struct Settings {
    pub input_slots: usize,
    pub output_slots: usize,
    // bytes per slot
    pub slot_capacity: usize,
    pub keyframe_interval: u64,
    // frames held back before output starts (buffering encoder)
    pub lookahead: usize,
    pub emit_codec_config: bool,
    pub announce_format_change: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            slot_capacity: 1 << 20,
            keyframe_interval: 25,
            lookahead: 0,
            emit_codec_config: false,
            announce_format_change: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Uninitialized,
    Configured,
    Started,
    Released,
}

struct Pending {
    data: Bytes,
    timestamp_us: i64,
    eos: bool,
}

struct Core {
    settings: Settings,
    state: State,
    format: Option<MediaFormat>,
    surface: bool,
    input_slots: Vec<SlotBuffer>,
    output_slots: Vec<SlotBuffer>,
    free_inputs: VecDeque<usize>,
    inputs_dequeued: Vec<bool>,
    free_outputs: VecDeque<usize>,
    outputs_dequeued: Vec<bool>,
    completed: VecDeque<OutputSlotInfo>,
    pending: VecDeque<Pending>,
    frames_encoded: u64,
    frames_dropped: u64,
    last_timestamp_us: i64,
    config_emitted: bool,
    format_change_pending: bool,
    input_eos: bool,
    output_eos: bool,
    drop_input_frames: bool,
    skip_before_us: Option<i64>,
    notifier: Option<ActivityNotifier>,
}

impl Core {
    fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: State::Uninitialized,
            format: None,
            surface: false,
            input_slots: Vec::new(),
            output_slots: Vec::new(),
            free_inputs: VecDeque::new(),
            inputs_dequeued: Vec::new(),
            free_outputs: VecDeque::new(),
            outputs_dequeued: Vec::new(),
            completed: VecDeque::new(),
            pending: VecDeque::new(),
            frames_encoded: 0,
            frames_dropped: 0,
            last_timestamp_us: 0,
            config_emitted: false,
            format_change_pending: false,
            input_eos: false,
            output_eos: false,
            drop_input_frames: false,
            skip_before_us: None,
            notifier: None,
        }
    }

    fn ensure_started(&self) -> Result<()> {
        match self.state {
            State::Started => Ok(()),
            State::Released => Err(Error::NotInitialized),
            state => Err(Error::Encoder(format!("not started ({:?})", state))),
        }
    }

    fn codec_config_data(&self) -> Bytes {
        let mime = self.format.as_ref().map(|f| f.mime.as_str()).unwrap_or("");
        Bytes::from(format!("csd:{}", mime))
    }

    /// Moves pending frames into free output slots.
    fn pump(&mut self) {
        loop {
            if self.state != State::Started || self.output_eos {
                return;
            }
            // suspended surface holds its frames, unless end of input must flush
            if self.surface && self.drop_input_frames && !self.input_eos {
                return;
            }
            let Some(&index) = self.free_outputs.front() else {
                return;
            };

            if self.settings.emit_codec_config && !self.config_emitted {
                let csd = self.codec_config_data();
                let size = match self.output_slots[index].fill(&csd) {
                    Ok(size) => size,
                    Err(e) => {
                        log::error!("passthrough: codec config does not fit: {}", e);
                        0
                    }
                };
                self.free_outputs.pop_front();
                self.completed.push_back(OutputSlotInfo {
                    index,
                    offset: 0,
                    size,
                    timestamp_us: 0,
                    flags: BufferFlags::CODEC_CONFIG,
                });
                self.config_emitted = true;
                continue;
            }

            let ready = match self.pending.front() {
                None => false,
                Some(frame) if frame.eos => true,
                Some(_) => self.input_eos || self.pending.len() > self.settings.lookahead,
            };
            if !ready {
                return;
            }
            let Some(frame) = self.pending.pop_front() else {
                return;
            };
            self.free_outputs.pop_front();

            if frame.eos {
                self.completed.push_back(OutputSlotInfo {
                    index,
                    offset: 0,
                    size: 0,
                    timestamp_us: frame.timestamp_us,
                    flags: BufferFlags::EOS,
                });
                self.output_eos = true;
                return;
            }

            let size = match self.output_slots[index].fill(&frame.data) {
                Ok(size) => size,
                Err(e) => {
                    log::error!("passthrough: dropping frame at {}us: {}", frame.timestamp_us, e);
                    self.free_outputs.push_front(index);
                    continue;
                }
            };
            let mut flags = BufferFlags::empty();
            if self.frames_encoded % self.settings.keyframe_interval.max(1) == 0 {
                flags.insert(BufferFlags::SYNC_FRAME);
            }
            self.completed.push_back(OutputSlotInfo {
                index,
                offset: 0,
                size,
                timestamp_us: frame.timestamp_us,
                flags,
            });
            self.frames_encoded += 1;
        }
    }

    fn queue_pending(&mut self, data: Bytes, timestamp_us: i64, eos: bool) {
        self.last_timestamp_us = self.last_timestamp_us.max(timestamp_us);
        self.pending.push_back(Pending {
            data,
            timestamp_us,
            eos,
        });
    }

    fn drop_frame(&mut self, timestamp_us: i64, reason: &str) {
        self.frames_dropped += 1;
        if self.frames_dropped % DROP_LOG_INTERVAL == 1 {
            log::debug!(
                "passthrough: dropped frame at {}us ({}), {} dropped so far",
                timestamp_us,
                reason,
                self.frames_dropped
            );
        }
    }

    fn take_notification(&mut self) -> Option<(ActivityNotifier, Activity)> {
        if self.state != State::Started || self.notifier.is_none() {
            return None;
        }
        let activity = Activity {
            input_slots: if self.surface {
                0
            } else {
                self.free_inputs.len()
            },
            output_slots: self.completed.len() + usize::from(self.format_change_pending),
        };
        if activity.input_slots == 0 && activity.output_slots == 0 {
            return None;
        }
        self.notifier.take().map(|notifier| (notifier, activity))
    }
}

fn lock(core: &Mutex<Core>) -> MutexGuard<'_, Core> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` under the core lock, then fires any activity notification that
/// became due once the lock is released.
fn with_core<R>(core: &Mutex<Core>, f: impl FnOnce(&mut Core) -> R) -> R {
    let (result, due) = {
        let mut core = lock(core);
        let result = f(&mut core);
        (result, core.take_notification())
    };
    if let Some((notifier, activity)) = due {
        notifier.notify(activity);
    }
    result
}

/// Encoder that copies each input payload into an output slot unchanged.
///
/// It follows the slot protocol of a hardware codec (dequeue/queue/release,
/// activity callbacks, format-changed before the first output, an
/// end-of-stream output after the last frame) so the pipeline can run
/// without a codec library.
pub struct PassthroughEncoder {
    core: Arc<Mutex<Core>>,
}

impl PassthroughEncoder {
    pub fn new(settings: Settings) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core::new(settings))),
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        lock(&self.core).frames_encoded
    }

    pub fn frames_dropped(&self) -> u64 {
        lock(&self.core).frames_dropped
    }
}

impl Default for PassthroughEncoder {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl Encoder for PassthroughEncoder {
    fn configure(&mut self, format: &MediaFormat, flags: ConfigureFlags) -> Result<()> {
        let mut core = lock(&self.core);
        if core.state != State::Uninitialized {
            return Err(Error::Encoder("already configured".to_string()));
        }
        if !flags.contains(ConfigureFlags::ENCODE) {
            return Err(Error::Unsupported("passthrough only encodes".to_string()));
        }
        if format.mime.is_empty() {
            return Err(Error::Unsupported("format has no mime type".to_string()));
        }
        core.drop_input_frames = format.create_input_buffers_suspended;
        core.format = Some(format.clone());
        core.state = State::Configured;
        log::debug!("passthrough configured: {}", format.mime);
        Ok(())
    }

    fn output_format(&self) -> Result<MediaFormat> {
        lock(&self.core).format.clone().ok_or(Error::NotInitialized)
    }

    fn create_input_surface(&mut self) -> Result<InputSurface> {
        let mut core = lock(&self.core);
        if core.state != State::Configured {
            return Err(Error::Encoder(
                "input surface must be created between configure and start".to_string(),
            ));
        }
        core.surface = true;
        Ok(InputSurface::new(Arc::new(SurfaceHandle {
            core: Arc::clone(&self.core),
        })))
    }

    fn start(&mut self) -> Result<()> {
        with_core(&self.core, |core| {
            if core.state != State::Configured {
                return Err(Error::Encoder(format!("cannot start from {:?}", core.state)));
            }
            let capacity = core.settings.slot_capacity;
            if !core.surface {
                let count = core.settings.input_slots;
                core.input_slots = (0..count).map(|_| SlotBuffer::new(capacity)).collect();
                core.free_inputs = (0..count).collect();
                core.inputs_dequeued = vec![false; count];
            }
            let count = core.settings.output_slots;
            core.output_slots = (0..count).map(|_| SlotBuffer::new(capacity)).collect();
            core.free_outputs = (0..count).collect();
            core.outputs_dequeued = vec![false; count];
            core.format_change_pending = core.settings.announce_format_change;
            core.state = State::Started;
            core.pump();
            Ok(())
        })
    }

    fn release(&mut self) {
        let mut core = lock(&self.core);
        if core.state == State::Released {
            return;
        }
        for slot in &core.input_slots {
            slot.detach();
        }
        core.input_slots.clear();
        core.output_slots.clear();
        core.free_inputs.clear();
        core.free_outputs.clear();
        core.completed.clear();
        core.pending.clear();
        core.notifier = None;
        core.state = State::Released;
        log::debug!(
            "passthrough released after {} frames ({} dropped)",
            core.frames_encoded,
            core.frames_dropped
        );
    }

    fn input_slots(&self) -> Result<Vec<SlotBuffer>> {
        let core = lock(&self.core);
        core.ensure_started()?;
        Ok(core.input_slots.clone())
    }

    fn output_slots(&self) -> Result<Vec<SlotBuffer>> {
        let core = lock(&self.core);
        core.ensure_started()?;
        Ok(core.output_slots.clone())
    }

    fn dequeue_input_slot(&mut self) -> Result<Option<usize>> {
        let mut core = lock(&self.core);
        core.ensure_started()?;
        if core.surface {
            return Err(Error::Unsupported(
                "no input slots in surface mode".to_string(),
            ));
        }
        let index = core.free_inputs.pop_front();
        if let Some(index) = index {
            core.inputs_dequeued[index] = true;
        }
        Ok(index)
    }

    fn queue_input_slot(
        &mut self,
        index: usize,
        size: usize,
        timestamp_us: i64,
        flags: BufferFlags,
    ) -> Result<()> {
        with_core(&self.core, |core| {
            core.ensure_started()?;
            if !core.inputs_dequeued.get(index).copied().unwrap_or(false) {
                return Err(Error::InvalidSlot(index));
            }
            if core.input_eos {
                return Err(Error::Encoder(
                    "input queued after end of stream".to_string(),
                ));
            }
            let slot = core.input_slots[index].clone();
            let data = if size > 0 {
                slot.read(0, size)?
            } else {
                Bytes::new()
            };
            // done with the caller's memory
            drop(slot.detach());
            core.inputs_dequeued[index] = false;
            core.free_inputs.push_back(index);

            if size > 0 || !flags.contains(BufferFlags::EOS) {
                core.queue_pending(data, timestamp_us, false);
            }
            if flags.contains(BufferFlags::EOS) {
                core.input_eos = true;
                let last = core.last_timestamp_us;
                core.queue_pending(Bytes::new(), last, true);
            }
            core.pump();
            Ok(())
        })
    }

    fn dequeue_output_slot(&mut self) -> Result<DequeueOutput> {
        let mut core = lock(&self.core);
        core.ensure_started()?;
        if core.format_change_pending {
            core.format_change_pending = false;
            return Ok(DequeueOutput::FormatChanged);
        }
        match core.completed.pop_front() {
            Some(info) => {
                core.outputs_dequeued[info.index] = true;
                Ok(DequeueOutput::Slot(info))
            }
            None => Ok(DequeueOutput::WouldBlock),
        }
    }

    fn release_output_slot(&mut self, index: usize) -> Result<()> {
        with_core(&self.core, |core| {
            core.ensure_started()?;
            if !core.outputs_dequeued.get(index).copied().unwrap_or(false) {
                return Err(Error::InvalidSlot(index));
            }
            core.outputs_dequeued[index] = false;
            core.free_outputs.push_back(index);
            core.pump();
            Ok(())
        })
    }

    fn set_parameters(&mut self, params: &EncoderParams) -> Result<()> {
        with_core(&self.core, |core| {
            if core.state == State::Released {
                return Err(Error::NotInitialized);
            }
            if let Some(drop_frames) = params.drop_input_frames {
                if drop_frames != core.drop_input_frames {
                    log::debug!(
                        "passthrough: {} input frames",
                        if drop_frames { "dropping" } else { "accepting" }
                    );
                }
                core.drop_input_frames = drop_frames;
            }
            if let Some(threshold) = params.skip_frames_before_us {
                core.skip_before_us = Some(threshold);
                let before = core.pending.len();
                core.pending
                    .retain(|frame| frame.eos || frame.timestamp_us >= threshold);
                let skipped = before - core.pending.len();
                for _ in 0..skipped {
                    core.drop_frame(threshold, "before skip threshold");
                }
            }
            core.pump();
            Ok(())
        })
    }

    fn request_activity_notification(&mut self, notify: ActivityNotifier) {
        with_core(&self.core, |core| {
            if core.state != State::Released {
                core.notifier = Some(notify);
            }
        })
    }

    fn signal_end_of_input_stream(&mut self) -> Result<()> {
        with_core(&self.core, |core| {
            core.ensure_started()?;
            if !core.surface {
                return Err(Error::Unsupported(
                    "end of input is signalled through an input slot in buffer mode"
                        .to_string(),
                ));
            }
            if core.input_eos {
                return Ok(());
            }
            core.input_eos = true;
            let last = core.last_timestamp_us;
            core.queue_pending(Bytes::new(), last, true);
            core.pump();
            Ok(())
        })
    }
}

struct SurfaceHandle {
    core: Arc<Mutex<Core>>,
}

impl SurfaceSink for SurfaceHandle {
    fn queue_frame(&self, frame: MediaBuffer) -> Result<()> {
        with_core(&self.core, |core| {
            let timestamp_us = frame.timestamp_us();
            match core.state {
                State::Released => return Err(Error::NotInitialized),
                State::Started => {}
                _ => {
                    core.drop_frame(timestamp_us, "encoder not started");
                    return Ok(());
                }
            }
            if core.drop_input_frames || core.input_eos {
                core.drop_frame(timestamp_us, "suspended");
                return Ok(());
            }
            if core.skip_before_us.is_some_and(|t| timestamp_us < t) {
                core.drop_frame(timestamp_us, "before skip threshold");
                return Ok(());
            }
            if frame.len() > core.settings.slot_capacity {
                return Err(Error::SlotOverflow {
                    size: frame.len(),
                    capacity: core.settings.slot_capacity,
                });
            }
            core.queue_pending(frame.data().clone(), timestamp_us, false);
            frame.release();
            core.pump();
            Ok(())
        })
    }
}

#[cfg(test)]
#[path = "passthrough_test.rs"]
mod passthrough_test;
