use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};

use crate::{
    buffer::{BufferFlags, MediaBuffer},
    error::{Error, Result},
    format::MediaFormat,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConfigureFlags(u32);

impl ConfigureFlags {
    pub const ENCODE: Self = Self(1);

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Backing storage of one encoder slot. Cloning shares the storage, so the
/// pipeline's cached slot table and the encoder see the same bytes.
#[derive(Clone)]
pub struct SlotBuffer {
    inner: Arc<Mutex<SlotData>>,
}

struct SlotData {
    data: BytesMut,
    capacity: usize,
    // raw buffer kept alive until the encoder has consumed the slot
    attached: Option<MediaBuffer>,
}

impl SlotBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SlotData {
                data: BytesMut::with_capacity(capacity),
                capacity,
                attached: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotData> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces the slot contents with `src`.
    pub fn fill(&self, src: &[u8]) -> Result<usize> {
        let mut slot = self.lock();
        if src.len() > slot.capacity {
            return Err(Error::SlotOverflow {
                size: src.len(),
                capacity: slot.capacity,
            });
        }
        slot.data.clear();
        slot.data.extend_from_slice(src);
        Ok(src.len())
    }

    /// Copies `size` bytes starting at `offset` out of the slot.
    pub fn read(&self, offset: usize, size: usize) -> Result<Bytes> {
        let slot = self.lock();
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= slot.data.len())
            .ok_or_else(|| {
                Error::Encoder(format!(
                    "slot range {}+{} exceeds {} valid bytes",
                    offset,
                    size,
                    slot.data.len()
                ))
            })?;
        Ok(Bytes::copy_from_slice(&slot.data[offset..end]))
    }

    pub fn attach(&self, buffer: MediaBuffer) {
        self.lock().attached = Some(buffer);
    }

    pub fn detach(&self) -> Option<MediaBuffer> {
        self.lock().attached.take()
    }

    pub fn has_attachment(&self) -> bool {
        self.lock().attached.is_some()
    }
}

/// A completed output slot as reported by `dequeue_output_slot`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputSlotInfo {
    pub index: usize,
    pub offset: usize,
    pub size: usize,
    pub timestamp_us: i64,
    pub flags: BufferFlags,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DequeueOutput {
    Slot(OutputSlotInfo),
    WouldBlock,
    /// The output format changed; refresh it and dequeue again.
    FormatChanged,
    /// The output slot table was reallocated; refresh it and dequeue again.
    SlotsChanged,
}

/// Free input slots and completed output slots at the time of an activity
/// notification.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Activity {
    pub input_slots: usize,
    pub output_slots: usize,
}

/// One-shot callback fired by the encoder once it has work for its client.
pub struct ActivityNotifier(Box<dyn FnOnce(Activity) + Send>);

impl ActivityNotifier {
    pub fn new(f: impl FnOnce(Activity) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    pub fn notify(self, activity: Activity) {
        (self.0)(activity)
    }
}

/// Runtime parameter changes. `None` leaves a parameter untouched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncoderParams {
    pub drop_input_frames: Option<bool>,
    pub skip_frames_before_us: Option<i64>,
}

impl EncoderParams {
    pub fn suspend() -> Self {
        Self {
            drop_input_frames: Some(true),
            ..Default::default()
        }
    }

    /// Resume intake; a positive `skip_frames_before_us` discards frames
    /// stamped earlier than it.
    pub fn resume(skip_frames_before_us: i64) -> Self {
        Self {
            drop_input_frames: Some(false),
            skip_frames_before_us: (skip_frames_before_us > 0).then_some(skip_frames_before_us),
        }
    }
}

/// Receives frames pushed straight into the encoder in surface mode.
pub trait SurfaceSink: Send + Sync {
    fn queue_frame(&self, frame: MediaBuffer) -> Result<()>;
}

/// Push handle for surface-input mode.
#[derive(Clone)]
pub struct InputSurface {
    sink: Arc<dyn SurfaceSink>,
}

impl InputSurface {
    pub fn new(sink: Arc<dyn SurfaceSink>) -> Self {
        Self { sink }
    }

    pub fn push(&self, frame: MediaBuffer) -> Result<()> {
        self.sink.queue_frame(frame)
    }
}

/// A configurable codec exposing indexed input and output slots.
///
/// Calls are made from the pipeline loop only; the activity callback may
/// fire on any thread.
pub trait Encoder: Send {
    fn configure(&mut self, format: &MediaFormat, flags: ConfigureFlags) -> Result<()>;

    fn output_format(&self) -> Result<MediaFormat>;

    /// Switches the encoder to surface input. Valid between configure and start.
    fn create_input_surface(&mut self) -> Result<InputSurface>;

    fn start(&mut self) -> Result<()>;

    fn release(&mut self);

    fn input_slots(&self) -> Result<Vec<SlotBuffer>>;

    fn output_slots(&self) -> Result<Vec<SlotBuffer>>;

    /// `Ok(None)` when no input slot is free.
    fn dequeue_input_slot(&mut self) -> Result<Option<usize>>;

    fn queue_input_slot(
        &mut self,
        index: usize,
        size: usize,
        timestamp_us: i64,
        flags: BufferFlags,
    ) -> Result<()>;

    fn dequeue_output_slot(&mut self) -> Result<DequeueOutput>;

    fn release_output_slot(&mut self, index: usize) -> Result<()>;

    fn set_parameters(&mut self, params: &EncoderParams) -> Result<()>;

    fn request_activity_notification(&mut self, notify: ActivityNotifier);

    fn signal_end_of_input_stream(&mut self) -> Result<()>;
}
