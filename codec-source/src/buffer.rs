use std::fmt::{Display, Formatter};
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const EOS: Self = Self(1 << 0);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const SYNC_FRAME: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Metadata carried alongside a buffer payload. Times are in microseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferMeta {
    pub timestamp_us: i64,
    pub flags: BufferFlags,
    pub decoding_time_us: Option<i64>,
    pub drift_time_us: Option<i64>,
}

impl BufferMeta {
    pub fn at(timestamp_us: i64) -> Self {
        Self {
            timestamp_us,
            ..Default::default()
        }
    }
}

/// A unit of raw or encoded media.
///
/// Ownership moves through the queues; whoever holds the buffer last either
/// calls [`MediaBuffer::release`] or drops it, which hands it back to the
/// [`BufferPool`] it came from.
pub struct MediaBuffer {
    data: Bytes,
    meta: BufferMeta,
    origin: Option<Arc<BufferPool>>,
}

impl MediaBuffer {
    pub fn new(data: impl Into<Bytes>, timestamp_us: i64) -> Self {
        Self {
            data: data.into(),
            meta: BufferMeta::at(timestamp_us),
            origin: None,
        }
    }

    pub fn with_meta(data: impl Into<Bytes>, meta: BufferMeta) -> Self {
        Self {
            data: data.into(),
            meta,
            origin: None,
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.meta.flags |= flags;
        self
    }

    pub fn with_drift_time(mut self, drift_time_us: i64) -> Self {
        self.meta.drift_time_us = Some(drift_time_us);
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn timestamp_us(&self) -> i64 {
        self.meta.timestamp_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.meta.flags
    }

    pub fn meta(&self) -> &BufferMeta {
        &self.meta
    }

    pub fn is_sync_frame(&self) -> bool {
        self.meta.flags.contains(BufferFlags::SYNC_FRAME)
    }

    pub fn is_codec_config(&self) -> bool {
        self.meta.flags.contains(BufferFlags::CODEC_CONFIG)
    }

    pub fn decoding_time_us(&self) -> Option<i64> {
        self.meta.decoding_time_us
    }

    pub fn drift_time_us(&self) -> Option<i64> {
        self.meta.drift_time_us
    }

    /// Returns the buffer to its allocator.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for MediaBuffer {
    fn drop(&mut self) {
        if let Some(pool) = self.origin.take() {
            pool.give_back();
        }
    }
}

impl Display for MediaBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "MediaBuffer {{ size: {}, time: {}us, flags: {:#x} }}",
            self.data.len(),
            self.meta.timestamp_us,
            self.meta.flags.bits()
        )
    }
}

impl std::fmt::Debug for MediaBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBuffer")
            .field("size", &self.data.len())
            .field("meta", &self.meta)
            .field("pooled", &self.origin.is_some())
            .finish()
    }
}

/// Allocator for buffers handed to a consumer. Tracks how many of its
/// buffers are still alive.
#[derive(Debug)]
pub struct BufferPool {
    name: String,
    allocated: AtomicU64,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            allocated: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allocate(self: &Arc<Self>, data: impl Into<Bytes>, meta: BufferMeta) -> MediaBuffer {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        MediaBuffer {
            data: data.into(),
            meta,
            origin: Some(Arc::clone(self)),
        }
    }

    /// Total buffers handed out since creation.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn give_back(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An entry of the pipeline's input queue. `EndOfStream` is the sentinel
/// that trails the last buffer.
#[derive(Debug)]
pub enum AccessUnit {
    Buffer(MediaBuffer),
    EndOfStream,
}

impl AccessUnit {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, AccessUnit::EndOfStream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_query() {
        let mut flags = BufferFlags::SYNC_FRAME | BufferFlags::CODEC_CONFIG;
        assert!(flags.contains(BufferFlags::SYNC_FRAME));
        assert!(!flags.contains(BufferFlags::EOS));
        flags.remove(BufferFlags::CODEC_CONFIG);
        assert_eq!(flags, BufferFlags::SYNC_FRAME);
        flags.insert(BufferFlags::EOS);
        assert!(flags.contains(BufferFlags::EOS | BufferFlags::SYNC_FRAME));
        assert!(BufferFlags::empty().is_empty());
    }

    #[test]
    fn pooled_buffers_return_on_release_and_drop() {
        let pool = BufferPool::new("test");
        let a = pool.allocate(vec![1u8, 2, 3], BufferMeta::at(10));
        let b = pool.allocate(vec![4u8], BufferMeta::at(20));
        assert_eq!(pool.outstanding(), 2);
        assert_eq!(a.len(), 3);
        assert_eq!(b.timestamp_us(), 20);

        a.release();
        assert_eq!(pool.outstanding(), 1);
        drop(b);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn unpooled_buffer_carries_meta() {
        let buf = MediaBuffer::new(vec![0u8; 8], 33)
            .with_flags(BufferFlags::SYNC_FRAME)
            .with_drift_time(5);
        assert!(buf.is_sync_frame());
        assert!(!buf.is_codec_config());
        assert_eq!(buf.drift_time_us(), Some(5));
        assert_eq!(buf.decoding_time_us(), None);
        assert_eq!(buf.to_string(), "MediaBuffer { size: 8, time: 33us, flags: 0x4 }");
    }
}
