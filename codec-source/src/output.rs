use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::{
    buffer::MediaBuffer,
    error::{Error, Result},
};

/// Encoded buffers waiting for the consumer, plus the terminal status once
/// end-of-stream has been reached. The only pipeline state touched by a
/// foreign thread.
pub struct OutputQueue {
    state: Mutex<OutputState>,
    cond: Condvar,
}

struct OutputState {
    buffers: VecDeque<MediaBuffer>,
    status: Option<Error>,
}

impl OutputQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OutputState {
                buffers: VecDeque::new(),
                status: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a buffer and wakes one reader. Buffers arriving after the
    /// queue is finished are released.
    pub fn push(&self, buffer: MediaBuffer) -> bool {
        let mut state = self.lock();
        if state.status.is_some() {
            return false;
        }
        state.buffers.push_back(buffer);
        self.cond.notify_one();
        true
    }

    /// Marks end-of-stream with `status` and wakes every reader. With
    /// `flush`, unread buffers are released. Returns false if the queue was
    /// already finished.
    pub fn finish(&self, status: Error, flush: bool) -> bool {
        let released = {
            let mut state = self.lock();
            if state.status.is_some() {
                return false;
            }
            state.status = Some(status);
            let released = if flush {
                std::mem::take(&mut state.buffers)
            } else {
                VecDeque::new()
            };
            self.cond.notify_all();
            released
        };
        if !released.is_empty() {
            log::debug!("releasing {} unread output buffers", released.len());
        }
        drop(released);
        true
    }

    /// Blocks until a buffer is available or end-of-stream is reached. Once
    /// the queue is drained after end-of-stream, every call returns the
    /// stored status immediately.
    pub fn read(&self) -> Result<MediaBuffer> {
        let mut state = self.lock();
        while state.buffers.is_empty() && state.status.is_none() {
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        Self::take(&mut state)
    }

    /// Like [`OutputQueue::read`] but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<MediaBuffer>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while state.buffers.is_empty() && state.status.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
        Self::take(&mut state).map(Some)
    }

    fn take(state: &mut OutputState) -> Result<MediaBuffer> {
        if let Some(buffer) = state.buffers.pop_front() {
            return Ok(buffer);
        }
        Err(state.status.clone().unwrap_or(Error::EndOfStream))
    }

    pub fn len(&self) -> usize {
        self.lock().buffers.len()
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}
