use crate::{buffer::MediaBuffer, error::Result, format::MediaFormat};

/// Parameters passed through `start()` to the source (pull mode) or used as
/// the initial skip threshold (surface mode).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartParams {
    pub start_time_us: Option<i64>,
}

impl StartParams {
    pub fn at(start_time_us: i64) -> Self {
        Self {
            start_time_us: Some(start_time_us),
        }
    }
}

/// A producer of raw, timestamped buffers (camera, microphone, decoder...).
///
/// `stop()` must be callable from any thread while a `read()` is blocked and
/// must make that read return.
pub trait MediaSource: Send + Sync + 'static {
    fn format(&self) -> MediaFormat;

    fn start(&self, params: &StartParams) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Blocks until the next buffer is available. `Err(Error::EndOfStream)`
    /// marks the end of the stream; any other error is a source failure.
    fn read(&self) -> Result<MediaBuffer>;
}
