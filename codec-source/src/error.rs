/// Result alias used across the pipeline.
pub type Result<T> = core::result::Result<T, Error>;

/// Status codes produced by the pipeline, its puller and its collaborators.
///
/// The type is `Clone` because one terminal status is handed to every
/// reader and every pending `stop()` caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Operation invoked before the encoder or puller was ready, or after
    /// the encoder was released.
    #[error("not initialized")]
    NotInitialized,

    /// `start()` was called while a stop is in progress.
    #[error("cannot start while stopping")]
    AlreadyStopping,

    /// Terminal success condition: the stream ended.
    #[error("end of stream")]
    EndOfStream,

    /// Raw source failure other than end-of-stream.
    #[error("source error: {0}")]
    Source(String),

    /// Any encoder failure. Fatal for the session.
    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("buffer of {size} bytes does not fit slot of {capacity} bytes")]
    SlotOverflow { size: usize, capacity: usize },

    #[error("invalid slot index {0}")]
    InvalidSlot(usize),

    /// Surface-only operation requested on a pull-mode pipeline.
    #[error("pipeline is not in surface input mode")]
    NotSurfaceMode,

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The encoder did not produce end-of-stream within the stop timeout.
    #[error("timed out waiting for end of stream")]
    StopTimeout,

    /// A loop went away before answering.
    #[error("{0} loop has shut down")]
    Closed(&'static str),
}

impl Error {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Error::EndOfStream)
    }

    /// Collapses a terminal status into the value reported to `stop()` callers.
    pub(crate) fn into_stop_status(self) -> Result<()> {
        match self {
            Error::EndOfStream => Ok(()),
            err => Err(err),
        }
    }
}
