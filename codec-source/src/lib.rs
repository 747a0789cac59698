//! Asynchronous encoding source: pulls raw buffers from a [`MediaSource`]
//! (or takes them from an input surface), runs them through an
//! [`Encoder`] and hands encoded buffers to a blocking reader.

pub mod buffer;
pub mod config;
pub mod encoder;
pub mod error;
pub mod format;
mod output;
pub mod passthrough;
pub mod pipeline;
pub mod puller;
pub mod source;

#[cfg(test)]
pub(crate) mod testing;

pub use buffer::{AccessUnit, BufferFlags, BufferMeta, BufferPool, MediaBuffer};
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use encoder::{Encoder, EncoderParams, InputSurface};
pub use error::{Error, Result};
pub use format::{MediaFormat, MediaKind};
pub use passthrough::{PassthroughEncoder, Settings};
pub use pipeline::Pipeline;
pub use source::{MediaSource, StartParams};
