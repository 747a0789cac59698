use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use codec_source::{
    Error as SourceError, MediaSource, PassthroughEncoder, Pipeline, PipelineConfig, StartParams,
};
use tokio_util::sync::CancellationToken;

use crate::media::{
    synthetic::{produce_frames, TestPatternSource},
    types::{InputMode, SessionConfig, SessionReport},
};

/// Session: one pipeline fed by a synthetic source, drained into a file
pub struct Session {
    config: SessionConfig,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn pipeline_config(&self) -> PipelineConfig {
        let mut builder = PipelineConfig::builder(self.config.format.clone());
        if self.config.mode == InputMode::Surface {
            builder = builder.surface_input();
        }
        if let Some(timeout) = self.config.stop_timeout {
            builder = builder.stop_timeout(timeout);
        }
        builder.build()
    }

    /// Runs until cancelled, until `duration` elapses or until the source
    /// (or a bounded surface producer) runs dry, then stops the pipeline
    /// and reports what came out.
    pub async fn run(&self) -> anyhow::Result<SessionReport> {
        let config = &self.config;
        log::info!(
            "Session: starting {:?} session, {} at {:?}",
            config.mode,
            config.format.mime,
            config.frame_interval()
        );

        let pattern = match config.mode {
            InputMode::Pull => Some(Arc::new(TestPatternSource::new(
                config.format.clone(),
                config.frame_size,
                config.frame_count,
            ))),
            InputMode::Surface => None,
        };
        let source = pattern
            .clone()
            .map(|pattern| pattern as Arc<dyn MediaSource>);

        let encoder = PassthroughEncoder::new(config.encoder.clone());
        let pipeline = Arc::new(Pipeline::create(
            self.pipeline_config(),
            Box::new(encoder),
            source,
        )?);
        pipeline.start(StartParams::at(0)).await?;

        let producer_cancel = self.cancel.child_token();
        let mut producer = match config.mode {
            InputMode::Surface => {
                let surface = pipeline.input_surface()?;
                Some(tokio::spawn(produce_frames(
                    surface,
                    config.frame_size,
                    config.frame_count,
                    config.frame_interval(),
                    producer_cancel.clone(),
                )))
            }
            InputMode::Pull => None,
        };

        let mut consumer = {
            let pipeline = Arc::clone(&pipeline);
            let output = config.output.clone();
            tokio::task::spawn_blocking(move || consume(&pipeline, output))
        };

        let deadline = async {
            match config.duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        let mut consumer_done = None;
        let mut producer_done = None;
        {
            // a bounded surface producer ends the session once it is done
            let produced = async {
                match producer.as_mut() {
                    Some(handle) => handle.await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    log::info!("Session: cancelled");
                },
                _ = deadline => {
                    log::info!("Session: duration reached");
                },
                result = &mut consumer => {
                    log::info!("Session: stream ended");
                    consumer_done = Some(result);
                },
                result = produced => {
                    log::info!("Session: producer finished");
                    producer_done = Some(result?);
                },
            }
        }

        producer_cancel.cancel();
        let mut frames_in = match (producer_done, producer) {
            (Some(pushed), _) => pushed,
            (None, Some(producer)) => producer.await?,
            (None, None) => 0,
        };
        if let Err(e) = pipeline.stop().await {
            log::warn!("Session: stop finished with {}", e);
        }

        let stats = match consumer_done {
            Some(result) => result??,
            None => consumer.await??,
        };
        if let Some(pattern) = &pattern {
            frames_in = pattern.reads();
        }

        let report = SessionReport {
            buffers: stats.buffers,
            bytes: stats.bytes,
            sync_frames: stats.sync_frames,
            codec_config: stats.codec_config,
            frames_in,
            status: stats.status,
        };
        log::info!("Session: {}", report);
        Ok(report)
    }
}

struct ConsumerStats {
    buffers: u64,
    bytes: u64,
    sync_frames: u64,
    codec_config: u64,
    status: SourceError,
}

/// Reads encoded buffers until the pipeline reports its terminal status,
/// appending payloads to `output` when one is given.
fn consume(pipeline: &Pipeline, output: Option<PathBuf>) -> anyhow::Result<ConsumerStats> {
    let mut writer = match output {
        Some(path) => {
            log::info!("Session: writing to {}", path.display());
            Some(BufWriter::new(File::create(&path)?))
        }
        None => None,
    };

    let mut stats = ConsumerStats {
        buffers: 0,
        bytes: 0,
        sync_frames: 0,
        codec_config: 0,
        status: SourceError::EndOfStream,
    };
    loop {
        let buffer = match pipeline.read() {
            Ok(buffer) => buffer,
            Err(status) => {
                stats.status = status;
                break;
            }
        };
        stats.buffers += 1;
        stats.bytes += buffer.len() as u64;
        if buffer.is_sync_frame() {
            stats.sync_frames += 1;
        }
        if buffer.is_codec_config() {
            stats.codec_config += 1;
        }
        if let Some(writer) = writer.as_mut() {
            writer.write_all(buffer.data())?;
        }
        pipeline.signal_buffer_returned(buffer);
    }

    if let Some(mut writer) = writer {
        writer.flush()?;
    }
    Ok(stats)
}

#[cfg(test)]
#[path = "session_test.rs"]
mod session_test;
