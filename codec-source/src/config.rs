use std::time::Duration;

use crate::format::MediaFormat;

/// How a [`crate::pipeline::Pipeline`] is set up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineConfig {
    pub format: MediaFormat,
    /// Raw frames are pushed into an input surface instead of pulled.
    pub surface_input: bool,
    /// Input buffers carry references to frames rather than frame data.
    pub metadata_input: bool,
    /// Force end-of-stream if the encoder has not produced it this long
    /// after a stop request.
    pub stop_timeout: Option<Duration>,
}

impl PipelineConfig {
    pub fn new(format: MediaFormat) -> Self {
        Self {
            format,
            ..Default::default()
        }
    }

    pub fn builder(format: MediaFormat) -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::new(format),
        }
    }

    /// Format handed to the encoder's `configure`.
    pub(crate) fn encoder_format(&self) -> MediaFormat {
        let mut format = self.format.clone();
        if self.metadata_input {
            format.store_metadata_in_buffers = true;
        }
        if self.surface_input {
            format.create_input_buffers_suspended = true;
        }
        format
    }
}

pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn surface_input(mut self) -> Self {
        self.config.surface_input = true;
        self
    }

    pub fn metadata_input(mut self) -> Self {
        self.config.metadata_input = true;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_flags() {
        let config = PipelineConfig::builder(MediaFormat::video("video/avc", 640, 480, 30))
            .surface_input()
            .stop_timeout(Duration::from_secs(2))
            .build();
        assert!(config.surface_input);
        assert!(!config.metadata_input);
        assert_eq!(config.stop_timeout, Some(Duration::from_secs(2)));

        let format = config.encoder_format();
        assert!(format.create_input_buffers_suspended);
        assert!(!format.store_metadata_in_buffers);
    }

    #[test]
    fn pull_mode_format_is_unchanged() {
        let config = PipelineConfig::builder(MediaFormat::audio("audio/aac", 48000, 2))
            .metadata_input()
            .build();
        let format = config.encoder_format();
        assert!(format.store_metadata_in_buffers);
        assert!(!format.create_input_buffers_suspended);
        assert_eq!(format.sample_rate, Some(48000));
    }
}
