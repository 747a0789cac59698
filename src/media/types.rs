use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use codec_source::{Error as SourceError, MediaFormat, Settings};
use serde::{Deserialize, Serialize};

/// How raw frames reach the encoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// A source is read one frame at a time.
    #[default]
    Pull,
    /// A producer pushes frames into the encoder's input surface.
    Surface,
}

/// One recording session.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub mode: InputMode,
    pub format: MediaFormat,
    // bytes per synthetic frame
    pub frame_size: usize,
    // None = until stopped
    pub frame_count: Option<u64>,
    // None = until cancelled
    pub duration: Option<Duration>,
    // None = discard encoded output
    pub output: Option<PathBuf>,
    pub stop_timeout: Option<Duration>,
    pub encoder: Settings,
}

impl SessionConfig {
    pub fn builder(format: MediaFormat) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                mode: InputMode::Pull,
                format,
                frame_size: 4096,
                frame_count: None,
                duration: None,
                output: None,
                stop_timeout: None,
                encoder: Settings::default(),
            },
        }
    }

    /// Interval between synthetic frames.
    pub fn frame_interval(&self) -> Duration {
        let fps = self.format.frame_rate.unwrap_or(30).max(1);
        Duration::from_micros(1_000_000 / u64::from(fps))
    }
}

pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn mode(mut self, mode: InputMode) -> Self {
        self.config.mode = mode;
        self
    }

    /// Push frames through an input surface instead of pulling them.
    pub fn surface(self) -> Self {
        self.mode(InputMode::Surface)
    }

    pub fn frame_size(mut self, frame_size: usize) -> Self {
        self.config.frame_size = frame_size;
        self
    }

    pub fn frame_count(mut self, frame_count: u64) -> Self {
        self.config.frame_count = Some(frame_count);
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.config.duration = Some(duration);
        self
    }

    pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output = Some(path.into());
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = Some(timeout);
        self
    }

    pub fn encoder(mut self, settings: Settings) -> Self {
        self.config.encoder = settings;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}

/// What a finished session produced.
#[derive(Clone, Debug)]
pub struct SessionReport {
    pub buffers: u64,
    pub bytes: u64,
    pub sync_frames: u64,
    pub codec_config: u64,
    // frames pushed (surface) or read from the source (pull)
    pub frames_in: u64,
    pub status: SourceError,
}

impl Display for SessionReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{} frames in, {} buffers out ({} bytes, {} sync, {} config), ended with: {}",
            self.frames_in, self.buffers, self.bytes, self.sync_frames, self.codec_config, self.status
        )
    }
}
