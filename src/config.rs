use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use codec_source::{MediaFormat, Settings};
use serde::{Deserialize, Serialize};

use crate::media::types::{InputMode, SessionConfig};

/// Environment variable naming a JSON config file.
pub const CONFIG_ENV: &str = "RECORDER_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    pub mode: InputMode,
    pub mime: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
    pub bitrate: Option<u64>,
    pub frame_size: usize,
    pub frame_count: Option<u64>,
    pub duration_ms: Option<u64>,
    pub output: Option<String>,
    pub stop_timeout_ms: Option<u64>,
    pub encoder: EncoderConfig,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mode: InputMode::Pull,
            mime: "video/avc".to_string(),
            width: 1280,
            height: 720,
            frame_rate: 30,
            bitrate: None,
            frame_size: 4096,
            frame_count: None,
            duration_ms: Some(5_000),
            output: None,
            stop_timeout_ms: Some(2_000),
            encoder: EncoderConfig::default(),
        }
    }
}

/// Passthrough encoder knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub input_slots: usize,
    pub output_slots: usize,
    pub slot_capacity: usize,
    pub keyframe_interval: u64,
    pub lookahead: usize,
    pub emit_codec_config: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            input_slots: settings.input_slots,
            output_slots: settings.output_slots,
            slot_capacity: settings.slot_capacity,
            keyframe_interval: settings.keyframe_interval,
            lookahead: settings.lookahead,
            emit_codec_config: settings.emit_codec_config,
        }
    }
}

impl RecorderConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path.display(), e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.frame_rate == 0 {
            return Err(anyhow::anyhow!("frame_rate must be positive"));
        }
        Ok(config)
    }

    /// Reads the file named by the first CLI argument or by
    /// `RECORDER_CONFIG`; defaults when neither is given.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var(CONFIG_ENV).ok());
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn format(&self) -> MediaFormat {
        let mut format = MediaFormat::video(&self.mime, self.width, self.height, self.frame_rate);
        if let Some(bitrate) = self.bitrate {
            format = format.with_bitrate(bitrate);
        }
        format
    }
}

impl From<&RecorderConfig> for SessionConfig {
    fn from(config: &RecorderConfig) -> Self {
        let encoder = Settings {
            input_slots: config.encoder.input_slots,
            output_slots: config.encoder.output_slots,
            slot_capacity: config.encoder.slot_capacity,
            keyframe_interval: config.encoder.keyframe_interval,
            lookahead: config.encoder.lookahead,
            emit_codec_config: config.encoder.emit_codec_config,
            ..Default::default()
        };
        let mut builder = SessionConfig::builder(config.format())
            .mode(config.mode)
            .frame_size(config.frame_size)
            .encoder(encoder);
        if let Some(count) = config.frame_count {
            builder = builder.frame_count(count);
        }
        if let Some(ms) = config.duration_ms {
            builder = builder.duration(Duration::from_millis(ms));
        }
        if let Some(path) = &config.output {
            builder = builder.output(path);
        }
        if let Some(ms) = config.stop_timeout_ms {
            builder = builder.stop_timeout(Duration::from_millis(ms));
        }
        builder.build()
    }
}

pub fn config() -> &'static RecorderConfig {
    static CONFIG: LazyLock<RecorderConfig> = LazyLock::new(|| {
        RecorderConfig::load().unwrap_or_else(|e| {
            log::error!("falling back to default config: {:#}", e);
            RecorderConfig::default()
        })
    });
    &CONFIG
}
