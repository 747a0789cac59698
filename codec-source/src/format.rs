#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
    Other,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Other => "other",
        }
    }
}

/// Description of a raw or encoded stream, handed to the encoder on
/// configure and reported back as its output format.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MediaFormat {
    // "video/avc", "audio/mp4a-latm", "video/raw"...
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    // bps
    pub bitrate: Option<u64>,
    pub frame_rate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    pub store_metadata_in_buffers: bool,
    pub create_input_buffers_suspended: bool,
}

impl MediaFormat {
    pub fn new(mime: &str) -> Self {
        Self {
            mime: mime.to_string(),
            ..Default::default()
        }
    }

    pub fn video(mime: &str, width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            mime: mime.to_string(),
            width: Some(width),
            height: Some(height),
            frame_rate: Some(frame_rate),
            ..Default::default()
        }
    }

    pub fn audio(mime: &str, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.to_string(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    pub fn with_bitrate(mut self, bitrate: u64) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn kind(&self) -> MediaKind {
        let prefix = |p: &str| {
            self.mime
                .get(..p.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(p))
        };
        if prefix("video/") {
            MediaKind::Video
        } else if prefix("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }

    pub fn is_video(&self) -> bool {
        self.kind() == MediaKind::Video
    }

    pub fn is_audio(&self) -> bool {
        self.kind() == MediaKind::Audio
    }
}
