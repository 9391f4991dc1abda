use std::time::Duration;

use ffmpeg_next::Dictionary;

/// Wait applied to every blocking capture call.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_millis(2000);
/// Pause between a closed session and the next attempt.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerKind {
    Rtsp,
    /// RTMP is carried by the `flv` muxer.
    Rtmp,
    /// Any other ffmpeg muxer, e.g. `nut` or `mpegts` for local sinks.
    Named(String),
}

impl ContainerKind {
    pub fn muxer_name(&self) -> &str {
        match self {
            ContainerKind::Rtsp => "rtsp",
            ContainerKind::Rtmp => "flv",
            ContainerKind::Named(name) => name,
        }
    }

    /// Fixed options handed to the muxer when the header is written.
    pub fn muxer_options(&self) -> MuxerOptions {
        let mut options = MuxerOptions::default();
        options.set("max_interleave_delta", "0");
        if let ContainerKind::Rtsp = self {
            options.set("rtsp_transport", "tcp");
        }
        options
    }
}

impl std::str::FromStr for ContainerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rtsp" => Ok(ContainerKind::Rtsp),
            "rtmp" | "flv" => Ok(ContainerKind::Rtmp),
            "" => Err("empty container name".to_string()),
            other => Ok(ContainerKind::Named(other.to_string())),
        }
    }
}

/// Ordered key/value options, turned into an ffmpeg `Dictionary` at the call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxerOptions {
    entries: Vec<(String, String)>,
}

impl MuxerOptions {
    pub fn set(&mut self, key: &str, value: &str) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn merge(&mut self, other: &MuxerOptions) {
        for (k, v) in other.iter() {
            self.set(k, v);
        }
    }

    pub fn to_dictionary(&self) -> Dictionary<'static> {
        let mut dict = Dictionary::new();
        for (k, v) in self.iter() {
            dict.set(k, v);
        }
        dict
    }
}

/// Immutable settings for one streamer process.
#[derive(Debug, Clone)]
pub struct StreamerConfig {
    pub destination: String,
    pub container: ContainerKind,
    pub video_encoder: String,
    pub audio_encoder: String,
    pub video_bitrate: usize,
    pub audio_bitrate: usize,
    pub capture_timeout: Duration,
    pub cooldown: Duration,
    /// Merged on top of the container's fixed options.
    pub extra_muxer_options: MuxerOptions,
}

impl StreamerConfig {
    pub fn muxer_options(&self) -> MuxerOptions {
        let mut options = self.container.muxer_options();
        options.merge(&self.extra_muxer_options);
        options
    }
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            destination: "rtsp://127.0.0.1:8554/live.sdp".to_string(),
            container: ContainerKind::Rtsp,
            video_encoder: "libx264".to_string(),
            audio_encoder: "libopus".to_string(),
            video_bitrate: 30_000_000,
            audio_bitrate: 320_000,
            capture_timeout: DEFAULT_CAPTURE_TIMEOUT,
            cooldown: DEFAULT_COOLDOWN,
            extra_muxer_options: MuxerOptions::default(),
        }
    }
}
