use std::time::Duration;

use clap::Parser;
use restream_core::{ContainerKind, SourceDescriptor, StreamerConfig};

#[derive(Parser, Debug)]
#[command(name = "live-restream")]
#[command(about = "Re-stream a live video/audio source to an RTSP or RTMP endpoint", long_about = None)]
pub struct Cli {
    /// Source address; prompts for a discovered source when omitted
    #[arg(short = 'n', long = "input")]
    pub input: Option<String>,

    /// ffmpeg demuxer or device for the source (e.g. v4l2, lavfi)
    #[arg(long)]
    pub input_format: Option<String>,

    /// Output container
    #[arg(short = 'f', long, default_value = "rtsp", value_parser = ["rtsp", "rtmp"])]
    pub output_format: String,

    /// Output destination URL
    #[arg(short = 'o', long = "output", default_value = "rtsp://127.0.0.1:8554/live.sdp")]
    pub output: String,

    /// Video encoder name
    #[arg(short = 'v', long, default_value = "libx264")]
    pub video_codec: String,

    /// Audio encoder name
    #[arg(short = 'a', long, default_value = "libopus")]
    pub audio_codec: String,

    /// Video bitrate in bits per second
    #[arg(long, default_value_t = 30_000_000)]
    pub video_bitrate: usize,

    /// Audio bitrate in bits per second
    #[arg(long, default_value_t = 320_000)]
    pub audio_bitrate: usize,

    /// How long one capture call may block
    #[arg(long, default_value_t = 2000)]
    pub capture_timeout_ms: u64,

    /// Pause before reconnecting after a failed session
    #[arg(long, default_value_t = 2000)]
    pub cooldown_ms: u64,

    /// Serve the status endpoint on this address (e.g. 127.0.0.1:8080)
    #[arg(long)]
    pub status_listen: Option<String>,

    /// Debug logging for the restreamer and ffmpeg
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    pub fn streamer_config(&self) -> anyhow::Result<StreamerConfig> {
        let container = self
            .output_format
            .parse::<ContainerKind>()
            .map_err(|e| anyhow::anyhow!("invalid output format: {}", e))?;
        if self.capture_timeout_ms == 0 {
            anyhow::bail!("capture timeout must be positive");
        }
        Ok(StreamerConfig {
            destination: self.output.clone(),
            container,
            video_encoder: self.video_codec.clone(),
            audio_encoder: self.audio_codec.clone(),
            video_bitrate: self.video_bitrate,
            audio_bitrate: self.audio_bitrate,
            capture_timeout: Duration::from_millis(self.capture_timeout_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
            ..StreamerConfig::default()
        })
    }

    pub fn source(&self) -> Option<SourceDescriptor> {
        self.input
            .as_deref()
            .map(|url| SourceDescriptor::new(url, self.input_format.as_deref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["live-restream"]).unwrap();
        let config = cli.streamer_config().unwrap();
        assert_eq!(config.destination, "rtsp://127.0.0.1:8554/live.sdp");
        assert_eq!(config.container, ContainerKind::Rtsp);
        assert_eq!(config.video_encoder, "libx264");
        assert_eq!(config.audio_encoder, "libopus");
        assert_eq!(config.video_bitrate, 30_000_000);
        assert_eq!(config.audio_bitrate, 320_000);
        assert_eq!(config.capture_timeout, Duration::from_secs(2));
        assert!(cli.source().is_none());
    }

    #[test]
    fn test_rtmp_output_uses_flv() {
        let cli = Cli::try_parse_from([
            "live-restream",
            "-n",
            "/dev/video0",
            "--input-format",
            "v4l2",
            "-f",
            "rtmp",
            "-o",
            "rtmp://localhost/live/key",
            "-v",
            "h264_nvenc",
        ])
        .unwrap();
        let config = cli.streamer_config().unwrap();
        assert_eq!(config.container.muxer_name(), "flv");
        assert_eq!(config.video_encoder, "h264_nvenc");
        assert_eq!(config.muxer_options().get("rtsp_transport"), None);
        let source = cli.source().unwrap();
        assert_eq!(source.format.as_deref(), Some("v4l2"));
    }

    #[test]
    fn test_unknown_container_rejected() {
        assert!(Cli::try_parse_from(["live-restream", "-f", "hls"]).is_err());
    }

    #[test]
    fn test_zero_capture_timeout_rejected() {
        let cli = Cli::try_parse_from(["live-restream", "--capture-timeout-ms", "0"]).unwrap();
        assert!(cli.streamer_config().is_err());
    }
}
