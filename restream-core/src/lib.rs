/// Registers FFmpeg components (formats, devices, codecs). Call once at
/// startup before opening inputs or outputs.
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

/// Lowers ffmpeg's own logging to errors unless `verbose`.
pub fn set_backend_log_level(verbose: bool) {
    let level = if verbose {
        ffmpeg_next::util::log::Level::Info
    } else {
        ffmpeg_next::util::log::Level::Error
    };
    ffmpeg_next::util::log::set_level(level);
}

pub mod capture;
pub mod config;
pub mod converter;
pub mod device;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod input;
pub mod output;
pub mod resampler;
pub mod scaler;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use capture::{SourceCapture, SourceDescriptor};
pub use config::{ContainerKind, MuxerOptions, StreamerConfig};
pub use converter::{AudioTarget, FrameConverter, VideoTarget};
pub use encoder::encoder_available;
pub use error::{Result, StreamError};
pub use frame::{Captured, CapturedAudio, CapturedVideo, SourcePixelFormat};
pub use input::FfmpegCapture;
pub use output::{OutputSession, StreamOutput};
pub use status::{SupervisorState, SupervisorStatus};
pub use supervisor::Supervisor;
