use std::{fmt::Display, time::Duration};

use serde::Serialize;

use crate::{error::Result, frame::Captured};

/// A source the capture backend can connect to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceDescriptor {
    pub name: String,
    /// Address handed to the demuxer (device path, URL, lavfi graph).
    pub url: String,
    /// Demuxer or device name, e.g. `v4l2`; `None` lets ffmpeg detect it.
    pub format: Option<String>,
}

impl SourceDescriptor {
    pub fn new(url: &str, format: Option<&str>) -> Self {
        Self {
            name: url.to_string(),
            url: url.to_string(),
            format: format.map(str::to_string),
        }
    }
}

impl Display for SourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.format {
            Some(format) => write!(f, "{} [{}] {}", self.name, format, self.url),
            None => write!(f, "{} {}", self.name, self.url),
        }
    }
}

/// Capture collaborator consumed by the supervisor.
pub trait SourceCapture {
    fn discover(&mut self) -> Result<Vec<SourceDescriptor>>;

    fn connect(&mut self, source: &SourceDescriptor) -> Result<()>;

    /// Waits up to `timeout` for the next frame. Running out of time yields
    /// `Captured::Timeout`, never an error.
    fn capture(&mut self, timeout: Duration) -> Result<Captured>;

    /// Hands a frame back once the converter is done with it.
    fn release(&mut self, captured: Captured) {
        drop(captured);
    }
}
