pub type Result<T, E = StreamError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Startup problem (unknown encoder, bad option). Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("unsupported source format: {0}")]
    UnsupportedFormat(String),

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("capture error: {0}")]
    Capture(String),
}

impl StreamError {
    /// Whether the supervisor should cool down and open a fresh session.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StreamError::Configuration(_))
    }

    pub fn resource(context: &str, err: ffmpeg_next::Error) -> Self {
        StreamError::Resource(av_error_fmt(context, err))
    }

    pub fn io(context: &str, err: ffmpeg_next::Error) -> Self {
        StreamError::Io(av_error_fmt(context, err))
    }

    pub fn encode(context: &str, err: ffmpeg_next::Error) -> Self {
        StreamError::Encode(av_error_fmt(context, err))
    }

    pub fn conversion(context: &str, err: ffmpeg_next::Error) -> Self {
        StreamError::Conversion(av_error_fmt(context, err))
    }
}

/// Formats a backend failure as `"<context>: <description> (code <n>)"`.
pub fn av_error_fmt(context: &str, err: ffmpeg_next::Error) -> String {
    let code: i32 = err.into();
    format!("{}: {} (code {})", context, err, code)
}

/// Same as [`av_error_fmt`] for raw return codes of `ffi` calls.
pub fn av_code_fmt(context: &str, code: i32) -> String {
    av_error_fmt(context, ffmpeg_next::Error::from(code))
}
