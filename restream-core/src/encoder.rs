use ffmpeg_next::{
    ChannelLayout, Dictionary, Rational,
    codec::{self, encoder},
    format::{Pixel, Sample},
};

use crate::error::{Result, StreamError};

/// Frames between forced keyframes.
pub const VIDEO_GOP: u32 = 12;
pub const VIDEO_PIXEL_FORMAT: Pixel = Pixel::YUV420P;
pub const VIDEO_TIME_BASE: Rational = Rational(1, 90000);
pub const AUDIO_SAMPLE_RATE: u32 = 48000;
pub const AUDIO_CHANNELS: u16 = 2;
pub const AUDIO_TIME_BASE: Rational = Rational(1, 48000);
/// Used when an encoder accepts any frame size and reports 0.
pub const FALLBACK_AUDIO_FRAME_SIZE: usize = 1024;

/// Whether `name` resolves to an encoder in the linked ffmpeg build.
pub fn encoder_available(name: &str) -> bool {
    encoder::find_by_name(name).is_some()
}

pub fn find_encoder(name: &str) -> Result<codec::Codec> {
    encoder::find_by_name(name)
        .ok_or_else(|| StreamError::Configuration(format!("encoder not found: {}", name)))
}

/// Hardware encoders are recognised by their ffmpeg name suffix.
pub fn is_hardware_encoder(name: &str) -> bool {
    ["nvenc", "vaapi", "qsv", "v4l2m2m", "videotoolbox", "amf"]
        .iter()
        .any(|hw| name.ends_with(hw))
}

/// Encoder-specific options applied when the encoder is opened.
pub fn tuning_options(name: &str) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    if name.ends_with("videotoolbox") {
        opts.set("realtime", "1");
        opts.set("allow_sw", "0");
    } else if name.ends_with("nvenc") {
        opts.set("zerolatency", "1");
        opts.set("delay", "0");
    } else if name.ends_with("qsv") {
        opts.set("async_depth", "1");
    } else if name == "libx264" {
        opts.set("preset", "veryfast");
    }
    opts
}

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub encoder: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub bitrate: usize,
    pub global_header: bool,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub encoder: String,
    pub bitrate: usize,
    pub global_header: bool,
}

pub fn open_video_encoder(
    settings: &VideoSettings,
) -> Result<(codec::Codec, encoder::video::Encoder)> {
    let codec = find_encoder(&settings.encoder)?;
    let mut enc = codec::Context::new_with_codec(codec)
        .encoder()
        .video()
        .map_err(|e| StreamError::resource("could not allocate video encoder", e))?;

    enc.set_width(settings.width);
    enc.set_height(settings.height);
    enc.set_format(VIDEO_PIXEL_FORMAT);
    enc.set_frame_rate(Some(settings.frame_rate));
    enc.set_time_base(VIDEO_TIME_BASE);
    enc.set_bit_rate(settings.bitrate);
    enc.set_gop(VIDEO_GOP);
    if settings.global_header {
        enc.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    if is_hardware_encoder(&settings.encoder) {
        log::info!("using hardware encoder: {}", settings.encoder);
    }
    let opened = enc
        .open_with(tuning_options(&settings.encoder))
        .map_err(|e| StreamError::resource("could not open video encoder", e))?;
    log::info!(
        "video encoder {} opened: {}x{} @ {} fps, {} bps",
        settings.encoder,
        settings.width,
        settings.height,
        settings.frame_rate,
        settings.bitrate
    );
    Ok((codec, opened))
}

/// Opens an audio encoder at 48 kHz stereo. Returns the encoder and its
/// fixed frame size.
pub fn open_audio_encoder(
    settings: &AudioSettings,
) -> Result<(codec::Codec, encoder::audio::Encoder, usize)> {
    let codec = find_encoder(&settings.encoder)?;
    let format = preferred_sample_format(codec)?;
    let mut enc = codec::Context::new_with_codec(codec)
        .encoder()
        .audio()
        .map_err(|e| StreamError::resource("could not allocate audio encoder", e))?;

    enc.set_rate(AUDIO_SAMPLE_RATE as i32);
    enc.set_channel_layout(ChannelLayout::default(AUDIO_CHANNELS as i32));
    enc.set_format(format);
    enc.set_bit_rate(settings.bitrate);
    enc.set_time_base(AUDIO_TIME_BASE);
    if settings.global_header {
        enc.set_flags(codec::Flags::GLOBAL_HEADER);
    }

    let opened = enc
        .open_with(tuning_options(&settings.encoder))
        .map_err(|e| StreamError::resource("could not open audio encoder", e))?;
    let frame_size = match opened.frame_size() {
        0 => FALLBACK_AUDIO_FRAME_SIZE,
        n => n as usize,
    };
    log::info!(
        "audio encoder {} opened: {:?}, frame size {}, {} bps",
        settings.encoder,
        format,
        frame_size,
        settings.bitrate
    );
    Ok((codec, opened, frame_size))
}

/// First sample format the encoder advertises.
fn preferred_sample_format(codec: codec::Codec) -> Result<Sample> {
    let audio = codec.audio().map_err(|e| {
        StreamError::Configuration(format!("{} is not an audio encoder: {}", codec.name(), e))
    })?;
    audio
        .formats()
        .and_then(|mut formats| formats.next())
        .ok_or_else(|| {
            StreamError::Configuration(format!(
                "{} advertises no sample formats",
                codec.name()
            ))
        })
}

pub enum EncoderKind {
    Video(encoder::video::Encoder),
    Audio(encoder::audio::Encoder),
}

impl EncoderKind {
    pub fn send_frame(&mut self, frame: &ffmpeg_next::Frame) -> Result<()> {
        let ret = match self {
            EncoderKind::Video(encoder) => encoder.send_frame(frame),
            EncoderKind::Audio(encoder) => encoder.send_frame(frame),
        };
        ret.map_err(|e| StreamError::encode("error sending frame to encoder", e))
    }

    pub fn send_eof(&mut self) -> Result<()> {
        let ret = match self {
            EncoderKind::Video(encoder) => encoder.send_eof(),
            EncoderKind::Audio(encoder) => encoder.send_eof(),
        };
        ret.map_err(|e| StreamError::encode("error sending eof to encoder", e))
    }

    /// `None` once the encoder needs more input or has finished.
    pub fn receive_packet(&mut self) -> Result<Option<codec::packet::Packet>> {
        let mut packet = codec::packet::Packet::empty();
        let result = match self {
            EncoderKind::Video(encoder) => encoder.receive_packet(&mut packet),
            EncoderKind::Audio(encoder) => encoder.receive_packet(&mut packet),
        };

        match result {
            Ok(()) => Ok(Some(packet)),
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(err) => Err(StreamError::encode("error receiving packet", err)),
        }
    }
}

pub fn context_time_base(context: &codec::Context) -> Rational {
    unsafe { (*context.as_ptr()).time_base.into() }
}
