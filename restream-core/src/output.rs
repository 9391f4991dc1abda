use std::ffi::CString;

use ffmpeg_next::{Rational, ffi, format, frame};

use crate::{
    config::{ContainerKind, MuxerOptions},
    converter::{AudioTarget, VideoTarget},
    encoder::{
        self, AUDIO_CHANNELS, AUDIO_SAMPLE_RATE, AudioSettings, EncoderKind, VIDEO_PIXEL_FORMAT,
        VideoSettings,
    },
    error::{Result, StreamError, av_code_fmt},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Closed,
    Opening,
    HeaderWritten,
    Streaming,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketStats {
    pub video_packets: u64,
    pub audio_packets: u64,
    pub bytes: u64,
}

/// Encode and mux surface driven by the supervisor.
pub trait StreamOutput {
    fn open(&mut self, container: &ContainerKind, destination: &str) -> Result<()>;

    fn add_video_stream(
        &mut self,
        encoder: &str,
        width: u32,
        height: u32,
        frame_rate: Rational,
        bitrate: usize,
    ) -> Result<()>;

    fn add_audio_stream(&mut self, encoder: &str, bitrate: usize) -> Result<()>;

    fn write_header(&mut self, options: &MuxerOptions) -> Result<()>;

    fn send_video_frame(&mut self, frame: &frame::Video) -> Result<()>;

    fn send_audio_frame(&mut self, frame: &frame::Audio) -> Result<()>;

    fn video_target(&self) -> Option<VideoTarget>;

    fn audio_target(&self) -> Option<AudioTarget>;

    /// Releases both encoders; the container stays allocated.
    fn close_codecs(&mut self);

    /// Drains encoders, writes the trailer if a header went out, and frees
    /// everything. The session can be opened again afterwards.
    fn close(&mut self);

    fn state(&self) -> SessionState;

    /// Encoder contexts plus container currently allocated.
    fn live_handles(&self) -> usize;
}

struct EncodedStream {
    index: usize,
    encoder: EncoderKind,
    encoder_time_base: Rational,
    /// Known once the header is written; the muxer may change it.
    stream_time_base: Rational,
}

pub struct OutputSession {
    container: Option<format::context::Output>,
    kind: Option<ContainerKind>,
    destination: String,
    video: Option<EncodedStream>,
    audio: Option<EncodedStream>,
    video_target: Option<VideoTarget>,
    audio_target: Option<AudioTarget>,
    state: SessionState,
    /// Set when a header write failed; only `close` clears it.
    poisoned: bool,
    /// Streams from a released pairing are still registered in the container.
    stale_streams: bool,
    stats: PacketStats,
}

impl OutputSession {
    pub fn new() -> Self {
        Self {
            container: None,
            kind: None,
            destination: String::new(),
            video: None,
            audio: None,
            video_target: None,
            audio_target: None,
            state: SessionState::Closed,
            poisoned: false,
            stale_streams: false,
            stats: PacketStats::default(),
        }
    }

    pub fn stats(&self) -> PacketStats {
        self.stats
    }

    /// Allocates the muxer and, unless it does its own networking (rtsp),
    /// opens the write connection.
    fn alloc_container(kind: &ContainerKind, destination: &str) -> Result<format::context::Output> {
        let context = format!(
            "could not open output {} as {}",
            destination,
            kind.muxer_name()
        );
        let url = CString::new(destination)
            .map_err(|e| StreamError::Configuration(format!("{}: {}", context, e)))?;
        let muxer = CString::new(kind.muxer_name())
            .map_err(|e| StreamError::Configuration(format!("{}: {}", context, e)))?;

        unsafe {
            let mut ps = std::ptr::null_mut();
            let ret = ffi::avformat_alloc_output_context2(
                &mut ps,
                std::ptr::null_mut(),
                muxer.as_ptr(),
                url.as_ptr(),
            );
            if ret < 0 || ps.is_null() {
                return Err(StreamError::Io(av_code_fmt(&context, ret)));
            }
            // freed on drop from here on
            let output = format::context::Output::wrap(ps);
            if (*(*ps).oformat).flags & ffi::AVFMT_NOFILE as i32 == 0 {
                let ret = ffi::avio_open(&mut (*ps).pb, url.as_ptr(), ffi::AVIO_FLAG_WRITE as i32);
                if ret < 0 {
                    return Err(StreamError::Io(av_code_fmt(&context, ret)));
                }
            }
            Ok(output)
        }
    }

    /// Container ready to take a new stream.
    fn container_for_streams(&mut self) -> Result<&mut format::context::Output> {
        if self.state != SessionState::Opening || self.poisoned {
            return Err(StreamError::Resource(format!(
                "cannot add streams in state {:?}",
                self.state
            )));
        }
        if self.stale_streams {
            // streams cannot be removed from a muxer, start from a fresh shell
            let Some(kind) = self.kind.clone() else {
                return Err(StreamError::Resource("container kind missing".to_string()));
            };
            log::debug!("reallocating container for new encoder pairing");
            self.container = None;
            self.container = Some(Self::alloc_container(&kind, &self.destination)?);
            self.stale_streams = false;
        }
        self.container
            .as_mut()
            .ok_or_else(|| StreamError::Resource("container not allocated".to_string()))
    }

    fn ready_for_frames(&self) -> Result<()> {
        match self.state {
            SessionState::HeaderWritten | SessionState::Streaming => Ok(()),
            state => Err(StreamError::Io(format!(
                "cannot send frames in state {:?}",
                state
            ))),
        }
    }

    fn drain(
        container: &mut format::context::Output,
        stream: &mut EncodedStream,
        stats: &mut PacketStats,
        is_video: bool,
    ) -> Result<()> {
        while let Some(mut packet) = stream.encoder.receive_packet()? {
            packet.set_stream(stream.index);
            packet.set_position(-1);
            packet.rescale_ts(stream.encoder_time_base, stream.stream_time_base);
            if is_video {
                stats.video_packets += 1;
            } else {
                stats.audio_packets += 1;
            }
            stats.bytes += packet.size() as u64;
            packet
                .write_interleaved(container)
                .map_err(|e| StreamError::io("error writing packet", e))?;
        }
        Ok(())
    }

    fn send_frame(&mut self, is_video: bool, frame: &frame::Frame) -> Result<()> {
        self.ready_for_frames()?;
        let container = self
            .container
            .as_mut()
            .ok_or_else(|| StreamError::Io("container not allocated".to_string()))?;
        let stream = match is_video {
            true => self.video.as_mut(),
            false => self.audio.as_mut(),
        };
        let stream =
            stream.ok_or_else(|| StreamError::Encode("no encoder for frame".to_string()))?;

        stream.encoder.send_frame(frame)?;
        Self::drain(container, stream, &mut self.stats, is_video)?;
        self.state = SessionState::Streaming;
        Ok(())
    }

    fn finish_encoders(&mut self) {
        let Some(container) = self.container.as_mut() else {
            return;
        };
        for (stream, is_video) in [(self.video.as_mut(), true), (self.audio.as_mut(), false)] {
            let Some(stream) = stream else { continue };
            let result = stream
                .encoder
                .send_eof()
                .and_then(|_| Self::drain(container, stream, &mut self.stats, is_video));
            if let Err(e) = result {
                log::warn!("error draining encoder on close: {}", e);
            }
        }
        if let Err(e) = container.write_trailer() {
            log::warn!("error writing trailer: {}", e);
        }
    }
}

impl Default for OutputSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOutput for OutputSession {
    fn open(&mut self, container: &ContainerKind, destination: &str) -> Result<()> {
        if self.state != SessionState::Closed {
            self.close();
        }
        let output = Self::alloc_container(container, destination)?;
        log::info!(
            "output opened: {} ({})",
            destination,
            container.muxer_name()
        );
        self.container = Some(output);
        self.kind = Some(container.clone());
        self.destination = destination.to_string();
        self.stats = PacketStats::default();
        self.poisoned = false;
        self.stale_streams = false;
        self.state = SessionState::Opening;
        Ok(())
    }

    fn add_video_stream(
        &mut self,
        encoder: &str,
        width: u32,
        height: u32,
        frame_rate: Rational,
        bitrate: usize,
    ) -> Result<()> {
        if self.video.is_some() {
            return Err(StreamError::Resource("video stream already added".to_string()));
        }
        let container = self.container_for_streams()?;
        let global_header = container
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let (codec, opened) = encoder::open_video_encoder(&VideoSettings {
            encoder: encoder.to_string(),
            width,
            height,
            frame_rate,
            bitrate,
            global_header,
        })?;

        let mut ost = container
            .add_stream(codec)
            .map_err(|e| StreamError::resource("could not add video stream", e))?;
        ost.set_parameters(&opened);
        let encoder_time_base = encoder::context_time_base(&opened);
        ost.set_time_base(encoder_time_base);
        let index = ost.index();

        self.video_target = Some(VideoTarget {
            format: VIDEO_PIXEL_FORMAT,
            width,
            height,
            frame_rate,
            time_base: encoder_time_base,
        });
        self.video = Some(EncodedStream {
            index,
            encoder: EncoderKind::Video(opened),
            encoder_time_base,
            stream_time_base: encoder_time_base,
        });
        log::debug!("video stream {} added", index);
        Ok(())
    }

    fn add_audio_stream(&mut self, encoder: &str, bitrate: usize) -> Result<()> {
        if self.audio.is_some() {
            return Err(StreamError::Resource("audio stream already added".to_string()));
        }
        let container = self.container_for_streams()?;
        let global_header = container
            .format()
            .flags()
            .contains(format::Flags::GLOBAL_HEADER);
        let (codec, opened, frame_size) = encoder::open_audio_encoder(&AudioSettings {
            encoder: encoder.to_string(),
            bitrate,
            global_header,
        })?;

        let mut ost = container
            .add_stream(codec)
            .map_err(|e| StreamError::resource("could not add audio stream", e))?;
        ost.set_parameters(&opened);
        let encoder_time_base = encoder::context_time_base(&opened);
        ost.set_time_base(encoder_time_base);
        let index = ost.index();

        self.audio_target = Some(AudioTarget {
            format: opened.format(),
            rate: AUDIO_SAMPLE_RATE,
            channels: AUDIO_CHANNELS,
            frame_size,
            time_base: encoder_time_base,
        });
        self.audio = Some(EncodedStream {
            index,
            encoder: EncoderKind::Audio(opened),
            encoder_time_base,
            stream_time_base: encoder_time_base,
        });
        log::debug!("audio stream {} added", index);
        Ok(())
    }

    fn write_header(&mut self, options: &MuxerOptions) -> Result<()> {
        if self.state != SessionState::Opening || self.poisoned {
            return Err(StreamError::Io(format!(
                "cannot write header in state {:?}",
                self.state
            )));
        }
        if self.video.is_none() || self.audio.is_none() {
            return Err(StreamError::Resource(
                "header needs both a video and an audio stream".to_string(),
            ));
        }
        let container = self
            .container
            .as_mut()
            .ok_or_else(|| StreamError::Io("container not allocated".to_string()))?;

        match container.write_header_with(options.to_dictionary()) {
            Ok(unused) => {
                for (k, v) in unused.iter() {
                    log::debug!("muxer ignored option {}={}", k, v);
                }
            }
            Err(e) => {
                self.poisoned = true;
                return Err(StreamError::io("could not write header", e));
            }
        }

        for stream in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if let Some(ost) = container.stream(stream.index) {
                stream.stream_time_base = ost.time_base();
            }
        }
        self.state = SessionState::HeaderWritten;
        log::info!("header written to {}", self.destination);
        Ok(())
    }

    fn send_video_frame(&mut self, frame: &frame::Video) -> Result<()> {
        self.send_frame(true, frame)
    }

    fn send_audio_frame(&mut self, frame: &frame::Audio) -> Result<()> {
        self.send_frame(false, frame)
    }

    fn video_target(&self) -> Option<VideoTarget> {
        self.video_target
    }

    fn audio_target(&self) -> Option<AudioTarget> {
        self.audio_target
    }

    fn close_codecs(&mut self) {
        if self.video.is_some() || self.audio.is_some() {
            log::debug!("releasing encoder pairing");
            self.stale_streams = true;
        }
        self.video = None;
        self.audio = None;
        self.video_target = None;
        self.audio_target = None;
    }

    fn close(&mut self) {
        if matches!(
            self.state,
            SessionState::HeaderWritten | SessionState::Streaming
        ) {
            self.finish_encoders();
        }
        self.close_codecs();
        if self.container.take().is_some() {
            log::info!(
                "output closed: {} ({} video / {} audio packets, {} bytes)",
                self.destination,
                self.stats.video_packets,
                self.stats.audio_packets,
                self.stats.bytes
            );
        }
        self.kind = None;
        self.poisoned = false;
        self.stale_streams = false;
        self.state = SessionState::Closed;
    }

    fn state(&self) -> SessionState {
        self.state
    }

    fn live_handles(&self) -> usize {
        self.container.is_some() as usize
            + self.video.is_some() as usize
            + self.audio.is_some() as usize
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "output_test.rs"]
mod output_test;
