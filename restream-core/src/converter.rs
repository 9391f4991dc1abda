//! Frame converter: turns captured frames into encoder-ready frames.
//!
//! The converter owns exactly one working frame per media type. Every
//! `convert_*` call overwrites it, so a returned frame is only valid until the
//! next call on the same converter; the borrow checker enforces this through
//! the `&mut self` receiver.

use std::time::Instant;

use ffmpeg_next::{
    ChannelLayout, Rational, Rescale, format::Pixel, format::Sample, frame, picture,
};

use crate::{
    error::{Result, StreamError, av_code_fmt},
    frame::{AudioSourceFrame, VideoData, VideoSourceFrame},
    resampler::{ResampleKey, Resampler},
    scaler::{ScaleKey, Scaler},
};

/// Encoder-ready video layout the converter must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoTarget {
    pub format: Pixel,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub time_base: Rational,
}

/// Encoder-ready audio layout the converter must produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioTarget {
    pub format: Sample,
    pub rate: u32,
    pub channels: u16,
    /// Samples per encoder frame.
    pub frame_size: usize,
    pub time_base: Rational,
}

pub struct FrameConverter {
    scaler: Scaler,
    resampler: Resampler,
    video_frame: Option<frame::Video>,
    audio_frame: Option<frame::Audio>,
    frame_index: i64,
    samples_emitted: i64,
    session_start: Option<Instant>,
}

impl FrameConverter {
    pub fn new() -> Self {
        Self {
            scaler: Scaler::new(),
            resampler: Resampler::new(),
            video_frame: None,
            audio_frame: None,
            frame_index: 0,
            samples_emitted: 0,
            session_start: None,
        }
    }

    pub fn frame_index(&self) -> i64 {
        self.frame_index
    }

    pub fn samples_emitted(&self) -> i64 {
        self.samples_emitted
    }

    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    pub fn resampler(&self) -> &Resampler {
        &self.resampler
    }

    /// Starts a new timestamp timeline. Cached transforms are kept.
    pub fn reset(&mut self) {
        self.frame_index = 0;
        self.samples_emitted = 0;
        self.session_start = Some(Instant::now());
        self.resampler.discard();
    }

    /// Scales and converts one video frame. `pts` follows the frame index at
    /// the target frame rate; `pkt_dts` carries wall-clock time since the
    /// session started.
    pub fn convert_video(
        &mut self,
        target: &VideoTarget,
        source: &VideoSourceFrame<'_>,
    ) -> Result<&frame::Video> {
        let src_format = source.format.to_pixel().ok_or_else(|| {
            StreamError::UnsupportedFormat(format!("{:?} has no pixel mapping", source.format))
        })?;
        let planes = match &source.data {
            VideoData::Packed { buffer, stride } => {
                source
                    .format
                    .split_planes(buffer, *stride, source.width, source.height)?
            }
            VideoData::Planes(planes) => *planes,
        };
        let frame_period = frame_period(target)?;
        let start = *self.session_start.get_or_insert_with(Instant::now);

        let key = ScaleKey {
            src_format,
            src_width: source.width,
            src_height: source.height,
            dst_format: target.format,
            dst_width: target.width,
            dst_height: target.height,
        };

        let reuse = matches!(
            &self.video_frame,
            Some(f) if f.format() == target.format && f.width() == target.width && f.height() == target.height
        );
        if !reuse {
            self.video_frame = Some(frame::Video::new(
                target.format,
                target.width,
                target.height,
            ));
        }
        let Some(dst) = self.video_frame.as_mut() else {
            return Err(StreamError::Resource("video working frame missing".into()));
        };
        make_writable(dst)?;
        self.scaler.run(key, &planes, dst)?;

        let pts = self.frame_index.rescale(frame_period, target.time_base);
        let elapsed = start.elapsed().as_micros() as i64;
        let dts = elapsed.rescale(MICROSECONDS, target.time_base);
        dst.set_pts(Some(pts));
        dst.set_kind(picture::Type::None);
        unsafe {
            (*dst.as_mut_ptr()).pkt_dts = dts;
        }
        log::trace!(
            "video frame {} (seq {}) pts {} dts {}",
            self.frame_index,
            source.sequence,
            pts,
            dts
        );
        self.frame_index += 1;
        Ok(dst)
    }

    /// Feeds `source` (if any) to the resampler and returns one full encoder
    /// frame when enough samples are buffered. `None` means more input is
    /// needed.
    pub fn convert_audio(
        &mut self,
        target: &AudioTarget,
        source: Option<&AudioSourceFrame<'_>>,
    ) -> Result<Option<&frame::Audio>> {
        if let Some(source) = source {
            let key = ResampleKey {
                src_format: source.format,
                src_rate: source.sample_rate,
                src_channels: source.channels,
                dst_format: target.format,
                dst_rate: target.rate,
                dst_channels: target.channels,
            };
            self.resampler.push(key, source)?;
        }
        if self.resampler.buffered() < target.frame_size.max(1) {
            return Ok(None);
        }
        self.emit_audio(target, target.frame_size).map(Some)
    }

    /// End-of-stream drain. Returns the remaining samples as frames (the last
    /// one possibly short), then `None` on every further call.
    pub fn flush_audio(&mut self, target: &AudioTarget) -> Result<Option<&frame::Audio>> {
        self.resampler.flush()?;
        let buffered = self.resampler.buffered();
        if buffered == 0 {
            return Ok(None);
        }
        self.emit_audio(target, buffered.min(target.frame_size.max(1)))
            .map(Some)
    }

    fn emit_audio(&mut self, target: &AudioTarget, samples: usize) -> Result<&frame::Audio> {
        let reuse = matches!(
            &self.audio_frame,
            Some(f) if f.format() == target.format
                && f.samples() == samples
                && f.channels() == target.channels
        );
        if !reuse {
            let mut fresh = frame::Audio::new(
                target.format,
                samples,
                ChannelLayout::default(target.channels as i32),
            );
            fresh.set_rate(target.rate);
            self.audio_frame = Some(fresh);
        }
        let Some(dst) = self.audio_frame.as_mut() else {
            return Err(StreamError::Resource("audio working frame missing".into()));
        };
        make_writable(dst)?;
        let pulled = self.resampler.pull(samples, dst);
        if pulled != samples {
            return Err(StreamError::Conversion(format!(
                "resampler returned {} of {} samples",
                pulled, samples
            )));
        }

        let pts = self
            .samples_emitted
            .rescale(Rational(1, target.rate as i32), target.time_base);
        dst.set_pts(Some(pts));
        self.samples_emitted += samples as i64;
        Ok(dst)
    }
}

impl Default for FrameConverter {
    fn default() -> Self {
        Self::new()
    }
}

const MICROSECONDS: Rational = Rational(1, 1_000_000);

/// Duration of one frame at the target rate. Frame `n` is stamped with
/// `n * frame_period` rescaled as a whole, so fractional steps (NTSC rates)
/// never accumulate rounding error.
fn frame_period(target: &VideoTarget) -> Result<Rational> {
    let (fr, tb) = (target.frame_rate, target.time_base);
    if fr.numerator() <= 0 || fr.denominator() <= 0 || tb.numerator() <= 0 || tb.denominator() <= 0
    {
        return Err(StreamError::Conversion(format!(
            "invalid frame rate {} for time base {}",
            fr, tb
        )));
    }
    Ok(fr.invert())
}

fn make_writable(frame: &mut frame::Frame) -> Result<()> {
    let ret = unsafe { ffmpeg_next::ffi::av_frame_make_writable(frame.as_mut_ptr()) };
    if ret < 0 {
        return Err(StreamError::Resource(av_code_fmt(
            "could not make frame writable",
            ret,
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CapturedAudio, CapturedVideo, SourcePixelFormat};
    use bytes::Bytes;

    fn video_target(width: u32, height: u32) -> VideoTarget {
        VideoTarget {
            format: Pixel::YUV420P,
            width,
            height,
            frame_rate: Rational(30, 1),
            time_base: Rational(1, 90000),
        }
    }

    fn audio_target() -> AudioTarget {
        AudioTarget {
            format: Sample::F32(ffmpeg_next::format::sample::Type::Planar),
            rate: 48000,
            channels: 2,
            frame_size: 1024,
            time_base: Rational(1, 48000),
        }
    }

    fn bgra(width: u32, height: u32) -> CapturedVideo {
        let stride = width as usize * 4;
        CapturedVideo::packed(
            SourcePixelFormat::Bgra,
            width,
            height,
            stride,
            Rational(30, 1),
            Bytes::from(vec![64u8; stride * height as usize]),
        )
    }

    fn chunk(samples: usize) -> CapturedAudio {
        let stride = samples * 4;
        CapturedAudio::planar_f32(48000, 2, samples, stride, Bytes::from(vec![0u8; stride * 2]))
    }

    #[test]
    fn test_video_pts_step_is_constant() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        converter.reset();
        let target = video_target(64, 36);
        let capture = bgra(64, 36);
        let mut pts = Vec::new();
        for i in 0..6 {
            if i == 3 {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            let frame = converter.convert_video(&target, &capture.view()?)?;
            assert_eq!(frame.width(), 64);
            assert_eq!(frame.format(), Pixel::YUV420P);
            pts.push(frame.pts().unwrap_or(-1));
        }
        assert_eq!(pts, vec![0, 3000, 6000, 9000, 12000, 15000]);
        assert_eq!(converter.scaler().rebuilds(), 1);
        Ok(())
    }

    #[test]
    fn test_reset_restarts_timeline_but_keeps_transform() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let target = video_target(32, 32);
        let capture = bgra(32, 32);
        converter.convert_video(&target, &capture.view()?)?;
        converter.convert_video(&target, &capture.view()?)?;
        converter.reset();
        let pts = converter.convert_video(&target, &capture.view()?)?.pts();
        assert_eq!(pts, Some(0));
        assert_eq!(converter.frame_index(), 1);
        assert_eq!(converter.scaler().rebuilds(), 1);
        Ok(())
    }

    #[test]
    fn test_source_is_scaled_to_target_geometry() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let target = video_target(32, 18);
        let frame = converter.convert_video(&target, &bgra(64, 36).view()?)?;
        assert_eq!((frame.width(), frame.height()), (32, 18));
        Ok(())
    }

    fn packed(format: SourcePixelFormat, width: u32, height: u32, stride: usize, data: Vec<u8>) -> CapturedVideo {
        CapturedVideo::packed(format, width, height, stride, Rational(30, 1), Bytes::from(data))
    }

    /// Mid-grey frames in every packed layout a capture card may deliver.
    #[test]
    fn test_packed_layouts_convert_to_grey() -> anyhow::Result<()> {
        crate::init()?;
        let (w, h) = (32usize, 16usize);
        let p216: Vec<u8> = std::iter::repeat([0x00, 0x80])
            .take(w * h * 2)
            .flatten()
            .collect();
        let sources = [
            packed(SourcePixelFormat::Uyvy, 32, 16, w * 2, vec![128; w * 2 * h]),
            packed(SourcePixelFormat::Uyva, 32, 16, w * 2, vec![128; w * 2 * h + w * h]),
            packed(SourcePixelFormat::Nv12, 32, 16, w, vec![128; w * h * 3 / 2]),
            packed(SourcePixelFormat::I420, 32, 16, w, vec![128; w * h * 3 / 2]),
            packed(SourcePixelFormat::Yv12, 32, 16, w, vec![128; w * h * 3 / 2]),
            packed(SourcePixelFormat::P216, 32, 16, w * 2, p216),
            packed(SourcePixelFormat::Rgbx, 32, 16, w * 4, vec![128; w * 4 * h]),
        ];
        let target = video_target(32, 16);
        for source in &sources {
            let mut converter = FrameConverter::new();
            let format = source.view()?.format;
            let frame = converter.convert_video(&target, &source.view()?)?;
            let (y, u, v) = (frame.data(0)[0], frame.data(1)[0], frame.data(2)[0]);
            assert!((110..150).contains(&y), "{:?} luma {}", format, y);
            assert!((110..150).contains(&u), "{:?} cb {}", format, u);
            assert!((110..150).contains(&v), "{:?} cr {}", format, v);
        }
        Ok(())
    }

    #[test]
    fn test_yv12_chroma_order_differs_from_i420() -> anyhow::Result<()> {
        crate::init()?;
        let (w, h) = (16usize, 16usize);
        let mut data = vec![128u8; w * h];
        data.extend(std::iter::repeat_n(200u8, w * h / 4));
        data.extend(std::iter::repeat_n(60u8, w * h / 4));
        let target = video_target(16, 16);

        let mut converter = FrameConverter::new();
        let i420 = packed(SourcePixelFormat::I420, 16, 16, w, data.clone());
        let cb = converter.convert_video(&target, &i420.view()?)?.data(1)[0];
        assert!(cb > 180, "i420 cb {}", cb);

        let yv12 = packed(SourcePixelFormat::Yv12, 16, 16, w, data);
        let cb = converter.convert_video(&target, &yv12.view()?)?.data(1)[0];
        assert!(cb < 80, "yv12 cb {}", cb);
        Ok(())
    }

    #[test]
    fn test_short_stride_never_reaches_scaler() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let capture = packed(SourcePixelFormat::Bgra, 64, 4, 16, vec![0u8; 64]);
        let err = converter
            .convert_video(&video_target(64, 4), &capture.view()?)
            .unwrap_err();
        assert!(matches!(err, StreamError::Conversion(_)));
        assert_eq!(converter.scaler().rebuilds(), 0);
        assert_eq!(converter.frame_index(), 0);
        Ok(())
    }

    #[test]
    fn test_unknown_pixel_format_is_unsupported() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let capture = CapturedVideo::packed(
            SourcePixelFormat::Unknown(0x3032_5659),
            16,
            16,
            64,
            Rational(30, 1),
            Bytes::from(vec![0u8; 1024]),
        );
        let err = converter
            .convert_video(&video_target(16, 16), &capture.view()?)
            .unwrap_err();
        assert!(matches!(err, StreamError::UnsupportedFormat(_)));
        assert_eq!(converter.frame_index(), 0);
        Ok(())
    }

    #[test]
    fn test_audio_frames_have_fixed_size_until_flush() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let target = audio_target();
        let audio = chunk(480);
        let mut sizes = Vec::new();
        let mut pts = Vec::new();
        for _ in 0..5 {
            if let Some(frame) = converter.convert_audio(&target, Some(&audio.view()?))? {
                sizes.push(frame.samples());
                pts.push(frame.pts().unwrap_or(-1));
            }
            while let Some(frame) = converter.convert_audio(&target, None)? {
                sizes.push(frame.samples());
                pts.push(frame.pts().unwrap_or(-1));
            }
        }
        assert_eq!(sizes, vec![1024, 1024]);
        assert_eq!(pts, vec![0, 1024]);

        let last = converter.flush_audio(&target)?.map(|f| (f.samples(), f.pts()));
        assert_eq!(last, Some((2400 - 2048, Some(2048))));
        assert!(converter.flush_audio(&target)?.is_none());
        assert!(converter.flush_audio(&target)?.is_none());
        assert_eq!(converter.samples_emitted(), 2400);
        Ok(())
    }

    #[test]
    fn test_audio_poll_without_input_yields_nothing() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        assert!(converter.convert_audio(&audio_target(), None)?.is_none());
        assert!(converter.flush_audio(&audio_target())?.is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_frame_rate_is_rejected() {
        let mut target = video_target(16, 16);
        target.frame_rate = Rational(0, 1);
        assert!(frame_period(&target).is_err());
        assert_eq!(frame_period(&video_target(16, 16)).unwrap(), Rational(1, 30));
    }

    #[test]
    fn test_ntsc_rate_does_not_drift() -> anyhow::Result<()> {
        crate::init()?;
        let mut converter = FrameConverter::new();
        let mut target = video_target(16, 16);
        target.frame_rate = Rational(24000, 1001);
        let capture = bgra(16, 16);

        // 3753.75 ticks per frame at 1/90000
        let mut pts = Vec::new();
        for _ in 0..5 {
            pts.push(converter.convert_video(&target, &capture.view()?)?.pts());
        }
        assert_eq!(pts[4], Some(15015));
        assert!(pts.windows(2).all(|w| w[0] < w[1]));

        // one hour in: 86400 frames land exactly on 3600.0 * 1.001 s
        converter.frame_index = 86_400;
        let pts = converter.convert_video(&target, &capture.view()?)?.pts();
        assert_eq!(pts, Some(324_324_000));

        target.frame_rate = Rational(60000, 1001);
        converter.frame_index = 2;
        let pts = converter.convert_video(&target, &capture.view()?)?.pts();
        assert_eq!(pts, Some(3003));
        Ok(())
    }
}
