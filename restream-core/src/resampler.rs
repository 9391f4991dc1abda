use ffmpeg_next::{ChannelLayout, ffi, format::Sample, frame, software::resampling::Context};

use crate::{
    error::{Result, StreamError, av_code_fmt},
    frame::AudioSourceFrame,
};

/// Input channel layouts are normalised to the default layout for their
/// channel count, so the key only tracks counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResampleKey {
    pub src_format: Sample,
    pub src_rate: u32,
    pub src_channels: u16,
    pub dst_format: Sample,
    pub dst_rate: u32,
    pub dst_channels: u16,
}

/// Resampled samples waiting to be cut into encoder-sized frames, kept in
/// libavutil's audio FIFO.
struct AudioFifo {
    ptr: *mut ffi::AVAudioFifo,
    format: Sample,
    channels: u16,
}

impl AudioFifo {
    fn new(format: Sample, channels: u16) -> Result<Self> {
        let ptr = unsafe { ffi::av_audio_fifo_alloc(format.into(), channels as i32, 1) };
        if ptr.is_null() {
            return Err(StreamError::Resource(
                "could not allocate audio fifo".to_string(),
            ));
        }
        Ok(Self {
            ptr,
            format,
            channels,
        })
    }

    fn matches(&self, format: Sample, channels: u16) -> bool {
        self.format == format && self.channels == channels
    }

    fn len(&self) -> usize {
        unsafe { ffi::av_audio_fifo_size(self.ptr) }.max(0) as usize
    }

    fn write(&mut self, src: &frame::Audio, samples: usize) -> Result<()> {
        if samples == 0 {
            return Ok(());
        }
        let ret = unsafe {
            ffi::av_audio_fifo_write(self.ptr, (*src.as_ptr()).extended_data as _, samples as i32)
        };
        if ret < 0 {
            return Err(StreamError::Conversion(av_code_fmt(
                "could not queue resampled audio",
                ret,
            )));
        }
        if ret as usize != samples {
            return Err(StreamError::Conversion(format!(
                "audio fifo took {} of {} samples",
                ret, samples
            )));
        }
        Ok(())
    }

    fn read(&mut self, dst: &mut frame::Audio, samples: usize) -> usize {
        let ret = unsafe {
            ffi::av_audio_fifo_read(self.ptr, (*dst.as_mut_ptr()).extended_data as _, samples as i32)
        };
        ret.max(0) as usize
    }

    fn reset(&mut self) {
        unsafe { ffi::av_audio_fifo_reset(self.ptr) }
    }
}

impl Drop for AudioFifo {
    fn drop(&mut self) {
        unsafe { ffi::av_audio_fifo_free(self.ptr) }
    }
}

/// Persistent audio resample transform plus its output backlog.
pub struct Resampler {
    context: Option<(ResampleKey, Context)>,
    fifo: Option<AudioFifo>,
    /// swr output lands here before it is queued
    scratch: Option<frame::Audio>,
    flushed: bool,
    rebuilds: u64,
}

impl Resampler {
    pub fn new() -> Self {
        Self {
            context: None,
            fifo: None,
            scratch: None,
            flushed: false,
            rebuilds: 0,
        }
    }

    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn is_initialized(&self) -> bool {
        self.context.is_some()
    }

    /// Samples ready to be pulled.
    pub fn buffered(&self) -> usize {
        self.fifo.as_ref().map(AudioFifo::len).unwrap_or(0)
    }

    fn ensure_context(&mut self, key: ResampleKey) -> Result<()> {
        let fresh = matches!(&self.context, Some((cached, _)) if *cached == key);
        if fresh && !self.flushed {
            return Ok(());
        }
        log::debug!("building resample transform: {:?}", key);
        let context = Context::get(
            key.src_format,
            ChannelLayout::default(key.src_channels as i32),
            key.src_rate,
            key.dst_format,
            ChannelLayout::default(key.dst_channels as i32),
            key.dst_rate,
        )
        .map_err(|e| StreamError::conversion("could not create resample context", e))?;

        // keep the backlog when only the source side changed
        let keep_fifo = matches!(&self.fifo, Some(fifo) if fifo.matches(key.dst_format, key.dst_channels));
        if !keep_fifo {
            self.fifo = Some(AudioFifo::new(key.dst_format, key.dst_channels)?);
            self.scratch = None;
        }
        self.context = Some((key, context));
        self.flushed = false;
        self.rebuilds += 1;
        Ok(())
    }

    /// Feeds one input chunk; all available output lands in the backlog.
    pub fn push(&mut self, key: ResampleKey, input: &AudioSourceFrame<'_>) -> Result<()> {
        self.ensure_context(key)?;
        let in_ptrs = input.planes.pointers();
        self.convert_into_fifo(in_ptrs.as_ptr(), input.samples as i32)
    }

    /// Drains the transform's internal delay into the backlog (end of stream).
    pub fn flush(&mut self) -> Result<()> {
        if self.context.is_none() || self.flushed {
            return Ok(());
        }
        self.convert_into_fifo(std::ptr::null(), 0)?;
        self.flushed = true;
        Ok(())
    }

    /// A scratch frame with room for at least `samples`.
    fn scratch_for(&mut self, key: ResampleKey, samples: usize) -> &mut frame::Audio {
        let reuse = matches!(&self.scratch, Some(f) if f.samples() >= samples);
        if !reuse {
            self.scratch = Some(frame::Audio::new(
                key.dst_format,
                samples.max(1),
                ChannelLayout::default(key.dst_channels as i32),
            ));
        }
        self.scratch.get_or_insert_with(frame::Audio::empty)
    }

    fn convert_into_fifo(&mut self, in_ptrs: *const *const u8, in_samples: i32) -> Result<()> {
        let (key, capacity) = match self.context.as_mut() {
            Some((key, context)) => (*key, unsafe {
                ffi::swr_get_out_samples(context.as_mut_ptr(), in_samples.max(0))
            }),
            None => {
                return Err(StreamError::Conversion(
                    "resample transform not initialised".to_string(),
                ));
            }
        };
        if capacity < 0 {
            return Err(StreamError::Conversion(av_code_fmt(
                "error converting frame",
                capacity,
            )));
        }
        // the flush tail can exceed the estimate
        let capacity = capacity as usize + if in_ptrs.is_null() { 256 } else { 0 };
        let scratch = self.scratch_for(key, capacity);
        let out_ptrs = unsafe { (*scratch.as_mut_ptr()).extended_data };

        let (Some((_, context)), Some(fifo), Some(scratch)) =
            (self.context.as_mut(), self.fifo.as_mut(), self.scratch.as_ref())
        else {
            return Err(StreamError::Conversion(
                "resample transform not initialised".to_string(),
            ));
        };
        let ret = unsafe {
            ffi::swr_convert(
                context.as_mut_ptr(),
                out_ptrs as _,
                capacity as i32,
                in_ptrs as _,
                in_samples,
            )
        };
        if ret < 0 {
            return Err(StreamError::Conversion(av_code_fmt(
                "error converting frame",
                ret,
            )));
        }
        fifo.write(scratch, ret as usize)
    }

    /// Moves up to `samples` from the backlog into `dst`; returns how many.
    pub fn pull(&mut self, samples: usize, dst: &mut frame::Audio) -> usize {
        match self.fifo.as_mut() {
            Some(fifo) => fifo.read(dst, samples),
            None => 0,
        }
    }

    /// Drops buffered output and the transform's pending delay, keeping the
    /// transform itself.
    pub fn discard(&mut self) {
        if let Some(fifo) = self.fifo.as_mut() {
            fifo.reset();
        }
        if let Some((_, context)) = self.context.as_mut() {
            let ret = unsafe { ffi::swr_init(context.as_mut_ptr()) };
            if ret < 0 {
                log::warn!("{}", av_code_fmt("could not reset resample transform", ret));
                self.context = None;
            }
        }
        self.flushed = false;
    }
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Resampler {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::CapturedAudio;
    use bytes::Bytes;

    fn fltp() -> Sample {
        Sample::F32(ffmpeg_next::format::sample::Type::Planar)
    }

    fn key(src_rate: u32) -> ResampleKey {
        ResampleKey {
            src_format: fltp(),
            src_rate,
            src_channels: 2,
            dst_format: fltp(),
            dst_rate: 48000,
            dst_channels: 2,
        }
    }

    fn chunk(samples: usize, rate: u32) -> CapturedAudio {
        let stride = samples * 4;
        CapturedAudio::planar_f32(rate, 2, samples, stride, Bytes::from(vec![0u8; stride * 2]))
    }

    #[test]
    fn test_same_rate_passes_samples_through() -> anyhow::Result<()> {
        crate::init()?;
        let mut resampler = Resampler::new();
        let audio = chunk(480, 48000);
        resampler.push(key(48000), &audio.view()?)?;
        resampler.push(key(48000), &audio.view()?)?;
        assert_eq!(resampler.buffered(), 960);
        assert_eq!(resampler.rebuilds(), 1);

        let mut dst = ffmpeg_next::frame::Audio::new(fltp(), 600, ChannelLayout::STEREO);
        assert_eq!(resampler.pull(600, &mut dst), 600);
        assert_eq!(resampler.buffered(), 360);
        Ok(())
    }

    #[test]
    fn test_rate_change_rebuilds_transform() -> anyhow::Result<()> {
        crate::init()?;
        let mut resampler = Resampler::new();
        resampler.push(key(48000), &chunk(480, 48000).view()?)?;
        resampler.push(key(44100), &chunk(441, 44100).view()?)?;
        assert_eq!(resampler.rebuilds(), 2);
        resampler.flush()?;
        // 480 passthrough + ~480 resampled
        let total = resampler.buffered();
        assert!((900..1100).contains(&total), "buffered {}", total);
        Ok(())
    }

    #[test]
    fn test_samples_come_out_in_order() -> anyhow::Result<()> {
        crate::init()?;
        let mut resampler = Resampler::new();
        let samples = 256usize;
        let mut bytes = Vec::with_capacity(samples * 8);
        for ch in 0..2 {
            for i in 0..samples {
                let v = (ch * 1000 + i) as f32 / 4096.0;
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
        }
        let audio = CapturedAudio::planar_f32(48000, 2, samples, samples * 4, Bytes::from(bytes));
        resampler.push(key(48000), &audio.view()?)?;

        let mut dst = ffmpeg_next::frame::Audio::new(fltp(), 100, ChannelLayout::STEREO);
        resampler.pull(100, &mut dst);
        let mut dst = ffmpeg_next::frame::Audio::new(fltp(), 100, ChannelLayout::STEREO);
        assert_eq!(resampler.pull(100, &mut dst), 100);
        let right = dst.plane::<f32>(1);
        assert_eq!(right[0], 1100.0 / 4096.0);
        assert_eq!(resampler.buffered(), 56);
        Ok(())
    }

    #[test]
    fn test_discard_drops_backlog_and_pending_delay() -> anyhow::Result<()> {
        crate::init()?;
        let mut resampler = Resampler::new();
        resampler.push(key(44100), &chunk(441, 44100).view()?)?;
        assert!(resampler.buffered() > 0);
        resampler.discard();
        assert_eq!(resampler.buffered(), 0);
        assert!(resampler.is_initialized());

        // nothing from before the discard is left to drain
        resampler.flush()?;
        assert_eq!(resampler.buffered(), 0);
        assert_eq!(resampler.rebuilds(), 1);
        Ok(())
    }

    #[test]
    fn test_flush_without_input_is_noop() -> anyhow::Result<()> {
        let mut resampler = Resampler::new();
        resampler.flush()?;
        assert_eq!(resampler.buffered(), 0);
        assert!(!resampler.is_initialized());
        Ok(())
    }
}
