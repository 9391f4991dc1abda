use bytes::Bytes;
use ffmpeg_next::{Rational, format::Pixel, format::Sample};

use crate::error::{Result, StreamError, av_code_fmt};

pub const MAX_VIDEO_PLANES: usize = 4;
pub const MAX_AUDIO_CHANNELS: usize = 8;

/// Borrowed plane (or channel) views with a fixed capacity of `N`.
#[derive(Clone, Copy)]
pub struct Planes<'a, const N: usize> {
    data: [&'a [u8]; N],
    strides: [usize; N],
    count: usize,
}

impl<'a, const N: usize> Planes<'a, N> {
    pub fn new() -> Self {
        Self {
            data: [&[]; N],
            strides: [0; N],
            count: 0,
        }
    }

    pub fn push(&mut self, data: &'a [u8], stride: usize) -> Result<()> {
        if self.count == N {
            return Err(StreamError::Conversion(format!(
                "too many planes, at most {} supported",
                N
            )));
        }
        self.data[self.count] = data;
        self.strides[self.count] = stride;
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<(&'a [u8], usize)> {
        if index < self.count {
            Some((self.data[index], self.strides[index]))
        } else {
            None
        }
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        if a < self.count && b < self.count {
            self.data.swap(a, b);
            self.strides.swap(a, b);
        }
    }

    /// Raw pointers for the backend; unused slots are null.
    pub fn pointers(&self) -> [*const u8; N] {
        let mut out = [std::ptr::null(); N];
        for (i, plane) in self.data.iter().take(self.count).enumerate() {
            out[i] = plane.as_ptr();
        }
        out
    }

    pub fn strides(&self) -> [i32; N] {
        let mut out = [0i32; N];
        for (i, stride) in self.strides.iter().take(self.count).enumerate() {
            out[i] = *stride as i32;
        }
        out
    }
}

impl<const N: usize> Default for Planes<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

pub type VideoPlanes<'a> = Planes<'a, MAX_VIDEO_PLANES>;
pub type AudioPlanes<'a> = Planes<'a, MAX_AUDIO_CHANNELS>;

/// Pixel layouts a capture device may hand over. Packed variants follow the
/// usual FourCC naming; `Native` carries frames that were already decoded by
/// ffmpeg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePixelFormat {
    Uyvy,
    /// UYVY followed by an alpha plane; alpha is dropped.
    Uyva,
    Bgra,
    Bgrx,
    Rgba,
    Rgbx,
    I420,
    /// I420 with the chroma planes swapped.
    Yv12,
    Nv12,
    P216,
    /// P216 followed by an alpha plane; alpha is dropped.
    Pa16,
    Native(Pixel),
    Unknown(u32),
}

impl SourcePixelFormat {
    /// Maps to the converter's pixel format space.
    pub fn to_pixel(self) -> Option<Pixel> {
        let pixel = match self {
            SourcePixelFormat::Uyvy | SourcePixelFormat::Uyva => Pixel::UYVY422,
            SourcePixelFormat::Bgra => Pixel::BGRA,
            SourcePixelFormat::Bgrx => Pixel::BGRZ,
            SourcePixelFormat::Rgba => Pixel::RGBA,
            SourcePixelFormat::Rgbx => Pixel::RGBZ,
            SourcePixelFormat::I420 | SourcePixelFormat::Yv12 => Pixel::YUV420P,
            SourcePixelFormat::Nv12 => Pixel::NV12,
            SourcePixelFormat::P216 | SourcePixelFormat::Pa16 => Pixel::P216LE,
            SourcePixelFormat::Native(Pixel::None) => return None,
            SourcePixelFormat::Native(pixel) => pixel,
            SourcePixelFormat::Unknown(_) => return None,
        };
        Some(pixel)
    }

    /// Splits a contiguous buffer into plane views. `stride` is the byte
    /// length of one row of the first plane; every row must hold at least
    /// what the scaler reads for `width` pixels.
    pub fn split_planes<'a>(
        self,
        buffer: &'a [u8],
        stride: usize,
        width: u32,
        height: u32,
    ) -> Result<VideoPlanes<'a>> {
        let rows = height as usize;
        let half_rows = rows.div_ceil(2);
        let half_stride = stride.div_ceil(2);
        // (row length, rows) per plane
        let layout: &[(usize, usize)] = match self {
            SourcePixelFormat::Uyvy
            | SourcePixelFormat::Uyva
            | SourcePixelFormat::Bgra
            | SourcePixelFormat::Bgrx
            | SourcePixelFormat::Rgba
            | SourcePixelFormat::Rgbx => &[(stride, rows)],
            SourcePixelFormat::I420 | SourcePixelFormat::Yv12 => &[
                (stride, rows),
                (half_stride, half_rows),
                (half_stride, half_rows),
            ],
            SourcePixelFormat::Nv12 => &[(stride, rows), (stride, half_rows)],
            SourcePixelFormat::P216 | SourcePixelFormat::Pa16 => &[(stride, rows), (stride, rows)],
            other => {
                return Err(StreamError::UnsupportedFormat(format!(
                    "{:?} has no packed layout",
                    other
                )));
            }
        };
        if width == 0 || height == 0 {
            return Err(StreamError::Conversion(format!(
                "{:?} frame has empty geometry {}x{}",
                self, width, height
            )));
        }
        let min_rows = self.min_linesizes(width)?;

        let mut planes = VideoPlanes::new();
        let mut offset = 0usize;
        for (i, &(row_len, plane_rows)) in layout.iter().enumerate() {
            if row_len < min_rows[i] {
                return Err(StreamError::Conversion(format!(
                    "{:?} plane {} stride {} is below {} bytes for width {}",
                    self, i, row_len, min_rows[i], width
                )));
            }
            let len = row_len * plane_rows;
            let end = offset + len;
            if end > buffer.len() {
                return Err(StreamError::Conversion(format!(
                    "{:?} frame needs {} bytes, buffer has {}",
                    self,
                    end,
                    buffer.len()
                )));
            }
            planes.push(&buffer[offset..end], row_len)?;
            offset = end;
        }
        if self == SourcePixelFormat::Yv12 {
            planes.swap(1, 2);
        }
        Ok(planes)
    }

    /// Bytes per row the backend reads from each plane for `width` pixels.
    fn min_linesizes(self, width: u32) -> Result<[usize; MAX_VIDEO_PLANES]> {
        let pixel = self.to_pixel().ok_or_else(|| {
            StreamError::UnsupportedFormat(format!("{:?} has no pixel mapping", self))
        })?;
        let mut linesizes = [0i32; MAX_VIDEO_PLANES];
        let ret = unsafe {
            ffmpeg_next::ffi::av_image_fill_linesizes(
                linesizes.as_mut_ptr(),
                pixel.into(),
                width as i32,
            )
        };
        if ret < 0 {
            return Err(StreamError::Conversion(av_code_fmt(
                "could not compute line sizes",
                ret,
            )));
        }
        Ok(linesizes.map(|l| l.max(0) as usize))
    }
}

pub enum VideoData<'a> {
    /// One contiguous buffer, split according to the pixel format.
    Packed { buffer: &'a [u8], stride: usize },
    Planes(VideoPlanes<'a>),
}

/// A captured video frame as seen by the converter for one call.
pub struct VideoSourceFrame<'a> {
    pub format: SourcePixelFormat,
    pub data: VideoData<'a>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
    pub sequence: u64,
}

/// A captured audio chunk as seen by the converter for one call.
pub struct AudioSourceFrame<'a> {
    pub planes: AudioPlanes<'a>,
    pub format: Sample,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: usize,
    pub sequence: u64,
}

pub enum VideoPayload {
    Packed {
        data: Bytes,
        stride: usize,
        format: SourcePixelFormat,
    },
    Frame(ffmpeg_next::frame::Video),
}

/// Owned video frame handed out by a capture source.
pub struct CapturedVideo {
    payload: VideoPayload,
    width: u32,
    height: u32,
    frame_rate: Rational,
    sequence: u64,
}

impl CapturedVideo {
    pub fn packed(
        format: SourcePixelFormat,
        width: u32,
        height: u32,
        stride: usize,
        frame_rate: Rational,
        data: Bytes,
    ) -> Self {
        Self {
            payload: VideoPayload::Packed {
                data,
                stride,
                format,
            },
            width,
            height,
            frame_rate,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn view(&self) -> Result<VideoSourceFrame<'_>> {
        let (format, data) = match &self.payload {
            VideoPayload::Packed {
                data,
                stride,
                format,
            } => (
                *format,
                VideoData::Packed {
                    buffer: data,
                    stride: *stride,
                },
            ),
            VideoPayload::Frame(frame) => {
                let mut planes = VideoPlanes::new();
                for i in 0..frame.planes() {
                    planes.push(frame.data(i), frame.stride(i))?;
                }
                (
                    SourcePixelFormat::Native(frame.format()),
                    VideoData::Planes(planes),
                )
            }
        };

        Ok(VideoSourceFrame {
            format,
            data,
            width: self.width,
            height: self.height,
            frame_rate: self.frame_rate,
            sequence: self.sequence,
        })
    }
}

impl From<(ffmpeg_next::frame::Video, Rational)> for CapturedVideo {
    fn from((frame, frame_rate): (ffmpeg_next::frame::Video, Rational)) -> Self {
        Self {
            width: frame.width(),
            height: frame.height(),
            payload: VideoPayload::Frame(frame),
            frame_rate,
            sequence: 0,
        }
    }
}

pub enum AudioPayload {
    /// Channel-contiguous samples; planar formats put channel `n` at
    /// `n * channel_stride`.
    Contiguous {
        data: Bytes,
        format: Sample,
        channel_stride: usize,
    },
    Frame(ffmpeg_next::frame::Audio),
}

/// Owned audio chunk handed out by a capture source.
pub struct CapturedAudio {
    payload: AudioPayload,
    sample_rate: u32,
    channels: u16,
    samples: usize,
    sequence: u64,
}

impl CapturedAudio {
    /// Planar 32-bit float samples, the layout most capture SDKs use.
    pub fn planar_f32(
        sample_rate: u32,
        channels: u16,
        samples: usize,
        channel_stride: usize,
        data: Bytes,
    ) -> Self {
        Self {
            payload: AudioPayload::Contiguous {
                data,
                format: Sample::F32(ffmpeg_next::format::sample::Type::Planar),
                channel_stride,
            },
            sample_rate,
            channels,
            samples,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn view(&self) -> Result<AudioSourceFrame<'_>> {
        if self.channels == 0 || self.channels as usize > MAX_AUDIO_CHANNELS {
            return Err(StreamError::Conversion(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        let mut planes = AudioPlanes::new();
        let format = match &self.payload {
            AudioPayload::Contiguous {
                data,
                format,
                channel_stride,
            } => {
                let plane_len = if format.is_planar() {
                    self.samples * format.bytes()
                } else {
                    self.samples * format.bytes() * self.channels as usize
                };
                let plane_count = if format.is_planar() {
                    self.channels as usize
                } else {
                    1
                };
                for ch in 0..plane_count {
                    let start = ch * channel_stride;
                    let end = start + plane_len;
                    if end > data.len() {
                        return Err(StreamError::Conversion(format!(
                            "audio chunk needs {} bytes, buffer has {}",
                            end,
                            data.len()
                        )));
                    }
                    planes.push(&data[start..end], plane_len)?;
                }
                *format
            }
            AudioPayload::Frame(frame) => {
                for i in 0..frame.planes() {
                    let plane = frame.data(i);
                    planes.push(plane, plane.len())?;
                }
                frame.format()
            }
        };

        Ok(AudioSourceFrame {
            planes,
            format,
            sample_rate: self.sample_rate,
            channels: self.channels,
            samples: self.samples,
            sequence: self.sequence,
        })
    }
}

impl From<ffmpeg_next::frame::Audio> for CapturedAudio {
    fn from(frame: ffmpeg_next::frame::Audio) -> Self {
        Self {
            sample_rate: frame.rate(),
            channels: frame.channels(),
            samples: frame.samples(),
            payload: AudioPayload::Frame(frame),
            sequence: 0,
        }
    }
}

/// Result of one bounded capture call.
pub enum Captured {
    Video(CapturedVideo),
    Audio(CapturedAudio),
    /// Nothing arrived within the timeout; not an error.
    Timeout,
}
