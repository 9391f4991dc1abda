use ffmpeg_next::{
    format::Pixel,
    software::scaling::{Context, Flags},
};

use crate::{
    error::{Result, StreamError, av_code_fmt},
    frame::VideoPlanes,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleKey {
    pub src_format: Pixel,
    pub src_width: u32,
    pub src_height: u32,
    pub dst_format: Pixel,
    pub dst_width: u32,
    pub dst_height: u32,
}

/// Cached pixel-format + size conversion. The backend context is rebuilt
/// only when the key changes.
pub struct Scaler {
    context: Option<(ScaleKey, Context)>,
    rebuilds: u64,
}

impl Scaler {
    pub fn new() -> Self {
        Self {
            context: None,
            rebuilds: 0,
        }
    }

    /// How many times a backend context has been built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn context_for(&mut self, key: ScaleKey) -> Result<&mut Context> {
        let stale = !matches!(&self.context, Some((cached, _)) if *cached == key);
        if stale {
            log::debug!("building scale transform: {:?}", key);
            let context = Context::get(
                key.src_format,
                key.src_width,
                key.src_height,
                key.dst_format,
                key.dst_width,
                key.dst_height,
                Flags::BICUBIC,
            )
            .map_err(|e| StreamError::resource("could not create scale context", e))?;
            self.context = Some((key, context));
            self.rebuilds += 1;
        }
        match self.context.as_mut() {
            Some((_, context)) => Ok(context),
            None => Err(StreamError::Resource("scale context missing".to_string())),
        }
    }

    /// Converts `src` planes into `dst` in one pass. `dst` must already be
    /// allocated with the key's destination format and size.
    pub fn run(
        &mut self,
        key: ScaleKey,
        src: &VideoPlanes<'_>,
        dst: &mut ffmpeg_next::frame::Video,
    ) -> Result<()> {
        let context = self.context_for(key)?;
        let src_ptrs = src.pointers();
        let src_strides = src.strides();
        let ret = unsafe {
            let dst_ptr = dst.as_mut_ptr();
            ffmpeg_next::ffi::sws_scale(
                context.as_mut_ptr(),
                src_ptrs.as_ptr() as _,
                src_strides.as_ptr(),
                0,
                key.src_height as i32,
                (*dst_ptr).data.as_ptr() as _,
                (*dst_ptr).linesize.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(StreamError::Conversion(av_code_fmt(
                "error scaling frame",
                ret,
            )));
        }
        Ok(())
    }
}

impl Default for Scaler {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Scaler {}
