use std::{
    ffi::{CString, c_int, c_void},
    path::Path,
    sync::mpsc::{Receiver, RecvTimeoutError, SyncSender},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use ffmpeg_next::{Dictionary, Rational, codec, ffi, format, media};
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{SourceCapture, SourceDescriptor},
    device,
    error::{Result, StreamError},
    frame::{Captured, CapturedAudio, CapturedVideo},
    supervisor::wait_or_cancel,
};

/// Decoded frames waiting for the supervisor. Small so a stalled consumer
/// applies back-pressure to the demuxer instead of buffering.
const FRAME_QUEUE_BOUND: usize = 16;
/// Pause before reopening a failed or finished input.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const FALLBACK_FRAME_RATE: Rational = Rational(30, 1);
/// How long `disconnect` waits for the worker before detaching it.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const WORKER_JOIN_POLL: Duration = Duration::from_millis(10);

/// ffmpeg-backed capture: demux and decode on a worker thread, hand frames
/// over a bounded channel.
pub struct FfmpegCapture {
    receiver: Option<Receiver<Captured>>,
    worker: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

impl FfmpegCapture {
    pub fn new() -> Self {
        Self {
            receiver: None,
            worker: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.receiver.is_some()
    }

    /// Stops the worker and waits for it to release the device. Returns
    /// `false` when the worker had to be detached.
    pub fn disconnect(&mut self) -> bool {
        self.stop.cancel();
        // unblocks a worker parked on a full queue
        self.receiver = None;
        let Some(worker) = self.worker.take() else {
            return true;
        };
        let deadline = Instant::now() + WORKER_JOIN_TIMEOUT;
        while !worker.is_finished() {
            if Instant::now() >= deadline {
                log::warn!("capture worker did not stop in time, detaching it");
                return false;
            }
            std::thread::sleep(WORKER_JOIN_POLL);
        }
        if worker.join().is_err() {
            log::warn!("capture worker panicked");
        }
        true
    }
}

impl Default for FfmpegCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FfmpegCapture {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl SourceCapture for FfmpegCapture {
    fn discover(&mut self) -> Result<Vec<SourceDescriptor>> {
        Ok(device::discover_sources())
    }

    fn connect(&mut self, source: &SourceDescriptor) -> Result<()> {
        self.disconnect();
        // fail fast on a bad source; later failures are retried by the worker
        let stop = CancellationToken::new();
        let demuxer = Demuxer::open(source, &stop)?;

        let (tx, rx) = std::sync::mpsc::sync_channel(FRAME_QUEUE_BOUND);
        let worker_stop = stop.clone();
        let worker_source = source.clone();
        let worker = std::thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || capture_loop(demuxer, worker_source, tx, worker_stop))
            .map_err(|e| StreamError::Capture(format!("could not start capture thread: {}", e)))?;

        log::info!("capture connected: {}", source);
        self.stop = stop;
        self.receiver = Some(rx);
        self.worker = Some(worker);
        Ok(())
    }

    fn capture(&mut self, timeout: Duration) -> Result<Captured> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Err(StreamError::Capture("capture not connected".to_string()));
        };
        match receiver.recv_timeout(timeout) {
            Ok(captured) => Ok(captured),
            Err(RecvTimeoutError::Timeout) => Ok(Captured::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(StreamError::Capture("capture worker stopped".to_string()))
            }
        }
    }
}

struct Demuxer {
    input: format::context::Input,
    video: Option<(usize, codec::decoder::Video, Rational)>,
    audio: Option<(usize, codec::decoder::Audio)>,
    /// Read by the interrupt callback; declared after `input` so it outlives it.
    _interrupt: Box<CancellationToken>,
}

/// `AVIOInterruptCB` hook: aborts blocking demuxer I/O once the token fires.
unsafe extern "C" fn interrupt_requested(opaque: *mut c_void) -> c_int {
    if opaque.is_null() {
        return 0;
    }
    let token = unsafe { &*(opaque as *const CancellationToken) };
    token.is_cancelled() as c_int
}

impl Demuxer {
    /// Resolve input format by name (e.g. "v4l2", "lavfi") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> Result<format::format::Input> {
        let cname = CString::new(name).map_err(|e| {
            StreamError::Configuration(format!("invalid format name {:?}: {}", name, e))
        })?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(StreamError::Configuration(format!(
                "input format not found: {}",
                name
            )));
        }
        Ok(unsafe { format::format::Input::wrap(ptr as *mut _) })
    }

    fn open(source: &SourceDescriptor, stop: &CancellationToken) -> Result<Self> {
        let dict = Dictionary::new();
        let path = Path::new(&source.url);
        let mut input = match source.format.as_deref() {
            Some(name) => {
                let fmt = Self::find_input_format(name)?;
                format::open_with(path, &format::format::Format::Input(fmt), dict)
                    .map_err(|e| StreamError::io(&format!("could not open {}", source.url), e))?
                    .input()
            }
            None => format::input_with_dictionary(path, dict)
                .map_err(|e| StreamError::io(&format!("could not open {}", source.url), e))?,
        };

        let video = match input.streams().best(media::Type::Video) {
            Some(stream) => {
                let rate = match stream.avg_frame_rate() {
                    r if r.numerator() > 0 && r.denominator() > 0 => r,
                    _ => match stream.rate() {
                        r if r.numerator() > 0 && r.denominator() > 0 => r,
                        _ => FALLBACK_FRAME_RATE,
                    },
                };
                let decoder = decoder_context(&stream)?
                    .decoder()
                    .video()
                    .map_err(|e| StreamError::resource("could not open video decoder", e))?;
                Some((stream.index(), decoder, rate))
            }
            None => None,
        };
        let Some(video) = video else {
            return Err(StreamError::Capture(format!(
                "{} has no video stream",
                source.url
            )));
        };

        let audio = match input.streams().best(media::Type::Audio) {
            Some(stream) => {
                let decoder = decoder_context(&stream)?
                    .decoder()
                    .audio()
                    .map_err(|e| StreamError::resource("could not open audio decoder", e))?;
                Some((stream.index(), decoder))
            }
            None => {
                log::warn!("{} has no audio stream", source.url);
                None
            }
        };

        let interrupt = Box::new(stop.clone());
        unsafe {
            (*input.as_mut_ptr()).interrupt_callback = ffi::AVIOInterruptCB {
                callback: Some(interrupt_requested),
                opaque: &*interrupt as *const CancellationToken as *mut c_void,
            };
        }

        Ok(Self {
            input,
            video: Some(video),
            audio,
            _interrupt: interrupt,
        })
    }

    /// Reads one packet and returns every frame it decoded to. `Err` ends
    /// this connection.
    fn read(&mut self, sequence: &mut u64) -> Result<Vec<Captured>> {
        let mut packet = codec::packet::Packet::empty();
        packet
            .read(&mut self.input)
            .map_err(|e| StreamError::io("error reading input", e))?;

        let mut out = Vec::new();
        let index = packet.stream();
        if let Some((video_index, decoder, rate)) = self.video.as_mut() {
            if index == *video_index {
                decoder
                    .send_packet(&packet)
                    .map_err(|e| StreamError::Capture(format!("video decode: {}", e)))?;
                let mut frame = ffmpeg_next::frame::Video::empty();
                while receive(decoder.receive_frame(&mut frame))? {
                    *sequence += 1;
                    let captured = CapturedVideo::from((frame, *rate)).with_sequence(*sequence);
                    out.push(Captured::Video(captured));
                    frame = ffmpeg_next::frame::Video::empty();
                }
            }
        }
        if let Some((audio_index, decoder)) = self.audio.as_mut() {
            if index == *audio_index {
                decoder
                    .send_packet(&packet)
                    .map_err(|e| StreamError::Capture(format!("audio decode: {}", e)))?;
                let mut frame = ffmpeg_next::frame::Audio::empty();
                while receive(decoder.receive_frame(&mut frame))? {
                    *sequence += 1;
                    let captured = CapturedAudio::from(frame).with_sequence(*sequence);
                    out.push(Captured::Audio(captured));
                    frame = ffmpeg_next::frame::Audio::empty();
                }
            }
        }
        Ok(out)
    }
}

fn decoder_context(stream: &format::stream::Stream) -> Result<codec::Context> {
    let mut ctx = codec::Context::from_parameters(stream.parameters())
        .map_err(|e| StreamError::resource("could not create decoder context", e))?;
    unsafe {
        (*ctx.as_mut_ptr()).time_base = stream.time_base().into();
    }
    Ok(ctx)
}

/// `Ok(true)` when a frame was produced.
fn receive(result: std::result::Result<(), ffmpeg_next::Error>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(ffmpeg_next::Error::Eof) => Ok(false),
        Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(false)
        }
        Err(err) => Err(StreamError::Capture(format!("decode: {}", err))),
    }
}

fn capture_loop(
    first: Demuxer,
    source: SourceDescriptor,
    tx: SyncSender<Captured>,
    stop: CancellationToken,
) {
    let mut demuxer = Some(first);
    let mut sequence = 0u64;
    while !stop.is_cancelled() {
        let current = match demuxer.as_mut() {
            Some(current) => current,
            None => match Demuxer::open(&source, &stop) {
                Ok(reopened) => {
                    log::info!("capture reconnected: {}", source);
                    demuxer.insert(reopened)
                }
                Err(e) => {
                    log::warn!("capture reconnect failed: {}", e);
                    wait_or_cancel(&stop, RECONNECT_DELAY);
                    continue;
                }
            },
        };

        match current.read(&mut sequence) {
            Ok(frames) => {
                for frame in frames {
                    if tx.send(frame).is_err() {
                        log::debug!("capture receiver gone, stopping worker");
                        return;
                    }
                }
            }
            Err(e) => {
                log::warn!("capture interrupted: {}", e);
                demuxer = None;
                wait_or_cancel(&stop, RECONNECT_DELAY);
            }
        }
    }
    log::debug!("capture worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lavfi_available() -> bool {
        Demuxer::find_input_format("lavfi").is_ok()
    }

    #[test]
    fn test_capture_requires_connect() {
        let mut capture = FfmpegCapture::new();
        let err = capture.capture(Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, StreamError::Capture(_)));
    }

    #[test]
    fn test_unknown_input_format_is_configuration_error() -> anyhow::Result<()> {
        crate::init()?;
        let mut capture = FfmpegCapture::new();
        let source = SourceDescriptor::new("whatever", Some("no-such-demuxer"));
        let err = capture.connect(&source).unwrap_err();
        assert!(!err.is_recoverable());
        assert!(!capture.is_connected());
        Ok(())
    }

    #[test]
    fn test_lavfi_testsrc_yields_video() -> anyhow::Result<()> {
        crate::init()?;
        if !lavfi_available() {
            eprintln!("skip: lavfi input device not available");
            return Ok(());
        }
        let mut capture = FfmpegCapture::new();
        capture.connect(&SourceDescriptor::new(
            "testsrc=size=320x240:rate=30",
            Some("lavfi"),
        ))?;
        let mut sequences = Vec::new();
        for _ in 0..20 {
            match capture.capture(Duration::from_secs(5))? {
                Captured::Video(video) => {
                    assert_eq!((video.width(), video.height()), (320, 240));
                    assert_eq!(video.frame_rate(), Rational(30, 1));
                    sequences.push(video.sequence());
                    if sequences.len() == 3 {
                        break;
                    }
                }
                Captured::Audio(_) | Captured::Timeout => {}
            }
        }
        assert_eq!(sequences, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn test_disconnect_joins_worker_and_allows_reconnect() -> anyhow::Result<()> {
        crate::init()?;
        if !lavfi_available() {
            eprintln!("skip: lavfi input device not available");
            return Ok(());
        }
        let source = SourceDescriptor::new("testsrc=size=160x120:rate=30", Some("lavfi"));
        let mut capture = FfmpegCapture::new();
        capture.connect(&source)?;
        // let the queue fill so the worker is parked on a send
        std::thread::sleep(Duration::from_millis(300));
        assert!(capture.disconnect());
        assert!(!capture.is_connected());
        assert!(capture.capture(Duration::from_millis(10)).is_err());

        capture.connect(&source)?;
        let mut got_video = false;
        for _ in 0..10 {
            if let Captured::Video(video) = capture.capture(Duration::from_secs(5))? {
                assert_eq!(video.sequence(), 1);
                got_video = true;
                break;
            }
        }
        assert!(got_video);
        assert!(capture.disconnect());
        Ok(())
    }

    #[test]
    fn test_interrupt_callback_follows_token() {
        let token = CancellationToken::new();
        let opaque = &token as *const CancellationToken as *mut c_void;
        assert_eq!(unsafe { interrupt_requested(opaque) }, 0);
        token.cancel();
        assert_eq!(unsafe { interrupt_requested(opaque) }, 1);
        assert_eq!(unsafe { interrupt_requested(std::ptr::null_mut()) }, 0);
    }
}
