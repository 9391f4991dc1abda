use std::time::Duration;

use ffmpeg_next::Rational;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    capture::{SourceCapture, SourceDescriptor},
    config::StreamerConfig,
    converter::{AudioTarget, FrameConverter, VideoTarget},
    error::{Result, StreamError},
    frame::{Captured, CapturedAudio, CapturedVideo},
    output::StreamOutput,
    status::{SupervisorState, SupervisorStatus},
};

/// Granularity of the interruptible cooldown.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Why a streaming session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    /// The source geometry changed; the session must be renegotiated.
    FormatChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Negotiated {
    width: u32,
    height: u32,
    frame_rate: Rational,
}

/// Drives capture, conversion and output on the calling thread until the
/// cancellation token fires.
pub struct Supervisor<C, O> {
    config: StreamerConfig,
    capture: C,
    output: O,
    converter: FrameConverter,
    cancel: CancellationToken,
    state: SupervisorState,
    negotiated: Option<Negotiated>,
    /// Reconnected after a capture failure when set.
    source: Option<SourceDescriptor>,
    capture_failed: bool,
    status: watch::Sender<SupervisorStatus>,
}

impl<C: SourceCapture, O: StreamOutput> Supervisor<C, O> {
    pub fn new(config: &StreamerConfig, capture: C, output: O, cancel: CancellationToken) -> Self {
        let (status, _) = watch::channel(SupervisorStatus::default());
        Self {
            config: config.clone(),
            capture,
            output,
            converter: FrameConverter::new(),
            cancel,
            state: SupervisorState::Idle,
            negotiated: None,
            source: None,
            capture_failed: false,
            status,
        }
    }

    /// Source to reconnect to when the capture backend fails mid-run.
    pub fn with_source(mut self, source: SourceDescriptor) -> Self {
        self.source = Some(source);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Geometry and frame rate of the current session.
    pub fn negotiated(&self) -> Option<(u32, u32, Rational)> {
        self.negotiated
            .map(|n| (n.width, n.height, n.frame_rate))
    }

    pub fn capture(&self) -> &C {
        &self.capture
    }

    pub fn output(&self) -> &O {
        &self.output
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            log::debug!("supervisor {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        self.status.send_modify(|s| s.state = state);
    }

    /// Runs until cancelled. Only a non-recoverable error ends the loop
    /// early; everything else is retried after the cooldown.
    pub fn run(&mut self) -> Result<()> {
        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.run_session() {
                Ok(SessionEnd::Cancelled) => {
                    self.set_state(SupervisorState::Closing);
                    self.output.close();
                    break Ok(());
                }
                Ok(SessionEnd::FormatChanged) => {
                    self.status.send_modify(|s| s.renegotiations += 1);
                }
                Err(e) if !e.is_recoverable() => {
                    log::error!("stopping: {}", e);
                    self.record_error(&e);
                    break Err(e);
                }
                Err(e) => {
                    log::warn!("session failed: {}", e);
                    if matches!(e, StreamError::Capture(_)) {
                        self.capture_failed = true;
                    }
                    self.record_error(&e);
                    self.status.send_modify(|s| s.failed_attempts += 1);
                }
            }

            self.set_state(SupervisorState::Closing);
            self.output.close();
            wait_or_cancel(&self.cancel, self.config.cooldown);
        };

        self.terminate();
        result
    }

    fn record_error(&mut self, err: &StreamError) {
        let message = err.to_string();
        self.status.send_modify(|s| s.last_error = Some(message));
    }

    fn terminate(&mut self) {
        self.output.close();
        self.negotiated = None;
        self.set_state(SupervisorState::Terminated);
        log::info!("supervisor terminated");
    }

    fn run_session(&mut self) -> Result<SessionEnd> {
        self.set_state(SupervisorState::Idle);
        if self.capture_failed {
            if let Some(source) = self.source.clone() {
                self.capture.connect(&source)?;
            }
            self.capture_failed = false;
        }
        self.output
            .open(&self.config.container, &self.config.destination)?;

        self.set_state(SupervisorState::Probing);
        let first = loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }
            let captured = self.capture.capture(self.config.capture_timeout)?;
            if self.cancel.is_cancelled() {
                self.capture.release(captured);
                return Ok(SessionEnd::Cancelled);
            }
            match captured {
                Captured::Video(video) => break video,
                Captured::Timeout => log::trace!("waiting for first video frame"),
                other => self.capture.release(other),
            }
        };

        self.set_state(SupervisorState::Negotiating);
        let (video_target, audio_target) = self.negotiate(&first)?;

        self.converter.reset();
        self.set_state(SupervisorState::Streaming);
        self.status.send_modify(|s| s.sessions_started += 1);
        self.send_video(&video_target, &first)?;
        self.capture.release(Captured::Video(first));

        self.pump(&video_target, &audio_target)
    }

    fn negotiate(&mut self, first: &CapturedVideo) -> Result<(VideoTarget, AudioTarget)> {
        let negotiated = Negotiated {
            width: first.width(),
            height: first.height(),
            frame_rate: first.frame_rate(),
        };
        log::info!(
            "negotiating {}x{} @ {} fps",
            negotiated.width,
            negotiated.height,
            negotiated.frame_rate
        );
        if self.output.video_target().is_some() || self.output.audio_target().is_some() {
            self.output.close_codecs();
        }

        let config = &self.config;
        self.output.add_video_stream(
            &config.video_encoder,
            negotiated.width,
            negotiated.height,
            negotiated.frame_rate,
            config.video_bitrate,
        )?;
        self.output
            .add_audio_stream(&config.audio_encoder, config.audio_bitrate)?;
        self.output.write_header(&config.muxer_options())?;

        let video_target = self
            .output
            .video_target()
            .ok_or_else(|| StreamError::Resource("video stream missing after setup".into()))?;
        let audio_target = self
            .output
            .audio_target()
            .ok_or_else(|| StreamError::Resource("audio stream missing after setup".into()))?;

        self.negotiated = Some(negotiated);
        self.status.send_modify(|s| {
            s.width = Some(negotiated.width);
            s.height = Some(negotiated.height);
            s.frame_rate = Some(negotiated.frame_rate.to_string());
        });
        Ok((video_target, audio_target))
    }

    fn pump(&mut self, video_target: &VideoTarget, audio_target: &AudioTarget) -> Result<SessionEnd> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(SessionEnd::Cancelled);
            }
            let captured = self.capture.capture(self.config.capture_timeout)?;
            if self.cancel.is_cancelled() {
                self.capture.release(captured);
                return Ok(SessionEnd::Cancelled);
            }

            match captured {
                Captured::Video(video) => {
                    if (video.width(), video.height()) != (video_target.width, video_target.height) {
                        log::info!(
                            "source changed from {}x{} to {}x{}, renegotiating",
                            video_target.width,
                            video_target.height,
                            video.width(),
                            video.height()
                        );
                        self.capture.release(Captured::Video(video));
                        return Ok(SessionEnd::FormatChanged);
                    }
                    self.send_video(video_target, &video)?;
                    self.capture.release(Captured::Video(video));
                }
                Captured::Audio(audio) => {
                    self.send_audio(audio_target, &audio)?;
                    self.capture.release(Captured::Audio(audio));
                }
                Captured::Timeout => log::trace!("capture timeout"),
            }
        }
    }

    fn send_video(&mut self, target: &VideoTarget, video: &CapturedVideo) -> Result<()> {
        let view = video.view()?;
        let frame = self.converter.convert_video(target, &view)?;
        self.output.send_video_frame(frame)?;
        self.status.send_modify(|s| s.video_frames += 1);
        Ok(())
    }

    /// Sends every full frame the chunk completes, including backlog.
    fn send_audio(&mut self, target: &AudioTarget, audio: &CapturedAudio) -> Result<()> {
        let view = audio.view()?;
        let mut input = Some(&view);
        let mut sent = 0u64;
        loop {
            let Some(frame) = self.converter.convert_audio(target, input.take())? else {
                break;
            };
            self.output.send_audio_frame(frame)?;
            sent += 1;
        }
        if sent > 0 {
            self.status.send_modify(|s| s.audio_frames += sent);
        }
        Ok(())
    }
}

/// Sleeps for `delay`, returning early once `cancel` fires.
pub fn wait_or_cancel(cancel: &CancellationToken, delay: Duration) {
    let mut remaining = delay;
    while !remaining.is_zero() && !cancel.is_cancelled() {
        let step = remaining.min(CANCEL_POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// Blocks the calling thread until `cancel` fires. Not for async contexts.
pub fn block_until_cancelled(cancel: &CancellationToken) {
    futures::executor::block_on(cancel.cancelled());
}

#[cfg(test)]
#[path = "supervisor_test.rs"]
mod supervisor_test;
