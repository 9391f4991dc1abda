use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    #[default]
    Idle,
    Probing,
    Negotiating,
    Streaming,
    Closing,
    Terminated,
}

/// Snapshot published by the supervisor on every state change and sent
/// frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub state: SupervisorState,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Negotiated frame rate as `num/den`.
    pub frame_rate: Option<String>,
    pub sessions_started: u64,
    pub failed_attempts: u64,
    pub renegotiations: u64,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub last_error: Option<String>,
}
