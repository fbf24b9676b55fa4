use serde::{Deserialize, Serialize};

/// Control port the door unit serves `/start_stream`, `/stop_stream` and
/// `/stream` on.
pub const DEFAULT_CONTROL_PORT: u16 = 8080;

/// Path of the MJPEG feed on the door unit.
pub const DEFAULT_STREAM_PATH: &str = "/stream";

/// Multipart boundary used by the door unit's MJPEG feed.
pub const MJPEG_BOUNDARY: &str = "frame";

/// Phase of the live-view session.
///
/// Transitions:
///   Idle -> Starting -> Playing -> Stopping -> Idle
///   Idle -> Starting -> Failed -> Idle
///   Starting -> Stopping (collapsed before the feed came up)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Phase {
    /// Panel collapsed, nothing allocated.
    #[default]
    Idle,
    /// Remote start sent and/or decoder initialising.
    Starting,
    /// Decoder is playing the feed.
    Playing,
    /// Teardown in flight (remote stop outstanding).
    Stopping,
    /// Last start attempt failed; `last_error` says why.
    Failed,
}

impl Phase {
    /// Short label for status lines.
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Starting => "connecting",
            Phase::Playing => "live",
            Phase::Stopping => "stopping",
            Phase::Failed => "error",
        }
    }

    /// True while a transition is in flight and the UI should show a spinner.
    pub fn is_transitional(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Stopping)
    }
}

/// What the UI observer sees on every change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SessionSnapshot {
    /// Generation the session was at when this snapshot was taken.
    pub generation: u64,
    pub phase: Phase,
    pub last_error: Option<String>,
}

/// User intent reported by the panel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Intent {
    Expand,
    Collapse,
}

/// Commands understood by the door unit's control endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamAction {
    Start,
    Stop,
}

impl StreamAction {
    pub fn path(&self) -> &'static str {
        match self {
            StreamAction::Start => "/start_stream",
            StreamAction::Stop => "/stop_stream",
        }
    }
}

impl std::fmt::Display for StreamAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamAction::Start => f.write_str("start"),
            StreamAction::Stop => f.write_str("stop"),
        }
    }
}

/// JSON body returned by `/start_stream` and `/stop_stream`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DeviceReply {
    pub fn success(streaming: bool) -> Self {
        Self {
            status: "success".to_string(),
            streaming: Some(streaming),
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            streaming: None,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}
