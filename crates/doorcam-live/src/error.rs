use std::time::Duration;

use thiserror::Error;

/// Transport-level outcome of a start/stop command to the door unit.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("door unit did not answer within {0:?}")]
    Timeout(Duration),
    #[error("door unit refused: {0}")]
    Rejected(String),
    #[error("door unit unreachable: {0}")]
    Unreachable(String),
}

/// Failure of the local decoding pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecoderError {
    #[error("decoder failed to start: {0}")]
    Spawn(String),
    #[error("stream could not be opened: {0}")]
    InitFailed(String),
    #[error("stream did not become ready within {0:?}")]
    InitTimeout(Duration),
    #[error("decoder IPC error: {0}")]
    Ipc(String),
}

/// Why a start attempt did not reach `Playing`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Decoder(#[from] DecoderError),
}

impl StartError {
    /// Short text for the panel.  Remote and local failures read alike there;
    /// the full error goes to the log.
    pub fn user_message(&self) -> String {
        match self {
            StartError::Command(CommandError::Timeout(_)) => {
                "Camera did not respond in time".to_string()
            }
            StartError::Command(CommandError::Rejected(_)) => {
                "Camera refused to start streaming".to_string()
            }
            StartError::Command(CommandError::Unreachable(_)) => {
                "Camera is unreachable".to_string()
            }
            StartError::Decoder(DecoderError::InitTimeout(_)) => {
                "Live feed timed out".to_string()
            }
            StartError::Decoder(_) => "Live feed could not be opened".to_string(),
        }
    }
}

/// The session controller is gone; intents can no longer be delivered.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("live-view session has shut down")]
pub struct SessionClosed;
