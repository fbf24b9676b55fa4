//! Live door-camera session: remote start/stop commands, the local decoder
//! and the state machine that keeps the two in step with the panel.
pub mod command;
pub mod decoder;
pub mod error;
pub mod logging;
pub mod machine;
pub mod mpv;
pub mod panel;
pub mod readiness;
pub mod session;
