//! Types shared by the door-camera client, its host binary and the device
//! simulator: session phases and snapshots, the device's control replies,
//! configuration and platform paths.

pub mod config;
pub mod platform;
pub mod protocol;
