//! OAuth install flow and the upstream platform client

pub mod client;
pub mod install;

pub use client::{AccessTokenResponse, HttpPlatformClient, PlatformClient};
pub use install::{begin_install, complete_install, InstallFlow, InstallStateStore};
