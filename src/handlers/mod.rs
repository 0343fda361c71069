//! Operational HTTP handlers

pub mod status;

pub use status::{
    health_handler, metrics_handler, status_handler, track_requests, ServerStats, StatusResponse,
};
