//! Error taxonomy for the tracking engine.
//!
//! Only [`TrackerError::InvalidInput`] and [`TrackerError::NoRouteFound`] are
//! ever returned to callers of the engine. Upstream and decode failures are
//! produced by the gateways, logged, and absorbed by degrading to unsnapped
//! coordinates or an unknown route.

use thiserror::Error;

/// Errors produced while processing rider location updates.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackerError {
    /// Malformed or out-of-range input. Rejected before any state changes.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No route could be established for an order.
    #[error("no route found: {0}")]
    NoRouteFound(String),

    /// The road-snap or directions service failed, timed out or refused.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// An encoded polyline could not be decoded.
    #[error("malformed polyline: {0}")]
    Decode(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TrackerError>;

impl TrackerError {
    /// True for errors a caller is expected to surface rather than absorb.
    pub fn is_caller_visible(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::NoRouteFound(_))
    }
}
