//! Engine configuration.
//!
//! All feature switches (road snapping in particular) are fixed at
//! construction time. Every struct deserializes with `#[serde(default)]`, so a
//! host can supply only the fields it wants to override.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Top-level configuration for a [`LocationEngine`](crate::LocationEngine).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub smoothing: SmoothingConfig,
    pub road_snap: RoadSnapConfig,
    pub directions: DirectionsConfig,
}

impl TrackerConfig {
    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TrackerError::InvalidInput(format!("config: {}", e)))
    }
}

/// Configuration for the rolling-window sample smoother.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Number of most recent samples kept per rider.
    /// Default: 5
    pub window_size: usize,

    /// Lower bound for the smoothed speed in km/h.
    /// Default: 10.0
    pub min_speed_kmh: f64,

    /// Upper bound for the smoothed speed in km/h.
    /// Default: 45.0
    pub max_speed_kmh: f64,

    /// Speed used when a fix carries none, or no positive speed is in the window.
    /// Default: 20.0
    pub default_speed_kmh: f64,

    /// Accuracy assumed when a fix carries none, in meters.
    /// Default: 50.0
    pub default_accuracy_m: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            min_speed_kmh: 10.0,
            max_speed_kmh: 45.0,
            default_speed_kmh: 20.0,
            default_accuracy_m: 50.0,
        }
    }
}

/// Configuration for the snap-to-road gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadSnapConfig {
    /// Master switch. The upstream service is billed per call.
    /// Default: false
    pub enabled: bool,

    /// Minimum gap between upstream calls for the same rider.
    /// Default: 10 seconds
    pub throttle_secs: u64,

    /// A cached snap is reused for any point within this distance of the
    /// point it was computed for.
    /// Default: 50.0 meters
    pub cache_radius_m: f64,

    /// Age after which cached snaps are evicted.
    /// Default: 3600 seconds
    pub cache_ttl_secs: u64,

    /// Maximum cached snaps before the oldest are evicted.
    /// Default: 10_000
    pub max_cache_entries: usize,

    /// Points per upstream request.
    /// Default: 100
    pub max_batch_size: usize,

    /// Bound on a single upstream call.
    /// Default: 8 seconds
    pub timeout_secs: u64,
}

impl Default for RoadSnapConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            throttle_secs: 10,
            cache_radius_m: 50.0,
            cache_ttl_secs: 3600,
            max_cache_entries: 10_000,
            max_batch_size: 100,
            timeout_secs: 8,
        }
    }
}

impl RoadSnapConfig {
    pub fn throttle(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.throttle_secs as i64)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the directions route provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionsConfig {
    /// How long a fetched route is served from cache.
    /// Default: 300 seconds
    pub cache_ttl_secs: u64,

    /// Decimal places kept when bucketing origin/waypoint/destination for the
    /// cache key. 4 places is roughly 11 meters.
    /// Default: 4
    pub bucket_decimals: usize,

    /// Bound on a single upstream call.
    /// Default: 8 seconds
    pub timeout_secs: u64,
}

impl Default for DirectionsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            bucket_decimals: 4,
            timeout_secs: 8,
        }
    }
}

impl DirectionsConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cache_ttl_secs as i64)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}
