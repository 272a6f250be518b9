//! # Rider Tracker
//!
//! Real-time rider location and route-progress engine for live deliveries.
//!
//! This library provides:
//! - Rolling-window smoothing of noisy GPS fixes per rider
//! - Optional, throttled and cached snap-to-road correction
//! - Cached route lookup between rider, pickup and drop-off
//! - Matching of the smoothed position onto the route to report progress
//!
//! The engine never persists or broadcasts anything itself: it hands a
//! [`BroadcastPayload`] back to the caller, which owns fan-out and storage.
//!
//! ## Features
//!
//! - **`http`** - Enable reqwest clients for the snap-to-road and directions services
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use rider_tracker::{geo_utils, Coordinate};
//!
//! let route = vec![
//!     Coordinate::new(12.9716, 77.5946),
//!     Coordinate::new(12.9720, 77.5950),
//!     Coordinate::new(12.9730, 77.5970),
//! ];
//!
//! let (_, index, _) = geo_utils::nearest_point_on_polyline(&route[1], &route).unwrap();
//! assert_eq!(index, 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{Result, TrackerError};

pub mod clock;
pub use clock::{Clock, ManualClock, SystemClock};

pub mod config;
pub use config::{DirectionsConfig, RoadSnapConfig, SmoothingConfig, TrackerConfig};

// Geographic primitives (distance, bearing, nearest point, polyline codec)
pub mod geo_utils;

pub mod smoother;
pub use smoother::{smooth_sample, RiderHistory};

// Snap-to-road gateway with throttling and spatial cache
pub mod road_snap;
pub use road_snap::{RoadSnapGateway, RoadSnapService, SnapCache, SnapOutcome};

// Directions lookup with bucketed TTL cache
pub mod directions;
pub use directions::{DirectionsCache, DirectionsRoute, DirectionsService, RouteLeg, RouteProvider};

pub mod matcher;
pub use matcher::match_progress;

pub mod session;
pub use session::{SessionStore, SweepStats};

pub mod engine;
pub use engine::{LocationEngine, OrderDirectory, OrderGeography, RoutedPayload};

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpClientConfig, HttpDirectionsClient, HttpRoadSnapClient};

// ============================================================================
// Core Types
// ============================================================================

/// A WGS84 coordinate.
///
/// # Example
/// ```
/// use rider_tracker::Coordinate;
/// let point = Coordinate::new(12.9716, 77.5946); // Bengaluru
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    /// Create a new coordinate.
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Check if the coordinate is finite and within lat/lng ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && self.lat >= -90.0
            && self.lat <= 90.0
            && self.lng >= -180.0
            && self.lng <= 180.0
    }

    /// Like [`is_valid`](Self::is_valid), but says what is wrong.
    pub fn validate(&self) -> Result<()> {
        if !self.lat.is_finite() || !(-90.0..=90.0).contains(&self.lat) {
            return Err(TrackerError::InvalidInput(format!(
                "latitude {} outside [-90, 90]",
                self.lat
            )));
        }
        if !self.lng.is_finite() || !(-180.0..=180.0).contains(&self.lng) {
            return Err(TrackerError::InvalidInput(format!(
                "longitude {} outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }

    /// Key for the cell this coordinate falls in when rounded to `decimals` places.
    pub fn bucket_key(&self, decimals: usize) -> String {
        format!("{:.*},{:.*}", decimals, self.lat, decimals, self.lng)
    }
}

impl From<Coordinate> for geo::Point<f64> {
    fn from(c: Coordinate) -> Self {
        geo::Point::new(c.lng, c.lat)
    }
}

/// Wire form of a raw fix as sent by the rider's device.
///
/// Optional fields fall back to the smoothing defaults when converted into a
/// [`RawSample`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub bearing: Option<f64>,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

impl LocationFix {
    pub fn into_sample(
        self,
        rider_id: &str,
        order_id: &str,
        received_at: DateTime<Utc>,
        defaults: &SmoothingConfig,
    ) -> RawSample {
        RawSample {
            rider_id: rider_id.to_string(),
            order_id: order_id.to_string(),
            coord: Coordinate::new(self.lat, self.lng),
            speed_kmh: self.speed.unwrap_or(defaults.default_speed_kmh),
            bearing_deg: self.bearing.map_or(0.0, normalize_bearing),
            accuracy_m: self.accuracy.unwrap_or(defaults.default_accuracy_m),
            received_at,
        }
    }
}

/// A single GPS fix from an active rider, before any cleaning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    pub rider_id: String,
    pub order_id: String,
    pub coord: Coordinate,
    /// Speed in km/h. Default: 20.0
    pub speed_kmh: f64,
    /// Heading in degrees, [0, 360). Default: 0.0
    pub bearing_deg: f64,
    /// Horizontal accuracy in meters. Default: 50.0
    pub accuracy_m: f64,
    pub received_at: DateTime<Utc>,
}

impl RawSample {
    /// Create a sample with default speed, bearing and accuracy.
    pub fn new(rider_id: &str, order_id: &str, coord: Coordinate, received_at: DateTime<Utc>) -> Self {
        let defaults = SmoothingConfig::default();
        Self {
            rider_id: rider_id.to_string(),
            order_id: order_id.to_string(),
            coord,
            speed_kmh: defaults.default_speed_kmh,
            bearing_deg: 0.0,
            accuracy_m: defaults.default_accuracy_m,
            received_at,
        }
    }

    pub fn with_speed(mut self, speed_kmh: f64) -> Self {
        self.speed_kmh = speed_kmh;
        self
    }

    pub fn with_bearing(mut self, bearing_deg: f64) -> Self {
        self.bearing_deg = normalize_bearing(bearing_deg);
        self
    }

    pub fn with_accuracy(mut self, accuracy_m: f64) -> Self {
        self.accuracy_m = accuracy_m;
        self
    }

    /// Reject samples that must never enter the pipeline.
    pub fn validate(&self) -> Result<()> {
        self.coord.validate()?;
        if !self.speed_kmh.is_finite() || !self.bearing_deg.is_finite() || !self.accuracy_m.is_finite() {
            return Err(TrackerError::InvalidInput(format!(
                "non-finite motion fields for rider {}",
                self.rider_id
            )));
        }
        Ok(())
    }
}

/// A stabilized position derived from a rider's recent samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SmoothedSample {
    pub coord: Coordinate,
    pub speed_kmh: f64,
    pub bearing_deg: f64,
    pub accuracy_m: f64,
}

impl From<&RawSample> for SmoothedSample {
    fn from(raw: &RawSample) -> Self {
        Self {
            coord: raw.coord,
            speed_kmh: raw.speed_kmh,
            bearing_deg: raw.bearing_deg,
            accuracy_m: raw.accuracy_m,
        }
    }
}

/// The route an order is expected to follow.
///
/// `total_distance_m` is computed once from `points` and never recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteState {
    /// Ordered route points, at least two.
    pub points: Vec<Coordinate>,
    /// Sum of consecutive great-circle segment lengths.
    pub total_distance_m: f64,
    pub encoded_polyline: String,
    pub duration_s: u64,
}

impl RouteState {
    /// Build a route from an encoded polyline.
    ///
    /// Fails with [`TrackerError::Decode`] for malformed input and
    /// [`TrackerError::NoRouteFound`] when fewer than two points decode.
    pub fn from_encoded(encoded: &str, duration_s: u64) -> Result<Self> {
        let points = geo_utils::decode_polyline(encoded)?;
        if points.len() < 2 {
            return Err(TrackerError::NoRouteFound(format!(
                "polyline decoded to {} point(s)",
                points.len()
            )));
        }
        Ok(Self {
            total_distance_m: geo_utils::polyline_length(&points),
            points,
            encoded_polyline: encoded.to_string(),
            duration_s,
        })
    }

    /// Build a route directly from points, encoding them for broadcast.
    ///
    /// Returns `None` if fewer than two points are supplied.
    pub fn from_points(points: Vec<Coordinate>, duration_s: u64) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        Some(Self {
            total_distance_m: geo_utils::polyline_length(&points),
            encoded_polyline: geo_utils::encode_polyline(&points),
            points,
            duration_s,
        })
    }
}

/// How far along its route a rider is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressResult {
    /// Covered distance over total distance, clamped to [0, 1].
    pub progress_fraction: f64,
    /// The route point the rider was matched to.
    pub current_point: Coordinate,
    /// The route point after the matched one, for client-side animation.
    pub next_point: Coordinate,
    pub distance_covered_m: f64,
    pub remaining_distance_m: f64,
}

/// Pickup and drop-off supplied by the order collaborator, used to build a
/// route lazily on the first update for an order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RouteHints {
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
}

/// Summary returned when a route is established for an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub order_id: String,
    pub total_distance_m: f64,
    pub duration_s: u64,
    pub point_count: usize,
    pub encoded_polyline: String,
}

impl RouteSummary {
    pub fn new(order_id: &str, route: &RouteState) -> Self {
        Self {
            order_id: order_id.to_string(),
            total_distance_m: route.total_distance_m,
            duration_s: route.duration_s,
            point_count: route.points.len(),
            encoded_polyline: route.encoded_polyline.clone(),
        }
    }
}

/// Everything a subscriber needs to render the rider's live position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastPayload {
    pub rider_id: String,
    pub order_id: String,
    pub coord: Coordinate,
    pub bearing_deg: f64,
    pub speed_kmh: f64,
    pub accuracy_m: f64,
    /// 0.0 when no route is known.
    pub progress_fraction: f64,
    pub distance_covered_m: f64,
    pub remaining_distance_m: f64,
    pub current_point: Option<Coordinate>,
    pub next_point: Option<Coordinate>,
    /// Milliseconds since the epoch, strictly increasing per engine.
    pub timestamp_ms: i64,
    /// The position was corrected by the road-snap service (or its cache).
    pub snapped: bool,
    /// The position was matched onto a known route.
    pub route_matched: bool,
    /// Processing failed internally and the raw fix was published as-is.
    pub degraded: bool,
}

impl BroadcastPayload {
    /// Payload carrying the raw, unsmoothed and unmatched fix.
    pub fn raw(sample: &RawSample, timestamp_ms: i64) -> Self {
        Self::compose(sample, &SmoothedSample::from(sample), None, false, timestamp_ms)
    }

    pub(crate) fn compose(
        sample: &RawSample,
        smoothed: &SmoothedSample,
        progress: Option<&ProgressResult>,
        snapped: bool,
        timestamp_ms: i64,
    ) -> Self {
        Self {
            rider_id: sample.rider_id.clone(),
            order_id: sample.order_id.clone(),
            coord: smoothed.coord,
            bearing_deg: smoothed.bearing_deg,
            speed_kmh: smoothed.speed_kmh,
            accuracy_m: smoothed.accuracy_m,
            progress_fraction: progress.map_or(0.0, |p| p.progress_fraction),
            distance_covered_m: progress.map_or(0.0, |p| p.distance_covered_m),
            remaining_distance_m: progress.map_or(0.0, |p| p.remaining_distance_m),
            current_point: progress.map(|p| p.current_point),
            next_point: progress.map(|p| p.next_point),
            timestamp_ms,
            snapped,
            route_matched: progress.is_some(),
            degraded: false,
        }
    }
}

/// Wrap a heading into [0, 360).
pub(crate) fn normalize_bearing(deg: f64) -> f64 {
    let wrapped = deg.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinate_validation() {
        assert!(Coordinate::new(12.9716, 77.5946).is_valid());
        assert!(!Coordinate::new(95.0, 0.0).is_valid());
        assert!(!Coordinate::new(0.0, 181.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 0.0).is_valid());
        assert!(matches!(
            Coordinate::new(95.0, 0.0).validate(),
            Err(TrackerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_bucket_key_rounds() {
        let a = Coordinate::new(12.97161, 77.59459);
        let b = Coordinate::new(12.97158, 77.59462);
        assert_eq!(a.bucket_key(4), b.bucket_key(4));
        assert_ne!(a.bucket_key(5), b.bucket_key(5));
    }

    #[test]
    fn test_fix_defaults() {
        let fix: LocationFix = serde_json::from_str(r#"{"lat": 12.97, "lng": 77.59}"#).unwrap();
        let sample = fix.into_sample("rider-1", "order-1", Utc::now(), &SmoothingConfig::default());
        assert_eq!(sample.speed_kmh, 20.0);
        assert_eq!(sample.bearing_deg, 0.0);
        assert_eq!(sample.accuracy_m, 50.0);
    }

    #[test]
    fn test_fix_bearing_normalized() {
        let fix = LocationFix { lat: 1.0, lng: 1.0, speed: Some(30.0), bearing: Some(-90.0), accuracy: None };
        let sample = fix.into_sample("r", "o", Utc::now(), &SmoothingConfig::default());
        assert_eq!(sample.bearing_deg, 270.0);
        assert_eq!(sample.speed_kmh, 30.0);
    }

    #[test]
    fn test_sample_rejects_non_finite_speed() {
        let sample = RawSample::new("r", "o", Coordinate::new(1.0, 1.0), Utc::now()).with_speed(f64::NAN);
        assert!(sample.validate().is_err());
    }

    #[test]
    fn test_route_state_from_points() {
        let route = RouteState::from_points(
            vec![Coordinate::new(12.9716, 77.5946), Coordinate::new(12.9720, 77.5950)],
            60,
        )
        .unwrap();
        assert!(route.total_distance_m > 0.0);

        let decoded = RouteState::from_encoded(&route.encoded_polyline, 60).unwrap();
        assert_eq!(decoded.points.len(), 2);
        assert!((decoded.total_distance_m - route.total_distance_m).abs() < 1.0);
    }

    #[test]
    fn test_route_state_needs_two_points() {
        assert!(RouteState::from_points(vec![Coordinate::new(1.0, 1.0)], 0).is_none());
        let single = geo_utils::encode_polyline(&[Coordinate::new(1.0, 1.0)]);
        assert!(matches!(
            RouteState::from_encoded(&single, 0),
            Err(TrackerError::NoRouteFound(_))
        ));
    }

    #[test]
    fn test_payload_serializes_camel_case() {
        let sample = RawSample::new("rider-1", "order-1", Coordinate::new(1.0, 2.0), Utc::now());
        let payload = BroadcastPayload::raw(&sample, 42);
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["riderId"], "rider-1");
        assert_eq!(json["progressFraction"], 0.0);
        assert_eq!(json["routeMatched"], false);
        assert_eq!(json["timestampMs"], 42);
    }
}
