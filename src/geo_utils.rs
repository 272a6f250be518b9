//! # Geographic Utilities
//!
//! Pure geographic computations used by every stage of the tracking pipeline.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_distance`] | Great-circle distance between two coordinates |
//! | [`bearing`] | Initial bearing from one coordinate to another |
//! | [`polyline_length`] | Total length of a route in meters |
//! | [`nearest_point_on_polyline`] | Closest route point to a position |
//! | [`decode_polyline`] / [`encode_polyline`] | Encoded polyline codec (precision 1e-5) |
//! | [`compute_center`] | Arithmetic centroid of a set of coordinates |
//! | [`meters_to_degrees`] | Convert meters to approximate degrees at a latitude |
//!
//! ## Example
//!
//! ```rust
//! use rider_tracker::{Coordinate, geo_utils};
//!
//! let route = vec![
//!     Coordinate::new(12.9716, 77.5946),
//!     Coordinate::new(12.9720, 77.5950),
//!     Coordinate::new(12.9730, 77.5970),
//! ];
//!
//! let length = geo_utils::polyline_length(&route);
//! println!("Route length: {:.0}m", length);
//!
//! let encoded = geo_utils::encode_polyline(&route);
//! let decoded = geo_utils::decode_polyline(&encoded).unwrap();
//! assert_eq!(decoded.len(), 3);
//! ```
//!
//! ## Algorithm Notes
//!
//! ### Haversine Formula
//!
//! Distances use the haversine formula on a sphere of radius 6,371,000 m.
//! Accurate to within 0.3% for the short hops a rider makes between fixes.
//!
//! ### Encoded Polylines
//!
//! Each coordinate is stored as the delta from the previous one, scaled by
//! 1e5, zig-zag encoded, and split into 5-bit chunks offset by 63 so every
//! chunk is a printable ASCII character.
//!
//! ### Coordinate System
//!
//! All functions expect WGS84 coordinates (latitude/longitude in degrees).

use geo::{Bearing, Haversine};

use crate::error::{Result, TrackerError};
use crate::Coordinate;

/// Mean Earth radius used for all distance calculations, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

const POLYLINE_FACTOR: f64 = 1e5;

// =============================================================================
// Distance Functions
// =============================================================================

/// Calculate the great-circle distance between two coordinates using the
/// haversine formula.
///
/// Symmetric, and exactly zero when both arguments are equal.
///
/// # Example
///
/// ```rust
/// use rider_tracker::{Coordinate, geo_utils};
///
/// let london = Coordinate::new(51.5074, -0.1278);
/// let paris = Coordinate::new(48.8566, 2.3522);
///
/// let distance = geo_utils::haversine_distance(&london, &paris);
/// assert!((distance - 343_560.0).abs() < 1000.0); // ~344 km
/// ```
#[inline]
pub fn haversine_distance(a: &Coordinate, b: &Coordinate) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let half_dlat = (b.lat - a.lat).to_radians() / 2.0;
    let half_dlng = (b.lng - a.lng).to_radians() / 2.0;

    let h = half_dlat.sin().powi(2) + lat1.cos() * lat2.cos() * half_dlng.sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).max(0.0).sqrt())
}

/// Initial great-circle bearing from `from` to `to`, in degrees within [0, 360).
///
/// North is 0, east is 90. Identical points yield 0.
///
/// # Example
///
/// ```rust
/// use rider_tracker::{Coordinate, geo_utils};
///
/// let a = Coordinate::new(0.0, 0.0);
/// let east = Coordinate::new(0.0, 1.0);
/// assert!((geo_utils::bearing(&a, &east) - 90.0).abs() < 1e-9);
/// ```
pub fn bearing(from: &Coordinate, to: &Coordinate) -> f64 {
    if from == to {
        return 0.0;
    }
    let deg = Haversine::bearing(geo::Point::from(*from), geo::Point::from(*to));
    crate::normalize_bearing(deg)
}

/// Calculate the total length of a route in meters.
///
/// Sums the haversine distance between consecutive points. Empty or
/// single-point inputs return 0.0.
pub fn polyline_length(points: &[Coordinate]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Find the route point nearest to `p`.
///
/// Linear scan over `points`, returning the closest point, its index and its
/// distance in meters. Ties go to the lowest index. This searches route
/// *points*, not segments, so results are quantized to the density of the
/// polyline. Returns `None` for an empty route.
///
/// # Example
///
/// ```rust
/// use rider_tracker::{Coordinate, geo_utils};
///
/// let route = vec![Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 0.01)];
/// let (point, index, dist) =
///     geo_utils::nearest_point_on_polyline(&Coordinate::new(0.0, 0.009), &route).unwrap();
/// assert_eq!(index, 1);
/// assert_eq!(point, route[1]);
/// assert!(dist < 120.0);
/// ```
pub fn nearest_point_on_polyline(
    p: &Coordinate,
    points: &[Coordinate],
) -> Option<(Coordinate, usize, f64)> {
    let mut best: Option<(Coordinate, usize, f64)> = None;

    for (index, candidate) in points.iter().enumerate() {
        let dist = haversine_distance(p, candidate);
        match best {
            Some((_, _, best_dist)) if dist >= best_dist => {}
            _ => best = Some((*candidate, index, dist)),
        }
    }

    best
}

/// Convert meters to approximate degrees at a given latitude.
///
/// Uses the longitude scale at `latitude`, which is the larger of the two
/// degree sizes, so a square search box built from it never undershoots.
/// The result grows without bound toward the poles.
#[inline]
pub fn meters_to_degrees(meters: f64, latitude: f64) -> f64 {
    let lat_rad = latitude.to_radians();
    // Floor only guards the division at exactly ±90°
    let meters_per_degree = 111_320.0 * lat_rad.cos().abs().max(1e-12);
    meters / meters_per_degree
}

/// Arithmetic centroid of a set of coordinates.
///
/// Averages offsets from the first point, so a set of identical points
/// returns that point exactly. Returns `None` for empty input.
///
/// Not suitable for sets spanning the antimeridian.
pub fn compute_center(points: &[Coordinate]) -> Option<Coordinate> {
    let first = points.first()?;
    let n = points.len() as f64;

    let lat_offset: f64 = points.iter().map(|p| p.lat - first.lat).sum::<f64>() / n;
    let lng_offset: f64 = points.iter().map(|p| p.lng - first.lng).sum::<f64>() / n;

    Some(Coordinate::new(first.lat + lat_offset, first.lng + lng_offset))
}

// =============================================================================
// Polyline Codec
// =============================================================================

/// Decode an encoded polyline (precision 1e-5) into coordinates.
///
/// An empty string decodes to an empty route. Characters outside the
/// encoding alphabet, truncated values, over-long values and coordinates
/// outside lat/lng ranges fail with [`TrackerError::Decode`].
///
/// # Example
///
/// ```rust
/// use rider_tracker::geo_utils;
///
/// let points = geo_utils::decode_polyline("_p~iF~ps|U_ulLnnqC_mqNvxq`@").unwrap();
/// assert_eq!(points.len(), 3);
/// assert!((points[0].lat - 38.5).abs() < 1e-9);
/// assert!((points[2].lng - -126.453).abs() < 1e-9);
/// ```
pub fn decode_polyline(encoded: &str) -> Result<Vec<Coordinate>> {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;
    let mut points = Vec::new();

    while index < bytes.len() {
        lat += decode_value(bytes, &mut index)?;
        lng += decode_value(bytes, &mut index)?;

        let point = Coordinate::new(lat as f64 / POLYLINE_FACTOR, lng as f64 / POLYLINE_FACTOR);
        if !point.is_valid() {
            return Err(TrackerError::Decode(format!(
                "point {} out of range ({}, {})",
                points.len(),
                point.lat,
                point.lng
            )));
        }
        points.push(point);
    }

    Ok(points)
}

fn decode_value(bytes: &[u8], index: &mut usize) -> Result<i64> {
    let mut result: i64 = 0;
    let mut shift = 0;

    loop {
        let byte = *bytes
            .get(*index)
            .ok_or_else(|| TrackerError::Decode(format!("truncated value at byte {}", *index)))?;
        if !(63..=126).contains(&byte) {
            return Err(TrackerError::Decode(format!(
                "invalid character {:?} at byte {}",
                byte as char, *index
            )));
        }
        // Valid deltas fit in 32 bits; anything longer is corrupt
        if shift > 30 {
            return Err(TrackerError::Decode(format!("value too long at byte {}", *index)));
        }

        let chunk = (byte - 63) as i64;
        *index += 1;
        result |= (chunk & 0x1f) << shift;
        shift += 5;

        if chunk < 0x20 {
            break;
        }
    }

    Ok(if result & 1 != 0 { !(result >> 1) } else { result >> 1 })
}

/// Encode coordinates as a polyline (precision 1e-5).
pub fn encode_polyline(points: &[Coordinate]) -> String {
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for p in points {
        let lat = (p.lat * POLYLINE_FACTOR).round() as i64;
        let lng = (p.lng * POLYLINE_FACTOR).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn encode_value(delta: i64, out: &mut String) {
    let mut value = ((delta << 1) ^ (delta >> 63)) as u64;
    while value >= 0x20 {
        out.push((((value & 0x1f) | 0x20) as u8 + 63) as char);
        value >>= 5;
    }
    out.push((value as u8 + 63) as char);
}

// =============================================================================
// Unit Tests
// =============================================================================
