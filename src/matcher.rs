//! Matches a smoothed position onto an order's route.
//!
//! The rider is matched to the nearest route *point* (not segment), and
//! progress is the route length up to that point. Between sparse route
//! points this under-reports progress until the rider gets closer to the
//! next point; callers animate toward `next_point` to hide the steps.

use crate::geo_utils::{nearest_point_on_polyline, polyline_length};
use crate::{ProgressResult, RouteState, SmoothedSample};

/// Compute route progress for `position`.
///
/// Returns `None` if the route has no points.
pub fn match_progress(route: &RouteState, position: &SmoothedSample) -> Option<ProgressResult> {
    let (current_point, index, _) = nearest_point_on_polyline(&position.coord, &route.points)?;

    // Route point counts are small, so the prefix length is recomputed per call
    let distance_covered_m = polyline_length(&route.points[..=index]);

    let progress_fraction = if route.total_distance_m > 0.0 {
        (distance_covered_m / route.total_distance_m).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let next_point = route.points[(index + 1).min(route.points.len() - 1)];

    Some(ProgressResult {
        progress_fraction,
        current_point,
        next_point,
        distance_covered_m,
        remaining_distance_m: route.total_distance_m - distance_covered_m,
    })
}
