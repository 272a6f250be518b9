//! Route lookup through an external directions service.
//!
//! Routes run from the rider's position through the pickup to the drop-off.
//! Results are cached by origin/destination/waypoint rounded to
//! `bucket_decimals` places (4 places is ~11m), so riders starting a few
//! meters apart share a route for the cache TTL.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::DirectionsConfig;
use crate::error::{Result, TrackerError};
use crate::{Coordinate, RouteState};

/// One leg of a directions response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteLeg {
    pub distance_m: f64,
    pub duration_s: u64,
}

/// What the directions service returns for a route request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionsRoute {
    pub encoded_polyline: String,
    pub legs: Vec<RouteLeg>,
}

impl DirectionsRoute {
    pub fn duration_s(&self) -> u64 {
        self.legs.iter().map(|leg| leg.duration_s).sum()
    }
}

/// External directions service.
#[async_trait]
pub trait DirectionsService: Send + Sync {
    /// Route from `origin` via `waypoint` to `destination`.
    ///
    /// Returns [`TrackerError::NoRouteFound`] when the service has no route
    /// and [`TrackerError::UpstreamUnavailable`] when it cannot be reached.
    async fn route(
        &self,
        origin: Coordinate,
        waypoint: Coordinate,
        destination: Coordinate,
    ) -> Result<DirectionsRoute>;
}

// ============================================================================
// Cache
// ============================================================================

#[derive(Debug, Clone)]
struct CachedRoute {
    route: Arc<RouteState>,
    cached_at: DateTime<Utc>,
}

/// Fetched routes keyed by bucketed endpoints.
#[derive(Default)]
pub struct DirectionsCache {
    entries: Mutex<HashMap<String, CachedRoute>>,
}

impl DirectionsCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedRoute>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// A cached route younger than `ttl`.
    pub fn get(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Option<Arc<RouteState>> {
        self.lock()
            .get(key)
            .filter(|cached| now - cached.cached_at < ttl)
            .map(|cached| Arc::clone(&cached.route))
    }

    /// Store a route and drop every entry older than `ttl`.
    pub fn insert(&self, key: String, route: Arc<RouteState>, now: DateTime<Utc>, ttl: Duration) {
        let mut entries = self.lock();
        entries.retain(|_, cached| now - cached.cached_at < ttl);
        entries.insert(key, CachedRoute { route, cached_at: now });
    }

    /// Drop every entry at least `ttl` old. Returns the number evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, cached| now - cached.cached_at < ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Cache key for a route request: each endpoint rounded to `decimals` places.
pub fn cache_key(
    origin: &Coordinate,
    destination: &Coordinate,
    waypoint: &Coordinate,
    decimals: usize,
) -> String {
    format!(
        "{}|{}|{}",
        origin.bucket_key(decimals),
        destination.bucket_key(decimals),
        waypoint.bucket_key(decimals)
    )
}

// ============================================================================
// Provider
// ============================================================================

/// Cached front for a [`DirectionsService`].
pub struct RouteProvider {
    service: Arc<dyn DirectionsService>,
    config: DirectionsConfig,
}

impl RouteProvider {
    pub fn new(service: Arc<dyn DirectionsService>, config: DirectionsConfig) -> Self {
        Self { service, config }
    }

    pub fn config(&self) -> &DirectionsConfig {
        &self.config
    }

    /// Fetch (or reuse) the route from `origin` via `waypoint` to `destination`.
    ///
    /// Any error means "route unknown" to the caller: upstream failures and
    /// timeouts come back as [`TrackerError::UpstreamUnavailable`], bad
    /// polylines as [`TrackerError::Decode`], empty routes as
    /// [`TrackerError::NoRouteFound`]. Failures are never cached.
    pub async fn route(
        &self,
        origin: Coordinate,
        waypoint: Coordinate,
        destination: Coordinate,
        cache: &DirectionsCache,
        now: DateTime<Utc>,
    ) -> Result<Arc<RouteState>> {
        let key = cache_key(&origin, &destination, &waypoint, self.config.bucket_decimals);
        let ttl = self.config.cache_ttl();

        if let Some(route) = cache.get(&key, ttl, now) {
            debug!("[Directions] Cache hit for {}", key);
            return Ok(route);
        }

        let timeout = self.config.timeout();
        let response = match tokio::time::timeout(timeout, self.service.route(origin, waypoint, destination)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("[Directions] Lookup failed for {}: {}", key, e);
                return Err(e);
            }
            Err(_) => {
                warn!("[Directions] Lookup timed out after {:?} for {}", timeout, key);
                return Err(TrackerError::UpstreamUnavailable(format!(
                    "directions timed out after {:?}",
                    timeout
                )));
            }
        };

        let route = match RouteState::from_encoded(&response.encoded_polyline, response.duration_s()) {
            Ok(route) => Arc::new(route),
            Err(e) => {
                warn!("[Directions] Unusable route for {}: {}", key, e);
                return Err(e);
            }
        };

        info!(
            "[Directions] Fetched route for {}: {} points, {:.0}m, {}s",
            key,
            route.points.len(),
            route.total_distance_m,
            route.duration_s
        );

        cache.insert(key, Arc::clone(&route), now, ttl);
        Ok(route)
    }
}
