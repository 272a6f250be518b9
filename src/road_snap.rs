//! Snap-to-road gateway.
//!
//! Optionally moves raw fixes onto the road network through an external
//! service, while keeping call volume to that (billed) service low:
//! - Global switch, off by default
//! - Per-rider throttle: at most one upstream call per rider per window;
//!   answers served entirely from cache do not count
//! - Spatial cache: a snap computed for a point is reused for anything
//!   within `cache_radius_m` of it
//! - Batching: uncached points go upstream in chunks of `max_batch_size`,
//!   concurrently, each bounded by a timeout
//!
//! Every failure path returns the original points. Snapping can make an
//! update better but never makes it fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use log::{debug, info, warn};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::config::RoadSnapConfig;
use crate::error::Result;
use crate::geo_utils::{haversine_distance, meters_to_degrees};
use crate::Coordinate;

/// Decimal places used to key cached snaps by their original coordinate.
const CACHE_KEY_DECIMALS: usize = 6;

/// External snap-to-road service.
#[async_trait]
pub trait RoadSnapService: Send + Sync {
    /// Snap a batch of points onto the road network.
    ///
    /// Implementations must return exactly one point per input, in order.
    async fn snap(&self, points: &[Coordinate]) -> Result<Vec<Coordinate>>;
}

/// Result of running points through the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapOutcome {
    pub points: Vec<Coordinate>,
    /// At least one point came from the upstream service or the cache.
    pub snapped: bool,
}

impl SnapOutcome {
    fn unchanged(points: &[Coordinate]) -> Self {
        Self { points: points.to_vec(), snapped: false }
    }
}

// ============================================================================
// Spatial Cache
// ============================================================================

#[derive(Debug, Clone)]
struct SnapCacheEntry {
    original: Coordinate,
    snapped: Coordinate,
    cached_at: DateTime<Utc>,
}

/// R-tree handle for a cached snap, positioned at the original coordinate.
#[derive(Debug, Clone, PartialEq)]
struct IndexedSnap {
    key: String,
    position: [f64; 2], // [lng, lat]
}

impl RTreeObject for IndexedSnap {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.position)
    }
}

impl PointDistance for IndexedSnap {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.position[0] - point[0];
        let dy = self.position[1] - point[1];
        dx * dx + dy * dy
    }
}

#[derive(Default)]
struct SnapCacheInner {
    entries: HashMap<String, SnapCacheEntry>,
    index: RTree<IndexedSnap>,
}

impl SnapCacheInner {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.index.remove(&IndexedSnap {
                key: key.to_string(),
                position: [entry.original.lng, entry.original.lat],
            });
        }
    }

    fn evict_expired(&mut self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| now - e.cached_at >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.cached_at)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.remove(&key);
        }
    }
}

/// Cache of snap results, keyed by the original (unsnapped) coordinate and
/// searchable by distance.
#[derive(Default)]
pub struct SnapCache {
    inner: Mutex<SnapCacheInner>,
}

impl SnapCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapCacheInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find a fresh snap computed for a point within `radius_m` of `point`.
    ///
    /// The closest qualifying entry wins. The search box does not wrap
    /// across the antimeridian, so entries on the far side of ±180° are
    /// not found.
    pub fn lookup(
        &self,
        point: &Coordinate,
        radius_m: f64,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Option<Coordinate> {
        let inner = self.lock();
        let radius_deg = meters_to_degrees(radius_m, point.lat);

        inner
            .index
            .locate_within_distance([point.lng, point.lat], radius_deg * radius_deg)
            .filter_map(|candidate| inner.entries.get(&candidate.key))
            .filter(|entry| now - entry.cached_at < ttl)
            .map(|entry| (haversine_distance(&entry.original, point), entry.snapped))
            .filter(|(dist, _)| *dist <= radius_m)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, snapped)| snapped)
    }

    /// Store a snap result, evicting expired entries and then the oldest
    /// entries if the cache is full.
    pub fn insert(
        &self,
        original: Coordinate,
        snapped: Coordinate,
        now: DateTime<Utc>,
        ttl: Duration,
        max_entries: usize,
    ) {
        let mut inner = self.lock();
        let key = original.bucket_key(CACHE_KEY_DECIMALS);
        inner.remove(&key);

        inner.evict_expired(now, ttl);
        while !inner.entries.is_empty() && inner.entries.len() >= max_entries.max(1) {
            inner.evict_oldest();
        }

        inner.index.insert(IndexedSnap {
            key: key.clone(),
            position: [original.lng, original.lat],
        });
        inner.entries.insert(key, SnapCacheEntry { original, snapped, cached_at: now });
    }

    /// Drop every entry at least `ttl` old. Returns the number evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        self.lock().evict_expired(now, ttl)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.index = RTree::new();
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Throttled, cache-backed front for a [`RoadSnapService`].
pub struct RoadSnapGateway {
    service: Option<Arc<dyn RoadSnapService>>,
    config: RoadSnapConfig,
    last_call: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl RoadSnapGateway {
    pub fn new(service: Arc<dyn RoadSnapService>, config: RoadSnapConfig) -> Self {
        if config.enabled {
            info!(
                "[RoadSnap] Enabled (throttle {}s, cache radius {}m, batch {})",
                config.throttle_secs, config.cache_radius_m, config.max_batch_size
            );
        }
        Self {
            service: Some(service),
            config,
            last_call: Mutex::new(HashMap::new()),
        }
    }

    /// A gateway with no upstream service; always returns input unchanged.
    pub fn disabled() -> Self {
        Self {
            service: None,
            config: RoadSnapConfig { enabled: false, ..RoadSnapConfig::default() },
            last_call: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RoadSnapConfig {
        &self.config
    }

    /// Snap `points` for `rider_id`, consulting `cache` first.
    ///
    /// Returns the input unchanged when snapping is disabled or the rider
    /// is throttled. Failed or timed-out batches keep their original points.
    pub async fn snap(
        &self,
        rider_id: &str,
        points: &[Coordinate],
        cache: &SnapCache,
        now: DateTime<Utc>,
    ) -> SnapOutcome {
        let service = match &self.service {
            Some(service) if self.config.enabled && !points.is_empty() => service,
            _ => return SnapOutcome::unchanged(points),
        };

        if self.is_throttled(rider_id, now) {
            debug!("[RoadSnap] Rider {} throttled, keeping raw points", rider_id);
            return SnapOutcome::unchanged(points);
        }

        let ttl = self.config.cache_ttl();
        let mut result = points.to_vec();
        let mut snapped = false;
        let mut misses: Vec<usize> = Vec::new();

        for (i, point) in points.iter().enumerate() {
            match cache.lookup(point, self.config.cache_radius_m, ttl, now) {
                Some(hit) => {
                    result[i] = hit;
                    snapped = true;
                }
                None => misses.push(i),
            }
        }

        if misses.is_empty() {
            debug!("[RoadSnap] {} point(s) served from cache for {}", points.len(), rider_id);
            return SnapOutcome { points: result, snapped };
        }

        // Only upstream calls start the throttle window
        if !self.try_acquire(rider_id, now) {
            debug!("[RoadSnap] Rider {} throttled, {} point(s) left unsnapped", rider_id, misses.len());
            return SnapOutcome { points: result, snapped };
        }

        let batches: Vec<Vec<usize>> = misses
            .chunks(self.config.max_batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let timeout = self.config.timeout();

        let calls = batches.iter().map(|indices| {
            let batch: Vec<Coordinate> = indices.iter().map(|&i| points[i]).collect();
            async move {
                let outcome = tokio::time::timeout(timeout, service.snap(&batch)).await;
                (batch, outcome)
            }
        });
        let outcomes = join_all(calls).await;

        for (indices, (batch, outcome)) in batches.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(snapped_batch))
                    if snapped_batch.len() == batch.len()
                        && snapped_batch.iter().all(Coordinate::is_valid) =>
                {
                    for ((&i, original), snapped_point) in indices.iter().zip(&batch).zip(snapped_batch) {
                        cache.insert(*original, snapped_point, now, ttl, self.config.max_cache_entries);
                        result[i] = snapped_point;
                    }
                    snapped = true;
                }
                Ok(Ok(snapped_batch)) => {
                    warn!(
                        "[RoadSnap] Upstream returned {} usable points for a batch of {}, keeping originals",
                        snapped_batch.len(),
                        batch.len()
                    );
                }
                Ok(Err(e)) => {
                    warn!("[RoadSnap] Batch of {} failed for {}: {}", batch.len(), rider_id, e);
                }
                Err(_) => {
                    warn!(
                        "[RoadSnap] Batch of {} timed out after {:?} for {}",
                        batch.len(),
                        timeout,
                        rider_id
                    );
                }
            }
        }

        SnapOutcome { points: result, snapped }
    }

    /// Whether an upstream call was made for the rider within the throttle window.
    fn is_throttled(&self, rider_id: &str, now: DateTime<Utc>) -> bool {
        let last_call = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        last_call
            .get(rider_id)
            .is_some_and(|last| now - *last < self.config.throttle())
    }

    /// Claim the rider's upstream slot if the throttle window has passed.
    fn try_acquire(&self, rider_id: &str, now: DateTime<Utc>) -> bool {
        let mut last_call = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last_call.get(rider_id) {
            if now - *last < self.config.throttle() {
                return false;
            }
        }
        last_call.insert(rider_id.to_string(), now);
        true
    }

    /// Forget throttle state for a rider whose delivery ended.
    pub fn forget_rider(&self, rider_id: &str) {
        self.last_call
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(rider_id);
    }

    /// Drop throttle entries older than the throttle window.
    pub fn sweep_throttle(&self, now: DateTime<Utc>) -> usize {
        let throttle = self.config.throttle();
        let mut last_call = self.last_call.lock().unwrap_or_else(|e| e.into_inner());
        let before = last_call.len();
        last_call.retain(|_, last| now - *last < throttle);
        before - last_call.len()
    }
}
