//! Session store: the single owner of all mutable tracking state.
//!
//! Holds per-rider smoothing histories, per-order route state, and both
//! upstream caches. State is partitioned by key: the outer maps are locked
//! only long enough to find or create a slot, and each slot carries its own
//! async mutex. Updates for one rider (or one order) queue on that slot in
//! arrival order; different riders never wait on each other.
//!
//! Clearing a session removes its slots and marks them retired. An update
//! that picked up a slot before the clear still runs to completion, but its
//! writes land in the retired slot and are dropped with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};

use crate::directions::DirectionsCache;
use crate::road_snap::SnapCache;
use crate::smoother::RiderHistory;
use crate::{RawSample, RouteState};

/// Smoothing history for one rider.
pub(crate) struct RiderSlot {
    history: tokio::sync::Mutex<RiderHistory>,
    retired: AtomicBool,
}

impl RiderSlot {
    fn new(window_size: usize) -> Self {
        Self {
            history: tokio::sync::Mutex::new(RiderHistory::new(window_size)),
            retired: AtomicBool::new(false),
        }
    }

    /// Wait for exclusive access to the history. FIFO across waiters.
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, RiderHistory> {
        self.history.lock().await
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Route state for one order: `None` until a route is established.
pub(crate) struct OrderSlot {
    route: tokio::sync::Mutex<Option<Arc<RouteState>>>,
    retired: AtomicBool,
}

impl OrderSlot {
    fn new() -> Self {
        Self {
            route: tokio::sync::Mutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<Arc<RouteState>>> {
        self.route.lock().await
    }

    /// Record `route` as the order's route, under the slot's lock.
    ///
    /// A route is established at most once per order. Returns false, leaving
    /// `current` alone, if the slot was retired or already has a route.
    pub(crate) fn establish(
        &self,
        current: &mut Option<Arc<RouteState>>,
        route: Arc<RouteState>,
    ) -> bool {
        if self.is_retired() || current.is_some() {
            return false;
        }
        *current = Some(route);
        true
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

/// Counts from one [`SessionStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub snaps_evicted: usize,
    pub routes_evicted: usize,
}

/// Owner of rider histories, order routes and upstream caches.
pub struct SessionStore {
    window_size: usize,
    riders: Mutex<HashMap<String, Arc<RiderSlot>>>,
    orders: Mutex<HashMap<String, Arc<OrderSlot>>>,
    snap_cache: SnapCache,
    directions_cache: DirectionsCache,
}

impl SessionStore {
    /// Create an empty store whose rider histories hold `window_size` samples.
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size,
            riders: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            snap_cache: SnapCache::new(),
            directions_cache: DirectionsCache::new(),
        }
    }

    fn riders(&self) -> MutexGuard<'_, HashMap<String, Arc<RiderSlot>>> {
        self.riders.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<String, Arc<OrderSlot>>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The rider's slot, created on first use.
    pub(crate) fn rider_slot(&self, rider_id: &str) -> Arc<RiderSlot> {
        let window_size = self.window_size;
        let mut riders = self.riders();
        Arc::clone(
            riders
                .entry(rider_id.to_string())
                .or_insert_with(|| Arc::new(RiderSlot::new(window_size))),
        )
    }

    /// The order's slot, created on first use.
    pub(crate) fn order_slot(&self, order_id: &str) -> Arc<OrderSlot> {
        let mut orders = self.orders();
        Arc::clone(
            orders
                .entry(order_id.to_string())
                .or_insert_with(|| Arc::new(OrderSlot::new())),
        )
    }

    pub fn snap_cache(&self) -> &SnapCache {
        &self.snap_cache
    }

    pub fn directions_cache(&self) -> &DirectionsCache {
        &self.directions_cache
    }

    pub fn has_rider(&self, rider_id: &str) -> bool {
        self.riders().contains_key(rider_id)
    }

    pub fn rider_count(&self) -> usize {
        self.riders().len()
    }

    pub fn order_count(&self) -> usize {
        self.orders().len()
    }

    /// Copy of the rider's current window, oldest first.
    pub async fn history_snapshot(&self, rider_id: &str) -> Option<Vec<RawSample>> {
        let slot = self.riders().get(rider_id).cloned()?;
        let history = slot.lock().await;
        Some(history.samples().cloned().collect())
    }

    /// The order's established route, if any.
    pub async fn route(&self, order_id: &str) -> Option<Arc<RouteState>> {
        let slot = self.orders().get(order_id).cloned()?;
        let route = slot.lock().await;
        route.clone()
    }

    /// Drop a rider's history. Idempotent; returns whether anything was removed.
    pub fn clear_rider(&self, rider_id: &str) -> bool {
        match self.riders().remove(rider_id) {
            Some(slot) => {
                slot.retired.store(true, Ordering::Release);
                info!("[Session] Cleared history for rider {}", rider_id);
                true
            }
            None => false,
        }
    }

    /// Drop an order's route state. Idempotent; returns whether anything was removed.
    pub fn clear_order(&self, order_id: &str) -> bool {
        match self.orders().remove(order_id) {
            Some(slot) => {
                slot.retired.store(true, Ordering::Release);
                info!("[Session] Cleared route state for order {}", order_id);
                true
            }
            None => false,
        }
    }

    /// Evict expired entries from both caches.
    pub fn sweep(&self, now: DateTime<Utc>, snap_ttl: Duration, directions_ttl: Duration) -> SweepStats {
        let stats = SweepStats {
            snaps_evicted: self.snap_cache.evict_expired(now, snap_ttl),
            routes_evicted: self.directions_cache.evict_expired(now, directions_ttl),
        };
        debug!(
            "[Session] Sweep evicted {} snap(s), {} route(s)",
            stats.snaps_evicted, stats.routes_evicted
        );
        stats
    }
}
