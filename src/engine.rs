//! Update pipeline.
//!
//! [`LocationEngine`] turns one raw fix into one [`BroadcastPayload`]:
//! validate, snap, smooth, establish the order's route if needed, match,
//! compose. The engine never persists or publishes; the caller does both.
//!
//! Per order the route goes from "none" to "established" exactly once, either
//! through [`LocationEngine::initialize_route`] or lazily on the first update
//! that carries pickup and drop-off hints.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::TrackerConfig;
use crate::directions::{DirectionsService, RouteProvider};
use crate::error::{Result, TrackerError};
use crate::matcher::match_progress;
use crate::road_snap::{RoadSnapGateway, RoadSnapService};
use crate::session::{OrderSlot, SessionStore, SweepStats};
use crate::smoother::smooth_sample;
use crate::{
    normalize_bearing, BroadcastPayload, Coordinate, ProgressResult, RawSample, RouteHints, RouteSummary,
    SmoothedSample,
};

// ============================================================================
// Order collaborator
// ============================================================================

/// Where an order starts and ends, and where its updates are published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderGeography {
    pub pickup: Coordinate,
    pub dropoff: Coordinate,
    /// Fan-out room for the order (restaurant and dispatcher view).
    pub room_key: String,
    pub customer_id: Option<String>,
}

impl OrderGeography {
    pub fn hints(&self) -> RouteHints {
        RouteHints { pickup: self.pickup, dropoff: self.dropoff }
    }

    /// Channels a payload for this order goes to: the order room, then the
    /// customer's own channel when the customer is known.
    pub fn channels(&self) -> Vec<String> {
        let mut channels = vec![self.room_key.clone()];
        if let Some(customer_id) = &self.customer_id {
            channels.push(format!("customer:{}", customer_id));
        }
        channels
    }
}

/// Read-only lookup of order geography, owned by the order service.
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    async fn geography(&self, order_id: &str) -> Option<OrderGeography>;
}

/// A payload together with the channels it should be published on.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedPayload {
    pub payload: BroadcastPayload,
    /// Empty when the order is unknown to the directory.
    pub channels: Vec<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// Real-time location engine for active deliveries.
pub struct LocationEngine {
    config: TrackerConfig,
    clock: Arc<dyn Clock>,
    store: Arc<SessionStore>,
    road_snap: RoadSnapGateway,
    routes: RouteProvider,
    last_timestamp_ms: AtomicI64,
}

impl LocationEngine {
    /// Create an engine backed by `directions`, with road snapping off and
    /// the system clock.
    pub fn new(config: TrackerConfig, directions: Arc<dyn DirectionsService>) -> Self {
        let store = Arc::new(SessionStore::new(config.smoothing.window_size));
        let routes = RouteProvider::new(directions, config.directions.clone());
        Self {
            config,
            clock: Arc::new(SystemClock),
            store,
            road_snap: RoadSnapGateway::disabled(),
            routes,
            last_timestamp_ms: AtomicI64::new(0),
        }
    }

    /// Attach a snap-to-road service. It is only called when
    /// `config.road_snap.enabled` is set.
    pub fn with_road_snap(mut self, service: Arc<dyn RoadSnapService>) -> Self {
        self.road_snap = RoadSnapGateway::new(service, self.config.road_snap.clone());
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// The session store holding all per-rider and per-order state.
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Process one fix and return the payload to broadcast.
    ///
    /// The only error is [`TrackerError::InvalidInput`], returned before any
    /// state is touched. Upstream failures degrade to unsnapped positions or
    /// an unknown route; a panic inside the pipeline degrades to the raw fix
    /// with `degraded` set.
    pub async fn process_update(
        &self,
        sample: RawSample,
        hints: Option<RouteHints>,
    ) -> Result<BroadcastPayload> {
        if let Err(e) = sample.validate() {
            debug!("[Engine] Rejected fix from rider {}: {}", sample.rider_id, e);
            return Err(e);
        }
        let sample = RawSample {
            bearing_deg: normalize_bearing(sample.bearing_deg),
            ..sample
        };

        let now = self.clock.now();
        let outcome = AssertUnwindSafe(self.run_pipeline(&sample, hints.as_ref(), now))
            .catch_unwind()
            .await;

        match outcome {
            Ok(payload) => Ok(payload),
            Err(panic) => {
                error!(
                    "[Engine] Update for rider {} / order {} panicked, publishing raw fix: {}",
                    sample.rider_id,
                    sample.order_id,
                    panic_message(&*panic)
                );
                let mut payload = BroadcastPayload::raw(&sample, self.next_timestamp_ms(now));
                payload.degraded = true;
                Ok(payload)
            }
        }
    }

    /// Like [`process_update`](Self::process_update), with route hints and
    /// fan-out channels resolved through `directory`.
    pub async fn process_update_for_order(
        &self,
        sample: RawSample,
        directory: &dyn OrderDirectory,
    ) -> Result<RoutedPayload> {
        sample.validate()?;

        let geography = directory.geography(&sample.order_id).await;
        if geography.is_none() {
            debug!("[Engine] No geography for order {}", sample.order_id);
        }

        let hints = geography.as_ref().map(OrderGeography::hints);
        let payload = self.process_update(sample, hints).await?;
        Ok(RoutedPayload {
            payload,
            channels: geography.map(|g| g.channels()).unwrap_or_default(),
        })
    }

    async fn run_pipeline(
        &self,
        sample: &RawSample,
        hints: Option<&RouteHints>,
        now: DateTime<Utc>,
    ) -> BroadcastPayload {
        // Both slots are pinned on arrival, so a clear issued while this update
        // waits retires the slots it writes to
        let rider_slot = self.store.rider_slot(&sample.rider_id);
        let order_slot = self.store.order_slot(&sample.order_id);
        // Held for the whole update so one rider's fixes are processed in order
        let mut history = rider_slot.lock().await;

        let snap = self
            .road_snap
            .snap(&sample.rider_id, &[sample.coord], self.store.snap_cache(), now)
            .await;
        let mut working = sample.clone();
        if let Some(point) = snap.points.first() {
            working.coord = *point;
        }

        let smoothed = smooth_sample(&mut history, &working, &self.config.smoothing);
        let progress = self
            .progress_for(&order_slot, &sample.order_id, &smoothed, hints, now)
            .await;

        if rider_slot.is_retired() {
            debug!(
                "[Engine] Rider {} was cleared mid-update, history write dropped",
                sample.rider_id
            );
        }

        BroadcastPayload::compose(
            sample,
            &smoothed,
            progress.as_ref(),
            snap.snapped,
            self.next_timestamp_ms(now),
        )
    }

    /// Match `smoothed` onto the order's route, fetching the route first if
    /// the order has none and hints are available.
    async fn progress_for(
        &self,
        slot: &OrderSlot,
        order_id: &str,
        smoothed: &SmoothedSample,
        hints: Option<&RouteHints>,
        now: DateTime<Utc>,
    ) -> Option<ProgressResult> {
        let mut current = slot.lock().await;

        if current.is_none() {
            match hints {
                Some(_) if slot.is_retired() => {
                    debug!("[Engine] Order {} was cleared, skipping route lookup", order_id);
                }
                Some(h) if h.pickup.is_valid() && h.dropoff.is_valid() => {
                    match self
                        .routes
                        .route(smoothed.coord, h.pickup, h.dropoff, self.store.directions_cache(), now)
                        .await
                    {
                        Ok(route) => {
                            let points = route.points.len();
                            let distance = route.total_distance_m;
                            if slot.establish(&mut current, route) {
                                info!(
                                    "[Engine] Route established for order {}: {} points, {:.0}m",
                                    order_id, points, distance
                                );
                            } else {
                                warn!(
                                    "[Engine] Order {} was cleared during route lookup, route discarded",
                                    order_id
                                );
                            }
                        }
                        Err(e) => {
                            warn!("[Engine] Route unknown for order {}: {}", order_id, e);
                        }
                    }
                }
                Some(_) => warn!("[Engine] Ignoring out-of-range route hints for order {}", order_id),
                None => {}
            }
        }

        let route = current.clone()?;
        drop(current);
        match_progress(&route, smoothed)
    }

    /// Establish the route for `order_id` from the rider's position via the
    /// pickup to the drop-off.
    ///
    /// An order that already has a route keeps it and gets its summary back.
    /// Fails with [`TrackerError::InvalidInput`] for out-of-range coordinates
    /// and [`TrackerError::NoRouteFound`] when no route can be obtained.
    pub async fn initialize_route(
        &self,
        order_id: &str,
        rider: Coordinate,
        pickup: Coordinate,
        dropoff: Coordinate,
    ) -> Result<RouteSummary> {
        rider.validate()?;
        pickup.validate()?;
        dropoff.validate()?;

        let outcome = AssertUnwindSafe(self.establish_route(order_id, rider, pickup, dropoff))
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => result,
            Err(panic) => {
                error!(
                    "[Engine] Route initialization for order {} panicked: {}",
                    order_id,
                    panic_message(&*panic)
                );
                Err(TrackerError::NoRouteFound(format!(
                    "internal failure initializing route for order {}",
                    order_id
                )))
            }
        }
    }

    async fn establish_route(
        &self,
        order_id: &str,
        rider: Coordinate,
        pickup: Coordinate,
        dropoff: Coordinate,
    ) -> Result<RouteSummary> {
        let slot = self.store.order_slot(order_id);
        let mut current = slot.lock().await;

        if let Some(route) = current.as_ref() {
            debug!("[Engine] Order {} already has a route", order_id);
            return Ok(RouteSummary::new(order_id, route));
        }

        let route = self
            .routes
            .route(rider, pickup, dropoff, self.store.directions_cache(), self.clock.now())
            .await
            .map_err(|e| match e {
                TrackerError::NoRouteFound(_) => e,
                other => TrackerError::NoRouteFound(format!("order {}: {}", order_id, other)),
            })?;

        let summary = RouteSummary::new(order_id, &route);
        if slot.establish(&mut current, route) {
            info!(
                "[Engine] Route initialized for order {}: {} points, {:.0}m, {}s",
                order_id, summary.point_count, summary.total_distance_m, summary.duration_s
            );
        } else {
            warn!(
                "[Engine] Order {} was cleared during route initialization, route not kept",
                order_id
            );
        }
        Ok(summary)
    }

    /// Drop a rider's history and/or an order's route state. Idempotent.
    ///
    /// Updates already in flight for either still complete, but their writes
    /// are discarded.
    pub fn clear_session(&self, rider_id: Option<&str>, order_id: Option<&str>) {
        if let Some(rider_id) = rider_id {
            self.store.clear_rider(rider_id);
            self.road_snap.forget_rider(rider_id);
        }
        if let Some(order_id) = order_id {
            self.store.clear_order(order_id);
        }
    }

    /// Evict expired cache and throttle entries.
    pub fn sweep(&self) -> SweepStats {
        let now = self.clock.now();
        let throttled = self.road_snap.sweep_throttle(now);
        if throttled > 0 {
            debug!("[Engine] Dropped {} stale throttle entries", throttled);
        }
        self.store.sweep(
            now,
            self.config.road_snap.cache_ttl(),
            self.config.directions.cache_ttl(),
        )
    }

    /// Run [`sweep`](Self::sweep) every `interval` until the engine is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match engine.upgrade() {
                    Some(engine) => {
                        engine.sweep();
                    }
                    None => {
                        debug!("[Engine] Engine dropped, sweeper exiting");
                        break;
                    }
                }
            }
        })
    }

    /// Milliseconds since the epoch, strictly greater than any previously
    /// issued by this engine.
    fn next_timestamp_ms(&self, now: DateTime<Utc>) -> i64 {
        let now_ms = now.timestamp_millis();
        let mut prev = self.last_timestamp_ms.load(Ordering::Relaxed);
        loop {
            let next = now_ms.max(prev + 1);
            match self.last_timestamp_ms.compare_exchange_weak(
                prev,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RoadSnapConfig;
    use crate::directions::{DirectionsRoute, RouteLeg};
    use crate::geo_utils;
    use approx::assert_relative_eq;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn bengaluru_route() -> Vec<Coordinate> {
        vec![
            Coordinate::new(12.9716, 77.5946),
            Coordinate::new(12.9720, 77.5950),
            Coordinate::new(12.9730, 77.5970),
        ]
    }

    #[derive(Default)]
    struct FakeDirections {
        calls: AtomicUsize,
        fail: bool,
        /// When set, each call signals `entered` and waits for `release`.
        gated: bool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl DirectionsService for FakeDirections {
        async fn route(&self, _: Coordinate, _: Coordinate, _: Coordinate) -> Result<DirectionsRoute> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            if self.fail {
                return Err(TrackerError::UpstreamUnavailable("HTTP 503".into()));
            }
            Ok(DirectionsRoute {
                encoded_polyline: geo_utils::encode_polyline(&bengaluru_route()),
                legs: vec![RouteLeg { distance_m: 305.0, duration_s: 120 }],
            })
        }
    }

    struct PanickingRoads;

    #[async_trait]
    impl RoadSnapService for PanickingRoads {
        async fn snap(&self, _: &[Coordinate]) -> Result<Vec<Coordinate>> {
            panic!("snap service blew up");
        }
    }

    /// Moves every point slightly north. When gated, each call signals
    /// `entered` and waits for `release`.
    #[derive(Default)]
    struct ShiftingRoads {
        calls: AtomicUsize,
        gated: bool,
        entered: Notify,
        release: Notify,
    }

    const SNAP_SHIFT: f64 = 0.0001;

    #[async_trait]
    impl RoadSnapService for ShiftingRoads {
        async fn snap(&self, points: &[Coordinate]) -> Result<Vec<Coordinate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.gated {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(points.iter().map(|p| Coordinate::new(p.lat + SNAP_SHIFT, p.lng)).collect())
        }
    }

    fn snapping_engine(roads: Arc<ShiftingRoads>, directions: Arc<FakeDirections>) -> LocationEngine {
        let config = TrackerConfig {
            road_snap: RoadSnapConfig { enabled: true, ..RoadSnapConfig::default() },
            ..TrackerConfig::default()
        };
        LocationEngine::new(config, directions)
            .with_road_snap(roads)
            .with_clock(Arc::new(ManualClock::default()))
    }

    struct Directory;

    #[async_trait]
    impl OrderDirectory for Directory {
        async fn geography(&self, order_id: &str) -> Option<OrderGeography> {
            let route = bengaluru_route();
            (order_id == "order-1").then(|| OrderGeography {
                pickup: route[1],
                dropoff: route[2],
                room_key: "order:order-1".into(),
                customer_id: Some("cust-9".into()),
            })
        }
    }

    fn engine_with(fake: Arc<FakeDirections>) -> (LocationEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let engine = LocationEngine::new(TrackerConfig::default(), fake).with_clock(clock.clone());
        (engine, clock)
    }

    fn fix(lat: f64, lng: f64) -> RawSample {
        RawSample::new("rider-1", "order-1", Coordinate::new(lat, lng), Utc::now())
    }

    fn hints() -> RouteHints {
        let route = bengaluru_route();
        RouteHints { pickup: route[1], dropoff: route[2] }
    }

    #[tokio::test]
    async fn test_end_to_end_progress_along_route() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());
        let route = bengaluru_route();

        let summary = engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap();
        assert_eq!(summary.point_count, 3);
        assert!(summary.total_distance_m > 280.0 && summary.total_distance_m < 330.0);

        let first = engine.process_update(fix(12.9718, 77.5948), None).await.unwrap();
        assert!(first.route_matched);
        assert!(first.progress_fraction >= 0.0 && first.progress_fraction < 0.5);

        let forward = [
            (12.9720, 77.5950),
            (12.9723, 77.5956),
            (12.9726, 77.5962),
            (12.9730, 77.5970),
            (12.9730, 77.5970),
            (12.9730, 77.5970),
        ];
        let mut last_remaining = first.remaining_distance_m;
        for (lat, lng) in forward {
            let payload = engine.process_update(fix(lat, lng), None).await.unwrap();
            assert!((0.0..=1.0).contains(&payload.progress_fraction));
            assert!(payload.remaining_distance_m <= last_remaining);
            last_remaining = payload.remaining_distance_m;
        }
        assert!(last_remaining < first.remaining_distance_m);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_latitude_touches_nothing() {
        let (engine, _) = engine_with(Arc::new(FakeDirections::default()));

        let err = engine.process_update(fix(95.0, 77.5946), Some(hints())).await.unwrap_err();

        assert!(matches!(err, TrackerError::InvalidInput(_)));
        assert!(!engine.store().has_rider("rider-1"));
        assert_eq!(engine.store().rider_count(), 0);
        assert_eq!(engine.store().order_count(), 0);
    }

    #[tokio::test]
    async fn test_lazy_route_from_hints() {
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());

        let payload = engine.process_update(fix(12.9716, 77.5946), Some(hints())).await.unwrap();
        assert!(payload.route_matched);
        assert!(payload.next_point.is_some());

        engine.process_update(fix(12.9717, 77.5947), Some(hints())).await.unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert!(engine.store().route("order-1").await.is_some());
    }

    #[tokio::test]
    async fn test_no_hints_publishes_unmatched_position() {
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());

        let payload = engine.process_update(fix(12.9716, 77.5946), None).await.unwrap();

        assert!(!payload.route_matched);
        assert!(!payload.snapped);
        assert_eq!(payload.progress_fraction, 0.0);
        assert_eq!(payload.current_point, None);
        assert_eq!(payload.coord, Coordinate::new(12.9716, 77.5946));
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_directions_failure_still_publishes() {
        let fake = Arc::new(FakeDirections { fail: true, ..FakeDirections::default() });
        let (engine, _) = engine_with(fake.clone());

        let payload = engine.process_update(fix(12.9716, 77.5946), Some(hints())).await.unwrap();

        assert!(!payload.route_matched);
        assert!(!payload.degraded);
        assert!(engine.store().route("order-1").await.is_none());
    }

    #[tokio::test]
    async fn test_initialize_route_shares_cached_route() {
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());
        let route = bengaluru_route();
        let nudged = Coordinate::new(route[0].lat + 0.00002, route[0].lng);

        let a = engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap();
        let b = engine.initialize_route("order-2", nudged, route[1], route[2]).await.unwrap();

        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.encoded_polyline, b.encoded_polyline);
        assert_eq!(
            engine.store().route("order-1").await.unwrap(),
            engine.store().route("order-2").await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_initialize_route_keeps_established_route() {
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());
        let route = bengaluru_route();

        let first = engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap();
        let far = Coordinate::new(13.5, 78.0);
        let second = engine.initialize_route("order-1", far, far, far).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_initialize_route_errors() {
        let (engine, _) = engine_with(Arc::new(FakeDirections { fail: true, ..FakeDirections::default() }));
        let route = bengaluru_route();

        let err = engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap_err();
        assert!(matches!(err, TrackerError::NoRouteFound(_)));

        let err = engine
            .initialize_route("order-1", route[0], Coordinate::new(0.0, 200.0), route[2])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_clear_session_discards_in_flight_route() {
        let fake = Arc::new(FakeDirections { gated: true, ..FakeDirections::default() });
        let (engine, _) = engine_with(fake.clone());
        let engine = Arc::new(engine);

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.process_update(fix(12.9716, 77.5946), Some(hints())).await })
        };

        fake.entered.notified().await;
        engine.clear_session(Some("rider-1"), Some("order-1"));
        fake.release.notify_one();

        let payload = task.await.unwrap().unwrap();
        assert!(!payload.route_matched);
        assert!(engine.store().route("order-1").await.is_none());
        assert!(!engine.store().has_rider("rider-1"));
        assert_eq!(engine.store().order_count(), 0);
    }

    #[tokio::test]
    async fn test_clear_session_during_snap_discards_route() {
        let roads = Arc::new(ShiftingRoads { gated: true, ..ShiftingRoads::default() });
        let directions = Arc::new(FakeDirections::default());
        let engine = Arc::new(snapping_engine(roads.clone(), directions.clone()));

        let task = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.process_update(fix(12.9716, 77.5946), Some(hints())).await })
        };

        roads.entered.notified().await;
        engine.clear_session(Some("rider-1"), Some("order-1"));
        roads.release.notify_one();

        let payload = task.await.unwrap().unwrap();
        assert!(!payload.route_matched);
        assert_eq!(directions.calls.load(Ordering::SeqCst), 0);
        assert_eq!(engine.store().order_count(), 0);
        assert!(engine.store().route("order-1").await.is_none());
        assert!(!engine.store().has_rider("rider-1"));
    }

    #[tokio::test]
    async fn test_snapped_position_reaches_payload() {
        let roads = Arc::new(ShiftingRoads::default());
        let engine = snapping_engine(roads.clone(), Arc::new(FakeDirections::default()));
        let raw = fix(12.9716, 77.5946);

        let payload = engine.process_update(raw.clone(), None).await.unwrap();

        assert!(payload.snapped);
        assert_eq!(roads.calls.load(Ordering::SeqCst), 1);
        assert!((payload.coord.lat - (raw.coord.lat + SNAP_SHIFT)).abs() < 1e-12);
        assert_eq!(payload.coord.lng, raw.coord.lng);

        // The smoother saw the snapped fix, not the raw one
        let history = engine.store().history_snapshot("rider-1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert!((history[0].coord.lat - (raw.coord.lat + SNAP_SHIFT)).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_out_of_range_bearing_normalized() {
        let (engine, _) = engine_with(Arc::new(FakeDirections::default()));
        let mut raw = fix(12.9716, 77.5946);
        raw.bearing_deg = 400.0;

        let payload = engine.process_update(raw, None).await.unwrap();

        assert_relative_eq!(payload.bearing_deg, 40.0, epsilon = 1e-9);
        let history = engine.store().history_snapshot("rider-1").await.unwrap();
        assert_relative_eq!(history[0].bearing_deg, 40.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_clear_session_idempotent() {
        let (engine, _) = engine_with(Arc::new(FakeDirections::default()));
        engine.process_update(fix(12.9716, 77.5946), None).await.unwrap();

        engine.clear_session(Some("rider-1"), Some("order-1"));
        engine.clear_session(Some("rider-1"), Some("order-1"));
        engine.clear_session(None, None);

        assert!(engine.store().history_snapshot("rider-1").await.is_none());
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase() {
        let (engine, _) = engine_with(Arc::new(FakeDirections::default()));

        let mut last = i64::MIN;
        for _ in 0..5 {
            // Clock is frozen, so every update sees the same instant
            let payload = engine.process_update(fix(12.9716, 77.5946), None).await.unwrap();
            assert!(payload.timestamp_ms > last);
            last = payload.timestamp_ms;
        }
    }

    #[tokio::test]
    async fn test_panic_degrades_to_raw_fix() {
        let config = TrackerConfig {
            road_snap: RoadSnapConfig { enabled: true, ..RoadSnapConfig::default() },
            ..TrackerConfig::default()
        };
        let engine = LocationEngine::new(config, Arc::new(FakeDirections::default()))
            .with_road_snap(Arc::new(PanickingRoads))
            .with_clock(Arc::new(ManualClock::default()));
        let raw = fix(12.9716, 77.5946).with_speed(80.0);

        let payload = engine.process_update(raw.clone(), None).await.unwrap();
        assert!(payload.degraded);
        assert!(!payload.route_matched);
        assert_eq!(payload.coord, raw.coord);
        assert_eq!(payload.speed_kmh, 80.0);

        // The rider's lock was released; the next fix is throttled past the
        // snap service and processes normally
        let payload = engine.process_update(fix(12.9717, 77.5947), None).await.unwrap();
        assert!(!payload.degraded);
    }

    #[tokio::test]
    async fn test_process_update_for_order() {
        let fake = Arc::new(FakeDirections::default());
        let (engine, _) = engine_with(fake.clone());

        let routed = engine.process_update_for_order(fix(12.9716, 77.5946), &Directory).await.unwrap();
        assert!(routed.payload.route_matched);
        assert_eq!(routed.channels, vec!["order:order-1".to_string(), "customer:cust-9".to_string()]);

        let unknown = RawSample::new("rider-2", "order-404", Coordinate::new(12.9716, 77.5946), Utc::now());
        let routed = engine.process_update_for_order(unknown, &Directory).await.unwrap();
        assert!(!routed.payload.route_matched);
        assert!(routed.channels.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_routes() {
        let (engine, clock) = engine_with(Arc::new(FakeDirections::default()));
        let route = bengaluru_route();
        engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap();

        assert_eq!(engine.sweep().routes_evicted, 0);
        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(engine.sweep().routes_evicted, 1);

        // The order keeps its established route
        assert!(engine.store().route("order-1").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let (engine, clock) = engine_with(Arc::new(FakeDirections::default()));
        let engine = Arc::new(engine);
        let route = bengaluru_route();
        engine.initialize_route("order-1", route[0], route[1], route[2]).await.unwrap();
        assert_eq!(engine.store().directions_cache().len(), 1);

        clock.advance(chrono::Duration::minutes(10));
        let handle = engine.spawn_sweeper(std::time::Duration::from_secs(30));
        tokio::time::sleep(std::time::Duration::from_secs(31)).await;

        assert!(engine.store().directions_cache().is_empty());
        handle.abort();
    }
}
