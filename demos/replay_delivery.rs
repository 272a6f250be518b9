//! Replays a short delivery through the engine using in-memory services.
//!
//! Run with: RUST_LOG=debug cargo run --example replay_delivery

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rider_tracker::{
    geo_utils, Coordinate, DirectionsRoute, DirectionsService, LocationEngine, LocationFix,
    OrderDirectory, OrderGeography, RoadSnapService, RouteLeg, TrackerConfig, TrackerError,
};

/// Always routes along a fixed street in Bengaluru.
struct FixedDirections {
    path: Vec<Coordinate>,
}

#[async_trait]
impl DirectionsService for FixedDirections {
    async fn route(
        &self,
        _origin: Coordinate,
        _waypoint: Coordinate,
        _destination: Coordinate,
    ) -> rider_tracker::Result<DirectionsRoute> {
        Ok(DirectionsRoute {
            encoded_polyline: geo_utils::encode_polyline(&self.path),
            legs: vec![RouteLeg {
                distance_m: geo_utils::polyline_length(&self.path),
                duration_s: 120,
            }],
        })
    }
}

/// Rounds fixes to 4 decimals, roughly what a road snap does to GPS jitter.
struct GridRoads;

#[async_trait]
impl RoadSnapService for GridRoads {
    async fn snap(&self, points: &[Coordinate]) -> rider_tracker::Result<Vec<Coordinate>> {
        Ok(points
            .iter()
            .map(|p| Coordinate::new((p.lat * 1e4).round() / 1e4, (p.lng * 1e4).round() / 1e4))
            .collect())
    }
}

struct Orders {
    geography: OrderGeography,
}

#[async_trait]
impl OrderDirectory for Orders {
    async fn geography(&self, order_id: &str) -> Option<OrderGeography> {
        (order_id == "order-42").then(|| self.geography.clone())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), TrackerError> {
    env_logger::init();

    let path = vec![
        Coordinate::new(12.9716, 77.5946),
        Coordinate::new(12.9720, 77.5950),
        Coordinate::new(12.9730, 77.5970),
    ];

    let config = TrackerConfig::from_json(r#"{"road_snap": {"enabled": true, "throttle_secs": 0}}"#)?;
    let engine = LocationEngine::new(config, Arc::new(FixedDirections { path: path.clone() }))
        .with_road_snap(Arc::new(GridRoads));

    let orders = Orders {
        geography: OrderGeography {
            pickup: path[1],
            dropoff: path[2],
            room_key: "order:order-42".to_string(),
            customer_id: Some("customer-7".to_string()),
        },
    };

    println!("Replaying delivery order-42\n");

    // What a rider's device would send, a few seconds apart
    let fixes = r#"[
        {"lat": 12.97161, "lng": 77.59462, "speed": 18.0, "accuracy": 12.0},
        {"lat": 12.97182, "lng": 77.59479, "speed": 21.5},
        {"lat": 12.97201, "lng": 77.59503, "speed": 24.0, "bearing": 45.0},
        {"lat": 12.97233, "lng": 77.59561},
        {"lat": 12.97262, "lng": 77.59622, "speed": 31.0},
        {"lat": 12.97298, "lng": 77.59697, "speed": 12.0},
        {"lat": 95.0, "lng": 77.59697}
    ]"#;
    let fixes: Vec<LocationFix> = serde_json::from_str(fixes)
        .map_err(|e| TrackerError::InvalidInput(format!("fixes: {}", e)))?;

    for (i, fix) in fixes.into_iter().enumerate() {
        let sample = fix.into_sample("rider-7", "order-42", Utc::now(), &engine.config().smoothing);
        match engine.process_update_for_order(sample, &orders).await {
            Ok(routed) => {
                let p = &routed.payload;
                println!(
                    "{}. ({:.5}, {:.5}) {:>5.1} km/h {:>5.1}° | {:>5.1}% done, {:>5.0}m left | snapped={} matched={}",
                    i + 1,
                    p.coord.lat,
                    p.coord.lng,
                    p.speed_kmh,
                    p.bearing_deg,
                    p.progress_fraction * 100.0,
                    p.remaining_distance_m,
                    p.snapped,
                    p.route_matched
                );
                println!("   -> {}", routed.channels.join(", "));
            }
            Err(e) => println!("{}. rejected: {}", i + 1, e),
        }
    }

    engine.clear_session(Some("rider-7"), Some("order-42"));
    println!("\nSession cleared, {} rider(s) tracked", engine.store().rider_count());

    Ok(())
}
