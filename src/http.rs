//! HTTP clients for the snap-to-road and directions services.
//!
//! Both clients share one transport that provides:
//! - Connection pooling through a single reqwest `Client`
//! - Dispatch spacing (request starts are spread out, not bursted)
//! - Backoff on 429 that grows with consecutive rate-limit responses
//! - One retry, with random jitter, on 429, 5xx and transport errors
//!
//! Every failure maps onto [`TrackerError`]; the gateways above decide how
//! to degrade.

use async_trait::async_trait;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::directions::{DirectionsRoute, DirectionsService, RouteLeg};
use crate::error::{Result, TrackerError};
use crate::road_snap::RoadSnapService;
use crate::Coordinate;

const MAX_RETRIES: u32 = 1;
const RETRY_BASE_MS: u64 = 250;
const RETRY_JITTER_MS: u64 = 250;

/// Connection settings for one upstream service.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout, including the body download.
    pub timeout: Duration,
    /// Minimum spacing between request starts.
    pub dispatch_interval: Duration,
}

impl HttpClientConfig {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout: Duration::from_secs(8),
            dispatch_interval: Duration::from_millis(20),
        }
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Dispatch rate limiter - spaces out when requests START.
struct DispatchRateLimiter {
    interval: Duration,
    next_dispatch: Mutex<Instant>,
    consecutive_429s: AtomicU32,
}

impl DispatchRateLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_dispatch: Mutex::new(Instant::now()),
            consecutive_429s: AtomicU32::new(0),
        }
    }

    /// Wait for our dispatch slot. Each caller gets a unique slot.
    async fn wait_for_dispatch_slot(&self) {
        let wait = {
            let mut next = self.next_dispatch.lock().await;
            let now = Instant::now();
            let dispatch_at = if *next > now { *next } else { now };
            *next = dispatch_at + self.interval;
            dispatch_at - now
        };

        // Wait outside the lock
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn record_success(&self) {
        self.consecutive_429s.store(0, Ordering::Relaxed);
    }

    fn record_429(&self) -> Duration {
        let count = self.consecutive_429s.fetch_add(1, Ordering::Relaxed) + 1;
        // 500ms, 1s, 2s, 4s max
        let backoff = Duration::from_millis(500 * (1 << count.min(3)));
        warn!("[HttpTransport] Got 429! Consecutive: {}, backing off {:?}", count, backoff);
        backoff
    }
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=RETRY_JITTER_MS))
}

/// What to do after one attempt.
enum Attempt<T> {
    Done(Result<T>),
    Retry { reason: String, wait: Duration },
}

struct HttpTransport {
    client: Client,
    config: HttpClientConfig,
    rate_limiter: Arc<DispatchRateLimiter>,
}

impl HttpTransport {
    fn new(config: HttpClientConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(config.timeout)
            .build()
            .map_err(|e| TrackerError::UpstreamUnavailable(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            rate_limiter: Arc::new(DispatchRateLimiter::new(config.dispatch_interval)),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// GET `path` with `query` (plus the API key) and decode the JSON body.
    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.url(path);
        let mut params: Vec<(&str, String)> = query.to_vec();
        params.push(("key", self.config.api_key.clone()));

        let mut retries = 0;
        let req_start = Instant::now();

        loop {
            self.rate_limiter.wait_for_dispatch_slot().await;
            let (reason, wait) = match self.attempt::<T>(&url, &params).await {
                Attempt::Done(result) => {
                    debug!("[HttpTransport] GET {} finished in {:?}", path, req_start.elapsed());
                    return result;
                }
                Attempt::Retry { reason, wait } => (reason, wait),
            };

            retries += 1;
            if retries > MAX_RETRIES {
                return Err(TrackerError::UpstreamUnavailable(format!(
                    "{} after {} attempt(s): {}",
                    path, retries, reason
                )));
            }

            let wait = wait + jitter();
            warn!("[HttpTransport] GET {} failed ({}), retry {} after {:?}", path, reason, retries, wait);
            tokio::time::sleep(wait).await;
        }
    }

    async fn attempt<T: DeserializeOwned>(&self, url: &str, params: &[(&str, String)]) -> Attempt<T> {
        let resp = match self.client.get(url).query(params).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Attempt::Retry {
                    reason: format!("request error: {}", e),
                    wait: Duration::from_millis(RETRY_BASE_MS),
                }
            }
        };

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retry {
                reason: format!("HTTP {}", status),
                wait: self.rate_limiter.record_429(),
            };
        }
        self.rate_limiter.record_success();

        if status.is_server_error() {
            return Attempt::Retry {
                reason: format!("HTTP {}", status),
                wait: Duration::from_millis(RETRY_BASE_MS),
            };
        }
        if !status.is_success() {
            return Attempt::Done(Err(TrackerError::UpstreamUnavailable(format!("HTTP {}", status))));
        }

        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                return Attempt::Retry {
                    reason: format!("body download error: {}", e),
                    wait: Duration::from_millis(RETRY_BASE_MS),
                }
            }
        };

        Attempt::Done(serde_json::from_slice(&bytes).map_err(|e| {
            TrackerError::UpstreamUnavailable(format!("JSON parse error: {}", e))
        }))
    }
}

fn lat_lng(c: &Coordinate) -> String {
    format!("{},{}", c.lat, c.lng)
}

// ============================================================================
// Snap to roads
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapApiResponse {
    #[serde(default)]
    snapped_points: Vec<SnappedPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnappedPoint {
    location: ApiLocation,
    /// Absent for points the service interpolated.
    original_index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ApiLocation {
    latitude: f64,
    longitude: f64,
}

/// Pipe-separated `lat,lng` path.
fn path_param(points: &[Coordinate]) -> String {
    points.iter().map(lat_lng).collect::<Vec<_>>().join("|")
}

/// One output point per input: snapped where the service matched the input,
/// the original otherwise.
fn merge_snapped(points: &[Coordinate], response: SnapApiResponse) -> Vec<Coordinate> {
    let mut result = points.to_vec();
    for snapped in response.snapped_points {
        if let Some(i) = snapped.original_index.filter(|i| *i < points.len()) {
            result[i] = Coordinate::new(snapped.location.latitude, snapped.location.longitude);
        }
    }
    result
}

/// Client for a `snapToRoads`-style endpoint.
pub struct HttpRoadSnapClient {
    transport: HttpTransport,
}

impl HttpRoadSnapClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        info!("[RoadSnapClient] Using {}", config.base_url);
        Ok(Self { transport: HttpTransport::new(config)? })
    }
}

#[async_trait]
impl RoadSnapService for HttpRoadSnapClient {
    async fn snap(&self, points: &[Coordinate]) -> Result<Vec<Coordinate>> {
        let response: SnapApiResponse = self
            .transport
            .get_json(
                "/v1/snapToRoads",
                &[("path", path_param(points)), ("interpolate", "false".to_string())],
            )
            .await?;
        Ok(merge_snapped(points, response))
    }
}

// ============================================================================
// Directions
// ============================================================================

#[derive(Debug, Deserialize)]
struct DirectionsApiResponse {
    status: String,
    #[serde(default)]
    routes: Vec<ApiRoute>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRoute {
    overview_polyline: ApiPolyline,
    #[serde(default)]
    legs: Vec<ApiLeg>,
}

#[derive(Debug, Deserialize)]
struct ApiPolyline {
    points: String,
}

#[derive(Debug, Deserialize)]
struct ApiLeg {
    distance: ApiValue,
    duration: ApiValue,
}

#[derive(Debug, Deserialize)]
struct ApiValue {
    value: f64,
}

fn into_directions_route(response: DirectionsApiResponse) -> Result<DirectionsRoute> {
    match response.status.as_str() {
        "OK" => {}
        "ZERO_RESULTS" | "NOT_FOUND" => {
            return Err(TrackerError::NoRouteFound(format!("directions status {}", response.status)));
        }
        other => {
            return Err(TrackerError::UpstreamUnavailable(format!(
                "directions status {}{}",
                other,
                response.error_message.map(|m| format!(": {}", m)).unwrap_or_default()
            )));
        }
    }

    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or_else(|| TrackerError::NoRouteFound("directions returned no routes".to_string()))?;

    Ok(DirectionsRoute {
        encoded_polyline: route.overview_polyline.points,
        legs: route
            .legs
            .into_iter()
            .map(|leg| RouteLeg {
                distance_m: leg.distance.value,
                duration_s: leg.duration.value.max(0.0).round() as u64,
            })
            .collect(),
    })
}

/// Client for a directions JSON endpoint.
pub struct HttpDirectionsClient {
    transport: HttpTransport,
}

impl HttpDirectionsClient {
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        info!("[DirectionsClient] Using {}", config.base_url);
        Ok(Self { transport: HttpTransport::new(config)? })
    }
}

#[async_trait]
impl DirectionsService for HttpDirectionsClient {
    async fn route(
        &self,
        origin: Coordinate,
        waypoint: Coordinate,
        destination: Coordinate,
    ) -> Result<DirectionsRoute> {
        let response: DirectionsApiResponse = self
            .transport
            .get_json(
                "/maps/api/directions/json",
                &[
                    ("origin", lat_lng(&origin)),
                    ("destination", lat_lng(&destination)),
                    ("waypoints", lat_lng(&waypoint)),
                    ("mode", "driving".to_string()),
                ],
            )
            .await?;
        into_directions_route(response)
    }
}
