//! Rolling-window smoothing of raw rider fixes.
//!
//! Each rider keeps a short history of recent samples. A new fix is appended,
//! the window is trimmed, and the stabilized position is the mean of the
//! window. Heading comes from the two newest fixes rather than the mean, so
//! a rider turning a corner is reflected immediately.

use std::collections::VecDeque;

use crate::config::SmoothingConfig;
use crate::geo_utils;
use crate::{Coordinate, RawSample, SmoothedSample};

/// The most recent samples for one rider, newest last.
#[derive(Debug, Clone)]
pub struct RiderHistory {
    samples: VecDeque<RawSample>,
    capacity: usize,
}

impl RiderHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest beyond capacity.
    pub fn push(&mut self, sample: RawSample) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&RawSample> {
        self.samples.back()
    }

    pub fn samples(&self) -> impl Iterator<Item = &RawSample> {
        self.samples.iter()
    }
}

/// Record `sample` in `history` and return the smoothed position.
///
/// With fewer than two samples in the window the raw sample is returned
/// unchanged. Otherwise:
/// - position is the mean of the window
/// - speed is the mean of the positive speeds, clamped to the configured
///   range, or the default speed when none is positive
/// - bearing points from the second-newest to the newest raw fix
/// - accuracy is taken from `sample`
pub fn smooth_sample(
    history: &mut RiderHistory,
    sample: &RawSample,
    config: &SmoothingConfig,
) -> SmoothedSample {
    history.push(sample.clone());

    if history.len() < 2 {
        return SmoothedSample::from(sample);
    }

    let coords: Vec<Coordinate> = history.samples().map(|s| s.coord).collect();
    // Non-empty: the window holds at least two samples here
    let coord = geo_utils::compute_center(&coords).unwrap_or(sample.coord);

    let positive: Vec<f64> = history
        .samples()
        .map(|s| s.speed_kmh)
        .filter(|v| *v > 0.0)
        .collect();
    let speed_kmh = if positive.is_empty() {
        config.default_speed_kmh
    } else {
        positive.iter().sum::<f64>() / positive.len() as f64
    }
    .clamp(config.min_speed_kmh, config.max_speed_kmh);

    let last = coords[coords.len() - 1];
    let second_to_last = coords[coords.len() - 2];

    SmoothedSample {
        coord,
        speed_kmh,
        bearing_deg: geo_utils::bearing(&second_to_last, &last),
        accuracy_m: sample.accuracy_m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn sample_at(lat: f64, lng: f64) -> RawSample {
        RawSample::new("rider-1", "order-1", Coordinate::new(lat, lng), Utc::now())
    }

    #[test]
    fn test_single_sample_unchanged() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);
        let raw = sample_at(12.9716, 77.5946).with_speed(80.0).with_bearing(123.0).with_accuracy(7.0);

        let smoothed = smooth_sample(&mut history, &raw, &config);

        // No averaging and no speed clamping with a single fix
        assert_eq!(smoothed, SmoothedSample::from(&raw));
        assert_eq!(smoothed.speed_kmh, 80.0);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_identical_samples_exact_position() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);
        let raw = sample_at(12.9716, 77.5946).with_speed(0.0);

        let mut smoothed = smooth_sample(&mut history, &raw, &config);
        for _ in 0..4 {
            smoothed = smooth_sample(&mut history, &raw, &config);
        }

        assert_eq!(smoothed.coord, raw.coord);
        assert_eq!(smoothed.speed_kmh, 20.0);
        assert_eq!(smoothed.bearing_deg, 0.0);
    }

    #[test]
    fn test_window_capped_at_capacity() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);
        for i in 0..8 {
            smooth_sample(&mut history, &sample_at(0.0, i as f64 * 0.001), &config);
        }
        assert_eq!(history.len(), 5);
        assert_relative_eq!(history.samples().next().unwrap().coord.lng, 0.003, epsilon = 1e-12);
        assert_relative_eq!(history.latest().unwrap().coord.lng, 0.007, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_position_and_bearing_from_raw_points() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);
        smooth_sample(&mut history, &sample_at(0.0, 0.0), &config);
        let smoothed = smooth_sample(&mut history, &sample_at(0.0, 0.002), &config);

        assert_relative_eq!(smoothed.coord.lng, 0.001, epsilon = 1e-12);
        assert_relative_eq!(smoothed.coord.lat, 0.0, epsilon = 1e-12);
        // Heading east between the two raw fixes
        assert_relative_eq!(smoothed.bearing_deg, 90.0, epsilon = 1e-6);
    }

    #[test]
    fn test_speed_mean_ignores_non_positive_and_clamps() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);

        smooth_sample(&mut history, &sample_at(0.0, 0.0).with_speed(0.0), &config);
        let smoothed = smooth_sample(&mut history, &sample_at(0.0, 0.0001).with_speed(30.0), &config);
        assert_eq!(smoothed.speed_kmh, 30.0);

        let smoothed = smooth_sample(&mut history, &sample_at(0.0, 0.0002).with_speed(120.0), &config);
        assert_eq!(smoothed.speed_kmh, 45.0);

        let mut slow = RiderHistory::new(config.window_size);
        smooth_sample(&mut slow, &sample_at(0.0, 0.0).with_speed(2.0), &config);
        let smoothed = smooth_sample(&mut slow, &sample_at(0.0, 0.0).with_speed(4.0), &config);
        assert_eq!(smoothed.speed_kmh, 10.0);
    }

    #[test]
    fn test_accuracy_passed_through() {
        let config = SmoothingConfig::default();
        let mut history = RiderHistory::new(config.window_size);
        smooth_sample(&mut history, &sample_at(0.0, 0.0).with_accuracy(80.0), &config);
        let smoothed = smooth_sample(&mut history, &sample_at(0.0, 0.0).with_accuracy(5.0), &config);
        assert_eq!(smoothed.accuracy_m, 5.0);
    }
}
