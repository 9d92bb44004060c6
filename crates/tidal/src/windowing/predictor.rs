//! Watermark predictors.
//!
//! A predictor learns how the watermark of an origin progresses relative to
//! ingestion time and extrapolates it. Predictions only decide when the
//! slice store looks for work, closing a slice always waits for the actual
//! watermark.

use std::collections::VecDeque;
use tidal_types::config::WatermarkPredictorKind;

pub trait WatermarkPredictor: Send {
    /// Feeds one `(ingestion time, watermark)` observation.
    fn observe(&mut self, ingestion_ts: u64, watermark: u64);

    /// The watermark expected at `ingestion_ts`, `None` before the first
    /// observation.
    fn estimate(&self, ingestion_ts: u64) -> Option<u64>;
}

pub fn new_predictor(kind: WatermarkPredictorKind) -> Option<Box<dyn WatermarkPredictor>> {
    match kind {
        WatermarkPredictorKind::None => None,
        WatermarkPredictorKind::Kalman => Some(Box::new(KalmanPredictor::default())),
        WatermarkPredictorKind::Regression => Some(Box::new(RegressionPredictor::default())),
    }
}

fn to_watermark(estimate: f64, floor: u64) -> u64 {
    if estimate.is_nan() {
        floor
    } else {
        // Saturating float to int conversion
        (estimate.round() as u64).max(floor)
    }
}

/// Kalman filter over the state `[watermark offset, drift rate]`.
///
/// Times and watermarks are kept relative to the first observation so the
/// filter works on small numbers.
#[derive(Debug, Clone)]
pub struct KalmanPredictor {
    origin: Option<(u64, u64)>,
    last_ts: f64,
    /// Watermark offset at `last_ts` and its rate of change per ms
    state: [f64; 2],
    covariance: [[f64; 2]; 2],
    process_noise: f64,
    measurement_noise: f64,
    max_watermark: u64,
}

impl KalmanPredictor {
    pub fn new(process_noise: f64, measurement_noise: f64) -> Self {
        Self {
            origin: None,
            last_ts: 0.0,
            state: [0.0, 1.0],
            covariance: [[1.0e3, 0.0], [0.0, 1.0]],
            process_noise,
            measurement_noise,
            max_watermark: 0,
        }
    }

    pub fn drift(&self) -> f64 {
        self.state[1]
    }

    fn predict(&mut self, ts: f64) {
        let dt = (ts - self.last_ts).max(0.0);
        let [offset, rate] = self.state;
        self.state = [offset + rate * dt, rate];

        // P = F P F^T + Q with F = [[1, dt], [0, 1]]
        let [[p00, p01], [p10, p11]] = self.covariance;
        let q = self.process_noise;
        self.covariance = [
            [
                p00 + dt * (p10 + p01) + dt * dt * p11 + q * dt.max(1.0),
                p01 + dt * p11,
            ],
            [p10 + dt * p11, p11 + q * 1.0e-6],
        ];
        self.last_ts = ts;
    }

    fn correct(&mut self, measured: f64) {
        // H = [1, 0]
        let [[p00, p01], [p10, p11]] = self.covariance;
        let innovation = measured - self.state[0];
        let s = p00 + self.measurement_noise;
        let (k0, k1) = (p00 / s, p10 / s);
        self.state[0] += k0 * innovation;
        self.state[1] += k1 * innovation;
        self.covariance = [
            [(1.0 - k0) * p00, (1.0 - k0) * p01],
            [p10 - k1 * p00, p11 - k1 * p01],
        ];
    }
}

impl Default for KalmanPredictor {
    fn default() -> Self {
        Self::new(1.0, 10.0)
    }
}

impl WatermarkPredictor for KalmanPredictor {
    fn observe(&mut self, ingestion_ts: u64, watermark: u64) {
        self.max_watermark = self.max_watermark.max(watermark);
        let (ts0, wm0) = *self.origin.get_or_insert((ingestion_ts, watermark));
        let ts = ingestion_ts.saturating_sub(ts0) as f64;
        let measured = watermark as f64 - wm0 as f64;
        self.predict(ts);
        self.correct(measured);
    }

    fn estimate(&self, ingestion_ts: u64) -> Option<u64> {
        let (ts0, wm0) = self.origin?;
        let ts = ingestion_ts.saturating_sub(ts0) as f64;
        let dt = (ts - self.last_ts).max(0.0);
        let offset = self.state[0] + self.state[1] * dt;
        Some(to_watermark(wm0 as f64 + offset, self.max_watermark))
    }
}

/// Least squares line through the most recent observations.
#[derive(Debug, Clone)]
pub struct RegressionPredictor {
    capacity: usize,
    observations: VecDeque<(u64, u64)>,
    max_watermark: u64,
}

impl RegressionPredictor {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            observations: VecDeque::new(),
            max_watermark: 0,
        }
    }

    /// Intercept and slope of the fitted line, relative to the oldest
    /// observation.
    fn fit(&self) -> Option<(f64, f64)> {
        let &(ts0, wm0) = self.observations.front()?;
        let points = self
            .observations
            .iter()
            .map(|&(ts, wm)| ((ts - ts0) as f64, wm as f64 - wm0 as f64));

        let n = self.observations.len() as f64;
        let (sum_x, sum_y) = points
            .clone()
            .fold((0.0, 0.0), |(sx, sy), (x, y)| (sx + x, sy + y));
        let (mean_x, mean_y) = (sum_x / n, sum_y / n);
        let (covariance, variance) = points.fold((0.0, 0.0), |(cov, var), (x, y)| {
            (cov + (x - mean_x) * (y - mean_y), var + (x - mean_x) * (x - mean_x))
        });

        let slope = if variance > 0.0 { covariance / variance } else { 0.0 };
        Some((mean_y - slope * mean_x, slope))
    }
}

impl Default for RegressionPredictor {
    fn default() -> Self {
        Self::new(32)
    }
}

impl WatermarkPredictor for RegressionPredictor {
    fn observe(&mut self, ingestion_ts: u64, watermark: u64) {
        self.max_watermark = self.max_watermark.max(watermark);
        // Ingestion time must not go backwards for the fit to make sense
        let ingestion_ts = self
            .observations
            .back()
            .map_or(ingestion_ts, |&(last, _)| ingestion_ts.max(last));
        if self.observations.len() == self.capacity {
            self.observations.pop_front();
        }
        self.observations.push_back((ingestion_ts, watermark));
    }

    fn estimate(&self, ingestion_ts: u64) -> Option<u64> {
        let &(ts0, wm0) = self.observations.front()?;
        let (intercept, slope) = self.fit()?;
        let x = ingestion_ts.saturating_sub(ts0) as f64;
        Some(to_watermark(
            wm0 as f64 + intercept + slope * x,
            self.max_watermark,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(predictor: &mut dyn WatermarkPredictor, offset: u64, rate: u64) {
        for step in 0..50u64 {
            let ts = 1_700_000_000_000 + step * 100;
            predictor.observe(ts, offset + step * 100 * rate);
        }
    }

    #[test]
    fn kalman_learns_linear_progress() {
        let mut predictor = KalmanPredictor::default();
        assert_eq!(predictor.estimate(0), None);
        feed(&mut predictor, 5_000, 2);
        assert!((predictor.drift() - 2.0).abs() < 0.1, "drift {}", predictor.drift());

        // 1s after the last observation
        let last_ts = 1_700_000_000_000 + 49 * 100;
        let expected = 5_000 + 49 * 200 + 2_000;
        let estimate = predictor.estimate(last_ts + 1_000).unwrap();
        assert!(estimate.abs_diff(expected) < 200, "estimate {estimate}");
    }

    #[test]
    fn regression_learns_linear_progress() {
        let mut predictor = RegressionPredictor::default();
        assert_eq!(predictor.estimate(0), None);
        feed(&mut predictor, 0, 3);
        let last_ts = 1_700_000_000_000 + 49 * 100;
        let estimate = predictor.estimate(last_ts + 100).unwrap();
        assert_eq!(estimate, 50 * 300);
    }

    #[test]
    fn estimates_never_fall_behind_observations() {
        for kind in [WatermarkPredictorKind::Kalman, WatermarkPredictorKind::Regression] {
            let mut predictor = new_predictor(kind).unwrap();
            predictor.observe(1_000, 500);
            predictor.observe(2_000, 400);
            assert!(predictor.estimate(0).unwrap() >= 500);
        }
        assert!(new_predictor(WatermarkPredictorKind::None).is_none());
    }
}
