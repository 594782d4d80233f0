//! Phi accrual failure detection
//!
//! Each backend connection owns one detector. Successful health pings feed
//! it heartbeats; the relay reads `phi` to report links that look unhealthy.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Suspicion estimator fed by heartbeats
pub trait FailureDetector: Send + Sync + std::fmt::Debug {
    /// Record a heartbeat observed at `now`
    fn heartbeat(&mut self, now: Instant);

    /// Suspicion level at `now`; higher means more likely failed
    fn phi(&self, now: Instant) -> f64;
}

/// Creates a fresh detector for every new connection
pub trait DetectorFactory: Send + Sync {
    fn create(&self) -> Box<dyn FailureDetector>;
}

impl<F> DetectorFactory for F
where
    F: Fn() -> Box<dyn FailureDetector> + Send + Sync,
{
    fn create(&self) -> Box<dyn FailureDetector> {
        self()
    }
}

/// Phi accrual detector over a sliding window of inter-arrival times
///
/// Uses the logistic approximation of the normal CDF, so phi grows
/// smoothly as the time since the last heartbeat exceeds the observed mean.
#[derive(Debug, Clone)]
pub struct PhiAccrualDetector {
    window_size: usize,
    min_samples: usize,
    min_std_dev: Duration,
    intervals: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
}

impl PhiAccrualDetector {
    pub const DEFAULT_WINDOW_SIZE: usize = 15;
    pub const DEFAULT_MIN_SAMPLES: usize = 1;
    pub const DEFAULT_MIN_STD_DEV: Duration = Duration::from_millis(500);

    pub fn new(window_size: usize, min_samples: usize, min_std_dev: Duration) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            min_samples: min_samples.clamp(1, window_size),
            min_std_dev,
            intervals: VecDeque::with_capacity(window_size),
            last_heartbeat: None,
        }
    }

    /// Number of inter-arrival samples currently in the window
    pub fn samples(&self) -> usize {
        self.intervals.len()
    }

    fn mean_and_std_dev(&self) -> (f64, f64) {
        let n = self.intervals.len() as f64;
        let mean = self.intervals.iter().sum::<f64>() / n;
        let variance = self
            .intervals
            .iter()
            .map(|x| (x - mean).powi(2))
            .sum::<f64>()
            / n;
        let std_dev = variance.sqrt().max(self.min_std_dev.as_secs_f64() * 1000.0);
        (mean, std_dev)
    }
}

impl Default for PhiAccrualDetector {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_WINDOW_SIZE,
            Self::DEFAULT_MIN_SAMPLES,
            Self::DEFAULT_MIN_STD_DEV,
        )
    }
}

impl FailureDetector for PhiAccrualDetector {
    fn heartbeat(&mut self, now: Instant) {
        if let Some(last) = self.last_heartbeat {
            let interval_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;
            if self.intervals.len() == self.window_size {
                self.intervals.pop_front();
            }
            self.intervals.push_back(interval_ms);
        }
        self.last_heartbeat = Some(now);
    }

    fn phi(&self, now: Instant) -> f64 {
        let Some(last) = self.last_heartbeat else {
            return 0.0;
        };
        if self.intervals.len() < self.min_samples {
            return 0.0;
        }

        let (mean, std_dev) = self.mean_and_std_dev();
        let elapsed_ms = now.saturating_duration_since(last).as_secs_f64() * 1000.0;

        let y = (elapsed_ms - mean) / std_dev;
        let e = (-y * (1.5976 + 0.070566 * y * y)).exp();
        let p_later = if elapsed_ms > mean {
            e / (1.0 + e)
        } else {
            1.0 - 1.0 / (1.0 + e)
        };

        if p_later <= f64::MIN_POSITIVE {
            return f64::MAX;
        }
        -p_later.log10()
    }
}

/// Default [`DetectorFactory`] producing [`PhiAccrualDetector`]s
#[derive(Debug, Clone)]
pub struct PhiAccrualFactory {
    pub window_size: usize,
    pub min_samples: usize,
    pub min_std_dev: Duration,
}

impl Default for PhiAccrualFactory {
    fn default() -> Self {
        Self {
            window_size: PhiAccrualDetector::DEFAULT_WINDOW_SIZE,
            min_samples: PhiAccrualDetector::DEFAULT_MIN_SAMPLES,
            min_std_dev: PhiAccrualDetector::DEFAULT_MIN_STD_DEV,
        }
    }
}

impl DetectorFactory for PhiAccrualFactory {
    fn create(&self) -> Box<dyn FailureDetector> {
        Box::new(PhiAccrualDetector::new(
            self.window_size,
            self.min_samples,
            self.min_std_dev,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steady(detector: &mut PhiAccrualDetector, start: Instant, beats: u32) -> Instant {
        let mut now = start;
        for _ in 0..beats {
            detector.heartbeat(now);
            now += Duration::from_secs(5);
        }
        now - Duration::from_secs(5)
    }

    #[test]
    fn test_phi_is_zero_without_samples() {
        let mut detector = PhiAccrualDetector::default();
        let now = Instant::now();
        assert_eq!(detector.phi(now), 0.0);

        // A single heartbeat gives no interval yet
        detector.heartbeat(now);
        assert_eq!(detector.phi(now + Duration::from_secs(60)), 0.0);
    }

    #[test]
    fn test_phi_grows_with_silence() {
        let mut detector = PhiAccrualDetector::default();
        let last = steady(&mut detector, Instant::now(), 10);

        let on_time = detector.phi(last + Duration::from_secs(5));
        let late = detector.phi(last + Duration::from_secs(8));
        let very_late = detector.phi(last + Duration::from_secs(30));

        assert!(on_time < 0.9, "on-time phi was {}", on_time);
        assert!(late > on_time);
        assert!(very_late > 0.9);
        assert!(very_late > late);
    }

    #[test]
    fn test_window_is_bounded() {
        let mut detector = PhiAccrualDetector::new(3, 1, Duration::from_millis(10));
        steady(&mut detector, Instant::now(), 10);
        assert_eq!(detector.samples(), 3);
    }

    #[test]
    fn test_extreme_silence_is_finite() {
        let mut detector = PhiAccrualDetector::new(15, 1, Duration::from_millis(1));
        let last = steady(&mut detector, Instant::now(), 5);
        let phi = detector.phi(last + Duration::from_secs(3600));
        assert!(phi.is_finite());
        assert!(phi > 100.0);
    }

    #[test]
    fn test_closure_factory() {
        let factory = || -> Box<dyn FailureDetector> { Box::new(PhiAccrualDetector::default()) };
        let detector = factory.create();
        assert_eq!(detector.phi(Instant::now()), 0.0);
    }
}
