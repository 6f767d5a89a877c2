//! Exponential moving average round-trip time estimator, one per peer.
//!
//! Diagnostic only — nothing in the protocol branches on `rtt()` (unlike
//! the retransmit timer, which is a fixed constant per spec §4.3/§5). This
//! mirrors the teacher's separate RTT-estimator-per-session convention
//! without coupling it to any resend decision.

use std::time::Duration;

/// Smoothing factor for the exponential moving average. `0.125` is the
/// classic TCP SRTT alpha.
const ALPHA: f64 = 0.125;

#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    smoothed: Option<Duration>,
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self { smoothed: None }
    }
}

impl RttEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, sample: Duration) {
        self.smoothed = Some(match self.smoothed {
            None => sample,
            Some(prev) => prev.mul_f64(1.0 - ALPHA) + sample.mul_f64(ALPHA),
        });
    }

    #[must_use]
    pub fn get(&self) -> Option<Duration> {
        self.smoothed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_is_taken_verbatim() {
        let mut rtt = RttEstimator::new();
        rtt.observe(Duration::from_millis(50));
        assert_eq!(rtt.get(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn converges_toward_repeated_samples() {
        let mut rtt = RttEstimator::new();
        for _ in 0..50 {
            rtt.observe(Duration::from_millis(80));
        }
        let got = rtt.get().unwrap();
        assert!(got.as_millis().abs_diff(80) <= 1);
    }
}
