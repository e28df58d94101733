//! # Retransmission Timeout Estimation
//!
//! Classic Jacobson/Karels SRTT/RTTVAR estimator (RFC 6298), operating on
//! caller-supplied millisecond timestamps so the send engine can drive it
//! from a fake clock in tests. Karn's rule: samples from retransmitted
//! chunks never update the estimator, since a SACK arriving after a
//! retransmit can't be attributed to the original or the retransmitted send.

const ALPHA: f64 = 0.125; // 1/8
const BETA: f64 = 0.25; // 1/4

/// Tracks smoothed RTT and the current retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt_ms: Option<f64>,
    rttvar_ms: f64,
    rto_ms: u64,
    min_rto_ms: u64,
    max_rto_ms: u64,
}

impl RttEstimator {
    pub fn new(min_rto_ms: u64, max_rto_ms: u64) -> Self {
        RttEstimator {
            srtt_ms: None,
            rttvar_ms: 0.0,
            rto_ms: min_rto_ms,
            min_rto_ms,
            max_rto_ms,
        }
    }

    /// Feed a fresh RTT sample (from a chunk that was never retransmitted —
    /// Karn's rule means callers must not invoke this for retransmitted
    /// chunks' SACKs).
    pub fn sample(&mut self, rtt_ms: f64) {
        let rtt_ms = rtt_ms.max(0.0);
        match self.srtt_ms {
            None => {
                self.srtt_ms = Some(rtt_ms);
                self.rttvar_ms = rtt_ms / 2.0;
            }
            Some(srtt) => {
                self.rttvar_ms = (1.0 - BETA) * self.rttvar_ms + BETA * (srtt - rtt_ms).abs();
                self.srtt_ms = Some((1.0 - ALPHA) * srtt + ALPHA * rtt_ms);
            }
        }
        let srtt = self.srtt_ms.unwrap();
        let computed = srtt + 4.0 * self.rttvar_ms;
        self.rto_ms = (computed.round() as u64).clamp(self.min_rto_ms, self.max_rto_ms);
    }

    /// Current retransmission timeout, clamped to `[min_rto_ms, max_rto_ms]`.
    pub fn rto_ms(&self) -> u64 {
        self.rto_ms
    }

    pub fn smoothed_rtt_ms(&self) -> Option<f64> {
        self.srtt_ms
    }

    /// Scale the current RTO by 1.5x, up to the configured ceiling — the
    /// backoff applied on an unambiguous timeout (exponential backoff, not
    /// Karn's rule; this always applies, sampled or not).
    pub fn backoff(&mut self) {
        let scaled = (self.rto_ms as f64 * 1.5).round() as u64;
        self.rto_ms = scaled.min(self.max_rto_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_srtt_and_half_rttvar() {
        let mut est = RttEstimator::new(50, 5000);
        est.sample(100.0);
        assert_eq!(est.smoothed_rtt_ms(), Some(100.0));
        // rto = srtt + 4*rttvar = 100 + 4*50 = 300
        assert_eq!(est.rto_ms(), 300);
    }

    #[test]
    fn converges_toward_stable_rtt() {
        let mut est = RttEstimator::new(50, 5000);
        for _ in 0..50 {
            est.sample(80.0);
        }
        let srtt = est.smoothed_rtt_ms().unwrap();
        assert!((srtt - 80.0).abs() < 1.0, "srtt should converge: {srtt}");
    }

    #[test]
    fn rto_clamped_to_minimum() {
        let mut est = RttEstimator::new(50, 5000);
        for _ in 0..50 {
            est.sample(1.0);
        }
        assert!(est.rto_ms() >= 50);
    }

    #[test]
    fn rto_clamped_to_maximum() {
        let mut est = RttEstimator::new(50, 5000);
        est.sample(100_000.0);
        assert_eq!(est.rto_ms(), 5000);
    }

    #[test]
    fn backoff_scales_by_1_5x_and_caps() {
        let mut est = RttEstimator::new(50, 1000);
        est.sample(100.0);
        let before = est.rto_ms();
        est.backoff();
        assert_eq!(est.rto_ms(), (((before as f64) * 1.5).round() as u64).min(1000));
        for _ in 0..10 {
            est.backoff();
        }
        assert_eq!(est.rto_ms(), 1000);
    }

    #[test]
    fn variable_rtt_increases_rttvar() {
        let mut est = RttEstimator::new(50, 5000);
        est.sample(100.0);
        est.sample(20.0);
        assert!(est.rttvar_ms > 0.0);
    }
}
