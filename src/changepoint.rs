//! Hook for detecting persistent shifts in the array-wide rate.
//!
//! The pipeline feeds one array rate per completed base bin. Detectors that flag
//! step changes (e.g. after a module set change) plug in here.

/// Online changepoint detection over base-bin array rates.
pub trait ChangepointDetector: Send {
    /// Observe the array-wide rate (Hz) of a completed base bin.
    fn observe(&mut self, bin_index: u64, array_rate_hz: f64);

    /// Base bins at which a changepoint has been flagged so far.
    fn changepoints(&self) -> &[u64];
}

/// Detector that never flags anything.
#[derive(Debug, Default, Clone)]
pub struct NoopChangepoint {
    observed: u64,
}

impl NoopChangepoint {
    /// Bins observed so far.
    pub fn observed(&self) -> u64 {
        self.observed
    }
}

impl ChangepointDetector for NoopChangepoint {
    fn observe(&mut self, _bin_index: u64, _array_rate_hz: f64) {
        self.observed += 1;
    }

    fn changepoints(&self) -> &[u64] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_counts_only() {
        let mut detector = NoopChangepoint::default();
        for bin in 0..5 {
            detector.observe(bin, 1e6 * (bin as f64 + 1.0));
        }
        assert_eq!(detector.observed(), 5);
        assert!(detector.changepoints().is_empty());
    }
}
