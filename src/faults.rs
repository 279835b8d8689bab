use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Bounds for the random extra delay given to a reordered packet.
const REORDER_DELAY_MIN_US: u64 = 1_000;
const REORDER_DELAY_MAX_US: u64 = 10_000;

/// Per-packet loss and reorder decisions.
///
/// Both decisions are memoryless; a rate of 0 short-circuits without touching
/// the RNG so the default configuration adds no per-packet cost.
pub struct FaultInjector {
    loss_rate: f64,    // percent, 0..=100
    reorder_rate: f64, // percent, 0..=100
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(loss_rate: f64, reorder_rate: f64) -> Self {
        Self::with_rng(loss_rate, reorder_rate, StdRng::from_entropy())
    }

    pub fn with_rng(loss_rate: f64, reorder_rate: f64, rng: StdRng) -> Self {
        Self {
            loss_rate,
            reorder_rate,
            rng,
        }
    }

    pub fn enabled(&self) -> bool {
        self.loss_rate > 0.0 || self.reorder_rate > 0.0
    }

    /// Should this packet be dropped outright?
    pub fn should_drop(&mut self) -> bool {
        self.loss_rate > 0.0 && self.rng.gen_range(0.0..100.0) < self.loss_rate
    }

    /// If this packet should be delayed for reordering, how long to hold it.
    pub fn reorder_delay(&mut self) -> Option<Duration> {
        if self.reorder_rate > 0.0 && self.rng.gen_range(0.0..100.0) < self.reorder_rate {
            let us = self.rng.gen_range(REORDER_DELAY_MIN_US..=REORDER_DELAY_MAX_US);
            Some(Duration::from_micros(us))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(loss: f64, reorder: f64) -> FaultInjector {
        FaultInjector::with_rng(loss, reorder, StdRng::seed_from_u64(42))
    }

    #[test]
    fn zero_rates_never_fire() {
        let mut faults = seeded(0.0, 0.0);
        for _ in 0..1000 {
            assert!(!faults.should_drop());
            assert!(faults.reorder_delay().is_none());
        }
        assert!(!faults.enabled());
    }

    #[test]
    fn full_loss_always_drops() {
        let mut faults = seeded(100.0, 0.0);
        for _ in 0..1000 {
            assert!(faults.should_drop());
        }
    }

    #[test]
    fn full_reorder_always_delays_within_bounds() {
        let mut faults = seeded(0.0, 100.0);
        for _ in 0..1000 {
            let delay = faults.reorder_delay().expect("reorder at 100%");
            assert!(delay >= Duration::from_micros(REORDER_DELAY_MIN_US));
            assert!(delay <= Duration::from_micros(REORDER_DELAY_MAX_US));
        }
    }

    #[test]
    fn partial_rate_fires_sometimes() {
        let mut faults = seeded(50.0, 0.0);
        let drops = (0..10_000).filter(|_| faults.should_drop()).count();
        assert!(drops > 3_000 && drops < 7_000, "drops = {drops}");
    }
}
