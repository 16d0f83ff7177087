//! The adaptive look-ahead distance controller (spec §4.7).

/// Which regime the controller currently believes it is operating under.
/// Only ever moves away from `A`; there is no path back to it once any I/O
/// has been observed (spec §4.7 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Regime {
    /// Fully cached: no I/O has been required yet.
    A,
    /// Sequential, unbuffered: I/O required, advice suppressed.
    B,
    /// Random, advice-capable.
    C,
}

/// Tracks look-ahead distance and regime together (spec §4.7). `max_ios`
/// doubles as regime C's target distance (`io_concurrency`); `buffer_io_size`
/// is regime B's.
#[derive(Debug)]
pub struct DistanceController {
    regime: Regime,
    distance: u32,
    max_pinned_buffers: u32,
    buffer_io_size: u32,
    max_ios: u32,
    advice_enabled: bool,
}

impl DistanceController {
    pub fn new(max_pinned_buffers: u32, buffer_io_size: u32, max_ios: u32, advice_enabled: bool, start_full: bool) -> Self {
        let mut controller = Self {
            regime: Regime::A,
            distance: 1,
            max_pinned_buffers: max_pinned_buffers.max(1),
            buffer_io_size: buffer_io_size.max(1),
            max_ios: max_ios.max(1),
            advice_enabled,
        };
        if start_full {
            // READ_STREAM_FULL: the caller wants maximum parallelism from
            // the first look-ahead pass rather than ramping up from 1.
            controller.distance = controller.regime_cap(Regime::C).max(1);
        }
        controller
    }

    pub fn distance(&self) -> u32 {
        self.distance
    }

    pub fn regime(&self) -> Regime {
        self.regime
    }

    fn regime_cap(&self, regime: Regime) -> u32 {
        let cap = match regime {
            Regime::A => 1,
            Regime::B => self.buffer_io_size,
            Regime::C => self.max_ios,
        };
        cap.min(self.max_pinned_buffers)
    }

    /// The head buffer was already cache-resident; no I/O was necessary
    /// (spec §4.7: "decays by one each time the head buffer was
    /// cache-resident").
    pub fn observe_cached(&mut self) {
        self.distance = self.distance.saturating_sub(1).max(1);
    }

    /// A physical read was actually issued for a range. `advice_issued`
    /// selects regime B (sequential, suppressed) vs C (random, advice
    /// capable); distance doubles, capped at the new regime's target and
    /// `max_pinned_buffers`.
    pub fn observe_io(&mut self, advice_issued: bool) {
        self.regime = if advice_issued && self.advice_enabled { Regime::C } else { Regime::B };
        let cap = self.regime_cap(self.regime);
        self.distance = self.distance.saturating_mul(2).min(cap).max(1);
    }

    /// The source reported end of stream (spec §4.7 "sets distance = 0").
    pub fn end_of_stream(&mut self) {
        self.distance = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_regime_a_at_distance_one() {
        let controller = DistanceController::new(64, 16, 8, true, false);
        assert_eq!(controller.regime(), Regime::A);
        assert_eq!(controller.distance(), 1);
    }

    #[test]
    fn random_io_moves_to_regime_c_and_doubles() {
        let mut controller = DistanceController::new(64, 16, 8, true, false);
        controller.observe_io(true);
        assert_eq!(controller.regime(), Regime::C);
        assert_eq!(controller.distance(), 2);
        controller.observe_io(true);
        assert_eq!(controller.distance(), 4);
    }

    #[test]
    fn sequential_io_moves_to_regime_b_and_caps_at_buffer_io_size() {
        let mut controller = DistanceController::new(64, 4, 8, true, false);
        for _ in 0..5 {
            controller.observe_io(false);
        }
        assert_eq!(controller.regime(), Regime::B);
        assert_eq!(controller.distance(), 4);
    }

    #[test]
    fn cached_observation_decays_by_one_but_never_below_one() {
        let mut controller = DistanceController::new(64, 16, 8, true, false);
        controller.observe_io(true);
        controller.observe_io(true);
        assert_eq!(controller.distance(), 4);
        controller.observe_cached();
        assert_eq!(controller.distance(), 3);
        controller.observe_cached();
        controller.observe_cached();
        controller.observe_cached();
        assert_eq!(controller.distance(), 1);
    }

    #[test]
    fn full_flag_starts_at_the_regime_c_cap_instead_of_one() {
        let controller = DistanceController::new(64, 16, 8, true, true);
        assert_eq!(controller.distance(), 8);
    }

    #[test]
    fn end_of_stream_zeroes_distance() {
        let mut controller = DistanceController::new(64, 16, 8, true, false);
        controller.end_of_stream();
        assert_eq!(controller.distance(), 0);
    }
}
