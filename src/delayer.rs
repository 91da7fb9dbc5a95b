use rand::Rng;
use std::time::Duration;

/// Walks through a list of base delays, one step per call, and stays on the
/// last one once it gets there. Each delay is perturbed by up to
/// `randomness / 2` seconds in either direction.
#[derive(Clone, Debug)]
pub struct Delayer {
    delays: Vec<f64>,
    randomness: f64,
    index: usize,
}

impl Delayer {
    pub fn new(delays: Vec<f64>, randomness: f64) -> Self {
        Delayer {
            delays,
            randomness,
            index: 0,
        }
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn next(&mut self) -> Duration {
        let base = self.delays.get(self.index).copied().unwrap_or_default();

        let half = self.randomness / 2.0;
        let jitter = if half > 0.0 {
            rand::thread_rng().gen_range(-half..=half)
        } else {
            0.0
        };

        self.index = (self.index + 1).min(self.delays.len().saturating_sub(1));

        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn within(delay: Duration, base: f64, randomness: f64) -> bool {
        let secs = delay.as_secs_f64();
        secs >= base - randomness / 2.0 - 1e-9 && secs <= base + randomness / 2.0 + 1e-9
    }

    #[test]
    fn test_walks_delays_in_order() {
        let mut delayer = Delayer::new(vec![3.0, 5.0, 10.0, 30.0], 2.0);

        assert!(within(delayer.next(), 3.0, 2.0));
        assert!(within(delayer.next(), 5.0, 2.0));
        assert!(within(delayer.next(), 10.0, 2.0));
        assert!(within(delayer.next(), 30.0, 2.0));
    }

    #[test]
    fn test_saturates_on_last_delay() {
        let mut delayer = Delayer::new(vec![3.0, 5.0, 10.0, 30.0], 2.0);

        for _ in 0..4 {
            delayer.next();
        }
        for _ in 0..50 {
            assert!(within(delayer.next(), 30.0, 2.0));
        }
    }

    #[test]
    fn test_reset_returns_to_first_delay() {
        let mut delayer = Delayer::new(vec![3.0, 5.0, 10.0, 30.0], 2.0);

        for _ in 0..10 {
            delayer.next();
        }
        delayer.reset();

        assert!(within(delayer.next(), 3.0, 2.0));
        assert!(within(delayer.next(), 5.0, 2.0));
    }

    #[test]
    fn test_no_randomness_is_exact() {
        let mut delayer = Delayer::new(vec![1.5], 0.0);

        assert_eq!(delayer.next(), Duration::from_millis(1500));
        assert_eq!(delayer.next(), Duration::from_millis(1500));
    }

    #[test]
    fn test_never_negative() {
        let mut delayer = Delayer::new(vec![0.0], 4.0);

        for _ in 0..50 {
            assert!(within(delayer.next(), 0.0, 4.0));
        }
    }
}
