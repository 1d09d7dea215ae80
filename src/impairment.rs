use rand::Rng;

use std::thread;
use std::time;

/// Synthetic packet loss and delay, used to exercise the recovery paths on a healthy network.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ImpairmentConfig {
    /// Probability that a datagram is silently discarded.
    ///
    /// Valid range: [0, 1]
    pub drop_chance: f64,

    /// Scale of the half-normal delay applied to surviving datagrams, in milliseconds. Each
    /// datagram is held back for |z| * `delay_scale_ms`, where z is standard normal.
    pub delay_scale_ms: f64,
}

impl ImpairmentConfig {
    /// Impairment applied to data segments in debug mode.
    pub fn sender() -> Self {
        Self {
            drop_chance: 0.1,
            delay_scale_ms: 1100.0,
        }
    }

    /// Impairment applied to acknowledgments in debug mode.
    pub fn receiver() -> Self {
        Self {
            drop_chance: 0.0,
            delay_scale_ms: 0.0,
        }
    }

    pub fn validate(&self) {
        assert!(
            (0.0..=1.0).contains(&self.drop_chance),
            "invalid impairment configuration: drop_chance outside [0, 1]"
        );
        assert!(
            self.delay_scale_ms >= 0.0 && self.delay_scale_ms.is_finite(),
            "invalid impairment configuration: delay_scale_ms must be finite and non-negative"
        );
    }
}

pub struct Impairment {
    config: ImpairmentConfig,
}

// Box-Muller transform
fn standard_normal<G: Rng>(rng: &mut G) -> f64 {
    // (0, 1], so the logarithm is finite
    let u1 = 1.0 - rng.gen::<f64>();
    let u2 = rng.gen::<f64>();

    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

impl Impairment {
    pub fn new(config: ImpairmentConfig) -> Self {
        config.validate();

        Self { config }
    }

    fn sample_delay<G: Rng>(&self, rng: &mut G) -> time::Duration {
        if self.config.delay_scale_ms == 0.0 {
            return time::Duration::ZERO;
        }

        let delay_ms = standard_normal(rng).abs() * self.config.delay_scale_ms;

        time::Duration::from_secs_f64(delay_ms / 1000.0)
    }

    /// Either discards `send`, runs it immediately, or runs it after a random delay on a detached
    /// thread. Never blocks the caller.
    pub fn dispatch<F>(&self, send: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut rng = rand::thread_rng();

        if rng.gen::<f64>() < self.config.drop_chance {
            tracing::trace!("impairment: dropped datagram");
            return;
        }

        let delay = self.sample_delay(&mut rng);

        if delay.is_zero() {
            send();
            return;
        }

        let spawned = thread::Builder::new()
            .name("fcntcp-delay".into())
            .spawn(move || {
                thread::sleep(delay);
                send();
            });

        if let Err(err) = spawned {
            tracing::trace!("impairment: could not spawn delay thread: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};

    #[test]
    fn unimpaired_sends_inline() {
        let impairment = Impairment::new(ImpairmentConfig::receiver());
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let count = Arc::clone(&count);
            impairment.dispatch(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert_eq!(count.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn certain_drop() {
        let impairment = Impairment::new(ImpairmentConfig {
            drop_chance: 1.0,
            delay_scale_ms: 0.0,
        });
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let count = Arc::clone(&count);
            impairment.dispatch(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn drop_rate() {
        let impairment = Impairment::new(ImpairmentConfig {
            drop_chance: 0.25,
            delay_scale_ms: 0.0,
        });
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10_000 {
            let count = Arc::clone(&count);
            impairment.dispatch(move || {
                count.fetch_add(1, Ordering::Relaxed);
            });
        }

        let delivered = count.load(Ordering::Relaxed);
        assert!((7000..8000).contains(&delivered), "{} delivered", delivered);
    }

    #[test]
    fn delayed_sends_do_not_block() {
        let impairment = Impairment::new(ImpairmentConfig {
            drop_chance: 0.0,
            delay_scale_ms: 20.0,
        });
        let (tx, rx) = mpsc::channel();

        let start = time::Instant::now();

        for i in 0..50 {
            let tx = tx.clone();
            impairment.dispatch(move || {
                let _ = tx.send(i);
            });
        }

        assert!(start.elapsed() < time::Duration::from_millis(500));

        let mut received: Vec<i32> = (0..50)
            .map(|_| rx.recv_timeout(time::Duration::from_secs(5)).unwrap())
            .collect();
        received.sort();

        assert_eq!(received, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn half_normal_delays() {
        let impairment = Impairment::new(ImpairmentConfig {
            drop_chance: 0.0,
            delay_scale_ms: 100.0,
        });
        let mut rng = rand::thread_rng();

        let samples: Vec<f64> = (0..20_000)
            .map(|_| impairment.sample_delay(&mut rng).as_secs_f64() * 1000.0)
            .collect();

        let mean = samples.iter().sum::<f64>() / samples.len() as f64;

        // E|z| = sqrt(2 / pi)
        let expected = 100.0 * (2.0 / std::f64::consts::PI).sqrt();
        assert!((mean - expected).abs() < 5.0, "mean delay {}", mean);
    }

    #[test]
    #[should_panic]
    fn invalid_drop_chance() {
        Impairment::new(ImpairmentConfig {
            drop_chance: 1.5,
            delay_scale_ms: 0.0,
        });
    }
}
