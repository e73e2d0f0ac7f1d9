//! Reconnection backoff with jitter
//!
//! Exponential growth capped at a maximum, with a random jitter fraction so
//! a fleet of daemons does not reconnect in lockstep. The wait is
//! cancellable through the supervisor's shutdown signal.

use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter, in `[0, 1]`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Per-slot backoff state
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempt: 0,
        }
    }

    /// Sleep out the current delay (plus jitter), growing the next one.
    /// Returns false if the shutdown signal fired first.
    pub async fn wait(&mut self, shutdown: &mut watch::Receiver<bool>) -> bool {
        self.attempt += 1;
        let jitter = self
            .current
            .mul_f64(rand::thread_rng().gen_range(0.0..=self.config.jitter));
        let delay = self.current + jitter;
        debug!(attempt = self.attempt, delay_ms = delay.as_millis() as u64, "backing off");

        self.current = self
            .current
            .mul_f64(self.config.multiplier)
            .min(self.config.max);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.changed() => false,
        }
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(80),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_exponential_growth_capped() {
        let (_tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::new(fast_config());

        assert!(backoff.wait(&mut rx).await);
        assert_eq!(backoff.current_delay(), Duration::from_millis(20));
        assert!(backoff.wait(&mut rx).await);
        assert_eq!(backoff.current_delay(), Duration::from_millis(40));
        assert!(backoff.wait(&mut rx).await);
        assert_eq!(backoff.current_delay(), Duration::from_millis(80));
        assert!(backoff.wait(&mut rx).await);
        assert_eq!(backoff.current_delay(), Duration::from_millis(80));
        assert_eq!(backoff.attempt(), 4);
    }

    #[tokio::test]
    async fn test_reset() {
        let (_tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::new(fast_config());
        backoff.wait(&mut rx).await;
        backoff.wait(&mut rx).await;

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.current_delay(), Duration::from_millis(10));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_wait() {
        let (tx, mut rx) = watch::channel(false);
        let mut backoff = Backoff::new(BackoffConfig {
            initial: Duration::from_secs(60),
            ..fast_config()
        });

        let cancel = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
            tx
        });

        let start = std::time::Instant::now();
        assert!(!backoff.wait(&mut rx).await);
        assert!(start.elapsed() < Duration::from_secs(5));
        drop(cancel.await.unwrap());
    }
}
