use crate::config::Config;
use rand::RngExt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Spaces out navigations with a fixed interval plus random jitter.
#[derive(Debug)]
pub struct Pacer {
    interval_ms: u64,
    jitter_ms: u64,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(interval_ms: u64, jitter_ms: u64) -> Self {
        Self { interval_ms, jitter_ms, last: None }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.request_interval_ms, config.request_jitter_ms)
    }

    fn delay(&self) -> Duration {
        let jitter = if self.jitter_ms > 0 { rand::rng().random_range(0..=self.jitter_ms) } else { 0 };
        Duration::from_millis(self.interval_ms + jitter)
    }

    /// Sleeps until the pacing window since the previous navigation has
    /// passed. The first call returns immediately.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            let due = last + self.delay();
            let now = Instant::now();
            if due > now {
                debug!("Pacing {}ms", (due - now).as_millis());
                tokio::time::sleep_until(due).await;
            }
        }
        self.last = Some(Instant::now());
    }
}
