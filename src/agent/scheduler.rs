use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Heartbeat timing with jitter so a fleet doesn't phone home in lockstep
#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    base_interval: Duration,
    jitter_range: Duration,
}

impl HeartbeatScheduler {
    /// # Arguments
    /// * `interval_secs` - Base heartbeat interval in seconds
    /// * `jitter_secs` - Maximum jitter added in seconds
    pub fn new(interval_secs: u64, jitter_secs: u64) -> Self {
        Self {
            base_interval: Duration::from_secs(interval_secs),
            jitter_range: Duration::from_secs(jitter_secs),
        }
    }

    pub fn base_interval(&self) -> Duration {
        self.base_interval
    }

    /// Deadline of the next heartbeat and its wall-clock time, from one jitter draw
    pub fn next_deadline(&self) -> (Instant, DateTime<Utc>) {
        let interval = self.calculate_next_interval();
        (Instant::now() + interval, Utc::now() + to_chrono(interval))
    }

    /// Wall-clock estimate of the next heartbeat, for display
    pub fn next_heartbeat_time(&self) -> DateTime<Utc> {
        Utc::now() + to_chrono(self.calculate_next_interval())
    }

    fn calculate_next_interval(&self) -> Duration {
        self.base_interval + self.random_jitter()
    }

    /// Random jitter in [0, jitter_range]
    fn random_jitter(&self) -> Duration {
        let jitter_secs = rand::thread_rng().gen_range(0..=self.jitter_range.as_secs());
        Duration::from_secs(jitter_secs)
    }
}

fn to_chrono(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::zero())
}
