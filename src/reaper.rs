//! Heartbeat reaper (spec.md §4.G): periodic sweep that evicts agents
//! whose last heartbeat has aged past the configured timeout.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::registry::Registry;

pub struct Reaper {
    registry: Registry,
    check_interval: Duration,
    timeout: Duration,
}

impl Reaper {
    pub fn new(registry: Registry, check_interval: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            check_interval,
            timeout,
        }
    }

    /// Runs until the process exits; intended to be spawned as its own
    /// task. One sweep per tick: snapshot under a read hold, evict outside
    /// the lock (spec.md §4.G).
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            interval.tick().await;
            self.sweep(Instant::now());
        }
    }

    /// One eviction pass, exposed directly for tests so timing doesn't
    /// depend on a live ticker.
    pub fn sweep(&self, now: Instant) {
        let victims: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|conn| conn.heartbeat_age(now) > self.timeout)
            .collect();

        for conn in victims {
            warn!(
                agent_id = %conn.agent_id,
                hostname = %conn.hostname,
                age_secs = conn.heartbeat_age(now).as_secs(),
                "evicting agent: heartbeat timeout exceeded"
            );
            self.registry.unregister(&conn.agent_id, &conn);
            info!(agent_id = %conn.agent_id, "agent evicted by heartbeat reaper");
        }
    }
}
