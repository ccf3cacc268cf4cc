// Time and backoff helpers shared by the store adapters and lock loops

use std::time::Duration;

use rand::Rng;

/// Current Unix time in milliseconds
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Default node identity: host name plus a short random suffix so several
/// engines in one process stay distinct.
pub fn default_node_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "hasp-node".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}

/// Exponential backoff with jitter, capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.max(Duration::from_millis(1)),
            max: max.max(initial),
        }
    }

    /// Next delay to sleep. Doubles on every call up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);

        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        let jitter = rand::rng().random_range(0..=jitter_cap);
        (base + Duration::from_millis(jitter)).min(self.max)
    }

    pub fn reset(&mut self, initial: Duration) {
        self.current = initial.max(Duration::from_millis(1));
    }
}
