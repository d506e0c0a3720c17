//! Process-wide spacing of oracle requests.

use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between request starts. Callers queue on the
/// mutex, so requests are also serialized.
#[derive(Debug)]
pub struct Throttle {
    last_start: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self {
            last_start: Mutex::new(None),
        }
    }

    /// Wait until `interval` has passed since the previous start, then
    /// record a new start.
    pub async fn wait(&self, interval: Duration) {
        let mut last = self.last_start.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + interval;
            let now = Instant::now();
            if ready_at > now {
                tracing::debug!(
                    wait_ms = (ready_at - now).as_millis() as u64,
                    "throttling oracle request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_THROTTLE: OnceLock<Throttle> = OnceLock::new();

/// The throttle every oracle client in the process shares.
pub fn global() -> &'static Throttle {
    GLOBAL_THROTTLE.get_or_init(Throttle::new)
}

pub fn interval_for_rpm(requests_per_minute: u32) -> Duration {
    if requests_per_minute == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(60_000 / u64::from(requests_per_minute))
}
