use std::time::Duration;

/// Bounded reconnect schedule: the delay doubles from `initial_delay` up to
/// `max_delay`, and the session gives up after `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (zero-based), or `None`
    /// once the attempt budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let doubled = self
            .initial_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        Some(doubled.min(self.max_delay))
    }
}
