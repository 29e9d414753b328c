use std::time::{SystemTime, UNIX_EPOCH};

/// Injected time source so TTL behavior is deterministic under test.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_millis() as u64,
            Err(_) => 0,
        }
    }
}

pub fn unix_seconds(clock: &dyn Clock) -> u64 {
    clock.now_ms() / 1000
}
