use chrono::{DateTime, Utc};

/// Time source for all expiry math inside the engine. Injected so tests can
/// freeze time; nothing in this crate reads the process clock directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
