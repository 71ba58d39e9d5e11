use std::{
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Content tags are rescanned at most once per minute.
pub const CONTENT_STALENESS: Duration = Duration::from_secs(60);
/// Conflict classifications are recomputed at most every ten seconds.
pub const CONFLICT_STALENESS: Duration = Duration::from_secs(10);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Used by tests that exercise the
/// staleness windows.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + offset
    }
}

/// A derived value plus the instant it was computed at.
#[derive(Debug, Clone)]
pub struct TimedCache<T> {
    value: Option<T>,
    computed_at: Option<Instant>,
    window: Duration,
}

impl<T> TimedCache<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            value: None,
            computed_at: None,
            window,
        }
    }

    pub fn is_fresh(&self, now: Instant) -> bool {
        match self.computed_at {
            Some(at) => now.saturating_duration_since(at) <= self.window,
            None => false,
        }
    }

    /// Returns the cached value while it is fresh, otherwise recomputes it.
    pub fn get_or_refresh(&mut self, now: Instant, compute: impl FnOnce() -> T) -> &T {
        if !self.is_fresh(now) {
            self.value = None;
        }
        if self.value.is_none() {
            self.computed_at = Some(now);
        }
        self.value.get_or_insert_with(compute)
    }

    pub fn computed_at(&self) -> Option<Instant> {
        self.computed_at
    }

    pub fn invalidate(&mut self) {
        self.computed_at = None;
    }
}
