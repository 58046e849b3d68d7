//! Local time, durations and the named-timer wheel.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Local time, in milliseconds since the Unix epoch.
///
/// Monotonic: [`LocalTime::now`] never goes backwards within a process.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Ord, PartialOrd, Default)]
pub struct LocalTime {
    millis: u128,
}

impl LocalTime {
    /// Current system time, clamped to be monotonic.
    pub fn now() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = Self::from(SystemTime::now()).as_secs();
        let last = LAST.load(Ordering::SeqCst);

        if now < last {
            Self::from_secs(last)
        } else {
            LAST.store(now, Ordering::SeqCst);
            Self::from_secs(now)
        }
    }

    pub const fn from_secs(secs: u64) -> Self {
        Self {
            millis: secs as u128 * 1000,
        }
    }

    pub fn as_secs(&self) -> u64 {
        (self.millis / 1000) as u64
    }

    /// Advance this time by the given duration.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.millis += duration.as_millis();
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        let millis = system
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        Self { millis }
    }
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_secs())
    }
}

impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = LocalDuration;

    fn sub(self, other: LocalTime) -> LocalDuration {
        LocalDuration(self.millis.saturating_sub(other.millis))
    }
}

impl std::ops::Add<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn add(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis + other.0,
        }
    }
}

impl std::ops::Sub<LocalDuration> for LocalTime {
    type Output = LocalTime;

    fn sub(self, other: LocalDuration) -> LocalTime {
        LocalTime {
            millis: self.millis.saturating_sub(other.0),
        }
    }
}

/// Time duration as measured locally.
#[derive(Debug, Copy, Clone, PartialOrd, Ord, PartialEq, Eq, Default)]
pub struct LocalDuration(u128);

impl LocalDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs as u128 * 1000)
    }

    pub const fn from_mins(mins: u64) -> Self {
        Self::from_secs(mins * 60)
    }

    pub const fn from_millis(millis: u128) -> Self {
        Self(millis)
    }

    pub const fn as_secs(&self) -> u64 {
        (self.0 / 1000) as u64
    }

    pub const fn as_millis(&self) -> u128 {
        self.0
    }
}

impl std::fmt::Display for LocalDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.as_millis() < 1000 {
            write!(f, "{} ms", self.as_millis())
        } else if self.as_secs() < 60 {
            write!(f, "{} second(s)", self.as_secs())
        } else {
            write!(f, "{} minute(s)", self.as_secs() / 60)
        }
    }
}

impl From<LocalDuration> for std::time::Duration {
    fn from(other: LocalDuration) -> Self {
        std::time::Duration::from_millis(other.0 as u64)
    }
}

/// Clock that tells the time.
pub trait Clock: Clone {
    fn local_time(&self) -> LocalTime;
}

impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// Clock with interior mutability, shared between the reactor and the state
/// machine (and advanced manually in tests).
#[derive(Debug, Clone, Default)]
pub struct RefClock {
    inner: Arc<Mutex<LocalTime>>,
}

impl RefClock {
    pub fn new(time: LocalTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(time)),
        }
    }

    pub fn set(&self, time: LocalTime) {
        *self.inner.lock().unwrap() = time;
    }

    pub fn elapse(&self, duration: LocalDuration) {
        self.inner.lock().unwrap().elapse(duration);
    }
}

impl Clock for RefClock {
    fn local_time(&self) -> LocalTime {
        *self.inner.lock().unwrap()
    }
}

/// One-shot timers keyed by a stable identity.
///
/// Re-registering a key replaces its deadline; cancelling a key that already
/// fired is a no-op. Late wake-ups are therefore harmless as long as expiry
/// handlers are idempotent.
#[derive(Debug)]
pub struct TimerWheel<K> {
    timers: Vec<(K, LocalTime)>,
}

impl<K: PartialEq + Clone> TimerWheel<K> {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn register(&mut self, key: K, deadline: LocalTime) {
        self.cancel(&key);
        self.timers.push((key, deadline));
        // Soonest deadline last, so `wake` can pop from the back.
        self.timers.sort_unstable_by(|(_, a), (_, b)| b.cmp(a));
    }

    pub fn cancel(&mut self, key: &K) {
        self.timers.retain(|(k, _)| k != key);
    }

    /// How long until the next deadline, if any.
    pub fn next(&self, now: LocalTime) -> Option<LocalDuration> {
        self.timers.last().map(|(_, t)| {
            if *t >= now {
                *t - now
            } else {
                LocalDuration::from_secs(0)
            }
        })
    }

    /// Pop all keys whose deadline has passed, in deadline order.
    pub fn wake(&mut self, now: LocalTime, woken: &mut Vec<K>) -> usize {
        let before = woken.len();

        while let Some((k, t)) = self.timers.pop() {
            if now >= t {
                woken.push(k);
            } else {
                self.timers.push((k, t));
                break;
            }
        }
        woken.len() - before
    }
}

impl<K: PartialEq + Clone> Default for TimerWheel<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_wheel_fires_in_order() {
        let mut wheel = TimerWheel::new();
        let t0 = LocalTime::from_secs(100);

        wheel.register("b", t0 + LocalDuration::from_secs(20));
        wheel.register("a", t0 + LocalDuration::from_secs(10));
        assert_eq!(wheel.next(t0), Some(LocalDuration::from_secs(10)));

        let mut woken = Vec::new();
        wheel.wake(t0 + LocalDuration::from_secs(15), &mut woken);
        assert_eq!(woken, vec!["a"]);

        wheel.wake(t0 + LocalDuration::from_secs(25), &mut woken);
        assert_eq!(woken, vec!["a", "b"]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn timer_wheel_replaces_and_cancels() {
        let mut wheel = TimerWheel::new();
        let t0 = LocalTime::from_secs(0);

        wheel.register("x", t0 + LocalDuration::from_secs(5));
        wheel.register("x", t0 + LocalDuration::from_secs(50));
        assert_eq!(wheel.len(), 1);

        let mut woken = Vec::new();
        wheel.wake(t0 + LocalDuration::from_secs(10), &mut woken);
        assert!(woken.is_empty());

        wheel.cancel(&"x");
        wheel.cancel(&"x");
        assert!(wheel.is_empty());
    }
}
