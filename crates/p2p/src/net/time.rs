//! The pool's notion of time.
//!
//! Durations are plain [`std::time::Duration`]; only the instant type is
//! ours, so the reactor can hand one consistent clock reading to the whole
//! state machine per poll iteration.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A wall-clock reading, with millisecond precision.
///
/// Readings taken through [`LocalTime::now`] never go backwards, even when
/// the system clock does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct LocalTime {
    since_epoch: Duration,
}

impl LocalTime {
    /// The current time, pinned to the furthest reading observed so far.
    pub fn now() -> Self {
        static LATEST_MILLIS: AtomicU64 = AtomicU64::new(0);

        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let millis = LATEST_MILLIS.fetch_max(wall, Ordering::SeqCst).max(wall);

        Self {
            since_epoch: Duration::from_millis(millis),
        }
    }

    /// A reading from whole seconds since the Unix epoch.
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            since_epoch: Duration::from_secs(secs),
        }
    }

    /// Whole seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.since_epoch.as_secs()
    }

    /// The absolute difference between two readings.
    pub fn diff(&self, other: LocalTime) -> Duration {
        if *self >= other {
            *self - other
        } else {
            other - *self
        }
    }

    /// Advance this reading. Test clocks are driven with this.
    pub fn elapse(&mut self, duration: Duration) {
        self.since_epoch += duration;
    }
}

impl From<SystemTime> for LocalTime {
    fn from(system: SystemTime) -> Self {
        Self {
            since_epoch: system.duration_since(UNIX_EPOCH).unwrap_or_default(),
        }
    }
}

/// The time elapsed since `other`; zero if `other` is the later reading.
impl std::ops::Sub<LocalTime> for LocalTime {
    type Output = Duration;

    fn sub(self, other: LocalTime) -> Duration {
        self.since_epoch.saturating_sub(other.since_epoch)
    }
}

impl std::ops::Add<Duration> for LocalTime {
    type Output = LocalTime;

    fn add(self, duration: Duration) -> LocalTime {
        LocalTime {
            since_epoch: self.since_epoch + duration,
        }
    }
}

/// The reactor's pending wake-ups, nearest deadline first.
///
/// A deadline within `resolution` of one already scheduled is merged into
/// it, so a burst of `SetTimer` instructions collapses into a single poll
/// timeout.
pub struct Timers {
    deadlines: BinaryHeap<Reverse<LocalTime>>,
    resolution: Duration,
}

impl Timers {
    pub fn new(resolution: Duration) -> Self {
        Self {
            deadlines: BinaryHeap::new(),
            resolution,
        }
    }

    /// The number of pending wake-ups.
    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Schedule a wake-up. Returns `false` if an existing deadline already
    /// covers it.
    pub fn schedule(&mut self, at: LocalTime) -> bool {
        if self
            .deadlines
            .iter()
            .any(|Reverse(t)| t.diff(at) < self.resolution)
        {
            return false;
        }
        self.deadlines.push(Reverse(at));

        true
    }

    /// How long the reactor may sleep before the nearest deadline is due.
    pub fn next_wait(&self, now: LocalTime) -> Option<Duration> {
        self.deadlines.peek().map(|Reverse(at)| *at - now)
    }

    /// Drop every deadline that `now` has passed. Returns how many fired.
    pub fn expire(&mut self, now: LocalTime) -> usize {
        let mut fired = 0;

        while let Some(Reverse(at)) = self.deadlines.peek() {
            if *at > now {
                break;
            }
            self.deadlines.pop();
            fired += 1;
        }
        fired
    }
}
