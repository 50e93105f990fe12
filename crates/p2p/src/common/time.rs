//! Time sources.
use std::sync::{Arc, Mutex};

use crate::net::LocalTime;

/// Clock that tells the time.
pub trait Clock: Clone {
    /// Tell the time in local time.
    fn local_time(&self) -> LocalTime;
}

/// Clock with interior mutability. Lets tests advance time manually while
/// sharing the clock between components.
#[derive(Debug, Clone)]
pub struct RefClock<T: Clock> {
    inner: Arc<Mutex<T>>,
}

impl<T: Clock> std::ops::Deref for RefClock<T> {
    type Target = Arc<Mutex<T>>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T: Clock> From<T> for RefClock<T> {
    fn from(other: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(other)),
        }
    }
}

impl<T: Clock> Clock for RefClock<T> {
    fn local_time(&self) -> LocalTime {
        self.inner.lock().unwrap().local_time()
    }
}

/// A fixed time, settable from outside. The reactor updates it on every
/// tick.
impl Clock for LocalTime {
    fn local_time(&self) -> LocalTime {
        *self
    }
}

/// A clock the reactor advances on every tick.
pub trait DrivenClock: Clock {
    fn set(&mut self, local_time: LocalTime);
}

impl DrivenClock for RefClock<LocalTime> {
    fn set(&mut self, local_time: LocalTime) {
        *self.inner.lock().unwrap() = local_time;
    }
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> LocalTime {
        LocalTime::now()
    }
}

impl DrivenClock for SystemClock {
    fn set(&mut self, _local_time: LocalTime) {}
}
