// Swarm locks are meant to be held for microseconds. With the "timed_existence"
// feature on, guards that live longer than that are logged.

#[cfg(not(feature = "timed_existence"))]
mod imp {
    use std::ops::{Deref, DerefMut};

    pub struct TimedGuard<T>(T);

    impl<T> TimedGuard<T> {
        #[inline(always)]
        pub fn new(guard: T, _reason: &'static str) -> Self {
            Self(guard)
        }
    }

    impl<T> Deref for TimedGuard<T> {
        type Target = T;

        #[inline(always)]
        fn deref(&self) -> &T {
            &self.0
        }
    }

    impl<T> DerefMut for TimedGuard<T> {
        #[inline(always)]
        fn deref_mut(&mut self) -> &mut T {
            &mut self.0
        }
    }

    #[inline(always)]
    pub fn timeit<R>(_reason: &'static str, f: impl FnOnce() -> R) -> R {
        f()
    }
}

#[cfg(feature = "timed_existence")]
mod imp {
    use std::ops::{Deref, DerefMut};
    use std::time::{Duration, Instant};

    use tracing::warn;

    const MAX_HELD: Duration = Duration::from_millis(1);

    pub struct TimedGuard<T> {
        guard: T,
        reason: &'static str,
        acquired: Instant,
    }

    impl<T> TimedGuard<T> {
        pub fn new(guard: T, reason: &'static str) -> Self {
            Self {
                guard,
                reason,
                acquired: Instant::now(),
            }
        }
    }

    impl<T> Drop for TimedGuard<T> {
        fn drop(&mut self) {
            let held = self.acquired.elapsed();
            if held > MAX_HELD {
                warn!(reason = self.reason, ?held, "swarm lock held for too long");
            }
        }
    }

    impl<T> Deref for TimedGuard<T> {
        type Target = T;

        fn deref(&self) -> &T {
            &self.guard
        }
    }

    impl<T> DerefMut for TimedGuard<T> {
        fn deref_mut(&mut self) -> &mut T {
            &mut self.guard
        }
    }

    pub fn timeit<R>(reason: &'static str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let r = f();
        let waited = started.elapsed();
        if waited > MAX_HELD {
            warn!(reason, ?waited, "waited too long for swarm lock");
        }
        r
    }
}

pub(crate) use imp::{TimedGuard, timeit};
