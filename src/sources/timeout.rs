//! Timeout sources.
//!
//! A timeout source fires once its interval has elapsed. If the callback
//! returns `true` the source re-arms itself for another interval from the
//! time of the dispatch; otherwise it is removed from the loop.
//!
//! Timer resolution is bounded by the poll timeout, i.e. one
//! millisecond; a timeout can also fire later than requested if the loop
//! is busy dispatching more urgent sources.

use std::sync::{Arc, Mutex};

use crate::list::SourceId;
use crate::loop_logic::{Context, PRIORITY_DEFAULT};
use crate::sources::{DestroyNotify, EventSource, Prepare, SourceFn, UserData};
use crate::time::TimeVal;

struct TimeoutState {
    expiration: TimeVal,
    interval: u32,
    callback: SourceFn,
}

/// A source firing after an interval, repeating for as long as its
/// callback returns `true`.
///
/// Usually registered through [`Context::timeout_add`]; construct one
/// directly if you need to keep the `Arc` around, for instance for
/// [`Context::source_remove_by_source_data`].
pub struct TimeoutSource {
    state: Mutex<TimeoutState>,
}

impl TimeoutSource {
    /// Creates a timeout due `interval_ms` milliseconds from now.
    pub fn new<F>(interval_ms: u32, callback: F) -> TimeoutSource
    where
        F: FnMut() -> bool + Send + 'static,
    {
        TimeoutSource {
            state: Mutex::new(TimeoutState {
                expiration: TimeVal::now().add_msec(i64::from(interval_ms)),
                interval: interval_ms,
                callback: Box::new(callback),
            }),
        }
    }
}

impl EventSource for TimeoutSource {
    fn prepare(&self, now: TimeVal) -> Prepare {
        let state = self.state.lock().unwrap();
        let msec = state.expiration.msec_diff(now);
        Prepare::new(msec <= 0, Some(msec.clamp(0, i32::MAX as i64) as i32))
    }

    fn check(&self, now: TimeVal) -> bool {
        now >= self.state.lock().unwrap().expiration
    }

    fn dispatch(&self, now: TimeVal, _user_data: Option<&UserData>) -> bool {
        let mut state = self.state.lock().unwrap();
        if (state.callback)() {
            let interval = i64::from(state.interval);
            state.expiration = now.add_msec(interval);
            true
        } else {
            false
        }
    }
}

impl Context {
    /// Registers a timeout of `interval_ms` milliseconds at the default
    /// priority and returns its identity tag.
    ///
    /// The callback fires every time the interval elapses, until it
    /// returns `false`.
    pub fn timeout_add<F>(&self, interval_ms: u32, callback: F) -> SourceId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.timeout_add_full(PRIORITY_DEFAULT, interval_ms, callback, None, None)
    }

    /// Like [`timeout_add`](Context::timeout_add), with an explicit
    /// priority, user datum and user-destroy notification.
    pub fn timeout_add_full<F>(
        &self,
        priority: i32,
        interval_ms: u32,
        callback: F,
        user_data: Option<UserData>,
        user_destroy: Option<DestroyNotify>,
    ) -> SourceId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.source_add(
            priority,
            false,
            Arc::new(TimeoutSource::new(interval_ms, callback)),
            user_data,
            user_destroy,
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn becomes_ready_when_the_interval_elapses() {
        let source = TimeoutSource::new(1000, || true);
        let now = TimeVal::now();

        let prep = source.prepare(now);
        assert!(!prep.ready);
        let wait = prep.timeout.unwrap();
        assert!(wait > 0 && wait <= 1000);
        assert!(!source.check(now));

        let later = now.add_msec(1500);
        let prep = source.prepare(later);
        assert!(prep.ready);
        assert_eq!(prep.timeout, Some(0));
        assert!(source.check(later));
    }

    #[test]
    fn rearm_carries_microseconds_into_seconds() {
        let source = TimeoutSource::new(1500, || true);

        let base = TimeVal { sec: 100, usec: 900_000 };
        assert!(source.dispatch(base, None));

        // expiration is now base + 1.5s = (102, 400_000)
        assert!(!source.check(base.add_msec(1499)));
        assert!(source.check(base.add_msec(1500)));
    }

    #[test]
    fn callback_false_requests_removal() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let source = TimeoutSource::new(0, move || seen.fetch_add(1, Ordering::SeqCst) < 2);

        let now = TimeVal::now();
        assert!(source.dispatch(now, None));
        assert!(source.dispatch(now, None));
        assert!(!source.dispatch(now, None));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn repeating_timer_fires_then_removes_itself() {
        let ctx = Context::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = hits.clone();
        let id = ctx.timeout_add(10, move || seen.fetch_add(1, Ordering::SeqCst) < 2);

        let mut guard = 0;
        while hits.load(Ordering::SeqCst) < 3 && guard < 200 {
            ctx.iteration(true);
            guard += 1;
        }

        // true on calls 1 and 2, false on call 3: fires exactly three
        // times and is then gone.
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(!ctx.source_remove(id));
    }
}
