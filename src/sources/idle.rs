//! Idle sources.
//!
//! An idle source is ready on every iteration that reaches its priority,
//! and keeps running until its callback returns `false`. Idles are how
//! deferred work gets scheduled "when nothing more urgent is happening":
//! give them a priority below your I/O and timer sources and they will
//! only run on otherwise-quiet iterations.

use std::sync::{Arc, Mutex};

use crate::list::SourceId;
use crate::loop_logic::{Context, PRIORITY_DEFAULT};
use crate::sources::{DestroyNotify, EventSource, Prepare, SourceFn, UserData};
use crate::time::TimeVal;

/// A source that is ready whenever the loop reaches its priority.
pub struct IdleSource {
    callback: Mutex<SourceFn>,
}

impl IdleSource {
    /// Wraps a callback into an idle source.
    pub fn new<F>(callback: F) -> IdleSource
    where
        F: FnMut() -> bool + Send + 'static,
    {
        IdleSource {
            callback: Mutex::new(Box::new(callback)),
        }
    }
}

impl EventSource for IdleSource {
    fn prepare(&self, _now: TimeVal) -> Prepare {
        Prepare::new(true, Some(0))
    }

    fn check(&self, _now: TimeVal) -> bool {
        true
    }

    fn dispatch(&self, _now: TimeVal, _user_data: Option<&UserData>) -> bool {
        let mut callback = self.callback.lock().unwrap();
        (*callback)()
    }
}

impl Context {
    /// Registers an idle callback at the default priority and returns
    /// its identity tag.
    ///
    /// The callback runs on every iteration until it returns `false`.
    pub fn idle_add<F>(&self, callback: F) -> SourceId
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.idle_add_full(PRIORITY_DEFAULT, callback, None, None)
    }

    /// Like [`idle_add`](Context::idle_add), with an explicit priority,
    /// user datum and user-destroy notification.
    pub fn idle_add_full<F>(
        &self,
        priority: i32,
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
            Arc::new(IdleSource::new(callback)),
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
    fn always_ready_with_a_zero_timeout() {
        let source = IdleSource::new(|| true);
        let now = TimeVal::now();

        let prep = source.prepare(now);
        assert!(prep.ready);
        assert_eq!(prep.timeout, Some(0));
        assert!(source.check(now));
    }

    #[test]
    fn callback_result_is_propagated() {
        let keep = IdleSource::new(|| true);
        assert!(keep.dispatch(TimeVal::now(), None));

        let once = IdleSource::new(|| false);
        assert!(!once.dispatch(TimeVal::now(), None));
    }

    #[test]
    fn idle_runs_until_its_callback_declines() {
        let ctx = Context::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let seen = hits.clone();
        ctx.idle_add(move || seen.fetch_add(1, Ordering::SeqCst) < 2);

        for _ in 0..5 {
            ctx.iteration(false);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
