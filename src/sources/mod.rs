//! The event-source protocol.
//!
//! An event source goes through three phases on every loop iteration:
//! `prepare` (before polling, loop lock held), `check` (after polling,
//! loop lock held) and `dispatch` (loop lock released). The fourth
//! operation of the protocol, destruction, is the source's [`Drop`]
//! implementation; it runs exactly once, after the source has been
//! unlinked from the registry.
//!
//! Sources are registered as `Arc<dyn EventSource>` and the loop may
//! invoke them from the dispatching thread while other threads hold
//! clones of the `Arc`, so implementations keep their mutable state
//! behind interior mutability (the built-in sources use a `Mutex`). A
//! source registered with `can_recurse` can be dispatched again from
//! within its own callback and must pick its interior mutability
//! accordingly.

use std::any::Any;
use std::sync::Arc;

use crate::time::TimeVal;

pub mod idle;
pub mod timeout;

/// A type-erased user datum attached to a source.
///
/// The loop never looks inside it; it is handed back to
/// [`EventSource::dispatch`] and compared by `Arc` identity in
/// [`Context::source_remove_by_user_data`](crate::Context::source_remove_by_user_data).
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Notification run when a source is removed from the registry.
///
/// This is the release point for whatever the caller associated with the
/// source; it is called exactly once, after the source is unlinked.
pub type DestroyNotify = Box<dyn FnOnce() + Send>;

/// Callback type of the built-in timeout and idle sources.
///
/// Returning `true` keeps the source registered, `false` removes it.
pub type SourceFn = Box<dyn FnMut() -> bool + Send>;

/// What a source reports from its prepare phase.
#[derive(Debug, Clone, Copy)]
pub struct Prepare {
    /// The source is ready to dispatch without polling.
    pub ready: bool,
    /// Upper bound on the poll wait in milliseconds; `None` places no
    /// bound. `Some(0)` forces a non-blocking poll.
    pub timeout: Option<i32>,
}

impl Prepare {
    /// Shorthand constructor.
    pub fn new(ready: bool, timeout: Option<i32>) -> Prepare {
        Prepare { ready, timeout }
    }
}

/// A registered event source.
///
/// `prepare` and `check` run with the loop lock held and must not call
/// back into the [`Context`](crate::Context); `dispatch` runs with the
/// lock released and may freely add or remove sources, or run the loop
/// recursively.
pub trait EventSource: Send + Sync {
    /// Reports whether the source is already ready and how long the loop
    /// may wait in poll on its behalf.
    fn prepare(&self, now: TimeVal) -> Prepare;

    /// Decides readiness from post-poll state, such as a descriptor's
    /// result mask or the elapsed time.
    fn check(&self, now: TimeVal) -> bool;

    /// Performs the user-visible side effect. Returning `false` asks the
    /// loop to remove the source.
    fn dispatch(&self, now: TimeVal, user_data: Option<&UserData>) -> bool;
}
