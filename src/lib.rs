//! A priority-ordered, reentrant, callback-based main loop.
//!
//! This crate provides a [`Context`] type hosting a set of registered
//! **event sources**, dispatched in strict priority order: on every
//! iteration, the most urgent sources that have something to do are the
//! only ones serviced, and within one priority level sources run in
//! registration order. Each source is associated with a callback that is
//! invoked whenever the source decides it is ready.
//!
//! Readiness is decided by the sources themselves through a three-phase
//! protocol (*prepare* / *check* / *dispatch*, see [`EventSource`])
//! wrapped around a single OS-level poll. File descriptors take part in
//! that poll through [`Context::poll_add`], and two source kinds come
//! built in: timeouts ([`Context::timeout_add`]) and idle callbacks
//! ([`Context::idle_add`]).
//!
//! ## How to use it
//!
//! ```
//! use mainloop::{Context, MainLoop};
//!
//! let context = Context::new();
//! let main_loop = MainLoop::new(&context);
//!
//! // A one-shot timer: quit the loop when it fires.
//! let stopper = main_loop.clone();
//! context.timeout_add(20, move || {
//!     stopper.quit();
//!     false
//! });
//!
//! main_loop.run();
//! ```
//!
//! ## Threads
//!
//! Dispatching is single-threaded and cooperative: callbacks run on
//! whichever thread is iterating the loop, and a long-running callback
//! stalls everything else. The registries however are protected by a
//! lock and may be used from any thread; adding a source while another
//! thread is blocked polling wakes that thread up, so the new source is
//! taken into account right away. A callback may itself run the loop
//! recursively; see [`Context::source_add`] for how recursion into the
//! same source is controlled.

#![warn(missing_docs)]

mod error;
mod list;
mod loop_logic;
mod sources;
mod sys;
mod time;

pub use error::{Error, Result};
pub use list::SourceId;
pub use loop_logic::{Context, MainLoop, PRIORITY_DEFAULT, PRIORITY_HIGH, PRIORITY_LOW};
pub use sources::idle::IdleSource;
pub use sources::timeout::TimeoutSource;
pub use sources::{DestroyNotify, EventSource, Prepare, SourceFn, UserData};
pub use sys::{poll_fds, select_fds, EventMask, PollEntry, PollFd, PollFn};
pub use time::{current_time, TimeVal};
