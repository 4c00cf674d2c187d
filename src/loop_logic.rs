use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;

use crate::list::{SourceFlags, SourceId, SourceList, SourceNode};
use crate::sources::{DestroyNotify, EventSource, UserData};
use crate::sys::{poll_fds, EventMask, PollEntry, PollFd, PollFn};
use crate::time::TimeVal;

/// Default priority for new sources. Lower values are more urgent.
pub const PRIORITY_DEFAULT: i32 = 0;

/// A priority band more urgent than the default.
pub const PRIORITY_HIGH: i32 = -100;

/// A priority band for background work, starved by anything more urgent.
pub const PRIORITY_LOW: i32 = 300;

struct PollRec {
    priority: i32,
    fd: Arc<PollFd>,
}

/// Identity comparison on the data pointer only; `Arc::ptr_eq` on trait
/// objects also compares vtable addresses, which are not unique.
fn same_arc<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Everything behind the single loop lock: the source registry, the
/// poll-record registry, the pending-dispatch queue and the wake-up
/// machinery.
struct Inner {
    sources: SourceList,
    poll_records: Vec<PollRec>,
    pending: VecDeque<SourceId>,
    poll_fn: PollFn,
    poll_waiting: bool,
    wake_pipe: Option<(RawFd, RawFd)>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for mut node in self.sources.drain() {
            let destroy = node.user_destroy.take();
            drop(node);
            if let Some(destroy) = destroy {
                destroy();
            }
        }
        if let Some((read_fd, write_fd)) = self.wake_pipe.take() {
            if let Err(e) = unistd::close(read_fd) {
                log::warn!("[mainloop] Failed to close wake-up pipe: {:?}", e);
            }
            if let Err(e) = unistd::close(write_fd) {
                log::warn!("[mainloop] Failed to close wake-up pipe: {:?}", e);
            }
        }
    }
}

/// A main-loop context.
///
/// The context holds the source registry, the poll-record registry and
/// the polling machinery. It is a cheap cloneable handle; clones refer
/// to the same loop, and any of them may be used from any thread to add
/// or remove sources while another thread runs the loop. Running the
/// loop itself (via [`Context::iteration`] or [`MainLoop::run`]) is a
/// single-threaded, cooperative affair.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Context { ... }")
    }
}

impl Default for Context {
    fn default() -> Context {
        Context::new()
    }
}

impl Context {
    /// Creates a new, empty context.
    pub fn new() -> Context {
        Context {
            inner: Arc::new(Mutex::new(Inner {
                sources: SourceList::new(),
                poll_records: Vec::new(),
                pending: VecDeque::new(),
                poll_fn: poll_fds,
                poll_waiting: false,
                wake_pipe: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    /// Registers an event source and returns its identity tag.
    ///
    /// The source is inserted after all existing sources of equal
    /// priority, so sources at one priority dispatch in registration
    /// order. `can_recurse` allows the source to be dispatched again
    /// from within its own dispatch. The optional `user_data` is handed
    /// to every dispatch and is what
    /// [`source_remove_by_user_data`](Context::source_remove_by_user_data)
    /// matches on; `user_destroy` runs once when the source is removed.
    ///
    /// If the loop is currently blocked in poll on another thread, it is
    /// woken so the new source participates no later than the next
    /// iteration.
    pub fn source_add(
        &self,
        priority: i32,
        can_recurse: bool,
        source: Arc<dyn EventSource>,
        user_data: Option<UserData>,
        user_destroy: Option<DestroyNotify>,
    ) -> SourceId {
        let mut state = self.lock();
        let id = state
            .sources
            .insert(priority, can_recurse, source, user_data, user_destroy);

        if state.poll_waiting {
            state.poll_waiting = false;
            if let Some((_, write_fd)) = state.wake_pipe {
                if let Err(e) = unistd::write(write_fd, &[0u8]) {
                    log::warn!("[mainloop] Failed to write to the wake-up pipe: {:?}", e);
                }
            }
        }

        id
    }

    /// Removes the source with the given tag.
    ///
    /// Returns whether a source was found. The source's own destruction
    /// runs first, then its user-destroy notification, each exactly
    /// once; if the source is currently dispatching, the in-flight
    /// dispatch runs to completion and the source is unlinked when it
    /// returns.
    pub fn source_remove(&self, id: SourceId) -> bool {
        let mut state = self.lock();
        match state.sources.position_valid(id) {
            Some(idx) => {
                let (node, destroy) = Self::detach_source(&mut state, idx);
                drop(state);
                drop(node);
                if let Some(destroy) = destroy {
                    destroy();
                }
                true
            }
            None => false,
        }
    }

    /// Removes the first source whose user datum is `user_data`
    /// (compared by `Arc` identity).
    pub fn source_remove_by_user_data(&self, user_data: &UserData) -> bool {
        self.remove_first(|node| match &node.user_data {
            Some(data) => same_arc(data, user_data),
            None => false,
        })
    }

    /// Removes the first source whose source object is `source`
    /// (compared by `Arc` identity against the value given to
    /// [`source_add`](Context::source_add)).
    pub fn source_remove_by_source_data(&self, source: &Arc<dyn EventSource>) -> bool {
        self.remove_first(|node| same_arc(&node.source, source))
    }

    fn remove_first<F>(&self, pred: F) -> bool
    where
        F: Fn(&SourceNode) -> bool,
    {
        let mut state = self.lock();
        match state.sources.find_valid(pred) {
            Some(idx) => {
                let (node, destroy) = Self::detach_source(&mut state, idx);
                drop(state);
                drop(node);
                if let Some(destroy) = destroy {
                    destroy();
                }
                true
            }
            None => false,
        }
    }

    /// Unlinks the node at `idx`, or tombstones it if a dispatch is in
    /// flight (the dispatching frame unlinks it, and runs both destroy
    /// hooks, when the dispatch returns). Returns what must be released
    /// outside the lock: the node first, then the user-destroy
    /// notification.
    fn detach_source(state: &mut Inner, idx: usize) -> (Option<SourceNode>, Option<DestroyNotify>) {
        if state.sources.get(idx).flags.contains(SourceFlags::IN_CALL) {
            state.sources.get_mut(idx).flags.remove(SourceFlags::VALID);
            (None, None)
        } else {
            let mut node = state.sources.remove(idx);
            let destroy = node.user_destroy.take();
            (Some(node), destroy)
        }
    }

    /// Registers a descriptor for readiness polling at the given
    /// priority.
    ///
    /// The descriptor is included in every poll whose priority ceiling
    /// admits it; after each such poll its result mask is updated, to be
    /// read from a source's `check`. No duplicate detection is
    /// performed.
    pub fn poll_add(&self, priority: i32, fd: Arc<PollFd>) {
        let mut state = self.lock();
        Self::poll_add_unlocked(&mut state, priority, fd);
    }

    fn poll_add_unlocked(state: &mut Inner, priority: i32, fd: Arc<PollFd>) {
        let pos = state
            .poll_records
            .iter()
            .position(|rec| rec.priority > priority)
            .unwrap_or(state.poll_records.len());
        state.poll_records.insert(pos, PollRec { priority, fd });
    }

    /// Unregisters a descriptor. Only the first record matching `fd` (by
    /// `Arc` identity) is removed.
    pub fn poll_remove(&self, fd: &Arc<PollFd>) {
        let mut state = self.lock();
        if let Some(idx) = state
            .poll_records
            .iter()
            .position(|rec| Arc::ptr_eq(&rec.fd, fd))
        {
            state.poll_records.remove(idx);
        }
    }

    /// Replaces the readiness backend used by this context; `None`
    /// restores the default `poll(2)`-based one.
    pub fn set_poll_function(&self, func: Option<PollFn>) {
        self.lock().poll_fn = func.unwrap_or(poll_fds);
    }

    /// Returns whether an iteration would dispatch at least one source,
    /// without dispatching anything.
    pub fn pending(&self) -> bool {
        self.iterate(false, false)
    }

    /// Runs a single loop iteration, blocking in poll iff `block`.
    /// Returns whether any source was dispatched.
    pub fn iteration(&self, block: bool) -> bool {
        self.iterate(block, true)
    }

    fn iterate(&self, block: bool, dispatch: bool) -> bool {
        debug_assert!(!block || dispatch);

        let now = TimeVal::now();
        let mut state = self.lock();

        // If a callback re-entered the loop, finish the dispatches
        // already promised before starting over.
        if !state.pending.is_empty() {
            if dispatch {
                self.dispatch_pending(state, now);
            }
            return true;
        }

        // Prepare phase.
        let mut timeout: i32 = if block { -1 } else { 0 };
        let mut nready = 0usize;
        let mut current_priority = 0i32;

        let mut idx = 0;
        while idx < state.sources.len() {
            let node = state.sources.get(idx);
            if !node.is_valid() {
                idx += 1;
                continue;
            }
            if nready > 0 && node.priority > current_priority {
                break;
            }
            if node.is_blocked() {
                idx += 1;
                continue;
            }

            let priority = node.priority;
            let source = node.source.clone();
            let prep = source.prepare(now);

            if prep.ready {
                if !dispatch {
                    return true;
                }
                state.sources.get_mut(idx).flags.insert(SourceFlags::READY);
                nready += 1;
                current_priority = priority;
                timeout = 0;
            }
            if let Some(source_timeout) = prep.timeout {
                if source_timeout >= 0 {
                    timeout = if timeout < 0 {
                        source_timeout
                    } else {
                        timeout.min(source_timeout)
                    };
                }
            }

            idx += 1;
        }

        // Poll phase.
        state = self.poll(state, timeout, nready > 0, current_priority);

        // Check phase.
        nready = 0;
        let mut idx = 0;
        while idx < state.sources.len() {
            let node = state.sources.get(idx);
            if !node.is_valid() {
                idx += 1;
                continue;
            }
            if nready > 0 && node.priority > current_priority {
                break;
            }
            if node.is_blocked() {
                idx += 1;
                continue;
            }

            let id = node.id;
            let priority = node.priority;
            let was_ready = node.flags.contains(SourceFlags::READY);
            let source = node.source.clone();

            if was_ready || source.check(now) {
                if !dispatch {
                    return true;
                }
                state.sources.get_mut(idx).flags.remove(SourceFlags::READY);
                state.pending.push_back(id);
                current_priority = priority;
                nready += 1;
            }

            idx += 1;
        }

        // Dispatch phase.
        if !state.pending.is_empty() {
            self.dispatch_pending(state, now);
            return true;
        }

        false
    }

    /// Dispatches the pending queue, releasing the lock around every
    /// callback.
    fn dispatch_pending<'a>(&'a self, mut state: MutexGuard<'a, Inner>, now: TimeVal) {
        loop {
            let id = match state.pending.pop_front() {
                Some(id) => id,
                None => break,
            };
            let idx = match state.sources.position_valid(id) {
                Some(idx) => idx,
                None => continue,
            };

            let (source, user_data) = {
                let node = state.sources.get_mut(idx);
                node.flags.insert(SourceFlags::IN_CALL);
                (node.source.clone(), node.user_data.clone())
            };

            drop(state);
            let keep = source.dispatch(now, user_data.as_ref());
            drop(source);
            drop(user_data);
            state = self.lock();

            let mut unlinked = None;
            let mut destroy = None;
            if let Some(idx) = state.sources.position_any(id) {
                let node = state.sources.get_mut(idx);
                node.flags.remove(SourceFlags::IN_CALL);
                if !keep || !node.is_valid() {
                    let mut node = state.sources.remove(idx);
                    destroy = node.user_destroy.take();
                    unlinked = Some(node);
                }
            }
            if destroy.is_some() || unlinked.is_some() {
                drop(state);
                drop(unlinked);
                if let Some(destroy) = destroy {
                    destroy();
                }
                state = self.lock();
            }
        }
    }

    /// The poll phase: builds the descriptor array admitted by the
    /// current priority ceiling, releases the lock around the backend
    /// call and handles the wake-up protocol.
    fn poll<'a>(
        &'a self,
        mut state: MutexGuard<'a, Inner>,
        timeout: i32,
        use_priority: bool,
        ceiling: i32,
    ) -> MutexGuard<'a, Inner> {
        if state.wake_pipe.is_none() {
            let (read_fd, write_fd) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)
                .unwrap_or_else(|e| panic!("cannot create main loop wake-up pipe: {}", e));
            state.wake_pipe = Some((read_fd, write_fd));
            let rec = Arc::new(PollFd::new(read_fd, EventMask::IN));
            Self::poll_add_unlocked(&mut state, 0, rec);
        }

        let mut records = Vec::with_capacity(state.poll_records.len());
        let mut entries = Vec::with_capacity(state.poll_records.len());
        for rec in &state.poll_records {
            if use_priority && rec.priority > ceiling {
                break;
            }
            records.push(rec.fd.clone());
            entries.push(PollEntry::new(rec.fd.fd(), rec.fd.events()));
        }

        let poll_fn = state.poll_fn;
        state.poll_waiting = true;
        drop(state);

        if let Err(e) = poll_fn(&mut entries, timeout) {
            // An interrupted poll is not an error of the iteration; the
            // check phase decides what is actually ready.
            log::warn!("[mainloop] poll backend failed: {}", e);
        }

        let mut state = self.lock();

        if !state.poll_waiting {
            // Another thread woke us up; consume its byte.
            if let Some((read_fd, _)) = state.wake_pipe {
                let mut buf = [0u8; 1];
                match unistd::read(read_fd, &mut buf) {
                    Ok(_) | Err(Errno::EAGAIN) => {}
                    Err(e) => {
                        log::warn!("[mainloop] Failed to drain the wake-up pipe: {:?}", e);
                    }
                }
            }
        } else {
            state.poll_waiting = false;
        }

        for (rec, entry) in records.iter().zip(&entries) {
            rec.set_revents(entry.revents);
        }

        state
    }
}

/// A handle driving a [`Context`] until told to quit.
///
/// The handle is cloneable; [`quit`](MainLoop::quit) can be called from
/// a source callback or from another thread, and is observed between
/// iterations. Sources outlive the handle: dropping a `MainLoop` leaves
/// the context and everything registered on it intact.
#[derive(Clone)]
pub struct MainLoop {
    context: Context,
    quit: Arc<AtomicBool>,
}

impl std::fmt::Debug for MainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MainLoop { ... }")
    }
}

impl MainLoop {
    /// Creates a loop handle over the given context.
    pub fn new(context: &Context) -> MainLoop {
        MainLoop {
            context: context.clone(),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The context this loop drives.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Repeats blocking iterations until [`quit`](MainLoop::quit) is
    /// called.
    pub fn run(&self) {
        self.quit.store(false, Ordering::Release);
        while !self.quit.load(Ordering::Acquire) {
            self.context.iteration(true);
        }
    }

    /// Asks a running [`run`](MainLoop::run) to return. Observed once
    /// the current iteration completes.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
    }
}
