//! The polling system.
//!
//! A poll backend is a plain function over an array of [`PollEntry`]
//! values and a millisecond timeout, mirroring `poll(2)`. The default
//! backend wraps the OS `poll`; [`select_fds`] is an alternative built on
//! `select(2)` that translates between the two event-mask vocabularies,
//! for the platforms (or test setups) where `poll` is not usable. A
//! backend can be installed per context with
//! [`Context::set_poll_function`](crate::Context::set_poll_function).

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU16, Ordering};

use bitflags::bitflags;
use nix::poll::PollFlags;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal as SysTimeVal, TimeValLike};

bitflags! {
    /// Condition bits for a polled descriptor.
    ///
    /// `IN`, `OUT` and `PRI` can be requested; `ERR`, `HUP` and `NVAL`
    /// only ever appear in result masks.
    pub struct EventMask: u16 {
        /// The descriptor is readable.
        const IN = 0x01;
        /// The descriptor has urgent (priority) data to read.
        const PRI = 0x02;
        /// The descriptor is writable.
        const OUT = 0x04;
        /// The descriptor is in an error state.
        const ERR = 0x08;
        /// The peer hung up.
        const HUP = 0x10;
        /// The descriptor is not open.
        const NVAL = 0x20;
    }
}

/// A descriptor registered for readiness polling.
///
/// The structure is shared between the caller and the poll-record
/// registry: register it with [`Context::poll_add`](crate::Context::poll_add)
/// and keep a clone of the `Arc` to read the result mask from your
/// source's `check`. The masks are atomic cells so both sides can touch
/// them without holding the loop lock.
#[derive(Debug)]
pub struct PollFd {
    fd: RawFd,
    events: AtomicU16,
    revents: AtomicU16,
}

impl PollFd {
    /// Wraps a raw descriptor with the set of conditions to wait for.
    pub fn new(fd: RawFd, events: EventMask) -> PollFd {
        PollFd {
            fd,
            events: AtomicU16::new(events.bits()),
            revents: AtomicU16::new(0),
        }
    }

    /// The underlying descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The requested event mask.
    pub fn events(&self) -> EventMask {
        EventMask::from_bits_truncate(self.events.load(Ordering::Relaxed))
    }

    /// Replaces the requested event mask, effective at the next poll.
    pub fn set_events(&self, events: EventMask) {
        self.events.store(events.bits(), Ordering::Relaxed);
    }

    /// The result mask from the most recent poll that included this
    /// descriptor.
    pub fn revents(&self) -> EventMask {
        EventMask::from_bits_truncate(self.revents.load(Ordering::Relaxed))
    }

    pub(crate) fn set_revents(&self, revents: EventMask) {
        self.revents.store(revents.bits(), Ordering::Relaxed);
    }
}

/// One element of the array handed to a poll backend.
///
/// Entries with a negative `fd` are ignored by the backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEntry {
    /// The descriptor to poll.
    pub fd: RawFd,
    /// The conditions to wait for.
    pub events: EventMask,
    /// The conditions found; written by the backend.
    pub revents: EventMask,
}

impl PollEntry {
    /// A new entry with an empty result mask.
    pub fn new(fd: RawFd, events: EventMask) -> PollEntry {
        PollEntry {
            fd,
            events,
            revents: EventMask::empty(),
        }
    }
}

/// A readiness backend.
///
/// Waits up to `timeout` milliseconds (`-1` waits without bound, `0`
/// returns immediately) for any entry to match its requested mask,
/// writes the result masks, and returns how many entries are ready.
pub type PollFn = fn(&mut [PollEntry], i32) -> crate::Result<usize>;

fn to_poll_flags(mask: EventMask) -> PollFlags {
    let mut flags = PollFlags::empty();
    if mask.contains(EventMask::IN) {
        flags |= PollFlags::POLLIN;
    }
    if mask.contains(EventMask::PRI) {
        flags |= PollFlags::POLLPRI;
    }
    if mask.contains(EventMask::OUT) {
        flags |= PollFlags::POLLOUT;
    }
    flags
}

fn from_poll_flags(flags: PollFlags) -> EventMask {
    let mut mask = EventMask::empty();
    if flags.contains(PollFlags::POLLIN) {
        mask |= EventMask::IN;
    }
    if flags.contains(PollFlags::POLLPRI) {
        mask |= EventMask::PRI;
    }
    if flags.contains(PollFlags::POLLOUT) {
        mask |= EventMask::OUT;
    }
    if flags.contains(PollFlags::POLLERR) {
        mask |= EventMask::ERR;
    }
    if flags.contains(PollFlags::POLLHUP) {
        mask |= EventMask::HUP;
    }
    if flags.contains(PollFlags::POLLNVAL) {
        mask |= EventMask::NVAL;
    }
    mask
}

/// The default poll backend, built on `poll(2)`.
pub fn poll_fds(entries: &mut [PollEntry], timeout: i32) -> crate::Result<usize> {
    let mut fds: Vec<nix::poll::PollFd> = entries
        .iter()
        .map(|entry| nix::poll::PollFd::new(entry.fd, to_poll_flags(entry.events)))
        .collect();

    let ready = nix::poll::poll(&mut fds, timeout)?;

    for (entry, fd) in entries.iter_mut().zip(&fds) {
        entry.revents = from_poll_flags(fd.revents().unwrap_or_else(PollFlags::empty));
    }

    Ok(ready.max(0) as usize)
}

/// A poll backend built on `select(2)`.
///
/// Translates the requested masks into the three `select` sets
/// (readable, writable, exceptional) and back. `ERR`, `HUP` and `NVAL`
/// cannot be distinguished by `select` and are never reported.
pub fn select_fds(entries: &mut [PollEntry], timeout: i32) -> crate::Result<usize> {
    let mut rset = FdSet::new();
    let mut wset = FdSet::new();
    let mut xset = FdSet::new();

    for entry in entries.iter() {
        if entry.fd < 0 {
            continue;
        }
        if entry.events.contains(EventMask::IN) {
            rset.insert(entry.fd);
        }
        if entry.events.contains(EventMask::OUT) {
            wset.insert(entry.fd);
        }
        if entry.events.contains(EventMask::PRI) {
            xset.insert(entry.fd);
        }
    }

    let ready = if timeout < 0 {
        select(None, &mut rset, &mut wset, &mut xset, None)?
    } else {
        let mut tv = SysTimeVal::milliseconds(i64::from(timeout));
        select(None, &mut rset, &mut wset, &mut xset, &mut tv)?
    };

    for entry in entries.iter_mut() {
        entry.revents = EventMask::empty();
        if ready <= 0 || entry.fd < 0 {
            continue;
        }
        if rset.contains(entry.fd) {
            entry.revents |= EventMask::IN;
        }
        if wset.contains(entry.fd) {
            entry.revents |= EventMask::OUT;
        }
        if xset.contains(entry.fd) {
            entry.revents |= EventMask::PRI;
        }
    }

    Ok(ready.max(0) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    use nix::fcntl::OFlag;
    use nix::unistd;

    fn pipe_entries() -> ((RawFd, RawFd), Vec<PollEntry>) {
        let (read_fd, write_fd) = unistd::pipe2(OFlag::O_CLOEXEC).unwrap();
        let entries = vec![PollEntry::new(read_fd, EventMask::IN)];
        ((read_fd, write_fd), entries)
    }

    #[test]
    fn poll_backend_reports_readable_pipe() {
        let ((read_fd, write_fd), mut entries) = pipe_entries();

        // Nothing written yet: a non-blocking poll finds nothing.
        let n = poll_fds(&mut entries, 0).unwrap();
        assert_eq!(n, 0);
        assert!(entries[0].revents.is_empty());

        unistd::write(write_fd, b"x").unwrap();
        let n = poll_fds(&mut entries, 1000).unwrap();
        assert_eq!(n, 1);
        assert!(entries[0].revents.contains(EventMask::IN));

        unistd::close(read_fd).unwrap();
        unistd::close(write_fd).unwrap();
    }

    #[test]
    fn select_backend_matches_poll_vocabulary() {
        let ((read_fd, write_fd), mut entries) = pipe_entries();
        entries.push(PollEntry::new(write_fd, EventMask::OUT));

        let n = select_fds(&mut entries, 0).unwrap();
        // The write end of a fresh pipe is writable; the read end is not
        // yet readable.
        assert_eq!(n, 1);
        assert!(entries[0].revents.is_empty());
        assert!(entries[1].revents.contains(EventMask::OUT));

        unistd::write(write_fd, b"x").unwrap();
        select_fds(&mut entries, 1000).unwrap();
        assert!(entries[0].revents.contains(EventMask::IN));

        unistd::close(read_fd).unwrap();
        unistd::close(write_fd).unwrap();
    }

    #[test]
    fn pollfd_masks_are_shared_cells() {
        let fd = PollFd::new(3, EventMask::IN | EventMask::PRI);
        assert_eq!(fd.fd(), 3);
        assert_eq!(fd.events(), EventMask::IN | EventMask::PRI);

        fd.set_events(EventMask::OUT);
        assert_eq!(fd.events(), EventMask::OUT);

        fd.set_revents(EventMask::OUT | EventMask::HUP);
        assert_eq!(fd.revents(), EventMask::OUT | EventMask::HUP);
    }

    #[test]
    fn hangup_is_reported_by_the_default_backend() {
        let ((read_fd, write_fd), mut entries) = pipe_entries();
        unistd::close(write_fd).unwrap();

        poll_fds(&mut entries, 0).unwrap();
        assert!(entries[0].revents.contains(EventMask::HUP));

        unistd::close(read_fd).unwrap();
    }
}
