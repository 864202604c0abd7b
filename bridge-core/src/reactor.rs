//! The event reactor: a single-threaded table of heterogeneous event
//! sources multiplexed through one `mio::Poll`. Grounded on
//! `daemonlib/event.c`; the mio registration idiom is grounded on
//! `neutronium::net::endpoint::Endpoint`.
//!
//! Sources may be added, modified or removed from within a callback that
//! is itself running as part of dispatch. Removal is deferred: a removed
//! source is only dropped from the table at the end of the current
//! iteration's `cleanup_sources` pass, so the iterator over sources never
//! has to reason about entries disappearing under it.

use mio::unix::UnixReady;
use mio::{Evented, Events, Poll, PollOpt, Ready, Token};
use slog::Logger;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use support::logging;

bitflags::bitflags! {
    /// Mirrors `daemonlib/event.h`'s `Event` bitmask: readable, writable,
    /// out-of-band/priority and error readiness.
    pub struct Interest: u8 {
        const READ  = 0b0001;
        const WRITE = 0b0010;
        const PRIO  = 0b0100;
        const ERROR = 0b1000;
    }
}

impl Interest {
    fn to_ready(self) -> Ready {
        let mut ready = Ready::empty();
        if self.contains(Interest::READ) {
            ready |= Ready::readable();
        }
        if self.contains(Interest::WRITE) {
            ready |= Ready::writable();
        }
        if self.contains(Interest::ERROR) {
            ready |= Ready::from(UnixReady::error());
        }
        if self.contains(Interest::PRIO) {
            ready |= Ready::from(UnixReady::priority());
        }
        ready
    }

    fn from_ready(ready: Ready) -> Interest {
        let unix_ready = UnixReady::from(ready);
        let mut interest = Interest::empty();
        if ready.is_readable() {
            interest |= Interest::READ;
        }
        if ready.is_writable() {
            interest |= Interest::WRITE;
        }
        if unix_ready.is_error() {
            interest |= Interest::ERROR;
        }
        if unix_ready.is_priority() {
            interest |= Interest::PRIO;
        }
        interest
    }
}

/// Distinguishes USB sources from everything else purely so the reactor
/// can log/trace them separately, as spec.md §4.7.1 asks for.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SourceType {
    Generic,
    Usb,
}

impl SourceType {
    fn name(self) -> &'static str {
        match self {
            SourceType::Generic => "generic",
            SourceType::Usb => "USB",
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SourceState {
    Normal,
    Added,
    Removed,
    Readded,
    Modified,
}

/// Callback invoked for a ready event-bit on a source. Receives no
/// arguments beyond what the closure captured — mirrors the C
/// `EventFunction(void *opaque)` shape via closure capture instead of an
/// explicit opaque pointer.
/// Callbacks receive `&mut Reactor` so they can add/modify/remove
/// sources (including themselves) mid-dispatch. The reactor extracts the
/// callback out of its source table before invoking it and reinserts it
/// afterwards, so this never aliases the table it is itself stored in.
pub type Callback = Box<dyn FnMut(&mut Reactor) + 'static>;

struct Source {
    fd: RawFd,
    kind: SourceType,
    name: String,
    events: Interest,
    state: SourceState,
    read: Option<Callback>,
    write: Option<Callback>,
    prio: Option<Callback>,
    error: Option<Callback>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
struct Key(RawFd, SourceType);

/// Thin wrapper so a bare `RawFd` can be registered with `mio::Poll`
/// without owning the underlying descriptor (ownership stays with the
/// caller's I/O object).
struct RawFdSource(RawFd);

impl Evented for RawFdSource {
    fn register(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        mio::unix::EventedFd(&self.0).register(poll, token, interest, opts)
    }

    fn reregister(&self, poll: &Poll, token: Token, interest: Ready, opts: PollOpt) -> io::Result<()> {
        mio::unix::EventedFd(&self.0).reregister(poll, token, interest, opts)
    }

    fn deregister(&self, poll: &Poll) -> io::Result<()> {
        mio::unix::EventedFd(&self.0).deregister(poll)
    }
}

/// Returned to callers so they can mark the reactor to stop from any
/// thread by writing into the stop pipe, same as `event_stop`.
#[derive(Clone)]
pub struct StopHandle {
    write_fd: RawFd,
}

impl StopHandle {
    pub fn stop(&self) {
        let byte: u8 = 0;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

pub struct Reactor {
    log: Logger,
    poll: Poll,
    events: Events,
    sources: HashMap<Key, Source>,
    next_token: usize,
    token_map: HashMap<Token, Key>,
    running: bool,
    stop_requested: bool,
    stop_read_fd: RawFd,
    stop_write_fd: RawFd,
    stop_token: Token,
}

impl Reactor {
    pub fn new(log: Logger) -> io::Result<Reactor> {
        let poll = Poll::new()?;

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let (stop_read_fd, stop_write_fd) = (fds[0], fds[1]);

        unsafe {
            let flags = libc::fcntl(stop_read_fd, libc::F_GETFL, 0);
            libc::fcntl(stop_read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }

        let stop_token = Token(0);

        poll.register(
            &RawFdSource(stop_read_fd),
            stop_token,
            Ready::readable(),
            PollOpt::edge(),
        )?;

        logging::debug!(log, "event reactor initialized");

        Ok(Reactor {
            log,
            poll,
            events: Events::with_capacity(1024),
            sources: HashMap::new(),
            next_token: 1,
            token_map: HashMap::new(),
            running: false,
            stop_requested: false,
            stop_read_fd,
            stop_write_fd,
            stop_token,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            write_fd: self.stop_write_fd,
        }
    }

    /// Registers a new source. Returns an error if `(fd, type)` is
    /// already present and not marked removed — the one exception lets a
    /// callback destroy and immediately recreate a connection on the same
    /// fd safely.
    pub fn add_source(
        &mut self,
        fd: RawFd,
        kind: SourceType,
        name: impl Into<String>,
        events: Interest,
    ) -> io::Result<()> {
        let key = Key(fd, kind);
        let name = name.into();

        if let Some(existing) = self.sources.get_mut(&key) {
            if existing.state != SourceState::Removed {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} event source (fd {}) already added", kind.name(), fd),
                ));
            }

            existing.name = name;
            existing.events = events;
            existing.state = SourceState::Readded;

            self.poll
                .reregister(&RawFdSource(fd), self.token_for(&key), events.to_ready(), PollOpt::edge())?;

            logging::debug!(self.log, "readded event source"; "type" => kind.name(), "fd" => fd);

            return Ok(());
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        self.poll
            .register(&RawFdSource(fd), token, events.to_ready(), PollOpt::edge())?;

        self.sources.insert(
            key,
            Source {
                fd,
                kind,
                name,
                events,
                state: SourceState::Added,
                read: None,
                write: None,
                prio: None,
                error: None,
            },
        );
        self.token_map.insert(token, key);

        logging::debug!(self.log, "added event source"; "type" => kind.name(), "fd" => fd);

        Ok(())
    }

    /// Sets `read` to fire on `READ` and `write` to fire on `WRITE`.
    /// Convenience used by most callers (clients, channels) which always
    /// want distinct read-ready / write-ready behavior.
    pub fn set_read_callback(&mut self, fd: RawFd, kind: SourceType, callback: impl FnMut(&mut Reactor) + 'static) {
        if let Some(source) = self.sources.get_mut(&Key(fd, kind)) {
            source.read = Some(Box::new(callback));
        }
    }

    pub fn set_write_callback(&mut self, fd: RawFd, kind: SourceType, callback: impl FnMut(&mut Reactor) + 'static) {
        if let Some(source) = self.sources.get_mut(&Key(fd, kind)) {
            source.write = Some(Box::new(callback));
        }
    }

    pub fn set_error_callback(&mut self, fd: RawFd, kind: SourceType, callback: impl FnMut(&mut Reactor) + 'static) {
        if let Some(source) = self.sources.get_mut(&Key(fd, kind)) {
            source.error = Some(Box::new(callback));
        }
    }

    /// Atomically updates a source's subscribed events.
    pub fn modify_source(
        &mut self,
        fd: RawFd,
        kind: SourceType,
        events_to_remove: Interest,
        events_to_add: Interest,
    ) -> io::Result<()> {
        let key = Key(fd, kind);
        let token = self.token_for(&key);

        let source = match self.sources.get_mut(&key) {
            Some(source) if source.state != SourceState::Removed => source,
            _ => {
                logging::warn!(self.log, "cannot modify unknown or removed event source"; "type" => kind.name(), "fd" => fd);
                return Err(io::Error::new(io::ErrorKind::NotFound, "unknown event source"));
            }
        };

        source.events = (source.events & !events_to_remove) | events_to_add;

        if events_to_remove.contains(Interest::READ) {
            source.read = None;
        }
        if events_to_remove.contains(Interest::WRITE) {
            source.write = None;
        }
        if events_to_remove.contains(Interest::PRIO) {
            source.prio = None;
        }
        if events_to_remove.contains(Interest::ERROR) {
            source.error = None;
        }

        source.state = SourceState::Modified;

        self.poll
            .reregister(&RawFdSource(fd), token, source.events.to_ready(), PollOpt::edge())
    }

    /// Marks a source removed. The actual removal happens at the end of
    /// the current dispatch pass (`cleanup_sources`), so a callback that
    /// removes another still-to-be-visited source, or even itself, is
    /// safe.
    pub fn remove_source(&mut self, fd: RawFd, kind: SourceType) {
        let key = Key(fd, kind);

        match self.sources.get_mut(&key) {
            Some(source) if source.state != SourceState::Removed => {
                source.state = SourceState::Removed;
                let _ = self.poll.deregister(&RawFdSource(fd));

                logging::debug!(self.log, "marked event source removed"; "type" => kind.name(), "fd" => fd);
            }
            Some(_) => {
                logging::warn!(self.log, "event source already marked removed"; "type" => kind.name(), "fd" => fd);
            }
            None => {
                logging::warn!(self.log, "cannot remove unknown event source"; "type" => kind.name(), "fd" => fd);
            }
        }
    }

    fn token_for(&self, key: &Key) -> Token {
        self.token_map
            .iter()
            .find(|(_, k)| *k == key)
            .map(|(t, _)| *t)
            .expect("source must have a token")
    }

    /// Drops sources marked `Removed`; transitions `Added`/`Readded`/
    /// `Modified` back to `Normal`.
    pub fn cleanup_sources(&mut self) {
        self.sources.retain(|key, source| {
            if source.state == SourceState::Removed {
                self.token_map.retain(|_, k| k != key);
                false
            } else {
                source.state = SourceState::Normal;
                true
            }
        });
    }

    /// Runs the reactor until `stop` is called. `cleanup` is invoked once
    /// per iteration, before compacting removed sources, exactly like
    /// `event_run`'s `EventCleanupFunction`.
    pub fn run(&mut self, mut cleanup: impl FnMut(&mut Reactor)) -> io::Result<()> {
        if self.running {
            logging::warn!(self.log, "event loop already running");
            return Ok(());
        }

        if self.stop_requested {
            return Ok(());
        }

        self.running = true;
        logging::debug!(self.log, "starting event loop");

        while self.running {
            match self.poll.poll(&mut self.events, None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    logging::error!(self.log, "poll failed"; "error" => %err);
                    self.running = false;
                    return Err(err);
                }
            }

            let ready: Vec<(Token, Ready)> = self.events.iter().map(|e| (e.token(), e.readiness())).collect();

            for (token, readiness) in ready {
                if token == self.stop_token {
                    self.drain_stop_pipe();
                    self.running = false;
                    continue;
                }

                let key = match self.token_map.get(&token) {
                    Some(key) => *key,
                    None => continue,
                };

                self.dispatch_one(key, readiness);
            }

            cleanup(self);
            self.cleanup_sources();
        }

        logging::debug!(self.log, "event loop stopped");
        Ok(())
    }

    fn drain_stop_pipe(&mut self) {
        let mut byte = [0u8; 1];
        unsafe {
            while libc::read(self.stop_read_fd, byte.as_mut_ptr() as *mut libc::c_void, 1) > 0 {}
        }
    }

    /// Invokes at most one callback per (source, event-bit), in READ,
    /// WRITE, PRIO, ERROR order, skipping later bits if a callback
    /// removed the source in the meantime. Matches `event_handle_source`.
    ///
    /// Each callback is removed from its source before being invoked and
    /// put back afterwards (unless the callback itself replaced or
    /// cleared it) — calling it with `&mut Reactor` while it is still
    /// sitting inside `self.sources` would alias `self`.
    fn dispatch_one(&mut self, key: Key, readiness: Ready) {
        let received = Interest::from_ready(readiness);

        macro_rules! still_normal {
            () => {
                matches!(self.sources.get(&key).map(|s| s.state), Some(SourceState::Normal))
            };
        }

        macro_rules! fire {
            ($field:ident) => {
                let taken = self.sources.get_mut(&key).and_then(|source| source.$field.take());

                if let Some(mut cb) = taken {
                    cb(self);

                    if let Some(source) = self.sources.get_mut(&key) {
                        if source.$field.is_none() {
                            source.$field = Some(cb);
                        }
                    }
                }
            };
        }

        if !still_normal!() {
            return;
        }

        if received.contains(Interest::READ) {
            fire!(read);
        }

        if received.contains(Interest::WRITE) && still_normal!() {
            fire!(write);
        }

        if received.contains(Interest::PRIO) && still_normal!() {
            fire!(prio);
        }

        if received.contains(Interest::ERROR) && still_normal!() {
            fire!(error);
        }
    }
}

/// `Duration` used by callers that need to size a one-shot timer against
/// the reactor (e.g. the RS-485 master's per-frame timeout); kept here so
/// every crate derives timeouts the same way.
pub fn duration_from_micros(micros: u64) -> Duration {
    Duration::from_micros(micros)
}
