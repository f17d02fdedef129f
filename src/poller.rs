//! Readiness multiplexer shared by the agent and the collector.
//!
//! A [`Multiplexer`] owns the registered states, not just their tokens: a
//! socket lives inside the state its owner registers and comes back out of
//! [`Multiplexer::unregister`]. Dropping the returned state closes the socket,
//! so a connection can never outlive its registration.
//!
//! Timers share the same wait: [`Multiplexer::schedule`] arms a one-shot entry
//! that [`Multiplexer::wait`] reports as [`Event::Timer`] once it is due.

use crate::error::{Result, TransportError};
use mio::{Events, Poll, Token, Waker, event::Source};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

/// Reserved for the cancellation waker.
const WAKE_TOKEN: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 256;

/// Stand-in deadline for delays too long to represent as an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Readiness an owner asks to be notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    Both,
}

impl From<Interest> for mio::Interest {
    fn from(interest: Interest) -> Self {
        match interest {
            Interest::Readable => Self::READABLE,
            Interest::Writable => Self::WRITABLE,
            Interest::Both => Self::READABLE | Self::WRITABLE,
        }
    }
}

/// Readiness reported for one socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub write_closed: bool,
    pub error: bool,
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            write_closed: event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Io { token: Token, readiness: Readiness },
    Timer { token: Token },
}

/// State that carries a socket the multiplexer can watch.
pub trait Pollable {
    fn source(&mut self) -> &mut dyn Source;
}

/// Cloneable handle that makes a blocked [`Multiplexer::wait`] return
/// [`TransportError::Cancelled`]. Safe to call from a signal handler thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // A failed wake only delays shutdown until the next event or timeout.
        let _ = self.waker.wake();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct Registration<T> {
    interest: Interest,
    state: T,
}

pub struct Multiplexer<T> {
    poll: Poll,
    events: Events,
    entries: HashMap<Token, Registration<T>>,
    timers: BinaryHeap<Reverse<(Instant, u64, Token)>>,
    timer_ids: HashMap<Token, u64>,
    next_timer_id: u64,
    cancel: CancelHandle,
}

impl<T: Pollable> Multiplexer<T> {
    /// Creates a multiplexer backed by the OS readiness facility.
    ///
    /// # Errors
    /// Fails if the OS refuses to create the poll instance or waker.
    pub fn new() -> Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            entries: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_ids: HashMap::new(),
            next_timer_id: 0,
            cancel: CancelHandle {
                cancelled: Arc::new(AtomicBool::new(false)),
                waker: Arc::new(waker),
            },
        })
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Starts watching `state`'s socket under `token`.
    ///
    /// # Errors
    /// [`TransportError::DuplicateRegistration`] if the token or the socket is
    /// already registered; on failure the state is dropped.
    pub fn register(&mut self, token: Token, mut state: T, interest: Interest) -> Result<()> {
        if token == WAKE_TOKEN || self.entries.contains_key(&token) {
            return Err(TransportError::DuplicateRegistration(token));
        }
        self.poll
            .registry()
            .register(state.source(), token, interest.into())
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => TransportError::DuplicateRegistration(token),
                _ => TransportError::Io(e),
            })?;
        self.entries.insert(token, Registration { interest, state });
        Ok(())
    }

    /// Changes the interest of an existing registration.
    ///
    /// # Errors
    /// [`TransportError::NotRegistered`] for an unknown token, or the OS error.
    pub fn update(&mut self, token: Token, interest: Interest) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&token)
            .ok_or(TransportError::NotRegistered(token))?;
        if entry.interest != interest {
            self.poll
                .registry()
                .reregister(entry.state.source(), token, interest.into())?;
            entry.interest = interest;
        }
        Ok(())
    }

    /// Stops watching `token` and hands its state back to the owner.
    pub fn unregister(&mut self, token: Token) -> Option<T> {
        let mut entry = self.entries.remove(&token)?;
        // The socket is about to be closed by the owner; the kernel drops the
        // registration along with it even if this fails.
        let _ = self.poll.registry().deregister(entry.state.source());
        Some(entry.state)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut T> {
        self.entries.get_mut(&token).map(|entry| &mut entry.state)
    }

    pub fn interest(&self, token: Token) -> Option<Interest> {
        self.entries.get(&token).map(|entry| entry.interest)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.entries.keys().copied().collect()
    }

    /// Arms a one-shot timer for `token`, replacing any pending one.
    pub fn schedule(&mut self, token: Token, after: Duration) {
        let now = Instant::now();
        let deadline = now
            .checked_add(after)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timer_ids.insert(token, id);
        self.timers.push(Reverse((deadline, id, token)));
    }

    pub fn cancel_timer(&mut self, token: Token) -> bool {
        self.timer_ids.remove(&token).is_some()
    }

    pub fn pending_timers(&self) -> usize {
        self.timer_ids.len()
    }

    /// Blocks until a socket is ready, a timer is due, or `timeout` elapses.
    ///
    /// With `timeout == None` it waits for the next event or timer with no
    /// upper bound. An empty vector means the timeout elapsed.
    ///
    /// # Errors
    /// [`TransportError::Cancelled`] once the cancel handle fired, or the OS
    /// error from the poll call.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Vec<Event>> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let now = Instant::now();
        let poll_timeout = match (timeout, self.next_deadline()) {
            (Some(t), Some(deadline)) => Some(t.min(deadline.saturating_duration_since(now))),
            (None, Some(deadline)) => Some(deadline.saturating_duration_since(now)),
            (t, None) => t,
        };

        if let Err(e) = self.poll.poll(&mut self.events, poll_timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let mut ready: Vec<Event> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKE_TOKEN)
            .map(|event| Event::Io {
                token: event.token(),
                readiness: event.into(),
            })
            .collect();
        self.expire_timers(Instant::now(), &mut ready);
        Ok(ready)
    }

    /// Unregisters every entry and drops all timers, returning the states.
    pub fn drain(&mut self) -> Vec<(Token, T)> {
        self.timers.clear();
        self.timer_ids.clear();
        self.tokens()
            .into_iter()
            .filter_map(|token| self.unregister(token).map(|state| (token, state)))
            .collect()
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id, token))) = self.timers.peek().copied() {
            if self.timer_ids.get(&token) == Some(&id) {
                return Some(deadline);
            }
            self.timers.pop();
        }
        None
    }

    fn expire_timers(&mut self, now: Instant, ready: &mut Vec<Event>) {
        while let Some(Reverse((deadline, id, token))) = self.timers.peek().copied() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if self.timer_ids.get(&token) == Some(&id) {
                self.timer_ids.remove(&token);
                ready.push(Event::Timer { token });
            }
        }
    }
}
