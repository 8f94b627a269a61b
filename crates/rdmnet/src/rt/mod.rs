// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded reactor the control plane runs on.
//!
//! Wraps `mio::Poll` with the three facilities every component needs:
//!
//! - **Readiness**: register descriptors with caller-allocated tokens and
//!   receive [`ReactorEvent::Readable`]/[`ReactorEvent::Writable`] events.
//!   Notification is edge-level; consumers re-check with `WouldBlock`
//!   handling and must tolerate spurious wake-ups.
//! - **Timers**: one-shot and repeating, with idempotent cancellation.
//! - **Cross-thread tasks**: [`ReactorHandle::execute`] queues a closure
//!   for the reactor thread and wakes the poll; it fails closed once the
//!   reactor is shutting down.
//!
//! The reactor does not dispatch to callbacks itself: the owning node loop
//! drains events and routes them by token, which keeps all component state
//! on one thread with no shared mutability.
//!
//! ```text
//! +------------------------------------------------------------+
//! |                        Reactor                             |
//! |  +------------------------------------------------------+  |
//! |  |                    mio::Poll                         |  |
//! |  |  - TCP listener / streams (readiness by Token)       |  |
//! |  |  - Waker (cross-thread task submission)              |  |
//! |  +------------------------------------------------------+  |
//! |  +----------------+  +--------------------------------+    |
//! |  |  Timer heap    |  |  Task queue (mpsc + waker)     |    |
//! |  +----------------+  +--------------------------------+    |
//! |                          |                                 |
//! |                          v                                 |
//! |        ReactorEvent -> owning node loop (dispatch)         |
//! +------------------------------------------------------------+
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};

/// Token reserved for the waker.
const WAKER_TOKEN: Token = Token(0);

/// First token handed out to components.
const FIRST_TOKEN: usize = 1;

/// Maximum events to process per poll.
const MAX_EVENTS: usize = 128;

/// A task queued from another thread for execution on the reactor thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// Timers
// ============================================================================

/// Handle to a scheduled timer. Cancellation is idempotent.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
struct TimerEntry {
    /// `Some` for repeating timers.
    period: Option<Duration>,
}

#[derive(Default)]
struct Timers {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl Timers {
    fn schedule(&mut self, delay: Duration, period: Option<Duration>) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, TimerEntry { period });
        self.heap.push(Reverse((Instant::now() + delay, id)));
        TimerId(id)
    }

    fn cancel(&mut self, id: TimerId) {
        // The heap entry is discarded lazily when it surfaces.
        self.entries.remove(&id.0);
    }

    /// Earliest live deadline, pruning cancelled heads.
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.entries.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pop every timer due at `now`, rescheduling repeating ones.
    fn expire(&mut self, now: Instant, out: &mut Vec<ReactorEvent>) {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            match self.entries.get(&id) {
                None => continue, // cancelled
                Some(entry) => {
                    if let Some(period) = entry.period {
                        self.heap.push(Reverse((now + period, id)));
                    } else {
                        self.entries.remove(&id);
                    }
                    out.push(ReactorEvent::Timer(TimerId(id)));
                }
            }
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// What the poll loop observed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReactorEvent {
    /// The descriptor registered under this token is readable.
    Readable(Token),

    /// The descriptor registered under this token is writable.
    Writable(Token),

    /// A timer fired.
    Timer(TimerId),
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap, `Send` handle for waking and feeding the reactor from other
/// threads.
pub struct ReactorHandle {
    task_tx: Sender<Task>,
    waker: Arc<Waker>,
    running: Arc<AtomicBool>,
}

impl Clone for ReactorHandle {
    fn clone(&self) -> Self {
        Self {
            task_tx: self.task_tx.clone(),
            waker: Arc::clone(&self.waker),
            running: Arc::clone(&self.running),
        }
    }
}

impl ReactorHandle {
    /// Queue a task for execution on the reactor thread.
    ///
    /// Returns `false` (and drops the task) once the reactor is shutting
    /// down.
    pub fn execute(&self, task: Task) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        if self.task_tx.send(task).is_err() {
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    /// Nudge the poll loop without queueing work.
    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Request shutdown: `running()` turns false and the poll loop wakes.
    pub fn terminate(&self) {
        self.running.store(false, Ordering::Release);
        let _ = self.waker.wake();
    }
}

// ============================================================================
// Reactor
// ============================================================================

/// The reactor. One per process thread; all component state lives on the
/// thread that polls it.
pub struct Reactor {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    running: Arc<AtomicBool>,
    timers: Timers,
    next_token: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (task_tx, task_rx) = channel();
        Ok(Self {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            waker,
            task_tx,
            task_rx,
            running: Arc::new(AtomicBool::new(true)),
            timers: Timers::default(),
            next_token: FIRST_TOKEN,
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            task_tx: self.task_tx.clone(),
            waker: Arc::clone(&self.waker),
            running: Arc::clone(&self.running),
        }
    }

    /// Allocate a fresh token. Tokens are never reused.
    pub fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn register<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().register(source, token, interests)
    }

    pub fn reregister<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.poll.registry().reregister(source, token, interests)
    }

    pub fn deregister<S: Source + ?Sized>(&mut self, source: &mut S) -> io::Result<()> {
        self.poll.registry().deregister(source)
    }

    pub fn schedule_once(&mut self, delay: Duration) -> TimerId {
        self.timers.schedule(delay, None)
    }

    pub fn schedule_repeating(&mut self, period: Duration) -> TimerId {
        self.timers.schedule(period, Some(period))
    }

    /// Cancel a timer. Safe to call twice or after the timer fired.
    pub fn cancel_timer(&mut self, id: TimerId) {
        self.timers.cancel(id);
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Request shutdown from the reactor thread itself.
    pub fn terminate(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait for readiness, timers or tasks, then fill `out`.
    ///
    /// Queued cross-thread tasks are run inside this call, before events
    /// are reported. `max_wait` caps the sleep even when no timer is due.
    pub fn poll(
        &mut self,
        out: &mut Vec<ReactorEvent>,
        max_wait: Option<Duration>,
    ) -> io::Result<()> {
        let now = Instant::now();
        let timer_wait = self
            .timers
            .next_deadline()
            .map(|deadline| deadline.saturating_duration_since(now));
        let timeout = match (timer_wait, max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            if event.is_readable() {
                out.push(ReactorEvent::Readable(event.token()));
            }
            if event.is_writable() {
                out.push(ReactorEvent::Writable(event.token()));
            }
        }

        while let Ok(task) = self.task_rx.try_recv() {
            task();
        }

        self.timers.expire(Instant::now(), out);
        Ok(())
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

// ============================================================================
// Tests
// ============================================================================
