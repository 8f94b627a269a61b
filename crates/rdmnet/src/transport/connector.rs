// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outbound TCP connect attempts with per-endpoint backoff.
//!
//! # State Machine (per endpoint)
//!
//! ```text
//!      +----------+
//!      |   Idle   |
//!      +----+-----+
//!           | add_endpoint() / disconnect()
//!           v
//!      +----------+  success   +-----------+
//!      |Connecting|----------->| Suspended |--(disconnect)--+
//!      +----+-----+            +-----------+                |
//!           | failure/timeout                                |
//!           v                                                |
//!      +----------+  delay elapsed                           |
//!      | Backoff  |------------------> Connecting <----------+
//!      +----------+
//! ```
//!
//! Endpoints registered with [`TcpConnector::add_endpoint`] retry forever
//! under their backoff policy until removed. The lower-level one-shot
//! [`TcpConnector::connect`] / [`TcpConnector::cancel`] pair serves callers
//! that run their own retry logic.
//!
//! Connects are non-blocking: the socket is registered for writable
//! readiness and the attempt resolves when the readiness event arrives
//! (or the hard deadline expires, with timed-out semantics).

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::rt::{Reactor, TimerId};

/// Default hard deadline for one connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Backoff policies
// ============================================================================

/// Retry delay schedule for failed connect attempts.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Delay doubles each failure: `initial, 2i, 4i, ...` capped at `max`.
    Exponential { initial: Duration, max: Duration },

    /// Delay grows by a fixed step: `initial, initial+step, ...` capped at
    /// `max`.
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
}

impl BackoffPolicy {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        BackoffPolicy::Exponential { initial, max }
    }

    pub fn linear(initial: Duration, increment: Duration, max: Duration) -> Self {
        BackoffPolicy::Linear {
            initial,
            increment,
            max,
        }
    }

    /// Delay before the next attempt, given how many consecutive failures
    /// have occurred (>= 1).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        match *self {
            BackoffPolicy::Exponential { initial, max } => initial
                .saturating_mul(2u32.saturating_pow(exponent.min(31)))
                .min(max),
            BackoffPolicy::Linear {
                initial,
                increment,
                max,
            } => initial
                .saturating_add(increment.saturating_mul(exponent))
                .min(max),
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::exponential(Duration::from_secs(5), Duration::from_secs(30))
    }
}

// ============================================================================
// Attempts and results
// ============================================================================

/// Handle to a one-shot connect scheduled via [`TcpConnector::connect`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

/// How an attempt resolved.
#[derive(Debug)]
pub enum ConnectOutcome {
    /// The stream is connected and deregistered from the reactor; the
    /// caller owns it now.
    Connected(TcpStream),

    /// The attempt failed; for registered endpoints a backoff retry is
    /// already scheduled.
    Failed(io::Error),
}

/// A resolved connect attempt.
#[derive(Debug)]
pub struct ConnectResult {
    pub endpoint: SocketAddrV4,
    pub outcome: ConnectOutcome,

    /// `Some` when this was a one-shot [`TcpConnector::connect`] attempt.
    pub attempt: Option<AttemptId>,
}

#[derive(Debug)]
struct Attempt {
    endpoint: SocketAddrV4,
    stream: TcpStream,
    deadline: TimerId,
    oneshot: Option<AttemptId>,
}

#[derive(Debug)]
enum EndpointState {
    Connecting(Token),
    Backoff(TimerId),
    /// Connected and handed off; waiting for `disconnect` to re-arm.
    Suspended,
}

#[derive(Debug)]
struct Endpoint {
    policy: BackoffPolicy,
    failures: u32,
    state: EndpointState,
}

#[derive(Debug)]
enum TimerRole {
    Backoff(SocketAddrV4),
    Deadline(Token),
}

// ============================================================================
// Connector
// ============================================================================

#[derive(Debug)]
pub struct TcpConnector {
    connect_timeout: Duration,
    endpoints: HashMap<SocketAddrV4, Endpoint>,
    attempts: HashMap<Token, Attempt>,
    timers: HashMap<TimerId, TimerRole>,
    next_attempt_id: u64,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            endpoints: HashMap::new(),
            attempts: HashMap::new(),
            timers: HashMap::new(),
            next_attempt_id: 0,
        }
    }

    /// Number of endpoints under management.
    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }

    // ========================================================================
    // Endpoint registration
    // ========================================================================

    /// Start managing `endpoint`: connect now, retry per `policy` forever.
    pub fn add_endpoint(
        &mut self,
        endpoint: SocketAddrV4,
        policy: BackoffPolicy,
        reactor: &mut Reactor,
    ) {
        if self.endpoints.contains_key(&endpoint) {
            debug!("connector already tracks {}", endpoint);
            return;
        }
        self.endpoints.insert(
            endpoint,
            Endpoint {
                policy,
                failures: 0,
                state: EndpointState::Suspended,
            },
        );
        self.start_endpoint_attempt(endpoint, reactor);
    }

    /// Stop managing `endpoint`, cancelling any pending attempt or retry.
    ///
    /// If the endpoint is currently connected, the handed-off socket is the
    /// caller's to close.
    pub fn remove_endpoint(&mut self, endpoint: SocketAddrV4, reactor: &mut Reactor) {
        let Some(state) = self.endpoints.remove(&endpoint) else {
            return;
        };
        match state.state {
            EndpointState::Connecting(token) => {
                if let Some(attempt) = self.attempts.remove(&token) {
                    self.discard_attempt(attempt, reactor);
                }
            }
            EndpointState::Backoff(timer) => {
                reactor.cancel_timer(timer);
                self.timers.remove(&timer);
            }
            EndpointState::Suspended => {}
        }
    }

    /// Tell the connector an established connection to `endpoint` closed;
    /// the connect cycle restarts immediately.
    pub fn disconnect(&mut self, endpoint: SocketAddrV4, reactor: &mut Reactor) {
        let Some(state) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        if let EndpointState::Suspended = state.state {
            state.failures = 0;
            self.start_endpoint_attempt(endpoint, reactor);
        }
    }

    // ========================================================================
    // One-shot connects
    // ========================================================================

    /// Schedule a single connect attempt with its own deadline.
    pub fn connect(
        &mut self,
        endpoint: SocketAddrV4,
        timeout: Duration,
        reactor: &mut Reactor,
    ) -> io::Result<AttemptId> {
        let id = AttemptId(self.next_attempt_id);
        self.next_attempt_id += 1;
        self.start_attempt(endpoint, Some(id), timeout, reactor)?;
        Ok(id)
    }

    /// Cancel a one-shot attempt. Idempotent; returns whether anything was
    /// cancelled.
    pub fn cancel(&mut self, id: AttemptId, reactor: &mut Reactor) -> bool {
        let Some(token) = self
            .attempts
            .iter()
            .find(|(_, a)| a.oneshot == Some(id))
            .map(|(t, _)| *t)
        else {
            return false;
        };
        let attempt = self.attempts.remove(&token).expect("attempt looked up");
        self.discard_attempt(attempt, reactor);
        true
    }

    // ========================================================================
    // Event dispatch
    // ========================================================================

    pub fn owns_token(&self, token: Token) -> bool {
        self.attempts.contains_key(&token)
    }

    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.timers.contains_key(&id)
    }

    /// Drive a readiness event for a connecting socket.
    ///
    /// Spurious wake-ups before the handshake settles return `None`.
    pub fn handle_event(&mut self, token: Token, reactor: &mut Reactor) -> Option<ConnectResult> {
        let resolution: io::Result<()> = {
            let attempt = self.attempts.get_mut(&token)?;
            match attempt.stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match attempt.stream.peer_addr() {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => return None,
                    Err(e) => Err(e),
                },
            }
        };

        let mut attempt = self.attempts.remove(&token).expect("attempt looked up");
        reactor.cancel_timer(attempt.deadline);
        self.timers.remove(&attempt.deadline);
        let _ = reactor.deregister(&mut attempt.stream);

        match resolution {
            Ok(()) => {
                info!("TCP connection established to {}", attempt.endpoint);
                if let Some(state) = self.endpoints.get_mut(&attempt.endpoint) {
                    state.failures = 0;
                    state.state = EndpointState::Suspended;
                }
                Some(ConnectResult {
                    endpoint: attempt.endpoint,
                    outcome: ConnectOutcome::Connected(attempt.stream),
                    attempt: attempt.oneshot,
                })
            }
            Err(e) => Some(self.attempt_failed(attempt, e, reactor)),
        }
    }

    /// Drive a timer owned by the connector (backoff expiry or attempt
    /// deadline).
    pub fn handle_timer(&mut self, id: TimerId, reactor: &mut Reactor) -> Option<ConnectResult> {
        match self.timers.remove(&id)? {
            TimerRole::Backoff(endpoint) => {
                if matches!(
                    self.endpoints.get(&endpoint).map(|s| &s.state),
                    Some(EndpointState::Backoff(_))
                ) {
                    self.start_endpoint_attempt(endpoint, reactor);
                }
                None
            }
            TimerRole::Deadline(token) => {
                let mut attempt = self.attempts.remove(&token)?;
                let _ = reactor.deregister(&mut attempt.stream);
                let error = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                Some(self.attempt_failed(attempt, error, reactor))
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn start_endpoint_attempt(&mut self, endpoint: SocketAddrV4, reactor: &mut Reactor) {
        match self.start_attempt(endpoint, None, self.connect_timeout, reactor) {
            Ok(_) => {}
            Err(e) => {
                warn!("connect to {} failed to start: {}", endpoint, e);
                self.schedule_retry(endpoint, reactor);
            }
        }
    }

    fn start_attempt(
        &mut self,
        endpoint: SocketAddrV4,
        oneshot: Option<AttemptId>,
        timeout: Duration,
        reactor: &mut Reactor,
    ) -> io::Result<Token> {
        let mut stream = TcpStream::connect(SocketAddr::V4(endpoint))?;
        let token = reactor.next_token();
        reactor.register(&mut stream, token, Interest::WRITABLE)?;
        let deadline = reactor.schedule_once(timeout);
        self.timers.insert(deadline, TimerRole::Deadline(token));
        self.attempts.insert(
            token,
            Attempt {
                endpoint,
                stream,
                deadline,
                oneshot,
            },
        );
        if oneshot.is_none() {
            if let Some(state) = self.endpoints.get_mut(&endpoint) {
                state.state = EndpointState::Connecting(token);
            }
        }
        Ok(token)
    }

    fn attempt_failed(
        &mut self,
        attempt: Attempt,
        error: io::Error,
        reactor: &mut Reactor,
    ) -> ConnectResult {
        info!("failed to connect to {}: {}", attempt.endpoint, error);
        if attempt.oneshot.is_none() {
            self.schedule_retry(attempt.endpoint, reactor);
        }
        ConnectResult {
            endpoint: attempt.endpoint,
            outcome: ConnectOutcome::Failed(error),
            attempt: attempt.oneshot,
        }
    }

    fn schedule_retry(&mut self, endpoint: SocketAddrV4, reactor: &mut Reactor) {
        let Some(state) = self.endpoints.get_mut(&endpoint) else {
            return;
        };
        state.failures = state.failures.saturating_add(1);
        let delay = state.policy.delay(state.failures);
        debug!(
            "retrying {} in {:?} (failure #{})",
            endpoint, delay, state.failures
        );
        let timer = reactor.schedule_once(delay);
        self.timers.insert(timer, TimerRole::Backoff(endpoint));
        state.state = EndpointState::Backoff(timer);
    }

    fn discard_attempt(&mut self, mut attempt: Attempt, reactor: &mut Reactor) {
        reactor.cancel_timer(attempt.deadline);
        self.timers.remove(&attempt.deadline);
        let _ = reactor.deregister(&mut attempt.stream);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::ReactorEvent;
    use std::net::{Ipv4Addr, TcpListener};
    use std::time::Instant;

    #[test]
    fn test_exponential_backoff_progression() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(5), Duration::from_secs(30));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(4), Duration::from_secs(30));
        assert_eq!(policy.delay(40), Duration::from_secs(30));
    }

    #[test]
    fn test_linear_backoff_progression() {
        let policy = BackoffPolicy::linear(
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(30),
        );
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(6), Duration::from_secs(30));
        assert_eq!(policy.delay(100), Duration::from_secs(30));
    }

    fn local_listener() -> (TcpListener, SocketAddrV4) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        (listener, addr)
    }

    /// Pump the reactor, feeding connector events, until a result appears
    /// or the window elapses.
    fn pump_for_result(
        reactor: &mut Reactor,
        connector: &mut TcpConnector,
        window: Duration,
    ) -> Option<ConnectResult> {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let mut events = Vec::new();
            reactor
                .poll(&mut events, Some(Duration::from_millis(20)))
                .unwrap();
            for event in events {
                let result = match event {
                    ReactorEvent::Writable(token) | ReactorEvent::Readable(token) => {
                        connector.handle_event(token, reactor)
                    }
                    ReactorEvent::Timer(id) => connector.handle_timer(id, reactor),
                };
                if result.is_some() {
                    return result;
                }
            }
        }
        None
    }

    #[test]
    fn test_oneshot_connect_succeeds() {
        let (listener, addr) = local_listener();
        let mut reactor = Reactor::new().unwrap();
        let mut connector = TcpConnector::new(DEFAULT_CONNECT_TIMEOUT);

        let id = connector
            .connect(addr, Duration::from_secs(2), &mut reactor)
            .unwrap();

        let result = pump_for_result(&mut reactor, &mut connector, Duration::from_secs(3))
            .expect("connect should resolve");
        assert_eq!(result.endpoint, addr);
        assert_eq!(result.attempt, Some(id));
        assert!(matches!(result.outcome, ConnectOutcome::Connected(_)));

        let _ = listener.accept().unwrap();
    }

    #[test]
    fn test_oneshot_connect_refused() {
        // Bind then drop to get a port with (very likely) no listener.
        let (listener, addr) = local_listener();
        drop(listener);

        let mut reactor = Reactor::new().unwrap();
        let mut connector = TcpConnector::new(DEFAULT_CONNECT_TIMEOUT);
        connector
            .connect(addr, Duration::from_secs(2), &mut reactor)
            .unwrap();

        let result = pump_for_result(&mut reactor, &mut connector, Duration::from_secs(3))
            .expect("refusal should resolve");
        assert!(matches!(result.outcome, ConnectOutcome::Failed(_)));
    }

    #[test]
    fn test_cancel_oneshot() {
        let (_listener, addr) = local_listener();
        let mut reactor = Reactor::new().unwrap();
        let mut connector = TcpConnector::new(DEFAULT_CONNECT_TIMEOUT);

        let id = connector
            .connect(addr, Duration::from_secs(2), &mut reactor)
            .unwrap();
        assert!(connector.cancel(id, &mut reactor));
        assert!(!connector.cancel(id, &mut reactor));

        assert!(pump_for_result(&mut reactor, &mut connector, Duration::from_millis(100)).is_none());
    }

    #[test]
    fn test_endpoint_retries_with_backoff() {
        let (listener, addr) = local_listener();
        drop(listener);

        let mut reactor = Reactor::new().unwrap();
        let mut connector = TcpConnector::new(Duration::from_secs(1));
        let policy =
            BackoffPolicy::linear(Duration::from_millis(10), Duration::ZERO, Duration::from_millis(10));
        connector.add_endpoint(addr, policy, &mut reactor);

        // Two consecutive failures prove the backoff timer re-arms attempts.
        let mut failures = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while failures < 2 && Instant::now() < deadline {
            if let Some(result) =
                pump_for_result(&mut reactor, &mut connector, Duration::from_millis(200))
            {
                assert!(matches!(result.outcome, ConnectOutcome::Failed(_)));
                assert!(result.attempt.is_none());
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[test]
    fn test_remove_endpoint_stops_retries() {
        let (listener, addr) = local_listener();
        drop(listener);

        let mut reactor = Reactor::new().unwrap();
        let mut connector = TcpConnector::new(Duration::from_secs(1));
        let policy =
            BackoffPolicy::linear(Duration::from_millis(5), Duration::ZERO, Duration::from_millis(5));
        connector.add_endpoint(addr, policy, &mut reactor);

        // Let the first attempt fail, then remove.
        let _ = pump_for_result(&mut reactor, &mut connector, Duration::from_secs(2));
        connector.remove_endpoint(addr, &mut reactor);
        assert_eq!(connector.endpoint_count(), 0);

        assert!(pump_for_result(&mut reactor, &mut connector, Duration::from_millis(50)).is_none());
    }
}
