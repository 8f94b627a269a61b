// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bidirectional liveness over one session.
//!
//! Send side: a repeating timer emits a heartbeat (null PDU) every
//! interval. Receive side: a deadline timer, reset on every received
//! frame of any vector, fires after `interval x missed_allowed` of
//! silence and declares the connection unhealthy exactly once.
//!
//! `teardown` must run before the owning queue is destroyed: the
//! heartbeat timer may otherwise fire against a dead queue.

use std::time::Duration;

use log::warn;

use crate::config::SessionConfig;
use crate::rt::{Reactor, TimerId};
use crate::transport::queue::{MessageQueue, SendResult};

/// What a health-check timer firing means for the owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HealthEvent {
    /// A heartbeat was queued; flush the session.
    HeartbeatSent,

    /// The queue refused the heartbeat; nothing to flush. The receive
    /// deadline will catch a genuinely dead peer.
    HeartbeatDropped,

    /// The receive deadline expired: the connection is unhealthy.
    Unhealthy,
}

#[derive(Debug)]
pub struct HealthCheckedConnection {
    heartbeat_timer: TimerId,
    deadline_timer: TimerId,
    receive_timeout: Duration,
    unhealthy_reported: bool,
    torn_down: bool,
}

impl HealthCheckedConnection {
    /// Arm both timers. The first heartbeat is sent by [`setup`](Self::setup).
    pub fn new(config: &SessionConfig, reactor: &mut Reactor) -> Self {
        let receive_timeout = config.receive_timeout();
        Self {
            heartbeat_timer: reactor.schedule_repeating(config.heartbeat_interval),
            deadline_timer: reactor.schedule_once(receive_timeout),
            receive_timeout,
            unhealthy_reported: false,
            torn_down: false,
        }
    }

    /// Send the first heartbeat synchronously.
    ///
    /// Returns `false` if the queue rejected it; the connection is then
    /// dead on arrival and must be torn down by the caller.
    pub fn setup(&mut self, heartbeat_frame: &[u8], queue: &mut MessageQueue) -> bool {
        queue.send(heartbeat_frame) == SendResult::Accepted
    }

    /// Record inbound liveness: any received frame counts.
    pub fn heartbeat_received(&mut self, reactor: &mut Reactor) {
        if self.torn_down {
            return;
        }
        reactor.cancel_timer(self.deadline_timer);
        self.deadline_timer = reactor.schedule_once(self.receive_timeout);
    }

    pub fn owns_timer(&self, id: TimerId) -> bool {
        !self.torn_down && (id == self.heartbeat_timer || id == self.deadline_timer)
    }

    /// Drive a timer firing owned by this health check.
    pub fn handle_timer(
        &mut self,
        id: TimerId,
        heartbeat_frame: &[u8],
        queue: &mut MessageQueue,
    ) -> HealthEvent {
        if id == self.deadline_timer {
            if self.unhealthy_reported {
                return HealthEvent::HeartbeatDropped;
            }
            self.unhealthy_reported = true;
            return HealthEvent::Unhealthy;
        }

        match queue.send(heartbeat_frame) {
            SendResult::Accepted => HealthEvent::HeartbeatSent,
            SendResult::Dropped => {
                warn!("heartbeat dropped: outbound queue at its limit");
                HealthEvent::HeartbeatDropped
            }
        }
    }

    /// Cancel both timers. Idempotent; required before the queue goes away.
    pub fn teardown(&mut self, reactor: &mut Reactor) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        reactor.cancel_timer(self.heartbeat_timer);
        reactor.cancel_timer(self.deadline_timer);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::ReactorEvent;
    use std::time::Instant;

    fn config(heartbeat_ms: u64) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: Duration::from_millis(heartbeat_ms),
            ..SessionConfig::default()
        }
    }

    fn collect_timers(reactor: &mut Reactor, window: Duration) -> Vec<TimerId> {
        let deadline = Instant::now() + window;
        let mut fired = Vec::new();
        while Instant::now() < deadline {
            let mut events = Vec::new();
            reactor
                .poll(&mut events, Some(Duration::from_millis(5)))
                .unwrap();
            for event in events {
                if let ReactorEvent::Timer(id) = event {
                    fired.push(id);
                }
            }
        }
        fired
    }

    #[test]
    fn test_setup_queues_first_heartbeat() {
        let mut reactor = Reactor::new().unwrap();
        let mut queue = MessageQueue::new(1024);
        let mut health = HealthCheckedConnection::new(&config(100), &mut reactor);

        assert!(health.setup(b"heartbeat", &mut queue));
        assert_eq!(queue.len(), 9);
        health.teardown(&mut reactor);
    }

    #[test]
    fn test_setup_fails_when_queue_full() {
        let mut reactor = Reactor::new().unwrap();
        let mut queue = MessageQueue::new(4);
        queue.send(b"xxxx");
        let mut health = HealthCheckedConnection::new(&config(100), &mut reactor);

        assert!(!health.setup(b"heartbeat", &mut queue));
        health.teardown(&mut reactor);
    }

    #[test]
    fn test_deadline_fires_unhealthy_exactly_once() {
        let mut reactor = Reactor::new().unwrap();
        let mut queue = MessageQueue::new(64 * 1024);
        // 10ms heartbeat -> 30ms receive deadline.
        let mut health = HealthCheckedConnection::new(&config(10), &mut reactor);

        let mut unhealthy = 0;
        for id in collect_timers(&mut reactor, Duration::from_millis(120)) {
            if health.owns_timer(id)
                && health.handle_timer(id, b"hb", &mut queue) == HealthEvent::Unhealthy
            {
                unhealthy += 1;
            }
        }
        assert_eq!(unhealthy, 1);
        health.teardown(&mut reactor);
    }

    #[test]
    fn test_received_frames_defer_the_deadline() {
        let mut reactor = Reactor::new().unwrap();
        let mut queue = MessageQueue::new(64 * 1024);
        let mut health = HealthCheckedConnection::new(&config(20), &mut reactor);

        // Keep refreshing liveness for ~100ms; the 60ms deadline must not
        // fire.
        let stop = Instant::now() + Duration::from_millis(100);
        let mut unhealthy = false;
        while Instant::now() < stop {
            health.heartbeat_received(&mut reactor);
            let mut events = Vec::new();
            reactor
                .poll(&mut events, Some(Duration::from_millis(5)))
                .unwrap();
            for event in events {
                if let ReactorEvent::Timer(id) = event {
                    if health.owns_timer(id)
                        && health.handle_timer(id, b"hb", &mut queue) == HealthEvent::Unhealthy
                    {
                        unhealthy = true;
                    }
                }
            }
        }
        assert!(!unhealthy);
        health.teardown(&mut reactor);
    }

    #[test]
    fn test_heartbeat_timer_queues_frames() {
        let mut reactor = Reactor::new().unwrap();
        let mut queue = MessageQueue::new(64 * 1024);
        let mut health = HealthCheckedConnection::new(&config(10), &mut reactor);

        let mut sent: usize = 0;
        for id in collect_timers(&mut reactor, Duration::from_millis(55)) {
            if health.owns_timer(id)
                && health.handle_timer(id, b"hb", &mut queue) == HealthEvent::HeartbeatSent
            {
                sent += 1;
            }
        }
        assert!(sent >= 2, "expected repeated heartbeats, got {}", sent);
        assert_eq!(queue.len(), sent * 2);
        health.teardown(&mut reactor);
    }

    #[test]
    fn test_teardown_disowns_timers() {
        let mut reactor = Reactor::new().unwrap();
        let mut health = HealthCheckedConnection::new(&config(10), &mut reactor);
        let hb = health.heartbeat_timer;

        health.teardown(&mut reactor);
        health.teardown(&mut reactor);
        assert!(!health.owns_timer(hb));
    }
}
