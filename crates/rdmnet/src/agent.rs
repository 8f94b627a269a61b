// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Device-side controller agent.
//!
//! Maintains exactly one TCP session to a chosen controller and delivers
//! status messages with at-least-once semantics across reconnects:
//!
//! - Candidates come from discovery; the agent merges them into a
//!   persistent list, penalises controllers that refuse connections, and
//!   picks the highest advertised priority (first seen wins ties).
//! - Status messages get monotonic sequence numbers and stay in the
//!   outstanding map until the controller acks them with a status PDU for
//!   that sequence; the map is capped, and survives reconnects.
//! - After a reconnect every un-acked message is retransmitted in
//!   ascending sequence order.

use std::collections::BTreeMap;
use std::net::SocketAddrV4;
use std::time::Duration;

use log::{info, warn};
use mio::Token;

use crate::acn::codec::{parse_status, Message, MessageBuilder};
use crate::acn::constants::{SC_E133_ACK, VECTOR_FRAMING_STATUS};
use crate::acn::controller::{self, ControllerMessage, DeviceTuple};
use crate::config::AgentConfig;
use crate::core::sequence::SequenceNumber;
use crate::core::uid::RdmUid;
use crate::rt::{Reactor, TimerId};
use crate::transport::connector::{AttemptId, ConnectOutcome, ConnectResult, TcpConnector};
use crate::transport::queue::SendResult;
use crate::transport::session::{PeerSession, SessionEvent};

/// A controller the agent may connect to, as advertised by discovery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CandidateController {
    pub address: SocketAddrV4,
    pub priority: u8,
}

/// What the agent needs from its owner after an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AgentAction {
    /// Nothing further.
    Continue,

    /// Re-run selection: fetch the current candidate list and call
    /// [`ControllerAgent::attempt_connection`].
    NeedCandidates,
}

/// Counters surfaced for operator display.
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    pub connect_events: u64,
    pub unhealthy_events: u64,

    /// The controller we are currently connected to.
    pub controller: Option<SocketAddrV4>,
}

struct KnownController {
    address: SocketAddrV4,
    /// Signed working priority; connect failures push it negative.
    priority: i16,
    /// The priority last advertised via DNS-SD.
    advertised: i16,
    seen: bool,
}

struct OutstandingMessage {
    endpoint: u16,
    response: Vec<u8>,
    sent_on_wire: bool,
}

pub struct ControllerAgent {
    config: AgentConfig,
    builder: MessageBuilder,
    device_uid: RdmUid,
    device_udp: SocketAddrV4,

    known: Vec<KnownController>,
    session: Option<PeerSession>,
    pending: Option<AttemptId>,
    retry_timer: Option<TimerId>,

    outstanding: BTreeMap<u32, OutstandingMessage>,
    sequence: SequenceNumber,
    unsent_messages: bool,

    stats: ConnectionStats,
}

impl ControllerAgent {
    pub fn new(
        device_uid: RdmUid,
        device_udp: SocketAddrV4,
        builder: MessageBuilder,
        config: AgentConfig,
    ) -> Self {
        Self {
            config,
            builder,
            device_uid,
            device_udp,
            known: Vec::new(),
            session: None,
            pending: None,
            retry_timer: None,
            outstanding: BTreeMap::new(),
            sequence: SequenceNumber::new(),
            unsent_messages: false,
            stats: ConnectionStats::default(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Un-acked messages currently held.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    // ========================================================================
    // Selection and connection
    // ========================================================================

    /// Pick the best candidate and start a connect attempt; with no usable
    /// candidate, try again after the reselect delay.
    pub fn attempt_connection(
        &mut self,
        candidates: &[CandidateController],
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) {
        if self.session.is_some() || self.pending.is_some() {
            return;
        }

        let Some(target) = self.pick_controller(candidates) else {
            self.retry_timer = Some(reactor.schedule_once(self.config.reselect_delay));
            return;
        };

        match connector.connect(target, self.config.connect_timeout, reactor) {
            Ok(id) => self.pending = Some(id),
            Err(e) => {
                info!("failed to connect to {}: {}", target, e);
                self.penalise(target);
                self.retry_timer = Some(reactor.schedule_once(Duration::ZERO));
            }
        }
    }

    /// Merge the candidate list into the known set and choose a target.
    fn pick_controller(&mut self, candidates: &[CandidateController]) -> Option<SocketAddrV4> {
        info!("I know about {} controllers", candidates.len());

        let mut all_bad = !self.known.is_empty();
        for known in &mut self.known {
            known.seen = false;
            all_bad &= known.priority < 0;
        }

        for candidate in candidates {
            match self
                .known
                .iter_mut()
                .find(|k| k.address == candidate.address)
            {
                Some(known) => {
                    known.seen = true;
                    known.advertised = i16::from(candidate.priority);
                }
                None => {
                    info!("added {} to the list of known controllers", candidate.address);
                    self.known.push(KnownController {
                        address: candidate.address,
                        priority: i16::from(candidate.priority),
                        advertised: i16::from(candidate.priority),
                        seen: true,
                    });
                    all_bad = false;
                }
            }
        }

        self.known.retain(|known| {
            if !known.seen {
                info!("removed {}", known.address);
            }
            known.seen
        });

        if self.known.is_empty() {
            return None;
        }

        if all_bad {
            info!("all known controllers are bad, resetting priorities");
            for known in &mut self.known {
                known.priority = known.advertised;
            }
        }

        // Highest priority wins; first-seen insertion order breaks ties.
        let mut best: Option<(SocketAddrV4, i16)> = None;
        for known in &self.known {
            if known.priority < 0 {
                continue;
            }
            if best.map_or(true, |(_, priority)| known.priority > priority) {
                best = Some((known.address, known.priority));
            }
        }

        let (address, priority) = best?;
        info!("selected {} with priority {}", address, priority);
        Some(address)
    }

    fn penalise(&mut self, address: SocketAddrV4) {
        for known in &mut self.known {
            if known.address == address {
                known.priority -= self.config.failure_penalty;
            }
        }
    }

    /// Drive a resolved connect attempt.
    pub fn on_connect_result(
        &mut self,
        result: ConnectResult,
        reactor: &mut Reactor,
    ) -> AgentAction {
        if result.attempt.is_some() && result.attempt == self.pending {
            self.pending = None;
        }

        match result.outcome {
            ConnectOutcome::Connected(stream) => {
                self.stats.connect_events += 1;
                match PeerSession::establish(
                    stream,
                    result.endpoint,
                    &self.builder,
                    &self.config.session,
                    reactor,
                ) {
                    Ok(session) => {
                        self.stats.controller = Some(result.endpoint);
                        self.session = Some(session);
                        self.send_registration(reactor);
                        info!("new connection, sending any un-acked messages");
                        self.push_unsent(reactor);
                        AgentAction::Continue
                    }
                    Err(e) => {
                        warn!("failed to set up session to {}: {}", result.endpoint, e);
                        self.penalise(result.endpoint);
                        AgentAction::NeedCandidates
                    }
                }
            }
            ConnectOutcome::Failed(e) => {
                info!("failed to connect to {}: {}", result.endpoint, e);
                self.penalise(result.endpoint);
                AgentAction::NeedCandidates
            }
        }
    }

    /// Announce this device's UDP endpoint and UID to the controller.
    fn send_registration(&mut self, reactor: &mut Reactor) {
        let registration = controller::encode(&ControllerMessage::DeviceRegistration(
            DeviceTuple::new(self.device_udp, self.device_uid),
        ));
        let frame = self.builder.build_controller(&registration);
        let Some(session) = &mut self.session else {
            return;
        };
        match session.send(&frame, reactor) {
            Ok(SendResult::Accepted) => {}
            Ok(SendResult::Dropped) => warn!("device registration dropped by full queue"),
            Err(e) => {
                warn!("device registration write failed: {}", e);
                self.connection_lost(reactor);
            }
        }
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Queue an RDM status response toward the controller.
    ///
    /// Returns `false` when the outstanding map is full; the caller decides
    /// whether to drop or retry later.
    pub fn send_status(&mut self, endpoint: u16, response: Vec<u8>, reactor: &mut Reactor) -> bool {
        if self.outstanding.len() >= self.config.max_outstanding {
            warn!("outstanding message limit reached, no further messages will be held");
            return false;
        }

        let sequence = self.sequence.next();
        if self.outstanding.contains_key(&sequence) {
            warn!("sequence number collision on {}", sequence);
            return false;
        }

        let mut message = OutstandingMessage {
            endpoint,
            response,
            sent_on_wire: false,
        };
        if self.session.is_some() {
            let response = message.response.clone();
            message.sent_on_wire = self.send_rdm(sequence, endpoint, &response, reactor);
        }
        self.outstanding.insert(sequence, message);
        true
    }

    fn send_rdm(
        &mut self,
        sequence: u32,
        endpoint: u16,
        response: &[u8],
        reactor: &mut Reactor,
    ) -> bool {
        let Some(session) = &mut self.session else {
            return false;
        };
        if session.queue_limit_reached() {
            return false;
        }
        let frame = self.builder.build_rdm(sequence, endpoint, response);
        match session.send(&frame, reactor) {
            Ok(SendResult::Accepted) => true,
            Ok(SendResult::Dropped) => false,
            Err(e) => {
                warn!("RDM send failed: {}", e);
                self.connection_lost(reactor);
                false
            }
        }
    }

    /// Retransmit every buffered message not currently on the wire, in
    /// ascending sequence order.
    fn push_unsent(&mut self, reactor: &mut Reactor) {
        let pending: Vec<(u32, u16, Vec<u8>)> = self
            .outstanding
            .iter()
            .filter(|(_, m)| !m.sent_on_wire)
            .map(|(seq, m)| (*seq, m.endpoint, m.response.clone()))
            .collect();

        let mut sent_all = true;
        for (sequence, endpoint, response) in pending {
            let sent = self.send_rdm(sequence, endpoint, &response, reactor);
            if let Some(message) = self.outstanding.get_mut(&sequence) {
                message.sent_on_wire = sent;
            }
            sent_all &= sent;
            if self.session.is_none() {
                sent_all = false;
                break;
            }
        }
        self.unsent_messages = !sent_all;
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    pub fn owns_token(&self, token: Token) -> bool {
        self.session.as_ref().map(|s| s.token()) == Some(token)
    }

    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.retry_timer == Some(id)
            || self.session.as_ref().is_some_and(|s| s.owns_timer(id))
    }

    pub fn on_readable(&mut self, reactor: &mut Reactor) -> AgentAction {
        let Some(session) = &mut self.session else {
            return AgentAction::Continue;
        };
        match session.on_readable(reactor) {
            Ok(outcome) => {
                for message in outcome.messages {
                    self.handle_message(&message, reactor);
                }
                if outcome.closed {
                    self.connection_lost(reactor);
                }
            }
            Err(e) => {
                warn!("TCP stream is bad: {}", e);
                self.connection_lost(reactor);
            }
        }
        AgentAction::Continue
    }

    pub fn on_writable(&mut self, reactor: &mut Reactor) {
        let Some(session) = &mut self.session else {
            return;
        };
        if let Err(e) = session.on_writable(reactor) {
            warn!("TCP write failed: {}", e);
            self.connection_lost(reactor);
        }
    }

    pub fn handle_timer(&mut self, id: TimerId, reactor: &mut Reactor) -> AgentAction {
        if self.retry_timer == Some(id) {
            self.retry_timer = None;
            return AgentAction::NeedCandidates;
        }

        if self.session.as_ref().is_some_and(|s| s.owns_timer(id)) {
            let session = self.session.as_mut().expect("session checked above");
            match session.handle_timer(id, reactor) {
                Ok(SessionEvent::Continue) => {}
                Ok(SessionEvent::Unhealthy) => {
                    info!("TCP connection went unhealthy, closing");
                    self.stats.unhealthy_events += 1;
                    self.connection_lost(reactor);
                }
                Err(e) => {
                    warn!("TCP write failed: {}", e);
                    self.connection_lost(reactor);
                }
            }
        }
        AgentAction::Continue
    }

    fn handle_message(&mut self, message: &Message, reactor: &mut Reactor) {
        if message.framing_vector != VECTOR_FRAMING_STATUS {
            return;
        }
        let Some((status_code, description)) = parse_status(&message.payload) else {
            warn!("status PDU with truncated body");
            return;
        };
        self.handle_status(message.sequence, status_code, &description, reactor);
    }

    /// An ack (or other status) for one of our sequence numbers.
    fn handle_status(
        &mut self,
        sequence: u32,
        status_code: u16,
        description: &str,
        reactor: &mut Reactor,
    ) {
        if status_code != SC_E133_ACK {
            info!(
                "received a non-ack status code: {} : {}",
                status_code, description
            );
        }
        info!("controller has ack'ed {}", sequence);
        self.outstanding.remove(&sequence);

        let has_room = self
            .session
            .as_ref()
            .is_some_and(|s| !s.queue_limit_reached());
        if self.unsent_messages && has_room {
            self.push_unsent(reactor);
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// The connection broke: keep the outstanding map, clear wire state and
    /// schedule an immediate reselection.
    fn connection_lost(&mut self, reactor: &mut Reactor) {
        if let Some(mut session) = self.session.take() {
            session.close(reactor);
        }
        self.stats.controller = None;
        for message in self.outstanding.values_mut() {
            message.sent_on_wire = false;
        }
        self.unsent_messages = !self.outstanding.is_empty();
        if self.retry_timer.is_none() {
            self.retry_timer = Some(reactor.schedule_once(Duration::ZERO));
        }
    }

    /// Shut the agent down: cancel attempts and timers, close the session.
    pub fn stop(&mut self, connector: &mut TcpConnector, reactor: &mut Reactor) {
        if !self.outstanding.is_empty() {
            warn!(
                "{} RDM commands remain un-ack'ed and will not be delivered",
                self.outstanding.len()
            );
        }
        if let Some(id) = self.pending.take() {
            connector.cancel(id, reactor);
        }
        if let Some(id) = self.retry_timer.take() {
            reactor.cancel_timer(id);
        }
        if let Some(mut session) = self.session.take() {
            session.close(reactor);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acn::codec::Cid;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, last), 5569)
    }

    fn candidate(last: u8, priority: u8) -> CandidateController {
        CandidateController {
            address: addr(last),
            priority,
        }
    }

    fn agent() -> ControllerAgent {
        ControllerAgent::new(
            RdmUid::new(0x7a70, 1),
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 40000),
            MessageBuilder::new(Cid::from_bytes([3u8; 16]), "test device"),
            AgentConfig::default(),
        )
    }

    #[test]
    fn test_picks_highest_priority() {
        let mut agent = agent();
        let picked = agent.pick_controller(&[candidate(1, 50), candidate(2, 100)]);
        assert_eq!(picked, Some(addr(2)));
    }

    #[test]
    fn test_tie_broken_by_first_seen_order() {
        let mut agent = agent();
        // Seed insertion order: .1 first.
        agent.pick_controller(&[candidate(1, 100)]);
        let picked = agent.pick_controller(&[candidate(2, 100), candidate(1, 100)]);
        assert_eq!(picked, Some(addr(1)));
    }

    #[test]
    fn test_no_candidates_yields_none() {
        let mut agent = agent();
        assert_eq!(agent.pick_controller(&[]), None);
    }

    #[test]
    fn test_unseen_controllers_are_removed() {
        let mut agent = agent();
        agent.pick_controller(&[candidate(1, 100), candidate(2, 50)]);
        agent.pick_controller(&[candidate(2, 50)]);
        assert_eq!(agent.known.len(), 1);
        assert_eq!(agent.known[0].address, addr(2));
    }

    #[test]
    fn test_penalty_changes_selection() {
        let mut agent = agent();
        let candidates = [candidate(1, 50), candidate(2, 100)];

        assert_eq!(agent.pick_controller(&candidates), Some(addr(2)));
        agent.penalise(addr(2));
        // 100 - 200 = -100: .2 falls behind .1.
        assert_eq!(agent.pick_controller(&candidates), Some(addr(1)));
    }

    #[test]
    fn test_all_bad_resets_to_advertised() {
        let mut agent = agent();
        let candidates = [candidate(1, 50), candidate(2, 100)];
        agent.pick_controller(&candidates);
        agent.penalise(addr(1));
        agent.penalise(addr(2));

        // Every entry is negative now; the next pass resets and picks the
        // best advertised priority again.
        assert_eq!(agent.pick_controller(&candidates), Some(addr(2)));
        assert!(agent.known.iter().all(|k| k.priority >= 0));
    }

    #[test]
    fn test_send_status_respects_cap() {
        let mut agent = agent();
        let mut reactor = Reactor::new().unwrap();

        for _ in 0..10 {
            assert!(agent.send_status(0, vec![0x42], &mut reactor));
        }
        assert_eq!(agent.outstanding_count(), 10);
        assert!(!agent.send_status(0, vec![0x42], &mut reactor));
    }

    #[test]
    fn test_ack_removes_outstanding() {
        let mut agent = agent();
        let mut reactor = Reactor::new().unwrap();

        agent.send_status(0, vec![1], &mut reactor);
        agent.send_status(0, vec![2], &mut reactor);
        assert_eq!(agent.outstanding_count(), 2);

        agent.handle_status(0, SC_E133_ACK, "", &mut reactor);
        assert_eq!(agent.outstanding_count(), 1);

        // Unknown sequence is harmless.
        agent.handle_status(99, SC_E133_ACK, "", &mut reactor);
        assert_eq!(agent.outstanding_count(), 1);
    }

    #[test]
    fn test_non_ack_status_still_clears_entry() {
        let mut agent = agent();
        let mut reactor = Reactor::new().unwrap();
        agent.send_status(0, vec![1], &mut reactor);
        agent.handle_status(0, 0x0001, "queue overflow", &mut reactor);
        assert_eq!(agent.outstanding_count(), 0);
    }

    #[test]
    fn test_sequence_survives_connection_loss() {
        let mut agent = agent();
        let mut reactor = Reactor::new().unwrap();

        agent.send_status(0, vec![1], &mut reactor);
        agent.connection_lost(&mut reactor);
        agent.send_status(0, vec![2], &mut reactor);

        let sequences: Vec<u32> = agent.outstanding.keys().copied().collect();
        assert_eq!(sequences, vec![0, 1]);
        assert!(agent.outstanding.values().all(|m| !m.sent_on_wire));
    }

    #[test]
    fn test_failed_connect_penalises_endpoint() {
        let mut agent = agent();
        let mut reactor = Reactor::new().unwrap();
        let candidates = [candidate(1, 50), candidate(2, 100)];
        agent.pick_controller(&candidates);

        let result = ConnectResult {
            endpoint: addr(2),
            outcome: ConnectOutcome::Failed(std::io::ErrorKind::ConnectionRefused.into()),
            attempt: None,
        };
        assert_eq!(
            agent.on_connect_result(result, &mut reactor),
            AgentAction::NeedCandidates
        );
        assert_eq!(agent.pick_controller(&candidates), Some(addr(1)));
    }
}
