// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller-side mesh: one session per peer controller, plus the device
//! registry those sessions gossip about.
//!
//! Both sides of a controller pair attempt to connect, so duplicate
//! sessions between the same pair can exist; each is an independent flow
//! and the redundant one is simply refused locally. Self-connections are
//! filtered by address.
//!
//! The periodic refresh mirrors discovery: every known peer is marked
//! unseen, re-reported peers are kept, newcomers get a connector endpoint
//! with linear backoff, and whatever discovery stopped reporting is torn
//! down.

use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, info, warn};
use mio::net::TcpStream;
use mio::Token;

use crate::acn::codec::{Message, MessageBuilder};
use crate::acn::constants::VECTOR_FRAMING_CONTROLLER;
use crate::acn::controller::{self, ControllerMessage, DeviceTuple};
use crate::config::MeshConfig;
use crate::core::uid::RdmUid;
use crate::registry::DeviceRegistry;
use crate::rt::{Reactor, TimerId};
use crate::transport::connector::TcpConnector;
use crate::transport::queue::SendResult;
use crate::transport::session::{PeerSession, SessionEvent};

/// What the mesh needs from its owner after an event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MeshAction {
    Continue,

    /// The refresh timer fired: fetch the current peer list and call
    /// [`ControllerMesh::refresh_peers`].
    NeedPeerRefresh,
}

struct KnownPeer {
    address: SocketAddrV4,
    session: Option<PeerSession>,
    seen: bool,
}

pub struct ControllerMesh {
    config: MeshConfig,
    builder: MessageBuilder,
    our_listen: SocketAddrV4,

    known: Vec<KnownPeer>,
    registry: DeviceRegistry,
    refresh_timer: Option<TimerId>,
}

impl ControllerMesh {
    pub fn new(our_listen: SocketAddrV4, builder: MessageBuilder, config: MeshConfig) -> Self {
        Self {
            config,
            builder,
            our_listen,
            known: Vec::new(),
            registry: DeviceRegistry::new(),
            refresh_timer: None,
        }
    }

    /// Arm the periodic peer refresh. The owner should follow up with an
    /// immediate [`refresh_peers`](Self::refresh_peers).
    pub fn start(&mut self, reactor: &mut Reactor) {
        if self.refresh_timer.is_none() {
            self.refresh_timer = Some(reactor.schedule_repeating(self.config.refresh_interval));
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn connected_controller_count(&self) -> usize {
        self.known.iter().filter(|k| k.session.is_some()).count()
    }

    /// Snapshot of peer state for operator display.
    pub fn peer_summary(&self) -> Vec<(SocketAddrV4, bool)> {
        self.known
            .iter()
            .map(|k| (k.address, k.session.is_some()))
            .collect()
    }

    // ========================================================================
    // Peer list maintenance
    // ========================================================================

    /// Reconcile the known peer set with discovery's current list.
    pub fn refresh_peers(
        &mut self,
        peers: &[SocketAddrV4],
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) {
        for known in &mut self.known {
            known.seen = false;
        }

        for peer in peers {
            if self.is_ourself(*peer) {
                debug!("skipping {} since it's ourself", peer);
                continue;
            }
            match self.known.iter_mut().find(|k| k.address == *peer) {
                Some(known) => known.seen = true,
                None => {
                    info!("tracking peer controller {}", peer);
                    self.known.push(KnownPeer {
                        address: *peer,
                        session: None,
                        seen: true,
                    });
                    connector.add_endpoint(*peer, self.config.backoff, reactor);
                }
            }
        }

        // Remove any controllers that no longer exist.
        let mut removed = Vec::new();
        self.known.retain_mut(|known| {
            if known.seen {
                return true;
            }
            info!("removed {}", known.address);
            if let Some(mut session) = known.session.take() {
                session.close(reactor);
            }
            removed.push(known.address);
            false
        });
        for address in removed {
            connector.remove_endpoint(address, reactor);
            self.purge_learned_from(address);
        }
    }

    fn is_ourself(&self, peer: SocketAddrV4) -> bool {
        peer == self.our_listen
            || (*peer.ip() == Ipv4Addr::LOCALHOST && peer.port() == self.our_listen.port())
    }

    /// A connector attempt for `endpoint` completed.
    pub fn on_connected(
        &mut self,
        endpoint: SocketAddrV4,
        stream: TcpStream,
        reactor: &mut Reactor,
    ) {
        let builder = self.builder.clone();
        let session_config = self.config.session.clone();
        let Some(known) = self.known.iter_mut().find(|k| k.address == endpoint) else {
            warn!("can't find controller for {}", endpoint);
            return;
        };
        if known.session.is_some() {
            warn!("already got a TCP connection open to {}, closing the new one", endpoint);
            return;
        }

        match PeerSession::establish(stream, endpoint, &builder, &session_config, reactor) {
            Ok(session) => {
                info!("connected to controller at {}", endpoint);
                known.session = Some(session);
                // Learn the peer's devices right away.
                let frame = builder
                    .build_controller(&controller::encode(&ControllerMessage::FetchDevices));
                self.send_to_peer(endpoint, &frame, reactor);
            }
            Err(e) => {
                warn!("failed to set up session to {}: {}", endpoint, e);
            }
        }
    }

    // ========================================================================
    // Event routing
    // ========================================================================

    pub fn owns_token(&self, token: Token) -> bool {
        self.peer_by_token(token).is_some()
    }

    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.refresh_timer == Some(id)
            || self
                .known
                .iter()
                .any(|k| k.session.as_ref().is_some_and(|s| s.owns_timer(id)))
    }

    fn peer_by_token(&self, token: Token) -> Option<SocketAddrV4> {
        self.known
            .iter()
            .find(|k| k.session.as_ref().map(|s| s.token()) == Some(token))
            .map(|k| k.address)
    }

    pub fn on_readable(
        &mut self,
        token: Token,
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) {
        let Some(peer) = self.peer_by_token(token) else {
            return;
        };
        let outcome = {
            let session = self.session_mut(peer).expect("session exists for token");
            session.on_readable(reactor)
        };

        match outcome {
            Ok(outcome) => {
                for message in &outcome.messages {
                    self.handle_session_message(peer, message, reactor);
                }
                if outcome.closed {
                    self.close_peer_session(peer, connector, reactor);
                }
            }
            Err(e) => {
                warn!("TCP stream to {} is bad: {}", peer, e);
                self.close_peer_session(peer, connector, reactor);
            }
        }
    }

    pub fn on_writable(
        &mut self,
        token: Token,
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) {
        let Some(peer) = self.peer_by_token(token) else {
            return;
        };
        let result = {
            let session = self.session_mut(peer).expect("session exists for token");
            session.on_writable(reactor)
        };
        if let Err(e) = result {
            warn!("TCP write to {} failed: {}", peer, e);
            self.close_peer_session(peer, connector, reactor);
        }
    }

    pub fn handle_timer(
        &mut self,
        id: TimerId,
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) -> MeshAction {
        if self.refresh_timer == Some(id) {
            return MeshAction::NeedPeerRefresh;
        }

        let Some(peer) = self
            .known
            .iter()
            .find(|k| k.session.as_ref().is_some_and(|s| s.owns_timer(id)))
            .map(|k| k.address)
        else {
            return MeshAction::Continue;
        };

        let result = {
            let session = self.session_mut(peer).expect("session exists for timer");
            session.handle_timer(id, reactor)
        };
        match result {
            Ok(SessionEvent::Continue) => {}
            Ok(SessionEvent::Unhealthy) => {
                info!("connection to {} went unhealthy", peer);
                self.close_peer_session(peer, connector, reactor);
            }
            Err(e) => {
                warn!("TCP write to {} failed: {}", peer, e);
                self.close_peer_session(peer, connector, reactor);
            }
        }
        MeshAction::Continue
    }

    // ========================================================================
    // Controller messages
    // ========================================================================

    /// Handle a controller-vector message from a mesh session.
    fn handle_session_message(
        &mut self,
        source: SocketAddrV4,
        message: &Message,
        reactor: &mut Reactor,
    ) {
        if let Some(reply) = self.apply_controller_message(source, message, reactor) {
            let frame = self.builder.build_controller(&controller::encode(&reply));
            self.send_to_peer(source, &frame, reactor);
        }
    }

    /// Handle a controller-vector message from any session (mesh peers or
    /// directly connected devices); the caller sends the returned reply on
    /// the originating session.
    pub fn apply_controller_message(
        &mut self,
        source: SocketAddrV4,
        message: &Message,
        reactor: &mut Reactor,
    ) -> Option<ControllerMessage> {
        if message.framing_vector != VECTOR_FRAMING_CONTROLLER {
            return None;
        }
        let decoded = match controller::decode(&message.payload) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("dropping controller message from {}: {}", source, e);
                return None;
            }
        };
        debug!("got controller message {:?} from {}", decoded, source);

        match decoded {
            ControllerMessage::FetchDevices => {
                let devices = self.registry.snapshot_local();
                info!(
                    "sending device list with {} devices to {}",
                    devices.len(),
                    source
                );
                Some(ControllerMessage::DeviceList(devices))
            }
            ControllerMessage::DeviceAcquired(device) => {
                info!("informed about device at {}", device.udp);
                self.registry.upsert_remote(device.uid, device.udp, source);
                None
            }
            ControllerMessage::DeviceReleased(uid) => {
                info!("informed to forget about {}", uid);
                self.registry.release_from(&uid, source);
                None
            }
            ControllerMessage::DeviceList(devices) => {
                for device in devices {
                    self.registry.upsert_remote(device.uid, device.udp, source);
                }
                None
            }
            ControllerMessage::DeviceRegistration(device) => {
                info!("found device at {}", device.udp);
                self.device_acquired(device.uid, device.udp, source, reactor);
                None
            }
        }
    }

    // ========================================================================
    // Registry operations with gossip
    // ========================================================================

    /// Record a local device and tell every live peer about it.
    pub fn device_acquired(
        &mut self,
        uid: RdmUid,
        udp: SocketAddrV4,
        owner_session: SocketAddrV4,
        reactor: &mut Reactor,
    ) {
        self.registry.upsert_local(uid, udp, owner_session);
        let message = ControllerMessage::DeviceAcquired(DeviceTuple::new(udp, uid));
        self.broadcast(&message, reactor);
    }

    /// A device session (or a peer that owned devices through us) closed:
    /// drop its entries and, for local ones, gossip the release.
    pub fn device_session_closed(&mut self, peer: SocketAddrV4, reactor: &mut Reactor) {
        let removed = self.registry.forget_peer(peer);
        for (uid, entry) in removed {
            if entry.local {
                self.broadcast(&ControllerMessage::DeviceReleased(uid), reactor);
            }
        }
    }

    /// Drop everything learned from a peer controller (no gossip: the
    /// knowledge was never ours).
    fn purge_learned_from(&mut self, peer: SocketAddrV4) {
        let _ = self.registry.forget_peer(peer);
    }

    fn broadcast(&mut self, message: &ControllerMessage, reactor: &mut Reactor) {
        let frame = self.builder.build_controller(&controller::encode(message));
        let mut broken = Vec::new();
        for known in &mut self.known {
            let Some(session) = &mut known.session else {
                continue;
            };
            match session.send(&frame, reactor) {
                Ok(SendResult::Accepted) => {}
                Ok(SendResult::Dropped) => {
                    warn!("failed to send device update to {}", known.address);
                }
                Err(e) => {
                    warn!("failed to send device update to {}: {}", known.address, e);
                    broken.push(known.address);
                }
            }
        }
        for peer in broken {
            self.close_session_only(peer, reactor);
        }
    }

    fn send_to_peer(&mut self, peer: SocketAddrV4, frame: &[u8], reactor: &mut Reactor) {
        let Some(session) = self.session_mut(peer) else {
            warn!("can't find controller {}", peer);
            return;
        };
        match session.send(frame, reactor) {
            Ok(SendResult::Accepted) => {}
            Ok(SendResult::Dropped) => warn!("message to {} dropped by full queue", peer),
            Err(e) => {
                warn!("send to {} failed: {}", peer, e);
                self.close_session_only(peer, reactor);
            }
        }
    }

    fn session_mut(&mut self, peer: SocketAddrV4) -> Option<&mut PeerSession> {
        self.known
            .iter_mut()
            .find(|k| k.address == peer)
            .and_then(|k| k.session.as_mut())
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Close a peer session, forget what it taught us, and let the
    /// connector resume its connect cycle.
    fn close_peer_session(
        &mut self,
        peer: SocketAddrV4,
        connector: &mut TcpConnector,
        reactor: &mut Reactor,
    ) {
        self.close_session_only(peer, reactor);
        self.purge_learned_from(peer);
        connector.disconnect(peer, reactor);
    }

    fn close_session_only(&mut self, peer: SocketAddrV4, reactor: &mut Reactor) {
        if let Some(known) = self.known.iter_mut().find(|k| k.address == peer) {
            if let Some(mut session) = known.session.take() {
                session.close(reactor);
            }
        }
    }

    pub fn stop(&mut self, connector: &mut TcpConnector, reactor: &mut Reactor) {
        if let Some(id) = self.refresh_timer.take() {
            reactor.cancel_timer(id);
        }
        let addresses: Vec<SocketAddrV4> = self.known.iter().map(|k| k.address).collect();
        for address in addresses {
            self.close_session_only(address, reactor);
            connector.remove_endpoint(address, reactor);
        }
        self.known.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
