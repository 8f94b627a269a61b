// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller-to-controller gossip over real loopback sessions: a device
//! registers with controller B, controller A learns it via FETCH_DEVICES,
//! and loses it again when the session to B closes.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Interest, Token};

use rdmnet::acn::codec::{Cid, MessageBuilder};
use rdmnet::acn::controller::{self, ControllerMessage, DeviceTuple};
use rdmnet::config::MeshConfig;
use rdmnet::core::uid::RdmUid;
use rdmnet::mesh::{ControllerMesh, MeshAction};
use rdmnet::rt::{Reactor, ReactorEvent};
use rdmnet::transport::connector::{ConnectOutcome, TcpConnector};
use rdmnet::transport::session::PeerSession;

/// Controller A: the mesh under test (outbound side).
struct MeshNode {
    reactor: Reactor,
    connector: TcpConnector,
    mesh: ControllerMesh,
    peers: Vec<SocketAddrV4>,
}

impl MeshNode {
    fn new(listen: SocketAddrV4) -> Self {
        let config = MeshConfig::default();
        Self {
            reactor: Reactor::new().unwrap(),
            connector: TcpConnector::new(config.connect_timeout),
            mesh: ControllerMesh::new(
                listen,
                MessageBuilder::new(Cid::from_bytes([0xA; 16]), "controller A"),
                config,
            ),
            peers: Vec::new(),
        }
    }

    fn pump(&mut self) {
        let mut events = Vec::new();
        self.reactor
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        for event in events {
            match event {
                ReactorEvent::Readable(token) => {
                    if self.connector.owns_token(token) {
                        self.route_connect(token);
                    } else if self.mesh.owns_token(token) {
                        self.mesh
                            .on_readable(token, &mut self.connector, &mut self.reactor);
                    }
                }
                ReactorEvent::Writable(token) => {
                    if self.connector.owns_token(token) {
                        self.route_connect(token);
                    } else if self.mesh.owns_token(token) {
                        self.mesh
                            .on_writable(token, &mut self.connector, &mut self.reactor);
                    }
                }
                ReactorEvent::Timer(id) => {
                    if self.connector.owns_timer(id) {
                        if let Some(result) = self.connector.handle_timer(id, &mut self.reactor) {
                            if let ConnectOutcome::Connected(stream) = result.outcome {
                                self.mesh
                                    .on_connected(result.endpoint, stream, &mut self.reactor);
                            }
                        }
                    } else if self.mesh.owns_timer(id) {
                        let action =
                            self.mesh
                                .handle_timer(id, &mut self.connector, &mut self.reactor);
                        if action == MeshAction::NeedPeerRefresh {
                            let peers = self.peers.clone();
                            self.mesh
                                .refresh_peers(&peers, &mut self.connector, &mut self.reactor);
                        }
                    }
                }
            }
        }
    }

    fn route_connect(&mut self, token: Token) {
        if let Some(result) = self.connector.handle_event(token, &mut self.reactor) {
            if let ConnectOutcome::Connected(stream) = result.outcome {
                self.mesh
                    .on_connected(result.endpoint, stream, &mut self.reactor);
            }
        }
    }
}

/// Controller B: accept side, the way a controller node wires inbound
/// connections (peer controllers and devices use the same path).
struct AcceptNode {
    reactor: Reactor,
    mesh: ControllerMesh,
    listener: TcpListener,
    listener_token: Token,
    addr: SocketAddrV4,
    sessions: Vec<PeerSession>,
    builder: MessageBuilder,
}

impl AcceptNode {
    fn bind() -> Self {
        let mut reactor = Reactor::new().unwrap();
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = match std_listener.local_addr().unwrap() {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => unreachable!(),
        };
        let mut listener = TcpListener::from_std(std_listener);
        let listener_token = reactor.next_token();
        reactor
            .register(&mut listener, listener_token, Interest::READABLE)
            .unwrap();

        let config = MeshConfig::default();
        let builder = MessageBuilder::new(Cid::from_bytes([0xB; 16]), "controller B");
        Self {
            mesh: ControllerMesh::new(addr, builder.clone(), config),
            reactor,
            listener,
            listener_token,
            addr,
            sessions: Vec::new(),
            builder,
        }
    }

    fn pump(&mut self) {
        let mut events = Vec::new();
        self.reactor
            .poll(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        for event in events {
            match event {
                ReactorEvent::Readable(token) if token == self.listener_token => {
                    self.accept_all();
                }
                ReactorEvent::Readable(token) => self.session_readable(token),
                ReactorEvent::Writable(token) => {
                    if let Some(session) =
                        self.sessions.iter_mut().find(|s| s.token() == token)
                    {
                        let _ = session.on_writable(&mut self.reactor);
                    }
                }
                ReactorEvent::Timer(_) => {}
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let peer = match peer {
                        SocketAddr::V4(v4) => v4,
                        SocketAddr::V6(_) => continue,
                    };
                    let session = PeerSession::establish(
                        stream,
                        peer,
                        &self.builder,
                        &MeshConfig::default().session,
                        &mut self.reactor,
                    )
                    .expect("inbound session");
                    self.sessions.push(session);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => panic!("accept failed: {}", e),
            }
        }
    }

    fn session_readable(&mut self, token: Token) {
        let Some(index) = self.sessions.iter().position(|s| s.token() == token) else {
            return;
        };
        let outcome = self.sessions[index].on_readable(&mut self.reactor);
        let peer = self.sessions[index].peer_addr();
        match outcome {
            Ok(outcome) => {
                for message in &outcome.messages {
                    let reply = self.mesh.apply_controller_message(
                        peer,
                        message,
                        &mut self.reactor,
                    );
                    if let Some(reply) = reply {
                        let frame = self
                            .builder
                            .build_controller(&controller::encode(&reply));
                        let _ = self.sessions[index].send(&frame, &mut self.reactor);
                    }
                }
                if outcome.closed {
                    self.sessions[index].close(&mut self.reactor);
                    self.sessions.remove(index);
                    self.mesh.device_session_closed(peer, &mut self.reactor);
                }
            }
            Err(_) => {
                self.sessions[index].close(&mut self.reactor);
                self.sessions.remove(index);
                self.mesh.device_session_closed(peer, &mut self.reactor);
            }
        }
    }

}

fn pump_both(a: &mut MeshNode, b: &mut AcceptNode, window: Duration) {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        a.pump();
        b.pump();
    }
}

fn pump_until<F: FnMut(&MeshNode, &AcceptNode) -> bool>(
    a: &mut MeshNode,
    b: &mut AcceptNode,
    mut done: F,
    window: Duration,
) -> bool {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if done(a, b) {
            return true;
        }
        a.pump();
        b.pump();
    }
    done(a, b)
}

fn device_uid() -> RdmUid {
    RdmUid::new(0x7a70, 1)
}

#[test]
fn gossip_fetch_and_forget_on_close() {
    let mut b = AcceptNode::bind();
    let mut a = MeshNode::new(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1));

    // A device registers with controller B over a raw TCP client.
    let device_builder = MessageBuilder::new(Cid::from_bytes([0xD; 16]), "device");
    let mut device = std::net::TcpStream::connect(b.addr).unwrap();
    let registration = ControllerMessage::DeviceRegistration(DeviceTuple::new(
        "192.0.2.10:40000".parse().unwrap(),
        device_uid(),
    ));
    device
        .write_all(&device_builder.build_controller(&controller::encode(&registration)))
        .unwrap();
    device.flush().unwrap();

    assert!(
        pump_until(
            &mut a,
            &mut b,
            |_, b| b.mesh.registry().get(&device_uid()).is_some(),
            Duration::from_secs(5)
        ),
        "controller B never learned the local device"
    );
    assert!(b.mesh.registry().get(&device_uid()).unwrap().local);

    // Controller A meshes with B; the FETCH_DEVICES it sends on connect
    // brings back B's local device list.
    a.peers = vec![b.addr];
    let peers = a.peers.clone();
    a.mesh.start(&mut a.reactor);
    a.mesh
        .refresh_peers(&peers, &mut a.connector, &mut a.reactor);

    assert!(
        pump_until(
            &mut a,
            &mut b,
            |a, _| a.mesh.registry().get(&device_uid()).is_some(),
            Duration::from_secs(5)
        ),
        "controller A never learned the device via gossip"
    );
    let learned = *a.mesh.registry().get(&device_uid()).unwrap();
    assert!(!learned.local);
    assert_eq!(learned.learned_via, b.addr);
    assert_eq!(learned.udp_endpoint, "192.0.2.10:40000".parse().unwrap());

    // B drops the mesh session; A forgets everything learned via B.
    for session in &mut b.sessions {
        session.close(&mut b.reactor);
    }
    b.sessions.clear();

    assert!(
        pump_until(
            &mut a,
            &mut b,
            |a, _| a.mesh.registry().get(&device_uid()).is_none(),
            Duration::from_secs(5)
        ),
        "controller A kept entries learned via a closed session"
    );
}

#[test]
fn device_close_releases_local_entry() {
    let mut b = AcceptNode::bind();
    let mut a = MeshNode::new(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 1));

    let device_builder = MessageBuilder::new(Cid::from_bytes([0xD; 16]), "device");
    let mut device = std::net::TcpStream::connect(b.addr).unwrap();
    let registration = ControllerMessage::DeviceRegistration(DeviceTuple::new(
        "192.0.2.10:40000".parse().unwrap(),
        device_uid(),
    ));
    device
        .write_all(&device_builder.build_controller(&controller::encode(&registration)))
        .unwrap();
    device.flush().unwrap();

    assert!(pump_until(
        &mut a,
        &mut b,
        |_, b| b.mesh.registry().get(&device_uid()).is_some(),
        Duration::from_secs(5)
    ));

    // The device disappears; its TCP session EOFs and B releases the UID.
    drop(device);
    assert!(
        pump_until(
            &mut a,
            &mut b,
            |_, b| b.mesh.registry().get(&device_uid()).is_none(),
            Duration::from_secs(5)
        ),
        "controller B kept a device whose session closed"
    );

    pump_both(&mut a, &mut b, Duration::from_millis(50));
}
