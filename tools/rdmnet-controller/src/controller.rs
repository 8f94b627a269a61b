// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The controller node loop.
//!
//! Inbound TCP connections all land in the same session table, whether
//! they come from devices or from peer controllers dialing us; what a
//! session *is* only matters per message. Outbound mesh sessions (we dial
//! the peer) live inside [`ControllerMesh`].

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Instant;

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use rdmnet::acn::codec::{Cid, Message, MessageBuilder};
use rdmnet::acn::constants::{
    SC_E133_ACK, VECTOR_FRAMING_CONTROLLER, VECTOR_FRAMING_RDMNET,
};
use rdmnet::acn::controller;
use rdmnet::config::MeshConfig;
use rdmnet::discovery::{DiscoveryAgent, MdnsDiscoveryAgent};
use rdmnet::mesh::{ControllerMesh, MeshAction};
use rdmnet::rt::{Reactor, ReactorEvent, TimerId};
use rdmnet::transport::connector::{ConnectOutcome, TcpConnector};
use rdmnet::transport::session::{PeerSession, SessionEvent};
use rdmnet::{ControllerEntry, Error, Result};

pub struct ControllerOptions {
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub listen_backlog: u16,
    pub priority: u8,
    pub scope: String,
    pub expected_devices: usize,
    pub stop_after_all_devices: bool,
}

pub struct Controller {
    options: ControllerOptions,
    listen_addr: SocketAddrV4,

    reactor: Reactor,
    connector: TcpConnector,
    mesh: ControllerMesh,
    discovery: MdnsDiscoveryAgent,
    builder: MessageBuilder,

    listener: TcpListener,
    listener_token: Token,
    #[cfg(unix)]
    stdin_token: Token,

    /// Inbound sessions: devices and peer controllers that dialed us.
    sessions: Vec<PeerSession>,

    start_time: Instant,
    all_devices_reported: bool,
}

impl Controller {
    pub fn new(options: ControllerOptions) -> Result<Self> {
        let listen_addr = SocketAddrV4::new(options.listen_ip, options.listen_port);
        let mut reactor = Reactor::new()?;

        let mut listener = bind_listener(listen_addr, options.listen_backlog)
            .map_err(|e| Error::BindFailed(format!("{}: {}", listen_addr, e)))?;
        let listener_token = reactor.next_token();
        reactor.register(&mut listener, listener_token, Interest::READABLE)?;

        #[cfg(unix)]
        let stdin_token = {
            use std::os::unix::io::AsRawFd;
            let fd = std::io::stdin().as_raw_fd();
            let token = reactor.next_token();
            reactor.register(&mut mio::unix::SourceFd(&fd), token, Interest::READABLE)?;
            token
        };

        let builder = MessageBuilder::new(Cid::generate(), "E1.33 Controller");
        let config = MeshConfig::default();
        let discovery = MdnsDiscoveryAgent::new(&options.scope, Some(reactor.handle()));

        Ok(Self {
            connector: TcpConnector::new(config.connect_timeout),
            mesh: ControllerMesh::new(listen_addr, builder.clone(), config),
            discovery,
            builder,
            listener,
            listener_token,
            #[cfg(unix)]
            stdin_token,
            sessions: Vec::new(),
            start_time: Instant::now(),
            all_devices_reported: false,
            reactor,
            options,
            listen_addr,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        info!("listening on {}", self.listen_addr);
        self.discovery.start()?;
        self.discovery.register_controller(ControllerEntry {
            address: self.listen_addr,
            priority: self.options.priority,
            scope: self.options.scope.clone(),
            ..ControllerEntry::default()
        });

        self.mesh.start(&mut self.reactor);
        self.refresh_mesh_peers();
        self.show_help();

        let mut events = Vec::new();
        while self.reactor.running() {
            self.reactor.poll(&mut events, None)?;
            for event in events.drain(..) {
                self.dispatch(event);
            }
        }

        self.mesh.stop(&mut self.connector, &mut self.reactor);
        for session in &mut self.sessions {
            session.close(&mut self.reactor);
        }
        self.sessions.clear();
        self.discovery.deregister(self.listen_addr);
        self.discovery.stop();
        Ok(())
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    fn dispatch(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Readable(token) if token == self.listener_token => {
                self.accept_new_connections();
            }
            #[cfg(unix)]
            ReactorEvent::Readable(token) if token == self.stdin_token => {
                self.handle_input();
            }
            ReactorEvent::Readable(token) => {
                if self.connector.owns_token(token) {
                    self.route_connect_event(token);
                } else if self.mesh.owns_token(token) {
                    self.mesh
                        .on_readable(token, &mut self.connector, &mut self.reactor);
                } else {
                    self.session_readable(token);
                }
            }
            ReactorEvent::Writable(token) => {
                if self.connector.owns_token(token) {
                    self.route_connect_event(token);
                } else if self.mesh.owns_token(token) {
                    self.mesh
                        .on_writable(token, &mut self.connector, &mut self.reactor);
                } else if let Some(session) =
                    self.sessions.iter_mut().find(|s| s.token() == token)
                {
                    if session.on_writable(&mut self.reactor).is_err() {
                        let peer = session.peer_addr();
                        self.close_session(peer);
                    }
                }
            }
            ReactorEvent::Timer(id) => self.dispatch_timer(id),
        }
    }

    fn route_connect_event(&mut self, token: Token) {
        if let Some(result) = self.connector.handle_event(token, &mut self.reactor) {
            if let ConnectOutcome::Connected(stream) = result.outcome {
                self.mesh
                    .on_connected(result.endpoint, stream, &mut self.reactor);
            }
        }
    }

    fn dispatch_timer(&mut self, id: TimerId) {
        if self.connector.owns_timer(id) {
            if let Some(result) = self.connector.handle_timer(id, &mut self.reactor) {
                if let ConnectOutcome::Connected(stream) = result.outcome {
                    self.mesh
                        .on_connected(result.endpoint, stream, &mut self.reactor);
                }
            }
            return;
        }
        if self.mesh.owns_timer(id) {
            let action = self
                .mesh
                .handle_timer(id, &mut self.connector, &mut self.reactor);
            if action == MeshAction::NeedPeerRefresh {
                self.refresh_mesh_peers();
            }
            return;
        }

        // Health timers of inbound sessions.
        let Some(index) = self.sessions.iter().position(|s| s.owns_timer(id)) else {
            return;
        };
        let peer = self.sessions[index].peer_addr();
        match self.sessions[index].handle_timer(id, &mut self.reactor) {
            Ok(SessionEvent::Continue) => {}
            Ok(SessionEvent::Unhealthy) => {
                info!("connection to {} went unhealthy", peer);
                self.close_session(peer);
            }
            Err(e) => {
                warn!("connection to {} failed: {}", peer, e);
                self.close_session(peer);
            }
        }
    }

    // ========================================================================
    // Inbound sessions
    // ========================================================================

    fn accept_new_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let SocketAddr::V4(peer) = peer else {
                        warn!("dropping non-IPv4 connection from {}", peer);
                        continue;
                    };
                    match PeerSession::establish(
                        stream,
                        peer,
                        &self.builder,
                        &MeshConfig::default().session,
                        &mut self.reactor,
                    ) {
                        Ok(session) => {
                            debug!("received new TCP connection from {}", peer);
                            self.sessions.push(session);
                            self.check_expected_devices();
                        }
                        Err(e) => {
                            warn!("failed to set up heartbeats for {}: {}", peer, e);
                        }
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    break;
                }
            }
        }
    }

    fn check_expected_devices(&mut self) {
        if self.all_devices_reported || self.sessions.len() < self.options.expected_devices {
            return;
        }
        self.all_devices_reported = true;
        info!(
            "{} connected in {:?}",
            self.options.expected_devices,
            self.start_time.elapsed()
        );
        if self.options.stop_after_all_devices {
            self.reactor.terminate();
        }
    }

    fn session_readable(&mut self, token: Token) {
        let Some(index) = self.sessions.iter().position(|s| s.token() == token) else {
            return;
        };
        let peer = self.sessions[index].peer_addr();
        let outcome = self.sessions[index].on_readable(&mut self.reactor);

        match outcome {
            Ok(outcome) => {
                for message in &outcome.messages {
                    self.handle_session_message(index, peer, message);
                }
                if outcome.closed {
                    info!("connection to {} was closed", peer);
                    self.close_session(peer);
                }
            }
            Err(e) => {
                warn!("TCP stream from {} is bad: {}", peer, e);
                self.close_session(peer);
            }
        }
    }

    fn handle_session_message(&mut self, index: usize, peer: SocketAddrV4, message: &Message) {
        match message.framing_vector {
            VECTOR_FRAMING_RDMNET => {
                // Status responses from devices are acked per sequence.
                let ack = self.builder.build_status(
                    message.sequence,
                    message.endpoint,
                    SC_E133_ACK,
                    "OK",
                );
                if let Some(session) = self.sessions.get_mut(index) {
                    let _ = session.send(&ack, &mut self.reactor);
                }
            }
            VECTOR_FRAMING_CONTROLLER => {
                let reply =
                    self.mesh
                        .apply_controller_message(peer, message, &mut self.reactor);
                if let Some(reply) = reply {
                    let frame = self
                        .builder
                        .build_controller(&controller::encode(&reply));
                    if let Some(session) = self.sessions.get_mut(index) {
                        let _ = session.send(&frame, &mut self.reactor);
                    }
                }
            }
            other => {
                debug!("ignoring message with framing vector {:#x} from {}", other, peer);
            }
        }
    }

    fn close_session(&mut self, peer: SocketAddrV4) {
        if let Some(index) = self.sessions.iter().position(|s| s.peer_addr() == peer) {
            self.sessions[index].close(&mut self.reactor);
            self.sessions.remove(index);
        }
        // Drop this peer's devices; local ones are gossiped as released.
        self.mesh.device_session_closed(peer, &mut self.reactor);
    }

    fn refresh_mesh_peers(&mut self) {
        let mut entries = Vec::new();
        self.discovery.list_controllers(&mut entries);
        let peers: Vec<SocketAddrV4> = entries.iter().map(|e| e.address).collect();
        self.mesh
            .refresh_peers(&peers, &mut self.connector, &mut self.reactor);
    }

    // ========================================================================
    // Operator console
    // ========================================================================

    #[cfg(unix)]
    fn handle_input(&mut self) {
        let mut byte = [0u8; 1];
        if std::io::stdin().read(&mut byte).unwrap_or(0) == 0 {
            return;
        }
        match byte[0] {
            b'c' => self.show_controllers(),
            b'd' => self.show_devices(),
            b'h' => self.show_help(),
            b's' => self.show_summary(),
            b'u' => self.show_uid_map(),
            b'q' => self.reactor.terminate(),
            _ => {}
        }
    }

    fn show_help(&self) {
        println!("------------------");
        println!("c - Show peer controllers.");
        println!("d - Show connected devices.");
        println!("h - Show this message.");
        println!("s - Show summary.");
        println!("u - Show UID map.");
        println!("q - Quit.");
        println!("------------------");
    }

    fn show_controllers(&self) {
        println!("------------------");
        for (address, connected) in self.mesh.peer_summary() {
            println!(
                "{} : {}",
                address,
                if connected { "connected" } else { "disconnected" }
            );
        }
        println!("------------------");
    }

    fn show_devices(&self) {
        println!("------------------");
        for session in &self.sessions {
            println!("{}", session.peer_addr());
        }
        println!("------------------");
    }

    fn show_summary(&self) {
        println!("------------------");
        println!(
            "{} controllers connected",
            self.mesh.connected_controller_count()
        );
        println!("{} sessions connected", self.sessions.len());
        println!("{} known UIDs", self.mesh.registry().len());
        println!("------------------");
    }

    fn show_uid_map(&self) {
        println!("------------------");
        for (uid, entry) in self.mesh.registry().iter() {
            println!(
                "{} -> {}, via {}{}",
                uid,
                entry.udp_endpoint,
                entry.learned_via,
                if entry.local { " (local)" } else { "" }
            );
        }
        println!("------------------");
    }
}

/// Bind the listen socket with an explicit backlog.
fn bind_listener(addr: SocketAddrV4, backlog: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(i32::from(backlog))?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
