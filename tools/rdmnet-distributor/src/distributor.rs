// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The distributor node loop: advertise, accept, health-check, ack.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::{debug, info, warn};
use mio::net::TcpListener;
use mio::{Interest, Token};
use socket2::{Domain, Protocol, Socket, Type};

use rdmnet::acn::codec::{Cid, Message, MessageBuilder};
use rdmnet::acn::constants::{SC_E133_ACK, VECTOR_FRAMING_RDMNET};
use rdmnet::config::SessionConfig;
use rdmnet::discovery::{DiscoveryAgent, MdnsDiscoveryAgent};
use rdmnet::rt::{Reactor, ReactorEvent, TimerId};
use rdmnet::transport::session::{PeerSession, SessionEvent};
use rdmnet::{DistributorEntry, Error, Result};

pub struct DistributorOptions {
    pub listen_ip: Ipv4Addr,
    pub listen_port: u16,
    pub listen_backlog: u16,
    pub scope: String,
    pub terminate_after: Option<Duration>,
}

pub struct Distributor {
    options: DistributorOptions,
    listen_addr: SocketAddrV4,

    reactor: Reactor,
    discovery: MdnsDiscoveryAgent,
    builder: MessageBuilder,

    listener: TcpListener,
    listener_token: Token,
    sessions: Vec<PeerSession>,
    terminate_timer: Option<TimerId>,
}

impl Distributor {
    pub fn new(options: DistributorOptions) -> Result<Self> {
        let listen_addr = SocketAddrV4::new(options.listen_ip, options.listen_port);
        let mut reactor = Reactor::new()?;

        let mut listener = bind_listener(listen_addr, options.listen_backlog)
            .map_err(|e| Error::BindFailed(format!("{}: {}", listen_addr, e)))?;
        let listener_token = reactor.next_token();
        reactor.register(&mut listener, listener_token, Interest::READABLE)?;

        let discovery = MdnsDiscoveryAgent::new(&options.scope, Some(reactor.handle()));

        Ok(Self {
            discovery,
            builder: MessageBuilder::new(Cid::generate(), "E1.33 Distributor"),
            listener,
            listener_token,
            sessions: Vec::new(),
            terminate_timer: None,
            reactor,
            options,
            listen_addr,
        })
    }

    pub fn run(&mut self) -> Result<()> {
        info!("listening on {}", self.listen_addr);
        self.discovery.start()?;
        self.discovery.register_distributor(DistributorEntry {
            address: self.listen_addr,
            scope: self.options.scope.clone(),
            ..DistributorEntry::default()
        });

        if let Some(after) = self.options.terminate_after {
            self.terminate_timer = Some(self.reactor.schedule_once(after));
        }

        let mut events = Vec::new();
        while self.reactor.running() {
            self.reactor.poll(&mut events, None)?;
            for event in events.drain(..) {
                self.dispatch(event);
            }
        }

        for session in &mut self.sessions {
            session.close(&mut self.reactor);
        }
        self.sessions.clear();
        self.discovery.deregister(self.listen_addr);
        self.discovery.stop();
        Ok(())
    }

    fn dispatch(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::Readable(token) if token == self.listener_token => {
                self.accept_new_connections();
            }
            ReactorEvent::Readable(token) => self.session_readable(token),
            ReactorEvent::Writable(token) => {
                if let Some(session) = self.sessions.iter_mut().find(|s| s.token() == token) {
                    if session.on_writable(&mut self.reactor).is_err() {
                        let peer = session.peer_addr();
                        self.close_session(peer);
                    }
                }
            }
            ReactorEvent::Timer(id) => self.dispatch_timer(id),
        }
    }

    fn dispatch_timer(&mut self, id: TimerId) {
        if self.terminate_timer == Some(id) {
            info!("terminate-after expired, shutting down");
            self.reactor.terminate();
            return;
        }
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
                        &SessionConfig::default(),
                        &mut self.reactor,
                    ) {
                        Ok(session) => {
                            info!("new connection from {}", peer);
                            self.sessions.push(session);
                        }
                        Err(e) => warn!("failed to set up heartbeats for {}: {}", peer, e),
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

    fn session_readable(&mut self, token: Token) {
        let Some(index) = self.sessions.iter().position(|s| s.token() == token) else {
            return;
        };
        let peer = self.sessions[index].peer_addr();
        match self.sessions[index].on_readable(&mut self.reactor) {
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
        if message.framing_vector != VECTOR_FRAMING_RDMNET {
            debug!(
                "ignoring message with framing vector {:#x} from {}",
                message.framing_vector, peer
            );
            return;
        }
        let ack =
            self.builder
                .build_status(message.sequence, message.endpoint, SC_E133_ACK, "OK");
        if let Some(session) = self.sessions.get_mut(index) {
            let _ = session.send(&ack, &mut self.reactor);
        }
    }

    fn close_session(&mut self, peer: SocketAddrV4) {
        if let Some(index) = self.sessions.iter().position(|s| s.peer_addr() == peer) {
            self.sessions[index].close(&mut self.reactor);
            self.sessions.remove(index);
        }
    }
}

fn bind_listener(addr: SocketAddrV4, backlog: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(i32::from(backlog))?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(std_listener))
}
