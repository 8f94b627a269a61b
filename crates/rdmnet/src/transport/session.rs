// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One established TCP connection to a peer: socket, outbound queue,
//! health check and inbound decoder, with a single close path.
//!
//! Construction requires a connected socket. Setup order matters and so
//! does teardown: the health check is dismantled before the queue, and the
//! queue before the socket, because the heartbeat timer may try to enqueue
//! when it fires.

use std::io;
use std::net::SocketAddrV4;

use log::{info, warn};
use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::acn::codec::{FrameDecoder, Message, MessageBuilder, ReadStatus};
use crate::config::SessionConfig;
use crate::rt::{Reactor, TimerId};
use crate::transport::health::{HealthCheckedConnection, HealthEvent};
use crate::transport::queue::{DrainResult, MessageQueue, SendResult};
use crate::{Error, Result};

/// Outcome of driving a session timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Nothing for the owner to do.
    Continue,

    /// The receive deadline expired; the owner should close the session
    /// and let its reconnect logic recover.
    Unhealthy,
}

/// Everything a read pass produced.
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// Decoded application messages (heartbeats are consumed internally).
    pub messages: Vec<Message>,

    /// The peer closed the connection.
    pub closed: bool,
}

/// A live session to one peer.
///
/// Either all parts are present and the session is live, or `close` has
/// run and the session only waits to be dropped.
#[derive(Debug)]
pub struct PeerSession {
    stream: TcpStream,
    token: Token,
    peer: SocketAddrV4,
    queue: MessageQueue,
    health: HealthCheckedConnection,
    decoder: FrameDecoder,
    heartbeat_frame: Vec<u8>,
    want_writable: bool,
    closed: bool,
}

impl PeerSession {
    /// Bind a connected socket into a session.
    ///
    /// Registers read interest, arms the health check and sends the first
    /// heartbeat. If the queue refuses that heartbeat the session is torn
    /// down again and [`Error::SessionDeadOnArrival`] is returned.
    pub fn establish(
        mut stream: TcpStream,
        peer: SocketAddrV4,
        builder: &MessageBuilder,
        config: &SessionConfig,
        reactor: &mut Reactor,
    ) -> Result<Self> {
        let token = reactor.next_token();
        reactor.register(&mut stream, token, Interest::READABLE)?;

        let mut queue = MessageQueue::new(config.max_queue_bytes);
        let mut health = HealthCheckedConnection::new(config, reactor);
        let heartbeat_frame = builder.build_heartbeat();

        // The first heartbeat marks this as the live connection.
        if !health.setup(&heartbeat_frame, &mut queue) {
            warn!("failed to set up health check for {}, dropping session", peer);
            health.teardown(reactor);
            let _ = reactor.deregister(&mut stream);
            return Err(Error::SessionDeadOnArrival);
        }

        let mut session = Self {
            stream,
            token,
            peer,
            queue,
            health,
            decoder: FrameDecoder::new(config.max_message_size),
            heartbeat_frame,
            want_writable: false,
            closed: false,
        };
        if let Err(e) = session.flush(reactor) {
            session.close(reactor);
            return Err(e.into());
        }
        Ok(session)
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when the outbound queue would refuse a frame right now.
    pub fn queue_limit_reached(&self) -> bool {
        self.queue.limit_reached()
    }

    // ========================================================================
    // Send path
    // ========================================================================

    /// Queue a frame and push it toward the socket.
    ///
    /// `Ok(Dropped)` is backpressure; `Err` means the connection broke and
    /// the owner should close the session.
    pub fn send(&mut self, frame: &[u8], reactor: &mut Reactor) -> io::Result<SendResult> {
        if self.closed {
            return Ok(SendResult::Dropped);
        }
        let result = self.queue.send(frame);
        if result == SendResult::Accepted {
            self.flush(reactor)?;
        }
        Ok(result)
    }

    /// Drive a writable readiness event.
    pub fn on_writable(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        self.flush(reactor)
    }

    /// Drain the queue and keep the writable registration discipline:
    /// interest is held only while bytes remain buffered.
    fn flush(&mut self, reactor: &mut Reactor) -> io::Result<()> {
        let outcome = self.queue.drain(&mut self.stream)?;
        match outcome {
            DrainResult::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer closed during write",
                ))
            }
            DrainResult::Blocked => {
                if !self.want_writable {
                    self.want_writable = true;
                    reactor.reregister(
                        &mut self.stream,
                        self.token,
                        Interest::READABLE | Interest::WRITABLE,
                    )?;
                }
            }
            DrainResult::Drained => {
                if self.want_writable {
                    self.want_writable = false;
                    reactor.reregister(&mut self.stream, self.token, Interest::READABLE)?;
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    /// Drive a readable readiness event: pull bytes, decode frames, refresh
    /// liveness.
    ///
    /// `Err` means the stream is unrecoverable (I/O failure or framing
    /// violation) and the owner should close the session.
    pub fn on_readable(&mut self, reactor: &mut Reactor) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        if self.closed {
            return Ok(outcome);
        }

        match self.decoder.read_from(&mut self.stream) {
            Ok(ReadStatus::Open) => {}
            Ok(ReadStatus::Eof) => outcome.closed = true,
            Err(e) => return Err(e),
        }

        loop {
            match self.decoder.next_message() {
                Ok(Some(message)) => {
                    // Every valid frame counts as liveness.
                    self.health.heartbeat_received(reactor);
                    if !message.is_heartbeat() {
                        outcome.messages.push(message);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("bad TCP stream from {}: {}", self.peer, e);
                    return Err(io::Error::new(io::ErrorKind::InvalidData, e));
                }
            }
        }
        Ok(outcome)
    }

    // ========================================================================
    // Timers
    // ========================================================================

    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.health.owns_timer(id)
    }

    /// Drive a health-check timer.
    pub fn handle_timer(&mut self, id: TimerId, reactor: &mut Reactor) -> io::Result<SessionEvent> {
        if self.closed {
            return Ok(SessionEvent::Continue);
        }
        match self
            .health
            .handle_timer(id, &self.heartbeat_frame, &mut self.queue)
        {
            HealthEvent::HeartbeatSent => {
                self.flush(reactor)?;
                Ok(SessionEvent::Continue)
            }
            HealthEvent::HeartbeatDropped => Ok(SessionEvent::Continue),
            HealthEvent::Unhealthy => Ok(SessionEvent::Unhealthy),
        }
    }

    // ========================================================================
    // Close path
    // ========================================================================

    /// Tear the session down. Idempotent.
    ///
    /// Order: health check (cancels timers that might enqueue), then the
    /// queue, then the socket.
    pub fn close(&mut self, reactor: &mut Reactor) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing TCP connection to {}", self.peer);

        self.health.teardown(reactor);
        self.queue.clear();
        let _ = reactor.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

// ============================================================================
// Tests
// ============================================================================
