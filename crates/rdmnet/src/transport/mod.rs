// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session-layer transport: outbound queueing, liveness, connecting and
//! session composition.
//!
//! - [`queue`] - bounded, back-pressured writer over one descriptor
//! - [`health`] - bidirectional heartbeat liveness
//! - [`connector`] - per-endpoint connect attempts with backoff
//! - [`session`] - one TCP socket bound to a queue, a health check and a
//!   frame decoder, with a single close path

pub mod connector;
pub mod health;
pub mod queue;
pub mod session;

pub use connector::{AttemptId, BackoffPolicy, ConnectOutcome, ConnectResult, TcpConnector};
pub use health::{HealthCheckedConnection, HealthEvent};
pub use queue::{DrainResult, MessageQueue, SendResult};
pub use session::{PeerSession, SessionEvent};

// ============================================================================
// Test mock stream
// ============================================================================

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    /// Mock byte stream for testing queue and decoder behavior.
    ///
    /// Provides buffered read data, write capture, a cap on how many bytes
    /// each `write` accepts (to force partial writes) and `WouldBlock`
    /// injection.
    #[derive(Debug, Default)]
    pub struct MockStream {
        /// Data available for reading.
        read_data: VecDeque<u8>,

        /// Data written (for verification).
        written: Vec<u8>,

        /// Maximum bytes accepted per write call; `None` = unlimited.
        write_cap: Option<usize>,

        /// Number of writes to refuse with `WouldBlock` before accepting.
        block_writes: usize,

        /// When true, writes return `Ok(0)` (peer closed).
        closed: bool,
    }

    impl MockStream {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn feed_read_data(&mut self, data: &[u8]) {
            self.read_data.extend(data);
        }

        pub fn written(&self) -> &[u8] {
            &self.written
        }

        pub fn set_write_cap(&mut self, cap: usize) {
            self.write_cap = Some(cap);
        }

        pub fn block_next_writes(&mut self, count: usize) {
            self.block_writes = count;
        }

        pub fn close(&mut self) {
            self.closed = true;
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.read_data.is_empty() {
                if self.closed {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.read_data.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.read_data.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.closed {
                return Ok(0);
            }
            if self.block_writes > 0 {
                self.block_writes -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = match self.write_cap {
                Some(cap) => buf.len().min(cap),
                None => buf.len(),
            };
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
