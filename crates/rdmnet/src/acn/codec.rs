// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Builder and incremental decoder for the E1.33 TCP stream.
//!
//! TCP is a stream protocol without message boundaries; the ACN preamble
//! plus the root PDU's length field delimit messages. The decoder keeps
//! partial-read state so it can be fed from a non-blocking socket in
//! arbitrary chunks.

use std::io::{self, Read};
use std::time::{SystemTime, UNIX_EPOCH};

use super::constants::*;

/// Default maximum decoded message size (matches the outbound queue cap).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Smallest possible root PDU: flags+length, vector, CID.
const MIN_ROOT_PDU: usize = PDU_FLAGS_LENGTH_SIZE + 4 + CID_LENGTH;

/// Smallest possible E1.33 PDU: flags+length, vector, sequence, endpoint,
/// reserved.
const MIN_E133_PDU: usize = PDU_FLAGS_LENGTH_SIZE + 4 + 4 + 2 + 1;

// ============================================================================
// CID
// ============================================================================

/// An ACN component identifier: 16 opaque bytes identifying the sender.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Cid([u8; CID_LENGTH]);

impl Cid {
    /// Generate a process-unique CID.
    ///
    /// Mixes the clock and the process id through splitmix64; uniqueness
    /// only needs to hold between live peers on one network segment.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut state = nanos ^ (u64::from(std::process::id()) << 32) ^ unique.rotate_left(17);
        let mut bytes = [0u8; CID_LENGTH];
        for chunk in bytes.chunks_mut(8) {
            state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = state;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^= z >> 31;
            chunk.copy_from_slice(&z.to_be_bytes()[..chunk.len()]);
        }
        Cid(bytes)
    }

    pub fn from_bytes(bytes: [u8; CID_LENGTH]) -> Self {
        Cid(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CID_LENGTH] {
        &self.0
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A decoded message from the TCP stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Root-layer vector ([`VECTOR_ROOT_E133`] or [`VECTOR_ROOT_NULL`]).
    pub root_vector: u32,

    /// Sender CID from the root layer.
    pub cid: [u8; CID_LENGTH],

    /// E1.33 framing vector; zero for heartbeats.
    pub framing_vector: u32,

    /// E1.33 sequence number; zero for heartbeats.
    pub sequence: u32,

    /// E1.33 endpoint id; zero for heartbeats.
    pub endpoint: u16,

    /// The E1.33 payload (RDM bytes, status PDU or controller sub-PDU).
    pub payload: Vec<u8>,
}

impl Message {
    /// Whether this is a null (heartbeat) PDU.
    pub fn is_heartbeat(&self) -> bool {
        self.root_vector == VECTOR_ROOT_NULL
    }
}

/// Parse a status PDU payload into `(status_code, description)`.
///
/// Returns `None` when the body is shorter than the code field.
pub fn parse_status(payload: &[u8]) -> Option<(u16, String)> {
    if payload.len() < 2 {
        return None;
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let description = String::from_utf8_lossy(&payload[2..]).into_owned();
    Some((code, description))
}

// ============================================================================
// Builder
// ============================================================================

/// Builds framed messages for one sender.
///
/// The builder owns the sender CID; every frame it produces carries it in
/// the root layer.
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    cid: Cid,
    source_name: String,
}

impl MessageBuilder {
    pub fn new(cid: Cid, source_name: &str) -> Self {
        Self {
            cid,
            source_name: source_name.to_string(),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    /// Human-readable sender name, used in log lines only.
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Frame an RDM payload under `VECTOR_FRAMING_RDMNET`.
    pub fn build_rdm(&self, sequence: u32, endpoint: u16, rdm_payload: &[u8]) -> Vec<u8> {
        self.build_root_e133(VECTOR_FRAMING_RDMNET, sequence, endpoint, rdm_payload)
    }

    /// Frame a status PDU (`u16` status code + description).
    pub fn build_status(
        &self,
        sequence: u32,
        endpoint: u16,
        status_code: u16,
        description: &str,
    ) -> Vec<u8> {
        let desc = description.as_bytes();
        let desc = &desc[..desc.len().min(MAX_STATUS_DESCRIPTION)];
        let mut payload = Vec::with_capacity(2 + desc.len());
        payload.extend_from_slice(&status_code.to_be_bytes());
        payload.extend_from_slice(desc);
        self.build_root_e133(VECTOR_FRAMING_STATUS, sequence, endpoint, &payload)
    }

    /// Frame an already-encoded controller sub-PDU.
    pub fn build_controller(&self, sub_pdu: &[u8]) -> Vec<u8> {
        self.build_root_e133(VECTOR_FRAMING_CONTROLLER, 0, 0, sub_pdu)
    }

    /// Build the null (heartbeat) PDU: a root layer with no E1.33 layer.
    pub fn build_heartbeat(&self) -> Vec<u8> {
        self.build_root(VECTOR_ROOT_NULL, &[])
    }

    /// Generic entry point matching the codec collaborator contract.
    pub fn build_root_e133(
        &self,
        framing_vector: u32,
        sequence: u32,
        endpoint: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let e133_len = MIN_E133_PDU + payload.len();
        let mut e133 = Vec::with_capacity(e133_len);
        push_flags_length(&mut e133, e133_len);
        e133.extend_from_slice(&framing_vector.to_be_bytes());
        e133.extend_from_slice(&sequence.to_be_bytes());
        e133.extend_from_slice(&endpoint.to_be_bytes());
        e133.push(0); // reserved
        e133.extend_from_slice(payload);
        self.build_root(VECTOR_ROOT_E133, &e133)
    }

    fn build_root(&self, root_vector: u32, data: &[u8]) -> Vec<u8> {
        let root_len = MIN_ROOT_PDU + data.len();
        debug_assert!(root_len <= 0x000f_ffff, "PDU exceeds 20-bit length");

        let mut frame = Vec::with_capacity(PREAMBLE_LENGTH + root_len);
        frame.extend_from_slice(&PREAMBLE_SIZE.to_be_bytes());
        frame.extend_from_slice(&POSTAMBLE_SIZE.to_be_bytes());
        frame.extend_from_slice(&ACN_PACKET_ID);
        push_flags_length(&mut frame, root_len);
        frame.extend_from_slice(&root_vector.to_be_bytes());
        frame.extend_from_slice(self.cid.as_bytes());
        frame.extend_from_slice(data);
        frame
    }
}

/// Append the 3-byte flags + 20-bit length field.
fn push_flags_length(buf: &mut Vec<u8>, length: usize) {
    buf.push(PDU_FLAGS | ((length >> 16) & 0x0f) as u8);
    buf.push(((length >> 8) & 0xff) as u8);
    buf.push((length & 0xff) as u8);
}

fn read_flags_length(bytes: &[u8]) -> Result<usize, CodecError> {
    if bytes[0] & 0xf0 != PDU_FLAGS {
        return Err(CodecError::BadFlags(bytes[0]));
    }
    Ok(((bytes[0] as usize & 0x0f) << 16) | ((bytes[1] as usize) << 8) | bytes[2] as usize)
}

// ============================================================================
// Decoder
// ============================================================================

/// Decode errors; any of these means the TCP stream is unrecoverable and
/// the session must be closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The preamble fields or packet identifier did not match.
    BadPreamble,
    /// A PDU flags nibble was not the expected value.
    BadFlags(u8),
    /// A PDU claimed a length beyond the configured maximum.
    Oversize { length: usize, max: usize },
    /// A PDU was too short to hold its mandatory header.
    Truncated,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::BadPreamble => write!(f, "bad ACN preamble"),
            CodecError::BadFlags(b) => write!(f, "bad PDU flags 0x{:02x}", b),
            CodecError::Oversize { length, max } => {
                write!(f, "PDU too large: {} bytes (max {})", length, max)
            }
            CodecError::Truncated => write!(f, "PDU shorter than its mandatory header"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Result of pulling bytes from the socket into the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The socket would block; more data may arrive later.
    Open,
    /// The peer closed the connection.
    Eof,
}

/// Incremental decoder for one TCP stream.
///
/// Feed it raw bytes (directly or via [`read_from`](Self::read_from)), then
/// call [`next_message`](Self::next_message) until it returns `None`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    pos: usize,
    max_size: usize,

    /// Statistics: messages decoded.
    messages_decoded: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            pos: 0,
            max_size,
            messages_decoded: 0,
        }
    }

    pub fn messages_decoded(&self) -> u64 {
        self.messages_decoded
    }

    /// Append raw bytes to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        // Compact once the consumed prefix dominates.
        if self.pos > 0 && self.pos > self.buf.len() / 2 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Drain a non-blocking reader into the buffer.
    pub fn read_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<ReadStatus> {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(ReadStatus::Eof),
                Ok(n) => self.feed(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(ReadStatus::Open),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Try to decode the next complete message.
    ///
    /// Returns `Ok(None)` when more bytes are needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        let header_len = PREAMBLE_LENGTH + PDU_FLAGS_LENGTH_SIZE;
        let available = &self.buf[self.pos..];
        if available.len() < header_len {
            return Ok(None);
        }

        if available[0..2] != PREAMBLE_SIZE.to_be_bytes()
            || available[2..4] != POSTAMBLE_SIZE.to_be_bytes()
            || available[4..16] != ACN_PACKET_ID
        {
            return Err(CodecError::BadPreamble);
        }

        let root_len = read_flags_length(&available[16..19])?;
        if root_len > self.max_size {
            return Err(CodecError::Oversize {
                length: root_len,
                max: self.max_size,
            });
        }
        if root_len < MIN_ROOT_PDU {
            return Err(CodecError::Truncated);
        }

        let total = PREAMBLE_LENGTH + root_len;
        if available.len() < total {
            return Ok(None);
        }

        let message = parse_root(&available[PREAMBLE_LENGTH..total])?;
        self.pos += total;
        self.messages_decoded += 1;
        Ok(Some(message))
    }
}

fn parse_root(root: &[u8]) -> Result<Message, CodecError> {
    // Caller has verified root.len() >= MIN_ROOT_PDU and == root_len.
    let root_vector = u32::from_be_bytes([root[3], root[4], root[5], root[6]]);
    let mut cid = [0u8; CID_LENGTH];
    cid.copy_from_slice(&root[7..7 + CID_LENGTH]);
    let data = &root[MIN_ROOT_PDU..];

    if root_vector == VECTOR_ROOT_NULL {
        return Ok(Message {
            root_vector,
            cid,
            framing_vector: 0,
            sequence: 0,
            endpoint: 0,
            payload: Vec::new(),
        });
    }

    if data.len() < MIN_E133_PDU {
        return Err(CodecError::Truncated);
    }
    let e133_len = read_flags_length(&data[0..3])?;
    if e133_len < MIN_E133_PDU || e133_len > data.len() {
        return Err(CodecError::Truncated);
    }

    let framing_vector = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
    let sequence = u32::from_be_bytes([data[7], data[8], data[9], data[10]]);
    let endpoint = u16::from_be_bytes([data[11], data[12]]);
    let payload = data[MIN_E133_PDU..e133_len].to_vec();

    Ok(Message {
        root_vector,
        cid,
        framing_vector,
        sequence,
        endpoint,
        payload,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> MessageBuilder {
        MessageBuilder::new(Cid::from_bytes([7u8; 16]), "test sender")
    }

    #[test]
    fn test_rdm_roundtrip() {
        let frame = builder().build_rdm(42, 3, b"rdm-bytes");
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);

        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.root_vector, VECTOR_ROOT_E133);
        assert_eq!(msg.framing_vector, VECTOR_FRAMING_RDMNET);
        assert_eq!(msg.sequence, 42);
        assert_eq!(msg.endpoint, 3);
        assert_eq!(msg.payload, b"rdm-bytes");
        assert_eq!(msg.cid, [7u8; 16]);
        assert!(!msg.is_heartbeat());

        assert_eq!(decoder.next_message().unwrap(), None);
    }

    #[test]
    fn test_status_roundtrip() {
        let frame = builder().build_status(9, 0, SC_E133_ACK, "ok");
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);

        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.framing_vector, VECTOR_FRAMING_STATUS);
        assert_eq!(msg.sequence, 9);

        let (code, description) = parse_status(&msg.payload).unwrap();
        assert_eq!(code, SC_E133_ACK);
        assert_eq!(description, "ok");
    }

    #[test]
    fn test_status_description_truncated() {
        let long = "x".repeat(200);
        let frame = builder().build_status(1, 0, 5, &long);
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);
        let msg = decoder.next_message().unwrap().unwrap();
        let (_, description) = parse_status(&msg.payload).unwrap();
        assert_eq!(description.len(), MAX_STATUS_DESCRIPTION);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let frame = builder().build_heartbeat();
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);

        let msg = decoder.next_message().unwrap().unwrap();
        assert!(msg.is_heartbeat());
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_incremental_feed() {
        let frame = builder().build_rdm(1, 0, b"payload");
        let mut decoder = FrameDecoder::default();

        for chunk in frame.chunks(5) {
            assert!(decoder.next_message().unwrap().is_none());
            decoder.feed(chunk);
        }
        let msg = decoder.next_message().unwrap().unwrap();
        assert_eq!(msg.payload, b"payload");
    }

    #[test]
    fn test_multiple_messages_one_buffer() {
        let b = builder();
        let mut stream = Vec::new();
        stream.extend_from_slice(&b.build_rdm(1, 0, b"one"));
        stream.extend_from_slice(&b.build_heartbeat());
        stream.extend_from_slice(&b.build_rdm(2, 0, b"two"));

        let mut decoder = FrameDecoder::default();
        decoder.feed(&stream);

        assert_eq!(decoder.next_message().unwrap().unwrap().payload, b"one");
        assert!(decoder.next_message().unwrap().unwrap().is_heartbeat());
        assert_eq!(decoder.next_message().unwrap().unwrap().payload, b"two");
        assert_eq!(decoder.next_message().unwrap(), None);
        assert_eq!(decoder.messages_decoded(), 3);
    }

    #[test]
    fn test_bad_preamble_rejected() {
        let mut frame = builder().build_rdm(1, 0, b"x");
        frame[4] = b'Z';
        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);
        assert_eq!(decoder.next_message(), Err(CodecError::BadPreamble));
    }

    #[test]
    fn test_oversize_rejected() {
        let frame = builder().build_rdm(1, 0, &vec![0u8; 256]);
        let mut decoder = FrameDecoder::new(64);
        decoder.feed(&frame);
        assert!(matches!(
            decoder.next_message(),
            Err(CodecError::Oversize { .. })
        ));
    }

    #[test]
    fn test_truncated_e133_rejected() {
        // Root PDU claims only the CID, then stops: no E1.33 layer.
        let b = builder();
        let mut frame = Vec::new();
        frame.extend_from_slice(&PREAMBLE_SIZE.to_be_bytes());
        frame.extend_from_slice(&POSTAMBLE_SIZE.to_be_bytes());
        frame.extend_from_slice(&ACN_PACKET_ID);
        push_flags_length(&mut frame, MIN_ROOT_PDU);
        frame.extend_from_slice(&VECTOR_ROOT_E133.to_be_bytes());
        frame.extend_from_slice(b.cid().as_bytes());

        let mut decoder = FrameDecoder::default();
        decoder.feed(&frame);
        assert_eq!(decoder.next_message(), Err(CodecError::Truncated));
    }

    #[test]
    fn test_read_from_cursor_reports_eof() {
        let frame = builder().build_rdm(1, 0, b"abc");
        let mut cursor = io::Cursor::new(frame);
        let mut decoder = FrameDecoder::default();

        assert_eq!(decoder.read_from(&mut cursor).unwrap(), ReadStatus::Eof);
        assert!(decoder.next_message().unwrap().is_some());
    }

    #[test]
    fn test_cid_generate_is_unique_enough() {
        let a = Cid::generate();
        let b = Cid::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
