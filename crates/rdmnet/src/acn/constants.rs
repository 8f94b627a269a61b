// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACN vector and framing constants.

/// The ACN packet identifier carried in every stream preamble.
pub const ACN_PACKET_ID: [u8; 12] = *b"ASC-E1.17\x00\x00\x00";

/// Size of the stream preamble: preamble size + postamble size + packet id.
pub const PREAMBLE_LENGTH: usize = 16;

/// Value of the preamble-size field (covers the whole 16-byte preamble).
pub const PREAMBLE_SIZE: u16 = 0x0010;

/// Value of the postamble-size field (E1.33 uses no postamble).
pub const POSTAMBLE_SIZE: u16 = 0x0000;

/// Length of a sender CID.
pub const CID_LENGTH: usize = 16;

/// PDU flags nibble: length-extended, vector, header and data flags set.
pub const PDU_FLAGS: u8 = 0xf0;

/// Size of the 3-byte flags + 20-bit length field.
pub const PDU_FLAGS_LENGTH_SIZE: usize = 3;

// ============================================================================
// Root layer vectors
// ============================================================================

/// Root-layer vector for E1.33 messages.
pub const VECTOR_ROOT_E133: u32 = 0x0000_0005;

/// Root-layer vector for the null (heartbeat) PDU.
pub const VECTOR_ROOT_NULL: u32 = 0x0000_0006;

// ============================================================================
// E1.33 framing vectors
// ============================================================================

/// E1.33 framing vector for RDM commands and responses.
pub const VECTOR_FRAMING_RDMNET: u32 = 0x0000_0001;

/// E1.33 framing vector for status (acknowledgement) PDUs.
pub const VECTOR_FRAMING_STATUS: u32 = 0x0000_0002;

/// E1.33 framing vector for controller-to-controller messages.
pub const VECTOR_FRAMING_CONTROLLER: u32 = 0x0000_0003;

// ============================================================================
// Controller sub-vectors (within VECTOR_FRAMING_CONTROLLER)
// ============================================================================

/// Ask a peer for its list of local devices; empty body.
pub const VECTOR_CONTROLLER_FETCH_DEVICES: u16 = 0x0001;

/// A packed array of device tuples.
pub const VECTOR_CONTROLLER_DEVICE_LIST: u16 = 0x0002;

/// A single device tuple: the sender now owns this device.
pub const VECTOR_CONTROLLER_DEVICE_ACQUIRED: u16 = 0x0003;

/// A single UID: the sender released this device.
pub const VECTOR_CONTROLLER_DEVICE_RELEASED: u16 = 0x0004;

/// Device -> controller registration over TCP: a single device tuple.
pub const VECTOR_CONTROLLER_DEVICE_REG: u16 = 0x0006;

// ============================================================================
// E1.33 status codes
// ============================================================================

/// Positive acknowledgement.
pub const SC_E133_ACK: u16 = 0x0000;

/// Maximum status description length we will emit.
pub const MAX_STATUS_DESCRIPTION: usize = 64;
