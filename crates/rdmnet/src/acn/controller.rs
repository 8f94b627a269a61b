// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Controller-to-controller sub-PDUs carried under
//! [`VECTOR_FRAMING_CONTROLLER`](super::constants::VECTOR_FRAMING_CONTROLLER).
//!
//! ```text
//! +----------------+--------------+----------------------+
//! | flags+len (3B) | vector (2B)  | body...              |
//! +----------------+--------------+----------------------+
//! ```
//!
//! Bodies are fixed-layout big-endian records; a device tuple is
//! `u32 ip, u16 port, 6-byte uid` (10 bytes).

use std::net::{Ipv4Addr, SocketAddrV4};

use super::constants::*;
use crate::core::uid::{RdmUid, UID_LENGTH};

/// Wire size of one device tuple.
pub const DEVICE_TUPLE_LENGTH: usize = 4 + 2 + UID_LENGTH;

const SUB_PDU_HEADER: usize = PDU_FLAGS_LENGTH_SIZE + 2;

// ============================================================================
// Device tuple
// ============================================================================

/// One device as carried in controller gossip: its UDP endpoint and UID.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceTuple {
    pub udp: SocketAddrV4,
    pub uid: RdmUid,
}

impl DeviceTuple {
    pub fn new(udp: SocketAddrV4, uid: RdmUid) -> Self {
        Self { udp, uid }
    }

    pub fn pack(&self) -> [u8; DEVICE_TUPLE_LENGTH] {
        let mut out = [0u8; DEVICE_TUPLE_LENGTH];
        out[0..4].copy_from_slice(&self.udp.ip().octets());
        out[4..6].copy_from_slice(&self.udp.port().to_be_bytes());
        out[6..12].copy_from_slice(&self.uid.pack());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < DEVICE_TUPLE_LENGTH {
            return None;
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        let mut uid = [0u8; UID_LENGTH];
        uid.copy_from_slice(&bytes[6..12]);
        Some(Self {
            udp: SocketAddrV4::new(ip, port),
            uid: RdmUid::from_bytes(uid),
        })
    }
}

// ============================================================================
// Controller messages
// ============================================================================

/// A decoded controller-to-controller message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControllerMessage {
    /// Request for the peer's local device list; empty body.
    FetchDevices,

    /// The peer's local device list.
    DeviceList(Vec<DeviceTuple>),

    /// The sender acquired a device.
    DeviceAcquired(DeviceTuple),

    /// The sender released a device.
    DeviceReleased(RdmUid),

    /// A device registering itself with the controller it connected to.
    DeviceRegistration(DeviceTuple),
}

impl ControllerMessage {
    fn vector(&self) -> u16 {
        match self {
            ControllerMessage::FetchDevices => VECTOR_CONTROLLER_FETCH_DEVICES,
            ControllerMessage::DeviceList(_) => VECTOR_CONTROLLER_DEVICE_LIST,
            ControllerMessage::DeviceAcquired(_) => VECTOR_CONTROLLER_DEVICE_ACQUIRED,
            ControllerMessage::DeviceReleased(_) => VECTOR_CONTROLLER_DEVICE_RELEASED,
            ControllerMessage::DeviceRegistration(_) => VECTOR_CONTROLLER_DEVICE_REG,
        }
    }
}

/// Why a controller sub-PDU was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerPduError {
    /// Shorter than the sub-PDU header, or length field inconsistent.
    Truncated,
    /// Unknown sub-vector; the message is dropped, the session survives.
    UnknownVector(u16),
    /// Body length does not match the vector's fixed layout.
    BadBodyLength { vector: u16, length: usize },
}

impl std::fmt::Display for ControllerPduError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerPduError::Truncated => write!(f, "truncated controller PDU"),
            ControllerPduError::UnknownVector(v) => {
                write!(f, "unknown controller vector 0x{:04x}", v)
            }
            ControllerPduError::BadBodyLength { vector, length } => write!(
                f,
                "bad body length {} for controller vector 0x{:04x}",
                length, vector
            ),
        }
    }
}

impl std::error::Error for ControllerPduError {}

/// Encode a controller message as a sub-PDU (ready for
/// [`MessageBuilder::build_controller`](super::codec::MessageBuilder::build_controller)).
pub fn encode(message: &ControllerMessage) -> Vec<u8> {
    let body: Vec<u8> = match message {
        ControllerMessage::FetchDevices => Vec::new(),
        ControllerMessage::DeviceList(devices) => {
            let mut body = Vec::with_capacity(devices.len() * DEVICE_TUPLE_LENGTH);
            for device in devices {
                body.extend_from_slice(&device.pack());
            }
            body
        }
        ControllerMessage::DeviceAcquired(device)
        | ControllerMessage::DeviceRegistration(device) => device.pack().to_vec(),
        ControllerMessage::DeviceReleased(uid) => uid.pack().to_vec(),
    };

    let length = SUB_PDU_HEADER + body.len();
    let mut out = Vec::with_capacity(length);
    out.push(PDU_FLAGS | ((length >> 16) & 0x0f) as u8);
    out.push(((length >> 8) & 0xff) as u8);
    out.push((length & 0xff) as u8);
    out.extend_from_slice(&message.vector().to_be_bytes());
    out.extend_from_slice(&body);
    out
}

/// Decode a controller sub-PDU.
pub fn decode(sub_pdu: &[u8]) -> Result<ControllerMessage, ControllerPduError> {
    if sub_pdu.len() < SUB_PDU_HEADER {
        return Err(ControllerPduError::Truncated);
    }
    let length = ((sub_pdu[0] as usize & 0x0f) << 16)
        | ((sub_pdu[1] as usize) << 8)
        | sub_pdu[2] as usize;
    if length < SUB_PDU_HEADER || length > sub_pdu.len() {
        return Err(ControllerPduError::Truncated);
    }

    let vector = u16::from_be_bytes([sub_pdu[3], sub_pdu[4]]);
    let body = &sub_pdu[SUB_PDU_HEADER..length];

    match vector {
        VECTOR_CONTROLLER_FETCH_DEVICES => {
            if !body.is_empty() {
                return Err(ControllerPduError::BadBodyLength {
                    vector,
                    length: body.len(),
                });
            }
            Ok(ControllerMessage::FetchDevices)
        }
        VECTOR_CONTROLLER_DEVICE_LIST => {
            if body.len() % DEVICE_TUPLE_LENGTH != 0 {
                return Err(ControllerPduError::BadBodyLength {
                    vector,
                    length: body.len(),
                });
            }
            let devices = body
                .chunks_exact(DEVICE_TUPLE_LENGTH)
                .filter_map(DeviceTuple::from_bytes)
                .collect();
            Ok(ControllerMessage::DeviceList(devices))
        }
        VECTOR_CONTROLLER_DEVICE_ACQUIRED | VECTOR_CONTROLLER_DEVICE_REG => {
            let device = check_single_tuple(vector, body)?;
            if vector == VECTOR_CONTROLLER_DEVICE_ACQUIRED {
                Ok(ControllerMessage::DeviceAcquired(device))
            } else {
                Ok(ControllerMessage::DeviceRegistration(device))
            }
        }
        VECTOR_CONTROLLER_DEVICE_RELEASED => {
            if body.len() != UID_LENGTH {
                return Err(ControllerPduError::BadBodyLength {
                    vector,
                    length: body.len(),
                });
            }
            let mut uid = [0u8; UID_LENGTH];
            uid.copy_from_slice(body);
            Ok(ControllerMessage::DeviceReleased(RdmUid::from_bytes(uid)))
        }
        other => Err(ControllerPduError::UnknownVector(other)),
    }
}

fn check_single_tuple(vector: u16, body: &[u8]) -> Result<DeviceTuple, ControllerPduError> {
    if body.len() != DEVICE_TUPLE_LENGTH {
        return Err(ControllerPduError::BadBodyLength {
            vector,
            length: body.len(),
        });
    }
    DeviceTuple::from_bytes(body).ok_or(ControllerPduError::Truncated)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple() -> DeviceTuple {
        DeviceTuple::new(
            SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 10), 40000),
            RdmUid::new(0x7a70, 0x0000_0001),
        )
    }

    #[test]
    fn test_tuple_layout_is_big_endian() {
        let packed = tuple().pack();
        assert_eq!(
            packed,
            [192, 0, 2, 10, 0x9c, 0x40, 0x7a, 0x70, 0x00, 0x00, 0x00, 0x01]
        );
    }

    #[test]
    fn test_device_acquired_roundtrip() {
        let msg = ControllerMessage::DeviceAcquired(tuple());
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_device_list_roundtrip() {
        let other = DeviceTuple::new(
            SocketAddrV4::new(Ipv4Addr::new(10, 1, 1, 1), 5000),
            RdmUid::new(0x7a70, 2),
        );
        let msg = ControllerMessage::DeviceList(vec![tuple(), other]);
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_empty_device_list_roundtrip() {
        let msg = ControllerMessage::DeviceList(Vec::new());
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_fetch_and_release_roundtrip() {
        assert_eq!(
            decode(&encode(&ControllerMessage::FetchDevices)).unwrap(),
            ControllerMessage::FetchDevices
        );
        let msg = ControllerMessage::DeviceReleased(RdmUid::new(1, 2));
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_registration_roundtrip() {
        let msg = ControllerMessage::DeviceRegistration(tuple());
        assert_eq!(decode(&encode(&msg)).unwrap(), msg);
    }

    #[test]
    fn test_wrong_body_length_rejected() {
        let mut pdu = encode(&ControllerMessage::DeviceReleased(RdmUid::new(1, 2)));
        // Claim one extra body byte.
        pdu.push(0);
        pdu[2] += 1;
        assert!(matches!(
            decode(&pdu),
            Err(ControllerPduError::BadBodyLength { .. })
        ));
    }

    #[test]
    fn test_ragged_device_list_rejected() {
        let mut pdu = encode(&ControllerMessage::DeviceList(vec![tuple()]));
        pdu.push(0);
        pdu[2] += 1;
        assert!(matches!(
            decode(&pdu),
            Err(ControllerPduError::BadBodyLength { .. })
        ));
    }

    #[test]
    fn test_unknown_vector_rejected() {
        let mut pdu = encode(&ControllerMessage::FetchDevices);
        pdu[4] = 0x7f;
        assert_eq!(decode(&pdu), Err(ControllerPduError::UnknownVector(0x7f)));
    }

    #[test]
    fn test_truncated_rejected() {
        assert_eq!(decode(&[0xf0, 0x00]), Err(ControllerPduError::Truncated));
    }
}
