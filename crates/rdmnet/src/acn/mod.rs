// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACN framing for the E1.33 TCP stream.
//!
//! Every application message on an RDMnet TCP session is an ACN root-layer
//! PDU carrying an E1.33 PDU:
//!
//! ```text
//! +------------------+---------------------------+----------------------+
//! | Preamble (16B)   | Root PDU                  | E1.33 PDU            |
//! | size/postamble/  | flags+len(3B) vector(4B)  | flags+len(3B)        |
//! | "ASC-E1.17"      | sender CID (16B)          | vector(4B) seq(4B)   |
//! |                  |                           | endpoint(2B) rsvd(1B)|
//! |                  |                           | payload...           |
//! +------------------+---------------------------+----------------------+
//! ```
//!
//! Heartbeats are root-layer PDUs with the NULL vector and no E1.33 layer;
//! they carry no data and exist only to refresh the peer's receive
//! deadline.
//!
//! The module splits into [`constants`] (vectors and sizes), [`codec`]
//! (builder and incremental stream decoder) and [`controller`] (the
//! controller-to-controller sub-PDU bodies).

pub mod codec;
pub mod constants;
pub mod controller;

pub use codec::{Cid, FrameDecoder, Message, MessageBuilder};
pub use controller::{ControllerMessage, DeviceTuple};
