//! Tor protocol implementation
//!
//! This module implements the wire side of the client:
//! - Cell framing (fixed and variable length, relay payloads)
//! - Onion layering with running relay digests
//! - ntor handshake (key exchange)
//! - Link handshake and the per-relay channel
//! - Circuits and their reactor
//! - Streams with SENDME flow control

pub mod cell;
pub mod certs;
pub mod channel;
pub mod circuit;
pub mod crypto;
pub mod flow_control;
pub mod ntor;
pub mod stream;

pub use cell::{Cell, CellCommand, RelayCell, RelayCommand, VarCell};
pub use certs::{CertsCell, Ed25519Certificate};
pub use channel::Channel;
pub use circuit::{Circuit, CircuitState, IncomingStream};
pub use crypto::{CircuitKeys, OnionCrypto, RelayCrypto};
pub use flow_control::{RecvWindow, SendWindow};
pub use ntor::{NtorHandshake, NtorServer};
pub use stream::{resolve, ResolvedAnswer, TorStream};
