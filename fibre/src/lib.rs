//! Fibre connection core: a layered wire protocol that multiplexes many
//! concurrent remote procedure calls over unreliable, fragment-bounded
//! transports (CAN frames, UDP datagrams, serial streams).
//!
//! The stack, bottom up: layer-tagged chunk chains ([`chunk`]), a
//! block-aligned chunked fifo ([`fifo`]), the reliable-delivery connection
//! endpoint ([`connection`]), frame-level egress plumbing
//! ([`multiplexer`]), the endpoint-addressed call protocol ([`endpoint`]),
//! the legacy packet protocol ([`legacy`]), the call dispatcher and object
//! model ([`function`], [`codec`], [`domain`]), and the CAN and UDP
//! transport adapters ([`can`], [`transport`]).

#[macro_use]
pub mod status;

pub mod can;
pub mod chunk;
pub mod codec;
pub mod config;
pub mod connection;
pub mod domain;
pub mod endpoint;
pub mod fifo;
pub mod function;
pub mod legacy;
pub mod logging;
pub mod multiplexer;
pub mod transport;

/// Protocol version; also the initial CRC value of the JSON descriptor
/// checksum.
pub const PROTOCOL_VERSION: u16 = 1;

pub use chunk::{BufChain, ChainPos, Chunk, Cont, Socket, WriteArgs, WriteResult};
pub use connection::{Connection, ConnectionPos};
pub use domain::{Domain, NodeId, ObjectHandle};
pub use status::{RichStatus, Status};
