//! Client driver for the OrientDB binary network protocol.
//!
//! The crate is split the way the wire splits: [`wire`] holds the primitive
//! codec, [`record`] the document serializer, [`protocol`] the per-operation
//! request/response grammars, and [`session`] the connection state machine
//! that owns the socket and pipelines requests over it.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod options;
pub mod protocol;
pub mod record;
pub mod session;
pub mod support;
pub mod wire;

pub use crate::options::{DbKind, Options, SocketOptions, Target};
pub use crate::protocol::{Arg, CommandResult, Op, OpResponse, Query, SqlCommand, TxOperation};
pub use crate::record::{Decimal, Document, Rid, Schema, Value};
pub use crate::session::{PendingReply, Session};
pub use crate::support::{DriverError, DriverResult};

/// Network protocol revision this driver speaks.
pub const PROTOCOL: u16 = 28;

/// Name under which the driver identifies itself during the handshake.
pub const DRIVER_NAME: &str = "lodestone";

/// Driver version reported during the handshake.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Record serializer negotiated during the handshake.
pub const SERIALIZER: &str = "ORecordSerializerBinary";
