//! Declarative binary-protocol engine and device session state machine for
//! JK-brand BMS BLE clients.
//!
//! The crate has two halves: `protocol` is a table-driven decoder — wire
//! layout is data, described once and validated at construction, not hand
//! written per field — and `session` drives the GATT lifecycle, command
//! transmission, and notification reassembly on top of it. `jk` supplies a
//! worked protocol description; callers targeting a different device build
//! their own `protocol::CompactProtocol` instead.

pub mod error;
pub mod framer;
pub mod hex;
pub mod jk;
pub mod protocol;
pub mod record;
pub mod session;
pub mod transport;

pub use error::{KjError, ResponseValidationError};
pub use framer::{FrameAssembler, FrameEvent};
pub use protocol::{
    CommandDefinition, CommandName, ItemDescriptor, ItemVariant, NumberType, ProtocolSpec, ResponseDecoder,
    ResponseDefinition, ResponseKind, TextEncoding,
};
pub use record::{CachedRecord, DecodedRecord, FieldValue, Value};
pub use session::{DeviceSession, DisconnectReason, SessionObserver, SessionStatus};
pub use transport::{Characteristic, ConnectedHandle, DeviceIdentity, Transport, TransportEvent};
