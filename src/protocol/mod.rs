//! The declarative binary-protocol engine: a protocol model, the unpacker
//! that resolves a compact description into it, and the decoder that walks
//! a resolved response's item descriptors to produce a `DecodedRecord`.

pub mod compact;
pub mod decoder;
pub mod model;
pub mod unpacker;

pub use compact::{CompactCommand, CompactItem, CompactItemVariant, CompactProtocol, CompactResponse};
pub use decoder::ResponseDecoder;
pub use model::{
    CommandDefinition, CommandName, ItemDescriptor, ItemVariant, NumberType, ProtocolSpec, RawGetter,
    ResponseDefinition, ResponseKind, TextEncoding,
};
pub use unpacker::unpack;
