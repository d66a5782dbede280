//! The compact, author-friendly protocol description: what a protocol
//! author writes by hand. `unpacker::unpack` turns this into a
//! `ProtocolSpec` (`model.rs`), computing offsets and filling defaults.

use std::time::Duration;

use crate::hex::Endianness;
use crate::protocol::model::{CommandName, NumberType, RawGetter, ResponseKind, TextEncoding};

/// Mirrors `ItemVariant` but leaves `endianness` unspecified where the
/// author wants the little-endian default (§4.1: "endianness defaults to
/// littleEndian where unspecified for multi-byte numeric items").
#[derive(Clone)]
pub enum CompactItemVariant {
    Raw { getter: Option<RawGetter> },
    Text { encoding: TextEncoding },
    Numeric {
        number_type: NumberType,
        endianness: Option<Endianness>,
        multiplier: Option<f64>,
        precision: Option<u32>,
    },
    Boolean,
}

impl CompactItemVariant {
    pub fn numeric(number_type: NumberType) -> Self {
        CompactItemVariant::Numeric {
            number_type,
            endianness: None,
            multiplier: None,
            precision: None,
        }
    }

    pub fn with_endianness(mut self, value: Endianness) -> Self {
        if let CompactItemVariant::Numeric { endianness, .. } = &mut self {
            *endianness = Some(value);
        }
        self
    }

    pub fn with_multiplier(mut self, value: f64) -> Self {
        if let CompactItemVariant::Numeric { multiplier, .. } = &mut self {
            *multiplier = Some(value);
        }
        self
    }

    pub fn with_precision(mut self, value: u32) -> Self {
        if let CompactItemVariant::Numeric { precision, .. } = &mut self {
            *precision = Some(value);
        }
        self
    }
}

/// An item descriptor as an author writes it: no `offset` (computed by the
/// unpacker as the running prefix sum of byte lengths in declaration order).
#[derive(Clone)]
pub struct CompactItem {
    pub key: String,
    pub byte_length: usize,
    pub variant: CompactItemVariant,
    pub repeatable: bool,
}

impl CompactItem {
    pub fn new(key: impl Into<String>, byte_length: usize, variant: CompactItemVariant) -> Self {
        Self {
            key: key.into(),
            byte_length,
            variant,
            repeatable: false,
        }
    }

    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }
}

#[derive(Clone)]
pub struct CompactResponse {
    pub kind: ResponseKind,
    pub signature: Vec<u8>,
    pub length: usize,
    pub items: Vec<CompactItem>,
}

#[derive(Clone)]
pub struct CompactCommand {
    pub name: CommandName,
    pub code: Vec<u8>,
    pub timeout: Duration,
    pub post_send_wait: Duration,
}

/// The compact protocol description passed to `unpacker::unpack`.
#[derive(Clone)]
pub struct CompactProtocol {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub segment_header: Vec<u8>,
    pub command_header: Vec<u8>,
    pub command_length: usize,
    pub inactivity_timeout: Duration,
    pub connect_previous_timeout: Duration,
    pub commands: Vec<CompactCommand>,
    pub responses: Vec<CompactResponse>,
}
