//! The resolved (post-unpack) protocol model: commands, responses, and the
//! field layouts the decoder walks. See `unpacker` for how a compact,
//! author-friendly description turns into this shape.

use std::borrow::Cow;
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hex::Endianness;
use crate::record::Value;

/// The name of a command, e.g. `GET_SETTINGS`. A thin wrapper over a string
/// rather than a closed Rust enum so that a caller can describe a protocol
/// this engine has never heard of — the "enumerated kind" of §3 is enforced
/// by the author of a given `CompactProtocol`, not by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandName(pub Cow<'static, str>);

impl CommandName {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl std::fmt::Display for CommandName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a response/data-type tag, e.g. `CELL_INFO`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseKind(pub Cow<'static, str>);

impl ResponseKind {
    pub const fn new(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }
}

impl std::fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A function applied to `(itemBuffer, byteLength, offset, wholeResponseBuffer)`
/// for a `raw` item that supplies a custom getter instead of the raw bytes.
pub type RawGetter = fn(&[u8], usize, usize, &[u8]) -> Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextEncoding {
    Hex,
    Utf8,
    Ascii,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumberType {
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl NumberType {
    /// True for the types §4.2 says ignore endianness.
    pub fn is_single_byte(self) -> bool {
        matches!(self, NumberType::Int8 | NumberType::Uint8)
    }
}

/// The variant tag an item descriptor chooses, resolved (defaults filled in
/// by the unpacker — e.g. every `Numeric` carries an explicit `Endianness`).
#[derive(Clone)]
pub enum ItemVariant {
    Raw { getter: Option<RawGetter> },
    Text { encoding: TextEncoding },
    Numeric {
        number_type: NumberType,
        endianness: Endianness,
        multiplier: Option<f64>,
        precision: Option<u32>,
    },
    Boolean,
}

impl std::fmt::Debug for ItemVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemVariant::Raw { getter } => f
                .debug_struct("Raw")
                .field("getter", &getter.is_some())
                .finish(),
            ItemVariant::Text { encoding } => f.debug_struct("Text").field("encoding", encoding).finish(),
            ItemVariant::Numeric {
                number_type,
                endianness,
                multiplier,
                precision,
            } => f
                .debug_struct("Numeric")
                .field("number_type", number_type)
                .field("endianness", endianness)
                .field("multiplier", multiplier)
                .field("precision", precision)
                .finish(),
            ItemVariant::Boolean => write!(f, "Boolean"),
        }
    }
}

/// A resolved item descriptor: offset has been assigned by the unpacker as
/// the running prefix sum of preceding byte lengths (§3 invariant — never
/// author-supplied).
#[derive(Debug, Clone)]
pub struct ItemDescriptor {
    pub key: String,
    pub offset: usize,
    pub byte_length: usize,
    pub variant: ItemVariant,
    pub repeatable: bool,
}

/// A resolved response definition.
#[derive(Debug, Clone)]
pub struct ResponseDefinition {
    pub kind: ResponseKind,
    pub signature: Vec<u8>,
    pub length: usize,
    pub items: Vec<ItemDescriptor>,
}

/// A command definition.
#[derive(Debug, Clone)]
pub struct CommandDefinition {
    pub name: CommandName,
    pub code: Vec<u8>,
    pub timeout: Duration,
    pub post_send_wait: Duration,
}

/// The fully resolved protocol description, satisfying the §3 invariants.
/// Constructed only via `unpacker::unpack`.
#[derive(Debug, Clone)]
pub struct ProtocolSpec {
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub segment_header: Vec<u8>,
    pub command_header: Vec<u8>,
    pub command_length: usize,
    pub inactivity_timeout: Duration,
    pub connect_previous_timeout: Duration,
    pub(crate) commands: HashMap<CommandName, CommandDefinition>,
    pub(crate) responses: Vec<ResponseDefinition>,
    /// Signature first byte -> index into `responses`. Built once at unpack
    /// time so lookup is constant-time, per §4.1.
    pub(crate) signature_index: HashMap<u8, usize>,
}

impl ProtocolSpec {
    pub fn get_command_by_name(&self, name: &CommandName) -> Option<&CommandDefinition> {
        self.commands.get(name)
    }

    /// Resolve a response by its wire signature, matching on the first byte.
    pub fn get_response_by_signature(&self, signature: &[u8]) -> Option<&ResponseDefinition> {
        let first = *signature.first()?;
        let index = *self.signature_index.get(&first)?;
        self.responses.get(index)
    }

    pub fn responses(&self) -> &[ResponseDefinition] {
        &self.responses
    }

    pub fn commands(&self) -> impl Iterator<Item = &CommandDefinition> {
        self.commands.values()
    }
}
