use thiserror::Error;

use crate::protocol::{CommandName, ResponseKind};

/// One response definition that failed validation during unpacking.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResponseValidationError {
    #[error("response {kind:?}: declared length {declared} but items sum to {computed}")]
    LengthMismatch {
        kind: ResponseKind,
        declared: usize,
        computed: usize,
    },
    #[error("response {kind:?}: item key {key:?} repeated but not marked repeatable")]
    NonRepeatableDuplicateKey { kind: ResponseKind, key: String },
    #[error("signature first byte 0x{byte:02X} shared by {kinds:?}")]
    DuplicateSignature { byte: u8, kinds: Vec<ResponseKind> },
}

/// The primary error type for the `jk-bms-core` library.
#[derive(Error, Debug)]
pub enum KjError {
    #[error("protocol invalid: {0:?}")]
    ProtocolInvalid(Vec<ResponseValidationError>),

    #[error("unknown command: {0:?}")]
    UnknownCommand(CommandName),

    #[error("unknown response signature: {0:02x?}")]
    UnknownSignature(Vec<u8>),

    #[error("command payload overflows commandLength: header+code+payload = {actual}, limit = {limit}")]
    CommandOverflow { actual: usize, limit: usize },

    #[error("command timed out after {0:?}")]
    CommandTimeout(std::time::Duration),

    #[error("decode failed at item {key:?} (offset {offset}): {reason}")]
    DecodeFailure {
        key: String,
        offset: usize,
        reason: String,
    },

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("disconnect failed while already disconnecting: {0}")]
    DisconnectWhileDisconnecting(String),

    #[error("no device connected")]
    NotConnected,
}
