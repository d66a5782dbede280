//! Turns a `CompactProtocol` into a fully resolved `ProtocolSpec`,
//! computing field offsets, filling defaults, and indexing by signature.
//! See §4.1.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{KjError, ResponseValidationError};
use crate::protocol::compact::{CompactItemVariant, CompactProtocol};
use crate::protocol::model::{
    CommandDefinition, ItemDescriptor, ItemVariant, ProtocolSpec, ResponseDefinition, ResponseKind,
};

fn resolve_variant(compact: CompactItemVariant) -> ItemVariant {
    match compact {
        CompactItemVariant::Raw { getter } => ItemVariant::Raw { getter },
        CompactItemVariant::Text { encoding } => ItemVariant::Text { encoding },
        CompactItemVariant::Numeric {
            number_type,
            endianness,
            multiplier,
            precision,
        } => ItemVariant::Numeric {
            number_type,
            endianness: endianness.unwrap_or_default(),
            multiplier,
            precision,
        },
        CompactItemVariant::Boolean => ItemVariant::Boolean,
    }
}

/// Validate and resolve a compact protocol description.
///
/// Returns `KjError::ProtocolInvalid` naming every offending response if any
/// response's computed length disagrees with its declared length, or two
/// responses share a signature first byte, or a non-repeatable item key
/// appears twice within one response. Never silently repairs.
pub fn unpack(compact: CompactProtocol) -> Result<ProtocolSpec, KjError> {
    let mut errors = Vec::new();
    let mut responses = Vec::with_capacity(compact.responses.len());

    for compact_response in compact.responses {
        let mut offset = 0usize;
        let mut items = Vec::with_capacity(compact_response.items.len());
        let mut seen_non_repeatable_keys: HashSet<&str> = HashSet::new();

        for compact_item in &compact_response.items {
            if !compact_item.repeatable {
                if !seen_non_repeatable_keys.insert(compact_item.key.as_str()) {
                    errors.push(ResponseValidationError::NonRepeatableDuplicateKey {
                        kind: compact_response.kind.clone(),
                        key: compact_item.key.clone(),
                    });
                }
            }

            items.push(ItemDescriptor {
                key: compact_item.key.clone(),
                offset,
                byte_length: compact_item.byte_length,
                variant: resolve_variant(compact_item.variant.clone()),
                repeatable: compact_item.repeatable,
            });
            offset += compact_item.byte_length;
        }

        if offset != compact_response.length {
            errors.push(ResponseValidationError::LengthMismatch {
                kind: compact_response.kind.clone(),
                declared: compact_response.length,
                computed: offset,
            });
        }

        responses.push(ResponseDefinition {
            kind: compact_response.kind,
            signature: compact_response.signature,
            length: compact_response.length,
            items,
        });
    }

    let mut by_first_byte: HashMap<u8, Vec<ResponseKind>> = HashMap::new();
    for response in &responses {
        if let Some(&byte) = response.signature.first() {
            by_first_byte.entry(byte).or_default().push(response.kind.clone());
        }
    }
    for (byte, kinds) in &by_first_byte {
        if kinds.len() > 1 {
            errors.push(ResponseValidationError::DuplicateSignature {
                byte: *byte,
                kinds: kinds.clone(),
            });
        }
    }

    if !errors.is_empty() {
        debug!(error_count = errors.len(), "protocol validation failed");
        return Err(KjError::ProtocolInvalid(errors));
    }

    let mut signature_index = HashMap::new();
    for (index, response) in responses.iter().enumerate() {
        if let Some(&byte) = response.signature.first() {
            signature_index.insert(byte, index);
        }
    }

    let mut commands = HashMap::new();
    for compact_command in compact.commands {
        commands.insert(
            compact_command.name.clone(),
            CommandDefinition {
                name: compact_command.name,
                code: compact_command.code,
                timeout: compact_command.timeout,
                post_send_wait: compact_command.post_send_wait,
            },
        );
    }

    Ok(ProtocolSpec {
        service_uuid: compact.service_uuid,
        characteristic_uuid: compact.characteristic_uuid,
        segment_header: compact.segment_header,
        command_header: compact.command_header,
        command_length: compact.command_length,
        inactivity_timeout: compact.inactivity_timeout,
        connect_previous_timeout: compact.connect_previous_timeout,
        commands,
        responses,
        signature_index,
    })
}
