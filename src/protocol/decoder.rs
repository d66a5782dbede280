//! Validates a protocol and decodes response buffers into typed records by
//! walking each response's item descriptors. See §4.2.

use tracing::trace;

use crate::error::KjError;
use crate::hex::{bytes_to_hex_spaced, read_int, read_uint};
use crate::protocol::compact::CompactProtocol;
use crate::protocol::model::{ItemDescriptor, ItemVariant, NumberType, ProtocolSpec, ResponseKind, TextEncoding};
use crate::protocol::unpacker::unpack;
use crate::record::{DecodedRecord, Value};

/// Decodes response buffers against a validated `ProtocolSpec`.
///
/// Construction invokes the unpacker and runs §3 validation; if it fails,
/// construction fails with `KjError::ProtocolInvalid` carrying every
/// offending response.
#[derive(Debug)]
pub struct ResponseDecoder {
    protocol: ProtocolSpec,
}

impl ResponseDecoder {
    pub fn new(compact: CompactProtocol) -> Result<Self, KjError> {
        let protocol = unpack(compact)?;
        Ok(Self { protocol })
    }

    pub fn protocol(&self) -> &ProtocolSpec {
        &self.protocol
    }

    /// Decode a complete segment buffer whose leading bytes are
    /// `[segmentHeader][signature...]`. `signature` is the slice the caller
    /// has already identified as the response signature (see `framer`);
    /// `buffer` is the *whole* segment, so item offsets are relative to it.
    pub fn decode(&self, signature: &[u8], buffer: &[u8]) -> Result<(ResponseKind, DecodedRecord), KjError> {
        let response = self
            .protocol
            .get_response_by_signature(signature)
            .ok_or_else(|| KjError::UnknownSignature(signature.to_vec()))?;

        let mut record = DecodedRecord::new();
        for item in &response.items {
            let end = item.offset + item.byte_length;
            if buffer.len() < end {
                return Err(KjError::DecodeFailure {
                    key: item.key.clone(),
                    offset: item.offset,
                    reason: format!("buffer too short: need {end} bytes, have {}", buffer.len()),
                });
            }
            let slice = &buffer[item.offset..end];
            let value = decode_item(item, slice, buffer)?;
            record.insert(&item.key, value, item.repeatable);
        }

        trace!(kind = %response.kind, fields = record.len(), "decoded response");
        Ok((response.kind.clone(), record))
    }
}

fn decode_item(item: &ItemDescriptor, slice: &[u8], whole: &[u8]) -> Result<Value, KjError> {
    match &item.variant {
        ItemVariant::Raw { getter } => match getter {
            Some(f) => Ok(f(slice, item.byte_length, item.offset, whole)),
            None => Ok(Value::Raw(slice.to_vec())),
        },
        ItemVariant::Text { encoding } => decode_text(item, slice, *encoding),
        ItemVariant::Numeric {
            number_type,
            endianness,
            multiplier,
            precision,
        } => {
            let raw = decode_numeric(item, slice, *number_type, *endianness)?;
            let scaled = match multiplier {
                Some(m) => raw * m,
                None => raw,
            };
            let rounded = match precision {
                Some(p) => round_to_precision(scaled, *p),
                None => scaled,
            };
            Ok(Value::Number(rounded))
        }
        ItemVariant::Boolean => Ok(Value::Bool(slice.iter().any(|b| *b != 0))),
    }
}

fn decode_text(_item: &ItemDescriptor, slice: &[u8], encoding: TextEncoding) -> Result<Value, KjError> {
    match encoding {
        TextEncoding::Hex => Ok(Value::Text(bytes_to_hex_spaced(slice))),
        TextEncoding::Utf8 | TextEncoding::Ascii => {
            // §3: decoded as UTF-8 and all NUL code points stripped — lossy,
            // like the source's `TextDecoder`, never failing the whole
            // segment over one field with stray non-UTF-8 bytes.
            let text = String::from_utf8_lossy(slice);
            Ok(Value::Text(text.chars().filter(|c| *c != '\0').collect()))
        }
    }
}

fn decode_numeric(
    item: &ItemDescriptor,
    slice: &[u8],
    number_type: NumberType,
    endianness: crate::hex::Endianness,
) -> Result<f64, KjError> {
    // §4.2: endianness is ignored for single-byte types.
    let endianness = if number_type.is_single_byte() {
        crate::hex::Endianness::Little
    } else {
        endianness
    };

    match number_type {
        NumberType::Int8 => {
            expect_len(item, slice, 1)?;
            Ok(slice[0] as i8 as f64)
        }
        NumberType::Uint8 => {
            expect_len(item, slice, 1)?;
            Ok(slice[0] as f64)
        }
        NumberType::Int16 | NumberType::Int32 => Ok(read_int(slice, endianness) as f64),
        NumberType::Uint16 | NumberType::Uint32 => Ok(read_uint(slice, endianness) as f64),
        NumberType::Float32 => {
            expect_len(item, slice, 4)?;
            let bytes: [u8; 4] = slice.try_into().unwrap();
            let v = match endianness {
                crate::hex::Endianness::Little => f32::from_le_bytes(bytes),
                crate::hex::Endianness::Big => f32::from_be_bytes(bytes),
            };
            Ok(v as f64)
        }
        NumberType::Float64 => {
            expect_len(item, slice, 8)?;
            let bytes: [u8; 8] = slice.try_into().unwrap();
            let v = match endianness {
                crate::hex::Endianness::Little => f64::from_le_bytes(bytes),
                crate::hex::Endianness::Big => f64::from_be_bytes(bytes),
            };
            Ok(v)
        }
    }
}

fn expect_len(item: &ItemDescriptor, slice: &[u8], expected: usize) -> Result<(), KjError> {
    if slice.len() != expected {
        return Err(KjError::DecodeFailure {
            key: item.key.clone(),
            offset: item.offset,
            reason: format!("expected {expected}-byte field, item declares {}", slice.len()),
        });
    }
    Ok(())
}

/// Round-half-away-from-zero via fixed-digit string formatting then reparse,
/// matching §4.2's "decimal-digit rounding ... same semantics as fixed-digit
/// string formatting followed by numeric reparse".
fn round_to_precision(value: f64, precision: u32) -> f64 {
    let formatted = format!("{:.*}", precision as usize, value);
    formatted.parse().unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::protocol::compact::{
        CompactCommand, CompactItem, CompactItemVariant, CompactResponse,
    };
    use crate::protocol::model::{CommandName, NumberType};

    fn protocol_with_responses(responses: Vec<CompactResponse>) -> CompactProtocol {
        CompactProtocol {
            service_uuid: "0000ffe0-0000-1000-8000-00805f9b34fb".into(),
            characteristic_uuid: "0000ffe1-0000-1000-8000-00805f9b34fb".into(),
            segment_header: vec![0x55, 0xAA, 0xEB, 0x90],
            command_header: vec![0xAA, 0x55, 0x90, 0xEB],
            command_length: 20,
            inactivity_timeout: Duration::from_secs(60),
            connect_previous_timeout: Duration::from_secs(5),
            commands: vec![CompactCommand {
                name: CommandName::new("GET_SETTINGS"),
                code: vec![0x96, 0x00, 0x00, 0x00],
                timeout: Duration::from_secs(2),
                post_send_wait: Duration::from_millis(300),
            }],
            responses,
        }
    }

    #[test]
    fn decodes_numeric_text_boolean_and_raw() {
        let responses = vec![CompactResponse {
            kind: ResponseKind::new("CELL_INFO"),
            signature: vec![0x02],
            length: 1 + 2 + 3 + 1 + 1,
            items: vec![
                CompactItem::new("sig", 1, CompactItemVariant::Raw { getter: None }),
                CompactItem::new("voltage", 2, CompactItemVariant::numeric(NumberType::Uint16).with_multiplier(0.001)),
                CompactItem::new("model", 3, CompactItemVariant::Text {
                    encoding: TextEncoding::Ascii,
                }),
                CompactItem::new("charging", 1, CompactItemVariant::Boolean),
                CompactItem::new("checksum", 1, CompactItemVariant::Raw { getter: None }),
            ],
        }];
        let decoder = ResponseDecoder::new(protocol_with_responses(responses)).unwrap();

        let mut buffer = vec![0x02u8];
        buffer.extend_from_slice(&3300u16.to_le_bytes());
        buffer.extend_from_slice(b"J\x00K"); // NUL stripped
        buffer.push(0x01);
        buffer.push(0x00); // checksum placeholder, not checked here

        let (kind, record) = decoder.decode(&[0x02], &buffer).unwrap();
        assert_eq!(kind, ResponseKind::new("CELL_INFO"));
        assert_eq!(
            record.get("voltage").and_then(|f| f.as_single()),
            Some(&Value::Number(3.3))
        );
        assert_eq!(
            record.get("model").and_then(|f| f.as_single()),
            Some(&Value::Text("JK".into()))
        );
        assert_eq!(
            record.get("charging").and_then(|f| f.as_single()),
            Some(&Value::Bool(true))
        );
    }

    #[test]
    fn repeated_keys_coalesce_into_sequence() {
        let responses = vec![CompactResponse {
            kind: ResponseKind::new("CELL_INFO"),
            signature: vec![0x03],
            length: 6,
            items: vec![
                CompactItem::new("voltages", 2, CompactItemVariant::numeric(NumberType::Uint16)).repeatable(),
                CompactItem::new("voltages", 2, CompactItemVariant::numeric(NumberType::Uint16)).repeatable(),
                CompactItem::new("voltages", 2, CompactItemVariant::numeric(NumberType::Uint16)).repeatable(),
            ],
        }];
        let decoder = ResponseDecoder::new(protocol_with_responses(responses)).unwrap();

        let mut buffer = Vec::new();
        for v in [3300u16, 3310, 3290] {
            buffer.extend_from_slice(&v.to_le_bytes());
        }

        let (_, record) = decoder.decode(&[0x03], &buffer).unwrap();
        let seq = record.get("voltages").and_then(|f| f.as_sequence()).unwrap();
        assert_eq!(
            seq,
            &[Value::Number(3300.0), Value::Number(3310.0), Value::Number(3290.0)]
        );
    }

    #[test]
    fn unknown_signature_is_rejected() {
        let decoder = ResponseDecoder::new(protocol_with_responses(vec![])).unwrap();
        let err = decoder.decode(&[0xFF], &[0xFF, 0x00]).unwrap_err();
        assert!(matches!(err, KjError::UnknownSignature(_)));
    }

    #[test]
    fn short_buffer_is_decode_failure() {
        let responses = vec![CompactResponse {
            kind: ResponseKind::new("CELL_INFO"),
            signature: vec![0x02],
            length: 4,
            items: vec![CompactItem::new(
                "voltage",
                4,
                CompactItemVariant::numeric(NumberType::Uint32),
            )],
        }];
        let decoder = ResponseDecoder::new(protocol_with_responses(responses)).unwrap();
        let err = decoder.decode(&[0x02], &[0x02, 0x00]).unwrap_err();
        assert!(matches!(err, KjError::DecodeFailure { .. }));
    }

    #[test]
    fn length_mismatch_rejected_at_construction() {
        let responses = vec![CompactResponse {
            kind: ResponseKind::new("CELL_INFO"),
            signature: vec![0x02],
            length: 10,
            items: vec![CompactItem::new(
                "voltage",
                2,
                CompactItemVariant::numeric(NumberType::Uint16),
            )],
        }];
        let err = ResponseDecoder::new(protocol_with_responses(responses)).unwrap_err();
        assert!(matches!(err, KjError::ProtocolInvalid(_)));
    }

    #[test]
    fn duplicate_signature_first_byte_rejected() {
        let responses = vec![
            CompactResponse {
                kind: ResponseKind::new("A"),
                signature: vec![0x02, 0x00],
                length: 0,
                items: vec![],
            },
            CompactResponse {
                kind: ResponseKind::new("B"),
                signature: vec![0x02, 0x01],
                length: 0,
                items: vec![],
            },
        ];
        let err = ResponseDecoder::new(protocol_with_responses(responses)).unwrap_err();
        match err {
            KjError::ProtocolInvalid(errs) => {
                assert!(errs.iter().any(|e| matches!(e, crate::error::ResponseValidationError::DuplicateSignature { .. })));
            }
            other => panic!("expected ProtocolInvalid, got {other:?}"),
        }
    }

    #[test]
    fn non_repeatable_duplicate_key_rejected() {
        let responses = vec![CompactResponse {
            kind: ResponseKind::new("A"),
            signature: vec![0x02],
            length: 2,
            items: vec![
                CompactItem::new("flag", 1, CompactItemVariant::Boolean),
                CompactItem::new("flag", 1, CompactItemVariant::Boolean),
            ],
        }];
        let err = ResponseDecoder::new(protocol_with_responses(responses)).unwrap_err();
        assert!(matches!(err, KjError::ProtocolInvalid(_)));
    }

    #[test]
    fn precision_rounds_like_format_then_reparse() {
        assert_eq!(round_to_precision(3.14159, 2), 3.14);
        assert_eq!(round_to_precision(-3.14159, 2), -3.14);
        assert_eq!(round_to_precision(1.0 / 3.0, 3), 0.333);
    }
}
