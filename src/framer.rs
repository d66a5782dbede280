//! Reassembles notification fragments into complete, checksum-verified
//! response segments. See §4.3.

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::hex::additive_checksum;
use crate::protocol::ProtocolSpec;

/// The outcome of feeding one fragment to the assembler.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// Buffer is accumulating; nothing to do yet.
    Pending,
    /// Fragment arrived before any segment header was seen; dropped.
    OrphanDropped,
    /// The segment-type byte doesn't match any known response signature.
    UnknownSegmentType(u8),
    /// The checksum on an otherwise complete segment didn't match; discarded.
    ChecksumFailure,
    /// A complete, checksum-valid segment, truncated to its declared length.
    Ready(Bytes),
}

/// Owns the rolling notification buffer and turns fragments into segments.
#[derive(Debug)]
pub struct FrameAssembler {
    segment_header: Vec<u8>,
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new(segment_header: Vec<u8>) -> Self {
        Self {
            segment_header,
            buffer: BytesMut::new(),
        }
    }

    /// Discard any partially assembled segment. Called on connect/disconnect
    /// so stale bytes from a previous session never leak into a new one.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Feed one inbound notification fragment.
    pub fn feed(&mut self, fragment: &[u8], protocol: &ProtocolSpec) -> FrameEvent {
        if fragment.starts_with(self.segment_header.as_slice()) {
            self.buffer.clear();
            self.buffer.extend_from_slice(fragment);
        } else if self.buffer.starts_with(self.segment_header.as_slice()) {
            self.buffer.extend_from_slice(fragment);
        } else {
            warn!(len = fragment.len(), "dropping orphan fragment before any segment header");
            return FrameEvent::OrphanDropped;
        }

        let header_len = self.segment_header.len();
        if self.buffer.len() <= header_len {
            return FrameEvent::Pending;
        }

        let segment_type = self.buffer[header_len];
        let response = match protocol.get_response_by_signature(&self.buffer[header_len..header_len + 1]) {
            Some(response) => response,
            None => return FrameEvent::UnknownSegmentType(segment_type),
        };

        if self.buffer.len() < response.length {
            return FrameEvent::Pending;
        }
        if self.buffer.len() > response.length {
            warn!(
                declared = response.length,
                actual = self.buffer.len(),
                "segment buffer over-length, truncating to declared length"
            );
        }

        let segment = &self.buffer[..response.length];
        let transmitted = segment[response.length - 1];
        let computed = additive_checksum(&segment[..response.length - 1]);

        let outcome = if transmitted == computed {
            trace!(kind = %response.kind, len = response.length, "segment assembled and verified");
            FrameEvent::Ready(Bytes::copy_from_slice(segment))
        } else {
            warn!(kind = %response.kind, transmitted, computed, "checksum mismatch, discarding segment");
            FrameEvent::ChecksumFailure
        };

        self.buffer.clear();
        outcome
    }
}
