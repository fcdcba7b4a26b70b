//! Reassembly of inbound frames into logical messages.
//!
//! A logical message spans one or more 64-byte frames. Each frame contributes
//! its declared payload; the message is complete when a terminal condition
//! fires. Which conditions are enabled depends on where the session is: the
//! initial probe waits for ENQ, remote-command mode ends on the first short
//! fragment, and everything else also terminates on control bytes and on the
//! ETX/ETB frame-type markers near the tail.

use crate::constants::{FRAME_HEADER_SIZE, FULL_FRAME_PAYLOAD, RESPONSE_PAYLOAD_OFFSET};
use crate::error::LinkError;
use crate::packet::{ControlCode, parse_header, parse_tail};
use bytes::{Bytes, BytesMut};
use num_enum::FromPrimitive;
use tracing::trace;

/// Caller-selected completion policy for one logical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Complete when a frame's first payload byte is ENQ.
    WaitForEnq,
    /// Complete on the first short fragment.
    RemoteCommand,
    /// Complete on a short fragment, an ENQ/EOT/ACK first byte, or an ETX/ETB
    /// tail frame type.
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The message needs more frames.
    Accumulated,
    /// A terminal condition fired; consume the buffer.
    Complete,
}

/// Accumulator for one logical message.
///
/// Construct one per message and consume it with [`MessageBuffer::into_message`]
/// once [`MessageBuffer::ingest`] reports completion. A buffer held across
/// messages must be [`reset`](MessageBuffer::reset) in between, or stale bytes
/// prepend themselves to the next message.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    bytes: BytesMut,
    message_length: usize,
    valid: bool,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard accumulated state, readying the buffer for the next message.
    pub fn reset(&mut self) {
        self.bytes.clear();
        self.message_length = 0;
        self.valid = false;
    }

    /// Whether the buffer holds any content. Not a completion signal.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn len(&self) -> usize {
        self.message_length
    }

    pub fn is_empty(&self) -> bool {
        self.message_length == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume the accumulator, yielding the assembled message.
    pub fn into_message(self) -> Bytes {
        self.bytes.freeze()
    }

    /// Fold one inbound frame into the message and evaluate the terminal
    /// conditions, in priority order: the handshake-style ACK response, the
    /// marker check (an invalid marker aborts regardless of policy), then the
    /// selected completion policy.
    pub fn ingest(&mut self, frame: &[u8], mode: CompletionMode) -> Result<IngestOutcome, LinkError> {
        if frame.len() < FRAME_HEADER_SIZE {
            return Err(LinkError::InsufficientData {
                expected: FRAME_HEADER_SIZE,
                actual: frame.len(),
            });
        }
        let declared = frame[3] as usize;
        let end = FRAME_HEADER_SIZE + declared;
        if frame.len() < end {
            return Err(LinkError::InsufficientData {
                expected: end,
                actual: frame.len(),
            });
        }

        self.bytes.extend_from_slice(&frame[FRAME_HEADER_SIZE..end]);
        self.message_length += declared;
        self.valid = true;

        if self.message_length > RESPONSE_PAYLOAD_OFFSET
            && self.bytes[RESPONSE_PAYLOAD_OFFSET] == u8::from(ControlCode::Ack)
        {
            trace!("pump acknowledged");
            return Ok(IngestOutcome::Complete);
        }

        let header = parse_header(frame)?;
        let first = ControlCode::from_primitive(header.first_byte);
        let short = (header.size as usize) < FULL_FRAME_PAYLOAD;

        let complete = match mode {
            CompletionMode::WaitForEnq => first == ControlCode::Enq,
            CompletionMode::RemoteCommand => short,
            CompletionMode::Standard => {
                short
                    || matches!(
                        first,
                        ControlCode::Enq | ControlCode::Eot | ControlCode::Ack
                    )
                    || parse_tail(frame, header.size).is_ok_and(|tail| {
                        matches!(
                            ControlCode::from_primitive(tail.frame_type),
                            ControlCode::Etx | ControlCode::Etb
                        )
                    })
            }
        };

        if complete {
            trace!(length = self.message_length, "message complete");
            Ok(IngestOutcome::Complete)
        } else {
            Ok(IngestOutcome::Accumulated)
        }
    }
}
