// Protocol constants for the Contour Next Link bridge.

use std::time::Duration;

/// Size of one HID report on the wire (64 bytes).
pub const HID_PACKET_SIZE: usize = 64;

/// Transport frame header: 3-byte marker plus the declared-length byte.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Marker carried by every inbound frame.
pub const INBOUND_MARKER: &[u8; 3] = b"ABC";

/// Largest payload a single frame can declare. A frame declaring less is the
/// final fragment of its message.
pub const FULL_FRAME_PAYLOAD: usize = HID_PACKET_SIZE - FRAME_HEADER_SIZE;

/// Offset of the pump message inside a reassembled bridge response.
pub const RESPONSE_PAYLOAD_OFFSET: usize = 33;

/// Size of one history page.
pub const PAGE_SIZE: usize = 1024;

/// Size of one message part of a history page.
pub const PAGE_PART_SIZE: usize = 256;

/// Message parts per history page.
pub const PAGE_PARTS: usize = 4;

/// History pages requested per session.
pub const HISTORY_PAGES: u8 = 9;

/// Wire size of the continuation (padding) packet, checksum included. Folded
/// into the command packet's declared payload length when a parameter rides
/// along.
pub const CONTINUATION_SIZE: u32 = 44;

/// Zero padding appended after a command parameter.
pub const PARAMETER_PADDING: usize = 20;

/// Bound on every receive awaiting a logical message.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Reserved retry budget. The engine itself never consults this; callers that
/// want retries layer them on top of a fresh session.
pub const RETRIES: u32 = 6;
