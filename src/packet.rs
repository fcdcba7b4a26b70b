//! Outbound frame construction and inbound frame parsing.
//!
//! Every buffer that reaches the transport is built here, and every inbound
//! frame has its header and tail picked apart here. The bridge speaks two
//! layers at once: bare meter-mode control frames, and Medtronic command
//! packets tunnelled inside them. Command packets carry an additive checksum
//! over everything after the transport header; when a parameter is present the
//! command is transmitted as a pair (command packet + padding packet) and the
//! padding packet's CRC-8 is folded into the command packet's checksum range,
//! because the bridge verifies the pair as one unit.

use crate::checksum::{Crc8, sum_lsb};
use crate::constants::{
    CONTINUATION_SIZE, FRAME_HEADER_SIZE, INBOUND_MARKER, PAGE_PART_SIZE, PARAMETER_PADDING,
    RESPONSE_PAYLOAD_OFFSET,
};
use crate::error::LinkError;
use bytes::Bytes;
use crc::Algorithm;
use num_enum::{FromPrimitive, IntoPrimitive};

/// ASCII control codes used by the meter-emulation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum ControlCode {
    Stx = 0x02,
    Etx = 0x03,
    Eot = 0x04,
    Enq = 0x05,
    Ack = 0x06,
    Lf = 0x0A,
    Cr = 0x0D,
    Nak = 0x15,
    Etb = 0x17,

    #[num_enum(catch_all)]
    Unknown(u8),
}

/// Byte probing the meter interface before the handshake proper.
pub const PROBE: u8 = 0x58;

// Two-byte meter commands that move the bridge in and out of remote-command
// mode.
pub const GET_WRITE: [u8; 2] = [0x57, 0x7C]; // W|
pub const GET_QUERY: [u8; 2] = [0x51, 0x7C]; // Q|
pub const GET_MAGIC: [u8; 2] = [0x31, 0x7C]; // 1|
pub const GET_END: [u8; 2] = [0x30, 0x7C]; // 0|

// Medtronic operation selectors.
pub const OPEN_CONNECTION: [u8; 3] = [0x10, 0x01, 0x1E];
pub const SEND_MESSAGE: [u8; 3] = [0x12, 0x21, 0x05];

// Pump command codes sent through SEND_MESSAGE.
pub const READ_HISTORY: u8 = 0x80;
pub const READ_MODEL: u8 = 0x8D;

/// Parsed fixed header of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub marker: [u8; 3],
    pub size: u8,
    pub first_byte: u8,
}

impl FrameHeader {
    /// The original four header bytes, marker first.
    pub fn into_bytes(self) -> [u8; 4] {
        [self.marker[0], self.marker[1], self.marker[2], self.size]
    }
}

/// The two tail bytes sitting `size - 2` from frame start, used for mid-stream
/// frame-type detection (end-of-text vs end-of-block).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTail {
    pub control: u8,
    pub frame_type: u8,
}

/// Read the marker, declared size and first payload byte of an inbound frame.
pub fn parse_header(frame: &[u8]) -> Result<FrameHeader, LinkError> {
    if frame.len() < FRAME_HEADER_SIZE + 1 {
        return Err(LinkError::InsufficientData {
            expected: FRAME_HEADER_SIZE + 1,
            actual: frame.len(),
        });
    }
    let marker = [frame[0], frame[1], frame[2]];
    if &marker != INBOUND_MARKER {
        return Err(LinkError::InvalidFrame(format!(
            "bad marker {}",
            hex::encode(marker)
        )));
    }
    Ok(FrameHeader {
        marker,
        size: frame[3],
        first_byte: frame[4],
    })
}

/// Read the frame tail for a frame with the given declared size.
pub fn parse_tail(frame: &[u8], size: u8) -> Result<FrameTail, LinkError> {
    let size = size as usize;
    if size < 2 || frame.len() < size {
        return Err(LinkError::InsufficientData {
            expected: size.max(2),
            actual: frame.len(),
        });
    }
    Ok(FrameTail {
        control: frame[size - 2],
        frame_type: frame[size - 1],
    })
}

/// Build a bare control frame: `[0, 0, 0, len]` followed by the control bytes.
pub fn control_packet(bytes: &[u8]) -> Bytes {
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + bytes.len());
    frame.extend_from_slice(&[0x00, 0x00, 0x00, bytes.len() as u8]);
    frame.extend_from_slice(bytes);
    Bytes::from(frame)
}

/// An outbound frame paired with the parser for its response. One instance per
/// protocol operation.
#[derive(Debug, Clone)]
pub struct Command<T> {
    pub frame: Bytes,
    pub parse: fn(&Bytes) -> Result<T, LinkError>,
}

/// A paged read is transmitted as a command packet plus its padding
/// continuation.
#[derive(Debug, Clone)]
pub struct PagedCommand {
    pub command: Bytes,
    pub padding: Bytes,
    pub parse: fn(&Bytes) -> Result<Bytes, LinkError>,
}

/// A padding (continuation) frame and the CRC-8 the bridge expects folded into
/// its paired command packet.
#[derive(Debug, Clone)]
pub struct PaddingPacket {
    pub frame: Bytes,
    pub crc: u8,
}

/// First byte of a reassembled response, classified.
#[derive(Debug, Clone)]
pub struct Response<T> {
    pub record_type: ControlCode,
    pub value: T,
}

/// Builds Medtronic command packets for one pump, identified by the 6-digit
/// serial printed on the bridge pairing screen.
pub struct Framer {
    serial: [u8; 6],
    session_header: [u8; 4],
    crc: Crc8,
}

impl Framer {
    pub fn new(serial: &str) -> Result<Self, LinkError> {
        Self::with_algorithm(serial, crate::checksum::BRIDGE_CRC)
    }

    /// Same as [`Framer::new`] with a session-specific CRC-8 generator.
    pub fn with_algorithm(
        serial: &str,
        algorithm: &'static Algorithm<u8>,
    ) -> Result<Self, LinkError> {
        let bytes = serial.as_bytes();
        let serial: [u8; 6] = bytes
            .try_into()
            .map_err(|_| LinkError::Layout(format!("serial must be 6 digits, got {serial:?}")))?;
        let mut session_header = [0xA7, 0, 0, 0];
        for (i, pair) in serial.chunks(2).enumerate() {
            let digits = std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    LinkError::Layout(format!("serial contains non-hex digits: {pair:?}"))
                })?;
            session_header[i + 1] = digits;
        }
        Ok(Self {
            serial,
            session_header,
            crc: Crc8::new(algorithm),
        })
    }

    /// Build a Medtronic command packet.
    ///
    /// `op` selects the bridge operation (`OPEN_CONNECTION` or `SEND_MESSAGE`),
    /// `command` the pump command code, and `parameter` its argument bytes.
    /// A parameter without a command is an undefined protocol state.
    pub fn command_packet(
        &self,
        op: &[u8],
        command: Option<u8>,
        parameter: Option<&[u8]>,
    ) -> Result<Bytes, LinkError> {
        let payload = match (command, parameter) {
            (Some(command), Some(parameter)) => {
                let mut payload = self.session_header.to_vec();
                payload.push(command);
                payload.extend_from_slice(parameter);
                payload.extend_from_slice(&[0u8; PARAMETER_PADDING]);
                payload
            }
            (Some(command), None) => {
                let mut payload = self.session_header.to_vec();
                payload.extend_from_slice(&[command, 0x00]);
                let crc = self.crc.checksum(&payload);
                payload.push(crc);
                payload
            }
            (None, None) => Vec::new(),
            (None, Some(_)) => {
                return Err(LinkError::Layout(
                    "parameter given without a command".into(),
                ));
            }
        };

        let datalen = 30 + op.len() + payload.len();
        let mut bytes = vec![0u8; datalen + FRAME_HEADER_SIZE];
        bytes[3] = datalen as u8;
        bytes[4] = 0x51;
        bytes[5] = 0x01;
        bytes[6..12].copy_from_slice(&self.serial);
        // bytes 12..22 stay zero
        let mut ctr = 22;
        bytes[ctr..ctr + op.len()].copy_from_slice(op);
        ctr += op.len();

        let declared_length = if parameter.is_some() {
            bytes[ctr + 3] = 0x04;
            bytes[ctr + 4] = 0x10;
            bytes[ctr + 5] = 0x10;
            payload.len() as u32 + CONTINUATION_SIZE
        } else {
            payload.len() as u32
        };
        bytes[ctr + 7..ctr + 11].copy_from_slice(&declared_length.to_le_bytes());
        ctr += 11;

        // The checksum covers everything after the transport header, with the
        // payload in place and, for paired transmissions, the padding packet's
        // CRC-8 standing in for the final padding byte.
        let mut check = bytes[FRAME_HEADER_SIZE..].to_vec();
        let payload_at = ctr - FRAME_HEADER_SIZE;
        check[payload_at..payload_at + payload.len()].copy_from_slice(&payload);
        if let (Some(command), Some(parameter)) = (command, parameter) {
            let folded = self.padding_packet(command, parameter).crc;
            let at = payload.len() * 2 + 4;
            *check.get_mut(at).ok_or_else(|| {
                LinkError::Layout(format!("parameter of {} bytes overruns the checksum range", parameter.len()))
            })? = folded;
        }
        bytes[ctr] = sum_lsb(&check);
        bytes[ctr + 1..ctr + 1 + payload.len()].copy_from_slice(&payload);

        tracing::trace!(packet = %hex::encode(&bytes), "command packet built");
        Ok(Bytes::from(bytes))
    }

    /// Build the 43-byte zero continuation of a parameterised command, and the
    /// CRC-8 its paired command packet must fold in.
    pub fn padding_packet(&self, command: u8, parameter: &[u8]) -> PaddingPacket {
        const PADDING_LEN: usize = 43;

        let mut check = self.session_header.to_vec();
        check.push(command);
        check.extend_from_slice(parameter);
        check.extend_from_slice(&[0u8; PARAMETER_PADDING]);
        check.extend_from_slice(&[0u8; PADDING_LEN]);
        let crc = self.crc.checksum(&check);

        let datalen = PADDING_LEN + 1;
        let mut frame = vec![0u8; datalen + FRAME_HEADER_SIZE];
        frame[3] = datalen as u8;
        frame[datalen + FRAME_HEADER_SIZE - 1] = crc;

        tracing::trace!(packet = %hex::encode(&frame), "padding packet built");
        PaddingPacket {
            frame: Bytes::from(frame),
            crc,
        }
    }

    /// Query the pump model string.
    pub fn read_model(&self) -> Result<Command<String>, LinkError> {
        Ok(Command {
            frame: self.command_packet(&SEND_MESSAGE, Some(READ_MODEL), None)?,
            parse: parse_model,
        })
    }

    /// Send a bare pump command; the response payload is not interpreted.
    pub fn send_message(&self, command: u8) -> Result<Command<()>, LinkError> {
        Ok(Command {
            frame: self.command_packet(&SEND_MESSAGE, Some(command), None)?,
            parse: parse_nothing,
        })
    }

    /// Open the pump sub-protocol session.
    pub fn open_connection(&self) -> Result<Command<()>, LinkError> {
        Ok(Command {
            frame: self.command_packet(&OPEN_CONNECTION, None, None)?,
            parse: parse_nothing,
        })
    }

    /// Request one part-stream of a history page.
    pub fn read_page(&self, command: u8, page: u8) -> Result<PagedCommand, LinkError> {
        let parameter = [0x01, page];
        Ok(PagedCommand {
            command: self.command_packet(&SEND_MESSAGE, Some(command), Some(&parameter))?,
            padding: self.padding_packet(command, &parameter).frame,
            parse: parse_page_part,
        })
    }
}

fn parse_nothing(_message: &Bytes) -> Result<(), LinkError> {
    Ok(())
}

fn parse_model(message: &Bytes) -> Result<String, LinkError> {
    let payload = message.get(RESPONSE_PAYLOAD_OFFSET..).ok_or({
        LinkError::InsufficientData {
            expected: RESPONSE_PAYLOAD_OFFSET + 1,
            actual: message.len(),
        }
    })?;
    let length = *payload.first().ok_or(LinkError::InsufficientData {
        expected: RESPONSE_PAYLOAD_OFFSET + 1,
        actual: message.len(),
    })? as usize;
    let raw = payload
        .get(1..1 + length)
        .ok_or(LinkError::InsufficientData {
            expected: RESPONSE_PAYLOAD_OFFSET + 1 + length,
            actual: message.len(),
        })?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| LinkError::Protocol("model string is not valid ASCII".into()))
}

fn parse_page_part(message: &Bytes) -> Result<Bytes, LinkError> {
    let end = RESPONSE_PAYLOAD_OFFSET + PAGE_PART_SIZE;
    if message.len() < end {
        return Err(LinkError::InsufficientData {
            expected: end,
            actual: message.len(),
        });
    }
    Ok(message.slice(RESPONSE_PAYLOAD_OFFSET..end))
}
