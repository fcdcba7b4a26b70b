//! Device-communication engine for Medtronic Paradigm insulin pumps reached
//! through a Bayer Contour Next Link bridge.
//!
//! The bridge presents a meter-emulation interface over 64-byte HID frames;
//! a pump command protocol is tunnelled under it. This crate owns the packet
//! framing with its paired checksums, multi-frame message reassembly, the
//! connection handshake, paginated history retrieval, and the table-driven
//! decoder that turns raw history pages into typed records and clinical
//! events. The physical HID handle stays outside, behind [`Transport`].

pub mod checksum;
pub mod constants;
pub mod device;
pub mod error;
pub mod events;
pub mod message;
pub mod packet;
pub mod records;

pub use device::{ContourLink, Transport};
pub use error::LinkError;
pub use records::{DecodedRecord, Page, PumpModel};
