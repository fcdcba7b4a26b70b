//! Typed field extraction for the record kinds the extractor reports on:
//! boluses, bolus-wizard calculations, and linked glucose readings.
//!
//! Values live in packed sub-byte fields: multi-byte quantities are a masked
//! high-bits byte concatenated with a full low byte, read big-endian; insulin
//! quantities are stroke counts divided by the model scale; small-model wizard
//! corrections are two's-complement. A bolus with a nonzero duration is a
//! square-wave delivery, and becomes a dual-wave delivery when the pump-state
//! bits in the date's hour byte read binary 10, in which case the following
//! bolus record is its normal portion and the pair merges into one event.

use crate::error::LinkError;
use crate::records::{DecodedRecord, PumpModel, RecordKind};
use bytes::Bytes;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::trace;

const LEFT_TWO: u8 = 0xC0; // b11000000
const RIGHT_TWO: u8 = 0x03; // b00000011
const RIGHT_1100: u8 = 0x0C; // b00001100
const RIGHT_THREE: u8 = 0x07; // b00000111
const LEFT_00111: u8 = 0x38; // b00111000
const RIGHT_FOUR: u8 = 0x0F; // b00001111

const MIN_TO_MSEC: i64 = 60_000;

/// Keep only records of the given kinds, preserving order.
pub fn filter_by_kind<'a>(
    records: &'a [DecodedRecord],
    kinds: &[RecordKind],
) -> Vec<&'a DecodedRecord> {
    records
        .iter()
        .filter(|record| kinds.contains(&record.kind()))
        .collect()
}

/// Two's-complement correction for a byte holding a signed quantity.
pub fn twos_complement(value: u8) -> i16 {
    if value & 0x80 != 0 {
        value as i16 - 256
    } else {
        value as i16
    }
}

fn be_short(high: u8, low: u8) -> u16 {
    ((high as u16) << 8) | low as u16
}

fn byte(bytes: &Bytes, index: usize) -> Result<u8, LinkError> {
    bytes
        .get(index)
        .copied()
        .ok_or(LinkError::InsufficientData {
            expected: index + 1,
            actual: bytes.len(),
        })
}

/// A square or extended delivery as programmed before cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedSquare {
    pub amount: f64,
    pub duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BolusDelivery {
    Normal {
        amount: f64,
        /// Programmed amount, present when delivery was cut short.
        expected: Option<f64>,
    },
    Square {
        amount: f64,
        /// Actual duration; rescaled proportionally when cancelled.
        duration_ms: i64,
        expected: Option<ExpectedSquare>,
    },
    Dual {
        extended: f64,
        duration_ms: i64,
        expected_extended: Option<ExpectedSquare>,
        normal: f64,
        expected_normal: Option<f64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BolusEvent {
    pub timestamp: Option<NaiveDateTime>,
    pub index: usize,
    pub iob: Option<f64>,
    pub delivery: BolusDelivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub carb: f64,
    pub correction: f64,
    pub net: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardEvent {
    pub timestamp: Option<NaiveDateTime>,
    pub index: usize,
    pub bg_input: u16,
    pub carb_input: u16,
    pub carb_ratio: f64,
    pub insulin_sensitivity: u8,
    pub bg_target_low: u8,
    pub bg_target_high: u8,
    pub recommendation: Recommendation,
    pub iob: f64,
}

/// A meter reading the bridge relayed to the pump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlucoseEvent {
    pub timestamp: Option<NaiveDateTime>,
    pub index: usize,
    /// mg/dL.
    pub value: u16,
    pub meter_serial: String,
}

fn bolus_amounts(
    record: &DecodedRecord,
    model: &PumpModel,
) -> Result<(f64, f64, Option<f64>), LinkError> {
    let strokes = model.strokes_per_unit();
    let head = &record.head;
    if model.is_larger() {
        let amount = be_short(byte(head, 3)?, byte(head, 4)?) as f64 / strokes;
        let programmed = be_short(byte(head, 1)?, byte(head, 2)?) as f64 / strokes;
        let iob = be_short(byte(head, 5)?, byte(head, 6)?) as f64 / strokes;
        Ok((amount, programmed, Some(iob)))
    } else {
        let amount = byte(head, 2)? as f64 / strokes;
        let programmed = byte(head, 1)? as f64 / strokes;
        Ok((amount, programmed, None))
    }
}

fn rescaled_duration(amount: f64, programmed: f64, duration_ms: i64) -> i64 {
    ((amount / programmed) * duration_ms as f64).round() as i64
}

/// Build bolus events, merging dual-wave pairs into single events.
pub fn build_bolus_events(
    records: &[DecodedRecord],
    model: &PumpModel,
) -> Result<Vec<BolusEvent>, LinkError> {
    let boluses = filter_by_kind(records, &[RecordKind::Bolus]);
    let mut events = Vec::new();

    let mut i = 0;
    while i < boluses.len() {
        let mut record = boluses[i];
        let (amount, programmed, mut iob) = bolus_amounts(record, model)?;
        let duration_ms = record.head.get(7).copied().unwrap_or(0) as i64 * 30 * MIN_TO_MSEC;
        trace!(index = record.index, amount, programmed, duration_ms, "bolus record");

        let delivery = if duration_ms > 0 {
            // Pump-state bits in the hour byte: binary 10 marks a dual-wave
            // delivery whose normal portion follows as the next bolus record.
            if byte(&record.date, 2)? & LEFT_TWO == 0x80 {
                let cancelled = programmed != amount;
                let extended_duration = if cancelled {
                    rescaled_duration(amount, programmed, duration_ms)
                } else {
                    duration_ms
                };
                let expected_extended = cancelled.then_some(ExpectedSquare {
                    amount: programmed,
                    duration_ms,
                });

                i += 1;
                record = boluses.get(i).copied().ok_or_else(|| {
                    LinkError::Protocol("dual-wave bolus missing its normal portion".into())
                })?;
                let (normal, normal_programmed, normal_iob) = bolus_amounts(record, model)?;
                iob = normal_iob;

                BolusDelivery::Dual {
                    extended: amount,
                    duration_ms: extended_duration,
                    expected_extended,
                    normal,
                    expected_normal: (normal_programmed != normal).then_some(normal_programmed),
                }
            } else {
                let cancelled = programmed != amount;
                BolusDelivery::Square {
                    amount,
                    duration_ms: if cancelled {
                        rescaled_duration(amount, programmed, duration_ms)
                    } else {
                        duration_ms
                    },
                    expected: cancelled.then_some(ExpectedSquare {
                        amount: programmed,
                        duration_ms,
                    }),
                }
            }
        } else {
            BolusDelivery::Normal {
                amount,
                expected: (programmed != amount).then_some(programmed),
            }
        };

        events.push(BolusEvent {
            timestamp: record.timestamp,
            index: record.index,
            iob,
            delivery,
        });
        i += 1;
    }

    Ok(events)
}

/// Build wizard events from bolus-wizard records.
pub fn build_wizard_events(
    records: &[DecodedRecord],
    model: &PumpModel,
) -> Result<Vec<WizardEvent>, LinkError> {
    let strokes = model.strokes_per_unit();
    let mut events = Vec::new();

    for record in filter_by_kind(records, &[RecordKind::BolusWizard]) {
        let head = &record.head;
        let body = &record.body;
        trace!(
            index = record.index,
            body = %hex::encode(body),
            "wizard record"
        );

        let event = if model.is_larger() {
            WizardEvent {
                timestamp: record.timestamp,
                index: record.index,
                bg_input: be_short(byte(body, 1)? & RIGHT_TWO, byte(head, 1)?),
                carb_input: be_short((byte(body, 1)? & RIGHT_1100) >> 2, byte(body, 0)?),
                carb_ratio: be_short(byte(body, 2)? & RIGHT_THREE, byte(body, 3)?) as f64 / 10.0,
                insulin_sensitivity: byte(body, 4)?,
                bg_target_low: byte(body, 5)?,
                bg_target_high: byte(body, 14)?,
                recommendation: Recommendation {
                    carb: be_short(byte(body, 7)?, byte(body, 8)?) as f64 / strokes,
                    correction: be_short((byte(body, 9)? & LEFT_00111) >> 3, byte(body, 6)?)
                        as f64
                        / strokes,
                    net: be_short(byte(body, 12)?, byte(body, 13)?) as f64 / strokes,
                },
                iob: be_short(byte(body, 10)?, byte(body, 11)?) as f64 / strokes,
            }
        } else {
            let correction_high = twos_complement(byte(body, 5)? & RIGHT_FOUR) as i32;
            let correction_low = twos_complement(byte(body, 7)?) as i32;
            WizardEvent {
                timestamp: record.timestamp,
                index: record.index,
                bg_input: be_short(byte(body, 1)? & RIGHT_FOUR, byte(head, 1)?),
                carb_input: byte(body, 0)? as u16,
                carb_ratio: byte(body, 2)? as f64,
                insulin_sensitivity: byte(body, 3)?,
                bg_target_low: byte(body, 4)?,
                bg_target_high: byte(body, 12)?,
                recommendation: Recommendation {
                    carb: be_short(byte(body, 6)?, byte(body, 7)?) as f64 / strokes,
                    correction: ((correction_high << 8) + correction_low) as f64 / strokes,
                    net: be_short(byte(body, 11)?, byte(body, 12)?) as f64 / strokes,
                },
                iob: be_short(byte(body, 9)?, byte(body, 10)?) as f64 / strokes,
            }
        };
        events.push(event);
    }

    Ok(events)
}

/// Build glucose events from meter readings the bridge forwarded.
pub fn build_glucose_events(records: &[DecodedRecord]) -> Result<Vec<GlucoseEvent>, LinkError> {
    let mut events = Vec::new();
    for record in filter_by_kind(records, &[RecordKind::BgReceived]) {
        let value =
            ((byte(&record.head, 1)? as u16) << 3) + ((byte(&record.date, 2)? >> 5) as u16);
        let serial = record.body.get(..3).ok_or(LinkError::InsufficientData {
            expected: 3,
            actual: record.body.len(),
        })?;
        events.push(GlucoseEvent {
            timestamp: record.timestamp,
            index: record.index,
            value,
            meter_serial: hex::encode(serial),
        });
    }
    Ok(events)
}
