use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Marker that starts every telemetry frame on the wire.
pub const MARKER: &[u8] = b"t0368";

const CELL_ID_LENGTH: usize = 2;
const FIELD_LENGTH: usize = 4;

/// Number of ASCII hex characters following the marker.
pub const PAYLOAD_LENGTH: usize = CELL_ID_LENGTH + 3 * FIELD_LENGTH;
/// Total size of a frame that uses the default [`MARKER`].
pub const FRAME_LENGTH: usize = MARKER.len() + PAYLOAD_LENGTH;

const INSTANT_VOLTAGE_OFFSET: usize = CELL_ID_LENGTH;
const RESISTANCE_OFFSET: usize = INSTANT_VOLTAGE_OFFSET + FIELD_LENGTH;
const OCV_OFFSET: usize = RESISTANCE_OFFSET + FIELD_LENGTH;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("Invalid hex in {field} field: {text:?}")]
    InvalidHex { field: &'static str, text: String },
    #[error("Cell id {cell_id} out of range, matrix holds {capacity} cells")]
    CellIdOutOfRange { cell_id: u8, capacity: usize },
}

/// Raw readings carried by every frame, regardless of the active measurement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawFields {
    pub instant_voltage: u16,
    pub resistance: u16,
    pub open_circuit_voltage: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Frame {
    pub cell_id: u8,
    pub fields: RawFields,
}

impl Frame {
    /// Encodes the frame the way the device puts it on the wire, prefixed with [`MARKER`].
    pub fn to_wire(&self) -> Vec<u8> {
        format!(
            "{}{:02X}{:04X}{:04X}{:04X}",
            String::from_utf8_lossy(MARKER),
            self.cell_id,
            self.fields.instant_voltage,
            self.fields.resistance,
            self.fields.open_circuit_voltage
        )
        .into_bytes()
    }

    fn decode(payload: &[u8]) -> std::result::Result<Self, FrameDecodeError> {
        let [cell_id] = decode_hex::<1>(&payload[..CELL_ID_LENGTH], "cell id")?;
        Ok(Self {
            cell_id,
            fields: RawFields {
                instant_voltage: u16::from_be_bytes(decode_hex(
                    &payload[INSTANT_VOLTAGE_OFFSET..RESISTANCE_OFFSET],
                    "instant voltage",
                )?),
                resistance: u16::from_be_bytes(decode_hex(
                    &payload[RESISTANCE_OFFSET..OCV_OFFSET],
                    "resistance",
                )?),
                open_circuit_voltage: u16::from_be_bytes(decode_hex(
                    &payload[OCV_OFFSET..PAYLOAD_LENGTH],
                    "open circuit voltage",
                )?),
            },
        })
    }
}

fn decode_hex<const N: usize>(
    text: &[u8],
    field: &'static str,
) -> std::result::Result<[u8; N], FrameDecodeError> {
    let mut value = [0; N];
    hex::decode_to_slice(text, &mut value).map_err(|_| FrameDecodeError::InvalidHex {
        field,
        text: String::from_utf8_lossy(text).into_owned(),
    })?;
    Ok(value)
}

/// Result of one [`scan`] pass over a buffer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScanOutcome {
    /// Frames decoded in buffer order.
    pub frames: Vec<Frame>,
    /// Frames that were complete but could not be decoded.
    pub errors: Vec<FrameDecodeError>,
    /// Number of leading bytes that are done with. Everything after this
    /// index belongs to a frame that is not complete yet.
    pub consumed: usize,
}

fn find(buffer: &[u8], marker: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(marker.len())
        .position(|window| window == marker)
        .map(|position| position + from)
}

/// Length of the longest suffix of `tail` that is a proper prefix of `marker`.
fn partial_marker_len(tail: &[u8], marker: &[u8]) -> usize {
    (1..marker.len().min(tail.len() + 1))
        .rev()
        .find(|&n| tail.ends_with(&marker[..n]))
        .unwrap_or(0)
}

/// Locates and decodes every complete `marker`-prefixed frame in `buffer`.
///
/// Scanning resumes right after the end of the previous frame, so marker bytes
/// inside a payload never start a new frame. A malformed frame is reported in
/// [`ScanOutcome::errors`] and skipped. A marker without its full payload, or
/// a trailing fragment of a marker, is left unconsumed for the next call.
pub fn scan(buffer: &[u8], marker: &[u8]) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    if marker.is_empty() {
        outcome.consumed = buffer.len();
        return outcome;
    }
    let frame_length = marker.len() + PAYLOAD_LENGTH;
    let mut end_index = 0;

    loop {
        let Some(start) = find(buffer, marker, end_index) else {
            outcome.consumed = buffer.len() - partial_marker_len(&buffer[end_index..], marker);
            break;
        };
        if buffer.len() - start < frame_length {
            log::trace!(
                "Partial frame at {start} - required={frame_length} available={}",
                buffer.len() - start
            );
            outcome.consumed = start;
            break;
        }
        let payload = &buffer[start + marker.len()..start + frame_length];
        match Frame::decode(payload) {
            Ok(frame) => {
                log::trace!("Frame at {start}: {frame:?}");
                outcome.frames.push(frame);
            }
            Err(err) => {
                log::debug!("Skipping malformed frame at {start}: {err}");
                outcome.errors.push(err);
            }
        }
        end_index = start + frame_length;
    }
    outcome
}
