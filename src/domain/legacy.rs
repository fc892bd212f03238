//! Legacy record decoders
//!
//! A decompressed legacy container is a sequence of 8-byte records, four
//! little-endian `u16` words each. The first word identifies the record:
//!
//! ```text
//! FFFF x y p     : point, absolute device units
//! FFFF FFFF FFFF FFFF : implicit stroke break
//! EEEE t a b     : stroke header, t = time offset in report intervals
//! DDDD n 0 0     : n lost points
//! FFFE v 0 0     : switch sub-format, v = 1 fixed, v = 2 tagged
//! 0000 ...       : padding
//! ```
//!
//! In the tagged sub-format the stroke header also carries the pen type in the
//! low byte of `a` and flags in its high byte (bit 0: new layer, bit 7: an
//! 8-byte pen id record follows the header).

use crate::domain::models::{Point, ProtocolVariant, Stroke};
use crate::domain::strokes::{FormatError, POINT_REPORT_INTERVAL_MS};
use tracing::{debug, trace};

pub const RECORD_SIZE: usize = 8;

const MARKER_POINT: u16 = 0xFFFF;
const MARKER_STROKE_HEADER: u16 = 0xEEEE;
const MARKER_LOST_POINTS: u16 = 0xDDDD;
const MARKER_SUB_FORMAT: u16 = 0xFFFE;
const MARKER_PADDING: u16 = 0x0000;

const FLAG_NEW_LAYER: u8 = 0x01;
const FLAG_PEN_ID: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormat {
    Fixed,
    Tagged,
}

impl SubFormat {
    fn from_word(word: u16) -> Result<Self, FormatError> {
        match word {
            1 => Ok(Self::Fixed),
            2 => Ok(Self::Tagged),
            other => Err(FormatError::UnknownSubFormat(other)),
        }
    }
}

fn words(record: &[u8]) -> [u16; 4] {
    [0, 1, 2, 3].map(|i| u16::from_le_bytes([record[i * 2], record[i * 2 + 1]]))
}

struct RecordDecoder {
    variant: ProtocolVariant,
    base_time_ms: i64,
    format: SubFormat,
    current: Stroke,
    strokes: Vec<Stroke>,
}

impl RecordDecoder {
    /// Strokes made only of lost-point placeholders are dropped
    fn close_stroke(&mut self) {
        let stroke = std::mem::take(&mut self.current);
        if stroke.has_valid_points() {
            self.strokes.push(stroke);
        }
    }

    fn push_point(&mut self, x: u16, y: u16, p: u16) {
        let point_size = self.variant.point_size();
        self.current.points.push(Point {
            x: x as f64 * point_size,
            y: y as f64 * point_size,
            pressure: self.variant.normalize_pressure(p as i32),
        });
    }

    /// Returns true when the following record is a pen id
    fn start_stroke(&mut self, [_, offset, attrs, _]: [u16; 4]) -> bool {
        self.close_stroke();
        self.current.timestamp_ms =
            Some(self.base_time_ms + offset as i64 * POINT_REPORT_INTERVAL_MS);

        match self.format {
            SubFormat::Fixed => false,
            SubFormat::Tagged => {
                let [pen_type, flags] = attrs.to_le_bytes();
                self.current.pen_type = Some(pen_type);
                self.current.new_layer = flags & FLAG_NEW_LAYER != 0;
                flags & FLAG_PEN_ID != 0
            }
        }
    }
}

/// Decode decompressed legacy records into strokes.
///
/// Decoding starts in the fixed sub-format until a sub-format record says
/// otherwise.
pub fn decode_records(
    data: &[u8],
    variant: ProtocolVariant,
    base_timestamp: i64,
) -> Result<Vec<Stroke>, FormatError> {
    if data.len() % RECORD_SIZE != 0 {
        return Err(FormatError::TruncatedRecord(
            data.len() - data.len() % RECORD_SIZE,
        ));
    }

    let mut decoder = RecordDecoder {
        variant,
        base_time_ms: base_timestamp * 1000,
        format: SubFormat::Fixed,
        current: Stroke::default(),
        strokes: Vec::new(),
    };

    let mut records = data.chunks_exact(RECORD_SIZE).enumerate();
    while let Some((index, record)) = records.next() {
        let w = words(record);
        trace!("Record {}: {:04x?}", index, w);

        match w[0] {
            MARKER_POINT if w[1..] == [0xFFFF; 3] => decoder.close_stroke(),
            MARKER_POINT => decoder.push_point(w[1], w[2], w[3]),
            MARKER_STROKE_HEADER => {
                if decoder.start_stroke(w) {
                    let (_, pen_record) = records
                        .next()
                        .ok_or(FormatError::TruncatedRecord((index + 1) * RECORD_SIZE))?;
                    let mut id = [0u8; 8];
                    id.copy_from_slice(pen_record);
                    decoder.current.pen_id = Some(u64::from_le_bytes(id));
                }
            }
            MARKER_LOST_POINTS => {
                debug!("{} lost points before record {}", w[1], index);
                decoder
                    .current
                    .points
                    .extend(std::iter::repeat(Point::lost()).take(w[1] as usize));
            }
            MARKER_SUB_FORMAT => {
                decoder.format = SubFormat::from_word(w[1])?;
                debug!("Legacy sub-format switched to {:?}", decoder.format);
            }
            MARKER_PADDING => {}
            other => debug!("Skipping unknown record {:#06x} at {}", other, index),
        }
    }

    decoder.close_stroke();
    Ok(decoder.strokes)
}
