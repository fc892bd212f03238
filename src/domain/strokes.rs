//! Stroke Decoder
//!
//! Turns one downloaded container into a [`Drawing`].
//!
//! ## Container signatures
//!
//! ```text
//! 62 38 62 74 : direct stroke stream, 4-byte header
//! 67 82 69 65 : direct stroke stream, 16-byte header
//! 63 38 62 74 : compressed legacy records, 4-byte header
//! 68 82 69 65 : compressed legacy records, 16-byte header
//!
//! 16-byte header:
//! [0-3]   : signature
//! [4-7]   : timestamp (u32 little-endian, Unix seconds)
//! [8-9]   : reserved
//! [10-13] : stroke count (u32 little-endian)
//! [14-15] : reserved
//! ```
//!
//! ## Direct stream packets
//!
//! Every packet starts with a header byte. The number of set bits in the
//! header is the number of payload bytes that follow it. Bits 0-1 select the
//! packet kind, bits 2-3, 4-5 and 6-7 describe x, y and pressure:
//!
//! ```text
//! 0b00 : axis not present
//! 0b10 : i8 delta
//! 0b11 : u16 absolute, little-endian
//! 0b01 : invalid
//! ```
//!
//! Kind `0b00` is a delta packet whose payload is just the axis fields. Kind
//! `0b11` carries a marker at the start of the payload:
//!
//! ```text
//! ff ff ...            : point, axis fields follow the marker
//! fa ...               : stroke header (pen type, flags)
//! ff ee ee ...         : stroke header (time offset)
//! dd dd n n ...       : lost points, u16 little-endian count
//! fc ff ff ff ff ff ff : end of stroke
//! ff ff ff ff ff ff ff ff : end of stream
//! ```

use crate::domain::compression::{self, DecompressError};
use crate::domain::legacy;
use crate::domain::models::{Drawing, FileInfo, Point, ProtocolVariant, Stroke};
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const SIGNATURE_DIRECT: [u8; 4] = [0x62, 0x38, 0x62, 0x74];
pub const SIGNATURE_DIRECT_EXTENDED: [u8; 4] = [0x67, 0x82, 0x69, 0x65];
pub const SIGNATURE_LEGACY: [u8; 4] = [0x63, 0x38, 0x62, 0x74];
pub const SIGNATURE_LEGACY_EXTENDED: [u8; 4] = [0x68, 0x82, 0x69, 0x65];

const SHORT_HEADER_SIZE: usize = 4;
const EXTENDED_HEADER_SIZE: usize = 16;

/// Milliseconds between two pen reports
pub const POINT_REPORT_INTERVAL_MS: i64 = 5;

const EOF_MARKER: [u8; 8] = [0xFF; 8];
const STROKE_END_MARKER: [u8; 7] = [0xFC, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("container is too short for its header ({0} bytes)")]
    ShortHeader(usize),
    #[error("unknown container signature {0:02x?}")]
    UnknownSignature([u8; 4]),
    #[error("decompression failed: {0}")]
    Decompress(#[from] DecompressError),
    #[error("legacy record truncated at offset {0}")]
    TruncatedRecord(usize),
    #[error("unknown legacy sub-format {0:#06x}")]
    UnknownSubFormat(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Direct,
    Legacy,
}

/// Parsed container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub kind: ContainerKind,
    pub header_size: usize,
    pub timestamp: Option<i64>,
    pub stroke_count: Option<u32>,
}

impl ContainerHeader {
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let signature: [u8; 4] = data
            .get(..4)
            .and_then(|s| s.try_into().ok())
            .ok_or(FormatError::ShortHeader(data.len()))?;

        let (kind, extended) = match signature {
            SIGNATURE_DIRECT => (ContainerKind::Direct, false),
            SIGNATURE_DIRECT_EXTENDED => (ContainerKind::Direct, true),
            SIGNATURE_LEGACY => (ContainerKind::Legacy, false),
            SIGNATURE_LEGACY_EXTENDED => (ContainerKind::Legacy, true),
            other => return Err(FormatError::UnknownSignature(other)),
        };

        if !extended {
            return Ok(Self {
                kind,
                header_size: SHORT_HEADER_SIZE,
                timestamp: None,
                stroke_count: None,
            });
        }

        if data.len() < EXTENDED_HEADER_SIZE {
            return Err(FormatError::ShortHeader(data.len()));
        }
        let timestamp = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as i64;
        let stroke_count = u32::from_le_bytes([data[10], data[11], data[12], data[13]]);

        Ok(Self {
            kind,
            header_size: EXTENDED_HEADER_SIZE,
            timestamp: Some(timestamp),
            stroke_count: Some(stroke_count),
        })
    }
}

/// Decode one raw file.
///
/// `info` is the metadata queried before the download; the container's own
/// header wins where it carries the same field.
pub fn decode_container(
    data: &[u8],
    variant: ProtocolVariant,
    info: FileInfo,
) -> Result<Drawing, FormatError> {
    let header = ContainerHeader::parse(data)?;
    let body = &data[header.header_size..];
    let timestamp = header.timestamp.unwrap_or(info.timestamp);

    debug!(
        "Decoding {:?} container: {} body bytes, variant {}",
        header.kind,
        body.len(),
        variant
    );

    let strokes = match header.kind {
        ContainerKind::Direct => StrokeScanner::new(variant, timestamp).scan(body),
        ContainerKind::Legacy => {
            let records = compression::decompress(body)?;
            legacy::decode_records(&records, variant, timestamp)?
        }
    };

    let expected = header.stroke_count.unwrap_or(info.stroke_count);
    if expected != 0 && expected as usize != strokes.len() {
        warn!(
            "Stroke count mismatch: device declared {}, decoded {}",
            expected,
            strokes.len()
        );
    }

    Ok(Drawing {
        timestamp,
        dimensions: variant.canvas_size(),
        strokes,
    })
}

/// Running value of one axis: last absolute plus accumulated deltas
#[derive(Debug, Clone, Copy, Default)]
struct Axis {
    absolute: i32,
    delta: i32,
}

impl Axis {
    fn set_absolute(&mut self, value: u16) {
        self.absolute = value as i32;
        self.delta = 0;
    }

    fn add_delta(&mut self, delta: i8) {
        self.delta += delta as i32;
    }

    fn value(&self) -> i32 {
        self.absolute + self.delta
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AxisField {
    Missing,
    Delta(i8),
    Absolute(u16),
}

/// Parse the three axis fields described by a header byte.
///
/// Returns `None` when a mask is invalid or the payload is too short.
fn parse_axis_fields(header: u8, payload: &[u8]) -> Option<[AxisField; 3]> {
    let mut fields = [AxisField::Missing; 3];
    let mut offset = 0;
    for (i, field) in fields.iter_mut().enumerate() {
        *field = match (header >> (2 + i * 2)) & 0b11 {
            0b00 => AxisField::Missing,
            0b10 => {
                let b = *payload.get(offset)?;
                offset += 1;
                AxisField::Delta(b as i8)
            }
            0b11 => {
                let b = payload.get(offset..offset + 2)?;
                offset += 2;
                AxisField::Absolute(u16::from_le_bytes([b[0], b[1]]))
            }
            _ => return None,
        };
    }
    Some(fields)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Packet<'a> {
    StrokeEnd,
    StrokeHeader(&'a [u8]),
    LostPoints(u16),
    Point([AxisField; 3]),
    Delta([AxisField; 3]),
    Unknown,
}

/// Scanner for the direct (uncompressed) packet stream
pub struct StrokeScanner {
    variant: ProtocolVariant,
    base_time_ms: i64,
    axes: [Axis; 3],
    current: Stroke,
    strokes: Vec<Stroke>,
}

impl StrokeScanner {
    pub fn new(variant: ProtocolVariant, base_timestamp: i64) -> Self {
        Self {
            variant,
            base_time_ms: base_timestamp * 1000,
            axes: [Axis::default(); 3],
            current: Stroke::default(),
            strokes: Vec::new(),
        }
    }

    /// Scan a packet stream into strokes.
    ///
    /// Unknown packets are skipped by their header's payload length. A
    /// truncated trailing packet ends the scan; strokes already decoded are
    /// kept.
    pub fn scan(mut self, data: &[u8]) -> Vec<Stroke> {
        let mut pos = 0;

        while pos < data.len() {
            let rest = &data[pos..];
            let size = rest[0].count_ones() as usize + 1;

            if rest.starts_with(&EOF_MARKER) {
                trace!("End of stream at offset {}", pos);
                break;
            }
            if rest.len() < size {
                warn!(
                    "Truncated packet at offset {} ({} of {} bytes)",
                    pos,
                    rest.len(),
                    size
                );
                break;
            }

            let packet = Self::classify(&rest[..size]);
            trace!("Offset {}: {:?}", pos, packet);
            match packet {
                Packet::StrokeEnd => {
                    self.close_stroke();
                    self.reset_deltas();
                }
                Packet::StrokeHeader(payload) => {
                    self.close_stroke();
                    self.reset_deltas();
                    self.apply_stroke_header(payload);
                }
                Packet::LostPoints(count) => {
                    debug!("Device reported {} lost points at offset {}", count, pos);
                    self.current
                        .points
                        .extend(std::iter::repeat(Point::lost()).take(count as usize));
                }
                Packet::Point(fields) | Packet::Delta(fields) => {
                    self.apply_fields(fields);
                    self.push_point();
                }
                Packet::Unknown => {
                    debug!(
                        "Skipping unknown packet {:02x?} at offset {}",
                        &rest[..size],
                        pos
                    );
                }
            }

            pos += size;
        }

        self.close_stroke();
        self.strokes
    }

    fn classify(packet: &[u8]) -> Packet<'_> {
        let header = packet[0];
        let payload = &packet[1..];

        if packet == STROKE_END_MARKER {
            return Packet::StrokeEnd;
        }

        match header & 0b11 {
            // a delta packet must move at least one axis
            0b00 => match parse_axis_fields(header, payload) {
                Some(fields) if fields.iter().any(|f| *f != AxisField::Missing) => {
                    Packet::Delta(fields)
                }
                _ => Packet::Unknown,
            },
            0b11 => {
                if payload.first() == Some(&0xFA) || payload.starts_with(&[0xFF, 0xEE, 0xEE]) {
                    Packet::StrokeHeader(payload)
                } else if payload.starts_with(&[0xFF, 0xFF]) {
                    match parse_axis_fields(header, &payload[2..]) {
                        Some(fields) => Packet::Point(fields),
                        None => Packet::Unknown,
                    }
                } else if payload.starts_with(&[0xDD, 0xDD]) {
                    let count = payload
                        .get(2..4)
                        .map_or(0, |n| u16::from_le_bytes([n[0], n[1]]));
                    Packet::LostPoints(count)
                } else {
                    Packet::Unknown
                }
            }
            _ => Packet::Unknown,
        }
    }

    fn apply_fields(&mut self, fields: [AxisField; 3]) {
        for (axis, field) in self.axes.iter_mut().zip(fields) {
            match field {
                AxisField::Missing => {}
                AxisField::Delta(d) => axis.add_delta(d),
                AxisField::Absolute(v) => axis.set_absolute(v),
            }
        }
    }

    /// Only the running deltas reset; the absolute baseline carries over.
    fn reset_deltas(&mut self) {
        for axis in &mut self.axes {
            axis.delta = 0;
        }
    }

    fn apply_stroke_header(&mut self, payload: &[u8]) {
        if payload.first() == Some(&0xFA) {
            // fa <pen type> <flags>
            self.current.pen_type = payload.get(1).copied();
            self.current.new_layer = payload.get(2).is_some_and(|f| f & 0x01 != 0);
        } else if let Some(offset) = payload.get(3..5) {
            // ff ee ee <time offset, u16 le>
            let offset = u16::from_le_bytes([offset[0], offset[1]]) as i64;
            self.current.timestamp_ms =
                Some(self.base_time_ms + offset * POINT_REPORT_INTERVAL_MS);
        }
    }

    fn push_point(&mut self) {
        let point_size = self.variant.point_size();
        let [x, y, p] = self.axes;
        self.current.points.push(Point {
            x: x.value() as f64 * point_size,
            y: y.value() as f64 * point_size,
            pressure: self.variant.normalize_pressure(p.value()),
        });
    }

    /// Strokes without a real point stay open so consecutive headers merge
    /// their metadata; stray lost-point placeholders are discarded.
    fn close_stroke(&mut self) {
        if !self.current.has_valid_points() {
            self.current.points.clear();
            return;
        }
        self.strokes.push(std::mem::take(&mut self.current));
    }
}
