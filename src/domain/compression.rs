//! Container Decompressor
//!
//! Reverses the predictive delta coding used by legacy stroke containers.
//!
//! The stream is a sequence of units. Each unit starts with a tag byte that
//! holds one 2-bit opcode per lane (lane 0 in the lowest bits), followed by the
//! operands of the lanes that need one, in lane order:
//!
//! ```text
//! 0b00 : predicted value, 2 * prev - prev2        (no operand)
//! 0b01 : predicted value + i8 delta               (1 byte)
//! 0b10 : literal u16, little-endian; resets the   (2 bytes)
//!        lane history to the literal
//! 0b11 : reserved
//! ```
//!
//! Every unit yields four 16-bit values, written little-endian in lane order,
//! so the output is always a multiple of 8 bytes. All arithmetic wraps at
//! 16 bits.

use thiserror::Error;

pub const LANES: usize = 4;

/// Output bytes produced per unit
pub const UNIT_SIZE: usize = LANES * 2;

const OP_PREDICT: u8 = 0b00;
const OP_DELTA: u8 = 0b01;
const OP_LITERAL: u8 = 0b10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecompressError {
    #[error("compressed stream ends inside a unit at offset {offset}")]
    Truncated { offset: usize },
    #[error("reserved lane opcode in tag {tag:#04x} at offset {offset}")]
    ReservedOpcode { tag: u8, offset: usize },
}

#[derive(Debug, Clone, Copy, Default)]
struct Lane {
    prev: u16,
    prev2: u16,
}

impl Lane {
    fn predict(&self) -> u16 {
        self.prev.wrapping_mul(2).wrapping_sub(self.prev2)
    }

    fn push(&mut self, value: u16) {
        self.prev2 = self.prev;
        self.prev = value;
    }

    fn reset(&mut self, value: u16) {
        self.prev2 = value;
        self.prev = value;
    }
}

/// Decompress a whole legacy payload.
///
/// Decoding state lives only for the duration of the call.
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, DecompressError> {
    let mut lanes = [Lane::default(); LANES];
    let mut out = Vec::with_capacity(input.len() * 2);
    let mut pos = 0;

    while pos < input.len() {
        let unit_start = pos;
        let tag = input[pos];
        pos += 1;

        for (i, lane) in lanes.iter_mut().enumerate() {
            let value = match (tag >> (i * 2)) & 0b11 {
                OP_PREDICT => {
                    let v = lane.predict();
                    lane.push(v);
                    v
                }
                OP_DELTA => {
                    let d = *input
                        .get(pos)
                        .ok_or(DecompressError::Truncated { offset: unit_start })?
                        as i8;
                    pos += 1;
                    let v = lane.predict().wrapping_add(d as i16 as u16);
                    lane.push(v);
                    v
                }
                OP_LITERAL => {
                    let bytes = input
                        .get(pos..pos + 2)
                        .ok_or(DecompressError::Truncated { offset: unit_start })?;
                    pos += 2;
                    let v = u16::from_le_bytes([bytes[0], bytes[1]]);
                    lane.reset(v);
                    v
                }
                _ => {
                    return Err(DecompressError::ReservedOpcode {
                        tag,
                        offset: unit_start,
                    })
                }
            };
            out.extend_from_slice(&value.to_le_bytes());
        }
    }

    Ok(out)
}

/// Reference encoder used to build fixtures
#[cfg(test)]
pub(crate) fn compress(units: &[[u16; LANES]]) -> Vec<u8> {
    let mut lanes = [Lane::default(); LANES];
    let mut out = Vec::new();

    for unit in units {
        let mut tag = 0u8;
        let mut operands = Vec::new();
        for (i, (lane, &value)) in lanes.iter_mut().zip(unit.iter()).enumerate() {
            let predicted = lane.predict();
            let diff = value.wrapping_sub(predicted) as i16;
            if diff == 0 {
                lane.push(value);
            } else if (i8::MIN as i16..=i8::MAX as i16).contains(&diff) {
                tag |= OP_DELTA << (i * 2);
                operands.push(diff as i8 as u8);
                lane.push(value);
            } else {
                tag |= OP_LITERAL << (i * 2);
                operands.extend_from_slice(&value.to_le_bytes());
                lane.reset(value);
            }
        }
        out.push(tag);
        out.extend(operands);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(bytes: &[u8]) -> Vec<u16> {
        bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_literal_then_prediction() {
        // unit 1: four literals; unit 2: all predicted (history was reset)
        let input = [
            0b1010_1010,
            0x10, 0x00, 0x20, 0x00, 0x30, 0x00, 0x40, 0x00,
            0x00,
        ];
        let out = decompress(&input).unwrap();
        assert_eq!(out.len(), 2 * UNIT_SIZE);
        assert_eq!(words(&out), vec![0x10, 0x20, 0x30, 0x40, 0x10, 0x20, 0x30, 0x40]);
    }

    #[test]
    fn test_linear_extrapolation() {
        // lane 0: literal 100, delta +5 (pred 100 -> 105), then predicted 110, 115
        let input = [0b10, 100, 0, 0b01, 5, 0x00, 0x00];
        let lane0: Vec<u16> = words(&decompress(&input).unwrap())
            .chunks(LANES)
            .map(|u| u[0])
            .collect();
        assert_eq!(lane0, vec![100, 105, 110, 115]);
    }

    #[test]
    fn test_negative_delta_wraps() {
        let input = [0b01, 0xFF];
        assert_eq!(words(&decompress(&input).unwrap())[0], 0xFFFF);
    }

    #[test]
    fn test_truncated_operand() {
        let input = [0b10, 0x01];
        assert_eq!(
            decompress(&input),
            Err(DecompressError::Truncated { offset: 0 })
        );
    }

    #[test]
    fn test_reserved_opcode() {
        assert!(matches!(
            decompress(&[0x00, 0b11]),
            Err(DecompressError::ReservedOpcode { tag: 0b11, offset: 1 })
        ));
    }

    #[test]
    fn test_deterministic_and_matches_reference_encoder() {
        let units = [
            [0xFFFF, 1000, 2000, 300],
            [0xFFFF, 1003, 1998, 310],
            [0xFFFF, 1006, 1996, 320],
            [0xEEEE, 12, 0, 0],
            [0xFFFF, 9000, 50, 0],
        ];
        let compressed = compress(&units);
        let first = decompress(&compressed).unwrap();
        let second = decompress(&compressed).unwrap();
        assert_eq!(first, second);
        let expected: Vec<u16> = units.iter().flatten().copied().collect();
        assert_eq!(words(&first), expected);
    }

    #[test]
    fn test_empty_input() {
        assert!(decompress(&[]).unwrap().is_empty());
    }
}
