//! MSB-first bit reader over a byte buffer.
//!
//! Bit 0 is the most significant bit of byte 0. Fields of up to eight bits
//! may start anywhere; 16 and 32 bit words are assembled a byte at a time
//! from the same bit stream and then interpreted with the requested byte
//! order.

use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

#[derive(Debug, Clone, Copy)]
pub struct BitfieldView<'a> {
    bytes: &'a [u8],
}

impl<'a> BitfieldView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn bit_len(&self) -> usize {
        self.bytes.len() * 8
    }

    /// Reads `len` bits at `offset`. `len` must be 1..=8, 16 or 32.
    pub fn get_bit_word(
        &self,
        offset: usize,
        len: usize,
        endianness: Endianness,
    ) -> Result<u32, ProtocolError> {
        match len {
            1..=8 => self.read_bits(offset, len),
            16 | 32 => {
                let mut word = [0u8; 4];
                let count = len / 8;
                for (i, byte) in word.iter_mut().take(count).enumerate() {
                    *byte = self.read_bits(offset + i * 8, 8)? as u8;
                }
                let bytes = &word[..count];
                Ok(match endianness {
                    Endianness::Big => bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32),
                    Endianness::Little => {
                        bytes.iter().rev().fold(0u32, |acc, &b| (acc << 8) | b as u32)
                    }
                })
            }
            _ => Err(ProtocolError::UnsupportedBitWidth(len)),
        }
    }

    /// Big-endian shorthand; most fields are read this way.
    pub fn bits(&self, offset: usize, len: usize) -> Result<u32, ProtocolError> {
        self.get_bit_word(offset, len, Endianness::Big)
    }

    pub fn u16_le(&self, offset: usize) -> Result<u16, ProtocolError> {
        Ok(self.get_bit_word(offset, 16, Endianness::Little)? as u16)
    }

    pub fn u32_le(&self, offset: usize) -> Result<u32, ProtocolError> {
        self.get_bit_word(offset, 32, Endianness::Little)
    }

    fn read_bits(&self, offset: usize, len: usize) -> Result<u32, ProtocolError> {
        let end = offset.checked_add(len).unwrap_or(usize::MAX);
        if end > self.bit_len() {
            return Err(ProtocolError::FieldOutOfBounds {
                offset,
                len,
                available: self.bit_len(),
            });
        }

        let mut value = 0u32;
        for bit in offset..end {
            let byte = self.bytes[bit / 8];
            let set = (byte >> (7 - bit % 8)) & 1;
            value = (value << 1) | set as u32;
        }
        Ok(value)
    }
}

/// Packs fields MSB-first, the inverse of [`BitfieldView`]. Test support for
/// synthesizing notifications.
#[cfg(test)]
pub(crate) struct BitWriter {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl BitWriter {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
        }
    }

    pub fn put(&mut self, offset: usize, len: usize, value: u32) -> &mut Self {
        for i in 0..len {
            let bit = (value >> (len - 1 - i)) & 1;
            let pos = offset + i;
            if bit == 1 {
                self.bytes[pos / 8] |= 0x80 >> (pos % 8);
            } else {
                self.bytes[pos / 8] &= !(0x80 >> (pos % 8));
            }
        }
        self
    }

    pub fn put_u16_le(&mut self, offset: usize, value: u16) -> &mut Self {
        let [lo, hi] = value.to_le_bytes();
        self.put(offset, 8, lo as u32).put(offset + 8, 8, hi as u32)
    }

    pub fn put_u32_le(&mut self, offset: usize, value: u32) -> &mut Self {
        for (i, byte) in value.to_le_bytes().iter().enumerate() {
            self.put(offset + i * 8, 8, *byte as u32);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reads_unaligned_small_fields() {
        // 1011 0110 1100 0011
        let data = [0b1011_0110, 0b1100_0011];
        let view = BitfieldView::new(&data);
        assert_eq!(view.bits(0, 4).unwrap(), 0b1011);
        assert_eq!(view.bits(4, 4).unwrap(), 0b0110);
        assert_eq!(view.bits(3, 5).unwrap(), 0b10110);
        assert_eq!(view.bits(6, 3).unwrap(), 0b101);
        assert_eq!(view.bits(15, 1).unwrap(), 1);
        assert_eq!(view.bits(4, 8).unwrap(), 0b0110_1100);
    }

    #[test]
    fn test_word_endianness() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A];
        let view = BitfieldView::new(&data);
        assert_eq!(view.get_bit_word(0, 16, Endianness::Big).unwrap(), 0x1234);
        assert_eq!(view.get_bit_word(0, 16, Endianness::Little).unwrap(), 0x3412);
        assert_eq!(view.u32_le(8).unwrap(), 0x9A78_5634);
        assert_eq!(view.get_bit_word(8, 32, Endianness::Big).unwrap(), 0x3456_789A);
        // Unaligned word: bytes read at bit 4 are 0x23, 0x45.
        assert_eq!(view.get_bit_word(4, 16, Endianness::Big).unwrap(), 0x2345);
    }

    #[test]
    fn test_unsupported_width() {
        let view = BitfieldView::new(&[0u8; 8]);
        assert_eq!(
            view.get_bit_word(0, 12, Endianness::Big),
            Err(ProtocolError::UnsupportedBitWidth(12))
        );
        assert_eq!(
            view.get_bit_word(0, 0, Endianness::Big),
            Err(ProtocolError::UnsupportedBitWidth(0))
        );
    }

    #[test]
    fn test_out_of_bounds() {
        let view = BitfieldView::new(&[0u8; 2]);
        assert!(view.bits(12, 4).is_ok());
        assert!(matches!(
            view.bits(13, 4),
            Err(ProtocolError::FieldOutOfBounds { offset: 13, len: 4, available: 16 })
        ));
        assert!(view.u16_le(8).is_err());
    }

    #[test]
    fn test_writer_round_trip_at_odd_offsets() {
        let mut writer = BitWriter::new(4);
        writer.put(3, 5, 0b10011).put(13, 2, 0b11).put_u16_le(16, 0xBEEF);
        let view = BitfieldView::new(&writer.bytes);
        assert_eq!(view.bits(3, 5).unwrap(), 0b10011);
        assert_eq!(view.bits(13, 2).unwrap(), 0b11);
        assert_eq!(view.u16_le(16).unwrap(), 0xBEEF);
    }
}
