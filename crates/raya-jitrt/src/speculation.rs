//! Failed speculation encoding
//!
//! A speculation reported by deoptimizing code is a single `i64`: the high 32
//! bits index into the unit's encoded speculation log and the low 32 bits give
//! the length of the entry.

use crate::error::FatalError;

/// Decoded speculation reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeculationRef {
    /// Offset into the speculation log
    pub index: u32,
    /// Length of the entry
    pub length: u32,
}

impl SpeculationRef {
    /// Split an encoded speculation into index and length
    pub fn decode(speculation: i64) -> Self {
        let raw = speculation as u64;
        SpeculationRef {
            index: (raw >> 32) as u32,
            length: raw as u32,
        }
    }

    /// Pack index and length into the `i64` form
    pub fn encode(self) -> i64 {
        (((self.index as u64) << 32) | self.length as u64) as i64
    }

    /// Bytes of the entry within `log`
    pub fn slice(self, speculation: i64, log: &[u8]) -> Result<&[u8], FatalError> {
        let start = self.index as usize;
        let end = start.checked_add(self.length as usize);
        match end {
            Some(end) if end <= log.len() => Ok(&log[start..end]),
            _ => Err(FatalError::SpeculationOutOfBounds {
                speculation,
                index: self.index,
                length: self.length,
                available: log.len(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_splits_halves() {
        let r = SpeculationRef::decode(0x0000_0003_0000_0002);
        assert_eq!(r, SpeculationRef { index: 3, length: 2 });
        assert_eq!(r.encode(), 0x0000_0003_0000_0002);
    }

    #[test]
    fn test_slice_in_bounds() {
        let log = [10u8, 11, 12, 13, 14];
        let spec = SpeculationRef { index: 1, length: 3 }.encode();
        let bytes = SpeculationRef::decode(spec).slice(spec, &log).unwrap();
        assert_eq!(bytes, &[11, 12, 13]);
    }

    #[test]
    fn test_slice_out_of_bounds_is_fatal() {
        let log = [0u8; 4];
        let spec = SpeculationRef { index: 2, length: 3 }.encode();
        let err = SpeculationRef::decode(spec).slice(spec, &log).unwrap_err();
        assert!(matches!(err, FatalError::SpeculationOutOfBounds { available: 4, .. }));
    }

    #[test]
    fn test_negative_encoding_decodes_high_index() {
        let r = SpeculationRef::decode(-1);
        assert_eq!(r.index, u32::MAX);
        assert_eq!(r.length, u32::MAX);
        assert!(r.slice(-1, &[0u8; 8]).is_err());
    }
}
