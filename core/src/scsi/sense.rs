//! Sense data registry, reported through REQUEST SENSE

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use serde::Serialize;

/// Fixed-format sense block length
pub const SENSE_LEN: usize = 18;

/// Error code byte: valid bit + current error, fixed format
const SENSE_ERROR_CODE: u8 = 0x80 | 0x70;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr, Serialize,
)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    AbortedCommand = 0x0B,
}

/// Additional sense codes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr, Serialize,
)]
#[repr(u8)]
pub enum Asc {
    NoAdditionalSense = 0x00,
    WriteError = 0x0C,
    UnrecoveredReadError = 0x11,
    InvalidCommandOperationCode = 0x20,
    LogicalBlockAddressOutOfRange = 0x21,
    InvalidFieldInCdb = 0x24,
    LogicalUnitNotSupported = 0x25,
    InvalidFieldInParameterList = 0x26,
    WriteProtected = 0x27,
}

/// Current sense key and ASC.
///
/// Stored as raw bytes so that any value restored from a snapshot survives
/// unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sense {
    key: u8,
    asc: u8,
}

impl Sense {
    pub const fn from_raw(key: u8, asc: u8) -> Self {
        Self { key, asc }
    }

    pub fn set(&mut self, key: SenseKey, asc: Asc) {
        self.key = key as u8;
        self.asc = asc as u8;
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub const fn raw_key(&self) -> u8 {
        self.key
    }

    pub const fn raw_asc(&self) -> u8 {
        self.asc
    }

    pub fn key(&self) -> Option<SenseKey> {
        SenseKey::from_u8(self.key)
    }

    pub fn asc(&self) -> Option<Asc> {
        Asc::from_u8(self.asc)
    }

    /// Builds the fixed-format sense block. `info` fills the information
    /// field (bytes 3..=6).
    pub fn to_block(&self, info: Option<u32>) -> [u8; SENSE_LEN] {
        let mut result = [0; SENSE_LEN];
        result[0] = SENSE_ERROR_CODE;
        result[2] = self.key & 0x0F;
        if let Some(info) = info {
            result[3..7].copy_from_slice(&info.to_be_bytes());
        }
        // Additional sense length
        result[7] = (SENSE_LEN - 8) as u8;
        result[12] = self.asc;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout() {
        let mut sense = Sense::default();
        sense.set(SenseKey::IllegalRequest, Asc::InvalidFieldInCdb);
        let block = sense.to_block(None);
        assert_eq!(block[0], 0xF0);
        assert_eq!(block[2], 0x05);
        assert_eq!(block[12], 0x24);
        assert_eq!(&block[3..7], &[0, 0, 0, 0]);
    }

    #[test]
    fn block_information_field() {
        let sense = Sense::from_raw(0x05, 0x21);
        let block = sense.to_block(Some(0x0012_3456));
        assert_eq!(&block[3..7], &[0x00, 0x12, 0x34, 0x56]);
        assert_eq!(sense.asc(), Some(Asc::LogicalBlockAddressOutOfRange));
    }

    #[test]
    fn unknown_raw_values() {
        let sense = Sense::from_raw(0x0E, 0x99);
        assert_eq!(sense.key(), None);
        assert_eq!(sense.asc(), None);
        assert_eq!(sense.to_block(None)[12], 0x99);
    }
}
