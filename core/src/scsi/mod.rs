//! SCSI-1 bus target emulation: phase state machine, command set and
//! disk image backing store

pub mod bus;
pub mod command;
pub mod config;
pub mod image;
pub mod sense;
#[cfg(feature = "savestates")]
pub mod snapshot;
pub mod transfer;
pub mod wire;

#[cfg(test)]
mod tests;

use num_derive::{FromPrimitive, ToPrimitive};
use serde::Serialize;

/// Size of one logical block on every emulated disk
pub const SECTOR_SIZE: usize = 512;

/// Highest target ID + 1 (ID 7 is the initiator)
pub const MAX_IDS: usize = 7;

/// Logical units per target
pub const MAX_LUNS: usize = 8;

/// Number of image slots (target x LUN)
pub const MAX_SLOTS: usize = MAX_IDS * MAX_LUNS;

/// Target value while no target is selected
pub const TARGET_NONE: u8 = 255;

/// Capacity of the command descriptor buffer
pub const CMD_BUF_LEN: usize = 256;

/// Capacity of the data phase buffer
pub const DATA_BUF_LEN: usize = SECTOR_SIZE;

/// Image size policy after reset, in sectors (512 MiB)
pub const DEFAULT_IMAGESIZE: u32 = (512 * 1024 * 1024 / SECTOR_SIZE) as u32;

/// Maps a (target, LUN) pair to its image slot
pub const fn slot_id(target: u8, lun: u8) -> usize {
    ((target as usize) << 3) | (lun as usize & 7)
}

/// Status reported in the STATUS phase
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr, Serialize,
)]
#[repr(u8)]
pub enum ScsiStatus {
    Good = 0,
    CheckCondition = 1,
}

impl ScsiStatus {
    /// Status byte as it appears on the bus
    pub const fn code(self) -> u8 {
        (self as u8) << 1
    }
}
