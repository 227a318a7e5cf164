//! Command table and command descriptor block (CDB) decoding

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use proc_bitfield::bitfield;

use super::bus::BusContext;
use super::transfer::{self, Next};

#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, strum::IntoStaticStr)]
#[repr(u8)]
pub enum Opcode {
    TestUnitReady = 0x00,
    RezeroUnit = 0x01,
    RequestSense = 0x03,
    FormatUnit = 0x04,
    ReassignBlocks = 0x07,
    Read6 = 0x08,
    Write6 = 0x0A,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStop = 0x1B,
    SendDiagnostic = 0x1D,
    ReadCapacity = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    WriteVerify = 0x2E,
    Verify = 0x2F,
    ModeSense10 = 0x5A,
}

/// Handles a fully received CDB
pub(super) type Handler = fn(&mut BusContext) -> Next;

pub(super) struct CommandEntry {
    pub opcode: Opcode,
    pub cdb_len: usize,
    pub handler: Handler,
}

const fn entry(opcode: Opcode, cdb_len: usize, handler: Handler) -> CommandEntry {
    CommandEntry {
        opcode,
        cdb_len,
        handler,
    }
}

pub(super) static COMMAND_TABLE: [CommandEntry; 17] = [
    entry(Opcode::TestUnitReady, 6, transfer::test_unit_ready),
    entry(Opcode::RezeroUnit, 6, transfer::no_operation),
    entry(Opcode::RequestSense, 6, transfer::request_sense),
    entry(Opcode::FormatUnit, 6, transfer::format_unit),
    entry(Opcode::ReassignBlocks, 6, transfer::reassign_blocks),
    entry(Opcode::Read6, 6, transfer::read),
    entry(Opcode::Write6, 6, transfer::write),
    entry(Opcode::Inquiry, 6, transfer::inquiry),
    entry(Opcode::ModeSense6, 6, transfer::mode_sense),
    entry(Opcode::StartStop, 6, transfer::no_operation),
    entry(Opcode::SendDiagnostic, 6, transfer::no_operation),
    entry(Opcode::ReadCapacity, 10, transfer::read_capacity),
    entry(Opcode::Read10, 10, transfer::read),
    entry(Opcode::Write10, 10, transfer::write),
    entry(Opcode::ModeSense10, 10, transfer::mode_sense),
    entry(Opcode::WriteVerify, 10, transfer::write),
    entry(Opcode::Verify, 10, transfer::no_operation),
];

/// Looks up an opcode in the command table
pub(super) fn lookup(opcode: u8) -> Option<&'static CommandEntry> {
    let opcode = Opcode::from_u8(opcode)?;
    COMMAND_TABLE.iter().find(|e| e.opcode == opcode)
}

/// CDB length for an opcode, None for unsupported commands
pub fn cdb_len(opcode: u8) -> Option<usize> {
    lookup(opcode).map(|e| e.cdb_len)
}

bitfield! {
    /// FORMAT UNIT CDB byte 1
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct FormatFlags(pub u8): Debug, FromStorage, IntoStorage, DerefStorage {
        pub defect_list_format: u8 @ 0..=2,
        pub cmplist: bool @ 3,
        pub fmtdata: bool @ 4,
    }
}

/// Field accessors on a received CDB. All multi-byte fields are big-endian.
#[derive(Clone, Copy)]
pub struct Cdb<'a>(pub &'a [u8]);

impl Cdb<'_> {
    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    /// Group 0 commands are 6 bytes long, everything else we know is 10
    pub fn is_short(&self) -> bool {
        self.opcode() < 0x20
    }

    pub fn lun(&self) -> u8 {
        (self.0[1] >> 5) & 7
    }

    /// Link bit in the control byte
    pub fn link(&self) -> bool {
        let control = if self.is_short() { self.0[5] } else { self.0[9] };
        control & 1 != 0
    }

    /// Logical block address, 21 bits for 6-byte CDBs
    pub fn lba(&self) -> u32 {
        if self.is_short() {
            u32::from_be_bytes([0, self.0[1] & 0x1F, self.0[2], self.0[3]])
        } else {
            u32::from_be_bytes([self.0[2], self.0[3], self.0[4], self.0[5]])
        }
    }

    /// Transfer length in blocks. A 6-byte length of 0 means 256.
    pub fn transfer_len(&self) -> u32 {
        if self.is_short() {
            match self.0[4] {
                0 => 256,
                n => n.into(),
            }
        } else {
            u16::from_be_bytes([self.0[7], self.0[8]]).into()
        }
    }

    /// Allocation length
    pub fn alloc_len(&self) -> usize {
        if self.is_short() {
            self.0[4].into()
        } else {
            u16::from_be_bytes([self.0[7], self.0[8]]).into()
        }
    }

    pub fn page_code(&self) -> u8 {
        self.0[2]
    }

    pub fn format_flags(&self) -> FormatFlags {
        FormatFlags(self.0[1])
    }
}
