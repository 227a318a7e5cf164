//! SCSI-1 bus phase state machine (target side)

use num_derive::{FromPrimitive, ToPrimitive};
use proc_bitfield::bitfield;
use serde::Serialize;

use crate::debuggable::Debuggable;
use crate::scsi::command;
use crate::scsi::image::ImageStore;
use crate::scsi::sense::{Asc, Sense, SenseKey};
use crate::scsi::transfer::{self, Next};
use crate::scsi::{ScsiStatus, CMD_BUF_LEN, DATA_BUF_LEN, DEFAULT_IMAGESIZE, MAX_IDS, TARGET_NONE};

const SCSI_TRACE: bool = false;

/// Default snapshot module name
pub const SNAPSHOT_NAME: &str = "SCSI";

/// SCSI bus phases
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    FromPrimitive,
    ToPrimitive,
    strum::IntoStaticStr,
    Serialize,
)]
#[repr(u8)]
pub enum Phase {
    BusFree = 0,
    Command = 1,
    /// Target -> Initiator
    DataIn = 2,
    /// Initiator -> Target
    DataOut = 3,
    Status = 4,
    MessageIn = 5,
}

bitfield! {
    /// Logical state of the bus control lines, true = asserted
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct BusSignals(pub u16): Debug, FromStorage, IntoStorage, DerefStorage {
        pub sel: bool @ 0,
        pub rst: bool @ 1,
        pub atn: bool @ 2,
        /// BSY as driven by the initiator
        pub bsy_in: bool @ 3,
        /// BSY as driven by the target
        pub bsy_out: bool @ 4,
        pub req: bool @ 5,
        pub ack: bool @ 6,
        /// Control (1) / data (0)
        pub cd: bool @ 7,
        /// Target to initiator (1) / initiator to target (0)
        pub io: bool @ 8,
        pub msg: bool @ 9,
    }
}

/// Pluggable FORMAT UNIT implementation
pub type FormatHandler = fn(&mut BusContext);

/// Called after a sector is read into, or before it is written from, the
/// data buffer
pub type SectorHook = fn(&mut BusContext);

/// Read-only view on the state machine for monitors and debuggers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugSnapshot {
    pub phase: Phase,
    pub target: Option<u8>,
    pub lun: u8,
    pub command: u8,
    pub status: ScsiStatus,
    pub sense_key: u8,
    pub asc: u8,
    pub seq: usize,
    pub data_max: usize,
    pub address: u32,
    pub blocks: u32,
}

/// One emulated SCSI bus with its targets
pub struct BusContext {
    pub(super) phase: Phase,
    pub(super) signals: BusSignals,

    /// Data bus, logical value (not inverted)
    pub(super) databus: u8,

    /// Selected target or TARGET_NONE
    pub(super) target: u8,
    pub(super) lun: u8,

    /// Opcode of the command in progress
    pub(super) command: u8,
    pub(super) cmd_buf: [u8; CMD_BUF_LEN],
    pub(super) cmd_size: usize,

    pub(super) data_buf: [u8; DATA_BUF_LEN],
    pub(super) data_max: usize,

    /// Cursor in the buffer of the current phase
    pub(super) seq: usize,

    /// Current logical block address
    pub(super) address: u32,
    /// Blocks left in the current transfer
    pub(super) blocks: u32,

    pub(super) status: ScsiStatus,
    pub(super) sense: Sense,
    pub(super) link: bool,

    /// Enter MESSAGE IN after STATUS instead of going bus free
    pub(super) msg_after_status: bool,

    /// Capacity override in sectors, 0 to use the image size
    pub(super) max_imagesize: u32,
    /// Cap on the capacity reported by READ CAPACITY, 0 for no cap
    pub(super) limit_imagesize: u32,

    pub(super) store: Box<dyn ImageStore>,
    pub(super) format_handler: FormatHandler,
    pub(super) read_hook: Option<SectorHook>,
    pub(super) write_hook: Option<SectorHook>,

    pub(super) snapshot_name: String,
    warned_no_disk0: bool,
}

impl BusContext {
    pub fn new(store: Box<dyn ImageStore>) -> Self {
        let mut ctx = Self {
            phase: Phase::BusFree,
            signals: BusSignals::default(),
            databus: 0,
            target: TARGET_NONE,
            lun: 0,
            command: 0,
            cmd_buf: [0; CMD_BUF_LEN],
            cmd_size: CMD_BUF_LEN,
            data_buf: [0; DATA_BUF_LEN],
            data_max: 0,
            seq: 0,
            address: 0,
            blocks: 0,
            status: ScsiStatus::Good,
            sense: Sense::default(),
            link: false,
            msg_after_status: false,
            max_imagesize: DEFAULT_IMAGESIZE,
            limit_imagesize: DEFAULT_IMAGESIZE,
            store,
            format_handler: transfer::format_sector0,
            read_hook: None,
            write_hook: None,
            snapshot_name: SNAPSHOT_NAME.to_string(),
            warned_no_disk0: false,
        };
        ctx.reset();
        ctx
    }

    /// Returns the bus to power-on state. Attached images stay attached.
    pub fn reset(&mut self) {
        if SCSI_TRACE {
            log::debug!(
                "SCSI bus reset\n{}",
                crate::debuggable::render(&self.get_debug_properties())
            );
        }
        self.max_imagesize = DEFAULT_IMAGESIZE;
        self.limit_imagesize = DEFAULT_IMAGESIZE;

        self.signals.set_rst(true);
        self.on_signal_change();
        self.signals.set_rst(false);

        self.msg_after_status = false;
        self.format_handler = transfer::format_sector0;
        self.read_hook = None;
        self.write_hook = None;
        self.warned_no_disk0 = false;
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn signals(&self) -> BusSignals {
        self.signals
    }

    /// Data bus, logical value
    pub fn databus(&self) -> u8 {
        self.databus
    }

    pub fn target(&self) -> Option<u8> {
        (self.target != TARGET_NONE).then_some(self.target)
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    pub fn status(&self) -> ScsiStatus {
        self.status
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn store(&self) -> &dyn ImageStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn ImageStore {
        self.store.as_mut()
    }

    /// Current data buffer contents
    pub fn data_buf(&self) -> &[u8; DATA_BUF_LEN] {
        &self.data_buf
    }

    pub fn data_buf_mut(&mut self) -> &mut [u8; DATA_BUF_LEN] {
        &mut self.data_buf
    }

    /// Logical block address the transfer engine is at
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn set_address(&mut self, address: u32) {
        self.address = address;
    }

    pub fn set_msg_after_status(&mut self, enable: bool) {
        self.msg_after_status = enable;
    }

    pub fn set_max_imagesize(&mut self, sectors: u32) {
        self.max_imagesize = sectors;
    }

    pub fn set_limit_imagesize(&mut self, sectors: u32) {
        self.limit_imagesize = sectors;
    }

    pub fn set_format_handler(&mut self, handler: FormatHandler) {
        self.format_handler = handler;
    }

    pub fn set_read_hook(&mut self, hook: Option<SectorHook>) {
        self.read_hook = hook;
    }

    pub fn set_write_hook(&mut self, hook: Option<SectorHook>) {
        self.write_hook = hook;
    }

    /// Name of the module in snapshots
    pub fn set_snapshot_name(&mut self, name: &str) {
        self.snapshot_name = name.to_string();
    }

    /// Capacity of the selected (target, LUN) in sectors, 0 without image
    pub fn capacity_sectors(&self) -> u32 {
        self.store
            .capacity_sectors(self.target, self.lun, self.max_imagesize)
    }

    /// Checks whether the selected (target, LUN) has an image attached
    pub(super) fn image_present(&mut self) -> bool {
        if self.store.is_present(self.target, self.lun) {
            return true;
        }
        if self.target == 0 && self.lun == 0 && !self.warned_no_disk0 {
            log::error!("SCSI: no image attached to disk 0; expect unusual results and/or hangs");
            self.warned_no_disk0 = true;
        }
        false
    }

    pub fn dump_state(&self) -> DebugSnapshot {
        DebugSnapshot {
            phase: self.phase,
            target: self.target(),
            lun: self.lun,
            command: self.command,
            status: self.status,
            sense_key: self.sense.raw_key(),
            asc: self.sense.raw_asc(),
            seq: self.seq,
            data_max: self.data_max,
            address: self.address,
            blocks: self.blocks,
        }
    }

    /// Translates the IDs on the data bus to the selected target ID.
    /// Exactly one of bits 0-6 must be set.
    fn translate_id(databus: u8) -> Option<u8> {
        let ids = databus & 0x7F;
        if ids.count_ones() != 1 {
            return None;
        }
        let id = ids.trailing_zeros() as u8;
        ((id as usize) < MAX_IDS).then_some(id)
    }

    fn bus_free(&mut self) {
        self.phase = Phase::BusFree;
        self.signals.set_req(false);
        self.signals.set_bsy_out(false);
        self.signals.set_io(false);
        self.signals.set_msg(false);
        self.signals.set_cd(false);
    }

    /// Handles changes of SEL, RST and BSY outside of a byte handshake
    pub fn on_signal_change(&mut self) {
        if self.signals.rst() {
            self.cmd_size = CMD_BUF_LEN;
            self.target = TARGET_NONE;
            self.seq = 0;
            self.link = false;
            self.bus_free();
            return;
        }

        if self.phase != Phase::BusFree {
            return;
        }

        match (self.signals.sel(), self.signals.bsy_out()) {
            (true, false) => {
                let Some(id) = Self::translate_id(self.databus) else {
                    log::warn!("Invalid ID on bus: {:02X}", self.databus);
                    self.target = TARGET_NONE;
                    self.cmd_size = CMD_BUF_LEN;
                    return;
                };
                if SCSI_TRACE {
                    log::debug!("Selected SCSI ID: {}", id);
                }
                self.target = id;
                self.signals.set_bsy_out(true);
                self.signals.set_req(false);
                self.seq = 0;
            }
            (true, true) => {
                // Holding BSY until the initiator drops SEL
            }
            (false, true) => {
                if SCSI_TRACE {
                    log::debug!("SCSI ID {} ready for command", self.target);
                }
                self.phase = Phase::Command;
                self.cmd_size = CMD_BUF_LEN;
                self.signals.set_cd(true);
                self.signals.set_io(false);
                self.signals.set_req(true);
            }
            (false, false) => (),
        }
    }

    /// Handles one byte handshaked by the initiator. `byte` is the logical
    /// value on the data bus, it is only consumed in COMMAND and DATA OUT.
    pub fn on_byte_ack(&mut self, byte: u8) {
        if SCSI_TRACE {
            log::debug!("Ack in {:?}, seq = {}, byte = {:02X}", self.phase, self.seq, byte);
        }

        match self.phase {
            Phase::BusFree => (),
            Phase::Status => {
                self.signals.set_cd(true);
                if self.link {
                    self.seq = 0;
                    self.cmd_size = CMD_BUF_LEN;
                    self.phase = Phase::Command;
                    self.signals.set_io(false);
                } else if self.msg_after_status {
                    // COMMAND COMPLETE
                    self.phase = Phase::MessageIn;
                    self.signals.set_io(true);
                    self.signals.set_msg(true);
                    self.signals.set_bsy_out(false);
                    self.databus = 0;
                } else {
                    self.bus_free();
                }
            }
            Phase::MessageIn => self.bus_free(),
            Phase::DataOut => {
                self.signals.set_io(false);
                self.signals.set_cd(false);
                self.data_buf[self.seq] = byte;
                self.seq += 1;
                if self.seq >= self.data_max {
                    let next = transfer::data_out_done(self);
                    self.enter(next);
                }
            }
            Phase::Command => {
                self.signals.set_io(false);
                self.signals.set_cd(true);
                self.cmd_buf[self.seq] = byte;
                if self.seq == 0 {
                    self.command = byte;
                    let Some(len) = command::cdb_len(byte) else {
                        log::error!("SCSI: unknown command {:02X}", byte);
                        self.sense
                            .set(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode);
                        return self.enter(Next::Status(ScsiStatus::CheckCondition));
                    };
                    self.cmd_size = len;
                }
                self.seq += 1;
                if self.seq >= self.cmd_size {
                    self.dispatch();
                }
            }
            Phase::DataIn => self.pump_data_in(),
        }
    }

    /// Runs the handler of a fully received command
    fn dispatch(&mut self) {
        if SCSI_TRACE {
            log::debug!(
                "SCSI ID {} command: {:02X?}",
                self.target,
                &self.cmd_buf[..self.cmd_size]
            );
        }
        let next = match command::lookup(self.command) {
            Some(entry) => (entry.handler)(self),
            None => {
                self.sense
                    .set(SenseKey::IllegalRequest, Asc::InvalidCommandOperationCode);
                Next::Status(ScsiStatus::CheckCondition)
            }
        };
        self.enter(next);
    }

    /// Moves to the phase a handler asked for
    fn enter(&mut self, next: Next) {
        match next {
            Next::Status(status) => {
                self.status = status;
                self.phase = Phase::Status;
                self.signals.set_io(true);
                self.signals.set_cd(true);
                self.signals.set_msg(false);
                self.databus = status.code();
            }
            Next::DataIn => {
                self.phase = Phase::DataIn;
                self.pump_data_in();
            }
            Next::DataOut => {
                self.phase = Phase::DataOut;
                self.signals.set_io(false);
                self.signals.set_cd(false);
                self.signals.set_msg(false);
            }
        }
    }

    /// Presents the next DATA IN byte, refilling the buffer or finishing the
    /// phase once it is drained
    fn pump_data_in(&mut self) {
        if self.seq >= self.data_max {
            match transfer::data_in_done(self) {
                Next::DataIn => (),
                next => return self.enter(next),
            }
        }
        self.databus = self.data_buf[self.seq];
        self.seq += 1;
        self.signals.set_io(true);
        self.signals.set_cd(false);
    }
}

impl Debuggable for BusContext {
    fn get_debug_properties(&self) -> crate::debuggable::DebuggableProperties {
        use crate::debuggable::*;
        use crate::{
            dbgprop_bool, dbgprop_byte, dbgprop_enum, dbgprop_group, dbgprop_header,
            dbgprop_long, dbgprop_string, dbgprop_udec,
        };

        vec![
            dbgprop_enum!("Bus phase", self.phase),
            dbgprop_string!(
                "Selected ID",
                self.target()
                    .map_or_else(|| "(none)".to_string(), |t| t.to_string())
            ),
            dbgprop_udec!("LUN", self.lun),
            dbgprop_group!(
                "Signals",
                vec![
                    dbgprop_bool!("SEL", self.signals.sel()),
                    dbgprop_bool!("RST", self.signals.rst()),
                    dbgprop_bool!("ATN", self.signals.atn()),
                    dbgprop_bool!("BSY (initiator)", self.signals.bsy_in()),
                    dbgprop_bool!("BSY (target)", self.signals.bsy_out()),
                    dbgprop_bool!("REQ", self.signals.req()),
                    dbgprop_bool!("ACK", self.signals.ack()),
                    dbgprop_bool!("C/D", self.signals.cd()),
                    dbgprop_bool!("I/O", self.signals.io()),
                    dbgprop_bool!("MSG", self.signals.msg()),
                    dbgprop_byte!("Data bus", self.databus),
                ]
            ),
            dbgprop_enum!("Status", self.status),
            dbgprop_byte!("Sense key", self.sense.raw_key()),
            dbgprop_byte!("ASC", self.sense.raw_asc()),
            dbgprop_bool!("Linked", self.link),
            dbgprop_header!("Transfer"),
            dbgprop_long!("Address", self.address),
            dbgprop_udec!("Blocks left", self.blocks),
            dbgprop_header!("Buffers"),
            dbgprop_string!(
                "Command",
                format!("{:02X?}", &self.cmd_buf[..self.cmd_size.min(10)])
            ),
            dbgprop_udec!("Command length", self.cmd_size),
            dbgprop_udec!("Sequence", self.seq),
            dbgprop_udec!("Data length", self.data_max),
        ]
    }
}
