//! Snapshot module for the bus state.
//!
//! Layout (little endian), after the module header:
//!
//! | type  | name             |
//! |-------|------------------|
//! | u8    | state            |
//! | u8    | target           |
//! | u8    | databus (wire)   |
//! | u8    | ack              |
//! | u8    | req              |
//! | u8    | bsyi             |
//! | u8    | bsyo             |
//! | u8    | sel              |
//! | u8    | rst              |
//! | u8    | atn              |
//! | u8    | cd               |
//! | u8    | io               |
//! | u8    | msg              |
//! | u8    | link             |
//! | u8    | status           |
//! | u8    | lun              |
//! | u8    | command          |
//! | u8    | sensekey         |
//! | u8    | asc              |
//! | u8    | msg_after_status |
//! | u32   | seq              |
//! | u32   | cmd_size         |
//! | u32   | address          |
//! | u32   | blocks           |
//! | u32   | data_max         |
//! | u32   | max_imagesize    |
//! | [256] | cmd_buf          |
//! | [512] | data_buf         |

use std::io::{Read, Seek, Write};

use anyhow::{bail, Context, Result};
use binrw::{binrw, BinRead, BinWrite};
use num_traits::FromPrimitive;

use super::bus::{BusContext, BusSignals, Phase};
use super::sense::Sense;
use super::{ScsiStatus, CMD_BUF_LEN, DATA_BUF_LEN, MAX_IDS, TARGET_NONE};

pub const SNAP_MAJOR: u8 = 0;
pub const SNAP_MINOR: u8 = 0;

const MODULE_NAME_LEN: usize = 16;
const HEADER_LEN: u32 = MODULE_NAME_LEN as u32 + 2 + 4;
const BODY_LEN: u32 = 20 + 6 * 4 + CMD_BUF_LEN as u32 + DATA_BUF_LEN as u32;

#[binrw]
#[brw(little)]
struct ModuleHeader {
    /// Module name, NUL padded
    name: [u8; MODULE_NAME_LEN],
    major: u8,
    minor: u8,
    /// Module size including this header
    size: u32,
}

#[binrw]
#[brw(little)]
struct ScsiModule {
    state: u8,
    target: u8,
    databus: u8,
    ack: u8,
    req: u8,
    bsyi: u8,
    bsyo: u8,
    sel: u8,
    rst: u8,
    atn: u8,
    cd: u8,
    io: u8,
    msg: u8,
    link: u8,
    status: u8,
    lun: u8,
    command: u8,
    sensekey: u8,
    asc: u8,
    msg_after_status: u8,
    seq: u32,
    cmd_size: u32,
    address: u32,
    blocks: u32,
    data_max: u32,
    max_imagesize: u32,
    cmd_buf: [u8; CMD_BUF_LEN],
    data_buf: [u8; DATA_BUF_LEN],
}

fn module_name(name: &str) -> Result<[u8; MODULE_NAME_LEN]> {
    let bytes = name.as_bytes();
    // Leave room for the terminator
    if bytes.len() >= MODULE_NAME_LEN {
        bail!("Snapshot module name too long: {}", name);
    }
    let mut result = [0; MODULE_NAME_LEN];
    result[..bytes.len()].copy_from_slice(bytes);
    Ok(result)
}

/// Version ordering as major.minor
const fn version_is_bigger(major: u8, minor: u8, than_major: u8, than_minor: u8) -> bool {
    major > than_major || (major == than_major && minor > than_minor)
}

impl BusContext {
    /// Writes the bus state as a snapshot module
    pub fn write_snapshot<W: Write + Seek>(&self, writer: &mut W) -> Result<()> {
        let header = ModuleHeader {
            name: module_name(&self.snapshot_name)?,
            major: SNAP_MAJOR,
            minor: SNAP_MINOR,
            size: HEADER_LEN + BODY_LEN,
        };
        let s = &self.signals;
        let module = ScsiModule {
            state: self.phase as u8,
            target: self.target,
            databus: self.databus ^ 0xFF,
            ack: s.ack().into(),
            req: s.req().into(),
            bsyi: s.bsy_in().into(),
            bsyo: s.bsy_out().into(),
            sel: s.sel().into(),
            rst: s.rst().into(),
            atn: s.atn().into(),
            cd: s.cd().into(),
            io: s.io().into(),
            msg: s.msg().into(),
            link: self.link.into(),
            status: self.status as u8,
            lun: self.lun,
            command: self.command,
            sensekey: self.sense.raw_key(),
            asc: self.sense.raw_asc(),
            msg_after_status: self.msg_after_status.into(),
            seq: self.seq as u32,
            cmd_size: self.cmd_size as u32,
            address: self.address,
            blocks: self.blocks,
            data_max: self.data_max as u32,
            max_imagesize: self.max_imagesize,
            cmd_buf: self.cmd_buf,
            data_buf: self.data_buf,
        };

        header.write(writer)?;
        module.write(writer)?;
        Ok(())
    }

    /// Restores the bus state from a snapshot module. The state is left
    /// untouched if the module is rejected.
    pub fn read_snapshot<R: Read + Seek>(&mut self, reader: &mut R) -> Result<()> {
        let header = ModuleHeader::read(reader).context("Cannot read snapshot module header")?;

        if header.name != module_name(&self.snapshot_name)? {
            bail!(
                "Snapshot module name mismatch: {:?}",
                String::from_utf8_lossy(&header.name).trim_end_matches('\0')
            );
        }
        // Do not accept versions higher than current
        if version_is_bigger(header.major, header.minor, SNAP_MAJOR, SNAP_MINOR) {
            bail!(
                "Snapshot module version {}.{} is newer than supported {}.{}",
                header.major,
                header.minor,
                SNAP_MAJOR,
                SNAP_MINOR
            );
        }
        if header.size < HEADER_LEN + BODY_LEN {
            bail!("Snapshot module truncated: {} bytes", header.size);
        }

        let m = ScsiModule::read(reader).context("Cannot read snapshot module body")?;

        let Some(phase) = Phase::from_u8(m.state) else {
            bail!("Invalid bus phase in snapshot: {}", m.state);
        };
        let Some(status) = ScsiStatus::from_u8(m.status) else {
            bail!("Invalid status in snapshot: {}", m.status);
        };
        if m.target != TARGET_NONE && m.target as usize >= MAX_IDS {
            bail!("Invalid target in snapshot: {}", m.target);
        }
        let (seq, cmd_size, data_max) = (m.seq as usize, m.cmd_size as usize, m.data_max as usize);
        if cmd_size > CMD_BUF_LEN || data_max > DATA_BUF_LEN || seq > DATA_BUF_LEN {
            bail!(
                "Buffer cursor out of range in snapshot: seq = {}, cmd_size = {}, data_max = {}",
                seq,
                cmd_size,
                data_max
            );
        }
        let cursor_ok = match phase {
            Phase::Command => seq < cmd_size,
            Phase::DataOut => seq < data_max,
            Phase::DataIn => seq <= data_max,
            _ => true,
        };
        if !cursor_ok {
            bail!("Sequence {} invalid in phase {:?}", seq, phase);
        }

        self.phase = phase;
        self.target = m.target;
        self.databus = m.databus ^ 0xFF;
        self.signals = BusSignals::default()
            .with_ack(m.ack != 0)
            .with_req(m.req != 0)
            .with_bsy_in(m.bsyi != 0)
            .with_bsy_out(m.bsyo != 0)
            .with_sel(m.sel != 0)
            .with_rst(m.rst != 0)
            .with_atn(m.atn != 0)
            .with_cd(m.cd != 0)
            .with_io(m.io != 0)
            .with_msg(m.msg != 0);
        self.link = m.link != 0;
        self.status = status;
        self.lun = m.lun;
        self.command = m.command;
        self.sense = Sense::from_raw(m.sensekey, m.asc);
        self.msg_after_status = m.msg_after_status != 0;
        self.seq = seq;
        self.cmd_size = cmd_size;
        self.address = m.address;
        self.blocks = m.blocks;
        self.data_max = data_max;
        self.max_imagesize = m.max_imagesize;
        self.cmd_buf = m.cmd_buf;
        self.data_buf = m.data_buf;

        Ok(())
    }
}
