//! Command handlers and the multi-block transfer engine

use num_traits::FromPrimitive;

use super::bus::BusContext;
use super::command::{Cdb, Opcode};
use super::image::SectorError;
use super::sense::{Asc, SenseKey, SENSE_LEN};
use super::{ScsiStatus, DATA_BUF_LEN, SECTOR_SIZE};

/// Phase a handler leaves the bus in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Next {
    /// Report status
    Status(ScsiStatus),
    /// Send `data_buf[seq..data_max]` to the initiator
    DataIn,
    /// Receive into `data_buf[seq..data_max]`
    DataOut,
}

const VENDOR_ID: &[u8; 8] = b"SCSIBUS ";
const PRODUCT_ID: &[u8; 16] = b"SCSI Image File ";
const VERSION_SHORT: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR")
);

/// Standard INQUIRY data length (header + 92 additional bytes)
const INQUIRY_LEN: usize = 96;

/// Vendor specific drive information page
const PAGE_DRIVE_INFO: u8 = 0x20;

/// Largest MODE SENSE response
const MODE_SENSE_MAX: usize = 255;

fn check_condition(ctx: &mut BusContext, key: SenseKey, asc: Asc) -> Next {
    ctx.sense.set(key, asc);
    Next::Status(ScsiStatus::CheckCondition)
}

/// Copies the CDB and latches the LUN and link bit from it
fn begin(ctx: &mut BusContext) -> [u8; 10] {
    let mut cmd = [0; 10];
    cmd.copy_from_slice(&ctx.cmd_buf[..10]);
    let cdb = Cdb(&cmd);
    ctx.lun = cdb.lun();
    ctx.link = cdb.link();
    cmd
}

fn sector_error(ctx: &mut BusContext, err: &SectorError, write: bool) -> Next {
    match err {
        SectorError::NoImage { .. } => {
            check_condition(ctx, SenseKey::IllegalRequest, Asc::LogicalUnitNotSupported)
        }
        SectorError::Io { .. } => {
            log::error!("SCSI: target {} LUN {}: {}", ctx.target, ctx.lun, err);
            if write {
                check_condition(ctx, SenseKey::MediumError, Asc::WriteError)
            } else {
                check_condition(ctx, SenseKey::MediumError, Asc::UnrecoveredReadError)
            }
        }
    }
}

/// Reads the sector at `address` into the data buffer
fn load_sector(ctx: &mut BusContext) -> Result<(), Next> {
    if !ctx.image_present() {
        return Err(check_condition(
            ctx,
            SenseKey::IllegalRequest,
            Asc::LogicalUnitNotSupported,
        ));
    }
    match ctx.store.read_sector(ctx.target, ctx.lun, ctx.address) {
        Ok(sector) => {
            ctx.data_buf = sector;
            if let Some(hook) = ctx.read_hook {
                hook(ctx);
            }
            Ok(())
        }
        Err(e) => Err(sector_error(ctx, &e, false)),
    }
}

/// Writes the data buffer to the sector at `address`
fn store_sector(ctx: &mut BusContext) -> Result<(), Next> {
    if let Some(hook) = ctx.write_hook {
        hook(ctx);
    }
    ctx.store
        .write_sector(ctx.target, ctx.lun, ctx.address, &ctx.data_buf)
        .map_err(|e| sector_error(ctx, &e, true))
}

fn lba_out_of_range(ctx: &mut BusContext) -> Next {
    check_condition(
        ctx,
        SenseKey::IllegalRequest,
        Asc::LogicalBlockAddressOutOfRange,
    )
}

fn write_protected(ctx: &mut BusContext) -> Next {
    check_condition(ctx, SenseKey::DataProtect, Asc::WriteProtected)
}

/// Default FORMAT UNIT: clears logical sector 0 only
pub fn format_sector0(ctx: &mut BusContext) {
    ctx.address = 0;
    ctx.data_buf.fill(0);
    if let Err(e) = ctx
        .store
        .write_sector(ctx.target, ctx.lun, 0, &ctx.data_buf)
    {
        log::error!("SCSI: format of target {} failed: {}", ctx.target, e);
    }
}

/// REZERO UNIT, START STOP UNIT, SEND DIAGNOSTIC, VERIFY
pub(super) fn no_operation(ctx: &mut BusContext) -> Next {
    begin(ctx);
    Next::Status(ScsiStatus::Good)
}

pub(super) fn test_unit_ready(ctx: &mut BusContext) -> Next {
    begin(ctx);
    if ctx.image_present() {
        Next::Status(ScsiStatus::Good)
    } else {
        check_condition(ctx, SenseKey::IllegalRequest, Asc::LogicalUnitNotSupported)
    }
}

pub(super) fn request_sense(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    ctx.data_max = match Cdb(&cmd).alloc_len() {
        0 => 4,
        n => n.clamp(4, SENSE_LEN),
    };

    // Point at the offending block for range errors
    let info = (ctx.sense.asc() == Some(Asc::LogicalBlockAddressOutOfRange))
        .then_some(ctx.address);
    ctx.data_buf.fill(0);
    ctx.data_buf[..SENSE_LEN].copy_from_slice(&ctx.sense.to_block(info));
    ctx.sense.clear();

    ctx.seq = 0;
    Next::DataIn
}

/// READ(6), READ(10)
pub(super) fn read(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    let cdb = Cdb(&cmd);
    ctx.address = cdb.lba();
    ctx.blocks = cdb.transfer_len();
    if ctx.blocks == 0 {
        return Next::Status(ScsiStatus::Good);
    }

    ctx.data_max = SECTOR_SIZE;
    if ctx.address >= ctx.capacity_sectors() {
        return lba_out_of_range(ctx);
    }
    if let Err(next) = load_sector(ctx) {
        return next;
    }
    ctx.seq = 0;
    Next::DataIn
}

/// WRITE(6), WRITE(10), WRITE AND VERIFY
pub(super) fn write(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    let cdb = Cdb(&cmd);
    ctx.address = cdb.lba();
    ctx.blocks = cdb.transfer_len();
    if ctx.blocks == 0 {
        return Next::Status(ScsiStatus::Good);
    }

    ctx.data_max = SECTOR_SIZE;
    if ctx.address >= ctx.capacity_sectors() {
        return lba_out_of_range(ctx);
    }
    if !ctx.image_present() {
        return check_condition(ctx, SenseKey::IllegalRequest, Asc::LogicalUnitNotSupported);
    }
    if ctx.store.is_write_protected(ctx.target, ctx.lun) {
        return write_protected(ctx);
    }
    ctx.seq = 0;
    Next::DataOut
}

pub(super) fn inquiry(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    ctx.data_max = Cdb(&cmd).alloc_len().min(INQUIRY_LEN);

    let present = ctx.image_present();
    let result = &mut ctx.data_buf;
    result.fill(0);

    // Peripheral qualifier (7-5), device type (4-0): direct access device,
    // or 'not capable of supporting a device' without image
    result[0] = if present { 0x00 } else { 0x60 };
    // Not removable
    result[1] = 0;
    // SCSI-1
    result[2] = 0x01;
    result[3] = 0x02;
    // Additional length
    result[4] = (INQUIRY_LEN - 4) as u8;
    // 5..8 reserved, no optional features

    result[8..16].copy_from_slice(VENDOR_ID);
    result[16..32].copy_from_slice(PRODUCT_ID);
    let revision = format!("{:<4.4}", VERSION_SHORT);
    result[32..36].copy_from_slice(revision.as_bytes());

    ctx.seq = 0;
    Next::DataIn
}

pub(super) fn read_capacity(ctx: &mut BusContext) -> Next {
    begin(ctx);
    ctx.data_max = 8;

    let (last_block, blocksize) = match (ctx.capacity_sectors(), ctx.limit_imagesize) {
        (0, _) => (0, 0),
        (n, 0) => (n - 1, SECTOR_SIZE as u32),
        // Some tools can't handle large disks
        (n, limit) => (n.min(limit) - 1, SECTOR_SIZE as u32),
    };
    ctx.data_buf[0..4].copy_from_slice(&last_block.to_be_bytes());
    ctx.data_buf[4..8].copy_from_slice(&blocksize.to_be_bytes());

    ctx.seq = 0;
    Next::DataIn
}

/// MODE SENSE(6), MODE SENSE(10)
pub(super) fn mode_sense(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    let cdb = Cdb(&cmd);
    ctx.data_max = cdb.alloc_len().min(MODE_SENSE_MAX);
    ctx.data_buf.fill(0);

    match cdb.page_code() {
        PAGE_DRIVE_INFO => {
            // Header, then the version string as the page body
            let version = format!("{}-SCSI", VERSION_SHORT);
            let len = version.len().min(ctx.data_max.saturating_sub(7));
            ctx.data_buf[3] = 1;
            ctx.data_buf[6] = len as u8;
            ctx.data_buf[7..(7 + len)].copy_from_slice(&version.as_bytes()[..len]);

            ctx.seq = 0;
            Next::DataIn
        }
        page => {
            log::warn!("SCSI: unsupported mode page {:02X}", page);
            check_condition(ctx, SenseKey::IllegalRequest, Asc::InvalidFieldInCdb)
        }
    }
}

pub(super) fn format_unit(ctx: &mut BusContext) -> Next {
    let cmd = begin(ctx);
    let flags = Cdb(&cmd).format_flags();

    if ctx.store.is_write_protected(ctx.target, ctx.lun) {
        return write_protected(ctx);
    }

    // The complete list bit is ignored, the defect list format must be 0
    match (flags.fmtdata(), flags.defect_list_format()) {
        (true, 0) => {
            // Defect list header follows
            ctx.data_max = 4;
            ctx.seq = 0;
            Next::DataOut
        }
        (false, 0) => {
            (ctx.format_handler)(ctx);
            Next::Status(ScsiStatus::Good)
        }
        _ => check_condition(
            ctx,
            SenseKey::IllegalRequest,
            Asc::InvalidFieldInParameterList,
        ),
    }
}

pub(super) fn reassign_blocks(ctx: &mut BusContext) -> Next {
    begin(ctx);
    // Defect list header first
    ctx.data_max = 4;
    ctx.seq = 0;
    Next::DataOut
}

/// DATA IN buffer drained: load the next block of a READ or finish
pub(super) fn data_in_done(ctx: &mut BusContext) -> Next {
    match Opcode::from_u8(ctx.command) {
        Some(Opcode::Read6 | Opcode::Read10) => {
            ctx.seq = 0;
            ctx.blocks = ctx.blocks.saturating_sub(1);
            ctx.address = ctx.address.wrapping_add(1);
            if ctx.blocks == 0 {
                return Next::Status(ScsiStatus::Good);
            }
            if ctx.address >= ctx.capacity_sectors() {
                return lba_out_of_range(ctx);
            }
            match load_sector(ctx) {
                Ok(()) => Next::DataIn,
                Err(next) => next,
            }
        }
        _ => Next::Status(ScsiStatus::Good),
    }
}

/// DATA OUT buffer full: commit it according to the command in progress
pub(super) fn data_out_done(ctx: &mut BusContext) -> Next {
    match Opcode::from_u8(ctx.command) {
        Some(Opcode::Write6 | Opcode::Write10 | Opcode::WriteVerify) => {
            if let Err(next) = store_sector(ctx) {
                return next;
            }
            ctx.seq = 0;
            ctx.blocks = ctx.blocks.saturating_sub(1);
            ctx.address = ctx.address.wrapping_add(1);
            if ctx.blocks == 0 {
                return Next::Status(ScsiStatus::Good);
            }
            if ctx.address >= ctx.capacity_sectors() {
                return lba_out_of_range(ctx);
            }
            Next::DataOut
        }
        Some(Opcode::FormatUnit) => {
            // Only an empty defect list header is accepted
            if ctx.data_buf[..4].iter().any(|&b| b != 0) {
                return check_condition(
                    ctx,
                    SenseKey::IllegalRequest,
                    Asc::InvalidFieldInParameterList,
                );
            }
            (ctx.format_handler)(ctx);
            Next::Status(ScsiStatus::Good)
        }
        Some(Opcode::ReassignBlocks) => {
            if ctx.seq == 4 && ctx.data_max == 4 {
                // Header received, take in the defect list and ignore it
                let len = u32::from_be_bytes([
                    ctx.data_buf[0],
                    ctx.data_buf[1],
                    ctx.data_buf[2],
                    ctx.data_buf[3],
                ]);
                ctx.data_max = (len as usize).saturating_add(4).min(DATA_BUF_LEN);
                if ctx.data_max > ctx.seq {
                    return Next::DataOut;
                }
            }
            Next::Status(ScsiStatus::Good)
        }
        _ => Next::Status(ScsiStatus::Good),
    }
}
