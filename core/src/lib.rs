pub mod debuggable;
pub mod scsi;
