//! Bus line access for the host side register glue.
//!
//! The data bus is active-low on the wire; this is the only place where the
//! logical value kept by the state machine is inverted.

use thiserror::Error;

use super::bus::BusContext;

/// Bus control lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr, strum::EnumIter)]
pub enum Signal {
    Sel,
    Rst,
    Atn,
    /// BSY driven by the initiator
    BsyIn,
    /// BSY driven by the target
    BsyOut,
    Req,
    Ack,
    Cd,
    Io,
    Msg,
}

impl Signal {
    /// Lines the initiator may drive
    pub const fn host_driven(self) -> bool {
        matches!(
            self,
            Self::Sel | Self::Rst | Self::Atn | Self::BsyIn | Self::Ack
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("{0:?} is driven by the target")]
    ReadOnly(Signal),
}

impl BusContext {
    /// Data bus in wire polarity
    pub fn get_databus(&self) -> u8 {
        self.databus ^ 0xFF
    }

    /// Drives the data bus from the initiator, in wire polarity. Returns
    /// false (and ignores the value) while the target is driving.
    pub fn set_databus(&mut self, wire: u8) -> bool {
        if self.signals.io() {
            return false;
        }
        self.databus = wire ^ 0xFF;
        true
    }

    pub fn get_signal(&self, signal: Signal) -> bool {
        let s = &self.signals;
        match signal {
            Signal::Sel => s.sel(),
            Signal::Rst => s.rst(),
            Signal::Atn => s.atn(),
            Signal::BsyIn => s.bsy_in(),
            Signal::BsyOut => s.bsy_out(),
            Signal::Req => s.req(),
            Signal::Ack => s.ack(),
            Signal::Cd => s.cd(),
            Signal::Io => s.io(),
            Signal::Msg => s.msg(),
        }
    }

    /// Sets a line driven by the initiator and runs the state machine.
    /// A rising ACK handshakes the byte currently on the data bus.
    pub fn set_signal(&mut self, signal: Signal, level: bool) -> Result<(), SignalError> {
        match signal {
            Signal::Sel => {
                self.signals.set_sel(level);
                self.on_signal_change();
            }
            Signal::Rst => {
                self.signals.set_rst(level);
                self.on_signal_change();
            }
            Signal::BsyIn => {
                self.signals.set_bsy_in(level);
                self.on_signal_change();
            }
            Signal::Atn => self.signals.set_atn(level),
            Signal::Ack => {
                let rising = level && !self.signals.ack();
                self.signals.set_ack(level);
                if rising {
                    self.on_byte_ack(self.databus);
                }
            }
            Signal::BsyOut | Signal::Req | Signal::Cd | Signal::Io | Signal::Msg => {
                log::warn!("SCSI: ignoring write to target driven line {:?}", signal);
                return Err(SignalError::ReadOnly(signal));
            }
        }
        Ok(())
    }
}
