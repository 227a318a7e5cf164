//! Protocol tests driving the bus from the initiator side


use super::bus::{BusContext, Phase};
use super::image::{ImageStore, MemoryImageStore, Sector};
use super::wire::Signal;
use super::{slot_id, ScsiStatus, SECTOR_SIZE};

/// Test initiator (ID 7), talking to the target over the wire interface only
struct Initiator {
    bus: BusContext,
}

impl Initiator {
    /// Bus with images of `sectors` sectors at the given (target, LUN) pairs,
    /// filled with a per-sector pattern
    fn with_disks(disks: &[(u8, u8, usize)]) -> Self {
        let mut store = MemoryImageStore::new();
        for &(target, lun, sectors) in disks {
            store
                .insert(slot_id(target, lun), pattern(target, sectors))
                .unwrap();
        }
        Self::with_store(store)
    }

    /// Capacity follows the image size, most tests depend on real bounds
    fn with_store(store: impl ImageStore + 'static) -> Self {
        let mut bus = BusContext::new(Box::new(store));
        bus.set_max_imagesize(0);
        Self { bus }
    }

    /// Sector contents as stored in the image, bypassing the bus
    fn disk_sector(&mut self, target: u8, lun: u8, lba: u32) -> Sector {
        self.bus.store_mut().read_sector(target, lun, lba).unwrap()
    }

    fn ack(&mut self) {
        assert!(self.bus.get_signal(Signal::Req), "ACK without REQ");
        self.bus.set_signal(Signal::Ack, true).unwrap();
        self.bus.set_signal(Signal::Ack, false).unwrap();
    }

    /// Arbitration-less selection of `target`
    fn select(&mut self, target: u8) {
        assert_eq!(self.bus.phase(), Phase::BusFree);
        assert!(self.bus.set_databus(!(0x80 | (1 << target))));
        self.bus.set_signal(Signal::Sel, true).unwrap();
        assert!(self.bus.get_signal(Signal::BsyOut), "target did not respond");
        self.bus.set_signal(Signal::Sel, false).unwrap();
        assert_eq!(self.bus.phase(), Phase::Command);
    }

    fn send_command(&mut self, cdb: &[u8]) {
        for &b in cdb {
            assert_eq!(self.bus.phase(), Phase::Command);
            assert!(self.bus.set_databus(!b));
            self.ack();
        }
    }

    fn read_data(&mut self, len: usize) -> Vec<u8> {
        let mut result = Vec::with_capacity(len);
        for _ in 0..len {
            assert_eq!(self.bus.phase(), Phase::DataIn);
            assert!(self.bus.get_signal(Signal::Io));
            assert!(!self.bus.get_signal(Signal::Cd));
            result.push(!self.bus.get_databus());
            self.ack();
        }
        result
    }

    fn write_data(&mut self, data: &[u8]) {
        for &b in data {
            assert_eq!(self.bus.phase(), Phase::DataOut);
            assert!(self.bus.set_databus(!b));
            self.ack();
        }
    }

    /// Reads the status byte and completes the command
    fn status(&mut self) -> u8 {
        assert_eq!(self.bus.phase(), Phase::Status);
        assert!(self.bus.get_signal(Signal::Cd));
        let status = !self.bus.get_databus();
        self.ack();
        status
    }

    /// Selects `target` and runs `cdb` with no data phase
    fn run(&mut self, target: u8, cdb: &[u8]) -> u8 {
        self.select(target);
        self.send_command(cdb);
        self.status()
    }

    fn run_read(&mut self, target: u8, cdb: &[u8], len: usize) -> (Vec<u8>, u8) {
        self.select(target);
        self.send_command(cdb);
        let data = self.read_data(len);
        (data, self.status())
    }

    fn request_sense(&mut self, target: u8, lun: u8) -> Vec<u8> {
        let (data, status) = self.run_read(target, &[0x03, lun << 5, 0, 0, 18, 0], 18);
        assert_eq!(status, GOOD);
        data
    }
}

const GOOD: u8 = ScsiStatus::Good.code();
const CHECK_CONDITION: u8 = ScsiStatus::CheckCondition.code();

fn pattern(seed: u8, sectors: usize) -> Vec<u8> {
    (0..(sectors * SECTOR_SIZE))
        .map(|i| ((i / SECTOR_SIZE) as u8).wrapping_mul(31) ^ (i as u8) ^ seed)
        .collect()
}

fn sector(data: &[u8], lba: usize) -> &[u8] {
    &data[(lba * SECTOR_SIZE)..((lba + 1) * SECTOR_SIZE)]
}
