//! Disk image backing store, one slot per (target, LUN)

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;

use super::{slot_id, MAX_IDS, MAX_LUNS, MAX_SLOTS, SECTOR_SIZE};

pub type Sector = [u8; SECTOR_SIZE];

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("image slot out of range: {0}")]
    SlotOutOfRange(usize),
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("image slot out of range: {0}")]
    OutOfRange(usize),
    #[error("no image attached to slot {0}")]
    NotOpen(usize),
}

#[derive(Debug, Error)]
pub enum SectorError {
    #[error("no image attached to target {target} LUN {lun}")]
    NoImage { target: u8, lun: u8 },
    #[error("I/O error at sector {lba:#x}: {source}")]
    Io {
        lba: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Storage behind the emulated targets.
///
/// Addressing is by (target, LUN); invalid pairs behave as empty slots.
pub trait ImageStore: Send {
    /// Opens `path` into `slot`, replacing any image already there
    fn attach(&mut self, slot: usize, path: &Path) -> Result<(), AttachError>;
    /// Like `attach`, but writes to the image are refused as write-protected
    fn attach_readonly(&mut self, slot: usize, path: &Path) -> Result<(), AttachError>;
    fn detach(&mut self, slot: usize) -> Result<(), SlotError>;
    fn detach_all(&mut self);

    fn is_present(&self, target: u8, lun: u8) -> bool;
    fn is_write_protected(&self, target: u8, lun: u8) -> bool;

    /// Image length in bytes, None if no image is attached
    fn image_len(&self, target: u8, lun: u8) -> Option<u64>;

    /// Reads one sector. Reads past the end of the image yield zeroes.
    fn read_sector(&mut self, target: u8, lun: u8, lba: u32) -> Result<Sector, SectorError>;
    fn write_sector(
        &mut self,
        target: u8,
        lun: u8,
        lba: u32,
        data: &Sector,
    ) -> Result<(), SectorError>;

    /// Capacity in sectors as reported to the initiator. A non-zero
    /// `max_imagesize` overrides the actual image length.
    fn capacity_sectors(&self, target: u8, lun: u8, max_imagesize: u32) -> u32 {
        let Some(len) = self.image_len(target, lun) else {
            return 0;
        };
        if max_imagesize != 0 {
            return max_imagesize;
        }
        len.div_ceil(SECTOR_SIZE as u64)
            .try_into()
            .unwrap_or(u32::MAX)
    }
}

fn valid_pair(target: u8, lun: u8) -> Option<usize> {
    ((target as usize) < MAX_IDS && (lun as usize) < MAX_LUNS).then(|| slot_id(target, lun))
}

fn check_slot(slot: usize) -> Result<(), SlotError> {
    if slot >= MAX_SLOTS {
        return Err(SlotError::OutOfRange(slot));
    }
    Ok(())
}

struct ImageFile {
    file: File,
    path: PathBuf,
    write_protect: bool,
}

/// Image store backed by files on the host, accessed in place
pub struct FileImageStore {
    slots: [Option<ImageFile>; MAX_SLOTS],
}

impl Default for FileImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FileImageStore {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Path of the image attached at `slot`
    pub fn image_path(&self, slot: usize) -> Option<&Path> {
        self.slots.get(slot)?.as_ref().map(|i| i.path.as_path())
    }

    fn open_into(
        &mut self,
        slot: usize,
        path: &Path,
        write_protect: bool,
    ) -> Result<(), AttachError> {
        if slot >= MAX_SLOTS {
            return Err(AttachError::SlotOutOfRange(slot));
        }
        // Release the old image (and its lock) before opening, the same file
        // may be attached again.
        self.slots[slot] = None;

        let file = OpenOptions::new()
            .read(true)
            .write(!write_protect)
            .open(path)
            .map_err(|source| AttachError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let locked = if write_protect {
            FileExt::try_lock_shared(&file)
        } else {
            FileExt::try_lock_exclusive(&file)
        };
        locked.map_err(|source| AttachError::Lock {
            path: path.to_path_buf(),
            source,
        })?;

        self.slots[slot] = Some(ImageFile {
            file,
            path: path.to_path_buf(),
            write_protect,
        });
        Ok(())
    }

    fn image(&mut self, target: u8, lun: u8) -> Result<&mut ImageFile, SectorError> {
        valid_pair(target, lun)
            .and_then(|slot| self.slots[slot].as_mut())
            .ok_or(SectorError::NoImage { target, lun })
    }
}

impl ImageStore for FileImageStore {
    fn attach(&mut self, slot: usize, path: &Path) -> Result<(), AttachError> {
        self.open_into(slot, path, false)
    }

    fn attach_readonly(&mut self, slot: usize, path: &Path) -> Result<(), AttachError> {
        self.open_into(slot, path, true)
    }

    fn detach(&mut self, slot: usize) -> Result<(), SlotError> {
        check_slot(slot)?;
        // Dropping the file releases the lock
        self.slots[slot].take().ok_or(SlotError::NotOpen(slot))?;
        Ok(())
    }

    fn detach_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    fn is_present(&self, target: u8, lun: u8) -> bool {
        valid_pair(target, lun).is_some_and(|slot| self.slots[slot].is_some())
    }

    fn is_write_protected(&self, target: u8, lun: u8) -> bool {
        valid_pair(target, lun)
            .and_then(|slot| self.slots[slot].as_ref())
            .is_some_and(|i| i.write_protect)
    }

    fn image_len(&self, target: u8, lun: u8) -> Option<u64> {
        let image = self.slots[valid_pair(target, lun)?].as_ref()?;
        match image.file.metadata() {
            Ok(m) => Some(m.len()),
            Err(e) => {
                log::error!("Cannot stat {}: {}", image.path.display(), e);
                Some(0)
            }
        }
    }

    fn read_sector(&mut self, target: u8, lun: u8, lba: u32) -> Result<Sector, SectorError> {
        let image = self.image(target, lun)?;
        let io = |source| SectorError::Io { lba, source };

        image
            .file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))
            .map_err(io)?;

        // Images may be shorter than their nominal geometry, whatever is
        // missing reads as zeroes.
        let mut result = [0; SECTOR_SIZE];
        let mut filled = 0;
        while filled < SECTOR_SIZE {
            match image.file.read(&mut result[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(io(e)),
            }
        }
        Ok(result)
    }

    fn write_sector(
        &mut self,
        target: u8,
        lun: u8,
        lba: u32,
        data: &Sector,
    ) -> Result<(), SectorError> {
        let image = self.image(target, lun)?;
        let io = |source| SectorError::Io { lba, source };

        image
            .file
            .seek(SeekFrom::Start(u64::from(lba) * SECTOR_SIZE as u64))
            .map_err(io)?;
        image.file.write_all(data).map_err(io)?;
        image.file.flush().map_err(io)?;
        Ok(())
    }
}

/// Byte offset of a sector in a memory image, None if not addressable
fn sector_offset(lba: u32) -> Option<usize> {
    usize::try_from(lba).ok()?.checked_mul(SECTOR_SIZE)
}

#[derive(Default)]
struct MemoryImage {
    data: Vec<u8>,
    write_protect: bool,
}

/// Image store keeping images in memory. Attached files are loaded once and
/// never written back. Images keep their size, writes past the end fail.
pub struct MemoryImageStore {
    slots: [Option<MemoryImage>; MAX_SLOTS],
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }

    /// Places an image at `slot` directly
    pub fn insert(&mut self, slot: usize, data: Vec<u8>) -> Result<(), SlotError> {
        check_slot(slot)?;
        self.slots[slot] = Some(MemoryImage {
            data,
            write_protect: false,
        });
        Ok(())
    }

    pub fn set_write_protect(&mut self, slot: usize, write_protect: bool) -> Result<(), SlotError> {
        check_slot(slot)?;
        let image = self.slots[slot].as_mut().ok_or(SlotError::NotOpen(slot))?;
        image.write_protect = write_protect;
        Ok(())
    }

    /// Image contents at `slot`
    pub fn contents(&self, slot: usize) -> Option<&[u8]> {
        self.slots.get(slot)?.as_ref().map(|i| i.data.as_slice())
    }
}

impl ImageStore for MemoryImageStore {
    fn attach(&mut self, slot: usize, path: &Path) -> Result<(), AttachError> {
        if slot >= MAX_SLOTS {
            return Err(AttachError::SlotOutOfRange(slot));
        }
        self.slots[slot] = None;
        let data = std::fs::read(path).map_err(|source| AttachError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.slots[slot] = Some(MemoryImage {
            data,
            write_protect: false,
        });
        Ok(())
    }

    fn attach_readonly(&mut self, slot: usize, path: &Path) -> Result<(), AttachError> {
        self.attach(slot, path)?;
        if let Some(image) = self.slots[slot].as_mut() {
            image.write_protect = true;
        }
        Ok(())
    }

    fn detach(&mut self, slot: usize) -> Result<(), SlotError> {
        check_slot(slot)?;
        self.slots[slot].take().ok_or(SlotError::NotOpen(slot))?;
        Ok(())
    }

    fn detach_all(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }

    fn is_present(&self, target: u8, lun: u8) -> bool {
        valid_pair(target, lun).is_some_and(|slot| self.slots[slot].is_some())
    }

    fn is_write_protected(&self, target: u8, lun: u8) -> bool {
        valid_pair(target, lun)
            .and_then(|slot| self.slots[slot].as_ref())
            .is_some_and(|i| i.write_protect)
    }

    fn image_len(&self, target: u8, lun: u8) -> Option<u64> {
        self.slots[valid_pair(target, lun)?]
            .as_ref()
            .map(|i| i.data.len() as u64)
    }

    fn read_sector(&mut self, target: u8, lun: u8, lba: u32) -> Result<Sector, SectorError> {
        let image = valid_pair(target, lun)
            .and_then(|slot| self.slots[slot].as_ref())
            .ok_or(SectorError::NoImage { target, lun })?;

        let mut result = [0; SECTOR_SIZE];
        let offset = sector_offset(lba).unwrap_or(usize::MAX);
        if offset < image.data.len() {
            let end = image.data.len().min(offset + SECTOR_SIZE);
            result[..(end - offset)].copy_from_slice(&image.data[offset..end]);
        }
        Ok(result)
    }

    fn write_sector(
        &mut self,
        target: u8,
        lun: u8,
        lba: u32,
        data: &Sector,
    ) -> Result<(), SectorError> {
        let image = valid_pair(target, lun)
            .and_then(|slot| self.slots[slot].as_mut())
            .ok_or(SectorError::NoImage { target, lun })?;

        // Images are fixed size, only a partial last sector may be filled up
        let offset = sector_offset(lba)
            .filter(|&o| o < image.data.len())
            .ok_or_else(|| SectorError::Io {
                lba,
                source: std::io::Error::new(
                    ErrorKind::InvalidInput,
                    "write past the end of a memory image",
                ),
            })?;
        if image.data.len() < offset + SECTOR_SIZE {
            image.data.resize(offset + SECTOR_SIZE, 0);
        }
        image.data[offset..(offset + SECTOR_SIZE)].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scratch image file, removed on drop
    pub(crate) struct TempImage {
        pub path: PathBuf,
    }

    impl TempImage {
        pub fn new(contents: &[u8]) -> Self {
            static COUNTER: AtomicUsize = AtomicUsize::new(0);

            let mut path = std::env::temp_dir();
            path.push(format!(
                "scsibus_test_{}_{}.img",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            ));
            std::fs::write(&path, contents).unwrap();
            Self { path }
        }
    }

    impl Drop for TempImage {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn pattern(sectors: usize) -> Vec<u8> {
        (0..(sectors * SECTOR_SIZE)).map(|i| (i / SECTOR_SIZE) as u8 ^ i as u8).collect()
    }

    #[test]
    fn file_attach_bad_slot() {
        let img = TempImage::new(&pattern(1));
        let mut store = FileImageStore::new();
        assert!(matches!(
            store.attach(56, &img.path),
            Err(AttachError::SlotOutOfRange(56))
        ));
    }

    #[test]
    fn file_attach_missing_file() {
        let mut store = FileImageStore::new();
        let path = std::env::temp_dir().join("scsibus_test_does_not_exist.img");
        assert!(matches!(
            store.attach(0, &path),
            Err(AttachError::Open { .. })
        ));
        assert!(!store.is_present(0, 0));
    }

    #[test]
    fn file_detach() {
        let img = TempImage::new(&pattern(1));
        let mut store = FileImageStore::new();
        assert_eq!(store.detach(3), Err(SlotError::NotOpen(3)));
        assert_eq!(store.detach(60), Err(SlotError::OutOfRange(60)));

        store.attach(slot_id(1, 2), &img.path).unwrap();
        assert!(store.is_present(1, 2));
        assert_eq!(store.image_path(10), Some(img.path.as_path()));
        store.detach(slot_id(1, 2)).unwrap();
        assert!(!store.is_present(1, 2));
    }

    #[test]
    fn file_reattach_same_path() {
        let img = TempImage::new(&pattern(1));
        let mut store = FileImageStore::new();
        store.attach(0, &img.path).unwrap();
        store.attach(0, &img.path).unwrap();
        assert!(store.is_present(0, 0));
    }

    #[test]
    fn file_read_write() {
        let img = TempImage::new(&pattern(4));
        let mut store = FileImageStore::new();
        store.attach(slot_id(2, 0), &img.path).unwrap();

        let s = store.read_sector(2, 0, 2).unwrap();
        assert_eq!(&s[..], &pattern(4)[1024..1536]);

        store.write_sector(2, 0, 1, &[0xA5; SECTOR_SIZE]).unwrap();
        store.detach_all();

        let contents = std::fs::read(&img.path).unwrap();
        assert!(contents[512..1024].iter().all(|&b| b == 0xA5));
        assert_eq!(&contents[1024..], &pattern(4)[1024..]);
    }

    #[test]
    fn file_short_read_zero_fills() {
        // One and a half sectors
        let img = TempImage::new(&[0x11; 768]);
        let mut store = FileImageStore::new();
        store.attach(0, &img.path).unwrap();

        let s = store.read_sector(0, 0, 1).unwrap();
        assert!(s[..256].iter().all(|&b| b == 0x11));
        assert!(s[256..].iter().all(|&b| b == 0));

        let s = store.read_sector(0, 0, 100).unwrap();
        assert!(s.iter().all(|&b| b == 0));
    }

    #[test]
    fn file_readonly() {
        let img = TempImage::new(&pattern(1));
        let mut store = FileImageStore::new();
        store.attach_readonly(0, &img.path).unwrap();
        assert!(store.is_write_protected(0, 0));
        assert!(store.read_sector(0, 0, 0).is_ok());
        assert!(matches!(
            store.write_sector(0, 0, 0, &[0; SECTOR_SIZE]),
            Err(SectorError::Io { .. })
        ));
    }

    #[test]
    fn capacity_policy() {
        let img = TempImage::new(&[0; 1000]);
        let mut store = FileImageStore::new();
        assert_eq!(store.capacity_sectors(0, 0, 0), 0);
        assert_eq!(store.capacity_sectors(0, 0, 1234), 0);

        store.attach(0, &img.path).unwrap();
        assert_eq!(store.capacity_sectors(0, 0, 0), 2);
        assert_eq!(store.capacity_sectors(0, 0, 1234), 1234);
        assert_eq!(store.capacity_sectors(7, 0, 0), 0);
    }

    #[test]
    fn memory_store() {
        let mut store = MemoryImageStore::new();
        assert!(!store.is_present(0, 1));
        assert!(matches!(
            store.read_sector(0, 1, 0),
            Err(SectorError::NoImage { target: 0, lun: 1 })
        ));

        store.insert(1, vec![0x22; 600]).unwrap();
        assert!(store.is_present(0, 1));
        assert_eq!(store.capacity_sectors(0, 1, 0), 2);

        let s = store.read_sector(0, 1, 1).unwrap();
        assert!(s[..88].iter().all(|&b| b == 0x22));
        assert!(s[88..].iter().all(|&b| b == 0));

        // Partial last sector is filled up
        store.write_sector(0, 1, 1, &[0x33; SECTOR_SIZE]).unwrap();
        assert_eq!(store.contents(1).unwrap().len(), 2 * SECTOR_SIZE);

        store.set_write_protect(1, true).unwrap();
        assert!(store.is_write_protected(0, 1));
        assert_eq!(store.set_write_protect(2, true), Err(SlotError::NotOpen(2)));
    }

    #[test]
    fn memory_write_past_end() {
        let mut store = MemoryImageStore::new();
        store.insert(0, vec![0; 4 * SECTOR_SIZE]).unwrap();

        for lba in [4, 1_048_575, 0xFFFF_FFF0, u32::MAX] {
            assert!(
                matches!(
                    store.write_sector(0, 0, lba, &[0x44; SECTOR_SIZE]),
                    Err(SectorError::Io { lba: l, .. }) if l == lba
                ),
                "LBA {:#x}",
                lba
            );
        }
        assert_eq!(store.contents(0).unwrap().len(), 4 * SECTOR_SIZE);

        // Reads out there are still zeroes
        assert!(store.read_sector(0, 0, u32::MAX).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn memory_attach_loads_file() {
        let img = TempImage::new(&pattern(2));
        let mut store = MemoryImageStore::new();
        store.attach(slot_id(6, 7), &img.path).unwrap();
        assert_eq!(store.contents(55), Some(pattern(2).as_slice()));
        assert_eq!(store.detach(55), Ok(()));
        assert_eq!(store.detach(55), Err(SlotError::NotOpen(55)));
    }
}
