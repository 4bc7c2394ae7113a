//! # Control Region
//!
//! The shared-memory side of MVCC: a small fixed-layout structure in the
//! sibling `.lock` file (or a heap buffer for in-memory databases) holding
//! the bounded version ring. Each ring entry publishes one committed
//! version — `(version, top_ref, file_size, reader_count)` — and the header
//! names the newest slot. Readers pin an entry by bumping its reader count;
//! a writer publishes into a slot whose count is zero.
//!
//! ## Layout
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  ---------------------------------
//! 0       4     magic "CLCK"
//! 4       4     layout version (little-endian)
//! 8       4     newest slot index
//! 12      4     crc32 over magic + layout version
//! 16      16    reserved
//! 32      32*N  ring entries (N = 16)
//! ```
//!
//! ## Cross-Process Discipline
//!
//! Compound ring operations are serialized by a short advisory lock on the
//! `.lock` file plus the owner's in-process control mutex; the mapped bytes
//! are only read or written inside that critical section. Reader counts can
//! be left stale by a crashed process; the first session to open the file
//! (detected by an uncontended exclusive lock) reinitializes the ring from
//! the database header.

use std::fs::{File, OpenOptions};
use std::path::Path;

use crc::{Crc, CRC_32_ISO_HDLC};
use eyre::Result;
use fs2::FileExt;
use memmap2::MmapMut;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::error::{err, ErrorKind};

pub const RING_SIZE: usize = 16;
pub const INVALID_VERSION: u64 = u64::MAX;

const CONTROL_MAGIC: &[u8; 4] = b"CLCK";
const CONTROL_LAYOUT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;
const ENTRY_SIZE: usize = 32;
const REGION_SIZE: usize = HEADER_SIZE + RING_SIZE * ENTRY_SIZE;

const CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct ControlHeader {
    magic: [u8; 4],
    layout_version: U32,
    newest_slot: U32,
    crc: U32,
    reserved: [u8; 16],
}

const _: () = assert!(std::mem::size_of::<ControlHeader>() == HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct RingEntry {
    version: U64,
    top_ref: U64,
    file_size: U64,
    reader_count: U32,
    _pad: U32,
}

const _: () = assert!(std::mem::size_of::<RingEntry>() == ENTRY_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionInfo {
    pub slot: usize,
    pub version: u64,
    pub top_ref: u64,
    pub file_size: u64,
}

enum Backing {
    Mapped { _file: File, mmap: MmapMut },
    Mem(Box<[u8]>),
}

pub struct ControlRegion {
    backing: Backing,
    lock_file: Option<File>,
}

impl ControlRegion {
    /// Opens (or creates) the control region in `<db>.lock`. The caller
    /// determines session exclusivity (via the lifetime lock on the
    /// notification file): the first session reinitializes the ring from
    /// the given seed, discarding reader counts a crashed process may have
    /// left behind; later sessions validate the live region instead.
    pub fn open(lock_path: &Path, seed: (u64, u64, u64), first_session: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(lock_path)
            .map_err(|e| {
                err(ErrorKind::FileAccess(format!(
                    "failed to open lock file '{}': {}",
                    lock_path.display(),
                    e
                )))
            })?;
        file.set_len(REGION_SIZE as u64)
            .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;

        // SAFETY: the lock file is only ever accessed through this module,
        // under the advisory lock; the mapping lives as long as the region.
        let mmap = unsafe {
            MmapMut::map_mut(&file).map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?
        };

        let lock_file = file
            .try_clone()
            .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
        let mut region = Self {
            backing: Backing::Mapped { _file: file, mmap },
            lock_file: Some(lock_file),
        };

        region.locked(|region| {
            if first_session {
                region.init(seed);
                Ok(())
            } else {
                region.validate()
            }
        })?;
        Ok(region)
    }

    /// Heap-backed region for in-memory databases.
    pub fn new_mem(seed: (u64, u64, u64)) -> Self {
        let mut region = Self {
            backing: Backing::Mem(vec![0u8; REGION_SIZE].into_boxed_slice()),
            lock_file: None,
        };
        region.init(seed);
        region
    }

    fn bytes(&self) -> &[u8] {
        match &self.backing {
            Backing::Mapped { mmap, .. } => mmap,
            Backing::Mem(buf) => buf,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.backing {
            Backing::Mapped { mmap, .. } => mmap,
            Backing::Mem(buf) => buf,
        }
    }

    fn init(&mut self, (version, top_ref, file_size): (u64, u64, u64)) {
        let mut header = ControlHeader {
            magic: *CONTROL_MAGIC,
            layout_version: U32::new(CONTROL_LAYOUT_VERSION),
            newest_slot: U32::new(0),
            crc: U32::new(0),
            reserved: [0; 16],
        };
        let mut digest = CRC.digest();
        digest.update(&header.magic);
        digest.update(header.layout_version.as_bytes());
        header.crc = U32::new(digest.finalize());

        let bytes = self.bytes_mut();
        bytes[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        for i in 0..RING_SIZE {
            let entry = RingEntry {
                version: U64::new(if i == 0 { version } else { INVALID_VERSION }),
                top_ref: U64::new(if i == 0 { top_ref } else { 0 }),
                file_size: U64::new(if i == 0 { file_size } else { 0 }),
                reader_count: U32::new(0),
                _pad: U32::new(0),
            };
            let off = HEADER_SIZE + i * ENTRY_SIZE;
            bytes[off..off + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        }
    }

    fn validate(&self) -> Result<()> {
        let header = self.header()?;
        if header.magic != *CONTROL_MAGIC
            || header.layout_version.get() != CONTROL_LAYOUT_VERSION
        {
            return Err(err(ErrorKind::InvalidDatabase(
                "lock file control region is corrupted".into(),
            )));
        }
        let mut digest = CRC.digest();
        digest.update(&header.magic);
        digest.update(header.layout_version.as_bytes());
        if header.crc.get() != digest.finalize() {
            return Err(err(ErrorKind::InvalidDatabase(
                "lock file control region checksum mismatch".into(),
            )));
        }
        Ok(())
    }

    fn header(&self) -> Result<ControlHeader> {
        ControlHeader::read_from_bytes(&self.bytes()[..HEADER_SIZE])
            .map_err(|_| err(ErrorKind::InvalidDatabase("unreadable control header".into())))
    }

    fn entry(&self, slot: usize) -> RingEntry {
        let off = HEADER_SIZE + slot * ENTRY_SIZE;
        RingEntry::read_from_bytes(&self.bytes()[off..off + ENTRY_SIZE])
            .expect("ring entry size is fixed")
    }

    fn write_entry(&mut self, slot: usize, entry: RingEntry) {
        let off = HEADER_SIZE + slot * ENTRY_SIZE;
        self.bytes_mut()[off..off + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
    }

    fn set_newest_slot(&mut self, slot: usize) {
        let mut header = self.header().expect("validated at open");
        header.newest_slot = U32::new(slot as u32);
        let bytes = header.as_bytes().to_vec();
        self.bytes_mut()[..HEADER_SIZE].copy_from_slice(&bytes);
    }

    /// Serializes cross-process ring access for the closure's duration.
    pub fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        if let Some(file) = self.lock_file.take() {
            file.lock_exclusive()
                .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
            let result = f(self);
            let _ = FileExt::unlock(&file);
            self.lock_file = Some(file);
            result
        } else {
            f(self)
        }
    }

    pub fn newest(&self) -> VersionInfo {
        let slot = self.header().expect("validated at open").newest_slot.get() as usize;
        let entry = self.entry(slot);
        VersionInfo {
            slot,
            version: entry.version.get(),
            top_ref: entry.top_ref.get(),
            file_size: entry.file_size.get(),
        }
    }

    /// Pins the newest version for a reader.
    pub fn pin_newest(&mut self) -> Result<VersionInfo> {
        self.locked(|region| {
            let info = region.newest();
            let mut entry = region.entry(info.slot);
            entry.reader_count = U32::new(entry.reader_count.get() + 1);
            region.write_entry(info.slot, entry);
            Ok(info)
        })
    }

    pub fn unpin(&mut self, slot: usize) -> Result<()> {
        self.locked(|region| {
            let mut entry = region.entry(slot);
            let count = entry.reader_count.get();
            debug_assert!(count > 0, "unpin without a pin");
            entry.reader_count = U32::new(count.saturating_sub(1));
            region.write_entry(slot, entry);
            Ok(())
        })
    }

    /// Publishes a new version into a free ring slot and makes it newest.
    /// Fails when every other slot is pinned (bounded ring exhausted).
    pub fn publish(&mut self, version: u64, top_ref: u64, file_size: u64) -> Result<()> {
        self.locked(|region| {
            let newest = region.header().expect("validated at open").newest_slot.get() as usize;
            let mut chosen = None;
            let mut oldest = u64::MAX;
            for i in 0..RING_SIZE {
                if i == newest {
                    continue;
                }
                let entry = region.entry(i);
                if entry.reader_count.get() != 0 {
                    continue;
                }
                let v = entry.version.get();
                // Prefer unused slots, then the oldest unpinned version.
                let rank = if v == INVALID_VERSION { 0 } else { v };
                if chosen.is_none() || rank < oldest {
                    chosen = Some(i);
                    oldest = rank;
                }
            }
            let slot = chosen.ok_or_else(|| {
                err(ErrorKind::LogicError(
                    "version ring exhausted: too many pinned readers".into(),
                ))
            })?;
            region.write_entry(
                slot,
                RingEntry {
                    version: U64::new(version),
                    top_ref: U64::new(top_ref),
                    file_size: U64::new(file_size),
                    reader_count: U32::new(0),
                    _pad: U32::new(0),
                },
            );
            region.set_newest_slot(slot);
            Ok(())
        })
    }

    /// The oldest version any live reader may still observe. Versions below
    /// this are unreachable and their freed slabs reclaimable.
    pub fn oldest_live_version(&mut self) -> Result<u64> {
        self.locked(|region| {
            let newest = region.newest();
            let mut oldest = newest.version;
            for i in 0..RING_SIZE {
                let entry = region.entry(i);
                if entry.version.get() == INVALID_VERSION {
                    continue;
                }
                if entry.reader_count.get() > 0 {
                    oldest = oldest.min(entry.version.get());
                }
            }
            Ok(oldest)
        })
    }

    /// Number of entries currently pinned by readers.
    pub fn pinned_count(&mut self) -> Result<usize> {
        self.locked(|region| {
            let mut count = 0;
            for i in 0..RING_SIZE {
                let entry = region.entry(i);
                if entry.version.get() != INVALID_VERSION && entry.reader_count.get() > 0 {
                    count += 1;
                }
            }
            Ok(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_region_starts_at_seed() {
        let region = ControlRegion::new_mem((0, 0, 4096));
        let info = region.newest();
        assert_eq!(info.version, 0);
        assert_eq!(info.file_size, 4096);
    }

    #[test]
    fn pin_and_unpin_track_readers() {
        let mut region = ControlRegion::new_mem((5, 100, 4096));
        let pin = region.pin_newest().unwrap();
        assert_eq!(pin.version, 5);
        assert_eq!(region.pinned_count().unwrap(), 1);
        region.unpin(pin.slot).unwrap();
        assert_eq!(region.pinned_count().unwrap(), 0);
    }

    #[test]
    fn publish_advances_newest() {
        let mut region = ControlRegion::new_mem((0, 0, 4096));
        region.publish(1, 200, 8192).unwrap();
        let info = region.newest();
        assert_eq!(info.version, 1);
        assert_eq!(info.top_ref, 200);
        assert_eq!(info.file_size, 8192);
    }

    #[test]
    fn pinned_version_survives_publishes() {
        let mut region = ControlRegion::new_mem((0, 10, 4096));
        let pin = region.pin_newest().unwrap();
        for v in 1..=5u64 {
            region.publish(v, 10 + v, 4096).unwrap();
        }
        // The pinned entry is untouched.
        let entry = region.entry(pin.slot);
        assert_eq!(entry.version.get(), 0);
        assert_eq!(region.oldest_live_version().unwrap(), 0);
        region.unpin(pin.slot).unwrap();
        assert_eq!(region.oldest_live_version().unwrap(), 5);
    }

    #[test]
    fn ring_exhaustion_is_reported() {
        let mut region = ControlRegion::new_mem((0, 0, 4096));
        // Pin every version as it is published.
        let mut pins = vec![region.pin_newest().unwrap()];
        for v in 1..RING_SIZE as u64 {
            region.publish(v, v, 4096).unwrap();
            pins.push(region.pin_newest().unwrap());
        }
        let result = region.publish(RING_SIZE as u64, 99, 4096);
        assert!(result.is_err());
        // Releasing one reader unblocks publication.
        region.unpin(pins[0].slot).unwrap();
        region.publish(RING_SIZE as u64, 99, 4096).unwrap();
    }

    #[test]
    fn first_session_discards_stale_reader_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");
        {
            let mut region = ControlRegion::open(&path, (3, 50, 4096), true).unwrap();
            let _pin = region.pin_newest().unwrap();
            // Simulated crash: pin never released.
        }
        let mut region = ControlRegion::open(&path, (3, 50, 4096), true).unwrap();
        assert_eq!(region.pinned_count().unwrap(), 0);
        assert_eq!(region.newest().version, 3);
    }

    #[test]
    fn later_session_preserves_live_pins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let mut first = ControlRegion::open(&path, (1, 10, 4096), true).unwrap();
        let _pin = first.pin_newest().unwrap();

        let mut second = ControlRegion::open(&path, (1, 10, 4096), false).unwrap();
        assert_eq!(second.pinned_count().unwrap(), 1);
        assert_eq!(second.newest().version, 1);
    }
}
