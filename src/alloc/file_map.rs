//! # File Map
//!
//! Maps the single backing file of a database into memory and hands out
//! stable byte slices addressed by refs (byte offsets). Three backings:
//!
//! - **Mapped**: the common case, a `memmap2` mutable mapping of the file.
//! - **Buffered with file**: encrypted databases; the decrypted image lives
//!   in a heap buffer and the file holds the encrypted container.
//! - **Buffered without file**: in-memory databases and read-only images
//!   opened from a caller-supplied buffer.
//!
//! ## Ref Stability
//!
//! Readers hold slices into the map across arbitrary growth, so a grow never
//! invalidates previously handed-out memory: the old mapping (or buffer) is
//! pushed onto a retired list that lives until the `FileMap` drops, and a new
//! full-size mapping becomes current. Committed bytes are immutable
//! (copy-on-write), so a slice resolved through a retired mapping stays
//! byte-identical to the same range in the current one.
//!
//! ## Growth Policy
//!
//! Capacity doubles until 128 MiB, then grows in 128 MiB increments, always
//! rounded up to the OS page size.
//!
//! ## File Header
//!
//! The first 24 bytes of the image hold two mirrored top-ref slots, magic,
//! format version, flags, and a select byte choosing the live slot. Commit
//! writes the new top ref into the inactive slot, flushes, then flips the
//! select byte, so a crash at any point leaves one valid slot.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{Result, WrapErr};
use memmap2::MmapMut;
use parking_lot::RwLock;
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::crypto::PageCipher;
use crate::error::{err, ErrorKind};

pub const FILE_HEADER_SIZE: usize = 24;
pub const FILE_MAGIC: &[u8; 4] = b"ClDb";
pub const FILE_FORMAT_VERSION: u8 = 1;

const INITIAL_CAPACITY: u64 = 4096;
const PAGE_ALIGN: u64 = 4096;
const DOUBLING_LIMIT: u64 = 128 * 1024 * 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    top_ref: [U64; 2],
    magic: [u8; 4],
    format_version: u8,
    flags: u8,
    select: u8,
    reserved: u8,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new_empty() -> Self {
        Self {
            top_ref: [U64::new(0), U64::new(0)],
            magic: *FILE_MAGIC,
            format_version: FILE_FORMAT_VERSION,
            flags: 0,
            select: 0,
            reserved: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.magic != *FILE_MAGIC {
            return Err(err(ErrorKind::InvalidDatabase(
                "bad magic in file header".into(),
            )));
        }
        if self.format_version != FILE_FORMAT_VERSION {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "unsupported file format version {}",
                self.format_version
            ))));
        }
        if self.select > 1 {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "header select byte corrupted: {}",
                self.select
            ))));
        }
        Ok(())
    }

    pub fn current_top_ref(&self) -> u64 {
        self.top_ref[self.select as usize].get()
    }

    /// Used when serializing a standalone image: both slots point at the
    /// chosen version and slot 0 is selected.
    pub fn set_top_ref_both(&mut self, top_ref: u64) {
        self.top_ref = [U64::new(top_ref), U64::new(top_ref)];
        self.select = 0;
    }
}

enum Backing {
    Mapped {
        file: File,
        current: MmapMut,
        retired: Vec<MmapMut>,
    },
    Buffered {
        file: Option<File>,
        cipher: Option<PageCipher>,
        buf: Box<[u8]>,
        retired: Vec<Box<[u8]>>,
        writable: bool,
    },
}

struct MapInner {
    backing: Backing,
    capacity: u64,
}

pub struct FileMap {
    inner: RwLock<MapInner>,
}

impl FileMap {
    /// Opens or creates a plain (unencrypted) file-backed map.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                err(ErrorKind::FileAccess(format!(
                    "failed to open '{}': {}",
                    path.display(),
                    e
                )))
            })?;

        let len = file
            .metadata()
            .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?
            .len();
        let fresh = len < FILE_HEADER_SIZE as u64;
        let capacity = if fresh {
            INITIAL_CAPACITY
        } else {
            len.max(INITIAL_CAPACITY)
        };
        if capacity != len {
            file.set_len(capacity)
                .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
        }

        // SAFETY: the database file is owned by this engine for the lifetime
        // of the map; writers only touch ranges no published version can
        // reach, and the mapping is retired (kept alive), never unmapped,
        // on growth.
        let current = unsafe {
            MmapMut::map_mut(&file).map_err(|e| {
                err(ErrorKind::FileAccess(format!(
                    "failed to map '{}': {}",
                    path.display(),
                    e
                )))
            })?
        };

        let map = Self {
            inner: RwLock::new(MapInner {
                backing: Backing::Mapped {
                    file,
                    current,
                    retired: Vec::new(),
                },
                capacity,
            }),
        };
        if fresh {
            map.init_header()?;
        }
        map.header()?.validate()?;
        Ok(map)
    }

    /// Opens or creates an encrypted file-backed map. The on-disk bytes are
    /// an encrypted container; the decrypted image lives in memory.
    pub fn open_encrypted<P: AsRef<Path>>(path: P, cipher: PageCipher) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| {
                err(ErrorKind::FileAccess(format!(
                    "failed to open '{}': {}",
                    path.display(),
                    e
                )))
            })?;

        let len = file
            .metadata()
            .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?
            .len();

        let (buf, fresh) = if len == 0 {
            (vec![0u8; INITIAL_CAPACITY as usize], true)
        } else {
            let mut container = Vec::with_capacity(len as usize);
            file.read_to_end(&mut container)
                .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
            (cipher.decrypt_image(&container)?, false)
        };

        let capacity = buf.len() as u64;
        let map = Self {
            inner: RwLock::new(MapInner {
                backing: Backing::Buffered {
                    file: Some(file),
                    cipher: Some(cipher),
                    buf: buf.into_boxed_slice(),
                    retired: Vec::new(),
                    writable: true,
                },
                capacity,
            }),
        };
        if fresh {
            map.init_header()?;
        }
        map.header()?.validate()?;
        Ok(map)
    }

    /// Creates a fresh in-memory map with an empty header.
    pub fn new_mem() -> Result<Self> {
        let map = Self {
            inner: RwLock::new(MapInner {
                backing: Backing::Buffered {
                    file: None,
                    cipher: None,
                    buf: vec![0u8; INITIAL_CAPACITY as usize].into_boxed_slice(),
                    retired: Vec::new(),
                    writable: true,
                },
                capacity: INITIAL_CAPACITY,
            }),
        };
        map.init_header()?;
        Ok(map)
    }

    /// Opens a read-only map over a caller-supplied image.
    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return Err(err(ErrorKind::InvalidDatabase(
                "image buffer smaller than file header".into(),
            )));
        }
        let capacity = data.len() as u64;
        let map = Self {
            inner: RwLock::new(MapInner {
                backing: Backing::Buffered {
                    file: None,
                    cipher: None,
                    buf: data.into_boxed_slice(),
                    retired: Vec::new(),
                    writable: false,
                },
                capacity,
            }),
        };
        map.header()?.validate()?;
        Ok(map)
    }

    pub fn capacity(&self) -> u64 {
        self.inner.read().capacity
    }

    pub fn is_writable(&self) -> bool {
        match &self.inner.read().backing {
            Backing::Mapped { .. } => true,
            Backing::Buffered { writable, .. } => *writable,
        }
    }

    /// Resolves `r..r+len` to a byte slice.
    pub fn slice(&self, r: u64, len: usize) -> Result<&[u8]> {
        let inner = self.inner.read();
        if r + len as u64 > inner.capacity {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "ref {} + {} beyond file capacity {}",
                r, len, inner.capacity
            ))));
        }
        let bytes = match &inner.backing {
            Backing::Mapped { current, .. } => &current[r as usize..r as usize + len],
            Backing::Buffered { buf, .. } => &buf[r as usize..r as usize + len],
        };
        // SAFETY: the backing allocation is only ever replaced by `grow`,
        // which retires (keeps alive) the old mapping or buffer until the
        // FileMap drops, and committed bytes are never rewritten in place
        // (copy-on-write). Extending the borrow to &self is therefore sound.
        Ok(unsafe { std::slice::from_raw_parts(bytes.as_ptr(), len) })
    }

    /// Writes bytes at `r`. Only the committing writer calls this, and only
    /// for ranges no published version can reach.
    pub fn write_at(&self, r: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        if r + data.len() as u64 > inner.capacity {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "write at ref {} + {} beyond capacity {}",
                r,
                data.len(),
                inner.capacity
            ))));
        }
        match &mut inner.backing {
            Backing::Mapped { current, .. } => {
                current[r as usize..r as usize + data.len()].copy_from_slice(data);
            }
            Backing::Buffered { buf, writable, .. } => {
                if !*writable {
                    return Err(err(ErrorKind::InvalidTransaction(
                        "database image is read-only".into(),
                    )));
                }
                buf[r as usize..r as usize + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }

    /// Grows capacity to hold at least `needed` bytes.
    pub fn ensure_capacity(&self, needed: u64) -> Result<()> {
        let mut inner = self.inner.write();
        if needed <= inner.capacity {
            return Ok(());
        }
        let new_capacity = next_capacity(inner.capacity, needed);
        match &mut inner.backing {
            Backing::Mapped {
                file,
                current,
                retired,
            } => {
                file.set_len(new_capacity)
                    .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?;
                // SAFETY: same ownership argument as at open; the old
                // mapping is retired below, never unmapped while live
                // slices may exist.
                let new_map = unsafe {
                    MmapMut::map_mut(&*file)
                        .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))?
                };
                let old = std::mem::replace(current, new_map);
                retired.push(old);
            }
            Backing::Buffered {
                buf,
                retired,
                writable,
                ..
            } => {
                if !*writable {
                    return Err(err(ErrorKind::InvalidTransaction(
                        "database image is read-only".into(),
                    )));
                }
                let mut new_buf = vec![0u8; new_capacity as usize];
                new_buf[..buf.len()].copy_from_slice(buf);
                let old = std::mem::replace(buf, new_buf.into_boxed_slice());
                retired.push(old);
            }
        }
        inner.capacity = new_capacity;
        Ok(())
    }

    /// Makes written data durable. For mapped backings this is an msync; for
    /// encrypted backings the whole image is re-encrypted and rewritten.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.read();
        match &inner.backing {
            Backing::Mapped { current, .. } => current
                .flush()
                .wrap_err("msync of database file failed")
                .map_err(|e| err(ErrorKind::FileAccess(e.to_string()))),
            Backing::Buffered {
                file: Some(file),
                cipher: Some(cipher),
                buf,
                ..
            } => {
                let container = cipher.encrypt_image(buf);
                let mut f = file;
                f.seek(SeekFrom::Start(0))
                    .and_then(|_| f.write_all(&container))
                    .and_then(|_| file.set_len(container.len() as u64))
                    .and_then(|_| file.sync_data())
                    .map_err(|e| err(ErrorKind::FileAccess(e.to_string())))
            }
            Backing::Buffered { .. } => Ok(()),
        }
    }

    pub fn header(&self) -> Result<FileHeader> {
        let raw = self.slice(0, FILE_HEADER_SIZE)?;
        FileHeader::read_from_bytes(raw)
            .map_err(|_| err(ErrorKind::InvalidDatabase("unreadable file header".into())))
    }

    fn init_header(&self) -> Result<()> {
        let header = FileHeader::new_empty();
        self.write_at(0, header.as_bytes())
    }

    /// Publishes a new top ref: writes it into the inactive slot, flushes,
    /// then flips the select byte and flushes again.
    pub fn publish_top_ref(&self, top_ref: u64, durable: bool) -> Result<()> {
        let mut header = self.header()?;
        let inactive = 1 - header.select;
        header.top_ref[inactive as usize] = U64::new(top_ref);
        self.write_at(0, header.as_bytes())?;
        if durable {
            self.flush()?;
        }
        header.select = inactive;
        self.write_at(0, header.as_bytes())?;
        if durable {
            self.flush()?;
        }
        Ok(())
    }
}

fn next_capacity(mut capacity: u64, needed: u64) -> u64 {
    while capacity < needed {
        if capacity < DOUBLING_LIMIT {
            capacity *= 2;
        } else {
            capacity += DOUBLING_LIMIT;
        }
    }
    capacity.div_ceil(PAGE_ALIGN) * PAGE_ALIGN
}
