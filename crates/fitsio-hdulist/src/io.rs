//! Block-granular file access.
//!
//! [`BlockFile`] reads and writes whole 2880-byte blocks, either sequentially
//! from any [`Read`] source or at random offsets in a file or buffer. Data
//! regions are handed out as [`Region`]s: zero-copy [`SharedView`]s when the
//! backing is mapped or in memory, owned copies otherwise.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use memmap2::Mmap;

use crate::block::{check_alignment, is_aligned, BLOCK_SIZE};
use crate::config::{AccessMode, Config};
use crate::error::{Error, Result};

// ── Shared backing ──

enum Backing {
    Mapped(Mmap),
    Memory(Vec<u8>),
    /// Positioned reads that copy.
    File(Mutex<File>),
}

/// Handle on the bytes an unloaded data region will be read from.
///
/// Cloning is cheap; every clone refers to the same mapping or buffer.
#[derive(Clone)]
pub struct RegionSource(Arc<Backing>);

impl fmt::Debug for RegionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.0 {
            Backing::Mapped(_) => "mapped",
            Backing::Memory(_) => "memory",
            Backing::File(_) => "file",
        };
        f.debug_tuple("RegionSource").field(&kind).finish()
    }
}

impl RegionSource {
    pub(crate) fn memory(bytes: Vec<u8>) -> Self {
        RegionSource(Arc::new(Backing::Memory(bytes)))
    }

    fn len(&self) -> Result<u64> {
        Ok(match &*self.0 {
            Backing::Mapped(map) => map.len() as u64,
            Backing::Memory(bytes) => bytes.len() as u64,
            Backing::File(file) => lock_file(file)?.metadata()?.len(),
        })
    }

    /// Borrow or copy `len` bytes at `offset`.
    pub fn load(&self, offset: u64, len: usize) -> Result<Region> {
        let available = self.len()?;
        let end = offset + len as u64;
        if end > available {
            return Err(Error::TruncatedFile {
                offset: available,
                wanted: end - available,
            });
        }
        match &*self.0 {
            Backing::Mapped(_) | Backing::Memory(_) => Ok(Region::View(SharedView {
                source: self.clone(),
                start: offset as usize,
                len,
            })),
            Backing::File(file) => {
                let mut file = lock_file(file)?;
                file.seek(SeekFrom::Start(offset))?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf)?;
                Ok(Region::Owned(buf))
            }
        }
    }

    fn bytes(&self) -> &[u8] {
        match &*self.0 {
            Backing::Mapped(map) => map,
            Backing::Memory(bytes) => bytes,
            Backing::File(_) => &[],
        }
    }
}

fn lock_file(file: &Mutex<File>) -> Result<std::sync::MutexGuard<'_, File>> {
    file.lock()
        .map_err(|_| Error::Io(io::Error::other("file handle poisoned")))
}

/// Read-only window onto a mapped or in-memory backing.
#[derive(Clone)]
pub struct SharedView {
    source: RegionSource,
    start: usize,
    len: usize,
}

impl SharedView {
    pub fn as_bytes(&self) -> &[u8] {
        &self.source.bytes()[self.start..self.start + self.len]
    }
}

impl Deref for SharedView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for SharedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedView")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

/// Bytes of a data region as they came off the block layer.
#[derive(Debug)]
pub enum Region {
    View(SharedView),
    Owned(Vec<u8>),
}

impl Region {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Region::View(view) => view.as_bytes(),
            Region::Owned(bytes) => bytes,
        }
    }
}

// ── Block file ──

enum Inner {
    Stream {
        reader: Box<dyn Read>,
        position: u64,
    },
    Random {
        source: RegionSource,
        file: Option<File>,
        len: u64,
        use_memmap: bool,
    },
}

/// Whole-block reader/writer over a file, buffer, or stream.
pub struct BlockFile {
    inner: Inner,
}

impl fmt::Debug for BlockFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Stream { position, .. } => {
                f.debug_struct("BlockFile").field("stream_position", position).finish()
            }
            Inner::Random { source, len, .. } => f
                .debug_struct("BlockFile")
                .field("source", source)
                .field("len", len)
                .finish(),
        }
    }
}

impl BlockFile {
    /// Open `path` in the access mode `config` selects.
    pub fn open(path: &Path, writable: bool, config: &Config) -> Result<BlockFile> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        if config.access == AccessMode::Stream {
            debug!("opening {} for sequential access", path.display());
            return Ok(BlockFile::from_reader(io::BufReader::new(file)));
        }
        let len = file.metadata()?.len();
        let (source, mapped) = map_or_share(&file, len, config.use_memmap)?;
        debug!(
            "opened {} ({len} bytes, {})",
            path.display(),
            if mapped { "mapped" } else { "positioned reads" }
        );
        Ok(BlockFile {
            inner: Inner::Random {
                source,
                file: if writable { Some(file) } else { None },
                len,
                use_memmap: config.use_memmap,
            },
        })
    }

    /// Random access over an in-memory buffer. Not writable.
    pub fn from_bytes(bytes: Vec<u8>) -> BlockFile {
        let len = bytes.len() as u64;
        BlockFile {
            inner: Inner::Random {
                source: RegionSource::memory(bytes),
                file: None,
                len,
                use_memmap: false,
            },
        }
    }

    /// Sequential access over any reader. Regions are copied as they pass.
    pub fn from_reader<R: Read + 'static>(reader: R) -> BlockFile {
        BlockFile {
            inner: Inner::Stream {
                reader: Box::new(reader),
                position: 0,
            },
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.inner, Inner::Stream { .. })
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.inner, Inner::Random { file: Some(_), .. })
    }

    /// Total bytes available. Streams report the bytes consumed so far.
    pub fn len(&self) -> u64 {
        match &self.inner {
            Inner::Stream { position, .. } => *position,
            Inner::Random { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backing for lazily loaded regions; streams have none.
    pub fn source(&self) -> Option<RegionSource> {
        match &self.inner {
            Inner::Stream { .. } => None,
            Inner::Random { source, .. } => Some(source.clone()),
        }
    }

    // ── Reads ──

    /// Read the block at `offset`. `None` at a clean end of file.
    pub fn read_block(&mut self, offset: u64) -> Result<Option<[u8; BLOCK_SIZE]>> {
        check_alignment(offset, BLOCK_SIZE)?;
        let mut block = [0u8; BLOCK_SIZE];
        match &mut self.inner {
            Inner::Stream { reader, position } => {
                if !skip_to(reader, position, offset)? {
                    return Ok(None);
                }
                let got = read_full(reader, &mut block)?;
                *position += got as u64;
                match got {
                    0 => return Ok(None),
                    BLOCK_SIZE => {}
                    partial => {
                        return Err(Error::TruncatedFile {
                            offset: offset + partial as u64,
                            wanted: (BLOCK_SIZE - partial) as u64,
                        })
                    }
                }
            }
            Inner::Random { source, len, .. } => {
                if offset >= *len {
                    return Ok(None);
                }
                let region = source.load(offset, BLOCK_SIZE)?;
                block.copy_from_slice(region.as_bytes());
            }
        }
        trace!("read block at byte {offset}");
        Ok(Some(block))
    }

    /// Read `len` bytes starting on the block boundary `offset`.
    pub fn read_region(&mut self, offset: u64, len: usize) -> Result<Region> {
        if !is_aligned(offset) {
            return Err(Error::Alignment { offset, len });
        }
        match &mut self.inner {
            Inner::Stream { reader, position } => {
                let mut buf = vec![0u8; len];
                let got = if skip_to(reader, position, offset)? {
                    read_full(reader, &mut buf)?
                } else {
                    0
                };
                *position += got as u64;
                if got < len {
                    return Err(Error::TruncatedFile {
                        offset: offset + got as u64,
                        wanted: (len - got) as u64,
                    });
                }
                trace!("copied {len} bytes at byte {offset} from stream");
                Ok(Region::Owned(buf))
            }
            Inner::Random { source, .. } => source.load(offset, len),
        }
    }

    // ── Writes ──

    pub fn write_block(&mut self, offset: u64, block: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.write_blocks(offset, block)
    }

    /// Write whole blocks at a block-aligned offset.
    pub fn write_blocks(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        check_alignment(offset, bytes.len())?;
        let Inner::Random {
            file: Some(file),
            len,
            ..
        } = &mut self.inner
        else {
            return Err(Error::ReadOnly);
        };
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        *len = (*len).max(offset + bytes.len() as u64);
        trace!("wrote {} blocks at byte {offset}", bytes.len() / BLOCK_SIZE);
        Ok(())
    }

    /// Grow the file by `n` zeroed blocks. Returns the offset of the first.
    pub fn append_blocks(&mut self, n: usize) -> Result<u64> {
        let start = self.len();
        self.set_len(start + (n * BLOCK_SIZE) as u64)?;
        Ok(start)
    }

    /// Cut the file down to `total_blocks` blocks.
    pub fn truncate_to(&mut self, total_blocks: usize) -> Result<()> {
        self.set_len((total_blocks * BLOCK_SIZE) as u64)
    }

    fn set_len(&mut self, new_len: u64) -> Result<()> {
        let Inner::Random {
            file: Some(file),
            len,
            ..
        } = &mut self.inner
        else {
            return Err(Error::ReadOnly);
        };
        file.set_len(new_len)?;
        *len = new_len;
        self.refresh()
    }

    /// Re-establish the mapping after the file length changed.
    pub fn refresh(&mut self) -> Result<()> {
        if let Inner::Random {
            source,
            file: Some(file),
            len,
            use_memmap,
        } = &mut self.inner
        {
            *len = file.metadata()?.len();
            *source = map_or_share(file, *len, *use_memmap)?.0;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Inner::Random { file: Some(file), .. } = &mut self.inner {
            file.sync_all()?;
        }
        Ok(())
    }

    /// Take an exclusive advisory lock, released when the guard drops.
    pub fn lock(&self) -> Result<LockGuard> {
        let Inner::Random { file: Some(file), .. } = &self.inner else {
            return Err(Error::ReadOnly);
        };
        let handle = file.try_clone()?;
        handle.lock()?;
        Ok(LockGuard { file: handle })
    }
}

/// Holds an advisory lock on an open file.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn map_or_share(file: &File, len: u64, use_memmap: bool) -> Result<(RegionSource, bool)> {
    if use_memmap && len > 0 {
        // SAFETY: the mapping is read-only and every write in this crate goes
        // through the file handle at block granularity. Callers that shrink
        // the file remap before reading again. External truncation while
        // mapped is outside what a memory map can guard against.
        let map = unsafe { Mmap::map(file)? };
        return Ok((RegionSource(Arc::new(Backing::Mapped(map))), true));
    }
    if len == 0 {
        return Ok((RegionSource::memory(Vec::new()), false));
    }
    let handle = file.try_clone()?;
    Ok((RegionSource(Arc::new(Backing::File(Mutex::new(handle)))), false))
}

/// Advance a stream to `offset`. `false` when it ends first.
fn skip_to(reader: &mut Box<dyn Read>, position: &mut u64, offset: u64) -> Result<bool> {
    if offset < *position {
        return Err(Error::BackwardRead {
            offset,
            position: *position,
        });
    }
    let gap = offset - *position;
    if gap == 0 {
        return Ok(true);
    }
    let skipped = io::copy(&mut reader.by_ref().take(gap), &mut io::sink())?;
    *position += skipped;
    Ok(skipped == gap)
}

/// Fill `buf` as far as the reader allows.
fn read_full(reader: &mut Box<dyn Read>, buf: &mut [u8]) -> Result<usize> {
    let mut got = 0;
    while got < buf.len() {
        match reader.read(&mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(got)
}
