//! Data regions and the header keywords that size and type them.

use std::fmt;

use log::trace;

use crate::block::{pad_to_block, DATA_PAD_BYTE};
use crate::error::{Error, Result};
use crate::header::Header;
use crate::io::{Region, RegionSource, SharedView};

// ── Element types ──

/// Storage type of image pixels, selected by BITPIX.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ElementType {
    pub fn from_bitpix(bitpix: i64) -> Result<ElementType> {
        Ok(match bitpix {
            8 => ElementType::U8,
            16 => ElementType::I16,
            32 => ElementType::I32,
            64 => ElementType::I64,
            -32 => ElementType::F32,
            -64 => ElementType::F64,
            other => return Err(Error::InvalidBitpix(other)),
        })
    }

    pub fn bitpix(self) -> i64 {
        match self {
            ElementType::U8 => 8,
            ElementType::I16 => 16,
            ElementType::I32 => 32,
            ElementType::I64 => 64,
            ElementType::F32 => -32,
            ElementType::F64 => -64,
        }
    }

    /// Bytes per element.
    pub fn size(self) -> usize {
        (self.bitpix().unsigned_abs() / 8) as usize
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F64)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::U8 => "u8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

// ── Shape ──

/// `NAXIS1..NAXISn` in header order.
pub(crate) fn axes(header: &Header) -> Result<Vec<usize>> {
    let naxis = header.get_i64("NAXIS")?;
    if !(0..=999).contains(&naxis) {
        return Err(Error::consistency("NAXIS", format!("{naxis} is out of range")));
    }
    (1..=naxis)
        .map(|n| {
            let keyword = format!("NAXIS{n}");
            let len = header.get_i64(&keyword)?;
            usize::try_from(len)
                .map_err(|_| Error::consistency(keyword, format!("negative length {len}")))
        })
        .collect()
}

/// Array shape in row-major order (`[NAXISn, ..., NAXIS1]`) and element type.
///
/// The last index varies fastest, matching the on-disk order.
pub fn shape_and_dtype(header: &Header) -> Result<(Vec<usize>, ElementType)> {
    let dtype = ElementType::from_bitpix(header.get_i64("BITPIX")?)?;
    let mut shape = axes(header)?;
    shape.reverse();
    Ok((shape, dtype))
}

/// Byte length of the data unit described by `header`, before padding.
///
/// `|BITPIX|/8 * GCOUNT * (PCOUNT + NAXIS1 * ... * NAXISn)`, where a random
/// groups primary skips the zero NAXIS1.
pub fn data_byte_len(header: &Header) -> Result<usize> {
    let bitpix = header.get_i64("BITPIX")?;
    let bytes = match bitpix {
        8 | 16 | 32 | 64 | -32 | -64 => (bitpix.unsigned_abs() / 8) as usize,
        other => return Err(Error::InvalidBitpix(other)),
    };
    let dims = axes(header)?;
    if dims.is_empty() {
        return Ok(0);
    }
    let groups = dims[0] == 0 && header.find("GROUPS").and_then(|v| v.as_bool()) == Some(true);
    let dims = if groups { &dims[1..] } else { &dims[..] };
    let count = non_negative(header, "PCOUNT", 0)?;
    let gcount = non_negative(header, "GCOUNT", 1)?;
    let overflow = || Error::consistency("NAXIS", "data size overflows");
    let elements = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(overflow)?;
    let per_group = elements.checked_add(count).ok_or_else(overflow)?;
    bytes
        .checked_mul(gcount)
        .and_then(|n| n.checked_mul(per_group))
        .ok_or_else(overflow)
}

fn non_negative(header: &Header, keyword: &str, default: usize) -> Result<usize> {
    match header.find(keyword).and_then(|v| v.as_i64()) {
        None => Ok(default),
        Some(n) => usize::try_from(n)
            .map_err(|_| Error::consistency(keyword, format!("negative value {n}"))),
    }
}

// ── Scaling ──

/// Linear scaling `physical = bzero + bscale * raw`, with an optional
/// integer null value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scaling {
    pub bscale: f64,
    pub bzero: f64,
    pub blank: Option<i64>,
}

impl Default for Scaling {
    fn default() -> Self {
        Scaling {
            bscale: 1.0,
            bzero: 0.0,
            blank: None,
        }
    }
}

impl Scaling {
    /// Image scaling from BSCALE, BZERO and BLANK.
    pub fn from_header(header: &Header) -> Self {
        Scaling::from_keywords(header, "BSCALE", "BZERO", "BLANK")
    }

    pub(crate) fn from_keywords(header: &Header, scale: &str, zero: &str, null: &str) -> Self {
        Scaling {
            bscale: header.find(scale).and_then(|v| v.as_f64()).unwrap_or(1.0),
            bzero: header.find(zero).and_then(|v| v.as_f64()).unwrap_or(0.0),
            blank: header.find(null).and_then(|v| v.as_i64()),
        }
    }

    /// `true` when values pass through unchanged.
    pub fn is_identity(&self) -> bool {
        self.bscale == 1.0 && self.bzero == 0.0
    }

    #[inline]
    pub fn to_physical(&self, raw: f64) -> f64 {
        self.bzero + self.bscale * raw
    }

    #[inline]
    pub fn to_raw(&self, physical: f64) -> f64 {
        (physical - self.bzero) / self.bscale
    }
}

// ── Regions ──

/// Where a region's bytes currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionState {
    Unloaded,
    Mapped,
    Materialized,
}

#[derive(Debug)]
enum Storage {
    Unloaded(Option<RegionSource>),
    Mapped(SharedView),
    Owned(Vec<u8>),
}

/// The bytes of one data unit, without block padding.
#[derive(Debug)]
pub struct DataRegion {
    offset: u64,
    len: usize,
    storage: Storage,
    dirty: bool,
}

impl DataRegion {
    /// A region known only by position, loaded from `source` on first use.
    pub(crate) fn unloaded(offset: u64, len: usize, source: Option<RegionSource>) -> Self {
        DataRegion {
            offset,
            len,
            storage: Storage::Unloaded(source),
            dirty: false,
        }
    }

    /// A region already read, e.g. from a stream.
    pub(crate) fn loaded(offset: u64, region: Region) -> Self {
        let (len, storage) = match region {
            Region::View(view) => (view.len(), Storage::Mapped(view)),
            Region::Owned(bytes) => (bytes.len(), Storage::Owned(bytes)),
        };
        DataRegion {
            offset,
            len,
            storage,
            dirty: false,
        }
    }

    /// New in-memory data, not yet written anywhere.
    pub(crate) fn owned(bytes: Vec<u8>) -> Self {
        DataRegion {
            offset: 0,
            len: bytes.len(),
            storage: Storage::Owned(bytes),
            dirty: true,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn state(&self) -> RegionState {
        match self.storage {
            Storage::Unloaded(_) => RegionState::Unloaded,
            Storage::Mapped(_) => RegionState::Mapped,
            Storage::Owned(_) => RegionState::Materialized,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Map or copy the bytes in if they are not resident yet.
    pub fn load(&mut self) -> Result<()> {
        let Storage::Unloaded(source) = &self.storage else {
            return Ok(());
        };
        let storage = match source {
            _ if self.len == 0 => Storage::Owned(Vec::new()),
            Some(source) => match source.load(self.offset, self.len)? {
                Region::View(view) => Storage::Mapped(view),
                Region::Owned(bytes) => Storage::Owned(bytes),
            },
            None => {
                return Err(Error::TruncatedFile {
                    offset: self.offset,
                    wanted: self.len as u64,
                })
            }
        };
        trace!("loaded {} data bytes at byte {}", self.len, self.offset);
        self.storage = storage;
        Ok(())
    }

    /// The region's bytes, loading them first if needed.
    pub fn bytes(&mut self) -> Result<&[u8]> {
        self.load()?;
        Ok(self.resident().unwrap_or(&[]))
    }

    /// The bytes if already loaded.
    pub fn resident(&self) -> Option<&[u8]> {
        match &self.storage {
            Storage::Unloaded(_) => None,
            Storage::Mapped(view) => Some(view.as_bytes()),
            Storage::Owned(bytes) => Some(bytes),
        }
    }

    /// Writable bytes. A mapped region is copied first.
    pub fn make_mut(&mut self) -> Result<&mut Vec<u8>> {
        self.load()?;
        if !matches!(self.storage, Storage::Owned(_)) {
            let copy = self.resident().map(<[u8]>::to_vec).unwrap_or_default();
            self.storage = Storage::Owned(copy);
        }
        self.dirty = true;
        match &mut self.storage {
            Storage::Owned(bytes) => Ok(bytes),
            Storage::Unloaded(_) | Storage::Mapped(_) => Err(Error::ReadOnly),
        }
    }

    /// Replace the contents, possibly changing the length.
    pub fn replace(&mut self, bytes: Vec<u8>) {
        self.len = bytes.len();
        self.storage = Storage::Owned(bytes);
        self.dirty = true;
    }

    /// Record a length change made through [`DataRegion::make_mut`].
    pub(crate) fn sync_len(&mut self) {
        if let Storage::Owned(bytes) = &self.storage {
            self.len = bytes.len();
        }
    }

    /// The bytes zero-padded to whole blocks, as written to disk.
    pub fn padded_image(&mut self) -> Result<Vec<u8>> {
        let mut out = self.bytes()?.to_vec();
        pad_to_block(&mut out, DATA_PAD_BYTE);
        Ok(out)
    }

    /// Point the region at its new location after a flush.
    ///
    /// Regions not held in memory are reloaded lazily from `source`.
    pub(crate) fn rebase(&mut self, offset: u64, source: Option<RegionSource>) {
        self.offset = offset;
        if !matches!(self.storage, Storage::Owned(_)) {
            self.storage = Storage::Unloaded(source);
        }
        self.dirty = false;
    }
}
