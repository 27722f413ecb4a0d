//! An ordered list of HDUs bound to a file session.
//!
//! Opening scans the file block by block, parsing each header and recording
//! where its data lives without reading it. Flushing writes only what
//! changed: dirty HDUs are rewritten in place when their block counts are
//! unchanged, otherwise the file is rebuilt in a temporary file next to the
//! original and renamed over it.

use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};
use tempfile::NamedTempFile;

use crate::block::BLOCK_SIZE;
use crate::config::Config;
use crate::data::{data_byte_len, DataRegion};
use crate::error::{Error, Result};
use crate::hdu::{Hdu, HduKind, Location};
use crate::header::{header_len, Header};
use crate::io::{BlockFile, RegionSource};

/// How [`HduList::open`] may use the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    #[default]
    ReadOnly,
    /// Changes can be written back with [`HduList::flush`].
    Update,
}

#[derive(Debug)]
struct Session {
    path: PathBuf,
    file: BlockFile,
    mode: OpenMode,
}

/// A FITS file as a list of header/data units.
///
/// Index 0 is always a primary HDU. Inserting or removing HDUs keeps it so,
/// converting between primary and image extension where needed.
#[derive(Debug, Default)]
pub struct HduList {
    hdus: Vec<Hdu>,
    config: Config,
    session: Option<Session>,
    /// Lowest index moved by an insert or pop since the last flush.
    structural_from: Option<usize>,
}

impl HduList {
    /// An empty list with no file behind it.
    pub fn new() -> HduList {
        HduList::default()
    }

    /// Empty list whose HDUs will be written with `config`.
    pub fn with_config(config: Config) -> HduList {
        HduList {
            config,
            ..HduList::default()
        }
    }

    pub fn open(path: impl AsRef<Path>, mode: OpenMode, config: &Config) -> Result<HduList> {
        let path = path.as_ref();
        let mut file = BlockFile::open(path, mode == OpenMode::Update, config)?;
        let hdus = scan(&mut file, config)?;
        debug!("opened {} with {} HDUs", path.display(), hdus.len());
        Ok(HduList {
            hdus,
            config: config.clone(),
            session: Some(Session {
                path: path.to_path_buf(),
                file,
                mode,
            }),
            structural_from: None,
        })
    }

    /// Read-only list over an in-memory file image.
    pub fn from_bytes(bytes: Vec<u8>, config: &Config) -> Result<HduList> {
        let mut file = BlockFile::from_bytes(bytes);
        Ok(HduList {
            hdus: scan(&mut file, config)?,
            config: config.clone(),
            ..HduList::default()
        })
    }

    /// Read-only list from a sequential source. Data is copied during the scan.
    pub fn from_reader<R: Read + 'static>(reader: R, config: &Config) -> Result<HduList> {
        let mut file = BlockFile::from_reader(reader);
        Ok(HduList {
            hdus: scan(&mut file, config)?,
            config: config.clone(),
            ..HduList::default()
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.hdus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hdus.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Hdu> {
        self.hdus.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Hdu> {
        self.hdus.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Hdu> {
        self.hdus.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Hdu> {
        self.hdus.iter_mut()
    }

    /// Index of the HDU with EXTNAME `name` and, if given, EXTVER `version`.
    ///
    /// `PRIMARY` names index 0 unless some HDU carries that EXTNAME.
    pub fn index_of(&self, name: &str, version: Option<i64>) -> Option<usize> {
        let name = name.trim();
        let same = |a: &str, b: &str| {
            if self.config.extension_name_case_sensitive {
                a == b
            } else {
                a.eq_ignore_ascii_case(b)
            }
        };
        self.hdus
            .iter()
            .position(|hdu| {
                hdu.name().is_some_and(|n| same(n, name))
                    && version.is_none_or(|v| hdu.version() == v)
            })
            .or_else(|| {
                let primary =
                    name.eq_ignore_ascii_case("PRIMARY") && version.is_none_or(|v| v == 1);
                (primary && !self.hdus.is_empty()).then_some(0)
            })
    }

    // ── Structure ──

    /// Append an HDU. A primary appended after index 0 becomes an image
    /// extension; a table appended to an empty list gets a primary first.
    pub fn push(&mut self, hdu: Hdu) -> Result<()> {
        self.insert(self.hdus.len(), hdu)
    }

    pub fn insert(&mut self, index: usize, mut hdu: Hdu) -> Result<()> {
        if index > self.hdus.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.hdus.len(),
            });
        }
        if index > 0 {
            if hdu.kind().is_primary() {
                hdu.convert_to_extension()?;
            }
            self.hdus.insert(index, hdu);
            self.moved_from(index);
            return Ok(());
        }
        let kind = hdu.kind();
        if let Some(old) = self.hdus.first_mut() {
            old.convert_to_extension()?;
        }
        if kind.is_primary() || kind == HduKind::Image {
            if kind == HduKind::Image {
                hdu.convert_to_primary()?;
            }
            self.hdus.insert(0, hdu);
        } else {
            debug!("inserting a placeholder primary before a {kind} HDU");
            self.hdus.insert(0, Hdu::primary()?);
            self.hdus.insert(1, hdu);
        }
        self.moved_from(0);
        Ok(())
    }

    /// Remove and return the HDU at `index`.
    ///
    /// Removing the primary promotes the next HDU if it is an image, and
    /// otherwise puts a placeholder primary in its place.
    pub fn pop(&mut self, index: usize) -> Result<Hdu> {
        if index >= self.hdus.len() {
            return Err(Error::OutOfRange {
                index,
                len: self.hdus.len(),
            });
        }
        if index == 0 && self.hdus.len() > 1 {
            let next = &mut self.hdus[1];
            if next.kind() == HduKind::Image {
                next.convert_to_primary()?;
            } else {
                self.hdus.insert(1, Hdu::primary()?);
            }
        }
        let hdu = self.hdus.remove(index);
        self.moved_from(index);
        Ok(hdu)
    }

    fn moved_from(&mut self, index: usize) {
        self.structural_from = Some(self.structural_from.map_or(index, |s| s.min(index)));
    }

    // ── Writing ──

    /// Whether anything differs from the file.
    pub fn is_dirty(&self) -> bool {
        self.structural_from.is_some() || self.hdus.iter().any(Hdu::is_dirty)
    }

    /// Header and data of every HDU, as they would be written.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.prepare(false)?;
        let mut out = Vec::new();
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            out.extend_from_slice(&hdu.to_bytes().map_err(|e| e.in_hdu(index))?);
        }
        Ok(out)
    }

    /// Write pending changes back to the file opened in update mode.
    pub fn flush(&mut self) -> Result<()> {
        match &self.session {
            Some(s) if s.mode == OpenMode::Update && s.file.is_writable() => {}
            _ => return Err(Error::ReadOnly),
        }
        self.prepare(false)?;
        let first_dirty = self.hdus.iter().position(Hdu::is_dirty);
        let first = match (self.structural_from, first_dirty) {
            (Some(s), Some(d)) => s.min(d),
            (Some(s), None) => s,
            (None, Some(d)) => d,
            (None, None) => {
                debug!("flush: nothing changed");
                return Ok(());
            }
        };
        let same_size = self.hdus.iter().all(|hdu| {
            !hdu.is_dirty()
                || hdu
                    .location()
                    .is_some_and(|loc| loc.byte_len() == hdu.byte_len() as u64)
        });
        if self.structural_from.is_none() && same_size {
            self.write_in_place()?;
        } else {
            self.rewrite_from(first)?;
        }
        self.structural_from = None;
        Ok(())
    }

    /// Write every HDU to a new file at `path`.
    ///
    /// The file is staged next to `path` and renamed into place. An existing
    /// file is replaced only when `overwrite` is set.
    pub fn write_to(&mut self, path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        if !overwrite && path.exists() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            )));
        }
        self.prepare(true)?;
        let mut staged = NamedTempFile::new_in(parent_dir(path))?;
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            staged.write_all(&hdu.to_bytes().map_err(|e| e.in_hdu(index))?)?;
        }
        staged.as_file().sync_all()?;
        staged.persist(path).map_err(|e| Error::Io(e.error))?;
        info!("wrote {} HDUs to {}", self.hdus.len(), path.display());
        Ok(())
    }

    /// Flush if opened for update, then release the file.
    pub fn close(mut self) -> Result<()> {
        if self.session.as_ref().is_some_and(|s| s.mode == OpenMode::Update) {
            self.flush()?;
        }
        Ok(())
    }

    /// Checksum mismatches across all HDUs. Missing keywords are not errors.
    pub fn verify_checksums(&mut self) -> Result<Vec<Error>> {
        let mut problems = Vec::new();
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            let found = hdu.verify_checksum().map_err(|e| e.in_hdu(index))?;
            problems.extend(found.into_iter().map(|e| e.in_hdu(index)));
        }
        Ok(problems)
    }

    /// Recompute the keywords derived from the data of every HDU about to be
    /// written, and their checksums. With `all`, every HDU is stamped.
    fn prepare(&mut self, all: bool) -> Result<()> {
        let moved = self.structural_from;
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            let affected = hdu.is_dirty() || moved.is_some_and(|m| index >= m);
            if affected {
                hdu.sync_header().map_err(|e| e.in_hdu(index))?;
            }
            if (affected || all) && (self.config.checksum || hdu.has_checksum()) {
                hdu.stamp_checksum().map_err(|e| e.in_hdu(index))?;
            }
        }
        Ok(())
    }

    fn write_in_place(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::ReadOnly);
        };
        let _lock = session.file.lock()?;
        let source = session.file.source();
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            let Some(old) = hdu.location().copied() else {
                continue;
            };
            if !hdu.is_dirty() {
                continue;
            }
            let bytes = hdu.to_bytes().map_err(|e| e.in_hdu(index))?;
            debug!("flush: HDU {index} rewritten in place at byte {}", old.header_offset);
            session.file.write_blocks(old.header_offset, &bytes)?;
            let location = locate(old.header_offset, hdu);
            hdu.mark_flushed(location, source.clone());
        }
        session.file.sync()?;
        Ok(())
    }

    /// Rebuild the file from HDU `first` on, keeping the bytes before it.
    fn rewrite_from(&mut self, first: usize) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(Error::ReadOnly);
        };
        let first = first.min(self.hdus.len());
        let prefix = self.hdus[..first]
            .last()
            .and_then(Hdu::location)
            .map_or(0, Location::end);
        info!(
            "rewriting {} from HDU {first} (keeping {prefix} bytes)",
            session.path.display()
        );
        let _lock = session.file.lock()?;
        let mut staged = NamedTempFile::new_in(parent_dir(&session.path))?;
        let prefix_len = usize::try_from(prefix).map_err(|_| Error::OutOfRange {
            index: first,
            len: self.hdus.len(),
        })?;
        if prefix_len > 0 {
            let kept = session.file.read_region(0, prefix_len)?;
            staged.write_all(kept.as_bytes())?;
        }
        let mut offset = prefix;
        let mut locations = Vec::with_capacity(self.hdus.len());
        for (index, hdu) in self.hdus.iter_mut().enumerate() {
            if index < first {
                locations.push(hdu.location().copied().unwrap_or_else(|| locate(0, hdu)));
                continue;
            }
            let bytes = hdu.to_bytes().map_err(|e| e.in_hdu(index))?;
            trace!("staging HDU {index} at byte {offset} ({} bytes)", bytes.len());
            staged.write_all(&bytes)?;
            locations.push(locate(offset, hdu));
            offset += bytes.len() as u64;
        }
        staged.as_file().sync_all()?;
        staged.persist(&session.path).map_err(|e| Error::Io(e.error))?;
        session.file = BlockFile::open(&session.path, true, &self.config)?;
        let source = session.file.source();
        for (hdu, location) in self.hdus.iter_mut().zip(locations) {
            hdu.mark_flushed(location, source.clone());
        }
        debug!("flush: {} now holds {offset} bytes", session.path.display());
        Ok(())
    }
}

impl fmt::Display for HduList {
    /// One line per HDU: index, name, kind, card count and shape.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<4}{:<12}{:<16}{:>6}  Dimensions", "No.", "Name", "Type", "Cards")?;
        for (index, hdu) in self.hdus.iter().enumerate() {
            let name = match (index, hdu.name()) {
                (_, Some(name)) => name,
                (0, None) => "PRIMARY",
                (_, None) => "",
            };
            let dims = dimensions(hdu.header());
            writeln!(
                f,
                "{index:<4}{name:<12}{:<16}{:>6}  {dims}",
                hdu.kind().to_string(),
                hdu.header().len()
            )?;
        }
        Ok(())
    }
}

fn dimensions(header: &Header) -> String {
    let naxis = header.find("NAXIS").and_then(|v| v.as_i64()).unwrap_or(0);
    let axes: Vec<String> = (1..=naxis)
        .rev()
        .map(|n| {
            header
                .find(&format!("NAXIS{n}"))
                .map_or_else(|| String::from("?"), |v| v.to_string())
        })
        .collect();
    format!("({})", axes.join(", "))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Where `hdu` lands when written at `offset`.
fn locate(offset: u64, hdu: &Hdu) -> Location {
    let header_len = hdu.header().byte_len();
    Location {
        header_offset: offset,
        header_len,
        data_offset: offset + header_len as u64,
        data_len: hdu.data().len(),
    }
}

// ── Scanning ──

/// Parse every HDU in `file`, front to back.
fn scan(file: &mut BlockFile, config: &Config) -> Result<Vec<Hdu>> {
    let mut hdus: Vec<Hdu> = Vec::new();
    let mut offset = 0u64;
    loop {
        let index = hdus.len();
        let (header, header_len) = match read_header(file, offset, index, config) {
            Ok(Some(found)) => found,
            Ok(None) => break,
            Err(e @ Error::TruncatedFile { .. }) if index > 0 && !config.strict => {
                warn!("HDU {index}: {e}; ignoring the rest of the file");
                break;
            }
            Err(e) => return Err(e.in_hdu(index)),
        };
        let hdu = read_data(file, header, offset, header_len, config).map_err(|e| e.in_hdu(index))?;
        if index == 0 && !matches!(hdu.kind(), HduKind::Primary | HduKind::RandomGroups) {
            return Err(Error::consistency("SIMPLE", "file does not start with a primary header"));
        }
        debug!(
            "HDU {index}: {} at byte {offset}, {} data bytes",
            hdu.kind(),
            hdu.data().len()
        );
        offset = hdu.location().map_or(offset, Location::end);
        hdus.push(hdu);
    }
    if hdus.is_empty() {
        return Err(Error::TruncatedFile {
            offset: 0,
            wanted: BLOCK_SIZE as u64,
        });
    }
    Ok(hdus)
}

/// The header starting at `offset` and its padded length, or `None` where
/// the extensions end.
fn read_header(
    file: &mut BlockFile,
    offset: u64,
    index: usize,
    config: &Config,
) -> Result<Option<(Header, usize)>> {
    let Some(first) = file.read_block(offset)? else {
        return Ok(None);
    };
    if index > 0 && !first.starts_with(b"XTENSION") {
        debug!("no XTENSION at byte {offset}; ignoring the rest of the file");
        return Ok(None);
    }
    let mut bytes = first.to_vec();
    let len = loop {
        if let Some(len) = header_len(&bytes) {
            break len;
        }
        let next = offset + bytes.len() as u64;
        match file.read_block(next)? {
            Some(block) => bytes.extend_from_slice(&block),
            None => {
                return Err(Error::TruncatedFile {
                    offset: next,
                    wanted: BLOCK_SIZE as u64,
                })
            }
        }
    };
    let header = Header::parse_at(&bytes[..len], offset, config)?;
    Ok(Some((header, len)))
}

fn read_data(
    file: &mut BlockFile,
    header: Header,
    offset: u64,
    header_len: usize,
    config: &Config,
) -> Result<Hdu> {
    let data_offset = offset + header_len as u64;
    let data_len = data_byte_len(&header)?;
    let data = match file.source() {
        Some(source) => lazy_region(file.len(), data_offset, data_len, source)?,
        None => DataRegion::loaded(data_offset, file.read_region(data_offset, data_len)?),
    };
    let location = Location {
        header_offset: offset,
        header_len,
        data_offset,
        data_len,
    };
    Hdu::from_parts(header, data, Some(location), config)
}

fn lazy_region(file_len: u64, offset: u64, len: usize, source: RegionSource) -> Result<DataRegion> {
    let end = offset + len as u64;
    if end > file_len {
        return Err(Error::TruncatedFile {
            offset: file_len,
            wanted: end - file_len,
        });
    }
    Ok(DataRegion::unloaded(offset, len, Some(source)))
}
