//! Header-data units: one header bound to one data region.

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::block::padded_byte_len;
use crate::card::Card;
use crate::checksum;
use crate::column::{ColumnLayout, TableKind};
use crate::config::Config;
use crate::data::{data_byte_len, DataRegion, RegionState};
use crate::error::{Error, Result};
use crate::header::{Anchor, Header, Placement};
use crate::io::RegionSource;

/// What an HDU holds, decided by its first card.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HduKind {
    Primary,
    /// `XTENSION = 'IMAGE'`
    Image,
    /// `XTENSION = 'TABLE'`
    AsciiTable,
    /// `XTENSION = 'BINTABLE'`
    BinTable,
    /// A primary with `GROUPS = T` and `NAXIS1 = 0`, kept as raw data.
    RandomGroups,
    /// Any other extension type, kept as raw data.
    Other(String),
}

impl HduKind {
    pub fn of(header: &Header) -> HduKind {
        let Some(first) = header.cards().first() else {
            return HduKind::Other(String::new());
        };
        match first.keyword() {
            "SIMPLE" => {
                let groups = header.find("GROUPS").and_then(|v| v.as_bool()) == Some(true);
                let no_axis1 = header.find("NAXIS1").and_then(|v| v.as_i64()) == Some(0);
                if groups && no_axis1 {
                    HduKind::RandomGroups
                } else {
                    HduKind::Primary
                }
            }
            "XTENSION" => {
                let name = first
                    .value()
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .trim()
                    .to_ascii_uppercase();
                match name.as_str() {
                    "IMAGE" => HduKind::Image,
                    "TABLE" => HduKind::AsciiTable,
                    "BINTABLE" | "A3DTABLE" => HduKind::BinTable,
                    _ => HduKind::Other(name),
                }
            }
            _ => HduKind::Other(String::new()),
        }
    }

    /// Primary and image extensions.
    pub fn is_image(&self) -> bool {
        matches!(self, HduKind::Primary | HduKind::Image)
    }

    pub fn is_table(&self) -> bool {
        matches!(self, HduKind::AsciiTable | HduKind::BinTable)
    }

    /// Kinds that may only appear first in a file.
    pub fn is_primary(&self) -> bool {
        matches!(self, HduKind::Primary | HduKind::RandomGroups)
    }

    pub(crate) fn table_kind(&self) -> Option<TableKind> {
        match self {
            HduKind::AsciiTable => Some(TableKind::Ascii),
            HduKind::BinTable => Some(TableKind::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for HduKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HduKind::Primary => f.write_str("primary"),
            HduKind::Image => f.write_str("image"),
            HduKind::AsciiTable => f.write_str("ASCII table"),
            HduKind::BinTable => f.write_str("binary table"),
            HduKind::RandomGroups => f.write_str("random groups"),
            HduKind::Other(name) if name.is_empty() => f.write_str("unknown"),
            HduKind::Other(name) => write!(f, "{name} extension"),
        }
    }
}

/// Lifecycle of an HDU within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HduState {
    /// Only the header has been read.
    Unloaded,
    /// Data mapped from the file, read-only.
    Mapped,
    /// Data copied into memory.
    Materialized,
    /// Header or data changed since the last write.
    Modified,
    /// Written by the last flush and unchanged since.
    Flushed,
}

/// Position of an HDU in its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub header_offset: u64,
    /// Padded header size.
    pub header_len: usize,
    pub data_offset: u64,
    /// Unpadded data size.
    pub data_len: usize,
}

impl Location {
    /// Offset just past the padded data.
    pub fn end(&self) -> u64 {
        self.data_offset + padded_byte_len(self.data_len) as u64
    }

    /// Bytes taken on disk, padding included.
    pub fn byte_len(&self) -> u64 {
        self.end() - self.header_offset
    }
}

/// One header bound to its data region.
#[derive(Debug)]
pub struct Hdu {
    header: Header,
    data: DataRegion,
    /// Column layout and the header layout revision it was built from.
    layout: Option<(u64, Arc<ColumnLayout>)>,
    location: Option<Location>,
    flushed: bool,
    warnings: Vec<Error>,
}

impl Hdu {
    /// A primary HDU with no data.
    pub fn primary() -> Result<Hdu> {
        let mut header = Header::new();
        header.append(Card::with_comment("SIMPLE", true, "conforms to FITS standard")?)?;
        header.set("BITPIX", 8i64, Some("array data type"))?;
        header.set("NAXIS", 0i64, Some("number of array dimensions"))?;
        header.set("EXTEND", true, None)?;
        Hdu::new(header, Vec::new())
    }

    /// Bind a header to in-memory data, which must be exactly the size the
    /// header describes.
    pub fn new(header: Header, data: Vec<u8>) -> Result<Hdu> {
        Hdu::from_parts(header, DataRegion::owned(data), None, &Config::default())
    }

    pub(crate) fn from_parts(
        header: Header,
        data: DataRegion,
        location: Option<Location>,
        config: &Config,
    ) -> Result<Hdu> {
        let kind = HduKind::of(&header);
        let problems = validate(&header, &kind)?;
        let expected = data_byte_len(&header)?;
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: vec![expected],
                found: vec![data.len()],
            });
        }
        if config.strict {
            if let Some(first) = problems.into_iter().next() {
                return Err(first);
            }
            return Ok(Hdu::assemble(header, data, location, Vec::new()));
        }
        for problem in &problems {
            warn!("{kind} HDU: {problem}");
        }
        Ok(Hdu::assemble(header, data, location, problems))
    }

    fn assemble(
        header: Header,
        data: DataRegion,
        location: Option<Location>,
        warnings: Vec<Error>,
    ) -> Hdu {
        Hdu {
            header,
            data,
            layout: None,
            location,
            flushed: false,
            warnings,
        }
    }

    pub fn kind(&self) -> HduKind {
        HduKind::of(&self.header)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn data(&self) -> &DataRegion {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut DataRegion {
        &mut self.data
    }

    /// The unpadded data bytes, loading them on first use.
    pub fn data_bytes(&mut self) -> Result<&[u8]> {
        self.data.bytes()
    }

    /// Consistency problems found when the HDU was loaded.
    pub fn warnings(&self) -> &[Error] {
        &self.warnings
    }

    /// Where the HDU was last read from or written to.
    pub fn location(&self) -> Option<&Location> {
        self.location.as_ref()
    }

    /// EXTNAME, if set.
    pub fn name(&self) -> Option<&str> {
        self.header.find("EXTNAME").and_then(|v| v.as_str()).map(str::trim)
    }

    /// EXTVER, defaulting to 1.
    pub fn version(&self) -> i64 {
        self.header.find("EXTVER").and_then(|v| v.as_i64()).unwrap_or(1)
    }

    /// Whether something changed that the file does not reflect yet.
    pub fn is_dirty(&self) -> bool {
        self.header.is_modified() || self.data.is_dirty() || self.location.is_none()
    }

    pub fn state(&self) -> HduState {
        if self.is_dirty() {
            return HduState::Modified;
        }
        if self.flushed {
            return HduState::Flushed;
        }
        match self.data.state() {
            RegionState::Unloaded => HduState::Unloaded,
            RegionState::Mapped => HduState::Mapped,
            RegionState::Materialized => HduState::Materialized,
        }
    }

    /// Size on disk: padded header plus padded data.
    pub fn byte_len(&self) -> usize {
        self.header.byte_len() + padded_byte_len(self.data.len())
    }

    /// Header and padded data, as written to a file.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        let mut out = self.header.to_bytes();
        out.extend_from_slice(&self.data.padded_image()?);
        Ok(out)
    }

    // ── Tables ──

    /// Column layout of a table HDU, rebuilt when a layout keyword changes.
    pub fn column_layout(&mut self) -> Result<Arc<ColumnLayout>> {
        let table = self.kind().table_kind().ok_or_else(|| self.wrong_kind("table"))?;
        let revision = self.header.layout_revision();
        if let Some((cached, layout)) = &self.layout {
            if *cached == revision {
                return Ok(Arc::clone(layout));
            }
        }
        let layout = Arc::new(ColumnLayout::from_header(&self.header, table)?);
        self.layout = Some((revision, Arc::clone(&layout)));
        Ok(layout)
    }

    pub(crate) fn wrong_kind(&self, expected: &'static str) -> Error {
        Error::WrongKind {
            expected,
            found: self.kind().to_string(),
        }
    }

    // ── Checksums ──

    pub fn has_checksum(&self) -> bool {
        self.header.contains("CHECKSUM") || self.header.contains("DATASUM")
    }

    /// Check stored CHECKSUM/DATASUM values. Mismatches are returned, not raised.
    pub fn verify_checksum(&mut self) -> Result<Vec<Error>> {
        let data = self.data.bytes()?;
        Ok(checksum::verify(&self.header, data))
    }

    /// Set DATASUM and CHECKSUM for the current header and data.
    pub fn stamp_checksum(&mut self) -> Result<()> {
        let data = self.data.bytes()?;
        checksum::stamp(&mut self.header, data)
    }

    // ── Flush support ──

    /// Bring size keywords in line with the data before writing.
    pub(crate) fn sync_header(&mut self) -> Result<()> {
        if self.kind() == HduKind::BinTable {
            self.sync_table_keywords()?;
        }
        let expected = data_byte_len(&self.header)?;
        if expected != self.data.len() {
            return Err(Error::consistency(
                "NAXIS",
                format!(
                    "header describes {expected} data bytes, data unit holds {}",
                    self.data.len()
                ),
            ));
        }
        Ok(())
    }

    /// Turn an image extension into a primary HDU.
    pub(crate) fn convert_to_primary(&mut self) -> Result<()> {
        match self.kind() {
            HduKind::Primary => return Ok(()),
            HduKind::Image => {}
            _ => return Err(self.wrong_kind("image")),
        }
        self.header.remove(0)?;
        self.header
            .insert(0, Card::with_comment("SIMPLE", true, "conforms to FITS standard")?)?;
        self.header.delete("PCOUNT");
        self.header.delete("GCOUNT");
        if !self.header.contains("EXTEND") {
            let last = last_axis_keyword(&self.header)?;
            self.header
                .set_at("EXTEND", true, None, Placement::After(Anchor::Keyword(&last)))?;
        }
        Ok(())
    }

    /// Turn a primary HDU into an image extension.
    pub(crate) fn convert_to_extension(&mut self) -> Result<()> {
        match self.kind() {
            HduKind::Image => return Ok(()),
            HduKind::Primary => {}
            _ => return Err(self.wrong_kind("primary")),
        }
        self.header.remove(0)?;
        self.header
            .insert(0, Card::with_comment("XTENSION", "IMAGE", "image extension")?)?;
        self.header.delete("EXTEND");
        let last = last_axis_keyword(&self.header)?;
        self.header.set_at(
            "PCOUNT",
            0i64,
            Some("number of parameters"),
            Placement::After(Anchor::Keyword(&last)),
        )?;
        self.header.set_at(
            "GCOUNT",
            1i64,
            Some("number of groups"),
            Placement::After(Anchor::Keyword("PCOUNT")),
        )?;
        Ok(())
    }

    /// Record the HDU's new place after it was written.
    pub(crate) fn mark_flushed(&mut self, location: Location, source: Option<RegionSource>) {
        self.data.rebase(location.data_offset, source);
        self.header.mark_clean();
        self.location = Some(location);
        self.flushed = true;
    }
}

fn last_axis_keyword(header: &Header) -> Result<String> {
    Ok(match header.get_i64("NAXIS")? {
        0 => String::from("NAXIS"),
        n => format!("NAXIS{n}"),
    })
}

/// `NAXIS<n>` for n >= 1.
fn axis_number(keyword: &str) -> Option<usize> {
    let digits = keyword.strip_prefix("NAXIS")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn numbered(header: &Header, prefix: &str) -> usize {
    header
        .iter()
        .filter(|c| {
            c.keyword()
                .strip_prefix(prefix)
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .count()
}

/// Consistency problems in `header`.
///
/// Missing or invalid BITPIX, NAXIS or NAXISn leave the data size unknown
/// and are returned as `Err`.
fn validate(header: &Header, kind: &HduKind) -> Result<Vec<Error>> {
    let mut problems = Vec::new();
    let naxis = header.get_i64("NAXIS")?;
    data_byte_len(header)?;
    let naxis = naxis as usize;

    let first = if kind.is_primary() { "SIMPLE" } else { "XTENSION" };
    let mut order = vec![first.to_string(), String::from("BITPIX"), String::from("NAXIS")];
    order.extend((1..=naxis).map(|n| format!("NAXIS{n}")));
    if !kind.is_primary() {
        order.push(String::from("PCOUNT"));
        order.push(String::from("GCOUNT"));
    }
    for (i, keyword) in order.iter().enumerate() {
        match header.position(keyword) {
            Some(at) if at == i => {}
            Some(at) => problems.push(Error::consistency(
                keyword,
                format!("found at card {}, expected card {}", at + 1, i + 1),
            )),
            None => problems.push(Error::consistency(keyword, "required keyword missing")),
        }
    }
    let axis_cards = header.iter().filter(|c| axis_number(c.keyword()).is_some()).count();
    if axis_cards != naxis {
        problems.push(Error::consistency(
            "NAXIS",
            format!("{naxis} axes declared, {axis_cards} NAXISn cards present"),
        ));
    }

    let int = |keyword: &str| header.find(keyword).and_then(|v| v.as_i64());
    let mut expect = |keyword: &str, want: i64| match int(keyword) {
        Some(v) if v == want => {}
        Some(v) => problems.push(Error::consistency(keyword, format!("must be {want}, found {v}"))),
        None => {}
    };
    match kind {
        HduKind::Image => {
            expect("PCOUNT", 0);
            expect("GCOUNT", 1);
        }
        HduKind::AsciiTable | HduKind::BinTable => {
            expect("BITPIX", 8);
            expect("NAXIS", 2);
            expect("GCOUNT", 1);
            if *kind == HduKind::AsciiTable {
                expect("PCOUNT", 0);
            }
            validate_table(header, kind, &mut problems);
        }
        HduKind::RandomGroups => {
            for keyword in ["PCOUNT", "GCOUNT"] {
                if !header.contains(keyword) {
                    problems.push(Error::consistency(keyword, "required keyword missing"));
                }
            }
        }
        HduKind::Primary | HduKind::Other(_) => {}
    }
    Ok(problems)
}

fn validate_table(header: &Header, kind: &HduKind, problems: &mut Vec<Error>) {
    let Some(tfields) = header.find("TFIELDS").and_then(|v| v.as_i64()) else {
        problems.push(Error::consistency("TFIELDS", "required keyword missing"));
        return;
    };
    let tfields = tfields.max(0) as usize;
    let tforms = numbered(header, "TFORM");
    if tforms != tfields {
        problems.push(Error::consistency(
            "TFIELDS",
            format!("{tfields} fields declared, {tforms} TFORMn cards present"),
        ));
    }
    let ttypes = numbered(header, "TTYPE");
    if ttypes > 0 && ttypes != tfields {
        problems.push(Error::consistency(
            "TFIELDS",
            format!("{tfields} fields declared, {ttypes} TTYPEn cards present"),
        ));
    }
    if let Some(table) = kind.table_kind() {
        if let Err(e) = ColumnLayout::from_header(header, table) {
            problems.push(e);
        }
    }
}
