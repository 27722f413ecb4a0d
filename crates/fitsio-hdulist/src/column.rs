//! Table column descriptors and the row layout they imply.
//!
//! A [`ColumnLayout`] is derived from the TFIELDS/TFORMn/TBCOLn family of
//! keywords and gives every column a byte offset and width inside a row.
//! Binary tables may also carry a heap holding variable-length arrays.

use std::fmt;

use crate::data::Scaling;
use crate::error::{Error, Result};
use crate::header::Header;

// ── Binary formats ──

/// Element type of a binary table column (the TFORM type code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryType {
    /// `L` -- logical, one byte `T`/`F`.
    Logical,
    /// `X` -- bit array.
    Bit,
    /// `B` -- unsigned byte.
    Byte,
    /// `I` -- 16-bit integer.
    Short,
    /// `J` -- 32-bit integer.
    Int,
    /// `K` -- 64-bit integer.
    Long,
    /// `E` -- 32-bit float.
    Float,
    /// `D` -- 64-bit float.
    Double,
    /// `C` -- pair of 32-bit floats.
    ComplexFloat,
    /// `M` -- pair of 64-bit floats.
    ComplexDouble,
    /// `A` -- character.
    Ascii,
}

impl BinaryType {
    fn from_code(code: u8) -> Option<BinaryType> {
        Some(match code {
            b'L' => BinaryType::Logical,
            b'X' => BinaryType::Bit,
            b'B' => BinaryType::Byte,
            b'I' => BinaryType::Short,
            b'J' => BinaryType::Int,
            b'K' => BinaryType::Long,
            b'E' => BinaryType::Float,
            b'D' => BinaryType::Double,
            b'C' => BinaryType::ComplexFloat,
            b'M' => BinaryType::ComplexDouble,
            b'A' => BinaryType::Ascii,
            _ => return None,
        })
    }

    pub fn code(self) -> char {
        match self {
            BinaryType::Logical => 'L',
            BinaryType::Bit => 'X',
            BinaryType::Byte => 'B',
            BinaryType::Short => 'I',
            BinaryType::Int => 'J',
            BinaryType::Long => 'K',
            BinaryType::Float => 'E',
            BinaryType::Double => 'D',
            BinaryType::ComplexFloat => 'C',
            BinaryType::ComplexDouble => 'M',
            BinaryType::Ascii => 'A',
        }
    }

    /// Size in bytes of one element. Bits report 1 and are packed separately.
    pub fn size(self) -> usize {
        match self {
            BinaryType::Logical | BinaryType::Bit | BinaryType::Byte | BinaryType::Ascii => 1,
            BinaryType::Short => 2,
            BinaryType::Int | BinaryType::Float => 4,
            BinaryType::Long | BinaryType::Double | BinaryType::ComplexFloat => 8,
            BinaryType::ComplexDouble => 16,
        }
    }

    /// Bytes taken by `count` elements, or `None` if that overflows.
    pub fn bytes_for(self, count: usize) -> Option<usize> {
        match self {
            BinaryType::Bit => Some(count.div_ceil(8)),
            other => count.checked_mul(other.size()),
        }
    }

    /// Whether TSCAL/TZERO apply to this type.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            BinaryType::Byte
                | BinaryType::Short
                | BinaryType::Int
                | BinaryType::Long
                | BinaryType::Float
                | BinaryType::Double
        )
    }
}

/// Size of a variable-length array descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Descriptor {
    /// `P` -- two 32-bit integers.
    P,
    /// `Q` -- two 64-bit integers.
    Q,
}

impl Descriptor {
    pub fn size(self) -> usize {
        match self {
            Descriptor::P => 8,
            Descriptor::Q => 16,
        }
    }
}

/// A parsed binary table TFORMn value such as `10A`, `3E` or `1PD(5)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TForm {
    Fixed {
        repeat: usize,
        ty: BinaryType,
    },
    /// A heap-backed array; the row holds a (count, offset) descriptor.
    Var {
        descriptor: Descriptor,
        ty: BinaryType,
        max_len: Option<usize>,
    },
}

impl TForm {
    pub fn parse(s: &str) -> Result<TForm> {
        let bad = |reason: &str| Error::invalid_value("TFORM", format!("{reason} in {s:?}"));
        let s = s.trim();
        let digits = s.bytes().take_while(u8::is_ascii_digit).count();
        let repeat = match &s[..digits] {
            "" => None,
            n => Some(n.parse::<usize>().map_err(|_| bad("bad repeat count"))?),
        };
        let rest = s[digits..].as_bytes();
        let Some(&code) = rest.first() else {
            return Err(bad("missing type code"));
        };
        let descriptor = match code {
            b'P' => Some(Descriptor::P),
            b'Q' => Some(Descriptor::Q),
            _ => None,
        };
        let Some(descriptor) = descriptor else {
            let ty = BinaryType::from_code(code).ok_or_else(|| bad("unknown type code"))?;
            let repeat = repeat.unwrap_or(1);
            if ty.bytes_for(repeat).is_none() {
                return Err(bad("repeat count too large"));
            }
            // Anything after the code (e.g. the `w` of `rAw`) is advisory.
            return Ok(TForm::Fixed { repeat, ty });
        };
        if repeat.is_some_and(|r| r > 1) {
            return Err(bad("variable-length repeat must be 0 or 1"));
        }
        let ty = rest
            .get(1)
            .copied()
            .and_then(BinaryType::from_code)
            .ok_or_else(|| bad("unknown array element type"))?;
        let tail = std::str::from_utf8(&rest[2..]).map_err(|_| bad("non-ASCII text"))?.trim();
        let max_len = match tail {
            "" => None,
            t => {
                let inner = t
                    .strip_prefix('(')
                    .and_then(|t| t.strip_suffix(')'))
                    .ok_or_else(|| bad("malformed maximum length"))?;
                Some(inner.trim().parse::<usize>().map_err(|_| bad("malformed maximum length"))?)
            }
        };
        Ok(TForm::Var {
            descriptor,
            ty,
            max_len,
        })
    }

    pub fn element_type(&self) -> BinaryType {
        match *self {
            TForm::Fixed { ty, .. } | TForm::Var { ty, .. } => ty,
        }
    }

    /// Elements per cell; one descriptor for variable-length columns.
    pub fn repeat(&self) -> usize {
        match *self {
            TForm::Fixed { repeat, .. } => repeat,
            TForm::Var { .. } => 1,
        }
    }

    /// Bytes this column takes in each row, saturating at `usize::MAX`.
    pub fn width(&self) -> usize {
        match *self {
            TForm::Fixed { repeat, ty } => ty.bytes_for(repeat).unwrap_or(usize::MAX),
            TForm::Var { descriptor, .. } => descriptor.size(),
        }
    }

    pub fn is_variable(&self) -> bool {
        matches!(self, TForm::Var { .. })
    }
}

impl fmt::Display for TForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TForm::Fixed { repeat, ty } => write!(f, "{repeat}{}", ty.code()),
            TForm::Var {
                descriptor,
                ty,
                max_len,
            } => {
                let d = match descriptor {
                    Descriptor::P => 'P',
                    Descriptor::Q => 'Q',
                };
                write!(f, "1{d}{}", ty.code())?;
                if let Some(max) = max_len {
                    write!(f, "({max})")?;
                }
                Ok(())
            }
        }
    }
}

// ── ASCII formats ──

/// The format code of an ASCII table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiFormat {
    /// `Aw`
    Character(usize),
    /// `Iw`
    Integer(usize),
    /// `Fw.d`
    Fixed(usize, usize),
    /// `Ew.d`
    Exponential(usize, usize),
    /// `Dw.d`
    Double(usize, usize),
}

impl AsciiFormat {
    pub fn parse(s: &str) -> Result<AsciiFormat> {
        let bad = || Error::invalid_value("TFORM", format!("bad ASCII table format {s:?}"));
        let s = s.trim();
        let (code, rest) = s.split_at_checked(1).ok_or_else(bad)?;
        let int = |t: &str| t.trim().parse::<usize>().map_err(|_| bad());
        let pair = |t: &str| -> Result<(usize, usize)> {
            let (w, d) = t.split_once('.').ok_or_else(bad)?;
            Ok((int(w)?, int(d)?))
        };
        Ok(match code {
            "A" => AsciiFormat::Character(int(rest)?),
            "I" => AsciiFormat::Integer(int(rest)?),
            "F" => {
                let (w, d) = pair(rest)?;
                AsciiFormat::Fixed(w, d)
            }
            "E" => {
                let (w, d) = pair(rest)?;
                AsciiFormat::Exponential(w, d)
            }
            "D" => {
                let (w, d) = pair(rest)?;
                AsciiFormat::Double(w, d)
            }
            _ => return Err(bad()),
        })
    }

    pub fn width(&self) -> usize {
        match *self {
            AsciiFormat::Character(w)
            | AsciiFormat::Integer(w)
            | AsciiFormat::Fixed(w, _)
            | AsciiFormat::Exponential(w, _)
            | AsciiFormat::Double(w, _) => w,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, AsciiFormat::Character(_))
    }
}

impl fmt::Display for AsciiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            AsciiFormat::Character(w) => write!(f, "A{w}"),
            AsciiFormat::Integer(w) => write!(f, "I{w}"),
            AsciiFormat::Fixed(w, d) => write!(f, "F{w}.{d}"),
            AsciiFormat::Exponential(w, d) => write!(f, "E{w}.{d}"),
            AsciiFormat::Double(w, d) => write!(f, "D{w}.{d}"),
        }
    }
}

/// Format of one column in either kind of table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnFormat {
    Binary(TForm),
    Ascii(AsciiFormat),
}

impl fmt::Display for ColumnFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnFormat::Binary(t) => t.fmt(f),
            ColumnFormat::Ascii(a) => a.fmt(f),
        }
    }
}

// ── Columns ──

/// One column's descriptor, with its place in the row.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// TTYPEn, if present.
    pub name: Option<String>,
    pub unit: Option<String>,
    pub format: ColumnFormat,
    /// Byte offset inside the row (from TBCOLn for ASCII tables).
    pub offset: usize,
    pub width: usize,
    pub repeat: usize,
    /// TSCALn, TZEROn and, for binary tables, the integer TNULLn.
    pub scale: Scaling,
    /// ASCII table TNULLn text.
    pub null_text: Option<String>,
    /// TDIMn in row-major order.
    pub dims: Option<Vec<usize>>,
}

impl Column {
    pub fn tform(&self) -> Option<&TForm> {
        match &self.format {
            ColumnFormat::Binary(t) => Some(t),
            ColumnFormat::Ascii(_) => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.tform().is_some_and(TForm::is_variable)
    }

    /// Whether reads produce [`ColumnData::Physical`] values.
    pub fn is_scaled(&self) -> bool {
        let numeric = match &self.format {
            ColumnFormat::Binary(t) => t.element_type().is_numeric(),
            ColumnFormat::Ascii(a) => a.is_numeric(),
        };
        numeric && !self.scale.is_identity()
    }

    fn matches(&self, name: &str) -> bool {
        self.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Which row encoding a table uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Binary,
    Ascii,
}

/// The row structure of a table HDU.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnLayout {
    kind: TableKind,
    columns: Vec<Column>,
    row_len: usize,
    rows: usize,
    heap_start: usize,
    heap_len: usize,
}

impl ColumnLayout {
    /// Derive the layout from a table header.
    ///
    /// Binary column widths must add up to NAXIS1, and ASCII fields must fit
    /// inside it.
    pub fn from_header(header: &Header, kind: TableKind) -> Result<ColumnLayout> {
        let row_len = count(header, "NAXIS1")?;
        let rows = count(header, "NAXIS2")?;
        let tfields = count(header, "TFIELDS")?;
        if tfields > 999 {
            return Err(Error::consistency("TFIELDS", format!("{tfields} is out of range")));
        }
        let mut columns = Vec::with_capacity(tfields);
        let mut offset = 0usize;
        for n in 1..=tfields {
            let tform = header.get_str(&format!("TFORM{n}"))?;
            let (format, col_offset, width, repeat) = match kind {
                TableKind::Binary => {
                    let t = TForm::parse(tform)?;
                    let at = offset;
                    offset = offset.checked_add(t.width()).ok_or_else(|| {
                        Error::consistency(format!("TFORM{n}"), "column widths overflow a row")
                    })?;
                    (ColumnFormat::Binary(t), at, t.width(), t.repeat())
                }
                TableKind::Ascii => {
                    let a = AsciiFormat::parse(tform)?;
                    let tbcol = header.get_i64(&format!("TBCOL{n}"))?;
                    let at = tbcol
                        .checked_sub(1)
                        .and_then(|at| usize::try_from(at).ok())
                        .ok_or_else(|| {
                            Error::consistency(format!("TBCOL{n}"), "columns start at 1")
                        })?;
                    if at.checked_add(a.width()).is_none_or(|end| end > row_len) {
                        return Err(Error::consistency(
                            format!("TBCOL{n}"),
                            format!("field ends past NAXIS1 = {row_len}"),
                        ));
                    }
                    (ColumnFormat::Ascii(a), at, a.width(), 1)
                }
            };
            let mut scale = Scaling::from_keywords(
                header,
                &format!("TSCAL{n}"),
                &format!("TZERO{n}"),
                &format!("TNULL{n}"),
            );
            let null_text = match kind {
                TableKind::Ascii => {
                    scale.blank = None;
                    header.find(&format!("TNULL{n}")).map(|v| v.to_string())
                }
                TableKind::Binary => None,
            };
            // A variable-length cell is bounded by its `(max)`, when given.
            let capacity = match &format {
                ColumnFormat::Binary(TForm::Var { max_len, .. }) => *max_len,
                _ => Some(repeat),
            };
            let dims = match header.find(&format!("TDIM{n}")).and_then(|v| v.as_str()) {
                Some(tdim) => Some(parse_tdim(tdim, n, capacity)?),
                None => None,
            };
            columns.push(Column {
                name: text(header, &format!("TTYPE{n}")),
                unit: text(header, &format!("TUNIT{n}")),
                format,
                offset: col_offset,
                width,
                repeat,
                scale,
                null_text,
                dims,
            });
        }
        if kind == TableKind::Binary && offset != row_len {
            return Err(Error::consistency(
                "NAXIS1",
                format!("{row_len} does not match the column widths, which sum to {offset}"),
            ));
        }

        let main_len = row_len
            .checked_mul(rows)
            .ok_or_else(|| Error::consistency("NAXIS2", "table size overflows"))?;
        let pcount = header.find("PCOUNT").and_then(|v| v.as_i64()).unwrap_or(0);
        let pcount = usize::try_from(pcount)
            .map_err(|_| Error::consistency("PCOUNT", "negative value"))?;
        let data_len = main_len
            .checked_add(pcount)
            .ok_or_else(|| Error::consistency("PCOUNT", "table size overflows"))?;
        let heap_start = match header.find("THEAP").and_then(|v| v.as_i64()) {
            Some(theap) => usize::try_from(theap)
                .map_err(|_| Error::consistency("THEAP", "negative value"))?,
            None => main_len,
        };
        if heap_start < main_len || heap_start > data_len {
            return Err(Error::consistency(
                "THEAP",
                format!("heap offset {heap_start} lies outside the data after the rows"),
            ));
        }
        Ok(ColumnLayout {
            kind,
            columns,
            row_len,
            rows,
            heap_start,
            heap_len: data_len - heap_start,
        })
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&Column> {
        self.columns.get(index)
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column index by TTYPE, ignoring case.
    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.as_deref() == Some(name))
            .or_else(|| self.columns.iter().position(|c| c.matches(name)))
            .ok_or_else(|| Error::NoSuchColumn(name.to_string()))
    }

    /// NAXIS1.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    /// NAXIS2.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Bytes taken by the rows.
    pub fn main_len(&self) -> usize {
        self.row_len * self.rows
    }

    /// Heap offset from the start of the data (THEAP).
    pub fn heap_start(&self) -> usize {
        self.heap_start
    }

    pub fn heap_len(&self) -> usize {
        self.heap_len
    }

    pub fn has_variable_columns(&self) -> bool {
        self.columns.iter().any(Column::is_variable)
    }
}

fn count(header: &Header, keyword: &str) -> Result<usize> {
    let n = header.get_i64(keyword)?;
    usize::try_from(n).map_err(|_| Error::consistency(keyword, format!("negative value {n}")))
}

fn text(header: &Header, keyword: &str) -> Option<String> {
    header
        .find(keyword)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// `'(a,b,c)'` to row-major `[c, b, a]`, holding at most `capacity`
/// elements when that is known.
fn parse_tdim(tdim: &str, n: usize, capacity: Option<usize>) -> Result<Vec<usize>> {
    let keyword = format!("TDIM{n}");
    let inner = tdim
        .trim()
        .strip_prefix('(')
        .and_then(|t| t.strip_suffix(')'))
        .ok_or_else(|| Error::invalid_value(&keyword, format!("malformed {tdim:?}")))?;
    let mut dims = inner
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| Error::invalid_value(&keyword, format!("malformed {tdim:?}")))?;
    let elements = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::consistency(&keyword, format!("{tdim:?} holds too many elements")))?;
    if let Some(capacity) = capacity.filter(|&c| elements > c) {
        return Err(Error::consistency(
            keyword,
            format!("{elements} elements exceed the {capacity} a cell holds"),
        ));
    }
    dims.reverse();
    Ok(dims)
}

// ── Definitions ──

/// A column to create in a new table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDef {
    pub name: String,
    /// TFORM text, e.g. `1J`, `10A` or `1PD`; `I6` or `F10.3` for ASCII tables.
    pub format: String,
    pub unit: Option<String>,
    /// Row-major cell shape, written as TDIMn.
    pub dims: Option<Vec<usize>>,
    /// (TSCALn, TZEROn).
    pub scaling: Option<(f64, f64)>,
    pub null: Option<i64>,
}

impl ColumnDef {
    pub fn new(name: &str, format: &str) -> ColumnDef {
        ColumnDef {
            name: name.to_string(),
            format: format.to_string(),
            unit: None,
            dims: None,
            scaling: None,
            null: None,
        }
    }

    pub fn unit(mut self, unit: &str) -> ColumnDef {
        self.unit = Some(unit.to_string());
        self
    }

    pub fn dims(mut self, dims: &[usize]) -> ColumnDef {
        self.dims = Some(dims.to_vec());
        self
    }

    pub fn scaled(mut self, tscal: f64, tzero: f64) -> ColumnDef {
        self.scaling = Some((tscal, tzero));
        self
    }

    pub fn null(mut self, null: i64) -> ColumnDef {
        self.null = Some(null);
        self
    }

    /// Write the optional per-column keywords. ASCII tables keep TNULLn
    /// as text.
    pub(crate) fn describe(&self, header: &mut Header, n: usize, kind: TableKind) -> Result<()> {
        if let Some(unit) = &self.unit {
            header.set(&format!("TUNIT{n}"), unit.as_str(), None)?;
        }
        if let Some(dims) = &self.dims {
            let tdim: Vec<String> = dims.iter().rev().map(usize::to_string).collect();
            header.set(&format!("TDIM{n}"), format!("({})", tdim.join(",")), None)?;
        }
        if let Some((tscal, tzero)) = self.scaling {
            header.set(&format!("TSCAL{n}"), tscal, None)?;
            header.set(&format!("TZERO{n}"), tzero, None)?;
        }
        match (self.null, kind) {
            (Some(null), TableKind::Binary) => header.set(&format!("TNULL{n}"), null, None)?,
            (Some(null), TableKind::Ascii) => {
                header.set(&format!("TNULL{n}"), null.to_string(), None)?
            }
            (None, _) => {}
        }
        Ok(())
    }
}

// ── Column data ──

/// Values of one column over some rows, or of one cell.
///
/// Fixed-width values are flattened row after row. Character, bit and
/// variable-length columns hold one entry per row.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Logical(Vec<bool>),
    /// Packed bits, one byte vector per row.
    Bit(Vec<Vec<u8>>),
    Byte(Vec<u8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
    ComplexFloat(Vec<(f32, f32)>),
    ComplexDouble(Vec<(f64, f64)>),
    Ascii(Vec<String>),
    /// Variable-length arrays, one per row.
    VarArray(Vec<ColumnData>),
    /// Values after TSCAL/TZERO, with nulls as NaN.
    Physical(Vec<f64>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Logical(v) => v.len(),
            ColumnData::Bit(v) => v.len(),
            ColumnData::Byte(v) => v.len(),
            ColumnData::Short(v) => v.len(),
            ColumnData::Int(v) => v.len(),
            ColumnData::Long(v) => v.len(),
            ColumnData::Float(v) => v.len(),
            ColumnData::Double(v) => v.len(),
            ColumnData::ComplexFloat(v) => v.len(),
            ColumnData::ComplexDouble(v) => v.len(),
            ColumnData::Ascii(v) => v.len(),
            ColumnData::VarArray(v) => v.len(),
            ColumnData::Physical(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ColumnData::Logical(_) => "logical",
            ColumnData::Bit(_) => "bit",
            ColumnData::Byte(_) => "byte",
            ColumnData::Short(_) => "short",
            ColumnData::Int(_) => "int",
            ColumnData::Long(_) => "long",
            ColumnData::Float(_) => "float",
            ColumnData::Double(_) => "double",
            ColumnData::ComplexFloat(_) => "complex float",
            ColumnData::ComplexDouble(_) => "complex double",
            ColumnData::Ascii(_) => "ascii",
            ColumnData::VarArray(_) => "variable-length array",
            ColumnData::Physical(_) => "physical",
        }
    }

    /// Numeric values widened to f64, with `null` mapped to NaN.
    pub fn to_f64(&self, null: Option<i64>) -> Option<Vec<f64>> {
        fn ints<T: Copy + Into<i64>>(v: &[T], null: Option<i64>) -> Vec<f64> {
            v.iter()
                .map(|&x| {
                    let x: i64 = x.into();
                    if Some(x) == null { f64::NAN } else { x as f64 }
                })
                .collect()
        }
        Some(match self {
            ColumnData::Byte(v) => ints(v, null),
            ColumnData::Short(v) => ints(v, null),
            ColumnData::Int(v) => ints(v, null),
            ColumnData::Long(v) => ints(v, null),
            ColumnData::Float(v) => v.iter().map(|&x| f64::from(x)).collect(),
            ColumnData::Double(v) | ColumnData::Physical(v) => v.clone(),
            _ => return None,
        })
    }

    pub(crate) fn scaled(self, scale: &Scaling) -> ColumnData {
        match self {
            ColumnData::VarArray(cells) => {
                ColumnData::VarArray(cells.into_iter().map(|c| c.scaled(scale)).collect())
            }
            other => match other.to_f64(scale.blank) {
                Some(values) => {
                    ColumnData::Physical(values.into_iter().map(|v| scale.to_physical(v)).collect())
                }
                None => other,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- TFORM ----

    #[test]
    fn parse_fixed_forms() {
        assert_eq!(
            TForm::parse("1J").unwrap(),
            TForm::Fixed {
                repeat: 1,
                ty: BinaryType::Int
            }
        );
        assert_eq!(TForm::parse("E").unwrap().repeat(), 1);
        let t = TForm::parse("10A").unwrap();
        assert_eq!((t.repeat(), t.width()), (10, 10));
        assert_eq!(TForm::parse("20A8").unwrap().width(), 20);
        assert_eq!(TForm::parse("3M").unwrap().width(), 48);
        assert_eq!(TForm::parse("13X").unwrap().width(), 2);
        assert_eq!(TForm::parse("0J").unwrap().width(), 0);
    }

    #[test]
    fn parse_variable_forms() {
        let t = TForm::parse("1PD(5)").unwrap();
        assert_eq!(
            t,
            TForm::Var {
                descriptor: Descriptor::P,
                ty: BinaryType::Double,
                max_len: Some(5)
            }
        );
        assert_eq!(t.width(), 8);
        assert_eq!(t.to_string(), "1PD(5)");

        let q = TForm::parse("QJ").unwrap();
        assert_eq!(q.width(), 16);
        assert_eq!(q.to_string(), "1QJ");
        assert!(q.is_variable());
    }

    #[test]
    fn reject_bad_forms() {
        for bad in ["", "3", "1Z", "2PD", "PZ", "1PD(x)", "1PD5", "4611686018427387904J"] {
            assert!(TForm::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn ascii_forms() {
        assert_eq!(AsciiFormat::parse("A12").unwrap(), AsciiFormat::Character(12));
        assert_eq!(AsciiFormat::parse("I6").unwrap().width(), 6);
        assert_eq!(AsciiFormat::parse("F10.3").unwrap(), AsciiFormat::Fixed(10, 3));
        assert_eq!(AsciiFormat::parse("D25.17").unwrap().to_string(), "D25.17");
        assert!(AsciiFormat::parse("F10").is_err());
        assert!(AsciiFormat::parse("X3").is_err());
        assert!(AsciiFormat::parse("").is_err());
    }

    // ---- layout ----

    fn bintable_header(forms: &[&str], naxis1: i64, rows: i64) -> Header {
        let mut h = Header::new();
        h.set("XTENSION", "BINTABLE", None).unwrap();
        h.set("BITPIX", 8i64, None).unwrap();
        h.set("NAXIS", 2i64, None).unwrap();
        h.set("NAXIS1", naxis1, None).unwrap();
        h.set("NAXIS2", rows, None).unwrap();
        h.set("PCOUNT", 0i64, None).unwrap();
        h.set("GCOUNT", 1i64, None).unwrap();
        h.set("TFIELDS", forms.len(), None).unwrap();
        for (i, form) in forms.iter().enumerate() {
            h.set(&format!("TFORM{}", i + 1), *form, None).unwrap();
        }
        h
    }

    #[test]
    fn mixed_layout_offsets() {
        let h = bintable_header(&["1J", "10A", "1PD(5)"], 22, 4);
        let layout = ColumnLayout::from_header(&h, TableKind::Binary).unwrap();
        let offsets: Vec<usize> = layout.columns().iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 4, 14]);
        assert_eq!(layout.columns()[2].width, 8);
        assert!(layout.columns()[2].is_variable());
        assert_eq!(layout.main_len(), 88);
        assert_eq!(layout.heap_start(), 88);
        assert_eq!(layout.heap_len(), 0);
    }

    #[test]
    fn naxis1_must_match_widths() {
        let h = bintable_header(&["1J", "1E"], 10, 1);
        let err = ColumnLayout::from_header(&h, TableKind::Binary).unwrap_err();
        assert!(matches!(err, Error::HeaderConsistency { ref keyword, .. } if keyword == "NAXIS1"));
    }

    #[test]
    fn heap_bounds_follow_pcount_and_theap() {
        let mut h = bintable_header(&["1PJ"], 8, 2);
        h.set("PCOUNT", 100i64, None).unwrap();
        h.set("THEAP", 20i64, None).unwrap();
        let layout = ColumnLayout::from_header(&h, TableKind::Binary).unwrap();
        assert_eq!((layout.heap_start(), layout.heap_len()), (20, 96));

        h.set("THEAP", 8i64, None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Binary).is_err());
    }

    #[test]
    fn column_keywords() {
        let mut h = bintable_header(&["6E", "1I"], 26, 1);
        h.set("TTYPE1", "flux", None).unwrap();
        h.set("TUNIT1", "Jy", None).unwrap();
        h.set("TDIM1", "(3,2)", None).unwrap();
        h.set("TTYPE2", "COUNTS", None).unwrap();
        h.set("TZERO2", 32768i64, None).unwrap();
        h.set("TNULL2", -1i64, None).unwrap();
        let layout = ColumnLayout::from_header(&h, TableKind::Binary).unwrap();
        let flux = &layout.columns()[0];
        assert_eq!(flux.unit.as_deref(), Some("Jy"));
        assert_eq!(flux.dims, Some(vec![2, 3]));
        assert!(!flux.is_scaled());
        let counts = &layout.columns()[1];
        assert!(counts.is_scaled());
        assert_eq!(counts.scale.blank, Some(-1));
        assert_eq!(layout.index_of("Flux").unwrap(), 0);
        assert!(matches!(layout.index_of("nope"), Err(Error::NoSuchColumn(_))));
    }

    #[test]
    fn tdim_larger_than_repeat_is_rejected() {
        let mut h = bintable_header(&["4E"], 16, 1);
        h.set("TDIM1", "(3,2)", None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Binary).is_err());
    }

    #[test]
    fn tdim_on_variable_columns_is_bounded_by_the_maximum() {
        let mut h = bintable_header(&["1PE(6)"], 8, 1);
        h.set("TDIM1", "(3,2)", None).unwrap();
        let layout = ColumnLayout::from_header(&h, TableKind::Binary).unwrap();
        assert_eq!(layout.columns()[0].dims, Some(vec![2, 3]));

        let mut h = bintable_header(&["1PE"], 8, 1);
        h.set("TDIM1", "(10,10)", None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Binary).is_ok());

        let mut h = bintable_header(&["1PE(4)"], 8, 1);
        h.set("TDIM1", "(3,2)", None).unwrap();
        let err = ColumnLayout::from_header(&h, TableKind::Binary).unwrap_err();
        assert!(matches!(err, Error::HeaderConsistency { ref keyword, .. } if keyword == "TDIM1"));
    }

    #[test]
    fn oversized_layouts_are_errors() {
        let wide = "2305843009213693952J";
        let h = bintable_header(&[wide, wide], 0, 1);
        let err = ColumnLayout::from_header(&h, TableKind::Binary).unwrap_err();
        assert!(matches!(err, Error::HeaderConsistency { ref keyword, .. } if keyword == "TFORM2"));

        let mut h = bintable_header(&["1E"], 4, 1);
        h.set("TDIM1", "(4294967296,4294967296)", None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Binary).is_err());

        let h = bintable_header(&["8E"], 32, i64::MAX);
        let err = ColumnLayout::from_header(&h, TableKind::Binary).unwrap_err();
        assert!(matches!(err, Error::HeaderConsistency { ref keyword, .. } if keyword == "NAXIS2"));
    }

    #[test]
    fn out_of_range_tbcol_is_an_error() {
        let mut h = Header::new();
        h.set("XTENSION", "TABLE", None).unwrap();
        h.set("NAXIS1", 20i64, None).unwrap();
        h.set("NAXIS2", 1i64, None).unwrap();
        h.set("TFIELDS", 1i64, None).unwrap();
        h.set("TFORM1", "I5", None).unwrap();
        for tbcol in [i64::MIN, 0, i64::MAX] {
            h.set("TBCOL1", tbcol, None).unwrap();
            let err = ColumnLayout::from_header(&h, TableKind::Ascii).unwrap_err();
            assert!(
                matches!(err, Error::HeaderConsistency { ref keyword, .. } if keyword == "TBCOL1"),
                "{tbcol}"
            );
        }
        h.set("TFORM1", format!("A{}", usize::MAX), None).unwrap();
        h.set("TBCOL1", 2i64, None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Ascii).is_err());
    }

    #[test]
    fn ascii_layout_uses_tbcol() {
        let mut h = Header::new();
        h.set("XTENSION", "TABLE", None).unwrap();
        h.set("NAXIS1", 20i64, None).unwrap();
        h.set("NAXIS2", 3i64, None).unwrap();
        h.set("TFIELDS", 2i64, None).unwrap();
        h.set("TFORM1", "I5", None).unwrap();
        h.set("TBCOL1", 1i64, None).unwrap();
        h.set("TFORM2", "F10.2", None).unwrap();
        h.set("TBCOL2", 8i64, None).unwrap();
        h.set("TNULL1", "*****", None).unwrap();
        let layout = ColumnLayout::from_header(&h, TableKind::Ascii).unwrap();
        assert_eq!(layout.columns()[1].offset, 7);
        assert_eq!(layout.columns()[0].null_text.as_deref(), Some("*****"));

        h.set("TBCOL2", 12i64, None).unwrap();
        assert!(ColumnLayout::from_header(&h, TableKind::Ascii).is_err());
    }

    // ---- data ----

    #[test]
    fn scaling_produces_physical_values() {
        let scale = Scaling {
            bscale: 2.0,
            bzero: 10.0,
            blank: Some(-1),
        };
        let data = ColumnData::Short(vec![1, -1, 3]).scaled(&scale);
        match data {
            ColumnData::Physical(v) => {
                assert_eq!(v[0], 12.0);
                assert!(v[1].is_nan());
                assert_eq!(v[2], 16.0);
            }
            other => panic!("Expected Physical, got {:?}", other),
        }
        let text = ColumnData::Ascii(vec![String::from("a")]);
        assert_eq!(text.clone().scaled(&scale), text);
    }

    #[test]
    fn column_def_writes_keywords() {
        let mut h = Header::new();
        ColumnDef::new("X", "6E")
            .unit("m")
            .dims(&[2, 3])
            .scaled(0.5, 1.0)
            .null(-1)
            .describe(&mut h, 1, TableKind::Binary)
            .unwrap();
        assert_eq!(h.get_str("TUNIT1").unwrap(), "m");
        assert_eq!(h.get_str("TDIM1").unwrap(), "(3,2)");
        assert_eq!(h.get_f64("TSCAL1").unwrap(), 0.5);
        assert_eq!(h.get_i64("TNULL1").unwrap(), -1);

        let mut a = Header::new();
        ColumnDef::new("N", "I4").null(-1).describe(&mut a, 1, TableKind::Ascii).unwrap();
        assert_eq!(a.get_str("TNULL1").unwrap(), "-1");
    }
}
