//! ASCII table fields.
//!
//! Each field is fixed-width text at its TBCOLn position. Numbers are right
//! justified and strings left justified; `D` exponents are accepted on read.
//! A blank field, or one equal to TNULLn, is null.

use std::ops::Range;

use crate::card::Card;
use crate::column::{
    AsciiFormat, Column, ColumnData, ColumnDef, ColumnFormat, ColumnLayout, TableKind,
};
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::Header;

fn format_of(col: &Column) -> Result<AsciiFormat> {
    match col.format {
        ColumnFormat::Ascii(a) => Ok(a),
        ColumnFormat::Binary(_) => Err(Error::WrongKind {
            expected: "ASCII table",
            found: String::from("binary table"),
        }),
    }
}

fn column_label(col: &Column) -> String {
    col.name.clone().unwrap_or_else(|| col.format.to_string())
}

/// Parse a FITS float, handling `D` exponent notation.
fn parse_fits_float(s: &str) -> Option<f64> {
    s.replace(['D', 'd'], "E").parse::<f64>().ok()
}

fn is_null(field: &str, col: &Column) -> bool {
    let field = field.trim();
    field.is_empty() || col.null_text.as_deref().is_some_and(|n| n.trim() == field)
}

/// Decode `rows` of ASCII column `col`.
///
/// Raw reads give nulls as 0 (integers) or NaN (reals); scaled reads give
/// NaN for both.
pub(crate) fn decode_column(
    bytes: &[u8],
    layout: &ColumnLayout,
    col: &Column,
    rows: Range<usize>,
    scaled: bool,
) -> Result<ColumnData> {
    let format = format_of(col)?;
    let mut fields = Vec::with_capacity(rows.len());
    for row in rows {
        let at = row * layout.row_len() + col.offset;
        let field = bytes.get(at..at + col.width).ok_or(Error::OutOfRange {
            index: row,
            len: layout.rows(),
        })?;
        fields.push(String::from_utf8_lossy(field).into_owned());
    }
    let bad = |field: &str| {
        Error::invalid_value(column_label(col), format!("{field:?} is not a valid {format} field"))
    };
    let values = match format {
        AsciiFormat::Character(_) => {
            return Ok(ColumnData::Ascii(fields.iter().map(|f| f.trim_end().to_string()).collect()));
        }
        AsciiFormat::Integer(_) => {
            let mut ints = Vec::with_capacity(fields.len());
            for field in &fields {
                if is_null(field, col) {
                    ints.push(None);
                } else {
                    ints.push(Some(field.trim().parse::<i64>().map_err(|_| bad(field))?));
                }
            }
            if !(scaled && col.is_scaled()) {
                return Ok(ColumnData::Long(ints.into_iter().map(|v| v.unwrap_or(0)).collect()));
            }
            ints.into_iter().map(|v| v.map(|n| n as f64)).collect::<Vec<_>>()
        }
        AsciiFormat::Fixed(..) | AsciiFormat::Exponential(..) | AsciiFormat::Double(..) => {
            let mut reals = Vec::with_capacity(fields.len());
            for field in &fields {
                if is_null(field, col) {
                    reals.push(None);
                } else {
                    reals.push(Some(parse_fits_float(field.trim()).ok_or_else(|| bad(field))?));
                }
            }
            if !(scaled && col.is_scaled()) {
                return Ok(ColumnData::Double(
                    reals.into_iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
                ));
            }
            reals
        }
    };
    Ok(ColumnData::Physical(
        values
            .into_iter()
            .map(|v| v.map_or(f64::NAN, |raw| col.scale.to_physical(raw)))
            .collect(),
    ))
}

fn is_real(format: AsciiFormat) -> bool {
    format.is_numeric() && !matches!(format, AsciiFormat::Integer(_))
}

fn left_justify(s: &str, width: usize) -> Option<Vec<u8>> {
    (s.len() <= width).then(|| format!("{s:<width$}").into_bytes())
}

fn right_justify(s: &str, width: usize) -> Option<Vec<u8>> {
    (s.len() <= width).then(|| format!("{s:>width$}").into_bytes())
}

fn format_real(format: AsciiFormat, value: f64) -> String {
    match format {
        AsciiFormat::Fixed(_, d) => format!("{:.*}", d, value),
        AsciiFormat::Exponential(_, d) => format!("{:.*E}", d, value),
        AsciiFormat::Double(_, d) => format!("{:.*E}", d, value).replace('E', "D"),
        AsciiFormat::Character(_) | AsciiFormat::Integer(_) => value.to_string(),
    }
}

/// Text of one field, exactly `col.width` bytes.
///
/// Physical values are converted back through TSCAL/TZERO; NaN writes
/// TNULLn, or a blank field without one.
pub(crate) fn encode_field(col: &Column, value: &ColumnData) -> Result<Vec<u8>> {
    let format = format_of(col)?;
    let width = col.width;
    if value.len() != 1 {
        return Err(Error::ShapeMismatch {
            expected: vec![1],
            found: vec![value.len()],
        });
    }
    let text = match (format, value) {
        (AsciiFormat::Character(_), ColumnData::Ascii(v)) => {
            if !v[0].is_ascii() {
                let reason = format!("{:?} is not ASCII", v[0]);
                return Err(Error::invalid_value(column_label(col), reason));
            }
            left_justify(&v[0], width)
        }
        (AsciiFormat::Integer(_), ColumnData::Long(v)) => right_justify(&v[0].to_string(), width),
        (AsciiFormat::Integer(_), ColumnData::Physical(v)) if v[0].is_nan() => null_field(col),
        (AsciiFormat::Integer(_), ColumnData::Physical(v)) => {
            let raw = libm::round(col.scale.to_raw(v[0]));
            right_justify(&format!("{}", raw as i64), width)
        }
        (f, ColumnData::Double(v)) if is_real(f) => {
            if v[0].is_nan() {
                null_field(col)
            } else {
                right_justify(&format_real(f, v[0]), width)
            }
        }
        (f, ColumnData::Physical(v)) if is_real(f) => {
            if v[0].is_nan() {
                null_field(col)
            } else {
                right_justify(&format_real(f, col.scale.to_raw(v[0])), width)
            }
        }
        (f, other) => {
            return Err(Error::TypeMismatch {
                expected: format!("ASCII format {f}"),
                found: other.type_name().to_string(),
            })
        }
    };
    text.ok_or_else(|| {
        Error::invalid_value(column_label(col), format!("value does not fit in {format}"))
    })
}

fn null_field(col: &Column) -> Option<Vec<u8>> {
    match &col.null_text {
        Some(null) => right_justify(null.trim(), col.width),
        None => Some(vec![b' '; col.width]),
    }
}

impl Hdu {
    /// An ASCII table extension with `rows` blank rows.
    ///
    /// Fields are laid out left to right, one space apart.
    pub fn ascii_table(columns: &[ColumnDef], rows: usize) -> Result<Hdu> {
        let formats = columns
            .iter()
            .map(|c| AsciiFormat::parse(&c.format))
            .collect::<Result<Vec<_>>>()?;
        let mut starts = Vec::with_capacity(formats.len());
        let mut row_len = 0usize;
        let overflow = || Error::invalid_value("NAXIS1", "field widths overflow a row");
        for format in &formats {
            let start = row_len.checked_add(usize::from(row_len > 0)).ok_or_else(overflow)?;
            starts.push(start.checked_add(1).ok_or_else(overflow)?);
            row_len = start.checked_add(format.width()).ok_or_else(overflow)?;
        }
        let data_len = row_len
            .checked_mul(rows)
            .ok_or_else(|| Error::invalid_value("NAXIS2", "table size overflows"))?;
        let mut header = Header::new();
        header.append(Card::with_comment("XTENSION", "TABLE", "ASCII table extension")?)?;
        header.set("BITPIX", 8i64, Some("array data type"))?;
        header.set("NAXIS", 2i64, Some("number of array dimensions"))?;
        header.set("NAXIS1", row_len, Some("length of dimension 1"))?;
        header.set("NAXIS2", rows, Some("length of dimension 2"))?;
        header.set("PCOUNT", 0i64, Some("number of group parameters"))?;
        header.set("GCOUNT", 1i64, Some("number of groups"))?;
        header.set("TFIELDS", columns.len(), Some("number of table fields"))?;
        for (i, ((def, format), start)) in columns.iter().zip(&formats).zip(starts).enumerate() {
            let n = i + 1;
            header.set(&format!("TTYPE{n}"), def.name.as_str(), None)?;
            header.set(&format!("TBCOL{n}"), start, None)?;
            header.set(&format!("TFORM{n}"), format.to_string(), None)?;
            def.describe(&mut header, n, TableKind::Ascii)?;
        }
        Hdu::new(header, vec![b' '; data_len])
    }
}
