//! Binary table cells, rows and the variable-length array heap.
//!
//! Fixed-width cells live in the main table at `row * NAXIS1 + offset`.
//! Variable-length cells hold a (count, offset) descriptor pointing into the
//! heap that follows the main table, starting at THEAP. Writes append to
//! the heap; [`Hdu::compact_heap`] rewrites it without unreferenced bytes.

use std::ops::Range;

use log::debug;

use crate::card::Card;
use crate::column::{
    BinaryType, Column, ColumnData, ColumnDef, ColumnLayout, Descriptor, TForm, TableKind,
};
use crate::data::{ElementType, Scaling};
use crate::endian::{decode_vec, encode_slice, BigEndian};
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::Header;
use crate::image::ImageData;
use crate::table;

// ── Decoding ──

/// Text of an `A` cell: up to the first NUL, without trailing blanks.
fn cell_text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim_end().to_string()
}

fn decode_cells<'a>(ty: BinaryType, cells: impl Iterator<Item = &'a [u8]>) -> ColumnData {
    match ty {
        BinaryType::Ascii => ColumnData::Ascii(cells.map(cell_text).collect()),
        BinaryType::Bit => ColumnData::Bit(cells.map(<[u8]>::to_vec).collect()),
        _ => {
            let mut flat = Vec::new();
            for cell in cells {
                flat.extend_from_slice(cell);
            }
            decode_flat(ty, &flat)
        }
    }
}

fn decode_flat(ty: BinaryType, bytes: &[u8]) -> ColumnData {
    match ty {
        BinaryType::Logical => ColumnData::Logical(bytes.iter().map(|&b| b == b'T').collect()),
        BinaryType::Byte => ColumnData::Byte(bytes.to_vec()),
        BinaryType::Short => ColumnData::Short(decode_vec(bytes)),
        BinaryType::Int => ColumnData::Int(decode_vec(bytes)),
        BinaryType::Long => ColumnData::Long(decode_vec(bytes)),
        BinaryType::Float => ColumnData::Float(decode_vec(bytes)),
        BinaryType::Double => ColumnData::Double(decode_vec(bytes)),
        BinaryType::ComplexFloat => {
            let parts: Vec<f32> = decode_vec(bytes);
            ColumnData::ComplexFloat(parts.chunks_exact(2).map(|p| (p[0], p[1])).collect())
        }
        BinaryType::ComplexDouble => {
            let parts: Vec<f64> = decode_vec(bytes);
            ColumnData::ComplexDouble(parts.chunks_exact(2).map(|p| (p[0], p[1])).collect())
        }
        BinaryType::Bit => ColumnData::Bit(vec![bytes.to_vec()]),
        BinaryType::Ascii => ColumnData::Ascii(vec![cell_text(bytes)]),
    }
}

/// Element count and heap offset stored in a descriptor cell.
fn read_descriptor(descriptor: Descriptor, cell: &[u8]) -> Result<(usize, usize)> {
    let (count, offset) = match descriptor {
        Descriptor::P => (i64::from(i32::read_be(cell)), i64::from(i32::read_be(&cell[4..]))),
        Descriptor::Q => (i64::read_be(cell), i64::read_be(&cell[8..])),
    };
    match (usize::try_from(count), usize::try_from(offset)) {
        (Ok(count), Ok(offset)) => Ok((count, offset)),
        _ => Err(Error::consistency(
            "descriptor",
            format!("negative array descriptor ({count}, {offset})"),
        )),
    }
}

fn encode_descriptor(descriptor: Descriptor, count: usize, offset: usize) -> Result<Vec<u8>> {
    let overflow = || {
        Error::invalid_value(
            "TFORM",
            format!("array descriptor ({count}, {offset}) does not fit a P column"),
        )
    };
    Ok(match descriptor {
        Descriptor::P => {
            let count = i32::try_from(count).map_err(|_| overflow())?;
            let offset = i32::try_from(offset).map_err(|_| overflow())?;
            encode_slice(&[count, offset])
        }
        Descriptor::Q => {
            let count = i64::try_from(count).map_err(|_| overflow())?;
            let offset = i64::try_from(offset).map_err(|_| overflow())?;
            encode_slice(&[count, offset])
        }
    })
}

/// The main-table bytes of one cell.
fn cell<'a>(bytes: &'a [u8], layout: &ColumnLayout, col: &Column, row: usize) -> Result<&'a [u8]> {
    let at = row * layout.row_len() + col.offset;
    bytes.get(at..at + col.width).ok_or(Error::OutOfRange {
        index: row,
        len: layout.rows(),
    })
}

/// The heap bytes of `count` elements at heap `offset`, both as read from
/// a descriptor.
fn heap_slice<'a>(
    bytes: &'a [u8],
    layout: &ColumnLayout,
    ty: BinaryType,
    count: usize,
    offset: usize,
) -> Result<&'a [u8]> {
    let outside = || {
        Error::consistency(
            "PCOUNT",
            format!(
                "array of {count} elements at heap offset {offset} lies outside the {}-byte heap",
                layout.heap_len()
            ),
        )
    };
    let len = ty.bytes_for(count).ok_or_else(outside)?;
    let end = offset
        .checked_add(len)
        .filter(|&end| end <= layout.heap_len())
        .ok_or_else(outside)?;
    // Bounded by the table size, which the layout checked.
    let start = layout.heap_start();
    bytes.get(start + offset..start + end).ok_or_else(outside)
}

/// Decode `rows` of binary column `col` from the whole data unit.
pub(crate) fn decode_column(
    bytes: &[u8],
    layout: &ColumnLayout,
    col: &Column,
    rows: Range<usize>,
) -> Result<ColumnData> {
    let Some(tform) = col.tform() else {
        return Err(Error::WrongKind {
            expected: "binary table",
            found: String::from("ASCII table"),
        });
    };
    match *tform {
        TForm::Fixed { ty, .. } => {
            let cells = rows.map(|row| cell(bytes, layout, col, row)).collect::<Result<Vec<_>>>()?;
            Ok(decode_cells(ty, cells.into_iter()))
        }
        TForm::Var { descriptor, ty, .. } => {
            let mut arrays = Vec::with_capacity(rows.len());
            for row in rows {
                let (count, offset) = read_descriptor(descriptor, cell(bytes, layout, col, row)?)?;
                let array = heap_slice(bytes, layout, ty, count, offset)?;
                arrays.push(decode_cells(ty, std::iter::once(array)));
            }
            Ok(ColumnData::VarArray(arrays))
        }
    }
}

// ── Encoding ──

fn storage_type(ty: BinaryType) -> Option<ElementType> {
    Some(match ty {
        BinaryType::Byte => ElementType::U8,
        BinaryType::Short => ElementType::I16,
        BinaryType::Int => ElementType::I32,
        BinaryType::Long => ElementType::I64,
        BinaryType::Float => ElementType::F32,
        BinaryType::Double => ElementType::F64,
        _ => return None,
    })
}

fn type_name(ty: BinaryType) -> String {
    format!("TFORM code {}", ty.code())
}

/// The single entry of a per-row value (strings and bit arrays).
fn single<T>(values: &[T]) -> Result<&T> {
    match values {
        [one] => Ok(one),
        other => Err(Error::ShapeMismatch {
            expected: vec![1],
            found: vec![other.len()],
        }),
    }
}

/// Big-endian bytes of every element in `value`, stored as `ty`.
///
/// Physical values are converted back through `scale`; NaN becomes TNULL.
fn encode_values(ty: BinaryType, value: &ColumnData, scale: &Scaling) -> Result<Vec<u8>> {
    Ok(match (ty, value) {
        (BinaryType::Ascii, ColumnData::Ascii(v)) => {
            let s = single(v)?;
            if !s.is_ascii() {
                return Err(Error::invalid_value("TFORM", format!("{s:?} is not ASCII")));
            }
            s.as_bytes().to_vec()
        }
        (BinaryType::Bit, ColumnData::Bit(v)) => single(v)?.clone(),
        (BinaryType::Logical, ColumnData::Logical(v)) => {
            v.iter().map(|&b| if b { b'T' } else { b'F' }).collect()
        }
        (BinaryType::Byte, ColumnData::Byte(v)) => v.clone(),
        (BinaryType::Short, ColumnData::Short(v)) => encode_slice(v),
        (BinaryType::Int, ColumnData::Int(v)) => encode_slice(v),
        (BinaryType::Long, ColumnData::Long(v)) => encode_slice(v),
        (BinaryType::Float, ColumnData::Float(v)) => encode_slice(v),
        (BinaryType::Double, ColumnData::Double(v)) => encode_slice(v),
        (BinaryType::ComplexFloat, ColumnData::ComplexFloat(v)) => {
            let parts: Vec<f32> = v.iter().flat_map(|&(re, im)| [re, im]).collect();
            encode_slice(&parts)
        }
        (BinaryType::ComplexDouble, ColumnData::ComplexDouble(v)) => {
            let parts: Vec<f64> = v.iter().flat_map(|&(re, im)| [re, im]).collect();
            encode_slice(&parts)
        }
        (ty, ColumnData::Physical(v)) => match storage_type(ty) {
            Some(dtype) => ImageData::from_physical(dtype, v, scale).to_bytes(),
            None => {
                return Err(Error::TypeMismatch {
                    expected: type_name(ty),
                    found: value.type_name().to_string(),
                })
            }
        },
        (ty, other) => {
            return Err(Error::TypeMismatch {
                expected: type_name(ty),
                found: other.type_name().to_string(),
            })
        }
    })
}

/// Elements represented by `bytes` for a descriptor count. Bit counts
/// are rounded up to whole bytes.
fn element_count(ty: BinaryType, bytes: &[u8]) -> usize {
    match ty {
        BinaryType::Bit => bytes.len() * 8,
        other => bytes.len() / other.size(),
    }
}

// ── HDU operations ──

impl Hdu {
    /// A binary table extension with `rows` zero-filled rows.
    pub fn bintable(columns: &[ColumnDef], rows: usize) -> Result<Hdu> {
        let forms = columns
            .iter()
            .map(|c| TForm::parse(&c.format))
            .collect::<Result<Vec<_>>>()?;
        let row_len = forms
            .iter()
            .try_fold(0usize, |len, t| len.checked_add(t.width()))
            .ok_or_else(|| Error::invalid_value("NAXIS1", "column widths overflow a row"))?;
        let data_len = row_len
            .checked_mul(rows)
            .ok_or_else(|| Error::invalid_value("NAXIS2", "table size overflows"))?;
        let mut header = Header::new();
        header.append(Card::with_comment("XTENSION", "BINTABLE", "binary table extension")?)?;
        header.set("BITPIX", 8i64, Some("array data type"))?;
        header.set("NAXIS", 2i64, Some("number of array dimensions"))?;
        header.set("NAXIS1", row_len, Some("length of dimension 1"))?;
        header.set("NAXIS2", rows, Some("length of dimension 2"))?;
        header.set("PCOUNT", 0i64, Some("number of group parameters"))?;
        header.set("GCOUNT", 1i64, Some("number of groups"))?;
        header.set("TFIELDS", columns.len(), Some("number of table fields"))?;
        for (i, (def, form)) in columns.iter().zip(&forms).enumerate() {
            let n = i + 1;
            header.set(&format!("TTYPE{n}"), def.name.as_str(), None)?;
            header.set(&format!("TFORM{n}"), form.to_string(), None)?;
            def.describe(&mut header, n, TableKind::Binary)?;
        }
        Hdu::new(header, vec![0u8; data_len])
    }

    /// Number of rows, from NAXIS2.
    pub fn num_rows(&mut self) -> Result<usize> {
        Ok(self.column_layout()?.rows())
    }

    /// Every cell of row `row`, with scaling applied.
    pub fn read_row(&mut self, row: usize) -> Result<Vec<ColumnData>> {
        let layout = self.column_layout()?;
        if row >= layout.rows() {
            return Err(Error::OutOfRange {
                index: row,
                len: layout.rows(),
            });
        }
        (0..layout.len())
            .map(|index| self.read_cells(&layout, index, row..row + 1, true))
            .collect()
    }

    /// A whole column. Scaled columns read as [`ColumnData::Physical`].
    pub fn read_column(&mut self, name: &str) -> Result<ColumnData> {
        let layout = self.column_layout()?;
        let index = layout.index_of(name)?;
        self.read_cells(&layout, index, 0..layout.rows(), true)
    }

    /// A whole column as stored, ignoring TSCAL/TZERO/TNULL.
    pub fn read_column_raw(&mut self, name: &str) -> Result<ColumnData> {
        let layout = self.column_layout()?;
        let index = layout.index_of(name)?;
        self.read_cells(&layout, index, 0..layout.rows(), false)
    }

    fn read_cells(
        &mut self,
        layout: &ColumnLayout,
        index: usize,
        rows: Range<usize>,
        scaled: bool,
    ) -> Result<ColumnData> {
        let col = layout.column(index).ok_or(Error::OutOfRange {
            index,
            len: layout.len(),
        })?;
        let bytes = self.data_bytes()?;
        match layout.kind() {
            TableKind::Ascii => table::decode_column(bytes, layout, col, rows, scaled),
            TableKind::Binary => {
                let raw = decode_column(bytes, layout, col, rows)?;
                if scaled && col.is_scaled() {
                    Ok(raw.scaled(&col.scale))
                } else {
                    Ok(raw)
                }
            }
        }
    }

    /// Overwrite one cell.
    ///
    /// The value must have the column's stored type, or be
    /// [`ColumnData::Physical`] for a numeric column. Fixed-width cells must
    /// hold exactly the repeat count; variable-length cells take any length.
    ///
    /// Bits are written as whole packed bytes, so a `PX` descriptor records
    /// eight elements for every byte given.
    pub fn write_cell(&mut self, row: usize, name: &str, value: &ColumnData) -> Result<()> {
        let layout = self.column_layout()?;
        let index = layout.index_of(name)?;
        let col = &layout.columns()[index];
        if row >= layout.rows() {
            return Err(Error::OutOfRange {
                index: row,
                len: layout.rows(),
            });
        }
        let encoded = match (layout.kind(), col.tform()) {
            (TableKind::Ascii, _) => table::encode_field(col, value)?,
            (TableKind::Binary, Some(&TForm::Var { descriptor, ty, .. })) => {
                return self.write_array(&layout, col, row, descriptor, ty, value);
            }
            (TableKind::Binary, _) => {
                let ty = col.tform().map_or(BinaryType::Byte, TForm::element_type);
                let mut bytes = encode_values(ty, value, &col.scale)?;
                if ty == BinaryType::Ascii && bytes.len() <= col.width {
                    bytes.resize(col.width, b' ');
                }
                if bytes.len() != col.width {
                    return Err(Error::ShapeMismatch {
                        expected: vec![col.repeat],
                        found: vec![element_count(ty, &bytes)],
                    });
                }
                bytes
            }
        };
        let at = row * layout.row_len() + col.offset;
        let data = self.data_mut().make_mut()?;
        data[at..at + col.width].copy_from_slice(&encoded);
        Ok(())
    }

    /// Append an array to the heap and point the cell's descriptor at it.
    fn write_array(
        &mut self,
        layout: &ColumnLayout,
        col: &Column,
        row: usize,
        descriptor: Descriptor,
        ty: BinaryType,
        value: &ColumnData,
    ) -> Result<()> {
        let bytes = encode_values(ty, value, &col.scale)?;
        let count = element_count(ty, &bytes);
        let offset = if bytes.is_empty() {
            0
        } else {
            self.data().len() - layout.heap_start()
        };
        let cell = encode_descriptor(descriptor, count, offset)?;
        let at = row * layout.row_len() + col.offset;
        let data = self.data_mut().make_mut()?;
        data.extend_from_slice(&bytes);
        data[at..at + col.width].copy_from_slice(&cell);
        let pcount = data.len() - layout.main_len();
        self.data_mut().sync_len();
        self.header_mut().set("PCOUNT", pcount, None)?;
        Ok(())
    }

    /// Grow or shrink the table to `rows` rows, keeping the heap.
    ///
    /// New rows are zero-filled (blank for ASCII tables). Any gap between
    /// the main table and the heap is dropped, along with THEAP.
    pub fn resize_rows(&mut self, rows: usize) -> Result<()> {
        let layout = self.column_layout()?;
        let fill = match layout.kind() {
            TableKind::Binary => 0u8,
            TableKind::Ascii => b' ',
        };
        let row_len = layout.row_len();
        let bytes = self.data_bytes()?;
        let mut out = Vec::with_capacity(rows * row_len + layout.heap_len());
        out.extend_from_slice(&bytes[..layout.rows().min(rows) * row_len]);
        out.resize(rows * row_len, fill);
        out.extend_from_slice(&bytes[layout.heap_start()..layout.heap_start() + layout.heap_len()]);
        debug!("resizing table from {} to {rows} rows", layout.rows());
        self.data_mut().replace(out);
        let header = self.header_mut();
        header.set("NAXIS2", rows, None)?;
        header.set("PCOUNT", layout.heap_len(), None)?;
        header.delete("THEAP");
        Ok(())
    }

    /// Rewrite the heap so it holds only the arrays the rows reference, in
    /// row order.
    pub fn compact_heap(&mut self) -> Result<()> {
        let layout = self.column_layout()?;
        if layout.kind() != TableKind::Binary {
            return Err(self.wrong_kind("binary table"));
        }
        let bytes = self.data_bytes()?;
        let mut main = bytes[..layout.main_len()].to_vec();
        let mut heap = Vec::new();
        for row in 0..layout.rows() {
            for col in layout.columns() {
                let Some(&TForm::Var { descriptor, ty, .. }) = col.tform() else {
                    continue;
                };
                let at = row * layout.row_len() + col.offset;
                let (count, offset) = read_descriptor(descriptor, &main[at..at + col.width])?;
                let array = heap_slice(bytes, &layout, ty, count, offset)?;
                let moved = if array.is_empty() { 0 } else { heap.len() };
                heap.extend_from_slice(array);
                let cell = encode_descriptor(descriptor, count, moved)?;
                main[at..at + col.width].copy_from_slice(&cell);
            }
        }
        debug!("compacted heap from {} to {} bytes", layout.heap_len(), heap.len());
        let pcount = heap.len();
        main.extend_from_slice(&heap);
        self.data_mut().replace(main);
        let header = self.header_mut();
        header.set("PCOUNT", pcount, None)?;
        header.delete("THEAP");
        Ok(())
    }

    /// Set PCOUNT from the heap size and the `(max)` of every
    /// variable-length TFORMn from the longest array stored.
    pub(crate) fn sync_table_keywords(&mut self) -> Result<()> {
        let layout = self.column_layout()?;
        let pcount = self.data().len().saturating_sub(layout.main_len());
        self.header_mut().set("PCOUNT", pcount, None)?;
        if !layout.has_variable_columns() {
            return Ok(());
        }
        let bytes = self.data_bytes()?;
        let mut updates = Vec::new();
        for (i, col) in layout.columns().iter().enumerate() {
            let Some(&TForm::Var {
                descriptor,
                ty,
                max_len,
            }) = col.tform()
            else {
                continue;
            };
            let mut longest = 0;
            for row in 0..layout.rows() {
                let (count, _) = read_descriptor(descriptor, cell(bytes, &layout, col, row)?)?;
                longest = longest.max(count);
            }
            if max_len != Some(longest) {
                let tform = TForm::Var {
                    descriptor,
                    ty,
                    max_len: Some(longest),
                };
                updates.push((i + 1, tform));
            }
        }
        for (n, tform) in updates {
            self.header_mut().set(&format!("TFORM{n}"), tform.to_string(), None)?;
        }
        Ok(())
    }
}
