//! Image data for primary and IMAGE extension HDUs.
//!
//! Pixels decode from big-endian into an [`ImageData`] typed by BITPIX.
//! BSCALE/BZERO scaling is applied lazily through [`ImageView`] and never
//! written back unless asked for with [`Hdu::write_physical`] or
//! [`Hdu::rescale`].

use std::ops::Range;

use crate::card::Card;
use crate::data::{shape_and_dtype, ElementType, Scaling};
use crate::endian::{decode_vec, encode_into, encode_slice, BigEndian};
use crate::error::{Error, Result};
use crate::hdu::Hdu;
use crate::header::{Anchor, Header, Placement};

/// Image pixel data typed by BITPIX.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageData {
    U8(Vec<u8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ImageData {
    pub fn element_type(&self) -> ElementType {
        match self {
            ImageData::U8(_) => ElementType::U8,
            ImageData::I16(_) => ElementType::I16,
            ImageData::I32(_) => ElementType::I32,
            ImageData::I64(_) => ElementType::I64,
            ImageData::F32(_) => ElementType::F32,
            ImageData::F64(_) => ElementType::F64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ImageData::U8(v) => v.len(),
            ImageData::I16(v) => v.len(),
            ImageData::I32(v) => v.len(),
            ImageData::I64(v) => v.len(),
            ImageData::F32(v) => v.len(),
            ImageData::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element `i` widened to f64, unscaled.
    pub fn get(&self, i: usize) -> Option<f64> {
        match self {
            ImageData::U8(v) => v.get(i).map(|&x| x.to_f64()),
            ImageData::I16(v) => v.get(i).map(|&x| x.to_f64()),
            ImageData::I32(v) => v.get(i).map(|&x| x.to_f64()),
            ImageData::I64(v) => v.get(i).map(|&x| x.to_f64()),
            ImageData::F32(v) => v.get(i).map(|&x| x.to_f64()),
            ImageData::F64(v) => v.get(i).copied(),
        }
    }

    fn get_i64(&self, i: usize) -> Option<i64> {
        match self {
            ImageData::U8(v) => v.get(i).map(|&x| i64::from(x)),
            ImageData::I16(v) => v.get(i).map(|&x| i64::from(x)),
            ImageData::I32(v) => v.get(i).map(|&x| i64::from(x)),
            ImageData::I64(v) => v.get(i).copied(),
            ImageData::F32(_) | ImageData::F64(_) => None,
        }
    }

    pub(crate) fn decode(dtype: ElementType, bytes: &[u8]) -> ImageData {
        match dtype {
            ElementType::U8 => ImageData::U8(bytes.to_vec()),
            ElementType::I16 => ImageData::I16(decode_vec(bytes)),
            ElementType::I32 => ImageData::I32(decode_vec(bytes)),
            ElementType::I64 => ImageData::I64(decode_vec(bytes)),
            ElementType::F32 => ImageData::F32(decode_vec(bytes)),
            ElementType::F64 => ImageData::F64(decode_vec(bytes)),
        }
    }

    /// Big-endian bytes, unpadded.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ImageData::U8(v) => v.clone(),
            ImageData::I16(v) => encode_slice(v),
            ImageData::I32(v) => encode_slice(v),
            ImageData::I64(v) => encode_slice(v),
            ImageData::F32(v) => encode_slice(v),
            ImageData::F64(v) => encode_slice(v),
        }
    }

    fn encode_into(&self, buf: &mut [u8]) {
        match self {
            ImageData::U8(v) => encode_into(v, buf),
            ImageData::I16(v) => encode_into(v, buf),
            ImageData::I32(v) => encode_into(v, buf),
            ImageData::I64(v) => encode_into(v, buf),
            ImageData::F32(v) => encode_into(v, buf),
            ImageData::F64(v) => encode_into(v, buf),
        }
    }

    /// Store physical values as `dtype`, inverting `scale`.
    ///
    /// NaN becomes the BLANK value in integer storage, or 0 without one.
    pub fn from_physical(dtype: ElementType, values: &[f64], scale: &Scaling) -> ImageData {
        let blank = scale.blank.map_or(0.0, |b| b as f64);
        match dtype {
            ElementType::U8 => ImageData::U8(unscale(values, scale, u8::from_f64(blank))),
            ElementType::I16 => ImageData::I16(unscale(values, scale, i16::from_f64(blank))),
            ElementType::I32 => ImageData::I32(unscale(values, scale, i32::from_f64(blank))),
            ElementType::I64 => ImageData::I64(unscale(values, scale, scale.blank.unwrap_or(0))),
            ElementType::F32 => ImageData::F32(unscale(values, scale, f32::NAN)),
            ElementType::F64 => ImageData::F64(unscale(values, scale, f64::NAN)),
        }
    }
}

fn unscale<T: BigEndian>(values: &[f64], scale: &Scaling, nan: T) -> Vec<T> {
    values
        .iter()
        .map(|&v| if v.is_nan() { nan } else { T::from_f64(scale.to_raw(v)) })
        .collect()
}

/// Raw pixels with the shape and scaling needed to read physical values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageView {
    raw: ImageData,
    shape: Vec<usize>,
    scale: Scaling,
}

impl ImageView {
    /// Row-major shape, `[NAXISn, ..., NAXIS1]`.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn raw(&self) -> &ImageData {
        &self.raw
    }

    pub fn into_raw(self) -> ImageData {
        self.raw
    }

    pub fn scaling(&self) -> &Scaling {
        &self.scale
    }

    /// Whether physical values differ from the stored ones.
    pub fn is_scaled(&self) -> bool {
        let blanks = self.scale.blank.is_some() && !self.raw.element_type().is_float();
        !self.scale.is_identity() || blanks
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Physical value of element `i` in storage order. BLANK reads as NaN.
    pub fn value(&self, i: usize) -> Option<f64> {
        let raw = self.raw.get(i)?;
        if self.scale.blank.is_some() && self.raw.get_i64(i) == self.scale.blank {
            return Some(f64::NAN);
        }
        Some(self.scale.to_physical(raw))
    }

    /// Physical value at a row-major index.
    pub fn get(&self, index: &[usize]) -> Option<f64> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut flat = 0usize;
        for (&i, &n) in index.iter().zip(&self.shape) {
            if i >= n {
                return None;
            }
            flat = flat * n + i;
        }
        self.value(flat)
    }

    /// Every physical value in storage order.
    pub fn physical(&self) -> Vec<f64> {
        (0..self.len()).filter_map(|i| self.value(i)).collect()
    }

    /// Physical values as an n-dimensional array.
    #[cfg(feature = "array")]
    pub fn to_array(&self) -> Result<ndarray::ArrayD<f64>> {
        let shape = if self.shape.is_empty() { vec![0] } else { self.shape.clone() };
        ndarray::ArrayD::from_shape_vec(ndarray::IxDyn(&shape), self.physical()).map_err(|_| {
            Error::ShapeMismatch {
                expected: shape.clone(),
                found: vec![self.len()],
            }
        })
    }
}

impl Hdu {
    /// An IMAGE extension holding `data` with the row-major `shape`.
    pub fn image(data: ImageData, shape: &[usize]) -> Result<Hdu> {
        check_len(shape, data.len())?;
        let mut header = Header::new();
        header.append(Card::with_comment("XTENSION", "IMAGE", "image extension")?)?;
        header.set("BITPIX", data.element_type().bitpix(), Some("array data type"))?;
        header.set("NAXIS", shape.len(), Some("number of array dimensions"))?;
        for (k, &n) in shape.iter().rev().enumerate() {
            header.set(&format!("NAXIS{}", k + 1), n, None)?;
        }
        header.set("PCOUNT", 0i64, Some("number of parameters"))?;
        header.set("GCOUNT", 1i64, Some("number of groups"))?;
        Hdu::new(header, data.to_bytes())
    }

    fn image_layout(&self) -> Result<(Vec<usize>, ElementType)> {
        if !self.kind().is_image() {
            return Err(self.wrong_kind("image"));
        }
        shape_and_dtype(self.header())
    }

    /// Row-major image shape.
    pub fn shape(&self) -> Result<Vec<usize>> {
        Ok(self.image_layout()?.0)
    }

    /// Stored pixels without scaling.
    pub fn read_raw(&mut self) -> Result<ImageData> {
        let (_, dtype) = self.image_layout()?;
        Ok(ImageData::decode(dtype, self.data_bytes()?))
    }

    pub fn read_image(&mut self) -> Result<ImageView> {
        let (shape, _) = self.image_layout()?;
        let scale = Scaling::from_header(self.header());
        let raw = self.read_raw()?;
        Ok(ImageView { raw, shape, scale })
    }

    /// Overwrite the pixels, keeping the shape and type the header declares.
    pub fn write_image(&mut self, data: &ImageData) -> Result<()> {
        let (shape, dtype) = self.image_layout()?;
        if data.element_type() != dtype {
            return Err(Error::TypeMismatch {
                expected: dtype.to_string(),
                found: data.element_type().to_string(),
            });
        }
        check_len(&shape, data.len())?;
        let buf = self.data_mut().make_mut()?;
        data.encode_into(buf);
        Ok(())
    }

    /// Replace the pixels with data of any type and shape.
    ///
    /// BITPIX and the axes follow the new data; BSCALE, BZERO and BLANK are
    /// dropped because the new values are stored as given.
    pub fn replace_image(&mut self, data: ImageData, shape: &[usize]) -> Result<()> {
        self.image_layout()?;
        check_len(shape, data.len())?;
        let header = self.header_mut();
        header.set("BITPIX", data.element_type().bitpix(), None)?;
        set_axes(header, shape)?;
        for keyword in ["BSCALE", "BZERO", "BLANK"] {
            header.delete(keyword);
        }
        self.data_mut().replace(data.to_bytes());
        Ok(())
    }

    /// Store physical values through the current BSCALE/BZERO.
    pub fn write_physical(&mut self, values: &[f64]) -> Result<()> {
        let (shape, dtype) = self.image_layout()?;
        check_len(&shape, values.len())?;
        let scale = Scaling::from_header(self.header());
        self.write_image(&ImageData::from_physical(dtype, values, &scale))
    }

    /// Re-store the image as `bitpix` with new BSCALE/BZERO, keeping the
    /// physical values.
    pub fn rescale(&mut self, bitpix: i64, bscale: f64, bzero: f64) -> Result<()> {
        let dtype = ElementType::from_bitpix(bitpix)?;
        if bscale == 0.0 || !bscale.is_finite() || !bzero.is_finite() {
            return Err(Error::invalid_value(
                "BSCALE",
                format!("cannot scale by {bscale} + {bzero}"),
            ));
        }
        let view = self.read_image()?;
        let blank = if dtype.is_float() { None } else { view.scale.blank };
        let scale = Scaling { bscale, bzero, blank };
        let raw = ImageData::from_physical(dtype, &view.physical(), &scale);

        let header = self.header_mut();
        header.set("BITPIX", bitpix, None)?;
        if scale.is_identity() {
            header.delete("BSCALE");
            header.delete("BZERO");
        } else {
            header.set("BSCALE", bscale, None)?;
            header.set("BZERO", bzero, None)?;
        }
        match blank {
            Some(b) => header.set("BLANK", b, None)?,
            None => {
                header.delete("BLANK");
            }
        }
        self.data_mut().replace(raw.to_bytes());
        Ok(())
    }

    /// A sub-array given one range per axis, in row-major order.
    pub fn section(&mut self, ranges: &[Range<usize>]) -> Result<ImageView> {
        let (shape, dtype) = self.image_layout()?;
        let sub: Vec<usize> = ranges.iter().map(|r| r.end.saturating_sub(r.start)).collect();
        if ranges.len() != shape.len() {
            return Err(Error::ShapeMismatch {
                expected: shape,
                found: sub,
            });
        }
        for (r, &n) in ranges.iter().zip(&shape) {
            if r.start > r.end || r.end > n {
                return Err(Error::OutOfRange { index: r.end, len: n });
            }
        }
        let scale = Scaling::from_header(self.header());
        let total: usize = sub.iter().product();
        if shape.is_empty() || total == 0 {
            return Ok(ImageView {
                raw: ImageData::decode(dtype, &[]),
                shape: sub,
                scale,
            });
        }

        let ndim = shape.len();
        let mut strides = vec![1usize; ndim];
        for d in (0..ndim - 1).rev() {
            strides[d] = strides[d + 1] * shape[d + 1];
        }
        let size = dtype.size();
        let run = sub[ndim - 1] * size;
        let bytes = self.data_bytes()?;
        let mut raw = Vec::with_capacity(total * size);
        let mut idx = vec![0usize; ndim - 1];
        'rows: loop {
            let first: usize = idx
                .iter()
                .enumerate()
                .map(|(d, &i)| (ranges[d].start + i) * strides[d])
                .sum::<usize>()
                + ranges[ndim - 1].start;
            raw.extend_from_slice(&bytes[first * size..first * size + run]);
            // Advance the outer index, last outer axis fastest.
            let mut d = ndim - 1;
            loop {
                if d == 0 {
                    break 'rows;
                }
                d -= 1;
                idx[d] += 1;
                if idx[d] < sub[d] {
                    break;
                }
                idx[d] = 0;
            }
        }
        Ok(ImageView {
            raw: ImageData::decode(dtype, &raw),
            shape: sub,
            scale,
        })
    }
}

fn check_len(shape: &[usize], len: usize) -> Result<()> {
    let expected: usize = if shape.is_empty() { 0 } else { shape.iter().product() };
    if expected != len {
        return Err(Error::ShapeMismatch {
            expected: shape.to_vec(),
            found: vec![len],
        });
    }
    Ok(())
}

/// Rewrite NAXIS and NAXISn for a row-major `shape`.
fn set_axes(header: &mut Header, shape: &[usize]) -> Result<()> {
    let old = header.find("NAXIS").and_then(|v| v.as_i64()).unwrap_or(0);
    for k in (shape.len() as i64 + 1)..=old {
        header.delete(&format!("NAXIS{k}"));
    }
    header.set("NAXIS", shape.len(), None)?;
    let mut previous = String::from("NAXIS");
    for (k, &n) in shape.iter().rev().enumerate() {
        let keyword = format!("NAXIS{}", k + 1);
        header.set_at(&keyword, n, None, Placement::After(Anchor::Keyword(&previous)))?;
        previous = keyword;
    }
    Ok(())
}
