//! Big-endian conversion for FITS data.
//!
//! FITS stores all binary data most-significant byte first. Bulk routines go
//! through `bytemuck` so that the copy into a typed vector is a single
//! allocation, followed by an in-place byte swap on little-endian hosts.

use bytemuck::{pod_collect_to_vec, Pod};

/// A numeric type stored big-endian in FITS data.
pub trait BigEndian: Pod + PartialEq + Default {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Reinterpret a value read natively from big-endian bytes.
    fn from_be(self) -> Self;

    /// Read one value from the first `SIZE` bytes.
    fn read_be(buf: &[u8]) -> Self;

    /// Write one value into the first `SIZE` bytes.
    fn write_be(self, buf: &mut [u8]);

    /// Lossy conversion used when applying BSCALE/BZERO.
    fn to_f64(self) -> f64;

    /// Round and clamp a physical value into this storage type.
    fn from_f64(value: f64) -> Self;
}

macro_rules! impl_int {
    ($($t:ty),*) => {$(
        impl BigEndian for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn from_be(self) -> Self {
                <$t>::from_be(self)
            }

            #[inline]
            fn read_be(buf: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&buf[..Self::SIZE]);
                <$t>::from_be_bytes(raw)
            }

            #[inline]
            fn write_be(self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                // `as` saturates at the type bounds.
                libm::round(value) as $t
            }
        }
    )*};
}

macro_rules! impl_float {
    ($($t:ty => $bits:ty),*) => {$(
        impl BigEndian for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn from_be(self) -> Self {
                <$t>::from_bits(<$bits>::from_be(self.to_bits()))
            }

            #[inline]
            fn read_be(buf: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&buf[..Self::SIZE]);
                <$t>::from_be_bytes(raw)
            }

            #[inline]
            fn write_be(self, buf: &mut [u8]) {
                buf[..Self::SIZE].copy_from_slice(&self.to_be_bytes());
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    )*};
}

impl_int!(u8, i16, i32, i64);
impl_float!(f32 => u32, f64 => u64);

/// Decode every whole element in `bytes`.
pub fn decode_vec<T: BigEndian>(bytes: &[u8]) -> Vec<T> {
    let whole = bytes.len() - bytes.len() % T::SIZE;
    if whole == 0 {
        return Vec::new();
    }
    let mut out: Vec<T> = pod_collect_to_vec(&bytes[..whole]);
    if cfg!(target_endian = "little") {
        for value in &mut out {
            *value = value.from_be();
        }
    }
    out
}

/// Encode values as big-endian bytes.
pub fn encode_slice<T: BigEndian>(values: &[T]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * T::SIZE];
    encode_into(values, &mut out);
    out
}

/// Encode values into the front of `buf`, which must hold them all.
pub fn encode_into<T: BigEndian>(values: &[T], buf: &mut [u8]) {
    for (chunk, value) in buf.chunks_exact_mut(T::SIZE).zip(values) {
        value.write_be(chunk);
    }
}
