//! FITS CHECKSUM and DATASUM keyword support.
//!
//! Implements the HEASARC ones-complement checksum convention: a 32-bit
//! ones-complement sum over big-endian words, ASCII-encoded so that a
//! stamped HDU sums to negative zero.

use log::warn;

use crate::block::BLOCK_SIZE;
use crate::error::{Error, Result};
use crate::header::Header;

/// Placeholder CHECKSUM value used while summing the header.
const ZERO_CHECKSUM: &str = "0000000000000000";

// ── Ones-complement sum ──

/// Running ones-complement 32-bit checksum (cfitsio `ffcsum`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u32);

impl Checksum {
    pub fn new() -> Self {
        Checksum(0)
    }

    /// Sum of `bytes`, treated as zero-padded to whole blocks.
    pub fn of(bytes: &[u8]) -> Self {
        let mut sum = Checksum::new();
        sum.update(bytes);
        sum
    }

    /// Add bytes that continue on a 4-byte boundary from the last update.
    pub fn update(&mut self, bytes: &[u8]) {
        for block in bytes.chunks(BLOCK_SIZE) {
            self.0 = accumulate(self.0, block);
        }
    }

    pub fn value(self) -> u32 {
        self.0
    }

    /// Ones-complement addition of two partial sums.
    pub fn combine(self, other: Checksum) -> Checksum {
        Checksum(fold((self.0 >> 16) + (other.0 >> 16), (self.0 & 0xFFFF) + (other.0 & 0xFFFF)))
    }

    /// True when the sum is negative zero, as for a correctly stamped HDU.
    pub fn is_negative_zero(self) -> bool {
        self.0 == 0 || self.0 == u32::MAX
    }

    /// 16-character ASCII form (cfitsio `ffesum`).
    pub fn encode(self, complement: bool) -> String {
        let encoded = encode(self.0, complement);
        encoded.iter().map(|&b| b as char).collect()
    }
}

fn accumulate(sum: u32, block: &[u8]) -> u32 {
    let mut hi = sum >> 16;
    let mut lo = sum & 0xFFFF;
    for word in block.chunks(4) {
        let mut w = [0u8; 4];
        w[..word.len()].copy_from_slice(word);
        hi += u16::from_be_bytes([w[0], w[1]]) as u32;
        lo += u16::from_be_bytes([w[2], w[3]]) as u32;
    }
    fold(hi, lo)
}

fn fold(mut hi: u32, mut lo: u32) -> u32 {
    let mut hicarry = hi >> 16;
    let mut locarry = lo >> 16;
    while (hicarry | locarry) != 0 {
        hi = (hi & 0xFFFF) + locarry;
        lo = (lo & 0xFFFF) + hicarry;
        hicarry = hi >> 16;
        locarry = lo >> 16;
    }
    (hi << 16) | lo
}

// ── ASCII encoding ──

/// Punctuation between digits and letters that the encoding avoids.
const EXCLUDE: [i32; 13] = [
    0x3a, 0x3b, 0x3c, 0x3d, 0x3e, 0x3f, 0x40, 0x5b, 0x5c, 0x5d, 0x5e, 0x5f, 0x60,
];
const ASCII_OFFSET: i32 = 0x30;

fn encode(sum: u32, complement: bool) -> [u8; 16] {
    let value = if complement { u32::MAX - sum } else { sum };
    let mut asc = [0u8; 16];
    for ii in 0..4usize {
        let byte = ((value >> (24 - 8 * ii)) & 0xFF) as i32;
        let mut ch = [byte / 4 + ASCII_OFFSET; 4];
        ch[0] += byte % 4;
        loop {
            let mut adjusted = false;
            for &ex in &EXCLUDE {
                for jj in (0..4).step_by(2) {
                    if ch[jj] == ex || ch[jj + 1] == ex {
                        ch[jj] += 1;
                        ch[jj + 1] -= 1;
                        adjusted = true;
                    }
                }
            }
            if !adjusted {
                break;
            }
        }
        for (jj, &c) in ch.iter().enumerate() {
            asc[4 * jj + ii] = c as u8;
        }
    }
    // Rotate right by one.
    let mut out = [0u8; 16];
    for (ii, slot) in out.iter_mut().enumerate() {
        *slot = asc[(ii + 15) % 16];
    }
    out
}

/// Decode a 16-character CHECKSUM string (cfitsio `ffdsum`).
pub fn decode(ascii: &str, complement: bool) -> Option<u32> {
    let bytes: [u8; 16] = ascii.as_bytes().try_into().ok()?;
    let mut cbuf = [0i32; 16];
    for (ii, slot) in cbuf.iter_mut().enumerate() {
        *slot = bytes[(ii + 1) % 16] as i32 - ASCII_OFFSET;
    }
    let mut hi = 0u32;
    let mut lo = 0u32;
    for quad in cbuf.chunks_exact(4) {
        hi += ((quad[0] << 8) + quad[1]) as u32;
        lo += ((quad[2] << 8) + quad[3]) as u32;
    }
    let sum = fold(hi, lo);
    Some(if complement { u32::MAX - sum } else { sum })
}

// ── Header keywords ──

/// Set DATASUM and CHECKSUM so that `header` plus `data` sums to -0.
///
/// The values are computed on a copy first, so a header whose stored
/// checksums are already correct is left untouched.
pub(crate) fn stamp(header: &mut Header, data: &[u8]) -> Result<()> {
    let datasum = Checksum::of(data).value().to_string();
    let encoded = expected_checksum(header, data, &datasum)?;
    header.set("DATASUM", datasum.as_str(), Some("data unit checksum"))?;
    header.set("CHECKSUM", encoded.as_str(), Some("HDU checksum"))?;
    Ok(())
}

fn expected_checksum(header: &Header, data: &[u8], datasum: &str) -> Result<String> {
    let mut stamped = header.clone();
    stamped.set("DATASUM", datasum, Some("data unit checksum"))?;
    stamped.set("CHECKSUM", ZERO_CHECKSUM, Some("HDU checksum"))?;
    let total = Checksum::of(&stamped.to_bytes()).combine(Checksum::of(data));
    Ok(total.encode(true))
}

/// Compare stored checksums with the header and data as they are now.
///
/// Absent keywords are not checked. Mismatches are logged and returned.
pub(crate) fn verify(header: &Header, data: &[u8]) -> Vec<Error> {
    let mut problems = Vec::new();
    let datasum = Checksum::of(data);
    if let Some(stored) = header.find("DATASUM") {
        let stored = stored.to_string();
        let matches = stored.trim().parse::<u64>().ok() == Some(u64::from(datasum.value()));
        if !matches {
            problems.push(Error::Checksum {
                keyword: "DATASUM",
                stored,
                computed: datasum.value().to_string(),
            });
        }
    }
    if let Some(stored) = header.find("CHECKSUM") {
        let total = Checksum::of(&header.to_bytes()).combine(datasum);
        if !total.is_negative_zero() {
            let computed = expected_checksum(header, data, &datasum.value().to_string())
                .unwrap_or_default();
            problems.push(Error::Checksum {
                keyword: "CHECKSUM",
                stored: stored.to_string(),
                computed,
            });
        }
    }
    for problem in &problems {
        warn!("{problem}");
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    // ---- encoding ----

    #[test]
    fn encode_zero() {
        assert_eq!(Checksum(0).encode(false), ZERO_CHECKSUM);
        assert_eq!(Checksum(u32::MAX).encode(true), ZERO_CHECKSUM);
    }

    #[test]
    fn encode_known_value() {
        // cfitsio test vector
        assert_eq!(Checksum(1234567890).encode(false), "dCW2fBU0dBU0dBU0");
        assert_eq!(decode("dCW2fBU0dBU0dBU0", false), Some(1234567890));
    }

    #[test]
    fn encode_decode_roundtrip() {
        for v in [0u32, 1, 42, 1234567890, 0xDEADBEEF, u32::MAX] {
            for complement in [false, true] {
                let encoded = Checksum(v).encode(complement);
                assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric()), "{encoded}");
                assert_eq!(decode(&encoded, complement), Some(v));
            }
        }
        assert_eq!(decode("short", false), None);
    }

    // ---- sums ----

    #[test]
    fn sum_of_uniform_blocks() {
        assert_eq!(Checksum::of(&[0u8; BLOCK_SIZE]).value(), 0);
        assert_eq!(Checksum::of(&[0xFFu8; BLOCK_SIZE]).value(), u32::MAX);
    }

    #[test]
    fn zero_padding_does_not_change_the_sum() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
        let mut padded = data.clone();
        padded.resize(BLOCK_SIZE, 0);
        assert_eq!(Checksum::of(&data), Checksum::of(&padded));
    }

    #[test]
    fn incremental_updates_match_one_shot() {
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 256) as u8).collect();
        let mut sum = Checksum::new();
        sum.update(&data[..BLOCK_SIZE]);
        sum.update(&data[BLOCK_SIZE..]);
        assert_eq!(sum, Checksum::of(&data));
        let split = Checksum::of(&data[..BLOCK_SIZE]).combine(Checksum::of(&data[BLOCK_SIZE..]));
        assert_eq!(split, sum);
    }

    #[test]
    fn complement_sums_to_negative_zero() {
        let x = Checksum(0x1234_5678);
        assert!(x.combine(Checksum(u32::MAX - 0x1234_5678)).is_negative_zero());
        assert_eq!(x.combine(Checksum(0)), x);
    }

    // ---- keywords ----

    fn header() -> Header {
        let mut h = Header::new();
        h.set("SIMPLE", true, None).unwrap();
        h.set("BITPIX", 8i64, None).unwrap();
        h.set("NAXIS", 1i64, None).unwrap();
        h.set("NAXIS1", 10i64, None).unwrap();
        h
    }

    #[test]
    fn stamped_hdu_verifies() {
        let data = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut h = header();
        stamp(&mut h, &data).unwrap();
        assert_eq!(h.get_str("DATASUM").unwrap(), Checksum::of(&data).value().to_string());
        let total = Checksum::of(&h.to_bytes()).combine(Checksum::of(&data));
        assert!(total.is_negative_zero());
        assert!(verify(&h, &data).is_empty());
    }

    #[test]
    fn restamping_a_correct_header_is_a_noop() {
        let data = [9u8; 100];
        let mut h = header();
        stamp(&mut h, &data).unwrap();
        let bytes = h.to_bytes();
        let mut reparsed = Header::parse(&bytes, &Config::default()).unwrap();
        stamp(&mut reparsed, &data).unwrap();
        assert!(!reparsed.is_modified());
    }

    #[test]
    fn corrupted_data_is_reported() {
        let mut data = vec![3u8; 64];
        let mut h = header();
        stamp(&mut h, &data).unwrap();
        data[10] ^= 0xFF;
        let problems = verify(&h, &data);
        assert_eq!(problems.len(), 2);
        assert!(matches!(problems[0], Error::Checksum { keyword: "DATASUM", .. }));
        assert!(matches!(problems[1], Error::Checksum { keyword: "CHECKSUM", .. }));
    }

    #[test]
    fn headers_without_checksums_are_not_checked() {
        assert!(verify(&header(), &[1, 2, 3]).is_empty());
    }
}
