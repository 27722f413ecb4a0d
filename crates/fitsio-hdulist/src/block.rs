//! Block geometry shared by headers, data units and the file backend.
//!
//! Every HDU starts on a 2880-byte boundary. Headers are filled out with
//! blanks and data units with zeros; the backend only moves whole blocks.

use crate::error::{Error, Result};

pub const BLOCK_SIZE: usize = 2880;

/// One header record.
pub const CARD_SIZE: usize = 80;

pub const CARDS_PER_BLOCK: usize = BLOCK_SIZE / CARD_SIZE;

/// Fill after the END card.
pub const HEADER_PAD_BYTE: u8 = b' ';

/// Fill after the last data byte.
pub const DATA_PAD_BYTE: u8 = 0;

/// Bytes on disk for `len` bytes of content: the next block multiple, and
/// zero for an empty data unit.
pub const fn padded_byte_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

pub const fn is_aligned(offset: u64) -> bool {
    offset % BLOCK_SIZE as u64 == 0
}

/// Backend reads and writes start on a block and cover whole blocks.
pub fn check_alignment(offset: u64, len: usize) -> Result<()> {
    if !is_aligned(offset) || len % BLOCK_SIZE != 0 {
        return Err(Error::Alignment { offset, len });
    }
    Ok(())
}

pub fn pad_to_block(buf: &mut Vec<u8>, fill: u8) {
    buf.resize(padded_byte_len(buf.len()), fill);
}
