//! Minimal CARv1 reader for firehose commit blocks.
//!
//! ```text
//! varint(header_len) header
//! ( varint(section_len) cid block_data )*
//! ```

use std::io::Cursor;

use cid::Cid;

#[derive(Debug, thiserror::Error)]
pub enum CarError {
    #[error("truncated varint at offset {0}")]
    Varint(usize),

    #[error("section at offset {offset} overruns the archive ({len} bytes)")]
    Truncated { offset: usize, len: usize },

    #[error("invalid CID: {0}")]
    Cid(#[from] cid::Error),
}

/// One content-addressed block.
#[derive(Debug)]
pub struct Block<'a> {
    pub cid: Cid,
    pub data: &'a [u8],
}

/// Read an unsigned LEB128 varint, returning the value and bytes consumed.
fn read_varint(buf: &[u8], offset: usize) -> Result<(usize, usize), CarError> {
    let mut value: usize = 0;
    for (i, byte) in buf.iter().skip(offset).take(10).enumerate() {
        value |= usize::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(CarError::Varint(offset))
}

/// Split a CAR archive into its blocks. The header is skipped.
pub fn read_blocks(car: &[u8]) -> Result<Vec<Block<'_>>, CarError> {
    let (header_len, n) = read_varint(car, 0)?;
    let mut offset = n + header_len;
    if offset > car.len() {
        return Err(CarError::Truncated {
            offset: 0,
            len: header_len,
        });
    }

    let mut blocks = Vec::new();
    while offset < car.len() {
        let (section_len, n) = read_varint(car, offset)?;
        let start = offset + n;
        let end = start + section_len;
        if end > car.len() {
            return Err(CarError::Truncated {
                offset,
                len: section_len,
            });
        }

        let section = &car[start..end];
        let mut cursor = Cursor::new(section);
        let cid = Cid::read_bytes(&mut cursor)?;
        let cid_len = cursor.position() as usize;

        blocks.push(Block {
            cid,
            data: &section[cid_len..],
        });
        offset = end;
    }
    Ok(blocks)
}
