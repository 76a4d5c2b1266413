use thiserror::Error;

use crate::constants::HEADER_PEEK_LEN;

/// PNG signature followed by the length and type of the mandatory IHDR chunk.
pub const PNG_IHDR_PREFIX: [u8; 16] = [
    0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D', b'R',
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("header too short: {0} bytes")]
    Short(usize),
    #[error("not a png file, mismatched header {}", hex::encode(.0))]
    Mismatch([u8; 16]),
}

/// Declared width and height from the IHDR chunk.
pub fn read_dimensions(buf: &[u8]) -> Result<(u32, u32), FormatError> {
    if buf.len() < HEADER_PEEK_LEN {
        return Err(FormatError::Short(buf.len()));
    }
    if buf[..16] != PNG_IHDR_PREFIX {
        let mut seen = [0u8; 16];
        seen.copy_from_slice(&buf[..16]);
        return Err(FormatError::Mismatch(seen));
    }

    let width = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
    let height = u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]);
    Ok((width, height))
}
