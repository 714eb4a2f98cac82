//! PNG codec: a full decoder for color types 0/2/3/4/6 (filter bank 0,
//! progressive or Adam7 interlace) and an encoder producing paletted or
//! RGB(A) images with a single zlib IDAT.
//!
//! Pixels are 32-bit ARGB. Paletted images keep raw palette indices in
//! `data` with the ARGB entries in `palette`.

mod decoder;
mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;

use thiserror::Error;

pub(crate) const PNG_MAGIC: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

pub(crate) const CHUNK_IHDR: u32 = 0x4948_4452;
pub(crate) const CHUNK_PLTE: u32 = 0x504C_5445;
pub(crate) const CHUNK_TRNS: u32 = 0x7452_4E53;
pub(crate) const CHUNK_IDAT: u32 = 0x4944_4154;
pub(crate) const CHUNK_IEND: u32 = 0x4945_4E44;

/// Ancillary chunks have the lowercase bit of the first tag letter set.
pub(crate) fn is_ancillary(tag: u32) -> bool {
    tag & 0x2000_0000 != 0
}

fn fourcc(tag: &u32) -> String {
    tag.to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                b as char
            } else {
                '?'
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum PngError {
    #[error("not a PNG file")]
    NotPng,
    #[error("chunk CRC check failed")]
    ChunkCrcFail,
    #[error("unknown critical chunk {}", fourcc(.0))]
    UnknownCritical(u32),
    #[error("image has zero width or height")]
    ZeroDimension,
    #[error("PNG file truncated")]
    Truncated,
    #[error("unsupported color type {color_type} at depth {depth}")]
    UnsupportedColor { color_type: u8, depth: u8 },
    #[error("unsupported compression method {0}")]
    UnsupportedCompression(u8),
    #[error("unsupported filter method {0}")]
    UnsupportedFilterMethod(u8),
    #[error("unknown interlace type {0}")]
    UnsupportedInterlace(u8),
    #[error("unknown scanline filter {0}")]
    BadFilter(u8),
    #[error("IDAT stream corrupt")]
    BadIdat,
    #[error("{0}")]
    Malformed(&'static str),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Smallest PNG bit depth able to index a palette of the given size.
pub(crate) fn size_to_bits(size: usize) -> u8 {
    if size > 256 {
        16
    } else if size > 16 {
        8
    } else if size > 4 {
        4
    } else if size > 2 {
        2
    } else {
        1
    }
}

/// Write one chunk: big-endian length, tag, payload and the CRC-32 of
/// (tag, payload).
pub(crate) fn write_chunk(
    out: &mut impl std::io::Write,
    tag: u32,
    payload: &[u8],
) -> Result<(), PngError> {
    out.write_all(&(payload.len() as u32).to_be_bytes())?;
    let tag_bytes = tag.to_be_bytes();
    out.write_all(&tag_bytes)?;
    out.write_all(payload)?;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&tag_bytes);
    hasher.update(payload);
    out.write_all(&hasher.finalize().to_be_bytes())?;
    Ok(())
}

/// Bits per pixel for a (color type, depth) pair; errors on combinations
/// PNG does not define.
pub(crate) fn bits_per_pixel(color_type: u8, depth: u8) -> Result<usize, PngError> {
    let channels: usize = match color_type {
        0 | 3 => 1,
        2 => 3,
        4 => 2,
        6 => 4,
        _ => {
            return Err(PngError::UnsupportedColor { color_type, depth });
        }
    };
    let depth_ok = match color_type {
        0 | 3 => matches!(depth, 1 | 2 | 4 | 8 | 16),
        _ => matches!(depth, 8 | 16),
    };
    if !depth_ok {
        return Err(PngError::UnsupportedColor { color_type, depth });
    }
    Ok(channels * depth as usize)
}
