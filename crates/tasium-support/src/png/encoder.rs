use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;

use super::{
    size_to_bits, write_chunk, PngError, CHUNK_IDAT, CHUNK_IEND, CHUNK_IHDR, CHUNK_PLTE,
    CHUNK_TRNS, PNG_MAGIC,
};

fn pack_row(out: &mut Vec<u8>, row: &[u32], bits: u8) {
    match bits {
        1 => {
            let base = out.len();
            out.resize(base + row.len().div_ceil(8), 0);
            for (i, px) in row.iter().enumerate() {
                out[base + (i >> 3)] |= ((px & 1) as u8) << (7 - i % 8);
            }
        }
        2 => {
            let base = out.len();
            out.resize(base + row.len().div_ceil(4), 0);
            for (i, px) in row.iter().enumerate() {
                out[base + (i >> 2)] |= ((px & 3) as u8) << (2 * (3 - i % 4));
            }
        }
        4 => {
            let base = out.len();
            out.resize(base + row.len().div_ceil(2), 0);
            for (i, px) in row.iter().enumerate() {
                out[base + (i >> 1)] |= ((px & 15) as u8) << (4 * (1 - i % 2));
            }
        }
        8 => out.extend(row.iter().map(|&px| px as u8)),
        _ => {
            for px in row {
                out.extend_from_slice(&(*px as u16).to_be_bytes());
            }
        }
    }
}

/// An image to be written as PNG. Pixels are ARGB, or palette indices when
/// `has_palette` is set (`has_alpha` then emits a tRNS with the palette's
/// alpha bytes; otherwise it selects RGBA over RGB output).
#[derive(Default)]
pub struct Encoder {
    pub width: usize,
    pub height: usize,
    pub has_palette: bool,
    pub has_alpha: bool,
    pub data: Vec<u32>,
    pub palette: Vec<u32>,
}

impl Encoder {
    pub fn encode(&self, mut out: impl Write) -> Result<(), PngError> {
        let pbits = size_to_bits(self.palette.len());
        out.write_all(&PNG_MAGIC)?;

        let mut ihdr = Vec::with_capacity(13);
        ihdr.extend_from_slice(&(self.width as u32).to_be_bytes());
        ihdr.extend_from_slice(&(self.height as u32).to_be_bytes());
        ihdr.push(if self.has_palette { pbits } else { 8 });
        ihdr.push(if self.has_palette {
            3
        } else if self.has_alpha {
            6
        } else {
            2
        });
        ihdr.extend_from_slice(&[0, 0, 0]);
        write_chunk(&mut out, CHUNK_IHDR, &ihdr)?;

        if self.has_palette {
            let mut plte = Vec::with_capacity(3 * self.palette.len());
            for color in &self.palette {
                plte.push((color >> 16) as u8);
                plte.push((color >> 8) as u8);
                plte.push(*color as u8);
            }
            write_chunk(&mut out, CHUNK_PLTE, &plte)?;
            if self.has_alpha {
                let trns: Vec<u8> = self.palette.iter().map(|c| (c >> 24) as u8).collect();
                write_chunk(&mut out, CHUNK_TRNS, &trns)?;
            }
        }

        let mut z = ZlibEncoder::new(Vec::new(), Compression::default());
        let mut rowbuf = Vec::new();
        for y in 0..self.height {
            rowbuf.clear();
            rowbuf.push(0); // Filter: none.
            let row = &self.data[self.width * y..self.width * (y + 1)];
            if self.has_palette {
                pack_row(&mut rowbuf, row, pbits);
            } else if self.has_alpha {
                for px in row {
                    rowbuf.extend_from_slice(&[
                        (px >> 16) as u8,
                        (px >> 8) as u8,
                        *px as u8,
                        (px >> 24) as u8,
                    ]);
                }
            } else {
                for px in row {
                    rowbuf.extend_from_slice(&[(px >> 16) as u8, (px >> 8) as u8, *px as u8]);
                }
            }
            z.write_all(&rowbuf)?;
        }
        let idat = z.finish()?;
        write_chunk(&mut out, CHUNK_IDAT, &idat)?;
        write_chunk(&mut out, CHUNK_IEND, &[])?;
        Ok(())
    }
}
