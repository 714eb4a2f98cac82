use std::io::Read;

use flate2::read::ZlibDecoder;

use super::{
    bits_per_pixel, is_ancillary, PngError, CHUNK_IDAT, CHUNK_IEND, CHUNK_PLTE, CHUNK_TRNS,
    PNG_MAGIC,
};

/// Read as many bytes as the stream yields, tolerating a short final read.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, PngError> {
    let mut done = 0;
    while done < buf.len() {
        let n = reader.read(&mut buf[done..])?;
        if n == 0 {
            break;
        }
        done += n;
    }
    Ok(done)
}

/// CRC-verifying chunk reader.
struct Dechunker<R: Read> {
    reader: R,
    size: u32,
    tag: u32,
    ptr: u32,
    hasher: crc32fast::Hasher,
    eof: bool,
}

impl<R: Read> Dechunker<R> {
    fn new(mut reader: R) -> Result<Self, PngError> {
        let mut magic = [0u8; 8];
        if read_fully(&mut reader, &mut magic)? != 8 || magic != PNG_MAGIC {
            return Err(PngError::NotPng);
        }
        Ok(Self {
            reader,
            size: 0,
            tag: 0,
            ptr: 0,
            hasher: crc32fast::Hasher::new(),
            eof: false,
        })
    }

    fn tag(&self) -> u32 {
        self.tag
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PngError> {
        let limit = buf.len().min((self.size - self.ptr) as usize);
        if limit == 0 {
            return Ok(0);
        }
        if read_fully(&mut self.reader, &mut buf[..limit])? != limit {
            return Err(PngError::Truncated);
        }
        self.hasher.update(&buf[..limit]);
        self.ptr += limit as u32;
        if self.ptr == self.size {
            self.verify_crc()?;
        }
        Ok(limit)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), PngError> {
        if self.read(buf)? != buf.len() {
            return Err(PngError::Truncated);
        }
        Ok(())
    }

    /// Advance to the next chunk, draining whatever is left of the current
    /// one. Returns false at end of stream.
    fn next_chunk(&mut self) -> Result<bool, PngError> {
        if self.eof {
            return Ok(false);
        }
        let mut scratch = [0u8; 256];
        while self.ptr < self.size {
            self.read(&mut scratch)?;
        }
        let mut header = [0u8; 8];
        let got = read_fully(&mut self.reader, &mut header)?;
        if got == 0 {
            self.eof = true;
            self.size = 0;
            self.tag = 0;
            self.ptr = 0;
            return Ok(false);
        }
        if got != 8 {
            return Err(PngError::Truncated);
        }
        self.size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        self.tag = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        self.ptr = 0;
        self.hasher = crc32fast::Hasher::new();
        self.hasher.update(&header[4..]);
        if self.size == 0 {
            self.verify_crc()?;
        }
        Ok(true)
    }

    fn verify_crc(&mut self) -> Result<(), PngError> {
        let mut crc = [0u8; 4];
        if read_fully(&mut self.reader, &mut crc)? != 4 {
            return Err(PngError::Truncated);
        }
        let claimed = u32::from_be_bytes(crc);
        let actual = std::mem::take(&mut self.hasher).finalize();
        if claimed != actual {
            return Err(PngError::ChunkCrcFail);
        }
        Ok(())
    }
}

struct Ihdr {
    width: usize,
    height: usize,
    depth: u8,
    color_type: u8,
    interlace: u8,
}

impl Ihdr {
    fn parse(chunks: &mut Dechunker<impl Read>) -> Result<Self, PngError> {
        if chunks.tag() != super::CHUNK_IHDR {
            return Err(PngError::Malformed("expected IHDR chunk"));
        }
        if chunks.size() != 13 {
            return Err(PngError::Malformed("IHDR must be 13 bytes"));
        }
        let mut buf = [0u8; 13];
        chunks.read_exact(&mut buf)?;
        let width = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let height = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let hdr = Self {
            width,
            height,
            depth: buf[8],
            color_type: buf[9],
            interlace: buf[12],
        };
        if width == 0 || height == 0 {
            return Err(PngError::ZeroDimension);
        }
        bits_per_pixel(hdr.color_type, hdr.depth)?;
        if buf[10] != 0 {
            return Err(PngError::UnsupportedCompression(buf[10]));
        }
        if buf[11] != 0 {
            return Err(PngError::UnsupportedFilterMethod(buf[11]));
        }
        if hdr.interlace > 1 {
            return Err(PngError::UnsupportedInterlace(hdr.interlace));
        }
        Ok(hdr)
    }
}

/// One interlace pass: `x = xoff + k * xmod`, `y = yoff + k * ymod`.
#[derive(Clone, Copy)]
struct Pass {
    xoff: usize,
    xmod: usize,
    yoff: usize,
    ymod: usize,
}

const PROGRESSIVE: [Pass; 1] = [Pass {
    xoff: 0,
    xmod: 1,
    yoff: 0,
    ymod: 1,
}];

const ADAM7: [Pass; 7] = [
    Pass { xoff: 0, xmod: 8, yoff: 0, ymod: 8 },
    Pass { xoff: 4, xmod: 8, yoff: 0, ymod: 8 },
    Pass { xoff: 0, xmod: 4, yoff: 4, ymod: 8 },
    Pass { xoff: 2, xmod: 4, yoff: 0, ymod: 4 },
    Pass { xoff: 0, xmod: 2, yoff: 2, ymod: 4 },
    Pass { xoff: 1, xmod: 2, yoff: 0, ymod: 2 },
    Pass { xoff: 0, xmod: 1, yoff: 1, ymod: 2 },
];

impl Pass {
    fn size(&self, width: usize, height: usize) -> (usize, usize) {
        let w = (width + self.xmod - self.xoff - 1) / self.xmod;
        let h = (height + self.ymod - self.yoff - 1) / self.ymod;
        if w == 0 || h == 0 { (0, 0) } else { (w, h) }
    }
}

fn paeth(left: u8, up: u8, upleft: u8) -> u8 {
    let p = up as i16 + left as i16 - upleft as i16;
    let pa = (p - left as i16).abs();
    let pb = (p - up as i16).abs();
    let pc = (p - upleft as i16).abs();
    if pa <= pb && pa <= pc {
        left
    } else if pb <= pc {
        up
    } else {
        upleft
    }
}

/// Reverse one scanline filter. Predictors work bytewise with the given
/// pitch.
fn unfilter(
    filter: u8,
    src: &[u8],
    above: &[u8],
    out: &mut [u8],
    pitch: usize,
) -> Result<(), PngError> {
    if filter > 4 {
        return Err(PngError::BadFilter(filter));
    }
    let predict = |left: u8, up: u8, upleft: u8| -> u8 {
        match filter {
            0 => 0,
            1 => left,
            2 => up,
            3 => (left >> 1).wrapping_add(up >> 1).wrapping_add(left & up & 1),
            _ => paeth(left, up, upleft),
        }
    };
    for i in 0..out.len() {
        let (left, upleft) = if i < pitch {
            (0, 0)
        } else {
            (out[i - pitch], above[i - pitch])
        };
        out[i] = src[i].wrapping_add(predict(left, above[i], upleft));
    }
    Ok(())
}

/// Extract one sample of `depth` bits at pixel index `x` of a packed row.
fn sample(row: &[u8], x: usize, depth: u8) -> u16 {
    match depth {
        1 => ((row[x >> 3] >> (7 - (x & 7))) & 1) as u16,
        2 => ((row[x >> 2] >> (6 - 2 * (x & 3))) & 3) as u16,
        4 => ((row[x >> 1] >> (4 - 4 * (x & 1))) & 15) as u16,
        8 => row[x] as u16,
        _ => u16::from_be_bytes([row[2 * x], row[2 * x + 1]]),
    }
}

fn decode_pixel(color_type: u8, depth: u8, row: &[u8], x: usize, trans: Option<&[u8]>) -> u32 {
    match color_type {
        0 => {
            let v = sample(row, x, depth);
            let (mul, shift) = match depth {
                1 => (0x00FF_FFFF, 0),
                2 => (0x0055_5555, 0),
                4 => (0x0011_1111, 0),
                8 => (0x0001_0101, 0),
                _ => (0x0001_0101, 8),
            };
            let alpha = match trans {
                Some(t) if v == u16::from_be_bytes([t[0], t[1]]) => 0,
                _ => 0xFF00_0000,
            };
            alpha | mul * (v >> shift) as u32
        }
        2 => {
            let (r, g, b, keyed) = if depth == 8 {
                let p = &row[3 * x..];
                let keyed = trans
                    .is_some_and(|t| p[0] == t[1] && p[1] == t[3] && p[2] == t[5]);
                (p[0], p[1], p[2], keyed)
            } else {
                let p = &row[6 * x..];
                let keyed = trans.is_some_and(|t| &p[..6] == t);
                (p[0], p[2], p[4], keyed)
            };
            let alpha = if keyed { 0 } else { 0xFF00_0000 };
            alpha | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
        }
        3 => sample(row, x, depth) as u32,
        4 => {
            let (gray, alpha) = if depth == 8 {
                (row[2 * x], row[2 * x + 1])
            } else {
                (row[4 * x], row[4 * x + 2])
            };
            ((alpha as u32) << 24) | 0x0001_0101 * gray as u32
        }
        _ => {
            let (r, g, b, a) = if depth == 8 {
                let p = &row[4 * x..];
                (p[0], p[1], p[2], p[3])
            } else {
                let p = &row[8 * x..];
                (p[0], p[2], p[4], p[6])
            };
            ((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | b as u32
        }
    }
}

/// A decoded PNG image.
pub struct Decoder {
    pub width: usize,
    pub height: usize,
    pub has_palette: bool,
    /// ARGB pixels, or raw palette indices for paletted images.
    pub data: Vec<u32>,
    /// ARGB palette entries (empty unless paletted).
    pub palette: Vec<u32>,
}

impl Decoder {
    pub fn decode(reader: impl Read) -> Result<Self, PngError> {
        let mut chunks = Dechunker::new(reader)?;
        if !chunks.next_chunk()? {
            return Err(PngError::Malformed("PNG file has no chunks"));
        }
        let hdr = Ihdr::parse(&mut chunks)?;

        let mut palette = if hdr.color_type == 3 {
            vec![0xFF00_0000u32; 1usize << hdr.depth]
        } else {
            Vec::new()
        };
        let mut trans_buf = [0u8; 6];
        let mut have_trans = false;
        let mut idat = Vec::new();
        let mut seen_idat = false;

        loop {
            if !chunks.next_chunk()? {
                break;
            }
            match chunks.tag() {
                CHUNK_IEND => break,
                CHUNK_PLTE => {
                    if seen_idat {
                        return Err(PngError::Malformed("PLTE not allowed after image data"));
                    }
                    match hdr.color_type {
                        0 | 4 => {
                            return Err(PngError::Malformed("PLTE illegal for grayscale"));
                        }
                        // Advisory for truecolor; drained by next_chunk.
                        2 | 6 => {}
                        _ => {
                            if chunks.size() as usize > 3 * palette.len() {
                                return Err(PngError::Malformed("PLTE too large"));
                            }
                            let entries = chunks.size() as usize / 3;
                            for entry in palette.iter_mut().take(entries) {
                                let mut rgb = [0u8; 3];
                                chunks.read_exact(&mut rgb)?;
                                *entry = (*entry & 0xFF00_0000)
                                    | ((rgb[0] as u32) << 16)
                                    | ((rgb[1] as u32) << 8)
                                    | rgb[2] as u32;
                            }
                        }
                    }
                }
                CHUNK_TRNS => {
                    match hdr.color_type {
                        4 | 6 => {
                            return Err(PngError::Malformed("tRNS illegal with alpha channel"));
                        }
                        0 => {
                            if chunks.size() != 2 {
                                return Err(PngError::Malformed("tRNS for type 0 must be 2 bytes"));
                            }
                            chunks.read_exact(&mut trans_buf[..2])?;
                        }
                        2 => {
                            if chunks.size() != 6 {
                                return Err(PngError::Malformed("tRNS for type 2 must be 6 bytes"));
                            }
                            chunks.read_exact(&mut trans_buf[..6])?;
                        }
                        _ => {
                            if chunks.size() as usize > palette.len() {
                                return Err(PngError::Malformed("tRNS too large"));
                            }
                            let entries = chunks.size() as usize;
                            for entry in palette.iter_mut().take(entries) {
                                let mut alpha = [0u8; 1];
                                chunks.read_exact(&mut alpha)?;
                                *entry = (*entry & 0x00FF_FFFF) | ((alpha[0] as u32) << 24);
                            }
                        }
                    }
                    have_trans = true;
                }
                CHUNK_IDAT => {
                    seen_idat = true;
                    let start = idat.len();
                    idat.resize(start + chunks.size() as usize, 0);
                    chunks.read_exact(&mut idat[start..])?;
                }
                tag if is_ancillary(tag) => {}
                tag => return Err(PngError::UnknownCritical(tag)),
            }
        }

        let mut raw = Vec::new();
        ZlibDecoder::new(&idat[..])
            .read_to_end(&mut raw)
            .map_err(|_| PngError::BadIdat)?;

        let bits = bits_per_pixel(hdr.color_type, hdr.depth)?;
        let pitch = if bits >= 8 { bits / 8 } else { 1 };
        let trans = have_trans.then_some(&trans_buf[..]);
        let mut data = vec![0u32; hdr.width * hdr.height];
        let passes: &[Pass] = if hdr.interlace == 0 { &PROGRESSIVE } else { &ADAM7 };

        let mut pos = 0usize;
        for pass in passes {
            let (pw, ph) = pass.size(hdr.width, hdr.height);
            if pw == 0 || ph == 0 {
                continue;
            }
            let rowbytes = (bits * pw + 7) / 8;
            let mut above = vec![0u8; rowbytes];
            let mut row = vec![0u8; rowbytes];
            for y in 0..ph {
                if pos + 1 + rowbytes > raw.len() {
                    return Err(PngError::Truncated);
                }
                let filter = raw[pos];
                pos += 1;
                unfilter(filter, &raw[pos..pos + rowbytes], &above, &mut row, pitch)?;
                pos += rowbytes;
                let line = pass.yoff + y * pass.ymod;
                for x in 0..pw {
                    data[line * hdr.width + pass.xoff + x * pass.xmod] =
                        decode_pixel(hdr.color_type, hdr.depth, &row, x, trans);
                }
                above.copy_from_slice(&row);
            }
        }

        Ok(Self {
            width: hdr.width,
            height: hdr.height,
            has_palette: hdr.color_type == 3,
            data,
            palette: if hdr.color_type == 3 { palette } else { Vec::new() },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use flate2::write::ZlibEncoder;
    use flate2::Compression;

    use super::super::{write_chunk, CHUNK_IHDR};
    use super::*;

    fn ihdr_payload(w: u32, h: u32, depth: u8, color_type: u8, interlace: u8) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&w.to_be_bytes());
        p.extend_from_slice(&h.to_be_bytes());
        p.extend_from_slice(&[depth, color_type, 0, 0, interlace]);
        p
    }

    fn deflate(raw: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(raw).unwrap();
        enc.finish().unwrap()
    }

    fn build_png(chunks: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut out = PNG_MAGIC.to_vec();
        for (tag, payload) in chunks {
            write_chunk(&mut out, *tag, payload).unwrap();
        }
        out
    }

    #[test]
    fn grayscale_filters_sub_and_up() {
        // 3x2 gray8: row 1 filtered with Sub, row 2 with Up.
        let raw = [1u8, 10, 10, 10, 2, 5, 5, 5];
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(3, 2, 8, 0, 0)),
            (CHUNK_IDAT, deflate(&raw)),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        assert_eq!(img.width, 3);
        assert_eq!(img.height, 2);
        let gray = |v: u32| 0xFF00_0000 | 0x0001_0101 * v;
        assert_eq!(img.data[..3], [gray(10), gray(20), gray(30)]);
        assert_eq!(img.data[3..], [gray(15), gray(25), gray(35)]);
    }

    #[test]
    fn grayscale_average_and_paeth() {
        let raw = [3u8, 100, 100, 4, 10, 20];
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(2, 2, 8, 0, 0)),
            (CHUNK_IDAT, deflate(&raw)),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        let v = |p: u32| p & 0xFF;
        // Average row: 100 + 0/2 = 100, then 100 + 100/2 = 150.
        assert_eq!(v(img.data[0]), 100);
        assert_eq!(v(img.data[1]), 150);
        // Paeth row: predictors are up=100 then max(left, up, upleft) rules.
        assert_eq!(v(img.data[2]), 110);
        assert_eq!(v(img.data[3]), 170);
    }

    #[test]
    fn one_bit_grayscale_packs_msb_first() {
        // 8x1, bits 1011_0001.
        let raw = [0u8, 0b1011_0001];
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(8, 1, 1, 0, 0)),
            (CHUNK_IDAT, deflate(&raw)),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        let bits: Vec<u32> = img.data.iter().map(|&p| p & 1).collect();
        assert_eq!(bits, [1, 0, 1, 1, 0, 0, 0, 1]);
        assert_eq!(img.data[0], 0xFFFF_FFFF);
        assert_eq!(img.data[1], 0xFF00_0000);
    }

    #[test]
    fn color_key_transparency() {
        // 2x1 rgb8 with color key on the second pixel.
        let raw = [0u8, 1, 2, 3, 9, 8, 7];
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(2, 1, 8, 2, 0)),
            (CHUNK_TRNS, vec![0, 9, 0, 8, 0, 7]),
            (CHUNK_IDAT, deflate(&raw)),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        assert_eq!(img.data[0], 0xFF01_0203);
        assert_eq!(img.data[1], 0x0009_0807);
    }

    #[test]
    fn adam7_interlace_reassembles() {
        // 2x2 gray8, Adam7: pass 1 = (0,0), pass 6 = (1,0), pass 7 = row 1.
        let raw = [0u8, 11, 0, 22, 0, 33, 44];
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(2, 2, 8, 0, 1)),
            (CHUNK_IDAT, deflate(&raw)),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        let v: Vec<u32> = img.data.iter().map(|&p| p & 0xFF).collect();
        assert_eq!(v, [11, 22, 33, 44]);
    }

    #[test]
    fn idat_may_be_split() {
        let raw = [0u8, 10, 20, 30];
        let z = deflate(&raw);
        let (a, b) = z.split_at(z.len() / 2);
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(3, 1, 8, 0, 0)),
            (CHUNK_IDAT, a.to_vec()),
            (CHUNK_IDAT, b.to_vec()),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        assert_eq!(img.data.len(), 3);
        assert_eq!(img.data[2] & 0xFF, 30);
    }

    #[test]
    fn bad_magic_and_bad_crc() {
        assert!(matches!(
            Decoder::decode(&b"notapngfile!"[..]),
            Err(PngError::NotPng)
        ));

        let mut png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(1, 1, 8, 0, 0)),
            (CHUNK_IDAT, deflate(&[0, 0])),
            (CHUNK_IEND, Vec::new()),
        ]);
        // Corrupt a payload byte of the IHDR without touching its CRC.
        png[8 + 8] ^= 0x40;
        assert!(matches!(
            Decoder::decode(&png[..]),
            Err(PngError::ChunkCrcFail)
        ));
    }

    #[test]
    fn zero_dimension_rejected() {
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(0, 4, 8, 0, 0)),
            (CHUNK_IEND, Vec::new()),
        ]);
        assert!(matches!(
            Decoder::decode(&png[..]),
            Err(PngError::ZeroDimension)
        ));
    }

    #[test]
    fn unknown_critical_chunk_rejected() {
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(1, 1, 8, 0, 0)),
            (u32::from_be_bytes(*b"CRIT"), vec![1, 2, 3]),
            (CHUNK_IDAT, deflate(&[0, 0])),
            (CHUNK_IEND, Vec::new()),
        ]);
        assert!(matches!(
            Decoder::decode(&png[..]),
            Err(PngError::UnknownCritical(_))
        ));
    }

    #[test]
    fn unknown_ancillary_chunk_skipped() {
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(1, 1, 8, 0, 0)),
            (u32::from_be_bytes(*b"teXt"), b"hello".to_vec()),
            (CHUNK_IDAT, deflate(&[0, 77])),
            (CHUNK_IEND, Vec::new()),
        ]);
        let img = Decoder::decode(&png[..]).unwrap();
        assert_eq!(img.data[0] & 0xFF, 77);
    }

    #[test]
    fn plte_after_idat_rejected() {
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(1, 1, 2, 3, 0)),
            (CHUNK_PLTE, vec![1, 2, 3]),
            (CHUNK_IDAT, deflate(&[0, 0])),
            (CHUNK_PLTE, vec![4, 5, 6]),
            (CHUNK_IEND, Vec::new()),
        ]);
        assert!(matches!(
            Decoder::decode(&png[..]),
            Err(PngError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_image_data_rejected() {
        let png = build_png(&[
            (CHUNK_IHDR, ihdr_payload(4, 4, 8, 0, 0)),
            (CHUNK_IDAT, deflate(&[0, 1, 2, 3, 4])),
            (CHUNK_IEND, Vec::new()),
        ]);
        assert!(matches!(
            Decoder::decode(&png[..]),
            Err(PngError::Truncated)
        ));
    }
}
