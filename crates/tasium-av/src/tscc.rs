//! TSCC video codec: a 24-bit Microsoft-RLE variant with previous-frame
//! deltas, deflated per packet.
//!
//! Opcodes of the inner coder:
//!
//! | bytes         | meaning                                        |
//! |---------------|------------------------------------------------|
//! | `00 00`       | end of line (end of bitmap on the last row)    |
//! | `00 01`       | end of bitmap                                  |
//! | `00 02 dx dy` | advance the cursor right dx, down dy           |
//! | `N B G R`     | repeat pixel (R,G,B) N times, N >= 1           |

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::dumper::{StreamFormat, VideoCodec, VideoPacket};

/// FourCC "TSCC".
pub const TSCC_FOURCC: u32 = 0x4343_5354;
/// Packet type code "db".
pub const TSCC_TYPECODE: u16 = 0x6264;
/// Index flag marking keyframes.
pub const KEYFRAME_FLAG: u32 = 0x10;

/// Upper bound on bytes one compressor step may emit.
const MAX_STEP: usize = 770;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TsccError {
    #[error("invalid compression level {0} (expected 0-9)")]
    InvalidLevel(u32),
}

/// Greedy scanline coder over bottom-up BGR24 frames.
struct MsrleCompressor<'a> {
    tframe: &'a [u8],
    pframe: Option<&'a [u8]>,
    width: usize,
    height: usize,
    stride: usize,
    x: usize,
    y: usize,
}

impl<'a> MsrleCompressor<'a> {
    fn new(tframe: &'a [u8], pframe: Option<&'a [u8]>, width: usize, height: usize) -> Self {
        Self {
            tframe,
            pframe,
            width,
            height,
            stride: 3 * width,
            x: 0,
            y: 0,
        }
    }

    fn rle(&mut self, buffer: &mut [u8], count: usize, pixel: [u8; 3]) -> usize {
        buffer[0] = count.min(self.width - self.x) as u8;
        buffer[1] = pixel[0];
        buffer[2] = pixel[1];
        buffer[3] = pixel[2];
        self.x += buffer[0] as usize;
        4
    }

    /// Length of the run of identical pixels at `data`, capped at `bound`.
    fn max_run(data: &[u8], bound: usize) -> usize {
        let mut run = 0;
        while run < bound
            && data[0] == data[3 * run]
            && data[1] == data[3 * run + 1]
            && data[2] == data[3 * run + 2]
        {
            run += 1;
        }
        run
    }

    fn end_of_line(&mut self, buffer: &mut [u8]) -> usize {
        buffer[0] = 0;
        buffer[1] = if self.y == self.height - 1 { 1 } else { 0 };
        self.x = 0;
        self.y += 1;
        2
    }

    fn end_of_picture(&mut self, buffer: &mut [u8]) -> usize {
        buffer[0] = 0;
        buffer[1] = 1;
        self.x = 0;
        self.y = self.height;
        2
    }

    fn xy_delta(&mut self, buffer: &mut [u8], newx: usize, newy: usize) -> usize {
        let newx = newx.min(self.x + 255);
        let newy = newy.min(self.y + 255);
        buffer[0] = 0;
        buffer[1] = 2;
        buffer[2] = (newx - self.x) as u8;
        buffer[3] = (newy - self.y) as u8;
        self.x = newx;
        self.y = newy;
        4
    }

    /// Emit the next run of opcodes into `buffer` (at least [`MAX_STEP`]
    /// bytes). Returns 0 once the frame is fully coded.
    fn read(&mut self, buffer: &mut [u8]) -> usize {
        if self.y == self.height {
            return 0;
        }
        if self.x == self.width {
            return self.end_of_line(buffer);
        }
        if let Some(pframe) = self.pframe {
            // Skip over content carried unchanged from the previous frame.
            let mut cptr = self.y * self.stride + 3 * self.x;
            let max_cptr = self.height * self.stride;
            while cptr < max_cptr && self.tframe[cptr] == pframe[cptr] {
                cptr += 1;
            }
            let next_x = (cptr % self.stride) / 3;
            let next_y = cptr / self.stride;
            if next_y == self.height {
                return self.end_of_picture(buffer);
            }
            if next_x >= self.x && next_y > self.y {
                return self.xy_delta(buffer, next_x, next_y);
            }
            if next_y > self.y + 1 {
                let n = self.xy_delta(buffer, self.x, next_y - 1);
                return n + self.end_of_line(&mut buffer[n..]);
            }
            if next_y == self.y + 1 {
                return self.end_of_line(buffer);
            }
            if next_x > self.x {
                return self.xy_delta(buffer, next_x, self.y);
            }
        }
        let data = &self.tframe[self.y * self.stride + 3 * self.x..];
        let pixel = [data[0], data[1], data[2]];
        let runs = Self::max_run(data, 255.min(self.width - self.x));
        if runs > 1 || self.width < self.x + 3 {
            return self.rle(buffer, runs, pixel);
        }
        self.rle(buffer, 1, pixel)
    }
}

/// TSCC compressor state. Emits one packet per input frame; every
/// `keyint + 1` frames the delta chain restarts with a keyframe.
#[derive(Debug)]
pub struct TsccCodec {
    level: u32,
    keyint: u32,
    pframes: u32,
    iwidth: u32,
    iheight: u32,
    ewidth: u32,
    eheight: u32,
    frame: Vec<u8>,
    prev: Vec<u8>,
    out: Option<VideoPacket>,
}

impl TsccCodec {
    pub fn new(level: u32, keyint: u32) -> Result<Self, TsccError> {
        if level > 9 {
            return Err(TsccError::InvalidLevel(level));
        }
        Ok(Self {
            level,
            keyint,
            pframes: u32::MAX,
            iwidth: 0,
            iheight: 0,
            ewidth: 0,
            eheight: 0,
            frame: Vec::new(),
            prev: Vec::new(),
            out: None,
        })
    }
}

impl VideoCodec for TsccCodec {
    fn reset(&mut self, width: u32, height: u32, _fps_n: u32, _fps_d: u32) -> StreamFormat {
        // The next frame has to be a keyframe.
        self.pframes = u32::MAX;
        self.iwidth = width;
        self.iheight = height;
        self.ewidth = (width + 3) & !3;
        self.eheight = (height + 3) & !3;
        let size = 3 * self.ewidth as usize * self.eheight as usize;
        self.frame = vec![0; size];
        self.prev = vec![0; size];
        self.out = None;
        StreamFormat {
            width: self.ewidth,
            height: self.eheight,
            compression: TSCC_FOURCC,
            bit_depth: 24,
        }
    }

    fn frame(&mut self, data: &[u32], stride: u32) {
        let keyframe = if self.pframes >= self.keyint {
            self.pframes = 0;
            true
        } else {
            self.pframes += 1;
            false
        };

        // Convert RGB32 to the codec's bottom-up BGR24 layout. Padding
        // rows above the image stay black.
        let ewidth = self.ewidth as usize;
        for y in (self.eheight - self.iheight) as usize..self.eheight as usize {
            let src_row = self.eheight as usize - y - 1;
            let src = &data[src_row * stride as usize..];
            for i in 0..self.iwidth as usize {
                let px = src[i];
                let off = 3 * (y * ewidth + i);
                self.frame[off] = px as u8;
                self.frame[off + 1] = (px >> 8) as u8;
                self.frame[off + 2] = (px >> 16) as u8;
            }
        }

        let mut compressor = MsrleCompressor::new(
            &self.frame,
            (!keyframe).then_some(&self.prev[..]),
            ewidth,
            self.eheight as usize,
        );
        let mut raw = Vec::new();
        let mut step = [0u8; MAX_STEP];
        loop {
            let n = compressor.read(&mut step);
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&step[..n]);
        }

        let mut z = ZlibEncoder::new(Vec::new(), Compression::new(self.level));
        // Writes into a Vec cannot fail.
        let payload = z
            .write_all(&raw)
            .and_then(|()| z.finish())
            .unwrap_or_default();

        self.prev.copy_from_slice(&self.frame);
        self.out = Some(VideoPacket {
            typecode: TSCC_TYPECODE,
            hidden: false,
            indexflags: if keyframe { KEYFRAME_FLAG } else { 0 },
            payload,
        });
    }

    fn ready(&self) -> bool {
        self.out.is_none()
    }

    fn packet(&mut self) -> Option<VideoPacket> {
        self.out.take()
    }
}
