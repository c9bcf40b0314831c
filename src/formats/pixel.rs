//! Per-format pixel transcoding.
//!
//! SilverDB stores raw color data in BGRA order. The greyscale and RGB565
//! variants pad rows up to their packed row length, so the decoded grid can
//! be wider than the nominal image width; callers crop the trailing columns
//! (see `data_width` on [`Decoded`]).

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::io::{self, Cursor};

use image::{Rgba, RgbaImage};
use twox_hash::XxHash64;

use crate::binary_utils::{read_bytes, read_u16_le, read_u32_le, read_u8};
use crate::formats::SilverError;

/// Pixel format variants understood by the codec, keyed by the `u16` tag
/// stored in each entry header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit color, stored as B,G,R,A per pixel.
    Rgba8888,
    /// 4-bit greyscale, two samples per byte, high nibble first.
    Grey4,
    /// 8-bit greyscale.
    Grey8,
    /// 16-bit color, 5/6/5 bit split, little-endian words.
    Rgb565,
    /// Indexed color, up to 255 palette entries, 1-byte indices.
    Palette8,
    /// Indexed color, up to 65535 palette entries, 2-byte indices.
    Palette16,
}

impl PixelFormat {
    pub fn from_tag(tag: u16) -> Option<Self> {
        match tag {
            0x1888 => Some(PixelFormat::Rgba8888),
            0x0004 => Some(PixelFormat::Grey4),
            0x0008 => Some(PixelFormat::Grey8),
            0x0565 => Some(PixelFormat::Rgb565),
            0x0064 => Some(PixelFormat::Palette8),
            0x0065 => Some(PixelFormat::Palette16),
            _ => None,
        }
    }

    pub fn tag(self) -> u16 {
        match self {
            PixelFormat::Rgba8888 => 0x1888,
            PixelFormat::Grey4 => 0x0004,
            PixelFormat::Grey8 => 0x0008,
            PixelFormat::Rgb565 => 0x0565,
            PixelFormat::Palette8 => 0x0064,
            PixelFormat::Palette16 => 0x0065,
        }
    }

    /// The `flags` header field observed for each format. Fully determined
    /// by the tag in every database seen so far; written on encode, ignored
    /// on decode.
    pub fn flags(self) -> u16 {
        match self {
            PixelFormat::Rgba8888 => 0x0020,
            PixelFormat::Grey4 => 0x0004,
            PixelFormat::Grey8 => 0x0008,
            PixelFormat::Rgb565 => 0x0010,
            PixelFormat::Palette8 => 0x0008,
            PixelFormat::Palette16 => 0x0010,
        }
    }

    /// Packed bytes per row for an image of the given width.
    pub fn row_length(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgba8888 => width * 4,
            PixelFormat::Grey4 => width.div_ceil(2),
            PixelFormat::Grey8 => width,
            PixelFormat::Rgb565 => width * 2,
            PixelFormat::Palette8 => width,
            PixelFormat::Palette16 => width * 2,
        }
    }

    /// Maximum distinct colors an indexed format can reference.
    fn palette_capacity(self) -> usize {
        match self {
            PixelFormat::Palette8 => 0xFF,
            PixelFormat::Palette16 => 0xFFFF,
            _ => 0,
        }
    }
}

/// Result of decoding one payload. `data_width` is derived from the packed
/// row length and can exceed the nominal width; the image is that wide.
pub struct Decoded {
    pub image: RgbaImage,
    pub data_width: u32,
}

/// ITU-R 601 luminance with integer weights. Exact for grey input
/// (r == g == b), which keeps greyscale round trips lossless.
fn luminance(pixel: &Rgba<u8>) -> u8 {
    let [r, g, b, _] = pixel.0;
    ((r as u32 * 19595 + g as u32 * 38470 + b as u32 * 7471 + 0x8000) >> 16) as u8
}

fn pack_565(pixel: &Rgba<u8>) -> u16 {
    let r = 31 * pixel[0] as u32 / 255;
    let g = 63 * pixel[1] as u32 / 255;
    let b = 31 * pixel[2] as u32 / 255;
    ((((r << 6) + g) << 5) + b) as u16
}

fn unpack_565(value: u16) -> Rgba<u8> {
    // Round to nearest when expanding back to 8 bits.
    fn expand(channel: u32, max: u32) -> u8 {
        ((channel * 255 + max / 2) / max) as u8
    }
    let r = expand((value >> 11) as u32 & 0x1F, 0x1F);
    let g = expand((value >> 5) as u32 & 0x3F, 0x3F);
    let b = expand(value as u32 & 0x1F, 0x1F);
    Rgba([r, g, b, 255])
}

fn push_bgra(out: &mut Vec<u8>, pixel: &Rgba<u8>) {
    let [r, g, b, a] = pixel.0;
    out.extend_from_slice(&[b, g, r, a]);
}

fn read_bgra(cursor: &mut Cursor<&[u8]>) -> io::Result<Rgba<u8>> {
    let raw = read_bytes(cursor, 4)?;
    Ok(Rgba([raw[2], raw[1], raw[0], raw[3]]))
}

/// Encode an image's pixels into the packed payload for `format`.
/// `id` only feeds error reporting.
pub fn encode(format: PixelFormat, image: &RgbaImage, id: u32) -> Result<Vec<u8>, SilverError> {
    let (width, height) = image.dimensions();

    match format {
        PixelFormat::Rgba8888 => {
            let mut out = Vec::with_capacity((width * height * 4) as usize);
            for pixel in image.pixels() {
                push_bgra(&mut out, pixel);
            }
            Ok(out)
        }
        PixelFormat::Grey4 => {
            let row_length = format.row_length(width) as usize;
            let mut out = Vec::with_capacity(row_length * height as usize);
            for y in 0..height {
                let mut row: Vec<u8> = (0..width)
                    .map(|x| luminance(image.get_pixel(x, y)))
                    .collect();
                if row.len() % 2 != 0 {
                    // Odd widths get one synthetic black sample so every
                    // byte holds a full nibble pair.
                    row.push(0);
                }
                for pair in row.chunks_exact(2) {
                    out.push(((pair[0] / 17) << 4) | (pair[1] / 17));
                }
            }
            Ok(out)
        }
        PixelFormat::Grey8 => Ok(image.pixels().map(luminance).collect()),
        PixelFormat::Rgb565 => {
            let mut out = Vec::with_capacity((width * height * 2) as usize);
            for pixel in image.pixels() {
                out.extend_from_slice(&pack_565(pixel).to_le_bytes());
            }
            Ok(out)
        }
        PixelFormat::Palette8 | PixelFormat::Palette16 => encode_paletted(format, image, id),
    }
}

fn encode_paletted(
    format: PixelFormat,
    image: &RgbaImage,
    id: u32,
) -> Result<Vec<u8>, SilverError> {
    // First-occurrence order: the index a color gets is part of the
    // encoded output, so the palette must be insertion-ordered.
    let mut palette: Vec<Rgba<u8>> = Vec::new();
    let mut index_of: HashMap<[u8; 4], usize, BuildHasherDefault<XxHash64>> =
        HashMap::default();
    for pixel in image.pixels() {
        if !index_of.contains_key(&pixel.0) {
            index_of.insert(pixel.0, palette.len());
            palette.push(*pixel);
        }
    }

    let capacity = format.palette_capacity();
    if palette.len() > capacity {
        return Err(SilverError::PaletteOverflow {
            id,
            colors: palette.len(),
            max: capacity,
        });
    }

    let index_width = if format == PixelFormat::Palette8 { 1 } else { 2 };
    let mut out = Vec::with_capacity(4 + palette.len() * 4 + image.len() / 4 * index_width);
    out.extend_from_slice(&(palette.len() as u32).to_le_bytes());
    for color in &palette {
        push_bgra(&mut out, color);
    }
    for pixel in image.pixels() {
        let index = index_of[&pixel.0];
        if index_width == 1 {
            out.push(index as u8);
        } else {
            out.extend_from_slice(&(index as u16).to_le_bytes());
        }
    }
    Ok(out)
}

/// Decode a packed payload back into an RGBA grid. The returned image is
/// `data_width` pixels wide; crop to the nominal width before saving.
pub fn decode(
    format: PixelFormat,
    data: &[u8],
    _width: u32,
    height: u32,
    row_length: u32,
) -> Result<Decoded, SilverError> {
    // Every format packs at least row_length bytes per row, so header
    // dimensions a payload cannot hold are rejected before any pixel
    // arithmetic; the widened counts below then stay within bounds.
    let packed_len = row_length as u64 * height as u64;
    if packed_len > data.len() as u64 {
        return Err(SilverError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "payload of {} byte(s) cannot hold {} row(s) of {} byte(s)",
                data.len(),
                height,
                row_length
            ),
        )));
    }

    let mut cursor = Cursor::new(data);

    let (data_width, pixels) = match format {
        PixelFormat::Rgba8888 => {
            let data_width = row_length / 4;
            let count = data_width as u64 * height as u64;
            let mut pixels = Vec::with_capacity(count as usize);
            for _ in 0..count {
                pixels.push(read_bgra(&mut cursor)?);
            }
            (data_width, pixels)
        }
        PixelFormat::Grey4 => {
            let data_width = row_length * 2;
            let mut pixels = Vec::with_capacity((packed_len * 2) as usize);
            for _ in 0..packed_len {
                let byte = read_u8(&mut cursor)?;
                for value in [17 * (byte >> 4), 17 * (byte & 0x0F)] {
                    pixels.push(Rgba([value, value, value, 255]));
                }
            }
            (data_width, pixels)
        }
        PixelFormat::Grey8 => {
            let mut pixels = Vec::with_capacity(packed_len as usize);
            for _ in 0..packed_len {
                let value = read_u8(&mut cursor)?;
                pixels.push(Rgba([value, value, value, 255]));
            }
            (row_length, pixels)
        }
        PixelFormat::Rgb565 => {
            let data_width = row_length / 2;
            let count = data_width as u64 * height as u64;
            let mut pixels = Vec::with_capacity(count as usize);
            for _ in 0..count {
                pixels.push(unpack_565(read_u16_le(&mut cursor)?));
            }
            (data_width, pixels)
        }
        PixelFormat::Palette8 | PixelFormat::Palette16 => {
            let index_width = if format == PixelFormat::Palette8 { 1 } else { 2 };
            let data_width = row_length / index_width;
            let palette_length = read_u32_le(&mut cursor)? as usize;
            let mut palette = Vec::with_capacity(palette_length.min(data.len() / 4));
            for _ in 0..palette_length {
                palette.push(read_bgra(&mut cursor)?);
            }
            let count = data_width as u64 * height as u64;
            let mut pixels = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let index = if index_width == 1 {
                    read_u8(&mut cursor)? as usize
                } else {
                    read_u16_le(&mut cursor)? as usize
                };
                let color = palette.get(index).ok_or(SilverError::BadPaletteIndex {
                    index,
                    palette_len: palette.len(),
                })?;
                pixels.push(*color);
            }
            (data_width, pixels)
        }
    };

    let mut raw = Vec::with_capacity(pixels.len() * 4);
    for pixel in &pixels {
        raw.extend_from_slice(&pixel.0);
    }
    let image = RgbaImage::from_raw(data_width, height, raw).ok_or_else(|| {
        SilverError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decoded pixel count does not fill {}x{}", data_width, height),
        ))
    })?;

    Ok(Decoded { image, data_width })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crop(decoded: &Decoded, width: u32, height: u32) -> RgbaImage {
        image::imageops::crop_imm(&decoded.image, 0, 0, width, height).to_image()
    }

    fn grey_image(width: u32, height: u32, values: &[u8]) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| {
            let v = values[(y * width + x) as usize];
            Rgba([v, v, v, 255])
        })
    }

    #[test]
    fn rgba8888_round_trips_exactly() {
        let image = RgbaImage::from_fn(3, 2, |x, y| Rgba([x as u8 * 40, y as u8 * 90, 7, 200]));
        let bytes = encode(PixelFormat::Rgba8888, &image, 1).unwrap();
        assert_eq!(bytes.len(), 3 * 2 * 4);
        // Channel-swapped on disk.
        assert_eq!(&bytes[..4], &[7, 0, 0, 200]);
        let decoded = decode(PixelFormat::Rgba8888, &bytes, 3, 2, 3 * 4).unwrap();
        assert_eq!(decoded.data_width, 3);
        assert_eq!(decoded.image, image);
    }

    #[test]
    fn grey4_odd_width_pads_and_crops() {
        let width = 5;
        let values = [0, 17, 34, 255, 68, 85, 102, 119, 136, 153];
        let image = grey_image(width, 2, &values);
        let row_length = PixelFormat::Grey4.row_length(width);
        assert_eq!(row_length, 3);

        let bytes = encode(PixelFormat::Grey4, &image, 1).unwrap();
        assert_eq!(bytes.len(), (row_length * 2) as usize);
        // Last byte of each row carries the padding sample in its low nibble.
        assert_eq!(bytes[2] & 0x0F, 0);

        let decoded = decode(PixelFormat::Grey4, &bytes, width, 2, row_length).unwrap();
        assert_eq!(decoded.data_width, row_length * 2);
        assert_eq!(crop(&decoded, width, 2), image);
    }

    #[test]
    fn grey4_quantizes_to_multiples_of_17() {
        let image = grey_image(2, 1, &[16, 18]);
        let bytes = encode(PixelFormat::Grey4, &image, 1).unwrap();
        let decoded = decode(PixelFormat::Grey4, &bytes, 2, 1, 1).unwrap();
        assert_eq!(decoded.image.get_pixel(0, 0)[0], 0); // 16/17 == 0
        assert_eq!(decoded.image.get_pixel(1, 0)[0], 17); // 18/17 == 1
    }

    #[test]
    fn grey8_round_trips_exactly() {
        let values = [0, 1, 127, 128, 254, 255];
        let image = grey_image(3, 2, &values);
        let bytes = encode(PixelFormat::Grey8, &image, 1).unwrap();
        assert_eq!(bytes, values);
        let decoded = decode(PixelFormat::Grey8, &bytes, 3, 2, 3).unwrap();
        assert_eq!(decoded.image, image);
    }

    #[test]
    fn rgb565_extremes_are_exact() {
        let image = RgbaImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgba([0, 0, 0, 255])
            } else {
                Rgba([255, 255, 255, 255])
            }
        });
        let bytes = encode(PixelFormat::Rgb565, &image, 1).unwrap();
        let decoded = decode(PixelFormat::Rgb565, &bytes, 2, 1, 4).unwrap();
        assert_eq!(decoded.image.get_pixel(0, 0), &Rgba([0, 0, 0, 255]));
        assert_eq!(decoded.image.get_pixel(1, 0), &Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn rgb565_stays_within_one_quantization_step() {
        let image = RgbaImage::from_fn(16, 16, |x, y| {
            Rgba([(x * 16 + y) as u8, (y * 16 + x) as u8, (x * 7 + y * 3) as u8, 255])
        });
        let bytes = encode(PixelFormat::Rgb565, &image, 1).unwrap();
        let decoded = decode(PixelFormat::Rgb565, &bytes, 16, 16, 32).unwrap();
        for (original, round_tripped) in image.pixels().zip(decoded.image.pixels()) {
            for channel in 0..3 {
                let diff = (original[channel] as i32 - round_tripped[channel] as i32).abs();
                // floor on encode, round on decode: at most one 5-bit step.
                assert!(diff <= 8, "channel {} off by {}", channel, diff);
            }
            assert_eq!(round_tripped[3], 255);
        }
    }

    #[test]
    fn palette8_round_trips_and_keeps_first_occurrence_order() {
        let image = RgbaImage::from_fn(4, 1, |x, _| match x {
            0 => Rgba([9, 8, 7, 255]),
            1 => Rgba([1, 2, 3, 4]),
            2 => Rgba([9, 8, 7, 255]),
            _ => Rgba([0, 0, 0, 0]),
        });
        let bytes = encode(PixelFormat::Palette8, &image, 1).unwrap();
        assert_eq!(u32::from_le_bytes(bytes[..4].try_into().unwrap()), 3);
        // First palette slot is the first color seen, stored BGRA.
        assert_eq!(&bytes[4..8], &[7, 8, 9, 255]);
        // Index stream: 0, 1, 0, 2.
        assert_eq!(&bytes[16..20], &[0, 1, 0, 2]);

        let decoded = decode(PixelFormat::Palette8, &bytes, 4, 1, 4).unwrap();
        assert_eq!(decoded.data_width, 4);
        assert_eq!(decoded.image, image);
    }

    #[test]
    fn palette8_capacity_edges() {
        // 255 distinct colors fits.
        let ok = RgbaImage::from_fn(255, 1, |x, _| Rgba([x as u8, 0, 0, 255]));
        assert!(encode(PixelFormat::Palette8, &ok, 1).is_ok());

        // 256 does not.
        let too_many = RgbaImage::from_fn(256, 1, |x, _| Rgba([(x % 256) as u8, (x / 256) as u8, 0, 255]));
        match encode(PixelFormat::Palette8, &too_many, 7) {
            Err(SilverError::PaletteOverflow { id: 7, colors: 256, max: 255 }) => {}
            other => panic!("expected palette overflow, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn palette16_capacity_edges() {
        // 65536 distinct colors overflows the 2-byte index space.
        let mut too_many = RgbaImage::from_fn(256, 256, |x, y| Rgba([x as u8, y as u8, 0, 255]));
        match encode(PixelFormat::Palette16, &too_many, 3) {
            Err(SilverError::PaletteOverflow { colors: 65536, max: 65535, .. }) => {}
            other => panic!("expected palette overflow, got {:?}", other.map(|v| v.len())),
        }

        // Collapse one color: 65535 distinct fits and round trips.
        too_many.put_pixel(255, 255, Rgba([0, 0, 0, 255]));
        let bytes = encode(PixelFormat::Palette16, &too_many, 3).unwrap();
        let decoded = decode(PixelFormat::Palette16, &bytes, 256, 256, 512).unwrap();
        assert_eq!(decoded.image, too_many);
    }

    #[test]
    fn palette_decode_rejects_out_of_range_index() {
        // One-color palette but an index stream referencing slot 5.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 255]);
        bytes.push(5);
        match decode(PixelFormat::Palette8, &bytes, 1, 1, 1) {
            Err(SilverError::BadPaletteIndex { index: 5, palette_len: 1 }) => {}
            _ => panic!("expected bad palette index"),
        }
    }

    #[test]
    fn truncated_payload_fails() {
        let bytes = [0u8; 3];
        assert!(decode(PixelFormat::Rgba8888, &bytes, 1, 1, 4).is_err());
    }

    #[test]
    fn oversized_header_dimensions_fail_without_panicking() {
        // A height no 4-byte payload can hold; the pixel-count arithmetic
        // must not wrap, and the result is a truncated-input error.
        let bytes = [0u8; 4];
        match decode(PixelFormat::Grey8, &bytes, 4, 0x8000_0000, 4) {
            Err(SilverError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            _ => panic!("expected truncated-input error"),
        }
    }
}
