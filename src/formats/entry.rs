//! Single image asset entries: a 32-byte header followed by the packed
//! pixel payload.
//!
//! The header's payload length is not known until the pixels have been
//! encoded, so encoding writes a placeholder and patches it afterwards.

use std::io::{self, Cursor};

use image::{imageops, RgbaImage};

use crate::binary_utils::{read_bytes, read_u16_le, read_u32_le, seek_to, write_u32};
use crate::formats::pixel::{self, PixelFormat};
use crate::formats::SilverError;

/// Fixed size of an entry header in bytes.
pub const HEADER_LEN: usize = 32;

/// The on-disk entry header. Reserved fields are validated to exist but
/// not kept; they are always 1 / 0 / 0 in practice.
#[derive(Clone, Copy, Debug)]
pub struct EntryHeader {
    pub format_tag: u16,
    pub row_length: u16,
    pub flags: u16,
    pub height: u32,
    pub width: u32,
    pub id: u32,
    pub payload_size: u32,
}

pub fn read_header(cursor: &mut Cursor<&[u8]>) -> io::Result<EntryHeader> {
    let format_tag = read_u16_le(cursor)?;
    let _unk0 = read_u16_le(cursor)?; // always 1
    let row_length = read_u16_le(cursor)?;
    let flags = read_u16_le(cursor)?;
    let _reserved0 = read_u32_le(cursor)?;
    let _reserved1 = read_u32_le(cursor)?;
    let height = read_u32_le(cursor)?;
    let width = read_u32_le(cursor)?;
    let id = read_u32_le(cursor)?;
    let payload_size = read_u32_le(cursor)?;
    Ok(EntryHeader {
        format_tag,
        row_length,
        flags,
        height,
        width,
        id,
        payload_size,
    })
}

/// Append one encoded entry to the output buffer. Returns the entry's
/// start offset and total length (header + payload) so the caller can
/// build its reference record and apply alignment padding.
pub fn encode_entry(
    out: &mut Vec<u8>,
    id: u32,
    format: PixelFormat,
    image: &RgbaImage,
) -> Result<(usize, usize), SilverError> {
    let start = out.len();
    let (width, height) = image.dimensions();
    let row_length = format.row_length(width);
    if row_length > u16::MAX as u32 {
        return Err(SilverError::RowLengthOverflow { id, row_length });
    }

    out.extend_from_slice(&format.tag().to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&(row_length as u16).to_le_bytes());
    out.extend_from_slice(&format.flags().to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&height.to_le_bytes());
    out.extend_from_slice(&width.to_le_bytes());
    out.extend_from_slice(&id.to_le_bytes());
    let length_offset = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // payload size, patched below

    let payload = pixel::encode(format, image, id)?;
    out.extend_from_slice(&payload);

    let total = out.len() - start;
    write_u32(out, (total - HEADER_LEN) as u32, length_offset);
    Ok((start, total))
}

/// What decoding one reference produced. Only `Image` carries pixels;
/// the other variants are per-entry conditions the container reports
/// without aborting the rest of the table.
#[derive(Debug)]
pub enum EntryOutcome {
    Image {
        id: u32,
        format_tag: u16,
        image: RgbaImage,
    },
    /// The reference's size was 0: the asset intentionally has no data.
    Empty { id: u32 },
    /// The entry header disagreed with its reference record.
    Mismatch { id: u32, detail: String },
    /// The format tag has no codec; recorded in the unhandled set.
    UnhandledFormat { id: u32, format_tag: u16 },
}

/// Decode the entry a reference points at. `offset` is absolute within
/// `data`; `expected_id` and `expected_size` come from the reference
/// record and are checked against the entry header.
pub fn decode_entry(
    data: &[u8],
    offset: u64,
    expected_id: u32,
    expected_size: u32,
) -> Result<EntryOutcome, SilverError> {
    // A zero-size reference may point at the very end of the stream, so
    // it must be resolved before any header read is attempted.
    if expected_size == 0 {
        return Ok(EntryOutcome::Empty { id: expected_id });
    }

    let mut cursor = Cursor::new(data);
    seek_to(&mut cursor, offset)?;
    let header = read_header(&mut cursor)?;

    if header.id != expected_id {
        return Ok(EntryOutcome::Mismatch {
            id: expected_id,
            detail: format!("header id {} does not match reference id {}", header.id, expected_id),
        });
    }
    // Widened so a payload_size near u32::MAX cannot wrap the addition.
    let accounted_size = header.payload_size as u64 + HEADER_LEN as u64;
    if accounted_size != expected_size as u64 {
        return Ok(EntryOutcome::Mismatch {
            id: expected_id,
            detail: format!(
                "header size {} does not match reference size {}",
                accounted_size, expected_size
            ),
        });
    }

    let format = match PixelFormat::from_tag(header.format_tag) {
        Some(format) => format,
        None => {
            return Ok(EntryOutcome::UnhandledFormat {
                id: expected_id,
                format_tag: header.format_tag,
            })
        }
    };

    let payload = read_bytes(&mut cursor, header.payload_size as usize)?;
    let decoded = pixel::decode(
        format,
        &payload,
        header.width,
        header.height,
        header.row_length as u32,
    )?;

    // Row padding can make the decoded grid wider than the image; drop
    // the trailing columns.
    let image = if decoded.data_width != header.width {
        imageops::crop_imm(&decoded.image, 0, 0, header.width, header.height).to_image()
    } else {
        decoded.image
    };

    Ok(EntryOutcome::Image {
        id: header.id,
        format_tag: header.format_tag,
        image,
    })
}
