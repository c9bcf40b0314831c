//! The SilverDB container: fixed header, file-reference table, and the
//! entry region the table indexes.
//!
//! Reference offsets are relative to the byte immediately after the
//! reference array, never absolute. Packing reserves the array as zeroes,
//! writes the entries, then goes back and fills the records in; the
//! header's reference-array-end field is backpatched the same way.

use std::collections::BTreeSet;
use std::io::Cursor;

use image::RgbaImage;

use crate::binary_utils::{read_bytes, read_i32_le, read_u32_le, write_u32};
use crate::formats::entry::{self, EntryOutcome};
use crate::formats::pixel::PixelFormat;
use crate::formats::SilverError;

pub const MAGIC: u32 = 0x0000_0003;
pub const IMAGE_TABLE_TAG: [u8; 4] = *b"paMB";
pub const LANGUAGE_TABLE_TAG: [u8; 4] = *b"mTDL";

/// Fixed container header size up to the reference array.
pub const HEADER_LEN: usize = 28;
/// Size of one reference record: id, relative offset, size.
pub const REFERENCE_LEN: usize = 12;

/// One record of the reference table. `size` includes the 32-byte entry
/// header; a size of 0 marks an intentionally absent asset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileReference {
    pub id: u32,
    /// Relative to the end of the reference array. Signed on disk.
    pub offset: i32,
    pub size: u32,
}

/// Table-level metadata carried through an unpack/pack round trip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableMeta {
    pub code_page: u32,
    pub table_kind: u32,
    pub signature: [u8; 4],
}

impl Default for TableMeta {
    fn default() -> Self {
        // The constants observed in every firmware image table.
        TableMeta {
            code_page: 1,
            table_kind: 1,
            signature: IMAGE_TABLE_TAG,
        }
    }
}

/// One asset to pack: an image in a chosen format, or nothing at all
/// (a reference with size 0 and no entry bytes).
pub struct PackAsset {
    pub id: u32,
    pub image: Option<(PixelFormat, RgbaImage)>,
}

/// A language (`mTDL`) table. No entry layout is known for these, so the
/// post-header bytes pass through unparsed; the two header fields that
/// cannot be recomputed are kept so packing reproduces the original blob.
pub struct LanguageTable {
    /// Raw value of the header's reference-array-end field.
    pub reference_array_end: u32,
    pub reference_count: u32,
    pub body: Vec<u8>,
}

/// Everything an unpack produced. Recoverable per-entry conditions end up
/// in `warnings` / `unhandled_formats` instead of failing the call.
pub struct UnpackReport {
    pub meta: TableMeta,
    pub references: Vec<FileReference>,
    pub entries: Vec<EntryOutcome>,
    pub unhandled_formats: BTreeSet<u16>,
    pub warnings: Vec<String>,
    pub language: Option<LanguageTable>,
}

/// Serialize a full database. `assets` must already be sorted ascending
/// by id; the reference table is written in that order.
pub fn pack(assets: &[PackAsset], meta: &TableMeta) -> Result<Vec<u8>, SilverError> {
    let mut out = Vec::new();

    out.extend_from_slice(&MAGIC.to_le_bytes());
    let ref_end_field = out.len();
    out.extend_from_slice(&0u32.to_le_bytes()); // reference-array end, patched below
    out.extend_from_slice(&meta.code_page.to_le_bytes());
    out.extend_from_slice(&meta.signature);
    out.extend_from_slice(&(assets.len() as u32).to_le_bytes());
    out.extend_from_slice(&meta.table_kind.to_le_bytes());
    out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());

    let ref_table_start = out.len();
    out.resize(ref_table_start + assets.len() * REFERENCE_LEN, 0);
    let ref_table_end = out.len();
    write_u32(&mut out, ref_table_end as u32, ref_end_field);

    let mut references = Vec::with_capacity(assets.len());
    for asset in assets {
        match &asset.image {
            Some((format, image)) => {
                let (start, total) = entry::encode_entry(&mut out, asset.id, *format, image)?;
                if total % 2 != 0 {
                    // Keep the next entry 2-byte aligned.
                    out.push(0);
                }
                references.push(FileReference {
                    id: asset.id,
                    offset: (start - ref_table_end) as i32,
                    size: total as u32,
                });
            }
            None => {
                references.push(FileReference {
                    id: asset.id,
                    offset: (out.len() - ref_table_end) as i32,
                    size: 0,
                });
            }
        }
    }

    for (index, reference) in references.iter().enumerate() {
        let pos = ref_table_start + index * REFERENCE_LEN;
        write_u32(&mut out, reference.id, pos);
        write_u32(&mut out, reference.offset as u32, pos + 4);
        write_u32(&mut out, reference.size, pos + 8);
    }

    Ok(out)
}

/// Parse a database blob. Fatal errors abort; entry-level problems are
/// collected into the report.
pub fn unpack(data: &[u8]) -> Result<UnpackReport, SilverError> {
    let mut cursor = Cursor::new(data);

    let magic = read_u32_le(&mut cursor)?;
    if magic != MAGIC {
        return Err(SilverError::BadMagic(magic));
    }
    let ref_table_end_field = read_u32_le(&mut cursor)?;
    let code_page = read_u32_le(&mut cursor)?;
    let signature: [u8; 4] = read_bytes(&mut cursor, 4)?
        .try_into()
        .expect("read_bytes(4) returns 4 bytes");
    let reference_count = read_u32_le(&mut cursor)?;
    let table_kind = read_u32_le(&mut cursor)?;
    let _header_len_field = read_u32_le(&mut cursor)?; // always 28

    let meta = TableMeta {
        code_page,
        table_kind,
        signature,
    };

    if signature == LANGUAGE_TABLE_TAG {
        // Entry layout unknown; hand the body back untouched.
        return Ok(UnpackReport {
            meta,
            references: Vec::new(),
            entries: Vec::new(),
            unhandled_formats: BTreeSet::new(),
            warnings: Vec::new(),
            language: Some(LanguageTable {
                reference_array_end: ref_table_end_field,
                reference_count,
                body: data[HEADER_LEN..].to_vec(),
            }),
        });
    }
    if signature != IMAGE_TABLE_TAG {
        return Err(SilverError::UnknownSignature(signature));
    }

    let mut references = Vec::with_capacity(reference_count as usize);
    for _ in 0..reference_count {
        references.push(FileReference {
            id: read_u32_le(&mut cursor)?,
            offset: read_i32_le(&mut cursor)?,
            size: read_u32_le(&mut cursor)?,
        });
    }
    let ref_table_end = cursor.position();

    let mut entries = Vec::new();
    let mut unhandled_formats = BTreeSet::new();
    let mut warnings = Vec::new();

    for reference in &references {
        let offset = ref_table_end as i64 + reference.offset as i64;
        let offset = u64::try_from(offset).map_err(|_| {
            SilverError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("reference {} points before start of file", reference.id),
            ))
        })?;

        match entry::decode_entry(data, offset, reference.id, reference.size)? {
            EntryOutcome::Mismatch { id, detail } => {
                warnings.push(format!("skipping image {}: {}", id, detail));
            }
            EntryOutcome::UnhandledFormat { id, format_tag } => {
                unhandled_formats.insert(format_tag);
                warnings.push(format!(
                    "skipping image {}: no codec for format 0x{:04x}",
                    id, format_tag
                ));
            }
            outcome => entries.push(outcome),
        }
    }

    Ok(UnpackReport {
        meta,
        references,
        entries,
        unhandled_formats,
        warnings,
        language: None,
    })
}

/// Reassemble a language table from its preserved header fields and
/// opaque body. The inverse of the `mTDL` branch of [`unpack`].
pub fn pack_language(meta: &TableMeta, table: &LanguageTable) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + table.body.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&table.reference_array_end.to_le_bytes());
    out.extend_from_slice(&meta.code_page.to_le_bytes());
    out.extend_from_slice(&meta.signature);
    out.extend_from_slice(&table.reference_count.to_le_bytes());
    out.extend_from_slice(&meta.table_kind.to_le_bytes());
    out.extend_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    out.extend_from_slice(&table.body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn rgb565_asset(id: u32) -> PackAsset {
        let image = RgbaImage::from_fn(3, 2, |x, y| Rgba([x as u8 * 80, y as u8 * 100, 40, 255]));
        PackAsset {
            id,
            image: Some((PixelFormat::Rgb565, image)),
        }
    }

    fn grey8_asset(id: u32, width: u32) -> PackAsset {
        let image = RgbaImage::from_fn(width, 1, |x, _| {
            let v = (id as u8).wrapping_mul(31).wrapping_add(x as u8);
            Rgba([v, v, v, 255])
        });
        PackAsset {
            id,
            image: Some((PixelFormat::Grey8, image)),
        }
    }

    #[test]
    fn pack_unpack_round_trip_with_absent_asset() {
        let assets = vec![
            rgb565_asset(1),
            PackAsset { id: 2, image: None },
        ];
        let blob = pack(&assets, &TableMeta::default()).unwrap();

        // 3x2 RGB565 payload is 12 bytes; entry total 44, even, no pad.
        let entry1_total = 32 + 3 * 2 * 2;
        let report = unpack(&blob).unwrap();
        assert_eq!(
            report.references,
            vec![
                FileReference { id: 1, offset: 0, size: entry1_total },
                FileReference { id: 2, offset: entry1_total as i32, size: 0 },
            ]
        );

        assert_eq!(report.entries.len(), 2);
        assert!(matches!(
            report.entries[0],
            EntryOutcome::Image { id: 1, format_tag: 0x0565, .. }
        ));
        assert!(matches!(report.entries[1], EntryOutcome::Empty { id: 2 }));
        assert!(report.warnings.is_empty());
        assert!(report.unhandled_formats.is_empty());
    }

    #[test]
    fn odd_entries_are_padded_to_even_offsets() {
        // Grey8 3x1 payload is 3 bytes: entry total 35, so one pad byte
        // must sit before the next entry.
        let assets = vec![grey8_asset(1, 3), grey8_asset(2, 3)];
        let blob = pack(&assets, &TableMeta::default()).unwrap();
        let report = unpack(&blob).unwrap();

        assert_eq!(report.references[0], FileReference { id: 1, offset: 0, size: 35 });
        assert_eq!(report.references[1], FileReference { id: 2, offset: 36, size: 35 });
        assert_eq!(report.entries.len(), 2);
    }

    #[test]
    fn header_advertises_reference_table_end() {
        let assets = vec![grey8_asset(1, 4)];
        let blob = pack(&assets, &TableMeta::default()).unwrap();
        let advertised = u32::from_le_bytes(blob[4..8].try_into().unwrap());
        assert_eq!(advertised as usize, HEADER_LEN + REFERENCE_LEN);
        assert_eq!(u32::from_le_bytes(blob[16..20].try_into().unwrap()), 1); // count
        assert_eq!(&blob[12..16], b"paMB");
    }

    #[test]
    fn corrupted_entry_id_skips_only_that_entry() {
        let assets = vec![grey8_asset(1, 4), grey8_asset(2, 4)];
        let mut blob = pack(&assets, &TableMeta::default()).unwrap();

        // Entry 1 starts right after the reference table; its id field
        // sits 24 bytes into the entry header.
        let entry1_start = HEADER_LEN + 2 * REFERENCE_LEN;
        let id_field = entry1_start + 24;
        assert_eq!(u32::from_le_bytes(blob[id_field..id_field + 4].try_into().unwrap()), 1);
        blob[id_field] = 0xAA;

        let report = unpack(&blob).unwrap();
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.entries.len(), 1);
        assert!(matches!(report.entries[0], EntryOutcome::Image { id: 2, .. }));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let blob = 4u32.to_le_bytes().to_vec();
        assert!(matches!(unpack(&blob), Err(SilverError::BadMagic(4))));
    }

    #[test]
    fn language_table_passes_through_opaque() {
        let mut blob = Vec::new();
        blob.extend_from_slice(&MAGIC.to_le_bytes());
        blob.extend_from_slice(&0x1234u32.to_le_bytes());
        blob.extend_from_slice(&1u32.to_le_bytes());
        blob.extend_from_slice(&LANGUAGE_TABLE_TAG);
        blob.extend_from_slice(&7u32.to_le_bytes());
        blob.extend_from_slice(&2u32.to_le_bytes());
        blob.extend_from_slice(&28u32.to_le_bytes());
        blob.extend_from_slice(b"opaque body");

        let report = unpack(&blob).unwrap();
        assert_eq!(report.meta.signature, LANGUAGE_TABLE_TAG);
        assert!(report.references.is_empty());

        let table = report.language.as_ref().unwrap();
        assert_eq!(table.body, b"opaque body");
        assert_eq!(table.reference_array_end, 0x1234);
        assert_eq!(table.reference_count, 7);

        // Repacking reproduces the original blob byte for byte.
        assert_eq!(pack_language(&report.meta, table), blob);
    }

    #[test]
    fn truncated_reference_table_is_fatal() {
        let assets = vec![grey8_asset(1, 4)];
        let blob = pack(&assets, &TableMeta::default()).unwrap();
        // Chop inside the reference array.
        assert!(matches!(
            unpack(&blob[..HEADER_LEN + 6]),
            Err(SilverError::Io(_))
        ));
    }
}
