//! The loose-file side of the tool: asset file naming, directory
//! scanning, PNG load/save, and the `table.json` metadata sidecar.
//!
//! Image assets live as `<decimal id>_<4 hex digit tag>.png`; an asset
//! with no pixel data is `<decimal id>_empty.bin`. Pack order is
//! ascending id regardless of directory order.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::formats::entry::EntryOutcome;
use crate::formats::pixel::PixelFormat;
use crate::formats::silverdb::{
    self, LanguageTable, PackAsset, TableMeta, UnpackReport, LANGUAGE_TABLE_TAG,
};
use crate::formats::SilverError;

pub const MANIFEST_NAME: &str = "table.json";
pub const LANGUAGE_BODY_NAME: &str = "language.bin";

/// JSON sidecar written on unpack and read back on pack so table-level
/// metadata survives the round trip.
#[derive(Debug, Serialize, Deserialize)]
pub struct TableManifest {
    pub code_page: u32,
    pub table_kind: u32,
    pub signature: String,
    /// Header fields preserved verbatim for language tables, whose body
    /// is opaque and whose reference array is never parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_array_end: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_count: Option<u32>,
}

impl TableManifest {
    pub fn from_meta(meta: &TableMeta) -> Self {
        TableManifest {
            code_page: meta.code_page,
            table_kind: meta.table_kind,
            signature: String::from_utf8_lossy(&meta.signature).into_owned(),
            reference_array_end: None,
            reference_count: None,
        }
    }

    pub fn to_meta(&self) -> Result<TableMeta, SilverError> {
        let signature: [u8; 4] = self.signature.as_bytes().try_into().map_err(|_| {
            SilverError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("table signature must be 4 ASCII bytes, got {:?}", self.signature),
            ))
        })?;
        Ok(TableMeta {
            code_page: self.code_page,
            table_kind: self.table_kind,
            signature,
        })
    }
}

/// Split an asset file stem into `(id, Some(format tag))`, or
/// `(id, None)` for the `_empty` marker.
pub fn parse_asset_stem(stem: &str) -> Option<(u32, Option<u16>)> {
    let (id_part, tag_part) = stem.split_once('_')?;
    let id = id_part.parse().ok()?;
    if tag_part == "empty" {
        return Some((id, None));
    }
    u16::from_str_radix(tag_part, 16).ok().map(|tag| (id, Some(tag)))
}

struct ScannedAsset {
    id: u32,
    tag: Option<u16>,
    path: PathBuf,
}

/// Collect the assets to pack from a directory, sorted ascending by id.
/// Files without both an `_` in the stem and an extension are ignored
/// (this skips `table.json` and friends); a file that looks like an
/// asset but does not parse is an error.
fn scan_directory(directory: &Path) -> Result<Vec<ScannedAsset>, SilverError> {
    let mut assets = Vec::new();
    for dir_entry in fs::read_dir(directory)? {
        let path = dir_entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if !stem.contains('_') || path.extension().is_none() {
            continue;
        }
        let (id, tag) =
            parse_asset_stem(stem).ok_or_else(|| SilverError::BadAssetName(path.clone()))?;
        assets.push(ScannedAsset { id, tag, path });
    }
    assets.sort_by_key(|asset| asset.id);
    Ok(assets)
}

/// Build a SilverDB blob from a directory of loose assets.
pub fn pack_directory(directory: &Path) -> Result<Vec<u8>, SilverError> {
    let manifest_path = directory.join(MANIFEST_NAME);
    let manifest = if manifest_path.is_file() {
        let file = File::open(&manifest_path)?;
        let parsed: TableManifest = serde_json::from_reader(file)
            .map_err(|e| SilverError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        Some(parsed)
    } else {
        None
    };
    let meta = match &manifest {
        Some(manifest) => manifest.to_meta()?,
        None => TableMeta::default(),
    };

    if meta.signature == LANGUAGE_TABLE_TAG {
        // Layout unknown: the body written at unpack time goes back
        // verbatim, with the preserved header fields around it.
        let body = fs::read(directory.join(LANGUAGE_BODY_NAME))?;
        let manifest = manifest.as_ref();
        let table = LanguageTable {
            reference_array_end: manifest.and_then(|m| m.reference_array_end).unwrap_or(0),
            reference_count: manifest.and_then(|m| m.reference_count).unwrap_or(0),
            body,
        };
        return Ok(silverdb::pack_language(&meta, &table));
    }

    let mut assets = Vec::new();
    for scanned in scan_directory(directory)? {
        let image = match scanned.tag {
            Some(tag) => {
                let format = PixelFormat::from_tag(tag)
                    .ok_or(SilverError::UnsupportedFormat(tag))?;
                let raster = image::open(&scanned.path)?.to_rgba8();
                Some((format, raster))
            }
            None => None,
        };
        println!(
            "  packing {} ({})",
            scanned.path.display(),
            match scanned.tag {
                Some(tag) => format!("format 0x{:04x}", tag),
                None => "empty".to_string(),
            }
        );
        assets.push(PackAsset { id: scanned.id, image });
    }

    silverdb::pack(&assets, &meta)
}

/// Unpack a SilverDB blob into a directory of loose assets plus the
/// `table.json` manifest. Returns the report so the caller can surface
/// warnings and the unhandled-format set.
pub fn unpack_to_directory(data: &[u8], directory: &Path) -> Result<UnpackReport, SilverError> {
    let report = silverdb::unpack(data)?;
    fs::create_dir_all(directory)?;

    for outcome in &report.entries {
        match outcome {
            EntryOutcome::Image { id, format_tag, image } => {
                let path = directory.join(format!("{}_{:04x}.png", id, format_tag));
                save_png(image, &path)?;
            }
            EntryOutcome::Empty { id } => {
                File::create(directory.join(format!("{}_empty.bin", id)))?;
            }
            // Mismatch/UnhandledFormat never reach the entries list.
            _ => {}
        }
    }

    let mut manifest = TableManifest::from_meta(&report.meta);
    if let Some(table) = &report.language {
        fs::write(directory.join(LANGUAGE_BODY_NAME), &table.body)?;
        manifest.reference_array_end = Some(table.reference_array_end);
        manifest.reference_count = Some(table.reference_count);
    }
    let file = File::create(directory.join(MANIFEST_NAME))?;
    serde_json::to_writer_pretty(file, &manifest)
        .map_err(|e| SilverError::Io(io::Error::new(io::ErrorKind::Other, e)))?;

    Ok(report)
}

/// Save a PNG and run it through oxipng. If optimization fails the
/// unoptimized file is kept and a warning printed.
fn save_png(image: &RgbaImage, path: &Path) -> Result<(), SilverError> {
    let temp_path = path.with_extension("temp.png");
    image.save(&temp_path)?;

    let mut options = oxipng::Options::from_preset(2);
    options.bit_depth_reduction = true;
    options.interlace = None;

    match oxipng::optimize(
        &oxipng::InFile::Path(temp_path.clone()),
        &oxipng::OutFile::Path(Some(path.to_path_buf())),
        &options,
    ) {
        Ok(_) => {
            let _ = fs::remove_file(temp_path);
            Ok(())
        }
        Err(e) => {
            fs::rename(temp_path, path)?;
            eprintln!(
                "Warning: oxipng optimisation failed for {}: {}. File saved unoptimised.",
                path.display(),
                e
            );
            Ok(())
        }
    }
}
