//! SilverDB on-disk format codecs.

pub mod entry;
pub mod pixel;
pub mod silverdb;

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Error type for SilverDB pack/unpack operations.
///
/// Everything here aborts the whole operation; per-entry recoverable
/// conditions are reported through [`silverdb::UnpackReport`] instead.
#[derive(Debug)]
pub enum SilverError {
    /// The container magic was not 0x00000003.
    BadMagic(u32),
    /// The table signature was neither `paMB` nor `mTDL`.
    UnknownSignature([u8; 4]),
    /// A pixel format tag with no codec was requested on encode.
    UnsupportedFormat(u16),
    /// A palette image holds more distinct colors than its index width fits.
    PaletteOverflow { id: u32, colors: usize, max: usize },
    /// An image is so wide its packed row length does not fit the 2-byte
    /// header field.
    RowLengthOverflow { id: u32, row_length: u32 },
    /// A decoded palette index points past the end of the palette.
    BadPaletteIndex { index: usize, palette_len: usize },
    /// A loose asset file name does not follow `<id>_<tag>.<ext>`.
    BadAssetName(PathBuf),
    /// I/O failure, including truncated input.
    Io(io::Error),
    /// Raster decode/encode failure from the image crate.
    Image(image::ImageError),
}

impl From<io::Error> for SilverError {
    fn from(err: io::Error) -> Self {
        SilverError::Io(err)
    }
}

impl From<image::ImageError> for SilverError {
    fn from(err: image::ImageError) -> Self {
        SilverError::Image(err)
    }
}

impl fmt::Display for SilverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SilverError::BadMagic(found) => {
                write!(f, "bad container magic 0x{:08x} (expected 0x00000003)", found)
            }
            SilverError::UnknownSignature(tag) => {
                write!(f, "unknown table signature {:?}", String::from_utf8_lossy(tag))
            }
            SilverError::UnsupportedFormat(tag) => {
                write!(f, "cannot encode unknown pixel format 0x{:04x}", tag)
            }
            SilverError::PaletteOverflow { id, colors, max } => {
                write!(f, "image {} has {} distinct colors (palette limit {})", id, colors, max)
            }
            SilverError::RowLengthOverflow { id, row_length } => {
                write!(
                    f,
                    "image {} has a packed row length of {} bytes (header field limit {})",
                    id,
                    row_length,
                    u16::MAX
                )
            }
            SilverError::BadPaletteIndex { index, palette_len } => {
                write!(f, "palette index {} out of range (palette has {} colors)", index, palette_len)
            }
            SilverError::BadAssetName(path) => {
                write!(f, "unrecognised asset file name: {}", path.display())
            }
            SilverError::Io(err) => write!(f, "I/O error: {}", err),
            SilverError::Image(err) => write!(f, "image error: {}", err),
        }
    }
}

impl std::error::Error for SilverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SilverError::Io(err) => Some(err),
            SilverError::Image(err) => Some(err),
            _ => None,
        }
    }
}
