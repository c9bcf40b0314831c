//! Little-endian cursor helpers shared by the SilverDB codecs.
//!
//! Reading goes through `Cursor<&[u8]>` so callers can seek to the
//! offsets stored in the reference table. Output is built in a growable
//! `Vec<u8>`; placeholder fields are patched in place with [`write_u32`]
//! once their final values are known.

use std::io::{self, Cursor, Read, Seek, SeekFrom};

fn ensure_available(cursor: &Cursor<&[u8]>, needed: u64, what: &str) -> io::Result<()> {
    let len = cursor.get_ref().len() as u64;
    let pos = cursor.position();
    if pos + needed > len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("truncated input: need {needed} byte(s) for {what} at offset {pos}, length {len}"),
        ));
    }
    Ok(())
}

pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> io::Result<u8> {
    ensure_available(cursor, 1, "u8")?;
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_u16_le(cursor: &mut Cursor<&[u8]>) -> io::Result<u16> {
    ensure_available(cursor, 2, "u16")?;
    let mut buf = [0u8; 2];
    cursor.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le(cursor: &mut Cursor<&[u8]>) -> io::Result<u32> {
    ensure_available(cursor, 4, "u32")?;
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_i32_le(cursor: &mut Cursor<&[u8]>) -> io::Result<i32> {
    ensure_available(cursor, 4, "i32")?;
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

pub fn read_bytes(cursor: &mut Cursor<&[u8]>, length: usize) -> io::Result<Vec<u8>> {
    ensure_available(cursor, length as u64, "byte run")?;
    let mut buffer = vec![0u8; length];
    cursor.read_exact(&mut buffer)?;
    Ok(buffer)
}

pub fn seek_to(cursor: &mut Cursor<&[u8]>, position: u64) -> io::Result<()> {
    if position > cursor.get_ref().len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "cannot seek to offset {} (input length {})",
                position,
                cursor.get_ref().len()
            ),
        ));
    }
    cursor.seek(SeekFrom::Start(position))?;
    Ok(())
}

/// Patch a little-endian u32 into an already-written output buffer.
/// Used to fill placeholder length/offset fields after the data that
/// determines them has been emitted.
pub fn write_u32(data: &mut [u8], value: u32, pos: usize) {
    data[pos..pos + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian_fields() {
        let data: &[u8] = &[0x01, 0x02, 0x03, 0x04, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut cursor = Cursor::new(data);
        assert_eq!(read_u16_le(&mut cursor).unwrap(), 0x0201);
        assert_eq!(read_u16_le(&mut cursor).unwrap(), 0x0403);
        assert_eq!(read_i32_le(&mut cursor).unwrap(), -1);
    }

    #[test]
    fn short_read_is_unexpected_eof() {
        let data: &[u8] = &[0x01, 0x02, 0x03];
        let mut cursor = Cursor::new(data);
        let err = read_u32_le(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        // Position is untouched by the failed read.
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn seek_past_end_is_rejected() {
        let data: &[u8] = &[0u8; 4];
        let mut cursor = Cursor::new(data);
        assert!(seek_to(&mut cursor, 4).is_ok());
        assert!(seek_to(&mut cursor, 5).is_err());
    }

    #[test]
    fn write_u32_patches_in_place() {
        let mut out = vec![0u8; 8];
        write_u32(&mut out, 0xAABBCCDD, 2);
        assert_eq!(&out[2..6], &[0xDD, 0xCC, 0xBB, 0xAA]);
    }
}
