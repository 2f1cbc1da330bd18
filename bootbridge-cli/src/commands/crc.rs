//! Image checksum command implementation.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};
use bootbridge::protocol::crc::crc32_reader;
use bootbridge::protocol::frame::WRITE_ALIGN;

/// Size and CRC32 of the image at `path`.
fn image_crc(path: &Path) -> Result<(u64, u32)> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;
    let size = file.metadata()?.len();
    let crc = crc32_reader(&mut file)
        .with_context(|| format!("Failed to read image {}", path.display()))?;
    Ok((size, crc))
}

/// Bytes a flash of `size` bytes writes once padded to the WRITE alignment.
/// `None` when that does not fit the bootloader's 32-bit length.
fn written_len(size: u64) -> Option<u32> {
    u32::try_from(size)
        .ok()?
        .checked_next_multiple_of(WRITE_ALIGN)
}

/// Crc command implementation.
pub(crate) fn cmd_crc(image: &Path, json: bool) -> Result<()> {
    let (size, crc) = image_crc(image)?;
    let written = written_len(size);

    if json {
        let info = serde_json::json!({
            "path": image.display().to_string(),
            "size": size,
            "written": written,
            "crc32": crc,
            "crc32_hex": format!("{crc:#010x}"),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&info).unwrap_or_default()
        );
        return Ok(());
    }

    println!("{crc:#010x}  {size}  {}", image.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_image_crc_check_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("check.bin");
        fs::write(&path, b"123456789").unwrap();
        assert_eq!(image_crc(&path).unwrap(), (9, 0xCBF4_3926));
    }

    #[test]
    fn test_image_crc_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();
        assert_eq!(image_crc(&path).unwrap(), (0, 0));
    }

    #[test]
    fn test_written_len_near_u32_limit() {
        assert_eq!(written_len(0), Some(0));
        assert_eq!(written_len(9), Some(256));
        assert_eq!(written_len(u64::from(u32::MAX - 255)), Some(u32::MAX - 255));
        assert_eq!(written_len(u64::from(u32::MAX - 254)), None);
        assert_eq!(written_len(u64::from(u32::MAX)), None);
        assert_eq!(written_len(u64::from(u32::MAX) + 1), None);
    }

    #[test]
    fn test_image_crc_missing_file() {
        let dir = tempdir().unwrap();
        assert!(image_crc(&dir.path().join("missing.bin")).is_err());
    }
}
