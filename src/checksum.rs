use anyhow::{Context, Result};
use simd_adler32::Adler32;
use std::io::Read;
use std::path::Path;

/// Adler-32 content fingerprint. Detects accidental corruption and version
/// mismatch; it is not meant to resist tampering.
pub type Checksum = u32;

const READ_BUF: usize = 256 * 1024;

/// Checksum of an in-memory buffer.
pub fn checksum_bytes(data: &[u8]) -> Checksum {
    let mut hasher = Adler32::new();
    hasher.write(data);
    hasher.finish()
}

/// Stream-checksum a file with a 256 KB buffer.
pub fn checksum_file(path: &Path) -> Result<Checksum> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file for checksum: {}", path.display()))?;
    let mut hasher = Adler32::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for checksum: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.write(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_adler32_value() {
        // Reference value from RFC 1950 implementations.
        assert_eq!(checksum_bytes(b"Wikipedia"), 0x11E6_0398);
    }

    #[test]
    fn empty_input_is_one() {
        assert_eq!(checksum_bytes(b""), 1);
    }

    #[test]
    fn file_matches_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data: Vec<u8> = (0..700_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();
        assert_eq!(checksum_file(&path).unwrap(), checksum_bytes(&data));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(checksum_file(&dir.path().join("nope")).is_err());
    }
}
