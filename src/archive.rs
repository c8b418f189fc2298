//! Bundling a directory tree into one transportable file.

use anyhow::{bail, Context, Result};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::PatchError;
use crate::patch_format::{ArchiveEntry, ArchiveHeader, ARCHIVE_MAGIC, FORMAT_VERSION};
use crate::util::{self, EntryKind};

pub trait ArchiveCodec: Send + Sync {
    fn ensure_available(&self) -> Result<()> {
        Ok(())
    }

    /// Bundle the contents of `dir` (not `dir` itself) into `blob`.
    fn pack(&self, dir: &Path, blob: &Path) -> Result<()>;

    /// Recreate the bundled tree under `dest`.
    fn unpack(&self, blob: &Path, dest: &Path) -> Result<()>;
}

/// zstd stream of bincode records: a header, then one record per directory
/// or file with file bytes copied straight after their record, then an end
/// marker. Only one file is open at a time on either side.
#[derive(Debug, Clone, Copy)]
pub struct BundleArchive {
    pub level: i32,
}

impl Default for BundleArchive {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl ArchiveCodec for BundleArchive {
    fn pack(&self, dir: &Path, blob: &Path) -> Result<()> {
        let entries = util::walk_directory(dir)?;

        let file = std::fs::File::create(blob)
            .with_context(|| format!("Failed to create archive: {}", blob.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(ARCHIVE_MAGIC)?;
        let mut encoder =
            zstd::Encoder::new(writer, self.level).context("Failed to create zstd encoder")?;
        let header = ArchiveHeader {
            version: FORMAT_VERSION,
        };
        bincode::serialize_into(&mut encoder, &header).context("Failed to write archive header")?;

        for entry in entries {
            match entry.kind {
                EntryKind::Dir => write_record(
                    &mut encoder,
                    Some(ArchiveEntry::Dir {
                        path: entry.relative_path,
                    }),
                )?,
                EntryKind::File => {
                    let source = std::fs::File::open(&entry.full_path).with_context(|| {
                        format!("Failed to open file: {}", entry.full_path.display())
                    })?;
                    let len = source
                        .metadata()
                        .with_context(|| {
                            format!("Failed to read metadata: {}", entry.full_path.display())
                        })?
                        .len();
                    write_record(
                        &mut encoder,
                        Some(ArchiveEntry::File {
                            path: entry.relative_path,
                            len,
                        }),
                    )?;
                    let copied = std::io::copy(&mut source.take(len), &mut encoder).with_context(
                        || format!("Failed to read file: {}", entry.full_path.display()),
                    )?;
                    if copied != len {
                        bail!(
                            "{} shrank while being archived ({copied} of {len} bytes)",
                            entry.full_path.display()
                        );
                    }
                }
            }
        }
        write_record(&mut encoder, None)?;

        encoder
            .finish()
            .context("Failed to finish archive compression")?
            .flush()
            .with_context(|| format!("Failed to write archive: {}", blob.display()))?;
        Ok(())
    }

    fn unpack(&self, blob: &Path, dest: &Path) -> Result<()> {
        let file = std::fs::File::open(blob)
            .with_context(|| format!("Failed to open archive: {}", blob.display()))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        if reader.read_exact(&mut magic).is_err() || &magic != ARCHIVE_MAGIC {
            bail!(PatchError::InvalidArchive(format!(
                "{} is missing the archive header",
                blob.display()
            )));
        }

        let mut decoder = zstd::Decoder::new(reader).context("Failed to create zstd decoder")?;
        let invalid = |e: bincode::Error| PatchError::InvalidArchive(format!("{}: {e}", blob.display()));
        let header: ArchiveHeader = bincode::deserialize_from(&mut decoder).map_err(invalid)?;
        if header.version != FORMAT_VERSION {
            bail!(PatchError::InvalidArchive(format!(
                "unsupported archive version {} (expected {})",
                header.version, FORMAT_VERSION
            )));
        }

        std::fs::create_dir_all(dest)
            .with_context(|| format!("Failed to create directory: {}", dest.display()))?;

        while let Some(entry) = bincode::deserialize_from::<_, Option<ArchiveEntry>>(&mut decoder)
            .map_err(invalid)?
        {
            match entry {
                ArchiveEntry::Dir { path } => {
                    let full = util::join_relative(dest, &path)?;
                    std::fs::create_dir_all(&full)
                        .with_context(|| format!("Failed to create directory: {}", full.display()))?;
                }
                ArchiveEntry::File { path, len } => {
                    let full = util::join_relative(dest, &path)?;
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut out = BufWriter::new(
                        std::fs::File::create(&full)
                            .with_context(|| format!("Failed to create file: {}", full.display()))?,
                    );
                    let written = std::io::copy(&mut (&mut decoder).take(len), &mut out)
                        .with_context(|| format!("Failed to write file: {}", full.display()))?;
                    if written != len {
                        bail!(PatchError::InvalidArchive(format!(
                            "{}: {path} truncated ({written} of {len} bytes)",
                            blob.display()
                        )));
                    }
                    out.flush()
                        .with_context(|| format!("Failed to write file: {}", full.display()))?;
                }
            }
        }
        Ok(())
    }
}

fn write_record<W: Write>(out: &mut W, record: Option<ArchiveEntry>) -> Result<()> {
    bincode::serialize_into(out, &record).context("Failed to write archive record")
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-built archive holding the given file records and bytes.
    fn raw_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut stream = bincode::serialize(&ArchiveHeader {
            version: FORMAT_VERSION,
        })
        .unwrap();
        for (path, data) in files {
            let record = Some(ArchiveEntry::File {
                path: path.to_string(),
                len: data.len() as u64,
            });
            stream.extend(bincode::serialize(&record).unwrap());
            stream.extend_from_slice(data);
        }
        stream.extend(bincode::serialize(&None::<ArchiveEntry>).unwrap());
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend(zstd::bulk::compress(&stream, 3).unwrap());
        bytes
    }

    #[test]
    fn pack_unpack_keeps_structure_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("nested/deeper")).unwrap();
        std::fs::create_dir_all(src.join("empty")).unwrap();
        std::fs::write(src.join("top.txt"), b"top level").unwrap();
        std::fs::write(src.join("nested/deeper/blob.bin"), vec![7u8; 10_000]).unwrap();
        std::fs::write(src.join("nested/zero"), b"").unwrap();

        let blob = dir.path().join("bundle");
        let dest = dir.path().join("dest");
        let codec = BundleArchive::default();
        codec.pack(&src, &blob).unwrap();
        codec.unpack(&blob, &dest).unwrap();

        assert_eq!(std::fs::read(dest.join("top.txt")).unwrap(), b"top level");
        assert_eq!(
            std::fs::read(dest.join("nested/deeper/blob.bin")).unwrap(),
            vec![7u8; 10_000]
        );
        assert!(std::fs::read(dest.join("nested/zero")).unwrap().is_empty());
        assert!(dest.join("empty").is_dir());
    }

    #[test]
    fn foreign_file_is_not_an_archive() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("bogus");
        std::fs::write(&blob, b"PK\x03\x04 some zip").unwrap();
        let err = BundleArchive::default()
            .unpack(&blob, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::InvalidArchive(_))
        ));
    }

    #[test]
    fn escaping_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("evil");
        std::fs::write(&blob, raw_archive(&[("../outside.txt", b"x")])).unwrap();

        let err = BundleArchive::default()
            .unpack(&blob, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::UnsafePath(_))
        ));
        assert!(!dir.path().join("outside.txt").exists());
    }

    #[test]
    fn many_files_stream_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        for i in 0..50u8 {
            let sub = src.join(format!("d{}", i % 7));
            std::fs::create_dir_all(&sub).unwrap();
            std::fs::write(sub.join(format!("f{i}")), vec![i; 1000 + i as usize * 97]).unwrap();
        }
        let blob = dir.path().join("bundle");
        let dest = dir.path().join("dest");
        BundleArchive { level: 1 }.pack(&src, &blob).unwrap();
        BundleArchive::default().unpack(&blob, &dest).unwrap();

        for i in 0..50u8 {
            let rel = format!("d{}/f{i}", i % 7);
            assert_eq!(
                std::fs::read(dest.join(&rel)).unwrap(),
                vec![i; 1000 + i as usize * 97],
                "{rel}"
            );
        }
    }

    #[test]
    fn truncated_file_bytes_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("short");
        let mut stream = bincode::serialize(&ArchiveHeader {
            version: FORMAT_VERSION,
        })
        .unwrap();
        stream.extend(
            bincode::serialize(&Some(ArchiveEntry::File {
                path: "f".to_string(),
                len: 100,
            }))
            .unwrap(),
        );
        stream.extend_from_slice(b"only ten b");
        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend(zstd::bulk::compress(&stream, 3).unwrap());
        std::fs::write(&blob, bytes).unwrap();

        let err = BundleArchive::default()
            .unpack(&blob, &dir.path().join("out"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PatchError>(),
            Some(PatchError::InvalidArchive(_))
        ));
    }
}
