//! Zip extraction with zip-slip and decompression-bomb defenses, built
//! against `zip::ZipArchive`'s streaming entry reader.

use crate::error::{GatewayError, Result};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Extract `source` into `dest`, enforcing:
/// - every entry resolves to a path under `dest` (no zip-slip)
/// - the running total of decompressed bytes never exceeds `max_uncompressed_bytes`
///
/// On any error, partially created files are best-effort removed.
pub fn unzip(source: &Path, dest: &Path, max_uncompressed_bytes: u64) -> Result<()> {
    let file = std::fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|err| GatewayError::SecurityViolation(format!("invalid archive: {err}")))?;

    std::fs::create_dir_all(dest)?;
    let dest_canonical = dest
        .canonicalize()
        .map_err(|err| GatewayError::TransportSetupFailure(err.to_string()))?;

    let mut created_files: Vec<PathBuf> = Vec::new();
    let mut total_uncompressed: u64 = 0;

    let result = (|| -> Result<()> {
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let Some(entry_name) = entry.enclosed_name() else {
                return Err(GatewayError::SecurityViolation(format!(
                    "illegal file path in archive entry {index}"
                )));
            };

            let target = dest.join(&entry_name);
            let target_parent = target.parent().map(Path::to_path_buf).unwrap_or_else(|| dest.to_path_buf());
            std::fs::create_dir_all(&target_parent)?;
            let resolved_parent = target_parent
                .canonicalize()
                .map_err(|err| GatewayError::TransportSetupFailure(err.to_string()))?;
            if !resolved_parent.starts_with(&dest_canonical) {
                return Err(GatewayError::SecurityViolation(format!(
                    "illegal file path escapes destination: {}",
                    entry_name.display()
                )));
            }

            if entry.is_dir() {
                continue;
            }

            let mut out = std::fs::File::create(&target)?;
            created_files.push(target.clone());

            let mut limited = entry.by_ref().take(max_uncompressed_bytes - total_uncompressed + 1);
            let written = std::io::copy(&mut limited, &mut out)?;
            total_uncompressed += written;
            if total_uncompressed > max_uncompressed_bytes {
                return Err(GatewayError::SecurityViolation(format!(
                    "decompressed size exceeds maximum allowed size of {max_uncompressed_bytes} bytes"
                )));
            }
        }
        Ok(())
    })();

    if result.is_err() {
        for path in created_files {
            let _ = std::fs::remove_file(path);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut writer = zip::ZipWriter::new(file.reopen().unwrap());
        for (name, contents) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
        file
    }

    #[test]
    fn rejects_zip_slip() {
        let zip_file = build_zip(&[("../evil.txt", b"pwned")]);
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("dest");
        let result = unzip(zip_file.path(), &dest, 1024);
        assert!(result.is_err());
        assert!(!tmp.path().join("evil.txt").exists());
    }

    #[test]
    fn rejects_decompression_bomb() {
        let zip_file = build_zip(&[("big.txt", &[b'a'; 20])]);
        let tmp = tempfile::tempdir().unwrap();
        let result = unzip(zip_file.path(), tmp.path(), 10);
        match result {
            Err(GatewayError::SecurityViolation(msg)) => {
                assert!(msg.contains("exceeds maximum allowed size"))
            }
            other => panic!("expected SecurityViolation, got {other:?}"),
        }
    }

    #[test]
    fn extracts_well_formed_archive() {
        let zip_file = build_zip(&[("a.txt", b"hello"), ("nested/b.txt", b"world")]);
        let tmp = tempfile::tempdir().unwrap();
        unzip(zip_file.path(), tmp.path(), 1024).unwrap();
        assert_eq!(std::fs::read_to_string(tmp.path().join("a.txt")).unwrap(), "hello");
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("nested/b.txt")).unwrap(),
            "world"
        );
    }
}
