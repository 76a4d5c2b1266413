//! Dedup markers and the two files written per recovered link.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::constants::{OUTPUT_EXTENSION, RECOVERED_SUFFIX};

/// Lowercase hex SHA-256 of the link string.
pub fn link_hash(link: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(link.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub hash: String,
    pub original: PathBuf,
    pub recovered: PathBuf,
}

impl OutputPaths {
    pub fn for_link(output_dir: &Path, link: &str) -> Self {
        let hash = link_hash(link);
        let original = output_dir.join(format!("{hash}.{OUTPUT_EXTENSION}"));
        let recovered = output_dir.join(format!("{hash}{RECOVERED_SUFFIX}.{OUTPUT_EXTENSION}"));
        Self {
            hash,
            original,
            recovered,
        }
    }

    /// The recovered file is the marker: it is written last.
    pub fn is_done(&self) -> bool {
        self.recovered.is_file()
    }

    /// Write the original bytes, then publish the recovered bytes with a rename
    /// so the marker never exists half-written.
    pub fn persist(&self, original: &[u8], recovered: &[u8]) -> io::Result<()> {
        fs::write(&self.original, original)?;

        let staging = self.recovered.with_extension("part");
        {
            let mut file = fs::File::create(&staging)?;
            file.write_all(recovered)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&staging, &self.recovered) {
            let _ = fs::remove_file(&staging);
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex() {
        let hash = link_hash("https://cdn.test/a.png");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, link_hash("https://cdn.test/a.png"));
        assert_ne!(hash, link_hash("https://cdn.test/b.png"));
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn empty_link_hash_matches_sha256_of_nothing() {
        assert_eq!(
            link_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn persist_writes_both_files_and_sets_marker() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = OutputPaths::for_link(dir.path(), "https://cdn.test/a.png");
        assert!(!paths.is_done());

        paths.persist(b"original", b"recovered").expect("persist");

        assert!(paths.is_done());
        assert_eq!(fs::read(&paths.original).expect("read"), b"original");
        assert_eq!(fs::read(&paths.recovered).expect("read"), b"recovered");
        assert!(
            paths
                .recovered
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with("-recovered.png"))
        );
        assert!(!paths.recovered.with_extension("part").exists());
    }
}
