//! Builds and fingerprints the sorted, typed record of a task's inputs:
//! upstream dependency fingerprints, file content hashes, and hashed
//! environment variable values. The manifest is a plain, parseable
//! tab-separated document rather than an opaque hash, so it can be read
//! back to drive the reuse optimization in [`hash_files`].

mod hashing;

use std::{
    collections::BTreeMap,
    time::SystemTime,
};

use camino::Utf8PathBuf;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use hashing::{hash_bytes, hash_file};

use crate::paths::ProjectPath;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read input file `{0}`: {1}")]
    ReadFile(Utf8PathBuf, #[source] std::io::Error),
    #[error("failed to persist manifest `{0}`: {1}")]
    WriteManifest(Utf8PathBuf, #[source] std::io::Error),
    #[error("failed to read previous manifest `{0}`: {1}")]
    ReadManifest(Utf8PathBuf, #[source] std::io::Error),
    #[error("failed to enumerate inputs under `{0}`: {1}")]
    Enumerate(Utf8PathBuf, #[source] std::io::Error),
}

/// One line of an [`InputManifest`], ordered `upstream < file < env`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLine {
    Upstream { dep_key: String, fingerprint: String },
    File { rel_path: ProjectPath, sha256: String, mtime_millis: i64 },
    Env { name: String, value: String },
}

impl ManifestLine {
    fn sort_key(&self) -> (u8, &str) {
        match self {
            ManifestLine::Upstream { dep_key, .. } => (0, dep_key.as_str()),
            ManifestLine::File { rel_path, .. } => (1, rel_path.as_str()),
            ManifestLine::Env { name, .. } => (2, name.as_str()),
        }
    }

    fn serialize(&self, out: &mut String) {
        match self {
            ManifestLine::Upstream { dep_key, fingerprint } => {
                out.push_str("upstream\t");
                out.push_str(dep_key);
                out.push('\t');
                out.push_str(fingerprint);
            }
            ManifestLine::File { rel_path, sha256, mtime_millis } => {
                out.push_str("file\t");
                out.push_str(rel_path.as_str());
                out.push('\t');
                out.push_str(sha256);
                out.push('\t');
                out.push_str(&mtime_millis.to_string());
            }
            ManifestLine::Env { name, value } => {
                out.push_str("env\t");
                out.push_str(name);
                out.push('\t');
                out.push_str(value);
            }
        }
        out.push('\n');
    }
}

/// The deterministic, sorted document whose sha256 is a task's fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InputManifest {
    lines: Vec<ManifestLine>,
}

impl InputManifest {
    pub fn new(mut lines: Vec<ManifestLine>) -> Self {
        lines.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self { lines }
    }

    pub fn lines(&self) -> &[ManifestLine] {
        &self.lines
    }

    /// Serializes to sorted, tab-separated, newline-terminated bytes with no
    /// trailing blank line.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for line in &self.lines {
            line.serialize(&mut out);
        }
        out.into_bytes()
    }

    /// The sha256 of the serialized bytes.
    pub fn fingerprint(&self) -> String {
        hash_bytes(&self.to_bytes())
    }

    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let mut parts = raw.split('\t');
            match parts.next() {
                Some("upstream") => {
                    if let (Some(dep_key), Some(fingerprint)) = (parts.next(), parts.next()) {
                        lines.push(ManifestLine::Upstream {
                            dep_key: dep_key.to_string(),
                            fingerprint: fingerprint.to_string(),
                        });
                    }
                }
                Some("file") => {
                    if let (Some(rel), Some(sha), Some(mtime)) =
                        (parts.next(), parts.next(), parts.next())
                    {
                        if let (Ok(rel_path), Ok(mtime_millis)) =
                            (ProjectPath::from_system(rel), mtime.parse())
                        {
                            lines.push(ManifestLine::File {
                                rel_path,
                                sha256: sha.to_string(),
                                mtime_millis,
                            });
                        }
                    }
                }
                Some("env") => {
                    if let (Some(name), Some(value)) = (parts.next(), parts.next()) {
                        lines.push(ManifestLine::Env {
                            name: name.to_string(),
                            value: value.to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        // Already sorted on disk, but re-sort defensively in case a prior
        // version wrote a different order.
        Self::new(lines)
    }

    /// The previously hashed sha256 and mtime for a path, used by
    /// [`hash_files`]'s reuse optimization.
    fn file_record(&self, path: &ProjectPath) -> Option<(&str, i64)> {
        self.lines.iter().find_map(|l| match l {
            ManifestLine::File { rel_path, sha256, mtime_millis } if rel_path == path => {
                Some((sha256.as_str(), *mtime_millis))
            }
            _ => None,
        })
    }
}

/// A single discovered input file, with a hash inherited from the previous
/// manifest when its size and mtime are unchanged.
pub struct HashedFile {
    pub rel_path: ProjectPath,
    pub sha256: String,
    pub mtime_millis: i64,
}

/// Hashes `files` (absolute paths, already filtered by include/exclude
/// patterns by the caller), reusing hashes from `previous` when size and
/// mtime match.
#[tracing::instrument(skip_all, fields(candidates = files.len()))]
pub fn hash_files(
    files: &BTreeMap<ProjectPath, Utf8PathBuf>,
    previous: Option<&InputManifest>,
) -> Result<Vec<HashedFile>, Error> {
    let mut out = Vec::with_capacity(files.len());
    let mut reused = 0usize;
    for (rel_path, abs_path) in files {
        let metadata = std::fs::metadata(abs_path)
            .map_err(|e| Error::ReadFile(abs_path.clone(), e))?;
        let mtime_millis = mtime_millis(&metadata);
        let size = metadata.len();

        let reuse = previous.and_then(|manifest| {
            manifest.file_record(rel_path).and_then(|(sha, prev_mtime)| {
                (prev_mtime == mtime_millis && size_matches(abs_path, size))
                    .then(|| sha.to_string())
            })
        });

        let sha256 = match reuse {
            Some(sha) => {
                reused += 1;
                sha
            }
            None => hash_file(abs_path).map_err(|e| Error::ReadFile(abs_path.clone(), e))?,
        };

        out.push(HashedFile {
            rel_path: rel_path.clone(),
            sha256,
            mtime_millis,
        });
    }
    tracing::debug!(hashed = out.len() - reused, reused, "hashed input files");
    Ok(out)
}

fn size_matches(path: &Utf8PathBuf, expected: u64) -> bool {
    std::fs::metadata(path)
        .map(|m| m.len() == expected)
        .unwrap_or(false)
}

pub fn mtime_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Writes `manifest` atomically to `path` via a temp file and rename.
pub fn persist(manifest: &InputManifest, path: &Utf8PathBuf) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::WriteManifest(path.clone(), e))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, manifest.to_bytes()).map_err(|e| Error::WriteManifest(path.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::WriteManifest(path.clone(), e))?;
    Ok(())
}

pub fn load(path: &Utf8PathBuf) -> Result<Option<InputManifest>, Error> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(InputManifest::parse(&text))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::ReadManifest(path.clone(), e)),
    }
}

/// Computes a stable hash for a single environment variable's value.
pub fn hash_env_value(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    fn file(path: &str, sha: &str, mtime: i64) -> ManifestLine {
        ManifestLine::File {
            rel_path: ProjectPath::from_system(path).unwrap(),
            sha256: sha.to_string(),
            mtime_millis: mtime,
        }
    }

    #[test]
    fn serialization_is_sorted_upstream_file_env() {
        let manifest = InputManifest::new(vec![
            ManifestLine::Env { name: "NODE_ENV".into(), value: "abc".into() },
            file("b.txt", "sha_b", 1),
            ManifestLine::Upstream { dep_key: "build::/repo/core".into(), fingerprint: "f1".into() },
            file("a.txt", "sha_a", 2),
        ]);

        let text = String::from_utf8(manifest.to_bytes()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "upstream\tbuild::/repo/core\tf1",
                "file\ta.txt\tsha_a\t2",
                "file\tb.txt\tsha_b\t1",
                "env\tNODE_ENV\tabc",
            ]
        );
        assert!(!text.ends_with("\n\n"));
    }

    #[test]
    fn fingerprint_is_deterministic_regardless_of_input_order() {
        let a = InputManifest::new(vec![file("a.txt", "x", 1), file("b.txt", "y", 2)]);
        let b = InputManifest::new(vec![file("b.txt", "y", 2), file("a.txt", "x", 1)]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn parse_round_trips_through_bytes() {
        let manifest = InputManifest::new(vec![
            file("a.txt", "sha", 42),
            ManifestLine::Env { name: "X".into(), value: "1".into() },
            ManifestLine::Upstream { dep_key: "k".into(), fingerprint: "fp".into() },
        ]);
        let text = String::from_utf8(manifest.to_bytes()).unwrap();
        let reparsed = InputManifest::parse(&text);
        assert_eq!(manifest, reparsed);
    }
}
