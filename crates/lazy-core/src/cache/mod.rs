//! Captures and restores a task's declared output files on disk, keyed per
//! task rather than by a shared content-addressed archive. Capture copies
//! matched files into a per-task output directory and writes a manifest of
//! their relative paths and mtimes; restore replays that manifest back onto
//! the working tree and sweeps away files that no longer belong.

use std::{
    collections::BTreeSet,
    time::{Duration, SystemTime},
};

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::warn;

use crate::{manifest, paths::ProjectPath};

#[derive(Debug, Error)]
pub enum Error {
    #[error("output path `{0}` resolves outside the project root")]
    EscapesRoot(String),
    #[error("I/O error on `{0}`: {1}")]
    Io(Utf8PathBuf, #[source] std::io::Error),
}

/// `{relPath}\t{mtimeMillis}\n` lines, sorted by path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputManifest {
    entries: Vec<(ProjectPath, i64)>,
}

impl OutputManifest {
    pub fn new(mut entries: Vec<(ProjectPath, i64)>) -> Self {
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        Self { entries }
    }

    pub fn entries(&self) -> &[(ProjectPath, i64)] {
        &self.entries
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for (path, mtime) in &self.entries {
            out.push_str(path.as_str());
            out.push('\t');
            out.push_str(&mtime.to_string());
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn parse(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let (path, mtime) = line.split_once('\t')?;
                let rel = ProjectPath::from_system(path).ok()?;
                Some((rel, mtime.parse().ok()?))
            })
            .collect();
        Self::new(entries)
    }
}

/// What happened to one file during [`restore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreAction {
    Restored,
    Overwritten,
    Unchanged,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<ProjectPath>,
    pub stale_removed: Vec<ProjectPath>,
}

/// Resolves a task's output patterns into concrete project-root-relative
/// paths, rejecting anything that escapes the root.
pub fn resolve_output_paths(
    root: &camino::Utf8PathBuf,
    workspace_dir: &camino::Utf8PathBuf,
    patterns: &[String],
) -> Result<Vec<ProjectPath>, Error> {
    let mut matched = BTreeSet::new();
    for pattern in patterns {
        let anchored = anchor_pattern(root, workspace_dir, pattern);
        let full_pattern = format!("{}/{}", root, anchored.trim_start_matches('/'));
        for entry in glob::glob(&full_pattern)
            .map_err(|e| Error::Io(Utf8PathBuf::from(full_pattern.clone()), io_error(e)))?
        {
            let path = entry.map_err(|e| Error::Io(Utf8PathBuf::from(pattern.clone()), e.into_error()))?;
            let utf8 = Utf8PathBuf::from_path_buf(path).map_err(|p| Error::Io(p.to_string_lossy().into(), not_utf8()))?;
            if !utf8.is_file() {
                continue;
            }
            let relative = utf8
                .strip_prefix(root)
                .map_err(|_| Error::EscapesRoot(utf8.to_string()))?;
            let rel_str = relative.as_str();
            if rel_str.starts_with("..") {
                return Err(Error::EscapesRoot(rel_str.to_string()));
            }
            matched.insert(ProjectPath::from_system(rel_str).map_err(|_| Error::EscapesRoot(rel_str.to_string()))?);
        }
    }
    Ok(matched.into_iter().collect())
}

fn anchor_pattern(root: &camino::Utf8PathBuf, workspace_dir: &camino::Utf8PathBuf, pattern: &str) -> String {
    if let Some(rooted) = pattern.strip_prefix("<rootDir>/") {
        return rooted.to_string();
    }
    let p = camino::Utf8Path::new(pattern);
    if p.is_absolute() {
        p.strip_prefix(root)
            .map(|rel| rel.to_string())
            .unwrap_or_else(|_| pattern.to_string())
    } else {
        workspace_dir
            .strip_prefix(root)
            .map(|rel| rel.join(pattern).to_string())
            .unwrap_or_else(|_| pattern.to_string())
    }
}

fn io_error(e: glob::PatternError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
}
fn not_utf8() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, "non-utf8 path")
}

/// Captures a task's outputs after a successful run.
#[tracing::instrument(skip(root, output_paths), fields(outputs = output_paths.len()))]
pub fn capture(
    root: &camino::Utf8PathBuf,
    output_dir: &Utf8PathBuf,
    output_manifest_path: &Utf8PathBuf,
    output_paths: &[ProjectPath],
) -> Result<(), Error> {
    if output_dir.exists() {
        std::fs::remove_dir_all(output_dir).map_err(|e| Error::Io(output_dir.clone(), e))?;
    }
    if output_manifest_path.exists() {
        std::fs::remove_file(output_manifest_path).map_err(|e| Error::Io(output_manifest_path.clone(), e))?;
    }

    let mut entries = Vec::with_capacity(output_paths.len());
    for rel in output_paths {
        let src = root.join(rel.as_str());
        let dst = output_dir.join(rel.as_str());
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Io(parent.to_path_buf(), e))?;
        }
        std::fs::copy(&src, &dst).map_err(|e| Error::Io(src.clone(), e))?;
        let metadata = std::fs::metadata(&src).map_err(|e| Error::Io(src.clone(), e))?;
        let mtime_millis = manifest::mtime_millis(&metadata);
        set_mtime(&dst, mtime_millis).map_err(|e| Error::Io(dst.clone(), e))?;
        entries.push((rel.clone(), mtime_millis));
    }

    let output_manifest = OutputManifest::new(entries);
    persist_output_manifest(&output_manifest, output_manifest_path)?;
    Ok(())
}

fn persist_output_manifest(manifest: &OutputManifest, path: &Utf8PathBuf) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::Io(parent.to_path_buf(), e))?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    std::fs::write(&tmp, manifest.to_bytes()).map_err(|e| Error::Io(path.clone(), e))?;
    std::fs::rename(&tmp, path).map_err(|e| Error::Io(path.clone(), e))?;
    Ok(())
}

pub fn load_output_manifest(path: &Utf8PathBuf) -> Result<Option<OutputManifest>, Error> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(OutputManifest::parse(&text))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(path.clone(), e)),
    }
}

/// Restores a cache hit's outputs onto disk, including the stale-output
/// sweep for files no longer declared by the cached manifest.
#[tracing::instrument(skip(root, output_manifest, current_on_disk))]
pub fn restore(
    root: &camino::Utf8PathBuf,
    output_dir: &Utf8PathBuf,
    output_manifest: &OutputManifest,
    current_on_disk: &[ProjectPath],
) -> Result<RestoreReport, Error> {
    let manifest_paths: BTreeSet<&ProjectPath> = output_manifest.entries().iter().map(|(p, _)| p).collect();
    let mut report = RestoreReport::default();

    for on_disk in current_on_disk {
        if !manifest_paths.contains(on_disk) {
            let abs = root.join(on_disk.as_str());
            if abs.exists() {
                std::fs::remove_file(&abs).map_err(|e| Error::Io(abs.clone(), e))?;
            }
            warn!(path = %on_disk, "removing stale output not present in cached manifest");
            report.stale_removed.push(on_disk.clone());
        }
    }

    for (rel, mtime_millis) in output_manifest.entries() {
        let dst = root.join(rel.as_str());
        let src = output_dir.join(rel.as_str());
        let action = if !dst.exists() {
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::Io(parent.to_path_buf(), e))?;
            }
            std::fs::copy(&src, &dst).map_err(|e| Error::Io(src.clone(), e))?;
            set_mtime(&dst, *mtime_millis).map_err(|e| Error::Io(dst.clone(), e))?;
            RestoreAction::Restored
        } else {
            let current_mtime = std::fs::metadata(&dst)
                .map(|m| manifest::mtime_millis(&m))
                .map_err(|e| Error::Io(dst.clone(), e))?;
            if current_mtime != *mtime_millis {
                std::fs::copy(&src, &dst).map_err(|e| Error::Io(src.clone(), e))?;
                set_mtime(&dst, *mtime_millis).map_err(|e| Error::Io(dst.clone(), e))?;
                RestoreAction::Overwritten
            } else {
                RestoreAction::Unchanged
            }
        };
        if !matches!(action, RestoreAction::Unchanged) {
            report.restored.push(rel.clone());
        }
    }

    Ok(report)
}

fn set_mtime(path: &Utf8PathBuf, mtime_millis: i64) -> std::io::Result<()> {
    let file = std::fs::File::open(path)?;
    let time = SystemTime::UNIX_EPOCH + Duration::from_millis(mtime_millis.max(0) as u64);
    file.set_modified(time)
}

#[cfg(test)]
mod test {
    use tempfile::tempdir;

    use super::*;

    fn write(path: &Utf8PathBuf, contents: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn capture_then_restore_preserves_mtime() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let out_file = root.join("pkg/out.txt");
        write(&out_file, "hello");
        set_mtime(&out_file, 1_700_000_000_000).unwrap();

        let cache_dir = root.join(".lazy/build/output");
        let output_manifest_path = root.join(".lazy/build/output-manifest.tsv");
        let rel = ProjectPath::from_system("pkg/out.txt").unwrap();
        capture(&root, &cache_dir, &output_manifest_path, &[rel.clone()]).unwrap();

        std::fs::remove_file(&out_file).unwrap();

        let output_manifest = load_output_manifest(&output_manifest_path).unwrap().unwrap();
        let report = restore(&root, &cache_dir, &output_manifest, &[]).unwrap();
        assert_eq!(report.restored, vec![rel]);

        let metadata = std::fs::metadata(&out_file).unwrap();
        assert_eq!(manifest::mtime_millis(&metadata), 1_700_000_000_000);
    }

    #[test]
    fn restore_sweeps_stale_files_not_in_manifest() {
        let dir = tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let cache_dir = root.join(".lazy/build/output");
        let output_manifest = OutputManifest::new(Vec::new());

        let stray = root.join("pkg/banana.txt");
        write(&stray, "unexpected");
        let stray_rel = ProjectPath::from_system("pkg/banana.txt").unwrap();

        let report = restore(&root, &cache_dir, &output_manifest, &[stray_rel.clone()]).unwrap();
        assert_eq!(report.stale_removed, vec![stray_rel]);
        assert!(!stray.exists());
    }
}
