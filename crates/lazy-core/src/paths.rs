//! Path newtypes used throughout lazy-core.
//!
//! Keeps absolute filesystem paths and root-relative paths as distinct
//! types rather than passing `Utf8PathBuf` everywhere: confusing the two is
//! exactly the class of bug that makes a manifest serialize differently
//! across machines.

use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use path_slash::{PathBufExt, PathExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is not valid UTF-8")]
    NonUtf8,
    #[error("path `{0}` is not absolute")]
    NotAbsolute(PathBuf),
    #[error("path `{0}` escapes its root")]
    Escapes(Utf8PathBuf),
}

/// An absolute, platform-native path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsPath(Utf8PathBuf);

impl AbsPath {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = path.as_ref();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.to_path_buf()));
        }
        let utf8 = Utf8PathBuf::from_path_buf(path.to_path_buf()).map_err(|_| PathError::NonUtf8)?;
        Ok(Self(utf8))
    }

    pub fn as_path(&self) -> &Utf8Path {
        &self.0
    }

    pub fn as_std_path(&self) -> &Path {
        self.0.as_std_path()
    }

    pub fn join(&self, component: &str) -> AbsPath {
        AbsPath(self.0.join(component))
    }

    /// Strips `root` off `self`, producing a root-relative path with `/`
    /// separators regardless of platform.
    pub fn anchor_at(&self, root: &AbsPath) -> Result<ProjectPath, PathError> {
        let relative = self
            .0
            .strip_prefix(&root.0)
            .map_err(|_| PathError::Escapes(self.0.clone()))?;
        ProjectPath::from_system(relative.as_str())
    }
}

impl std::fmt::Display for AbsPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A path relative to the project root, always stored with forward slashes
/// so that manifests serialize identically on every platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectPath(String);

impl ProjectPath {
    /// Builds from a path using the host's native separators, normalizing to
    /// `/`. Rejects any path that climbs above the root via a leading `..`.
    pub fn from_system(path: &str) -> Result<Self, PathError> {
        let slashed = PathBuf::from_slash(path)
            .to_slash()
            .ok_or(PathError::NonUtf8)?
            .into_owned();
        if slashed.starts_with("..") {
            return Err(PathError::Escapes(Utf8PathBuf::from(slashed)));
        }
        Ok(Self(slashed))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn resolve(&self, root: &AbsPath) -> AbsPath {
        AbsPath(root.0.join(&self.0))
    }
}

impl std::fmt::Display for ProjectPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn anchor_normalizes_to_forward_slashes() {
        let root = AbsPath::new("/repo").unwrap();
        let file = AbsPath::new("/repo/packages/core/src/lib.rs").unwrap();
        let rel = file.anchor_at(&root).unwrap();
        assert_eq!(rel.as_str(), "packages/core/src/lib.rs");
    }

    #[test]
    fn rejects_parent_escape() {
        assert!(ProjectPath::from_system("../outside").is_err());
    }

    #[test]
    fn rejects_relative_root() {
        assert!(AbsPath::new("relative/path").is_err());
    }
}
