//! Discovers the concrete files that feed a task's input manifest: the
//! baseline lockfile/config globals (spec.md §4.3 item 1) and the task's own
//! include/exclude glob patterns (item 2-3). Kept separate from
//! [`crate::manifest`] because that module only knows how to hash and
//! serialize files it is handed; deciding *which* files those are is a
//! glob-matching concern that belongs next to the rest of the pipeline.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::paths::{AbsPath, PathError, ProjectPath};

/// Package-manager lockfiles recognized as global inputs, in the order
/// they're probed. Only the first one found is used — a project has one
/// package manager, so at most one of these exists at a time.
const KNOWN_LOCKFILES: &[&str] = &[
    "pnpm-lock.yaml",
    "package-lock.json",
    "npm-shrinkwrap.json",
    "yarn.lock",
    "bun.lockb",
];

/// Finds the project's lockfile (whichever of [`KNOWN_LOCKFILES`] exists)
/// and any root-level `lazy.config.*` file. These are the implicit
/// baseline inputs every task picks up unless its config disables
/// `inherit_base_cache`.
pub fn discover_global_inputs(root: &AbsPath) -> Vec<AbsPath> {
    let mut found = Vec::new();

    for name in KNOWN_LOCKFILES {
        let candidate = root.join(name);
        if candidate.as_std_path().is_file() {
            found.push(candidate);
            break;
        }
    }

    if let Ok(entries) = std::fs::read_dir(root.as_std_path()) {
        let mut configs: Vec<AbsPath> = entries
            .filter_map(|e| e.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                name.starts_with("lazy.config.").then(|| root.join(&name))
            })
            .filter(|p| p.as_std_path().is_file())
            .collect();
        configs.sort_by(|a, b| a.as_path().cmp(b.as_path()));
        found.extend(configs);
    }

    found
}

/// Resolves a task's include/exclude cache-rule patterns into a set of
/// currently-existing files, keyed by their project-root-relative path.
///
/// Absolute patterns match directly; relative patterns are rooted at the
/// workspace directory for non-top-level tasks, or at the project root for
/// top-level ones. When `include` is empty and the task is not top-level,
/// the default is `{workspaceDir}/**/*` (spec.md §4.3 item 2).
pub fn resolve_task_inputs(
    root: &AbsPath,
    workspace_dir: &AbsPath,
    top_level: bool,
    include: &[String],
    exclude: &[String],
) -> Result<BTreeMap<ProjectPath, Utf8PathBuf>, Error> {
    let owned_default;
    let include_patterns: &[String] = if include.is_empty() && !top_level {
        owned_default = vec![format!("{workspace_dir}/**/*")];
        &owned_default
    } else {
        include
    };

    let mut matched: BTreeMap<ProjectPath, Utf8PathBuf> = BTreeMap::new();
    for pattern in include_patterns {
        let anchored = anchor(root, workspace_dir, top_level, pattern);
        for entry in glob::glob(&anchored).map_err(|e| Error::InvalidGlob(anchored.clone(), e))? {
            let path = entry.map_err(|e| Error::Glob(anchored.clone(), e))?;
            let utf8 = Utf8PathBuf::from_path_buf(path).map_err(|_| Error::NonUtf8)?;
            if !utf8.is_file() {
                continue;
            }
            let rel = utf8
                .strip_prefix(root.as_path())
                .map_err(|_| Error::Path(PathError::Escapes(utf8.clone())))?;
            let rel_path = ProjectPath::from_system(rel.as_str())?;
            matched.insert(rel_path, utf8);
        }
    }

    let exclude_patterns = exclude
        .iter()
        .map(|pattern| {
            let anchored = anchor(root, workspace_dir, top_level, pattern);
            glob::Pattern::new(&anchored).map_err(|e| Error::InvalidGlob(anchored, e))
        })
        .collect::<Result<Vec<_>, _>>()?;

    matched.retain(|_, abs| !exclude_patterns.iter().any(|p| p.matches(abs.as_str())));

    Ok(matched)
}

fn anchor(root: &AbsPath, workspace_dir: &AbsPath, top_level: bool, pattern: &str) -> String {
    if let Some(rooted) = pattern.strip_prefix("<rootDir>/") {
        return format!("{root}/{rooted}");
    }
    if Utf8Path::new(pattern).is_absolute() {
        return pattern.to_string();
    }
    if top_level {
        format!("{root}/{pattern}")
    } else {
        format!("{workspace_dir}/{pattern}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid glob pattern `{0}`: {1}")]
    InvalidGlob(String, #[source] glob::PatternError),
    #[error("failed to enumerate inputs matching `{0}`: {1}")]
    Glob(String, #[source] glob::GlobError),
    #[error("input path is not valid UTF-8")]
    NonUtf8,
    #[error(transparent)]
    Path(#[from] PathError),
}

#[cfg(test)]
mod test {
    use super::*;

    fn write(dir: &Utf8Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn default_include_covers_whole_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path()).unwrap();
        write(root.as_path(), "pkg/src/lib.rs", "fn main() {}");
        write(root.as_path(), "pkg/README.md", "hi");
        let workspace_dir = root.join("pkg");

        let files = resolve_task_inputs(&root, &workspace_dir, false, &[], &[]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.contains_key(&ProjectPath::from_system("pkg/src/lib.rs").unwrap()));
    }

    #[test]
    fn exclude_subtracts_from_include() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path()).unwrap();
        write(root.as_path(), "pkg/src/lib.rs", "fn main() {}");
        write(root.as_path(), "pkg/out.txt", "generated");
        let workspace_dir = root.join("pkg");

        let files =
            resolve_task_inputs(&root, &workspace_dir, false, &[], &["out.txt".to_string()])
                .unwrap();
        assert!(!files.contains_key(&ProjectPath::from_system("pkg/out.txt").unwrap()));
        assert!(files.contains_key(&ProjectPath::from_system("pkg/src/lib.rs").unwrap()));
    }

    #[test]
    fn discovers_lockfile_and_config_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsPath::new(dir.path()).unwrap();
        write(root.as_path(), "pnpm-lock.yaml", "lockfile");
        write(root.as_path(), "lazy.config.toml", "[x]");

        let globals = discover_global_inputs(&root);
        let names: Vec<&str> = globals
            .iter()
            .map(|p| p.as_path().file_name().unwrap())
            .collect();
        assert!(names.contains(&"pnpm-lock.yaml"));
        assert!(names.contains(&"lazy.config.toml"));
    }
}
