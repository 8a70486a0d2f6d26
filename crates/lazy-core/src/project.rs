//! The project model: workspaces and the lookups the core needs over them.
//!
//! Workspace discovery itself lives outside this crate; this module only
//! defines the shape the core depends on through the [`Project`] trait.

use std::collections::HashMap;

use camino::Utf8Path;

use crate::paths::AbsPath;

/// A single package within the monorepo. Identity is its directory.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub dir: AbsPath,
    pub name: String,
    pub scripts: HashMap<String, String>,
    pub local_dependencies: Vec<String>,
}

impl Workspace {
    pub fn declares_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

impl PartialEq for Workspace {
    fn eq(&self, other: &Self) -> bool {
        self.dir == other.dir
    }
}
impl Eq for Workspace {}

/// Collaborator contract consumed by the core.
pub trait Project {
    fn root_dir(&self) -> &AbsPath;
    fn workspaces(&self) -> &[Workspace];
    fn workspace_by_dir(&self, dir: &Utf8Path) -> Option<&Workspace>;
    fn workspace_by_name(&self, name: &str) -> Option<&Workspace>;
    fn is_top_level_script(&self, script: &str) -> bool;
}

/// A simple in-memory implementation sufficient for the core's own tests and
/// for the reference `lazy-cli` config loader.
#[derive(Debug, Clone)]
pub struct StaticProject {
    root_dir: AbsPath,
    workspaces: Vec<Workspace>,
    top_level_scripts: Vec<String>,
}

impl StaticProject {
    pub fn new(root_dir: AbsPath, workspaces: Vec<Workspace>, top_level_scripts: Vec<String>) -> Self {
        Self {
            root_dir,
            workspaces,
            top_level_scripts,
        }
    }
}

impl Project for StaticProject {
    fn root_dir(&self) -> &AbsPath {
        &self.root_dir
    }

    fn workspaces(&self) -> &[Workspace] {
        &self.workspaces
    }

    fn workspace_by_dir(&self, dir: &Utf8Path) -> Option<&Workspace> {
        self.workspaces
            .iter()
            .find(|w| w.dir.as_path() == dir)
    }

    fn workspace_by_name(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.iter().find(|w| w.name == name)
    }

    fn is_top_level_script(&self, script: &str) -> bool {
        self.top_level_scripts.iter().any(|s| s == script)
    }
}
