//! Canonical task identifiers: a delimited `"{scriptName}::{workspaceDir}"`
//! key that doubles as both map key and sort key.

use std::fmt;

pub const TASK_KEY_DELIMITER: &str = "::";

/// Uniquely identifies a (workspace, script) task within one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey(String);

impl TaskKey {
    pub fn new(script: &str, workspace_dir: &str) -> Self {
        Self(format!("{script}{TASK_KEY_DELIMITER}{workspace_dir}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits back into `(script, workspace_dir)`. Panics if the key was not
    /// produced by [`TaskKey::new`] — this is an internal invariant, not a
    /// user-facing parse.
    pub fn split(&self) -> (&str, &str) {
        self.0
            .split_once(TASK_KEY_DELIMITER)
            .expect("TaskKey is always script::workspaceDir")
    }

    pub fn script(&self) -> &str {
        self.split().0
    }

    pub fn workspace_dir(&self) -> &str {
        self.split().1
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("build", "/repo/packages/core"; "simple workspace dir")]
    #[test_case("test", "/repo"; "root workspace")]
    #[test_case("lint:fix", "/repo/apps/web"; "script name with a colon")]
    fn round_trips_script_and_workspace(script: &str, workspace_dir: &str) {
        let key = TaskKey::new(script, workspace_dir);
        assert_eq!(key.script(), script);
        assert_eq!(key.workspace_dir(), workspace_dir);
        assert_eq!(key.as_str(), format!("{script}{TASK_KEY_DELIMITER}{workspace_dir}"));
    }

    #[test]
    fn sorts_lexicographically() {
        let mut keys = vec![
            TaskKey::new("test", "/repo/b"),
            TaskKey::new("build", "/repo/a"),
            TaskKey::new("build", "/repo/b"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                TaskKey::new("build", "/repo/a"),
                TaskKey::new("build", "/repo/b"),
                TaskKey::new("test", "/repo/b"),
            ]
        );
    }
}
