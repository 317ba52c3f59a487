//! Global configuration shared by all commands.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Separator of entries in [`crate::constants::ENV_PATH`].
pub const PATH_LIST_SEP: char = ':';

/// Ordered, de-duplicated list of directories searched for compiled type indexes
/// and other user artifacts. The working directory always comes first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPaths(Vec<PathBuf>);

impl LookupPaths {
    /// Builds the list from explicit `--path` options, prepending `cwd`.
    #[must_use]
    pub fn new(cwd: &Path, extra: &[PathBuf]) -> Self {
        let mut out = Self(Vec::with_capacity(extra.len() + 1));
        out.push(cwd.to_path_buf());
        for p in extra {
            out.push(p.clone());
        }
        out
    }

    /// Appends a path unless it is already listed.
    pub fn push(&mut self, path: PathBuf) {
        if !self.0.contains(&path) {
            self.0.push(path);
        }
    }

    /// Paths in lookup order.
    #[must_use]
    pub fn as_slice(&self) -> &[PathBuf] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwd_comes_first_and_duplicates_are_dropped() {
        let cwd = PathBuf::from("/work");
        let extra = vec![PathBuf::from("/a"), PathBuf::from("/work"), PathBuf::from("/a")];
        let paths = LookupPaths::new(&cwd, &extra);
        assert_eq!(paths.as_slice(), &[PathBuf::from("/work"), PathBuf::from("/a")]);
    }
}
