//! Folder-name exclusion rules.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Component, Path};

/// Folder names whose subtrees are left out of archives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    names: HashSet<String>,
}

impl ExclusionSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|name: &String| !name.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Exact, case-sensitive match against one path component.
    pub fn contains(&self, name: &OsStr) -> bool {
        name.to_str().is_some_and(|name| self.names.contains(name))
    }
}

impl<S: Into<String>> FromIterator<S> for ExclusionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// Returns true if any component of `path` is one of the excluded names.
pub fn should_exclude(path: &Path, exclusions: &ExclusionSet) -> bool {
    if exclusions.is_empty() {
        return false;
    }

    path.components().any(|component| match component {
        Component::Normal(name) => exclusions.contains(name),
        _ => false,
    })
}
