//! Path canonicalization collaborator
//!
//! The engine identifies modules by the canonical path of the file they were loaded from, so
//! that differently spelled references to one file share a single node.

use crate::common::{decanonicalize, path_to_string, LookupError};
use fs_err as fs;
use std::path::{Component, Path, PathBuf};

pub trait PathCanonicalizer {
    /// Absolute, normalized form of a possibly relative path
    fn canonicalize(&self, raw: &Path) -> Result<PathBuf, LookupError>;
}

/// Resolves relative paths against a base directory
///
/// Existing files get the file system's canonical form, which resolves links and aliases;
/// anything else is normalized lexically.
#[derive(Clone, Debug)]
pub struct AbsolutePathCanonicalizer {
    base: PathBuf,
}

impl AbsolutePathCanonicalizer {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_owned(),
        }
    }

    pub fn from_current_dir() -> Result<Self, LookupError> {
        Ok(Self::new(std::env::current_dir()?))
    }
}

impl PathCanonicalizer for AbsolutePathCanonicalizer {
    fn canonicalize(&self, raw: &Path) -> Result<PathBuf, LookupError> {
        if raw.as_os_str().is_empty() {
            return Err(LookupError::CanonicalizationError {
                path: String::new(),
                reason: "empty path".to_owned(),
            });
        }
        let joined = if raw.is_absolute() {
            raw.to_owned()
        } else {
            self.base.join(raw)
        };
        if joined.exists() {
            return fs::canonicalize(&joined).map_err(|e| LookupError::CanonicalizationError {
                path: path_to_string(raw),
                reason: e.to_string(),
            });
        }
        let normalized = normalize_lexically(&joined);
        if !normalized.is_absolute() {
            return Err(LookupError::CanonicalizationError {
                path: path_to_string(raw),
                reason: "base directory is not absolute".to_owned(),
            });
        }
        Ok(normalized)
    }
}

/// Drop `.` components and fold `..` into their parent, without touching the file system
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir) | Some(Component::Prefix(_))
                ) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Identity of a canonical path: module file names are case-insensitive on the target platform
pub fn identity_key(canonical: &Path) -> String {
    decanonicalize(&path_to_string(canonical)).to_lowercase()
}
