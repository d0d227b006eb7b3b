//! Normalized relative paths
//!
//! Every file the engine tracks is identified by a `RelativePath`: a
//! forward-slash path relative to the sync root, NFC-normalized, guaranteed
//! not to escape the root and to be representable on every supported OS.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use unicode_normalization::UnicodeNormalization;

/// Characters rejected because they are invalid on at least one target OS
const FORBIDDEN_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*'];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path is absolute: {0}")]
    Absolute(String),
    #[error("path escapes the sync root: {0}")]
    EscapesRoot(String),
    #[error("path contains forbidden character {ch:?}: {path}")]
    ForbiddenChar { path: String, ch: char },
    #[error("path component ends with dot or space: {0}")]
    TrailingDotOrSpace(String),
    #[error("path is not relative to the sync root: {0}")]
    OutsideRoot(String),
    #[error("path is not valid unicode: {0}")]
    NotUnicode(String),
}

/// A normalized forward-slash path relative to the sync root
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelativePath(String);

impl RelativePath {
    /// Validate and normalize a raw path string.
    ///
    /// Backslashes are treated as separators, redundant separators and `.`
    /// components are dropped, and the result is unicode NFC-normalized.
    ///
    /// # Errors
    /// Returns an error if the path is empty, absolute, escapes the root, or
    /// contains characters invalid on a supported OS.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        let unified = raw.replace('\\', "/");
        if unified.starts_with('/') {
            return Err(PathError::Absolute(raw.to_string()));
        }

        let mut components = Vec::new();
        for component in unified.split('/') {
            match component {
                "" | "." => continue,
                ".." => return Err(PathError::EscapesRoot(raw.to_string())),
                _ => {}
            }
            for ch in component.chars() {
                if FORBIDDEN_CHARS.contains(&ch) || ch.is_control() {
                    return Err(PathError::ForbiddenChar {
                        path: raw.to_string(),
                        ch,
                    });
                }
            }
            if component.ends_with('.') || component.ends_with(' ') {
                return Err(PathError::TrailingDotOrSpace(raw.to_string()));
            }
            components.push(component);
        }

        if components.is_empty() {
            return Err(PathError::Empty);
        }

        let normalized: String = components.join("/").nfc().collect();
        Ok(Self(normalized))
    }

    /// Build from an absolute filesystem path and the sync root it lives under
    ///
    /// # Errors
    /// Returns an error if `path` is not under `root` or fails validation
    pub fn from_fs_path(path: &Path, root: &Path) -> Result<Self, PathError> {
        let relative = path
            .strip_prefix(root)
            .map_err(|_| PathError::OutsideRoot(path.display().to_string()))?;
        let s = relative
            .to_str()
            .ok_or_else(|| PathError::NotUnicode(path.display().to_string()))?;
        Self::new(s)
    }

    /// The normalized path string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve against a sync root to get the on-disk path
    #[must_use]
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for component in self.0.split('/') {
            out.push(component);
        }
        out
    }

    /// Final path component
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelativePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelativePath({})", self.0)
    }
}

impl Serialize for RelativePath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelativePath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_path() {
        let p = RelativePath::new("docs/notes.txt").unwrap();
        assert_eq!(p.as_str(), "docs/notes.txt");
        assert_eq!(p.file_name(), "notes.txt");
    }

    #[test]
    fn test_backslash_normalized() {
        let p = RelativePath::new("docs\\sub\\file.md").unwrap();
        assert_eq!(p.as_str(), "docs/sub/file.md");
    }

    #[test]
    fn test_redundant_separators_dropped() {
        let p = RelativePath::new("a//b/./c.txt").unwrap();
        assert_eq!(p.as_str(), "a/b/c.txt");
    }

    #[test]
    fn test_rejects_escape() {
        assert_eq!(
            RelativePath::new("../outside.txt"),
            Err(PathError::EscapesRoot("../outside.txt".to_string()))
        );
        assert!(RelativePath::new("a/../../b").is_err());
    }

    #[test]
    fn test_rejects_absolute() {
        assert!(RelativePath::new("/etc/passwd").is_err());
    }

    #[test]
    fn test_rejects_forbidden_chars() {
        assert!(RelativePath::new("bad:name.txt").is_err());
        assert!(RelativePath::new("what?.txt").is_err());
        assert!(RelativePath::new("pipe|file").is_err());
    }

    #[test]
    fn test_rejects_trailing_dot_or_space() {
        assert!(RelativePath::new("dir./file").is_err());
        assert!(RelativePath::new("file ").is_err());
    }

    #[test]
    fn test_nfc_normalization() {
        // "é" as e + combining acute vs precomposed
        let decomposed = RelativePath::new("caf\u{0065}\u{0301}.txt").unwrap();
        let precomposed = RelativePath::new("caf\u{00e9}.txt").unwrap();
        assert_eq!(decomposed, precomposed);
    }

    #[test]
    fn test_fs_roundtrip() {
        let root = Path::new("/sync");
        let p = RelativePath::new("a/b.txt").unwrap();
        let fs = p.to_fs_path(root);
        assert_eq!(fs, PathBuf::from("/sync/a/b.txt"));
        let back = RelativePath::from_fs_path(&fs, root).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn test_from_fs_path_outside_root() {
        assert!(RelativePath::from_fs_path(Path::new("/other/x"), Path::new("/sync")).is_err());
    }
}
