//! Ignore rules shared by the watcher and the scanner
//!
//! Gitignore-style matching via the `ignore` crate: built-in defaults, extra
//! patterns from configuration, and the `.syncignore` file at the sync root
//! (itself synchronized). Symlinks are never synchronized.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use tracing::warn;

use esync_core::config::SYNCIGNORE_FILE;

/// Patterns that are always ignored
pub const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".DS_Store",
    "Thumbs.db",
    "*.tmp",
    "*.swp",
    "*.swo",
    "~*",
    "*.esync-tmp",
];

/// Compiled ignore matcher for the sync root
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Build the matcher: defaults, then config patterns, then `.syncignore`
    /// if present. Invalid patterns are logged and skipped.
    #[must_use]
    pub fn load(root: &Path, extra_patterns: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(root);

        for pattern in DEFAULT_IGNORES {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!(pattern, error = %e, "skipping built-in ignore pattern");
            }
        }
        for pattern in extra_patterns {
            if let Err(e) = builder.add_line(None, pattern) {
                warn!(pattern, error = %e, "skipping configured ignore pattern");
            }
        }

        let syncignore = root.join(SYNCIGNORE_FILE);
        if syncignore.exists() {
            if let Some(e) = builder.add(&syncignore) {
                warn!(error = %e, "failed to load .syncignore");
            }
        }

        let matcher = builder.build().unwrap_or_else(|e| {
            warn!(error = %e, "ignore rules failed to compile, ignoring nothing");
            Gitignore::empty()
        });

        Self { matcher }
    }

    /// Whether a path (relative to the sync root) is excluded from sync
    #[must_use]
    pub fn is_ignored(&self, relative: &Path, is_dir: bool) -> bool {
        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_patterns() {
        let root = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(root.path(), &[]);

        assert!(rules.is_ignored(&PathBuf::from(".DS_Store"), false));
        assert!(rules.is_ignored(&PathBuf::from("editor.swp"), false));
        assert!(rules.is_ignored(&PathBuf::from("download.esync-tmp"), false));
        assert!(rules.is_ignored(&PathBuf::from(".git/config"), false));
        assert!(!rules.is_ignored(&PathBuf::from("notes.txt"), false));
    }

    #[test]
    fn test_config_patterns() {
        let root = tempfile::tempdir().unwrap();
        let rules = IgnoreRules::load(root.path(), &["*.log".to_string()]);
        assert!(rules.is_ignored(&PathBuf::from("debug.log"), false));
        assert!(rules.is_ignored(&PathBuf::from("sub/dir/debug.log"), false));
    }

    #[test]
    fn test_syncignore_file() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join(".syncignore"),
            "# build output\ntarget/\n*.bak\n",
        )
        .unwrap();

        let rules = IgnoreRules::load(root.path(), &[]);
        assert!(rules.is_ignored(&PathBuf::from("target/debug/app"), false));
        assert!(rules.is_ignored(&PathBuf::from("old.bak"), false));
        assert!(!rules.is_ignored(&PathBuf::from("src/main.rs"), false));
        // .syncignore itself is synchronized
        assert!(!rules.is_ignored(&PathBuf::from(".syncignore"), false));
    }

    #[test]
    fn test_negation() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join(".syncignore"), "*.log\n!keep.log\n").unwrap();
        let rules = IgnoreRules::load(root.path(), &[]);
        assert!(rules.is_ignored(&PathBuf::from("other.log"), false));
        assert!(!rules.is_ignored(&PathBuf::from("keep.log"), false));
    }
}
