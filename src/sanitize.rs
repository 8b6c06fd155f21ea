//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Central path-sanitizing utility (spec §9 Design Notes). Every archive
//! extraction path — update packages and offline bundles alike — must clean
//! entry paths through here; a cleaned path containing a parent-directory
//! segment is rejected, never silently dropped.

use crate::error::{ErrorKind, Result, UpdateError};
use std::path::{Component, Path, PathBuf};

const COMPONENT: &str = "sanitize";

/// Clean an archive entry path and join it under `root`, rejecting any entry
/// whose cleaned path contains a `..` segment, is absolute, or is empty.
pub fn sanitized_join(root: &Path, entry_path: &str) -> Result<PathBuf> {
    let candidate = Path::new(entry_path);
    let mut cleaned = PathBuf::new();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => cleaned.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(UpdateError::new(
                    ErrorKind::ValidationFailure,
                    COMPONENT,
                    "sanitized_join",
                    format!("archive entry path escapes destination: {entry_path:?}"),
                ));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(UpdateError::new(
                    ErrorKind::ValidationFailure,
                    COMPONENT,
                    "sanitized_join",
                    format!("archive entry path must be relative: {entry_path:?}"),
                ));
            }
        }
    }

    if cleaned.as_os_str().is_empty() {
        return Err(UpdateError::new(
            ErrorKind::ValidationFailure,
            COMPONENT,
            "sanitized_join",
            "archive entry path is empty".to_string(),
        ));
    }

    Ok(root.join(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_relative_path() {
        let root = Path::new("/staging");
        let joined = sanitized_join(root, "templates/x.yaml").unwrap();
        assert_eq!(joined, Path::new("/staging/templates/x.yaml"));
    }

    #[test]
    fn rejects_parent_traversal() {
        let root = Path::new("/staging");
        assert!(sanitized_join(root, "../../etc/passwd").is_err());
        assert!(sanitized_join(root, "templates/../../escape").is_err());
    }

    #[test]
    fn rejects_absolute_entry_path() {
        let root = Path::new("/staging");
        assert!(sanitized_join(root, "/etc/passwd").is_err());
    }

    #[test]
    fn rejects_empty_path() {
        let root = Path::new("/staging");
        assert!(sanitized_join(root, "").is_err());
        assert!(sanitized_join(root, ".").is_err());
    }
}
