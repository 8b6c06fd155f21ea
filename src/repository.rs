//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Repository abstraction (spec §6, consumed only). Concrete HTTP/git-host/local
//! implementations are out of scope; this module defines the trait the version
//! checker and package acquisition code consume, plus a small in-memory
//! implementation used by this crate's own tests.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::io::Read;

/// Metadata about a single file as reported by a repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
}

/// Abstract access to a remote or local tree of files. No other behavior is
/// assumed by the core beyond these four operations.
pub trait Repository: Send + Sync {
    fn file_exists(&self, path: &str) -> Result<bool>;
    fn get_file(&self, path: &str) -> Result<Box<dyn Read + Send>>;
    fn list_files(&self, pattern: &str) -> Result<Vec<FileInfo>>;
    fn get_last_modified(&self, path: &str) -> Result<DateTime<Utc>>;
}

#[cfg(any(test, feature = "test-support"))]
pub mod memory {
    //! An in-memory `Repository` used by this crate's tests and available to
    //! downstream test suites under the `test-support` feature.

    use super::*;
    use crate::error::{ErrorKind, UpdateError};
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::RwLock;

    const COMPONENT: &str = "memory_repository";

    pub struct MemoryRepository {
        files: RwLock<HashMap<String, (Vec<u8>, DateTime<Utc>)>>,
    }

    impl MemoryRepository {
        pub fn new() -> Self {
            MemoryRepository { files: RwLock::new(HashMap::new()) }
        }

        pub fn put(&self, path: &str, contents: impl Into<Vec<u8>>, modified: DateTime<Utc>) {
            self.files
                .write()
                .expect("memory repository lock poisoned")
                .insert(path.to_string(), (contents.into(), modified));
        }
    }

    impl Default for MemoryRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    fn glob_match(pattern: &str, path: &str) -> bool {
        // Minimal glob: '*' matches any run of characters, everything else is literal.
        fn matches(pat: &[u8], s: &[u8]) -> bool {
            match (pat.first(), s.first()) {
                (None, None) => true,
                (Some(b'*'), _) => {
                    matches(&pat[1..], s) || (!s.is_empty() && matches(pat, &s[1..]))
                }
                (Some(pc), Some(sc)) if pc == sc => matches(&pat[1..], &s[1..]),
                _ => false,
            }
        }
        matches(pattern.as_bytes(), path.as_bytes())
    }

    impl Repository for MemoryRepository {
        fn file_exists(&self, path: &str) -> Result<bool> {
            Ok(self.files.read().expect("memory repository lock poisoned").contains_key(path))
        }

        fn get_file(&self, path: &str) -> Result<Box<dyn Read + Send>> {
            let files = self.files.read().expect("memory repository lock poisoned");
            match files.get(path) {
                Some((data, _)) => Ok(Box::new(Cursor::new(data.clone()))),
                None => Err(UpdateError::new(
                    ErrorKind::NetworkPermanent,
                    COMPONENT,
                    "get_file",
                    format!("no such file: {path}"),
                )),
            }
        }

        fn list_files(&self, pattern: &str) -> Result<Vec<FileInfo>> {
            let files = self.files.read().expect("memory repository lock poisoned");
            Ok(files
                .iter()
                .filter(|(path, _)| glob_match(pattern, path))
                .map(|(path, (data, _))| FileInfo { path: path.clone(), size: data.len() as u64 })
                .collect())
        }

        fn get_last_modified(&self, path: &str) -> Result<DateTime<Utc>> {
            let files = self.files.read().expect("memory repository lock poisoned");
            files
                .get(path)
                .map(|(_, modified)| *modified)
                .ok_or_else(|| {
                    UpdateError::new(
                        ErrorKind::NetworkPermanent,
                        COMPONENT,
                        "get_last_modified",
                        format!("no such file: {path}"),
                    )
                })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn put_then_read_roundtrips() {
            let repo = MemoryRepository::new();
            repo.put("templates/x.yaml", b"body".to_vec(), Utc::now());

            assert!(repo.file_exists("templates/x.yaml").unwrap());
            assert!(!repo.file_exists("templates/missing.yaml").unwrap());

            let mut buf = Vec::new();
            repo.get_file("templates/x.yaml").unwrap().read_to_end(&mut buf).unwrap();
            assert_eq!(buf, b"body");
        }

        #[test]
        fn list_files_matches_glob() {
            let repo = MemoryRepository::new();
            repo.put("templates/a.yaml", b"a".to_vec(), Utc::now());
            repo.put("templates/b.yaml", b"b".to_vec(), Utc::now());
            repo.put("modules/c.rs", b"c".to_vec(), Utc::now());

            let matches = repo.list_files("templates/*.yaml").unwrap();
            assert_eq!(matches.len(), 2);
        }
    }
}
