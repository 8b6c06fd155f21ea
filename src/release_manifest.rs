//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Release manifest JSON (spec §6), as served by the update server and by
//! template/module repositories. `core` and `templates` are single records;
//! `modules` is a list of records carrying an extra `id`/`name`.

use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields common to every release entry, whatever component it describes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseEntry {
    pub version: String,
    #[serde(rename = "releaseDate")]
    pub release_date: DateTime<Utc>,
    #[serde(rename = "changelogURL")]
    pub changelog_url: String,
    #[serde(rename = "releaseNotes")]
    pub release_notes: String,
    #[serde(rename = "downloadURL")]
    pub download_url: String,
    pub signature: String,
    #[serde(rename = "checksumSHA256")]
    pub checksum_sha256: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub security: bool,
    #[serde(default)]
    pub breaking: bool,
}

impl ReleaseEntry {
    pub fn parsed_version(&self) -> crate::error::Result<Version> {
        Version::parse(&self.version)
    }
}

/// A module release entry, which additionally carries an id and display name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleReleaseEntry {
    pub id: String,
    pub name: String,
    #[serde(flatten)]
    pub entry: ReleaseEntry,
}

/// Top-level release manifest document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReleaseManifest {
    pub core: ReleaseEntry,
    pub templates: ReleaseEntry,
    #[serde(default)]
    pub modules: Vec<ModuleReleaseEntry>,
}

impl ReleaseManifest {
    pub fn parse(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::error::UpdateError::new(
                crate::error::ErrorKind::NetworkPermanent,
                "release_manifest",
                "parse",
                format!("malformed release manifest: {e}"),
            )
        })
    }

    /// Case-insensitive keyword scan used to derive security/critical flags
    /// when a source does not set them explicitly (spec §4.5).
    pub fn notes_indicate_security(notes: &str) -> bool {
        const KEYWORDS: &[&str] = &[
            "security",
            "vulnerability",
            "cve",
            "exploit",
            "critical",
            "urgent",
            "hotfix",
        ];
        let lower = notes.to_ascii_lowercase();
        KEYWORDS.iter().any(|kw| lower.contains(kw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_core_json() -> &'static str {
        r#"{
            "core": {
                "version": "1.1.0",
                "releaseDate": "2026-01-01T00:00:00Z",
                "changelogURL": "https://example.test/changelog",
                "releaseNotes": "Fixes a critical CVE in the parser",
                "downloadURL": "https://example.test/core-1.1.0.bin",
                "signature": "c2lnbmF0dXJl",
                "checksumSHA256": "0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0a0af3"
            },
            "templates": {
                "version": "2.0.0",
                "releaseDate": "2026-01-01T00:00:00Z",
                "changelogURL": "https://example.test/changelog-templates",
                "releaseNotes": "Routine content refresh",
                "downloadURL": "https://example.test/templates-2.0.0.zip",
                "signature": "c2lnbmF0dXJl",
                "checksumSHA256": "1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b1b"
            },
            "modules": [
                {
                    "id": "mod-a",
                    "name": "Module A",
                    "version": "0.9.0",
                    "releaseDate": "2026-01-01T00:00:00Z",
                    "changelogURL": "https://example.test/changelog-mod-a",
                    "releaseNotes": "",
                    "downloadURL": "https://example.test/mod-a-0.9.0.zip",
                    "signature": "c2lnbmF0dXJl",
                    "checksumSHA256": "2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c2c"
                }
            ]
        }"#
    }

    #[test]
    fn parses_full_manifest() {
        let manifest = ReleaseManifest::parse(sample_core_json()).unwrap();
        assert_eq!(manifest.core.version, "1.1.0");
        assert_eq!(manifest.templates.version, "2.0.0");
        assert_eq!(manifest.modules.len(), 1);
        assert_eq!(manifest.modules[0].id, "mod-a");
        assert_eq!(manifest.modules[0].entry.version, "0.9.0");
    }

    #[test]
    fn detects_security_keywords_case_insensitively() {
        assert!(ReleaseManifest::notes_indicate_security("Fixes a critical CVE"));
        assert!(ReleaseManifest::notes_indicate_security("contains an EXPLOIT for X"));
        assert!(!ReleaseManifest::notes_indicate_security("Routine content refresh"));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(ReleaseManifest::parse("{not json").is_err());
    }
}
