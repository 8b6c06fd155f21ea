//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Customization detector and preserver (spec §4.9). Detects user edits
//! against an upstream baseline, classifies them by marker strength, backs up
//! before apply, and reapplies per the policy table after an update cycle.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::hash::{self, HashAlgorithm};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "customization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Template,
    Module,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerType {
    UserCustomization,
    CustomCode,
    DoNotModify,
}

impl MarkerType {
    fn spelling(self) -> &'static str {
        match self {
            MarkerType::UserCustomization => "USER CUSTOMIZATION",
            MarkerType::CustomCode => "CUSTOM CODE",
            MarkerType::DoNotModify => "DO NOT MODIFY",
        }
    }

    fn parse(spelling: &str) -> Option<Self> {
        match spelling {
            "USER CUSTOMIZATION" => Some(MarkerType::UserCustomization),
            "CUSTOM CODE" => Some(MarkerType::CustomCode),
            "DO NOT MODIFY" => Some(MarkerType::DoNotModify),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
    pub marker_type: MarkerType,
    pub start_line: usize,
    pub end_line: usize,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreservationPolicy {
    AlwaysPreserve,
    PreserveWithConflictResolution,
    AskUser,
    Discard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomizationEntry {
    pub id: String,
    pub entry_type: EntryType,
    pub relative_path: String,
    pub component_id: String,
    pub base_version: String,
    pub customization_date: DateTime<Utc>,
    pub original_content_hash: String,
    pub customized_content_hash: String,
    pub markers: Vec<Marker>,
    pub preservation_policy: PreservationPolicy,
}

/// Scan `content` line by line for `<TYPE> BEGIN` / `<TYPE> END` delimited
/// regions, where TYPE is one of the three recognized upper-case spellings.
pub fn scan_markers(content: &str) -> Vec<Marker> {
    let lines: Vec<&str> = content.lines().collect();
    let mut markers = Vec::new();
    let mut open: Option<(usize, MarkerType)> = None;
    let mut region_lines: Vec<&str> = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        if let Some((start, marker_type)) = open {
            if let Some(prefix) = trimmed.strip_suffix("END") {
                let spelling = prefix.trim();
                if MarkerType::parse(spelling) == Some(marker_type) {
                    markers.push(Marker {
                        marker_type,
                        start_line: start,
                        end_line: index,
                        content: region_lines.join("\n"),
                    });
                    open = None;
                    region_lines.clear();
                    continue;
                }
            }
            region_lines.push(line);
            continue;
        }

        if let Some(prefix) = trimmed.strip_suffix("BEGIN") {
            let spelling = prefix.trim();
            if let Some(marker_type) = MarkerType::parse(spelling) {
                open = Some((index, marker_type));
                region_lines.clear();
            }
        }
    }

    markers
}

/// The strongest marker present decides the default preservation policy.
pub fn policy_from_markers(markers: &[Marker]) -> PreservationPolicy {
    if markers.iter().any(|m| m.marker_type == MarkerType::DoNotModify) {
        return PreservationPolicy::AlwaysPreserve;
    }
    if markers
        .iter()
        .any(|m| matches!(m.marker_type, MarkerType::UserCustomization | MarkerType::CustomCode))
    {
        return PreservationPolicy::PreserveWithConflictResolution;
    }
    PreservationPolicy::AskUser
}

/// Compare installed content against a baseline; if they differ, scan for
/// markers and derive a default policy. Returns `None` when the two match.
pub fn detect(
    relative_path: &str,
    component_id: &str,
    entry_type: EntryType,
    base_version: &str,
    baseline_content: &[u8],
    installed_content: &[u8],
) -> Option<CustomizationEntry> {
    let baseline_hash = hash::hash_bytes(baseline_content, HashAlgorithm::Sha256).hex;
    let installed_hash = hash::hash_bytes(installed_content, HashAlgorithm::Sha256).hex;

    if baseline_hash == installed_hash {
        return None;
    }

    let installed_str = String::from_utf8_lossy(installed_content);
    let markers = scan_markers(&installed_str);
    let policy = policy_from_markers(&markers);

    Some(CustomizationEntry {
        id: format!("{component_id}:{relative_path}"),
        entry_type,
        relative_path: relative_path.to_string(),
        component_id: component_id.to_string(),
        base_version: base_version.to_string(),
        customization_date: Utc::now(),
        original_content_hash: baseline_hash,
        customized_content_hash: installed_hash,
        markers,
        preservation_policy: policy,
    })
}

/// JSON-backed registry of customization entries. Permissions: 0640 file, 0750 directory.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CustomizationRegistry {
    entries: HashMap<String, CustomizationEntry>,
}

impl CustomizationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: CustomizationEntry) {
        self.entries.insert(entry.id.clone(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&CustomizationEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CustomizationEntry> {
        self.entries.values()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut CustomizationEntry> {
        self.entries.values_mut()
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "load", format!("reading registry: {e}")).with_cause(e)
        })?;
        serde_json::from_str(&data).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "load", format!("parsing registry: {e}"))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "save", format!("creating registry directory: {e}")).with_cause(e)
            })?;
            set_dir_perms(parent, 0o750)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "save", e.to_string())
        })?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &data).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "save", format!("writing registry: {e}")).with_cause(e)
        })?;
        set_file_perms(&tmp, 0o640)?;
        std::fs::rename(&tmp, path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "save", format!("renaming registry into place: {e}")).with_cause(e)
        })?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_file_perms(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| UpdateError::filesystem(COMPONENT, "set_file_perms", e.to_string()).with_cause(e))
}

#[cfg(not(unix))]
fn set_file_perms(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_dir_perms(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| UpdateError::filesystem(COMPONENT, "set_dir_perms", e.to_string()).with_cause(e))
}

#[cfg(not(unix))]
fn set_dir_perms(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Back up every registered entry's currently installed file into a directory
/// mirroring the installation layout, before apply begins.
pub fn backup_all(registry: &CustomizationRegistry, installed_root: &Path, backup_root: &Path) -> Result<()> {
    for entry in registry.entries() {
        let src = installed_root.join(&entry.relative_path);
        if !src.exists() {
            continue;
        }
        let dst = backup_root.join(&entry.relative_path);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "backup_all", format!("creating backup dir: {e}")).with_cause(e)
            })?;
        }
        std::fs::copy(&src, &dst).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "backup_all", format!("backing up {}: {e}", src.display())).with_cause(e)
        })?;
    }
    Ok(())
}

/// Splice each of the backup's marker regions into the newly installed file,
/// located by matching delimiter lines. A marker with no matching delimiter
/// pair in the new content is skipped (its region is effectively dropped).
pub fn three_way_merge(backup_markers: &[Marker], new_content: &str) -> String {
    let mut lines: Vec<String> = new_content.lines().map(|l| l.to_string()).collect();

    for marker in backup_markers {
        let begin_needle = format!("{} BEGIN", marker.marker_type.spelling());
        let end_needle = format!("{} END", marker.marker_type.spelling());

        let begin_index = lines.iter().position(|l| l.trim() == begin_needle);
        let end_index = lines.iter().position(|l| l.trim() == end_needle);

        if let (Some(begin), Some(end)) = (begin_index, end_index) {
            if end > begin {
                let mut replacement: Vec<String> = vec![lines[begin].clone()];
                replacement.extend(marker.content.lines().map(|l| l.to_string()));
                replacement.push(lines[end].clone());
                lines.splice(begin..=end, replacement);
            }
        }
    }

    lines.join("\n")
}

/// Reapply one entry's customization after a component update, per the
/// policy table in spec §4.9. `AskUser` resolves to restore-backup in
/// automated runs, matching `AlwaysPreserve`.
pub fn reapply_entry(
    entry: &CustomizationEntry,
    backup_content: &[u8],
    new_installed_content: &[u8],
    prior_baseline_content: &[u8],
) -> Result<Vec<u8>> {
    if entry.preservation_policy == PreservationPolicy::Discard {
        return Ok(new_installed_content.to_vec());
    }

    let installed_equals_prior_baseline = hash::hash_bytes(new_installed_content, HashAlgorithm::Sha256).hex
        == hash::hash_bytes(prior_baseline_content, HashAlgorithm::Sha256).hex;

    if installed_equals_prior_baseline {
        return Ok(backup_content.to_vec());
    }

    match entry.preservation_policy {
        PreservationPolicy::AlwaysPreserve | PreservationPolicy::AskUser => Ok(backup_content.to_vec()),
        PreservationPolicy::Discard => unreachable!("handled above"),
        PreservationPolicy::PreserveWithConflictResolution => {
            let new_str = String::from_utf8_lossy(new_installed_content);
            let merged = three_way_merge(&entry.markers, &new_str);
            Ok(merged.into_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_finds_user_customization_marker() {
        let baseline = b"line1\nline2\n";
        let installed = b"line1\nUSER CUSTOMIZATION BEGIN\nalpha\nUSER CUSTOMIZATION END\nline2\n";

        let entry = detect("x.yaml", "templates", EntryType::Template, "1.0.0", baseline, installed).unwrap();
        assert_eq!(entry.preservation_policy, PreservationPolicy::PreserveWithConflictResolution);
        assert_eq!(entry.markers.len(), 1);
        assert_eq!(entry.markers[0].content, "alpha");
    }

    #[test]
    fn detect_returns_none_when_unchanged() {
        let content = b"identical\n";
        assert!(detect("x.yaml", "templates", EntryType::Template, "1.0.0", content, content).is_none());
    }

    #[test]
    fn do_not_modify_marker_maps_to_always_preserve() {
        let installed = "DO NOT MODIFY BEGIN\nsecret\nDO NOT MODIFY END\n";
        let markers = scan_markers(installed);
        assert_eq!(policy_from_markers(&markers), PreservationPolicy::AlwaysPreserve);
    }

    #[test]
    fn no_markers_maps_to_ask_user() {
        assert_eq!(policy_from_markers(&[]), PreservationPolicy::AskUser);
    }

    #[test]
    fn three_way_merge_preserves_marker_body_scenario_s4() {
        let backup_markers = vec![Marker {
            marker_type: MarkerType::UserCustomization,
            start_line: 1,
            end_line: 3,
            content: "alpha".to_string(),
        }];
        let new_content = "header\nUSER CUSTOMIZATION BEGIN\nbeta\nUSER CUSTOMIZATION END\nfooter";

        let merged = three_way_merge(&backup_markers, new_content);
        assert!(merged.contains("alpha"));
        assert!(!merged.contains("beta"));
    }

    #[test]
    fn three_way_merge_skips_marker_with_no_matching_delimiters() {
        let backup_markers = vec![Marker {
            marker_type: MarkerType::CustomCode,
            start_line: 1,
            end_line: 3,
            content: "orphaned".to_string(),
        }];
        let new_content = "header\nfooter";

        let merged = three_way_merge(&backup_markers, new_content);
        assert_eq!(merged, new_content);
    }
}
