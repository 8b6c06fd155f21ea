//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Offline bundle engine (spec §4.10): export the installed components into a
//! self-contained signed archive, and import one back, with expiry and
//! platform compatibility checks and path-sanitized extraction.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::hash::{self, HashAlgorithm, SigningKeyMaterial, Verifier};
use crate::sanitize::sanitized_join;
use crate::transaction::{ComponentKind, Operation, Transaction};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::ZipArchive;

const COMPONENT: &str = "bundle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleComponentEntry {
    pub name: String,
    pub version: String,
    pub entry_type: String,
    pub archive_path: String,
    pub size: u64,
    pub checksum: String,
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleManifest {
    pub version: String,
    pub bundle_type: BundleType,
    pub description: String,
    pub source_version: String,
    pub target_version: String,
    pub supported_platforms: Vec<String>,
    pub incremental: bool,
    pub components: Vec<BundleComponentEntry>,
    #[serde(default)]
    pub checksums: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub signatures: Option<std::collections::HashMap<String, String>>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// One file to stage into the bundle, from its source path to its
/// archive-relative destination.
pub struct StagedFile {
    pub source_path: PathBuf,
    pub archive_path: String,
    pub component_name: String,
    pub component_version: String,
    pub entry_type: String,
    pub required: bool,
}

/// Export binary/template/module source directories into a signed, deterministic ZIP bundle.
pub fn export(
    output_path: &Path,
    metadata: BundleMetadata,
    files: &[StagedFile],
    signing_key: Option<&SigningKeyMaterial>,
) -> Result<()> {
    let mut components = Vec::new();
    let mut checksums = std::collections::HashMap::new();

    let zip_file = File::create(output_path).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "export", format!("creating {}: {e}", output_path.display())).with_cause(e)
    })?;
    let mut writer = zip::ZipWriter::new(zip_file);
    let options = zip::write::SimpleFileOptions::default();

    let mut sorted: Vec<&StagedFile> = files.iter().collect();
    sorted.sort_by(|a, b| a.archive_path.cmp(&b.archive_path));

    for file in &sorted {
        let content = std::fs::read(&file.source_path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", format!("reading {}: {e}", file.source_path.display())).with_cause(e)
        })?;
        let checksum = hash::hash_bytes(&content, HashAlgorithm::Sha256).to_tagged_string();

        writer.start_file(&file.archive_path, options).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", e.to_string())
        })?;
        writer.write_all(&content).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", e.to_string()).with_cause(e)
        })?;

        checksums.insert(file.archive_path.clone(), checksum.clone());
        components.push(BundleComponentEntry {
            name: file.component_name.clone(),
            version: file.component_version.clone(),
            entry_type: file.entry_type.clone(),
            archive_path: file.archive_path.clone(),
            size: content.len() as u64,
            checksum,
            required: file.required,
        });
    }

    let manifest = BundleManifest {
        version: metadata.version,
        bundle_type: metadata.bundle_type,
        description: metadata.description,
        source_version: metadata.source_version,
        target_version: metadata.target_version,
        supported_platforms: metadata.supported_platforms,
        incremental: metadata.bundle_type == BundleType::Incremental,
        components,
        checksums,
        signatures: None,
        creator: metadata.creator,
        created_at: metadata.created_at,
        expires_at: metadata.expires_at,
    };

    let manifest_json = serde_json::to_vec_pretty(&manifest).map_err(|e| {
        UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "export", e.to_string())
    })?;
    writer.start_file("manifest.json", options).map_err(|e| UpdateError::filesystem(COMPONENT, "export", e.to_string()))?;
    writer.write_all(&manifest_json).map_err(|e| UpdateError::filesystem(COMPONENT, "export", e.to_string()).with_cause(e))?;

    writer.finish().map_err(|e| UpdateError::filesystem(COMPONENT, "export", e.to_string()))?;

    if let Some(key) = signing_key {
        let archive_bytes = std::fs::read(output_path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", format!("re-reading archive for signing: {e}")).with_cause(e)
        })?;
        let signature = hash::sign(&archive_bytes, key)?;
        let sig_path = sidecar_path(output_path, "sig");
        std::fs::write(&sig_path, signature).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", format!("writing .sig sidecar: {e}")).with_cause(e)
        })?;

        let digest = hash::hash_bytes(&archive_bytes, HashAlgorithm::Sha256).hex;
        let sha256_path = sidecar_path(output_path, "sha256");
        std::fs::write(&sha256_path, digest).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "export", format!("writing .sha256 sidecar: {e}")).with_cause(e)
        })?;
    }

    Ok(())
}

pub struct BundleMetadata {
    pub version: String,
    pub bundle_type: BundleType,
    pub description: String,
    pub source_version: String,
    pub target_version: String,
    pub supported_platforms: Vec<String>,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

fn sidecar_path(archive_path: &Path, extension: &str) -> PathBuf {
    let mut os_string = archive_path.as_os_str().to_owned();
    os_string.push(".");
    os_string.push(extension);
    PathBuf::from(os_string)
}

/// An opened, staged-for-import bundle: its parsed manifest, the staging
/// directory its files were extracted into, and the transaction that applied
/// them to `install_root`.
pub struct ImportedBundle {
    pub manifest: BundleManifest,
    pub staging_dir: PathBuf,
    pub transaction: Transaction,
}

fn component_kind(entry_type: &str) -> ComponentKind {
    match entry_type {
        "binary" => ComponentKind::Binary,
        "template" | "templates" => ComponentKind::Templates,
        _ => ComponentKind::Module,
    }
}

/// Verify archive integrity against `.sha256`/`.sig` side-cars (unless
/// overridden), extract path-sanitized into a staging directory, check expiry
/// and platform support, then invoke the transactional executor's per-component
/// apply on the staged files, installing them under `install_root` with backups
/// under `backup_root`.
#[allow(clippy::too_many_arguments)]
pub fn import(
    archive_path: &Path,
    staging_root: &Path,
    install_root: &Path,
    backup_root: &Path,
    current_platform: &str,
    verifier: Option<&Verifier>,
    force_import: bool,
) -> Result<ImportedBundle> {
    let archive_bytes = std::fs::read(archive_path).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "import", format!("reading {}: {e}", archive_path.display())).with_cause(e)
    })?;

    let sha256_path = sidecar_path(archive_path, "sha256");
    if sha256_path.exists() {
        let declared = std::fs::read_to_string(&sha256_path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "import", format!("reading .sha256 sidecar: {e}")).with_cause(e)
        })?;
        if !hash::verify(&archive_bytes, declared.trim())? {
            return Err(UpdateError::integrity(COMPONENT, "import", "archive does not match .sha256 sidecar"));
        }
    }

    let sig_path = sidecar_path(archive_path, "sig");
    if sig_path.exists() {
        if let Some(verifier) = verifier {
            let signature = std::fs::read_to_string(&sig_path).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "import", format!("reading .sig sidecar: {e}")).with_cause(e)
            })?;
            let ok = verifier.verify(&archive_bytes, signature.trim()).unwrap_or(false);
            if !ok {
                return Err(UpdateError::integrity(COMPONENT, "import", "archive does not match .sig sidecar"));
            }
        }
    }

    let mut archive = ZipArchive::new(std::io::Cursor::new(&archive_bytes)).map_err(|e| {
        UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "import", format!("reading zip: {e}"))
    })?;

    let manifest: BundleManifest = {
        let mut entry = archive.by_name("manifest.json").map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "import", format!("missing manifest.json: {e}"))
        })?;
        let mut buf = String::new();
        entry.read_to_string(&mut buf).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "import", format!("reading manifest.json: {e}")).with_cause(e)
        })?;
        serde_json::from_str(&buf).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "import", format!("parsing manifest.json: {e}"))
        })?
    };

    if !force_import {
        if let Some(expires_at) = manifest.expires_at {
            if Utc::now() > expires_at {
                return Err(UpdateError::validation(COMPONENT, "import", format!("bundle expired at {expires_at}")));
            }
        }
        if !manifest.supported_platforms.is_empty() && !manifest.supported_platforms.iter().any(|p| p == current_platform) {
            return Err(UpdateError::validation(
                COMPONENT,
                "import",
                format!("bundle does not support platform {current_platform}"),
            ));
        }
    }

    let names: Vec<String> = (0..archive.len())
        .filter_map(|i| archive.by_index(i).ok().map(|f| f.name().to_string()))
        .filter(|name| name != "manifest.json" && !name.ends_with('/'))
        .collect();

    for name in &names {
        let dest_path = sanitized_join(staging_root, name)?;
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "import", format!("creating {}: {e}", parent.display())).with_cause(e)
            })?;
        }
        let mut entry = archive.by_name(name).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "import", format!("reading {name}: {e}"))
        })?;
        let mut out = File::create(&dest_path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "import", format!("creating {}: {e}", dest_path.display())).with_cause(e)
        })?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "import", format!("writing {}: {e}", dest_path.display())).with_cause(e)
        })?;
    }

    let mut transaction = Transaction::new();
    for component in &manifest.components {
        let staged_path = sanitized_join(staging_root, &component.archive_path)?;
        let dest_path = sanitized_join(install_root, &component.archive_path)?;
        let backup_path = sanitized_join(backup_root, &component.archive_path)?;
        transaction.add_operation(Operation::new(
            component_kind(&component.entry_type),
            component.archive_path.clone(),
            staged_path,
            dest_path,
            backup_path,
        ))?;
    }
    transaction.execute()?;
    transaction.commit()?;

    Ok(ImportedBundle { manifest, staging_dir: staging_root.to_path_buf(), transaction })
}

/// Collect the files under a directory into `StagedFile` records rooted at
/// `archive_prefix`, used to build the `files` argument to [`export`].
pub fn stage_directory(
    source_dir: &Path,
    archive_prefix: &str,
    component_name: &str,
    component_version: &str,
    entry_type: &str,
    required: bool,
) -> Result<Vec<StagedFile>> {
    let mut staged = Vec::new();
    for entry in WalkDir::new(source_dir).into_iter() {
        let entry = entry.map_err(|e| {
            UpdateError::filesystem(COMPONENT, "stage_directory", format!("walking {}: {e}", source_dir.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path.strip_prefix(source_dir).unwrap_or(path);
        let archive_path = format!("{archive_prefix}/{}", relative.to_string_lossy().replace('\\', "/"));
        staged.push(StagedFile {
            source_path: path.to_path_buf(),
            archive_path,
            component_name: component_name.to_string(),
            component_version: component_version.to_string(),
            entry_type: entry_type.to_string(),
            required,
        });
    }
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::SigningKeyMaterial;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn keypair() -> (SigningKeyMaterial, Verifier) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (SigningKeyMaterial::Ed25519(Box::new(signing)), Verifier::Ed25519(Box::new(verifying)))
    }

    fn sample_metadata() -> BundleMetadata {
        BundleMetadata {
            version: "1.0.0".to_string(),
            bundle_type: BundleType::Full,
            description: "test bundle".to_string(),
            source_version: "1.0.0".to_string(),
            target_version: "1.1.0".to_string(),
            supported_platforms: vec!["linux-x86_64".to_string()],
            creator: "test-suite".to_string(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn export_then_import_roundtrips_and_verifies_signature() {
        let dir = tempdir().unwrap();
        let src_file = dir.path().join("x.yaml");
        std::fs::write(&src_file, b"template body").unwrap();

        let files = vec![StagedFile {
            source_path: src_file,
            archive_path: "templates/x.yaml".to_string(),
            component_name: "templates".to_string(),
            component_version: "1.1.0".to_string(),
            entry_type: "template".to_string(),
            required: true,
        }];

        let archive_path = dir.path().join("bundle.zip");
        let (signing_key, verifier) = keypair();
        export(&archive_path, sample_metadata(), &files, Some(&signing_key)).unwrap();

        let staging = dir.path().join("staging");
        let install_root = dir.path().join("installed");
        let backup_root = dir.path().join("backup");
        let imported = import(
            &archive_path,
            &staging,
            &install_root,
            &backup_root,
            "linux-x86_64",
            Some(&verifier),
            false,
        )
        .unwrap();

        assert_eq!(imported.manifest.components.len(), 1);
        let extracted = std::fs::read(staging.join("templates/x.yaml")).unwrap();
        assert_eq!(extracted, b"template body");

        let installed = std::fs::read(install_root.join("templates/x.yaml")).unwrap();
        assert_eq!(installed, b"template body");
    }

    #[test]
    fn import_rejects_expired_bundle_unless_forced() {
        let dir = tempdir().unwrap();
        let src_file = dir.path().join("x.yaml");
        std::fs::write(&src_file, b"body").unwrap();
        let files = vec![StagedFile {
            source_path: src_file,
            archive_path: "templates/x.yaml".to_string(),
            component_name: "templates".to_string(),
            component_version: "1.0.0".to_string(),
            entry_type: "template".to_string(),
            required: true,
        }];

        let mut metadata = sample_metadata();
        metadata.expires_at = Some(chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc));

        let archive_path = dir.path().join("bundle.zip");
        export(&archive_path, metadata, &files, None).unwrap();

        let staging = dir.path().join("staging");
        let install_root = dir.path().join("installed");
        let backup_root = dir.path().join("backup");
        assert!(import(&archive_path, &staging, &install_root, &backup_root, "linux-x86_64", None, false).is_err());

        let staging_forced = dir.path().join("staging-forced");
        let install_root_forced = dir.path().join("installed-forced");
        let backup_root_forced = dir.path().join("backup-forced");
        assert!(import(
            &archive_path,
            &staging_forced,
            &install_root_forced,
            &backup_root_forced,
            "linux-x86_64",
            None,
            true,
        )
        .is_ok());
    }

    #[test]
    fn import_rejects_unsupported_platform() {
        let dir = tempdir().unwrap();
        let src_file = dir.path().join("x.yaml");
        std::fs::write(&src_file, b"body").unwrap();
        let files = vec![StagedFile {
            source_path: src_file,
            archive_path: "templates/x.yaml".to_string(),
            component_name: "templates".to_string(),
            component_version: "1.0.0".to_string(),
            entry_type: "template".to_string(),
            required: true,
        }];

        let archive_path = dir.path().join("bundle.zip");
        export(&archive_path, sample_metadata(), &files, None).unwrap();

        let staging = dir.path().join("staging");
        let install_root = dir.path().join("installed");
        let backup_root = dir.path().join("backup");
        assert!(import(&archive_path, &staging, &install_root, &backup_root, "windows-x86_64", None, false).is_err());
    }
}
