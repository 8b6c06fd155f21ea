//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Update package archive (spec §3, §4.6): a ZIP file with `manifest.json` at
//! its root plus `binary/<platform>/…`, `templates/…`, `modules/<module-id>/…`,
//! and `patches/…` member trees.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::hash::{self, HashAlgorithm, Verifier};
use crate::sanitize::sanitized_join;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::ZipArchive;

const COMPONENT: &str = "package";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Full,
    Differential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublisherInfo {
    pub name: String,
    pub public_key_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BinaryComponentDescriptor {
    pub platform_checksums: HashMap<String, String>,
    #[serde(default)]
    pub minimum_installed_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TemplatesComponentDescriptor {
    pub directory_checksum: String,
    #[serde(default)]
    pub minimum_installed_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ModuleDescriptor {
    pub id: String,
    pub checksum: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub minimum_installed_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatchDescriptor {
    pub component: String,
    pub from_version: String,
    pub to_version: String,
    pub checksum: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdatePackageManifest {
    pub schema_version: u32,
    pub package_id: String,
    pub package_type: PackageType,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub publisher: PublisherInfo,
    #[serde(default)]
    pub binary: Option<BinaryComponentDescriptor>,
    #[serde(default)]
    pub templates: Option<TemplatesComponentDescriptor>,
    #[serde(default)]
    pub modules: Vec<ModuleDescriptor>,
    #[serde(default)]
    pub patches: Vec<PatchDescriptor>,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    #[serde(default)]
    pub manifest_signature: String,
}

impl UpdatePackageManifest {
    /// Bytes signed over: the manifest re-serialized with `manifest_signature` blanked.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut blanked = self.clone();
        blanked.manifest_signature = String::new();
        serde_json::to_vec(&blanked).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "canonical_bytes", e.to_string())
        })
    }
}

/// An opened update package: the manifest plus a handle to the backing archive.
pub struct UpdatePackage {
    pub manifest: UpdatePackageManifest,
    archive: ZipArchive<File>,
}

impl UpdatePackage {
    /// Open an archive, parse `manifest.json`, and reject it if already expired.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "open", format!("opening package archive: {e}")).with_cause(e)
        })?;
        let mut archive = ZipArchive::new(file).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "open", format!("reading zip: {e}"))
        })?;

        let manifest = {
            let mut entry = archive.by_name("manifest.json").map_err(|e| {
                UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "open", format!("missing manifest.json: {e}"))
            })?;
            let mut buf = String::new();
            entry.read_to_string(&mut buf).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "open", format!("reading manifest.json: {e}")).with_cause(e)
            })?;
            serde_json::from_str::<UpdatePackageManifest>(&buf).map_err(|e| {
                UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "open", format!("parsing manifest.json: {e}"))
            })?
        };

        if let Some(expires_at) = manifest.expires_at {
            if Utc::now() > expires_at {
                return Err(UpdateError::new(
                    ErrorKind::ValidationFailure,
                    COMPONENT,
                    "open",
                    format!("package expired at {expires_at}"),
                ));
            }
        }

        Ok(UpdatePackage { manifest, archive })
    }

    /// Verify the manifest signature, then every declared component checksum
    /// against the archive's actual contents.
    pub fn verify(&mut self, verifier: &Verifier) -> Result<()> {
        let canonical = self.manifest.canonical_bytes()?;
        let ok = verifier
            .verify(&canonical, &self.manifest.manifest_signature)
            .unwrap_or(false);
        if !ok {
            return Err(UpdateError::integrity(COMPONENT, "verify", "manifest signature does not verify"));
        }

        if let Some(binary) = self.manifest.binary.clone() {
            for (platform, declared) in &binary.platform_checksums {
                let member = format!("binary/{platform}/payload");
                self.verify_member_checksum(&member, declared)?;
            }
        }

        if let Some(templates) = self.manifest.templates.clone() {
            let actual = self.directory_checksum("templates/")?;
            if !hash::constant_time_hex_eq(&actual, &strip_algorithm_prefix(&templates.directory_checksum)) {
                return Err(UpdateError::integrity(
                    COMPONENT,
                    "verify",
                    "templates directory checksum mismatch",
                ));
            }
        }

        for module in self.manifest.modules.clone() {
            let actual = self.directory_checksum(&format!("modules/{}/", module.id))?;
            if !hash::constant_time_hex_eq(&actual, &strip_algorithm_prefix(&module.checksum)) {
                return Err(UpdateError::integrity(
                    COMPONENT,
                    "verify",
                    format!("module {} checksum mismatch", module.id),
                ));
            }
        }

        Ok(())
    }

    fn verify_member_checksum(&mut self, member: &str, declared: &str) -> Result<()> {
        let mut entry = self.archive.by_name(member).map_err(|e| {
            UpdateError::integrity(COMPONENT, "verify", format!("archive missing declared entry {member}: {e}"))
        })?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "verify", format!("reading {member}: {e}")).with_cause(e)
        })?;
        if !hash::verify(&buf, declared)? {
            return Err(UpdateError::integrity(COMPONENT, "verify", format!("checksum mismatch for {member}")));
        }
        Ok(())
    }

    /// Hash the concatenation of (entry path, entry content) over a subtree,
    /// with entries sorted by path for a stable, well-defined digest.
    fn directory_checksum(&mut self, prefix: &str) -> Result<String> {
        let mut names: Vec<String> = (0..self.archive.len())
            .filter_map(|i| self.archive.by_index(i).ok().map(|f| f.name().to_string()))
            .filter(|name| name.starts_with(prefix) && !name.ends_with('/'))
            .collect();
        names.sort();

        let mut buf = Vec::new();
        for name in &names {
            let mut entry = self.archive.by_name(name).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "directory_checksum", format!("reading {name}: {e}")).with_cause(e)
            })?;
            buf.extend_from_slice(name.as_bytes());
            entry.read_to_end(&mut buf).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "directory_checksum", format!("reading {name}: {e}")).with_cause(e)
            })?;
        }

        Ok(hash::hash_bytes(&buf, HashAlgorithm::Sha256).hex)
    }

    /// Check that the installed state satisfies every declared minimum before
    /// this package may be applied.
    pub fn check_compatibility(
        &self,
        installed_core: &Version,
        installed_templates: &Version,
        installed_modules: &HashMap<String, Version>,
    ) -> Result<()> {
        if let Some(binary) = &self.manifest.binary {
            if let Some(min) = &binary.minimum_installed_version {
                let min = Version::parse(min)?;
                if installed_core < &min {
                    return Err(UpdateError::incompatibility(
                        COMPONENT,
                        "check_compatibility",
                        format!("installed core {installed_core} is below required minimum {min}"),
                    ));
                }
            }
        }

        for module in &self.manifest.modules {
            for dep in &module.dependencies {
                if !installed_modules.contains_key(dep) {
                    return Err(UpdateError::incompatibility(
                        COMPONENT,
                        "check_compatibility",
                        format!("module {} depends on {dep}, which is not installed", module.id),
                    ));
                }
            }
            if let Some(min) = &module.minimum_installed_version {
                let min = Version::parse(min)?;
                if let Some(installed) = installed_modules.get(&module.id) {
                    if installed < &min {
                        return Err(UpdateError::incompatibility(
                            COMPONENT,
                            "check_compatibility",
                            format!("module {} installed at {installed}, below minimum {min}", module.id),
                        ));
                    }
                }
            }
        }

        if self.manifest.package_type == PackageType::Differential {
            for patch in &self.manifest.patches {
                let from_version = Version::parse(&patch.from_version)?;
                let installed = match patch.component.as_str() {
                    "core" => installed_core.clone(),
                    "templates" => installed_templates.clone(),
                    other => installed_modules.get(other).cloned().ok_or_else(|| {
                        UpdateError::incompatibility(
                            COMPONENT,
                            "check_compatibility",
                            format!("patch targets unknown component {other}"),
                        )
                    })?,
                };
                if installed != from_version {
                    return Err(UpdateError::incompatibility(
                        COMPONENT,
                        "check_compatibility",
                        format!(
                            "patch for {} expects installed version {from_version}, found {installed}; use a full package instead",
                            patch.component
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Extract a single archive member, identified by its archive-relative
    /// path, under `dest_root`; the final path is path-sanitized against traversal.
    pub fn extract_file(&mut self, archive_path: &str, dest_root: &Path) -> Result<()> {
        let dest_path = sanitized_join(dest_root, archive_path)?;
        let mut entry = self.archive.by_name(archive_path).map_err(|e| {
            UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "extract_file", format!("missing {archive_path}: {e}"))
        })?;
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "extract_file", format!("creating {}: {e}", parent.display())).with_cause(e)
            })?;
        }
        let mut out = File::create(&dest_path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "extract_file", format!("creating {}: {e}", dest_path.display())).with_cause(e)
        })?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "extract_file", format!("writing {}: {e}", dest_path.display())).with_cause(e)
        })?;
        Ok(())
    }

    /// Extract every archive member under `archive_prefix` into `dest_dir`,
    /// path-sanitized against traversal.
    pub fn extract_directory(&mut self, archive_prefix: &str, dest_dir: &Path) -> Result<()> {
        let names: Vec<String> = (0..self.archive.len())
            .filter_map(|i| self.archive.by_index(i).ok().map(|f| f.name().to_string()))
            .filter(|name| name.starts_with(archive_prefix) && !name.ends_with('/'))
            .collect();

        for name in names {
            let relative = name.strip_prefix(archive_prefix).unwrap_or(&name);
            let dest_path = sanitized_join(dest_dir, relative)?;
            if let Some(parent) = dest_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "extract_directory", format!("creating {}: {e}", parent.display())).with_cause(e)
                })?;
            }
            let mut entry = self.archive.by_name(&name).map_err(|e| {
                UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "extract_directory", format!("reading {name}: {e}"))
            })?;
            let mut out = File::create(&dest_path).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "extract_directory", format!("creating {}: {e}", dest_path.display())).with_cause(e)
            })?;
            std::io::copy(&mut entry, &mut out).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "extract_directory", format!("writing {}: {e}", dest_path.display())).with_cause(e)
            })?;
        }

        Ok(())
    }
}

fn strip_algorithm_prefix(tagged: &str) -> String {
    match tagged.split_once(':') {
        Some((_, hex)) => hex.to_string(),
        None => tagged.to_string(),
    }
}

/// Writes update packages; used by tests and by offline-bundle interop tooling.
pub fn write_package(
    path: &Path,
    manifest: &UpdatePackageManifest,
    members: &[(&str, &[u8])],
) -> Result<()> {
    let file = File::create(path).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "write_package", format!("creating {}: {e}", path.display())).with_cause(e)
    })?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();

    writer
        .start_file("manifest.json", options)
        .map_err(|e| UpdateError::filesystem(COMPONENT, "write_package", e.to_string()))?;
    let manifest_json = serde_json::to_vec_pretty(manifest)
        .map_err(|e| UpdateError::new(ErrorKind::ValidationFailure, COMPONENT, "write_package", e.to_string()))?;
    writer
        .write_all(&manifest_json)
        .map_err(|e| UpdateError::filesystem(COMPONENT, "write_package", e.to_string()).with_cause(e))?;

    for (name, content) in members {
        writer
            .start_file(*name, options)
            .map_err(|e| UpdateError::filesystem(COMPONENT, "write_package", e.to_string()))?;
        writer
            .write_all(content)
            .map_err(|e| UpdateError::filesystem(COMPONENT, "write_package", e.to_string()).with_cause(e))?;
    }

    writer
        .finish()
        .map_err(|e| UpdateError::filesystem(COMPONENT, "write_package", e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::SigningKeyMaterial;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn keypair() -> (SigningKeyMaterial, Verifier) {
        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        (SigningKeyMaterial::Ed25519(Box::new(signing)), Verifier::Ed25519(Box::new(verifying)))
    }

    fn sample_manifest(templates_checksum: String) -> UpdatePackageManifest {
        UpdatePackageManifest {
            schema_version: 1,
            package_id: "pkg-test".to_string(),
            package_type: PackageType::Full,
            created_at: Utc::now(),
            expires_at: None,
            publisher: PublisherInfo { name: "test".to_string(), public_key_id: "k1".to_string() },
            binary: None,
            templates: Some(TemplatesComponentDescriptor {
                directory_checksum: templates_checksum,
                minimum_installed_version: None,
            }),
            modules: Vec::new(),
            patches: Vec::new(),
            compliance_tags: Vec::new(),
            manifest_signature: String::new(),
        }
    }

    #[test]
    fn open_verify_and_extract_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");

        let expected_checksum = hash::hash_bytes(b"templates/x.yamlbody", HashAlgorithm::Sha256).hex;
        let mut manifest = sample_manifest(expected_checksum);

        let (signing_key, verifier) = keypair();
        let canonical = manifest.canonical_bytes().unwrap();
        manifest.manifest_signature = hash::sign(&canonical, &signing_key).unwrap();

        write_package(&archive_path, &manifest, &[("templates/x.yaml", b"body")]).unwrap();

        let mut pkg = UpdatePackage::open(&archive_path).unwrap();
        pkg.verify(&verifier).unwrap();

        let out_dir = dir.path().join("out");
        pkg.extract_directory("templates/", &out_dir).unwrap();
        let content = std::fs::read(out_dir.join("x.yaml")).unwrap();
        assert_eq!(content, b"body");
    }

    #[test]
    fn tampered_archive_fails_checksum_verification() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");

        let expected_checksum = hash::hash_bytes(b"templates/x.yamlbody", HashAlgorithm::Sha256).hex;
        let mut manifest = sample_manifest(expected_checksum);
        let (signing_key, verifier) = keypair();
        let canonical = manifest.canonical_bytes().unwrap();
        manifest.manifest_signature = hash::sign(&canonical, &signing_key).unwrap();

        // Archive content differs from what the manifest checksum declares.
        write_package(&archive_path, &manifest, &[("templates/x.yaml", b"tampered")]).unwrap();

        let mut pkg = UpdatePackage::open(&archive_path).unwrap();
        assert!(pkg.verify(&verifier).is_err());
    }

    #[test]
    fn expired_package_is_rejected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");
        let mut manifest = sample_manifest("x".repeat(64));
        manifest.expires_at = Some(chrono::DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z").unwrap().with_timezone(&Utc));

        write_package(&archive_path, &manifest, &[("templates/x.yaml", b"body")]).unwrap();
        assert!(UpdatePackage::open(&archive_path).is_err());
    }

    #[test]
    fn differential_patch_requires_exact_from_version() {
        let dir = tempfile::tempdir().unwrap();
        let archive_path = dir.path().join("pkg.zip");
        let mut manifest = sample_manifest("x".repeat(64));
        manifest.package_type = PackageType::Differential;
        manifest.patches.push(PatchDescriptor {
            component: "templates".to_string(),
            from_version: "1.1.0".to_string(),
            to_version: "1.3.0".to_string(),
            checksum: "y".repeat(64),
        });
        write_package(&archive_path, &manifest, &[("templates/x.yaml", b"body")]).unwrap();

        let pkg = UpdatePackage::open(&archive_path).unwrap();
        let installed_core = Version::parse("1.0.0").unwrap();
        let installed_templates = Version::parse("1.2.0").unwrap();
        let installed_modules = HashMap::new();

        let result = pkg.check_compatibility(&installed_core, &installed_templates, &installed_modules);
        assert!(result.is_err());
    }
}
