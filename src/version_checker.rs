//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Version checker (spec §4.5). Fetches the release manifest from the update
//! server and, per configured template/module repository, a raw manifest
//! file; merges public (update server) and internal (repository) sources
//! according to spec's per-component precedence; fans out across
//! repositories with bounded parallelism.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::release_manifest::{ModuleReleaseEntry, ReleaseEntry, ReleaseManifest};
use crate::repository::Repository;
use crate::version::Version;
use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

const COMPONENT: &str = "version_checker";
const DEFAULT_MAX_PARALLEL: usize = 5;
const MANIFEST_FILE_NAME: &str = "release-manifest.json";

/// Result of comparing one component's installed state against the latest
/// release known to the checker.
#[derive(Debug, Clone)]
pub struct ComponentUpdate {
    pub component: String,
    pub current_version: Option<Version>,
    pub latest_version: Version,
    pub update_available: bool,
    pub update_size: Option<u64>,
    pub security: bool,
    pub critical: bool,
    pub download_url: String,
    pub checksum_sha256: String,
    pub signature: String,
}

fn classify(entry: &ReleaseEntry) -> (bool, bool) {
    let keyword_hit = ReleaseManifest::notes_indicate_security(&entry.release_notes);
    let security = entry.security || keyword_hit;
    let critical = entry.required || keyword_hit;
    (security, critical)
}

fn to_component_update(component: &str, installed: Option<&Version>, entry: &ReleaseEntry) -> Result<ComponentUpdate> {
    let latest = entry.parsed_version()?;
    let update_available = match installed {
        Some(current) => &latest > current,
        None => true,
    };
    let (security, critical) = classify(entry);
    Ok(ComponentUpdate {
        component: component.to_string(),
        current_version: installed.cloned(),
        latest_version: latest,
        update_available,
        update_size: entry.size,
        security,
        critical,
        download_url: entry.download_url.clone(),
        checksum_sha256: entry.checksum_sha256.clone(),
        signature: entry.signature.clone(),
    })
}

/// The set of installed component versions the checker compares against.
#[derive(Debug, Clone, Default)]
pub struct InstalledState {
    pub core: Option<Version>,
    pub templates: Option<Version>,
    pub modules: HashMap<String, Version>,
}

/// Checks a central update server and a set of per-component repositories
/// for available updates, merging per spec's public/internal precedence.
pub struct VersionChecker {
    update_server: Arc<dyn Repository>,
    template_repositories: Vec<Arc<dyn Repository>>,
    module_repositories: HashMap<String, Arc<dyn Repository>>,
    max_parallel: usize,
}

impl VersionChecker {
    pub fn new(update_server: Arc<dyn Repository>) -> Self {
        VersionChecker {
            update_server,
            template_repositories: Vec::new(),
            module_repositories: HashMap::new(),
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub fn add_template_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.template_repositories.push(repository);
        self
    }

    pub fn add_module_repository(mut self, module_id: impl Into<String>, repository: Arc<dyn Repository>) -> Self {
        self.module_repositories.insert(module_id.into(), repository);
        self
    }

    fn fetch_manifest(repository: &dyn Repository) -> Result<ReleaseManifest> {
        let mut reader = repository.get_file(MANIFEST_FILE_NAME)?;
        let mut buf = String::new();
        reader.read_to_string(&mut buf).map_err(|e| {
            UpdateError::network_permanent(COMPONENT, "fetch_manifest", format!("reading manifest body: {e}")).with_cause(e)
        })?;
        ReleaseManifest::parse(&buf)
    }

    /// Run `check_for_updates`, fanning internal-repository fetches out across
    /// a bounded thread pool (default 5, joined before return).
    pub fn check_for_updates(&self, installed: &InstalledState) -> Result<Vec<ComponentUpdate>> {
        let public_manifest = Self::fetch_manifest(self.update_server.as_ref())?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.max_parallel)
            .build()
            .map_err(|e| UpdateError::new(ErrorKind::NetworkPermanent, COMPONENT, "check_for_updates", format!("building repository fan-out pool: {e}")))?;

        let template_manifests: Vec<Result<ReleaseManifest>> = pool.install(|| {
            use rayon::prelude::*;
            self.template_repositories
                .par_iter()
                .map(|repo| Self::fetch_manifest(repo.as_ref()))
                .collect()
        });

        let module_manifests: Vec<(String, Result<ReleaseManifest>)> = pool.install(|| {
            use rayon::prelude::*;
            self.module_repositories
                .par_iter()
                .map(|(id, repo)| (id.clone(), Self::fetch_manifest(repo.as_ref())))
                .collect()
        });

        let mut updates = Vec::new();

        // Core binary: public source (update server) always wins.
        updates.push(to_component_update("core", installed.core.as_ref(), &public_manifest.core)?);

        // Templates: internal repository source wins when available.
        let templates_entry = template_manifests
            .into_iter()
            .find_map(|result| result.ok())
            .map(|manifest| manifest.templates)
            .unwrap_or(public_manifest.templates);
        updates.push(to_component_update("templates", installed.templates.as_ref(), &templates_entry)?);

        // Modules: internal repository source wins; fall back to the public
        // manifest's module list for any module without its own repository.
        let mut seen_modules = std::collections::HashSet::new();
        for (module_id, manifest_result) in module_manifests {
            if let Ok(manifest) = manifest_result {
                if let Some(entry) = manifest.modules.into_iter().find(|m| m.id == module_id) {
                    let installed_version = installed.modules.get(&module_id);
                    updates.push(to_component_update(&module_id, installed_version, &entry.entry)?);
                    seen_modules.insert(module_id);
                }
            }
        }
        for ModuleReleaseEntry { id, entry, .. } in public_manifest.modules {
            if seen_modules.contains(&id) {
                continue;
            }
            let installed_version = installed.modules.get(&id);
            updates.push(to_component_update(&id, installed_version, &entry)?);
        }

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryRepository;
    use chrono::Utc;

    fn manifest_json(core_version: &str, templates_version: &str, notes: &str) -> String {
        format!(
            r#"{{
                "core": {{
                    "version": "{core_version}",
                    "releaseDate": "2026-01-01T00:00:00Z",
                    "changelogURL": "https://example.test/c",
                    "releaseNotes": "{notes}",
                    "downloadURL": "https://example.test/core.bin",
                    "signature": "c2ln",
                    "checksumSHA256": "{hash}"
                }},
                "templates": {{
                    "version": "{templates_version}",
                    "releaseDate": "2026-01-01T00:00:00Z",
                    "changelogURL": "https://example.test/t",
                    "releaseNotes": "",
                    "downloadURL": "https://example.test/templates.zip",
                    "signature": "c2ln",
                    "checksumSHA256": "{hash}"
                }},
                "modules": []
            }}"#,
            hash = "0".repeat(64)
        )
    }

    #[test]
    fn core_update_available_when_server_version_is_newer() {
        let server = Arc::new(MemoryRepository::new());
        server.put(
            "release-manifest.json",
            manifest_json("1.1.0", "2.0.0", "Fixes a critical bug").into_bytes(),
            Utc::now(),
        );

        let checker = VersionChecker::new(server);
        let installed = InstalledState { core: Some(Version::parse("1.0.0").unwrap()), ..Default::default() };

        let updates = checker.check_for_updates(&installed).unwrap();
        let core = updates.iter().find(|u| u.component == "core").unwrap();
        assert!(core.update_available);
        assert!(core.security);
    }

    #[test]
    fn internal_template_repository_wins_over_public_manifest() {
        let server = Arc::new(MemoryRepository::new());
        server.put("release-manifest.json", manifest_json("1.0.0", "2.0.0", "").into_bytes(), Utc::now());

        let templates_repo = Arc::new(MemoryRepository::new());
        templates_repo.put("release-manifest.json", manifest_json("1.0.0", "2.5.0", "").into_bytes(), Utc::now());

        let checker = VersionChecker::new(server).add_template_repository(templates_repo);
        let installed = InstalledState::default();

        let updates = checker.check_for_updates(&installed).unwrap();
        let templates = updates.iter().find(|u| u.component == "templates").unwrap();
        assert_eq!(templates.latest_version, Version::parse("2.5.0").unwrap());
    }
}
