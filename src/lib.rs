//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Self-update subsystem for a command-line security tool: version discovery,
//! integrity verification, transactional application with rollback,
//! customization preservation across updates, and a downgrade-protection
//! policy engine that gates both network parameters and update packages.
//!
//! The end-user CLI surface, notification system, and report generation are
//! out of scope; this crate exposes the core the thin CLI wraps.

pub mod binary_updater;
pub mod bundle;
pub mod customization;
pub mod error;
pub mod hash;
pub mod package;
pub mod policy;
pub mod release_manifest;
pub mod repository;
pub mod sanitize;
pub mod secure_client;
pub mod tls;
pub mod transaction;
pub mod version;
pub mod version_checker;

pub use error::{ErrorKind, Result, UpdateError};

use crate::customization::CustomizationRegistry;
use crate::policy::SecurityPolicy;
use crate::secure_client::{ConnectionSecurityOptions, SecureHttpClient};
use crate::transaction::{ComponentKind, Operation, Transaction, TransactionHook, VerificationHook};
use crate::version::Version;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const COMPONENT: &str = "update_pipeline";

/// Optional post-replacement check for the binary component: spawn the new
/// binary with `version_arg` and require its stdout to contain
/// `expected_version` within `timeout` before the apply is considered good.
pub struct BinaryVersionCheck {
    pub version_arg: String,
    pub expected_version: String,
    pub timeout: Duration,
}

/// Everything [`UpdatePipeline::apply_package`] needs: where the package is,
/// what is currently installed, and where to stage, install, and back up.
pub struct ApplyRequest<'a> {
    pub package_path: &'a Path,
    pub verifier: &'a hash::Verifier,
    pub installed_core: Version,
    pub installed_templates: Version,
    pub installed_modules: HashMap<String, Version>,
    pub platform: String,
    pub install_root: PathBuf,
    pub staging_root: PathBuf,
    pub backup_root: PathBuf,
    pub current_executable: PathBuf,
    pub binary_version_check: Option<BinaryVersionCheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub package_id: String,
    pub state: ApplyState,
    pub backup_root: PathBuf,
}

/// Owns the process-wide policy and customization registry state and wires
/// them into the secure client and executor (spec §9 Design Notes: "make the
/// policy a value owned by the update pipeline's top-level driver"). Loaders
/// are the only mutators of the policy; reads may proceed concurrently.
pub struct UpdatePipeline {
    policy: Arc<RwLock<SecurityPolicy>>,
    registry: Arc<RwLock<CustomizationRegistry>>,
    policy_path: PathBuf,
    registry_path: PathBuf,
    verification_hooks: Vec<Box<dyn VerificationHook>>,
    pre_hooks: Vec<Box<dyn TransactionHook>>,
    post_hooks: Vec<Box<dyn TransactionHook>>,
}

impl UpdatePipeline {
    /// Load the policy and customization registry from disk (creating an
    /// empty registry if none exists) and construct the driver.
    pub fn load(
        policy_path: PathBuf,
        registry_path: PathBuf,
        policy_verifier: Option<&hash::Verifier>,
    ) -> Result<Self> {
        let policy = if policy_path.exists() {
            SecurityPolicy::load(&policy_path, policy_verifier)?
        } else {
            SecurityPolicy::default()
        };
        let registry = CustomizationRegistry::load(&registry_path)?;

        Ok(UpdatePipeline {
            policy: Arc::new(RwLock::new(policy)),
            registry: Arc::new(RwLock::new(registry)),
            policy_path,
            registry_path,
            verification_hooks: Vec::new(),
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
        })
    }

    pub fn add_verification_hook(&mut self, hook: Box<dyn VerificationHook>) {
        self.verification_hooks.push(hook);
    }

    pub fn add_pre_hook(&mut self, hook: Box<dyn TransactionHook>) {
        self.pre_hooks.push(hook);
    }

    pub fn add_post_hook(&mut self, hook: Box<dyn TransactionHook>) {
        self.post_hooks.push(hook);
    }

    /// Build a secure HTTP client whose connection parameters have already
    /// passed through the current policy's `enforce`.
    pub fn secure_client(&self, options: ConnectionSecurityOptions) -> Result<SecureHttpClient> {
        let policy = self.policy.read().expect("policy lock poisoned");
        SecureHttpClient::new(options, &policy)
    }

    /// Validate a candidate package against the current policy before any
    /// transaction is opened (spec §4.6, §4.7 apply-sequence first step).
    pub fn validate_package_against_policy(
        &self,
        manifest_signature: &str,
        component_versions: &[(String, version::Version)],
    ) -> Result<()> {
        let policy = self.policy.read().expect("policy lock poisoned");
        policy.validate_update_package(manifest_signature, component_versions)
    }

    /// Run every registered verification hook; any failure aborts before a
    /// transaction begins (spec §4.7).
    pub fn run_verification_hooks(&self) -> Result<()> {
        for hook in &self.verification_hooks {
            let result = hook.verify();
            if !result.passed {
                return Err(UpdateError::validation(
                    "update_pipeline",
                    "run_verification_hooks",
                    result.diagnostic,
                ));
            }
        }
        Ok(())
    }

    pub fn pre_hooks(&self) -> &[Box<dyn TransactionHook>] {
        &self.pre_hooks
    }

    pub fn post_hooks(&self) -> &[Box<dyn TransactionHook>] {
        &self.post_hooks
    }

    pub fn registry(&self) -> Arc<RwLock<CustomizationRegistry>> {
        self.registry.clone()
    }

    pub fn save_registry(&self) -> Result<()> {
        let registry = self.registry.read().expect("registry lock poisoned");
        registry.save(&self.registry_path)
    }

    /// Reload the policy from disk; the loader is the only mutator of policy state.
    pub fn reload_policy(&self, verifier: Option<&hash::Verifier>) -> Result<()> {
        let reloaded = SecurityPolicy::load(&self.policy_path, verifier)?;
        *self.policy.write().expect("policy lock poisoned") = reloaded;
        Ok(())
    }

    pub fn policy(&self) -> Arc<RwLock<SecurityPolicy>> {
        self.policy.clone()
    }

    /// Run the full apply sequence for a package (spec §4.7): verify → check
    /// compatibility → run verification hooks → back up customizations →
    /// begin a transaction → pre-hooks → back up/extract/replace each
    /// component (binary, then templates, then modules, in manifest order) →
    /// post-hooks → commit, reapplying customizations last. Any failure after
    /// a component has been mutated rolls back everything mutated so far,
    /// including a binary replacement, which sits outside the transaction
    /// because it uses `binary_updater`'s platform-specific replace rather
    /// than the generic file/directory swap the executor performs for the
    /// other components.
    pub fn apply_package(&self, request: ApplyRequest) -> Result<ApplyOutcome> {
        let mut package = package::UpdatePackage::open(request.package_path)?;
        package.verify(request.verifier)?;
        package.check_compatibility(&request.installed_core, &request.installed_templates, &request.installed_modules)?;
        self.run_verification_hooks()?;

        customization::backup_all(
            &self.registry.read().expect("registry lock poisoned"),
            &request.install_root,
            &request.backup_root,
        )?;

        let mut transaction = Transaction::new();
        for hook in &self.pre_hooks {
            let result = hook.run(&transaction);
            if !result.passed {
                return Err(UpdateError::validation(COMPONENT, "apply_package", result.diagnostic));
            }
        }

        let mut binary_backup_path: Option<PathBuf> = None;
        if let Some(binary) = package.manifest.binary.clone() {
            if !binary.platform_checksums.contains_key(&request.platform) {
                return Err(UpdateError::incompatibility(
                    COMPONENT,
                    "apply_package",
                    format!("package declares no binary payload for platform {}", request.platform),
                ));
            }

            let executable_dir = request.current_executable.parent().unwrap_or_else(|| Path::new("."));
            let permissions = binary_updater::get_update_permissions(executable_dir);
            if permissions.elevation_required {
                let elevation = binary_updater::ElevationRequired {
                    method: binary_updater::elevation_method(),
                    reason: format!("{} is not writable by the current user", executable_dir.display()),
                };
                return Err(UpdateError::policy_denial(
                    COMPONENT,
                    "apply_package",
                    format!("elevation via {:?} is required before the binary component can be replaced: {}", elevation.method, elevation.reason),
                ));
            }

            let backup_path = request.backup_root.join("binary").join("executable");
            if request.current_executable.exists() {
                if let Some(parent) = backup_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        UpdateError::filesystem(COMPONENT, "apply_package", format!("creating {}: {e}", parent.display())).with_cause(e)
                    })?;
                }
                std::fs::copy(&request.current_executable, &backup_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "apply_package", format!("backing up {}: {e}", request.current_executable.display())).with_cause(e)
                })?;
            }

            let archive_member = format!("binary/{}/payload", request.platform);
            package.extract_file(&archive_member, &request.staging_root)?;
            let staged_binary = request.staging_root.join(&archive_member);

            binary_updater::replace_executable(&staged_binary, &request.current_executable)?;
            binary_backup_path = Some(backup_path.clone());

            if let Some(check) = &request.binary_version_check {
                let valid = binary_updater::validate_post_replacement(
                    &request.current_executable,
                    &check.version_arg,
                    &check.expected_version,
                    check.timeout,
                )?;
                if !valid {
                    binary_updater::rollback_from_backup(&backup_path, &request.current_executable)?;
                    return Err(UpdateError::validation(
                        COMPONENT,
                        "apply_package",
                        "binary failed post-replacement validation; restored from backup",
                    ));
                }
            }
        }

        if package.manifest.templates.is_some() {
            let staged_dir = request.staging_root.join("templates");
            package.extract_directory("templates/", &staged_dir)?;
            let dest_dir = request.install_root.join("templates");
            let backup_dir = request.backup_root.join("templates");
            transaction.add_operation(Operation::new_directory(ComponentKind::Templates, "templates", staged_dir, dest_dir, backup_dir))?;
        }

        for module in package.manifest.modules.clone() {
            let staged_dir = request.staging_root.join("modules").join(&module.id);
            package.extract_directory(&format!("modules/{}/", module.id), &staged_dir)?;
            let dest_dir = request.install_root.join("modules").join(&module.id);
            let backup_dir = request.backup_root.join("modules").join(&module.id);
            transaction.add_operation(Operation::new_directory(ComponentKind::Module, module.id.clone(), staged_dir, dest_dir, backup_dir))?;
        }

        if let Err(err) = transaction.execute() {
            if let Some(backup_path) = &binary_backup_path {
                let _ = binary_updater::rollback_from_backup(backup_path, &request.current_executable);
            }
            return Err(err);
        }

        for hook in &self.post_hooks {
            let result = hook.run(&transaction);
            if !result.passed {
                let _ = transaction.rollback();
                if let Some(backup_path) = &binary_backup_path {
                    let _ = binary_updater::rollback_from_backup(backup_path, &request.current_executable);
                }
                return Err(UpdateError::validation(COMPONENT, "apply_package", result.diagnostic));
            }
        }

        transaction.commit()?;

        {
            let mut registry = self.registry.write().expect("registry lock poisoned");
            for entry in registry.entries_mut() {
                let backup_path = request.backup_root.join(&entry.relative_path);
                let installed_path = request.install_root.join(&entry.relative_path);
                if !backup_path.exists() || !installed_path.exists() {
                    continue;
                }
                let backup_content = std::fs::read(&backup_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "apply_package", format!("reading customization backup {}: {e}", backup_path.display())).with_cause(e)
                })?;
                let new_installed_content = std::fs::read(&installed_path).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "apply_package", format!("reading installed {}: {e}", installed_path.display())).with_cause(e)
                })?;
                // The pre-update shipped baseline is not retained separately from the
                // customization backup in this orchestration; the backup stands in for
                // it, so a no-op update (installed == backup) reapplies cleanly while a
                // real update always takes the policy-driven merge/preserve branch.
                let reapplied = customization::reapply_entry(entry, &backup_content, &new_installed_content, &backup_content)?;
                std::fs::write(&installed_path, reapplied).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "apply_package", format!("writing reapplied {}: {e}", installed_path.display())).with_cause(e)
                })?;
            }
        }
        self.save_registry()?;

        Ok(ApplyOutcome {
            package_id: package.manifest.package_id.clone(),
            state: ApplyState::Committed,
            backup_root: request.backup_root,
        })
    }
}
