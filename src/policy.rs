//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Downgrade-protection policy (spec §3, §4.4). A signed security policy document
//! that gates the secure client's TLS parameters and every update decision.

use crate::error::{ErrorKind, Result, UpdateError};
use crate::hash::{SigningKeyMaterial, Verifier};
use crate::secure_client::ConnectionSecurityOptions;
use crate::version::Version;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const COMPONENT: &str = "policy";

#[cfg(unix)]
fn set_file_perms(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "set_permissions", format!("{}: {e}", path.display()))
    })
}

#[cfg(not(unix))]
fn set_file_perms(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

/// Key-size minimums keyed by algorithm family.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeySizeMinimums {
    pub rsa: u32,
    pub ecdsa: u32,
    pub ed25519: u32,
    pub symmetric: u32,
}

impl Default for KeySizeMinimums {
    fn default() -> Self {
        KeySizeMinimums { rsa: 2048, ecdsa: 256, ed25519: 256, symmetric: 128 }
    }
}

impl KeySizeMinimums {
    fn get(&self, family: &str) -> Option<u32> {
        match family.to_ascii_lowercase().as_str() {
            "rsa" => Some(self.rsa),
            "ecdsa" => Some(self.ecdsa),
            "ed25519" => Some(self.ed25519),
            "symmetric" => Some(self.symmetric),
            _ => None,
        }
    }
}

/// Signed security policy record (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityPolicy {
    pub min_tls_version: String,
    pub preferred_tls_version: String,
    pub allowed_cipher_suites: Vec<String>,
    pub allowed_signature_algorithms: Vec<String>,
    pub minimum_key_sizes: KeySizeMinimums,
    pub certificate_pinning_required: bool,
    pub revocation_check_required: bool,
    pub minimum_versions: HashMap<String, String>,
    pub last_update: DateTime<Utc>,
    pub policy_version: String,
    pub policy_signature: String,
    pub signature_verification_required: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        let mut minimum_versions = HashMap::new();
        minimum_versions.insert("core".to_string(), "0.0.0".to_string());
        minimum_versions.insert("templates".to_string(), "0.0.0".to_string());
        minimum_versions.insert("modules".to_string(), "0.0.0".to_string());

        SecurityPolicy {
            min_tls_version: "TLS1.2".to_string(),
            preferred_tls_version: "TLS1.3".to_string(),
            allowed_cipher_suites: Vec::new(),
            allowed_signature_algorithms: vec![
                "ed25519".to_string(),
                "ecdsa-p256-sha256".to_string(),
                "rsa-pkcs1v15-sha256".to_string(),
            ],
            minimum_key_sizes: KeySizeMinimums::default(),
            certificate_pinning_required: false,
            revocation_check_required: false,
            minimum_versions,
            last_update: Utc::now(),
            policy_version: "1".to_string(),
            policy_signature: String::new(),
            signature_verification_required: false,
        }
    }
}

impl SecurityPolicy {
    /// Serialize with `policy_signature` blanked, the canonical form signed over
    /// and verified against.
    fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut blanked = self.clone();
        blanked.policy_signature = String::new();
        serde_json::to_vec(&blanked).map_err(|e| {
            UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "serialize", e.to_string())
        })
    }

    /// Load from JSON. If `verifier` is present and the signature field is
    /// non-empty, the policy's signature over its own serialization (signature
    /// field blanked) must verify or the load fails.
    pub fn load(path: &Path, verifier: Option<&Verifier>) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "load", format!("reading {}: {e}", path.display()))
        })?;
        let policy: SecurityPolicy = serde_json::from_slice(&data).map_err(|e| {
            UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "load", format!("malformed policy JSON: {e}"))
        })?;

        if let Some(v) = verifier {
            if !policy.policy_signature.is_empty() {
                let canonical = policy.canonical_bytes()?;
                let ok = v.verify(&canonical, &policy.policy_signature)?;
                if !ok {
                    return Err(UpdateError::integrity(COMPONENT, "load", "policy signature verification failed"));
                }
            }
        }

        Ok(policy)
    }

    /// Write with 0600 permissions under a 0700 parent directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                UpdateError::filesystem(COMPONENT, "save", format!("creating {}: {e}", parent.display()))
            })?;
            set_file_perms(parent, 0o700)?;
        }
        let data = serde_json::to_vec_pretty(self).map_err(|e| {
            UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "save", e.to_string())
        })?;
        fs::write(path, data).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "save", format!("writing {}: {e}", path.display()))
        })?;
        set_file_perms(path, 0o600)?;
        Ok(())
    }

    /// Regenerate `policy_signature` by signing the canonical (signature-blanked)
    /// serialization.
    pub fn sign(&mut self, key: &SigningKeyMaterial) -> Result<()> {
        self.policy_signature.clear();
        let canonical = self.canonical_bytes()?;
        self.policy_signature = crate::hash::sign(&canonical, key)?;
        Ok(())
    }

    pub fn validate_connection(&self, options: &ConnectionSecurityOptions) -> Result<()> {
        let policy_min = tls_rank(&self.min_tls_version)?;
        let requested_min = tls_rank(&options.min_tls_version)?;
        if requested_min < policy_min {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_connection",
                format!(
                    "requested minimum TLS {} is below policy minimum {}",
                    options.min_tls_version, self.min_tls_version
                ),
            ));
        }

        if !self.allowed_cipher_suites.is_empty() {
            for suite in &options.cipher_suites {
                if !self.allowed_cipher_suites.contains(suite) {
                    return Err(UpdateError::policy_denial(
                        COMPONENT,
                        "validate_connection",
                        format!("cipher suite {suite} is outside the policy allow-list"),
                    ));
                }
            }
        }

        if self.certificate_pinning_required && !options.certificate_pinning_enabled {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_connection",
                "certificate pinning is required by policy but disabled",
            ));
        }

        if self.revocation_check_required && !options.revocation_check_enabled {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_connection",
                "revocation checking is required by policy but disabled",
            ));
        }

        Ok(())
    }

    pub fn validate_signature_algorithm(&self, algorithm: &str) -> Result<()> {
        if self.allowed_signature_algorithms.iter().any(|a| a.eq_ignore_ascii_case(algorithm)) {
            Ok(())
        } else {
            Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_signature_algorithm",
                format!("signature algorithm {algorithm} is not on the policy allow-list"),
            ))
        }
    }

    pub fn validate_key_size(&self, family: &str, bits: u32) -> Result<()> {
        match self.minimum_key_sizes.get(family) {
            Some(min) if bits >= min => Ok(()),
            Some(min) => Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_key_size",
                format!("{family} key size {bits} bits is below policy minimum {min} bits"),
            )),
            None => Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_key_size",
                format!("unknown key family {family}"),
            )),
        }
    }

    pub fn validate_version(&self, component: &str, version: &Version) -> Result<()> {
        let min_str = self.minimum_versions.get(component).ok_or_else(|| {
            UpdateError::policy_denial(
                COMPONENT,
                "validate_version",
                format!("no policy minimum configured for component {component}"),
            )
        })?;
        let min = Version::parse(min_str)?;
        if version < &min {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_version",
                format!("minimum_versions.{component}: installed/candidate version {version} is below policy minimum {min}"),
            ));
        }
        Ok(())
    }

    /// Validate an update package's declared manifest signature and each
    /// component's version against the minimum map.
    pub fn validate_update_package(&self, manifest_signature: &str, component_versions: &[(String, Version)]) -> Result<()> {
        if self.signature_verification_required && manifest_signature.is_empty() {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "validate_update_package",
                "manifest signature is required by policy but absent",
            ));
        }
        for (component, version) in component_versions {
            self.validate_version(component, version)?;
        }
        Ok(())
    }

    /// Strictly raise `options` to satisfy policy: raise minimum TLS, intersect
    /// cipher suites (falling back to the full allow-list if the intersection is
    /// empty), and force pinning/revocation flags on when required.
    pub fn enforce(&self, options: &mut ConnectionSecurityOptions) {
        let policy_min = tls_rank(&self.min_tls_version).unwrap_or(0);
        let requested_min = tls_rank(&options.min_tls_version).unwrap_or(0);
        if requested_min < policy_min {
            options.min_tls_version = self.min_tls_version.clone();
        }

        if !self.allowed_cipher_suites.is_empty() {
            if options.cipher_suites.is_empty() {
                options.cipher_suites = self.allowed_cipher_suites.clone();
            } else {
                let intersected: Vec<String> = options
                    .cipher_suites
                    .iter()
                    .filter(|s| self.allowed_cipher_suites.contains(s))
                    .cloned()
                    .collect();
                options.cipher_suites = if intersected.is_empty() {
                    self.allowed_cipher_suites.clone()
                } else {
                    intersected
                };
            }
        }

        if self.certificate_pinning_required {
            options.certificate_pinning_enabled = true;
        }
        if self.revocation_check_required {
            options.revocation_check_enabled = true;
        }
    }

    pub fn update_minimum_version(&mut self, path: &Path, component: &str, version: &Version) -> Result<()> {
        self.minimum_versions.insert(component.to_string(), version.to_string());
        self.last_update = Utc::now();
        self.save(path)
    }

    pub fn update_allowed_signature_algorithms(&mut self, path: &Path, algorithms: Vec<String>) -> Result<()> {
        if algorithms.is_empty() {
            return Err(UpdateError::policy_denial(
                COMPONENT,
                "update_allowed_signature_algorithms",
                "refusing to set an empty signature algorithm allow-list",
            ));
        }
        self.allowed_signature_algorithms = algorithms;
        self.last_update = Utc::now();
        self.save(path)
    }

    pub fn update_minimum_key_size(&mut self, path: &Path, family: &str, bits: u32) -> Result<()> {
        match family.to_ascii_lowercase().as_str() {
            "rsa" => self.minimum_key_sizes.rsa = bits,
            "ecdsa" => self.minimum_key_sizes.ecdsa = bits,
            "ed25519" => self.minimum_key_sizes.ed25519 = bits,
            "symmetric" => self.minimum_key_sizes.symmetric = bits,
            other => {
                return Err(UpdateError::policy_denial(
                    COMPONENT,
                    "update_minimum_key_size",
                    format!("unknown key family {other}"),
                ))
            }
        }
        self.last_update = Utc::now();
        self.save(path)
    }
}

fn tls_rank(version: &str) -> Result<u8> {
    match version.to_ascii_uppercase().replace(['.', '_'], "").as_str() {
        "TLS10" | "TLSV10" => Ok(0),
        "TLS11" | "TLSV11" => Ok(1),
        "TLS12" | "TLSV12" => Ok(2),
        "TLS13" | "TLSV13" => Ok(3),
        other => Err(UpdateError::new(
            ErrorKind::Incompatibility,
            COMPONENT,
            "tls_rank",
            format!("unrecognized TLS version {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey as Ed25519SigningKey;
    use rand::rngs::OsRng;
    use tempfile::tempdir;

    fn keypair() -> (SigningKeyMaterial, Verifier) {
        let sk = Ed25519SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        (
            SigningKeyMaterial::Ed25519(Box::new(sk)),
            Verifier::Ed25519(Box::new(vk)),
        )
    }

    #[test]
    fn sign_save_load_verify_roundtrips() {
        let (key, verifier) = keypair();
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy").join("policy.json");

        let mut policy = SecurityPolicy::default();
        policy.sign(&key).unwrap();
        policy.save(&path).unwrap();

        let loaded = SecurityPolicy::load(&path, Some(&verifier)).unwrap();
        assert_eq!(loaded.policy_version, policy.policy_version);
    }

    #[test]
    fn tampering_with_saved_file_fails_verification() {
        let (key, verifier) = keypair();
        let dir = tempdir().unwrap();
        let path = dir.path().join("policy.json");

        let mut policy = SecurityPolicy::default();
        policy.min_tls_version = "TLS1.3".to_string();
        policy.sign(&key).unwrap();
        policy.save(&path).unwrap();

        let mut raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        raw["min_tls_version"] = serde_json::json!("TLS1.0");
        fs::write(&path, serde_json::to_string(&raw).unwrap()).unwrap();

        let err = SecurityPolicy::load(&path, Some(&verifier)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::IntegrityFailure);
    }

    #[test]
    fn validate_connection_rejects_weak_tls() {
        let policy = SecurityPolicy::default();
        let mut opts = ConnectionSecurityOptions::default();
        opts.min_tls_version = "TLS1.0".to_string();
        assert!(policy.validate_connection(&opts).is_err());
    }

    #[test]
    fn enforce_raises_tls_minimum_and_flags() {
        let mut policy = SecurityPolicy::default();
        policy.certificate_pinning_required = true;
        policy.revocation_check_required = true;

        let mut opts = ConnectionSecurityOptions::default();
        opts.min_tls_version = "TLS1.0".to_string();
        policy.enforce(&mut opts);

        assert_eq!(opts.min_tls_version, "TLS1.2");
        assert!(opts.certificate_pinning_enabled);
        assert!(opts.revocation_check_enabled);
        assert!(policy.validate_connection(&opts).is_ok());
    }

    #[test]
    fn validate_version_rejects_downgrade() {
        let mut policy = SecurityPolicy::default();
        policy.minimum_versions.insert("core".to_string(), "1.1.0".to_string());
        let err = policy.validate_version("core", &Version::parse("1.0.5").unwrap()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PolicyDenial);
        assert!(err.message.contains("minimum_versions.core"));
    }
}
