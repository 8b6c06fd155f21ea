//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Hash & Signature primitives (spec §4.1). Content hashing over SHA-256/512 and
//! BLAKE2b-512/BLAKE2s-256, with MD5/SHA-1 accepted only for legacy verification.
//! Detached signatures over Ed25519, ECDSA-P256/SHA-256, and RSA-PKCS1v15/SHA-256.

use crate::error::{ErrorKind, Result, UpdateError};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use blake2::{Blake2b512, Blake2s256};
use ed25519_dalek::{Signer as Ed25519Signer, Verifier as Ed25519Verifier, SigningKey, VerifyingKey};
use md5::Md5;
use p256::ecdsa::signature::{Signer as P256Signer, Verifier as P256Verifier};
use p256::ecdsa::{Signature as P256Signature, SigningKey as P256SigningKey, VerifyingKey as P256VerifyingKey};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier as RsaVerifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use std::fs;
use std::io::Read;
use std::path::Path;
use subtle::ConstantTimeEq;

const COMPONENT: &str = "hash";

/// Supported content-hash algorithms. MD5/SHA-1 are accepted only when verifying
/// legacy manifests; this module never produces new signatures over them because
/// `sign` only dispatches on key type, never on a caller-chosen digest algorithm
/// weaker than SHA-256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
    Blake2b512,
    Blake2s256,
    Md5,
    Sha1,
}

impl HashAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Blake2b512 => "blake2b512",
            HashAlgorithm::Blake2s256 => "blake2s256",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "sha512" | "sha-512" => Ok(HashAlgorithm::Sha512),
            "blake2b512" | "blake2b" => Ok(HashAlgorithm::Blake2b512),
            "blake2s256" | "blake2s" => Ok(HashAlgorithm::Blake2s256),
            "md5" => Ok(HashAlgorithm::Md5),
            "sha1" | "sha-1" => Ok(HashAlgorithm::Sha1),
            other => Err(UpdateError::new(
                ErrorKind::Incompatibility,
                COMPONENT,
                "parse_algorithm",
                format!("unsupported hash algorithm {other:?}"),
            )),
        }
    }

    fn expected_hex_len(self) -> usize {
        match self {
            HashAlgorithm::Sha256 | HashAlgorithm::Blake2s256 => 64,
            HashAlgorithm::Sha512 | HashAlgorithm::Blake2b512 => 128,
            HashAlgorithm::Md5 => 32,
            HashAlgorithm::Sha1 => 40,
        }
    }
}

/// Tagged hash output: algorithm, raw bytes, and the lowercase hex rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashResult {
    pub algorithm: HashAlgorithm,
    pub bytes: Vec<u8>,
    pub hex: String,
}

impl HashResult {
    /// Serialized manifest form: `"<algorithm>:<hex>"`.
    pub fn to_tagged_string(&self) -> String {
        format!("{}:{}", self.algorithm.name(), self.hex)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        use std::fmt::Write;
        write!(&mut s, "{:02x}", b).expect("writing into a String cannot fail");
    }
    s
}

/// Hash a byte slice with the given algorithm.
pub fn hash_bytes(data: &[u8], algorithm: HashAlgorithm) -> HashResult {
    let bytes = match algorithm {
        HashAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        HashAlgorithm::Blake2b512 => Blake2b512::digest(data).to_vec(),
        HashAlgorithm::Blake2s256 => Blake2s256::digest(data).to_vec(),
        HashAlgorithm::Md5 => Md5::digest(data).to_vec(),
        HashAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
    };
    let hex = hex_encode(&bytes);
    HashResult { algorithm, bytes, hex }
}

/// Hash a file's contents, streaming in 64 KiB chunks so large artifacts do not
/// need to be loaded entirely into memory.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<HashResult> {
    let file = fs::File::open(path).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "hash_file", format!("opening {}: {e}", path.display()))
    })?;
    let mut reader = std::io::BufReader::with_capacity(64 * 1024, file);
    let mut buf = [0u8; 64 * 1024];

    macro_rules! stream {
        ($hasher:expr) => {{
            let mut hasher = $hasher;
            loop {
                let n = reader.read(&mut buf).map_err(|e| {
                    UpdateError::filesystem(COMPONENT, "hash_file", format!("reading {}: {e}", path.display()))
                })?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            hasher.finalize().to_vec()
        }};
    }

    let bytes = match algorithm {
        HashAlgorithm::Sha256 => stream!(Sha256::new()),
        HashAlgorithm::Sha512 => stream!(Sha512::new()),
        HashAlgorithm::Blake2b512 => stream!(Blake2b512::new()),
        HashAlgorithm::Blake2s256 => stream!(Blake2s256::new()),
        HashAlgorithm::Md5 => stream!(Md5::new()),
        HashAlgorithm::Sha1 => stream!(Sha1::new()),
    };
    let hex = hex_encode(&bytes);
    Ok(HashResult { algorithm, bytes, hex })
}

/// Parse a `"<algorithm>:<hex>"` declaration, defaulting to SHA-256 when the
/// algorithm prefix is absent, and verify it against `data` in constant time.
pub fn verify(data: &[u8], declared: &str) -> Result<bool> {
    let (algorithm, hex) = parse_tagged(declared)?;
    verify_with_algorithm(data, algorithm, hex)
}

/// Same as [`verify`] but reads the content from a file.
pub fn verify_file(path: &Path, declared: &str) -> Result<bool> {
    let (algorithm, hex) = parse_tagged(declared)?;
    let got = hash_file(path, algorithm)?;
    Ok(constant_time_hex_eq(&got.hex, hex))
}

fn parse_tagged(declared: &str) -> Result<(HashAlgorithm, &str)> {
    match declared.split_once(':') {
        Some((alg, hex)) => Ok((HashAlgorithm::parse(alg)?, hex)),
        None => Ok((HashAlgorithm::Sha256, declared)),
    }
}

fn verify_with_algorithm(data: &[u8], algorithm: HashAlgorithm, declared_hex: &str) -> Result<bool> {
    if declared_hex.len() != algorithm.expected_hex_len() {
        return Err(UpdateError::new(
            ErrorKind::IntegrityFailure,
            COMPONENT,
            "verify",
            format!(
                "hex length mismatch for {}: expected {} chars, got {}",
                algorithm.name(),
                algorithm.expected_hex_len(),
                declared_hex.len()
            ),
        ));
    }
    let got = hash_bytes(data, algorithm);
    Ok(constant_time_hex_eq(&got.hex, declared_hex))
}

/// Constant-time comparison of two hex strings (case-insensitive), used for every
/// piece of authentication material this module touches.
pub fn constant_time_hex_eq(a: &str, b: &str) -> bool {
    let a = a.to_ascii_lowercase();
    let b = b.to_ascii_lowercase();
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// A signature algorithm, inferred from the key material at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    Ed25519,
    EcdsaP256Sha256,
    RsaPkcs1v15Sha256,
}

impl SignatureAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::EcdsaP256Sha256 => "ecdsa-p256-sha256",
            SignatureAlgorithm::RsaPkcs1v15Sha256 => "rsa-pkcs1v15-sha256",
        }
    }
}

/// A parsed public key, ready to verify detached signatures.
pub enum Verifier {
    Ed25519(Box<VerifyingKey>),
    EcdsaP256(Box<P256VerifyingKey>),
    Rsa(Box<RsaVerifyingKey<Sha256>>),
}

impl Verifier {
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            Verifier::Ed25519(_) => SignatureAlgorithm::Ed25519,
            Verifier::EcdsaP256(_) => SignatureAlgorithm::EcdsaP256Sha256,
            Verifier::Rsa(_) => SignatureAlgorithm::RsaPkcs1v15Sha256,
        }
    }

    /// Verify a base64-encoded detached signature over `data`.
    pub fn verify(&self, data: &[u8], signature_b64: &str) -> Result<bool> {
        let sig_bytes = B64.decode(signature_b64.trim()).map_err(|e| {
            UpdateError::integrity(COMPONENT, "verify_signature", format!("invalid base64 signature: {e}"))
        })?;

        Ok(match self {
            Verifier::Ed25519(vk) => {
                let arr: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
                    UpdateError::integrity(COMPONENT, "verify_signature", "Ed25519 signature must be 64 bytes")
                })?;
                let sig = ed25519_dalek::Signature::from_bytes(&arr);
                vk.verify(data, &sig).is_ok()
            }
            Verifier::EcdsaP256(vk) => match P256Signature::try_from(sig_bytes.as_slice()) {
                Ok(sig) => P256Verifier::verify(vk, data, &sig).is_ok(),
                Err(_) => false,
            },
            Verifier::Rsa(vk) => match RsaSignature::try_from(sig_bytes.as_slice()) {
                Ok(sig) => RsaVerifier::verify(vk, data, &sig).is_ok(),
                Err(_) => false,
            },
        })
    }

    pub fn verify_file(&self, path: &Path, signature_b64: &str) -> Result<bool> {
        let data = fs::read(path).map_err(|e| {
            UpdateError::filesystem(COMPONENT, "verify_signature_file", format!("reading {}: {e}", path.display()))
        })?;
        self.verify(&data, signature_b64)
    }
}

/// Parse a public key from PEM (`"PUBLIC KEY"`, `"RSA PUBLIC KEY"`) or a raw 32-byte
/// Ed25519 key.
pub fn parse_public_key(bytes: &[u8]) -> Result<Verifier> {
    if bytes.len() == 32 {
        let arr: [u8; 32] = bytes.try_into().unwrap();
        if let Ok(vk) = VerifyingKey::from_bytes(&arr) {
            return Ok(Verifier::Ed25519(Box::new(vk)));
        }
    }

    let pem_str = std::str::from_utf8(bytes).map_err(|_| {
        UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "parse_public_key", "key material is neither raw Ed25519 bytes nor UTF-8 PEM")
    })?;
    let parsed = pem::parse(pem_str).map_err(|e| {
        UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "parse_public_key", format!("malformed PEM: {e}"))
    })?;

    match parsed.tag() {
        "PUBLIC KEY" => {
            if let Ok(vk) = VerifyingKey::from_public_key_der(parsed.contents()) {
                return Ok(Verifier::Ed25519(Box::new(vk)));
            }
            if let Ok(vk) = P256VerifyingKey::from_public_key_der(parsed.contents()) {
                return Ok(Verifier::EcdsaP256(Box::new(vk)));
            }
            if let Ok(pk) = RsaPublicKey::from_public_key_der(parsed.contents()) {
                return Ok(Verifier::Rsa(Box::new(RsaVerifyingKey::new(pk))));
            }
            Err(UpdateError::new(
                ErrorKind::Incompatibility,
                COMPONENT,
                "parse_public_key",
                "PEM block tagged PUBLIC KEY did not parse as Ed25519, ECDSA-P256, or RSA",
            ))
        }
        "RSA PUBLIC KEY" => {
            let pk = RsaPublicKey::from_pkcs1_der(parsed.contents()).map_err(|e| {
                UpdateError::new(ErrorKind::Incompatibility, COMPONENT, "parse_public_key", format!("malformed RSA key: {e}"))
            })?;
            Ok(Verifier::Rsa(Box::new(RsaVerifyingKey::new(pk))))
        }
        other => Err(UpdateError::new(
            ErrorKind::Incompatibility,
            COMPONENT,
            "parse_public_key",
            format!("unsupported PEM tag {other:?}"),
        )),
    }
}

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;

/// A private key used for signing. Ed25519 signs the raw content; RSA and ECDSA
/// sign a SHA-256 digest (spec §4.1).
pub enum SigningKeyMaterial {
    Ed25519(Box<SigningKey>),
    EcdsaP256(Box<P256SigningKey>),
    Rsa(Box<RsaPrivateKey>),
}

/// Sign `data`, dispatching by key type, and return the base64-encoded detached
/// signature.
pub fn sign(data: &[u8], key: &SigningKeyMaterial) -> Result<String> {
    let sig_bytes = match key {
        SigningKeyMaterial::Ed25519(sk) => sk.sign(data).to_bytes().to_vec(),
        SigningKeyMaterial::EcdsaP256(sk) => {
            let sig: P256Signature = P256Signer::sign(sk.as_ref(), data);
            sig.to_bytes().to_vec()
        }
        SigningKeyMaterial::Rsa(sk) => {
            let signing_key = RsaSigningKey::<Sha256>::new(sk.as_ref().clone());
            signing_key
                .sign_with_rng(&mut rand::rngs::OsRng, data)
                .to_bytes()
                .to_vec()
        }
    };
    Ok(B64.encode(sig_bytes))
}

/// Sign a file's contents.
pub fn sign_file(path: &Path, key: &SigningKeyMaterial) -> Result<String> {
    let data = fs::read(path).map_err(|e| {
        UpdateError::filesystem(COMPONENT, "sign_file", format!("reading {}: {e}", path.display()))
    })?;
    sign(&data, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn verify_matches_hash_flips_on_single_bit() {
        let data = b"hello world";
        let h = hash_bytes(data, HashAlgorithm::Sha256);
        assert!(verify(data, &h.to_tagged_string()).unwrap());

        let mut flipped = data.to_vec();
        flipped[0] ^= 0x01;
        assert!(!verify(&flipped, &h.to_tagged_string()).unwrap());
    }

    #[test]
    fn verify_defaults_to_sha256_without_prefix() {
        let data = b"payload";
        let h = hash_bytes(data, HashAlgorithm::Sha256);
        assert!(verify(data, &h.hex).unwrap());
    }

    #[test]
    fn hex_length_mismatch_is_rejected() {
        let err = verify(b"x", "sha256:deadbeef").unwrap_err();
        assert_eq!(err.kind, ErrorKind::IntegrityFailure);
    }

    #[test]
    fn ed25519_sign_then_verify_roundtrips() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk = sk.verifying_key();
        let key = SigningKeyMaterial::Ed25519(Box::new(sk));
        let sig = sign(b"message", &key).unwrap();

        let verifier = Verifier::Ed25519(Box::new(vk));
        assert!(verifier.verify(b"message", &sig).unwrap());
        assert!(!verifier.verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn ecdsa_p256_sign_then_verify_roundtrips() {
        let sk = P256SigningKey::random(&mut OsRng);
        let vk = *sk.verifying_key();
        let key = SigningKeyMaterial::EcdsaP256(Box::new(sk));
        let sig = sign(b"message", &key).unwrap();

        let verifier = Verifier::EcdsaP256(Box::new(vk));
        assert!(verifier.verify(b"message", &sig).unwrap());
        assert!(!verifier.verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn rsa_pkcs1v15_sign_then_verify_roundtrips() {
        let sk = RsaPrivateKey::new(&mut OsRng, 2048).unwrap();
        let pk = sk.to_public_key();
        let key = SigningKeyMaterial::Rsa(Box::new(sk));
        let sig = sign(b"message", &key).unwrap();

        let verifier = Verifier::Rsa(Box::new(RsaVerifyingKey::<Sha256>::new(pk)));
        assert!(verifier.verify(b"message", &sig).unwrap());
        assert!(!verifier.verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn raw_ed25519_public_key_bytes_parse() {
        let sk = SigningKey::generate(&mut OsRng);
        let vk_bytes = sk.verifying_key().to_bytes();
        let verifier = parse_public_key(&vk_bytes).unwrap();
        assert_eq!(verifier.algorithm(), SignatureAlgorithm::Ed25519);
    }

    #[test]
    fn ecdsa_p256_public_key_pem_tagged_public_key_parses_and_verifies() {
        use p256::pkcs8::EncodePublicKey;

        let sk = P256SigningKey::random(&mut OsRng);
        let vk = *sk.verifying_key();
        let der = vk.to_public_key_der().unwrap();
        let pem_block = pem::Pem::new("PUBLIC KEY", der.as_bytes().to_vec());
        let pem_str = pem::encode(&pem_block);

        let verifier = parse_public_key(pem_str.as_bytes()).unwrap();
        assert_eq!(verifier.algorithm(), SignatureAlgorithm::EcdsaP256Sha256);

        let key = SigningKeyMaterial::EcdsaP256(Box::new(sk));
        let sig = sign(b"message", &key).unwrap();
        assert!(verifier.verify(b"message", &sig).unwrap());
        assert!(!verifier.verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn legacy_md5_and_sha1_are_accepted_for_verification() {
        let data = b"legacy";
        let md5 = hash_bytes(data, HashAlgorithm::Md5);
        let sha1 = hash_bytes(data, HashAlgorithm::Sha1);
        assert!(verify(data, &md5.to_tagged_string()).unwrap());
        assert!(verify(data, &sha1.to_tagged_string()).unwrap());
    }
}
