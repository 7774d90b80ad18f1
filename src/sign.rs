//! Ed25519 key loading and the local signer used by existing organizations to
//! counter-sign configuration updates.

use crate::quorum::{SignerFailure, UpdateSignature, UpdateSigner};
use crate::delta::UnsignedUpdate;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use rand_core::OsRng;
use sha2::{Digest, Sha512};
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Describes how an ed25519 key should be obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ed25519KeySource {
    /// Deterministic key derived from an `ed25519://` seed string.
    Seed(String),
    /// Load the secret key material from the provided file path.
    File(PathBuf),
    /// Use a freshly generated random key.
    Random,
}

impl Ed25519KeySource {
    /// Parses a key spec (`ed25519://seed`, a path, or empty for random).
    pub fn from_spec(spec: Option<&str>) -> Self {
        match spec {
            Some(value) if value.starts_with("ed25519://") => {
                Self::Seed(value.trim_start_matches("ed25519://").to_string())
            }
            Some(value) if !value.is_empty() => Self::File(PathBuf::from(value)),
            _ => Self::Random,
        }
    }
}

/// Signing key plus its verifying half.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    /// Signing key.
    pub signing: SigningKey,
    /// Verifying key associated with `signing`.
    pub verifying: VerifyingKey,
}

/// Errors reported while loading or decoding key material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    /// Underlying filesystem I/O failure.
    #[error("key I/O error: {0}")]
    Io(String),
    /// Base64, hex, or ed25519 parsing failure.
    #[error("key decode error: {0}")]
    Decode(String),
    /// Buffer did not match the expected secret-key length.
    #[error("unexpected key length: {0}")]
    InvalidLength(usize),
}

/// Loads or derives key material according to the source specification.
pub fn load_or_derive_keypair(source: &Ed25519KeySource) -> Result<KeyMaterial, KeyError> {
    let secret = match source {
        Ed25519KeySource::Seed(seed) => derive_key_from_seed(seed),
        Ed25519KeySource::File(path) => load_key_from_file(path)?,
        Ed25519KeySource::Random => SigningKey::generate(&mut OsRng).to_bytes(),
    };
    let signing = SigningKey::from_bytes(&secret);
    let verifying = signing.verifying_key();
    Ok(KeyMaterial { signing, verifying })
}

/// Encodes a public key as base64.
pub fn encode_public_key_base64(verifying: &VerifyingKey) -> String {
    BASE64.encode(verifying.to_bytes())
}

/// Decodes a base64 public key.
pub fn decode_public_key_base64(input: &str) -> Result<VerifyingKey, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    VerifyingKey::try_from(bytes.as_slice()).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Decodes a base64 signature.
pub fn decode_signature_base64(input: &str) -> Result<Signature, KeyError> {
    let bytes = BASE64
        .decode(input)
        .map_err(|err| KeyError::Decode(err.to_string()))?;
    Signature::from_slice(&bytes).map_err(|err| KeyError::Decode(err.to_string()))
}

/// Signs a payload and returns the base64 signature.
pub fn sign_payload_base64(signing: &SigningKey, payload: &[u8]) -> String {
    BASE64.encode(signing.sign(payload).to_bytes())
}

/// Checks a base64 signature against `payload` under a base64 public key.
pub fn verify_signature_base64(
    public_key_b64: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), KeyError> {
    let verifying = decode_public_key_base64(public_key_b64)?;
    let signature = decode_signature_base64(signature_b64)?;
    verifying
        .verify(payload, &signature)
        .map_err(|err| KeyError::Decode(err.to_string()))
}

fn derive_key_from_seed(seed: &str) -> [u8; SECRET_KEY_LENGTH] {
    let digest = Sha512::digest(seed.as_bytes());
    let mut secret = [0u8; SECRET_KEY_LENGTH];
    secret.copy_from_slice(&digest[..SECRET_KEY_LENGTH]);
    secret
}

fn load_key_from_file(path: &Path) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    let contents = fs::read(path).map_err(|err| KeyError::Io(err.to_string()))?;
    if contents.len() == SECRET_KEY_LENGTH {
        return bytes_to_secret(&contents);
    }
    if let Ok(text) = std::str::from_utf8(&contents) {
        let trimmed = text.trim();
        if trimmed.len() == SECRET_KEY_LENGTH * 2 {
            if let Ok(decoded) = hex::decode(trimmed) {
                return bytes_to_secret(&decoded);
            }
        }
        if let Ok(decoded) = BASE64.decode(trimmed) {
            return bytes_to_secret(&decoded);
        }
    }
    bytes_to_secret(&contents)
}

fn bytes_to_secret(bytes: &[u8]) -> Result<[u8; SECRET_KEY_LENGTH], KeyError> {
    bytes
        .try_into()
        .map_err(|_| KeyError::InvalidLength(bytes.len()))
}

/// Counter-signs updates with an administrator key held on this host.
#[derive(Debug, Clone)]
pub struct LocalKeySigner {
    signer_id: String,
    msp_id: String,
    keys: KeyMaterial,
}

impl LocalKeySigner {
    /// Signer `signer_id` of organization `msp_id`.
    pub fn new(signer_id: impl Into<String>, msp_id: impl Into<String>, keys: KeyMaterial) -> Self {
        Self {
            signer_id: signer_id.into(),
            msp_id: msp_id.into(),
            keys,
        }
    }

    /// Base64 public key of the signer.
    pub fn public_key(&self) -> String {
        encode_public_key_base64(&self.keys.verifying)
    }
}

#[async_trait]
impl UpdateSigner for LocalKeySigner {
    fn signer_id(&self) -> &str {
        &self.signer_id
    }

    async fn sign(&self, update: &UnsignedUpdate) -> Result<UpdateSignature, SignerFailure> {
        Ok(UpdateSignature {
            signer: self.signer_id.clone(),
            msp_id: self.msp_id.clone(),
            public_key: self.public_key(),
            signature: sign_payload_base64(&self.keys.signing, &update.signing_payload()),
        })
    }
}
