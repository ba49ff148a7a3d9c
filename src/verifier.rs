use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::config::SecurityConfig;
use crate::error::UpdateError;

/// Release signing key compiled into the daemon (hex or base64), supplied at
/// build time through `AUTOUPDATED_RELEASE_PUBLIC_KEY`.
const EMBEDDED_PUBLIC_KEY: Option<&str> = option_env!("AUTOUPDATED_RELEASE_PUBLIC_KEY");

pub fn embedded_public_key() -> Option<VerifyingKey> {
    EMBEDDED_PUBLIC_KEY.and_then(|raw| parse_ed25519_public_key(raw).ok())
}

/// Digest and detached-signature checks. Both are fail-closed: when a check
/// is enabled, a missing proof file is a failure.
#[derive(Debug, Clone)]
pub struct Verifier {
    require_digest: bool,
    require_signature: bool,
    public_key: Option<VerifyingKey>,
}

impl Verifier {
    pub fn new(require_digest: bool, require_signature: bool) -> Self {
        Self {
            require_digest,
            require_signature,
            public_key: embedded_public_key(),
        }
    }

    /// The configured key file wins over the embedded key.
    pub fn from_config(security: &SecurityConfig) -> Result<Self> {
        let mut verifier = Self::new(security.require_hash, security.require_signature);
        if let Some(path) = security.public_key_file.as_deref() {
            verifier.public_key = Some(load_public_key_file(path)?);
        }
        Ok(verifier)
    }

    pub fn with_public_key(mut self, key: VerifyingKey) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn requires_digest(&self) -> bool {
        self.require_digest
    }

    pub fn requires_signature(&self) -> bool {
        self.require_signature
    }

    /// Runs every enabled check against an already-staged artifact.
    pub fn verify(
        &self,
        artifact: &Path,
        digest_file: Option<&Path>,
        signature_file: Option<&Path>,
    ) -> std::result::Result<(), UpdateError> {
        if self.require_digest {
            let digest_file = digest_file.ok_or_else(|| UpdateError::Integrity {
                artifact: artifact.to_path_buf(),
                reason: "digest file is required but none was provided".to_string(),
            })?;
            verify_digest_file(artifact, digest_file)?;
            info!(artifact = %artifact.display(), "artifact digest verified");
        }
        if self.require_signature {
            let signature_file = signature_file.ok_or_else(|| UpdateError::Trust {
                artifact: artifact.to_path_buf(),
                reason: "signature file is required but none was provided".to_string(),
            })?;
            let key = self.public_key.as_ref().ok_or_else(|| UpdateError::Trust {
                artifact: artifact.to_path_buf(),
                reason: "no trusted public key is available".to_string(),
            })?;
            verify_signature_file(artifact, signature_file, key)?;
            info!(artifact = %artifact.display(), "artifact signature verified");
        }
        Ok(())
    }
}

pub fn compute_sha256_hex(path: &Path) -> Result<String> {
    let mut file =
        fs::File::open(path).with_context(|| format!("failed opening file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("failed reading file {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// First whitespace-delimited token of a digest file, BOM stripped,
/// lowercased. Accepts `sha256sum` output as well as a bare hash.
pub fn parse_digest_file_contents(raw: &str) -> Option<String> {
    raw.trim_start_matches('\u{feff}')
        .split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
}

pub fn verify_digest_file(
    artifact: &Path,
    digest_file: &Path,
) -> std::result::Result<(), UpdateError> {
    let integrity = |reason: String| UpdateError::Integrity {
        artifact: artifact.to_path_buf(),
        reason,
    };
    if !digest_file.is_file() {
        return Err(integrity(format!(
            "digest file does not exist: {}",
            digest_file.display()
        )));
    }
    let raw = fs::read_to_string(digest_file).map_err(|err| {
        integrity(format!(
            "failed reading digest file {}: {}",
            digest_file.display(),
            err
        ))
    })?;
    let expected = parse_digest_file_contents(&raw)
        .ok_or_else(|| integrity(format!("digest file {} is empty", digest_file.display())))?;
    let actual = compute_sha256_hex(artifact).map_err(|err| integrity(format!("{:#}", err)))?;
    if !expected.eq_ignore_ascii_case(&actual) {
        return Err(integrity(format!(
            "sha256 mismatch (expected {}, got {})",
            expected, actual
        )));
    }
    Ok(())
}

pub fn verify_signature_file(
    artifact: &Path,
    signature_file: &Path,
    key: &VerifyingKey,
) -> std::result::Result<(), UpdateError> {
    let trust = |reason: String| UpdateError::Trust {
        artifact: artifact.to_path_buf(),
        reason,
    };
    if !signature_file.is_file() {
        return Err(trust(format!(
            "signature file does not exist: {}",
            signature_file.display()
        )));
    }
    let signature_raw = fs::read(signature_file).map_err(|err| {
        trust(format!(
            "failed reading signature {}: {}",
            signature_file.display(),
            err
        ))
    })?;
    let signature = parse_ed25519_signature(&signature_raw).map_err(|err| trust(err.to_string()))?;
    let message = fs::read(artifact)
        .map_err(|err| trust(format!("failed reading artifact: {}", err)))?;
    key.verify(&message, &signature)
        .map_err(|_| trust("ed25519 signature verification failed".to_string()))
}

pub fn load_public_key_file(path: &Path) -> Result<VerifyingKey> {
    let raw = fs::read(path)
        .with_context(|| format!("failed reading public key file {}", path.display()))?;
    if raw.len() == 32 {
        let key_bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("Ed25519 public key must be 32 bytes"))?;
        return VerifyingKey::from_bytes(&key_bytes)
            .map_err(|_| anyhow!("invalid Ed25519 public key bytes in {}", path.display()));
    }
    let text = std::str::from_utf8(&raw)
        .with_context(|| format!("public key file {} is neither raw nor text", path.display()))?;
    parse_ed25519_public_key(text)
        .with_context(|| format!("failed parsing public key file {}", path.display()))
}

pub fn parse_ed25519_public_key(raw: &str) -> Result<VerifyingKey> {
    let bytes = decode_hex_or_base64(raw)?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("Ed25519 public key must decode to 32 bytes"))?;
    VerifyingKey::from_bytes(&key_bytes).map_err(|_| anyhow!("invalid Ed25519 public key bytes"))
}

fn parse_ed25519_signature(raw: &[u8]) -> Result<Signature> {
    if raw.len() == 64 {
        let signature_bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| anyhow!("invalid Ed25519 signature bytes"))?;
        return Ok(Signature::from_bytes(&signature_bytes));
    }

    let text = std::str::from_utf8(raw)
        .context("signature must be UTF-8 text or a 64-byte raw signature")?
        .trim();
    if text.is_empty() {
        return Err(anyhow!("signature file is empty"));
    }

    let decoded = decode_hex_or_base64(text)?;
    let signature_bytes: [u8; 64] = decoded
        .try_into()
        .map_err(|_| anyhow!("Ed25519 signature must decode to 64 bytes"))?;
    Ok(Signature::from_bytes(&signature_bytes))
}

fn decode_hex_or_base64(raw: &str) -> Result<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("value is empty"));
    }
    if trimmed.len() % 2 == 0 && trimmed.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return decode_hex_string(trimmed);
    }

    general_purpose::STANDARD
        .decode(trimmed)
        .or_else(|_| general_purpose::STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE.decode(trimmed))
        .or_else(|_| general_purpose::URL_SAFE_NO_PAD.decode(trimmed))
        .map_err(|_| anyhow!("value must be base64 or hex encoded"))
}

fn decode_hex_string(hex: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let byte = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| anyhow!("value must contain valid hexadecimal characters"))?;
        out.push(byte);
    }
    Ok(out)
}

/// Conventional proof-file names next to an artifact.
pub fn sibling_proof_paths(artifact: &Path) -> (PathBuf, PathBuf) {
    let mut digest = artifact.as_os_str().to_os_string();
    digest.push(".sha256");
    let mut signature = artifact.as_os_str().to_os_string();
    signature.push(".sig");
    (PathBuf::from(digest), PathBuf::from(signature))
}
