//! Gateway-side client authentication.
//!
//! This module handles:
//! - Password hashes from the `passwords` table (Argon2 or bcrypt)
//! - Users with an empty hash, who need no authentication at all
//! - The shared authorized_keys file for public key authentication
//! - Key fingerprints for logging

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use base64::Engine;
use russh::keys::PublicKey;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;

/// Credentials accepted by the gateway.
pub struct Credentials {
    passwords: BTreeMap<String, String>,
    authorized_keys: Vec<PublicKey>,
}

impl Credentials {
    pub fn new(passwords: BTreeMap<String, String>, authorized_keys: Vec<PublicKey>) -> Self {
        Self {
            passwords,
            authorized_keys,
        }
    }

    /// Build from the configuration, reading the authorized_keys file.
    pub fn load(config: &GatewayConfig) -> Result<Self> {
        let path = config.authorized_keys_path();
        let authorized_keys = load_authorized_keys(&path)?;
        info!(
            "Loaded {} authorized client key(s) from {}",
            authorized_keys.len(),
            path.display()
        );
        Ok(Self::new(config.passwords.clone(), authorized_keys))
    }

    /// Users with an empty password hash skip authentication.
    pub fn requires_auth(&self, username: &str) -> bool {
        self.passwords
            .get(username)
            .is_none_or(|hash| !hash.is_empty())
    }

    /// Check a password against the user's stored hash.
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        let Some(hash) = self.passwords.get(username) else {
            debug!("No password entry for '{}'", username);
            return false;
        };
        if hash.is_empty() {
            return true;
        }

        match HashScheme::of(hash) {
            HashScheme::Argon2 => match PasswordHash::new(hash) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok(),
                Err(e) => {
                    warn!("Invalid Argon2 hash for '{}': {}", username, e);
                    false
                }
            },
            HashScheme::Bcrypt => match bcrypt::verify(password, hash) {
                Ok(ok) => ok,
                Err(e) => {
                    warn!("Invalid bcrypt hash for '{}': {}", username, e);
                    false
                }
            },
            HashScheme::Unsupported => {
                warn!(
                    "Unsupported password hash for '{}', expected Argon2 or bcrypt",
                    username
                );
                false
            }
        }
    }

    /// Whether `key` appears in the authorized_keys file.
    pub fn is_authorized_key(&self, key: &PublicKey) -> bool {
        self.authorized_keys
            .iter()
            .any(|k| k.key_data() == key.key_data())
    }
}

/// Password hash formats accepted in the `passwords` table.
///
/// crypt(3) schemes such as `$1$`, `$5$` and `$6$` are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashScheme {
    Argon2,
    Bcrypt,
    Unsupported,
}

impl HashScheme {
    fn of(hash: &str) -> Self {
        if hash.starts_with("$argon2") {
            HashScheme::Argon2
        } else if ["$2a$", "$2b$", "$2x$", "$2y$"]
            .iter()
            .any(|p| hash.starts_with(p))
        {
            HashScheme::Bcrypt
        } else {
            HashScheme::Unsupported
        }
    }
}

/// Read an authorized_keys file. A missing file yields no keys.
pub fn load_authorized_keys(path: &Path) -> Result<Vec<PublicKey>> {
    if !path.exists() {
        warn!(
            "Authorized keys file {} not found, public key login disabled",
            path.display()
        );
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read authorized keys: {}", path.display()))?;
    Ok(parse_authorized_keys(&content))
}

/// Parse OpenSSH authorized_keys content.
///
/// Handles lines like:
/// - "ssh-ed25519 AAAA... comment"
/// - "no-pty,command=\"/bin/true\" ssh-rsa AAAA..."
///
/// Options are accepted but not enforced. Unparsable lines are skipped.
pub fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_key_line(line) {
            Some(key) => keys.push(key),
            None => warn!("Skipping invalid authorized key on line {}", lineno + 1),
        }
    }
    keys
}

fn parse_key_line(line: &str) -> Option<PublicKey> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let pos = parts.iter().position(|p| is_key_type(p))?;
    let data = parts.get(pos + 1)?;
    russh::keys::parse_public_key_base64(data).ok()
}

fn is_key_type(s: &str) -> bool {
    s.starts_with("ssh-") || s.starts_with("ecdsa-sha2-") || s.starts_with("sk-")
}

/// Compute fingerprint from raw key bytes (wire format).
/// Returns the "SHA256:..." form used by `ssh-keygen -l`.
pub fn fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Fingerprint of a russh public key.
pub fn fingerprint(key: &PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    fingerprint_from_bytes(&key.public_key_bytes())
}
