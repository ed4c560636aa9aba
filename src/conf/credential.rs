//! Credential storage and verification
//!
//! A credential value is stored either plain, as `sha256:<base64(SHA-256)>`,
//! or as `argon2:<PHC string>` (argon2i and argon2id only). Every comparison
//! is constant-time.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

const SHA256_PREFIX: &str = "sha256:";
const ARGON2_PREFIX: &str = "argon2:";

/// Characters allowed in plain credential values
fn is_valid_plain_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!$()*+.;<=>[]^_-{}@#&~%,".contains(c)
}

/// A configured user or password
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    /// Create a credential from its configured representation
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw configured value
    pub fn value(&self) -> &str {
        &self.0
    }

    /// Whether no credential is configured
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the value is a `sha256:` hash
    pub fn is_sha256(&self) -> bool {
        self.0.starts_with(SHA256_PREFIX)
    }

    /// Whether the value is an `argon2:` PHC string
    pub fn is_argon2(&self) -> bool {
        self.0.starts_with(ARGON2_PREFIX)
    }

    /// Whether the value is stored hashed
    pub fn is_hashed(&self) -> bool {
        self.is_sha256() || self.is_argon2()
    }

    /// Verify `input` against the stored value in constant time.
    ///
    /// An empty credential matches anything: the check is only meaningful
    /// when the configuration actually requires a value.
    pub fn check(&self, input: &str) -> bool {
        if self.is_empty() {
            return true;
        }

        if self.is_sha256() {
            let stored = &self.0[SHA256_PREFIX.len()..];
            let Ok(stored_hash) = base64::engine::general_purpose::STANDARD.decode(stored) else {
                return false;
            };
            let input_hash = Sha256::digest(input.as_bytes());
            return input_hash.as_slice().ct_eq(&stored_hash).into();
        }

        if self.is_argon2() {
            let phc = &self.0[ARGON2_PREFIX.len()..];
            let Ok(parsed) = PasswordHash::new(phc) else {
                return false;
            };
            return Argon2::default()
                .verify_password(input.as_bytes(), &parsed)
                .is_ok();
        }

        self.0.as_bytes().ct_eq(input.as_bytes()).into()
    }

    /// Validate the configured representation; fatal at startup on failure
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        if self.is_sha256() {
            let stored = &self.0[SHA256_PREFIX.len()..];
            base64::engine::general_purpose::STANDARD
                .decode(stored)
                .map_err(|_| Error::Conf("invalid sha256 credential: bad base64".into()))?;
            return Ok(());
        }

        if self.is_argon2() {
            let phc = &self.0[ARGON2_PREFIX.len()..];
            let parsed = PasswordHash::new(phc)
                .map_err(|e| Error::Conf(format!("invalid argon2 credential: {e}")))?;
            match parsed.algorithm.as_str() {
                "argon2i" | "argon2id" => return Ok(()),
                other => {
                    return Err(Error::Conf(format!(
                        "unsupported argon2 variant: {other}"
                    )))
                }
            }
        }

        if !self.0.chars().all(is_valid_plain_char) {
            return Err(Error::Conf(format!(
                "credential contains unsupported characters: {}",
                self.0
            )));
        }

        Ok(())
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Credential {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}
