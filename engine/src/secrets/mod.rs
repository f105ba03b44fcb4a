//! Credential resolution and secret scrubbing
//!
//! Endpoint and tool backend credentials are named in config through
//! `api_key_env`. A name resolves from the process environment first and
//! falls back to the OS keychain (macOS Keychain, Windows Credential Manager,
//! Secret Service on Linux) under the configured service name.
//!
//! [`scrub`] removes token-shaped substrings from any text that is about to
//! be logged or recorded in a task's error.

pub mod cache;
pub mod string;

pub use cache::SecretCache;
pub use string::SecretString;

use keyring::Entry;
use regex::Regex;
use sdk::errors::EngineError;
use std::io::{self, Write};
use std::sync::OnceLock;

/// Resolves and stores credentials in the environment and OS keychain
pub struct SecretManager {
    service_name: String,
}

/// Regex patterns for detecting common secret formats.
/// Compiled once and reused.
static SECRET_PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();

/// Patterns match:
/// - OpenAI-style API keys: sk-...
/// - Hugging Face tokens: hf_...
/// - Google API keys: AIza...
/// - GitHub tokens: ghp_...
/// - Bearer tokens: Bearer ...
/// - `api_key=...` / `token=...` query and form parameters
fn get_secret_patterns() -> &'static Vec<Regex> {
    SECRET_PATTERNS.get_or_init(|| {
        [
            r"sk-[a-zA-Z0-9\-_]{20,}",
            r"hf_[a-zA-Z0-9]{30,}",
            r"AIza[0-9A-Za-z\-_]{35}",
            r"ghp_[a-zA-Z0-9]{36}",
            r"Bearer\s+[^\s]{20,}",
            r"(?i)\b(api_key|apikey|token)=[^\s&]{8,}",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Scrub secrets from text by replacing them with `[REDACTED]`.
///
/// # Examples
/// ```
/// use orca_engine::secrets::scrub;
///
/// let scrubbed = scrub("upstream said: invalid key sk-1234567890abcdefghij");
/// assert_eq!(scrubbed, "upstream said: invalid key [REDACTED]");
/// ```
pub fn scrub(text: &str) -> String {
    let mut result = text.to_string();

    for pattern in get_secret_patterns() {
        result = pattern.replace_all(&result, "[REDACTED]").to_string();
    }

    result
}

impl SecretManager {
    /// Creates a new SecretManager with the given keychain service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Resolve a named credential.
    ///
    /// Checks the environment variable `name`, then the keychain entry
    /// `name`. Returns `Ok(None)` when neither is set; endpoints without a
    /// credential are called unauthenticated.
    ///
    /// # Errors
    /// Returns `EngineError::Config` if keychain access itself fails
    pub fn resolve(&self, name: &str) -> Result<Option<SecretString>, EngineError> {
        if let Ok(value) = std::env::var(name) {
            if !value.trim().is_empty() {
                tracing::debug!(secret = name, "Resolved secret from environment");
                return Ok(Some(SecretString::new(value.trim())));
            }
        }

        let entry = self.entry(name)?;
        match entry.get_password() {
            Ok(secret) => {
                tracing::debug!(secret = name, "Resolved secret from keychain");
                Ok(Some(SecretString::new(secret)))
            }
            Err(keyring::Error::NoEntry) => Ok(None),
            // No keychain backend on this host (headless CI, containers)
            Err(keyring::Error::PlatformFailure(e)) | Err(keyring::Error::NoStorageAccess(e)) => {
                tracing::warn!(secret = name, "Keychain unavailable: {}", e);
                Ok(None)
            }
            Err(e) => Err(EngineError::Config(format!(
                "Failed to retrieve secret '{}': {}",
                name, e
            ))),
        }
    }

    /// Stores a secret in the OS keychain.
    pub fn set_secret(&self, name: &str, value: &str) -> Result<(), EngineError> {
        if value.is_empty() {
            return Err(EngineError::Validation("Secret cannot be empty".to_string()));
        }

        self.entry(name)?.set_password(value).map_err(|e| {
            EngineError::Config(format!("Failed to store secret '{}': {}", name, e))
        })?;

        tracing::info!("Stored secret '{}' in keychain", name);
        Ok(())
    }

    /// Deletes a secret from the OS keychain.
    pub fn delete_secret(&self, name: &str) -> Result<(), EngineError> {
        self.entry(name)?.delete_password().map_err(|e| {
            EngineError::Config(format!("Failed to delete secret '{}': {}", name, e))
        })?;

        tracing::info!("Deleted secret '{}' from keychain", name);
        Ok(())
    }

    /// Whether `name` resolves from the environment or keychain, without
    /// surfacing errors.
    pub fn has_secret(&self, name: &str) -> bool {
        matches!(self.resolve(name), Ok(Some(_)))
    }

    /// Prompts for a secret value on stderr and reads one line from stdin.
    pub fn prompt_for_secret(&self, name: &str) -> Result<String, EngineError> {
        eprint!("Enter value for '{}': ", name);
        io::stderr().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        let secret = input.trim().to_string();
        if secret.is_empty() {
            return Err(EngineError::Validation("Secret cannot be empty".to_string()));
        }

        Ok(secret)
    }

    fn entry(&self, name: &str) -> Result<Entry, EngineError> {
        Entry::new(&self.service_name, name)
            .map_err(|e| EngineError::Config(format!("Failed to create keyring entry: {}", e)))
    }
}
