use crate::error::{GatewayError, Result};
use secrecy::{ExposeSecret, SecretString};
use std::env;
use std::fs;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Resolve a secret-bearing configuration value.
///
/// Supports formats:
/// - "env://VAR" - Load from environment variable
/// - "file:///path/to/file" - Load from file, trimmed
/// - Any other value is used as-is
pub fn resolve(value: &str) -> Result<SecretString> {
    if let Some(var) = value.strip_prefix("env://") {
        debug!(var, "Resolving secret from environment");
        env::var(var)
            .map(SecretString::new)
            .map_err(|_| GatewayError::Config(format!("Environment variable '{}' not found", var)))
    } else if let Some(path) = value.strip_prefix("file://") {
        debug!(path, "Resolving secret from file");
        fs::read_to_string(path)
            .map(|s| SecretString::new(s.trim().to_string()))
            .map_err(|e| GatewayError::Config(format!("Failed to read secret file {}: {}", path, e)))
    } else {
        Ok(SecretString::new(value.to_string()))
    }
}

/// Resolve an optional secret-bearing configuration value
pub fn resolve_optional(value: Option<&str>) -> Result<Option<SecretString>> {
    value.map(resolve).transpose()
}

/// Compare a presented credential with a secret in constant time
pub fn matches(secret: &SecretString, presented: &str) -> bool {
    secret
        .expose_secret()
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}
