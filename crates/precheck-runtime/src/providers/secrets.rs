//! Secure credential handling for provider API keys.
//!
//! Keys are wrapped so they cannot leak through `Debug` output or error
//! messages; the raw value is exposed only at the point of use.

use secrecy::{ExposeSecret, SecretString};

use super::ProviderError;

/// Where a credential came from; tracked for debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Env,
    Programmatic,
}

/// An API credential that redacts itself everywhere except `expose()`.
pub struct ApiCredential {
    secret: SecretString,
    source: CredentialSource,
    label: String,
}

impl std::fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiCredential")
            .field("label", &self.label)
            .field("source", &self.source)
            .field("value", &"[REDACTED]")
            .finish()
    }
}

impl ApiCredential {
    /// Wrap a key provided programmatically.
    pub fn new(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            secret: SecretString::from(key.into()),
            source: CredentialSource::Programmatic,
            label: label.into(),
        }
    }

    /// Read a key from an environment variable. The value is never logged.
    pub fn from_env(var: &str, label: impl Into<String>) -> Result<Self, ProviderError> {
        let key = std::env::var(var)
            .map_err(|_| ProviderError::NotConfigured(format!("{var} is not set")))?;
        Ok(Self {
            secret: SecretString::from(key),
            source: CredentialSource::Env,
            label: label.into(),
        })
    }

    /// Expose the raw key. Call only at the request-building site.
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.secret.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_output_is_redacted() {
        let credential = ApiCredential::new("sk-super-secret-12345", "test key");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("sk-super-secret-12345"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_expose_returns_raw_key() {
        let credential = ApiCredential::new("sk-abc", "test key");
        assert_eq!(credential.expose(), "sk-abc");
        assert!(!credential.is_empty());
        assert_eq!(credential.source(), CredentialSource::Programmatic);
    }

    #[test]
    fn test_missing_env_is_not_configured() {
        let result = ApiCredential::from_env("PRECHECK_NO_SUCH_VAR_XYZ", "missing");
        assert!(matches!(result, Err(ProviderError::NotConfigured(_))));
    }
}
