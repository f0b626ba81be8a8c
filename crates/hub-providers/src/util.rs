//! Shared helpers for provider adapters.

use hub_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type. Timeouts are
/// retriable; everything else is treated as a fatal provider failure.
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::ProviderTransient(e.to_string())
    } else {
        Error::ProviderFatal(e.to_string())
    }
}

/// Read the API key for a provider from the environment variable its
/// config names. A provider with no `api_key_env` (a local/unauthenticated
/// backend) resolves to an empty key.
pub(crate) fn resolve_api_key(api_key_env: &Option<String>) -> Result<String> {
    match api_key_env {
        None => Ok(String::new()),
        Some(var) => std::env::var(var).map_err(|_| {
            Error::ProviderFatal(format!("environment variable '{var}' not set"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_env_var_is_a_fatal_error() {
        let err = resolve_api_key(&Some("HUB_TEST_NONEXISTENT_KEY_999".to_string())).unwrap_err();
        assert_eq!(err.kind(), hub_domain::error::ErrorKind::ProviderFatal);
    }

    #[test]
    fn no_env_var_configured_resolves_to_empty() {
        assert_eq!(resolve_api_key(&None).unwrap(), "");
    }

    #[test]
    fn reads_configured_env_var() {
        std::env::set_var("HUB_TEST_RESOLVE_KEY", "sk-test-123");
        assert_eq!(
            resolve_api_key(&Some("HUB_TEST_RESOLVE_KEY".to_string())).unwrap(),
            "sk-test-123"
        );
        std::env::remove_var("HUB_TEST_RESOLVE_KEY");
    }
}
