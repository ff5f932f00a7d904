//! Configuration errors and environment expansion.

use thiserror::Error;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML configuration.
    #[error("failed to parse YAML config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("secret: plain"), "secret: plain");
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        let result = expand_env_vars("secret: ${NONEXISTENT_LOGBILL_SECRET_123:-fallback}");
        assert_eq!(result, "secret: fallback");
    }

    #[test]
    fn test_expand_env_vars_from_env() {
        // SAFETY: This test only touches a variable unique to it.
        unsafe {
            std::env::set_var("LOGBILL_TEST_EXPAND", "s3cr3t");
        }
        let result = expand_env_vars("secret: ${LOGBILL_TEST_EXPAND}");
        assert_eq!(result, "secret: s3cr3t");
        // SAFETY: Cleanup test variable.
        unsafe {
            std::env::remove_var("LOGBILL_TEST_EXPAND");
        }
    }
}
