//! Environment variable substitution for configuration files
//!
//! Variables are referenced as `${VAR_NAME}`, or `${VAR_NAME:-fallback}` to
//! supply a value for when the variable is unset.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::env;

use crate::config::ConfigError;

/// Matches `${VAR_NAME}` and `${VAR_NAME:-default}`
static ENV_VAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap()
});

/// Expand `${...}` references from the process environment.
///
/// Fails with every unset variable that has no fallback.
///
/// ```ignore
/// use s3_volume_driver::env::substitute_env_vars;
///
/// std::env::set_var("VOLUME_ROOT", "/srv/volumes");
/// let result = substitute_env_vars("root: ${VOLUME_ROOT}").unwrap();
/// assert_eq!(result, "root: /srv/volumes");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    substitute_with(input, |name| env::var(name).ok())
}

/// Substitute using an arbitrary variable lookup
pub fn substitute_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing_vars: Vec<String> = Vec::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        match (lookup(var_name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                if !missing_vars.iter().any(|v| v == var_name) {
                    missing_vars.push(var_name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing_vars.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing_vars.join(", ")
        )));
    }

    Ok(result.into_owned())
}
