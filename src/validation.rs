// ABOUTME: Validation for values that end up interpolated into remote shell commands

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

lazy_static! {
    static ref LINUX_USERNAME: Regex = Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").unwrap();
    static ref CLI_ARGUMENT: Regex = Regex::new(r"^[A-Za-z0-9._:-]+$").unwrap();
    static ref REPEATED_SLASHES: Regex = Regex::new(r"/{2,}").unwrap();
}

/// A value rejected before it reached a shell
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid Linux username: '{0}'")]
    Username(String),

    #[error("Working directory '{path}' is not under '{prefix}'")]
    OutsidePrefix { path: String, prefix: String },

    #[error("Working directory '{0}' must not contain '..'")]
    PathTraversal(String),

    #[error("Invalid {name}: '{value}'")]
    CliArgument { name: &'static str, value: String },
}

/// Check a Linux account name (lowercase, 1-32 chars, no leading digit or dash)
pub fn validate_linux_username(name: &str) -> Result<&str, ValidationError> {
    if LINUX_USERNAME.is_match(name) {
        Ok(name)
    } else {
        Err(ValidationError::Username(name.to_string()))
    }
}

/// Check that `path` stays under `prefix`; returns the path with slashes collapsed
pub fn validate_working_dir(path: &str, prefix: &str) -> Result<String, ValidationError> {
    let normalized = REPEATED_SLASHES.replace_all(path, "/").into_owned();

    if normalized.split('/').any(|component| component == "..") {
        return Err(ValidationError::PathTraversal(path.to_string()));
    }
    if !normalized.starts_with(prefix) {
        return Err(ValidationError::OutsidePrefix {
            path: path.to_string(),
            prefix: prefix.to_string(),
        });
    }
    Ok(normalized)
}

/// Check a single-token CLI argument such as a model name or session id
pub fn validate_cli_arg<'a>(name: &'static str, value: &'a str) -> Result<&'a str, ValidationError> {
    if CLI_ARGUMENT.is_match(value) {
        Ok(value)
    } else {
        Err(ValidationError::CliArgument {
            name,
            value: value.to_string(),
        })
    }
}
