// ABOUTME: Builds the remote command line for one Claude CLI chat turn
//
// The CLI runs as the tenant's own Linux account via `sudo -n -u`, inside a
// `bash -c` so that `cd` and the environment apply to the same process.
// Every interpolated value is validated and then shell-quoted.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::admission::TenantId;
use crate::validation::{
    validate_cli_arg, validate_linux_username, validate_working_dir, ValidationError,
};

/// Errors building a command line
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Missing configuration value: {0}")]
    MissingConfig(&'static str),
}

/// How the Claude CLI is invoked on the remote host
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaudeCliConfig {
    /// CLI executable on the remote PATH
    pub binary: String,

    /// Model used when a request does not name one
    pub model: String,

    /// Value for ANTHROPIC_AUTH_TOKEN
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,

    /// Value for ANTHROPIC_BASE_URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Working directories must live under this prefix
    pub workdir_prefix: String,
}

impl fmt::Debug for ClaudeCliConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaudeCliConfig")
            .field("binary", &self.binary)
            .field("model", &self.model)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("workdir_prefix", &self.workdir_prefix)
            .finish()
    }
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: "claude-sonnet-4-6".to_string(),
            auth_token: None,
            base_url: None,
            workdir_prefix: "/home/".to_string(),
        }
    }
}

/// One chat turn for a tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Admission identity
    pub tenant: TenantId,
    /// Linux account the CLI runs as
    pub linux_user: String,
    /// Working directory on the remote host
    pub cwd: String,
    /// Prompt text
    pub message: String,
    /// Conversation to resume
    #[serde(default)]
    pub session_id: Option<String>,
    /// Model override
    #[serde(default)]
    pub model: Option<String>,
}

fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

fn non_empty<'a>(value: Option<&'a String>, key: &'static str) -> Result<&'a str, InvocationError> {
    value
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
        .ok_or(InvocationError::MissingConfig(key))
}

impl ClaudeCliConfig {
    /// Model a request will run with
    pub fn model_for<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.model)
    }

    /// Build the full remote command line for `request`
    pub fn build_command(&self, request: &ChatRequest) -> Result<String, InvocationError> {
        let user = validate_linux_username(&request.linux_user)?;
        let cwd = validate_working_dir(&request.cwd, &self.workdir_prefix)?;
        let model = validate_cli_arg("model", self.model_for(request))?;
        let session = request
            .session_id
            .as_deref()
            .map(|id| validate_cli_arg("session id", id))
            .transpose()?;
        let token = non_empty(self.auth_token.as_ref(), "claude.auth_token")?;
        let base_url = non_empty(self.base_url.as_ref(), "claude.base_url")?;

        let mut inner = vec![
            "cd".to_string(),
            quote(&cwd),
            "&&".to_string(),
            format!("ANTHROPIC_AUTH_TOKEN={}", quote(token)),
            format!("ANTHROPIC_BASE_URL={}", quote(base_url)),
            quote(&self.binary),
            "--print".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--dangerously-skip-permissions".to_string(),
            "--model".to_string(),
            quote(model),
        ];
        if let Some(session) = session {
            inner.push("--resume".to_string());
            inner.push(quote(session));
        }
        inner.push(quote(&request.message));

        Ok(format!(
            "sudo -n -u {} bash -c {}",
            quote(user),
            quote(&inner.join(" "))
        ))
    }
}
