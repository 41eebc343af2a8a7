// ABOUTME: Per-tenant Linux account management on the remote host
//
// Every operation validates the account name, holds one pooled connection for
// its whole sequence of commands and returns it however the sequence ends.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::pool::{ConnectionPool, ExecOptions, ExecOutput, PoolError, PooledConnection};
use crate::validation::{validate_linux_username, ValidationError};

/// Errors from account provisioning
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Provisioning step '{step}' failed (exit code {exit_code:?}): {stderr}")]
    StepFailed {
        step: &'static str,
        exit_code: Option<u32>,
        stderr: String,
    },

    #[error("Workspace template directory does not exist: {0}")]
    MissingTemplate(String),
}

/// Where and how accounts are created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Create missing accounts before a chat turn
    pub auto_create: bool,

    /// Primary group for new accounts
    pub group: String,

    /// Login shell for new accounts
    pub shell: String,

    /// Parent of every home directory
    pub home_root: String,

    /// Directory under the home the CLI works in
    pub workspace_dir: String,

    /// Copied into every new workspace when set
    pub template_dir: Option<String>,

    /// Substituted for `{{USERNAME}}` in template files
    pub display_name: String,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            group: "ptygate".to_string(),
            shell: "/bin/bash".to_string(),
            home_root: "/home".to_string(),
            workspace_dir: "workspace".to_string(),
            template_dir: Some("/opt/ptygate/templates/user-workspace".to_string()),
            display_name: "user".to_string(),
        }
    }
}

fn quote(value: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(value)).into_owned()
}

/// Escape characters that are special in a sed replacement
fn sed_replacement(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '/' | '&' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Manages Linux accounts on the remote host
#[derive(Debug, Clone)]
pub struct AccountProvisioner {
    pool: ConnectionPool,
    config: ProvisionConfig,
}

impl AccountProvisioner {
    pub fn new(pool: ConnectionPool, config: ProvisionConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    /// Home directory of `user`
    pub fn home_dir(&self, user: &str) -> String {
        format!("{}/{}", self.config.home_root.trim_end_matches('/'), user)
    }

    /// Workspace directory of `user`
    pub fn workspace_dir(&self, user: &str) -> String {
        format!("{}/{}", self.home_dir(user), self.config.workspace_dir)
    }

    /// Whether the account exists
    pub async fn user_exists(&self, user: &str) -> Result<bool, ProvisionError> {
        let user = validate_linux_username(user)?;
        let conn = self.pool.acquire().await?;
        let output = self.exec(&conn, &format!("id {}", quote(user))).await?;
        Ok(output.success())
    }

    /// Create the account, its workspace and the workspace contents
    pub async fn create_user(&self, user: &str) -> Result<(), ProvisionError> {
        let user = validate_linux_username(user)?;
        let conn = self.pool.acquire().await?;
        info!(user, "Creating remote account");

        let result = self.create_user_on(&conn, user).await;
        match &result {
            Ok(()) => info!(user, "Remote account created"),
            Err(e) => warn!(user, error = %e, "Failed to create remote account"),
        }
        result
    }

    async fn create_user_on(&self, conn: &PooledConnection, user: &str) -> Result<(), ProvisionError> {
        let workspace = self.workspace_dir(user);

        self.step(
            conn,
            "useradd",
            &format!(
                "sudo useradd -m -g {} -s {} {}",
                quote(&self.config.group),
                quote(&self.config.shell),
                quote(user)
            ),
        )
        .await?;
        self.step(conn, "mkdir", &format!("sudo mkdir -p {}", quote(&workspace)))
            .await?;

        if let Some(template) = &self.config.template_dir {
            let check = self
                .exec(conn, &format!("sudo test -d {}", quote(template)))
                .await?;
            if !check.success() {
                return Err(ProvisionError::MissingTemplate(template.clone()));
            }

            self.step(
                conn,
                "copy template",
                &format!(
                    "sudo cp -r {} {}",
                    quote(&format!("{}/.", template.trim_end_matches('/'))),
                    quote(&format!("{workspace}/"))
                ),
            )
            .await?;

            let expression = format!(
                "s/{{{{USERNAME}}}}/{}/g",
                sed_replacement(&self.config.display_name)
            );
            let substitute = format!(
                "sudo find {} -type f \\( -name '*.md' -o -name '*.json' \\) -exec sed -i {} {{}} +",
                quote(&workspace),
                quote(&expression)
            );
            let output = self.exec(conn, &substitute).await?;
            if !output.success() {
                // Unsubstituted placeholders are cosmetic
                warn!(user, stderr = %output.stderr.trim(), "Template substitution partially failed");
            }
        }

        self.step(
            conn,
            "chown",
            &format!(
                "sudo chown -R {} {}",
                quote(&format!("{user}:{}", self.config.group)),
                quote(&self.home_dir(user))
            ),
        )
        .await?;
        Ok(())
    }

    /// Remove the account and its home directory
    pub async fn delete_user(&self, user: &str) -> Result<(), ProvisionError> {
        let user = validate_linux_username(user)?;
        let conn = self.pool.acquire().await?;
        self.step(&conn, "userdel", &format!("sudo userdel -r {}", quote(user)))
            .await?;
        info!(user, "Remote account deleted");
        Ok(())
    }

    /// Create the account if it does not exist; true when it was created
    pub async fn ensure_user(&self, user: &str) -> Result<bool, ProvisionError> {
        if self.user_exists(user).await? {
            return Ok(false);
        }
        info!(user, "Remote account missing, provisioning");
        self.create_user(user).await?;
        Ok(true)
    }

    async fn exec(&self, conn: &PooledConnection, command: &str) -> Result<ExecOutput, ProvisionError> {
        Ok(self.pool.exec(conn, command, ExecOptions::default()).await?)
    }

    async fn step(
        &self,
        conn: &PooledConnection,
        step: &'static str,
        command: &str,
    ) -> Result<ExecOutput, ProvisionError> {
        let output = self.exec(conn, command).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(ProvisionError::StepFailed {
                step,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sed_replacement_escaping() {
        assert_eq!(sed_replacement("a/b&c\\d"), "a\\/b\\&c\\\\d");
        assert_eq!(sed_replacement("plain"), "plain");
    }

    #[test]
    fn test_default_config() {
        let config = ProvisionConfig::default();
        assert!(config.auto_create);
        assert_eq!(config.home_root, "/home");
        assert_eq!(config.workspace_dir, "workspace");
    }
}
