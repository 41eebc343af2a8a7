// ABOUTME: account command: check, create and delete remote Linux accounts

use std::io::{self, Write};

use anyhow::{Context, Result};

use super::output::print_value;
use super::{AccountCommand, OutputFormat};
use ptygate::provisioning::AccountProvisioner;

pub async fn execute(
    provisioner: &AccountProvisioner,
    command: AccountCommand,
    format: OutputFormat,
) -> Result<()> {
    match command {
        AccountCommand::Exists { user } => {
            let exists = provisioner.user_exists(&user).await?;
            let report = serde_json::json!({ "user": user, "exists": exists });
            print_value(&report, format, |_| {
                if exists {
                    format!("{user} exists")
                } else {
                    format!("{user} does not exist")
                }
            })
        }
        AccountCommand::Create { user } => {
            provisioner
                .create_user(&user)
                .await
                .with_context(|| format!("Failed to create account '{user}'"))?;
            let report = serde_json::json!({
                "user": user,
                "workspace": provisioner.workspace_dir(&user),
            });
            print_value(&report, format, |_| {
                format!("✅ Created {user} ({})", provisioner.workspace_dir(&user))
            })
        }
        AccountCommand::Delete { user, yes } => {
            if !yes && !confirm(&format!("Delete account '{user}' and its home directory?"))? {
                println!("Cancelled.");
                return Ok(());
            }
            provisioner
                .delete_user(&user)
                .await
                .with_context(|| format!("Failed to delete account '{user}'"))?;
            let report = serde_json::json!({ "user": user, "deleted": true });
            print_value(&report, format, |_| format!("🗑️  Deleted {user}"))
        }
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
}
