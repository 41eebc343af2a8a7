// ABOUTME: exec and check commands: one-shot pooled commands without admission

use std::time::Duration;

use anyhow::{anyhow, Result};

use super::output::print_value;
use super::{ExecArgs, OutputFormat};
use ptygate::pool::{ConnectionPool, ExecOptions};

pub async fn exec(pool: &ConnectionPool, args: ExecArgs, format: OutputFormat) -> Result<()> {
    let conn = pool.acquire().await?;
    let options = ExecOptions {
        timeout: args.timeout.map(Duration::from_secs),
        cwd: args.cwd,
    };
    let output = pool.exec(&conn, &args.command, options).await?;
    drop(conn);

    print_value(&output, format, |output| {
        let mut text = output.stdout.clone();
        if !output.stderr.is_empty() {
            eprint!("{}", output.stderr);
        }
        if text.ends_with('\n') {
            text.pop();
        }
        text
    })?;

    match output.exit_code {
        Some(0) => Ok(()),
        Some(code) => Err(anyhow!("Command exited with code {code}")),
        None => Err(anyhow!("Command ended without an exit status")),
    }
}

pub async fn check(pool: &ConnectionPool, format: OutputFormat) -> Result<()> {
    let ok = pool.test_connection().await;
    let report = serde_json::json!({
        "endpoint": pool.endpoint(),
        "ok": ok,
    });
    print_value(&report, format, |_| {
        if ok {
            format!("✅ Connected to {}", pool.endpoint())
        } else {
            format!("❌ Could not run a command on {} (see logs)", pool.endpoint())
        }
    })?;

    if ok {
        Ok(())
    } else {
        Err(anyhow!("Connection check failed"))
    }
}
