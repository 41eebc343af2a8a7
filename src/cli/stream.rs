// ABOUTME: run and chat commands: admit, stream events to stdout, release on exit or Ctrl-C

use anyhow::{anyhow, Result};
use tracing::info;

use super::output::render_event;
use super::{ChatArgs, OutputFormat, RunArgs};
use ptygate::admission::TenantId;
use ptygate::gateway::{ExecutionGateway, ExecutionStream, GatewayError};
use ptygate::invocation::ChatRequest;

/// Stream `args.command` (words joined with spaces) for a tenant
pub async fn run(gateway: &ExecutionGateway, args: RunArgs, format: OutputFormat) -> Result<()> {
    let tenant = TenantId::new(args.tenant);
    let command = args.command.join(" ");
    let stream = gateway.run(&tenant, &command).await.map_err(describe)?;
    drain(stream, format).await
}

/// Run one chat turn and stream its records
pub async fn chat(gateway: &ExecutionGateway, args: ChatArgs, format: OutputFormat) -> Result<()> {
    let request = ChatRequest {
        tenant: TenantId::new(args.tenant),
        linux_user: args.user,
        cwd: args.cwd,
        message: args.message,
        session_id: args.session,
        model: args.model,
    };
    let stream = gateway.chat(&request).await.map_err(describe)?;
    drain(stream, format).await
}

fn describe(e: GatewayError) -> anyhow::Error {
    if e.is_busy() {
        anyhow!("Service busy, try again later ({e})")
    } else {
        anyhow::Error::new(e)
    }
}

async fn drain(mut stream: ExecutionStream, format: OutputFormat) -> Result<()> {
    let tenant = stream.tenant().clone();
    let mut failure = None;

    loop {
        tokio::select! {
            event = stream.next_event() => {
                let Some(event) = event else { break };
                println!("{}", render_event(&event, format)?);
                if let ptygate::ExecutionEvent::Error { message, .. } = event {
                    failure = Some(message);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!(%tenant, "Interrupted, cancelling execution");
                // Dropping the stream terminates the process and releases both slots
                drop(stream);
                return Err(anyhow!("Interrupted"));
            }
        }
    }

    match failure {
        Some(message) => Err(anyhow!(message)),
        None => Ok(()),
    }
}
