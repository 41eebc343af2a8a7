// ABOUTME: Rendering of events and stats for the terminal in text or JSON form

use anyhow::{Context, Result};
use serde::Serialize;

use super::OutputFormat;
use ptygate::executor::ExecutionEvent;
use ptygate::gateway::GatewayStats;

/// One line of output for an event
pub fn render_event(event: &ExecutionEvent, format: OutputFormat) -> Result<String> {
    if format == OutputFormat::Json {
        return serde_json::to_string(event).context("Failed to serialize event");
    }

    Ok(match event {
        ExecutionEvent::Data { payload } => {
            let kind = event.event_type().unwrap_or("data");
            let mut line = format!("[{kind}] {payload}");
            if let Some(usage) = event.usage() {
                line.push_str(&format!(
                    " (tokens in {}, out {})",
                    usage.input_tokens, usage.output_tokens
                ));
            }
            line
        }
        ExecutionEvent::Error { message, .. } => format!("[error] {message}"),
    })
}

/// Print any serializable value, as pretty JSON or via the text renderer
pub fn print_value<T: Serialize>(
    value: &T,
    format: OutputFormat,
    text: impl FnOnce(&T) -> String,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
        }
        OutputFormat::Text => println!("{}", text(value)),
    }
    Ok(())
}

pub fn stats_text(stats: &GatewayStats) -> String {
    let pool = &stats.pool;
    let admission = &stats.admission;
    let mut lines = vec![
        format!(
            "Pool:      {}/{} connections ({} idle, {} in use, {} connecting), {} waiting{}",
            pool.total,
            pool.max_connections,
            pool.idle,
            pool.in_use,
            pool.connecting,
            pool.waiting,
            if pool.closed { ", closed" } else { "" }
        ),
        format!(
            "Counters:  {} acquired, {} timed out, {} created, {} connect failures, {} evicted, {} reaped",
            pool.metrics.acquires_total,
            pool.metrics.acquire_timeouts,
            pool.metrics.connections_created,
            pool.metrics.connect_failures,
            pool.metrics.connections_evicted,
            pool.metrics.connections_reaped
        ),
        format!(
            "Admission: {}/{} active, {} queued (per tenant limit {})",
            admission.global_active,
            admission.max_global,
            admission.global_queue_depth,
            admission.max_per_tenant
        ),
    ];
    for (tenant, tenant_stats) in &admission.tenants {
        lines.push(format!(
            "  {tenant}: {} active, {} queued",
            tenant_stats.active, tenant_stats.queued
        ));
    }
    lines.join("\n")
}
