// ABOUTME: Integration tests for ExecutionGateway: admission, provisioning and release
//
// Every execution is admitted, gets a connection and streams; whichever way it
// ends, both the admission slot and the connection must come back.

mod helpers;

use std::time::Duration;

use helpers::{out, settle, test_pool_config, ScriptedConnector, Step};
use pretty_assertions::assert_eq;
use ptygate::admission::{AdmissionConfig, AdmissionController, TenantId};
use ptygate::executor::RemoteStreamExecutor;
use ptygate::gateway::{ExecutionGateway, GatewayError};
use ptygate::invocation::{ChatRequest, ClaudeCliConfig, InvocationError};
use ptygate::pool::{PoolConfig, PoolError};
use ptygate::provisioning::{AccountProvisioner, ProvisionConfig};

fn claude_config() -> ClaudeCliConfig {
    ClaudeCliConfig {
        auth_token: Some("sk-test".to_string()),
        base_url: Some("https://relay.example.com".to_string()),
        ..ClaudeCliConfig::default()
    }
}

fn gateway(connector: &ScriptedConnector, pool: PoolConfig, admission: AdmissionConfig) -> ExecutionGateway {
    ExecutionGateway::new(
        AdmissionController::new(admission).unwrap(),
        connector.pool(pool),
        RemoteStreamExecutor::default(),
        claude_config(),
    )
}

fn limits(max_global: usize, max_per_tenant: usize) -> AdmissionConfig {
    AdmissionConfig {
        max_global,
        max_per_tenant,
        probe_wait: Duration::from_millis(20),
    }
}

fn chat_request(user: &str) -> ChatRequest {
    ChatRequest {
        tenant: TenantId::new("tenant-1"),
        linux_user: user.to_string(),
        cwd: format!("/home/{user}/workspace"),
        message: "list the files".to_string(),
        session_id: None,
        model: None,
    }
}

// =============================================================================
// run
// =============================================================================

#[tokio::test]
async fn test_completed_run_releases_admission_and_connection() {
    let connector = ScriptedConnector::new();
    connector.on("agent", vec![out("{\"type\":\"result\"}\n"), Step::Exit(0)]);
    let gateway = gateway(&connector, test_pool_config(2), limits(4, 1));
    let tenant = TenantId::new("acme");

    let stream = gateway.run(&tenant, "agent").await.unwrap();
    assert_eq!(stream.tenant(), &tenant);
    let events = stream.collect_events().await;

    assert_eq!(events.len(), 1);
    let stats = gateway.stats();
    assert_eq!(stats.admission.global_active, 0);
    assert!(stats.admission.tenants.is_empty());
    assert_eq!(stats.pool.in_use, 0);
    assert_eq!(stats.pool.idle, 1);
}

#[tokio::test]
async fn test_second_run_for_same_tenant_is_busy() {
    let connector = ScriptedConnector::new();
    connector.on("agent", vec![Step::Hang]);
    let gateway = gateway(&connector, test_pool_config(4), limits(4, 1));
    let acme = TenantId::new("acme");

    let running = gateway.run(&acme, "agent").await.unwrap();

    // Act: same tenant again, then a different tenant
    let err = gateway.run(&acme, "agent").await.unwrap_err();
    assert!(matches!(err, GatewayError::Busy(_)));
    assert!(err.is_busy());
    let other = gateway.run(&TenantId::new("globex"), "agent").await.unwrap();

    assert_eq!(gateway.stats().admission.global_active, 2);

    // Dropping a stream gives its tenant's slot back
    drop(running);
    settle().await;
    let again = gateway.run(&acme, "agent").await;
    assert!(again.is_ok());

    drop(other);
    drop(again);
    settle().await;
    let stats = gateway.stats();
    assert_eq!(stats.admission.global_active, 0);
    assert_eq!(stats.pool.in_use, 0);
    assert_eq!(connector.terminates(), 3);
}

#[tokio::test]
async fn test_exhausted_pool_reports_busy_and_returns_admission() {
    let connector = ScriptedConnector::new();
    connector.on("agent", vec![Step::Hang]);
    let mut pool = test_pool_config(1);
    pool.acquire_timeout = Duration::from_millis(30);
    let gateway = gateway(&connector, pool, limits(4, 1));

    let _running = gateway.run(&TenantId::new("acme"), "agent").await.unwrap();
    let err = gateway.run(&TenantId::new("globex"), "agent").await.unwrap_err();

    assert!(matches!(err, GatewayError::Pool(PoolError::AcquireTimeout { .. })));
    assert!(err.is_busy());
    let stats = gateway.stats();
    assert_eq!(stats.admission.global_active, 1);
    assert!(!stats.admission.tenants.contains_key(&TenantId::new("globex")));
}

#[tokio::test]
async fn test_shutdown_fails_new_runs_without_leaking_admission() {
    let connector = ScriptedConnector::new();
    let gateway = gateway(&connector, test_pool_config(1), limits(4, 1));
    gateway.shutdown().await;

    let err = gateway.run(&TenantId::new("acme"), "agent").await.unwrap_err();
    assert!(matches!(err, GatewayError::Pool(PoolError::Closed)));
    assert!(!err.is_busy());
    assert_eq!(gateway.stats().admission.global_active, 0);
}

// =============================================================================
// chat
// =============================================================================

#[tokio::test]
async fn test_chat_runs_claude_as_the_tenant_user() {
    let connector = ScriptedConnector::new();
    connector.on(
        "stream-json",
        vec![
            out("{\"type\":\"system\",\"session_id\":\"abc\"}\n"),
            out("{\"type\":\"result\"}\n"),
            Step::Exit(0),
        ],
    );
    let gateway = gateway(&connector, test_pool_config(1), limits(4, 1));

    let events = gateway
        .chat(&chat_request("alice"))
        .await
        .unwrap()
        .collect_events()
        .await;

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].session_id(), Some("abc"));

    let commands = connector.commands();
    assert_eq!(commands.len(), 1);
    assert!(commands[0].starts_with("sudo -n -u alice bash -c "));
    assert!(commands[0].contains("--model claude-sonnet-4-6"));
    assert!(commands[0].contains("list the files"));
}

#[tokio::test]
async fn test_chat_rejects_bad_input_before_admission() {
    let connector = ScriptedConnector::new();
    let gateway = gateway(&connector, test_pool_config(1), limits(4, 1));

    let mut request = chat_request("alice");
    request.cwd = "/home/alice/../bob".to_string();
    let err = gateway.chat(&request).await.unwrap_err();
    assert!(matches!(err, GatewayError::Invocation(InvocationError::Validation(_))));

    let err = gateway.chat(&chat_request("Not A User")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Invocation(_)));

    assert!(connector.commands().is_empty());
    assert_eq!(connector.connects(), 0);
    assert_eq!(gateway.stats().admission.global_active, 0);
}

#[tokio::test]
async fn test_chat_without_credentials_is_a_config_error() {
    let connector = ScriptedConnector::new();
    let gateway = ExecutionGateway::new(
        AdmissionController::new(limits(4, 1)).unwrap(),
        connector.pool(test_pool_config(1)),
        RemoteStreamExecutor::default(),
        ClaudeCliConfig::default(),
    );

    let err = gateway.chat(&chat_request("alice")).await.unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Invocation(InvocationError::MissingConfig("claude.auth_token"))
    ));
}

#[tokio::test]
async fn test_chat_provisions_missing_account_first() {
    let connector = ScriptedConnector::new();
    connector.on("id bob", vec![Step::Exit(1)]);
    connector.on("stream-json", vec![out("{\"type\":\"result\"}\n"), Step::Exit(0)]);
    let pool = connector.pool(test_pool_config(1));
    let gateway = ExecutionGateway::new(
        AdmissionController::new(limits(4, 1)).unwrap(),
        pool.clone(),
        RemoteStreamExecutor::default(),
        claude_config(),
    )
    .with_provisioner(AccountProvisioner::new(pool, ProvisionConfig::default()));

    let events = gateway.chat(&chat_request("bob")).await.unwrap().collect_events().await;
    assert_eq!(events.len(), 1);

    let commands = connector.commands();
    assert_eq!(commands[0], "id bob");
    assert!(commands[1].starts_with("sudo useradd -m -g ptygate -s /bin/bash bob"));
    assert!(commands.iter().any(|c| c.starts_with("sudo chown -R bob:ptygate /home/bob")));
    assert!(commands.last().unwrap().starts_with("sudo -n -u bob"));
    // Provisioning and the chat turn shared the single connection
    assert_eq!(connector.connects(), 1);
}

#[tokio::test]
async fn test_failed_provisioning_releases_admission() {
    let connector = ScriptedConnector::new();
    connector.on("id bob", vec![Step::Exit(1)]);
    connector.on("useradd", vec![helpers::err("useradd: group 'ptygate' does not exist\n"), Step::Exit(6)]);
    let pool = connector.pool(test_pool_config(1));
    let gateway = ExecutionGateway::new(
        AdmissionController::new(limits(4, 1)).unwrap(),
        pool.clone(),
        RemoteStreamExecutor::default(),
        claude_config(),
    )
    .with_provisioner(AccountProvisioner::new(pool, ProvisionConfig::default()));

    let err = gateway.chat(&chat_request("bob")).await.unwrap_err();
    assert!(matches!(err, GatewayError::Provision(_)));
    assert!(err.to_string().contains("useradd"));

    let stats = gateway.stats();
    assert_eq!(stats.admission.global_active, 0);
    assert_eq!(stats.pool.in_use, 0);
}
