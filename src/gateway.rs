// ABOUTME: Canonical calling convention: admission, then connection, then stream
// ABOUTME: The returned ExecutionStream owns the admission permit; the executor task owns the lease

#![warn(missing_docs)]

use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use thiserror::Error;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::admission::{AdmissionController, AdmissionError, AdmissionPermit, AdmissionStats, TenantId};
use crate::executor::{EventStream, ExecutionEvent, RemoteStreamExecutor};
use crate::invocation::{ChatRequest, ClaudeCliConfig, InvocationError};
use crate::pool::{ConnectionPool, PoolError, PoolStats};
use crate::provisioning::{AccountProvisioner, ProvisionError};

/// Errors that prevent an execution from starting
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Admission was not granted within the probe wait
    #[error("Service busy: {0}")]
    Busy(#[source] AdmissionError),

    /// No connection could be acquired or the pool is closed
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The request failed validation or the CLI is not configured
    #[error(transparent)]
    Invocation(#[from] InvocationError),

    /// The tenant's Linux account could not be provisioned
    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

impl GatewayError {
    /// Whether the caller should be told "busy, try later"
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Pool(e) => matches!(e, PoolError::AcquireTimeout { .. }),
            Self::Invocation(_) | Self::Provision(_) => false,
        }
    }
}

/// Events of one admitted execution
///
/// Dropping it gives the admission back and cancels the execution.
#[derive(Debug)]
pub struct ExecutionStream {
    events: EventStream,
    permit: AdmissionPermit,
}

impl ExecutionStream {
    /// Tenant the execution was admitted for
    pub fn tenant(&self) -> &TenantId {
        self.permit.tenant()
    }

    /// Next event, or `None` once the stream has ended
    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.next_event().await
    }

    /// Drain to completion; the admission is released afterwards
    pub async fn collect_events(self) -> Vec<ExecutionEvent> {
        let Self { events, permit } = self;
        let collected = events.collect_events().await;
        drop(permit);
        collected
    }
}

impl Stream for ExecutionStream {
    type Item = ExecutionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// Combined view of the pool and the admission controller
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    /// Connection pool occupancy and counters
    pub pool: PoolStats,
    /// Global and per-tenant admission counts
    pub admission: AdmissionStats,
}

/// Entry point for running commands on behalf of tenants
#[derive(Debug, Clone)]
pub struct ExecutionGateway {
    admission: AdmissionController,
    pool: ConnectionPool,
    executor: RemoteStreamExecutor,
    provisioner: Option<AccountProvisioner>,
    claude: ClaudeCliConfig,
}

impl ExecutionGateway {
    /// Assemble a gateway from its parts; provisioning is off until
    /// [`with_provisioner`](Self::with_provisioner) is called
    pub fn new(
        admission: AdmissionController,
        pool: ConnectionPool,
        executor: RemoteStreamExecutor,
        claude: ClaudeCliConfig,
    ) -> Self {
        Self {
            admission,
            pool,
            executor,
            provisioner: None,
            claude,
        }
    }

    /// Create missing accounts before chat turns
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: AccountProvisioner) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// The connection pool executions run on
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The admission controller gating executions
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Stream an arbitrary command for `tenant`
    pub async fn run(&self, tenant: &TenantId, command: &str) -> Result<ExecutionStream, GatewayError> {
        let permit = self.admit(tenant).await?;
        let conn = self.pool.acquire().await?;
        debug!(%tenant, connection_id = %conn.id(), "Starting execution");

        Ok(ExecutionStream {
            events: self.executor.exec_stream(conn, command),
            permit,
        })
    }

    /// Run one Claude CLI chat turn for `request.tenant`
    pub async fn chat(&self, request: &ChatRequest) -> Result<ExecutionStream, GatewayError> {
        // Reject bad input before taking any capacity
        let command = self.claude.build_command(request)?;
        let permit = self.admit(&request.tenant).await?;

        if let Some(provisioner) = &self.provisioner {
            if provisioner.ensure_user(&request.linux_user).await? {
                info!(tenant = %request.tenant, user = %request.linux_user, "Provisioned account for chat");
            }
        }

        let conn = self.pool.acquire().await?;
        debug!(
            tenant = %request.tenant,
            connection_id = %conn.id(),
            model = self.claude.model_for(request),
            resume = request.session_id.is_some(),
            "Starting chat turn"
        );

        Ok(ExecutionStream {
            events: self.executor.exec_stream(conn, command),
            permit,
        })
    }

    async fn admit(&self, tenant: &TenantId) -> Result<AdmissionPermit, GatewayError> {
        self.admission.probe(tenant).await.map_err(GatewayError::Busy)
    }

    /// Snapshot of pool and admission state
    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            pool: self.pool.stats(),
            admission: self.admission.stats(),
        }
    }

    /// Close every connection; executions in flight fail with a transport error
    pub async fn shutdown(&self) {
        self.pool.destroy().await;
    }
}
