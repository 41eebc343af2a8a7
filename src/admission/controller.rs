// ABOUTME: Joint global and per-tenant concurrency gate with one FIFO wait queue
// ABOUTME: Admission is held by an AdmissionPermit and given back when the permit drops

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::config::AdmissionConfig;

// === Errors ===

/// Errors returned by the admission controller
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// Not admitted within the allowed wait
    #[error("Tenant '{tenant}' was not admitted within {waited:?}")]
    Timeout {
        /// Tenant that was waiting
        tenant: TenantId,
        /// How long it waited
        waited: Duration,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl AdmissionError {
    /// Whether the caller should answer "busy, try later"
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// === Tenant ===

/// Identifies the party whose executions are limited together
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Wrap a tenant identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TenantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// === State ===

/// A queued request; its position in `waiters` is its place in both the
/// global order and its tenant's order
struct Waiter {
    ticket: u64,
    tenant: TenantId,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct AdmissionState {
    global_active: usize,
    tenant_active: HashMap<TenantId, usize>,
    waiters: VecDeque<Waiter>,
}

impl AdmissionState {
    fn active_for(&self, tenant: &TenantId) -> usize {
        self.tenant_active.get(tenant).copied().unwrap_or(0)
    }

    fn can_admit(&self, tenant: &TenantId, config: &AdmissionConfig) -> bool {
        self.global_active < config.max_global && self.active_for(tenant) < config.max_per_tenant
    }

    fn admit(&mut self, tenant: &TenantId) {
        self.global_active += 1;
        *self.tenant_active.entry(tenant.clone()).or_insert(0) += 1;
    }

    /// Undo one admission, never going below zero; false on a mismatched release
    fn unadmit(&mut self, tenant: &TenantId) -> bool {
        let mut matched = true;

        match self.tenant_active.get_mut(tenant) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.tenant_active.remove(tenant);
            }
            None => matched = false,
        }

        if self.global_active == 0 {
            matched = false;
        } else if matched {
            self.global_active -= 1;
        }
        matched
    }

    /// Admit every queued request whose joint condition now holds, oldest first
    fn grant_waiters(&mut self, config: &AdmissionConfig) -> usize {
        let mut granted = 0;
        let mut index = 0;

        while index < self.waiters.len() && self.global_active < config.max_global {
            if self.active_for(&self.waiters[index].tenant) >= config.max_per_tenant {
                index += 1;
                continue;
            }
            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };
            self.admit(&waiter.tenant);
            if waiter.tx.send(()).is_ok() {
                debug!(tenant = %waiter.tenant, ticket = waiter.ticket, "Queued request admitted");
                granted += 1;
            } else {
                // Waiter gave up concurrently; the slot goes to the next in line
                self.unadmit(&waiter.tenant);
            }
        }
        granted
    }
}

struct ControllerInner {
    config: AdmissionConfig,
    state: Mutex<AdmissionState>,
    next_ticket: AtomicU64,
}

impl ControllerInner {
    fn lock(&self) -> MutexGuard<'_, AdmissionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, tenant: &TenantId) {
        let mut state = self.lock();
        if !state.unadmit(tenant) {
            warn!(%tenant, "Release without a matching admission; counters left at floor");
        }
        state.grant_waiters(&self.config);
    }

    fn withdraw(&self, ticket: u64) -> bool {
        let mut state = self.lock();
        match state.waiters.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                state.waiters.remove(pos);
                true
            }
            None => false,
        }
    }
}

// === Permit ===

/// One admitted execution for a tenant
///
/// Dropping the permit releases the admission exactly once.
pub struct AdmissionPermit {
    inner: Arc<ControllerInner>,
    tenant: TenantId,
    armed: bool,
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl AdmissionPermit {
    /// Tenant this permit was issued to
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Keep the admission without tying it to this value
    ///
    /// The caller becomes responsible for calling
    /// [`AdmissionController::release`] with the same tenant.
    pub fn forget(mut self) -> TenantId {
        self.armed = false;
        self.tenant.clone()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            self.inner.release(&self.tenant);
        }
    }
}

/// A queued acquire; leaves the queue (or gives back a late admission) if dropped
struct PendingAdmission {
    inner: Arc<ControllerInner>,
    ticket: u64,
    tenant: TenantId,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl PendingAdmission {
    async fn wait(mut self, timeout: Option<Duration>) -> Result<(), AdmissionError> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, &mut self.rx).await.ok(),
            None => Some((&mut self.rx).await),
        };

        let outcome = match received {
            Some(Ok(())) => Ok(()),
            // Sender dropped without a grant
            Some(Err(_)) => Err(AdmissionError::Timeout {
                tenant: self.tenant.clone(),
                waited: timeout.unwrap_or_default(),
            }),
            None => {
                if self.inner.withdraw(self.ticket) {
                    Err(AdmissionError::Timeout {
                        tenant: self.tenant.clone(),
                        waited: timeout.unwrap_or_default(),
                    })
                } else if self.rx.try_recv().is_ok() {
                    // Admitted between the deadline and the withdrawal
                    Ok(())
                } else {
                    Err(AdmissionError::Timeout {
                        tenant: self.tenant.clone(),
                        waited: timeout.unwrap_or_default(),
                    })
                }
            }
        };
        self.settled = true;
        outcome
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if self.settled || self.inner.withdraw(self.ticket) {
            return;
        }
        if self.rx.try_recv().is_ok() {
            self.inner.release(&self.tenant);
        }
    }
}

// === Stats ===

/// Per-tenant counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TenantStats {
    /// Admitted executions
    pub active: usize,
    /// Requests waiting in the queue
    pub queued: usize,
}

/// Point-in-time view of the controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Admitted executions across all tenants
    pub global_active: usize,
    /// Requests waiting across all tenants
    pub global_queue_depth: usize,
    /// Configured global limit
    pub max_global: usize,
    /// Configured per-tenant limit
    pub max_per_tenant: usize,
    /// Tenants with anything active or queued
    pub tenants: BTreeMap<TenantId, TenantStats>,
}

// === Controller ===

/// Gates entry into execution under a global and a per-tenant limit
///
/// Both limits are checked together: a request is admitted only when the
/// global count and its tenant's count are both below their limits. Queued
/// requests are re-evaluated oldest first on every release.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Create a controller with the given limits
    pub fn new(config: AdmissionConfig) -> Result<Self, AdmissionError> {
        config.validate().map_err(AdmissionError::ConfigError)?;
        Ok(Self {
            inner: Arc::new(ControllerInner {
                config,
                state: Mutex::new(AdmissionState::default()),
                next_ticket: AtomicU64::new(0),
            }),
        })
    }

    /// Get the controller configuration
    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Admit now if both limits allow it, without queueing
    pub fn try_acquire(&self, tenant: &TenantId) -> Option<AdmissionPermit> {
        let mut state = self.inner.lock();
        if state.can_admit(tenant, &self.inner.config) {
            state.admit(tenant);
            drop(state);
            Some(self.permit(tenant.clone()))
        } else {
            None
        }
    }

    /// Wait as long as it takes to be admitted
    pub async fn acquire(&self, tenant: &TenantId) -> AdmissionPermit {
        loop {
            if let Ok(permit) = self.acquire_inner(tenant, None).await {
                return permit;
            }
        }
    }

    /// Wait up to `timeout` to be admitted
    pub async fn acquire_timeout(
        &self,
        tenant: &TenantId,
        timeout: Duration,
    ) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire_inner(tenant, Some(timeout)).await
    }

    /// Short bounded wait for interactive paths; expiry means "reject now"
    pub async fn probe(&self, tenant: &TenantId) -> Result<AdmissionPermit, AdmissionError> {
        self.acquire_timeout(tenant, self.inner.config.probe_wait).await
    }

    async fn acquire_inner(
        &self,
        tenant: &TenantId,
        timeout: Option<Duration>,
    ) -> Result<AdmissionPermit, AdmissionError> {
        let pending = {
            let mut state = self.inner.lock();
            // Anyone already queued was unadmittable at the last release, so a
            // newcomer passing the joint check is not overtaking a peer
            if state.can_admit(tenant, &self.inner.config) {
                state.admit(tenant);
                drop(state);
                debug!(%tenant, "Admitted immediately");
                return Ok(self.permit(tenant.clone()));
            }

            let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                ticket,
                tenant: tenant.clone(),
                tx,
            });
            debug!(%tenant, ticket, queue_depth = state.waiters.len(), "Queued for admission");

            PendingAdmission {
                inner: Arc::clone(&self.inner),
                ticket,
                tenant: tenant.clone(),
                rx,
                settled: false,
            }
        };

        pending.wait(timeout).await?;
        Ok(self.permit(tenant.clone()))
    }

    /// Release an admission that was detached with [`AdmissionPermit::forget`]
    ///
    /// Releasing a tenant with nothing admitted logs a warning and changes
    /// nothing.
    pub fn release(&self, tenant: &TenantId) {
        self.inner.release(tenant);
    }

    fn permit(&self, tenant: TenantId) -> AdmissionPermit {
        AdmissionPermit {
            inner: Arc::clone(&self.inner),
            tenant,
            armed: true,
        }
    }

    /// Current counts
    pub fn stats(&self) -> AdmissionStats {
        let state = self.inner.lock();
        let mut tenants: BTreeMap<TenantId, TenantStats> = BTreeMap::new();

        for (tenant, active) in &state.tenant_active {
            tenants.entry(tenant.clone()).or_default().active = *active;
        }
        for waiter in &state.waiters {
            tenants.entry(waiter.tenant.clone()).or_default().queued += 1;
        }

        AdmissionStats {
            global_active: state.global_active,
            global_queue_depth: state.waiters.len(),
            max_global: self.inner.config.max_global,
            max_per_tenant: self.inner.config.max_per_tenant,
            tenants,
        }
    }
}
