//! Verdict API: the surface applications call.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::funnel::{Funnel, FunnelState};
use super::key::LimiterKey;
use super::policy::{Policy, PolicyTable};
use super::window::SlidingWindow;
use crate::clock::{Clock, SystemClock};
use crate::config::HivequotaConfig;
use crate::error::{HivequotaError, Result};
use crate::store::{self, AtomicStore, Routine};

/// The decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allowed,
    Denied,
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

impl From<bool> for Verdict {
    fn from(allowed: bool) -> Self {
        if allowed {
            Verdict::Allowed
        } else {
            Verdict::Denied
        }
    }
}

/// Rate limiter façade over both strategies.
///
/// Holds no quota state of its own: every decision is made inside the shared
/// store, so any number of instances can serve the same subjects.
pub struct RateLimiter {
    window: SlidingWindow,
    funnel: Funnel,
    policies: PolicyTable,
    namespace: Option<String>,
    backend: &'static str,
}

impl RateLimiter {
    /// Create a limiter, registering every routine with the store first.
    ///
    /// Fails if any routine cannot be registered; a limiter is never handed
    /// out half-working.
    pub async fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::with_policies(store, clock, PolicyTable::new()).await
    }

    /// Create a limiter that can also apply a policy table through [`check`](Self::check).
    pub async fn with_policies(
        store: Arc<dyn AtomicStore>,
        clock: Arc<dyn Clock>,
        policies: PolicyTable,
    ) -> Result<Self> {
        policies.validate()?;

        for routine in Routine::ALL {
            store.register(routine).await.map_err(|e| {
                error!(routine = %routine, backend = store.backend_name(), error = %e, "Routine registration failed");
                e
            })?;
        }

        let backend = store.backend_name();
        info!(
            backend = backend,
            routines = Routine::ALL.len(),
            policies = policies.policies.len(),
            "Rate limiter ready"
        );

        Ok(Self {
            window: SlidingWindow::new(store.clone(), clock.clone()),
            funnel: Funnel::new(store, clock),
            policies,
            namespace: None,
            backend,
        })
    }

    /// Build the store, policy table and limiter described by configuration.
    pub async fn from_config(config: &HivequotaConfig) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = store::connect(&config.store, clock.clone()).await?;
        let policies = match &config.policy_path {
            Some(path) => PolicyTable::from_file(path)?,
            None => PolicyTable::new(),
        };

        let limiter = Self::with_policies(store, clock, policies).await?;
        Ok(match &config.store.namespace {
            Some(ns) => limiter.with_namespace(ns.clone()),
            None => limiter,
        })
    }

    /// Prefix every store key with `{namespace}:`.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Name of the store backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    /// The policy table applied by [`check`](Self::check).
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    fn store_key(&self, subject: &str, action: &str) -> String {
        LimiterKey::new(subject, action).to_namespaced_key(self.namespace.as_deref())
    }

    /// Sliding-window check: is this attempt within `max_count` attempts per
    /// `period`?
    pub async fn allowed(
        &self,
        subject: &str,
        action: &str,
        period: Duration,
        max_count: u64,
    ) -> Result<bool> {
        let key = self.store_key(subject, action);
        trace!(key = %key, "Checking sliding window");
        self.window
            .allowed(&key, period, max_count)
            .await
            .map_err(|e| log_failure(&key, e))
    }

    /// Create a funnel for the pair unless one exists.
    pub async fn initialize(
        &self,
        subject: &str,
        action: &str,
        capacity: f64,
        leak_rate: f64,
    ) -> Result<()> {
        let key = self.store_key(subject, action);
        self.funnel
            .initialize(&key, capacity, leak_rate)
            .await
            .map_err(|e| log_failure(&key, e))
    }

    /// Take `quota_units` from the pair's funnel if enough remains.
    pub async fn try_consume(&self, subject: &str, action: &str, quota_units: f64) -> Result<bool> {
        let key = self.store_key(subject, action);
        trace!(key = %key, quota_units = quota_units, "Checking funnel");
        self.funnel
            .try_consume(&key, quota_units)
            .await
            .map_err(|e| log_failure(&key, e))
    }

    /// Diagnostic read of the pair's funnel.
    pub async fn funnel_state(&self, subject: &str, action: &str) -> Result<Option<FunnelState>> {
        let key = self.store_key(subject, action);
        self.funnel.inspect(&key).await.map_err(|e| log_failure(&key, e))
    }

    /// Apply the configured policy for the pair.
    pub async fn check(&self, subject: &str, action: &str) -> Result<Verdict> {
        let policy = self.policies.find(subject, action).cloned().ok_or_else(|| {
            HivequotaError::Config(format!("no policy configured for action {}", action))
        })?;

        let allowed = match policy {
            Policy::SlidingWindow {
                period_secs,
                max_count,
            } => {
                self.allowed(subject, action, Duration::from_secs(period_secs), max_count)
                    .await?
            }
            Policy::Funnel {
                capacity,
                leak_rate,
                quota_units,
            } => {
                self.initialize(subject, action, capacity, leak_rate).await?;
                self.try_consume(subject, action, quota_units).await?
            }
        };

        let verdict = Verdict::from(allowed);
        debug!(subject = %subject, action = %action, verdict = ?verdict, "Policy check");
        Ok(verdict)
    }
}

fn log_failure(key: &str, e: HivequotaError) -> HivequotaError {
    if e.is_undecidable() {
        warn!(key = %key, error = %e, "Store call failed");
    }
    e
}
