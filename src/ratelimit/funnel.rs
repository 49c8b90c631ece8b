//! Leaky-bucket ("funnel") limiter.
//!
//! A funnel holds up to `capacity` quota units and regains `leak_rate` units
//! per second. Capacity is the burst allowance, the leak rate the sustained
//! throughput. Each attempt first replenishes the funnel for the time elapsed
//! since the previous one, then takes its quota if enough is left.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{HivequotaError, Result};
use crate::store::{Arg, AtomicStore, Reply, Routine};

/// Snapshot of a funnel as held in the store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunnelState {
    /// Maximum quota units the funnel can hold
    pub capacity: f64,
    /// Quota units currently available
    pub remaining_quota: f64,
    /// Units regained per second
    pub leak_rate: f64,
    /// Nanosecond timestamp of the last replenishment
    pub last_leak_time: i64,
}

/// Leaky-bucket limiter over a shared store.
pub struct Funnel {
    store: Arc<dyn AtomicStore>,
    clock: Arc<dyn Clock>,
}

impl Funnel {
    /// Create a funnel limiter over the given store. The store must already
    /// have the funnel routines registered.
    pub fn new(store: Arc<dyn AtomicStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create funnel state for `key` unless some already exists.
    ///
    /// A second initializer, concurrent or not, leaves the existing state and
    /// its accumulated quota untouched.
    pub async fn initialize(&self, key: &str, capacity: f64, leak_rate: f64) -> Result<()> {
        check_quantity("capacity", capacity)?;
        check_quantity("leak_rate", leak_rate)?;

        let now = self.clock.now_nanos();
        let args = [Arg::Float(capacity), Arg::Float(leak_rate), Arg::Int(now)];
        let created = self
            .store
            .execute(Routine::FunnelInit, key, &args)
            .await?
            .into_int(Routine::FunnelInit)?
            == 1;

        debug!(
            key = %key,
            capacity = capacity,
            leak_rate = leak_rate,
            created = created,
            "Initialized funnel"
        );
        Ok(())
    }

    /// Replenish the funnel for `key`, then take `quota_units` from it if
    /// enough remains. Returns whether the units were taken.
    ///
    /// Asking for more than the capacity is valid and never succeeds.
    pub async fn try_consume(&self, key: &str, quota_units: f64) -> Result<bool> {
        check_quantity("quota_units", quota_units)?;

        let remaining = self.leak(key).await?;
        trace!(key = %key, remaining = remaining, quota_units = quota_units, "Leaked funnel");

        let reply = self
            .store
            .execute(Routine::FunnelConsume, key, &[Arg::Float(quota_units)])
            .await?
            .non_nil()
            .ok_or_else(|| not_initialized(key))?;
        let taken = reply.into_int(Routine::FunnelConsume)? == 1;

        if !taken {
            debug!(
                key = %key,
                quota_units = quota_units,
                "Funnel has insufficient quota"
            );
        }
        Ok(taken)
    }

    /// Replenish the funnel for `key` and return the quota now available.
    pub async fn leak(&self, key: &str) -> Result<f64> {
        let now = self.clock.now_nanos();
        self.store
            .execute(Routine::FunnelLeak, key, &[Arg::Int(now)])
            .await?
            .non_nil()
            .ok_or_else(|| not_initialized(key))?
            .into_f64(Routine::FunnelLeak)
    }

    /// Read the funnel for `key` without replenishing or consuming.
    pub async fn inspect(&self, key: &str) -> Result<Option<FunnelState>> {
        let reply = self.store.execute(Routine::FunnelInspect, key, &[]).await?;
        let fields = match reply {
            Reply::Nil => return Ok(None),
            Reply::List(fields) => fields,
            other => {
                return Err(HivequotaError::StoreUnavailable(format!(
                    "routine {} returned an unexpected reply: {:?}",
                    Routine::FunnelInspect,
                    other
                )))
            }
        };

        let [capacity, remaining_quota, leak_rate, last_leak_time]: [Reply; 4] = fields
            .try_into()
            .map_err(|_| HivequotaError::StoreUnavailable("malformed funnel state".into()))?;

        Ok(Some(FunnelState {
            capacity: capacity.into_f64(Routine::FunnelInspect)?,
            remaining_quota: remaining_quota.into_f64(Routine::FunnelInspect)?,
            leak_rate: leak_rate.into_f64(Routine::FunnelInspect)?,
            last_leak_time: last_leak_time.into_int(Routine::FunnelInspect)?,
        }))
    }
}

fn check_quantity(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(HivequotaError::Config(format!(
            "{} must be a finite, non-negative number, got {}",
            name, value
        )))
    }
}

fn not_initialized(key: &str) -> HivequotaError {
    HivequotaError::Config(format!("funnel not initialized for key {}", key))
}
