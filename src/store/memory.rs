//! In-process implementation of the atomic store contract.
//!
//! Each key lives in one slot of a sharded map. A routine runs while holding
//! the slot's entry guard, so two routines on the same key never interleave
//! while routines on different shards proceed in parallel.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, info};

use super::routine::{Routine, FIELD_CAPACITY, FIELD_LAST_LEAK, FIELD_LEAK_RATE, FIELD_REMAINING};
use super::{Arg, AtomicStore, Reply};
use crate::clock::{Clock, SystemClock, NANOS_PER_SEC};
use crate::error::{HivequotaError, Result};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Value held under a key.
#[derive(Debug, Clone)]
enum Value {
    /// Members ordered by score, ties broken by member
    Log(BTreeSet<(i64, String)>),
    /// Field map
    Fields(HashMap<String, String>),
}

#[derive(Debug, Default)]
struct Slot {
    value: Option<Value>,
    /// Expiry instant in store-clock nanoseconds
    expires_at: Option<i64>,
}

impl Slot {
    /// A key is still live at the exact instant its ttl ends.
    fn is_expired(&self, now: i64) -> bool {
        matches!(self.expires_at, Some(at) if at < now)
    }

    fn expire_if_due(&mut self, now: i64) {
        if self.is_expired(now) {
            self.value = None;
            self.expires_at = None;
        }
    }

    fn log_mut(&mut self, routine: Routine) -> Result<&mut BTreeSet<(i64, String)>> {
        let value = self.value.get_or_insert_with(|| Value::Log(BTreeSet::new()));
        match value {
            Value::Log(log) => Ok(log),
            Value::Fields(_) => Err(wrong_type(routine)),
        }
    }

    fn fields(&self, routine: Routine) -> Result<Option<&HashMap<String, String>>> {
        match &self.value {
            None => Ok(None),
            Some(Value::Fields(fields)) => Ok(Some(fields)),
            Some(Value::Log(_)) => Err(wrong_type(routine)),
        }
    }

    fn fields_mut(&mut self, routine: Routine) -> Result<&mut HashMap<String, String>> {
        let value = self.value.get_or_insert_with(|| Value::Fields(HashMap::new()));
        match value {
            Value::Fields(fields) => Ok(fields),
            Value::Log(_) => Err(wrong_type(routine)),
        }
    }

    /// A non-positive ttl deletes the key, as an expiry in the past would.
    fn pexpire(&mut self, now: i64, ttl_ms: i64) {
        if self.value.is_none() {
            return;
        }
        if ttl_ms <= 0 {
            self.value = None;
            self.expires_at = None;
        } else {
            self.expires_at = Some(now.saturating_add(ttl_ms.saturating_mul(NANOS_PER_MILLI)));
        }
    }

    /// Empty collections do not keep a key alive.
    fn drop_if_empty(&mut self) {
        let empty = match &self.value {
            Some(Value::Log(log)) => log.is_empty(),
            Some(Value::Fields(fields)) => fields.is_empty(),
            None => true,
        };
        if empty {
            self.value = None;
            self.expires_at = None;
        }
    }
}

/// An in-memory [`AtomicStore`].
///
/// Suitable for a single process, for tests, and for drills. State does not
/// outlive the process.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    registered: RwLock<HashSet<Routine>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    /// Create a store that expires keys against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires keys against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            registered: RwLock::new(HashSet::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage. While unavailable every call fails with
    /// [`HivequotaError::StoreUnavailable`] and registration is refused.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys holding live state.
    pub fn len(&self) -> usize {
        let now = self.clock.now_nanos();
        self.entries
            .iter()
            .filter(|slot| slot.value.is_some() && !slot.is_expired(now))
            .count()
    }

    /// Whether no key holds live state.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every key whose ttl has passed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_nanos();
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.value.is_some() && !slot.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, "Purged expired keys");
        }
        removed
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HivequotaError::StoreUnavailable("memory store is offline".into()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn register(&self, routine: Routine) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HivequotaError::Registration {
                routine: routine.name(),
                reason: "memory store is offline".into(),
            });
        }
        self.registered.write().insert(routine);
        info!(routine = %routine, backend = "memory", "Registered routine");
        Ok(())
    }

    async fn execute(&self, routine: Routine, key: &str, args: &[Arg]) -> Result<Reply> {
        self.ensure_available()?;
        if !self.registered.read().contains(&routine) {
            return Err(HivequotaError::StoreUnavailable(format!(
                "routine {} is not registered",
                routine
            )));
        }

        let now = self.clock.now_nanos();
        let mut slot = self.entries.entry(key.to_string()).or_default();
        slot.expire_if_due(now);

        let outcome = match routine {
            Routine::SlidingWindow => sliding_window(&mut slot, args, now),
            Routine::FunnelInit => funnel_init(&mut slot, args),
            Routine::FunnelLeak => funnel_leak(&mut slot, args),
            Routine::FunnelConsume => funnel_consume(&mut slot, args),
            Routine::FunnelInspect => funnel_inspect(&slot),
        };

        let vacant = slot.value.is_none();
        drop(slot);
        if vacant {
            self.entries.remove_if(key, |_, slot| slot.value.is_none());
        }
        outcome
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

fn sliding_window(slot: &mut Slot, args: &[Arg], now: i64) -> Result<Reply> {
    let routine = Routine::SlidingWindow;
    let score = arg_int(routine, args, 0)?;
    let member = arg_text(routine, args, 1)?;
    let cutoff = arg_int(routine, args, 2)?;
    let ttl_ms = arg_int(routine, args, 3)?;

    let log = slot.log_mut(routine)?;
    log.insert((score, member));
    // Keep scores >= cutoff.
    let kept = log.split_off(&(cutoff, String::new()));
    *log = kept;
    let count = log.len() as i64;

    slot.drop_if_empty();
    slot.pexpire(now, ttl_ms);
    Ok(Reply::Int(count))
}

fn funnel_init(slot: &mut Slot, args: &[Arg]) -> Result<Reply> {
    let routine = Routine::FunnelInit;
    let capacity = arg_text(routine, args, 0)?;
    let leak_rate = arg_text(routine, args, 1)?;
    let now = arg_text(routine, args, 2)?;

    let fields = slot.fields_mut(routine)?;
    if fields.contains_key(FIELD_CAPACITY) {
        return Ok(Reply::Int(0));
    }
    fields.insert(FIELD_CAPACITY.to_string(), capacity.clone());
    fields.insert(FIELD_REMAINING.to_string(), capacity);
    fields.insert(FIELD_LEAK_RATE.to_string(), leak_rate);
    fields.insert(FIELD_LAST_LEAK.to_string(), now);
    Ok(Reply::Int(1))
}

fn funnel_leak(slot: &mut Slot, args: &[Arg]) -> Result<Reply> {
    let routine = Routine::FunnelLeak;
    let now = arg_int(routine, args, 0)?;

    let (capacity, remaining, rate, last) = match slot.fields(routine)? {
        Some(fields) if fields.contains_key(FIELD_CAPACITY) => (
            field_f64(routine, fields, FIELD_CAPACITY)?,
            field_f64(routine, fields, FIELD_REMAINING)?,
            field_f64(routine, fields, FIELD_LEAK_RATE)?,
            field_i64(routine, fields, FIELD_LAST_LEAK)?,
        ),
        _ => return Ok(Reply::Nil),
    };

    // A clock that went backwards reclaims nothing and never rewinds the stamp.
    let (elapsed, stamp) = if now < last { (0, last) } else { (now - last, now) };
    let reclaimed = rate * elapsed as f64 / NANOS_PER_SEC as f64;
    let remaining = (remaining + reclaimed).min(capacity);

    let fields = slot.fields_mut(routine)?;
    fields.insert(FIELD_REMAINING.to_string(), remaining.to_string());
    fields.insert(FIELD_LAST_LEAK.to_string(), stamp.to_string());
    Ok(Reply::Text(remaining.to_string()))
}

fn funnel_consume(slot: &mut Slot, args: &[Arg]) -> Result<Reply> {
    let routine = Routine::FunnelConsume;
    let units = arg_f64(routine, args, 0)?;

    let remaining = match slot.fields(routine)? {
        Some(fields) if fields.contains_key(FIELD_REMAINING) => {
            field_f64(routine, fields, FIELD_REMAINING)?
        }
        _ => return Ok(Reply::Nil),
    };

    if remaining >= units {
        let fields = slot.fields_mut(routine)?;
        fields.insert(FIELD_REMAINING.to_string(), (remaining - units).to_string());
        Ok(Reply::Int(1))
    } else {
        Ok(Reply::Int(0))
    }
}

fn funnel_inspect(slot: &Slot) -> Result<Reply> {
    let routine = Routine::FunnelInspect;
    let fields = match slot.fields(routine)? {
        Some(fields) if fields.contains_key(FIELD_CAPACITY) => fields,
        _ => return Ok(Reply::Nil),
    };
    let list = [FIELD_CAPACITY, FIELD_REMAINING, FIELD_LEAK_RATE, FIELD_LAST_LEAK]
        .iter()
        .map(|name| match fields.get(*name) {
            Some(v) => Reply::Text(v.clone()),
            None => Reply::Nil,
        })
        .collect();
    Ok(Reply::List(list))
}

fn wrong_type(routine: Routine) -> HivequotaError {
    HivequotaError::StoreUnavailable(format!(
        "routine {} hit a key holding the wrong kind of value",
        routine
    ))
}

fn fault(routine: Routine, detail: String) -> HivequotaError {
    HivequotaError::StoreUnavailable(format!("routine {} failed: {}", routine, detail))
}

fn arg_text(routine: Routine, args: &[Arg], index: usize) -> Result<String> {
    args.get(index)
        .map(|a| a.to_string())
        .ok_or_else(|| fault(routine, format!("missing argument {}", index)))
}

fn arg_int(routine: Routine, args: &[Arg], index: usize) -> Result<i64> {
    match args.get(index) {
        Some(Arg::Int(v)) => Ok(*v),
        Some(Arg::Text(s)) => s
            .parse()
            .map_err(|_| fault(routine, format!("argument {} is not an integer", index))),
        Some(Arg::Float(_)) => Err(fault(routine, format!("argument {} is not an integer", index))),
        None => Err(fault(routine, format!("missing argument {}", index))),
    }
}

fn arg_f64(routine: Routine, args: &[Arg], index: usize) -> Result<f64> {
    match args.get(index) {
        Some(Arg::Int(v)) => Ok(*v as f64),
        Some(Arg::Float(v)) => Ok(*v),
        Some(Arg::Text(s)) => s
            .parse()
            .map_err(|_| fault(routine, format!("argument {} is not a number", index))),
        None => Err(fault(routine, format!("missing argument {}", index))),
    }
}

fn field_f64(routine: Routine, fields: &HashMap<String, String>, name: &str) -> Result<f64> {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| fault(routine, format!("field {} is not a number", name)))
}

fn field_i64(routine: Routine, fields: &HashMap<String, String>, name: &str) -> Result<i64> {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| fault(routine, format!("field {} is not an integer", name)))
}
