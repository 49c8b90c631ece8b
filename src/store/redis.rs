//! Redis implementation of the atomic store contract.
//!
//! Each routine is wrapped in a [`redis::Script`]. Registration loads it into
//! the script cache and calls go out as `EVALSHA`; a `NOSCRIPT` reply (after a
//! restart, failover or `SCRIPT FLUSH`) reloads the body and retries. Redis runs
//! each routine as a single script with no other command in between.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use tracing::{info, warn};

use super::{Arg, AtomicStore, Reply, Routine};
use crate::error::{HivequotaError, Result};

/// A Redis-backed [`AtomicStore`].
pub struct RedisStore {
    conn: ConnectionManager,
    /// Scripts by routine, filled in by `register`
    scripts: RwLock<HashMap<Routine, Script>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let digests: HashMap<Routine, String> = self
            .scripts
            .read()
            .iter()
            .map(|(routine, script)| (*routine, script.get_hash().to_string()))
            .collect();
        f.debug_struct("RedisStore").field("digests", &digests).finish()
    }
}

impl RedisStore {
    /// Open a managed connection to the given Redis URL.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to Redis");
        let client = redis::Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self {
            conn,
            scripts: RwLock::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl AtomicStore for RedisStore {
    async fn register(&self, routine: Routine) -> Result<()> {
        let script = Script::new(routine.source());
        let mut conn = self.conn.clone();
        let digest = script
            .prepare_invoke()
            .load_async(&mut conn)
            .await
            .map_err(|e| HivequotaError::Registration {
                routine: routine.name(),
                reason: e.to_string(),
            })?;

        info!(routine = %routine, digest = %digest, backend = "redis", "Registered routine");
        self.scripts.write().insert(routine, script);
        Ok(())
    }

    async fn execute(&self, routine: Routine, key: &str, args: &[Arg]) -> Result<Reply> {
        let script = self.scripts.read().get(&routine).cloned().ok_or_else(|| {
            HivequotaError::StoreUnavailable(format!("routine {} is not registered", routine))
        })?;

        let mut invocation = script.prepare_invoke();
        invocation.key(key);
        for arg in args {
            invocation.arg(arg.to_string());
        }

        let mut conn = self.conn.clone();
        let value: Value = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(routine = %routine, key = %key, error = %e, "Routine execution failed");
            unavailable(e)
        })?;
        convert(routine, value)
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}

fn unavailable(e: redis::RedisError) -> HivequotaError {
    HivequotaError::StoreUnavailable(e.to_string())
}

fn convert(routine: Routine, value: Value) -> Result<Reply> {
    match value {
        Value::Nil => Ok(Reply::Nil),
        Value::Int(v) => Ok(Reply::Int(v)),
        Value::BulkString(bytes) => String::from_utf8(bytes)
            .map(Reply::Text)
            .map_err(|e| HivequotaError::StoreUnavailable(e.to_string())),
        Value::SimpleString(s) => Ok(Reply::Text(s)),
        Value::Okay => Ok(Reply::Text("OK".into())),
        Value::Array(items) => items
            .into_iter()
            .map(|item| convert(routine, item))
            .collect::<Result<Vec<_>>>()
            .map(Reply::List),
        other => Err(HivequotaError::StoreUnavailable(format!(
            "routine {} returned an unsupported value: {:?}",
            routine, other
        ))),
    }
}
