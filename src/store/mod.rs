//! Atomic execution environment.
//!
//! A store runs a named [`Routine`] against the state held under one key as a
//! single indivisible step. The limiter strategies never touch store state any
//! other way, so every implementation of [`AtomicStore`] only has to guarantee
//! single-key atomicity for the routines in the catalogue.

mod memory;
#[cfg(feature = "redis")]
mod redis;
mod routine;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;
pub use routine::Routine;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::error::{HivequotaError, Result};

/// An argument passed to a routine.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Arg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arg::Int(v) => write!(f, "{}", v),
            Arg::Float(v) => write!(f, "{}", v),
            Arg::Text(v) => f.write_str(v),
        }
    }
}

/// The value a routine hands back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    List(Vec<Reply>),
}

impl Reply {
    /// Interpret the reply as an integer.
    pub fn into_int(self, routine: Routine) -> Result<i64> {
        match self {
            Reply::Int(v) => Ok(v),
            Reply::Text(ref s) => s.parse().map_err(|_| unexpected(routine, &self)),
            other => Err(unexpected(routine, &other)),
        }
    }

    /// Interpret the reply as a float.
    pub fn into_f64(self, routine: Routine) -> Result<f64> {
        match self {
            Reply::Int(v) => Ok(v as f64),
            Reply::Text(ref s) => s.parse().map_err(|_| unexpected(routine, &self)),
            other => Err(unexpected(routine, &other)),
        }
    }

    /// `None` for a nil reply, the reply itself otherwise.
    pub fn non_nil(self) -> Option<Reply> {
        match self {
            Reply::Nil => None,
            other => Some(other),
        }
    }
}

fn unexpected(routine: Routine, reply: &Reply) -> HivequotaError {
    HivequotaError::StoreUnavailable(format!(
        "routine {} returned an unexpected reply: {:?}",
        routine, reply
    ))
}

/// A shared store able to run routines atomically against a single key.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Install a routine so it can later be executed.
    ///
    /// Failure here is fatal for any limiter relying on the routine.
    async fn register(&self, routine: Routine) -> Result<()>;

    /// Run a registered routine against `key` as one indivisible step.
    async fn execute(&self, routine: Routine, key: &str, args: &[Arg]) -> Result<Reply>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Build the store selected by configuration.
pub async fn connect(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<dyn AtomicStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!(backend = "memory", "Using in-process store");
            Ok(Arc::new(MemoryStore::with_clock(clock)))
        }
        #[cfg(feature = "redis")]
        StoreBackend::Redis => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                HivequotaError::Config("store.redis_url is required for the redis backend".into())
            })?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(HivequotaError::Config(
            "the redis backend requires building with the `redis` feature".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    #[test]
    fn test_arg_display() {
        assert_eq!(Arg::Int(-42).to_string(), "-42");
        assert_eq!(Arg::Float(0.5).to_string(), "0.5");
        assert_eq!(Arg::Float(15.0).to_string(), "15");
        assert_eq!(Arg::Text("a-b".into()).to_string(), "a-b");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Int(3).into_int(Routine::SlidingWindow).unwrap(), 3);
        assert_eq!(Reply::Text("7.5".into()).into_f64(Routine::FunnelLeak).unwrap(), 7.5);
        assert_eq!(Reply::Int(2).into_f64(Routine::FunnelLeak).unwrap(), 2.0);
        assert!(Reply::Nil.non_nil().is_none());
    }

    #[test]
    fn test_unexpected_reply_is_store_error() {
        let err = Reply::Nil.into_int(Routine::SlidingWindow).unwrap_err();
        assert!(err.is_undecidable());
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let store = connect(&StoreConfig::default(), Arc::new(SystemClock)).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
    }

    #[cfg(not(feature = "redis"))]
    #[tokio::test]
    async fn test_connect_redis_without_feature() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: Some("redis://127.0.0.1/".into()),
            namespace: None,
        };
        let result = connect(&config, Arc::new(SystemClock)).await;
        assert!(matches!(result, Err(HivequotaError::Config(_))));
    }
}
