//! Catalogue of the atomic routines the limiter runs inside the store.
//!
//! Every routine operates on exactly one key (`KEYS[1]`). Argument layouts:
//!
//! | routine          | args                                    | reply                       |
//! |------------------|-----------------------------------------|-----------------------------|
//! | `sliding_window` | now, member, cutoff, ttl_ms             | int: entries left in window |
//! | `funnel_init`    | capacity, leak_rate, now                | int: 1 created, 0 existed   |
//! | `funnel_leak`    | now                                     | text: remaining, or nil     |
//! | `funnel_consume` | quota_units                             | int: 1 taken, 0 refused, or nil |
//! | `funnel_inspect` | (none)                                  | list of four fields, or nil |

/// Field names of the funnel hash.
pub const FIELD_CAPACITY: &str = "capacity";
pub const FIELD_REMAINING: &str = "remaining_quota";
pub const FIELD_LEAK_RATE: &str = "leak_rate";
pub const FIELD_LAST_LEAK: &str = "last_leak_time";

/// A named, versioned atomic routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Routine {
    /// Record an attempt, prune the window, count what is left
    SlidingWindow,
    /// Create funnel state unless it already exists
    FunnelInit,
    /// Replenish the funnel for the time elapsed since the last leak
    FunnelLeak,
    /// Take quota from the funnel if enough remains
    FunnelConsume,
    /// Read funnel state without touching it
    FunnelInspect,
}

impl Routine {
    /// Every routine, in registration order.
    pub const ALL: [Routine; 5] = [
        Routine::SlidingWindow,
        Routine::FunnelInit,
        Routine::FunnelLeak,
        Routine::FunnelConsume,
        Routine::FunnelInspect,
    ];

    /// Stable routine name.
    pub fn name(&self) -> &'static str {
        match self {
            Routine::SlidingWindow => "sliding_window",
            Routine::FunnelInit => "funnel_init",
            Routine::FunnelLeak => "funnel_leak",
            Routine::FunnelConsume => "funnel_consume",
            Routine::FunnelInspect => "funnel_inspect",
        }
    }

    /// Routine version. Bumped whenever the body or argument layout changes.
    pub fn version(&self) -> u32 {
        match self {
            Routine::FunnelLeak | Routine::FunnelConsume => 2,
            _ => 1,
        }
    }

    /// Lua body for stores that execute server-side scripts.
    pub fn source(&self) -> &'static str {
        match self {
            Routine::SlidingWindow => SLIDING_WINDOW_LUA,
            Routine::FunnelInit => FUNNEL_INIT_LUA,
            Routine::FunnelLeak => FUNNEL_LEAK_LUA,
            Routine::FunnelConsume => FUNNEL_CONSUME_LUA,
            Routine::FunnelInspect => FUNNEL_INSPECT_LUA,
        }
    }
}

impl std::fmt::Display for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.name(), self.version())
    }
}

const SLIDING_WINDOW_LUA: &str = r#"
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[3])
local count = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[4])
return count
"#;

const FUNNEL_INIT_LUA: &str = r#"
if redis.call('HSETNX', KEYS[1], 'capacity', ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], 'remaining_quota', ARGV[1], 'leak_rate', ARGV[2], 'last_leak_time', ARGV[3])
return 1
"#;

const FUNNEL_LEAK_LUA: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'capacity', 'remaining_quota', 'leak_rate', 'last_leak_time')
if not state[1] then
  return false
end
local capacity = tonumber(state[1])
local remaining = tonumber(state[2])
local rate = tonumber(state[3])
local last = tonumber(state[4])
local stamp = ARGV[1]
local elapsed = tonumber(stamp) - last
if elapsed < 0 then
  elapsed = 0
  stamp = state[4]
end
remaining = string.format('%.17g', math.min(capacity, remaining + rate * elapsed / 1e9))
redis.call('HSET', KEYS[1], 'remaining_quota', remaining, 'last_leak_time', stamp)
return remaining
"#;

const FUNNEL_CONSUME_LUA: &str = r#"
local remaining = redis.call('HGET', KEYS[1], 'remaining_quota')
if not remaining then
  return false
end
remaining = tonumber(remaining)
local units = tonumber(ARGV[1])
if remaining >= units then
  redis.call('HSET', KEYS[1], 'remaining_quota', string.format('%.17g', remaining - units))
  return 1
end
return 0
"#;

const FUNNEL_INSPECT_LUA: &str = r#"
local state = redis.call('HMGET', KEYS[1], 'capacity', 'remaining_quota', 'leak_rate', 'last_leak_time')
if not state[1] then
  return false
end
return state
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_routine_names_are_unique() {
        let names: HashSet<&str> = Routine::ALL.iter().map(|r| r.name()).collect();
        assert_eq!(names.len(), Routine::ALL.len());
    }

    #[test]
    fn test_routine_display_includes_version() {
        assert_eq!(Routine::SlidingWindow.to_string(), "sliding_window@v1");
        assert_eq!(Routine::FunnelLeak.to_string(), "funnel_leak@v2");
    }

    #[test]
    fn test_funnel_quota_is_written_at_full_precision() {
        // `tostring` keeps 14 significant digits, which drifts fractional quota.
        for routine in [Routine::FunnelLeak, Routine::FunnelConsume] {
            let source = routine.source();
            assert!(source.contains("string.format('%.17g'"), "{}", routine);
            assert!(!source.contains("tostring("), "{}", routine);
        }
    }

    #[test]
    fn test_sliding_window_prunes_exclusively() {
        // Entries exactly at the cutoff survive; only older ones are removed.
        assert!(Routine::SlidingWindow.source().contains("'(' .. ARGV[3]"));
    }
}
