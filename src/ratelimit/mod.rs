//! Rate limiting strategies and the Verdict API.

mod funnel;
mod key;
mod limiter;
mod policy;
mod window;

pub use funnel::{Funnel, FunnelState};
pub use key::LimiterKey;
pub use limiter::{RateLimiter, Verdict};
pub use policy::{Policy, PolicyRule, PolicyTable};
pub use window::{SlidingWindow, WindowOutcome};
