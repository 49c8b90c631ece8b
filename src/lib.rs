//! Hivequota - Distributed Rate Limiting
//!
//! This crate lets any number of stateless process instances agree on
//! whether a subject may perform an action. All quota state lives in a shared
//! store and is only ever changed by atomic routines running inside it, so
//! instances never need to talk to each other.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
