//! Change Relay - reliable, throttled delivery of change batches.
//!
//! This library provides field filtering, failure classification, per-key
//! retry coordination and notification throttling over a durable keyed
//! state store.

pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod filter;
pub mod persistence;
pub mod relay;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod throttler;
pub mod types;

#[cfg(test)]
mod test_utils;
