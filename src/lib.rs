//! RADIUS accounting session tracker.
//!
//! Keeps live, self-expiring session state in a shared RESP key-value store
//! so that admin tooling can see who is online and on which NAS.

pub mod config;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testing;
