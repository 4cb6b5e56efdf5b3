//! Price oracle relayer
//!
//! Pulls asset prices from external providers (dynamic HTTP pipelines, Stork
//! WebSocket streams, Chainlink Data Streams), batches the observations and
//! relays them to an Injective-style chain on behalf of a relayer identity.

pub mod admin;
pub mod chain;
pub mod config;
pub mod oracle;
pub mod pipeline;
pub mod types;
