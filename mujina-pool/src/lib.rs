//! Solo mining pool engine.
//!
//! Accepts miner connections over Stratum v1 (plaintext, line-delimited
//! JSON-RPC) and an encrypted binary protocol, validates shares against
//! per-session difficulty, retunes that difficulty with a vardiff control
//! loop, and publishes lifecycle facts to an external pipeline without
//! blocking the mining path.

pub mod api;
pub mod api_client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod events;
pub mod identity;
pub mod job;
pub mod protocol;
pub mod session;
pub mod tags;
pub mod tracing;
pub mod types;
pub mod upstream;
pub mod validator;
pub mod vardiff;
