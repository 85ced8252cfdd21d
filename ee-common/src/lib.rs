//! Shared building blocks for the easy-enclave services: environment-driven
//! configuration helpers, a lowercase hex codec, random identifiers, a
//! one-shot shutdown channel, and a named task wrapper.

/// Environment variable parsing for `Config::from_env` constructors.
pub mod env;
/// Lowercase hex encoding / decoding.
pub mod hex;
/// Random identifiers, nonces, and bearer tokens.
pub mod ids;
/// Multi-producer multi-consumer one-shot shutdown signal.
pub mod shutdown;
/// A named [`tokio::task::JoinHandle`] wrapper that propagates panics.
pub mod task;
