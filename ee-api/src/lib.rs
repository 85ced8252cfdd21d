//! Wire types shared by the control plane, the agent, and clients.
//!
//! Everything crossing a process boundary lives here: the control-channel
//! WebSocket frames, the allowlist JSON published with each release, the
//! agent attestation payload, app status payloads, and the HTTP request
//! models for the ledger endpoints. Serialization is the only place dynamic
//! typing exists; everything else in the tree works with these closed types.

/// Release-pinned expected measurements (`agent-attestation-allowlist.json`).
pub mod allowlist;
/// The agent attestation payload and its canonical report-data layout.
pub mod attestation;
/// HTTP request models for credits, usage, settlement, abuse, and nodes.
pub mod ledger;
/// Machine-readable reason tags. The closed error vocabulary of the system.
pub mod reasons;
/// Externally-observable per-app status.
pub mod status;
/// The control-channel WebSocket frame set.
pub mod tunnel;
