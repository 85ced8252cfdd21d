//! TDX attestation: quote generation, quote verification, and RA-TLS.
//!
//! # The trust chain, end to end
//!
//! Inside the trust domain, [`provider::QuoteProvider`] turns 64 bytes of
//! caller-chosen report data into a quote signed by the Intel Quoting
//! Enclave. [`ratls`] binds a quote to an ephemeral TLS key by hashing the
//! certificate's SubjectPublicKeyInfo into the report data and embedding the
//! quote in the certificate as a custom extension.
//!
//! On the verifying side, [`quote`] parses the binary quote format,
//! [`verify`] checks the certificate chain up to Intel's pinned root CA and
//! the quote signature, compares measurements, and (optionally) consults a
//! PCCS for the platform's TCB status via [`pccs`]. [`tls`] packages the
//! local checks as rustls certificate verifiers so an unattested peer never
//! completes a TLS handshake.

/// Collateral lookups against a PCCS / the Intel PCS.
pub mod pccs;
/// The `QuoteProvider` capability: configfs-tsm, plus a deterministic fake.
pub mod provider;
/// Parsing the TDX quote wire format.
pub mod quote;
/// RA-TLS material generation and peer certificate verification.
pub mod ratls;
/// rustls client/server verifiers enforcing RA-TLS at the handshake.
pub mod tls;
/// Quote verification: structure, chain, signature, measurements, TCB.
pub mod verify;

/// SHA-256 convenience used throughout the crate.
pub(crate) fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = ring::digest::digest(&ring::digest::SHA256, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(digest.as_ref());
    out
}
