//! Random identifiers, nonces, and bearer tokens.
//!
//! Everything here is hex so it can be dropped into JSON frames, SQL rows,
//! and log lines without escaping.

use rand::RngCore;

use crate::hex;

/// A 32-char hex record id (ledger entries, usage rows, deployments).
pub fn new_id() -> String {
    hex::encode(&random_bytes::<16>())
}

/// A fresh 16-byte attestation nonce, hex encoded.
pub fn new_nonce() -> String {
    hex::encode(&random_bytes::<16>())
}

/// A 12-byte proxy request id, hex encoded.
pub fn new_request_id() -> String {
    hex::encode(&random_bytes::<12>())
}

/// An opaque bearer token. Handed out exactly once; only its hash is stored.
pub fn new_token() -> String {
    hex::encode(&random_bytes::<32>())
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shapes() {
        assert_eq!(new_id().len(), 32);
        assert_eq!(new_nonce().len(), 32);
        assert_eq!(new_request_id().len(), 24);
        assert_eq!(new_token().len(), 64);
    }

    #[test]
    fn nonces_are_fresh() {
        assert_ne!(new_nonce(), new_nonce());
    }
}
