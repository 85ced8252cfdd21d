//! Building the agent's attestation payload.
//!
//! The agent measures itself (install dir tree, its own executable, the VM
//! image id, the sealed bit) and binds a digest of those measurements into
//! the first 32 bytes of the quote's report data.

use std::path::Path;

use anyhow::Context;
use base64::Engine;
use ee_api::attestation::{AgentMeasurements, AttestationPayload};
use ee_attest::provider::QuoteProvider;
use ee_common::hex;
use walkdir::WalkDir;

use crate::config::Config;

/// Directory entries excluded from the agent dir hash: mutable state that
/// would make the measurement unstable.
const SKIP_NAMES: &[&str] = &[".git", "deployments", "tmp"];

pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let contents = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let digest = ring::digest::digest(&ring::digest::SHA256, &contents);
    Ok(hex::encode(digest.as_ref()))
}

/// Deterministic hash of a directory tree: sorted relative paths, each
/// followed by a newline and the file contents.
pub fn sha256_dir(root: &Path) -> anyhow::Result<String> {
    let mut files: Vec<_> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            !path.components().any(|component| {
                SKIP_NAMES
                    .iter()
                    .any(|skip| component.as_os_str() == *skip)
            })
        })
        .collect();
    files.sort();

    let mut ctx = ring::digest::Context::new(&ring::digest::SHA256);
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        ctx.update(rel.to_string_lossy().as_bytes());
        ctx.update(b"\n");
        let contents = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        ctx.update(&contents);
    }
    Ok(hex::encode(ctx.finish().as_ref()))
}

/// Measure the running agent.
pub fn collect_measurements(config: &Config) -> anyhow::Result<AgentMeasurements> {
    let exe = std::env::current_exe().context("Cannot locate agent executable")?;
    Ok(AgentMeasurements {
        agent_dir_sha256: sha256_dir(&config.agent_dir)?,
        agent_py_sha256: sha256_file(&exe)?,
        vm_image_id: config.vm_image_id()?,
        sealed: config.sealed,
    })
}

/// The 64-byte report data for a set of measurements:
/// `SHA256(canonical material)` then 32 zero bytes.
pub fn report_data_for(measurements: &AgentMeasurements) -> [u8; 64] {
    let digest = ring::digest::digest(
        &ring::digest::SHA256,
        measurements.report_data_material().as_bytes(),
    );
    let mut report_data = [0u8; 64];
    report_data[..32].copy_from_slice(digest.as_ref());
    report_data
}

/// A fresh attestation: measure, bind, quote.
pub fn build_attestation(
    config: &Config,
    provider: &dyn QuoteProvider,
) -> anyhow::Result<AttestationPayload> {
    let measurements = collect_measurements(config)?;
    let report_data = report_data_for(&measurements);
    let quote = provider
        .quote(&report_data)
        .context("Quote provider failed")?;
    Ok(AttestationPayload {
        quote: base64::engine::general_purpose::STANDARD.encode(quote),
        report_data: hex::encode(&report_data),
        measurements,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn dir_hash_is_deterministic_and_skips_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "beta").unwrap();

        let first = sha256_dir(dir.path()).unwrap();
        let second = sha256_dir(dir.path()).unwrap();
        assert_eq!(first, second);

        // State dirs don't perturb the measurement.
        std::fs::create_dir(dir.path().join("deployments")).unwrap();
        std::fs::write(dir.path().join("deployments/x.json"), "{}").unwrap();
        assert_eq!(sha256_dir(dir.path()).unwrap(), first);

        // Real content does.
        std::fs::write(dir.path().join("a.txt"), "changed").unwrap();
        assert_ne!(sha256_dir(dir.path()).unwrap(), first);
    }

    #[test]
    fn report_data_commits_to_measurements() {
        let measurements = AgentMeasurements {
            agent_dir_sha256: "d".to_owned(),
            agent_py_sha256: "p".to_owned(),
            vm_image_id: "img".to_owned(),
            sealed: false,
        };
        let report_data = report_data_for(&measurements);
        assert_eq!(report_data[32..], [0u8; 32]);

        let mut changed = measurements.clone();
        changed.sealed = true;
        assert_ne!(report_data_for(&changed)[..32], report_data[..32]);
    }
}
