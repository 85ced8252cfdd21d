//! The quote provider capability.
//!
//! A [`QuoteProvider`] is the single function the rest of the system needs
//! from the attestation hardware: 64 bytes of report data in, signed quote
//! bytes out. The real implementation drives the kernel's configfs-tsm
//! interface (which routes through QGS); the fake emits structurally-valid
//! quotes so attestation flows are exercisable off-TDX.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use rand::RngCore;

use crate::quote;

pub const REPORT_DATA_LEN: usize = 64;

/// Default location of the kernel attestation interface.
pub const CONFIGFS_TSM_REPORT: &str = "/sys/kernel/config/tsm/report";

#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    #[error("attestation interface unavailable at {0}")]
    Unavailable(PathBuf),
    #[error("empty quote from attestation interface")]
    EmptyQuote,
    #[error("report data exceeds {REPORT_DATA_LEN} bytes")]
    ReportDataTooLong,
    #[error("attestation interface i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Produce a hardware attestation quote binding the given report data.
/// Implementations are idempotent and retain no state between calls.
pub trait QuoteProvider: Send + Sync {
    fn quote(&self, report_data: &[u8]) -> Result<Vec<u8>, QuoteError>;
}

/// Right-pad report data with zeros to exactly 64 bytes.
pub fn pad_report_data(data: &[u8]) -> Result<[u8; REPORT_DATA_LEN], QuoteError> {
    if data.len() > REPORT_DATA_LEN {
        return Err(QuoteError::ReportDataTooLong);
    }
    let mut padded = [0u8; REPORT_DATA_LEN];
    padded[..data.len()].copy_from_slice(data);
    Ok(padded)
}

/// Quote generation through `configfs-tsm` (kernel 6.7+, QGS backend).
///
/// Each call claims a transient report directory, writes the report data to
/// its `inblob`, reads the signed quote from `outblob`, and releases the
/// directory on every exit path.
pub struct ConfigfsTsm {
    root: PathBuf,
}

impl ConfigfsTsm {
    pub fn new() -> Self {
        Self::at(CONFIGFS_TSM_REPORT)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ConfigfsTsm {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteProvider for ConfigfsTsm {
    fn quote(&self, report_data: &[u8]) -> Result<Vec<u8>, QuoteError> {
        let report_data = pad_report_data(report_data)?;
        if !self.root.exists() {
            return Err(QuoteError::Unavailable(self.root.clone()));
        }

        let mut suffix = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut suffix);
        let dir = self.root.join(format!(
            "report-{}-{}",
            std::process::id(),
            ee_common::hex::encode(&suffix),
        ));
        fs::create_dir(&dir)?;
        let _guard = ReportDirGuard(&dir);

        fs::write(dir.join("inblob"), report_data)?;
        let quote = fs::read(dir.join("outblob"))?;
        if quote.is_empty() {
            return Err(QuoteError::EmptyQuote);
        }
        Ok(quote)
    }
}

/// Removes the transient report directory on drop, so the interface is
/// released even when a read fails mid-way.
struct ReportDirGuard<'a>(&'a Path);

impl Drop for ReportDirGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir(self.0) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("failed to release tsm report dir: {e}");
            }
        }
    }
}

/// A deterministic provider for tests and non-TDX development.
///
/// Emits the smallest structurally-valid TDX quote: a v4 header, a zeroed TD
/// quote body carrying the caller's report data at the real offset, and an
/// empty signature section. [`crate::quote::Quote::parse`] accepts it;
/// cryptographic verification rejects it, as it should.
#[derive(Default)]
pub struct FakeQuoteProvider;

impl QuoteProvider for FakeQuoteProvider {
    fn quote(&self, report_data: &[u8]) -> Result<Vec<u8>, QuoteError> {
        let report_data = pad_report_data(report_data)?;
        let mut raw = vec![0u8; quote::MIN_SIZE];
        raw[0..2].copy_from_slice(&4u16.to_le_bytes()); // version
        raw[2..4].copy_from_slice(&2u16.to_le_bytes()); // ECDSA-P256 key type
        raw[4..8].copy_from_slice(&quote::TDX_TEE_TYPE.to_le_bytes());
        let report_data_start = quote::SIGNED_SIZE - REPORT_DATA_LEN;
        raw[report_data_start..quote::SIGNED_SIZE].copy_from_slice(&report_data);
        // Signature section length stays zero.
        Ok(raw)
    }
}
