//! Parsing the TDX quote wire format.
//!
//! Layout (little-endian):
//!
//! ```text
//! [ 0..48 )   quote header: version u16, att_key_type u16, tee_type u32, ...
//! [48..632)   TD quote body (584 bytes): tee_tcb_svn, mrtd, rtmr0..3,
//!             report_data, ...
//! [632..636)  signature section length u32
//! [636..700)  ECDSA-P256 quote signature, raw r ‖ s
//! [700..764)  attestation public key, raw x ‖ y
//! [764..  )   QE certification data, ending in a PEM PCK cert chain
//! ```

use ee_common::hex;
use serde_json::{Map, Value};

pub const HEADER_SIZE: usize = 48;
pub const TD_REPORT_SIZE: usize = 584;
/// The region covered by the quote signature: header + TD quote body.
pub const SIGNED_SIZE: usize = HEADER_SIZE + TD_REPORT_SIZE;
/// Smallest parseable quote: signed region + the signature section length.
pub const MIN_SIZE: usize = SIGNED_SIZE + 4;

pub const TDX_TEE_TYPE: u32 = 0x81;
/// TDX quotes declare format version 4 or 5; anything older is rejected.
pub const MIN_VERSION: u16 = 4;

// Offsets within the TD quote body.
const TEE_TCB_SVN: usize = 0;
const MRTD: usize = 136;
const RTMR0: usize = 376;
const REPORT_DATA: usize = 520;
const MR_LEN: usize = 48;

// Offsets within the signature section (relative to the quote start).
const SIGNATURE: usize = 636;
const ATTESTATION_KEY: usize = 700;
const CERT_DATA: usize = 764;

/// Why a quote failed structural parsing. The two variants map onto the
/// `not_tdx` / `version_too_old` reason tags.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum QuoteParseError {
    #[error("not a TDX quote")]
    NotTdx,
    #[error("quote version too old")]
    VersionTooOld,
}

/// A structurally-validated view over raw quote bytes. Parsing checks only
/// shape; nothing here is trustworthy until [`crate::verify`] has run.
#[derive(Clone, Copy)]
pub struct Quote<'a> {
    raw: &'a [u8],
}

impl<'a> Quote<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, QuoteParseError> {
        if raw.len() < MIN_SIZE {
            return Err(QuoteParseError::NotTdx);
        }
        let tee_type = u32::from_le_bytes(raw[4..8].try_into().expect("4 bytes"));
        if tee_type != TDX_TEE_TYPE {
            return Err(QuoteParseError::NotTdx);
        }
        let version = u16::from_le_bytes(raw[0..2].try_into().expect("2 bytes"));
        if version < MIN_VERSION {
            return Err(QuoteParseError::VersionTooOld);
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn version(&self) -> u16 {
        u16::from_le_bytes(self.raw[0..2].try_into().expect("2 bytes"))
    }

    /// The region the quote signature endorses.
    pub fn signed_region(&self) -> &'a [u8] {
        &self.raw[..SIGNED_SIZE]
    }

    /// The 16-component TEE TCB SVN vector, compared against PCCS TCB levels.
    pub fn tee_tcb_svn(&self) -> [u8; 16] {
        let start = HEADER_SIZE + TEE_TCB_SVN;
        self.raw[start..start + 16].try_into().expect("16 bytes")
    }

    pub fn mrtd(&self) -> &'a [u8] {
        let start = HEADER_SIZE + MRTD;
        &self.raw[start..start + MR_LEN]
    }

    /// `rtmr` 0 through 3.
    pub fn rtmr(&self, index: usize) -> &'a [u8] {
        assert!(index < 4, "TDX has exactly four RTMRs");
        let start = HEADER_SIZE + RTMR0 + index * MR_LEN;
        &self.raw[start..start + MR_LEN]
    }

    pub fn report_data(&self) -> [u8; 64] {
        let start = HEADER_SIZE + REPORT_DATA;
        self.raw[start..start + 64].try_into().expect("64 bytes")
    }

    /// The raw r ‖ s ECDSA signature over [`Self::signed_region`], if the
    /// signature section is long enough to contain one.
    pub fn signature(&self) -> Option<&'a [u8]> {
        self.raw.get(SIGNATURE..SIGNATURE + 64)
    }

    /// The raw x ‖ y attestation public key that signed this quote.
    pub fn attestation_key(&self) -> Option<&'a [u8]> {
        self.raw.get(ATTESTATION_KEY..ATTESTATION_KEY + 64)
    }

    /// DER certs of the PCK chain embedded at the tail of the signature
    /// section, leaf first. Empty if the quote carries no PEM data.
    pub fn cert_chain_der(&self) -> Vec<Vec<u8>> {
        let tail = match self.raw.get(CERT_DATA..) {
            Some(tail) => tail,
            None => return Vec::new(),
        };
        // The certification data has a small binary prefix; scan forward to
        // the first PEM marker rather than hardcoding QE-report layouts.
        let start = match find_subslice(tail, b"-----BEGIN CERTIFICATE-----") {
            Some(start) => start,
            None => return Vec::new(),
        };
        let mut cursor = std::io::Cursor::new(&tail[start..]);
        rustls_pemfile::certs(&mut cursor)
            .filter_map(|item| item.ok())
            .map(|der| der.as_ref().to_vec())
            .collect()
    }

    /// The measurements map exposed to policy: lowercase hex, keyed exactly
    /// as allowlist `quote_measurements` are.
    pub fn measurements(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("mrtd".to_owned(), Value::String(hex::encode(self.mrtd())));
        for index in 0..4 {
            map.insert(
                format!("rtmr{index}"),
                Value::String(hex::encode(self.rtmr(index))),
            );
        }
        map.insert(
            "report_data".to_owned(),
            Value::String(hex::encode(&self.report_data())),
        );
        map
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
