/// The closed ledger error set. The `Display` form of each variant is the
/// machine-readable reason tag surfaced over HTTP; `Storage` is the one
/// internal-fault variant and maps to a 500, never to a reason payload.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("missing_amount")]
    MissingAmount,
    #[error("invalid_amount")]
    InvalidAmount,
    #[error("missing_vcpu_hours")]
    MissingVcpuHours,
    #[error("invalid_vcpu_hours")]
    InvalidVcpuHours,
    #[error("insufficient_funds")]
    InsufficientFunds,
    #[error("node_exists")]
    NodeExists,
    #[error("node_price_missing")]
    NodePriceMissing,
    #[error("report_not_found")]
    ReportNotFound,
    #[error("invalid_action")]
    InvalidAction,
    #[error("ledger storage error: {0}")]
    Storage(String),
}

impl LedgerError {
    /// Whether this is a client-visible reason (vs. an internal fault).
    pub fn is_reason(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
