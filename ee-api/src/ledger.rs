//! HTTP request models for the ledger endpoints.
//!
//! Monetary amounts and vCPU hours arrive as either JSON numbers or strings
//! (operators paste both); they're kept as raw [`serde_json::Value`]s here
//! and parsed into integer cents by the ledger, which owns the rounding and
//! validation rules.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PurchaseCreditsRequest {
    pub account_id: String,
    /// Dollars, number or string; rounded half-up to cents.
    #[serde(default)]
    pub amount: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TransferCreditsRequest {
    pub from_account: String,
    pub to_account: String,
    #[serde(default)]
    pub amount: Option<Value>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UsageReportRequest {
    pub account_id: String,
    pub node_id: String,
    #[serde(default)]
    pub vcpu_hours: Option<Value>,
    pub period_start: String,
    pub period_end: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SettleRequest {
    pub node_id: String,
    pub period_start: String,
    pub period_end: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AbuseReportRequest {
    pub node_id: String,
    #[serde(default)]
    pub period_start: Option<String>,
    #[serde(default)]
    pub period_end: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AbuseAuthorizeRequest {
    /// "authorize" or "deny".
    pub action: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NodeRegisterRequest {
    pub node_id: String,
    #[serde(default)]
    pub price_cents_per_vcpu_hour: Option<i64>,
    #[serde(default)]
    pub stake_tier: Option<String>,
    #[serde(default)]
    pub stake_amount_cents: Option<i64>,
    /// Updating an existing node requires opting in.
    #[serde(default)]
    pub allow_update: bool,
    /// Issue a fresh node token, invalidating the previous one.
    #[serde(default)]
    pub rotate_token: bool,
}
