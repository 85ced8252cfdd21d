//! The SQLite-backed ledger store.

use std::{path::Path, sync::Mutex};

use chrono::{SecondsFormat, Utc};
use ee_common::{hex, ids};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::info;

use crate::{money, LedgerError};

/// All monetary and node state, guarded by one mutex. Operations are short,
/// synchronous, and each runs in its own transaction.
pub struct LedgerStore {
    conn: Mutex<Connection>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Node {
    pub node_id: String,
    pub status: String,
    pub price_cents_per_vcpu_hour: Option<i64>,
    pub stake_tier: Option<String>,
    pub stake_amount_cents: Option<i64>,
    pub attestation_status: String,
    pub health_status: String,
    pub last_attested_at: Option<String>,
    pub last_health_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct RegisteredNode {
    pub node: Node,
    /// Present only when a token was first issued or rotated; the store
    /// keeps just its hash.
    pub node_token: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct Balance {
    pub account_id: String,
    pub balance_cents: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct UsageReceipt {
    pub usage_id: String,
    pub lock_id: String,
    pub amount_cents: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeEligibility {
    pub eligible: bool,
    pub reasons: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SettlementOutcome {
    pub node_id: String,
    pub period_start: String,
    pub period_end: String,
    pub eligible: bool,
    pub reasons: Vec<String>,
    pub settled: u32,
    pub failed: u32,
}

#[derive(Clone, Debug, Serialize)]
pub struct AbuseReceipt {
    pub report_id: String,
    pub status: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AbuseDecision {
    Authorize,
    Deny,
}

impl AbuseDecision {
    pub fn from_action(action: &str) -> Result<Self, LedgerError> {
        match action {
            "authorize" => Ok(Self::Authorize),
            "deny" => Ok(Self::Deny),
            _ => Err(LedgerError::InvalidAction),
        }
    }
}

fn utcnow() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn hash_token(token: &str) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, token.as_bytes());
    hex::encode(digest.as_ref())
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Storage(e.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_conn(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_conn(Connection::open_in_memory()?)
    }

    fn from_conn(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_tx<T>(
        &self,
        op: impl FnOnce(&Transaction<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let mut conn = self.conn.lock().expect("ledger mutex poisoned");
        let tx = conn.transaction()?;
        let value = op(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // --- Nodes --- //

    /// Create a node (and its account) if it doesn't exist yet.
    pub fn ensure_node(&self, node_id: &str) -> Result<(), LedgerError> {
        self.with_tx(|tx| ensure_node(tx, node_id))
    }

    pub fn register_node(
        &self,
        node_id: &str,
        price_cents_per_vcpu_hour: Option<i64>,
        stake_tier: Option<&str>,
        stake_amount_cents: Option<i64>,
        allow_update: bool,
        rotate_token: bool,
    ) -> Result<RegisteredNode, LedgerError> {
        self.with_tx(|tx| {
            let now = utcnow();
            let existing: Option<Option<String>> = tx
                .query_row(
                    "SELECT node_token_hash FROM nodes WHERE node_id = ?1",
                    params![node_id],
                    |row| row.get(0),
                )
                .optional()?;

            let node_token = match existing {
                Some(_) if !allow_update => return Err(LedgerError::NodeExists),
                Some(current_hash) => {
                    let (token, token_hash) =
                        if rotate_token || current_hash.is_none() {
                            let token = ids::new_token();
                            let token_hash = hash_token(&token);
                            (Some(token), Some(token_hash))
                        } else {
                            (None, current_hash)
                        };
                    tx.execute(
                        "UPDATE nodes
                         SET price_cents_per_vcpu_hour = ?1, stake_tier = ?2,
                             stake_amount_cents = ?3, node_token_hash = ?4,
                             updated_at = ?5
                         WHERE node_id = ?6",
                        params![
                            price_cents_per_vcpu_hour,
                            stake_tier,
                            stake_amount_cents,
                            token_hash,
                            now,
                            node_id
                        ],
                    )?;
                    token
                }
                None => {
                    let token = ids::new_token();
                    tx.execute(
                        "INSERT INTO nodes (
                             node_id, status, price_cents_per_vcpu_hour,
                             stake_tier, stake_amount_cents, attestation_status,
                             health_status, node_token_hash, created_at, updated_at
                         ) VALUES (?1, 'active', ?2, ?3, ?4, 'unknown', 'unknown',
                                   ?5, ?6, ?6)",
                        params![
                            node_id,
                            price_cents_per_vcpu_hour,
                            stake_tier,
                            stake_amount_cents,
                            hash_token(&token),
                            now
                        ],
                    )?;
                    ensure_account(tx, node_id)?;
                    Some(token)
                }
            };

            let node = get_node(tx, node_id)?.ok_or_else(|| {
                LedgerError::Storage("node vanished mid-register".to_owned())
            })?;
            Ok(RegisteredNode { node, node_token })
        })
    }

    /// Constant-time check of a node bearer token against the stored hash.
    pub fn verify_node_token(&self, node_id: &str, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        let stored: Option<Option<String>> = {
            let conn = self.conn.lock().expect("ledger mutex poisoned");
            conn.query_row(
                "SELECT node_token_hash FROM nodes WHERE node_id = ?1",
                params![node_id],
                |row| row.get(0),
            )
            .optional()
            .unwrap_or(None)
        };
        let stored_hash = match stored.flatten() {
            Some(hash) => hash,
            None => return false,
        };
        let (expected, actual) = match (hex::decode(&stored_hash), hex::decode(&hash_token(token))) {
            (Ok(expected), Ok(actual)) => (expected, actual),
            _ => return false,
        };
        ring::constant_time::verify_slices_are_equal(&expected, &actual).is_ok()
    }

    pub fn get_node(&self, node_id: &str) -> Result<Option<Node>, LedgerError> {
        self.with_tx(|tx| get_node(tx, node_id))
    }

    pub fn update_node_pricing(
        &self,
        node_id: &str,
        price_cents_per_vcpu_hour: i64,
    ) -> Result<(), LedgerError> {
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            tx.execute(
                "UPDATE nodes SET price_cents_per_vcpu_hour = ?1, updated_at = ?2
                 WHERE node_id = ?3",
                params![price_cents_per_vcpu_hour, utcnow(), node_id],
            )?;
            Ok(())
        })
    }

    pub fn update_node_stake(
        &self,
        node_id: &str,
        stake_tier: Option<&str>,
        stake_amount_cents: Option<i64>,
    ) -> Result<(), LedgerError> {
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            tx.execute(
                "UPDATE nodes SET stake_tier = ?1, stake_amount_cents = ?2,
                     updated_at = ?3
                 WHERE node_id = ?4",
                params![stake_tier, stake_amount_cents, utcnow(), node_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_attestation(&self, node_id: &str, status: &str) -> Result<(), LedgerError> {
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            let now = utcnow();
            tx.execute(
                "UPDATE nodes SET attestation_status = ?1, last_attested_at = ?2,
                     updated_at = ?2
                 WHERE node_id = ?3",
                params![status, now, node_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_health(&self, node_id: &str, status: &str) -> Result<(), LedgerError> {
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            let now = utcnow();
            tx.execute(
                "UPDATE nodes SET health_status = ?1, last_health_at = ?2,
                     updated_at = ?2
                 WHERE node_id = ?3",
                params![status, now, node_id],
            )?;
            Ok(())
        })
    }

    /// Append a node event (`attest_miss`, `health_miss`, ...). Consulted by
    /// settlement eligibility.
    pub fn record_node_event(
        &self,
        node_id: &str,
        event_type: &str,
        detail: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            tx.execute(
                "INSERT INTO node_events (event_id, node_id, event_type, occurred_at, detail)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![ids::new_id(), node_id, event_type, utcnow(), detail],
            )?;
            Ok(())
        })
    }

    // --- Credits --- //

    pub fn purchase_credits(
        &self,
        account_id: &str,
        amount_cents: i64,
    ) -> Result<Balance, LedgerError> {
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        self.with_tx(|tx| {
            ensure_account(tx, account_id)?;
            apply_balance_delta(tx, account_id, amount_cents)?;
            insert_ledger_entry(tx, account_id, amount_cents, "purchase", Some("purchase"), None)?;
            get_balance(tx, account_id)
        })
    }

    pub fn transfer_credits(
        &self,
        from_account: &str,
        to_account: &str,
        amount_cents: i64,
    ) -> Result<String, LedgerError> {
        if amount_cents <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let transfer_id = ids::new_id();
        self.with_tx(|tx| {
            apply_balance_delta(tx, from_account, -amount_cents)?;
            insert_ledger_entry(
                tx,
                from_account,
                -amount_cents,
                "transfer_out",
                Some("transfer"),
                Some(&transfer_id),
            )?;
            apply_balance_delta(tx, to_account, amount_cents)?;
            insert_ledger_entry(
                tx,
                to_account,
                amount_cents,
                "transfer_in",
                Some("transfer"),
                Some(&transfer_id),
            )?;
            Ok(())
        })?;
        Ok(transfer_id)
    }

    /// Lock `amount_cents` of the payer's balance for a usage period.
    pub fn lock_credits(
        &self,
        account_id: &str,
        usage_id: &str,
        amount_cents: i64,
        period_start: &str,
        period_end: &str,
    ) -> Result<String, LedgerError> {
        self.with_tx(|tx| {
            lock_credits(tx, account_id, usage_id, amount_cents, period_start, period_end)
        })
    }

    /// Price a usage report against the node's rate and lock the payer's
    /// credits for the period.
    pub fn report_usage(
        &self,
        account_id: &str,
        node_id: &str,
        vcpu_hours: Decimal,
        period_start: &str,
        period_end: &str,
    ) -> Result<UsageReceipt, LedgerError> {
        let usage_id = ids::new_id();
        self.with_tx(|tx| {
            let price_cents: Option<i64> = tx
                .query_row(
                    "SELECT price_cents_per_vcpu_hour FROM nodes WHERE node_id = ?1",
                    params![node_id],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            let price_cents = price_cents.ok_or(LedgerError::NodePriceMissing)?;
            let amount_cents = money::usage_amount_cents(price_cents, vcpu_hours)?;

            ensure_account(tx, account_id)?;
            let lock_id = lock_credits(
                tx,
                account_id,
                &usage_id,
                amount_cents,
                period_start,
                period_end,
            )?;
            tx.execute(
                "INSERT INTO usage (
                     usage_id, node_id, account_id, vcpu_hours,
                     price_cents_per_vcpu_hour, amount_cents, period_start,
                     period_end, status, lock_id, reported_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'locked', ?9, ?10)",
                params![
                    usage_id,
                    node_id,
                    account_id,
                    vcpu_hours.to_string(),
                    price_cents,
                    amount_cents,
                    period_start,
                    period_end,
                    lock_id,
                    utcnow()
                ],
            )?;
            Ok(UsageReceipt {
                usage_id: usage_id.clone(),
                lock_id,
                amount_cents,
            })
        })
    }

    /// Settle every locked usage row for the node in the exact window:
    /// credit the provider if the node stayed eligible, otherwise release
    /// each lock back to its payer.
    pub fn settle_period(
        &self,
        node_id: &str,
        period_start: &str,
        period_end: &str,
    ) -> Result<SettlementOutcome, LedgerError> {
        self.with_tx(|tx| {
            let eligibility = eligible_for_settlement(tx, node_id, period_start, period_end)?;

            let mut stmt = tx.prepare(
                "SELECT usage_id, account_id, amount_cents, lock_id FROM usage
                 WHERE node_id = ?1 AND period_start = ?2 AND period_end = ?3
                   AND status = 'locked'",
            )?;
            let usages: Vec<(String, String, i64, String)> = stmt
                .query_map(params![node_id, period_start, period_end], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                })?
                .collect::<Result<_, _>>()?;
            drop(stmt);

            let mut settled = 0;
            let mut failed = 0;
            for (usage_id, account_id, amount_cents, lock_id) in usages {
                if eligibility.eligible {
                    // Release the lock into the provider's account.
                    apply_balance_delta(tx, node_id, amount_cents)?;
                    insert_ledger_entry(
                        tx,
                        node_id,
                        amount_cents,
                        "settlement",
                        Some("usage"),
                        Some(&usage_id),
                    )?;
                    tx.execute(
                        "UPDATE credit_locks SET status = 'settled' WHERE lock_id = ?1",
                        params![lock_id],
                    )?;
                    tx.execute(
                        "UPDATE usage SET status = 'settled' WHERE usage_id = ?1",
                        params![usage_id],
                    )?;
                    settled += 1;
                } else {
                    // Release the lock back to the payer.
                    apply_balance_delta(tx, &account_id, amount_cents)?;
                    insert_ledger_entry(
                        tx,
                        &account_id,
                        amount_cents,
                        "unlock",
                        Some("usage"),
                        Some(&usage_id),
                    )?;
                    tx.execute(
                        "UPDATE credit_locks SET status = 'released' WHERE lock_id = ?1",
                        params![lock_id],
                    )?;
                    tx.execute(
                        "UPDATE usage SET status = 'failed' WHERE usage_id = ?1",
                        params![usage_id],
                    )?;
                    failed += 1;
                }
            }

            info!(
                node_id,
                settled, failed, eligible = eligibility.eligible, "settled period"
            );
            Ok(SettlementOutcome {
                node_id: node_id.to_owned(),
                period_start: period_start.to_owned(),
                period_end: period_end.to_owned(),
                eligible: eligibility.eligible,
                reasons: eligibility.reasons,
                settled,
                failed,
            })
        })
    }

    // --- Abuse reports --- //

    pub fn file_abuse_report(
        &self,
        node_id: &str,
        period_start: Option<&str>,
        period_end: Option<&str>,
        reported_by: Option<&str>,
        reason: Option<&str>,
    ) -> Result<AbuseReceipt, LedgerError> {
        let report_id = ids::new_id();
        self.with_tx(|tx| {
            ensure_node(tx, node_id)?;
            tx.execute(
                "INSERT INTO abuse_reports (
                     report_id, node_id, period_start, period_end, status,
                     reported_by, created_at, reason
                 ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
                params![
                    report_id,
                    node_id,
                    period_start,
                    period_end,
                    reported_by,
                    utcnow(),
                    reason
                ],
            )?;
            Ok(AbuseReceipt {
                report_id: report_id.clone(),
                status: "pending".to_owned(),
            })
        })
    }

    pub fn authorize_abuse_report(
        &self,
        report_id: &str,
        authorized_by: &str,
        decision: AbuseDecision,
    ) -> Result<AbuseReceipt, LedgerError> {
        let status = match decision {
            AbuseDecision::Authorize => "authorized",
            AbuseDecision::Deny => "denied",
        };
        self.with_tx(|tx| {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT report_id FROM abuse_reports WHERE report_id = ?1",
                    params![report_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(LedgerError::ReportNotFound);
            }
            tx.execute(
                "UPDATE abuse_reports
                 SET status = ?1, authorized_by = ?2, authorized_at = ?3
                 WHERE report_id = ?4",
                params![status, authorized_by, utcnow(), report_id],
            )?;
            Ok(AbuseReceipt {
                report_id: report_id.to_owned(),
                status: status.to_owned(),
            })
        })
    }

    // --- Balances --- //

    /// Unknown accounts read as zero.
    pub fn get_balance(&self, account_id: &str) -> Result<Balance, LedgerError> {
        self.with_tx(|tx| get_balance(tx, account_id))
    }

    /// Double-entry check: the sum of all ledger entries must equal the sum
    /// of all account balances.
    pub fn ledger_is_balanced(&self) -> Result<bool, LedgerError> {
        self.with_tx(|tx| {
            let entry_sum: i64 = tx.query_row(
                "SELECT COALESCE(SUM(delta_cents), 0) FROM ledger",
                [],
                |row| row.get(0),
            )?;
            let balance_sum: i64 = tx.query_row(
                "SELECT COALESCE(SUM(balance_cents), 0) FROM accounts",
                [],
                |row| row.get(0),
            )?;
            Ok(entry_sum == balance_sum)
        })
    }
}

// --- Transaction-scoped helpers --- //

fn ensure_node(tx: &Transaction<'_>, node_id: &str) -> Result<(), LedgerError> {
    let exists: Option<String> = tx
        .query_row(
            "SELECT node_id FROM nodes WHERE node_id = ?1",
            params![node_id],
            |row| row.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Ok(());
    }
    let now = utcnow();
    tx.execute(
        "INSERT INTO nodes (
             node_id, status, price_cents_per_vcpu_hour, stake_tier,
             stake_amount_cents, attestation_status, health_status,
             created_at, updated_at
         ) VALUES (?1, 'active', NULL, NULL, NULL, 'unknown', 'unknown', ?2, ?2)",
        params![node_id, now],
    )?;
    ensure_account(tx, node_id)
}

fn ensure_account(tx: &Transaction<'_>, account_id: &str) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT OR IGNORE INTO accounts (account_id, balance_cents, created_at, updated_at)
         VALUES (?1, 0, ?2, ?2)",
        params![account_id, utcnow()],
    )?;
    Ok(())
}

fn apply_balance_delta(
    tx: &Transaction<'_>,
    account_id: &str,
    delta_cents: i64,
) -> Result<(), LedgerError> {
    ensure_account(tx, account_id)?;
    let current: i64 = tx.query_row(
        "SELECT balance_cents FROM accounts WHERE account_id = ?1",
        params![account_id],
        |row| row.get(0),
    )?;
    let updated = current + delta_cents;
    if updated < 0 {
        return Err(LedgerError::InsufficientFunds);
    }
    tx.execute(
        "UPDATE accounts SET balance_cents = ?1, updated_at = ?2 WHERE account_id = ?3",
        params![updated, utcnow(), account_id],
    )?;
    Ok(())
}

fn insert_ledger_entry(
    tx: &Transaction<'_>,
    account_id: &str,
    delta_cents: i64,
    reason: &str,
    ref_type: Option<&str>,
    ref_id: Option<&str>,
) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT INTO ledger (entry_id, account_id, delta_cents, reason, ref_type, ref_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![ids::new_id(), account_id, delta_cents, reason, ref_type, ref_id, utcnow()],
    )?;
    Ok(())
}

fn lock_credits(
    tx: &Transaction<'_>,
    account_id: &str,
    usage_id: &str,
    amount_cents: i64,
    period_start: &str,
    period_end: &str,
) -> Result<String, LedgerError> {
    let lock_id = ids::new_id();
    apply_balance_delta(tx, account_id, -amount_cents)?;
    insert_ledger_entry(tx, account_id, -amount_cents, "lock", Some("usage"), Some(usage_id))?;
    tx.execute(
        "INSERT INTO credit_locks (
             lock_id, account_id, usage_id, amount_cents, period_start,
             period_end, status, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'locked', ?7)",
        params![lock_id, account_id, usage_id, amount_cents, period_start, period_end, utcnow()],
    )?;
    Ok(lock_id)
}

fn get_balance(tx: &Transaction<'_>, account_id: &str) -> Result<Balance, LedgerError> {
    let balance_cents: i64 = tx
        .query_row(
            "SELECT balance_cents FROM accounts WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(Balance {
        account_id: account_id.to_owned(),
        balance_cents,
    })
}

fn get_node(tx: &Transaction<'_>, node_id: &str) -> Result<Option<Node>, LedgerError> {
    tx.query_row(
        "SELECT node_id, status, price_cents_per_vcpu_hour, stake_tier,
                stake_amount_cents, attestation_status, health_status,
                last_attested_at, last_health_at, created_at, updated_at
         FROM nodes WHERE node_id = ?1",
        params![node_id],
        |row| {
            Ok(Node {
                node_id: row.get(0)?,
                status: row.get(1)?,
                price_cents_per_vcpu_hour: row.get(2)?,
                stake_tier: row.get(3)?,
                stake_amount_cents: row.get(4)?,
                attestation_status: row.get(5)?,
                health_status: row.get(6)?,
                last_attested_at: row.get(7)?,
                last_health_at: row.get(8)?,
                created_at: row.get(9)?,
                updated_at: row.get(10)?,
            })
        },
    )
    .optional()
    .map_err(LedgerError::from)
}

fn eligible_for_settlement(
    tx: &Transaction<'_>,
    node_id: &str,
    period_start: &str,
    period_end: &str,
) -> Result<NodeEligibility, LedgerError> {
    let node = match get_node(tx, node_id)? {
        Some(node) => node,
        None =>
            return Ok(NodeEligibility {
                eligible: false,
                reasons: vec!["node_not_found".to_owned()],
            }),
    };

    let mut reasons = Vec::new();
    let mut push = |reason: &str, reasons: &mut Vec<String>| {
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_owned());
        }
    };

    if node.status != "active" {
        push("node_inactive", &mut reasons);
    }
    if node.attestation_status != "valid" {
        push("attestation_invalid", &mut reasons);
    }
    if node.health_status != "pass" {
        push("health_fail", &mut reasons);
    }
    if node.stake_amount_cents.unwrap_or(0) <= 0 {
        push("stake_missing", &mut reasons);
    }

    let mut stmt = tx.prepare(
        "SELECT event_type FROM node_events
         WHERE node_id = ?1 AND occurred_at >= ?2 AND occurred_at <= ?3",
    )?;
    let events: Vec<String> = stmt
        .query_map(params![node_id, period_start, period_end], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    drop(stmt);
    for event_type in events {
        match event_type.as_str() {
            "health_miss" => push("health_miss", &mut reasons),
            "attest_miss" => push("attest_miss", &mut reasons),
            _ => {}
        }
    }

    let abuse: Option<String> = tx
        .query_row(
            "SELECT report_id FROM abuse_reports
             WHERE node_id = ?1 AND status = 'authorized'
               AND (period_start IS NULL OR period_start <= ?2)
               AND (period_end IS NULL OR period_end >= ?3)
             LIMIT 1",
            params![node_id, period_end, period_start],
            |row| row.get(0),
        )
        .optional()?;
    if abuse.is_some() {
        push("abuse_authorized", &mut reasons);
    }

    Ok(NodeEligibility {
        eligible: reasons.is_empty(),
        reasons,
    })
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS nodes (
    node_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    price_cents_per_vcpu_hour INTEGER,
    stake_tier TEXT,
    stake_amount_cents INTEGER,
    attestation_status TEXT NOT NULL,
    health_status TEXT NOT NULL,
    last_attested_at TEXT,
    last_health_at TEXT,
    node_token_hash TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY,
    balance_cents INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS ledger (
    entry_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    delta_cents INTEGER NOT NULL,
    reason TEXT NOT NULL,
    ref_type TEXT,
    ref_id TEXT,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS credit_locks (
    lock_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL,
    usage_id TEXT NOT NULL,
    amount_cents INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS usage (
    usage_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    account_id TEXT NOT NULL,
    vcpu_hours TEXT NOT NULL,
    price_cents_per_vcpu_hour INTEGER NOT NULL,
    amount_cents INTEGER NOT NULL,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    status TEXT NOT NULL,
    lock_id TEXT NOT NULL,
    reported_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS abuse_reports (
    report_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    period_start TEXT,
    period_end TEXT,
    status TEXT NOT NULL,
    reported_by TEXT,
    authorized_by TEXT,
    created_at TEXT NOT NULL,
    authorized_at TEXT,
    reason TEXT
);
CREATE TABLE IF NOT EXISTS node_events (
    event_id TEXT PRIMARY KEY,
    node_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    occurred_at TEXT NOT NULL,
    detail TEXT
);
";

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rust_decimal::Decimal;

    use super::*;

    const PERIOD_START: &str = "2026-07-01T00:00:00Z";
    const PERIOD_END: &str = "2026-07-31T23:59:59Z";

    /// The dates above bracket "now" so events recorded during the test land
    /// inside the window.
    fn wide_period() -> (&'static str, &'static str) {
        ("2020-01-01T00:00:00Z", "2099-01-01T00:00:00Z")
    }

    fn provisioned_node(store: &LedgerStore) -> String {
        let node_id = "worker-1".to_owned();
        store
            .register_node(&node_id, Some(50), Some("silver"), Some(10_000), false, false)
            .unwrap();
        store.mark_attestation(&node_id, "valid").unwrap();
        store.mark_health(&node_id, "pass").unwrap();
        node_id
    }

    #[test]
    fn purchase_is_additive() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.purchase_credits("alice", 250).unwrap();
        let balance = store.purchase_credits("alice", 750).unwrap();
        assert_eq!(balance.balance_cents, 1000);
        assert!(store.ledger_is_balanced().unwrap());
    }

    #[test]
    fn purchase_rejects_nonpositive() {
        let store = LedgerStore::open_in_memory().unwrap();
        let err = store.purchase_credits("alice", 0).unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount);
    }

    #[test]
    fn transfer_moves_money_or_nothing() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.purchase_credits("alice", 500).unwrap();
        store.transfer_credits("alice", "bob", 200).unwrap();
        assert_eq!(store.get_balance("alice").unwrap().balance_cents, 300);
        assert_eq!(store.get_balance("bob").unwrap().balance_cents, 200);

        let err = store.transfer_credits("alice", "bob", 999).unwrap_err();
        assert_eq!(err, LedgerError::InsufficientFunds);
        // Nothing moved.
        assert_eq!(store.get_balance("alice").unwrap().balance_cents, 300);
        assert_eq!(store.get_balance("bob").unwrap().balance_cents, 200);
        assert!(store.ledger_is_balanced().unwrap());
    }

    #[test]
    fn node_registration_and_tokens() {
        let store = LedgerStore::open_in_memory().unwrap();
        let registered = store
            .register_node("worker-1", Some(50), None, Some(10_000), false, false)
            .unwrap();
        let token = registered.node_token.expect("fresh node gets a token");
        assert!(store.verify_node_token("worker-1", &token));
        assert!(!store.verify_node_token("worker-1", "wrong"));
        assert!(!store.verify_node_token("worker-1", ""));

        // Re-register without allow_update fails and changes nothing.
        let err = store
            .register_node("worker-1", Some(60), None, None, false, false)
            .unwrap_err();
        assert_eq!(err, LedgerError::NodeExists);
        let node = store.get_node("worker-1").unwrap().unwrap();
        assert_eq!(node.price_cents_per_vcpu_hour, Some(50));

        // Update keeps the token unless rotated.
        let updated = store
            .register_node("worker-1", Some(60), None, Some(10_000), true, false)
            .unwrap();
        assert!(updated.node_token.is_none());
        assert!(store.verify_node_token("worker-1", &token));

        let rotated = store
            .register_node("worker-1", Some(60), None, Some(10_000), true, true)
            .unwrap();
        let new_token = rotated.node_token.expect("rotation issues a token");
        assert!(!store.verify_node_token("worker-1", &token));
        assert!(store.verify_node_token("worker-1", &new_token));
    }

    #[test]
    fn pricing_and_stake_updates_upsert() {
        let store = LedgerStore::open_in_memory().unwrap();
        // Both mutators create the node on first touch.
        store.update_node_pricing("late-node", 75).unwrap();
        store
            .update_node_stake("late-node", Some("gold"), Some(50_000))
            .unwrap();
        let node = store.get_node("late-node").unwrap().unwrap();
        assert_eq!(node.price_cents_per_vcpu_hour, Some(75));
        assert_eq!(node.stake_tier.as_deref(), Some("gold"));
        assert_eq!(node.stake_amount_cents, Some(50_000));
        assert_eq!(node.status, "active");
        // The account came along with the node.
        assert_eq!(store.get_balance("late-node").unwrap().balance_cents, 0);
    }

    #[test]
    fn usage_requires_priced_node() {
        let store = LedgerStore::open_in_memory().unwrap();
        store.ensure_node("unpriced").unwrap();
        store.purchase_credits("alice", 1000).unwrap();
        let err = store
            .report_usage("alice", "unpriced", Decimal::from(2), PERIOD_START, PERIOD_END)
            .unwrap_err();
        assert_eq!(err, LedgerError::NodePriceMissing);
    }

    #[test]
    fn settlement_credits_eligible_provider() {
        let store = LedgerStore::open_in_memory().unwrap();
        let node_id = provisioned_node(&store);
        store.purchase_credits("alice", 1000).unwrap();

        let receipt = store
            .report_usage("alice", &node_id, Decimal::from(2), PERIOD_START, PERIOD_END)
            .unwrap();
        assert_eq!(receipt.amount_cents, 100);
        assert_eq!(store.get_balance("alice").unwrap().balance_cents, 900);

        let outcome = store
            .settle_period(&node_id, PERIOD_START, PERIOD_END)
            .unwrap();
        assert!(outcome.eligible, "reasons: {:?}", outcome.reasons);
        assert_eq!(outcome.settled, 1);
        assert_eq!(outcome.failed, 0);
        assert_eq!(store.get_balance("alice").unwrap().balance_cents, 900);
        assert_eq!(store.get_balance(&node_id).unwrap().balance_cents, 100);
        assert!(store.ledger_is_balanced().unwrap());
    }

    #[test]
    fn settlement_refunds_on_health_miss() {
        let store = LedgerStore::open_in_memory().unwrap();
        let node_id = provisioned_node(&store);
        store.purchase_credits("alice", 1000).unwrap();
        let (start, end) = wide_period();

        store
            .report_usage("alice", &node_id, Decimal::from(2), start, end)
            .unwrap();
        // Mid-period disconnect.
        store
            .record_node_event(&node_id, "health_miss", Some("disconnect"))
            .unwrap();

        let outcome = store.settle_period(&node_id, start, end).unwrap();
        assert!(!outcome.eligible);
        assert!(outcome.reasons.contains(&"health_miss".to_owned()));
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.settled, 0);
        assert_eq!(store.get_balance("alice").unwrap().balance_cents, 1000);
        assert_eq!(store.get_balance(&node_id).unwrap().balance_cents, 0);
        assert!(store.ledger_is_balanced().unwrap());
    }

    #[test]
    fn settlement_blocked_by_authorized_abuse() {
        let store = LedgerStore::open_in_memory().unwrap();
        let node_id = provisioned_node(&store);
        store.purchase_credits("alice", 1000).unwrap();
        let (start, end) = wide_period();
        store
            .report_usage("alice", &node_id, Decimal::from(1), start, end)
            .unwrap();

        let report = store
            .file_abuse_report(&node_id, Some(start), Some(end), Some("launcher"), Some("spam"))
            .unwrap();
        assert_eq!(report.status, "pending");

        // Pending reports don't block.
        let outcome = store.settle_period(&node_id, start, end).unwrap();
        assert!(outcome.eligible);

        // Authorized reports do (for the next period's rows).
        store
            .report_usage("alice", &node_id, Decimal::from(1), start, end)
            .unwrap();
        let decided = store
            .authorize_abuse_report(&report.report_id, "admin", AbuseDecision::Authorize)
            .unwrap();
        assert_eq!(decided.status, "authorized");
        let outcome = store.settle_period(&node_id, start, end).unwrap();
        assert!(!outcome.eligible);
        assert!(outcome.reasons.contains(&"abuse_authorized".to_owned()));
    }

    #[test]
    fn abuse_decision_parsing() {
        assert_eq!(
            AbuseDecision::from_action("authorize").unwrap(),
            AbuseDecision::Authorize
        );
        assert_eq!(
            AbuseDecision::from_action("deny").unwrap(),
            AbuseDecision::Deny
        );
        assert_eq!(
            AbuseDecision::from_action("shrug").unwrap_err(),
            LedgerError::InvalidAction
        );
        let store = LedgerStore::open_in_memory().unwrap();
        assert_eq!(
            store
                .authorize_abuse_report("nope", "admin", AbuseDecision::Deny)
                .unwrap_err(),
            LedgerError::ReportNotFound
        );
    }

    proptest! {
        /// P3: whatever sequence of purchases and transfers runs, the sum of
        /// ledger entries equals the sum of balances.
        #[test]
        fn ledger_stays_balanced(ops in proptest::collection::vec((0u8..2, 1i64..10_000), 1..30)) {
            let store = LedgerStore::open_in_memory().unwrap();
            for (op, cents) in ops {
                match op {
                    0 => { store.purchase_credits("alice", cents).unwrap(); }
                    _ => { let _ = store.transfer_credits("alice", "bob", cents); }
                }
            }
            prop_assert!(store.ledger_is_balanced().unwrap());
        }
    }
}
