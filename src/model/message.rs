use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Ingress wire payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeCaptureMessage {
    pub trade_id: String,
    pub account_id: String,
    pub book_id: String,
    pub security_id: String,
    pub source: Source,
    pub trade_date: NaiveDate,
    pub trade_timestamp: DateTime<Utc>,
    pub booking_timestamp: Option<DateTime<Utc>>,
    /// 0 on the wire means "not provided"; decoded as `None` here.
    pub sequence_number: Option<u64>,
    pub idempotency_key: Option<String>,
    pub counterparty_ids: Vec<String>,
    pub trade_lots: Vec<TradeLot>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub manual_entry: Option<ManualEntry>,
}

impl TradeCaptureMessage {
    /// Effective booking timestamp, defaulting to the trade timestamp.
    pub fn booking_timestamp(&self) -> DateTime<Utc> {
        self.booking_timestamp.unwrap_or(self.trade_timestamp)
    }

    /// Effective idempotency key, defaulting to the trade id.
    pub fn idempotency_key(&self) -> &str {
        self.idempotency_key
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.trade_id)
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::derive(&self.account_id, &self.book_id, &self.security_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Source {
    Automated = 0,
    Manual = 1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualEntry {
    pub entered_by: String,
    pub entry_timestamp: DateTime<Utc>,
}

/// Deterministic partition shard key: `accountId|bookId|securityId`.
///
/// Invariant: producers and consumers must derive this identically
/// — the separator and field order are load-bearing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn derive(account_id: &str, book_id: &str, security_id: &str) -> Self {
        Self(format!("{account_id}|{book_id}|{security_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reconstruct a key already stored in its canonical `account|book|security`
    /// form (e.g. read back from a durable store row).
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Keep only `[A-Za-z0-9_\-/]`; replace everything else with `_`, for
    /// safe inclusion in a broker topic name.
    pub fn sanitize_for_topic(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '/') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered sequence of lot identifiers plus an ordered sequence of
/// price/quantity pairs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLot {
    pub lot_ids: Vec<String>,
    pub price_quantities: Vec<PriceQuantity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuantity {
    pub quantity: Decimal,
    pub quantity_unit: String,
    pub price: Decimal,
    pub price_unit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_key_is_deterministic() {
        let a = PartitionKey::derive("ACC1", "BOOK1", "SEC1");
        let b = PartitionKey::derive("ACC1", "BOOK1", "SEC1");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "ACC1|BOOK1|SEC1");
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        let key = PartitionKey::derive("ACC 1", "BOOK#1", "SEC.1");
        assert_eq!(key.sanitize_for_topic(), "ACC_1_BOOK_1_SEC_1");
    }

    #[test]
    fn sanitize_keeps_safe_chars() {
        let key = PartitionKey::from_raw("acc-1/book_2");
        assert_eq!(key.sanitize_for_topic(), "acc-1/book_2");
    }

    #[test]
    fn idempotency_key_defaults_to_trade_id() {
        let msg = sample_message();
        assert_eq!(msg.idempotency_key(), "T1");
    }

    fn sample_message() -> TradeCaptureMessage {
        TradeCaptureMessage {
            trade_id: "T1".into(),
            account_id: "A".into(),
            book_id: "B".into(),
            security_id: "S".into(),
            source: Source::Automated,
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            trade_timestamp: Utc::now(),
            booking_timestamp: None,
            sequence_number: Some(1),
            idempotency_key: None,
            counterparty_ids: vec!["C1".into()],
            trade_lots: vec![],
            metadata: HashMap::new(),
            manual_entry: None,
        }
    }
}
