//! Validation service (C14): structural and semantic checks on an
//! inbound trade-capture request.

use chrono::Utc;

use crate::error::{CoreError, ValidationIssue};
use crate::model::TradeCaptureMessage;

const MAX_IDENTIFIER_LEN: usize = 64;
const ISIN_LEN: usize = 12;

#[derive(Default)]
pub struct ValidationService;

impl ValidationService {
    pub fn new() -> Self {
        Self
    }

    /// Validate `request`, collecting every violation rather than failing
    /// fast, so callers see the full set of (field, message) pairs
    ///.
    pub fn validate(&self, request: &TradeCaptureMessage) -> Result<(), CoreError> {
        let mut issues = Vec::new();

        if !is_isin_like(&request.security_id) {
            issues.push(ValidationIssue::new(
                "securityId",
                format!("must be a {ISIN_LEN}-character alphanumeric identifier"),
            ));
        }

        if request.account_id.is_empty() || request.book_id.is_empty() {
            issues.push(ValidationIssue::new(
                "accountId/bookId",
                "account/book pair must be resolvable (non-empty)",
            ));
        }

        if request.trade_lots.is_empty() {
            issues.push(ValidationIssue::new("tradeLots", "must not be empty"));
        }
        for (i, lot) in request.trade_lots.iter().enumerate() {
            if lot.price_quantities.is_empty() {
                issues.push(ValidationIssue::new(
                    format!("tradeLots[{i}].priceQuantities"),
                    "must have at least one price/quantity",
                ));
            }
        }

        if request.counterparty_ids.is_empty() {
            issues.push(ValidationIssue::new("counterpartyIds", "must not be empty"));
        }

        for (field, value) in [
            ("tradeId", &request.trade_id),
            ("accountId", &request.account_id),
            ("bookId", &request.book_id),
            ("securityId", &request.security_id),
        ] {
            if value.len() > MAX_IDENTIFIER_LEN {
                issues.push(ValidationIssue::new(
                    field,
                    format!("must be at most {MAX_IDENTIFIER_LEN} characters"),
                ));
            }
        }

        if request.trade_date > Utc::now().date_naive() {
            issues.push(ValidationIssue::new("tradeDate", "must not be in the future"));
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(CoreError::Validation(issues))
        }
    }
}

fn is_isin_like(value: &str) -> bool {
    value.len() == ISIN_LEN && value.chars().all(|c| c.is_ascii_alphanumeric())
}
