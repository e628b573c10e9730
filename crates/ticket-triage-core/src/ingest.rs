use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CUSTOMER_COLUMN: &str = "Company";
pub const MESSAGE_COLUMN: &str = "Message";

/// One uploaded table row, already reduced to the two columns the engine uses.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngestRow {
    pub customer: String,
    pub message: String,
}

impl IngestRow {
    #[must_use]
    pub fn new(customer: impl Into<String>, message: impl Into<String>) -> Self {
        Self { customer: customer.into(), message: message.into() }
    }

    /// Read a header-keyed row. Rows without a non-blank `Company` cell are
    /// dropped; a missing `Message` cell becomes an empty message.
    #[must_use]
    pub fn from_columns(columns: &BTreeMap<String, String>) -> Option<Self> {
        let customer = columns.get(CUSTOMER_COLUMN)?.trim();
        if customer.is_empty() {
            return None;
        }
        let message = columns.get(MESSAGE_COLUMN).map(String::as_str).unwrap_or_default();
        Some(Self::new(customer, message))
    }
}
