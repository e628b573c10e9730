use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

mod classification;
mod collection;
mod engine;
mod ingest;
mod selection;
mod summary;

pub use classification::{
    merge, BatchId, BatchTicket, ClassificationBatch, ClassificationClient, ClassificationError,
    ClassificationResponse, Prediction,
};
pub use collection::{RecordCollection, TicketPage, Upserted, ViewQuery, DEFAULT_PAGE_SIZE};
pub use engine::{
    ClassificationOutcome, EnginePhase, FeedError, NoPersistence, PersistError, Persistence,
    ResetTarget, TicketFeed, TriageEngine,
};
pub use ingest::{IngestRow, CUSTOMER_COLUMN, MESSAGE_COLUMN};
pub use selection::SelectionSet;
pub use summary::{reset_classification, summarize, SummaryScope, UrgencySummary};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TriageError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown ticket: {0}")]
    UnknownTicket(TicketId),
    #[error("a classification batch is already in flight")]
    Busy,
    #[error("no tickets are selected for classification")]
    EmptySelection,
    #[error("classification batch {0} is not the outstanding batch")]
    StaleBatch(BatchId),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
}

/// Stable, opaque ticket identity. Generated tickets carry a ULID; tickets
/// fed from an upstream system keep the upstream identity string.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TicketId(String);

impl TicketId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an externally assigned identifier.
    ///
    /// # Errors
    /// Returns [`TriageError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, TriageError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(TriageError::Validation("ticket id MUST be non-empty".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for TicketId {
    type Err = TriageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

impl Display for TicketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    #[default]
    Unclassified,
    Low,
    Medium,
    High,
    Extreme,
    Unknown,
}

impl Urgency {
    /// The four labels the classification service can assign.
    pub const CLASSIFIED: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Extreme];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unclassified => "unclassified",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Extreme => "extreme",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unclassified" => Some(Self::Unclassified),
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "extreme" => Some(Self::Extreme),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Map a label emitted by the classification service. Anything outside the
    /// four known classes is not a usable prediction.
    #[must_use]
    pub fn from_service_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_ascii_lowercase();
        Self::CLASSIFIED.into_iter().find(|urgency| urgency.as_str() == normalized)
    }

    #[must_use]
    pub fn display_label(self) -> &'static str {
        match self {
            Self::Unclassified => "Not Determined",
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Extreme => "Extreme",
            Self::Unknown => "Unknown",
        }
    }

    #[must_use]
    pub fn is_classified(self) -> bool {
        Self::CLASSIFIED.contains(&self)
    }

    /// Ordering used by the explicit urgency sort, most severe first.
    #[must_use]
    pub fn severity_rank(self) -> u8 {
        match self {
            Self::Extreme => 5,
            Self::High => 4,
            Self::Medium => 3,
            Self::Low => 2,
            Self::Unknown => 1,
            Self::Unclassified => 0,
        }
    }
}

/// Confidence percentage held in hundredths of a percent, so `91.25%` is
/// stored as `9125`. Serialized as a bare percentage number.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Confidence(u16);

impl Confidence {
    pub const ZERO: Self = Self(0);
    pub const MAX_HUNDREDTHS: u16 = 10_000;

    /// Convert a service score in `[0, 1]`, rounding to two decimal places of
    /// percentage.
    #[must_use]
    pub fn from_score(score: f64) -> Option<Self> {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return None;
        }
        Some(Self::from_scaled(score * 10_000.0))
    }

    #[must_use]
    pub fn from_percent(percent: f64) -> Option<Self> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return None;
        }
        Some(Self::from_scaled(percent * 100.0))
    }

    #[must_use]
    pub fn from_hundredths(hundredths: u16) -> Option<Self> {
        (hundredths <= Self::MAX_HUNDREDTHS).then_some(Self(hundredths))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_scaled(scaled: f64) -> Self {
        let rounded = scaled.round().clamp(0.0, f64::from(Self::MAX_HUNDREDTHS));
        Self(rounded as u16)
    }

    #[must_use]
    pub fn hundredths(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn percent(self) -> f64 {
        f64::from(self.0) / 100.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Confidence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let whole = self.0 / 100;
        let fraction = self.0 % 100;
        if fraction == 0 {
            write!(f, "{whole}%")
        } else if fraction % 10 == 0 {
            write!(f, "{whole}.{}%", fraction / 10)
        } else {
            write!(f, "{whole}.{fraction:02}%")
        }
    }
}

impl Serialize for Confidence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.percent())
    }
}

impl<'de> Deserialize<'de> for Confidence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let percent = f64::deserialize(deserializer)?;
        Self::from_percent(percent).ok_or_else(|| {
            serde::de::Error::custom(format!("confidence {percent} is outside [0, 100]"))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TicketRecord {
    pub id: TicketId,
    pub customer: String,
    pub message: String,
    #[serde(default)]
    pub urgency: Urgency,
    #[serde(default)]
    pub confidence: Confidence,
    /// Follow-up flag, independent of classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation: Option<bool>,
}

impl TicketRecord {
    #[must_use]
    pub fn new(id: TicketId, customer: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            customer: customer.into(),
            message: message.into(),
            urgency: Urgency::Unclassified,
            confidence: Confidence::ZERO,
            annotation: None,
        }
    }

    /// Validate one ticket against the record invariants.
    ///
    /// # Errors
    /// Returns [`TriageError::Validation`] when the id or customer is blank, or
    /// when a confidence is carried by a ticket without a usable prediction.
    pub fn validate(&self) -> Result<(), TriageError> {
        if self.id.as_str().trim().is_empty() {
            return Err(TriageError::Validation("ticket id MUST be non-empty".to_string()));
        }

        if self.customer.trim().is_empty() {
            return Err(TriageError::Validation("customer MUST be non-empty".to_string()));
        }

        if matches!(self.urgency, Urgency::Unclassified | Urgency::Unknown)
            && !self.confidence.is_zero()
        {
            return Err(TriageError::Validation(format!(
                "confidence MUST be 0 for {} tickets",
                self.urgency.as_str()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn is_classified(&self) -> bool {
        self.urgency.is_classified()
    }

    pub(crate) fn apply_prediction(&mut self, prediction: Prediction) {
        self.urgency = prediction.urgency;
        self.confidence = prediction.confidence;
    }

    pub(crate) fn clear_classification(&mut self) {
        self.urgency = Urgency::Unclassified;
        self.confidence = Confidence::ZERO;
    }
}

/// The dashboard pages that each own an independent ticket collection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PageScope {
    SupportTickets,
    Customers,
    UrgencyLevels,
}

impl PageScope {
    pub const ALL: [Self; 3] = [Self::SupportTickets, Self::Customers, Self::UrgencyLevels];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SupportTickets => "support_tickets",
            Self::Customers => "customers",
            Self::UrgencyLevels => "urgency_levels",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().replace('-', "_").as_str() {
            "support_tickets" => Some(Self::SupportTickets),
            "customers" => Some(Self::Customers),
            "urgency_levels" => Some(Self::UrgencyLevels),
            _ => None,
        }
    }

    #[must_use]
    pub fn records_key(self) -> String {
        format!("{}_records", self.as_str())
    }

    #[must_use]
    pub fn reset_flag_key(self) -> String {
        format!("{}_reset_visible", self.as_str())
    }

    /// Only the upload page shows a reset button.
    #[must_use]
    pub fn has_reset_flag(self) -> bool {
        self == Self::UrgencyLevels
    }
}

impl Display for PageScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
