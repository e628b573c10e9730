use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::warn;
use ulid::Ulid;

use crate::{Confidence, RecordCollection, TicketId, TicketRecord, Urgency};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ClassificationError {
    #[error("classification service unreachable: {0}")]
    Transport(String),
    #[error("classification service responded with status {status}")]
    Service { status: u16 },
    #[error("classification response body is malformed: {0}")]
    MalformedBody(String),
    #[error("classification client panicked: {0}")]
    Panicked(String),
}

impl ClassificationError {
    /// Failures worth another attempt. A service that answered, even with an
    /// error status, is not retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// One round trip to the urgency prediction service.
pub trait ClassificationClient {
    /// Classify `messages` and return predictions aligned to them by position.
    ///
    /// # Errors
    /// Returns a [`ClassificationError`] when the service cannot be reached or
    /// does not answer with a usable body. A short or long list of predictions
    /// is not an error.
    fn classify(&self, messages: &[String]) -> Result<ClassificationResponse, ClassificationError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct BatchId(pub Ulid);

impl BatchId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id/message pair captured when a batch is built. The message is kept so
/// the merge can tell whether the ticket text changed while the batch was out.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchTicket {
    pub id: TicketId,
    pub message: String,
}

impl From<&TicketRecord> for BatchTicket {
    fn from(record: &TicketRecord) -> Self {
        Self { id: record.id.clone(), message: record.message.clone() }
    }
}

/// Ordered tickets submitted together. Position `i` of the request, and of the
/// response applied to it, always refers to `tickets[i]`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationBatch {
    batch_id: BatchId,
    tickets: Vec<BatchTicket>,
}

impl ClassificationBatch {
    pub(crate) fn new(tickets: Vec<BatchTicket>) -> Self {
        Self { batch_id: BatchId::new(), tickets }
    }

    #[must_use]
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    #[must_use]
    pub fn tickets(&self) -> &[BatchTicket] {
        &self.tickets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Request payload, in batch order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.tickets.iter().map(|ticket| ticket.message.clone()).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TicketId> {
        self.tickets.iter().map(|ticket| &ticket.id)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Prediction {
    pub urgency: Urgency,
    pub confidence: Confidence,
}

impl Prediction {
    pub const UNKNOWN: Self = Self { urgency: Urgency::Unknown, confidence: Confidence::ZERO };

    /// Interpret one raw service entry. A missing or unrecognised class, or a
    /// score outside `[0, 1]`, yields [`Prediction::UNKNOWN`].
    #[must_use]
    pub fn from_service(class: Option<&str>, score: Option<f64>) -> Self {
        let urgency = class.and_then(Urgency::from_service_label);
        let confidence = score.and_then(Confidence::from_score);
        match (urgency, confidence) {
            (Some(urgency), Some(confidence)) => Self { urgency, confidence },
            _ => Self::UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ClassificationResponse {
    predictions: Vec<Prediction>,
    /// Positions filled with [`Prediction::UNKNOWN`] because the service
    /// returned fewer entries than requested.
    #[serde(default)]
    padded: usize,
}

impl ClassificationResponse {
    #[must_use]
    pub fn new(predictions: Vec<Prediction>) -> Self {
        Self { predictions, padded: 0 }
    }

    #[must_use]
    pub fn predictions(&self) -> &[Prediction] {
        &self.predictions
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    #[must_use]
    pub fn padded(&self) -> usize {
        self.padded
    }

    /// Make the response exactly `expected` long: missing tail positions become
    /// unknown, surplus entries are dropped.
    #[must_use]
    pub fn align_to(mut self, expected: usize) -> Self {
        let actual = self.predictions.len();
        if actual < expected {
            warn!(expected, actual, "classification response shorter than request, padding");
            self.predictions.resize(expected, Prediction::UNKNOWN);
            self.padded += expected - actual;
        } else if actual > expected {
            warn!(expected, actual, "classification response longer than request, truncating");
            self.predictions.truncate(expected);
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub(crate) struct MergeReport {
    pub applied: usize,
    pub skipped: usize,
}

/// Fold `response` into a copy of `collection`, pairing `batch.tickets()[i]`
/// with prediction `i`. Records outside the batch are untouched, as are batch
/// tickets that were removed or whose message changed since the batch was built.
#[must_use]
pub fn merge(
    collection: &RecordCollection,
    batch: &ClassificationBatch,
    response: &ClassificationResponse,
) -> RecordCollection {
    merge_with_report(collection, batch, response).0
}

pub(crate) fn merge_with_report(
    collection: &RecordCollection,
    batch: &ClassificationBatch,
    response: &ClassificationResponse,
) -> (RecordCollection, MergeReport) {
    let aligned = response.clone().align_to(batch.len());
    let mut merged = collection.clone();
    let mut report = MergeReport::default();

    for (ticket, prediction) in batch.tickets().iter().zip(aligned.predictions()) {
        match merged.get_mut(&ticket.id) {
            Some(record) if record.message == ticket.message => {
                record.apply_prediction(*prediction);
                report.applied += 1;
            }
            Some(_) => {
                warn!(ticket_id = %ticket.id, "ticket edited while batch in flight, skipping");
                report.skipped += 1;
            }
            None => report.skipped += 1,
        }
    }

    (merged, report)
}
