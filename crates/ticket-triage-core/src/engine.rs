use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classification::merge_with_report;
use crate::summary::reset_classification as clear_classifications;
use crate::{
    summarize, BatchId, BatchTicket, ClassificationBatch, ClassificationClient,
    ClassificationError, ClassificationResponse, IngestRow, PageScope, RecordCollection,
    SelectionSet, SummaryScope, TicketId, TicketPage, TicketRecord, TriageError, Upserted,
    UrgencySummary, ViewQuery,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PersistError {
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
    #[error("persistence write failed: {0}")]
    Write(String),
}

/// Durable mirror of one page's records and reset flag.
///
/// `load` reports a missing or undecodable entry as `Ok(None)`. Writes are
/// best effort from the engine's point of view: an error is logged and the
/// in-memory mutation stands.
pub trait Persistence {
    /// # Errors
    /// Returns [`PersistError::Unavailable`] when storage cannot be reached.
    fn load(&self, scope: PageScope) -> Result<Option<RecordCollection>, PersistError>;

    /// # Errors
    /// Returns a [`PersistError`] when the snapshot cannot be written.
    fn save(&self, scope: PageScope, records: &RecordCollection) -> Result<(), PersistError>;

    /// # Errors
    /// Returns a [`PersistError`] when the entry cannot be removed.
    fn clear(&self, scope: PageScope) -> Result<(), PersistError>;

    /// # Errors
    /// Returns [`PersistError::Unavailable`] when storage cannot be reached.
    fn load_reset_flag(&self, scope: PageScope) -> Result<Option<bool>, PersistError>;

    /// # Errors
    /// Returns a [`PersistError`] when the flag cannot be written.
    fn save_reset_flag(&self, scope: PageScope, visible: bool) -> Result<(), PersistError>;
}

/// Keeps everything in memory only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPersistence;

impl Persistence for NoPersistence {
    fn load(&self, _scope: PageScope) -> Result<Option<RecordCollection>, PersistError> {
        Ok(None)
    }

    fn save(&self, _scope: PageScope, _records: &RecordCollection) -> Result<(), PersistError> {
        Ok(())
    }

    fn clear(&self, _scope: PageScope) -> Result<(), PersistError> {
        Ok(())
    }

    fn load_reset_flag(&self, _scope: PageScope) -> Result<Option<bool>, PersistError> {
        Ok(None)
    }

    fn save_reset_flag(&self, _scope: PageScope, _visible: bool) -> Result<(), PersistError> {
        Ok(())
    }
}

impl<P: Persistence + ?Sized> Persistence for &P {
    fn load(&self, scope: PageScope) -> Result<Option<RecordCollection>, PersistError> {
        (**self).load(scope)
    }

    fn save(&self, scope: PageScope, records: &RecordCollection) -> Result<(), PersistError> {
        (**self).save(scope, records)
    }

    fn clear(&self, scope: PageScope) -> Result<(), PersistError> {
        (**self).clear(scope)
    }

    fn load_reset_flag(&self, scope: PageScope) -> Result<Option<bool>, PersistError> {
        (**self).load_reset_flag(scope)
    }

    fn save_reset_flag(&self, scope: PageScope, visible: bool) -> Result<(), PersistError> {
        (**self).save_reset_flag(scope, visible)
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FeedError {
    #[error("ticket feed unreachable: {0}")]
    Transport(String),
    #[error("ticket feed returned an unusable body: {0}")]
    MalformedBody(String),
}

/// Upstream source of the default ticket list for a page with nothing persisted.
pub trait TicketFeed {
    /// # Errors
    /// Returns a [`FeedError`] when the feed cannot be fetched or decoded.
    fn fetch(&self) -> Result<Vec<TicketRecord>, FeedError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    Busy { batch_id: BatchId },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClassificationOutcome {
    pub batch_id: BatchId,
    pub requested: usize,
    pub applied: usize,
    /// Positions the service left without a prediction.
    pub padded: usize,
    /// Batch tickets removed or edited before the response arrived.
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "target", content = "ids", rename_all = "snake_case")]
pub enum ResetTarget {
    Selected,
    All,
    Ids(Vec<TicketId>),
}

/// Single owner of one page's records, selection, busy phase and reset flag.
/// Every mutation runs to completion and then mirrors the full snapshot to
/// `persistence`.
#[derive(Debug)]
pub struct TriageEngine<P: Persistence> {
    scope: PageScope,
    records: RecordCollection,
    selection: SelectionSet,
    phase: EnginePhase,
    reset_visible: bool,
    persistence: P,
}

impl<P: Persistence> TriageEngine<P> {
    /// Empty engine; nothing is read from `persistence`.
    pub fn new(scope: PageScope, persistence: P) -> Self {
        Self {
            scope,
            records: RecordCollection::new(),
            selection: SelectionSet::new(),
            phase: EnginePhase::Idle,
            reset_visible: false,
            persistence,
        }
    }

    /// Restore a page from `persistence`, falling back to `feed` (and then to an
    /// empty collection) when nothing usable was stored.
    pub fn rehydrate(scope: PageScope, persistence: P, feed: Option<&dyn TicketFeed>) -> Self {
        let mut engine = Self::new(scope, persistence);

        let stored = engine.persistence.load(scope).unwrap_or_else(|err| {
            warn!(page = %scope, error = %err, "failed to load persisted tickets");
            None
        });

        match (stored, feed) {
            (Some(records), _) => {
                debug!(page = %scope, count = records.len(), "rehydrated tickets from storage");
                engine.records = records;
            }
            (None, Some(feed)) => match feed.fetch() {
                Ok(fetched) => {
                    engine.records = RecordCollection::from_records(
                        fetched.into_iter().filter(|record| keep_valid(scope, record)),
                    );
                    info!(page = %scope, count = engine.records.len(), "seeded tickets from feed");
                    engine.persist();
                }
                Err(err) => {
                    warn!(page = %scope, error = %err, "ticket feed failed, starting empty");
                }
            },
            (None, None) => {}
        }

        if scope.has_reset_flag() {
            engine.reset_visible = engine
                .persistence
                .load_reset_flag(scope)
                .unwrap_or_else(|err| {
                    warn!(page = %scope, error = %err, "failed to load reset flag");
                    None
                })
                .unwrap_or(false);
        }

        engine
    }

    #[must_use]
    pub fn scope(&self) -> PageScope {
        self.scope
    }

    /// Read-only view of the canonical collection.
    #[must_use]
    pub fn snapshot(&self) -> &RecordCollection {
        &self.records
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    #[must_use]
    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        matches!(self.phase, EnginePhase::Busy { .. })
    }

    #[must_use]
    pub fn reset_visible(&self) -> bool {
        self.reset_visible
    }

    #[must_use]
    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    #[must_use]
    pub fn view(&self, query: &ViewQuery) -> TicketPage {
        self.records.view(query)
    }

    #[must_use]
    pub fn summary(&self, selection_only: bool) -> UrgencySummary {
        let scope = if selection_only {
            SummaryScope::Selection(&self.selection)
        } else {
            SummaryScope::Classified
        };
        summarize(&self.records, scope)
    }

    /// # Errors
    /// Returns [`TriageError::Validation`] when `record` breaks a record invariant.
    pub fn upsert(&mut self, record: TicketRecord) -> Result<Upserted, TriageError> {
        record.validate()?;
        let outcome = self.records.upsert(record);
        self.persist();
        Ok(outcome)
    }

    /// Append a manually entered ticket with a fresh id.
    ///
    /// # Errors
    /// Returns [`TriageError::Validation`] when customer or message is blank.
    pub fn add_ticket(
        &mut self,
        customer: &str,
        message: &str,
    ) -> Result<TicketRecord, TriageError> {
        require_text("customer", customer)?;
        require_text("message", message)?;

        let record = TicketRecord::new(TicketId::generate(), customer.trim(), message);
        self.records.upsert(record.clone());
        self.persist();
        Ok(record)
    }

    /// Replace customer and message in place. The previous prediction no longer
    /// describes the text, so the ticket goes back to unclassified.
    ///
    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] or [`TriageError::Validation`].
    pub fn edit_ticket(
        &mut self,
        id: &TicketId,
        customer: &str,
        message: &str,
    ) -> Result<TicketRecord, TriageError> {
        require_text("customer", customer)?;
        require_text("message", message)?;

        let record =
            self.records.get_mut(id).ok_or_else(|| TriageError::UnknownTicket(id.clone()))?;
        customer.trim().clone_into(&mut record.customer);
        message.clone_into(&mut record.message);
        record.clear_classification();
        let updated = record.clone();

        self.persist();
        Ok(updated)
    }

    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] when `id` is not present.
    pub fn set_annotation(
        &mut self,
        id: &TicketId,
        annotation: Option<bool>,
    ) -> Result<TicketRecord, TriageError> {
        let record =
            self.records.get_mut(id).ok_or_else(|| TriageError::UnknownTicket(id.clone()))?;
        record.annotation = annotation;
        let updated = record.clone();

        self.persist();
        Ok(updated)
    }

    /// Delete a ticket and evict it from the selection.
    ///
    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] when `id` is not present.
    pub fn remove(&mut self, id: &TicketId) -> Result<TicketRecord, TriageError> {
        let removed =
            self.records.remove(id).ok_or_else(|| TriageError::UnknownTicket(id.clone()))?;
        self.selection.evict(id);
        self.persist();
        Ok(removed)
    }

    /// Seed the page from uploaded rows, each under a fresh id. With `replace`
    /// the page is cleared first. Returns the number of tickets added.
    pub fn ingest(&mut self, rows: impl IntoIterator<Item = IngestRow>, replace: bool) -> usize {
        if replace {
            self.records.clear();
            self.selection.clear();
        }

        let mut added = 0;
        for row in rows {
            if row.customer.trim().is_empty() {
                debug!(page = %self.scope, "dropping ingest row without customer");
                continue;
            }
            let record = TicketRecord::new(TicketId::generate(), row.customer.trim(), row.message);
            self.records.upsert(record);
            added += 1;
        }

        self.persist();
        if self.scope.has_reset_flag() && !self.records.is_empty() {
            self.set_reset_visible(true);
        }
        info!(page = %self.scope, added, replace, "ingested tickets");
        added
    }

    /// Clear records, selection and the persisted mirror.
    pub fn reset_all(&mut self) {
        self.records.clear();
        self.selection.clear();
        if let Err(err) = self.persistence.clear(self.scope) {
            warn!(page = %self.scope, error = %err, "failed to clear persisted tickets");
        }
        if self.scope.has_reset_flag() {
            self.set_reset_visible(false);
        }
    }

    /// Put the targeted tickets back to unclassified and return how many were targeted.
    ///
    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] when an explicit id is not
    /// present; nothing is changed in that case.
    pub fn reset_classification(&mut self, target: &ResetTarget) -> Result<usize, TriageError> {
        let ids: Vec<TicketId> = match target {
            ResetTarget::Selected => self.selection.iter().cloned().collect(),
            ResetTarget::All => self.records.ids().cloned().collect(),
            ResetTarget::Ids(ids) => {
                if let Some(missing) = ids.iter().find(|id| !self.records.contains(id)) {
                    return Err(TriageError::UnknownTicket(missing.clone()));
                }
                ids.clone()
            }
        };

        self.records = clear_classifications(&self.records, &ids);
        self.persist();
        Ok(ids.len())
    }

    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] when selecting an id that is not present.
    pub fn toggle(&mut self, id: &TicketId) -> Result<bool, TriageError> {
        self.selection.toggle(id, &self.records)
    }

    /// # Errors
    /// Returns [`TriageError::UnknownTicket`] for the first id that is not present.
    pub fn set_selection(&mut self, ids: &[TicketId]) -> Result<(), TriageError> {
        self.selection.set_all(ids, &self.records)
    }

    pub fn select_all(&mut self) {
        self.selection.select_all(&self.records);
    }

    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    /// Snapshot the selected tickets, in collection order, as the next batch and
    /// mark the engine busy until [`TriageEngine::complete_classification`].
    ///
    /// # Errors
    /// Returns [`TriageError::Busy`] while another batch is outstanding and
    /// [`TriageError::EmptySelection`] when nothing is selected.
    pub fn begin_classification(&mut self) -> Result<ClassificationBatch, TriageError> {
        if let EnginePhase::Busy { batch_id } = self.phase {
            warn!(page = %self.scope, %batch_id, "classification rejected, batch in flight");
            return Err(TriageError::Busy);
        }
        if self.selection.is_empty() {
            return Err(TriageError::EmptySelection);
        }

        let tickets = self
            .selection
            .ordered_records(&self.records)
            .into_iter()
            .map(BatchTicket::from)
            .collect::<Vec<_>>();
        let batch = ClassificationBatch::new(tickets);
        self.phase = EnginePhase::Busy { batch_id: batch.batch_id() };
        debug!(
            page = %self.scope,
            batch_id = %batch.batch_id(),
            size = batch.len(),
            "classification batch started"
        );
        Ok(batch)
    }

    /// Apply the result of the outstanding batch. Success merges the response;
    /// failure leaves the records untouched. Either way the engine is idle again.
    ///
    /// # Errors
    /// Returns [`TriageError::StaleBatch`] when `batch` is not the outstanding
    /// one, and [`TriageError::Classification`] when `result` is a failure.
    pub fn complete_classification(
        &mut self,
        batch: &ClassificationBatch,
        result: Result<ClassificationResponse, ClassificationError>,
    ) -> Result<ClassificationOutcome, TriageError> {
        match self.phase {
            EnginePhase::Busy { batch_id } if batch_id == batch.batch_id() => {}
            _ => return Err(TriageError::StaleBatch(batch.batch_id())),
        }
        self.phase = EnginePhase::Idle;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                warn!(
                    page = %self.scope,
                    batch_id = %batch.batch_id(),
                    error = %err,
                    "classification failed, tickets unchanged"
                );
                return Err(err.into());
            }
        };

        let padded = response.padded() + batch.len().saturating_sub(response.len());
        let (merged, report) = merge_with_report(&self.records, batch, &response);
        self.records = merged;
        self.persist();

        let outcome = ClassificationOutcome {
            batch_id: batch.batch_id(),
            requested: batch.len(),
            applied: report.applied,
            padded,
            skipped: report.skipped,
        };
        info!(
            page = %self.scope,
            batch_id = %outcome.batch_id,
            requested = outcome.requested,
            applied = outcome.applied,
            padded = outcome.padded,
            skipped = outcome.skipped,
            "classification merged"
        );
        Ok(outcome)
    }

    /// Run both classification phases against `client` in one call.
    ///
    /// # Errors
    /// Propagates the errors of [`TriageEngine::begin_classification`] and
    /// [`TriageEngine::complete_classification`].
    pub fn classify_with<C: ClassificationClient + ?Sized>(
        &mut self,
        client: &C,
    ) -> Result<ClassificationOutcome, TriageError> {
        let batch = self.begin_classification()?;
        let result = client.classify(&batch.messages());
        self.complete_classification(&batch, result)
    }

    fn set_reset_visible(&mut self, visible: bool) {
        self.reset_visible = visible;
        if let Err(err) = self.persistence.save_reset_flag(self.scope, visible) {
            warn!(page = %self.scope, error = %err, "failed to persist reset flag");
        }
    }

    fn persist(&self) {
        if let Err(err) = self.persistence.save(self.scope, &self.records) {
            warn!(page = %self.scope, error = %err, "failed to persist tickets");
        }
    }
}

fn require_text(field: &str, value: &str) -> Result<(), TriageError> {
    if value.trim().is_empty() {
        return Err(TriageError::Validation(format!("{field} MUST be non-empty")));
    }
    Ok(())
}

fn keep_valid(scope: PageScope, record: &TicketRecord) -> bool {
    match record.validate() {
        Ok(()) => true,
        Err(err) => {
            warn!(
                page = %scope,
                ticket_id = %record.id,
                error = %err,
                "dropping invalid feed ticket"
            );
            false
        }
    }
}
