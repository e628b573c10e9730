use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use ticket_triage_client::{HttpClassificationClient, HttpTicketFeed};
use ticket_triage_core::{
    ClassificationClient, ClassificationOutcome, EnginePhase, IngestRow, PageScope, ResetTarget,
    TicketFeed, TicketId, TicketPage, TicketRecord, TriageEngine, TriageError, UrgencySummary,
    ViewQuery,
};
use ticket_triage_store_sqlite::{IntegrityReport, PageEntry, SchemaStatus, SqliteStore};
use tracing::info;

mod config;
mod retry;
mod write_behind;

pub use config::{
    TriageConfig, CLASSIFIER_URL_ENV, DB_PATH_ENV, DEFAULT_DB_PATH, DEFAULT_TIMEOUT_MS,
    FEED_URL_ENV, MAX_RETRIES_ENV, RETRY_DELAY_MS_ENV, TIMEOUT_MS_ENV,
};
pub use retry::{RetryPolicy, MAX_RETRIES_LIMIT, RETRY_DELAY_LIMIT_MS};
pub use write_behind::{PersistHandle, WriteBehind};

pub const API_CONTRACT_VERSION: &str = "api.v1";

/// One page's engine, persisting through the write-behind worker.
pub type PageSession = TriageEngine<PersistHandle>;

/// A page's session, rehydrated on first use under the page's own lock.
type PageSlot = Arc<Mutex<Option<PageSession>>>;

type SharedClassifier = Box<dyn ClassificationClient + Send + Sync>;
type SharedFeed = Box<dyn TicketFeed + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketTextRequest {
    pub customer: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationRequest {
    #[serde(default)]
    pub flag: Option<bool>,
}

/// Uploaded rows keyed by column header.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRequest {
    pub rows: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResult {
    pub received: usize,
    pub added: usize,
    pub dropped: usize,
    pub reset_visible: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionRequest {
    pub ids: Vec<TicketId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToggleRequest {
    pub id: TicketId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectionState {
    pub page: PageScope,
    pub ids: Vec<TicketId>,
    pub count: usize,
}

/// Selection to install before classifying. `None` classifies whatever the
/// page currently has selected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "select", content = "ids", rename_all = "snake_case")]
pub enum ClassifySelection {
    All,
    Ids(Vec<TicketId>),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SummaryTarget {
    #[default]
    Classified,
    Selection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResetClassificationResult {
    pub page: PageScope,
    pub reset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageState {
    pub page: PageScope,
    #[serde(flatten)]
    pub phase: EnginePhase,
    pub reset_visible: bool,
    pub ticket_count: usize,
    pub selected_count: usize,
}

/// Composition root: configuration, the write-behind worker, the HTTP
/// collaborators and one lazily rehydrated session per page.
pub struct TriageApi {
    config: TriageConfig,
    writer: WriteBehind,
    classifier: SharedClassifier,
    feed: Option<SharedFeed>,
    sessions: Mutex<BTreeMap<PageScope, PageSlot>>,
}

impl std::fmt::Debug for TriageApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageApi")
            .field("config", &self.config)
            .field("writer", &self.writer)
            .field("has_feed", &self.feed.is_some())
            .finish_non_exhaustive()
    }
}

impl TriageApi {
    /// Open the database and build HTTP collaborators from `config`.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn open(config: TriageConfig) -> Result<Self> {
        let classifier = HttpClassificationClient::new(&config.classifier_url, config.timeout());
        let feed = config
            .feed_url
            .as_ref()
            .map(|url| Box::new(HttpTicketFeed::new(url, config.timeout())) as SharedFeed);
        Self::with_collaborators(config, Box::new(classifier), feed)
    }

    /// Open the database with caller-provided collaborators.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated.
    pub fn with_collaborators(
        config: TriageConfig,
        classifier: SharedClassifier,
        feed: Option<SharedFeed>,
    ) -> Result<Self> {
        let writer = WriteBehind::open(&config.db_path).with_context(|| {
            format!("failed to open ticket database {}", config.db_path.display())
        })?;
        info!(
            db = %config.db_path.display(),
            classifier = %config.classifier_url,
            "triage api ready"
        );
        Ok(Self { config, writer, classifier, feed, sessions: Mutex::new(BTreeMap::new()) })
    }

    #[must_use]
    pub fn config(&self) -> &TriageConfig {
        &self.config
    }

    /// The registry lock only covers the slot lookup, never a rehydrate.
    fn slot(&self, scope: PageScope) -> Result<PageSlot> {
        let mut sessions =
            self.sessions.lock().map_err(|_| anyhow!("session registry poisoned"))?;
        Ok(Arc::clone(sessions.entry(scope).or_default()))
    }

    fn rehydrate(&self, scope: PageScope) -> PageSession {
        let feed = match scope {
            PageScope::SupportTickets => self.feed.as_deref().map(|feed| feed as &dyn TicketFeed),
            PageScope::Customers | PageScope::UrgencyLevels => None,
        };
        TriageEngine::rehydrate(scope, self.writer.handle(), feed)
    }

    /// Run `operation` against the page's session while holding its lock. The
    /// first call for a page rehydrates it, which may fetch the ticket feed;
    /// only callers of that page wait for it.
    ///
    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn with_page<T>(
        &self,
        scope: PageScope,
        operation: impl FnOnce(&mut PageSession) -> T,
    ) -> Result<T> {
        let slot = self.slot(scope)?;
        let mut session = slot.lock().map_err(|_| anyhow!("page session poisoned: {scope}"))?;
        let engine = session.get_or_insert_with(|| self.rehydrate(scope));
        Ok(operation(engine))
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn list_tickets(&self, scope: PageScope, query: &ViewQuery) -> Result<TicketPage> {
        self.with_page(scope, |engine| engine.view(query))
    }

    /// Every ticket ordered most severe first.
    ///
    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn tickets_by_urgency(&self, scope: PageScope) -> Result<Vec<TicketRecord>> {
        self.with_page(scope, |engine| {
            engine.snapshot().sorted_by_urgency().into_iter().cloned().collect()
        })
    }

    /// # Errors
    /// Returns an error when customer or message is blank.
    pub fn add_ticket(
        &self,
        scope: PageScope,
        request: &TicketTextRequest,
    ) -> Result<TicketRecord> {
        self.with_page(scope, |engine| engine.add_ticket(&request.customer, &request.message))?
            .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the ticket is unknown or the new text is blank.
    pub fn edit_ticket(
        &self,
        scope: PageScope,
        id: &TicketId,
        request: &TicketTextRequest,
    ) -> Result<TicketRecord> {
        self.with_page(scope, |engine| {
            engine.edit_ticket(id, &request.customer, &request.message)
        })?
        .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the ticket is unknown.
    pub fn set_annotation(
        &self,
        scope: PageScope,
        id: &TicketId,
        request: &AnnotationRequest,
    ) -> Result<TicketRecord> {
        self.with_page(scope, |engine| engine.set_annotation(id, request.flag))?
            .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the ticket is unknown.
    pub fn remove_ticket(&self, scope: PageScope, id: &TicketId) -> Result<TicketRecord> {
        self.with_page(scope, |engine| engine.remove(id))?.map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn ingest(&self, scope: PageScope, request: &IngestRequest) -> Result<IngestResult> {
        let rows = request.rows.iter().filter_map(IngestRow::from_columns).collect::<Vec<_>>();
        let received = request.rows.len();
        self.with_page(scope, |engine| {
            let added = engine.ingest(rows, request.replace);
            IngestResult {
                received,
                added,
                dropped: received.saturating_sub(added),
                reset_visible: engine.reset_visible(),
            }
        })
    }

    /// # Errors
    /// Returns an error when `id` is not on the page.
    pub fn toggle_selection(&self, scope: PageScope, id: &TicketId) -> Result<SelectionState> {
        self.with_page(scope, |engine| {
            engine.toggle(id)?;
            Ok::<_, TriageError>(selection_state(engine))
        })?
        .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when any id is not on the page; the selection is then unchanged.
    pub fn set_selection(&self, scope: PageScope, ids: &[TicketId]) -> Result<SelectionState> {
        self.with_page(scope, |engine| {
            engine.set_selection(ids)?;
            Ok::<_, TriageError>(selection_state(engine))
        })?
        .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn select_all(&self, scope: PageScope) -> Result<SelectionState> {
        self.with_page(scope, |engine| {
            engine.select_all();
            selection_state(engine)
        })
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn clear_selection(&self, scope: PageScope) -> Result<SelectionState> {
        self.with_page(scope, |engine| {
            engine.clear_selection();
            selection_state(engine)
        })
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn selection(&self, scope: PageScope) -> Result<SelectionState> {
        self.with_page(scope, |engine| selection_state(engine))
    }

    /// Classify the page's selection. The page lock is released while the
    /// service is called; other requests see the page as busy meanwhile.
    ///
    /// # Errors
    /// Returns a wrapped `TriageError` when the page is busy, nothing is
    /// selected, an explicit id is unknown, or classification fails.
    pub fn classify(
        &self,
        scope: PageScope,
        selection: Option<&ClassifySelection>,
    ) -> Result<ClassificationOutcome> {
        let batch = self.with_page(scope, |engine| {
            if !engine.is_busy() {
                match selection {
                    Some(ClassifySelection::All) => engine.select_all(),
                    Some(ClassifySelection::Ids(ids)) => engine.set_selection(ids)?,
                    None => {}
                }
            }
            engine.begin_classification()
        })??;

        let result = self.config.retry.run_batch(self.classifier.as_ref(), &batch);
        self.with_page(scope, |engine| engine.complete_classification(&batch, result))?
            .map_err(Into::into)
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn summary(&self, scope: PageScope, target: SummaryTarget) -> Result<UrgencySummary> {
        self.with_page(scope, |engine| engine.summary(target == SummaryTarget::Selection))
    }

    /// # Errors
    /// Returns an error when an explicit id is unknown; nothing is reset then.
    pub fn reset_classification(
        &self,
        scope: PageScope,
        target: &ResetTarget,
    ) -> Result<ResetClassificationResult> {
        let reset = self.with_page(scope, |engine| engine.reset_classification(target))??;
        Ok(ResetClassificationResult { page: scope, reset })
    }

    /// Clear the page and its persisted mirror.
    ///
    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn reset_page(&self, scope: PageScope) -> Result<PageState> {
        self.with_page(scope, |engine| {
            engine.reset_all();
            page_state(engine)
        })
    }

    /// # Errors
    /// Returns an error when the session lock is poisoned.
    pub fn page_state(&self, scope: PageScope) -> Result<PageState> {
        self.with_page(scope, |engine| page_state(engine))
    }

    /// Block until every queued write has reached the database.
    ///
    /// # Errors
    /// Returns an error when the persistence worker has stopped.
    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    /// Writes that failed in the background since startup.
    #[must_use]
    pub fn failed_writes(&self) -> usize {
        self.writer.failed_writes()
    }

    fn open_store(&self) -> Result<SqliteStore> {
        self.writer.flush()?;
        SqliteStore::open(&self.config.db_path)
    }

    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        migrate_store(&mut self.open_store()?, dry_run)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.open_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the checks cannot be run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the database cannot be queried.
    pub fn list_pages(&self) -> Result<Vec<PageEntry>> {
        self.open_store()?.list_pages()
    }

    /// Drain queued writes and stop the persistence worker.
    ///
    /// # Errors
    /// Returns an error when the worker did not stop cleanly.
    pub fn shutdown(self) -> Result<()> {
        let Self { writer, sessions, .. } = self;
        drop(sessions);
        writer.shutdown()
    }
}

/// Apply pending migrations on an already opened store.
///
/// # Errors
/// Returns an error when migration planning or execution fails.
pub fn migrate_store(store: &mut SqliteStore, dry_run: bool) -> Result<MigrateResult> {
    let before = store.schema_status()?;
    if dry_run {
        return Ok(MigrateResult {
            dry_run: true,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: None,
            up_to_date: None,
        });
    }

    let planned_versions = before.pending_versions;
    store.migrate()?;
    let after = store.schema_status()?;
    Ok(MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: planned_versions,
        inferred_from_legacy: before.inferred_from_legacy,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    })
}

fn selection_state(engine: &PageSession) -> SelectionState {
    let ids = engine.selection().iter().cloned().collect::<Vec<_>>();
    SelectionState { page: engine.scope(), count: ids.len(), ids }
}

fn page_state(engine: &PageSession) -> PageState {
    PageState {
        page: engine.scope(),
        phase: engine.phase(),
        reset_visible: engine.reset_visible(),
        ticket_count: engine.snapshot().len(),
        selected_count: engine.selection().len(),
    }
}
