//! Write-behind persistence.
//!
//! A dedicated worker thread owns the only `SqliteStore` connection. Engines
//! talk to it through [`PersistHandle`], which enqueues full snapshots and
//! returns immediately. Loads travel through the same queue, so a load
//! observes every write enqueued before it.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use anyhow::{anyhow, Context, Result};
use ticket_triage_core::{PageScope, PersistError, Persistence, RecordCollection};
use ticket_triage_store_sqlite::SqliteStore;
use tracing::{debug, warn};

type Reply<T> = mpsc::Sender<Result<T, PersistError>>;

enum StoreCommand {
    Save { scope: PageScope, records: RecordCollection },
    Clear { scope: PageScope },
    SaveFlag { scope: PageScope, visible: bool },
    Load { scope: PageScope, reply: Reply<Option<RecordCollection>> },
    LoadFlag { scope: PageScope, reply: Reply<Option<bool>> },
    Flush { reply: mpsc::Sender<()> },
    Shutdown,
}

/// Owner of the persistence worker. Dropping it drains the queue and joins
/// the worker.
#[derive(Debug)]
pub struct WriteBehind {
    sender: mpsc::Sender<StoreCommand>,
    handle: Option<thread::JoinHandle<()>>,
    failed_writes: Arc<AtomicUsize>,
}

/// Cloneable [`Persistence`] endpoint backed by the worker queue.
#[derive(Debug, Clone)]
pub struct PersistHandle {
    sender: mpsc::Sender<StoreCommand>,
}

impl WriteBehind {
    /// Open and migrate the database at `db_path`, then hand the connection
    /// to a new worker.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or migrated, or the
    /// worker thread cannot be spawned.
    pub fn open(db_path: &Path) -> Result<Self> {
        let mut store = SqliteStore::open(db_path)?;
        store.migrate()?;
        Self::spawn(store)
    }

    /// # Errors
    /// Returns an error when the worker thread cannot be spawned.
    pub fn spawn(store: SqliteStore) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<StoreCommand>();
        let failed_writes = Arc::new(AtomicUsize::new(0));
        let worker_failures = Arc::clone(&failed_writes);

        let handle = thread::Builder::new()
            .name("ticket-triage-store".to_string())
            .spawn(move || run_worker(&store, &receiver, &worker_failures))
            .context("failed to spawn persistence worker")?;

        Ok(Self { sender, handle: Some(handle), failed_writes })
    }

    #[must_use]
    pub fn handle(&self) -> PersistHandle {
        PersistHandle { sender: self.sender.clone() }
    }

    /// Writes that reached the worker but failed in `SQLite`.
    #[must_use]
    pub fn failed_writes(&self) -> usize {
        self.failed_writes.load(Ordering::Relaxed)
    }

    /// Block until every command enqueued so far has been applied.
    ///
    /// # Errors
    /// Returns an error when the worker has stopped.
    pub fn flush(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.sender
            .send(StoreCommand::Flush { reply })
            .map_err(|_| anyhow!("persistence worker has stopped"))?;
        done.recv().map_err(|_| anyhow!("persistence worker stopped before flushing"))
    }

    /// Drain outstanding writes, close the connection and join the worker.
    ///
    /// # Errors
    /// Returns an error when the worker thread panicked.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // A closed channel means the worker is already gone; join reports why.
        let _ = self.sender.send(StoreCommand::Shutdown);
        handle.join().map_err(|_| anyhow!("persistence worker panicked"))
    }
}

impl Drop for WriteBehind {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "persistence worker did not shut down cleanly");
        }
    }
}

fn run_worker(
    store: &SqliteStore,
    receiver: &mpsc::Receiver<StoreCommand>,
    failed_writes: &AtomicUsize,
) {
    let record_failure = |scope: PageScope, result: Result<()>| {
        if let Err(err) = result {
            failed_writes.fetch_add(1, Ordering::Relaxed);
            warn!(
                page = %scope,
                error = %format!("{err:#}"),
                "write-behind persistence failed"
            );
        }
    };

    while let Ok(command) = receiver.recv() {
        match command {
            StoreCommand::Save { scope, records } => {
                record_failure(scope, store.save_page(scope, &records));
            }
            StoreCommand::Clear { scope } => {
                record_failure(scope, store.clear_page(scope).map(|_| ()));
            }
            StoreCommand::SaveFlag { scope, visible } => {
                record_failure(scope, store.save_reset_flag(scope, visible));
            }
            StoreCommand::Load { scope, reply } => {
                let result = store
                    .load_page(scope)
                    .map_err(|err| PersistError::Unavailable(format!("{err:#}")));
                let _ = reply.send(result);
            }
            StoreCommand::LoadFlag { scope, reply } => {
                let result = store
                    .load_reset_flag(scope)
                    .map_err(|err| PersistError::Unavailable(format!("{err:#}")));
                let _ = reply.send(result);
            }
            StoreCommand::Flush { reply } => {
                let _ = reply.send(());
            }
            StoreCommand::Shutdown => break,
        }
    }
    debug!("persistence worker stopped");
}

impl PersistHandle {
    fn enqueue(&self, command: StoreCommand) -> Result<(), PersistError> {
        self.sender
            .send(command)
            .map_err(|_| PersistError::Write("persistence worker has stopped".to_string()))
    }

    fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, PersistError> {
        let (reply, response) = mpsc::channel();
        self.sender.send(build(reply)).map_err(|_| {
            PersistError::Unavailable("persistence worker has stopped".to_string())
        })?;
        response.recv().map_err(|_| {
            PersistError::Unavailable("persistence worker stopped before replying".to_string())
        })?
    }
}

impl Persistence for PersistHandle {
    fn load(&self, scope: PageScope) -> Result<Option<RecordCollection>, PersistError> {
        self.request(|reply| StoreCommand::Load { scope, reply })
    }

    fn save(&self, scope: PageScope, records: &RecordCollection) -> Result<(), PersistError> {
        self.enqueue(StoreCommand::Save { scope, records: records.clone() })
    }

    fn clear(&self, scope: PageScope) -> Result<(), PersistError> {
        self.enqueue(StoreCommand::Clear { scope })
    }

    fn load_reset_flag(&self, scope: PageScope) -> Result<Option<bool>, PersistError> {
        self.request(|reply| StoreCommand::LoadFlag { scope, reply })
    }

    fn save_reset_flag(&self, scope: PageScope, visible: bool) -> Result<(), PersistError> {
        self.enqueue(StoreCommand::SaveFlag { scope, visible })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use ticket_triage_core::{TicketId, TicketRecord, TriageEngine};
    use ulid::Ulid;

    fn unique_temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ticket-triage-{label}-{}.sqlite3", Ulid::new()))
    }

    fn remove_db(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
        }
    }

    fn record(id: &str, customer: &str) -> TicketRecord {
        let id = TicketId::parse(id).unwrap_or_else(|err| panic!("invalid fixture id: {err}"));
        TicketRecord::new(id, customer, "message")
    }

    // Test IDs: TWB-001
    #[test]
    fn loads_observe_earlier_enqueued_writes() -> Result<()> {
        let db_path = unique_temp_db_path("write-behind");
        let writer = WriteBehind::open(&db_path)?;
        let handle = writer.handle();

        for count in 1..=20 {
            let records = RecordCollection::from_records(
                (0..count).map(|index| record(&index.to_string(), "Acme")),
            );
            handle.save(PageScope::Customers, &records)?;
        }
        handle.save_reset_flag(PageScope::UrgencyLevels, true)?;

        let loaded = handle.load(PageScope::Customers)?;
        assert_eq!(loaded.map(|collection| collection.len()), Some(20));
        assert_eq!(handle.load_reset_flag(PageScope::UrgencyLevels)?, Some(true));
        assert_eq!(writer.failed_writes(), 0);

        writer.shutdown()?;
        remove_db(&db_path);
        Ok(())
    }

    // Test IDs: TWB-002
    #[test]
    fn shutdown_drains_queue_before_closing() -> Result<()> {
        let db_path = unique_temp_db_path("write-behind-drain");
        {
            let writer = WriteBehind::open(&db_path)?;
            let mut engine = TriageEngine::new(PageScope::Customers, writer.handle());
            engine.add_ticket("Acme", "vpn down")?;
            engine.add_ticket("Globex", "invoice")?;
            writer.shutdown()?;

            // The engine outlives the worker; writes now fail but the
            // in-memory state still changes.
            engine.add_ticket("Initech", "tps report")?;
            assert_eq!(engine.snapshot().len(), 3);
        }

        let store = SqliteStore::open(&db_path)?;
        let persisted = store.load_page(PageScope::Customers)?;
        assert_eq!(persisted.map(|collection| collection.len()), Some(2));

        drop(store);
        remove_db(&db_path);
        Ok(())
    }

    // Test IDs: TWB-003
    #[test]
    fn stopped_worker_reports_unavailable_loads() -> Result<()> {
        let db_path = unique_temp_db_path("write-behind-stopped");
        let writer = WriteBehind::open(&db_path)?;
        let handle = writer.handle();
        drop(writer);

        assert!(matches!(
            handle.load(PageScope::Customers),
            Err(PersistError::Unavailable(_))
        ));
        assert!(matches!(
            handle.save(PageScope::Customers, &RecordCollection::new()),
            Err(PersistError::Write(_))
        ));

        let engine = TriageEngine::rehydrate(PageScope::Customers, handle, None);
        assert!(engine.snapshot().is_empty());

        remove_db(&db_path);
        Ok(())
    }

    // Test IDs: TWB-004
    #[test]
    fn flush_waits_for_clear_and_flag_writes() -> Result<()> {
        let db_path = unique_temp_db_path("write-behind-flush");
        let writer = WriteBehind::open(&db_path)?;
        let handle = writer.handle();

        let seeded = RecordCollection::from_records([record("1", "Acme")]);
        handle.save(PageScope::UrgencyLevels, &seeded)?;
        handle.save_reset_flag(PageScope::UrgencyLevels, true)?;
        handle.clear(PageScope::UrgencyLevels)?;
        handle.save_reset_flag(PageScope::UrgencyLevels, false)?;
        writer.flush()?;

        let store = SqliteStore::open(&db_path)?;
        assert!(store.load_page(PageScope::UrgencyLevels)?.is_none());
        assert_eq!(store.load_reset_flag(PageScope::UrgencyLevels)?, Some(false));

        drop(store);
        writer.shutdown()?;
        remove_db(&db_path);
        Ok(())
    }
}
