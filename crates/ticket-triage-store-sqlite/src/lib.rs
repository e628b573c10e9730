use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ticket_triage_core::{PageScope, PersistError, Persistence, RecordCollection};
use time::OffsetDateTime;
use tracing::warn;

mod decode;

use decode::decode_records;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS page_records (
  page_key TEXT PRIMARY KEY,
  records_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE page_records ADD COLUMN records_sha256 TEXT;
ALTER TABLE page_records ADD COLUMN record_count INTEGER NOT NULL DEFAULT 0;

CREATE TABLE IF NOT EXISTS page_flags (
  flag_key TEXT PRIMARY KEY,
  value INTEGER NOT NULL CHECK (value IN (0, 1)),
  updated_at TEXT NOT NULL
);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageEntry {
    pub page_key: String,
    pub record_count: i64,
    pub records_sha256: Option<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    /// Page keys whose stored JSON no longer matches the recorded digest.
    pub digest_mismatches: Vec<String>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed page store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "page_records")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "page_records", "records_sha256")? {
            // Tables already in v2 shape but the migration rows are missing.
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "page_records", "records_json")? {
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: page_records has no records_json column"))
    }

    /// v2 adds digests and counts to every stored page and the flag table.
    fn apply_migration_2(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;

        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2 schema")?;

        let legacy_pages = {
            let mut stmt = tx.prepare("SELECT page_key, records_json FROM page_records")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .context("failed to read legacy page rows")?
        };

        for (page_key, records_json) in legacy_pages {
            let record_count = decode_records(&page_key, &records_json)
                .map_or(0, |collection| collection.len());
            tx.execute(
                "UPDATE page_records SET records_sha256 = ?1, record_count = ?2 WHERE page_key = ?3",
                params![
                    sha256_hex(&records_json),
                    i64::try_from(record_count).context("record count exceeds i64")?,
                    page_key
                ],
            )
            .with_context(|| format!("failed to backfill digest for page {page_key}"))?;
        }

        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 2")?;

        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Replace the stored snapshot of one page.
    ///
    /// # Errors
    /// Returns an error when the collection cannot be serialized or written.
    pub fn save_page(&self, scope: PageScope, records: &RecordCollection) -> Result<()> {
        let records_json =
            serde_json::to_string(records).context("failed to serialize page records")?;
        let record_count = i64::try_from(records.len()).context("record count exceeds i64")?;

        self.conn
            .execute(
                "INSERT INTO page_records(page_key, records_json, records_sha256, record_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(page_key) DO UPDATE SET
                   records_json = excluded.records_json,
                   records_sha256 = excluded.records_sha256,
                   record_count = excluded.record_count,
                   updated_at = excluded.updated_at",
                params![
                    scope.records_key(),
                    records_json,
                    sha256_hex(&records_json),
                    record_count,
                    now_rfc3339()?
                ],
            )
            .with_context(|| format!("failed to write page {scope}"))?;
        Ok(())
    }

    /// Load the stored snapshot of one page. A missing row, a digest mismatch or
    /// a body that is not a JSON array all count as absent.
    ///
    /// # Errors
    /// Returns an error only when the database itself cannot be queried.
    pub fn load_page(&self, scope: PageScope) -> Result<Option<RecordCollection>> {
        let page_key = scope.records_key();
        let row = self
            .conn
            .query_row(
                "SELECT records_json, records_sha256 FROM page_records WHERE page_key = ?1",
                params![page_key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .with_context(|| format!("failed to read page {scope}"))?;

        let Some((records_json, recorded_digest)) = row else {
            return Ok(None);
        };

        if let Some(expected) = recorded_digest {
            if sha256_hex(&records_json) != expected {
                warn!(page_key, "stored page digest mismatch, treating as absent");
                return Ok(None);
            }
        }

        Ok(decode_records(&page_key, &records_json))
    }

    /// Delete the stored snapshot of one page. Returns whether a row existed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_page(&self, scope: PageScope) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM page_records WHERE page_key = ?1", params![scope.records_key()])
            .with_context(|| format!("failed to clear page {scope}"))?;
        Ok(deleted > 0)
    }

    /// # Errors
    /// Returns an error when the flag row cannot be read.
    pub fn load_reset_flag(&self, scope: PageScope) -> Result<Option<bool>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM page_flags WHERE flag_key = ?1",
                params![scope.reset_flag_key()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .with_context(|| format!("failed to read reset flag for page {scope}"))?;
        Ok(value.map(|value| value != 0))
    }

    /// # Errors
    /// Returns an error when the flag row cannot be written.
    pub fn save_reset_flag(&self, scope: PageScope, visible: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO page_flags(flag_key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(flag_key) DO UPDATE SET
                   value = excluded.value,
                   updated_at = excluded.updated_at",
                params![scope.reset_flag_key(), i64::from(visible), now_rfc3339()?],
            )
            .with_context(|| format!("failed to write reset flag for page {scope}"))?;
        Ok(())
    }

    /// List stored pages with their digest and record count.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_pages(&self) -> Result<Vec<PageEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT page_key, record_count, records_sha256, updated_at
             FROM page_records
             ORDER BY page_key ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PageEntry {
                page_key: row.get(0)?,
                record_count: row.get(1)?,
                records_sha256: row.get(2)?,
                updated_at: row.get(3)?,
            })
        })?;

        rows.collect::<rusqlite::Result<Vec<_>>>().context("failed to list stored pages")
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, page digest verification, and schema status probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let mut digest_mismatches = Vec::new();
        if table_has_column(&self.conn, "page_records", "records_sha256")? {
            let mut stmt = self
                .conn
                .prepare("SELECT page_key, records_json, records_sha256 FROM page_records")
                .context("failed to prepare page digest probe")?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            })?;

            for row in rows {
                let (page_key, records_json, recorded) = row?;
                if recorded.as_deref() != Some(sha256_hex(&records_json).as_str()) {
                    digest_mismatches.push(page_key);
                }
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            digest_mismatches,
            schema_status,
        })
    }
}

impl Persistence for SqliteStore {
    fn load(&self, scope: PageScope) -> Result<Option<RecordCollection>, PersistError> {
        self.load_page(scope).map_err(|err| PersistError::Unavailable(format!("{err:#}")))
    }

    fn save(&self, scope: PageScope, records: &RecordCollection) -> Result<(), PersistError> {
        self.save_page(scope, records).map_err(|err| PersistError::Write(format!("{err:#}")))
    }

    fn clear(&self, scope: PageScope) -> Result<(), PersistError> {
        self.clear_page(scope)
            .map(|_| ())
            .map_err(|err| PersistError::Write(format!("{err:#}")))
    }

    fn load_reset_flag(&self, scope: PageScope) -> Result<Option<bool>, PersistError> {
        Self::load_reset_flag(self, scope)
            .map_err(|err| PersistError::Unavailable(format!("{err:#}")))
    }

    fn save_reset_flag(&self, scope: PageScope, visible: bool) -> Result<(), PersistError> {
        Self::save_reset_flag(self, scope, visible)
            .map_err(|err| PersistError::Write(format!("{err:#}")))
    }
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "page_records")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "page_records", "records_sha256")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "page_records", "records_json")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: page_records has no records_json column"))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn sha256_hex(body: &str) -> String {
    format!("{:x}", Sha256::digest(body.as_bytes()))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use proptest::prelude::*;
    use ticket_triage_core::{Confidence, TicketId, TicketRecord, Urgency};
    use ulid::Ulid;

    fn fixture_id(input: &str) -> TicketId {
        match TicketId::parse(input) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture id {input}: {err}"),
        }
    }

    fn fixture_records() -> RecordCollection {
        let mut classified = TicketRecord::new(fixture_id("1"), "Acme", "vpn down since 9am");
        classified.urgency = Urgency::High;
        classified.confidence = Confidence::from_percent(91.25).unwrap_or_default();
        classified.annotation = Some(true);

        RecordCollection::from_records([
            classified,
            TicketRecord::new(fixture_id("2"), "Globex", "invoice copy"),
        ])
    }

    fn record_strategy() -> impl Strategy<Value = TicketRecord> {
        (
            "[a-z0-9]{1,6}",
            "[A-Za-z][A-Za-z .]{0,11}",
            "\\PC{0,24}",
            prop::sample::select(vec![
                Urgency::Unclassified,
                Urgency::Low,
                Urgency::Medium,
                Urgency::High,
                Urgency::Extreme,
                Urgency::Unknown,
            ]),
            0..=Confidence::MAX_HUNDREDTHS,
            prop::option::of(any::<bool>()),
        )
            .prop_map(|(id, customer, message, urgency, hundredths, annotation)| {
                let mut record = TicketRecord::new(fixture_id(&id), customer, message);
                record.urgency = urgency;
                if urgency.is_classified() {
                    record.confidence = Confidence::from_hundredths(hundredths).unwrap_or_default();
                }
                record.annotation = annotation;
                record
            })
    }

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn temp_db_path(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ticket-triage-{label}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn save_and_load_page_round_trip() -> Result<()> {
        let store = migrated_memory_store()?;
        let records = fixture_records();

        assert_eq!(store.load_page(PageScope::Customers)?, None);
        store.save_page(PageScope::Customers, &records)?;

        assert_eq!(store.load_page(PageScope::Customers)?, Some(records));
        assert_eq!(store.load_page(PageScope::SupportTickets)?, None);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn tampered_page_is_treated_as_absent() -> Result<()> {
        let store = migrated_memory_store()?;
        store.save_page(PageScope::Customers, &fixture_records())?;
        store.conn.execute(
            "UPDATE page_records SET records_json = '[]' WHERE page_key = ?1",
            params![PageScope::Customers.records_key()],
        )?;

        assert_eq!(store.load_page(PageScope::Customers)?, None);

        let report = store.integrity_check()?;
        assert_eq!(report.digest_mismatches, vec!["customers_records".to_string()]);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn migrate_legacy_v1_database_backfills_digests() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        store.conn.execute(
            "INSERT INTO page_records(page_key, records_json, updated_at) VALUES (?1, ?2, ?3)",
            params![
                "customers_records",
                r#"[{"key":"k1","Customer":"Acme","Message":"hi","Urgency":"Low","Percentage":"40%"}]"#,
                "2026-01-01T00:00:00Z"
            ],
        )?;

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(current_schema_version(&store.conn)?, 2);

        let pages = store.list_pages()?;
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].record_count, 1);
        assert!(pages[0].records_sha256.is_some());

        let Some(loaded) = store.load_page(PageScope::Customers)? else {
            return Err(anyhow!("migrated page should load"));
        };
        let migrated = loaded.get(&fixture_id("k1"));
        assert_eq!(
            migrated.map(|record| (record.urgency, record.confidence.hundredths())),
            Some((Urgency::Low, 4000))
        );
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn migrate_rejects_page_table_without_records_column() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch("CREATE TABLE page_records(page_key TEXT PRIMARY KEY);")?;

        let err = match store.migrate() {
            Ok(()) => return Err(anyhow!("expected migration to fail on invalid legacy schema")),
            Err(err) => err,
        };
        assert!(err.to_string().contains("page_records has no records_json column"));
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn reset_flag_and_clear_page_round_trip() -> Result<()> {
        let store = migrated_memory_store()?;

        assert_eq!(store.load_reset_flag(PageScope::UrgencyLevels)?, None);
        store.save_reset_flag(PageScope::UrgencyLevels, true)?;
        assert_eq!(store.load_reset_flag(PageScope::UrgencyLevels)?, Some(true));
        store.save_reset_flag(PageScope::UrgencyLevels, false)?;
        assert_eq!(store.load_reset_flag(PageScope::UrgencyLevels)?, Some(false));

        store.save_page(PageScope::UrgencyLevels, &fixture_records())?;
        assert!(store.clear_page(PageScope::UrgencyLevels)?);
        assert!(!store.clear_page(PageScope::UrgencyLevels)?);
        assert!(store.list_pages()?.is_empty());
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn backup_database_copies_pages_to_a_new_file() -> Result<()> {
        let source = migrated_memory_store()?;
        source.save_page(PageScope::SupportTickets, &fixture_records())?;

        let backup_file = temp_db_path("backup");
        source.backup_database(&backup_file)?;

        let restored = SqliteStore::open(&backup_file)?;
        assert_eq!(restored.load_page(PageScope::SupportTickets)?, Some(fixture_records()));
        drop(restored);

        cleanup_sqlite_files(&backup_file)
    }

    // Test IDs: TDB-007
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_memory_store()?;
        store.save_page(PageScope::Customers, &fixture_records())?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.digest_mismatches.is_empty());
        assert_eq!(report.schema_status.current_version, 2);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn file_database_survives_reopen_through_persistence_trait() -> Result<()> {
        let db_path = temp_db_path("reopen");
        {
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;
            Persistence::save(&store, PageScope::Customers, &fixture_records())
                .map_err(|err| anyhow!("{err}"))?;
            Persistence::save_reset_flag(&store, PageScope::UrgencyLevels, true)
                .map_err(|err| anyhow!("{err}"))?;
        }

        let mut reopened = SqliteStore::open(&db_path)?;
        reopened.migrate()?;
        let loaded = Persistence::load(&reopened, PageScope::Customers)
            .map_err(|err| anyhow!("{err}"))?;
        assert_eq!(loaded, Some(fixture_records()));
        assert_eq!(
            Persistence::load_reset_flag(&reopened, PageScope::UrgencyLevels)
                .map_err(|err| anyhow!("{err}"))?,
            Some(true)
        );
        drop(reopened);

        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TDB-009
    proptest! {
        #[test]
        fn property_saved_pages_load_back_unchanged(
            records in prop::collection::vec(record_strategy(), 0..24)
        ) {
            let collection = RecordCollection::from_records(records);
            let store = migrated_memory_store()
                .map_err(|err| TestCaseError::fail(format!("{err:#}")))?;

            store
                .save_page(PageScope::Customers, &collection)
                .map_err(|err| TestCaseError::fail(format!("{err:#}")))?;
            let loaded = store
                .load_page(PageScope::Customers)
                .map_err(|err| TestCaseError::fail(format!("{err:#}")))?;

            prop_assert_eq!(loaded, Some(collection));
        }
    }
}
