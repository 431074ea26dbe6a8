//! Paged, transactional bulk upserts
//!
//! Every call to [`BulkUpserter::upsert`] writes all of its rows inside one
//! `BEGIN IMMEDIATE` transaction, split into multi-row `INSERT ... ON CONFLICT`
//! statements of at most `page_size` rows. Either every row commits or none
//! does, and the page size never changes the stored result: a key repeated
//! within one statement resolves the same way as across statements.

use crate::codec;
use crate::connection::{is_interrupt, sqlite_error, Database};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use vulnsync_common::DatabaseConfig;
use vulnsync_core::{
    CancellationToken, CveRecord, CvssMetric, Error, ImageVulnerability, OsvAffected, OsvAlias,
    OsvCredit, OsvRecord, OsvReference, OsvSeverity, Result,
};

/// Bound parameters allowed per statement by the bundled SQLite
pub const MAX_BIND_PARAMS: usize = 32766;

/// How long an expired call waits for a commit that was already running
const COMMIT_GRACE: Duration = Duration::from_secs(5);

/// Tables written by bulk upserts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    Cve,
    Cvss,
    OsvRecord,
    OsvAlias,
    OsvReference,
    OsvSeverity,
    OsvAffected,
    OsvCredit,
    ImageVulnerability,
}

impl TableKind {
    pub const ALL: [TableKind; 9] = [
        TableKind::Cve,
        TableKind::Cvss,
        TableKind::OsvRecord,
        TableKind::OsvAlias,
        TableKind::OsvReference,
        TableKind::OsvSeverity,
        TableKind::OsvAffected,
        TableKind::OsvCredit,
        TableKind::ImageVulnerability,
    ];

    pub fn table_name(&self) -> &'static str {
        match self {
            TableKind::Cve => "cves",
            TableKind::Cvss => "cvss_metrics",
            TableKind::OsvRecord => "osv_records",
            TableKind::OsvAlias => "osv_aliases",
            TableKind::OsvReference => "osv_references",
            TableKind::OsvSeverity => "osv_severities",
            TableKind::OsvAffected => "osv_affected",
            TableKind::OsvCredit => "osv_credits",
            TableKind::ImageVulnerability => "image_vulnerabilities",
        }
    }

    /// Column order of [`UpsertRow::values`]
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            TableKind::Cve => &[
                "id",
                "source_identifier",
                "published",
                "last_modified",
                "vuln_status",
                "refs",
                "descriptions",
                "weaknesses",
                "configurations",
            ],
            TableKind::Cvss => &[
                "cve_id",
                "source",
                "cvss_version",
                "vector_string",
                "base_score",
                "base_severity",
            ],
            TableKind::OsvRecord => &[
                "id",
                "schema_version",
                "modified",
                "published",
                "withdrawn",
                "summary",
                "details",
                "database_specific",
            ],
            TableKind::OsvAlias => &["osv_id", "alias"],
            TableKind::OsvReference => &["osv_id", "ref_type", "url"],
            TableKind::OsvSeverity => &["osv_id", "severity_type", "score"],
            TableKind::OsvAffected => &[
                "osv_id",
                "ecosystem",
                "name",
                "purl",
                "ranges",
                "versions",
                "ecosystem_specific",
                "database_specific",
            ],
            TableKind::OsvCredit => &["osv_id", "name", "contact", "credit_type"],
            TableKind::ImageVulnerability => &[
                "scanner",
                "image_name",
                "image_version",
                "product",
                "team",
                "cve_id",
                "component_type",
                "component",
                "fix_versions",
                "first_seen",
                "last_seen",
                "affected_version",
                "affected_path",
            ],
        }
    }

    pub fn conflict_keys(&self) -> &'static [&'static str] {
        match self {
            TableKind::Cve | TableKind::OsvRecord => &["id"],
            TableKind::Cvss => &["cve_id", "source", "cvss_version"],
            TableKind::OsvAlias => &["osv_id", "alias"],
            TableKind::OsvReference => &["osv_id", "ref_type", "url"],
            TableKind::OsvSeverity => &["osv_id", "severity_type"],
            TableKind::OsvAffected => &["osv_id", "ecosystem", "name"],
            TableKind::OsvCredit => &["osv_id", "name"],
            TableKind::ImageVulnerability => &[
                "scanner",
                "image_name",
                "image_version",
                "product",
                "team",
                "cve_id",
                "component_type",
                "component",
            ],
        }
    }

    /// `SET` clause applied on conflict; `None` keeps the stored row
    fn update_clause(&self) -> Option<String> {
        match self {
            // Re-observing a binding only ever moves last_seen forward.
            TableKind::ImageVulnerability => Some(String::from(
                "last_seen = MAX(image_vulnerabilities.last_seen, excluded.last_seen)",
            )),
            _ => {
                let keys = self.conflict_keys();
                let sets: Vec<String> = self
                    .columns()
                    .iter()
                    .filter(|col| !keys.contains(*col))
                    .map(|col| format!("{col} = excluded.{col}"))
                    .collect();
                if sets.is_empty() {
                    None
                } else {
                    Some(sets.join(", "))
                }
            }
        }
    }

    /// Multi-row upsert statement for `rows` rows
    pub fn upsert_sql(&self, rows: usize) -> String {
        let columns = self.columns();
        let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
        let values = vec![tuple; rows].join(", ");
        let action = match self.update_clause() {
            Some(set) => format!("DO UPDATE SET {}", set),
            None => String::from("DO NOTHING"),
        };
        format!(
            "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) {}",
            self.table_name(),
            columns.join(", "),
            values,
            self.conflict_keys().join(", "),
            action
        )
    }

    /// Largest page that stays under the bind-parameter limit
    pub fn max_page_size(&self) -> usize {
        MAX_BIND_PARAMS / self.columns().len()
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// A row that can be bulk upserted
pub trait UpsertRow: Send + Sync + 'static {
    const TABLE: TableKind;

    /// Bind values in [`TableKind::columns`] order
    fn values(&self) -> Vec<SqlValue>;

    /// Reject rows that must never reach the database
    fn validate(&self) -> Result<()>;
}

fn require(record_id: &str, field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::InvalidRecord {
            record_id: record_id.to_string(),
            message: format!("{} is empty", field),
        });
    }
    Ok(())
}

impl UpsertRow for CveRecord {
    const TABLE: TableKind = TableKind::Cve;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.id),
            codec::opt_text(&self.source_identifier),
            codec::opt_text(&self.published),
            codec::opt_text(&self.last_modified),
            codec::opt_text(&self.vuln_status),
            codec::text(&self.references),
            codec::json(&self.descriptions),
            codec::json(&self.weaknesses),
            codec::json(&self.configurations),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.id, "id", &self.id)
    }
}

impl UpsertRow for CvssMetric {
    const TABLE: TableKind = TableKind::Cvss;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.cve_id),
            codec::text(&self.source),
            codec::text(&self.cvss_version),
            codec::opt_text(&self.vector_string),
            codec::opt_real(self.base_score),
            codec::opt_text(&self.base_severity),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.cve_id, "cve_id", &self.cve_id)?;
        require(&self.cve_id, "source", &self.source)?;
        if let Some(score) = self.base_score {
            if !(0.0..=10.0).contains(&score) {
                return Err(Error::InvalidRecord {
                    record_id: self.cve_id.clone(),
                    message: format!("base score {} out of range", score),
                });
            }
        }
        Ok(())
    }
}

impl UpsertRow for OsvRecord {
    const TABLE: TableKind = TableKind::OsvRecord;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.id),
            codec::opt_text(&self.schema_version),
            codec::text(&self.modified),
            codec::opt_text(&self.published),
            codec::opt_text(&self.withdrawn),
            codec::opt_text(&self.summary),
            codec::opt_text(&self.details),
            codec::opt_json(&self.database_specific),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.id, "id", &self.id)?;
        require(&self.id, "modified", &self.modified)
    }
}

impl UpsertRow for OsvAlias {
    const TABLE: TableKind = TableKind::OsvAlias;

    fn values(&self) -> Vec<SqlValue> {
        vec![codec::text(&self.osv_id), codec::text(&self.alias)]
    }

    fn validate(&self) -> Result<()> {
        require(&self.osv_id, "osv_id", &self.osv_id)
    }
}

impl UpsertRow for OsvReference {
    const TABLE: TableKind = TableKind::OsvReference;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.osv_id),
            codec::text(&self.ref_type),
            codec::text(&self.url),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.osv_id, "osv_id", &self.osv_id)?;
        require(&self.osv_id, "url", &self.url)
    }
}

impl UpsertRow for OsvSeverity {
    const TABLE: TableKind = TableKind::OsvSeverity;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.osv_id),
            codec::text(&self.severity_type),
            codec::text(&self.score),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.osv_id, "osv_id", &self.osv_id)
    }
}

impl UpsertRow for OsvAffected {
    const TABLE: TableKind = TableKind::OsvAffected;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.osv_id),
            codec::text(&self.ecosystem),
            codec::text(&self.name),
            codec::opt_text(&self.purl),
            codec::opt_json(&self.ranges),
            codec::opt_json(&self.versions),
            codec::opt_json(&self.ecosystem_specific),
            codec::opt_json(&self.database_specific),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.osv_id, "osv_id", &self.osv_id)
    }
}

impl UpsertRow for OsvCredit {
    const TABLE: TableKind = TableKind::OsvCredit;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.osv_id),
            codec::text(&self.name),
            codec::opt_json(&self.contact),
            codec::opt_text(&self.credit_type),
        ]
    }

    fn validate(&self) -> Result<()> {
        require(&self.osv_id, "osv_id", &self.osv_id)?;
        require(&self.osv_id, "name", &self.name)
    }
}

impl UpsertRow for ImageVulnerability {
    const TABLE: TableKind = TableKind::ImageVulnerability;

    fn values(&self) -> Vec<SqlValue> {
        vec![
            codec::text(&self.scanner),
            codec::text(&self.image_name),
            codec::text(&self.image_version),
            codec::text(&self.product),
            codec::text(&self.team),
            codec::text(&self.cve_id),
            codec::text(&self.component_type),
            codec::text(&self.component),
            codec::opt_text(&self.fix_versions),
            codec::ts(&self.first_seen),
            codec::ts(&self.last_seen),
            codec::opt_text(&self.affected_version),
            codec::opt_text(&self.affected_path),
        ]
    }

    fn validate(&self) -> Result<()> {
        ImageVulnerability::validate(self)
    }
}

/// Outcome of one committed bulk upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertReport {
    pub table: TableKind,
    /// Rows submitted and committed
    pub committed: usize,
    /// INSERT statements executed
    pub pages: usize,
}

/// Where one upsert call stands, as seen by its deadline watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Waiting,
    /// Holds the writer and is executing pages
    Running,
    Committing,
    /// Finished, committed or not
    Done,
    /// The deadline passed before commit; the call must roll back
    Abandoned,
}

/// Phase of one call, shared between the blocking writer and the watcher
///
/// The writer is only released once the phase is `Done` or `Abandoned`,
/// and every transition takes this lock, so an interrupt issued under it
/// can only land on this call's statements.
#[derive(Clone, Default)]
struct Progress(Arc<Mutex<Phase>>);

impl Progress {
    fn lock(&self) -> Result<MutexGuard<'_, Phase>> {
        self.0
            .lock()
            .map_err(|_| Error::Internal("upsert progress lock poisoned".to_string()))
    }

    /// Move to `next` unless the call was abandoned
    fn advance(&self, next: Phase) -> Result<bool> {
        let mut phase = self.lock()?;
        if *phase == Phase::Abandoned {
            return Ok(false);
        }
        *phase = next;
        Ok(true)
    }

    fn is_abandoned(&self) -> Result<bool> {
        Ok(*self.lock()? == Phase::Abandoned)
    }
}

/// Writes row batches in paged, all-or-nothing transactions
#[derive(Clone)]
pub struct BulkUpserter {
    db: Arc<Database>,
    page_size: usize,
    timeout: Duration,
    cancel: CancellationToken,
}

impl BulkUpserter {
    pub fn new(db: Arc<Database>, config: &DatabaseConfig) -> Self {
        Self {
            db,
            page_size: config.upsert_page_size.max(1),
            timeout: config.statement_timeout(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Page size actually used for `table`
    pub fn page_size_for(&self, table: TableKind) -> usize {
        self.page_size.min(table.max_page_size())
    }

    /// Upsert `rows` within the configured deadline
    ///
    /// The deadline covers waiting for the writer as well as executing. On
    /// expiry the call returns [`Error::Timeout`] and its transaction rolls
    /// back, unless the commit was already under way, in which case the
    /// commit's own outcome is reported. A busy database is retried once.
    pub async fn upsert<R: UpsertRow>(&self, rows: Vec<R>) -> Result<UpsertReport> {
        if rows.is_empty() {
            return Ok(UpsertReport {
                table: R::TABLE,
                committed: 0,
                pages: 0,
            });
        }

        let rows = Arc::new(rows);
        match self.upsert_within_deadline(rows.clone()).await {
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    table = %R::TABLE,
                    error = %e,
                    "Bulk upsert hit a busy database, retrying once"
                );
                self.upsert_within_deadline(rows).await
            }
            result => result,
        }
    }

    async fn upsert_within_deadline<R: UpsertRow>(
        &self,
        rows: Arc<Vec<R>>,
    ) -> Result<UpsertReport> {
        let deadline = Instant::now() + self.timeout;
        let progress = Progress::default();

        let this = self.clone();
        let task_progress = progress.clone();
        let mut handle =
            tokio::task::spawn_blocking(move || this.write(&rows, &task_progress, deadline));

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(joined) => join_result(joined),
            Err(_) => self.expire(R::TABLE, &progress, handle).await,
        }
    }

    /// Settle a call whose deadline passed while its task was still running
    async fn expire(
        &self,
        table: TableKind,
        progress: &Progress,
        handle: JoinHandle<Result<UpsertReport>>,
    ) -> Result<UpsertReport> {
        let phase = {
            let mut phase = progress.lock()?;
            let seen = *phase;
            match seen {
                Phase::Waiting => *phase = Phase::Abandoned,
                Phase::Running => {
                    self.db.interrupt();
                    *phase = Phase::Abandoned;
                }
                Phase::Committing => self.db.interrupt(),
                Phase::Done | Phase::Abandoned => {}
            }
            seen
        };

        tracing::warn!(
            table = %table,
            timeout_ms = self.timeout.as_millis() as u64,
            phase = ?phase,
            "Bulk upsert exceeded deadline"
        );

        match phase {
            // Only a commit already in flight can still succeed.
            Phase::Committing | Phase::Done => {
                match tokio::time::timeout(COMMIT_GRACE, handle).await {
                    Ok(joined) => join_result(joined),
                    Err(_) => Err(self.timeout_error(table)),
                }
            }
            _ => Err(self.timeout_error(table)),
        }
    }

    /// Upsert `rows` on the calling thread
    ///
    /// Waiting for the writer is bounded by the configured deadline; a
    /// statement that is already running is not.
    pub fn upsert_blocking<R: UpsertRow>(&self, rows: &[R]) -> Result<UpsertReport> {
        self.write(rows, &Progress::default(), Instant::now() + self.timeout)
    }

    fn write<R: UpsertRow>(
        &self,
        rows: &[R],
        progress: &Progress,
        deadline: Instant,
    ) -> Result<UpsertReport> {
        for row in rows {
            row.validate()?;
        }
        let page_size = self.page_size_for(R::TABLE);

        let result = self.db.with_writer_until(deadline, |conn| {
            let written = self.write_pages(conn, rows, page_size, progress);
            // Leave Running before the writer is released.
            progress.advance(Phase::Done)?;
            written
        });

        result.map_err(|e| match e {
            Error::Timeout { .. } => self.timeout_error(R::TABLE),
            other => other,
        })
    }

    fn write_pages<R: UpsertRow>(
        &self,
        conn: &mut Connection,
        rows: &[R],
        page_size: usize,
        progress: &Progress,
    ) -> Result<UpsertReport> {
        if !progress.advance(Phase::Running)? {
            return Err(self.timeout_error(R::TABLE));
        }
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite_error("begin upsert", e))?;

        let mut pages = 0;
        for page in rows.chunks(page_size) {
            self.cancel.check("bulk upsert")?;
            if progress.is_abandoned()? {
                return Err(self.timeout_error(R::TABLE));
            }

            let sql = R::TABLE.upsert_sql(page.len());
            let mut stmt = tx
                .prepare_cached(&sql)
                .map_err(|e| sqlite_error("prepare upsert", e))?;
            stmt.execute(params_from_iter(page.iter().flat_map(|row| row.values())))
                .map_err(|e| self.statement_error(R::TABLE, e))?;
            pages += 1;
        }

        if !progress.advance(Phase::Committing)? {
            return Err(self.timeout_error(R::TABLE));
        }
        tx.commit().map_err(|e| self.statement_error(R::TABLE, e))?;

        tracing::debug!(table = %R::TABLE, rows = rows.len(), pages, "Committed bulk upsert");
        Ok(UpsertReport {
            table: R::TABLE,
            committed: rows.len(),
            pages,
        })
    }

    fn statement_error(&self, table: TableKind, err: rusqlite::Error) -> Error {
        if is_interrupt(&err) {
            self.timeout_error(table)
        } else {
            sqlite_error(&format!("upsert into {}", table), err)
        }
    }

    fn timeout_error(&self, table: TableKind) -> Error {
        Error::Timeout {
            operation: format!("bulk upsert into {}", table),
            seconds: self.timeout.as_secs(),
        }
    }
}

fn join_result(
    joined: std::result::Result<Result<UpsertReport>, tokio::task::JoinError>,
) -> Result<UpsertReport> {
    joined.map_err(|e| Error::Internal(format!("upsert task failed: {}", e)))?
}
