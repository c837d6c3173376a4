use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::record::{from_column, or_sentinel, ArticleRecord, ClusterTags, PageStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database can no longer be written; no later batch is durable.
    #[error("storage unavailable: {0}")]
    Fatal(#[source] rusqlite::Error),
    /// A single statement was rejected; other rows are unaffected.
    #[error("row rejected: {0}")]
    Row(#[source] rusqlite::Error),
}

impl StoreError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Fatal(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        let fatal = match &e {
            rusqlite::Error::SqliteFailure(f, _) => matches!(
                f.code,
                ErrorCode::CannotOpen
                    | ErrorCode::SystemIoFailure
                    | ErrorCode::DatabaseCorrupt
                    | ErrorCode::NotADatabase
                    | ErrorCode::DiskFull
                    | ErrorCode::ReadOnly
                    | ErrorCode::PermissionDenied
                    | ErrorCode::DatabaseBusy
                    | ErrorCode::DatabaseLocked
                    | ErrorCode::FileLockingProtocolFailed
                    | ErrorCode::OutOfMemory
                    | ErrorCode::InternalMalfunction
            ),
            rusqlite::Error::InvalidPath(_) => true,
            _ => false,
        };
        if fatal {
            StoreError::Fatal(e)
        } else {
            StoreError::Row(e)
        }
    }
}

pub fn connect(path: &Path) -> Result<Connection, StoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(dir) {
            warn!("Cannot create {}: {}", dir.display(), e);
        }
    }
    let conn = Connection::open(path).map_err(StoreError::Fatal)?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(StoreError::Fatal)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")
        .map_err(StoreError::Fatal)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS articles (
            pmid             INTEGER PRIMARY KEY CHECK(pmid > 0),
            lev1_cluster_id  INTEGER,
            lev2_cluster_id  INTEGER,
            lev3_cluster_id  INTEGER,
            lev4_cluster_id  INTEGER,
            title            TEXT,
            abstract         TEXT,
            authors          TEXT,
            journal          TEXT,
            publication_date TEXT,
            doi              TEXT,
            keywords         TEXT,
            ingested_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_articles_lev1 ON articles(lev1_cluster_id);
        ",
    )
    .map_err(StoreError::Fatal)?;
    Ok(())
}

// ── Writing ──

/// Outcome of one flush: rows written and rows rejected with the reason.
#[derive(Debug, Default)]
pub struct FlushReport {
    pub written: usize,
    pub rejected: Vec<(i64, String)>,
}

/// Destination of accepted records. One flush is one atomic write.
pub trait ArticleStore: Send {
    fn upsert_batch(&mut self, batch: &[ArticleRecord]) -> Result<FlushReport, StoreError>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = connect(path)?;
        init_schema(&conn)?;
        Ok(SqliteStore { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

const UPSERT_SQL: &str = "
    INSERT INTO articles
        (pmid, lev1_cluster_id, lev2_cluster_id, lev3_cluster_id, lev4_cluster_id,
         title, abstract, authors, journal, publication_date, doi, keywords, ingested_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, datetime('now'))
    ON CONFLICT(pmid) DO UPDATE SET
        lev1_cluster_id  = excluded.lev1_cluster_id,
        lev2_cluster_id  = excluded.lev2_cluster_id,
        lev3_cluster_id  = excluded.lev3_cluster_id,
        lev4_cluster_id  = excluded.lev4_cluster_id,
        title            = excluded.title,
        abstract         = excluded.abstract,
        authors          = excluded.authors,
        journal          = excluded.journal,
        publication_date = excluded.publication_date,
        doi              = excluded.doi,
        keywords         = excluded.keywords,
        ingested_at      = excluded.ingested_at";

impl ArticleStore for SqliteStore {
    /// Upsert every record in one transaction. Each row runs under its own
    /// savepoint so a rejected row is rolled back alone and reported.
    fn upsert_batch(&mut self, batch: &[ArticleRecord]) -> Result<FlushReport, StoreError> {
        let tx = self.conn.unchecked_transaction().map_err(StoreError::Fatal)?;
        let mut report = FlushReport::default();
        {
            let mut stmt = tx.prepare_cached(UPSERT_SQL)?;
            for r in batch {
                tx.execute_batch("SAVEPOINT article_row")?;
                let result = stmt.execute(rusqlite::params![
                    r.pmid,
                    r.tags.lev1,
                    r.tags.lev2,
                    r.tags.lev3,
                    r.tags.lev4,
                    or_sentinel(&r.title),
                    or_sentinel(&r.abstract_text),
                    or_sentinel(&r.authors),
                    or_sentinel(&r.journal),
                    or_sentinel(&r.publication_date),
                    or_sentinel(&r.doi),
                    or_sentinel(&r.keywords),
                ]);
                match result.map_err(StoreError::from) {
                    Ok(_) => {
                        tx.execute_batch("RELEASE article_row")?;
                        report.written += 1;
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        tx.execute_batch("ROLLBACK TO article_row; RELEASE article_row")?;
                        warn!("Row for pmid {} rejected: {}", r.pmid, e);
                        report.rejected.push((r.pmid, e.to_string()));
                    }
                }
            }
        }
        tx.commit()?;
        Ok(report)
    }
}

// ── Reading ──

/// Single-row lookup; sentinel columns come back as absent fields.
pub fn get_by_key(conn: &Connection, pmid: i64) -> Result<Option<ArticleRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT pmid, lev1_cluster_id, lev2_cluster_id, lev3_cluster_id, lev4_cluster_id,
                    title, abstract, authors, journal, publication_date, doi, keywords
             FROM articles WHERE pmid = ?1",
            [pmid],
            |row| {
                Ok(ArticleRecord {
                    pmid: row.get(0)?,
                    tags: ClusterTags {
                        lev1: row.get(1)?,
                        lev2: row.get(2)?,
                        lev3: row.get(3)?,
                        lev4: row.get(4)?,
                    },
                    title: from_column(row.get(5)?),
                    abstract_text: from_column(row.get(6)?),
                    authors: from_column(row.get(7)?),
                    journal: from_column(row.get(8)?),
                    publication_date: from_column(row.get(9)?),
                    doi: from_column(row.get(10)?),
                    keywords: from_column(row.get(11)?),
                    page: PageStatus::Fetched,
                })
            },
        )
        .optional()?;
    Ok(row)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TitleRow {
    pub pmid: i64,
    pub title: String,
}

/// `(pmid, title)` for the whole corpus, ordered by pmid. Only committed
/// rows are visible to the connection used here.
pub fn get_all(conn: &Connection) -> Result<Vec<TitleRow>, StoreError> {
    let mut stmt = conn.prepare("SELECT pmid, COALESCE(title, '') FROM articles ORDER BY pmid")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(TitleRow {
                pmid: row.get(0)?,
                title: row.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

// ── Stats ──

pub struct Stats {
    pub total: usize,
    pub with_doi: usize,
    pub with_keywords: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats, StoreError> {
    let count = |sql: &str| -> Result<usize, StoreError> {
        Ok(conn.query_row(sql, [], |r| r.get(0))?)
    };
    Ok(Stats {
        total: count("SELECT COUNT(*) FROM articles")?,
        with_doi: count("SELECT COUNT(*) FROM articles WHERE doi IS NOT NULL AND doi != 'not found'")?,
        with_keywords: count(
            "SELECT COUNT(*) FROM articles WHERE keywords IS NOT NULL AND keywords != 'not found'",
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::NOT_FOUND;

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("articles.sqlite")).unwrap();
        (dir, store)
    }

    fn record(pmid: i64, title: &str) -> ArticleRecord {
        ArticleRecord {
            pmid,
            tags: ClusterTags { lev1: Some(1), lev2: Some(12), lev3: None, lev4: Some(1234) },
            title: Some(title.to_string()),
            abstract_text: Some("An abstract.".into()),
            authors: Some("A One, B Two".into()),
            journal: Some("Nature".into()),
            publication_date: Some("2024 Feb".into()),
            doi: None,
            keywords: Some("k1; k2".into()),
            page: PageStatus::Fetched,
        }
    }

    #[test]
    fn upsert_round_trips_fields() {
        let (_dir, mut s) = store();
        let r = record(67890, "Study X");
        let report = s.upsert_batch(std::slice::from_ref(&r)).unwrap();
        assert_eq!(report.written, 1);

        let back = get_by_key(s.conn(), 67890).unwrap().unwrap();
        assert_eq!(back, r);

        let raw_doi: String = s
            .conn()
            .query_row("SELECT doi FROM articles WHERE pmid = 67890", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw_doi, NOT_FOUND);
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let (_dir, mut s) = store();
        s.upsert_batch(&[record(1, "old")]).unwrap();
        s.upsert_batch(&[record(1, "new")]).unwrap();

        let count: i64 = s.conn().query_row("SELECT COUNT(*) FROM articles", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
        assert_eq!(get_by_key(s.conn(), 1).unwrap().unwrap().title.as_deref(), Some("new"));
    }

    #[test]
    fn rejected_row_does_not_sink_batch() {
        let (_dir, mut s) = store();
        let batch = vec![record(10, "a"), record(0, "violates check"), record(11, "b")];
        let report = s.upsert_batch(&batch).unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].0, 0);

        let titles = get_all(s.conn()).unwrap();
        let pmids: Vec<i64> = titles.iter().map(|t| t.pmid).collect();
        assert_eq!(pmids, vec![10, 11]);
    }

    #[test]
    fn missing_key_is_none() {
        let (_dir, s) = store();
        assert!(get_by_key(s.conn(), 42).unwrap().is_none());
    }

    #[test]
    fn stats_ignore_sentinels() {
        let (_dir, mut s) = store();
        let mut with_doi = record(2, "b");
        with_doi.doi = Some("10.1/x".into());
        s.upsert_batch(&[record(1, "a"), with_doi]).unwrap();
        let st = get_stats(s.conn()).unwrap();
        assert_eq!(st.total, 2);
        assert_eq!(st.with_doi, 1);
        assert_eq!(st.with_keywords, 2);
    }

    #[test]
    fn io_errors_are_fatal() {
        let io = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
            None,
        );
        assert!(StoreError::from(io).is_fatal());
        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!StoreError::from(constraint).is_fatal());
    }

    #[test]
    fn unopenable_database_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, b"plain file").unwrap();

        match SqliteStore::open(&file.join("articles.sqlite")) {
            Err(e) => assert!(e.is_fatal(), "{:?}", e),
            Ok(_) => panic!("opened a database below a regular file"),
        }
    }
}
