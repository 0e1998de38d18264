use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool, Transaction,
};
use thiserror::Error;
use uuid::Uuid;

use caf_sync_core::types::{CompanyCandidate, ReferenceUpdate};

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(StorageError::Connect)?;

        apply_pragmas(&pool).await?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Begins a SQLite transaction spanning the journal insert and the
    /// reference write, so a failed notification leaves no partial state.
    pub async fn begin(&self) -> Result<Transaction<'_, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Returns a handle for the inbound delivery journal.
    pub fn change_events(&self) -> ChangeEventRepository {
        ChangeEventRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to query the company side table.
    pub fn companies(&self) -> CompanyRepository {
        CompanyRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to read account display names.
    pub fn accounts(&self) -> AccountRepository {
        AccountRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle to write CAF reference fields.
    pub fn cafs(&self) -> CafRepository {
        CafRepository {
            pool: self.pool.clone(),
        }
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn apply_pragmas(pool: &SqlitePool) -> Result<(), StorageError> {
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA journal_mode = WAL;")
        .fetch_one(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA synchronous = NORMAL;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(pool)
        .await
        .map_err(StorageError::Pragma)?;

    Ok(())
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to apply pragma: {0}")]
    Pragma(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `change_event` delivery journal.
#[derive(Clone)]
pub struct ChangeEventRepository {
    pool: SqlitePool,
}

impl ChangeEventRepository {
    /// Inserts a new delivery into the journal. A redelivered message id is
    /// reported as [`ChangeEventInsertOutcome::Duplicate`] rather than an error.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record: &NewChangeEvent<'_>,
    ) -> Result<ChangeEventInsertOutcome, ChangeEventError> {
        let result = sqlx::query(
            "INSERT INTO change_event \
             (id, msg_id, entity, operation, payload_json, event_at, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(record.msg_id)
        .bind(record.entity)
        .bind(record.operation)
        .bind(record.payload_json)
        .bind(to_rfc3339(record.event_at))
        .bind(to_rfc3339(record.received_at))
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(ChangeEventInsertOutcome::Inserted),
            Err(sqlx::Error::Database(db_err)) => {
                if db_err.code().as_deref() == Some("2067") {
                    Ok(ChangeEventInsertOutcome::Duplicate)
                } else {
                    Err(ChangeEventError::Database(sqlx::Error::Database(db_err)))
                }
            }
            Err(err) => Err(ChangeEventError::Database(err)),
        }
    }
}

/// Result of attempting to journal an inbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEventInsertOutcome {
    Inserted,
    Duplicate,
}

impl ChangeEventInsertOutcome {
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Error type for operations on the delivery journal.
#[derive(Debug, Error)]
pub enum ChangeEventError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

/// Data required to journal an inbound delivery.
#[derive(Debug, Clone)]
pub struct NewChangeEvent<'a> {
    pub msg_id: &'a str,
    pub entity: &'a str,
    pub operation: &'a str,
    pub payload_json: &'a str,
    pub event_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Repository used to query the company side table. The side table is read
/// only; it is never mutated by this service.
#[derive(Clone)]
pub struct CompanyRepository {
    pool: SqlitePool,
}

impl CompanyRepository {
    /// Lists companies whose name exactly equals the provided value, most
    /// recently created first.
    pub async fn find_by_name(&self, name: &str) -> Result<Vec<CompanyCandidate>, CompanyError> {
        let rows = sqlx::query_as::<_, CompanyRow>(
            "SELECT id, spectra_name, spectra_groupid, spectra_unifyparentorgid, created_at \
             FROM spectra_company \
             WHERE spectra_name = ? \
             ORDER BY created_at DESC",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CompanyRow::into_domain).collect()
    }
}

/// Errors that can occur while reading the company side table.
#[derive(Debug, Error)]
pub enum CompanyError {
    #[error("invalid identifier in company row: {0}")]
    InvalidId(#[from] uuid::Error),
    #[error("invalid timestamp in company row: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct CompanyRow {
    id: String,
    spectra_name: String,
    spectra_groupid: Option<String>,
    spectra_unifyparentorgid: Option<String>,
    created_at: String,
}

impl CompanyRow {
    fn into_domain(self) -> Result<CompanyCandidate, CompanyError> {
        Ok(CompanyCandidate {
            id: Uuid::parse_str(&self.id)?,
            name: self.spectra_name,
            group_id: self
                .spectra_groupid
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()?,
            parent_org_id: self
                .spectra_unifyparentorgid
                .as_deref()
                .map(Uuid::parse_str)
                .transpose()?,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

/// Repository used for point lookups of account display names.
#[derive(Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    /// Fetches the display name of the referenced account, projecting only
    /// the `name` column. A missing account yields `None`.
    pub async fn fetch_name(&self, id: Uuid) -> Result<Option<String>, AccountError> {
        let row = sqlx::query("SELECT name FROM accounts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| row.get("name")))
    }
}

/// Errors that can occur while reading accounts.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository writing resolved references back onto CAF records.
#[derive(Clone)]
pub struct CafRepository {
    pool: SqlitePool,
}

impl CafRepository {
    /// Applies the resolved references as one partial UPDATE. The group
    /// column is only touched when the update carries a group id; other
    /// columns are never written.
    pub async fn apply_references(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        update: &ReferenceUpdate,
        updated_at: DateTime<Utc>,
    ) -> Result<(), CafError> {
        let result = match update.group_id {
            Some(group_id) => {
                sqlx::query(
                    "UPDATE alletech_caf \
                     SET spectra_company = ?, spectra_group = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(update.company_id.to_string())
                .bind(group_id.to_string())
                .bind(to_rfc3339(updated_at))
                .bind(update.record_id.to_string())
                .execute(&mut **tx)
                .await?
            }
            None => {
                sqlx::query(
                    "UPDATE alletech_caf \
                     SET spectra_company = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(update.company_id.to_string())
                .bind(to_rfc3339(updated_at))
                .bind(update.record_id.to_string())
                .execute(&mut **tx)
                .await?
            }
        };

        if result.rows_affected() == 0 {
            return Err(CafError::MissingRecord(update.record_id));
        }

        Ok(())
    }
}

/// Errors that can occur while writing CAF references.
#[derive(Debug, Error)]
pub enum CafError {
    #[error("caf record {0} does not exist")]
    MissingRecord(Uuid),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|parsed| parsed.with_timezone(&Utc))
}
