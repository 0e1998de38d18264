use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::json;
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use caf_sync_core::resolver::{Resolution, ResolutionEngine, ResolutionOutcome};
use caf_sync_core::types::{ChangeNotification, ReferenceUpdate, DEFAULT_COMPANY_NAME};
use caf_sync_storage::{
    AccountError, CafError, ChangeEventError, CompanyError, Database, NewChangeEvent,
};

use crate::tap::{StageEvent, StageKind, StageMetadata, StagePayload, TapHub};

/// Runs the resolution procedure for one change notification and issues the
/// single resulting write, if any. The store handle and the trace sink are
/// injected here rather than resolved from any ambient context.
#[derive(Clone)]
pub struct SyncExecutor {
    database: Database,
    tap: TapHub,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
}

impl SyncExecutor {
    pub fn new(
        database: Database,
        tap: TapHub,
        clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    ) -> Self {
        Self {
            database,
            tap,
            clock,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Journals the delivery and runs resolution inside one transaction, so
    /// a store failure rolls back both the journal entry and any write and
    /// the platform can redeliver.
    pub async fn process(
        &self,
        journal: &NewChangeEvent<'_>,
        notification: &ChangeNotification,
    ) -> Result<SyncOutcome, SyncError> {
        if !notification.is_tracked() {
            debug!(
                stage = "sync",
                operation = notification.operation.as_str(),
                entity = %notification.entity,
                "notification is not a tracked change, skipping"
            );
            return Ok(SyncOutcome::Ignored);
        }

        let mut tx = self.database.begin().await?;

        let inserted = self.database.change_events().insert(&mut tx, journal).await?;
        if inserted.is_duplicate() {
            info!(
                stage = "sync",
                msg_id = journal.msg_id,
                record_id = %notification.record_id,
                "redelivered notification skipped"
            );
            tx.commit().await?;
            return Ok(SyncOutcome::Redelivered);
        }

        let outcome = self.resolve_and_apply(&mut tx, notification).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Resolves the company/group references for the changed record and
    /// applies them. At most one UPDATE is issued per invocation.
    async fn resolve_and_apply(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        notification: &ChangeNotification,
    ) -> Result<SyncOutcome, SyncError> {
        let start = Instant::now();
        let name = self.effective_name(notification).await?;

        let candidates = match name.as_deref() {
            Some(value) => self.database.companies().find_by_name(value).await?,
            None => Vec::new(),
        };

        let outcome = ResolutionEngine::resolve(name.as_deref(), &candidates);
        counter!("resolution_branch_total", "branch" => outcome.branch.as_str()).increment(1);
        self.emit_resolution_event(
            notification,
            &outcome,
            start.elapsed().as_secs_f64() * 1000.0,
        );

        match outcome.resolution {
            Resolution::Resolved(references) => {
                let update = ReferenceUpdate {
                    record_id: notification.record_id,
                    company_id: references.company_id,
                    group_id: references.group_id,
                };
                self.apply(tx, &update, "match").await?;
                Ok(SyncOutcome::Applied(update))
            }
            Resolution::UseDefault => self.apply_default(tx, notification.record_id).await,
            Resolution::Unresolved => {
                info!(
                    stage = "sync",
                    record_id = %notification.record_id,
                    "matched company lacks a parent-org reference, record left untouched"
                );
                Ok(SyncOutcome::LeftUnresolved)
            }
        }
    }

    /// Applies the default company references, or nothing when no company
    /// named [`DEFAULT_COMPANY_NAME`] exists.
    async fn apply_default(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        record_id: Uuid,
    ) -> Result<SyncOutcome, SyncError> {
        let candidates = self
            .database
            .companies()
            .find_by_name(DEFAULT_COMPANY_NAME)
            .await?;

        let Some(references) = ResolutionEngine::default_references(&candidates) else {
            info!(
                stage = "sync",
                record_id = %record_id,
                "no default company found, record left untouched"
            );
            self.emit_apply_event(record_id, None, "no_default");
            return Ok(SyncOutcome::NoDefault);
        };

        let update = ReferenceUpdate {
            record_id,
            company_id: references.company_id,
            group_id: references.group_id,
        };
        self.apply(tx, &update, "default").await?;
        Ok(SyncOutcome::AppliedDefault(update))
    }

    async fn apply(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        update: &ReferenceUpdate,
        kind: &'static str,
    ) -> Result<(), SyncError> {
        self.database
            .cafs()
            .apply_references(tx, update, self.now())
            .await?;
        info!(
            stage = "sync",
            record_id = %update.record_id,
            company_id = %update.company_id,
            kind,
            "updated caf record references"
        );
        self.emit_apply_event(update.record_id, Some(update), kind);
        Ok(())
    }

    /// Determines the display name to match on: the cached lookup name when
    /// present, otherwise the referenced account's name fetched from the
    /// store. A miss on either leaves the name absent.
    async fn effective_name(
        &self,
        notification: &ChangeNotification,
    ) -> Result<Option<String>, SyncError> {
        let Some(lookup) = &notification.company_lookup else {
            debug!(
                stage = "sync",
                record_id = %notification.record_id,
                "company lookup missing from record"
            );
            return Ok(None);
        };

        if let Some(name) = lookup.display_name() {
            debug!(
                stage = "sync",
                record_id = %notification.record_id,
                "company lookup name already available"
            );
            return Ok(Some(name.to_string()));
        }

        let fetched = self.database.accounts().fetch_name(lookup.id).await?;
        match &fetched {
            Some(_) => debug!(
                stage = "sync",
                record_id = %notification.record_id,
                account_id = %lookup.id,
                "company lookup name retrieved from store"
            ),
            None => debug!(
                stage = "sync",
                record_id = %notification.record_id,
                account_id = %lookup.id,
                "referenced account missing, proceeding with empty name"
            ),
        }
        Ok(fetched.filter(|name| !name.is_empty()))
    }

    fn emit_resolution_event(
        &self,
        notification: &ChangeNotification,
        outcome: &ResolutionOutcome,
        latency_ms: f64,
    ) {
        let event = StageEvent {
            ts: self.now(),
            stage: StageKind::Resolution,
            record_id: Some(notification.record_id),
            meta: StageMetadata {
                operation: Some(notification.operation.as_str().to_string()),
                latency_ms: Some(latency_ms),
                message: Some(outcome.branch.as_str().to_string()),
                ..StageMetadata::default()
            },
            r#in: StagePayload {
                redacted: true,
                payload: notification.redacted(),
                truncated: None,
            },
            out: StagePayload {
                redacted: true,
                payload: outcome.redacted(),
                truncated: None,
            },
        };
        self.tap.publish(event);
    }

    fn emit_apply_event(&self, record_id: Uuid, update: Option<&ReferenceUpdate>, kind: &str) {
        let event = StageEvent {
            ts: self.now(),
            stage: StageKind::Apply,
            record_id: Some(record_id),
            meta: StageMetadata {
                message: Some(kind.to_string()),
                ..StageMetadata::default()
            },
            r#in: StagePayload::default(),
            out: StagePayload {
                redacted: true,
                payload: update
                    .map(ReferenceUpdate::redacted)
                    .unwrap_or_else(|| json!({ "written": false })),
                truncated: None,
            },
        };
        self.tap.publish(event);
    }
}

/// Terminal outcome of processing one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A matching company was applied.
    Applied(ReferenceUpdate),
    /// The default company was applied.
    AppliedDefault(ReferenceUpdate),
    /// A company matched but lacks a parent-org reference; no write.
    LeftUnresolved,
    /// Fallback wanted but no default company exists; no write.
    NoDefault,
    /// The notification is not a tracked CAF change; no write.
    Ignored,
    /// The delivery was already journaled; no reprocessing.
    Redelivered,
}

impl SyncOutcome {
    /// Returns the metrics label associated with the outcome.
    pub fn metric_kind(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::AppliedDefault(_) => "applied_default",
            Self::LeftUnresolved => "unresolved",
            Self::NoDefault => "no_default",
            Self::Ignored => "ignored",
            Self::Redelivered => "redelivered",
        }
    }
}

/// Errors raised while processing a notification. All of them indicate a
/// failing store interaction and abort the triggering delivery.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to journal delivery: {0}")]
    Journal(#[from] ChangeEventError),
    #[error("failed to query companies: {0}")]
    Company(#[from] CompanyError),
    #[error("failed to read account: {0}")]
    Account(#[from] AccountError),
    #[error("failed to update caf record: {0}")]
    Caf(#[from] CafError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use caf_sync_core::types::{ChangeOperation, Lookup, CAF_ENTITY};
    use chrono::Duration;
    use sqlx::query_scalar;

    async fn setup_db() -> (Database, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("records.db").display());
        let db = Database::connect(&url).await.expect("connect");
        db.run_migrations().await.expect("migrations");
        (db, dir)
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .expect("fixed time")
            .with_timezone(&Utc)
    }

    fn executor(db: &Database) -> SyncExecutor {
        let now = fixed_now();
        SyncExecutor::new(db.clone(), TapHub::new(), Arc::new(move || now))
    }

    fn rfc3339(value: DateTime<Utc>) -> String {
        value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
    }

    async fn insert_group(db: &Database, id: Uuid) {
        sqlx::query("INSERT INTO spectra_group (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind("Group")
            .bind(rfc3339(fixed_now()))
            .execute(db.pool())
            .await
            .expect("insert group");
    }

    async fn insert_company(
        db: &Database,
        name: &str,
        group_id: Option<Uuid>,
        parent_org_id: Option<Uuid>,
        created_at: DateTime<Utc>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO spectra_company \
             (id, spectra_name, spectra_groupid, spectra_unifyparentorgid, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(name)
        .bind(group_id.map(|value| value.to_string()))
        .bind(parent_org_id.map(|value| value.to_string()))
        .bind(rfc3339(created_at))
        .execute(db.pool())
        .await
        .expect("insert company");
        id
    }

    async fn insert_account(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO accounts (id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(rfc3339(fixed_now()))
            .execute(db.pool())
            .await
            .expect("insert account");
        id
    }

    async fn insert_caf(db: &Database) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO alletech_caf (id, created_at, updated_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(rfc3339(fixed_now()))
            .bind(rfc3339(fixed_now()))
            .execute(db.pool())
            .await
            .expect("insert caf");
        id
    }

    async fn caf_references(db: &Database, record_id: Uuid) -> (Option<String>, Option<String>) {
        sqlx::query_as("SELECT spectra_company, spectra_group FROM alletech_caf WHERE id = ?")
            .bind(record_id.to_string())
            .fetch_one(db.pool())
            .await
            .expect("fetch caf references")
    }

    fn notification(record_id: Uuid, lookup: Option<Lookup>) -> ChangeNotification {
        ChangeNotification {
            operation: ChangeOperation::Create,
            entity: CAF_ENTITY.to_string(),
            record_id,
            company_lookup: lookup,
        }
    }

    fn journal<'a>(msg_id: &'a str, notification: &'a ChangeNotification) -> NewChangeEvent<'a> {
        NewChangeEvent {
            msg_id,
            entity: &notification.entity,
            operation: notification.operation.as_str(),
            payload_json: "{}",
            event_at: fixed_now(),
            received_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn applies_matching_company_and_group() {
        let (db, _dir) = setup_db().await;
        let group_id = Uuid::new_v4();
        insert_group(&db, group_id).await;
        let company_id = insert_company(
            &db,
            "Acme",
            Some(group_id),
            Some(Uuid::new_v4()),
            fixed_now(),
        )
        .await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Acme".to_string()),
        };
        let notification = notification(record_id, Some(lookup));

        let outcome = executor(&db)
            .process(&journal("msg-match", &notification), &notification)
            .await
            .expect("process");

        let expected = ReferenceUpdate {
            record_id,
            company_id,
            group_id: Some(group_id),
        };
        assert_eq!(outcome, SyncOutcome::Applied(expected));

        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(company_id.to_string()));
        assert_eq!(group, Some(group_id.to_string()));
    }

    #[tokio::test]
    async fn match_without_parent_org_writes_nothing() {
        let (db, _dir) = setup_db().await;
        // A default exists, but the unresolved branch must not reach for it.
        insert_company(&db, DEFAULT_COMPANY_NAME, None, None, fixed_now()).await;
        insert_company(&db, "Acme", None, None, fixed_now()).await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Acme".to_string()),
        };
        let notification = notification(record_id, Some(lookup));

        let outcome = executor(&db)
            .process(&journal("msg-unresolved", &notification), &notification)
            .await
            .expect("process");
        assert_eq!(outcome, SyncOutcome::LeftUnresolved);

        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, None);
        assert_eq!(group, None);
    }

    #[tokio::test]
    async fn missing_lookup_applies_default_without_group() {
        let (db, _dir) = setup_db().await;
        let default_id = insert_company(&db, DEFAULT_COMPANY_NAME, None, None, fixed_now()).await;
        let record_id = insert_caf(&db).await;

        let notification = notification(record_id, None);
        let outcome = executor(&db)
            .process(&journal("msg-default", &notification), &notification)
            .await
            .expect("process");

        let expected = ReferenceUpdate {
            record_id,
            company_id: default_id,
            group_id: None,
        };
        assert_eq!(outcome, SyncOutcome::AppliedDefault(expected));

        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(default_id.to_string()));
        assert_eq!(group, None);
    }

    #[tokio::test]
    async fn default_group_is_relayed_when_present() {
        let (db, _dir) = setup_db().await;
        let group_id = Uuid::new_v4();
        insert_group(&db, group_id).await;
        let default_id =
            insert_company(&db, DEFAULT_COMPANY_NAME, Some(group_id), None, fixed_now()).await;
        let record_id = insert_caf(&db).await;

        let notification = notification(record_id, None);
        let outcome = executor(&db)
            .process(&journal("msg-default-group", &notification), &notification)
            .await
            .expect("process");

        assert!(matches!(outcome, SyncOutcome::AppliedDefault(_)));
        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(default_id.to_string()));
        assert_eq!(group, Some(group_id.to_string()));
    }

    #[tokio::test]
    async fn empty_lookup_name_is_recovered_from_the_account() {
        let (db, _dir) = setup_db().await;
        let account_id = insert_account(&db, "Acme").await;
        let company_id =
            insert_company(&db, "Acme", None, Some(Uuid::new_v4()), fixed_now()).await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: account_id,
            name: Some(String::new()),
        };
        let notification = notification(record_id, Some(lookup));

        let outcome = executor(&db)
            .process(&journal("msg-fetched-name", &notification), &notification)
            .await
            .expect("process");

        assert!(matches!(outcome, SyncOutcome::Applied(_)));
        let (company, _) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(company_id.to_string()));
    }

    #[tokio::test]
    async fn unrecoverable_lookup_name_falls_back_to_default() {
        let (db, _dir) = setup_db().await;
        let default_id = insert_company(&db, DEFAULT_COMPANY_NAME, None, None, fixed_now()).await;
        let record_id = insert_caf(&db).await;

        // Lookup points at an account that does not exist.
        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: None,
        };
        let notification = notification(record_id, Some(lookup));

        let outcome = executor(&db)
            .process(&journal("msg-missing-account", &notification), &notification)
            .await
            .expect("process");

        assert!(matches!(outcome, SyncOutcome::AppliedDefault(_)));
        let (company, _) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(default_id.to_string()));
    }

    #[tokio::test]
    async fn no_match_and_no_default_writes_nothing() {
        let (db, _dir) = setup_db().await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Ghost Co".to_string()),
        };
        let notification = notification(record_id, Some(lookup));

        let outcome = executor(&db)
            .process(&journal("msg-ghost", &notification), &notification)
            .await
            .expect("process");
        assert_eq!(outcome, SyncOutcome::NoDefault);

        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, None);
        assert_eq!(group, None);
    }

    #[tokio::test]
    async fn latest_company_wins_when_names_collide() {
        let (db, _dir) = setup_db().await;
        insert_company(&db, "Acme", None, Some(Uuid::new_v4()), fixed_now()).await;
        let newer = insert_company(
            &db,
            "Acme",
            None,
            Some(Uuid::new_v4()),
            fixed_now() + Duration::minutes(10),
        )
        .await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Acme".to_string()),
        };
        let notification = notification(record_id, Some(lookup));

        executor(&db)
            .process(&journal("msg-collide", &notification), &notification)
            .await
            .expect("process");

        let (company, _) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(newer.to_string()));
    }

    #[tokio::test]
    async fn untracked_notifications_are_ignored_without_journaling() {
        let (db, _dir) = setup_db().await;
        let record_id = insert_caf(&db).await;

        let mut notification = notification(record_id, None);
        notification.operation = ChangeOperation::Other("delete".to_string());

        let outcome = executor(&db)
            .process(&journal("msg-ignored", &notification), &notification)
            .await
            .expect("process");
        assert_eq!(outcome, SyncOutcome::Ignored);

        let count: i64 = query_scalar("SELECT COUNT(*) FROM change_event")
            .fetch_one(db.pool())
            .await
            .expect("count");
        assert_eq!(count, 0);

        let (company, _) = caf_references(&db, record_id).await;
        assert_eq!(company, None);
    }

    #[tokio::test]
    async fn redelivered_notifications_are_not_reprocessed() {
        let (db, _dir) = setup_db().await;
        let company_id =
            insert_company(&db, "Acme", None, Some(Uuid::new_v4()), fixed_now()).await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Acme".to_string()),
        };
        let notification = notification(record_id, Some(lookup));
        let runner = executor(&db);

        let first = runner
            .process(&journal("msg-redelivery", &notification), &notification)
            .await
            .expect("first");
        assert!(matches!(first, SyncOutcome::Applied(_)));

        let second = runner
            .process(&journal("msg-redelivery", &notification), &notification)
            .await
            .expect("second");
        assert_eq!(second, SyncOutcome::Redelivered);

        let (company, _) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(company_id.to_string()));
    }

    #[tokio::test]
    async fn reprocessing_unchanged_data_is_idempotent() {
        let (db, _dir) = setup_db().await;
        let group_id = Uuid::new_v4();
        insert_group(&db, group_id).await;
        let company_id = insert_company(
            &db,
            "Acme",
            Some(group_id),
            Some(Uuid::new_v4()),
            fixed_now(),
        )
        .await;
        let record_id = insert_caf(&db).await;

        let lookup = Lookup {
            id: Uuid::new_v4(),
            name: Some("Acme".to_string()),
        };
        let notification = notification(record_id, Some(lookup));
        let runner = executor(&db);

        let first = runner
            .process(&journal("msg-idem-1", &notification), &notification)
            .await
            .expect("first");
        let second = runner
            .process(&journal("msg-idem-2", &notification), &notification)
            .await
            .expect("second");
        assert_eq!(first, second);

        let (company, group) = caf_references(&db, record_id).await;
        assert_eq!(company, Some(company_id.to_string()));
        assert_eq!(group, Some(group_id.to_string()));
    }
}
