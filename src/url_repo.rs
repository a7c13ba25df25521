use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rearch::CapsuleHandle;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DbConn, EntityTrait, ExprTrait, QueryFilter,
    SqlErr, sea_query::Expr,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    code_generator::ShortCode,
    config::db_conn_capsule,
    orm::short_url,
};

pub fn url_repository_capsule(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> Arc<dyn UrlRepository> {
    let db = get.as_ref(db_conn_capsule).clone();
    Arc::new(SeaOrmUrlRepository::new(db))
}

/// A stored mapping from a [`ShortCode`] to the URL it stands in for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UrlRecord {
    pub id: i32,
    pub original_url: String,
    pub short_code: ShortCode,
    pub created_at: OffsetDateTime,
    pub clicks: u64,
}

#[derive(Debug, Error)]
pub enum SaveUrlError {
    #[error("short code is already taken")]
    CodeTaken,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum IncrementClicksError {
    #[error("no URL is stored under the short code")]
    NotFound,
    #[error("storage unavailable: {0}")]
    StorageUnavailable(anyhow::Error),
}

/// The single owner of [`UrlRecord`] persistence.
///
/// Every method is atomic with respect to the uniqueness of short codes,
/// so callers never need to check for existence before writing.
#[async_trait]
pub trait UrlRepository: Send + Sync {
    /// Looks up the record stored under `code` without modifying it.
    async fn retrieve_url(&self, code: &ShortCode) -> anyhow::Result<Option<UrlRecord>>;

    /// Creates a record with zero clicks, or reports [`SaveUrlError::CodeTaken`]
    /// when `code` already belongs to another record.
    async fn save_url(&self, original_url: &str, code: &ShortCode)
    -> Result<UrlRecord, SaveUrlError>;

    /// Adds exactly one click to the record stored under `code`.
    async fn increment_clicks(&self, code: &ShortCode) -> Result<(), IncrementClicksError>;
}

pub struct SeaOrmUrlRepository {
    db: DbConn,
}

impl SeaOrmUrlRepository {
    #[must_use]
    pub const fn new(db: DbConn) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UrlRepository for SeaOrmUrlRepository {
    #[instrument(skip(self))]
    async fn retrieve_url(&self, code: &ShortCode) -> anyhow::Result<Option<UrlRecord>> {
        short_url::Entity::find()
            .filter(short_url::Column::ShortCode.eq(code.as_str()))
            .one(&self.db)
            .await
            .context("Failed to retrieve URL record")?
            .map(UrlRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn save_url(
        &self,
        original_url: &str,
        code: &ShortCode,
    ) -> Result<UrlRecord, SaveUrlError> {
        let to_insert = short_url::ActiveModel {
            original_url: Set(original_url.to_owned()),
            short_code: Set(code.as_str().to_owned()),
            created_at: Set(OffsetDateTime::now_utc()),
            clicks: Set(0),
            ..Default::default()
        };

        // NOTE: the unique index on short_code is what detects collisions,
        // so concurrent inserts of the same code cannot both succeed
        match to_insert.insert(&self.db).await {
            Ok(inserted) => inserted
                .try_into()
                .map_err(SaveUrlError::StorageUnavailable),
            Err(err) if matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(SaveUrlError::CodeTaken)
            }
            Err(err) => Err(SaveUrlError::StorageUnavailable(
                anyhow::Error::new(err).context("Failed to insert URL record"),
            )),
        }
    }

    #[instrument(skip(self))]
    async fn increment_clicks(&self, code: &ShortCode) -> Result<(), IncrementClicksError> {
        let result = short_url::Entity::update_many()
            .col_expr(
                short_url::Column::Clicks,
                Expr::col(short_url::Column::Clicks).add(Expr::val(1)),
            )
            .filter(short_url::Column::ShortCode.eq(code.as_str()))
            .exec(&self.db)
            .await
            .context("Failed to increment click count")
            .map_err(IncrementClicksError::StorageUnavailable)?;

        match result.rows_affected {
            0 => Err(IncrementClicksError::NotFound),
            _ => Ok(()),
        }
    }
}

impl TryFrom<short_url::Model> for UrlRecord {
    type Error = anyhow::Error;

    fn try_from(
        short_url::Model {
            id,
            original_url,
            short_code,
            created_at,
            clicks,
        }: short_url::Model,
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            id,
            original_url,
            short_code: ShortCode::new(short_code).context("Stored short code is malformed")?,
            created_at,
            clicks: clicks.try_into().context("Stored click count is negative")?,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use sea_orm::{DatabaseBackend, DbErr, MockDatabase, MockExecResult};
    use time::Duration;
    use tokio::task::JoinSet;

    use crate::config::{file_backed_db, in_memory_db};

    use super::*;

    fn code(code: &str) -> ShortCode {
        ShortCode::new(code.to_owned()).unwrap()
    }

    async fn new_repo() -> Arc<SeaOrmUrlRepository> {
        Arc::new(SeaOrmUrlRepository::new(in_memory_db().await))
    }

    #[tokio::test]
    async fn test_save_then_retrieve() {
        let repo = new_repo().await;

        let before_save = OffsetDateTime::now_utc();
        let saved = repo
            .save_url("http://example.com", &code("f0e6a6"))
            .await
            .unwrap();
        let after_save = OffsetDateTime::now_utc();
        assert_eq!(saved.original_url, "http://example.com");
        assert_eq!(saved.short_code, code("f0e6a6"));
        assert_eq!(saved.clicks, 0);
        // NOTE: slight tolerance is allowed for sub-microsecond truncation in storage
        assert!(
            (before_save - Duration::milliseconds(1)..=after_save).contains(&saved.created_at),
            "{} not within [{before_save}, {after_save}]",
            saved.created_at
        );

        let retrieved = repo.retrieve_url(&code("f0e6a6")).await.unwrap().unwrap();
        assert_eq!(retrieved.id, saved.id);
        assert_eq!(retrieved.original_url, "http://example.com");
        assert_eq!(retrieved.created_at, saved.created_at);
        assert_eq!(retrieved.clicks, 0);
    }

    #[tokio::test]
    async fn test_retrieve_missing() {
        let repo = new_repo().await;
        assert!(repo.retrieve_url(&code("zzzzzz")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_assigns_increasing_ids() {
        let repo = new_repo().await;
        let first = repo.save_url("http://a.com", &code("aaaaaa")).await.unwrap();
        let second = repo.save_url("http://b.com", &code("bbbbbb")).await.unwrap();
        assert!(second.id > first.id);
    }

    #[tokio::test]
    async fn test_save_code_taken_keeps_existing_record() {
        let repo = new_repo().await;
        repo.save_url("http://a.com", &code("aaaaaa")).await.unwrap();

        let err = repo
            .save_url("http://other.com", &code("aaaaaa"))
            .await
            .unwrap_err();
        assert!(matches!(err, SaveUrlError::CodeTaken));

        let existing = repo.retrieve_url(&code("aaaaaa")).await.unwrap().unwrap();
        assert_eq!(existing.original_url, "http://a.com");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_saves_of_same_code_have_one_winner() {
        let (_dir, db) = file_backed_db().await;
        let repo = Arc::new(SeaOrmUrlRepository::new(db));

        let mut tasks = JoinSet::new();
        for i in 0..8 {
            let repo = Arc::clone(&repo);
            tasks.spawn(async move {
                repo.save_url(&format!("http://site{i}.com"), &code("cccccc"))
                    .await
            });
        }

        let mut successes = 0;
        while let Some(result) = tasks.join_next().await {
            match result.unwrap() {
                Ok(_) => successes += 1,
                Err(SaveUrlError::CodeTaken) => {}
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_increment_clicks() {
        let repo = new_repo().await;
        repo.save_url("http://a.com", &code("aaaaaa")).await.unwrap();
        repo.save_url("http://b.com", &code("bbbbbb")).await.unwrap();

        for _ in 0..3 {
            repo.increment_clicks(&code("aaaaaa")).await.unwrap();
        }

        let a = repo.retrieve_url(&code("aaaaaa")).await.unwrap().unwrap();
        let b = repo.retrieve_url(&code("bbbbbb")).await.unwrap().unwrap();
        assert_eq!(a.clicks, 3);
        assert_eq!(b.clicks, 0);
    }

    #[tokio::test]
    async fn test_increment_clicks_not_found() {
        let repo = new_repo().await;
        let err = repo.increment_clicks(&code("zzzzzz")).await.unwrap_err();
        assert!(matches!(err, IncrementClicksError::NotFound));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_increments_are_not_lost() {
        let (_dir, db) = file_backed_db().await;
        let repo = Arc::new(SeaOrmUrlRepository::new(db));
        repo.save_url("http://a.com", &code("aaaaaa")).await.unwrap();

        let mut tasks = JoinSet::new();
        for _ in 0..50 {
            let repo = Arc::clone(&repo);
            tasks.spawn(async move { repo.increment_clicks(&code("aaaaaa")).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let record = repo.retrieve_url(&code("aaaaaa")).await.unwrap().unwrap();
        assert_eq!(record.clicks, 50);
    }

    #[tokio::test]
    async fn test_distinct_codes_stay_unique() {
        let repo = new_repo().await;
        let codes = ["aaaaaa", "bbbbbb", "cccccc"];
        for (i, c) in codes.iter().enumerate() {
            repo.save_url(&format!("http://{i}.com"), &code(c))
                .await
                .unwrap();
        }

        let mut ids = HashSet::new();
        for c in codes {
            ids.insert(repo.retrieve_url(&code(c)).await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), codes.len());
    }

    #[tokio::test]
    async fn test_retrieve_storage_unavailable() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Custom("connection lost".to_owned())])
            .into_connection();
        let repo = SeaOrmUrlRepository::new(db);

        assert!(repo.retrieve_url(&code("aaaaaa")).await.is_err());
    }

    #[tokio::test]
    async fn test_save_storage_unavailable() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_query_errors([DbErr::Custom("connection lost".to_owned())])
            .append_exec_errors([DbErr::Custom("connection lost".to_owned())])
            .into_connection();
        let repo = SeaOrmUrlRepository::new(db);

        let err = repo
            .save_url("http://a.com", &code("aaaaaa"))
            .await
            .unwrap_err();
        assert!(matches!(err, SaveUrlError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_increment_storage_unavailable() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Custom("connection lost".to_owned())])
            .into_connection();
        let repo = SeaOrmUrlRepository::new(db);

        let err = repo.increment_clicks(&code("aaaaaa")).await.unwrap_err();
        assert!(matches!(err, IncrementClicksError::StorageUnavailable(_)));
    }

    #[tokio::test]
    async fn test_increment_reports_not_found_from_rows_affected() {
        let db = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([MockExecResult {
                last_insert_id: 0,
                rows_affected: 0,
            }])
            .into_connection();
        let repo = SeaOrmUrlRepository::new(db);

        let err = repo.increment_clicks(&code("aaaaaa")).await.unwrap_err();
        assert!(matches!(err, IncrementClicksError::NotFound));
    }
}
