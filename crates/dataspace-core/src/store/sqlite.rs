// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed leasing store.
//!
//! All entity types share the `state_entities` table, partitioned by
//! `entity_type`. Lease acquisition is a single
//! `UPDATE ... WHERE id IN (SELECT ... LIMIT n) RETURNING payload` statement;
//! SQLite runs every write statement under its database-wide write lock, so
//! no two statements can observe the same unleased row. Saves are a
//! conditional upsert whose `WHERE` clause encodes the lease check, and
//! creates an `INSERT` that ignores taken ids, so the check and the write are
//! one atomic step as well.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use crate::entity::StatefulEntity;
use crate::error::{EngineError, Result};
use crate::lease::{Lease, LeaseSettings};
use crate::query::{Criterion, Operator, QuerySpec, SortOrder, is_valid_path};

use super::StateEntityStore;

/// Lease columns of one row: owner, leased_at, expiry (epoch millis).
type LeaseRow = (Option<String>, Option<i64>, Option<i64>);

/// Leasing store persisted in SQLite.
pub struct SqliteStateEntityStore<E> {
    pool: SqlitePool,
    settings: LeaseSettings,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for SqliteStateEntityStore<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: self.settings.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E: StatefulEntity> SqliteStateEntityStore<E> {
    /// Create a store on a migrated pool.
    pub fn new(pool: SqlitePool, settings: LeaseSettings) -> Self {
        Self {
            pool,
            settings,
            _entity: PhantomData,
        }
    }

    /// Handle on the same database that leases as `holder`.
    pub fn with_holder(&self, holder: impl Into<String>) -> Self {
        Self {
            pool: self.pool.clone(),
            settings: LeaseSettings {
                holder: holder.into(),
                duration: self.settings.duration,
            },
            _entity: PhantomData,
        }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn lease_row(&self, id: &str) -> Result<Option<LeaseRow>> {
        let row = sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT lease_owner, leased_at, lease_expiry
            FROM state_entities
            WHERE entity_type = ?1 AND id = ?2
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    /// Error explaining why a lease-guarded statement touched no row.
    async fn lease_failure(&self, id: &str, already_leased: bool) -> Result<EngineError> {
        let Some((owner, _, _)) = self.lease_row(id).await? else {
            return Ok(EngineError::NotFound {
                entity_id: id.to_string(),
            });
        };
        let leased_by = owner.unwrap_or_default();
        Ok(if already_leased {
            EngineError::AlreadyLeased {
                entity_id: id.to_string(),
                leased_by,
            }
        } else {
            EngineError::LeaseConflict {
                entity_id: id.to_string(),
                leased_by,
            }
        })
    }

    fn lease_window(&self) -> (i64, i64) {
        let now = Utc::now().timestamp_millis();
        (now, now.saturating_add(millis(self.settings.duration)))
    }
}

#[async_trait]
impl<E: StatefulEntity> StateEntityStore<E> for SqliteStateEntityStore<E> {
    fn lease_holder(&self) -> &str {
        &self.settings.holder
    }

    async fn next_not_leased(&self, limit: usize, filter: &[Criterion]) -> Result<Vec<E>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (now, expiry) = self.lease_window();

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE state_entities SET lease_owner = ");
        qb.push_bind(self.settings.holder.clone());
        qb.push(", leased_at = ");
        qb.push_bind(now);
        qb.push(", lease_expiry = ");
        qb.push_bind(expiry);
        qb.push(" WHERE entity_type = ");
        qb.push_bind(E::ENTITY_TYPE);
        qb.push(" AND id IN (SELECT id FROM state_entities WHERE entity_type = ");
        qb.push_bind(E::ENTITY_TYPE);
        qb.push(" AND (lease_owner IS NULL OR lease_expiry <= ");
        qb.push_bind(now);
        qb.push(")");
        for criterion in filter {
            push_criterion(&mut qb, criterion)?;
        }
        qb.push(" ORDER BY state_timestamp ASC, id ASC LIMIT ");
        qb.push_bind(to_i64(limit));
        qb.push(") RETURNING payload");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut entities = rows.iter().map(decode::<E>).collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        entities.sort_by(|a, b| {
            a.state_timestamp()
                .cmp(&b.state_timestamp())
                .then_with(|| a.id().cmp(b.id()))
        });

        if !entities.is_empty() {
            debug!(
                entity_type = E::ENTITY_TYPE,
                holder = %self.settings.holder,
                count = entities.len(),
                "Leased entities"
            );
        }

        Ok(entities)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<E>> {
        let row = sqlx::query(
            r#"
            SELECT payload FROM state_entities
            WHERE entity_type = ?1 AND id = ?2
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode::<E>).transpose()
    }

    async fn find_by_id_and_lease(&self, id: &str) -> Result<E> {
        let (now, expiry) = self.lease_window();
        let row = sqlx::query(
            r#"
            UPDATE state_entities
            SET lease_owner = ?1, leased_at = ?2, lease_expiry = ?3
            WHERE entity_type = ?4 AND id = ?5
              AND (lease_owner IS NULL OR lease_owner = ?1 OR lease_expiry <= ?2)
            RETURNING payload
            "#,
        )
        .bind(&self.settings.holder)
        .bind(now)
        .bind(expiry)
        .bind(E::ENTITY_TYPE)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode(&row),
            None => Err(self.lease_failure(id, true).await?),
        }
    }

    async fn create(&self, entity: &E) -> Result<()> {
        let payload = serde_json::to_string(entity)?;
        let meta = entity.meta();

        let result = sqlx::query(
            r#"
            INSERT INTO state_entities
                (entity_type, id, state, state_timestamp, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (entity_type, id) DO NOTHING
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(&meta.id)
        .bind(meta.state)
        .bind(meta.state_timestamp.timestamp_millis())
        .bind(payload)
        .bind(meta.created_at.timestamp_millis())
        .bind(meta.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::AlreadyExists {
                entity_id: meta.id.clone(),
            });
        }
        Ok(())
    }

    async fn save(&self, entity: &E) -> Result<()> {
        let payload = serde_json::to_string(entity)?;
        let meta = entity.meta();
        let now = Utc::now().timestamp_millis();

        let result = sqlx::query(
            r#"
            INSERT INTO state_entities
                (entity_type, id, state, state_timestamp, payload, created_at, updated_at,
                 lease_owner, leased_at, lease_expiry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, NULL)
            ON CONFLICT (entity_type, id) DO UPDATE SET
                state = excluded.state,
                state_timestamp = excluded.state_timestamp,
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                lease_owner = NULL,
                leased_at = NULL,
                lease_expiry = NULL
            WHERE state_entities.lease_owner = ?8 AND state_entities.lease_expiry > ?9
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(&meta.id)
        .bind(meta.state)
        .bind(meta.state_timestamp.timestamp_millis())
        .bind(payload)
        .bind(meta.created_at.timestamp_millis())
        .bind(meta.updated_at.timestamp_millis())
        .bind(&self.settings.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(&meta.id, false).await?);
        }
        Ok(())
    }

    async fn renew_lease(&self, entity: &E) -> Result<()> {
        let (now, expiry) = self.lease_window();
        let result = sqlx::query(
            r#"
            UPDATE state_entities
            SET leased_at = ?1, lease_expiry = ?2
            WHERE entity_type = ?3 AND id = ?4 AND lease_owner = ?5 AND lease_expiry > ?1
            "#,
        )
        .bind(now)
        .bind(expiry)
        .bind(E::ENTITY_TYPE)
        .bind(entity.id())
        .bind(&self.settings.holder)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(entity.id(), false).await?);
        }
        Ok(())
    }

    async fn break_lease(&self, entity: &E) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE state_entities
            SET lease_owner = NULL, leased_at = NULL, lease_expiry = NULL
            WHERE entity_type = ?1 AND id = ?2
              AND (lease_owner IS NULL OR lease_owner = ?3 OR lease_expiry <= ?4)
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(entity.id())
        .bind(&self.settings.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(entity.id(), false).await?);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            DELETE FROM state_entities
            WHERE entity_type = ?1 AND id = ?2
              AND (lease_owner IS NULL OR lease_owner = ?3 OR lease_expiry <= ?4)
            "#,
        )
        .bind(E::ENTITY_TYPE)
        .bind(id)
        .bind(&self.settings.holder)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_failure(id, true).await?);
        }
        Ok(())
    }

    async fn query(&self, spec: &QuerySpec) -> Result<Vec<E>> {
        let mut qb =
            QueryBuilder::<Sqlite>::new("SELECT payload FROM state_entities WHERE entity_type = ");
        qb.push_bind(E::ENTITY_TYPE);
        for criterion in &spec.filter {
            push_criterion(&mut qb, criterion)?;
        }
        qb.push(" ORDER BY ");
        if let Some(field) = &spec.sort_field {
            let direction = match spec.sort_order {
                SortOrder::Asc => "ASC",
                SortOrder::Desc => "DESC",
            };
            qb.push(format!("{} {}, ", column_expr(field)?, direction));
        }
        qb.push("state_timestamp ASC, id ASC LIMIT ");
        qb.push_bind(to_i64(spec.limit));
        qb.push(" OFFSET ");
        qb.push_bind(to_i64(spec.offset));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(decode::<E>).collect()
    }

    async fn lease(&self, id: &str) -> Result<Option<Lease>> {
        let now = Utc::now().timestamp_millis();
        let lease = match self.lease_row(id).await? {
            Some((Some(leased_by), Some(leased_at), Some(expiry))) if expiry > now => {
                let duration = u64::try_from(expiry - leased_at).unwrap_or(0);
                Some(Lease {
                    leased_by,
                    leased_at: DateTime::from_timestamp_millis(leased_at).unwrap_or_default(),
                    lease_duration: Duration::from_millis(duration),
                })
            }
            _ => None,
        };
        Ok(lease)
    }
}

fn decode<E: StatefulEntity>(row: &SqliteRow) -> Result<E> {
    let payload: String = row.try_get("payload")?;
    Ok(serde_json::from_str(&payload)?)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// SQLite JSON path for a dotted field path (`tags.1` -> `$.tags[1]`).
fn json_path(path: &str) -> String {
    path.split('.').fold(String::from("$"), |mut acc, segment| {
        if segment.chars().all(|c| c.is_ascii_digit()) {
            acc.push_str(&format!("[{segment}]"));
        } else {
            acc.push('.');
            acc.push_str(segment);
        }
        acc
    })
}

/// SQL expression for a field path; top-level columns are used where they exist.
fn column_expr(path: &str) -> Result<String> {
    match path {
        "id" => Ok("id".to_string()),
        "state" => Ok("state".to_string()),
        "stateTimestamp" => Ok("state_timestamp".to_string()),
        _ if is_valid_path(path) => Ok(format!("json_extract(payload, '{}')", json_path(path))),
        _ => Err(EngineError::InvalidQuery(format!(
            "invalid field path '{path}'"
        ))),
    }
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => {
            qb.push_bind(None::<String>);
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) => {
                qb.push_bind(i);
            }
            None => {
                qb.push_bind(n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            qb.push_bind(s.clone());
        }
        other => {
            qb.push_bind(other.to_string());
        }
    }
}

fn push_criterion(qb: &mut QueryBuilder<'_, Sqlite>, criterion: &Criterion) -> Result<()> {
    let column = column_expr(&criterion.operand_left)?;
    let right = &criterion.operand_right;
    qb.push(" AND ");

    match criterion.operator {
        Operator::Eq | Operator::NotEq | Operator::Lt | Operator::Le | Operator::Gt
        | Operator::Ge | Operator::Like => {
            let op = match criterion.operator {
                Operator::Eq => "IS",
                Operator::NotEq => "IS NOT",
                Operator::Like => "LIKE",
                other => other.as_str(),
            };
            qb.push(format!("{column} {op} "));
            push_value(qb, right);
        }
        Operator::In => match right {
            Value::Array(items) if !items.is_empty() => {
                qb.push(format!("{column} IN ("));
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        qb.push(", ");
                    }
                    push_value(qb, item);
                }
                qb.push(")");
            }
            _ => {
                qb.push("0");
            }
        },
        Operator::Contains => {
            let path = json_path(&criterion.operand_left);
            qb.push(format!(
                "(CASE WHEN json_type(payload, '{path}') = 'array' \
                 THEN EXISTS (SELECT 1 FROM json_each(payload, '{path}') WHERE json_each.value IS "
            ));
            push_value(qb, right);
            qb.push(format!(") ELSE instr({column}, "));
            push_value(qb, right);
            qb.push(") > 0 END)");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityState;
    use crate::entity::testing::{Job, JobState};
    use crate::migrations;
    use sqlx::sqlite::SqlitePoolOptions;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        migrations::run_sqlite(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    async fn store(holder: &str) -> SqliteStateEntityStore<Job> {
        SqliteStateEntityStore::new(test_pool().await, LeaseSettings::new(holder))
    }

    #[test]
    fn test_json_path_translation() {
        assert_eq!(json_path("owner"), "$.owner");
        assert_eq!(json_path("tags.1"), "$.tags[1]");
        assert_eq!(column_expr("state").unwrap(), "state");
        assert_eq!(
            column_expr("dataRequest.type").unwrap(),
            "json_extract(payload, '$.dataRequest.type')"
        );
        assert!(column_expr("x') OR 1=1 --").is_err());
    }

    #[tokio::test]
    async fn test_save_and_find() {
        let store = store("runtime-a").await;
        let job = Job::aged("j1", JobState::Queued, 0);
        store.save(&job).await.unwrap();

        let found = store.find_by_id("j1").await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(store.find_by_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_not_leased_oldest_first_and_exclusive() {
        let a = store("runtime-a").await;
        let b = a.with_holder("runtime-b");
        for (id, offset) in [("j3", 30), ("j1", 10), ("j2", 20)] {
            a.save(&Job::aged(id, JobState::Queued, offset)).await.unwrap();
        }
        a.save(&Job::aged("other", JobState::Running, 0)).await.unwrap();

        let filter = [Criterion::state_is(JobState::Queued.code())];
        let first = a.next_not_leased(2, &filter).await.unwrap();
        let ids: Vec<_> = first.iter().map(|j| j.id().to_string()).collect();
        assert_eq!(ids, vec!["j1", "j2"]);

        let second = b.next_not_leased(5, &filter).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id(), "j3");

        assert!(b.next_not_leased(5, &filter).await.unwrap().is_empty());
        assert_eq!(a.lease("j1").await.unwrap().unwrap().leased_by, "runtime-a");
    }

    #[tokio::test]
    async fn test_json_criteria() {
        let store = store("runtime-a").await;
        let mut gold = Job::aged("gold", JobState::Queued, 0);
        gold.tags = vec!["gold".to_string(), "eu".to_string()];
        gold.owner = "bob".to_string();
        store.save(&gold).await.unwrap();
        store.save(&Job::aged("plain", JobState::Queued, 1)).await.unwrap();

        let by_owner = store
            .query(&QuerySpec::new().filter(Criterion::eq("owner", "bob")))
            .await
            .unwrap();
        assert_eq!(by_owner.len(), 1);

        let by_tag = store
            .query(&QuerySpec::new().filter(Criterion::new("tags", Operator::Contains, "eu")))
            .await
            .unwrap();
        assert_eq!(by_tag[0].id(), "gold");

        let by_index = store
            .query(&QuerySpec::new().filter(Criterion::eq("tags.0", "gold")))
            .await
            .unwrap();
        assert_eq!(by_index.len(), 1);

        let like = store
            .query(&QuerySpec::new().filter(Criterion::new("id", Operator::Like, "PL%")))
            .await
            .unwrap();
        assert_eq!(like[0].id(), "plain");

        let in_states = store
            .query(&QuerySpec::new().filter(Criterion::state_in(&[JobState::Queued.code()])))
            .await
            .unwrap();
        assert_eq!(in_states.len(), 2);
    }

    #[tokio::test]
    async fn test_save_guarded_by_lease() {
        let a = store("runtime-a").await;
        let b = a.with_holder("runtime-b");
        a.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let mut job = b.find_by_id_and_lease("j1").await.unwrap();
        job.transition_to(JobState::Running);

        let err = a.save(&job).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::LeaseConflict { ref leased_by, .. } if leased_by == "runtime-b"
        ));
        assert!(matches!(
            a.find_by_id_and_lease("j1").await.unwrap_err(),
            EngineError::AlreadyLeased { .. }
        ));

        b.save(&job).await.unwrap();
        assert!(a.lease("j1").await.unwrap().is_none());
        assert_eq!(
            a.find_by_id("j1").await.unwrap().unwrap().state(),
            Some(JobState::Running)
        );
    }

    #[tokio::test]
    async fn test_stale_lease_reclaim() {
        let pool = test_pool().await;
        let a = SqliteStateEntityStore::<Job>::new(
            pool.clone(),
            LeaseSettings::new("runtime-a").with_duration(Duration::from_millis(20)),
        );
        let b = a.with_holder("runtime-b");
        a.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let job = a.next_not_leased(1, &[]).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(b.next_not_leased(1, &[]).await.unwrap().len(), 1);
        assert!(a.save(&job).await.is_err());
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_overwrite_reclaimed_progress() {
        let a = SqliteStateEntityStore::<Job>::new(
            test_pool().await,
            LeaseSettings::new("runtime-a").with_duration(Duration::from_millis(20)),
        );
        let b = a.with_holder("runtime-b");
        a.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let mut stale = a.next_not_leased(1, &[]).await.unwrap().remove(0);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let mut reclaimed = b.next_not_leased(1, &[]).await.unwrap().remove(0);
        reclaimed.transition_to(JobState::Done);
        b.save(&reclaimed).await.unwrap();
        assert!(b.lease("j1").await.unwrap().is_none());

        stale.transition_to(JobState::Running);
        let err = a.save(&stale).await.unwrap_err();
        assert!(matches!(err, EngineError::LeaseConflict { .. }));
        assert_eq!(
            a.find_by_id("j1").await.unwrap().unwrap().state(),
            Some(JobState::Done)
        );

        let mut unleased = a.find_by_id("j1").await.unwrap().unwrap();
        unleased.transition_to(JobState::Queued);
        assert_eq!(
            a.save(&unleased).await.unwrap_err().error_code(),
            "LEASE_CONFLICT"
        );
    }

    #[tokio::test]
    async fn test_create_rejects_taken_id() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("connector.db").display());
        let a = SqliteStateEntityStore::<Job>::new(
            migrations::open_sqlite(&url).await.unwrap(),
            LeaseSettings::new("runtime-a"),
        );
        let b = SqliteStateEntityStore::<Job>::new(
            migrations::open_sqlite(&url).await.unwrap(),
            LeaseSettings::new("runtime-b"),
        );

        let mut first = Job::aged("j1", JobState::Queued, 0);
        first.owner = "runtime-a".to_string();
        let mut second = first.clone();
        second.owner = "runtime-b".to_string();

        let (left, right) = tokio::join!(a.create(&first), b.create(&second));
        let results = [left, right];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(EngineError::AlreadyExists { .. }))));

        let stored = a.find_by_id("j1").await.unwrap().unwrap();
        let winner = if results[0].is_ok() { "runtime-a" } else { "runtime-b" };
        assert_eq!(stored.owner, winner);
        assert!(a.lease("j1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_break_renew_delete() {
        let a = store("runtime-a").await;
        let b = a.with_holder("runtime-b");
        a.save(&Job::aged("j1", JobState::Queued, 0)).await.unwrap();

        let job = a.find_by_id_and_lease("j1").await.unwrap();
        a.renew_lease(&job).await.unwrap();
        assert!(b.renew_lease(&job).await.is_err());
        assert!(b.break_lease(&job).await.is_err());
        assert!(matches!(
            b.delete("j1").await.unwrap_err(),
            EngineError::AlreadyLeased { .. }
        ));

        a.break_lease(&job).await.unwrap();
        assert!(a.lease("j1").await.unwrap().is_none());

        b.delete("j1").await.unwrap();
        assert!(matches!(
            b.delete("j1").await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
        assert!(matches!(
            a.break_lease(&job).await.unwrap_err(),
            EngineError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_query_sorting_and_paging() {
        let store = store("runtime-a").await;
        for i in 0..5 {
            store
                .save(&Job::aged(&format!("j{i}"), JobState::Queued, i))
                .await
                .unwrap();
        }

        let page = store
            .query(&QuerySpec::new().offset(1).limit(2))
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|j| j.id().to_string()).collect();
        assert_eq!(ids, vec!["j1", "j2"]);

        let desc = store
            .query(&QuerySpec::new().sort("id", SortOrder::Desc).limit(1))
            .await
            .unwrap();
        assert_eq!(desc[0].id(), "j4");
    }

    #[tokio::test]
    async fn test_file_backed_store_shared_between_pools() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("connector.db").display());
        let pool_a = migrations::open_sqlite(&url).await.unwrap();
        let pool_b = migrations::open_sqlite(&url).await.unwrap();

        let a = SqliteStateEntityStore::<Job>::new(pool_a, LeaseSettings::new("runtime-a"));
        let b = SqliteStateEntityStore::<Job>::new(pool_b, LeaseSettings::new("runtime-b"));
        for i in 0..4 {
            a.save(&Job::aged(&format!("j{i}"), JobState::Queued, i))
                .await
                .unwrap();
        }

        let (left, right) = tokio::join!(a.next_not_leased(4, &[]), b.next_not_leased(4, &[]));
        let mut ids: Vec<_> = left
            .unwrap()
            .into_iter()
            .chain(right.unwrap())
            .map(|j| j.id().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["j0", "j1", "j2", "j3"]);
    }
}
