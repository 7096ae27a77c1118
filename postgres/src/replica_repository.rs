//! `PostgreSQL` replica repository.
//!
//! Replicas of every kind share one table; each row holds the version in its
//! own column, so the version guard is a single conditional statement and
//! never a read-modify-write in the application.

use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::marker::PhantomData;
use ticketbus_core::{EntityId, Replica, ReplicaError, ReplicaFuture, ReplicaRepository, Version};

/// Statement creating the replica table.
pub const CREATE_REPLICAS_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS replicas (
        kind TEXT NOT NULL,
        id TEXT NOT NULL,
        version BIGINT NOT NULL CHECK (version >= 0),
        data JSONB NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (kind, id)
    )
";

/// `PostgreSQL`-backed [`ReplicaRepository`].
///
/// `kind` separates replica types sharing the table (`"ticket"`, `"order"`).
/// The replica body is stored as JSONB; id and version live in their own
/// columns.
///
/// # Example
///
/// ```no_run
/// use ticketbus_postgres::PostgresReplicaRepository;
/// # use ticketbus_core::{EntityId, Replica, Version};
/// # #[derive(Clone, serde::Serialize, serde::Deserialize)]
/// # struct TicketReplica { id: EntityId, version: Version }
/// # impl Replica for TicketReplica {
/// #     fn id(&self) -> &EntityId { &self.id }
/// #     fn version(&self) -> Version { self.version }
/// #     fn set_version(&mut self, version: Version) { self.version = version; }
/// # }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let tickets = PostgresReplicaRepository::<TicketReplica>::connect(
///     "postgres://localhost/orders",
///     "ticket",
/// )
/// .await?;
/// tickets.migrate().await?;
/// # Ok(())
/// # }
/// ```
pub struct PostgresReplicaRepository<R> {
    pool: PgPool,
    kind: String,
    _replica: PhantomData<fn() -> R>,
}

impl<R> Clone for PostgresReplicaRepository<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            kind: self.kind.clone(),
            _replica: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for PostgresReplicaRepository<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresReplicaRepository")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<R> PostgresReplicaRepository<R>
where
    R: Replica + Serialize + DeserializeOwned,
{
    /// Create a repository over an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool, kind: impl Into<String>) -> Self {
        Self {
            pool,
            kind: kind.into(),
            _replica: PhantomData,
        }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Storage`] if the database cannot be reached.
    pub async fn connect(database_url: &str, kind: impl Into<String>) -> Result<Self, ReplicaError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(storage)?;
        Ok(Self::from_pool(pool, kind))
    }

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the replica table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicaError::Storage`] if the statement fails.
    pub async fn migrate(&self) -> Result<(), ReplicaError> {
        sqlx::query(CREATE_REPLICAS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        tracing::debug!(kind = %self.kind, "Replica table ready");
        Ok(())
    }

    fn encode(replica: &R) -> Result<(i64, serde_json::Value), ReplicaError> {
        let version = column_version(replica.version())?;
        let data = serde_json::to_value(replica).map_err(|e| ReplicaError::Corrupt {
            id: replica.id().clone(),
            reason: format!("cannot encode replica: {e}"),
        })?;
        Ok((version, data))
    }

    fn decode(id: &EntityId, version: i64, data: serde_json::Value) -> Result<R, ReplicaError> {
        let corrupt = |reason: String| ReplicaError::Corrupt {
            id: id.clone(),
            reason,
        };
        let version = u64::try_from(version)
            .map_err(|_| corrupt(format!("negative version {version}")))?;
        let mut replica: R =
            serde_json::from_value(data).map_err(|e| corrupt(format!("cannot decode replica: {e}")))?;
        // The column is authoritative; the body is written in the same statement.
        replica.set_version(Version::new(version));
        Ok(replica)
    }
}

impl<R> ReplicaRepository<R> for PostgresReplicaRepository<R>
where
    R: Replica + Serialize + DeserializeOwned,
{
    fn fetch<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, Option<R>> {
        Box::pin(async move {
            let row = sqlx::query("SELECT version, data FROM replicas WHERE kind = $1 AND id = $2")
                .bind(&self.kind)
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;

            row.map(|row| {
                let version: i64 = row.try_get("version").map_err(storage)?;
                let data: serde_json::Value = row.try_get("data").map_err(storage)?;
                Self::decode(id, version, data)
            })
            .transpose()
        })
    }

    fn insert_if_absent(&self, replica: R) -> ReplicaFuture<'_, bool> {
        Box::pin(async move {
            let (version, data) = Self::encode(&replica)?;
            let result = sqlx::query(
                r"
                INSERT INTO replicas (kind, id, version, data)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (kind, id) DO NOTHING
                ",
            )
            .bind(&self.kind)
            .bind(replica.id().as_str())
            .bind(version)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn replace_if_version(&self, replica: R, expected: Version) -> ReplicaFuture<'_, bool> {
        Box::pin(async move {
            let (version, data) = Self::encode(&replica)?;
            let expected_column = column_version(expected)?;
            let result = sqlx::query(
                r"
                UPDATE replicas
                SET version = $3, data = $4, updated_at = now()
                WHERE kind = $1 AND id = $2 AND version = $5
                ",
            )
            .bind(&self.kind)
            .bind(replica.id().as_str())
            .bind(version)
            .bind(data)
            .bind(expected_column)
            .execute(&self.pool)
            .await
            .map_err(storage)?;

            let replaced = result.rows_affected() == 1;
            if !replaced {
                metrics::counter!("ticketbus_replica_write_conflicts_total", "kind" => self.kind.clone())
                    .increment(1);
                tracing::debug!(
                    kind = %self.kind,
                    id = %replica.id(),
                    expected = %expected,
                    "Conditional replica update matched no row"
                );
            }
            Ok(replaced)
        })
    }

    fn remove<'a>(&'a self, id: &'a EntityId) -> ReplicaFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM replicas WHERE kind = $1 AND id = $2")
                .bind(&self.kind)
                .bind(id.as_str())
                .execute(&self.pool)
                .await
                .map_err(storage)?;
            Ok(result.rows_affected() > 0)
        })
    }
}

#[allow(clippy::needless_pass_by_value)]
fn storage(error: sqlx::Error) -> ReplicaError {
    ReplicaError::Storage(error.to_string())
}

fn column_version(version: Version) -> Result<i64, ReplicaError> {
    i64::try_from(version.value())
        .map_err(|_| ReplicaError::Storage(format!("version {version} exceeds BIGINT")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn versions_beyond_bigint_are_rejected() {
        assert_eq!(column_version(Version::new(7)).unwrap(), 7);
        assert!(matches!(
            column_version(Version::new(u64::MAX)),
            Err(ReplicaError::Storage(_))
        ));
    }

    #[test]
    fn schema_keys_rows_by_kind_and_id() {
        assert!(CREATE_REPLICAS_TABLE.contains("PRIMARY KEY (kind, id)"));
        assert!(CREATE_REPLICAS_TABLE.contains("version BIGINT NOT NULL"));
    }
}
