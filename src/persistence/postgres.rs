//! PostgreSQL implementation of [`StatusStore`].
//!
//! Counter claims (together with their pending slots), freed-index takes
//! and token writes are each a single statement, so PostgreSQL row locking
//! provides the atomicity the allocator relies on. Releases and status
//! updates run inside a transaction holding the list row lock.
//!
//! Index slots live in `index_slots`; a claimed index without a row is
//! issued.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use super::StatusStore;
use crate::config::ServiceConfig;
use crate::domain::status_list::StatusList;
use crate::domain::{
    Claim, ListId, ListRecord, ListState, ListStorageMetadata, PoolId, Release, StoredToken,
};
use crate::error::ServiceError;

type ListRow = (
    Uuid,
    String,
    String,
    i16,
    i64,
    i64,
    i64,
    String,
    DateTime<Utc>,
    DateTime<Utc>,
);

const LIST_COLUMNS: &str =
    "id, uri, pool_id, bits, size, claimed, version, state, created_at, expires_at";

type TokenRow = (Vec<u8>, i64, i64, DateTime<Utc>, DateTime<Utc>);

fn to_db(value: u64) -> Result<i64, ServiceError> {
    i64::try_from(value).map_err(|_| ServiceError::Persistence(format!("{value} exceeds BIGINT")))
}

fn to_db_all(values: &[u64]) -> Result<Vec<i64>, ServiceError> {
    values.iter().map(|&v| to_db(v)).collect()
}

fn from_db(value: i64) -> Result<u64, ServiceError> {
    u64::try_from(value).map_err(|_| ServiceError::Persistence(format!("negative value {value}")))
}

fn bits_from_db(value: i16) -> Result<u8, ServiceError> {
    u8::try_from(value).map_err(|_| ServiceError::Persistence(format!("invalid bits {value}")))
}

fn record_from_row(row: ListRow) -> Result<ListRecord, ServiceError> {
    let (id, uri, pool_id, bits, size, claimed, version, state, created_at, expires_at) = row;
    Ok(ListRecord {
        list_id: ListId::from_uuid(id),
        uri,
        pool_id: PoolId::new(pool_id).map_err(|e| ServiceError::Persistence(e.to_string()))?,
        bits: bits_from_db(bits)?,
        size: from_db(size)?,
        claimed: from_db(claimed)?,
        version: from_db(version)?,
        state: ListState::parse(&state)
            .ok_or_else(|| ServiceError::Persistence(format!("unknown list state {state:?}")))?,
        created_at,
        expires_at,
    })
}

fn metadata_from_row(list_id: ListId, row: &TokenRow) -> Result<ListStorageMetadata, ServiceError> {
    let (_, version, data_version, created_at, expires_at) = row;
    Ok(ListStorageMetadata {
        list_id,
        version: from_db(*version)?,
        data_version: from_db(*data_version)?,
        created_at: *created_at,
        expires_at: *expires_at,
    })
}

/// PostgreSQL-backed [`StatusStore`] using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a store over an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects using the database settings of `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] if the database is unreachable.
    pub async fn connect(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(std::time::Duration::from_secs(
                config.database_connect_timeout_secs,
            ))
            .connect(&config.database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the bundled schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Persistence`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), ServiceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ServiceError::Persistence(e.to_string()))
    }

    async fn lists_where(
        &self,
        pool_id: &PoolId,
        only_active: bool,
    ) -> Result<Vec<ListRecord>, ServiceError> {
        let sql = if only_active {
            format!(
                "SELECT {LIST_COLUMNS} FROM lists WHERE pool_id = $1 AND state = 'active' \
                 ORDER BY created_at, id"
            )
        } else {
            format!("SELECT {LIST_COLUMNS} FROM lists WHERE pool_id = $1 ORDER BY created_at, id")
        };
        let rows = sqlx::query_as::<_, ListRow>(&sql)
            .bind(pool_id.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn require_list(&self, list_id: ListId) -> Result<ListRecord, ServiceError> {
        self.list(list_id)
            .await?
            .ok_or_else(|| ServiceError::ListNotFound(list_id.to_string()))
    }
}

#[async_trait]
impl StatusStore for PostgresStore {
    async fn create_or_verify_pool(
        &self,
        pool_id: &PoolId,
        size: u64,
        bits: u8,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO pools (id, size, bits) VALUES ($1, $2, $3) ON CONFLICT (id) DO NOTHING",
        )
        .bind(pool_id.as_str())
        .bind(to_db(size)?)
        .bind(i16::from(bits))
        .execute(&self.pool)
        .await?;

        let (stored_size, stored_bits) =
            sqlx::query_as::<_, (i64, i16)>("SELECT size, bits FROM pools WHERE id = $1")
                .bind(pool_id.as_str())
                .fetch_one(&self.pool)
                .await?;
        if from_db(stored_size)? != size || bits_from_db(stored_bits)? != bits {
            return Err(ServiceError::Config(format!(
                "pool {pool_id} already stored with size {stored_size} and {stored_bits} bit(s)"
            )));
        }
        Ok(())
    }

    async fn create_list(&self, record: &ListRecord) -> Result<(), ServiceError> {
        let data = StatusList::new(record.size, record.bits)?;
        sqlx::query(
            "INSERT INTO lists (id, uri, pool_id, bits, size, claimed, version, state, data, \
             created_at, expires_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(record.list_id.as_uuid())
        .bind(&record.uri)
        .bind(record.pool_id.as_str())
        .bind(i16::from(record.bits))
        .bind(to_db(record.size)?)
        .bind(to_db(record.claimed)?)
        .bind(to_db(record.version)?)
        .bind(record.state.as_str())
        .bind(data.as_bytes())
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list(&self, list_id: ListId) -> Result<Option<ListRecord>, ServiceError> {
        let row = sqlx::query_as::<_, ListRow>(&format!(
            "SELECT {LIST_COLUMNS} FROM lists WHERE id = $1"
        ))
        .bind(list_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(record_from_row).transpose()
    }

    async fn current_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.lists_where(pool_id, true).await
    }

    async fn all_lists(&self, pool_id: &PoolId) -> Result<Vec<ListRecord>, ServiceError> {
        self.lists_where(pool_id, false).await
    }

    async fn claim_batch(&self, list_id: ListId, count: u64) -> Result<Claim, ServiceError> {
        let claimed = sqlx::query_as::<_, (i64, i64)>(
            "WITH prev AS (SELECT claimed FROM lists WHERE id = $1 AND state = 'active' FOR UPDATE), \
             upd AS (UPDATE lists SET claimed = LEAST(lists.size, prev.claimed + $2) FROM prev \
               WHERE lists.id = $1 RETURNING prev.claimed AS start, lists.claimed AS stop), \
             pending AS (INSERT INTO index_slots (list_id, idx, state) \
               SELECT $1, generate_series(start, stop - 1), 'pending' FROM upd) \
             SELECT start, stop FROM upd",
        )
        .bind(list_id.as_uuid())
        .bind(to_db(count)?)
        .fetch_optional(&self.pool)
        .await?;

        match claimed {
            Some((start, end)) => {
                let start = from_db(start)?;
                Ok(Claim {
                    start,
                    count: from_db(end)?.saturating_sub(start),
                })
            }
            None => {
                let record = self.require_list(list_id).await?;
                Ok(Claim {
                    start: record.claimed,
                    count: 0,
                })
            }
        }
    }

    async fn set_list_state(&self, list_id: ListId, state: ListState) -> Result<(), ServiceError> {
        let result = sqlx::query("UPDATE lists SET state = $2 WHERE id = $1")
            .bind(list_id.as_uuid())
            .bind(state.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::ListNotFound(list_id.to_string()));
        }
        Ok(())
    }

    async fn mark_issued(&self, list_id: ListId, indices: &[u64]) -> Result<(), ServiceError> {
        let indices = to_db_all(indices)?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM index_slots WHERE list_id = $1 AND idx = ANY($2) AND state = 'pending'",
        )
        .bind(list_id.as_uuid())
        .bind(&indices)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE index_slots SET state = 'reissued' \
             WHERE list_id = $1 AND idx = ANY($2) AND state = 'recycled'",
        )
        .bind(list_id.as_uuid())
        .bind(&indices)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn return_unissued(
        &self,
        list_id: ListId,
        indices: &[u64],
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE index_slots SET state = 'freed' \
             WHERE list_id = $1 AND idx = ANY($2) AND state IN ('pending', 'recycled')",
        )
        .bind(list_id.as_uuid())
        .bind(to_db_all(indices)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn free_issued(
        &self,
        list_id: ListId,
        index: u64,
        reusable: bool,
    ) -> Result<Option<Release>, ServiceError> {
        let index = to_db(index)?;
        let mut tx = self.pool.begin().await?;
        // Serializes with claim_batch, which holds the row for update.
        let claimed =
            sqlx::query_scalar::<_, i64>("SELECT claimed FROM lists WHERE id = $1 FOR SHARE")
                .bind(list_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if claimed.is_none_or(|claimed| index >= claimed) {
            return Ok(None);
        }

        let (state, release) = if reusable {
            ("freed", Release::Reusable)
        } else {
            ("retired", Release::Retired)
        };
        let inserted = sqlx::query(
            "INSERT INTO index_slots (list_id, idx, state) VALUES ($1, $2, $3) \
             ON CONFLICT (list_id, idx) DO NOTHING",
        )
        .bind(list_id.as_uuid())
        .bind(index)
        .bind(state)
        .execute(&mut *tx)
        .await?;
        let release = if inserted.rows_affected() == 1 {
            Some(release)
        } else {
            let retired = sqlx::query(
                "UPDATE index_slots SET state = 'retired' \
                 WHERE list_id = $1 AND idx = $2 AND state = 'reissued'",
            )
            .bind(list_id.as_uuid())
            .bind(index)
            .execute(&mut *tx)
            .await?;
            (retired.rows_affected() == 1).then_some(Release::Retired)
        };
        tx.commit().await?;
        Ok(release)
    }

    async fn take_freed(&self, list_id: ListId, max: u64) -> Result<Vec<u64>, ServiceError> {
        let rows = sqlx::query_scalar::<_, i64>(
            "UPDATE index_slots SET state = 'recycled' WHERE (list_id, idx) IN ( \
               SELECT list_id, idx FROM index_slots WHERE list_id = $1 AND state = 'freed' \
               ORDER BY idx LIMIT $2 FOR UPDATE SKIP LOCKED) \
             RETURNING idx",
        )
        .bind(list_id.as_uuid())
        .bind(to_db(max)?)
        .fetch_all(&self.pool)
        .await?;
        let mut taken = rows.into_iter().map(from_db).collect::<Result<Vec<_>, _>>()?;
        taken.sort_unstable();
        Ok(taken)
    }

    async fn update_status(
        &self,
        list_id: ListId,
        index: u64,
        value: u8,
    ) -> Result<u64, ServiceError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, (i64, i16, Vec<u8>)>(
            "SELECT size, bits, data FROM lists WHERE id = $1 FOR UPDATE",
        )
        .bind(list_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let Some((size, bits, data)) = row else {
            return Err(ServiceError::ListNotFound(list_id.to_string()));
        };

        let mut list = StatusList::from_bytes(from_db(size)?, bits_from_db(bits)?, data)?;
        list.set(index, value)?;

        let version = sqlx::query_scalar::<_, i64>(
            "UPDATE lists SET data = $2, version = version + 1 WHERE id = $1 RETURNING version",
        )
        .bind(list_id.as_uuid())
        .bind(list.as_bytes())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        from_db(version)
    }

    async fn list_data(&self, list_id: ListId) -> Result<(StatusList, u64), ServiceError> {
        let row = sqlx::query_as::<_, (i64, i16, Vec<u8>, i64)>(
            "SELECT size, bits, data, version FROM lists WHERE id = $1",
        )
        .bind(list_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        let Some((size, bits, data, version)) = row else {
            return Err(ServiceError::ListNotFound(list_id.to_string()));
        };
        let list = StatusList::from_bytes(from_db(size)?, bits_from_db(bits)?, data)?;
        Ok((list, from_db(version)?))
    }

    async fn metadata(&self, list_id: ListId) -> Result<Option<ListStorageMetadata>, ServiceError> {
        Ok(self.load_token(list_id).await?.map(|t| t.metadata))
    }

    async fn load_token(&self, list_id: ListId) -> Result<Option<StoredToken>, ServiceError> {
        let row = sqlx::query_as::<_, TokenRow>(
            "SELECT token, version, data_version, created_at, expires_at FROM tokens \
             WHERE list_id = $1",
        )
        .bind(list_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            let metadata = metadata_from_row(list_id, &row)?;
            Ok(StoredToken {
                bytes: row.0,
                metadata,
            })
        })
        .transpose()
    }

    async fn store_token(
        &self,
        list_id: ListId,
        token: &[u8],
        metadata: &ListStorageMetadata,
        expected_version: u64,
    ) -> Result<(), ServiceError> {
        let result = if expected_version == 0 {
            sqlx::query(
                "INSERT INTO tokens (list_id, token, version, data_version, created_at, expires_at) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (list_id) DO NOTHING",
            )
            .bind(list_id.as_uuid())
            .bind(token)
            .bind(to_db(metadata.version)?)
            .bind(to_db(metadata.data_version)?)
            .bind(metadata.created_at)
            .bind(metadata.expires_at)
            .execute(&self.pool)
            .await?
        } else {
            sqlx::query(
                "UPDATE tokens SET token = $2, version = $3, data_version = $4, created_at = $5, \
                 expires_at = $6 WHERE list_id = $1 AND version = $7",
            )
            .bind(list_id.as_uuid())
            .bind(token)
            .bind(to_db(metadata.version)?)
            .bind(to_db(metadata.data_version)?)
            .bind(metadata.created_at)
            .bind(metadata.expires_at)
            .bind(to_db(expected_version)?)
            .execute(&self.pool)
            .await?
        };

        if result.rows_affected() == 1 {
            return Ok(());
        }
        let found = self.metadata(list_id).await?.map_or(0, |m| m.version);
        let uri = self.require_list(list_id).await?.uri;
        Err(ServiceError::StaleWrite {
            uri,
            expected: expected_version,
            found,
        })
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            "INSERT INTO leases (name, holder, expires_at) VALUES ($1, $2, now() + $3) \
             ON CONFLICT (name) DO UPDATE SET holder = EXCLUDED.holder, \
             expires_at = EXCLUDED.expires_at \
             WHERE leases.holder = EXCLUDED.holder OR leases.expires_at <= now()",
        )
        .bind(name)
        .bind(holder)
        .bind(ttl)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), ServiceError> {
        sqlx::query("DELETE FROM leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn db_conversions_reject_out_of_range_values() {
        assert!(to_db(u64::MAX).is_err());
        assert!(from_db(-1).is_err());
        assert!(bits_from_db(300).is_err());
        assert_eq!(to_db(42).ok(), Some(42));
    }

    #[test]
    fn row_maps_to_record() {
        let now = Utc::now();
        let id = Uuid::new_v4();
        let row: ListRow = (
            id,
            format!("https://status.example.com/{id}"),
            "mdl".to_string(),
            2,
            128,
            16,
            3,
            "frozen".to_string(),
            now,
            now,
        );
        let Ok(record) = record_from_row(row) else {
            panic!("row should map");
        };
        assert_eq!(record.list_id, ListId::from_uuid(id));
        assert_eq!(record.state, ListState::Frozen);
        assert_eq!(record.remaining(), 112);
    }
}
