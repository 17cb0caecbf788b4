//! Postgres backend (`sqlx`).
//!
//! The schema in `migrations/` carries the authoritative uniqueness rules: one registry row per
//! key space, one identity per natural/synthetic key, one association per `(owner, subject)`.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use padron_core::{
    AccessStatus, Association, AssociationStatus, IdentityProfile, KeySpace, MaterializedIdentity,
    NewIdentity, RegistryRow, RegistryRowDraft, SyncCursor,
};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use tracing::{info, warn};

use crate::{
    CursorStore, IdentityStore, IdentityTx, RegistryStore, StoreError, StoreResult, SyncLease,
    TagDiff, TagStore, UpsertBatch, UpsertReport,
};

const REGISTRY_COLUMNS: &str = "id, primary_key, secondary_key, display_name, external_barcode, \
     balance, risk_flag, last_unpaid_period, full_access_granted, controls_enabled, \
     controls_enabled_raw, raw_source, created_at, updated_at";

const IDENTITY_COLUMNS: &str = "id, natural_key, synthetic_key, registry_row_id, secondary_key, \
     display_name, given_name, family_name, external_barcode, balance, risk_flag, access_status, \
     credential_digest, created_at, refreshed_at";

const ASSOCIATION_COLUMNS: &str = "id, owner_id, subject_id, status, created_at, updated_at, ended_at";

const UPSERT_INSERT: &str = "INSERT INTO registry_rows (primary_key, secondary_key, display_name, \
     external_barcode, balance, risk_flag, last_unpaid_period, full_access_granted, \
     controls_enabled, controls_enabled_raw, raw_source, created_at, updated_at) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())";

// Only whitelisted mutable columns appear in the update set.
const UPSERT_UPDATE_SET: &str = "DO UPDATE SET display_name = EXCLUDED.display_name, \
     external_barcode = EXCLUDED.external_barcode, balance = EXCLUDED.balance, \
     risk_flag = EXCLUDED.risk_flag, last_unpaid_period = EXCLUDED.last_unpaid_period, \
     full_access_granted = EXCLUDED.full_access_granted, \
     controls_enabled = EXCLUDED.controls_enabled, \
     controls_enabled_raw = EXCLUDED.controls_enabled_raw, raw_source = EXCLUDED.raw_source, \
     updated_at = EXCLUDED.updated_at \
     RETURNING (xmax = 0) AS inserted";

const RELEASE_BARCODE_SECONDARY: &str = "UPDATE registry_rows SET external_barcode = NULL, updated_at = NOW() \
     WHERE external_barcode = $1 AND secondary_key IS DISTINCT FROM $2";

const RELEASE_BARCODE_PRIMARY: &str = "UPDATE registry_rows SET external_barcode = NULL, updated_at = NOW() \
     WHERE external_barcode = $1 AND NOT (secondary_key IS NULL AND primary_key = $2)";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects without running migrations. Never log `database_url`; it may carry credentials.
    pub async fn connect(database_url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(database_url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("registry schema migrations applied");
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct DbCursor {
    name: String,
    value: String,
    updated_at: DateTime<Utc>,
}

impl From<DbCursor> for SyncCursor {
    fn from(row: DbCursor) -> Self {
        Self {
            name: row.name,
            value: row.value,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbRegistryRow {
    id: i64,
    primary_key: Option<String>,
    secondary_key: Option<String>,
    display_name: String,
    external_barcode: Option<String>,
    balance: Option<Decimal>,
    risk_flag: Option<i16>,
    last_unpaid_period: Option<i32>,
    full_access_granted: bool,
    controls_enabled: i32,
    controls_enabled_raw: Option<String>,
    raw_source: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<DbRegistryRow> for RegistryRow {
    fn from(row: DbRegistryRow) -> Self {
        Self {
            id: row.id,
            primary_key: row.primary_key,
            secondary_key: row.secondary_key,
            display_name: row.display_name,
            external_barcode: row.external_barcode,
            balance: row.balance,
            risk_flag: row.risk_flag,
            last_unpaid_period: row.last_unpaid_period,
            full_access_granted: row.full_access_granted,
            controls_enabled: row.controls_enabled,
            controls_enabled_raw: row.controls_enabled_raw,
            raw_source: row.raw_source,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct DbIdentity {
    id: i64,
    natural_key: String,
    synthetic_key: Option<String>,
    registry_row_id: Option<i64>,
    secondary_key: Option<String>,
    display_name: String,
    given_name: String,
    family_name: String,
    external_barcode: Option<String>,
    balance: Option<Decimal>,
    risk_flag: Option<i16>,
    access_status: String,
    credential_digest: String,
    created_at: DateTime<Utc>,
    refreshed_at: DateTime<Utc>,
}

fn identity_from_db(row: DbIdentity) -> StoreResult<MaterializedIdentity> {
    let access_status = AccessStatus::parse(&row.access_status).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "identity {} has access_status {:?}",
            row.id, row.access_status
        ))
    })?;
    Ok(MaterializedIdentity {
        id: row.id,
        natural_key: row.natural_key,
        synthetic_key: row.synthetic_key,
        profile: IdentityProfile {
            registry_row_id: row.registry_row_id.unwrap_or_default(),
            secondary_key: row.secondary_key,
            display_name: row.display_name,
            given_name: row.given_name,
            family_name: row.family_name,
            external_barcode: row.external_barcode,
            balance: row.balance,
            risk_flag: row.risk_flag,
            access_status,
        },
        credential_digest: row.credential_digest,
        created_at: row.created_at,
        refreshed_at: row.refreshed_at,
    })
}

#[derive(Debug, FromRow)]
struct DbAssociation {
    id: i64,
    owner_id: i64,
    subject_id: i64,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

fn association_from_db(row: DbAssociation) -> StoreResult<Association> {
    let status = AssociationStatus::parse(&row.status).ok_or_else(|| {
        StoreError::Corrupt(format!("association {} has status {:?}", row.id, row.status))
    })?;
    Ok(Association {
        id: row.id,
        owner_id: row.owner_id,
        subject_id: row.subject_id,
        status,
        created_at: row.created_at,
        updated_at: row.updated_at,
        ended_at: row.ended_at,
    })
}

#[async_trait]
impl CursorStore for PgStore {
    async fn get_cursor(&self, name: &str) -> StoreResult<Option<SyncCursor>> {
        let row = sqlx::query_as::<_, DbCursor>(
            "SELECT name, value, updated_at FROM sync_cursors WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn set_cursor(&self, name: &str, value: &str) -> StoreResult<SyncCursor> {
        let row = sqlx::query_as::<_, DbCursor>(
            r#"
            INSERT INTO sync_cursors (name, value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE
               SET value = EXCLUDED.value,
                   updated_at = EXCLUDED.updated_at
            RETURNING name, value, updated_at
            "#,
        )
        .bind(name)
        .bind(value)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }
}

async fn upsert_one(
    tx: &mut Transaction<'static, Postgres>,
    space: KeySpace,
    draft: &RegistryRowDraft,
    report: &mut UpsertReport,
) -> StoreResult<()> {
    if let Some(barcode) = &draft.external_barcode {
        let release = match space {
            KeySpace::Secondary => RELEASE_BARCODE_SECONDARY,
            KeySpace::Primary => RELEASE_BARCODE_PRIMARY,
        };
        let released = sqlx::query(release)
            .bind(barcode)
            .bind(draft.match_key())
            .execute(&mut **tx)
            .await?
            .rows_affected();
        if released > 0 {
            warn!(
                barcode = %barcode,
                key_space = space.as_str(),
                key = draft.match_key(),
                "barcode moved from another registry row"
            );
            report.barcode_reassignments += released as usize;
        }
    }

    let conflict = match space {
        KeySpace::Secondary => "ON CONFLICT (secondary_key) WHERE secondary_key IS NOT NULL",
        KeySpace::Primary => "ON CONFLICT (primary_key) WHERE secondary_key IS NULL",
    };
    let sql = format!("{UPSERT_INSERT} {conflict} {UPSERT_UPDATE_SET}");
    let inserted: bool = sqlx::query_scalar(&sql)
        .bind(&draft.primary_key)
        .bind(&draft.secondary_key)
        .bind(&draft.display_name)
        .bind(&draft.external_barcode)
        .bind(draft.balance)
        .bind(draft.risk_flag)
        .bind(draft.last_unpaid_period)
        .bind(draft.full_access_granted)
        .bind(draft.controls_enabled)
        .bind(&draft.controls_enabled_raw)
        .bind(&draft.raw_source)
        .fetch_one(&mut **tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::Conflict(format!("{} key {}", space.as_str(), draft.match_key()))
            } else {
                err.into()
            }
        })?;
    if inserted {
        report.inserted += 1;
    } else {
        report.updated += 1;
    }
    Ok(())
}

#[async_trait]
impl RegistryStore for PgStore {
    async fn upsert_registry_rows(&self, batch: &UpsertBatch) -> StoreResult<UpsertReport> {
        let mut report = UpsertReport::default();
        if batch.is_empty() {
            return Ok(report);
        }
        let mut tx = self.pool.begin().await?;
        for draft in &batch.secondary {
            upsert_one(&mut tx, KeySpace::Secondary, draft, &mut report).await?;
        }
        for draft in &batch.primary {
            upsert_one(&mut tx, KeySpace::Primary, draft, &mut report).await?;
        }
        tx.commit().await?;
        Ok(report)
    }

    async fn find_registry_row_by_key(&self, key: &str) -> StoreResult<Option<RegistryRow>> {
        let sql = format!(
            "SELECT {REGISTRY_COLUMNS} FROM registry_rows \
             WHERE primary_key = $1 OR secondary_key = $1 \
             ORDER BY (primary_key = $1) DESC NULLS LAST, id \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, DbRegistryRow>(&sql)
            .bind(key.trim())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn list_registry_rows(&self, after_id: i64, limit: usize) -> StoreResult<Vec<RegistryRow>> {
        let sql = format!(
            "SELECT {REGISTRY_COLUMNS} FROM registry_rows WHERE id > $1 ORDER BY id LIMIT $2"
        );
        let rows = sqlx::query_as::<_, DbRegistryRow>(&sql)
            .bind(after_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_registry_rows(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM registry_rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl TagStore for PgStore {
    async fn tag_registry_row(&self, owner_id: i64, row_id: i64, assigned_by: Option<i64>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO owner_registry_tags (owner_id, registry_row_id, assigned_by, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (owner_id, registry_row_id) DO NOTHING
            "#,
        )
        .bind(owner_id)
        .bind(row_id)
        .bind(assigned_by)
        .execute(&self.pool)
        .await;
        match result {
            Ok(done) => Ok(done.rows_affected() > 0),
            Err(err) if is_foreign_key_violation(&err) => {
                Err(StoreError::NotFound(format!("registry row {row_id}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn untag_registry_row(&self, owner_id: i64, row_id: i64) -> StoreResult<bool> {
        let done = sqlx::query(
            "DELETE FROM owner_registry_tags WHERE owner_id = $1 AND registry_row_id = $2",
        )
        .bind(owner_id)
        .bind(row_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn replace_tags(&self, owner_id: i64, row_ids: &[i64], assigned_by: Option<i64>) -> StoreResult<TagDiff> {
        let mut wanted = row_ids.to_vec();
        wanted.sort_unstable();
        wanted.dedup();

        let mut tx = self.pool.begin().await?;
        let existing: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM registry_rows WHERE id = ANY($1)")
                .bind(&wanted)
                .fetch_all(&mut *tx)
                .await?;
        if let Some(missing) = wanted.iter().find(|id| !existing.contains(*id)) {
            return Err(StoreError::NotFound(format!("registry row {missing}")));
        }

        let removed: Vec<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM owner_registry_tags
             WHERE owner_id = $1
               AND NOT (registry_row_id = ANY($2))
            RETURNING registry_row_id
            "#,
        )
        .bind(owner_id)
        .bind(&wanted)
        .fetch_all(&mut *tx)
        .await?;

        let added: Vec<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO owner_registry_tags (owner_id, registry_row_id, assigned_by, created_at)
            SELECT $1, row_id, $3, NOW() FROM UNNEST($2::BIGINT[]) AS row_id
            ON CONFLICT (owner_id, registry_row_id) DO NOTHING
            RETURNING registry_row_id
            "#,
        )
        .bind(owner_id)
        .bind(&wanted)
        .bind(assigned_by)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        let mut diff = TagDiff { added, removed };
        diff.added.sort_unstable();
        diff.removed.sort_unstable();
        Ok(diff)
    }

    async fn list_tagged(&self, owner_id: i64) -> StoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar(
            "SELECT registry_row_id FROM owner_registry_tags WHERE owner_id = $1 ORDER BY registry_row_id",
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

pub struct PgIdentityTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl IdentityTx for PgIdentityTx {
    async fn lock_registry_row(&mut self, id: i64) -> StoreResult<Option<RegistryRow>> {
        let sql = format!("SELECT {REGISTRY_COLUMNS} FROM registry_rows WHERE id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, DbRegistryRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.map(Into::into))
    }

    async fn registry_row_exists(&mut self, id: i64) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM registry_rows WHERE id = $1)")
                .bind(id)
                .fetch_one(&mut *self.tx)
                .await?;
        Ok(exists)
    }

    async fn identity_by_natural_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM materialized_identities WHERE natural_key = $1");
        sqlx::query_as::<_, DbIdentity>(&sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(identity_from_db)
            .transpose()
    }

    async fn identity_by_synthetic_key(&mut self, key: &str) -> StoreResult<Option<MaterializedIdentity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM materialized_identities WHERE synthetic_key = $1");
        sqlx::query_as::<_, DbIdentity>(&sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(identity_from_db)
            .transpose()
    }

    async fn synthetic_identity_for_row(&mut self, row_id: i64) -> StoreResult<Option<MaterializedIdentity>> {
        let sql = format!(
            "SELECT {IDENTITY_COLUMNS} FROM materialized_identities \
             WHERE registry_row_id = $1 AND synthetic_key IS NOT NULL"
        );
        sqlx::query_as::<_, DbIdentity>(&sql)
            .bind(row_id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(identity_from_db)
            .transpose()
    }

    async fn insert_identity(&mut self, identity: &NewIdentity) -> StoreResult<Option<MaterializedIdentity>> {
        // ON CONFLICT DO NOTHING keeps the transaction usable when a concurrent insert wins.
        let sql = format!(
            "INSERT INTO materialized_identities (natural_key, synthetic_key, registry_row_id, \
             secondary_key, display_name, given_name, family_name, external_barcode, balance, \
             risk_flag, access_status, credential_digest, created_at, refreshed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, NOW(), NOW()) \
             ON CONFLICT DO NOTHING \
             RETURNING {IDENTITY_COLUMNS}"
        );
        let profile = &identity.profile;
        sqlx::query_as::<_, DbIdentity>(&sql)
            .bind(&identity.natural_key)
            .bind(&identity.synthetic_key)
            .bind(profile.registry_row_id)
            .bind(&profile.secondary_key)
            .bind(&profile.display_name)
            .bind(&profile.given_name)
            .bind(&profile.family_name)
            .bind(&profile.external_barcode)
            .bind(profile.balance)
            .bind(profile.risk_flag)
            .bind(profile.access_status.as_str())
            .bind(&identity.credential_digest)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(identity_from_db)
            .transpose()
    }

    async fn refresh_identity(&mut self, id: i64, profile: &IdentityProfile) -> StoreResult<MaterializedIdentity> {
        let sql = format!(
            "UPDATE materialized_identities \
                SET registry_row_id = $2, secondary_key = $3, display_name = $4, \
                    given_name = $5, family_name = $6, external_barcode = $7, balance = $8, \
                    risk_flag = $9, access_status = $10, refreshed_at = NOW() \
              WHERE id = $1 \
             RETURNING {IDENTITY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbIdentity>(&sql)
            .bind(id)
            .bind(profile.registry_row_id)
            .bind(&profile.secondary_key)
            .bind(&profile.display_name)
            .bind(&profile.given_name)
            .bind(&profile.family_name)
            .bind(&profile.external_barcode)
            .bind(profile.balance)
            .bind(profile.risk_flag)
            .bind(profile.access_status.as_str())
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("identity {id}")))?;
        identity_from_db(row)
    }

    async fn association_by_id(&mut self, id: i64) -> StoreResult<Option<Association>> {
        let sql = format!("SELECT {ASSOCIATION_COLUMNS} FROM associations WHERE id = $1");
        sqlx::query_as::<_, DbAssociation>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .map(association_from_db)
            .transpose()
    }

    async fn is_row_tagged(&mut self, owner_id: i64, row_id: i64) -> StoreResult<bool> {
        let tagged: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM owner_registry_tags WHERE owner_id = $1 AND registry_row_id = $2)",
        )
        .bind(owner_id)
        .bind(row_id)
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(tagged)
    }

    async fn activate_association(&mut self, owner_id: i64, subject_id: i64) -> StoreResult<Association> {
        let sql = format!(
            "INSERT INTO associations (owner_id, subject_id, status, created_at, updated_at, ended_at) \
             VALUES ($1, $2, 'active', NOW(), NOW(), NULL) \
             ON CONFLICT (owner_id, subject_id) DO UPDATE \
                SET status = 'active', \
                    ended_at = NULL, \
                    updated_at = CASE WHEN associations.status = 'ended' \
                                      THEN NOW() ELSE associations.updated_at END \
             RETURNING {ASSOCIATION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbAssociation>(&sql)
            .bind(owner_id)
            .bind(subject_id)
            .fetch_one(&mut *self.tx)
            .await?;
        association_from_db(row)
    }

    async fn end_association(&mut self, id: i64) -> StoreResult<Association> {
        let sql = format!(
            "UPDATE associations \
                SET status = 'ended', \
                    ended_at = COALESCE(ended_at, NOW()), \
                    updated_at = NOW() \
              WHERE id = $1 \
             RETURNING {ASSOCIATION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbAssociation>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("association {id}")))?;
        association_from_db(row)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for PgStore {
    async fn begin(&self) -> StoreResult<Box<dyn IdentityTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgIdentityTx { tx }))
    }
}

#[async_trait]
impl SyncLease for PgStore {
    async fn try_acquire_lease(&self, name: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO sync_leases (name, holder, acquired_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(secs => $3))
            ON CONFLICT (name) DO UPDATE
               SET holder = EXCLUDED.holder,
                   acquired_at = EXCLUDED.acquired_at,
                   expires_at = EXCLUDED.expires_at
             WHERE sync_leases.expires_at < NOW()
                OR sync_leases.holder = EXCLUDED.holder
            RETURNING holder
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(acquired.is_some())
    }

    async fn release_lease(&self, name: &str, holder: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23503").unwrap_or(false);
    }
    false
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().map(|code| code == "23505").unwrap_or(false);
    }
    false
}
