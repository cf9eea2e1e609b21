//! Receiver-side persistence of partial downloads.
//!
//! Every file the receiver has started is remembered under the sender's
//! content hash, so an interrupted transfer resumes where it stopped
//! instead of starting over. The production store is a single sqlite
//! table; tests and storeless runs use an in-memory map and trust the
//! filesystem alone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::transfer::{FileMetaReq, SendFilesMeta};

const CREATE_TABLE_SQL: &str = "\
    create table if not exists burrow_recv(\
        hash text not null, \
        size integer not null, \
        pos integer not null, \
        expired datetime, \
        updated datetime, \
        name text not null, \
        full text not null, \
        hostname text, \
        ips text, \
        whoami text, \
        cost text, \
        primary key(hash)\
    )";

const INSERT_SQL: &str = "insert into burrow_recv\
    (hash, size, pos, expired, updated, name, full, hostname, ips, whoami) \
    values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_POS_SQL: &str =
    "update burrow_recv set pos = ?, updated = ?, cost = ? where hash = ?";

const GET_SQL: &str = "select hash, size, pos, expired, updated, name, full, \
    hostname, ips, whoami, cost from burrow_recv where hash = ?";

/// One partially or fully received file, keyed by the sender's content
/// hash. `pos` never exceeds `size`; `expired` is a wall-clock deadline
/// after which the row may be garbage collected.
#[derive(Debug, Clone, PartialEq)]
pub struct RecvRecord {
    pub hash: String,
    pub size: u64,
    pub pos: u64,
    pub expired: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub name: String,
    pub full: String,
    pub hostname: String,
    pub ips: String,
    pub whoami: String,
    pub cost: String,
}

/// How long a partial download is kept before it may be discarded.
const RECORD_TTL_HOURS: i64 = 24;

fn new_record(file: &FileMetaReq, dir: &Path, meta: &SendFilesMeta) -> RecvRecord {
    let now = Utc::now();
    RecvRecord {
        hash: file.hash.clone(),
        size: file.size,
        pos: 0,
        expired: now + Duration::hours(RECORD_TTL_HOURS),
        updated: now,
        name: file.clean_name.clone(),
        full: dir.join(&file.clean_name).to_string_lossy().into_owned(),
        hostname: meta.hostname.clone(),
        ips: meta.ips.clone(),
        whoami: meta.whoami.clone(),
        cost: String::new(),
    }
}

/// Persistence for receive progress. A transfer holds a single writer
/// per record; concurrent sessions rely on the backing store's own
/// transactions.
#[allow(async_fn_in_trait)]
pub trait RecvStore {
    async fn get(&self, hash: &str) -> Result<Option<RecvRecord>>;

    /// Return the record for this file, creating it at position zero if
    /// this is the first time we see the hash.
    async fn insert_or_load(
        &self,
        file: &FileMetaReq,
        dir: &Path,
        meta: &SendFilesMeta,
    ) -> Result<RecvRecord>;

    /// Persist a new position. Fails if no row matched; callers log and
    /// carry on rather than aborting the transfer.
    async fn update_position(&self, hash: &str, pos: u64, cost: &str) -> Result<()>;
}

/// The sqlite-backed store used by the receive command.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(dsn: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(dsn)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &SqliteRow) -> std::result::Result<RecvRecord, sqlx::Error> {
    Ok(RecvRecord {
        hash: row.try_get("hash")?,
        size: row.try_get::<i64, _>("size")? as u64,
        pos: row.try_get::<i64, _>("pos")? as u64,
        expired: row.try_get("expired")?,
        updated: row.try_get("updated")?,
        name: row.try_get("name")?,
        full: row.try_get("full")?,
        hostname: row.try_get::<Option<String>, _>("hostname")?.unwrap_or_default(),
        ips: row.try_get::<Option<String>, _>("ips")?.unwrap_or_default(),
        whoami: row.try_get::<Option<String>, _>("whoami")?.unwrap_or_default(),
        cost: row.try_get::<Option<String>, _>("cost")?.unwrap_or_default(),
    })
}

impl RecvStore for SqliteStore {
    async fn get(&self, hash: &str) -> Result<Option<RecvRecord>> {
        let row = sqlx::query(GET_SQL)
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn insert_or_load(
        &self,
        file: &FileMetaReq,
        dir: &Path,
        meta: &SendFilesMeta,
    ) -> Result<RecvRecord> {
        if let Some(existing) = self.get(&file.hash).await? {
            log::debug!("resume record found for {}: pos {}", existing.name, existing.pos);
            return Ok(existing);
        }

        let r = new_record(file, dir, meta);
        sqlx::query(INSERT_SQL)
            .bind(&r.hash)
            .bind(r.size as i64)
            .bind(r.pos as i64)
            .bind(r.expired)
            .bind(r.updated)
            .bind(&r.name)
            .bind(&r.full)
            .bind(&r.hostname)
            .bind(&r.ips)
            .bind(&r.whoami)
            .execute(&self.pool)
            .await?;
        Ok(r)
    }

    async fn update_position(&self, hash: &str, pos: u64, cost: &str) -> Result<()> {
        let result = sqlx::query(UPDATE_POS_SQL)
            .bind(pos as i64)
            .bind(Utc::now())
            .bind(cost)
            .bind(hash)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            return Err(Error::Store(sqlx::Error::RowNotFound));
        }
        Ok(())
    }
}

/// In-memory fallback when no database is configured. Resume decisions
/// then rest entirely on what is on disk, which the transfer layer
/// verifies by hash anyway.
#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<String, RecvRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecvStore for MemoryStore {
    async fn get(&self, hash: &str) -> Result<Option<RecvRecord>> {
        Ok(self.records.lock().await.get(hash).cloned())
    }

    async fn insert_or_load(
        &self,
        file: &FileMetaReq,
        dir: &Path,
        meta: &SendFilesMeta,
    ) -> Result<RecvRecord> {
        let mut records = self.records.lock().await;
        let r = records
            .entry(file.hash.clone())
            .or_insert_with(|| new_record(file, dir, meta));
        Ok(r.clone())
    }

    async fn update_position(&self, hash: &str, pos: u64, cost: &str) -> Result<()> {
        let mut records = self.records.lock().await;
        let r = records
            .get_mut(hash)
            .ok_or(Error::Store(sqlx::Error::RowNotFound))?;
        r.pos = pos;
        r.updated = Utc::now();
        r.cost = cost.to_string();
        Ok(())
    }
}

/// Shares open sqlite handles between sessions by connection string,
/// with a refcount so the pool closes when the last session ends.
#[derive(Default)]
pub struct StoreManager {
    stores: Mutex<HashMap<String, (SqliteStore, usize)>>,
}

impl StoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, dsn: &str) -> Result<SqliteStore> {
        let mut stores = self.stores.lock().await;
        if let Some((store, refs)) = stores.get_mut(dsn) {
            *refs += 1;
            return Ok(store.clone());
        }
        let store = SqliteStore::open(dsn).await?;
        stores.insert(dsn.to_string(), (store.clone(), 1));
        Ok(store)
    }

    pub async fn release(&self, dsn: &str) {
        let mut stores = self.stores.lock().await;
        if let Some((store, refs)) = stores.get_mut(dsn) {
            *refs -= 1;
            if *refs == 0 {
                store.close().await;
                stores.remove(dsn);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> FileMetaReq {
        FileMetaReq {
            clean_name: "sample.bin".into(),
            full_name: "/src/sample.bin".into(),
            size: 1024,
            hash: "12345678901234".into(),
        }
    }

    fn sample_meta() -> SendFilesMeta {
        SendFilesMeta {
            whoami: "tester".into(),
            hostname: "testhost".into(),
            ips: "192.0.2.7".into(),
            files: vec![sample_file()],
        }
    }

    #[tokio::test]
    async fn test_sqlite_insert_get_update() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        let file = sample_file();
        let meta = sample_meta();

        assert_eq!(store.get(&file.hash).await.unwrap(), None);

        let r = store
            .insert_or_load(&file, Path::new("/dst"), &meta)
            .await
            .unwrap();
        assert_eq!(r.pos, 0);
        assert_eq!(r.size, 1024);
        assert_eq!(r.full, "/dst/sample.bin");
        assert!(r.expired > Utc::now());

        store.update_position(&file.hash, 512, "1s").await.unwrap();
        let got = store.get(&file.hash).await.unwrap().unwrap();
        assert_eq!(got.pos, 512);
        assert_eq!(got.cost, "1s");

        // A second load sees the stored row, not a fresh one.
        let again = store
            .insert_or_load(&file, Path::new("/elsewhere"), &meta)
            .await
            .unwrap();
        assert_eq!(again.pos, 512);
        assert_eq!(again.full, "/dst/sample.bin");
    }

    #[tokio::test]
    async fn test_sqlite_update_missing_row_fails() {
        let store = SqliteStore::open(":memory:").await.unwrap();
        assert!(store.update_position("nope", 1, "").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        let file = sample_file();
        let meta = sample_meta();

        let r = store
            .insert_or_load(&file, Path::new("out"), &meta)
            .await
            .unwrap();
        assert_eq!(r.pos, 0);

        store.update_position(&file.hash, 77, "2s").await.unwrap();
        assert_eq!(store.get(&file.hash).await.unwrap().unwrap().pos, 77);

        assert!(store.update_position("missing", 1, "").await.is_err());
    }

    #[tokio::test]
    async fn test_store_manager_refcounts() {
        let manager = StoreManager::new();
        let a = manager.get(":memory:").await.unwrap();
        let _b = manager.get(":memory:").await.unwrap();

        let file = sample_file();
        a.insert_or_load(&file, Path::new("."), &sample_meta())
            .await
            .unwrap();

        // First release keeps the pool alive for the other holder.
        manager.release(":memory:").await;
        assert!(a.get(&file.hash).await.unwrap().is_some());

        manager.release(":memory:").await;
        assert_eq!(manager.stores.lock().await.len(), 0);
    }
}
