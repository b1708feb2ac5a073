//! SQLite-backed key-value store with migrations
//!
//! Emulates the hash/string/list/sorted-set primitives the search core needs
//! on top of four tables. There is no vector index engine here, so searches
//! against this backend always take the brute-force path.

use super::backend::{HashFields, KvStore, ScanPage};
use crate::error::{DocCacheError, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite store with migration support
pub struct SqliteStore {
    pool: DbPool,
}

/// Every key, whichever table it lives in
const ALL_KEYS: &str = "SELECT key FROM kv_hashes
     UNION SELECT key FROM kv_strings
     UNION SELECT key FROM kv_lists
     UNION SELECT key FROM kv_zsets";

/// `ALL_KEYS` minus expired strings, with the current time in millis bound at `?now_param`
fn live_keys(now_param: usize) -> String {
    format!(
        "SELECT key FROM kv_hashes
         UNION SELECT key FROM kv_strings WHERE expires_at IS NULL OR expires_at > ?{}
         UNION SELECT key FROM kv_lists
         UNION SELECT key FROM kv_zsets",
        now_param
    )
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`
    pub fn open(db_path: &Path, pool_size: u32, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocCacheError::Io {
                source: e,
                context: format!("Failed to create database directory: {:?}", parent),
            })?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = {};",
                busy_timeout_ms
            ))
        });

        let pool = Pool::builder().max_size(pool_size).build(manager)?;

        let store = Self { pool };
        store.migrate()?;

        tracing::info!("Opened sqlite store at {}", db_path.display());
        Ok(store)
    }

    /// Get a connection from the pool
    pub fn get_conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM _migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        for (version, migration) in MIGRATIONS.iter().enumerate() {
            let version = version as i32 + 1;

            if version > current_version {
                tracing::info!("Applying migration {}", version);

                conn.execute_batch(migration)?;

                conn.execute(
                    "INSERT INTO _migrations (version, applied_at) VALUES (?1, datetime('now'))",
                    params![version],
                )?;
            }
        }

        Ok(())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lowest string strictly greater than every string starting with `prefix`
fn prefix_upper_bound(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        if let Some(next) = char::from_u32(last as u32 + 1) {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

impl KvStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn ping(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    fn hset(&self, key: &str, fields: &HashFields) -> Result<()> {
        self.hset_many(&[(key.to_string(), fields.clone())])
    }

    fn hset_many(&self, records: &[(String, HashFields)]) -> Result<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
            let mut clear = tx.prepare_cached("DELETE FROM kv_hashes WHERE key = ?1")?;
            let mut insert = tx.prepare_cached(
                "INSERT INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)",
            )?;
            for (key, fields) in records {
                clear.execute(params![key])?;
                for (field, value) in fields {
                    insert.execute(params![key, field, value])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn hgetall(&self, key: &str) -> Result<Option<HashFields>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare_cached("SELECT field, value FROM kv_hashes WHERE key = ?1")?;
        let rows = stmt.query_map(params![key], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut fields = HashFields::new();
        for row in rows {
            let (field, value) = row?;
            fields.insert(field, value);
        }

        Ok(if fields.is_empty() { None } else { Some(fields) })
    }

    fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn hget_many(&self, keys: &[String], field: &str) -> Result<Vec<Option<Vec<u8>>>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare_cached("SELECT value FROM kv_hashes WHERE key = ?1 AND field = ?2")?;
        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(
                stmt.query_row(params![key, field], |row| row.get(0))
                    .optional()?,
            );
        }
        Ok(values)
    }

    fn scan_hashes(
        &self,
        prefix: &str,
        after: Option<&str>,
        count: usize,
    ) -> Result<(Vec<(String, HashFields)>, Option<String>)> {
        let page = self.scan_prefix(prefix, after, count)?;
        if page.keys.is_empty() {
            return Ok((Vec::new(), page.cursor));
        }

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare_cached("SELECT field, value FROM kv_hashes WHERE key = ?1")?;
        let mut records = Vec::with_capacity(page.keys.len());
        for key in page.keys {
            let rows = stmt.query_map(params![key], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut fields = HashFields::new();
            for row in rows {
                let (field, value) = row?;
                fields.insert(field, value);
            }
            if !fields.is_empty() {
                records.push((key, fields));
            }
        }
        Ok((records, page.cursor))
    }

    fn del(&self, keys: &[String]) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut deleted = 0;
        {
            let mut exists = tx.prepare_cached(&format!(
                "SELECT COUNT(*) FROM ({}) WHERE key = ?1",
                ALL_KEYS
            ))?;
            for key in keys {
                let present: i64 = exists.query_row(params![key], |row| row.get(0))?;
                if present > 0 {
                    deleted += 1;
                }
                for table in ["kv_hashes", "kv_strings", "kv_lists", "kv_zsets"] {
                    tx.execute(&format!("DELETE FROM {} WHERE key = ?1", table), params![key])?;
                }
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    fn del_prefix(&self, prefix: &str) -> Result<usize> {
        // Expired strings are gone already as far as callers can tell
        self.get_conn()?.execute(
            "DELETE FROM kv_strings WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)
             AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![prefix, prefix_upper_bound(prefix), now_millis()],
        )?;

        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self.scan_prefix(prefix, cursor.as_deref(), 1000)?;
            keys.extend(page.keys);
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        if keys.is_empty() {
            return Ok(0);
        }
        self.del(&keys)
    }

    fn scan_prefix(&self, prefix: &str, after: Option<&str>, count: usize) -> Result<ScanPage> {
        let conn = self.get_conn()?;
        let (lower, op) = match after.filter(|a| *a >= prefix) {
            Some(after) => (after, ">"),
            None => (prefix, ">="),
        };
        let upper = prefix_upper_bound(prefix);

        // Fetch one extra key to learn whether another page follows
        let limit = count as i64 + 1;
        let sql = format!(
            "SELECT key FROM ({}) WHERE key {} ?1 AND (?2 IS NULL OR key < ?2)
             ORDER BY key LIMIT ?3",
            live_keys(4),
            op
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let mut keys = stmt
            .query_map(params![lower, upper, limit, now_millis()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let cursor = if keys.len() > count {
            keys.truncate(count);
            keys.last().cloned()
        } else {
            None
        };

        Ok(ScanPage { keys, cursor })
    }

    fn count_prefix(&self, prefix: &str) -> Result<usize> {
        let conn = self.get_conn()?;
        let upper = prefix_upper_bound(prefix);
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM ({}) WHERE key >= ?1 AND (?2 IS NULL OR key < ?2)",
                live_keys(3)
            ),
            params![prefix, upper, now_millis()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.get_conn()?;
        let row: Option<(Vec<u8>, Option<i64>)> = conn
            .query_row(
                "SELECT value, expires_at FROM kv_strings WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((_, Some(expires_at))) if expires_at <= now_millis() => {
                conn.execute(
                    "DELETE FROM kv_strings WHERE key = ?1 AND expires_at <= ?2",
                    params![key, now_millis()],
                )?;
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let conn = self.get_conn()?;
        let expires_at = ttl.map(|ttl| now_millis() + ttl.as_millis() as i64);
        conn.execute(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )?;
        Ok(())
    }

    fn incr_by(&self, key: &str, amount: i64) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<Vec<u8>> = tx
            .query_row(
                "SELECT value FROM kv_strings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        let current = match current {
            Some(bytes) => std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .ok_or_else(|| {
                    DocCacheError::store("sqlite", format!("value at '{}' is not an integer", key))
                })?,
            None => 0,
        };

        let next = current + amount;
        tx.execute(
            "INSERT INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, NULL)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, next.to_string().into_bytes()],
        )?;
        tx.commit()?;
        Ok(next)
    }

    fn lpush_capped(&self, key: &str, value: &[u8], cap: usize) -> Result<usize> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO kv_lists (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        tx.execute(
            "DELETE FROM kv_lists WHERE key = ?1 AND id NOT IN (
                 SELECT id FROM kv_lists WHERE key = ?1 ORDER BY id DESC LIMIT ?2
             )",
            params![key, cap as i64],
        )?;
        let len: i64 = tx.query_row(
            "SELECT COUNT(*) FROM kv_lists WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(len as usize)
    }

    fn lrange(&self, key: &str, limit: usize) -> Result<Vec<Vec<u8>>> {
        let conn = self.get_conn()?;
        let mut stmt = conn
            .prepare_cached("SELECT value FROM kv_lists WHERE key = ?1 ORDER BY id DESC LIMIT ?2")?;
        let values = stmt
            .query_map(params![key, limit as i64], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(values)
    }

    fn zincr_by(&self, key: &str, member: &str, amount: f64) -> Result<f64> {
        let conn = self.get_conn()?;
        let score = conn.query_row(
            "INSERT INTO kv_zsets (key, member, score) VALUES (?1, ?2, ?3)
             ON CONFLICT(key, member) DO UPDATE SET score = score + excluded.score
             RETURNING score",
            params![key, member, amount],
            |row| row.get(0),
        )?;
        Ok(score)
    }

    fn zrevrange(&self, key: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT member, score FROM kv_zsets WHERE key = ?1
             ORDER BY score DESC, member ASC LIMIT ?2",
        )?;
        let members = stmt
            .query_map(params![key, limit as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(members)
    }
}

/// Database migrations (each string is one migration)
const MIGRATIONS: &[&str] = &[
    // Migration 1: Redis-like keyspace
    r#"
    -- Hash records (vector records live here)
    CREATE TABLE kv_hashes (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value BLOB NOT NULL,
        PRIMARY KEY (key, field)
    ) WITHOUT ROWID;

    -- Plain values and counters, with optional expiry in unix millis
    CREATE TABLE kv_strings (
        key TEXT PRIMARY KEY,
        value BLOB NOT NULL,
        expires_at INTEGER
    );

    CREATE INDEX idx_kv_strings_expires ON kv_strings(expires_at);

    -- Lists, newest entry has the highest id
    CREATE TABLE kv_lists (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        key TEXT NOT NULL,
        value BLOB NOT NULL
    );

    CREATE INDEX idx_kv_lists_key ON kv_lists(key, id);

    -- Sorted sets
    CREATE TABLE kv_zsets (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        score REAL NOT NULL,
        PRIMARY KEY (key, member)
    ) WITHOUT ROWID;
    "#,
];

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(temp: &TempDir) -> SqliteStore {
        SqliteStore::open(&temp.path().join("test.db"), 4, 5000).unwrap()
    }

    fn fields(pairs: &[(&str, &str)]) -> HashFields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");

        let _store = SqliteStore::open(&db_path, 2, 5000).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_migrations() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        let conn = store.get_conn().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM _migrations", [], |row| row.get(0))
            .unwrap();

        assert_eq!(version, MIGRATIONS.len() as i32);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");

        drop(SqliteStore::open(&db_path, 2, 5000).unwrap());
        let store = SqliteStore::open(&db_path, 2, 5000).unwrap();
        store.ping().unwrap();
    }

    #[test]
    fn test_hash_replace_is_wholesale() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store
            .hset("vector:a", &fields(&[("doc_id", "d1"), ("title", "old")]))
            .unwrap();
        store.hset("vector:a", &fields(&[("doc_id", "d2")])).unwrap();

        let record = store.hgetall("vector:a").unwrap().unwrap();
        assert_eq!(record.len(), 1);
        assert_eq!(record["doc_id"], b"d2".to_vec());
        assert_eq!(store.hget("vector:a", "title").unwrap(), None);
    }

    #[test]
    fn test_scan_pages_through_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        for i in 0..5 {
            store
                .hset(&format!("vector:{}", i), &fields(&[("doc_id", "d")]))
                .unwrap();
        }
        store.set("vectorx", b"not under prefix", None).unwrap();
        store.set("cache:search:1", b"{}", None).unwrap();

        let first = store.scan_prefix("vector:", None, 2).unwrap();
        assert_eq!(first.keys, vec!["vector:0", "vector:1"]);
        let second = store
            .scan_prefix("vector:", first.cursor.as_deref(), 2)
            .unwrap();
        assert_eq!(second.keys, vec!["vector:2", "vector:3"]);
        let third = store
            .scan_prefix("vector:", second.cursor.as_deref(), 2)
            .unwrap();
        assert_eq!(third.keys, vec!["vector:4"]);
        assert!(third.cursor.is_none());

        assert_eq!(store.count_prefix("vector:").unwrap(), 5);
    }

    #[test]
    fn test_string_expiry_is_lazy() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store
            .set("cache:search:x", b"payload", Some(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(store.get("cache:search:x").unwrap(), None);

        store.set("cache:search:y", b"payload", None).unwrap();
        assert_eq!(store.get("cache:search:y").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn test_expired_strings_are_not_counted_or_scanned() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store
            .set("cache:search:old", b"payload", Some(Duration::from_millis(1)))
            .unwrap();
        store
            .set("cache:search:new", b"payload", Some(Duration::from_secs(60)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.count_prefix("cache:search:").unwrap(), 1);
        let page = store.scan_prefix("cache:search:", None, 10).unwrap();
        assert_eq!(page.keys, vec!["cache:search:new"]);

        assert_eq!(store.del_prefix("cache:search:").unwrap(), 1);
        assert_eq!(store.count_prefix("cache:search:").unwrap(), 0);
    }

    #[test]
    fn test_counters_lists_and_sorted_sets() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        assert_eq!(store.incr_by("stats:total_searches", 1).unwrap(), 1);
        assert_eq!(store.incr_by("stats:total_searches", 2).unwrap(), 3);

        for i in 0..5 {
            store
                .lpush_capped("stats:response_times", i.to_string().as_bytes(), 3)
                .unwrap();
        }
        let times = store.lrange("stats:response_times", 10).unwrap();
        assert_eq!(times, vec![b"4".to_vec(), b"3".to_vec(), b"2".to_vec()]);

        store.zincr_by("stats:popular_queries", "rust", 1.0).unwrap();
        store.zincr_by("stats:popular_queries", "sql", 1.0).unwrap();
        assert_eq!(
            store.zincr_by("stats:popular_queries", "rust", 1.0).unwrap(),
            2.0
        );
        let top = store.zrevrange("stats:popular_queries", 1).unwrap();
        assert_eq!(top, vec![("rust".to_string(), 2.0)]);
    }

    #[test]
    fn test_delete_counts_existing_keys() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        store.hset("vector:a", &fields(&[("doc_id", "d")])).unwrap();
        store.set("stats:x", b"1", None).unwrap();

        let deleted = store
            .del(&[
                "vector:a".to_string(),
                "stats:x".to_string(),
                "missing".to_string(),
            ])
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count_prefix("").unwrap(), 0);
    }

    #[test]
    fn test_no_vector_index_support() {
        let temp_dir = TempDir::new().unwrap();
        let store = open_store(&temp_dir);

        assert!(store.vector_index_api_version().is_none());
    }

    #[test]
    fn test_prefix_upper_bound() {
        assert_eq!(prefix_upper_bound("vector:"), Some("vector;".to_string()));
        assert_eq!(prefix_upper_bound(""), None);
    }
}
