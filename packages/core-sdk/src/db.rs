use anyhow::{Context, Result};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::{thread, time::Duration};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::CredentialEntry;
use crate::pool::CredentialStore;

/**
 * \brief 基于 SQLite 的凭据持久化。
 * \details 整表快照写入：每次 save 在一个事务里清空后按池内顺序重写。
 */
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /**
     * \brief 打开（或创建）数据库文件并迁移。
     */
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open credential database {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        migrate(&conn)?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS credentials (
            position INTEGER NOT NULL,
            identity TEXT PRIMARY KEY,
            tenant   TEXT NOT NULL,
            secret   TEXT NOT NULL,
            conversation_context TEXT,
            enabled  INTEGER NOT NULL DEFAULT 1,
            valid    INTEGER NOT NULL DEFAULT 1,
            last_used_at TEXT
        );
        "#,
        )
    })?;
    Ok(())
}

impl CredentialStore for SqliteStore {
    fn load(&self) -> Result<Vec<CredentialEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT identity, tenant, secret, conversation_context, enabled, valid, last_used_at
             FROM credentials ORDER BY position ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let last_used: Option<String> = row.get(6)?;
            Ok(CredentialEntry {
                identity: row.get(0)?,
                tenant: row.get(1)?,
                secret: row.get(2)?,
                conversation_context: row.get(3)?,
                enabled: row.get::<_, i64>(4)? != 0,
                valid: row.get::<_, i64>(5)? != 0,
                last_used_at: last_used.and_then(|s| OffsetDateTime::parse(&s, &Rfc3339).ok()),
            })
        })?;
        let mut out = Vec::new();
        for entry in rows {
            out.push(entry?);
        }
        Ok(out)
    }

    fn save(&self, entries: &[CredentialEntry]) -> Result<()> {
        let mut conn = self.lock();
        retry_on_locked(|| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM credentials", [])?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO credentials
                     (position, identity, tenant, secret, conversation_context, enabled, valid, last_used_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for (position, e) in entries.iter().enumerate() {
                    let last_used = e.last_used_at.and_then(|t| t.format(&Rfc3339).ok());
                    stmt.execute(params![
                        position as i64,
                        e.identity,
                        e.tenant,
                        e.secret,
                        e.conversation_context,
                        e.enabled as i64,
                        e.valid as i64,
                        last_used,
                    ])?;
                }
            }
            tx.commit()
        })?;
        tracing::debug!(credentials = entries.len(), "credentials saved");
        Ok(())
    }
}

fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                tracing::debug!(attempt, "database locked, retrying");
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SessionPool;
    use std::sync::Arc;
    use time::macros::datetime;

    fn entry(user: &str) -> CredentialEntry {
        CredentialEntry::parse(&format!(
            "token_v2=tok-{user}; notion_user_id={user}; notion_space_id=space-{user}"
        ))
        .expect("parse")
    }

    #[test]
    fn test_save_and_load_preserves_order_and_flags() {
        let store = SqliteStore::open_in_memory().expect("open");
        let mut b = entry("b");
        b.enabled = false;
        b.valid = false;
        b.conversation_context = Some("thread-b".into());
        b.last_used_at = Some(datetime!(2025-01-02 03:04:05 UTC));
        let a = entry("a");

        store.save(&[b.clone(), a.clone()]).expect("save");
        let loaded = store.load().expect("load");
        assert_eq!(loaded, vec![b, a.clone()]);

        store.save(&[a.clone()]).expect("save again");
        assert_eq!(store.load().expect("load"), vec![a]);
    }

    #[test]
    fn test_open_file_survives_reopen() {
        let path = std::env::temp_dir().join(format!("notion-relay-test-{}.db", uuid::Uuid::new_v4()));
        {
            let store = SqliteStore::open(&path).expect("open");
            store.save(&[entry("a")]).expect("save");
        }
        let store = SqliteStore::open(&path).expect("reopen");
        assert_eq!(store.load().expect("load").len(), 1);
        drop(store);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_pool_restores_saved_state() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let mut saved = entry("a");
        saved.conversation_context = Some("thread-a".into());
        saved.enabled = false;
        store.save(&[saved, entry("z")]).expect("seed");

        let pool = SessionPool::new(Some(store.clone()));
        let count = pool
            .initialize("token_v2=new; notion_user_id=a; notion_space_id=space-a")
            .expect("initialize");
        assert_eq!(count, 2);

        let status = pool.status();
        let a = status.iter().find(|s| s.user_id == "a").expect("a");
        assert_eq!(a.thread_id.as_deref(), Some("thread-a"));
        assert!(!a.enabled);
        assert!(status.iter().any(|s| s.user_id == "z"));

        pool.flush();
        let persisted = store.load().expect("load");
        assert_eq!(
            persisted.iter().find(|e| e.identity == "a").expect("a").secret,
            "token_v2=new; notion_user_id=a; notion_space_id=space-a"
        );
    }
}
