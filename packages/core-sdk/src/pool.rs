use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::PoolError;
use crate::models::{CredentialEntry, CredentialStatus};

/** \brief 原始凭据批量分隔符。 */
pub const CREDENTIAL_DELIMITER: char = '|';

/**
 * \brief 凭据持久化后端。
 */
pub trait CredentialStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<CredentialEntry>>;
    fn save(&self, entries: &[CredentialEntry]) -> anyhow::Result<()>;
}

/**
 * \brief 添加凭据的结果。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Updated,
}

#[derive(Debug, Default)]
struct PoolState {
    entries: Vec<CredentialEntry>,
    /** \brief 上一次返回的位置；None 表示从头扫描 */
    cursor: Option<usize>,
}

impl PoolState {
    fn position(&self, identity: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.identity == identity)
    }

    fn next_eligible(&mut self) -> Option<CredentialEntry> {
        let len = self.entries.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor.map(|c| (c + 1) % len).unwrap_or(0);
        for offset in 0..len {
            let idx = (start + offset) % len;
            if self.entries[idx].is_eligible() {
                self.cursor = Some(idx);
                let entry = &mut self.entries[idx];
                entry.last_used_at = Some(OffsetDateTime::now_utc());
                return Some(entry.clone());
            }
        }
        None
    }

    fn remove_at(&mut self, idx: usize) -> CredentialEntry {
        let removed = self.entries.remove(idx);
        self.cursor = match self.cursor {
            _ if self.entries.is_empty() => None,
            Some(c) if c == idx => idx.checked_sub(1),
            Some(c) if c > idx => Some(c - 1),
            other => other,
        };
        removed
    }
}

enum PersistCommand {
    Save(Vec<CredentialEntry>),
    Flush(Sender<()>),
}

/**
 * \brief 后台写入线程：按提交顺序保存快照，积压时只写最新一份。
 */
struct StoreWriter {
    tx: Option<Sender<PersistCommand>>,
    handle: Option<JoinHandle<()>>,
}

impl StoreWriter {
    fn spawn(store: Arc<dyn CredentialStore>) -> Self {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("credential-writer".into())
            .spawn(move || write_loop(store.as_ref(), rx))
            .map_err(|err| tracing::error!(error = %err, "failed to start credential writer"))
            .ok();
        StoreWriter {
            tx: handle.as_ref().map(|_| tx),
            handle,
        }
    }

    fn submit(&self, command: PersistCommand) -> bool {
        self.tx
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for StoreWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("credential writer panicked");
            }
        }
    }
}

fn write_loop(store: &dyn CredentialStore, rx: Receiver<PersistCommand>) {
    while let Ok(first) = rx.recv() {
        let mut latest = None;
        let mut waiters = Vec::new();
        for command in std::iter::once(first).chain(rx.try_iter()) {
            match command {
                PersistCommand::Save(entries) => latest = Some(entries),
                PersistCommand::Flush(ack) => waiters.push(ack),
            }
        }
        if let Some(entries) = latest {
            if let Err(err) = store.save(&entries) {
                tracing::error!(error = %err, "failed to save credentials");
            }
        }
        for ack in waiters {
            let _ = ack.send(());
        }
    }
}

/**
 * \brief 会话凭据池：轮换、健康标记与增删改查。
 * \details 所有读写都经过同一把互斥锁；锁从不跨越 await，也不跨越存储 I/O，
 *          快照在锁内复制后交给写入线程。
 */
pub struct SessionPool {
    state: Mutex<PoolState>,
    store: Option<Arc<dyn CredentialStore>>,
    writer: Option<StoreWriter>,
}

impl SessionPool {
    /**
     * \brief 创建空池（未初始化）。
     */
    pub fn new(store: Option<Arc<dyn CredentialStore>>) -> Self {
        SessionPool {
            state: Mutex::new(PoolState::default()),
            writer: store.clone().map(StoreWriter::spawn),
            store,
        }
    }

    /**
     * \brief 由已解析的条目直接构建，主要用于测试与 CLI。
     */
    pub fn from_entries(entries: Vec<CredentialEntry>) -> Self {
        SessionPool {
            state: Mutex::new(PoolState {
                entries,
                cursor: None,
            }),
            store: None,
            writer: None,
        }
    }

    /**
     * \brief 以 `|` 分隔的原始凭据初始化，并合并持久化数据。
     * \return 有效条目数量；一个都没有时返回 NoCredentials。
     */
    pub fn initialize(&self, raw_blob: &str) -> Result<usize, PoolError> {
        let mut parsed: Vec<CredentialEntry> = Vec::new();
        let mut rejected = 0;
        for raw in raw_blob
            .split(|c| c == CREDENTIAL_DELIMITER || c == '\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            match CredentialEntry::parse(raw) {
                Ok(entry) => match parsed.iter_mut().find(|e| e.identity == entry.identity) {
                    Some(existing) => *existing = entry,
                    None => parsed.push(entry),
                },
                Err(err) => {
                    rejected += 1;
                    tracing::warn!(error = %err, "rejecting configured credential");
                }
            }
        }

        let configured = parsed.len();
        if let Some(store) = &self.store {
            match store.load() {
                Ok(saved) => merge_saved(&mut parsed, saved),
                Err(err) => tracing::error!(error = %err, "failed to load saved credentials"),
            }
        }

        if parsed.is_empty() {
            return Err(PoolError::NoCredentials { rejected });
        }

        let count = parsed.len();
        let mut state = self.lock();
        state.entries = parsed;
        state.cursor = None;
        if configured > 0 {
            self.persist(&state);
        }
        tracing::info!(
            credentials = count,
            valid = state.entries.iter().filter(|e| e.is_eligible()).count(),
            "session pool initialized"
        );
        Ok(count)
    }

    /**
     * \brief 添加凭据；identity 已存在时更新而非重复添加。
     */
    pub fn add_credential(
        &self,
        raw: &str,
        context: Option<String>,
    ) -> Result<AddOutcome, PoolError> {
        let mut entry = CredentialEntry::parse(raw)?;
        let mut state = self.lock();
        let outcome = match state.position(&entry.identity) {
            Some(idx) => {
                let existing = &mut state.entries[idx];
                existing.secret = entry.secret;
                existing.tenant = entry.tenant;
                existing.valid = true;
                if context.is_some() {
                    existing.conversation_context = context;
                }
                AddOutcome::Updated
            }
            None => {
                entry.conversation_context = context;
                state.entries.push(entry);
                AddOutcome::Added
            }
        };
        self.persist(&state);
        Ok(outcome)
    }

    /**
     * \brief 轮询下一个 enabled 且 valid 的条目。
     */
    pub fn get_next(&self) -> Option<CredentialEntry> {
        self.lock().next_eligible()
    }

    /**
     * \brief 当前活跃身份：游标所指条目仍可用则返回之，否则前进。
     */
    pub fn active(&self) -> Option<CredentialEntry> {
        let mut state = self.lock();
        if let Some(entry) = state
            .cursor
            .and_then(|c| state.entries.get(c))
            .filter(|e| e.is_eligible())
        {
            return Some(entry.clone());
        }
        state.next_eligible()
    }

    pub fn mark_invalid(&self, identity: &str) -> Result<(), PoolError> {
        self.update(identity, |e| e.valid = false)?;
        tracing::warn!(identity, "credential marked invalid");
        Ok(())
    }

    /**
     * \brief 外部重新验证后恢复条目。
     */
    pub fn revalidate(&self, identity: &str) -> Result<(), PoolError> {
        self.update(identity, |e| e.valid = true)
    }

    pub fn set_enabled(&self, identity: &str, enabled: bool) -> Result<(), PoolError> {
        self.update(identity, |e| e.enabled = enabled)
    }

    pub fn set_context(&self, identity: &str, context: Option<String>) -> Result<(), PoolError> {
        self.update(identity, |e| e.conversation_context = context)
    }

    /**
     * \brief 删除条目并重新归一化游标。
     */
    pub fn remove(&self, identity: &str) -> Result<CredentialEntry, PoolError> {
        let mut state = self.lock();
        let idx = state
            .position(identity)
            .ok_or_else(|| PoolError::NotFound(identity.to_string()))?;
        let removed = state.remove_at(idx);
        self.persist(&state);
        Ok(removed)
    }

    /**
     * \brief 脱敏快照。
     */
    pub fn status(&self) -> Vec<CredentialStatus> {
        let state = self.lock();
        state
            .entries
            .iter()
            .enumerate()
            .map(|(idx, e)| CredentialStatus {
                user_id: e.identity.clone(),
                space_id: e.tenant.clone(),
                cookie_preview: e.secret_preview(),
                thread_id: e.conversation_context.clone(),
                enabled: e.enabled,
                valid: e.valid,
                last_used: e.last_used_at.and_then(|t| t.format(&Rfc3339).ok()),
                active: state.cursor == Some(idx),
            })
            .collect()
    }

    /** \brief 可参与轮换的条目数。 */
    pub fn valid_count(&self) -> usize {
        self.lock().entries.iter().filter(|e| e.is_eligible()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(
        &self,
        identity: &str,
        apply: impl FnOnce(&mut CredentialEntry),
    ) -> Result<(), PoolError> {
        let mut state = self.lock();
        let idx = state
            .position(identity)
            .ok_or_else(|| PoolError::NotFound(identity.to_string()))?;
        apply(&mut state.entries[idx]);
        self.persist(&state);
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /**
     * \brief 等待此前提交的快照全部写入存储。
     */
    pub fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (ack, done) = mpsc::channel();
        if writer.submit(PersistCommand::Flush(ack)) {
            let _ = done.recv();
        }
    }

    /** \brief 在持锁期间调用，仅复制快照并入队，保证写入顺序与变更顺序一致。 */
    fn persist(&self, state: &PoolState) {
        if let Some(writer) = &self.writer {
            if !writer.submit(PersistCommand::Save(state.entries.clone())) {
                tracing::error!("credential writer unavailable, change not saved");
            }
        }
    }
}

/**
 * \brief 合并持久化条目：恢复已知身份的上下文与开关，追加仅存在于存储中的身份。
 */
fn merge_saved(entries: &mut Vec<CredentialEntry>, saved: Vec<CredentialEntry>) {
    for stored in saved {
        match entries.iter_mut().find(|e| e.identity == stored.identity) {
            Some(entry) => {
                if stored.conversation_context.is_some() {
                    entry.conversation_context = stored.conversation_context;
                }
                entry.enabled = stored.enabled;
                entry.last_used_at = stored.last_used_at.or(entry.last_used_at);
            }
            None => entries.push(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn raw(id: &str) -> String {
        format!(
            "token_v2=tok-{id}; notion_user_id={id}; notion_space_id=space-{id}",
            id = id
        )
    }

    fn pool_of(ids: &[&str]) -> SessionPool {
        SessionPool::from_entries(
            ids.iter()
                .map(|id| CredentialEntry::parse(&raw(id)).expect("parse"))
                .collect(),
        )
    }

    fn next_id(pool: &SessionPool) -> Option<String> {
        pool.get_next().map(|e| e.identity)
    }

    #[derive(Default)]
    struct RecordingStore {
        saved: Mutex<Vec<CredentialEntry>>,
        saves: AtomicUsize,
    }

    impl CredentialStore for RecordingStore {
        fn load(&self) -> anyhow::Result<Vec<CredentialEntry>> {
            Ok(self.saved.lock().unwrap().clone())
        }

        fn save(&self, entries: &[CredentialEntry]) -> anyhow::Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            *self.saved.lock().unwrap() = entries.to_vec();
            Ok(())
        }
    }

    #[test]
    fn test_initialize_requires_a_credential() {
        let pool = SessionPool::new(None);
        assert_eq!(
            pool.initialize("garbage|token_v2=x"),
            Err(PoolError::NoCredentials { rejected: 2 })
        );
        let blob = format!("{}|{}| |bad", raw("a"), raw("b"));
        assert_eq!(pool.initialize(&blob), Ok(2));
        assert_eq!(pool.valid_count(), 2);
    }

    #[test]
    fn test_get_next_is_fair() {
        let pool = pool_of(&["a", "b", "c"]);
        let mut seen: Vec<String> = (0..3).filter_map(|_| next_id(&pool)).collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(next_id(&pool).as_deref(), Some("a"));
        assert!(pool.status()[0].last_used.is_some());
    }

    #[test]
    fn test_get_next_skips_invalid_and_disabled() {
        let pool = pool_of(&["a", "b", "c"]);
        pool.mark_invalid("b").unwrap();
        pool.set_enabled("c", false).unwrap();
        for _ in 0..5 {
            assert_eq!(next_id(&pool).as_deref(), Some("a"));
        }
        pool.mark_invalid("a").unwrap();
        assert_eq!(next_id(&pool), None);
        pool.revalidate("b").unwrap();
        assert_eq!(next_id(&pool).as_deref(), Some("b"));
    }

    #[test]
    fn test_remove_renormalizes_cursor() {
        let pool = pool_of(&["a", "b", "c"]);
        assert_eq!(next_id(&pool).as_deref(), Some("a"));
        assert_eq!(next_id(&pool).as_deref(), Some("b"));
        assert_eq!(next_id(&pool).as_deref(), Some("c"));

        pool.remove("c").unwrap();
        assert_eq!(next_id(&pool).as_deref(), Some("a"));

        pool.remove("a").unwrap();
        assert_eq!(next_id(&pool).as_deref(), Some("b"));
        pool.remove("b").unwrap();
        assert_eq!(next_id(&pool), None);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_remove_current_continues_with_successor() {
        let pool = pool_of(&["a", "b", "c"]);
        assert_eq!(next_id(&pool).as_deref(), Some("a"));
        assert_eq!(next_id(&pool).as_deref(), Some("b"));
        pool.remove("b").unwrap();
        assert_eq!(next_id(&pool).as_deref(), Some("c"));
        assert_eq!(
            pool.remove("missing"),
            Err(PoolError::NotFound("missing".into()))
        );
    }

    #[test]
    fn test_active_sticks_until_ineligible() {
        let pool = pool_of(&["a", "b"]);
        assert_eq!(pool.active().unwrap().identity, "a");
        assert_eq!(pool.active().unwrap().identity, "a");
        pool.mark_invalid("a").unwrap();
        assert_eq!(pool.active().unwrap().identity, "b");
        assert!(pool.status()[1].active);
    }

    #[test]
    fn test_add_existing_identity_updates() {
        let pool = pool_of(&["a"]);
        pool.mark_invalid("a").unwrap();
        let updated = "token_v2=fresh; notion_user_id=a; notion_space_id=space-new";
        assert_eq!(
            pool.add_credential(updated, Some("thread-1".into())),
            Ok(AddOutcome::Updated)
        );
        assert_eq!(pool.len(), 1);
        let entry = pool.get_next().unwrap();
        assert_eq!(entry.tenant, "space-new");
        assert_eq!(entry.secret, updated);
        assert_eq!(entry.conversation_context.as_deref(), Some("thread-1"));

        assert_eq!(pool.add_credential(&raw("b"), None), Ok(AddOutcome::Added));
        assert!(matches!(
            pool.add_credential("nope", None),
            Err(PoolError::Invalid(_))
        ));
    }

    #[test]
    fn test_persistence_round_trip() {
        let store = Arc::new(RecordingStore::default());
        let pool = SessionPool::new(Some(store.clone()));
        pool.initialize(&raw("a")).unwrap();
        pool.add_credential(&raw("b"), Some("t-b".into())).unwrap();
        pool.set_enabled("a", false).unwrap();
        pool.flush();
        assert!(store.saves.load(Ordering::SeqCst) >= 1);
        assert!(!store.saved.lock().unwrap()[0].enabled);

        let restored = SessionPool::new(Some(store.clone()));
        restored.initialize(&raw("a")).unwrap();
        let status = restored.status();
        assert_eq!(status.len(), 2);
        assert!(!status[0].enabled);
        assert_eq!(status[1].user_id, "b");
        assert_eq!(status[1].thread_id.as_deref(), Some("t-b"));
        assert!(!status[1].cookie_preview.contains("tok-b"));
    }

    struct SlowStore {
        inner: RecordingStore,
        delay: Duration,
    }

    impl CredentialStore for SlowStore {
        fn load(&self) -> anyhow::Result<Vec<CredentialEntry>> {
            self.inner.load()
        }

        fn save(&self, entries: &[CredentialEntry]) -> anyhow::Result<()> {
            std::thread::sleep(self.delay);
            self.inner.save(entries)
        }
    }

    #[test]
    fn test_slow_store_does_not_stall_rotation() {
        let store = Arc::new(SlowStore {
            inner: RecordingStore::default(),
            delay: Duration::from_millis(500),
        });
        let pool = SessionPool::new(Some(store.clone()));
        pool.initialize(&format!("{}|{}", raw("a"), raw("b"))).unwrap();

        let started = Instant::now();
        pool.mark_invalid("a").unwrap();
        assert_eq!(next_id(&pool).as_deref(), Some("b"));
        assert!(
            started.elapsed() < Duration::from_millis(100),
            "rotation waited {:?}",
            started.elapsed()
        );

        pool.flush();
        let saved = store.inner.saved.lock().unwrap().clone();
        assert!(!saved.iter().find(|e| e.identity == "a").unwrap().valid);
    }

    #[test]
    fn test_saves_keep_mutation_order() {
        let store = Arc::new(RecordingStore::default());
        let pool = SessionPool::new(Some(store.clone()));
        pool.initialize(&raw("a")).unwrap();
        for i in 0..50 {
            pool.set_context("a", Some(format!("t-{}", i))).unwrap();
        }
        drop(pool);
        let saved = store.saved.lock().unwrap().clone();
        assert_eq!(saved[0].conversation_context.as_deref(), Some("t-49"));
    }

    #[test]
    fn test_initialize_from_store_only_does_not_rewrite() {
        let store = Arc::new(RecordingStore::default());
        store.save(&[CredentialEntry::parse(&raw("a")).unwrap()]).unwrap();
        let before = store.saves.load(Ordering::SeqCst);

        let pool = SessionPool::new(Some(store.clone()));
        assert_eq!(pool.initialize(""), Ok(1));
        pool.flush();
        assert_eq!(store.saves.load(Ordering::SeqCst), before);
    }
}
