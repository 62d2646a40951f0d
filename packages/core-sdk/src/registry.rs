use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::models::Frame;

/**
 * \brief 单个输出流的关闭控制，生产端与注册表共享。
 */
#[derive(Debug, Clone)]
pub struct SessionControl {
    id: u64,
    client_id: String,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl SessionControl {
    fn new(client_id: &str) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SessionControl {
            id: COUNTER.fetch_add(1, Ordering::SeqCst),
            client_id: client_id.to_string(),
            cancel: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /**
     * \brief 关闭会话；只有第一次调用返回 true。
     */
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/**
 * \brief 输出流的生产端。
 */
#[derive(Debug)]
pub struct StreamWriter {
    tx: mpsc::UnboundedSender<Frame>,
    control: SessionControl,
}

impl StreamWriter {
    /**
     * \brief 写入一帧；会话已关闭或消费端已离开时返回 false 且不写入。
     */
    pub fn send(&self, frame: Frame) -> bool {
        if self.is_abandoned() {
            return false;
        }
        self.tx.send(frame).is_ok()
    }

    pub fn is_abandoned(&self) -> bool {
        self.control.is_closed() || self.tx.is_closed()
    }

    /**
     * \brief 等待客户端断开：注册表关闭或消费端被丢弃。
     */
    pub async fn abandoned(&self) {
        tokio::select! {
            _ = self.control.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }
}

/**
 * \brief 输出流的消费端，由边界层挂到自己的响应上。
 */
#[derive(Debug)]
pub struct StreamSession {
    rx: mpsc::UnboundedReceiver<Frame>,
    control: SessionControl,
}

impl StreamSession {
    pub fn id(&self) -> u64 {
        self.control.id
    }

    pub fn client_id(&self) -> &str {
        &self.control.client_id
    }

    pub fn is_closed(&self) -> bool {
        self.control.is_closed()
    }

    pub fn control(&self) -> &SessionControl {
        &self.control
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /**
     * \brief 读到流结束为止。
     */
    pub async fn collect_frames(mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<Frame> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/**
 * \brief 创建一对相连的生产端/消费端。
 */
pub fn session_channel(client_id: &str) -> (StreamWriter, StreamSession) {
    let (tx, rx) = mpsc::unbounded_channel();
    let control = SessionControl::new(client_id);
    (
        StreamWriter {
            tx,
            control: control.clone(),
        },
        StreamSession { rx, control },
    )
}

/** \brief 每个客户端至多一个活跃输出流。 */
#[derive(Debug, Default, Clone)]
pub struct StreamRegistry {
    inner: Arc<Mutex<HashMap<String, SessionControl>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief 注册会话；同一客户端已有会话时先强制关闭旧会话。
     * \return 是否替换了旧会话
     */
    pub fn register(&self, session: &StreamSession) -> bool {
        let control = session.control().clone();
        let previous = self.lock().insert(control.client_id.clone(), control);
        match previous {
            Some(old) => {
                if old.close() {
                    tracing::debug!(client_id = %old.client_id, session = old.id, "superseded stream");
                }
                true
            }
            None => false,
        }
    }

    /**
     * \brief 关闭并移除客户端的流；重复调用无副作用。
     */
    pub fn close(&self, client_id: &str) -> bool {
        let removed = self.lock().remove(client_id);
        match removed {
            Some(control) => {
                tracing::debug!(client_id, session = control.id, "closing stream");
                control.close()
            }
            None => false,
        }
    }

    /**
     * \brief 会话自行注销：仅当注册的仍是该会话时才移除。
     */
    pub fn release(&self, client_id: &str, session_id: u64) {
        let mut guard = self.lock();
        if guard.get(client_id).map(|c| c.id) == Some(session_id) {
            guard.remove(client_id);
        }
    }

    /**
     * \brief 关闭全部流，用于有序退出。
     */
    pub fn close_all(&self) -> usize {
        let drained: Vec<SessionControl> = self.lock().drain().map(|(_, c)| c).collect();
        tracing::info!(streams = drained.len(), "closing all active streams");
        drained.iter().filter(|c| c.close()).count()
    }

    pub fn is_active(&self, client_id: &str) -> bool {
        self.lock().contains_key(client_id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionControl>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_supersedes_old_session() {
        let registry = StreamRegistry::new();
        let (old_writer, old_session) = session_channel("client");
        assert!(!registry.register(&old_session));

        let (new_writer, new_session) = session_channel("client");
        assert!(registry.register(&new_session));

        assert!(old_session.is_closed());
        assert!(!old_session.control().close(), "old session closed exactly once");
        assert!(!old_writer.send(Frame::Done));
        assert!(!new_session.is_closed());
        assert!(new_writer.send(Frame::Done));
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let registry = StreamRegistry::new();
        let (writer, session) = session_channel("client");
        registry.register(&session);

        assert!(registry.close("client"));
        assert!(!registry.close("client"));
        assert!(!registry.is_active("client"));
        writer.abandoned().await;
        drop(writer);
        assert!(session.collect_frames().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_keeps_newer_session() {
        let registry = StreamRegistry::new();
        let (_w1, first) = session_channel("client");
        registry.register(&first);
        let (_w2, second) = session_channel("client");
        registry.register(&second);

        registry.release("client", first.id());
        assert!(registry.is_active("client"));
        registry.release("client", second.id());
        assert!(!registry.is_active("client"));
    }

    #[tokio::test]
    async fn test_dropped_consumer_abandons_writer() {
        let (writer, session) = session_channel("client");
        drop(session);
        writer.abandoned().await;
        assert!(writer.is_abandoned());
        assert!(!writer.send(Frame::Done));
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = StreamRegistry::new();
        let (_a, sa) = session_channel("a");
        let (_b, sb) = session_channel("b");
        registry.register(&sa);
        registry.register(&sb);
        assert_eq!(registry.close_all(), 2);
        assert_eq!(registry.active_count(), 0);
        assert!(sa.is_closed() && sb.is_closed());
    }
}
