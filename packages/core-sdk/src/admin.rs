use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::RngCore;

/** \brief 管理员会话有效期。 */
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/** \brief 过期会话的清理周期。 */
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/**
 * \brief 管理员登录凭据。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl AdminCredentials {
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username && self.password == password
    }
}

#[derive(Debug)]
struct Session {
    username: String,
    issued_at: Instant,
}

/**
 * \brief 登录后签发的会话令牌表，令牌在 TTL 内可替代静态 Bearer 令牌。
 */
#[derive(Debug)]
pub struct AdminSessions {
    ttl: Duration,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Default for AdminSessions {
    fn default() -> Self {
        Self::new(SESSION_TTL)
    }
}

impl AdminSessions {
    pub fn new(ttl: Duration) -> Self {
        AdminSessions {
            ttl,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /**
     * \brief 签发新令牌（32 字节随机数的十六进制）。
     */
    pub fn issue(&self, username: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        self.lock().insert(
            token.clone(),
            Session {
                username: username.to_string(),
                issued_at: Instant::now(),
            },
        );
        token
    }

    /**
     * \brief 校验令牌；过期令牌在此处被移除。
     * \return 令牌所属的用户名。
     */
    pub fn verify(&self, token: &str) -> Option<String> {
        let mut sessions = self.lock();
        let session = sessions.get(token)?;
        if session.issued_at.elapsed() < self.ttl {
            return Some(session.username.clone());
        }
        sessions.remove(token);
        None
    }

    /** \brief 清理全部过期令牌，返回移除数量。 */
    pub fn purge_expired(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| s.issued_at.elapsed() < self.ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
