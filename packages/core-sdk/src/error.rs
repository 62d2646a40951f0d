use std::time::Duration;

use thiserror::Error;

/**
 * \brief 原始凭据字符串解析失败的原因。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialError {
    #[error("credential is empty")]
    Empty,
    #[error("credential has no token_v2 session cookie")]
    MissingToken,
    #[error("credential has no notion_user_id cookie")]
    MissingUser,
    #[error("credential has no notion_space_id cookie")]
    MissingSpace,
}

/**
 * \brief Session Pool 操作错误。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /** \brief 启动时没有任何可用凭据，属于致命配置错误。 */
    #[error("no valid credentials configured ({rejected} rejected)")]
    NoCredentials { rejected: usize },
    #[error("invalid credential: {0}")]
    Invalid(#[from] CredentialError),
    #[error("credential {0} not found")]
    NotFound(String),
}

/**
 * \brief 网关终止原因；每一种都会被翻译成唯一的终止块。
 */
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("all sessions are invalid")]
    AllSessionsInvalid,
    #[error("no response from upstream within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("upstream transport failed: {0}")]
    UpstreamTransport(String),
    #[error("upstream returned status {0}")]
    UpstreamStatus(u16),
    #[error("upstream rejected every credential tried")]
    UpstreamAuthExhausted,
    #[error("credential cannot be sent as a header: {0}")]
    InvalidHeader(String),
}

impl GatewayError {
    /**
     * \brief 映射到 OpenAI 兼容的 finish_reason。
     */
    pub fn finish_reason(&self) -> crate::models::FinishReason {
        match self {
            GatewayError::UpstreamTimeout(_) => crate::models::FinishReason::Timeout,
            _ => crate::models::FinishReason::Error,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::UpstreamTransport(err.to_string())
    }
}
