use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::CredentialError;

/**
 * \brief 会话凭据条目：一个可轮换的 Notion 身份。
 */
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialEntry {
    /** \brief 用户 ID（notion_user_id），池内唯一 */
    pub identity: String,
    /** \brief 工作区 ID（notion_space_id） */
    pub tenant: String,
    /** \brief 原始 cookie 头；只允许以预览形式离开 Session Pool */
    pub secret: String,
    /** \brief 持久化的会话线程 ID */
    pub conversation_context: Option<String>,
    pub enabled: bool,
    pub valid: bool,
    pub last_used_at: Option<OffsetDateTime>,
}

impl CredentialEntry {
    /**
     * \brief 从原始 cookie 字符串解析凭据。
     * \details 需要同时包含 token_v2、notion_user_id、notion_space_id 三个键。
     */
    pub fn parse(raw: &str) -> Result<Self, CredentialError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(CredentialError::Empty);
        }

        let mut token = None;
        let mut user = None;
        let mut space = None;
        for pair in raw.split(';') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim() {
                "token_v2" => token = Some(value),
                "notion_user_id" => user = Some(value),
                "notion_space_id" => space = Some(value),
                _ => {}
            }
        }

        token.ok_or(CredentialError::MissingToken)?;
        let identity = user.ok_or(CredentialError::MissingUser)?;
        let tenant = space.ok_or(CredentialError::MissingSpace)?;

        Ok(CredentialEntry {
            identity: identity.to_string(),
            tenant: tenant.to_string(),
            secret: raw.to_string(),
            conversation_context: None,
            enabled: true,
            valid: true,
            last_used_at: None,
        })
    }

    /** \brief 是否可参与轮换。 */
    pub fn is_eligible(&self) -> bool {
        self.enabled && self.valid
    }

    /**
     * \brief 不可逆的短预览：前 8 个字符加 CRC32 摘要。
     */
    pub fn secret_preview(&self) -> String {
        let head: String = self.secret.chars().take(8).collect();
        format!("{}…{:08x}", head, crc32fast::hash(self.secret.as_bytes()))
    }
}

impl fmt::Debug for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialEntry")
            .field("identity", &self.identity)
            .field("tenant", &self.tenant)
            .field("secret", &self.secret_preview())
            .field("conversation_context", &self.conversation_context)
            .field("enabled", &self.enabled)
            .field("valid", &self.valid)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

/**
 * \brief 对外暴露的凭据快照（密钥已脱敏）。
 */
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub user_id: String,
    pub space_id: String,
    pub cookie_preview: String,
    pub thread_id: Option<String>,
    pub enabled: bool,
    pub valid: bool,
    pub last_used: Option<String>,
    pub active: bool,
}

/**
 * \brief 聊天消息角色。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/**
 * \brief 带类型的内容片段；仅 `text` 类型参与翻译。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/**
 * \brief 消息内容：纯文本或片段数组。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /**
     * \brief 折叠为纯文本，静默丢弃图片等非文本片段。
     */
    pub fn to_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.kind == "text")
                .filter_map(|p| p.text.as_deref())
                .collect(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
    /** \brief 调用方提供的创建时间（可选） */
    #[serde(default, alias = "createdAt", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /** \brief 调用方提供的追踪 ID（仅助手消息使用） */
    #[serde(default, alias = "traceId", skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Message {
            role,
            content: content.into(),
            created_at: None,
            trace_id: None,
        }
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

/**
 * \brief 入站聊天请求。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Error,
    Timeout,
    NoContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<FinishReason>,
}

/**
 * \brief 流式输出块（chat.completion.chunk）。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl OutputChunk {
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.delta.content.as_deref())
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }
}

/**
 * \brief 写入输出流的帧：输出块或终止标记。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Chunk(OutputChunk),
    Done,
}

impl Frame {
    /**
     * \brief SSE `data:` 字段内容。
     */
    pub fn data(&self) -> String {
        match self {
            Frame::Chunk(chunk) => serde_json::to_string(chunk).unwrap_or_default(),
            Frame::Done => "[DONE]".to_string(),
        }
    }

    /**
     * \brief 完整线格式：`data: <payload>\n\n`。
     */
    pub fn encode(&self) -> String {
        format!("data: {}\n\n", self.data())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/**
 * \brief 非流式响应：聚合全部增量后的完整回复。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

impl ChatCompletion {
    /**
     * \brief 聚合帧序列。
     * \details 诊断/错误块的文本同样计入内容；第一个非 stop 的结束原因胜出。
     */
    pub fn aggregate<'a>(
        id: String,
        created: i64,
        model: &str,
        frames: impl IntoIterator<Item = &'a Frame>,
    ) -> Self {
        let mut content = String::new();
        let mut finish_reason = FinishReason::Stop;
        let mut terminal_seen = false;
        for frame in frames {
            let Frame::Chunk(chunk) = frame else {
                continue;
            };
            if let Some(text) = chunk.content() {
                content.push_str(text);
            }
            match chunk.finish_reason() {
                Some(FinishReason::Stop) | None => {}
                Some(reason) if !terminal_seen => {
                    finish_reason = reason;
                    terminal_seen = true;
                }
                Some(_) => {}
            }
        }
        ChatCompletion {
            id,
            object: "chat.completion".to_string(),
            created,
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason,
            }],
            usage: Usage::default(),
        }
    }
}
