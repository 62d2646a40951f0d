use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::models::{ChatRequest, CredentialEntry, Role};

/** \brief 该模型不携带 model 字段，保留后端的历史行为。 */
pub const LEGACY_MODEL: &str = "anthropic-sonnet-3.x-stable";

/** \brief 对外公布的模型列表。 */
pub const AVAILABLE_MODELS: &[&str] = &[
    "openai-gpt-4.1",
    "anthropic-opus-4",
    "anthropic-sonnet-4",
    LEGACY_MODEL,
    "google-gemini-2.5-pro",
    "google-gemini-2.5-flash",
];

static MODEL_MAPPING: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("google-gemini-2.5-pro", "vertex-gemini-2.5-pro"),
        ("google-gemini-2.5-flash", "vertex-gemini-2.5-flash"),
    ])
});

const SPACE_WORDS: &[&str] = &[
    "Project", "Workspace", "Team", "Studio", "Lab", "Hub", "Zone", "Space",
];

/**
 * \brief 映射到后端模型名。
 */
pub fn map_model(model: &str) -> String {
    MODEL_MAPPING
        .get(model)
        .map(|m| m.to_string())
        .unwrap_or_else(|| model.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextValue {
    pub user_id: String,
    pub space_id: String,
    pub surface: String,
    pub timezone: String,
    pub user_name: String,
    pub space_name: String,
    pub space_view_id: String,
    pub current_datetime: String,
}

/**
 * \brief 后端 transcript 条目。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum TranscriptItem {
    #[serde(rename = "config")]
    Config { value: ConfigValue },
    #[serde(rename = "context")]
    Context { value: ContextValue },
    #[serde(rename = "agent-integration")]
    AgentIntegration,
    #[serde(rename = "user", rename_all = "camelCase")]
    User {
        value: Vec<Vec<String>>,
        user_id: String,
        created_at: String,
    },
    #[serde(rename = "markdown-chat", rename_all = "camelCase")]
    MarkdownChat {
        value: String,
        trace_id: String,
        created_at: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugOverrides {
    pub cached_inferences: Map<String, Value>,
    pub annotation_inferences: Map<String, Value>,
    pub emit_inferences: bool,
}

impl Default for DebugOverrides {
    fn default() -> Self {
        DebugOverrides {
            cached_inferences: Map::new(),
            annotation_inferences: Map::new(),
            emit_inferences: false,
        }
    }
}

/**
 * \brief 发往后端的完整请求体。
 * \details thread_id 为空时字段整体省略，后端据此区分新旧会话。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptPayload {
    pub space_id: String,
    pub transcript: Vec<TranscriptItem>,
    pub create_thread: bool,
    pub trace_id: String,
    pub debug_overrides: DebugOverrides,
    pub generate_title: bool,
    pub save_all_thread_operations: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/**
 * \brief 默认追踪 ID 生成器。
 */
pub fn new_trace_id() -> String {
    Uuid::new_v4().to_string()
}

fn format_timestamp(now: OffsetDateTime) -> String {
    now.format(&Rfc3339).unwrap_or_default()
}

/**
 * \brief 将 OpenAI 格式请求翻译为 transcript 请求体。
 * \param request 已通过边界层校验的请求
 * \param credential 当前活跃凭据
 * \param now 当前时间
 * \param trace_ids 追踪 ID 生成器
 */
pub fn build(
    request: &ChatRequest,
    credential: &CredentialEntry,
    now: OffsetDateTime,
    mut trace_ids: impl FnMut() -> String,
) -> TranscriptPayload {
    let timestamp = format_timestamp(now);
    let mut rng = rand::thread_rng();
    let user_name = format!("User{}", rng.gen_range(100..1000));
    let space_name = format!(
        "{} {}",
        SPACE_WORDS[rng.gen_range(0..SPACE_WORDS.len())],
        rng.gen_range(1..100)
    );

    let model = if request.model == LEGACY_MODEL {
        None
    } else {
        Some(map_model(&request.model))
    };

    let mut transcript = vec![
        TranscriptItem::Config {
            value: ConfigValue { model },
        },
        TranscriptItem::Context {
            value: ContextValue {
                user_id: credential.identity.clone(),
                space_id: credential.tenant.clone(),
                surface: "home_module".to_string(),
                timezone: "America/Los_Angeles".to_string(),
                user_name,
                space_name,
                space_view_id: Uuid::new_v4().to_string(),
                current_datetime: timestamp.clone(),
            },
        },
        TranscriptItem::AgentIntegration,
    ];

    for message in &request.messages {
        let content = message.content.to_text();
        let created_at = message
            .created_at
            .clone()
            .unwrap_or_else(|| timestamp.clone());
        match message.role {
            Role::System | Role::User => transcript.push(TranscriptItem::User {
                value: vec![vec![content]],
                user_id: credential.identity.clone(),
                created_at,
            }),
            Role::Assistant => transcript.push(TranscriptItem::MarkdownChat {
                value: content,
                trace_id: message.trace_id.clone().unwrap_or_else(&mut trace_ids),
                created_at,
            }),
        }
    }

    TranscriptPayload {
        space_id: credential.tenant.clone(),
        transcript,
        create_thread: false,
        trace_id: trace_ids(),
        debug_overrides: DebugOverrides::default(),
        generate_title: false,
        save_all_thread_operations: false,
        thread_id: credential.conversation_context.clone(),
    }
}
