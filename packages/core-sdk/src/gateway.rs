use std::sync::Arc;

use anyhow::Result;
use async_stream::try_stream;
use futures_util::{Stream, StreamExt};
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, COOKIE, ORIGIN,
    REFERER, USER_AGENT,
};
use reqwest::StatusCode;
use time::OffsetDateTime;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use crate::config::{GatewaySettings, RotationPolicy, UpstreamConfig};
use crate::decoder::{content_of, NdjsonDecoder};
use crate::error::GatewayError;
use crate::models::{ChunkChoice, ChunkDelta, CredentialEntry, FinishReason, Frame, OutputChunk};
use crate::pool::SessionPool;
use crate::registry::{session_channel, StreamRegistry, StreamSession, StreamWriter};
use crate::transcript::TranscriptPayload;

/** \brief 首次请求加一次换凭据重试。 */
const MAX_ATTEMPTS: usize = 2;
const NO_CONTENT_MESSAGE: &str = "The upstream service returned no content for this request.";

/**
 * \brief 构造一次请求的全部输出块，共享同一 id / created / model。
 */
#[derive(Debug, Clone)]
pub struct ChunkFactory {
    id: String,
    created: i64,
    model: String,
}

impl ChunkFactory {
    pub fn new(model: &str) -> Self {
        ChunkFactory {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            created: OffsetDateTime::now_utc().unix_timestamp(),
            model: model.to_string(),
        }
    }

    pub fn chunk(&self, content: Option<String>, finish_reason: Option<FinishReason>) -> Frame {
        Frame::Chunk(OutputChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta { content },
                finish_reason,
            }],
        })
    }
}

/**
 * \brief 由凭据生成出站请求头。
 */
pub fn credential_headers(
    entry: &CredentialEntry,
    upstream: &UpstreamConfig,
) -> Result<HeaderMap, GatewayError> {
    fn value(raw: &str) -> Result<HeaderValue, GatewayError> {
        HeaderValue::from_str(raw).map_err(|err| GatewayError::InvalidHeader(err.to_string()))
    }

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/x-ndjson"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(
        HeaderName::from_static("notion-audit-log-platform"),
        HeaderValue::from_static("web"),
    );
    headers.insert(
        HeaderName::from_static("notion-client-version"),
        value(&upstream.client_version)?,
    );
    headers.insert(ORIGIN, value(&upstream.origin)?);
    headers.insert(REFERER, value(&upstream.referer)?);
    headers.insert(USER_AGENT, value(&upstream.user_agent)?);
    headers.insert(
        HeaderName::from_static("x-notion-active-user-header"),
        value(&entry.identity)?,
    );
    headers.insert(
        HeaderName::from_static("x-notion-space-id"),
        value(&entry.tenant)?,
    );
    headers.insert(COOKIE, value(&entry.secret)?);
    Ok(headers)
}

/** \brief 一次请求的结局，决定终止序列。 */
#[derive(Debug)]
enum Outcome {
    Completed { emitted: usize },
    Failed(GatewayError),
    Abandoned,
}

/**
 * \brief 流式网关：派发、超时、401 换凭据、增量解析与终止。
 */
#[derive(Clone)]
pub struct StreamingGateway {
    pool: Arc<SessionPool>,
    registry: StreamRegistry,
    client: reqwest::Client,
    settings: Arc<GatewaySettings>,
}

impl StreamingGateway {
    pub fn new(
        pool: Arc<SessionPool>,
        registry: StreamRegistry,
        settings: GatewaySettings,
    ) -> Result<Self> {
        let client = settings.relay.build_client()?;
        tracing::info!(
            api_url = %settings.upstream.api_url,
            relay = %settings.relay.describe(),
            timeout_ms = settings.request_timeout.as_millis() as u64,
            "streaming gateway ready"
        );
        Ok(StreamingGateway {
            pool,
            registry,
            client,
            settings: Arc::new(settings),
        })
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn registry(&self) -> &StreamRegistry {
        &self.registry
    }

    /**
     * \brief 立即返回已注册的输出流，翻译在后台任务中写入。
     * \param payload 由 credential 构建的请求体
     * \param credential 首次派发使用的凭据
     * \param client_id 逻辑客户端；同一客户端的旧流会被关闭
     * \param model 写入输出块的模型名
     */
    pub fn execute(
        &self,
        payload: TranscriptPayload,
        credential: CredentialEntry,
        client_id: &str,
        model: &str,
    ) -> StreamSession {
        let (writer, session) = session_channel(client_id);
        self.registry.register(&session);
        let chunks = ChunkFactory::new(model);
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.run(payload, credential, writer, chunks).await;
        });
        session
    }

    async fn run(
        self,
        payload: TranscriptPayload,
        credential: CredentialEntry,
        writer: StreamWriter,
        chunks: ChunkFactory,
    ) {
        let outcome = tokio::select! {
            _ = writer.abandoned() => Outcome::Abandoned,
            outcome = self.drive(&payload, credential, &writer, &chunks) => outcome,
        };
        let control = writer.control();
        tracing::debug!(
            client_id = control.client_id(),
            session = control.id(),
            outcome = ?outcome,
            "stream finished"
        );
        self.terminate(outcome, &writer, &chunks);
        self.registry.release(control.client_id(), control.id());
    }

    /**
     * \brief 派发并转发内容，返回结局；不写终止块。
     */
    async fn drive(
        &self,
        payload: &TranscriptPayload,
        credential: CredentialEntry,
        writer: &StreamWriter,
        chunks: &ChunkFactory,
    ) -> Outcome {
        let timeout = self.settings.request_timeout;
        let deadline = Instant::now() + timeout;

        let response = match timeout_at(deadline, self.dispatch(payload, credential)).await {
            Err(_) => return Outcome::Failed(GatewayError::UpstreamTimeout(timeout)),
            Ok(Err(err)) => return Outcome::Failed(err),
            Ok(Ok(response)) => response,
        };

        let mut body = response.bytes_stream();
        let first = match timeout_at(deadline, body.next()).await {
            Err(_) => return Outcome::Failed(GatewayError::UpstreamTimeout(timeout)),
            Ok(Some(Err(err))) => return Outcome::Failed(err.into()),
            Ok(Some(Ok(bytes))) => bytes.to_vec(),
            Ok(None) => Vec::new(),
        };

        let contents = content_stream(first, body);
        futures_util::pin_mut!(contents);
        let mut emitted = 0;
        while let Some(item) = contents.next().await {
            match item {
                Ok(text) => {
                    if !writer.send(chunks.chunk(Some(text), None)) {
                        return Outcome::Abandoned;
                    }
                    emitted += 1;
                }
                Err(err) => return Outcome::Failed(err),
            }
        }
        Outcome::Completed { emitted }
    }

    /**
     * \brief 有界重试的派发循环：401 时标记失效并换下一个凭据，最多两次。
     * \details 重试沿用原请求体中的 spaceId / threadId，只有请求头随新凭据变化。
     */
    async fn dispatch(
        &self,
        payload: &TranscriptPayload,
        mut credential: CredentialEntry,
    ) -> Result<reqwest::Response, GatewayError> {
        let upstream = &self.settings.upstream;
        for attempt in 1..=MAX_ATTEMPTS {
            let headers = credential_headers(&credential, upstream)?;
            let request = self
                .settings
                .relay
                .request(&self.client, &upstream.api_url, headers, payload)
                .map_err(|err| GatewayError::UpstreamTransport(err.to_string()))?;
            tracing::info!(attempt, identity = %credential.identity, "dispatching upstream request");
            let response = request.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED {
                tracing::warn!(attempt, identity = %credential.identity, "upstream rejected credential");
                if let Err(err) = self.pool.mark_invalid(&credential.identity) {
                    tracing::warn!(error = %err, "could not mark credential invalid");
                }
                if attempt == MAX_ATTEMPTS {
                    break;
                }
                credential = self.pool.get_next().ok_or(GatewayError::AllSessionsInvalid)?;
                continue;
            }
            if !status.is_success() {
                tracing::error!(status = status.as_u16(), "upstream returned failure status");
                return Err(GatewayError::UpstreamStatus(status.as_u16()));
            }
            return Ok(response);
        }
        Err(GatewayError::UpstreamAuthExhausted)
    }

    /**
     * \brief 写出唯一的终止序列。
     */
    fn terminate(&self, outcome: Outcome, writer: &StreamWriter, chunks: &ChunkFactory) {
        match outcome {
            Outcome::Abandoned => {}
            Outcome::Completed { emitted } => {
                if emitted == 0 {
                    tracing::warn!("upstream stream ended without content");
                    writer.send(chunks.chunk(
                        Some(NO_CONTENT_MESSAGE.to_string()),
                        Some(FinishReason::NoContent),
                    ));
                } else if self.settings.rotation == RotationPolicy::OnSuccess {
                    self.pool.get_next();
                }
                writer.send(chunks.chunk(None, Some(FinishReason::Stop)));
                writer.send(Frame::Done);
            }
            Outcome::Failed(err) => {
                tracing::error!(error = %err, "request failed");
                writer.send(chunks.chunk(Some(format!("Error: {}", err)), Some(err.finish_reason())));
                writer.send(Frame::Done);
            }
        }
    }
}

/**
 * \brief 将响应字节流解码为内容文本流。
 */
fn content_stream<S, B>(first: Vec<u8>, body: S) -> impl Stream<Item = Result<String, GatewayError>>
where
    S: Stream<Item = reqwest::Result<B>>,
    B: AsRef<[u8]>,
{
    try_stream! {
        futures_util::pin_mut!(body);
        let mut decoder = NdjsonDecoder::new();
        for value in decoder.consume(&first) {
            if let Some(text) = content_of(&value) {
                yield text.to_string();
            }
        }
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for value in decoder.consume(chunk.as_ref()) {
                if let Some(text) = content_of(&value) {
                    yield text.to_string();
                }
            }
        }
        for value in decoder.finish() {
            if let Some(text) = content_of(&value) {
                yield text.to_string();
            }
        }
    }
}
