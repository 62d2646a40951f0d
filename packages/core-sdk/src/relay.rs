use std::collections::BTreeMap;

use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use serde::Serialize;

use crate::transcript::TranscriptPayload;

/**
 * \brief 出站中继配置：直连、经 HTTP(S) 代理、或交给本地转发服务。
 * \details 仅影响请求如何发出，与翻译和凭据池无关。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EgressRelay {
    #[default]
    Direct,
    Proxy {
        url: String,
    },
    Forwarder {
        /** \brief 转发服务地址，如 http://127.0.0.1:10655/proxy */
        endpoint: String,
        /** \brief 交由转发服务使用的上游代理 */
        proxy: Option<String>,
    },
}

/** \brief 转发服务接收的请求信封。 */
#[derive(Debug, Serialize)]
struct ForwardEnvelope<'a> {
    method: &'static str,
    url: &'a str,
    headers: BTreeMap<String, String>,
    body: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<&'a str>,
}

impl EgressRelay {
    /**
     * \brief 由代理 URL 与转发端点组合出中继配置；转发端点优先。
     */
    pub fn from_options(proxy_url: Option<String>, forward_endpoint: Option<String>) -> Self {
        let proxy_url = proxy_url.filter(|s| !s.trim().is_empty());
        match forward_endpoint.filter(|s| !s.trim().is_empty()) {
            Some(endpoint) => EgressRelay::Forwarder {
                endpoint,
                proxy: proxy_url,
            },
            None => match proxy_url {
                Some(url) => EgressRelay::Proxy { url },
                None => EgressRelay::Direct,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EgressRelay::Direct => "direct".to_string(),
            EgressRelay::Proxy { url } => format!("proxy {}", url),
            EgressRelay::Forwarder { endpoint, .. } => format!("forwarder {}", endpoint),
        }
    }

    /**
     * \brief 构建 HTTP 客户端；代理模式下挂载全局代理。
     */
    pub fn build_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder();
        if let EgressRelay::Proxy { url } = self {
            let proxy = reqwest::Proxy::all(url).with_context(|| format!("invalid proxy url {}", url))?;
            builder = builder.proxy(proxy);
        }
        builder.build().context("build http client failed")
    }

    /**
     * \brief 构建一次出站 POST。
     */
    pub fn request(
        &self,
        client: &reqwest::Client,
        api_url: &str,
        headers: HeaderMap,
        payload: &TranscriptPayload,
    ) -> Result<reqwest::RequestBuilder> {
        match self {
            EgressRelay::Direct | EgressRelay::Proxy { .. } => {
                Ok(client.post(api_url).headers(headers).json(payload))
            }
            EgressRelay::Forwarder { endpoint, proxy } => {
                let envelope = ForwardEnvelope {
                    method: "POST",
                    url: api_url,
                    headers: headers
                        .iter()
                        .filter_map(|(k, v)| {
                            v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string()))
                        })
                        .collect(),
                    body: serde_json::to_string(payload)?,
                    stream: true,
                    proxy: proxy.as_deref(),
                };
                Ok(client.post(endpoint.as_str()).json(&envelope))
            }
        }
    }
}
