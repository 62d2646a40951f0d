use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::admin::AdminCredentials;
use crate::relay::EgressRelay;

pub const DEFAULT_API_URL: &str = "https://www.notion.so/api/v3/runInferenceTranscript";
pub const DEFAULT_CLIENT_VERSION: &str = "23.13.0.3686";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/**
 * \brief 后端接口与会话头配置。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub api_url: String,
    pub client_version: String,
    pub origin: String,
    pub referer: String,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            api_url: DEFAULT_API_URL.to_string(),
            client_version: DEFAULT_CLIENT_VERSION.to_string(),
            origin: "https://www.notion.so".to_string(),
            referer: "https://www.notion.so/chat".to_string(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

/**
 * \brief 成功完成后是否轮换凭据。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationPolicy {
    #[default]
    OnSuccess,
    FailureOnly,
}

impl FromStr for RotationPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "on-success" | "on_success" | "success" => Ok(RotationPolicy::OnSuccess),
            "failure-only" | "failure_only" | "failure" => Ok(RotationPolicy::FailureOnly),
            other => Err(anyhow!("unknown rotation policy: {}", other)),
        }
    }
}

/**
 * \brief 网关运行参数。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySettings {
    pub upstream: UpstreamConfig,
    /** \brief 从发出请求到收到首字节的最长等待 */
    pub request_timeout: Duration,
    pub relay: EgressRelay,
    pub rotation: RotationPolicy,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            upstream: UpstreamConfig::default(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            relay: EgressRelay::Direct,
            rotation: RotationPolicy::OnSuccess,
        }
    }
}

/**
 * \brief 服务整体配置，由 CLI 从参数与环境变量填充。
 */
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub auth_token: String,
    /** \brief NOTION_COOKIE：以 `|` 分隔的 cookie */
    pub cookie_blob: Option<String>,
    /** \brief COOKIE_FILE：每行一个 cookie 的文件 */
    pub cookie_file: Option<PathBuf>,
    pub db_path: PathBuf,
    pub gateway: GatewaySettings,
    /** \brief ADMIN_USERNAME */
    pub admin_username: String,
    /** \brief ADMIN_PASSWORD；未设置时使用 auth_token */
    pub admin_password: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:7860".to_string(),
            auth_token: "default_token".to_string(),
            cookie_blob: None,
            cookie_file: None,
            db_path: PathBuf::from("notion-relay.db"),
            gateway: GatewaySettings::default(),
            admin_username: "admin".to_string(),
            admin_password: None,
        }
    }
}

impl Config {
    /**
     * \brief 校验配置，返回全部错误描述。
     */
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.cookie_blob.as_deref().map(str::trim).unwrap_or("").is_empty()
            && self.cookie_file.is_none()
        {
            errors.push("NOTION_COOKIE or COOKIE_FILE must be set".to_string());
        }
        if self.auth_token.trim().is_empty() {
            errors.push("PROXY_AUTH_TOKEN must not be empty".to_string());
        }
        if self.gateway.request_timeout.is_zero() {
            errors.push("request timeout must be greater than zero".to_string());
        }
        if reqwest::Url::parse(&self.gateway.upstream.api_url).is_err() {
            errors.push(format!("invalid api url: {}", self.gateway.upstream.api_url));
        }
        match &self.gateway.relay {
            EgressRelay::Direct => {}
            EgressRelay::Proxy { url } => {
                if reqwest::Url::parse(url).is_err() {
                    errors.push(format!("invalid PROXY_URL: {}", url));
                }
            }
            EgressRelay::Forwarder { endpoint, proxy } => {
                if reqwest::Url::parse(endpoint).is_err() {
                    errors.push(format!("invalid RELAY_ENDPOINT: {}", endpoint));
                }
                if let Some(url) = proxy {
                    if reqwest::Url::parse(url).is_err() {
                        errors.push(format!("invalid PROXY_URL: {}", url));
                    }
                }
            }
        }
        errors
    }

    pub fn admin_credentials(&self) -> AdminCredentials {
        AdminCredentials {
            username: self.admin_username.clone(),
            password: self
                .admin_password
                .clone()
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| self.auth_token.clone()),
        }
    }

    /**
     * \brief 读取原始凭据：优先 COOKIE_FILE，读取失败或为空时回退到 NOTION_COOKIE。
     */
    pub fn load_cookie_blob(&self) -> Result<String> {
        if let Some(path) = &self.cookie_file {
            match std::fs::read_to_string(path) {
                Ok(text) if !text.trim().is_empty() => {
                    tracing::info!(path = %path.display(), "loading credentials from file");
                    return Ok(text);
                }
                Ok(_) => tracing::warn!(path = %path.display(), "credential file is empty"),
                Err(err) => {
                    tracing::error!(path = %path.display(), error = %err, "failed to read credential file")
                }
            }
        }
        self.cookie_blob
            .clone()
            .filter(|s| !s.trim().is_empty())
            .context("no credentials: set NOTION_COOKIE or COOKIE_FILE")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admin_password_falls_back_to_auth_token() {
        let mut config = Config {
            auth_token: "tok".into(),
            ..Config::default()
        };
        assert_eq!(
            config.admin_credentials(),
            AdminCredentials {
                username: "admin".into(),
                password: "tok".into()
            }
        );
        config.admin_password = Some("pw".into());
        assert_eq!(config.admin_credentials().password, "pw");
    }

    #[test]
    fn test_default_config_needs_credentials() {
        let config = Config::default();
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("NOTION_COOKIE"));
    }

    #[test]
    fn test_validate_relay_urls() {
        let config = Config {
            cookie_blob: Some("x".into()),
            gateway: GatewaySettings {
                relay: EgressRelay::Forwarder {
                    endpoint: "nope".into(),
                    proxy: Some("also nope".into()),
                },
                request_timeout: Duration::ZERO,
                ..GatewaySettings::default()
            },
            ..Config::default()
        };
        assert_eq!(config.validate().len(), 3);
    }

    #[test]
    fn test_rotation_policy_parse() {
        assert_eq!("on-success".parse::<RotationPolicy>().unwrap(), RotationPolicy::OnSuccess);
        assert_eq!("FAILURE-ONLY".parse::<RotationPolicy>().unwrap(), RotationPolicy::FailureOnly);
        assert!("sometimes".parse::<RotationPolicy>().is_err());
    }

    #[test]
    fn test_cookie_file_falls_back_to_env_blob() {
        let config = Config {
            cookie_blob: Some("from-env".into()),
            cookie_file: Some(PathBuf::from("/definitely/missing/cookies.txt")),
            ..Config::default()
        };
        assert_eq!(config.load_cookie_blob().unwrap(), "from-env");
        assert!(Config::default().load_cookie_blob().is_err());
    }
}
