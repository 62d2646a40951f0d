use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;

use notion_relay_core_sdk::error::PoolError;
use notion_relay_core_sdk::models::FinishReason;
use notion_relay_core_sdk::pool::CREDENTIAL_DELIMITER;
use notion_relay_core_sdk::prelude::*;

/**
 * \brief CLI 程序入口：服务、凭据导入、状态查看与单次对话。
 */
#[derive(Parser, Debug)]
#[command(name = "notion-relay", version, about = "OpenAI-compatible relay for Notion AI")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// `|`-separated cookie headers
    #[arg(long, env = "NOTION_COOKIE", hide_env_values = true, global = true)]
    cookies: Option<String>,
    /// File with one cookie header per line
    #[arg(long, env = "COOKIE_FILE", global = true)]
    cookie_file: Option<PathBuf>,
    #[arg(long, env = "NOTION_RELAY_DB", default_value = "notion-relay.db", global = true)]
    db: PathBuf,
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,
    #[arg(long, env = "LOG_FILE", global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GatewayArgs {
    /// Seconds to wait for the first upstream byte
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    timeout: u64,
    #[arg(long, env = "PROXY_URL")]
    proxy_url: Option<String>,
    /// Local forwarding service, e.g. http://127.0.0.1:10655/proxy
    #[arg(long, env = "RELAY_ENDPOINT")]
    relay_endpoint: Option<String>,
    /// on-success | failure-only
    #[arg(long, env = "ROTATION_POLICY", default_value = "on-success")]
    rotation: String,
    #[arg(long, env = "NOTION_API_URL", default_value = notion_relay_core_sdk::config::DEFAULT_API_URL)]
    api_url: String,
    #[arg(long, env = "NOTION_CLIENT_VERSION", default_value = notion_relay_core_sdk::config::DEFAULT_CLIENT_VERSION)]
    client_version: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动 OpenAI 兼容 HTTP 服务。
     */
    Serve {
        /// Full listen address; overrides --port
        #[arg(long, env = "LISTEN_ADDR")]
        addr: Option<String>,
        #[arg(long, env = "PORT", default_value_t = 7860)]
        port: u16,
        #[arg(long, env = "PROXY_AUTH_TOKEN", default_value = "default_token", hide_env_values = true)]
        auth_token: String,
        #[arg(long, env = "ADMIN_USERNAME", default_value = "admin")]
        admin_username: String,
        /// Defaults to the auth token
        #[arg(long, env = "ADMIN_PASSWORD", hide_env_values = true)]
        admin_password: Option<String>,
        #[command(flatten)]
        gateway: GatewayArgs,
    },

    /**
     * \brief 将凭据写入本地存储。
     */
    Import {
        #[arg(long)]
        thread_id: Option<String>,
    },

    /**
     * \brief 打印脱敏后的凭据状态。
     */
    Status,

    /**
     * \brief 通过网关发送一条消息并流式打印回复。
     */
    Chat {
        #[arg(long)]
        prompt: String,
        #[arg(long, default_value = "anthropic-sonnet-4")]
        model: String,
        #[command(flatten)]
        gateway: GatewayArgs,
    },
}

impl GatewayArgs {
    fn settings(&self) -> Result<GatewaySettings> {
        Ok(GatewaySettings {
            upstream: UpstreamConfig {
                api_url: self.api_url.clone(),
                client_version: self.client_version.clone(),
                ..UpstreamConfig::default()
            },
            request_timeout: Duration::from_secs(self.timeout),
            relay: EgressRelay::from_options(self.proxy_url.clone(), self.relay_endpoint.clone()),
            rotation: self.rotation.parse()?,
        })
    }
}

fn build_config(common: &CommonArgs, gateway: &GatewayArgs) -> Result<Config> {
    let config = Config {
        cookie_blob: common.cookies.clone(),
        cookie_file: common.cookie_file.clone(),
        db_path: common.db.clone(),
        gateway: gateway.settings()?,
        ..Config::default()
    };
    Ok(config)
}

fn ensure_valid(config: &Config) -> Result<()> {
    let errors = config.validate();
    if !errors.is_empty() {
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }
    Ok(())
}

/**
 * \brief 以本地存储中的凭据构建池；存储为空时得到空池，且不回写存储。
 */
fn stored_pool(db: &Path) -> Result<SessionPool> {
    let store = Arc::new(SqliteStore::open(db).context("open credential store failed")?);
    let pool = SessionPool::new(Some(store));
    match pool.initialize("") {
        Ok(_) | Err(PoolError::NoCredentials { .. }) => Ok(pool),
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(&cli.common.log_level, cli.common.log_file.as_deref())
        .context("init logging failed")?;

    match cli.command {
        Commands::Serve {
            addr,
            port,
            auth_token,
            admin_username,
            admin_password,
            gateway,
        } => {
            let mut config = build_config(&cli.common, &gateway)?;
            config.listen_addr = addr.unwrap_or_else(|| format!("0.0.0.0:{}", port));
            config.auth_token = auth_token;
            config.admin_username = admin_username;
            config.admin_password = admin_password;
            ensure_valid(&config)?;
            server::run(config).await?;
        }
        Commands::Import { thread_id } => {
            let raw = cli
                .common
                .cookies
                .clone()
                .context("nothing to import, pass --cookies or set NOTION_COOKIE")?;
            let pool = stored_pool(&cli.common.db)?;
            let mut imported = 0;
            let cookies = raw
                .split(CREDENTIAL_DELIMITER)
                .map(str::trim)
                .filter(|c| !c.is_empty());
            for cookie in cookies {
                match pool.add_credential(cookie, thread_id.clone()) {
                    Ok(outcome) => {
                        imported += 1;
                        tracing::debug!(?outcome, "imported credential");
                    }
                    Err(err) => eprintln!("skipped credential: {}", err),
                }
            }
            pool.flush();
            println!(
                "Imported {} credential(s); {} stored in {}",
                imported,
                pool.len(),
                cli.common.db.display()
            );
        }
        Commands::Status => {
            let pool = stored_pool(&cli.common.db)?;
            let snapshot = serde_json::json!({
                "total_cookies": pool.valid_count(),
                "cookies": pool.status(),
            });
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Chat {
            prompt,
            model,
            gateway,
        } => {
            let config = build_config(&cli.common, &gateway)?;
            let state = server::AppState::from_config(&config)?;
            let credential = state
                .pool
                .active()
                .context("no valid credential available")?;
            let request = ChatRequest {
                model,
                messages: vec![Message::new(Role::User, prompt)],
                stream: true,
            };
            let payload = transcript::build(
                &request,
                &credential,
                time::OffsetDateTime::now_utc(),
                transcript::new_trace_id,
            );
            let mut frames = state
                .gateway
                .execute(payload, credential, "cli", &request.model)
                .into_stream();

            let mut stdout = std::io::stdout();
            while let Some(frame) = frames.next().await {
                let Frame::Chunk(chunk) = frame else {
                    break;
                };
                match chunk.finish_reason() {
                    None => {
                        if let Some(text) = chunk.content() {
                            print!("{}", text);
                            stdout.flush().ok();
                        }
                    }
                    Some(FinishReason::Stop) => {}
                    Some(reason) => {
                        eprintln!(
                            "\n[{:?}] {}",
                            reason,
                            chunk.content().unwrap_or_default()
                        );
                    }
                }
            }
            println!();
        }
    }

    Ok(())
}
