use std::{fs::OpenOptions, path::Path, sync::Mutex};

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{
    fmt::time::UtcTime, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/**
 * \brief 初始化全局日志。
 * \param level 默认过滤级别；RUST_LOG 存在时优先
 * \param log_file 额外追加写入的日志文件（无 ANSI 颜色）
 */
pub fn init(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!(
            "{level},notion_relay_core_sdk={level},notion_relay={level},tower_http=info"
        ))
    })?;

    let file_layer = match log_file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("create log directory {}", dir.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_timer(UtcTime::rfc_3339())
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(UtcTime::rfc_3339())
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!("logging already initialized: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_writes_file_once() {
        let path = std::env::temp_dir()
            .join(format!("notion-relay-log-{}", uuid::Uuid::new_v4()))
            .join("relay.log");
        init("debug", Some(&path)).expect("first init");
        tracing::info!("hello from test");
        assert!(path.exists());
        assert!(init("debug", None).is_err(), "second init is rejected");
        let _ = std::fs::remove_dir_all(path.parent().expect("dir"));
    }
}
