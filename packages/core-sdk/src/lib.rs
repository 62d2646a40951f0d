pub mod admin;
pub mod config;
pub mod db;
pub mod decoder;
pub mod error;
pub mod gateway;
pub mod models;
pub mod pool;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod transcript;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::admin::{AdminCredentials, AdminSessions};
    pub use crate::config::{Config, GatewaySettings, RotationPolicy, UpstreamConfig};
    pub use crate::db::SqliteStore;
    pub use crate::error::{CredentialError, GatewayError, PoolError};
    pub use crate::gateway::StreamingGateway;
    pub use crate::models::{ChatCompletion, ChatRequest, Frame, Message, Role};
    pub use crate::pool::{CredentialStore, SessionPool};
    pub use crate::registry::{StreamRegistry, StreamSession};
    pub use crate::relay::EgressRelay;
    pub use crate::{server, telemetry, transcript};
}
