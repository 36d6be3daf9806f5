//! 基础设施层实现。
//!
//! 提供 PostgreSQL 仓储与 HTTP 推送网关适配器，实现应用层定义的接口。

pub mod builder;
pub mod message_store;
pub mod migrations;
pub mod push;
pub mod repository;

pub use builder::{Infrastructure, InfrastructureError};
pub use message_store::PgMessageStore;
pub use migrations::MIGRATOR;
pub use push::HttpPushProvider;
pub use repository::{
    create_pg_pool, PgDeviceTokenRepository, PgPreferenceRepository, PgStorage,
};
