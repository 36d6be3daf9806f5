//! 应用层实现。
//!
//! 围绕领域模型的实时通信用例：消息存储接口、在线状态、房间扇出、
//! 输入状态、连接网关、推送通知分发，以及 HTTP 与实时通道共用的
//! `ChatService`。存储、推送和鉴权都通过 trait 抽象，内存实现位于
//! 各模块的 `memory` 子模块中。

pub mod catch_up;
pub mod clock;
pub mod error;
pub mod gateway;
pub mod message_store;
pub mod notification;
pub mod presence;
pub mod push;
pub mod repository;
pub mod retry;
pub mod room;
pub mod services;
pub mod session;
pub mod typing;

pub use catch_up::list_messages;
pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use gateway::{ConnectionGateway, ConnectionHandle, GatewayDependencies};
pub use message_store::MessageStore;
pub use notification::{
    DeliveryError, DispatchJob, DispatchOutcome, DispatchStats, DispatcherDependencies,
    EnqueueOutcome, NotificationDispatcher,
};
pub use presence::PresenceTracker;
pub use push::{PushOutcome, PushProvider};
pub use repository::{DeviceTokenRepository, PreferenceRepository};
pub use retry::Backoff;
pub use room::{BroadcastReport, ConversationRooms};
pub use services::{
    ChatService, ChatServiceDependencies, CreateConversationRequest, RegisterDeviceTokenRequest,
    SendMessageRequest, UpdatePreferencesRequest,
};
pub use session::SessionVerifier;
pub use typing::TypingCoordinator;

#[cfg(any(test, feature = "testing"))]
pub use push::MockPushProvider;
#[cfg(any(test, feature = "testing"))]
pub use session::MockSessionVerifier;
