use std::sync::Arc;

use application::{ChatService, ConnectionGateway};
use config::RealtimeConfig;

use crate::JwtService;

#[derive(Clone)]
pub struct AppState {
    pub chat_service: Arc<ChatService>,
    pub gateway: Arc<ConnectionGateway>,
    pub jwt_service: Arc<JwtService>,
    /// 心跳间隔与未响应上限
    pub realtime: RealtimeConfig,
}

impl AppState {
    pub fn new(
        chat_service: Arc<ChatService>,
        gateway: Arc<ConnectionGateway>,
        jwt_service: Arc<JwtService>,
        realtime: RealtimeConfig,
    ) -> Self {
        Self {
            chat_service,
            gateway,
            jwt_service,
            realtime,
        }
    }
}
