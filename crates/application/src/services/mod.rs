mod chat_service;

pub use chat_service::{
    ChatService, ChatServiceDependencies, CreateConversationRequest, RegisterDeviceTokenRequest,
    SendMessageRequest, UpdatePreferencesRequest, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};
